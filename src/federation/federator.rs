//! Federated search across every configured discovery source.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};

use super::errors::DiscoveryError;
use super::merge::{merge_observations, rank};
use super::sources::{source_from_config, DiscoverySource};
use super::types::{DegradedSource, RegistryEntry, SearchOutcome, SourceObservation, SourceStatus};
use crate::config::{millis, FederationConfig};

/// Fans a query out to all sources and merges what comes back.
///
/// A source that fails or runs out of time is reported as degraded; it never
/// fails the search.
#[derive(Clone)]
pub struct RegistryFederator {
    sources: Vec<Arc<dyn DiscoverySource>>,
    source_timeout: Duration,
    deadline: Duration,
}

impl RegistryFederator {
    pub fn new(source_timeout: Duration, deadline: Duration) -> Self {
        Self {
            sources: Vec::new(),
            source_timeout,
            deadline,
        }
    }

    /// Build from configuration. Sources that cannot be constructed are
    /// logged and left out.
    pub fn from_config(config: &FederationConfig) -> Self {
        let mut federator = Self::new(config.source_timeout(), config.deadline());
        for source in &config.sources {
            match source_from_config(source) {
                Ok(source) => federator.sources.push(Arc::from(source)),
                Err(e) => tracing::warn!(error = %e, "skipping discovery source"),
            }
        }
        federator
    }

    /// Append a source. Sources earlier in the list win merge conflicts.
    pub fn with_source(mut self, source: impl DiscoverySource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    // ─── Search ─────────────────────────────────────────────────────────────

    pub async fn search(&self, query: &str) -> SearchOutcome {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.deadline;
        let mut results: Vec<Option<Result<Vec<RegistryEntry>, DiscoveryError>>> =
            (0..self.sources.len()).map(|_| None).collect();

        let mut pending: FuturesUnordered<_> = self
            .sources
            .iter()
            .enumerate()
            .map(|(index, source)| async move {
                (index, self.query_source(source.as_ref(), query).await)
            })
            .collect();

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((index, result))) => results[index] = Some(result),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        outstanding = pending.len(),
                        deadline_ms = millis(self.deadline),
                        "search deadline reached"
                    );
                    break;
                }
            }
        }
        drop(pending);

        // Fold in configuration order so earlier sources win conflicts
        let mut observations = Vec::new();
        let mut degraded = Vec::new();
        for (source, result) in self.sources.iter().zip(results) {
            let result = result.unwrap_or_else(|| {
                Err(DiscoveryError::Timeout {
                    source_name: source.name().to_string(),
                    timeout_ms: millis(self.deadline),
                })
            });
            match result {
                Ok(entries) => {
                    observations.extend(entries.into_iter().map(|entry| SourceObservation {
                        source: source.name().to_string(),
                        provenance: source.provenance(),
                        entry,
                    }));
                }
                Err(e) => {
                    tracing::warn!(
                        source = %source.name(),
                        error = %e,
                        "discovery source unavailable"
                    );
                    degraded.push(DegradedSource {
                        name: source.name().to_string(),
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let mut descriptors = merge_observations(observations);
        rank(&mut descriptors, query);

        let elapsed_ms = millis(started.elapsed());
        tracing::info!(
            query = %query,
            results = descriptors.len(),
            degraded = degraded.len(),
            elapsed_ms,
            "federated search complete"
        );

        SearchOutcome {
            query: query.to_string(),
            descriptors,
            degraded,
            elapsed_ms,
        }
    }

    async fn query_source(
        &self,
        source: &dyn DiscoverySource,
        query: &str,
    ) -> Result<Vec<RegistryEntry>, DiscoveryError> {
        match tokio::time::timeout(self.source_timeout, source.search(query)).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Timeout {
                source_name: source.name().to_string(),
                timeout_ms: millis(self.source_timeout),
            }),
        }
    }

    // ─── Availability ───────────────────────────────────────────────────────

    /// Ping every source concurrently, in configuration order.
    pub async fn source_status(&self) -> Vec<SourceStatus> {
        let checks = self.sources.iter().map(|source| async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(self.source_timeout, source.ping()).await {
                Ok(result) => result,
                Err(_) => Err(DiscoveryError::Timeout {
                    source_name: source.name().to_string(),
                    timeout_ms: millis(self.source_timeout),
                }),
            };
            SourceStatus {
                name: source.name().to_string(),
                provenance: source.provenance(),
                available: result.is_ok(),
                latency_ms: millis(started.elapsed()),
                checked_at: Utc::now(),
                error: result.err().map(|e| e.to_string()),
            }
        });
        futures::future::join_all(checks).await
    }
}

impl std::fmt::Debug for RegistryFederator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryFederator")
            .field("sources", &self.source_names())
            .field("source_timeout", &self.source_timeout)
            .field("deadline", &self.deadline)
            .finish()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
