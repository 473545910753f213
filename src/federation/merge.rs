//! Deduplication and ranking of source observations.

use std::collections::{BTreeMap, BTreeSet};

use super::trust::{TrustBreakdown, TrustLevel};
use super::types::{ServerDescriptor, SourceObservation};

/// Prefixes stripped from names, most specific first.
const NAME_PREFIXES: [&str; 4] = ["@modelcontextprotocol/server-", "mcp-server-", "mcp-", "@"];

/// Suffixes stripped from names.
const NAME_SUFFIXES: [&str; 3] = ["-mcp-server", "-mcp", "-server"];

// ─── Canonical Ids ──────────────────────────────────────────────────────────

/// Normalize a server name into its deduplication key.
///
/// Lowercases, turns punctuation runs into single dashes (keeping `@` and `/`
/// for scoped package names), then strips common affixes. Returns an empty
/// string for names with no alphanumeric content.
pub fn canonical_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() || ch == '@' || ch == '/' {
            id.extend(ch.to_lowercase());
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }

    let mut id = id.trim_matches('-').to_string();
    loop {
        let before = id.len();
        for prefix in NAME_PREFIXES {
            if let Some(rest) = id.strip_prefix(prefix) {
                if !rest.is_empty() {
                    id = rest.to_string();
                }
            }
        }
        for suffix in NAME_SUFFIXES {
            if let Some(rest) = id.strip_suffix(suffix) {
                if !rest.is_empty() {
                    id = rest.to_string();
                }
            }
        }
        if id.len() == before {
            break;
        }
    }

    let id = id.trim_matches('-');
    if id.chars().any(char::is_alphanumeric) {
        id.to_string()
    } else {
        String::new()
    }
}

// ─── Merging ────────────────────────────────────────────────────────────────

impl ServerDescriptor {
    fn from_observation(canonical_id: String, obs: SourceObservation) -> Self {
        let entry = obs.entry;
        let mut descriptor = Self {
            canonical_id,
            name: entry.name,
            description: entry.description,
            capability_tags: Vec::new(),
            sources: BTreeSet::from([obs.provenance]),
            source_names: vec![obs.source],
            repository_url: entry.repository_url,
            documentation_url: entry.documentation_url,
            author: entry.author,
            stars: entry.stars,
            security_scan: entry.security_scan,
            launch_spec: entry.launch,
            trust_score: 0,
            trust_level: TrustLevel::Unknown,
            trust_breakdown: TrustBreakdown::default(),
            relevance: 0,
        };
        descriptor.add_tags(entry.tags);
        descriptor.recompute_trust();
        descriptor
    }

    /// Fold another observation of the same server into this descriptor.
    ///
    /// Sources are unioned. Descriptive fields already present are kept;
    /// stars take the maximum and a passed scan from any source counts.
    fn absorb(&mut self, obs: SourceObservation) {
        let entry = obs.entry;
        self.sources.insert(obs.provenance);
        if !self.source_names.contains(&obs.source) {
            self.source_names.push(obs.source.clone());
        }

        if self.description.is_empty() {
            self.description = entry.description;
        }
        self.repository_url = self.repository_url.take().or(entry.repository_url);
        self.documentation_url = self.documentation_url.take().or(entry.documentation_url);
        self.author = self.author.take().or(entry.author);
        self.stars = match (self.stars, entry.stars) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.security_scan = match (self.security_scan, entry.security_scan) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (a, b) => a.or(b),
        };

        match (&self.launch_spec, entry.launch) {
            (None, Some(spec)) => self.launch_spec = Some(spec),
            (Some(kept), Some(other)) if *kept != other => {
                tracing::warn!(
                    server = %self.canonical_id,
                    kept = %kept.command,
                    ignored = %other.command,
                    source = %obs.source,
                    "launch spec disagreement, keeping first seen"
                );
            }
            _ => {}
        }

        self.add_tags(entry.tags);
        self.recompute_trust();
    }

    fn add_tags(&mut self, tags: Vec<String>) {
        for tag in tags {
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() && !self.capability_tags.contains(&tag) {
                self.capability_tags.push(tag);
            }
        }
    }

    fn recompute_trust(&mut self) {
        self.trust_breakdown = TrustBreakdown::compute(
            &self.sources,
            self.source_names.len(),
            self.stars,
            self.security_scan,
            self.documentation_url.is_some(),
        );
        self.trust_score = self.trust_breakdown.score();
        self.trust_level = TrustLevel::for_score(self.trust_score);
    }
}

/// Group observations by canonical id and merge each group.
///
/// Observations are folded in the order given, so earlier sources win
/// conflicts. The result is ordered by canonical id.
pub fn merge_observations<I>(observations: I) -> Vec<ServerDescriptor>
where
    I: IntoIterator<Item = SourceObservation>,
{
    let mut merged: BTreeMap<String, ServerDescriptor> = BTreeMap::new();
    for obs in observations {
        let id = canonical_id(&obs.entry.name);
        if id.is_empty() {
            tracing::debug!(
                source = %obs.source,
                name = %obs.entry.name,
                "skipping entry without a usable name"
            );
            continue;
        }
        match merged.get_mut(&id) {
            Some(existing) => existing.absorb(obs),
            None => {
                let descriptor = ServerDescriptor::from_observation(id.clone(), obs);
                merged.insert(id, descriptor);
            }
        }
    }
    merged.into_values().collect()
}

// ─── Ranking ────────────────────────────────────────────────────────────────

const NAME_WEIGHT: usize = 3;
const TAG_WEIGHT: usize = 2;
const DESCRIPTION_WEIGHT: usize = 1;

fn query_tokens(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Token-match score of `descriptor` against `query`, 0–100.
pub fn relevance(descriptor: &ServerDescriptor, query: &str) -> u32 {
    let tokens = query_tokens(query);
    if tokens.is_empty() {
        return 0;
    }

    let name = format!(
        "{} {}",
        descriptor.canonical_id,
        descriptor.name.to_lowercase()
    );
    let description = descriptor.description.to_lowercase();

    let points: usize = tokens
        .iter()
        .map(|token| {
            let mut p = 0;
            if name.contains(token.as_str()) {
                p += NAME_WEIGHT;
            }
            if descriptor.capability_tags.iter().any(|t| t.contains(token.as_str())) {
                p += TAG_WEIGHT;
            }
            if description.contains(token.as_str()) {
                p += DESCRIPTION_WEIGHT;
            }
            p
        })
        .sum();

    let max = tokens.len() * (NAME_WEIGHT + TAG_WEIGHT + DESCRIPTION_WEIGHT);
    u32::try_from(points * 100 / max).unwrap_or(100)
}

/// Score every descriptor against `query` and order them:
/// relevance, then trust score (both descending), then canonical id.
pub fn rank(descriptors: &mut [ServerDescriptor], query: &str) {
    for d in descriptors.iter_mut() {
        d.relevance = relevance(d, query);
    }
    descriptors.sort_by(|a, b| {
        b.relevance
            .cmp(&a.relevance)
            .then(b.trust_score.cmp(&a.trust_score))
            .then_with(|| a.canonical_id.cmp(&b.canonical_id))
    });
}

// ─── Tests ──────────────────────────────────────────────────────────────────
