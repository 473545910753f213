//! Discovery data types: provenance, raw registry entries, merged descriptors.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::trust::{TrustBreakdown, TrustLevel};
use crate::errors::ErrorKind;
use crate::supervisor::LaunchSpec;

// ─── Provenance ─────────────────────────────────────────────────────────────

/// Where a descriptor was observed. Declaration order is tier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceTag {
    OfficialRegistry,
    FederatedIndex,
    CuratedList,
    Crawl,
}

impl ProvenanceTag {
    /// Trust points contributed when this is the best source.
    pub fn weight(self) -> u32 {
        match self {
            ProvenanceTag::OfficialRegistry => 30,
            ProvenanceTag::FederatedIndex => 25,
            ProvenanceTag::CuratedList => 20,
            ProvenanceTag::Crawl => 15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProvenanceTag::OfficialRegistry => "official_registry",
            ProvenanceTag::FederatedIndex => "federated_index",
            ProvenanceTag::CuratedList => "curated_list",
            ProvenanceTag::Crawl => "crawl",
        }
    }
}

impl std::fmt::Display for ProvenanceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Registry Entries ───────────────────────────────────────────────────────

/// One server as a single source reports it, before merging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryEntry {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub stars: Option<u64>,
    pub repository_url: Option<String>,
    pub documentation_url: Option<String>,
    pub author: Option<String>,
    /// `Some(true)` for a passed scan, `Some(false)` for a failed one.
    pub security_scan: Option<bool>,
    pub launch: Option<LaunchSpec>,
}

impl RegistryEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Normalize a registry's JSON entry.
    ///
    /// Registries disagree on field names (`stars` / `github_stars`,
    /// `repository_url` / `repo` / `url`, `tags` / `keywords` / `category`)
    /// and some wrap the entry in a `server` object. Returns `None` for
    /// entries without a name.
    pub fn from_json(raw: &serde_json::Value) -> Option<Self> {
        let raw = match raw.get("server") {
            Some(inner) if inner.is_object() => inner,
            _ => raw,
        };

        let str_field = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| raw.get(*k).and_then(|v| v.as_str()))
                .map(str::trim)
                .find(|s| !s.is_empty())
                .map(str::to_string)
        };

        let name = str_field(&["name", "qualifiedName", "display_name"])?;

        let stars = ["stars", "github_stars"]
            .iter()
            .filter_map(|k| raw.get(*k).and_then(|v| v.as_u64()))
            .next();

        let security_scan = ["has_security_scan", "security_scan"]
            .iter()
            .filter_map(|k| raw.get(*k))
            .find_map(|v| match v {
                serde_json::Value::Bool(b) => Some(*b),
                serde_json::Value::Object(o) => o.get("passed").and_then(|p| p.as_bool()),
                _ => None,
            });

        let mut tags: Vec<String> = Vec::new();
        for key in ["tags", "keywords"] {
            if let Some(items) = raw.get(key).and_then(|v| v.as_array()) {
                tags.extend(items.iter().filter_map(|t| t.as_str()).map(str::to_string));
            }
        }
        if let Some(category) = str_field(&["category"]) {
            tags.push(category);
        }

        let launch = match raw.get("launch") {
            Some(spec) => serde_json::from_value::<LaunchSpec>(spec.clone()).ok(),
            None => str_field(&["install_command"]).and_then(|cmd| {
                launch_from_command(&cmd, env_var_names(raw.get("env_vars")))
            }),
        };

        Some(Self {
            name,
            description: str_field(&["description"]).unwrap_or_default(),
            tags,
            stars,
            repository_url: str_field(&["repository_url", "repo", "url"]),
            documentation_url: str_field(&["documentation_url", "homepage"]),
            author: str_field(&["author"]),
            security_scan,
            launch,
        })
    }
}

/// Split an install command line into a launch spec.
fn launch_from_command(command_line: &str, required_env: Vec<String>) -> Option<LaunchSpec> {
    let mut parts = command_line.split_whitespace();
    let command = parts.next()?;
    Some(LaunchSpec {
        required_env,
        ..LaunchSpec::new(command).with_args(parts)
    })
}

/// `env_vars` is either a list of names or a list of `{name: ...}` objects.
fn env_var_names(raw: Option<&serde_json::Value>) -> Vec<String> {
    raw.and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => other
                        .get("name")
                        .and_then(|n| n.as_str())
                        .map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// An entry together with the source that reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceObservation {
    pub source: String,
    pub provenance: ProvenanceTag,
    pub entry: RegistryEntry,
}

// ─── Descriptors ────────────────────────────────────────────────────────────

/// A deduplicated, scored capability provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerDescriptor {
    pub canonical_id: String,
    /// Display name from the first observation.
    pub name: String,
    pub description: String,
    pub capability_tags: Vec<String>,
    pub sources: BTreeSet<ProvenanceTag>,
    /// Names of the configured sources that reported this server.
    pub source_names: Vec<String>,
    pub repository_url: Option<String>,
    pub documentation_url: Option<String>,
    pub author: Option<String>,
    pub stars: Option<u64>,
    pub security_scan: Option<bool>,
    pub launch_spec: Option<LaunchSpec>,
    pub trust_score: u32,
    pub trust_level: TrustLevel,
    pub trust_breakdown: TrustBreakdown,
    /// Query match score, 0–100. Zero outside of a search.
    pub relevance: u32,
}

/// A source that contributed nothing to a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedSource {
    pub name: String,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Result of a federated search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub query: String,
    /// Most relevant first.
    pub descriptors: Vec<ServerDescriptor>,
    pub degraded: Vec<DegradedSource>,
    pub elapsed_ms: u64,
}

/// Reachability of one discovery source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub provenance: ProvenanceTag,
    pub available: bool,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
}
