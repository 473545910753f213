//! Discovery sources the federator fans out to.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::errors::DiscoveryError;
use super::types::{ProvenanceTag, RegistryEntry};
use crate::config::SourceConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("capstack/", env!("CARGO_PKG_VERSION"));

/// A registry, index or list that can be searched for providers.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;

    fn provenance(&self) -> ProvenanceTag;

    /// Entries matching `query`. An empty query lists everything.
    async fn search(&self, query: &str) -> Result<Vec<RegistryEntry>, DiscoveryError>;

    /// Whether the source is reachable.
    async fn ping(&self) -> Result<(), DiscoveryError>;
}

/// Build the source a configuration entry describes.
pub fn source_from_config(
    config: &SourceConfig,
) -> Result<Box<dyn DiscoverySource>, DiscoveryError> {
    Ok(match config {
        SourceConfig::Http {
            name,
            provenance,
            url,
        } => Box::new(HttpRegistrySource::new(name, *provenance, url)?),
        SourceConfig::Static {
            name,
            provenance,
            entries,
        } => Box::new(StaticSource::new(name, *provenance, entries.clone())),
    })
}

// ─── HTTP Registry ──────────────────────────────────────────────────────────

/// A JSON registry queried with `GET <url>?q=<query>`.
///
/// The body may be a bare list of entries or an object holding the list
/// under `servers` or `results`.
#[derive(Debug, Clone)]
pub struct HttpRegistrySource {
    name: String,
    provenance: ProvenanceTag,
    url: String,
    http: HttpClient,
}

impl HttpRegistrySource {
    pub fn new(
        name: impl Into<String>,
        provenance: ProvenanceTag,
        url: impl Into<String>,
    ) -> Result<Self, DiscoveryError> {
        let name = name.into();
        let url = url.into();
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DiscoveryError::Http {
                source_name: name.clone(),
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            name,
            provenance,
            url,
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_error(&self, e: reqwest::Error) -> DiscoveryError {
        DiscoveryError::Http {
            source_name: self.name.clone(),
            url: self.url.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl DiscoverySource for HttpRegistrySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn provenance(&self) -> ProvenanceTag {
        self.provenance
    }

    async fn search(&self, query: &str) -> Result<Vec<RegistryEntry>, DiscoveryError> {
        let mut request = self.http.get(&self.url);
        let query = query.trim();
        if !query.is_empty() {
            request = request.query(&[("q", query)]);
        }

        let response = request.send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Status {
                source_name: self.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| DiscoveryError::Decode {
            source_name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let entries = parse_listing(&self.name, &body)?;
        tracing::debug!(source = %self.name, count = entries.len(), "source search complete");
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), DiscoveryError> {
        let response = self
            .http
            .get(&self.url)
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        // Anything below 500 means something is answering
        let status = response.status();
        if status.is_server_error() {
            return Err(DiscoveryError::Status {
                source_name: self.name.clone(),
                status: status.as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }
}

/// Extract entries from a listing body. Unnamed entries are dropped.
fn parse_listing(
    source: &str,
    body: &serde_json::Value,
) -> Result<Vec<RegistryEntry>, DiscoveryError> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => ["servers", "results"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_array()))
            .ok_or_else(|| DiscoveryError::Decode {
                source_name: source.to_string(),
                reason: "expected a list or an object with 'servers' or 'results'".into(),
            })?,
        other => {
            return Err(DiscoveryError::Decode {
                source_name: source.to_string(),
                reason: format!("unexpected JSON {}", json_type(other)),
            })
        }
    };

    let entries: Vec<RegistryEntry> = items.iter().filter_map(RegistryEntry::from_json).collect();
    if entries.len() < items.len() {
        tracing::debug!(
            source = %source,
            dropped = items.len() - entries.len(),
            "dropped entries without a name"
        );
    }
    Ok(entries)
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Static List ────────────────────────────────────────────────────────────

/// A fixed, in-memory list of entries.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    provenance: ProvenanceTag,
    entries: Vec<RegistryEntry>,
}

impl StaticSource {
    pub fn new(
        name: impl Into<String>,
        provenance: ProvenanceTag,
        entries: Vec<RegistryEntry>,
    ) -> Self {
        Self {
            name: name.into(),
            provenance,
            entries,
        }
    }

    fn matches(entry: &RegistryEntry, tokens: &[String]) -> bool {
        let haystack = format!(
            "{} {} {}",
            entry.name.to_lowercase(),
            entry.description.to_lowercase(),
            entry.tags.join(" ").to_lowercase()
        );
        tokens.iter().any(|t| haystack.contains(t.as_str()))
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn provenance(&self) -> ProvenanceTag {
        self.provenance
    }

    async fn search(&self, query: &str) -> Result<Vec<RegistryEntry>, DiscoveryError> {
        let tokens: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if tokens.is_empty() {
            return Ok(self.entries.clone());
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| Self::matches(e, &tokens))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[tokio::test]
    async fn test_http_search_bare_list() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/servers")
            .match_query(Matcher::UrlEncoded("q".into(), "fetch".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([{"name": "fetch", "stars": 10}, {"description": "no name"}]).to_string(),
            )
            .create_async()
            .await;

        let source = HttpRegistrySource::new(
            "official",
            ProvenanceTag::OfficialRegistry,
            format!("{}/servers", server.url()),
        )
        .unwrap();
        let entries = source.search("fetch").await.unwrap();
        mock.assert_async().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "fetch");
        assert_eq!(entries[0].stars, Some(10));
    }

    #[tokio::test]
    async fn test_http_search_envelopes() {
        let mut server = Server::new_async().await;
        let _servers = server
            .mock("GET", "/a")
            .match_query(Matcher::Any)
            .with_body(json!({"servers": [{"server": {"name": "github"}}]}).to_string())
            .create_async()
            .await;
        let _results = server
            .mock("GET", "/b")
            .match_query(Matcher::Any)
            .with_body(json!({"results": [{"qualifiedName": "@smithery/slack"}]}).to_string())
            .create_async()
            .await;

        let a_url = format!("{}/a", server.url());
        let b_url = format!("{}/b", server.url());
        let a = HttpRegistrySource::new("a", ProvenanceTag::FederatedIndex, a_url).unwrap();
        let b = HttpRegistrySource::new("b", ProvenanceTag::Crawl, b_url).unwrap();
        assert_eq!(a.search("git").await.unwrap()[0].name, "github");
        assert_eq!(b.search("").await.unwrap()[0].name, "@smithery/slack");
    }

    #[tokio::test]
    async fn test_http_search_error_status() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/servers")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let url = format!("{}/servers", server.url());
        let source = HttpRegistrySource::new("down", ProvenanceTag::Crawl, url).unwrap();
        let err = source.search("x").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Status { status: 503, .. }));
        assert_eq!(err.source_name(), "down");
        assert!(source.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_http_search_rejects_unknown_shape() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/servers")
            .match_query(Matcher::Any)
            .with_body(json!({"items": []}).to_string())
            .create_async()
            .await;

        let url = format!("{}/servers", server.url());
        let source = HttpRegistrySource::new("odd", ProvenanceTag::Crawl, url).unwrap();
        assert!(matches!(
            source.search("x").await.unwrap_err(),
            DiscoveryError::Decode { .. }
        ));
    }

    #[tokio::test]
    async fn test_ping_accepts_client_errors() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/servers")
            .with_status(404)
            .create_async()
            .await;
        let url = format!("{}/servers", server.url());
        let source = HttpRegistrySource::new("r", ProvenanceTag::Crawl, url).unwrap();
        assert!(source.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_static_source_filters_by_token() {
        let source = StaticSource::new(
            "curated",
            ProvenanceTag::CuratedList,
            vec![
                RegistryEntry {
                    tags: vec!["database".into()],
                    ..RegistryEntry::named("postgres")
                },
                RegistryEntry::named("slack"),
            ],
        );
        assert_eq!(source.search("").await.unwrap().len(), 2);
        let hits = source.search("Database").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "postgres");
        assert!(source.ping().await.is_ok());
    }

    #[test]
    fn test_source_from_config() {
        let config = SourceConfig::Static {
            name: "curated".into(),
            provenance: ProvenanceTag::CuratedList,
            entries: vec![RegistryEntry::named("fetch")],
        };
        let source = source_from_config(&config).unwrap();
        assert_eq!(source.name(), "curated");
        assert_eq!(source.provenance(), ProvenanceTag::CuratedList);
    }
}
