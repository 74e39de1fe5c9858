//! The npm-registry HTTP client. Scoped registries get their own base URL
//! and credentials; transient failures retry with exponential backoff.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use esmcdn_common::{CdnError, Config, Result};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The full registry document for one package.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryPackument {
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: HashMap<String, String>,
    #[serde(default)]
    pub versions: HashMap<String, VersionMetadata>,
}

/// Registry metadata of one published version.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub dist: Dist,
    /// Deprecation notice, surfaced as a `console.warn` in built artefacts.
    #[serde(default, deserialize_with = "de_deprecated")]
    pub deprecated: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(rename = "peerDependencies", default)]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub types: Option<String>,
    #[serde(default)]
    pub typings: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dist {
    #[serde(default)]
    pub tarball: String,
}

/// npm publishes `deprecated` as either a message or a bare boolean.
fn de_deprecated<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Bool(true) => Some("deprecated".to_string()),
        _ => None,
    })
}

/// Upstream interface of the package registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn packument(&self, name: &str) -> Result<RegistryPackument>;

    async fn version_metadata(&self, name: &str, version: &str) -> Result<VersionMetadata>;

    /// Fetch the version's source tarball (gzip'd tar).
    async fn tarball(&self, meta: &VersionMetadata) -> Result<Bytes>;
}

struct ScopeEndpoint {
    base_url: String,
    token: String,
}

pub struct NpmClient {
    http: reqwest::Client,
    default: ScopeEndpoint,
    scoped: HashMap<String, ScopeEndpoint>,
}

impl NpmClient {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        let scoped = config
            .npm_scoped_registries
            .iter()
            .map(|(scope, reg)| {
                let scope = scope.trim_start_matches('@').to_string();
                (
                    scope,
                    ScopeEndpoint {
                        base_url: reg.url.trim_end_matches('/').to_string(),
                        token: reg.token.clone(),
                    },
                )
            })
            .collect();
        Self {
            http,
            default: ScopeEndpoint {
                base_url: config.npm_registry.clone(),
                token: config.npm_token.clone(),
            },
            scoped,
        }
    }

    fn endpoint(&self, name: &str) -> &ScopeEndpoint {
        name.strip_prefix('@')
            .and_then(|rest| rest.split('/').next())
            .and_then(|scope| self.scoped.get(scope))
            .unwrap_or(&self.default)
    }

    /// Scoped names keep their `@` but encode the inner slash.
    fn encode_name(name: &str) -> String {
        match name.split_once('/') {
            Some((scope, bare)) => format!("{scope}%2F{bare}"),
            None => name.to_string(),
        }
    }

    async fn get_with_retry(&self, url: &str, token: &str, what: &str) -> Result<reqwest::Response> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
                let jitter = Duration::from_millis(rand::rng().random_range(0..200));
                tokio::time::sleep(backoff + jitter).await;
            }
            let mut req = self.http.get(url);
            if !token.is_empty() {
                req = req.bearer_auth(token);
            }
            match req.send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Err(CdnError::NotFound(what.to_string()));
                }
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(url, status = %resp.status(), attempt = attempt + 1, "Registry 5xx, retrying");
                    last_err = Some(CdnError::Upstream(format!(
                        "{what}: registry responded {}",
                        resp.status()
                    )));
                }
                Ok(resp) if !resp.status().is_success() => {
                    return Err(CdnError::Upstream(format!(
                        "{what}: registry responded {}",
                        resp.status()
                    )));
                }
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!(url, attempt = attempt + 1, error = %e, "Registry unreachable, retrying");
                    last_err = Some(CdnError::Upstream(format!("{what}: {e}")));
                }
                Err(e) => return Err(CdnError::Upstream(format!("{what}: {e}"))),
            }
        }
        Err(last_err.unwrap_or_else(|| CdnError::Upstream(format!("{what}: retries exhausted"))))
    }
}

#[async_trait]
impl RegistryClient for NpmClient {
    async fn packument(&self, name: &str) -> Result<RegistryPackument> {
        let endpoint = self.endpoint(name);
        let url = format!("{}/{}", endpoint.base_url, Self::encode_name(name));
        debug!(name, "Fetching packument");
        let resp = self.get_with_retry(&url, &endpoint.token, name).await?;
        resp.json()
            .await
            .map_err(|e| CdnError::Upstream(format!("{name}: invalid packument: {e}")))
    }

    async fn version_metadata(&self, name: &str, version: &str) -> Result<VersionMetadata> {
        let endpoint = self.endpoint(name);
        let url = format!(
            "{}/{}/{version}",
            endpoint.base_url,
            Self::encode_name(name)
        );
        let what = format!("{name}@{version}");
        let resp = self.get_with_retry(&url, &endpoint.token, &what).await?;
        resp.json()
            .await
            .map_err(|e| CdnError::Upstream(format!("{what}: invalid metadata: {e}")))
    }

    async fn tarball(&self, meta: &VersionMetadata) -> Result<Bytes> {
        if meta.dist.tarball.is_empty() {
            return Err(CdnError::Upstream(format!(
                "{}@{}: no tarball URL",
                meta.name, meta.version
            )));
        }
        let endpoint = self.endpoint(&meta.name);
        let what = format!("{}@{} tarball", meta.name, meta.version);
        let resp = self
            .get_with_retry(&meta.dist.tarball, &endpoint.token, &what)
            .await?;
        resp.bytes()
            .await
            .map_err(|e| CdnError::Upstream(format!("{what}: {e}")))
    }
}
