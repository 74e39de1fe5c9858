//! Code-host (GitHub) ref resolution and source download. Refs come from
//! `git ls-remote`; sources come from the host's tarball endpoint.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use esmcdn_common::{is_commitish, CdnError, Result};

const LS_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);
/// Pinned commits are abbreviated to this many hex chars in URLs.
const COMMIT_ABBREV: usize = 16;

/// Resolves branch/tag/commit specs for `owner/repo` to pinned commits.
pub struct CodeHostResolver {
    host: String,
    ttl: Duration,
    cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl CodeHostResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            host: "https://github.com".to_string(),
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `spec` (tag, branch, commit prefix, or empty for HEAD) to an
    /// abbreviated pinned commit.
    pub async fn resolve(&self, repo: &str, spec: &str) -> Result<String> {
        if is_commitish(spec) {
            let mut pinned = spec.to_lowercase();
            pinned.truncate(COMMIT_ABBREV);
            return Ok(pinned);
        }

        let cache_key = format!("{repo}@{spec}");
        {
            let cache = self.cache.lock().await;
            if let Some((version, at)) = cache.get(&cache_key) {
                if at.elapsed() < self.ttl {
                    return Ok(version.clone());
                }
            }
        }

        let refs = self.ls_remote(repo).await?;
        let commit = pick_ref(&refs, spec).ok_or_else(|| {
            CdnError::NotFound(format!("no ref {spec:?} in {repo}"))
        })?;
        let mut pinned = commit;
        pinned.truncate(COMMIT_ABBREV);

        let mut cache = self.cache.lock().await;
        cache.insert(cache_key, (pinned.clone(), Instant::now()));
        Ok(pinned)
    }

    async fn ls_remote(&self, repo: &str) -> Result<Vec<(String, String)>> {
        let url = format!("{}/{repo}", self.host);
        debug!(repo, "Listing remote refs");
        let output = tokio::time::timeout(
            LS_REMOTE_TIMEOUT,
            tokio::process::Command::new("git")
                .args(["ls-remote", &url])
                .output(),
        )
        .await
        .map_err(|_| CdnError::Upstream(format!("{repo}: ls-remote timed out")))?
        .map_err(|e| CdnError::Upstream(format!("{repo}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") || stderr.contains("Repository not found") {
                return Err(CdnError::NotFound(format!("repository {repo}")));
            }
            warn!(repo, stderr = %stderr, "ls-remote failed");
            return Err(CdnError::Upstream(format!("{repo}: ls-remote failed")));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| {
                let (sha, name) = line.split_once('\t')?;
                Some((sha.to_string(), name.trim().to_string()))
            })
            .collect())
    }
}

/// Match a ref spec against an ls-remote listing: HEAD for empty specs, then
/// tags (with and without a leading `v`), then branches.
fn pick_ref(refs: &[(String, String)], spec: &str) -> Option<String> {
    let find = |name: &str| {
        refs.iter()
            .find(|(_, r)| r == name)
            .map(|(sha, _)| sha.clone())
    };
    if spec.is_empty() || spec == "HEAD" {
        return find("HEAD");
    }
    find(&format!("refs/tags/{spec}"))
        .or_else(|| find(&format!("refs/tags/v{spec}")))
        .or_else(|| find(&format!("refs/heads/{spec}")))
}

/// Downloads repository source tarballs.
pub struct CodeHostClient {
    http: reqwest::Client,
    tarball_host: String,
}

impl CodeHostClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(15))
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client"),
            tarball_host: "https://codeload.github.com".to_string(),
        }
    }

    /// Fetch the gzip'd tar of `owner/repo` at `commit`.
    pub async fn tarball(&self, repo: &str, commit: &str) -> Result<Bytes> {
        let url = format!("{}/{repo}/tar.gz/{commit}", self.tarball_host);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CdnError::Upstream(format!("{repo}@{commit}: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CdnError::NotFound(format!("{repo}@{commit}")));
        }
        if !resp.status().is_success() {
            return Err(CdnError::Upstream(format!(
                "{repo}@{commit}: tarball fetch responded {}",
                resp.status()
            )));
        }
        resp.bytes()
            .await
            .map_err(|e| CdnError::Upstream(format!("{repo}@{commit}: {e}")))
    }
}

impl Default for CodeHostClient {
    fn default() -> Self {
        Self::new()
    }
}
