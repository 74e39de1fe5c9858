use std::collections::HashMap;
use std::env;

use serde::Deserialize;
use tracing::info;

/// A registry override for one npm scope (e.g. `@corp`).
#[derive(Debug, Clone, Deserialize)]
pub struct ScopedRegistry {
    pub url: String,
    #[serde(default)]
    pub token: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Web server
    pub host: String,
    pub port: u16,
    /// Optional URL prefix every request must carry (stripped before routing).
    pub base_path: String,

    // Upstream registries
    pub npm_registry: String,
    pub npm_token: String,
    pub npm_scoped_registries: HashMap<String, ScopedRegistry>,

    // Storage roots. When `s3_bucket` is set the S3 driver is used and the
    // filesystem roots only hold working directories.
    pub storage_root: String,
    pub kv_root: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_endpoint: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub workdir_root: String,
    /// Seconds an installed working directory survives after its last use.
    pub workdir_ttl_secs: u64,

    // Build pipeline
    /// Concurrent build jobs. 0 means `2 * available_parallelism`.
    pub build_concurrency: usize,
    /// How long a request waits on a queued build before 408.
    pub build_wait_timeout_secs: u64,
    pub bundler_bin: String,
    pub analyzer_bin: String,
    pub minify: bool,
    pub source_map: bool,
    pub deno_std_version: String,

    // Resolution
    pub resolve_cache_ttl_secs: u64,

    // Policy
    pub allow_list: Vec<String>,
    pub ban_list: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    /// Every field has a workable default; nothing panics.
    pub fn from_env() -> Self {
        let npm_scoped_registries = env::var("ESMCDN_NPM_SCOPED_REGISTRIES")
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Self {
            host: env::var("ESMCDN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("ESMCDN_PORT")
                .or_else(|_| env::var("PORT"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            base_path: normalize_base_path(env::var("ESMCDN_BASE_PATH").unwrap_or_default()),
            npm_registry: trim_slash(
                env::var("ESMCDN_NPM_REGISTRY")
                    .unwrap_or_else(|_| "https://registry.npmjs.org".to_string()),
            ),
            npm_token: env::var("ESMCDN_NPM_TOKEN").unwrap_or_default(),
            npm_scoped_registries,
            storage_root: env::var("ESMCDN_STORAGE_ROOT")
                .unwrap_or_else(|_| ".esmcdn/storage".to_string()),
            kv_root: env::var("ESMCDN_KV_ROOT").unwrap_or_else(|_| ".esmcdn/kv".to_string()),
            s3_bucket: env::var("ESMCDN_S3_BUCKET").unwrap_or_default(),
            s3_region: env::var("ESMCDN_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            s3_endpoint: env::var("ESMCDN_S3_ENDPOINT").unwrap_or_default(),
            s3_access_key: env::var("ESMCDN_S3_ACCESS_KEY").unwrap_or_default(),
            s3_secret_key: env::var("ESMCDN_S3_SECRET_KEY").unwrap_or_default(),
            workdir_root: env::var("ESMCDN_WORKDIR_ROOT")
                .unwrap_or_else(|_| ".esmcdn/work".to_string()),
            workdir_ttl_secs: env_u64("ESMCDN_WORKDIR_TTL_SECS", 3600),
            build_concurrency: env::var("ESMCDN_BUILD_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            build_wait_timeout_secs: env_u64("ESMCDN_BUILD_WAIT_TIMEOUT_SECS", 600),
            bundler_bin: env::var("ESMCDN_BUNDLER_BIN")
                .unwrap_or_else(|_| "esmcdn-bundler".to_string()),
            analyzer_bin: env::var("ESMCDN_ANALYZER_BIN")
                .unwrap_or_else(|_| "esmcdn-analyzer".to_string()),
            minify: env_bool("ESMCDN_MINIFY", true),
            source_map: env_bool("ESMCDN_SOURCE_MAP", true),
            deno_std_version: env::var("ESMCDN_DENO_STD_VERSION")
                .unwrap_or_else(|_| "0.177.0".to_string()),
            resolve_cache_ttl_secs: env_u64("ESMCDN_RESOLVE_CACHE_TTL_SECS", 600),
            allow_list: env_list("ESMCDN_ALLOW_LIST"),
            ban_list: env_list("ESMCDN_BAN_LIST"),
        }
    }

    /// Log the effective configuration without credentials.
    pub fn log_redacted(&self) {
        info!(
            host = %self.host,
            port = self.port,
            base_path = %self.base_path,
            npm_registry = %self.npm_registry,
            npm_token_set = !self.npm_token.is_empty(),
            scoped_registries = self.npm_scoped_registries.len(),
            storage_root = %self.storage_root,
            s3_bucket = %self.s3_bucket,
            workdir_root = %self.workdir_root,
            workdir_ttl_secs = self.workdir_ttl_secs,
            build_concurrency = self.build_concurrency,
            build_wait_timeout_secs = self.build_wait_timeout_secs,
            allow_list = self.allow_list.len(),
            ban_list = self.ban_list.len(),
            "Configuration loaded"
        );
    }

    /// Effective worker-pool size for the build queue.
    pub fn effective_concurrency(&self) -> usize {
        if self.build_concurrency > 0 {
            return self.build_concurrency;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        cpus * 2
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn trim_slash(mut s: String) -> String {
    while s.ends_with('/') {
        s.pop();
    }
    s
}

/// Base paths are stored as `/prefix` with no trailing slash; empty means none.
fn normalize_base_path(raw: String) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
