use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use esmcdn_common::{CdnError, Result};

/// Hard limit on one analyzer invocation; the child is killed on expiry.
const ANALYZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Packages whose named exports cannot be determined statically (runtime
/// meta-programming, generated export maps). These run the analyzer in
/// `require` mode, which loads the module and introspects the result.
const REQUIRE_MODE_PACKAGES: &[&str] = &[
    "@babel/types",
    "cheerio",
    "graceful-fs",
    "he",
    "jsbn",
    "lz-string",
    "maplibre-gl",
    "pako",
    "postcss",
    "prettier",
    "safe-buffer",
    "seedrandom",
    "stream-browserify",
    "typescript",
    "vscode-oniguruma",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerMode {
    Static,
    Require,
}

impl AnalyzerMode {
    /// Mode for a package name, per the require-introspection allowlist.
    pub fn for_package(name: &str) -> Self {
        if REQUIRE_MODE_PACKAGES.contains(&name) {
            AnalyzerMode::Require
        } else {
            AnalyzerMode::Static
        }
    }
}

/// What the analyzer learned about a module.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ExportAnalysis {
    #[serde(rename = "isESM", default)]
    pub is_esm: bool,
    #[serde(rename = "namedExports", default)]
    pub named_exports: Vec<String>,
    #[serde(rename = "hasDefaultExport", default)]
    pub has_default_export: bool,
    /// A bare `module.exports = require("x")` forwarder, when detected.
    #[serde(default)]
    pub reexport: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnalyzerReply {
    #[serde(flatten)]
    analysis: ExportAnalysis,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
pub trait ExportAnalyzer: Send + Sync {
    /// Analyze the entry module of `pkg_name` inside `workdir`.
    async fn analyze(&self, pkg_name: &str, workdir: &Path, entry: &Path) -> Result<ExportAnalysis>;
}

#[derive(Debug, Serialize)]
struct AnalyzerRequest<'a> {
    workdir: &'a str,
    entry: &'a str,
    mode: AnalyzerMode,
}

/// Drives the external analyzer binary: one JSON request on stdin, one JSON
/// reply on stdout.
pub struct ProcessAnalyzer {
    bin: String,
}

impl ProcessAnalyzer {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl ExportAnalyzer for ProcessAnalyzer {
    async fn analyze(&self, pkg_name: &str, workdir: &Path, entry: &Path) -> Result<ExportAnalysis> {
        let mode = AnalyzerMode::for_package(pkg_name);
        debug!(pkg = pkg_name, ?mode, entry = %entry.display(), "Analyzing exports");

        let request = serde_json::to_vec(&AnalyzerRequest {
            workdir: &workdir.to_string_lossy(),
            entry: &entry.to_string_lossy(),
            mode,
        })
        .map_err(|e| CdnError::Analyzer(format!("{pkg_name}: {e}")))?;

        let mut child = Command::new(&self.bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CdnError::Analyzer(format!("{pkg_name}: spawn {}: {e}", self.bin)))?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin
            .write_all(&request)
            .await
            .map_err(|e| CdnError::Analyzer(format!("{pkg_name}: {e}")))?;
        drop(stdin);

        let output = match tokio::time::timeout(ANALYZE_TIMEOUT, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| CdnError::Analyzer(format!("{pkg_name}: {e}")))?,
            Err(_) => {
                // wait_with_output consumed the child; kill_on_drop already
                // reaped it when the future was dropped by the timeout.
                warn!(pkg = pkg_name, "Analyzer timed out");
                return Err(CdnError::Analyzer(format!(
                    "{pkg_name}: analyzer timed out after {}s",
                    ANALYZE_TIMEOUT.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CdnError::Analyzer(format!(
                "{pkg_name}: analyzer exited with {}: {stderr}",
                output.status
            )));
        }

        let reply: AnalyzerReply = serde_json::from_slice(&output.stdout)
            .map_err(|e| CdnError::Analyzer(format!("{pkg_name}: bad analyzer reply: {e}")))?;
        if let Some(error) = reply.error {
            return Err(CdnError::Analyzer(format!("{pkg_name}: {error}")));
        }
        Ok(reply.analysis)
    }
}
