//! Subprocess driver for the black-box bundler. The helper binary speaks
//! newline-delimited JSON on stdio: one build request down, resolve/load
//! callbacks up (answered in-line), one final `done` message with the output
//! files. The binary is interchangeable; only this protocol is fixed.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use esmcdn_common::{CdnError, Result};

use crate::bundler::{
    BundleOutput, BundleRequest, Bundler, BundlerMessage, ImportKind, LoadQuery, ModuleHost,
    OutputFile, OutputKind, ResolveAction, ResolveQuery, TransformRequest,
};

/// Whole-build ceiling; individual waits inherit it.
const BUNDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ProcessBundler {
    bin: String,
}

impl ProcessBundler {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum HelperMessage {
    Resolve {
        id: u64,
        specifier: String,
        importer: String,
        kind: ImportKind,
    },
    Load {
        id: u64,
        namespace: String,
        path: String,
    },
    Done {
        #[serde(default)]
        files: Vec<HelperFile>,
        #[serde(default)]
        warnings: Vec<BundlerMessage>,
        #[serde(default)]
        errors: Vec<BundlerMessage>,
    },
    TransformResult {
        code: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct HelperFile {
    path: String,
    /// File bytes, base64 so sourcemaps and css travel unharmed.
    contents: String,
    kind: OutputKind,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum HostReply<'a> {
    ResolveResult {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        external: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        namespace: Option<&'a str>,
    },
    LoadResult {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        contents: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        loader: Option<&'a str>,
    },
}

impl ProcessBundler {
    fn build_message(request: &BundleRequest) -> serde_json::Value {
        json!({
            "type": "build",
            "entry": request.entry.as_ref().map(|p| p.to_string_lossy()),
            "stdin": request.synthetic_entry.as_ref().map(|s| json!({
                "contents": s.contents,
                "resolveDir": s.resolve_dir.to_string_lossy(),
            })),
            "platform": request.platform,
            "target": request.target.as_str(),
            "minify": request.minify,
            "sourcemap": request.source_map,
            "keepNames": request.keep_names,
            "ignoreAnnotations": request.ignore_annotations,
            "conditions": request.conditions,
            "treeShakeExports": request.tree_shake_exports,
            "define": request.define,
            "jsxImportSource": request.jsx_import_source,
        })
    }
}

#[async_trait::async_trait]
impl Bundler for ProcessBundler {
    async fn bundle(
        &self,
        request: BundleRequest,
        host: Arc<dyn ModuleHost>,
    ) -> Result<BundleOutput> {
        let mut child = Command::new(&self.bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CdnError::Bundler(format!("spawn {}: {e}", self.bin)))?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        let opening = Self::build_message(&request);
        stdin
            .write_all(format!("{opening}\n").as_bytes())
            .await
            .map_err(|e| CdnError::Bundler(format!("bundler stdin: {e}")))?;

        let exchange = async {
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| CdnError::Bundler(format!("bundler stdout: {e}")))?
            {
                if line.trim().is_empty() {
                    continue;
                }
                let message: HelperMessage = serde_json::from_str(&line)
                    .map_err(|e| CdnError::Bundler(format!("bad bundler message: {e}: {line}")))?;
                match message {
                    HelperMessage::Resolve {
                        id,
                        specifier,
                        importer,
                        kind,
                    } => {
                        let action = host
                            .resolve(ResolveQuery {
                                specifier,
                                importer,
                                kind,
                            })
                            .await?;
                        let reply = match &action {
                            None => HostReply::ResolveResult {
                                id,
                                external: None,
                                path: None,
                                namespace: None,
                            },
                            Some(ResolveAction::External { path }) => HostReply::ResolveResult {
                                id,
                                external: Some(true),
                                path: Some(path),
                                namespace: None,
                            },
                            Some(ResolveAction::File { path, namespace }) => {
                                HostReply::ResolveResult {
                                    id,
                                    external: None,
                                    path: Some(path.to_str().unwrap_or_default()),
                                    namespace: namespace.as_deref(),
                                }
                            }
                            Some(ResolveAction::Virtual { namespace, path }) => {
                                HostReply::ResolveResult {
                                    id,
                                    external: None,
                                    path: Some(path),
                                    namespace: Some(namespace),
                                }
                            }
                        };
                        let line = serde_json::to_string(&reply).expect("reply serializes");
                        stdin
                            .write_all(format!("{line}\n").as_bytes())
                            .await
                            .map_err(|e| CdnError::Bundler(format!("bundler stdin: {e}")))?;
                    }
                    HelperMessage::Load { id, namespace, path } => {
                        let loaded = host.load(LoadQuery { namespace, path }).await?;
                        let loader = loaded.as_ref().map(|l| {
                            serde_json::to_value(l.loader)
                                .ok()
                                .and_then(|v| v.as_str().map(String::from))
                                .unwrap_or_else(|| "js".to_string())
                        });
                        let reply = HostReply::LoadResult {
                            id,
                            contents: loaded.as_ref().map(|l| l.contents.as_str()),
                            loader: loader.as_deref(),
                        };
                        let line = serde_json::to_string(&reply).expect("reply serializes");
                        stdin
                            .write_all(format!("{line}\n").as_bytes())
                            .await
                            .map_err(|e| CdnError::Bundler(format!("bundler stdin: {e}")))?;
                    }
                    HelperMessage::Done {
                        files,
                        warnings,
                        errors,
                    } => {
                        let mut output = BundleOutput {
                            files: Vec::with_capacity(files.len()),
                            warnings,
                            errors,
                        };
                        for file in files {
                            let contents = BASE64.decode(&file.contents).map_err(|e| {
                                CdnError::Bundler(format!("bad file payload {}: {e}", file.path))
                            })?;
                            output.files.push(OutputFile {
                                path: file.path,
                                contents,
                                kind: file.kind,
                            });
                        }
                        debug!(
                            files = output.files.len(),
                            warnings = output.warnings.len(),
                            errors = output.errors.len(),
                            "Bundle round-trip complete"
                        );
                        return Ok(output);
                    }
                    HelperMessage::Error { message } => {
                        return Err(CdnError::Bundler(message));
                    }
                    HelperMessage::TransformResult { .. } => {
                        return Err(CdnError::Bundler(
                            "unexpected transform result during build".into(),
                        ));
                    }
                }
            }
            Err(CdnError::Bundler("bundler exited without a result".into()))
        };

        match tokio::time::timeout(BUNDLE_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(CdnError::Bundler(format!(
                "bundler timed out after {}s",
                BUNDLE_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn transform(&self, request: TransformRequest) -> Result<String> {
        let mut child = Command::new(&self.bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CdnError::Bundler(format!("spawn {}: {e}", self.bin)))?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let message = json!({
            "type": "transform",
            "code": request.code,
            "loader": request.loader,
            "target": request.target.as_str(),
            "importMap": request.import_map,
        });
        stdin
            .write_all(format!("{message}\n").as_bytes())
            .await
            .map_err(|e| CdnError::Bundler(format!("bundler stdin: {e}")))?;
        drop(stdin);

        let output = tokio::time::timeout(Duration::from_secs(60), child.wait_with_output())
            .await
            .map_err(|_| CdnError::Bundler("transform timed out".into()))?
            .map_err(|e| CdnError::Bundler(format!("bundler: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CdnError::Bundler(format!("transform failed: {stderr}")));
        }

        let reply: HelperMessage = serde_json::from_slice(&output.stdout)
            .map_err(|e| CdnError::Bundler(format!("bad transform reply: {e}")))?;
        match reply {
            HelperMessage::TransformResult { code } => Ok(code),
            HelperMessage::Error { message } => Err(CdnError::Bundler(message)),
            _ => Err(CdnError::Bundler("unexpected transform reply".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_messages_parse() {
        let msg: HelperMessage = serde_json::from_str(
            r#"{"type":"resolve","id":1,"specifier":"react","importer":"/w/index.js","kind":"import-statement"}"#,
        )
        .unwrap();
        assert!(matches!(msg, HelperMessage::Resolve { id: 1, .. }));

        let msg: HelperMessage = serde_json::from_str(
            r#"{"type":"done","files":[{"path":"out.js","contents":"ZXhwb3J0IHt9","kind":"js"}]}"#,
        )
        .unwrap();
        match msg {
            HelperMessage::Done { files, .. } => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].kind, OutputKind::Js);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn replies_skip_absent_fields() {
        let reply = HostReply::ResolveResult {
            id: 7,
            external: Some(true),
            path: Some("__ESM_SH_EXTERNAL:react"),
            namespace: None,
        };
        let line = serde_json::to_string(&reply).unwrap();
        assert_eq!(
            line,
            r#"{"type":"resolve-result","id":7,"external":true,"path":"__ESM_SH_EXTERNAL:react"}"#
        );
    }
}
