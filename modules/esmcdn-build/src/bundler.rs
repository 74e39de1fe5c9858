//! The bundler collaborator interface. The underlying JS/TS bundler is a
//! black box exposing `build(options) -> {files, warnings, errors}` plus
//! resolve/load hooks; everything the pipeline knows about it lives here.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use esmcdn_common::{Result, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Browser,
    Node,
}

/// Why the bundler is asking to resolve a specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportKind {
    Entry,
    ImportStatement,
    DynamicImport,
    RequireCall,
}

impl ImportKind {
    pub fn is_require(&self) -> bool {
        matches!(self, ImportKind::RequireCall)
    }
}

/// A resolve-hook invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveQuery {
    pub specifier: String,
    /// Absolute path of the importing file ("" for the entry itself).
    pub importer: String,
    pub kind: ImportKind,
}

/// What the resolve hook tells the bundler to do with a specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveAction {
    /// Keep the import unresolved; the emitted code references `path`.
    External { path: String },
    /// Resolve to a file on disk, optionally tagging a load namespace.
    File { path: PathBuf, namespace: Option<String> },
    /// A virtual module served by the load hook.
    Virtual { namespace: String, path: String },
}

/// A load-hook invocation for a namespaced virtual module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadQuery {
    pub namespace: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Loader {
    Js,
    Jsx,
    Ts,
    Tsx,
    Css,
    Json,
    Text,
    Binary,
}

#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub contents: String,
    pub loader: Loader,
}

/// The pipeline side of the plugin hooks: classification and virtual-module
/// synthesis live here, behind the bundler's back.
#[async_trait]
pub trait ModuleHost: Send + Sync {
    /// `None` lets the bundler fall back to its default resolution.
    async fn resolve(&self, query: ResolveQuery) -> Result<Option<ResolveAction>>;

    async fn load(&self, query: LoadQuery) -> Result<Option<LoadedSource>>;
}

/// A synthetic in-memory entry module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticEntry {
    pub contents: String,
    /// Directory import resolution starts from.
    pub resolve_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BundleRequest {
    /// Entry file on disk, unless a synthetic entry is given.
    pub entry: Option<PathBuf>,
    pub synthetic_entry: Option<SyntheticEntry>,
    pub platform: Platform,
    pub target: Target,
    pub minify: bool,
    pub source_map: bool,
    pub keep_names: bool,
    pub ignore_annotations: bool,
    pub conditions: Vec<String>,
    /// Named exports to keep; empty means no export-level tree-shaking.
    pub tree_shake_exports: Vec<String>,
    /// Compile-time constant substitutions.
    pub define: BTreeMap<String, String>,
    /// Import source for the automatic JSX runtime.
    pub jsx_import_source: Option<String>,
}

impl BundleRequest {
    pub fn new(platform: Platform, target: Target) -> Self {
        Self {
            entry: None,
            synthetic_entry: None,
            platform,
            target,
            minify: true,
            source_map: true,
            keep_names: false,
            ignore_annotations: false,
            conditions: Vec::new(),
            tree_shake_exports: Vec::new(),
            define: BTreeMap::new(),
            jsx_import_source: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Js,
    Css,
    SourceMap,
}

#[derive(Debug, Clone)]
pub struct OutputFile {
    pub path: String,
    pub contents: Vec<u8>,
    pub kind: OutputKind,
}

/// A diagnostic from the bundler, kept as text plus an optional location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlerMessage {
    pub text: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BundleOutput {
    pub files: Vec<OutputFile>,
    pub warnings: Vec<BundlerMessage>,
    pub errors: Vec<BundlerMessage>,
}

impl BundleOutput {
    pub fn js(&self) -> Option<&OutputFile> {
        self.files.iter().find(|f| f.kind == OutputKind::Js)
    }

    pub fn css(&self) -> Option<&OutputFile> {
        self.files.iter().find(|f| f.kind == OutputKind::Css)
    }

    pub fn source_map(&self) -> Option<&OutputFile> {
        self.files.iter().find(|f| f.kind == OutputKind::SourceMap)
    }
}

/// One-shot code transform (the `/transform` endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRequest {
    pub code: String,
    pub loader: Loader,
    pub target: Target,
    /// Import-map JSON applied to bare specifiers, verbatim.
    #[serde(default)]
    pub import_map: Option<serde_json::Value>,
}

/// The black-box bundler.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, request: BundleRequest, host: Arc<dyn ModuleHost>)
        -> Result<BundleOutput>;

    async fn transform(&self, request: TransformRequest) -> Result<String>;
}
