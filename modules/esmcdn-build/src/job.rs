//! The build job: install, analyze, bundle, rewrite, persist. One job runs
//! per identity at a time (the queue guarantees it), so every write under
//! the identity's paths is unchallenged.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use esmcdn_analyze::{ExportAnalysis, ExportAnalyzer};
use esmcdn_common::{BuildResult, BundleMode, CdnError, Result, Target};
use esmcdn_identity::BuildIdentity;
use esmcdn_install::{InstalledPackage, Installer, PackageJson, WorkdirPurger};
use esmcdn_queue::{BuildRunner, StageTracker};
use esmcdn_registry::PackageResolver;
use esmcdn_storage::{KvStore, ObjectStore};

use crate::bundler::{
    BundleOutput, BundleRequest, Bundler, ImportKind, LoadQuery, LoadedSource, Loader, ModuleHost,
    Platform, ResolveAction, ResolveQuery, SyntheticEntry,
};
use crate::dts::{ensure_dts_extension, rewrite_dts, DtsRef};
use crate::polyfills::embedded_polyfill;
use crate::postprocess::{append_source_map_url, PostProcessor};
use crate::resolve::{split_specifier, BuildResolver};

/// Upper bound on resolve-miss rebuilds of one job.
const MAX_REBUILDS: usize = 3;

/// Receives identities of pinned sub-dependencies discovered during
/// post-processing. Submission must be asynchronous: two packages may
/// reference each other, so a job never waits on the builds it spawns.
pub trait SubBuildSink: Send + Sync {
    fn submit(&self, identity: BuildIdentity);
}

/// Everything a build job needs, wired once at startup.
pub struct BuildContext {
    pub resolver: Arc<PackageResolver>,
    pub installer: Arc<Installer>,
    pub analyzer: Arc<dyn ExportAnalyzer>,
    pub bundler: Arc<dyn Bundler>,
    pub storage: Arc<dyn ObjectStore>,
    pub kv: Arc<dyn KvStore>,
    pub purger: Arc<WorkdirPurger>,
    pub sub_builds: Arc<dyn SubBuildSink>,
    pub minify: bool,
    pub source_map: bool,
    pub deno_std: String,
}

pub struct Builder {
    ctx: BuildContext,
}

impl Builder {
    pub fn new(ctx: BuildContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }
}

#[async_trait]
impl BuildRunner for Builder {
    async fn run(&self, identity: &BuildIdentity, stage: StageTracker) -> Result<BuildResult> {
        let pkg = &identity.pkg;

        stage.set("resolving");
        let resolved = self
            .ctx
            .resolver
            .resolve(pkg.origin, &pkg.name, &pkg.version)
            .await?;

        stage.set("installing");
        let installed = self.ctx.installer.install(pkg, &resolved.meta).await?;
        self.ctx.purger.touch(&pkg.spec()).await;

        let entry = match find_entry_file(&installed, &pkg.sub_module) {
            Some(entry) => entry,
            None => {
                // Types-only packages have no runtime entry at all.
                if installed.package_json.types_entry().is_some() && pkg.sub_module.is_empty() {
                    stage.set("types");
                    let dts = self.mirror_types(identity, &installed).await?;
                    let result = BuildResult {
                        types_only: true,
                        dts,
                        ..Default::default()
                    };
                    self.ctx
                        .kv
                        .put(&identity.key(), serde_json::to_value(&result).map_err(anyhow::Error::from)?)
                        .await?;
                    return Ok(result);
                }
                return Err(CdnError::NotFound(format!(
                    "{}: no module entry for {:?}",
                    pkg.spec(),
                    pkg.sub_module
                )));
            }
        };

        stage.set("analyzing");
        let analysis = match self
            .ctx
            .analyzer
            .analyze(&pkg.name, &installed.workdir, &entry)
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                // A module the lexer cannot digest still has a default.
                warn!(pkg = %pkg.spec(), error = %e, "Export analysis failed, assuming default-only");
                ExportAnalysis {
                    is_esm: false,
                    named_exports: Vec::new(),
                    has_default_export: true,
                    reexport: None,
                }
            }
        };

        stage.set("bundling");
        let resolver = BuildResolver::new(
            identity.clone(),
            installed.clone(),
            self.ctx.installer.clone(),
            entry.clone(),
            identity
                .args
                .deno_std
                .clone()
                .unwrap_or_else(|| self.ctx.deno_std.clone()),
        );
        let request = self.bundle_request(identity, &installed, &entry, &analysis);
        let output = self.bundle_with_rebuilds(&request, &resolver).await?;

        stage.set("finalizing");
        let externals = resolver.externals();
        let analyses = self.collect_external_analyses(&installed, &externals).await;
        let post = PostProcessor {
            identity,
            host_pkg_json: &installed.package_json,
            externals: &externals,
            analyses: &analyses,
            deprecated: resolved.meta.deprecated.as_deref(),
        };

        let js = output
            .js()
            .ok_or_else(|| CdnError::Bundler(format!("{}: bundler emitted no JS", pkg.spec())))?;
        let js_text = String::from_utf8_lossy(&js.contents);
        let mut processed = post.process_js(&js_text)?;

        if identity.bundle_mode() == BundleMode::All {
            processed.code = self.inline_polyfills(identity, &processed.code).await?;
        }

        stage.set("writing");
        let mut result = BuildResult {
            deps: processed.dep_urls.clone(),
            has_default_export: analysis.has_default_export || analysis.is_esm,
            from_cjs: !analysis.is_esm,
            types_only: false,
            package_css: false,
            dts: None,
        };

        if self.ctx.source_map {
            if let Some(map) = output.source_map() {
                let map_name = format!(
                    "{}.map",
                    identity
                        .key()
                        .rsplit('/')
                        .next()
                        .unwrap_or("module")
                );
                append_source_map_url(&mut processed.code, &map_name);
                self.ctx
                    .storage
                    .write(&identity.artefact_path("map"), Bytes::from(map.contents.clone()))
                    .await?;
            }
        }

        if let Some(css) = output.css() {
            self.ctx
                .storage
                .write(&identity.artefact_path("css"), Bytes::from(css.contents.clone()))
                .await?;
            result.package_css = true;
        }

        self.ctx
            .storage
            .write(&identity.artefact_path("mjs"), Bytes::from(processed.code.into_bytes()))
            .await?;

        if !identity.args.no_dts {
            stage.set("types");
            result.dts = self.mirror_types(identity, &installed).await?;
        }

        self.ctx
            .kv
            .put(&identity.key(), serde_json::to_value(&result).map_err(anyhow::Error::from)?)
            .await?;

        // Pinned sub-dependencies build in the background; cycles are fine
        // because nothing here waits on them.
        let own_key = identity.key();
        let mut seen = HashSet::new();
        for sub in processed.sub_builds {
            let key = sub.key();
            if key != own_key && seen.insert(key) {
                self.ctx.sub_builds.submit(sub);
            }
        }

        info!(identity = %identity.key(), deps = result.deps.len(), "Artefacts stored");
        Ok(result)
    }
}

impl Builder {
    fn bundle_request(
        &self,
        identity: &BuildIdentity,
        installed: &InstalledPackage,
        entry: &Path,
        analysis: &ExportAnalysis,
    ) -> BundleRequest {
        let args = &identity.args;
        let platform = if identity.target == Target::Node {
            Platform::Node
        } else {
            Platform::Browser
        };
        let mut request = BundleRequest::new(platform, identity.target);
        request.minify = self.ctx.minify && !args.dev;
        request.source_map = self.ctx.source_map;
        request.keep_names = args.keep_names;
        request.ignore_annotations = args.ignore_annotations;
        request.conditions = args.conditions.iter().cloned().collect();
        request.tree_shake_exports = args.exports.iter().cloned().collect();
        request.define.insert(
            "process.env.NODE_ENV".to_string(),
            if args.dev {
                "\"development\"".to_string()
            } else {
                "\"production\"".to_string()
            },
        );
        request.jsx_import_source = args.jsx_runtime.as_ref().map(|p| format!("/{}", p.spec()));

        if analysis.is_esm {
            request.entry = Some(entry.to_path_buf());
        } else {
            request.synthetic_entry = Some(SyntheticEntry {
                contents: synthesize_entry(identity, analysis),
                resolve_dir: installed.workdir.clone(),
            });
        }
        request
    }

    /// Run the bundler, feeding resolve misses back as implicit externals
    /// and missing exports back as synthesized empty exports, bounded so a
    /// hostile graph cannot loop forever.
    async fn bundle_with_rebuilds(
        &self,
        request: &BundleRequest,
        resolver: &Arc<BuildResolver>,
    ) -> Result<BundleOutput> {
        let unresolved_re = Regex::new(r#"[Cc]ould not resolve "([^"]+)""#).expect("static regex");
        let missing_export_re = Regex::new(
            r#"[Nn]o matching export in "browser-exclude:([^"]+)" for import "([^"]+)""#,
        )
        .expect("static regex");

        let mut output = self
            .ctx
            .bundler
            .bundle(request.clone(), resolver.clone() as Arc<dyn ModuleHost>)
            .await?;

        for pass in 0..MAX_REBUILDS {
            if output.errors.is_empty() {
                return Ok(output);
            }
            let mut actionable = false;
            for error in &output.errors {
                if let Some(caps) = unresolved_re.captures(&error.text) {
                    debug!(specifier = &caps[1], pass, "Marking implicit external");
                    resolver.mark_implicit_external(&caps[1]);
                    actionable = true;
                } else if let Some(caps) = missing_export_re.captures(&error.text) {
                    debug!(module = &caps[1], export = &caps[2], pass, "Synthesizing empty export");
                    resolver.add_exclude_export(&caps[1], &caps[2]);
                    actionable = true;
                }
            }
            if !actionable {
                break;
            }
            output = self
                .ctx
                .bundler
                .bundle(request.clone(), resolver.clone() as Arc<dyn ModuleHost>)
                .await?;
        }

        if output.errors.is_empty() {
            return Ok(output);
        }
        let texts: Vec<&str> = output.errors.iter().map(|e| e.text.as_str()).collect();
        Err(CdnError::Bundler(texts.join("; ")))
    }

    /// Export shapes of externalized dependencies that are present in the
    /// working tree, for the require-lowering heuristic. Absent or
    /// unanalyzable dependencies stay unknown (fallback shape).
    async fn collect_external_analyses(
        &self,
        installed: &InstalledPackage,
        externals: &BTreeMap<String, crate::resolve::ExternalUsage>,
    ) -> BTreeMap<String, ExportAnalysis> {
        let mut analyses = BTreeMap::new();
        for (specifier, usage) in externals {
            if !usage.required {
                continue;
            }
            let (name, _) = split_specifier(specifier);
            let dep_root = installed.dependency_root(name);
            let Ok(pkg_json) = PackageJson::load(&dep_root).await else {
                continue;
            };
            let dep_installed = InstalledPackage {
                root: dep_root,
                workdir: installed.workdir.clone(),
                package_json: pkg_json,
            };
            let Some(entry) = find_entry_file(&dep_installed, "") else {
                continue;
            };
            match self
                .ctx
                .analyzer
                .analyze(name, &installed.workdir, &entry)
                .await
            {
                Ok(analysis) => {
                    analyses.insert(specifier.clone(), analysis);
                }
                Err(e) => {
                    debug!(dep = name, error = %e, "Dependency analysis unavailable");
                }
            }
        }
        analyses
    }

    /// The `bundleMode=all` second pass: inline the embedded polyfill
    /// modules into the rewritten output, leaving every other import
    /// external, so a standalone artefact has no CDN-internal imports left.
    async fn inline_polyfills(&self, identity: &BuildIdentity, code: &str) -> Result<String> {
        if !code.contains("/node/") {
            return Ok(code.to_string());
        }
        let mut request = BundleRequest::new(Platform::Browser, identity.target);
        request.minify = self.ctx.minify && !identity.args.dev;
        request.source_map = false;
        request.synthetic_entry = Some(SyntheticEntry {
            contents: code.to_string(),
            resolve_dir: PathBuf::from("/"),
        });
        let host: Arc<dyn ModuleHost> = Arc::new(PolyfillInliner);
        let output = self.ctx.bundler.bundle(request, host).await?;
        if !output.errors.is_empty() {
            let texts: Vec<&str> = output.errors.iter().map(|e| e.text.as_str()).collect();
            return Err(CdnError::Bundler(texts.join("; ")));
        }
        match output.js() {
            Some(js) => Ok(String::from_utf8_lossy(&js.contents).into_owned()),
            None => Ok(code.to_string()),
        }
    }

    /// Mirror the package's `.d.ts` tree into the types partition, breadth
    /// first over relative references, every reference rewritten to a CDN
    /// URL. Returns the storage path of the entry dts.
    async fn mirror_types(
        &self,
        identity: &BuildIdentity,
        installed: &InstalledPackage,
    ) -> Result<Option<String>> {
        let Some(types_entry) = installed.package_json.types_entry() else {
            return Ok(None);
        };
        let entry_rel = ensure_dts_extension(types_entry.trim_start_matches("./"));
        if !installed.root.join(&entry_rel).exists() {
            return Ok(None);
        }

        let mut queue = VecDeque::from([entry_rel.clone()]);
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(rel) = queue.pop_front() {
            if !visited.insert(rel.clone()) {
                continue;
            }
            let disk_path = installed.root.join(&rel);
            let source = match tokio::fs::read_to_string(&disk_path).await {
                Ok(s) => s,
                Err(_) => continue,
            };

            let base_dir = parent_dir(&rel);
            let mut referenced: Vec<String> = Vec::new();
            let rewritten = rewrite_dts(&source, |spec, kind| {
                self.map_dts_ref(identity, installed, &base_dir, spec, kind, &mut referenced)
            });

            self.ctx
                .storage
                .write(&identity.types_path(&rel), Bytes::from(rewritten.into_bytes()))
                .await?;
            queue.extend(referenced);
        }

        Ok(Some(identity.types_path(&entry_rel)))
    }

    /// Rewrite one dts reference; relative targets are also queued for the
    /// mirror walk via `referenced`.
    fn map_dts_ref(
        &self,
        identity: &BuildIdentity,
        installed: &InstalledPackage,
        base_dir: &str,
        spec: &str,
        kind: DtsRef,
        referenced: &mut Vec<String>,
    ) -> Option<String> {
        if spec.starts_with('.') {
            let joined = join_dts_path(base_dir, spec);
            let rel = ensure_dts_extension(&joined);
            referenced.push(rel.clone());
            return Some(format!("/{}", identity.types_path(&rel)));
        }

        // A bare name: the published types of the referenced dependency.
        let (name, sub) = split_specifier(spec);
        let lookup_name = if kind == DtsRef::ReferenceTypes && !name.starts_with('@') {
            format!("@types/{name}")
        } else {
            name.to_string()
        };
        let version = identity
            .args
            .dep_version(name)
            .map(|p| p.version.clone())
            .or_else(|| installed.package_json.dependencies.get(name).cloned())
            .or_else(|| installed.package_json.peer_dependencies.get(name).cloned())
            .unwrap_or_else(|| "latest".to_string());
        let tail = sub
            .map(|s| ensure_dts_extension(s))
            .unwrap_or_else(|| "index.d.ts".to_string());
        Some(format!(
            "/types/v{}/{lookup_name}@{version}/{tail}",
            identity.build_version
        ))
    }
}

/// Second-pass host: embedded polyfills inline, everything else external.
struct PolyfillInliner;

#[async_trait]
impl ModuleHost for PolyfillInliner {
    async fn resolve(&self, query: ResolveQuery) -> Result<Option<ResolveAction>> {
        if let Some(name) = query
            .specifier
            .strip_prefix("/node/")
            .and_then(|rest| rest.strip_suffix(".mjs"))
        {
            if embedded_polyfill(name).is_some() {
                return Ok(Some(ResolveAction::Virtual {
                    namespace: "embed".to_string(),
                    path: name.to_string(),
                }));
            }
        }
        if query.kind == ImportKind::Entry {
            return Ok(None);
        }
        Ok(Some(ResolveAction::External {
            path: query.specifier,
        }))
    }

    async fn load(&self, query: LoadQuery) -> Result<Option<LoadedSource>> {
        if query.namespace != "embed" {
            return Ok(None);
        }
        Ok(embedded_polyfill(&query.path).map(|contents| LoadedSource {
            contents: contents.to_string(),
            loader: Loader::Js,
        }))
    }
}

/// Synthesize the ESM facade of a CJS entry: named exports destructured
/// from the namespace, default preserved through the fallback form.
pub fn synthesize_entry(identity: &BuildIdentity, analysis: &ExportAnalysis) -> String {
    let pkg = &identity.pkg;
    let import_spec = if pkg.sub_module.is_empty() {
        pkg.name.clone()
    } else {
        format!("{}/{}", pkg.name, pkg.sub_module)
    };

    let mut named: Vec<&str> = analysis
        .named_exports
        .iter()
        .map(|s| s.as_str())
        .filter(|name| is_valid_identifier(name) && *name != "default")
        .collect();
    if !identity.args.exports.is_empty() {
        named.retain(|name| identity.args.exports.contains(*name));
    }

    let mut code = format!("import * as __module from \"{import_spec}\";\n");
    if !named.is_empty() {
        code.push_str(&format!(
            "export const {{ {} }} = __module;\n",
            named.join(", ")
        ));
    }
    if identity.target.supports_nullish_coalescing() {
        code.push_str("export default __module.default ?? __module;\n");
    } else {
        code.push_str(
            "export default __module.default !== void 0 ? __module.default : __module;\n",
        );
    }
    code
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Locate the entry file for a (sub-)module inside an installed package,
/// honoring the exports map before falling back to file guessing.
pub fn find_entry_file(installed: &InstalledPackage, sub_module: &str) -> Option<PathBuf> {
    let pkg_json = &installed.package_json;
    let root = &installed.root;

    if sub_module.is_empty() {
        if let Some(from_exports) = resolve_export_entry(pkg_json, ".") {
            let path = root.join(from_exports.trim_start_matches("./"));
            if path.is_file() {
                return Some(path);
            }
        }
        let declared = pkg_json
            .es_module_entry()
            .map(str::to_string)
            .unwrap_or_else(|| pkg_json.main_entry().to_string());
        return guess_file(root, declared.trim_start_matches("./"));
    }

    if let Some(from_exports) = resolve_export_entry(pkg_json, &format!("./{sub_module}")) {
        let path = root.join(from_exports.trim_start_matches("./"));
        if path.is_file() {
            return Some(path);
        }
    }
    guess_file(root, sub_module)
}

/// Resolve one exports-map key with the default browser/import conditions.
fn resolve_export_entry(pkg_json: &PackageJson, key: &str) -> Option<String> {
    let exports = pkg_json.exports.as_ref()?;
    match exports {
        Value::String(s) if key == "." => Some(s.clone()),
        Value::Object(map) => {
            if let Some(entry) = map.get(key) {
                return first_conditional_string(entry);
            }
            // A bare conditional object applies to the root key only.
            if key == "." && !map.keys().any(|k| k.starts_with('.')) {
                return first_conditional_string(exports);
            }
            None
        }
        _ => None,
    }
}

fn first_conditional_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            for key in ["browser", "import", "module", "default", "require"] {
                if let Some(nested) = map.get(key) {
                    if let Some(s) = first_conditional_string(nested) {
                        return Some(s);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn guess_file(root: &Path, stem: &str) -> Option<PathBuf> {
    let exact = root.join(stem);
    if exact.is_file() {
        return Some(exact);
    }
    for ext in ["js", "mjs", "cjs", "json"] {
        let candidate = root.join(format!("{stem}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    for index in ["index.js", "index.mjs", "index.cjs"] {
        let candidate = root.join(stem).join(index);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn parent_dir(rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

fn join_dts_path(base: &str, spec: &str) -> String {
    let mut parts: Vec<&str> = if base.is_empty() {
        Vec::new()
    } else {
        base.split('/').collect()
    };
    for seg in spec.split('/') {
        match seg {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::{BundlerMessage, OutputFile, OutputKind, TransformRequest};
    use esmcdn_common::{BuildArgs, Pkg, BUILD_VERSION};
    use esmcdn_queue::StageTracker;
    use esmcdn_registry::{Dist, RegistryClient, RegistryPackument, VersionMetadata};
    use esmcdn_storage::{MemoryKvStore, MemoryObjectStore};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn tarball(files: &[(&str, &str)]) -> Bytes {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("package/{path}"), contents.as_bytes())
                .unwrap();
        }
        let gz = builder.into_inner().unwrap();
        Bytes::from(gz.finish().unwrap())
    }

    struct FixtureRegistry {
        tarball: Bytes,
        deprecated: Option<String>,
    }

    #[async_trait]
    impl RegistryClient for FixtureRegistry {
        async fn packument(&self, name: &str) -> Result<RegistryPackument> {
            Err(CdnError::NotFound(name.to_string()))
        }

        async fn version_metadata(&self, name: &str, version: &str) -> Result<VersionMetadata> {
            Ok(VersionMetadata {
                name: name.to_string(),
                version: version.to_string(),
                dist: Dist {
                    tarball: "https://registry.test/pkg.tgz".into(),
                },
                deprecated: self.deprecated.clone(),
                ..Default::default()
            })
        }

        async fn tarball(&self, _meta: &VersionMetadata) -> Result<Bytes> {
            Ok(self.tarball.clone())
        }
    }

    struct FixtureAnalyzer {
        analysis: ExportAnalysis,
    }

    #[async_trait]
    impl ExportAnalyzer for FixtureAnalyzer {
        async fn analyze(
            &self,
            _pkg_name: &str,
            _workdir: &Path,
            _entry: &Path,
        ) -> Result<ExportAnalysis> {
            Ok(self.analysis.clone())
        }
    }

    /// Drives the host with a scripted import list and emits one JS file
    /// whose lines mirror the resolve outcomes.
    struct ScriptedBundler {
        imports: Vec<(String, ImportKind)>,
    }

    #[async_trait]
    impl Bundler for ScriptedBundler {
        async fn bundle(
            &self,
            request: BundleRequest,
            host: Arc<dyn ModuleHost>,
        ) -> Result<BundleOutput> {
            let mut lines = Vec::new();
            if let Some(entry) = &request.synthetic_entry {
                lines.push(format!("// entry {} bytes", entry.contents.len()));
            }
            for (spec, kind) in &self.imports {
                let action = host
                    .resolve(ResolveQuery {
                        specifier: spec.clone(),
                        importer: String::new(),
                        kind: *kind,
                    })
                    .await?;
                if let Some(ResolveAction::External { path }) = action {
                    if kind.is_require() {
                        lines.push(format!("var dep = require(\"{path}\");"));
                    } else {
                        lines.push(format!("import \"{path}\";"));
                    }
                }
            }
            lines.push("export default {};".to_string());
            Ok(BundleOutput {
                files: vec![
                    OutputFile {
                        path: "out.mjs".into(),
                        contents: lines.join("\n").into_bytes(),
                        kind: OutputKind::Js,
                    },
                    OutputFile {
                        path: "out.mjs.map".into(),
                        contents: b"{\"version\":3}".to_vec(),
                        kind: OutputKind::SourceMap,
                    },
                ],
                warnings: vec![BundlerMessage {
                    text: "benign".into(),
                    location: None,
                }],
                errors: vec![],
            })
        }

        async fn transform(&self, request: TransformRequest) -> Result<String> {
            Ok(request.code)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        submitted: StdMutex<Vec<String>>,
    }

    impl SubBuildSink for RecordingSink {
        fn submit(&self, identity: BuildIdentity) {
            self.submitted.lock().unwrap().push(identity.key());
        }
    }

    struct Fixture {
        builder: Arc<Builder>,
        storage: Arc<MemoryObjectStore>,
        kv: Arc<MemoryKvStore>,
        sink: Arc<RecordingSink>,
        _dir: tempfile::TempDir,
    }

    fn fixture(
        files: &[(&str, &str)],
        imports: Vec<(String, ImportKind)>,
        analysis: ExportAnalysis,
        deprecated: Option<String>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FixtureRegistry {
            tarball: tarball(files),
            deprecated,
        });
        let resolver = Arc::new(PackageResolver::new(registry.clone(), Duration::from_secs(60)));
        let installer = Arc::new(Installer::new(dir.path(), registry, resolver.clone()));
        let storage = Arc::new(MemoryObjectStore::new());
        let kv = Arc::new(MemoryKvStore::new());
        let sink = Arc::new(RecordingSink::default());
        let builder = Builder::new(BuildContext {
            resolver,
            installer,
            analyzer: Arc::new(FixtureAnalyzer { analysis }),
            bundler: Arc::new(ScriptedBundler { imports }),
            storage: storage.clone(),
            kv: kv.clone(),
            purger: WorkdirPurger::new(dir.path(), Duration::from_secs(3600)),
            sub_builds: sink.clone(),
            minify: true,
            source_map: true,
            deno_std: "0.177.0".into(),
        });
        Fixture {
            builder,
            storage,
            kv,
            sink,
            _dir: dir,
        }
    }

    fn cjs_analysis() -> ExportAnalysis {
        ExportAnalysis {
            is_esm: false,
            named_exports: vec!["useState".into(), "useEffect".into()],
            has_default_export: true,
            reexport: None,
        }
    }

    fn identity(args: BuildArgs) -> BuildIdentity {
        BuildIdentity::new(
            BUILD_VERSION,
            Pkg::new("react", "18.2.0"),
            args,
            Target::Es2022,
        )
    }

    fn react_files() -> Vec<(&'static str, &'static str)> {
        vec![
            (
                "package.json",
                r#"{"name":"react","version":"18.2.0","main":"index.js",
                    "dependencies":{"scheduler":"^0.23.0"}}"#,
            ),
            ("index.js", "module.exports = require('./cjs/react.js');"),
            ("cjs/react.js", "exports.useState = () => {};"),
        ]
    }

    #[tokio::test]
    async fn full_build_writes_artefact_map_and_metadata() {
        let f = fixture(
            &react_files(),
            vec![("scheduler".to_string(), ImportKind::ImportStatement)],
            cjs_analysis(),
            None,
        );
        let id = identity(BuildArgs::default());
        let result = f.builder.run(&id, StageTracker::default()).await.unwrap();

        assert!(result.from_cjs);
        assert!(result.has_default_export);
        assert_eq!(result.deps, vec!["/scheduler@%5E0.23.0?target=es2022"]);

        let js = f
            .storage
            .open("builds/v1/react@18.2.0/es2022/react.mjs")
            .await
            .unwrap();
        let js = String::from_utf8(js.to_vec()).unwrap();
        assert!(js.contains("import \"/scheduler@%5E0.23.0?target=es2022\";"), "{js}");
        assert!(js.contains("//# sourceMappingURL=react.map"), "{js}");
        assert!(f
            .storage
            .stat("builds/v1/react@18.2.0/es2022/react.map")
            .await
            .unwrap()
            .is_some());

        let record = f
            .kv
            .get("builds/v1/react@18.2.0/es2022/react")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["fromCJS"], serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn require_call_sites_get_lowered_imports() {
        let f = fixture(
            &react_files(),
            vec![("scheduler".to_string(), ImportKind::RequireCall)],
            cjs_analysis(),
            None,
        );
        let id = identity(BuildArgs::default());
        f.builder.run(&id, StageTracker::default()).await.unwrap();

        let js = f
            .storage
            .open("builds/v1/react@18.2.0/es2022/react.mjs")
            .await
            .unwrap();
        let js = String::from_utf8(js.to_vec()).unwrap();
        // scheduler is not installed in the tree, so its shape is unknown.
        assert!(js.contains("var dep = (__m0$$d ?? __m0$$ns);"), "{js}");
        assert!(js.contains("import __m0$$d from \"/scheduler@%5E0.23.0?target=es2022\";"), "{js}");
    }

    #[tokio::test]
    async fn pinned_deps_trigger_sub_builds() {
        let mut args = BuildArgs::default();
        args.deps.push(Pkg::new("scheduler", "0.23.0"));
        let f = fixture(
            &react_files(),
            vec![("scheduler".to_string(), ImportKind::ImportStatement)],
            cjs_analysis(),
            None,
        );
        let id = identity(args);
        let result = f.builder.run(&id, StageTracker::default()).await.unwrap();

        assert_eq!(
            result.deps,
            vec!["/v1/scheduler@0.23.0/es2022/scheduler.mjs"]
        );
        let submitted = f.sink.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].starts_with("builds/v1/scheduler@0.23.0/"), "{}", submitted[0]);
    }

    #[tokio::test]
    async fn deprecated_packages_warn_at_load() {
        let f = fixture(
            &react_files(),
            vec![],
            cjs_analysis(),
            Some("security hole, upgrade".into()),
        );
        let id = identity(BuildArgs::default());
        f.builder.run(&id, StageTracker::default()).await.unwrap();

        let js = f
            .storage
            .open("builds/v1/react@18.2.0/es2022/react.mjs")
            .await
            .unwrap();
        let js = String::from_utf8(js.to_vec()).unwrap();
        assert!(js.contains("console.warn"), "{js}");
        assert!(js.contains("security hole, upgrade"), "{js}");
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let f = fixture(
            &[("package.json", r#"{"name":"react","version":"18.2.0","main":"missing.js"}"#)],
            vec![],
            cjs_analysis(),
            None,
        );
        let id = identity(BuildArgs::default());
        let err = f.builder.run(&id, StageTracker::default()).await.unwrap_err();
        assert!(matches!(err, CdnError::NotFound(_)));
    }

    #[tokio::test]
    async fn types_only_package_skips_bundling() {
        let f = fixture(
            &[
                (
                    "package.json",
                    r#"{"name":"react","version":"18.2.0","types":"index.d.ts"}"#,
                ),
                ("index.d.ts", "export declare const version: string;\n"),
            ],
            vec![],
            cjs_analysis(),
            None,
        );
        let id = identity(BuildArgs::default());
        let result = f.builder.run(&id, StageTracker::default()).await.unwrap();
        assert!(result.types_only);
        assert_eq!(
            result.dts.as_deref(),
            Some("types/v1/react@18.2.0/index.d.ts")
        );
        assert!(f
            .storage
            .stat("types/v1/react@18.2.0/index.d.ts")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn dts_tree_is_mirrored_with_rewritten_refs() {
        let f = fixture(
            &[
                (
                    "package.json",
                    r#"{"name":"react","version":"18.2.0","main":"index.js","types":"index.d.ts"}"#,
                ),
                ("index.js", "module.exports = {};"),
                ("index.d.ts", "import { I } from './internal';\nexport declare const x: I;\n"),
                ("internal.d.ts", "export interface I { n: number }\n"),
            ],
            vec![],
            cjs_analysis(),
            None,
        );
        let id = identity(BuildArgs::default());
        let result = f.builder.run(&id, StageTracker::default()).await.unwrap();
        assert_eq!(
            result.dts.as_deref(),
            Some("types/v1/react@18.2.0/index.d.ts")
        );

        let entry = f
            .storage
            .open("types/v1/react@18.2.0/index.d.ts")
            .await
            .unwrap();
        let entry = String::from_utf8(entry.to_vec()).unwrap();
        assert!(
            entry.contains("from '/types/v1/react@18.2.0/internal.d.ts'"),
            "{entry}"
        );
        assert!(f
            .storage
            .stat("types/v1/react@18.2.0/internal.d.ts")
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn synthetic_entry_shapes() {
        let id = identity(BuildArgs::default());
        let code = synthesize_entry(&id, &cjs_analysis());
        assert!(code.contains("import * as __module from \"react\";"), "{code}");
        assert!(code.contains("export const { useEffect, useState } = __module;") ||
                code.contains("export const { useState, useEffect } = __module;"), "{code}");
        assert!(code.contains("export default __module.default ?? __module;"), "{code}");

        let legacy = BuildIdentity::new(
            BUILD_VERSION,
            Pkg::new("react", "18.2.0"),
            BuildArgs::default(),
            Target::Es2017,
        );
        let code = synthesize_entry(&legacy, &cjs_analysis());
        assert!(code.contains("__module.default !== void 0"), "{code}");
    }

    #[test]
    fn exports_filter_trims_the_facade() {
        let mut args = BuildArgs::default();
        args.exports.insert("useState".into());
        let id = identity(args);
        let code = synthesize_entry(&id, &cjs_analysis());
        assert!(code.contains("export const { useState } = __module;"), "{code}");
        assert!(!code.contains("useEffect"), "{code}");
    }
}
