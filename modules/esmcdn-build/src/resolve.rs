//! Import classification: the resolve/load plugin handed to the bundler.
//! Every import the bundler meets is classified and either inlined, routed
//! to a virtual module, or externalized behind a rewrite marker that the
//! post-processor later replaces with a canonical CDN URL.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;

use esmcdn_common::{BundleMode, CdnError, Result};
use esmcdn_identity::BuildIdentity;
use esmcdn_install::{BrowserEntry, InstalledPackage, Installer};

use crate::bundler::{
    ImportKind, LoadQuery, LoadedSource, Loader, ModuleHost, ResolveAction, ResolveQuery,
};
use crate::polyfills::{as_node_builtin, builtin_replacement, error_module_url};

/// Marker prefixing externalized specifiers in bundler output. Chosen so it
/// cannot collide with a legitimate identifier; located by byte scan during
/// post-processing.
pub const EXTERNAL_MARKER: &str = "__ESM_SH_EXTERNAL:";

/// Namespace of modules excluded by the package.json browser map.
pub const BROWSER_EXCLUDE_NS: &str = "browser-exclude";
/// Namespace of colocated wasm files, inlined as base64.
pub const WASM_NS: &str = "wasm";

/// How an externalized specifier was reached, for the import heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalUsage {
    pub imported: bool,
    pub required: bool,
}

pub struct BuildResolver {
    identity: BuildIdentity,
    installed: InstalledPackage,
    installer: Arc<Installer>,
    entry_file: PathBuf,
    deno_std: String,
    /// Specifier → usage kinds, collected for the post-processor.
    externals: StdMutex<BTreeMap<String, ExternalUsage>>,
    /// Bare specifiers the rebuild loop decided to externalize after a
    /// "could not resolve" report.
    implicit_external: StdMutex<BTreeSet<String>>,
    /// browser-exclude module → named exports synthesized after a
    /// "no matching export" report.
    exclude_exports: StdMutex<BTreeMap<String, BTreeSet<String>>>,
}

impl BuildResolver {
    pub fn new(
        identity: BuildIdentity,
        installed: InstalledPackage,
        installer: Arc<Installer>,
        entry_file: PathBuf,
        deno_std: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            installed,
            installer,
            entry_file,
            deno_std,
            externals: StdMutex::new(BTreeMap::new()),
            implicit_external: StdMutex::new(BTreeSet::new()),
            exclude_exports: StdMutex::new(BTreeMap::new()),
        })
    }

    /// Specifiers externalized during the build, with their usage kinds.
    pub fn externals(&self) -> BTreeMap<String, ExternalUsage> {
        self.externals.lock().expect("externals lock").clone()
    }

    /// Rebuild-loop hook: force `specifier` external on the next pass.
    pub fn mark_implicit_external(&self, specifier: &str) {
        self.implicit_external
            .lock()
            .expect("implicit lock")
            .insert(specifier.to_string());
    }

    /// Rebuild-loop hook: synthesize export `name` on an excluded module.
    pub fn add_exclude_export(&self, module: &str, name: &str) {
        self.exclude_exports
            .lock()
            .expect("exclude lock")
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string());
    }

    fn external(&self, specifier: &str, kind: ImportKind) -> ResolveAction {
        let mut externals = self.externals.lock().expect("externals lock");
        let usage = externals.entry(specifier.to_string()).or_default();
        if kind.is_require() {
            usage.required = true;
        } else {
            usage.imported = true;
        }
        ResolveAction::External {
            path: format!("{EXTERNAL_MARKER}{specifier}"),
        }
    }

    fn is_self_reference(&self, specifier: &str) -> bool {
        let name = &self.identity.pkg.name;
        specifier == name || specifier.starts_with(&format!("{name}/"))
    }

    /// Classify a bare (package) specifier.
    async fn resolve_bare(&self, specifier: &str, kind: ImportKind) -> Result<Option<ResolveAction>> {
        let args = &self.identity.args;
        let (dep_name, _sub) = split_specifier(specifier);

        // Self-references: the specifier naming this build's own entry
        // resolves to the analyzed entry file (the synthetic facade imports
        // it); every other path into the package is externalized with a
        // self URL so the artefacts share runtime identity.
        if self.is_self_reference(specifier) {
            let pkg = &self.identity.pkg;
            let own_entry = if pkg.sub_module.is_empty() {
                pkg.name.clone()
            } else {
                format!("{}/{}", pkg.name, pkg.sub_module)
            };
            if specifier == own_entry {
                return Ok(Some(ResolveAction::File {
                    path: self.entry_file.clone(),
                    namespace: None,
                }));
            }
            return Ok(Some(self.external(specifier, kind)));
        }

        if args.is_external(specifier)
            || self
                .implicit_external
                .lock()
                .expect("implicit lock")
                .contains(specifier)
        {
            return Ok(Some(self.external(specifier, kind)));
        }

        let pkg_json = &self.installed.package_json;
        let is_peer = pkg_json.peer_dependencies.contains_key(dep_name);

        if self.identity.bundle_mode() == BundleMode::All && !is_peer {
            // Inline: make sure the dependency exists on disk, then let the
            // bundler's own resolution walk into node_modules.
            let spec = args
                .dep_version(dep_name)
                .map(|p| p.version.clone())
                .or_else(|| pkg_json.dependencies.get(dep_name).cloned())
                .unwrap_or_default();
            self.installer
                .install_dependency(&self.installed, dep_name, &spec)
                .await?;
            return Ok(None);
        }

        Ok(Some(self.external(specifier, kind)))
    }

    /// Apply the package.json `imports` map to a `#`-prefixed specifier.
    fn resolve_imports_map(&self, specifier: &str) -> Option<String> {
        let imports = self.installed.package_json.imports.as_ref()?;
        let entry = imports.get(specifier)?;
        resolve_conditional(entry, &self.conditions())
    }

    fn conditions(&self) -> Vec<String> {
        let mut conditions: Vec<String> =
            self.identity.args.conditions.iter().cloned().collect();
        if self.identity.target.is_browser() {
            conditions.push("browser".to_string());
        } else {
            conditions.push("node".to_string());
        }
        conditions.push("import".to_string());
        conditions.push("module".to_string());
        conditions.push("default".to_string());
        conditions
    }
}

/// Pick the first matching condition branch out of a package.json
/// conditional-target value (string or nested object).
fn resolve_conditional(value: &serde_json::Value, conditions: &[String]) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                if conditions.iter().any(|c| c == key) || key == "default" {
                    if let Some(resolved) = resolve_conditional(nested, conditions) {
                        return Some(resolved);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

/// Split a bare specifier into package name and sub-path.
pub fn split_specifier(specifier: &str) -> (&str, Option<&str>) {
    let mut slash = specifier.match_indices('/');
    let boundary = if specifier.starts_with('@') {
        slash.nth(1).map(|(i, _)| i)
    } else {
        slash.next().map(|(i, _)| i)
    };
    match boundary {
        Some(i) => (&specifier[..i], Some(&specifier[i + 1..])),
        None => (specifier, None),
    }
}

#[async_trait]
impl ModuleHost for BuildResolver {
    async fn resolve(&self, query: ResolveQuery) -> Result<Option<ResolveAction>> {
        let specifier = query.specifier.as_str();
        debug!(specifier, kind = ?query.kind, "Resolving import");

        // Absolute URLs pass through untouched.
        if specifier.starts_with("data:")
            || specifier.starts_with("http:")
            || specifier.starts_with("https:")
        {
            return Ok(Some(ResolveAction::External {
                path: specifier.to_string(),
            }));
        }

        // Node built-ins, replaced per target.
        if let Some(builtin) = as_node_builtin(specifier) {
            if self.identity.args.external_require && query.kind.is_require() {
                return Ok(Some(self.external(specifier, query.kind)));
            }
            let replacement =
                builtin_replacement(builtin, self.identity.target, &self.deno_std)
                    .unwrap_or_else(|| {
                        error_module_url(
                            "unsupported-node-builtin-module",
                            builtin,
                            &self.identity.pkg.spec(),
                        )
                    });
            return Ok(Some(ResolveAction::External { path: replacement }));
        }

        // The package.json browser map (browser platforms only).
        if self.identity.target.is_browser() {
            if let Some(entry) = self.installed.package_json.browser_substitution(specifier) {
                match entry {
                    BrowserEntry::Exclude => {
                        return Ok(Some(ResolveAction::Virtual {
                            namespace: BROWSER_EXCLUDE_NS.to_string(),
                            path: specifier.to_string(),
                        }));
                    }
                    BrowserEntry::Replace(to) => {
                        if to.starts_with("./") || to.starts_with("../") {
                            return Ok(Some(ResolveAction::File {
                                path: self.installed.root.join(to.trim_start_matches("./")),
                                namespace: None,
                            }));
                        }
                        let replaced = to.clone();
                        return self.resolve_bare(&replaced, query.kind).await;
                    }
                }
            }
        }

        // `?alias` substitutions.
        if let Some(to) = self.identity.args.alias.get(specifier).cloned() {
            if to.starts_with("./") || to.starts_with("../") {
                return Ok(Some(ResolveAction::File {
                    path: self.installed.root.join(to.trim_start_matches("./")),
                    namespace: None,
                }));
            }
            return self.resolve_bare(&to, query.kind).await;
        }

        // package.json `imports` map.
        if specifier.starts_with('#') {
            if let Some(target) = self.resolve_imports_map(specifier) {
                if target.starts_with("./") || target.starts_with("../") {
                    return Ok(Some(ResolveAction::File {
                        path: self.installed.root.join(target.trim_start_matches("./")),
                        namespace: None,
                    }));
                }
                return self.resolve_bare(&target, query.kind).await;
            }
            return Ok(Some(ResolveAction::External {
                path: error_module_url("resolve", specifier, &self.identity.pkg.spec()),
            }));
        }

        // Relative imports stay inside the package.
        if specifier.starts_with("./") || specifier.starts_with("../") {
            if specifier.ends_with(".wasm") {
                let importer_dir = PathBuf::from(&query.importer)
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| self.installed.root.clone());
                return Ok(Some(ResolveAction::Virtual {
                    namespace: WASM_NS.to_string(),
                    path: importer_dir.join(specifier).to_string_lossy().into_owned(),
                }));
            }
            if self.identity.bundle_mode() == BundleMode::None
                && !query.importer.is_empty()
                && query.kind != ImportKind::Entry
            {
                // `bundle=false`: every own sub-module becomes its own
                // artefact, referenced through the package specifier form.
                let joined = join_relative(&self.installed, &query.importer, specifier);
                let spec = format!("{}/{}", self.identity.pkg.name, joined);
                return Ok(Some(self.external(&spec, query.kind)));
            }
            return Ok(None);
        }

        self.resolve_bare(specifier, query.kind).await
    }

    async fn load(&self, query: LoadQuery) -> Result<Option<LoadedSource>> {
        match query.namespace.as_str() {
            BROWSER_EXCLUDE_NS => {
                let mut contents = String::from("const $default = {};\nexport default $default;\n");
                let exports = self.exclude_exports.lock().expect("exclude lock");
                if let Some(names) = exports.get(&query.path) {
                    for name in names {
                        contents.push_str(&format!("export const {name} = undefined;\n"));
                    }
                }
                Ok(Some(LoadedSource {
                    contents,
                    loader: Loader::Js,
                }))
            }
            WASM_NS => {
                let bytes = tokio::fs::read(&query.path).await.map_err(|e| {
                    CdnError::Bundler(format!("wasm file {}: {e}", query.path))
                })?;
                let encoded = BASE64.encode(&bytes);
                let contents = format!(
                    "const wasmBytes = Uint8Array.from(atob(\"{encoded}\"), c => c.charCodeAt(0));\n\
                     export default new WebAssembly.Module(wasmBytes);\n"
                );
                Ok(Some(LoadedSource {
                    contents,
                    loader: Loader::Js,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Normalize `importer`-relative `specifier` into a package-relative path.
fn join_relative(installed: &InstalledPackage, importer: &str, specifier: &str) -> String {
    let importer_rel = PathBuf::from(importer)
        .strip_prefix(&installed.root)
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    let mut parts: Vec<String> = importer_rel
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    for seg in specifier.split('/') {
        match seg {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use esmcdn_common::{BuildArgs, Pkg, Target, BUILD_VERSION};
    use esmcdn_install::PackageJson;
    use esmcdn_registry::{
        PackageResolver, RegistryClient, RegistryPackument, VersionMetadata,
    };
    use std::time::Duration;

    struct NoRegistry;

    #[async_trait]
    impl RegistryClient for NoRegistry {
        async fn packument(&self, name: &str) -> Result<RegistryPackument> {
            Err(CdnError::NotFound(name.to_string()))
        }
        async fn version_metadata(&self, name: &str, _v: &str) -> Result<VersionMetadata> {
            Err(CdnError::NotFound(name.to_string()))
        }
        async fn tarball(&self, _meta: &VersionMetadata) -> Result<Bytes> {
            Err(CdnError::Upstream("no tarballs in tests".into()))
        }
    }

    fn resolver_with(
        pkg_json: serde_json::Value,
        args: BuildArgs,
        target: Target,
    ) -> (tempfile::TempDir, Arc<BuildResolver>) {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("swr@2.2.0");
        let root = workdir.join("node_modules/swr");
        std::fs::create_dir_all(&root).unwrap();

        let package_json: PackageJson = serde_json::from_value(pkg_json).unwrap();
        let installed = InstalledPackage {
            root: root.clone(),
            workdir,
            package_json,
        };
        let registry = Arc::new(NoRegistry);
        let installer = Arc::new(Installer::new(
            dir.path(),
            registry.clone(),
            Arc::new(PackageResolver::new(registry, Duration::from_secs(60))),
        ));
        let identity = BuildIdentity::new(BUILD_VERSION, Pkg::new("swr", "2.2.0"), args, target);
        let entry = root.join("index.js");
        let r = BuildResolver::new(identity, installed, installer, entry, "0.177.0".into());
        (dir, r)
    }

    fn query(specifier: &str, kind: ImportKind) -> ResolveQuery {
        ResolveQuery {
            specifier: specifier.to_string(),
            importer: String::new(),
            kind,
        }
    }

    fn base_pkg_json() -> serde_json::Value {
        serde_json::json!({
            "name": "swr",
            "version": "2.2.0",
            "main": "index.js",
            "dependencies": {"use-sync-external-store": "^1.2.0"},
            "peerDependencies": {"react": "^16.11.0 || ^17.0.0 || ^18.0.0"}
        })
    }

    #[tokio::test]
    async fn absolute_urls_stay_verbatim() {
        let (_d, r) = resolver_with(base_pkg_json(), BuildArgs::default(), Target::Es2022);
        let action = r
            .resolve(query("https://example.com/mod.js", ImportKind::ImportStatement))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            ResolveAction::External {
                path: "https://example.com/mod.js".to_string()
            }
        );
    }

    #[tokio::test]
    async fn builtins_polyfilled_on_browser_targets() {
        let (_d, r) = resolver_with(base_pkg_json(), BuildArgs::default(), Target::Es2022);
        let action = r
            .resolve(query("node:buffer", ImportKind::ImportStatement))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            ResolveAction::External {
                path: "/node/buffer.mjs".to_string()
            }
        );

        let action = r
            .resolve(query("child_process", ImportKind::ImportStatement))
            .await
            .unwrap()
            .unwrap();
        match action {
            ResolveAction::External { path } => {
                assert!(path.starts_with("/error.js?type=unsupported-node-builtin-module"), "{path}")
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dependencies_externalize_behind_the_marker() {
        let (_d, r) = resolver_with(base_pkg_json(), BuildArgs::default(), Target::Es2022);
        let action = r
            .resolve(query("use-sync-external-store/shim", ImportKind::ImportStatement))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            ResolveAction::External {
                path: format!("{EXTERNAL_MARKER}use-sync-external-store/shim")
            }
        );
        let externals = r.externals();
        assert!(externals["use-sync-external-store/shim"].imported);
        assert!(!externals["use-sync-external-store/shim"].required);
    }

    #[tokio::test]
    async fn require_usage_is_recorded() {
        let (_d, r) = resolver_with(base_pkg_json(), BuildArgs::default(), Target::Es2022);
        r.resolve(query("react", ImportKind::RequireCall)).await.unwrap();
        assert!(r.externals()["react"].required);
    }

    #[tokio::test]
    async fn browser_map_excludes_yield_virtual_modules() {
        let mut json = base_pkg_json();
        json["browser"] = serde_json::json!({"./lib/node-stream.js": false});
        let (_d, r) = resolver_with(json, BuildArgs::default(), Target::Es2022);
        let action = r
            .resolve(query("./lib/node-stream.js", ImportKind::ImportStatement))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            ResolveAction::Virtual {
                namespace: BROWSER_EXCLUDE_NS.to_string(),
                path: "./lib/node-stream.js".to_string()
            }
        );
    }

    #[tokio::test]
    async fn browser_map_is_skipped_on_node_target() {
        let mut json = base_pkg_json();
        json["browser"] = serde_json::json!({"./lib/node-stream.js": false});
        let (_d, r) = resolver_with(json, BuildArgs::default(), Target::Node);
        let action = r
            .resolve(query("./lib/node-stream.js", ImportKind::ImportStatement))
            .await
            .unwrap();
        assert_eq!(action, None);
    }

    #[tokio::test]
    async fn alias_substitutes_before_classification() {
        let mut args = BuildArgs::default();
        args.alias.insert("react".into(), "preact/compat".into());
        let (_d, r) = resolver_with(base_pkg_json(), args, Target::Es2022);
        let action = r
            .resolve(query("react", ImportKind::ImportStatement))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            ResolveAction::External {
                path: format!("{EXTERNAL_MARKER}preact/compat")
            }
        );
    }

    #[tokio::test]
    async fn self_reference_from_sub_entry_externalizes() {
        let pkg = Pkg::new("swr", "2.2.0").with_sub_path("infinite/index.js");
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("swr@2.2.0");
        let root = workdir.join("node_modules/swr");
        std::fs::create_dir_all(&root).unwrap();
        let installed = InstalledPackage {
            root: root.clone(),
            workdir,
            package_json: serde_json::from_value(base_pkg_json()).unwrap(),
        };
        let registry = Arc::new(NoRegistry);
        let installer = Arc::new(Installer::new(
            dir.path(),
            registry.clone(),
            Arc::new(PackageResolver::new(registry, Duration::from_secs(60))),
        ));
        let identity =
            BuildIdentity::new(BUILD_VERSION, pkg, BuildArgs::default(), Target::Es2022);
        let r = BuildResolver::new(
            identity,
            installed,
            installer,
            root.join("infinite/index.js"),
            "0.177.0".into(),
        );

        let action = r
            .resolve(query("swr", ImportKind::ImportStatement))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            ResolveAction::External {
                path: format!("{EXTERNAL_MARKER}swr")
            }
        );
    }

    #[tokio::test]
    async fn implicit_externals_apply_after_rebuild_marking() {
        let (_d, r) = resolver_with(base_pkg_json(), BuildArgs::default(), Target::Es2022);
        r.mark_implicit_external("mystery-dep");
        let action = r
            .resolve(query("mystery-dep", ImportKind::ImportStatement))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            ResolveAction::External {
                path: format!("{EXTERNAL_MARKER}mystery-dep")
            }
        );
    }

    #[tokio::test]
    async fn browser_exclude_load_carries_synthesized_exports() {
        let (_d, r) = resolver_with(base_pkg_json(), BuildArgs::default(), Target::Es2022);
        r.add_exclude_export("./lib/node-stream.js", "Readable");
        let source = r
            .load(LoadQuery {
                namespace: BROWSER_EXCLUDE_NS.to_string(),
                path: "./lib/node-stream.js".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert!(source.contents.contains("export default"));
        assert!(source.contents.contains("export const Readable = undefined;"));
    }

    #[tokio::test]
    async fn relative_imports_inline_by_default() {
        let (_d, r) = resolver_with(base_pkg_json(), BuildArgs::default(), Target::Es2022);
        let action = r
            .resolve(query("./util", ImportKind::ImportStatement))
            .await
            .unwrap();
        assert_eq!(action, None);
    }

    #[test]
    fn specifier_splitting() {
        assert_eq!(split_specifier("react"), ("react", None));
        assert_eq!(split_specifier("react/jsx-runtime"), ("react", Some("jsx-runtime")));
        assert_eq!(split_specifier("@babel/core"), ("@babel/core", None));
        assert_eq!(
            split_specifier("@babel/core/lib/parse"),
            ("@babel/core", Some("lib/parse"))
        );
    }
}
