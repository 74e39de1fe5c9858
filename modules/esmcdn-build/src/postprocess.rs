//! Output rewriting. The bundler leaves every externalized import behind a
//! `__ESM_SH_EXTERNAL:` marker string; this pass locates the markers by byte
//! scan, replaces each with a canonical CDN URL, lowers `require()` call
//! sites through the four-way import heuristic, and injects stubs for Node
//! globals that survived bundling.

use std::collections::BTreeMap;

use regex::Regex;

use esmcdn_analyze::ExportAnalysis;
use esmcdn_common::{CdnError, Pkg, Result, Target};
use esmcdn_identity::BuildIdentity;
use esmcdn_install::PackageJson;

use crate::resolve::{split_specifier, ExternalUsage, EXTERNAL_MARKER};

/// How a `require()` of an external is lowered, decided per specifier from
/// the dependency's export shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequireShape {
    /// Plain namespace: the module has no default export.
    Star,
    /// Namespace plus `__esModule: true`, so interop helpers pick `.default`.
    StarWrapped,
    /// The default export is the module object (CJS-built dependency).
    Default,
    /// Unknown shape: default when present, namespace otherwise.
    DefaultWithFallback,
}

/// Decide the require-lowering shape from what the analyzer knows about the
/// target module. Deterministic per specifier.
pub fn require_shape(analysis: Option<&ExportAnalysis>) -> RequireShape {
    match analysis {
        None => RequireShape::DefaultWithFallback,
        Some(a) if !a.is_esm => RequireShape::Default,
        Some(a) if a.has_default_export => RequireShape::StarWrapped,
        Some(_) => RequireShape::Star,
    }
}

pub struct PostProcessor<'a> {
    pub identity: &'a BuildIdentity,
    pub host_pkg_json: &'a PackageJson,
    pub externals: &'a BTreeMap<String, ExternalUsage>,
    /// Export analyses of externalized dependencies, keyed by specifier.
    pub analyses: &'a BTreeMap<String, ExportAnalysis>,
    pub deprecated: Option<&'a str>,
}

/// Result of post-processing one JS output file.
pub struct ProcessedJs {
    pub code: String,
    /// CDN URLs of every external import in the artefact.
    pub dep_urls: Vec<String>,
    /// Pinned sub-dependencies that should be built proactively.
    pub sub_builds: Vec<BuildIdentity>,
}

impl<'a> PostProcessor<'a> {
    /// Rewrite one bundler-emitted JS file.
    pub fn process_js(&self, raw: &str) -> Result<ProcessedJs> {
        let mut code = strip_shebang(raw).to_string();

        if matches!(self.identity.target, Target::Deno | Target::DenoNext) {
            // Those runtimes expose `window`; feature checks keyed on it
            // must look at `document` to mean "a browser".
            code = code.replace(
                "typeof window !== \"undefined\"",
                "typeof document !== \"undefined\"",
            );
        }

        let (mut code, bindings) = self.rewrite_markers(&code)?;

        let mut header = String::new();
        for binding in &bindings {
            header.push_str(&binding.import_statements);
        }
        header.push_str(&self.node_global_stubs(&mut code));

        if let Some(notice) = self.deprecated {
            let escaped = notice.replace('\\', "\\\\").replace('"', "\\\"");
            header.push_str(&format!(
                "console.warn(\"[esm.sh] {} is deprecated: {escaped}\");\n",
                self.identity.pkg.spec()
            ));
        }

        if !header.is_empty() {
            code = format!("{header}{code}");
        }

        let mut dep_urls: Vec<String> = bindings.iter().map(|b| b.url.clone()).collect();
        dep_urls.sort();
        dep_urls.dedup();

        let sub_builds = bindings.iter().filter_map(|b| b.sub_build.clone()).collect();

        Ok(ProcessedJs {
            code,
            dep_urls,
            sub_builds,
        })
    }

    /// Scan for marker strings and substitute URLs. Require call sites are
    /// replaced by a bound identifier; import positions keep their syntax
    /// and get only the URL.
    fn rewrite_markers(&self, code: &str) -> Result<(String, Vec<MarkerBinding>)> {
        let mut out = String::with_capacity(code.len());
        let mut bindings: BTreeMap<String, MarkerBinding> = BTreeMap::new();
        let bytes = code.as_bytes();
        let mut pos = 0;

        while let Some(found) = code[pos..].find(EXTERNAL_MARKER) {
            let marker_start = pos + found;
            // The marker only counts inside a bundler-emitted string literal.
            let Some(quote) = marker_start
                .checked_sub(1)
                .map(|i| bytes[i])
                .filter(|q| *q == b'"' || *q == b'\'')
            else {
                out.push_str(&code[pos..marker_start + EXTERNAL_MARKER.len()]);
                pos = marker_start + EXTERNAL_MARKER.len();
                continue;
            };
            let spec_start = marker_start + EXTERNAL_MARKER.len();
            let Some(spec_len) = code[spec_start..].find(quote as char) else {
                return Err(CdnError::Bundler("unterminated external marker".into()));
            };
            let specifier = &code[spec_start..spec_start + spec_len];
            let string_end = spec_start + spec_len + 1;

            let binding = match bindings.get(specifier) {
                Some(existing) => existing.clone(),
                None => {
                    let index = bindings.len();
                    let binding = self.bind_external(specifier, index)?;
                    bindings.insert(specifier.to_string(), binding.clone());
                    binding
                }
            };

            // Call-site detection: `require("MARKER")` (or a bundler-renamed
            // `__require`). The identifier and parens are replaced wholesale.
            let quote_start = marker_start - 1;
            if !binding.require_expr.is_empty() {
                if let Some(call_start) = require_call_start(code, quote_start) {
                    if bytes.get(string_end).copied() == Some(b')') {
                        out.push_str(&code[pos..call_start]);
                        out.push_str(&binding.require_expr);
                        pos = string_end + 1;
                        continue;
                    }
                }
            }

            // Import position: swap the marker payload for the URL.
            out.push_str(&code[pos..quote_start + 1]);
            out.push_str(&binding.url);
            out.push(quote as char);
            pos = string_end;
        }
        out.push_str(&code[pos..]);

        Ok((out, bindings.into_values().collect()))
    }

    /// Build the URL, import statements, and require expression for one
    /// externalized specifier.
    fn bind_external(&self, specifier: &str, index: usize) -> Result<MarkerBinding> {
        let (url, sub_build) = self.external_url(specifier);
        let usage = self.externals.get(specifier).copied().unwrap_or_default();

        if !usage.required {
            return Ok(MarkerBinding {
                url,
                import_statements: String::new(),
                require_expr: String::new(),
                sub_build,
            });
        }

        let ident = format!("__m{index}$");
        let shape = require_shape(self.analyses.get(specifier));
        let (imports, expr) = match shape {
            RequireShape::Default => (
                format!("import {ident} from \"{url}\";\n"),
                ident.clone(),
            ),
            RequireShape::Star => (
                format!("import * as {ident} from \"{url}\";\n"),
                ident.clone(),
            ),
            RequireShape::StarWrapped => (
                format!(
                    "import * as {ident}$ns from \"{url}\";\nconst {ident} = Object.assign({{ __esModule: true }}, {ident}$ns);\n"
                ),
                ident.clone(),
            ),
            RequireShape::DefaultWithFallback => {
                let fallback = if self.identity.target.supports_nullish_coalescing() {
                    format!("{ident}$d ?? {ident}$ns")
                } else {
                    format!("{ident}$d !== void 0 ? {ident}$d : {ident}$ns")
                };
                (
                    format!(
                        "import {ident}$d from \"{url}\";\nimport * as {ident}$ns from \"{url}\";\n"
                    ),
                    format!("({fallback})"),
                )
            }
        };

        Ok(MarkerBinding {
            url,
            import_statements: imports,
            require_expr: expr,
            sub_build,
        })
    }

    /// Canonical CDN URL for an externalized specifier, plus the sub-build
    /// identity when the reference is fully pinned.
    fn external_url(&self, specifier: &str) -> (String, Option<BuildIdentity>) {
        // Already a URL (node:, https:, /node/… polyfills, error modules).
        if specifier.contains(':') || specifier.starts_with('/') {
            return (specifier.to_string(), None);
        }

        let (name, sub) = split_specifier(specifier);

        // Self-reference: the package's own main-entry artefact.
        if name == self.identity.pkg.name {
            let mut pkg = Pkg::new(name, self.identity.pkg.version.clone());
            pkg.origin = self.identity.pkg.origin;
            if let Some(sub) = sub {
                pkg = pkg.with_sub_path(sub);
            }
            let id = BuildIdentity::new(
                self.identity.build_version,
                pkg,
                self.forwarded_args(name),
                self.identity.target,
            );
            return (id.url_path(), Some(id));
        }

        // Pinned by `?deps`: full immutable artefact URL plus a sub-build.
        if let Some(pin) = self.identity.args.dep_version(name) {
            let mut pkg = Pkg::new(name, pin.version.clone());
            if let Some(sub) = sub {
                pkg = pkg.with_sub_path(sub);
            }
            let id = BuildIdentity::new(
                self.identity.build_version,
                pkg,
                self.forwarded_args(name),
                self.identity.target,
            );
            return (id.url_path(), Some(id));
        }

        // Git dependency declared in package.json: a code-host URL.
        if let Some(value) = self.host_pkg_json.dependencies.get(name) {
            if let Some((repo, git_ref)) = parse_git_dependency(value) {
                let mut url = format!("/gh/{repo}@{git_ref}");
                if let Some(sub) = sub {
                    url.push('/');
                    url.push_str(sub);
                }
                return (self.with_forward_query(url, name), None);
            }
        }

        // Range from the host's dependency tables, `latest` otherwise.
        let range = self
            .host_pkg_json
            .dependencies
            .get(name)
            .or_else(|| self.host_pkg_json.peer_dependencies.get(name))
            .cloned();
        let mut url = match range {
            Some(range) => format!("/{name}@{}", encode_range(&range)),
            None => format!("/{name}"),
        };
        if let Some(sub) = sub {
            url.push('/');
            url.push_str(sub);
        }
        (self.with_forward_query(url, name), None)
    }

    /// Args forwarded onto a dependency's URL (the dependency itself is
    /// removed from pin/external lists).
    fn forwarded_args(&self, dep_name: &str) -> esmcdn_common::BuildArgs {
        let args = &self.identity.args;
        let mut forwarded = esmcdn_common::BuildArgs::default();
        forwarded.alias = args.alias.clone();
        forwarded.deps = args.deps.iter().filter(|d| d.name != dep_name).cloned().collect();
        forwarded.external = args.external.iter().filter(|e| *e != dep_name).cloned().collect();
        forwarded.external_all = args.external_all;
        forwarded.conditions = args.conditions.clone();
        forwarded.dev = args.dev;
        forwarded
    }

    fn with_forward_query(&self, mut url: String, dep_name: &str) -> String {
        let args = self.forwarded_args(dep_name);
        let mut query: Vec<String> = Vec::new();
        query.push(format!("target={}", self.identity.target.as_str()));
        if args.dev {
            query.push("dev".to_string());
        }
        if !args.alias.is_empty() {
            let pairs: Vec<String> = args.alias.iter().map(|(f, t)| format!("{f}:{t}")).collect();
            query.push(format!("alias={}", pairs.join(",")));
        }
        if !args.deps.is_empty() {
            let pins: Vec<String> = args.deps.iter().map(|d| d.spec()).collect();
            query.push(format!("deps={}", pins.join(",")));
        }
        if args.external_all {
            query.push("external=*".to_string());
        } else if !args.external.is_empty() {
            let list: Vec<String> = args.external.iter().cloned().collect();
            query.push(format!("external={}", list.join(",")));
        }
        if !args.conditions.is_empty() {
            let list: Vec<String> = args.conditions.iter().cloned().collect();
            query.push(format!("conditions={}", list.join(",")));
        }
        url.push('?');
        url.push_str(&query.join("&"));
        url
    }

    /// Prepend polyfill imports for Node globals still referenced by the
    /// bundled output; `require.resolve` is rewritten in place.
    fn node_global_stubs(&self, code: &mut String) -> String {
        if !self.identity.target.is_browser() {
            return String::new();
        }
        let mut header = String::new();

        if code.contains("require.resolve(") {
            header.push_str("import __rResolve$ from \"/node/require_resolve.mjs\";\n");
            *code = code.replace("require.resolve(", "__rResolve$(");
        }

        let process_re = Regex::new(r"\bprocess\.").expect("static regex");
        if process_re.is_match(code) {
            header.push_str(
                "import __Process$ from \"/node/process.mjs\";\nconst process = __Process$;\n",
            );
        }
        let buffer_re = Regex::new(r"\bBuffer[.(]").expect("static regex");
        if buffer_re.is_match(code) {
            header.push_str(
                "import { Buffer as __Buffer$ } from \"/node/buffer.mjs\";\nconst Buffer = __Buffer$;\n",
            );
        }
        let global_re = Regex::new(r"\bglobal\.").expect("static regex");
        if global_re.is_match(code) {
            header.push_str(
                "import __global$ from \"/node/global.mjs\";\nconst global = __global$;\n",
            );
        }
        let set_immediate_re = Regex::new(r"\bsetImmediate\(").expect("static regex");
        if set_immediate_re.is_match(code) {
            header.push_str(
                "import __setImmediate$ from \"/node/setimmediate.mjs\";\nconst setImmediate = __setImmediate$;\n",
            );
        }
        header
    }
}

#[derive(Debug, Clone)]
struct MarkerBinding {
    url: String,
    import_statements: String,
    require_expr: String,
    sub_build: Option<BuildIdentity>,
}

/// When the quoted marker at `quote_start` sits inside `require(...)`, the
/// byte offset where the call's identifier begins. Looks back over
/// whitespace, one `(`, and an identifier ending in `require`.
fn require_call_start(code: &str, quote_start: usize) -> Option<usize> {
    let bytes = code.as_bytes();
    let mut i = quote_start;
    while i > 0 && (bytes[i - 1] as char).is_whitespace() {
        i -= 1;
    }
    if i == 0 || bytes[i - 1] != b'(' {
        return None;
    }
    i -= 1;
    let ident_end = i;
    while i > 0 {
        let c = bytes[i - 1] as char;
        if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
            i -= 1;
        } else {
            break;
        }
    }
    let ident = &code[i..ident_end];
    if ident.ends_with("require") {
        Some(i)
    } else {
        None
    }
}

/// Strip a leading `#!…` line.
pub fn strip_shebang(code: &str) -> &str {
    if let Some(rest) = code.strip_prefix("#!") {
        match rest.find('\n') {
            Some(nl) => &rest[nl + 1..],
            None => "",
        }
    } else {
        code
    }
}

/// Append the sourcemap pointer comment.
pub fn append_source_map_url(code: &mut String, map_filename: &str) {
    if !code.ends_with('\n') {
        code.push('\n');
    }
    code.push_str(&format!("//# sourceMappingURL={map_filename}\n"));
}

/// Recognize git dependency values (`git+https://…`, `git://…`,
/// `github:owner/repo#ref`, `owner/repo#ref` shorthand).
pub fn parse_git_dependency(value: &str) -> Option<(String, String)> {
    let (body, git_ref) = match value.split_once('#') {
        Some((b, r)) => (b, r.to_string()),
        None => (value, String::new()),
    };

    let repo = if let Some(rest) = body.strip_prefix("github:") {
        rest.to_string()
    } else if body.starts_with("git+") || body.starts_with("git://") {
        let trimmed = body.trim_start_matches("git+");
        let url = trimmed
            .strip_prefix("https://github.com/")
            .or_else(|| trimmed.strip_prefix("ssh://git@github.com/"))
            .or_else(|| trimmed.strip_prefix("git://github.com/"))?;
        url.trim_end_matches(".git").to_string()
    } else {
        return None;
    };

    let git_ref = if git_ref.is_empty() { "HEAD".to_string() } else { git_ref };
    Some((repo, git_ref))
}

/// Percent-encode the range operators that cannot ride in a URL path.
fn encode_range(range: &str) -> String {
    range
        .replace('^', "%5E")
        .replace('~', "%7E")
        .replace(' ', "%20")
        .replace(">=", "%3E%3D")
        .replace("<=", "%3C%3D")
}

#[cfg(test)]
mod tests {
    use super::*;
    use esmcdn_common::{BuildArgs, BundleMode, Target, BUILD_VERSION};

    fn identity(args: BuildArgs, target: Target) -> BuildIdentity {
        BuildIdentity::new(BUILD_VERSION, Pkg::new("swr", "2.2.0"), args, target)
    }

    fn pkg_json() -> PackageJson {
        serde_json::from_value(serde_json::json!({
            "name": "swr",
            "version": "2.2.0",
            "dependencies": {
                "use-sync-external-store": "^1.2.0",
                "gitdep": "github:owner/repo#v2"
            },
            "peerDependencies": {"react": "^18.0.0"}
        }))
        .unwrap()
    }

    fn processor<'a>(
        id: &'a BuildIdentity,
        json: &'a PackageJson,
        externals: &'a BTreeMap<String, ExternalUsage>,
        analyses: &'a BTreeMap<String, ExportAnalysis>,
    ) -> PostProcessor<'a> {
        PostProcessor {
            identity: id,
            host_pkg_json: json,
            externals,
            analyses,
            deprecated: None,
        }
    }

    fn imported(spec: &str) -> (String, ExternalUsage) {
        (
            spec.to_string(),
            ExternalUsage {
                imported: true,
                required: false,
            },
        )
    }

    fn required(spec: &str) -> (String, ExternalUsage) {
        (
            spec.to_string(),
            ExternalUsage {
                imported: false,
                required: true,
            },
        )
    }

    #[test]
    fn import_marker_becomes_range_url() {
        let id = identity(BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::from([imported("react")]);
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"import e from"__ESM_SH_EXTERNAL:react";export{e};"#)
            .unwrap();
        assert_eq!(
            out.code,
            r#"import e from"/react@%5E18.0.0?target=es2022";export{e};"#
        );
        assert_eq!(out.dep_urls, vec!["/react@%5E18.0.0?target=es2022"]);
        assert!(out.sub_builds.is_empty());
    }

    #[test]
    fn pinned_dep_gets_full_artefact_url_and_sub_build() {
        let mut args = BuildArgs::default();
        args.deps.push(Pkg::new("react", "18.2.0"));
        let id = identity(args, Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::from([imported("react")]);
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"import e from"__ESM_SH_EXTERNAL:react";"#)
            .unwrap();
        assert!(
            out.code.contains("\"/v1/react@18.2.0/es2022/react.mjs\""),
            "{}",
            out.code
        );
        assert_eq!(out.sub_builds.len(), 1);
        assert_eq!(out.sub_builds[0].pkg.version, "18.2.0");
    }

    #[test]
    fn require_of_cjs_dep_lowers_to_default_import() {
        let id = identity(BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::from([required("react")]);
        let analyses = BTreeMap::from([(
            "react".to_string(),
            ExportAnalysis {
                is_esm: false,
                has_default_export: true,
                named_exports: vec!["useState".into()],
                reexport: None,
            },
        )]);
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"var r=require("__ESM_SH_EXTERNAL:react");r.useState();"#)
            .unwrap();
        assert!(out.code.starts_with("import __m0$ from \"/react@%5E18.0.0?target=es2022\";\n"));
        assert!(out.code.contains("var r=__m0$;"), "{}", out.code);
    }

    #[test]
    fn require_of_unknown_dep_uses_default_with_fallback() {
        let id = identity(BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::from([required("mystery")]);
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"const m=require("__ESM_SH_EXTERNAL:mystery");"#)
            .unwrap();
        assert!(out.code.contains("const m=(__m0$$d ?? __m0$$ns);"), "{}", out.code);
    }

    #[test]
    fn legacy_targets_avoid_nullish_coalescing() {
        let id = identity(BuildArgs::default(), Target::Es2015);
        let json = pkg_json();
        let externals = BTreeMap::from([required("mystery")]);
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"const m=require("__ESM_SH_EXTERNAL:mystery");"#)
            .unwrap();
        assert!(
            out.code.contains("__m0$$d !== void 0 ? __m0$$d : __m0$$ns"),
            "{}",
            out.code
        );
    }

    #[test]
    fn esm_with_default_wraps_namespace() {
        let id = identity(BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::from([required("esm-dep")]);
        let analyses = BTreeMap::from([(
            "esm-dep".to_string(),
            ExportAnalysis {
                is_esm: true,
                has_default_export: true,
                named_exports: vec![],
                reexport: None,
            },
        )]);
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"const m=require("__ESM_SH_EXTERNAL:esm-dep");"#)
            .unwrap();
        assert!(out.code.contains("__esModule: true"), "{}", out.code);
    }

    #[test]
    fn git_dependencies_route_to_the_code_host() {
        let id = identity(BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::from([imported("gitdep")]);
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"import g from"__ESM_SH_EXTERNAL:gitdep";"#)
            .unwrap();
        assert!(
            out.code.contains("\"/gh/owner/repo@v2?target=es2022\""),
            "{}",
            out.code
        );
    }

    #[test]
    fn shebang_stripped_and_markers_outside_strings_untouched() {
        let id = identity(BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::new();
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p.process_js("#!/usr/bin/env node\nconst x = 1;\n").unwrap();
        assert_eq!(out.code, "const x = 1;\n");
    }

    #[test]
    fn node_globals_get_stub_imports_on_browser_targets() {
        let id = identity(BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::new();
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js("if(process.env.NODE_ENV==='production'){}Buffer.from('x');")
            .unwrap();
        assert!(out.code.contains("import __Process$ from \"/node/process.mjs\""));
        assert!(out.code.contains("import { Buffer as __Buffer$ }"));

        // Node target keeps its real globals.
        let id = identity(BuildArgs::default(), Target::Node);
        let p = processor(&id, &json, &externals, &analyses);
        let out = p.process_js("process.cwd();").unwrap();
        assert!(!out.code.contains("/node/process.mjs"));
    }

    #[test]
    fn deno_targets_swap_window_checks() {
        let id = identity(BuildArgs::default(), Target::DenoNext);
        let json = pkg_json();
        let externals = BTreeMap::new();
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js("const isBrowser = typeof window !== \"undefined\";")
            .unwrap();
        assert!(out.code.contains("typeof document !== \"undefined\""));
    }

    #[test]
    fn deprecation_notice_prepends_console_warn() {
        let id = identity(BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::new();
        let analyses = BTreeMap::new();
        let mut p = processor(&id, &json, &externals, &analyses);
        p.deprecated = Some("use swr@3 instead");

        let out = p.process_js("export default 1;").unwrap();
        assert!(out.code.starts_with("console.warn("), "{}", out.code);
        assert!(out.code.contains("use swr@3 instead"));
    }

    #[test]
    fn self_reference_points_at_main_entry_artefact() {
        let pkg = Pkg::new("swr", "2.2.0").with_sub_path("infinite/index.js");
        let id = BuildIdentity::new(BUILD_VERSION, pkg, BuildArgs::default(), Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::from([imported("swr")]);
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"export*from"__ESM_SH_EXTERNAL:swr";"#)
            .unwrap();
        assert!(
            out.code.contains("\"/v1/swr@2.2.0/es2022/swr.mjs\""),
            "{}",
            out.code
        );
    }

    #[test]
    fn git_dependency_parsing_forms() {
        assert_eq!(
            parse_git_dependency("github:owner/repo#v2"),
            Some(("owner/repo".into(), "v2".into()))
        );
        assert_eq!(
            parse_git_dependency("git+https://github.com/owner/repo.git#abc1234"),
            Some(("owner/repo".into(), "abc1234".into()))
        );
        assert_eq!(
            parse_git_dependency("git://github.com/owner/repo.git"),
            Some(("owner/repo".into(), "HEAD".into()))
        );
        assert_eq!(parse_git_dependency("^1.2.3"), None);
    }

    #[test]
    fn bundle_mode_rides_on_forwarded_identity() {
        // `?bundle` on the host must not leak onto dependency URLs.
        let mut args = BuildArgs::default();
        args.bundle_mode = BundleMode::All;
        args.deps.push(Pkg::new("react", "18.2.0"));
        let id = identity(args, Target::Es2022);
        let json = pkg_json();
        let externals = BTreeMap::from([imported("react")]);
        let analyses = BTreeMap::new();
        let p = processor(&id, &json, &externals, &analyses);

        let out = p
            .process_js(r#"import e from"__ESM_SH_EXTERNAL:react";"#)
            .unwrap();
        assert!(
            out.code.contains("\"/v1/react@18.2.0/es2022/react.mjs\""),
            "{}",
            out.code
        );
    }
}
