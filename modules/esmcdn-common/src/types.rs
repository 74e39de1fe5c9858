use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer version of the build pipeline itself. Bumping it namespaces a
/// fresh artefact tree; URLs under older versions keep resolving from storage.
pub const BUILD_VERSION: u32 = 1;

/// Where a package's sources come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PkgOrigin {
    Registry,
    CodeHost,
    UserUploaded,
}

impl PkgOrigin {
    /// Path segment prefixing code-host package names (`gh/owner/repo`).
    pub fn name_prefix(&self) -> &'static str {
        match self {
            PkgOrigin::CodeHost => "gh/",
            _ => "",
        }
    }
}

/// A fully pinned package plus the requested path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pkg {
    /// Registry identifier, possibly scoped (`@scope/name`); for the
    /// code-host origin this is `owner/repo`.
    pub name: String,
    /// Resolved version. Strict `major.minor.patch[+tail]` for registry
    /// packages, a full or abbreviated commit / tag for code-host packages.
    pub version: String,
    /// Path of a raw file within the package, normalized, no leading slash.
    pub sub_path: String,
    /// `sub_path` minus a known module extension; the build entry point.
    pub sub_module: String,
    pub origin: PkgOrigin,
}

const MODULE_EXTENSIONS: &[&str] = &[
    ".mjs", ".cjs", ".js", ".jsx", ".mts", ".cts", ".ts", ".tsx",
];

impl Pkg {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            sub_path: String::new(),
            sub_module: String::new(),
            origin: PkgOrigin::Registry,
        }
    }

    pub fn with_sub_path(mut self, sub_path: &str) -> Self {
        let normalized = normalize_sub_path(sub_path);
        self.sub_module = strip_module_extension(&normalized);
        self.sub_path = normalized;
        self
    }

    pub fn is_scoped(&self) -> bool {
        self.name.starts_with('@')
    }

    /// `name@version`, with the `gh/` prefix for code-host packages.
    pub fn spec(&self) -> String {
        format!("{}{}@{}", self.origin.name_prefix(), self.name, self.version)
    }

    /// Parse `name@version` / `@scope/name@version` (no sub-path).
    pub fn from_spec(spec: &str) -> Option<Self> {
        let at = if let Some(rest) = spec.strip_prefix('@') {
            rest.find('@').map(|i| i + 1)?
        } else {
            spec.find('@')?
        };
        let (name, version) = (&spec[..at], &spec[at + 1..]);
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(Pkg::new(name, version))
    }
}

impl fmt::Display for Pkg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec())?;
        if !self.sub_path.is_empty() {
            write!(f, "/{}", self.sub_path)?;
        }
        Ok(())
    }
}

/// Collapse `.` and reject-by-dropping `..` segments; no leading slash.
pub fn normalize_sub_path(raw: &str) -> String {
    raw.split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Strip one known js/ts extension, turning a raw file path into the bare
/// module name used as the build entry point. `.d.ts` files keep their name.
pub fn strip_module_extension(path: &str) -> String {
    if path.ends_with(".d.ts") || path.ends_with(".d.mts") {
        return path.to_string();
    }
    for ext in MODULE_EXTENSIONS {
        if let Some(stem) = path.strip_suffix(ext) {
            return stem.to_string();
        }
    }
    path.to_string()
}

/// True when the string is a strict, fully pinned `major.minor.patch[+tail]`.
pub fn is_exact_version(v: &str) -> bool {
    let v = v.split('+').next().unwrap_or(v);
    semver::Version::parse(v).is_ok()
}

/// True when the string looks like an abbreviated or full git commit hash.
pub fn is_commitish(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Compilation target for an artefact; one directory segment in its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Es2015,
    Es2016,
    Es2017,
    Es2018,
    Es2019,
    Es2020,
    Es2021,
    Es2022,
    EsNext,
    Deno,
    DenoNext,
    Node,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Es2015 => "es2015",
            Target::Es2016 => "es2016",
            Target::Es2017 => "es2017",
            Target::Es2018 => "es2018",
            Target::Es2019 => "es2019",
            Target::Es2020 => "es2020",
            Target::Es2021 => "es2021",
            Target::Es2022 => "es2022",
            Target::EsNext => "esnext",
            Target::Deno => "deno",
            Target::DenoNext => "denonext",
            Target::Node => "node",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "es2015" => Target::Es2015,
            "es2016" => Target::Es2016,
            "es2017" => Target::Es2017,
            "es2018" => Target::Es2018,
            "es2019" => Target::Es2019,
            "es2020" => Target::Es2020,
            "es2021" => Target::Es2021,
            "es2022" => Target::Es2022,
            "esnext" => Target::EsNext,
            "deno" => Target::Deno,
            "denonext" => Target::DenoNext,
            "node" => Target::Node,
            _ => return None,
        })
    }

    /// Browser-platform targets get polyfilled Node built-ins; the rest map
    /// built-ins to runtime-native modules.
    pub fn is_browser(&self) -> bool {
        !matches!(self, Target::Deno | Target::DenoNext | Target::Node)
    }

    /// Whether the runtime understands `??` and optional chaining, which
    /// changes the shape of generated default-export fallbacks.
    pub fn supports_nullish_coalescing(&self) -> bool {
        !matches!(
            self,
            Target::Es2015 | Target::Es2016 | Target::Es2017 | Target::Es2018 | Target::Es2019
        )
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How aggressively dependencies are inlined into one artefact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleMode {
    /// Inline the package's own modules, externalize dependencies.
    #[default]
    Default,
    /// Inline everything except peer dependencies and explicit externals.
    All,
    /// Externalize every import, including the package's own sub-modules.
    None,
}

/// Side-channel build modifiers carried in the URL query / args prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArgs {
    /// Source specifier → replacement specifier.
    pub alias: BTreeMap<String, String>,
    /// Pins for transitive imports, sorted by package name.
    pub deps: Vec<Pkg>,
    /// Specifiers never inlined. Ignored when `external_all` is set.
    pub external: BTreeSet<String>,
    /// `external=*`: externalize every unresolved import.
    pub external_all: bool,
    /// Named exports to keep when tree-shaking a CJS-to-ESM conversion.
    pub exports: BTreeSet<String>,
    /// package.json export conditions.
    pub conditions: BTreeSet<String>,
    /// JSX runtime package, when transforming JSX sources.
    pub jsx_runtime: Option<Pkg>,
    /// std-lib version pin for the `deno` target's built-in shims.
    pub deno_std: Option<String>,
    pub dev: bool,
    pub keep_names: bool,
    pub ignore_annotations: bool,
    pub external_require: bool,
    pub bundle_mode: BundleMode,
    pub worker: bool,
    pub no_dts: bool,
}

impl BuildArgs {
    /// Canonicalize for a given package: sort deps, drop self-pins and unit
    /// aliases, and force `react-dom`'s `react` pin to react-dom's version.
    pub fn normalize(&mut self, pkg: &Pkg) {
        self.alias.retain(|from, to| from != to);
        self.deps.retain(|d| d.name != pkg.name);
        if pkg.name == "react-dom" {
            self.deps.retain(|d| d.name != "react");
            self.deps.push(Pkg::new("react", pkg.version.clone()));
        }
        self.deps.sort_by(|a, b| a.name.cmp(&b.name));
        self.deps.dedup_by(|a, b| a.name == b.name);
        if self.external_all {
            self.external.clear();
        }
    }

    /// A pinned version for `name`, when `?deps` carries one.
    pub fn dep_version(&self, name: &str) -> Option<&Pkg> {
        self.deps.iter().find(|d| d.name == name)
    }

    pub fn is_external(&self, specifier: &str) -> bool {
        if self.external_all {
            return true;
        }
        self.external.contains(specifier)
            || specifier
                .split('/')
                .next()
                .map(|head| self.external.contains(head))
                .unwrap_or(false)
    }
}

/// Metadata stored alongside a finished artefact, keyed by its identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    /// External CDN URLs the artefact imports.
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(rename = "hasDefaultExport", default)]
    pub has_default_export: bool,
    #[serde(rename = "fromCJS", default)]
    pub from_cjs: bool,
    /// Package ships only type definitions; there is no runtime artefact.
    #[serde(rename = "typesOnly", default)]
    pub types_only: bool,
    /// A sibling `.css` artefact exists.
    #[serde(rename = "packageCSS", default)]
    pub package_css: bool,
    /// CDN-relative path of the companion type-definition artefact.
    #[serde(default)]
    pub dts: Option<String>,
}
