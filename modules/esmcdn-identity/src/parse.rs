//! Request-path and query parsing. Turns the accepted URL shapes into a
//! `ModulePath` plus `QueryOptions`; the router decides what to do with them.

use percent_encoding::percent_decode_str;

use esmcdn_common::{BuildArgs, BundleMode, CdnError, Pkg, PkgOrigin, Result, Target};

/// A parsed module request path, before version resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePath {
    pub origin: PkgOrigin,
    pub name: String,
    /// Raw version spec: exact, range, tag, commitish, or empty for latest.
    pub version_spec: String,
    /// Everything after the version segment, unparsed. May still contain an
    /// args prefix and target segment (see [`parse_target_segment`]).
    pub sub_path: String,
    /// `/*name` form: externalize every unresolved import.
    pub external_all: bool,
    /// Explicit `/vN/` prefix, when present.
    pub build_version: Option<u32>,
    /// `/stable/` prefix: pinned build-version semantics without a number.
    pub stable: bool,
}

/// Parse any of the accepted module path shapes.
///
/// `/react`, `/react@18.2.0/jsx-runtime`, `/@babel/core@^7.0.0`,
/// `/gh/owner/repo@ref/file`, `/jsr/@std/encoding@1.0.0`, `/*react`,
/// `/v1/react@18.2.0/es2022/react.mjs`, `/stable/react@18.2.0`.
pub fn parse_module_path(path: &str) -> Result<ModulePath> {
    let mut segments = path
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .peekable();

    let mut build_version = None;
    let mut stable = false;
    match segments.peek() {
        Some(&seg) if seg == "stable" => {
            stable = true;
            segments.next();
        }
        Some(&seg) if is_build_version_segment(seg) => {
            build_version = seg[1..].parse::<u32>().ok();
            segments.next();
        }
        _ => {}
    }

    let mut origin = PkgOrigin::Registry;
    let mut jsr = false;
    match segments.peek() {
        Some(&"gh") => {
            origin = PkgOrigin::CodeHost;
            segments.next();
        }
        Some(&"jsr") => {
            jsr = true;
            segments.next();
        }
        _ => {}
    }

    let mut head = segments
        .next()
        .ok_or_else(|| CdnError::InvalidRequest(format!("invalid path: {path}")))?
        .to_string();

    let mut external_all = false;
    if let Some(rest) = head.strip_prefix('*') {
        external_all = true;
        head = rest.to_string();
    }

    // Scoped names and code-host names span two segments.
    let qualified = if head.starts_with('@') || origin == PkgOrigin::CodeHost {
        let second = segments
            .next()
            .ok_or_else(|| CdnError::InvalidRequest(format!("invalid path: {path}")))?;
        format!("{head}/{second}")
    } else {
        head
    };

    let (mut name, version_spec) = split_name_version(&qualified)?;
    if jsr {
        let scoped = name
            .strip_prefix('@')
            .ok_or_else(|| CdnError::InvalidRequest(format!("invalid jsr name: {name}")))?;
        let (scope, bare) = scoped
            .split_once('/')
            .ok_or_else(|| CdnError::InvalidRequest(format!("invalid jsr name: {name}")))?;
        name = format!("@jsr/{scope}__{bare}");
    }
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(CdnError::InvalidRequest(format!("invalid package name: {name}")));
    }

    let sub_path = segments.collect::<Vec<_>>().join("/");

    Ok(ModulePath {
        origin,
        name,
        version_spec,
        sub_path,
        external_all,
        build_version,
        stable,
    })
}

fn is_build_version_segment(seg: &str) -> bool {
    seg.len() > 1 && seg.starts_with('v') && seg[1..].chars().all(|c| c.is_ascii_digit())
}

/// Split `name@spec` honoring the leading `@` of scoped names; the spec part
/// is percent-decoded so `%5E7.0.0` arrives as `^7.0.0`.
fn split_name_version(qualified: &str) -> Result<(String, String)> {
    let at = if let Some(rest) = qualified.strip_prefix('@') {
        rest.find('@').map(|i| i + 1)
    } else {
        qualified.find('@')
    };
    match at {
        Some(i) => {
            let name = qualified[..i].to_string();
            let spec = percent_decode_str(&qualified[i + 1..])
                .decode_utf8()
                .map_err(|_| {
                    CdnError::InvalidRequest(format!("invalid version spec in {qualified}"))
                })?
                .to_string();
            if spec.is_empty() {
                return Err(CdnError::InvalidRequest(format!(
                    "empty version spec in {qualified}"
                )));
            }
            Ok((name, spec))
        }
        None => Ok((qualified.to_string(), String::new())),
    }
}

/// The tail of a canonical artefact URL:
/// `[X-<args>/]<target>/<module>[.development][.bundle|.nobundle].<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSegment {
    pub args_prefix: Option<String>,
    pub target: Target,
    /// Module path inside the package, extension stripped.
    pub module: String,
    pub dev: bool,
    /// `Some(All)` for `.bundle`, `Some(None)` for `.nobundle`.
    pub bundle_mode: Option<BundleMode>,
    pub ext: String,
}

const ARTEFACT_EXTENSIONS: &[&str] = &["mjs", "js", "css", "map"];

/// Recognize the target-segment form inside a request's sub-path. Returns
/// `None` when the sub-path is an ordinary file path into the package.
pub fn parse_target_segment(sub_path: &str) -> Option<TargetSegment> {
    let mut parts = sub_path.split('/').peekable();

    let args_prefix = match parts.peek() {
        Some(seg) if seg.starts_with("X-") && seg.len() > 2 => {
            Some(parts.next().unwrap().to_string())
        }
        _ => None,
    };

    let target = Target::parse(parts.peek()?)?;
    parts.next();

    let file = parts.collect::<Vec<_>>().join("/");
    if file.is_empty() {
        return None;
    }

    let (stem, ext) = file.rsplit_once('.')?;
    if !ARTEFACT_EXTENSIONS.contains(&ext) {
        return None;
    }

    let mut module = stem.to_string();
    let mut bundle_mode = None;
    if let Some(m) = module.strip_suffix(".bundle") {
        bundle_mode = Some(BundleMode::All);
        module = m.to_string();
    } else if let Some(m) = module.strip_suffix(".nobundle") {
        bundle_mode = Some(BundleMode::None);
        module = m.to_string();
    }
    let mut dev = false;
    if let Some(m) = module.strip_suffix(".development") {
        dev = true;
        module = m.to_string();
    }
    if module.is_empty() {
        return None;
    }

    Some(TargetSegment {
        args_prefix,
        target,
        module,
        dev,
        bundle_mode,
        ext: ext.to_string(),
    })
}

/// Build-affecting query options, decoded from the URL query pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub args: BuildArgs,
    pub target: Option<Target>,
    /// `?css`: serve the artefact's sibling CSS file.
    pub css: bool,
    /// `?raw`: serve the source file untransformed.
    pub raw: bool,
    /// `?pin=vN`: force a prior build-version namespace.
    pub pin: Option<u32>,
    /// `?path=/sub`: sub-path supplied by query instead of path.
    pub sub_path: Option<String>,
}

/// Decode query pairs. Unknown keys are ignored (CDN URLs travel with cache
/// busters); malformed values for known keys are rejected.
pub fn parse_query(pairs: &[(String, String)]) -> Result<QueryOptions> {
    let mut opts = QueryOptions::default();

    for (key, value) in pairs {
        match key.as_str() {
            "target" => {
                let target = Target::parse(value).ok_or_else(|| {
                    CdnError::InvalidRequest(format!("unknown target: {value}"))
                })?;
                opts.target = Some(target);
            }
            "dev" => opts.args.dev = flag_value(value),
            "worker" => opts.args.worker = flag_value(value),
            "keep-names" => opts.args.keep_names = flag_value(value),
            "ignore-annotations" => opts.args.ignore_annotations = flag_value(value),
            "external-require" => opts.args.external_require = flag_value(value),
            "css" => opts.css = flag_value(value),
            "raw" => opts.raw = flag_value(value),
            "no-dts" | "no-check" => opts.args.no_dts = flag_value(value),
            "bundle" | "bundle-deps" | "standalone" => {
                opts.args.bundle_mode = if flag_value(value) {
                    BundleMode::All
                } else {
                    BundleMode::None
                };
            }
            "no-bundle" => {
                if flag_value(value) {
                    opts.args.bundle_mode = BundleMode::None;
                }
            }
            "alias" => {
                for pair in value.split(',').filter(|s| !s.is_empty()) {
                    let (from, to) = pair.split_once(':').ok_or_else(|| {
                        CdnError::InvalidRequest(format!("bad alias: {pair}"))
                    })?;
                    opts.args.alias.insert(from.to_string(), to.to_string());
                }
            }
            "deps" => {
                for spec in value.split(',').filter(|s| !s.is_empty()) {
                    let dep = Pkg::from_spec(spec).ok_or_else(|| {
                        CdnError::InvalidRequest(format!("bad deps pin: {spec}"))
                    })?;
                    opts.args.deps.push(dep);
                }
            }
            "external" => {
                for name in value.split(',').filter(|s| !s.is_empty()) {
                    if name == "*" {
                        opts.args.external_all = true;
                    } else {
                        opts.args.external.insert(name.to_string());
                    }
                }
            }
            "exports" => {
                opts.args
                    .exports
                    .extend(value.split(',').filter(|s| !s.is_empty()).map(String::from));
            }
            "conditions" => {
                opts.args
                    .conditions
                    .extend(value.split(',').filter(|s| !s.is_empty()).map(String::from));
            }
            "path" => {
                opts.sub_path = Some(value.trim_start_matches('/').to_string());
            }
            "jsx-runtime" => {
                let pkg = Pkg::from_spec(value).ok_or_else(|| {
                    CdnError::InvalidRequest(format!("bad jsx-runtime: {value}"))
                })?;
                opts.args.jsx_runtime = Some(pkg);
            }
            "pin" => {
                let n = value
                    .strip_prefix('v')
                    .and_then(|v| v.parse::<u32>().ok())
                    .ok_or_else(|| CdnError::InvalidRequest(format!("bad pin: {value}")))?;
                opts.pin = Some(n);
            }
            "deno-std" => opts.args.deno_std = Some(value.clone()),
            _ => {}
        }
    }

    Ok(opts)
}

/// A bare flag (`?dev`) counts as true; `?dev=false` / `?dev=0` as false.
fn flag_value(value: &str) -> bool {
    !matches!(value, "false" | "0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_package() {
        let p = parse_module_path("/react").unwrap();
        assert_eq!(p.name, "react");
        assert_eq!(p.version_spec, "");
        assert_eq!(p.sub_path, "");
        assert_eq!(p.origin, PkgOrigin::Registry);
    }

    #[test]
    fn versioned_package_with_sub_path() {
        let p = parse_module_path("/react@18.2.0/jsx-runtime").unwrap();
        assert_eq!(p.name, "react");
        assert_eq!(p.version_spec, "18.2.0");
        assert_eq!(p.sub_path, "jsx-runtime");
    }

    #[test]
    fn scoped_package() {
        let p = parse_module_path("/@babel/core@7.21.0/lib/index.js").unwrap();
        assert_eq!(p.name, "@babel/core");
        assert_eq!(p.version_spec, "7.21.0");
        assert_eq!(p.sub_path, "lib/index.js");
    }

    #[test]
    fn percent_encoded_caret() {
        let p = parse_module_path("/react@%5E18.2.0").unwrap();
        assert_eq!(p.version_spec, "^18.2.0");
    }

    #[test]
    fn code_host_package() {
        let p = parse_module_path("/gh/microsoft/fluentui-emoji@main/assets/x.svg").unwrap();
        assert_eq!(p.origin, PkgOrigin::CodeHost);
        assert_eq!(p.name, "microsoft/fluentui-emoji");
        assert_eq!(p.version_spec, "main");
        assert_eq!(p.sub_path, "assets/x.svg");
    }

    #[test]
    fn jsr_package_maps_to_registry_alias() {
        let p = parse_module_path("/jsr/@std/encoding@1.0.0/base64").unwrap();
        assert_eq!(p.origin, PkgOrigin::Registry);
        assert_eq!(p.name, "@jsr/std__encoding");
        assert_eq!(p.version_spec, "1.0.0");
        assert_eq!(p.sub_path, "base64");
    }

    #[test]
    fn star_prefix_externalizes_everything() {
        let p = parse_module_path("/*react@18.2.0").unwrap();
        assert!(p.external_all);
        assert_eq!(p.name, "react");

        let p = parse_module_path("/gh/*owner/repo@abc1234").unwrap();
        assert!(p.external_all);
        assert_eq!(p.name, "owner/repo");
    }

    #[test]
    fn build_version_prefixes() {
        let p = parse_module_path("/v1/react@18.2.0/es2022/react.mjs").unwrap();
        assert_eq!(p.build_version, Some(1));
        assert_eq!(p.sub_path, "es2022/react.mjs");

        let p = parse_module_path("/stable/react@18.2.0").unwrap();
        assert!(p.stable);
        assert_eq!(p.build_version, None);
    }

    #[test]
    fn empty_and_whitespace_paths_rejected() {
        assert!(parse_module_path("/").is_err());
        assert!(parse_module_path("/react@").is_err());
    }

    #[test]
    fn target_segment_plain() {
        let t = parse_target_segment("es2022/react.mjs").unwrap();
        assert_eq!(t.target, Target::Es2022);
        assert_eq!(t.module, "react");
        assert!(!t.dev);
        assert_eq!(t.bundle_mode, None);
        assert_eq!(t.ext, "mjs");
        assert_eq!(t.args_prefix, None);
    }

    #[test]
    fn target_segment_with_args_and_suffixes() {
        let t = parse_target_segment("X-ZDpyZWFjdEAxOC4yLjA/es2020/lib/index.development.bundle.mjs")
            .unwrap();
        assert!(t.args_prefix.is_some());
        assert_eq!(t.target, Target::Es2020);
        assert_eq!(t.module, "lib/index");
        assert!(t.dev);
        assert_eq!(t.bundle_mode, Some(BundleMode::All));
    }

    #[test]
    fn ordinary_file_paths_are_not_target_segments() {
        assert_eq!(parse_target_segment("lib/index.js"), None);
        assert_eq!(parse_target_segment("es2022/"), None);
        assert_eq!(parse_target_segment("assets/logo.svg"), None);
    }

    #[test]
    fn query_options_decode() {
        let pairs = vec![
            ("target".to_string(), "es2020".to_string()),
            ("dev".to_string(), "".to_string()),
            ("deps".to_string(), "react@18.0.0".to_string()),
            ("alias".to_string(), "react:preact/compat".to_string()),
            ("external".to_string(), "lodash,*".to_string()),
            ("exports".to_string(), "useSWR".to_string()),
            ("pin".to_string(), "v1".to_string()),
            ("utm_source".to_string(), "docs".to_string()), // ignored
        ];
        let opts = parse_query(&pairs).unwrap();
        assert_eq!(opts.target, Some(Target::Es2020));
        assert!(opts.args.dev);
        assert!(opts.args.external_all);
        assert_eq!(opts.pin, Some(1));
        assert_eq!(opts.args.deps[0].name, "react");
        assert_eq!(opts.args.alias["react"], "preact/compat");
    }

    #[test]
    fn bundle_toggles() {
        let on = parse_query(&[("bundle".into(), "".into())]).unwrap();
        assert_eq!(on.args.bundle_mode, BundleMode::All);
        let off = parse_query(&[("bundle".into(), "false".into())]).unwrap();
        assert_eq!(off.args.bundle_mode, BundleMode::None);
        let none = parse_query(&[("no-bundle".into(), "".into())]).unwrap();
        assert_eq!(none.args.bundle_mode, BundleMode::None);
    }

    #[test]
    fn bad_target_rejected() {
        assert!(parse_query(&[("target".into(), "es9999".into())]).is_err());
    }
}
