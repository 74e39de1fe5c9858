//! The args prefix: a base64-url segment (`X-<payload>`) encoding the build
//! modifiers that influence artefact bytes. Encoding is a pure function of
//! the logical args; every list is sorted and empty fields are omitted, so
//! equal args always produce equal prefixes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use esmcdn_common::{BuildArgs, CdnError, Pkg, Result};

/// Entry keys in their fixed payload order.
const KEY_ALIAS: &str = "a";
const KEY_CONDITIONS: &str = "c";
const KEY_DEPS: &str = "d";
const KEY_EXTERNAL: &str = "e";
const KEY_FLAGS: &str = "f";
const KEY_JSX: &str = "j";
const KEY_DENO_STD: &str = "s";
const KEY_EXPORTS: &str = "x";

const FLAG_EXTERNAL_REQUIRE: &str = "external-require";
const FLAG_IGNORE_ANNOTATIONS: &str = "ignore-annotations";
const FLAG_KEEP_NAMES: &str = "keep-names";
const FLAG_NO_DTS: &str = "no-dts";
const FLAG_WORKER: &str = "worker";

/// Encode `args` into the `X-` prefix segment, or `None` when every encoded
/// field is empty. `dev` and the bundle mode never appear here; they ride on
/// the artefact filename suffixes.
pub fn encode_args_prefix(args: &BuildArgs, pkg: &Pkg) -> Option<String> {
    let mut args = args.clone();
    args.normalize(pkg);

    let mut entries: Vec<String> = Vec::new();

    if !args.alias.is_empty() {
        let pairs: Vec<String> = args
            .alias
            .iter()
            .map(|(from, to)| format!("{from}:{to}"))
            .collect();
        entries.push(format!("{KEY_ALIAS}:{}", pairs.join(",")));
    }
    if !args.conditions.is_empty() {
        let list: Vec<&str> = args.conditions.iter().map(|s| s.as_str()).collect();
        entries.push(format!("{KEY_CONDITIONS}:{}", list.join(",")));
    }
    if !args.deps.is_empty() {
        let list: Vec<String> = args.deps.iter().map(|d| d.spec()).collect();
        entries.push(format!("{KEY_DEPS}:{}", list.join(",")));
    }
    if args.external_all {
        entries.push(format!("{KEY_EXTERNAL}:*"));
    } else if !args.external.is_empty() {
        let list: Vec<&str> = args.external.iter().map(|s| s.as_str()).collect();
        entries.push(format!("{KEY_EXTERNAL}:{}", list.join(",")));
    }

    let mut flags: Vec<&str> = Vec::new();
    if args.external_require {
        flags.push(FLAG_EXTERNAL_REQUIRE);
    }
    if args.ignore_annotations {
        flags.push(FLAG_IGNORE_ANNOTATIONS);
    }
    if args.keep_names {
        flags.push(FLAG_KEEP_NAMES);
    }
    if args.no_dts {
        flags.push(FLAG_NO_DTS);
    }
    if args.worker {
        flags.push(FLAG_WORKER);
    }
    if !flags.is_empty() {
        entries.push(format!("{KEY_FLAGS}:{}", flags.join(",")));
    }

    if let Some(jsx) = &args.jsx_runtime {
        entries.push(format!("{KEY_JSX}:{}", jsx.spec()));
    }
    if let Some(std) = &args.deno_std {
        entries.push(format!("{KEY_DENO_STD}:{std}"));
    }
    if !args.exports.is_empty() {
        let list: Vec<&str> = args.exports.iter().map(|s| s.as_str()).collect();
        entries.push(format!("{KEY_EXPORTS}:{}", list.join(",")));
    }

    if entries.is_empty() {
        return None;
    }
    Some(format!("X-{}", URL_SAFE_NO_PAD.encode(entries.join(";"))))
}

/// Decode an `X-` prefix segment back into `BuildArgs`. Unknown keys and
/// flags are rejected; the payload is trusted to be self-produced otherwise.
pub fn decode_args_prefix(segment: &str) -> Result<BuildArgs> {
    let payload = segment
        .strip_prefix("X-")
        .ok_or_else(|| CdnError::InvalidRequest(format!("bad args prefix: {segment}")))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| CdnError::InvalidRequest(format!("bad args prefix: {segment}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| CdnError::InvalidRequest(format!("bad args prefix: {segment}")))?;

    let mut args = BuildArgs::default();
    for entry in text.split(';').filter(|e| !e.is_empty()) {
        let (key, value) = entry
            .split_once(':')
            .ok_or_else(|| CdnError::InvalidRequest(format!("bad args entry: {entry}")))?;
        match key {
            KEY_ALIAS => {
                for pair in value.split(',') {
                    let (from, to) = pair.split_once(':').ok_or_else(|| {
                        CdnError::InvalidRequest(format!("bad alias entry: {pair}"))
                    })?;
                    args.alias.insert(from.to_string(), to.to_string());
                }
            }
            KEY_CONDITIONS => {
                args.conditions.extend(value.split(',').map(String::from));
            }
            KEY_DEPS => {
                for spec in value.split(',') {
                    let dep = Pkg::from_spec(spec).ok_or_else(|| {
                        CdnError::InvalidRequest(format!("bad dep pin: {spec}"))
                    })?;
                    args.deps.push(dep);
                }
            }
            KEY_EXTERNAL => {
                if value == "*" {
                    args.external_all = true;
                } else {
                    args.external.extend(value.split(',').map(String::from));
                }
            }
            KEY_FLAGS => {
                for flag in value.split(',') {
                    match flag {
                        FLAG_EXTERNAL_REQUIRE => args.external_require = true,
                        FLAG_IGNORE_ANNOTATIONS => args.ignore_annotations = true,
                        FLAG_KEEP_NAMES => args.keep_names = true,
                        FLAG_NO_DTS => args.no_dts = true,
                        FLAG_WORKER => args.worker = true,
                        other => {
                            return Err(CdnError::InvalidRequest(format!(
                                "unknown args flag: {other}"
                            )))
                        }
                    }
                }
            }
            KEY_JSX => {
                args.jsx_runtime = Some(Pkg::from_spec(value).ok_or_else(|| {
                    CdnError::InvalidRequest(format!("bad jsx runtime: {value}"))
                })?);
            }
            KEY_DENO_STD => {
                args.deno_std = Some(value.to_string());
            }
            KEY_EXPORTS => {
                args.exports.extend(value.split(',').map(String::from));
            }
            other => {
                return Err(CdnError::InvalidRequest(format!("unknown args key: {other}")))
            }
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_args() -> BuildArgs {
        let mut args = BuildArgs::default();
        args.alias.insert("react".into(), "preact/compat".into());
        args.deps.push(Pkg::new("zod", "3.22.0"));
        args.deps.push(Pkg::new("preact", "10.19.0"));
        args.external.insert("lodash".into());
        args.exports.insert("useState".into());
        args.exports.insert("default".into());
        args.conditions.insert("browser".into());
        args.keep_names = true;
        args.worker = true;
        args
    }

    #[test]
    fn roundtrip_after_normalization() {
        let pkg = Pkg::new("swr", "2.2.0");
        let mut expected = sample_args();
        expected.normalize(&pkg);

        let prefix = encode_args_prefix(&sample_args(), &pkg).unwrap();
        assert!(prefix.starts_with("X-"));
        let decoded = decode_args_prefix(&prefix).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn encode_is_order_independent() {
        let pkg = Pkg::new("swr", "2.2.0");
        let mut reordered = sample_args();
        reordered.deps.reverse();
        assert_eq!(
            encode_args_prefix(&sample_args(), &pkg),
            encode_args_prefix(&reordered, &pkg)
        );
    }

    #[test]
    fn empty_args_have_no_prefix() {
        let pkg = Pkg::new("react", "18.2.0");
        assert_eq!(encode_args_prefix(&BuildArgs::default(), &pkg), None);
    }

    #[test]
    fn dev_and_bundle_mode_stay_out_of_the_prefix() {
        let pkg = Pkg::new("react", "18.2.0");
        let mut args = BuildArgs::default();
        args.dev = true;
        args.bundle_mode = esmcdn_common::BundleMode::All;
        assert_eq!(encode_args_prefix(&args, &pkg), None);
    }

    #[test]
    fn wildcard_external_roundtrip() {
        let pkg = Pkg::new("react", "18.2.0");
        let mut args = BuildArgs::default();
        args.external_all = true;
        let prefix = encode_args_prefix(&args, &pkg).unwrap();
        let decoded = decode_args_prefix(&prefix).unwrap();
        assert!(decoded.external_all);
        assert!(decoded.external.is_empty());
    }

    #[test]
    fn unknown_keys_rejected() {
        let payload = URL_SAFE_NO_PAD.encode("z:nope");
        let err = decode_args_prefix(&format!("X-{payload}")).unwrap_err();
        assert!(matches!(err, CdnError::InvalidRequest(_)));
    }

    #[test]
    fn malformed_base64_rejected() {
        assert!(decode_args_prefix("X-!!!").is_err());
        assert!(decode_args_prefix("noprefix").is_err());
    }
}
