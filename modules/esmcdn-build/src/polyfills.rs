//! Node built-in modules: recognition, per-target replacement URLs, and the
//! small embedded polyfill modules served under `/node/*`.

use esmcdn_common::Target;

/// Every module name Node resolves natively (with or without the `node:`
/// scheme prefix).
const NODE_BUILTINS: &[&str] = &[
    "assert",
    "assert/strict",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "diagnostics_channel",
    "dns",
    "dns/promises",
    "domain",
    "events",
    "fs",
    "fs/promises",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "path/posix",
    "path/win32",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "stream/consumers",
    "stream/promises",
    "stream/web",
    "string_decoder",
    "sys",
    "timers",
    "timers/promises",
    "tls",
    "trace_events",
    "tty",
    "url",
    "util",
    "util/types",
    "v8",
    "vm",
    "wasi",
    "worker_threads",
    "zlib",
];

/// Built-ins with a usable browser polyfill on this CDN.
const BROWSER_POLYFILLED: &[&str] = &[
    "assert",
    "buffer",
    "console",
    "constants",
    "events",
    "os",
    "path",
    "process",
    "punycode",
    "querystring",
    "stream",
    "string_decoder",
    "timers",
    "url",
    "util",
];

/// Built-ins the `denonext` runtime does not ship under `node:`.
const DENONEXT_UNSUPPORTED: &[&str] = &[
    "cluster",
    "dgram",
    "inspector",
    "repl",
    "trace_events",
    "v8",
    "vm",
    "wasi",
];

/// Strip a `node:` scheme and report whether the result names a built-in.
pub fn as_node_builtin(specifier: &str) -> Option<&str> {
    let bare = specifier.strip_prefix("node:").unwrap_or(specifier);
    NODE_BUILTINS.contains(&bare).then_some(bare)
}

/// The external URL replacing a Node built-in for a target. `None` means the
/// target cannot satisfy the built-in; the caller emits an error module URL.
pub fn builtin_replacement(builtin: &str, target: Target, deno_std: &str) -> Option<String> {
    match target {
        Target::Node => Some(format!("node:{builtin}")),
        Target::DenoNext => {
            if DENONEXT_UNSUPPORTED.contains(&builtin) {
                None
            } else {
                Some(format!("node:{builtin}"))
            }
        }
        Target::Deno => Some(format!(
            "https://deno.land/std@{deno_std}/node/{builtin}.ts"
        )),
        _ => {
            if BROWSER_POLYFILLED.contains(&builtin) {
                Some(format!("/node/{}.mjs", builtin.replace('/', "_")))
            } else {
                None
            }
        }
    }
}

/// The error module emitted when an import cannot be satisfied; evaluating
/// it throws, so the failure surfaces in the importer's console.
pub fn error_module_url(error_type: &str, name: &str, importer: &str) -> String {
    format!("/error.js?type={error_type}&name={name}&importer={importer}")
}

/// Embedded polyfill modules served under `/node/<name>.mjs`.
pub fn embedded_polyfill(name: &str) -> Option<&'static str> {
    Some(match name {
        "process" => include_str!("../assets/node/process.mjs"),
        "buffer" => include_str!("../assets/node/buffer.mjs"),
        "global" => include_str!("../assets/node/global.mjs"),
        "setimmediate" => include_str!("../assets/node/setimmediate.mjs"),
        "require_resolve" => include_str!("../assets/node/require_resolve.mjs"),
        _ => return None,
    })
}
