//! Wrapper modules: the short synthetic module returned for a bare package
//! URL, forwarding `*` and `default` from the target-specific artefact.

use esmcdn_common::BuildResult;

/// Build the wrapper body for a bare module request.
pub fn module_wrapper(artefact_url: &str, result: &BuildResult, worker: bool) -> String {
    if result.types_only {
        return "/* types only */\nexport {};\n".to_string();
    }
    if worker {
        // `?worker`: export a factory constructing a module worker over the
        // artefact instead of re-exporting it.
        return format!(
            "const workerSrc = \"{artefact_url}\";\n\
             export default function workerFactory(options) {{\n  \
             return new Worker(workerSrc, {{ ...options, type: \"module\" }});\n\
             }}\n"
        );
    }

    let mut code = format!("export * from \"{artefact_url}\";\n");
    if result.has_default_export {
        code.push_str(&format!(
            "export {{ default }} from \"{artefact_url}\";\n"
        ));
    }
    code
}
