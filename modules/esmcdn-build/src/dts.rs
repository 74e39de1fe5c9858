//! Type-definition rewriting. A `.d.ts` tree is mirrored under the
//! identity's types partition with every module reference redirected back at
//! this CDN. No TypeScript parsing: a lexer over string literals and the
//! triple-slash reference directives is all the format needs.

use regex::{Captures, Regex};

/// Why a specifier appears in a dts file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtsRef {
    /// `/// <reference path="…" />`
    ReferencePath,
    /// `/// <reference types="…" />`
    ReferenceTypes,
    /// `import`/`export … from`, bare `import "…"`, `import("…")`.
    Import,
}

/// Rewrite every module reference in `source` through `map`. Returning
/// `None` keeps a reference unchanged.
pub fn rewrite_dts(source: &str, mut map: impl FnMut(&str, DtsRef) -> Option<String>) -> String {
    let reference_re = Regex::new(
        r#"(?m)^(\s*///\s*<reference\s+)(path|types)(\s*=\s*")([^"]+)(")"#,
    )
    .expect("static regex");
    let from_re = Regex::new(r#"(\bfrom\s*)(["'])([^"']+)(["'])"#).expect("static regex");
    let dynamic_re = Regex::new(r#"(\bimport\s*\(\s*)(["'])([^"']+)(["'])(\s*\))"#)
        .expect("static regex");
    let bare_import_re =
        Regex::new(r#"(?m)^(\s*import\s+)(["'])([^"']+)(["'])"#).expect("static regex");

    let rewritten = reference_re.replace_all(source, |caps: &Captures<'_>| {
        let kind = if &caps[2] == "path" {
            DtsRef::ReferencePath
        } else {
            DtsRef::ReferenceTypes
        };
        let target = map(&caps[4], kind).unwrap_or_else(|| caps[4].to_string());
        format!("{}{}{}{}{}", &caps[1], &caps[2], &caps[3], target, &caps[5])
    });

    let rewritten = from_re.replace_all(&rewritten, |caps: &Captures<'_>| {
        let target = map(&caps[3], DtsRef::Import).unwrap_or_else(|| caps[3].to_string());
        format!("{}{}{}{}", &caps[1], &caps[2], target, &caps[4])
    });

    let rewritten = dynamic_re.replace_all(&rewritten, |caps: &Captures<'_>| {
        let target = map(&caps[3], DtsRef::Import).unwrap_or_else(|| caps[3].to_string());
        format!("{}{}{}{}{}", &caps[1], &caps[2], target, &caps[4], &caps[5])
    });

    let rewritten = bare_import_re.replace_all(&rewritten, |caps: &Captures<'_>| {
        let target = map(&caps[3], DtsRef::Import).unwrap_or_else(|| caps[3].to_string());
        format!("{}{}{}{}", &caps[1], &caps[2], target, &caps[4])
    });

    rewritten.into_owned()
}

/// Give a relative dts path its `.d.ts` extension when it has none.
pub fn ensure_dts_extension(path: &str) -> String {
    if path.ends_with(".d.ts") || path.ends_with(".d.mts") {
        return path.to_string();
    }
    if let Some(stem) = path.strip_suffix(".ts") {
        return format!("{stem}.d.ts");
    }
    if let Some(stem) = path.strip_suffix(".js") {
        return format!("{stem}.d.ts");
    }
    format!("{path}.d.ts")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(spec: &str, _kind: DtsRef) -> Option<String> {
        if spec.starts_with('.') {
            Some(format!("/types/v1/pkg@1.0.0/{}", ensure_dts_extension(spec.trim_start_matches("./"))))
        } else {
            Some(format!("/types/v1/{spec}@latest/index.d.ts"))
        }
    }

    #[test]
    fn rewrites_reference_directives() {
        let source = "/// <reference path=\"./globals.d.ts\" />\n/// <reference types=\"node\" />\n";
        let out = rewrite_dts(source, mapper);
        assert!(out.contains("path=\"/types/v1/pkg@1.0.0/globals.d.ts\""), "{out}");
        assert!(out.contains("types=\"/types/v1/node@latest/index.d.ts\""), "{out}");
    }

    #[test]
    fn rewrites_import_and_export_from() {
        let source = "import { A } from './a';\nexport * from \"./b\";\nexport { C } from 'dep';\n";
        let out = rewrite_dts(source, mapper);
        assert!(out.contains("from '/types/v1/pkg@1.0.0/a.d.ts'"), "{out}");
        assert!(out.contains("from \"/types/v1/pkg@1.0.0/b.d.ts\""), "{out}");
        assert!(out.contains("from '/types/v1/dep@latest/index.d.ts'"), "{out}");
    }

    #[test]
    fn rewrites_dynamic_type_imports() {
        let source = "type X = import(\"./x\").X;\n";
        let out = rewrite_dts(source, mapper);
        assert!(out.contains("import(\"/types/v1/pkg@1.0.0/x.d.ts\")"), "{out}");
    }

    #[test]
    fn rewrites_bare_side_effect_imports() {
        let source = "import \"./polyfill\";\n";
        let out = rewrite_dts(source, mapper);
        assert!(out.contains("import \"/types/v1/pkg@1.0.0/polyfill.d.ts\""), "{out}");
    }

    #[test]
    fn unmapped_references_stay_put() {
        let source = "import { A } from './a';\n";
        let out = rewrite_dts(source, |_, _| None);
        assert_eq!(out, source);
    }

    #[test]
    fn extension_normalization() {
        assert_eq!(ensure_dts_extension("index.d.ts"), "index.d.ts");
        assert_eq!(ensure_dts_extension("util"), "util.d.ts");
        assert_eq!(ensure_dts_extension("util.js"), "util.d.ts");
        assert_eq!(ensure_dts_extension("util.ts"), "util.d.ts");
    }
}
