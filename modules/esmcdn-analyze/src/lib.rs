//! CJS export analysis. A child process runs a static lexer over the module
//! graph; a curated allowlist of packages whose exports only materialize at
//! runtime falls back to `require`-time introspection in the same process.

pub mod analyzer;

pub use analyzer::{AnalyzerMode, ExportAnalysis, ExportAnalyzer, ProcessAnalyzer};
