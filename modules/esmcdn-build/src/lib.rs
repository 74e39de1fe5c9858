//! The build job: drives the black-box bundler through its resolve/load
//! hooks, rewrites externals into CDN URLs, and persists artefacts plus
//! metadata under the build identity.

pub mod bundler;
pub mod dts;
pub mod job;
pub mod polyfills;
pub mod postprocess;
pub mod process;
pub mod resolve;

pub use bundler::{
    BundleOutput, BundleRequest, Bundler, BundlerMessage, ImportKind, LoadQuery, LoadedSource,
    Loader, ModuleHost, OutputFile, OutputKind, Platform, ResolveAction, ResolveQuery,
    SyntheticEntry, TransformRequest,
};
pub use job::{BuildContext, Builder, SubBuildSink};
pub use process::ProcessBundler;
