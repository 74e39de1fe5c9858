pub mod config;
pub mod error;
pub mod types;
pub mod ua;

pub use config::{Config, ScopedRegistry};
pub use error::{CdnError, Result};
pub use types::{
    is_commitish, is_exact_version, normalize_sub_path, strip_module_extension, BuildArgs,
    BuildResult, BundleMode, Pkg, PkgOrigin, Target, BUILD_VERSION,
};
pub use ua::target_from_user_agent;
