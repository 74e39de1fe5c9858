//! Materializes pinned packages into per-version working directories for the
//! bundler, installing transitive dependencies lazily on resolver demand.

pub mod installer;
pub mod package_json;
pub mod purger;

pub use installer::{InstalledPackage, Installer};
pub use package_json::{BrowserEntry, PackageJson};
pub use purger::WorkdirPurger;
