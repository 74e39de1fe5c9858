//! Package resolution: turn `(source, name, version-spec)` into a pinned
//! version plus registry metadata, with a short-TTL cache in front.

pub mod client;
pub mod codehost;
pub mod policy;
pub mod resolver;
pub mod semver_range;

pub use client::{Dist, NpmClient, RegistryClient, RegistryPackument, VersionMetadata};
pub use codehost::{CodeHostClient, CodeHostResolver};
pub use policy::PackagePolicy;
pub use resolver::{PackageResolver, ResolvedPackage};
