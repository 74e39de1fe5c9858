//! The build identity: the canonical tuple keying the artefact cache and the
//! queue's single-flight index. Its serialized form is the storage path.

use std::fmt;

use serde::{Deserialize, Serialize};

use esmcdn_common::{BuildArgs, BundleMode, Pkg, Target};

use crate::args::encode_args_prefix;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildIdentity {
    pub build_version: u32,
    pub pkg: Pkg,
    /// Normalized build args. `args.dev` and `args.bundle_mode` are the
    /// authoritative dev/bundle fields of the identity tuple.
    pub args: BuildArgs,
    pub target: Target,
}

impl BuildIdentity {
    pub fn new(build_version: u32, pkg: Pkg, mut args: BuildArgs, target: Target) -> Self {
        args.normalize(&pkg);
        Self {
            build_version,
            pkg,
            args,
            target,
        }
    }

    pub fn dev(&self) -> bool {
        self.args.dev
    }

    pub fn bundle_mode(&self) -> BundleMode {
        self.args.bundle_mode
    }

    /// The module file stem inside the target directory: the sub-module when
    /// one was requested, otherwise the package's base name.
    pub fn module_name(&self) -> String {
        if !self.pkg.sub_module.is_empty() {
            return self.pkg.sub_module.clone();
        }
        self.pkg
            .name
            .rsplit('/')
            .next()
            .unwrap_or(&self.pkg.name)
            .to_string()
    }

    /// The encoded args prefix segment, when any args are set.
    pub fn args_prefix(&self) -> Option<String> {
        encode_args_prefix(&self.args, &self.pkg)
    }

    fn filename_suffix(&self) -> &'static str {
        match (self.dev(), self.bundle_mode()) {
            (false, BundleMode::Default) => "",
            (true, BundleMode::Default) => ".development",
            (false, BundleMode::All) => ".bundle",
            (true, BundleMode::All) => ".development.bundle",
            (false, BundleMode::None) => ".nobundle",
            (true, BundleMode::None) => ".development.nobundle",
        }
    }

    /// Identity key: the storage path without a file extension. One build job
    /// per key runs at a time; all artefact files share it.
    pub fn key(&self) -> String {
        let mut key = format!("builds/v{}/{}", self.build_version, self.pkg.spec());
        if let Some(prefix) = self.args_prefix() {
            key.push('/');
            key.push_str(&prefix);
        }
        key.push('/');
        key.push_str(self.target.as_str());
        key.push('/');
        key.push_str(&self.module_name());
        key.push_str(self.filename_suffix());
        key
    }

    /// Storage path of one artefact file under this identity.
    pub fn artefact_path(&self, ext: &str) -> String {
        format!("{}.{ext}", self.key())
    }

    /// Storage path of the companion type-definition artefact for `sub`
    /// (a `.d.ts`-relative path inside the package's types tree).
    pub fn types_path(&self, sub: &str) -> String {
        let mut path = format!("types/v{}/{}", self.build_version, self.pkg.spec());
        if let Some(prefix) = self.args_prefix() {
            path.push('/');
            path.push_str(&prefix);
        }
        path.push('/');
        path.push_str(sub.trim_start_matches('/'));
        path
    }

    /// The canonical request URL path for this identity's JS artefact.
    pub fn url_path(&self) -> String {
        let mut url = format!("/v{}/{}", self.build_version, self.pkg.spec());
        if let Some(prefix) = self.args_prefix() {
            url.push('/');
            url.push_str(&prefix);
        }
        url.push('/');
        url.push_str(self.target.as_str());
        url.push('/');
        url.push_str(&self.module_name());
        url.push_str(self.filename_suffix());
        url.push_str(".mjs");
        url
    }
}

impl fmt::Display for BuildIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esmcdn_common::{PkgOrigin, BUILD_VERSION};

    fn react() -> Pkg {
        Pkg::new("react", "18.2.0")
    }

    #[test]
    fn plain_artefact_path() {
        let id = BuildIdentity::new(BUILD_VERSION, react(), BuildArgs::default(), Target::Es2022);
        assert_eq!(id.artefact_path("mjs"), "builds/v1/react@18.2.0/es2022/react.mjs");
        assert_eq!(id.url_path(), "/v1/react@18.2.0/es2022/react.mjs");
    }

    #[test]
    fn dev_and_bundle_suffixes() {
        let mut args = BuildArgs::default();
        args.dev = true;
        args.bundle_mode = BundleMode::All;
        let id = BuildIdentity::new(BUILD_VERSION, react(), args, Target::Es2022);
        assert_eq!(
            id.artefact_path("mjs"),
            "builds/v1/react@18.2.0/es2022/react.development.bundle.mjs"
        );
    }

    #[test]
    fn sub_module_and_args_prefix() {
        let pkg = react().with_sub_path("jsx-runtime.js");
        let mut args = BuildArgs::default();
        args.deps.push(Pkg::new("scheduler", "0.23.0"));
        let id = BuildIdentity::new(BUILD_VERSION, pkg, args, Target::Es2020);
        let path = id.artefact_path("mjs");
        assert!(path.starts_with("builds/v1/react@18.2.0/X-"), "{path}");
        assert!(path.ends_with("/es2020/jsx-runtime.mjs"), "{path}");
    }

    #[test]
    fn code_host_identity_keeps_gh_prefix() {
        let mut pkg = Pkg::new("owner/repo", "abc1234def");
        pkg.origin = PkgOrigin::CodeHost;
        let id = BuildIdentity::new(BUILD_VERSION, pkg, BuildArgs::default(), Target::EsNext);
        assert_eq!(
            id.artefact_path("mjs"),
            "builds/v1/gh/owner/repo@abc1234def/esnext/repo.mjs"
        );
    }

    #[test]
    fn identical_requests_share_a_key() {
        let mut a = BuildArgs::default();
        a.exports.insert("useState".into());
        a.exports.insert("useEffect".into());
        let mut b = BuildArgs::default();
        b.exports.insert("useEffect".into());
        b.exports.insert("useState".into());
        let left = BuildIdentity::new(BUILD_VERSION, react(), a, Target::Es2022);
        let right = BuildIdentity::new(BUILD_VERSION, react(), b, Target::Es2022);
        assert_eq!(left.key(), right.key());
    }

    #[test]
    fn types_path_partition() {
        let id = BuildIdentity::new(BUILD_VERSION, react(), BuildArgs::default(), Target::Es2022);
        assert_eq!(
            id.types_path("index.d.ts"),
            "types/v1/react@18.2.0/index.d.ts"
        );
    }
}
