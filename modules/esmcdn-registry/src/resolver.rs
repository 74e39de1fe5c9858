//! Version resolution: exact versions pass through, tags and ranges go to
//! the packument, and non-exact answers are cached under a short TTL so hot
//! packages don't hammer the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use esmcdn_common::{is_commitish, is_exact_version, CdnError, Pkg, PkgOrigin, Result};

use crate::client::{RegistryClient, VersionMetadata};
use crate::codehost::CodeHostResolver;
use crate::semver_range::max_satisfying;

/// A fully pinned package plus the metadata the pipeline needs downstream.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub version: String,
    pub meta: VersionMetadata,
    /// Whether the request's spec was already fully pinned; unpinned specs
    /// get redirected and shorter caching upstream.
    pub was_exact: bool,
}

pub struct PackageResolver {
    registry: Arc<dyn RegistryClient>,
    codehost: CodeHostResolver,
    ttl: Duration,
    cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl PackageResolver {
    pub fn new(registry: Arc<dyn RegistryClient>, ttl: Duration) -> Self {
        Self {
            registry,
            codehost: CodeHostResolver::new(ttl),
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `(origin, name, spec)` to a pinned version. For registry
    /// packages the spec may be exact, a range, a tag, or empty (`latest`);
    /// for code-host packages a tag, branch, or commit prefix.
    pub async fn resolve(&self, origin: PkgOrigin, name: &str, spec: &str) -> Result<ResolvedPackage> {
        match origin {
            PkgOrigin::CodeHost => {
                let was_exact = is_commitish(spec);
                let version = self.codehost.resolve(name, spec).await?;
                Ok(ResolvedPackage {
                    version,
                    meta: VersionMetadata::default(),
                    was_exact,
                })
            }
            PkgOrigin::Registry => self.resolve_registry(name, spec).await,
            PkgOrigin::UserUploaded => Err(CdnError::InvalidRequest(format!(
                "user-uploaded modules are not versioned: {name}"
            ))),
        }
    }

    /// Resolve and return as a `Pkg` carrying the origin.
    pub async fn resolve_pkg(&self, origin: PkgOrigin, name: &str, spec: &str) -> Result<(Pkg, ResolvedPackage)> {
        let resolved = self.resolve(origin, name, spec).await?;
        let mut pkg = Pkg::new(name, resolved.version.clone());
        pkg.origin = origin;
        Ok((pkg, resolved))
    }

    async fn resolve_registry(&self, name: &str, spec: &str) -> Result<ResolvedPackage> {
        if is_exact_version(spec) {
            let meta = self.registry.version_metadata(name, spec).await?;
            return Ok(ResolvedPackage {
                version: spec.to_string(),
                meta,
                was_exact: true,
            });
        }

        let spec_key = if spec.is_empty() { "latest" } else { spec };
        let cache_key = format!("{name}@{spec_key}");
        if let Some(version) = self.cached(&cache_key).await {
            let meta = self.registry.version_metadata(name, &version).await?;
            return Ok(ResolvedPackage {
                version,
                meta,
                was_exact: false,
            });
        }

        let packument = self.registry.packument(name).await?;

        // Tag first (`latest`, `next`, `beta`); then range match.
        let version = if let Some(tagged) = packument.dist_tags.get(spec_key) {
            tagged.clone()
        } else {
            max_satisfying(spec_key, packument.versions.keys().map(|s| s.as_str()))
                .map(|v| v.to_string())
                .ok_or_else(|| {
                    CdnError::InvalidRequest(format!("no version of {name} satisfies {spec_key}"))
                })?
        };

        let meta = packument
            .versions
            .get(&version)
            .cloned()
            .ok_or_else(|| CdnError::Upstream(format!("{name}@{version}: missing metadata")))?;

        debug!(name, spec = spec_key, version = %version, "Resolved version");
        let mut cache = self.cache.lock().await;
        cache.insert(cache_key, (version.clone(), Instant::now()));

        Ok(ResolvedPackage {
            version,
            meta,
            was_exact: false,
        })
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock().await;
        cache
            .get(key)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(version, _)| version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Dist, RegistryPackument};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRegistry {
        packument_calls: AtomicUsize,
    }

    impl FakeRegistry {
        fn new() -> Self {
            Self {
                packument_calls: AtomicUsize::new(0),
            }
        }

        fn meta(version: &str) -> VersionMetadata {
            VersionMetadata {
                name: "react".into(),
                version: version.into(),
                dist: Dist {
                    tarball: format!("https://registry.test/react/-/react-{version}.tgz"),
                },
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RegistryClient for FakeRegistry {
        async fn packument(&self, name: &str) -> Result<RegistryPackument> {
            self.packument_calls.fetch_add(1, Ordering::SeqCst);
            if name != "react" {
                return Err(CdnError::NotFound(name.to_string()));
            }
            let versions = ["17.0.2", "18.0.0", "18.2.0", "19.0.0-rc.0"]
                .into_iter()
                .map(|v| (v.to_string(), Self::meta(v)))
                .collect();
            Ok(RegistryPackument {
                name: name.to_string(),
                dist_tags: [("latest".to_string(), "18.2.0".to_string())]
                    .into_iter()
                    .collect(),
                versions,
            })
        }

        async fn version_metadata(&self, name: &str, version: &str) -> Result<VersionMetadata> {
            if name != "react" {
                return Err(CdnError::NotFound(name.to_string()));
            }
            Ok(Self::meta(version))
        }

        async fn tarball(&self, _meta: &VersionMetadata) -> Result<Bytes> {
            Ok(Bytes::new())
        }
    }

    fn resolver(fake: Arc<FakeRegistry>) -> PackageResolver {
        PackageResolver::new(fake, Duration::from_secs(600))
    }

    #[tokio::test]
    async fn exact_spec_skips_the_packument() {
        let fake = Arc::new(FakeRegistry::new());
        let r = resolver(fake.clone());
        let resolved = r.resolve(PkgOrigin::Registry, "react", "18.2.0").await.unwrap();
        assert!(resolved.was_exact);
        assert_eq!(resolved.version, "18.2.0");
        assert_eq!(fake.packument_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_spec_resolves_latest_tag() {
        let fake = Arc::new(FakeRegistry::new());
        let r = resolver(fake);
        let resolved = r.resolve(PkgOrigin::Registry, "react", "").await.unwrap();
        assert!(!resolved.was_exact);
        assert_eq!(resolved.version, "18.2.0");
    }

    #[tokio::test]
    async fn caret_range_picks_highest_stable() {
        let fake = Arc::new(FakeRegistry::new());
        let r = resolver(fake);
        let resolved = r.resolve(PkgOrigin::Registry, "react", "^18.0.0").await.unwrap();
        assert_eq!(resolved.version, "18.2.0");
    }

    #[tokio::test]
    async fn range_results_are_cached() {
        let fake = Arc::new(FakeRegistry::new());
        let r = resolver(fake.clone());
        r.resolve(PkgOrigin::Registry, "react", "^18.0.0").await.unwrap();
        r.resolve(PkgOrigin::Registry, "react", "^18.0.0").await.unwrap();
        assert_eq!(fake.packument_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_invalid_request() {
        let fake = Arc::new(FakeRegistry::new());
        let r = resolver(fake);
        let err = r.resolve(PkgOrigin::Registry, "react", "^99.0.0").await.unwrap_err();
        assert!(matches!(err, CdnError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn missing_package_is_not_found() {
        let fake = Arc::new(FakeRegistry::new());
        let r = resolver(fake);
        let err = r.resolve(PkgOrigin::Registry, "no-such-pkg", "").await.unwrap_err();
        assert!(matches!(err, CdnError::NotFound(_)));
    }
}
