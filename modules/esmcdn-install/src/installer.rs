//! Package installation. Each pinned version gets one working directory
//! (`<root>/<name@version>/node_modules/<name>`); a marker file makes the
//! install idempotent and a per-key lock makes it exclusive.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tokio::sync::Mutex;
use tracing::{debug, info};

use esmcdn_common::{CdnError, Pkg, PkgOrigin, Result};
use esmcdn_registry::{CodeHostClient, PackageResolver, RegistryClient, VersionMetadata};

use crate::package_json::PackageJson;

const MARKER_FILE: &str = ".esmcdn-installed";

/// An installed package tree, rooted at the package directory itself.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    /// `<workdir>/node_modules/<name>`.
    pub root: PathBuf,
    /// `<workdir>`: the version-keyed directory holding `node_modules`.
    pub workdir: PathBuf,
    pub package_json: PackageJson,
}

impl InstalledPackage {
    /// Directory of a sibling dependency inside the same working tree.
    pub fn dependency_root(&self, name: &str) -> PathBuf {
        self.workdir.join("node_modules").join(name)
    }
}

pub struct Installer {
    workdir_root: PathBuf,
    registry: Arc<dyn RegistryClient>,
    resolver: Arc<PackageResolver>,
    codehost: CodeHostClient,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Installer {
    pub fn new(
        workdir_root: impl Into<PathBuf>,
        registry: Arc<dyn RegistryClient>,
        resolver: Arc<PackageResolver>,
    ) -> Self {
        Self {
            workdir_root: workdir_root.into(),
            registry,
            resolver,
            codehost: CodeHostClient::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The working directory for a version key (`name@version`).
    pub fn workdir_for(&self, pkg: &Pkg) -> PathBuf {
        self.workdir_root.join(pkg.spec())
    }

    /// Install `pkg` into its working directory. Returns immediately when
    /// the marker file from a previous install is present.
    pub async fn install(&self, pkg: &Pkg, meta: &VersionMetadata) -> Result<InstalledPackage> {
        let workdir = self.workdir_for(pkg);
        let dest = workdir.join("node_modules").join(&pkg.name);
        self.install_into(pkg, meta, &workdir, &dest).await?;
        let package_json = PackageJson::load(&dest).await?;
        Ok(InstalledPackage {
            root: dest,
            workdir,
            package_json,
        })
    }

    /// Lazily install a dependency of `host` (resolving `spec` first) into
    /// the host's working tree. Used by the bundler's resolver when it walks
    /// into a package that is not yet materialized.
    pub async fn install_dependency(
        &self,
        host: &InstalledPackage,
        name: &str,
        spec: &str,
    ) -> Result<(Pkg, InstalledPackage)> {
        let (dep, resolved) = self
            .resolver
            .resolve_pkg(PkgOrigin::Registry, name, spec)
            .await?;
        let dest = host.dependency_root(name);
        self.install_into(&dep, &resolved.meta, &host.workdir, &dest).await?;
        let package_json = PackageJson::load(&dest).await?;
        Ok((
            dep,
            InstalledPackage {
                root: dest,
                workdir: host.workdir.clone(),
                package_json,
            },
        ))
    }

    async fn install_into(
        &self,
        pkg: &Pkg,
        meta: &VersionMetadata,
        workdir: &Path,
        dest: &Path,
    ) -> Result<()> {
        let lock = self.lock_for(&format!("{}::{}", workdir.display(), pkg.spec())).await;
        let _guard = lock.lock().await;

        let marker = dest.join(MARKER_FILE);
        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            debug!(pkg = %pkg.spec(), "Already installed");
            return Ok(());
        }

        let data = match pkg.origin {
            PkgOrigin::CodeHost => self.codehost.tarball(&pkg.name, &pkg.version).await?,
            _ => self.registry.tarball(meta).await?,
        };

        info!(pkg = %pkg.spec(), bytes = data.len(), "Installing package");
        let dest_owned = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_tarball(&data, &dest_owned))
            .await
            .map_err(|e| CdnError::Install(format!("{}: {e}", pkg.spec())))??;

        tokio::fs::write(&marker, b"")
            .await
            .map_err(|e| CdnError::Install(format!("{}: marker write: {e}", pkg.spec())))?;
        Ok(())
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }
}

/// Unpack a gzip'd tar into `dest`, stripping the single top-level directory
/// (`package/` for registry tarballs, `repo-ref/` for code-host ones) and
/// refusing entries that would escape the destination.
fn extract_tarball(data: &[u8], dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    std::fs::create_dir_all(dest)
        .map_err(|e| CdnError::Install(format!("{}: {e}", dest.display())))?;

    let entries = archive
        .entries()
        .map_err(|e| CdnError::Install(format!("unreadable tarball: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CdnError::Install(format!("tarball entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| CdnError::Install(format!("tarball path: {e}")))?
            .into_owned();

        let mut components = path.components();
        components.next(); // top-level directory
        let relative: PathBuf = components
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CdnError::Install(format!("{}: {e}", parent.display())))?;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(|e| CdnError::Install(format!("{}: {e}", relative.display())))?;
        std::fs::write(&target, contents)
            .map_err(|e| CdnError::Install(format!("{}: {e}", target.display())))?;
    }
    Ok(())
}
