use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use esmcdn_analyze::{ExportAnalyzer, ProcessAnalyzer};
use esmcdn_build::{BuildContext, Builder, Bundler, ProcessBundler, SubBuildSink};
use esmcdn_common::Config;
use esmcdn_identity::BuildIdentity;
use esmcdn_install::{Installer, WorkdirPurger};
use esmcdn_queue::BuildQueue;
use esmcdn_registry::{NpmClient, PackagePolicy, PackageResolver};
use esmcdn_storage::{
    FsKvStore, FsObjectStore, KvStore, ObjectStore, S3KvStore, S3ObjectStore, S3Options,
};

/// Shared server state: the process-wide singletons of the pipeline.
pub struct AppState {
    pub config: Config,
    pub queue: Arc<BuildQueue>,
    pub storage: Arc<dyn ObjectStore>,
    pub kv: Arc<dyn KvStore>,
    pub resolver: Arc<PackageResolver>,
    pub installer: Arc<Installer>,
    pub bundler: Arc<dyn Bundler>,
    pub policy: PackagePolicy,
    pub started_at: Instant,
}

/// Forwards sub-builds discovered during post-processing into the queue.
/// Handles are dropped on purpose: nobody waits on a background build.
struct QueueSink {
    queue: tokio::sync::OnceCell<Arc<BuildQueue>>,
}

impl SubBuildSink for QueueSink {
    fn submit(&self, identity: BuildIdentity) {
        let Some(queue) = self.queue.get().cloned() else {
            warn!(identity = %identity.key(), "Sub-build dropped: queue not wired yet");
            return;
        };
        tokio::spawn(async move {
            let handle = queue.add(identity, "").await;
            queue.remove_consumer(handle).await;
        });
    }
}

impl AppState {
    /// Wire the whole pipeline from configuration: stores, clients, the
    /// builder, and the queue on top.
    pub fn from_config(config: Config) -> Arc<Self> {
        let (storage, kv): (Arc<dyn ObjectStore>, Arc<dyn KvStore>) = if config.s3_bucket.is_empty()
        {
            (
                Arc::new(FsObjectStore::new(&config.storage_root)),
                Arc::new(FsKvStore::new(&config.kv_root)),
            )
        } else {
            let options = S3Options {
                bucket: config.s3_bucket.clone(),
                region: config.s3_region.clone(),
                endpoint: config.s3_endpoint.clone(),
                access_key: config.s3_access_key.clone(),
                secret_key: config.s3_secret_key.clone(),
            };
            let object = S3ObjectStore::new(&options).expect("s3 configuration");
            let records = S3KvStore::new(&options).expect("s3 configuration");
            (Arc::new(object), Arc::new(records))
        };
        let registry = Arc::new(NpmClient::new(&config));
        let resolver = Arc::new(PackageResolver::new(
            registry.clone(),
            Duration::from_secs(config.resolve_cache_ttl_secs),
        ));
        let installer = Arc::new(Installer::new(
            &config.workdir_root,
            registry,
            resolver.clone(),
        ));
        let purger = WorkdirPurger::new(
            &config.workdir_root,
            Duration::from_secs(config.workdir_ttl_secs),
        );
        purger.start();

        let analyzer: Arc<dyn ExportAnalyzer> = Arc::new(ProcessAnalyzer::new(&config.analyzer_bin));
        let bundler: Arc<dyn Bundler> = Arc::new(ProcessBundler::new(&config.bundler_bin));
        let sink = Arc::new(QueueSink {
            queue: tokio::sync::OnceCell::new(),
        });

        let builder = Builder::new(BuildContext {
            resolver: resolver.clone(),
            installer: installer.clone(),
            analyzer,
            bundler: bundler.clone(),
            storage: storage.clone(),
            kv: kv.clone(),
            purger,
            sub_builds: sink.clone(),
            minify: config.minify,
            source_map: config.source_map,
            deno_std: config.deno_std_version.clone(),
        });

        let queue = BuildQueue::new(
            builder,
            config.effective_concurrency(),
            Duration::from_secs(config.build_wait_timeout_secs),
        );
        let _ = sink.queue.set(queue.clone());

        let policy = PackagePolicy::new(config.allow_list.clone(), config.ban_list.clone());

        Arc::new(Self {
            config,
            queue,
            storage,
            kv,
            resolver,
            installer,
            bundler,
            policy,
            started_at: Instant::now(),
        })
    }
}
