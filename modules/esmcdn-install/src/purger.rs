//! Working directories are ephemeral: a timer per version key removes the
//! tree a fixed interval after its last use. Reuse resets the timer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct WorkdirPurger {
    workdir_root: PathBuf,
    ttl: Duration,
    last_used: Mutex<HashMap<String, Instant>>,
}

impl WorkdirPurger {
    pub fn new(workdir_root: impl Into<PathBuf>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            workdir_root: workdir_root.into(),
            ttl,
            last_used: Mutex::new(HashMap::new()),
        })
    }

    /// Record a use of the version key (`name@version`), arming its timer.
    pub async fn touch(&self, version_key: &str) {
        let mut map = self.last_used.lock().await;
        map.insert(version_key.to_string(), Instant::now());
    }

    /// Spawn the background sweep loop. The task runs for the process
    /// lifetime; in-flight builds keep their trees alive via `touch`.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let purger = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                purger.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        let expired: Vec<String> = {
            let mut map = self.last_used.lock().await;
            let expired: Vec<String> = map
                .iter()
                .filter(|(_, at)| at.elapsed() >= self.ttl)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                map.remove(key);
            }
            expired
        };

        for key in expired {
            let dir = self.workdir_root.join(&key);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(workdir = %dir.display(), "Purged working directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(workdir = %dir.display(), error = %e, "Failed to purge working directory"),
            }
        }
    }
}
