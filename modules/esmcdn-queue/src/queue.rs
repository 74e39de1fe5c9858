use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

use esmcdn_common::{BuildResult, CdnError, Result};
use esmcdn_identity::BuildIdentity;

/// Finished tasks stay addressable this long, so near-simultaneous arrivals
/// get the cached outcome without requeueing.
const GRACE_RETENTION: Duration = Duration::from_secs(30);
/// Duplicate adds from one requester inside this window are dropped (they
/// attach to the running task without counting as a new client).
const REQUESTER_WINDOW: Duration = Duration::from_secs(3);

/// One build's outcome, shared by every waiter of the task.
pub type BuildOutcome = std::result::Result<BuildResult, CdnError>;

/// Executes one build job for an identity. The tracker receives coarse
/// stage names for `/status.json`.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, identity: &BuildIdentity, stage: StageTracker) -> Result<BuildResult>;
}

/// Shared, cheaply clonable stage label of a running task.
#[derive(Debug, Clone, Default)]
pub struct StageTracker(Arc<StdMutex<String>>);

impl StageTracker {
    pub fn set(&self, stage: &str) {
        *self.0.lock().expect("stage lock") = stage.to_string();
    }

    pub fn get(&self) -> String {
        self.0.lock().expect("stage lock").clone()
    }
}

struct QueueTask {
    identity: BuildIdentity,
    key: String,
    created_at: DateTime<Utc>,
    started_at: StdMutex<Option<DateTime<Utc>>>,
    stage: StageTracker,
    in_process: AtomicBool,
    clients: AtomicUsize,
    rx: watch::Receiver<Option<Arc<BuildOutcome>>>,
}

/// Task descriptor exposed at `/status.json`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueTaskStatus {
    pub identity: String,
    pub stage: String,
    #[serde(rename = "inProcess")]
    pub in_process: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    pub clients: usize,
    pub deps: Vec<String>,
}

/// Handle returned by `add`; redeem it with `wait`.
pub struct WaitHandle {
    key: String,
    state: WaitState,
}

enum WaitState {
    /// The outcome was already available when the request arrived.
    Ready(Arc<BuildOutcome>),
    Waiting {
        task: Arc<QueueTask>,
        rx: watch::Receiver<Option<Arc<BuildOutcome>>>,
        counted: bool,
    },
}

pub struct BuildQueue {
    runner: Arc<dyn BuildRunner>,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, Arc<QueueTask>>>,
    recent: Mutex<HashMap<String, (Arc<BuildOutcome>, Instant)>>,
    requester_log: Mutex<HashMap<String, Instant>>,
    wait_timeout: Duration,
}

impl BuildQueue {
    pub fn new(runner: Arc<dyn BuildRunner>, concurrency: usize, wait_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            runner,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            requester_log: Mutex::new(HashMap::new()),
            wait_timeout,
        })
    }

    /// Register interest in a build. Attaches to the in-flight task for the
    /// identity when one exists; otherwise enqueues a new one. The build
    /// starts as soon as a worker slot frees up, FIFO.
    pub async fn add(self: &Arc<Self>, identity: BuildIdentity, requester: &str) -> WaitHandle {
        let key = identity.key();

        // Recently finished: answer from the grace cache.
        {
            let mut recent = self.recent.lock().await;
            recent.retain(|_, (_, at)| at.elapsed() < GRACE_RETENTION);
            if let Some((outcome, _)) = recent.get(&key) {
                return WaitHandle {
                    key,
                    state: WaitState::Ready(outcome.clone()),
                };
            }
        }

        let counted = !self.is_duplicate(requester, &key).await;

        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(&key) {
            if counted {
                task.clients.fetch_add(1, Ordering::SeqCst);
            }
            let rx = task.rx.clone();
            return WaitHandle {
                key,
                state: WaitState::Waiting {
                    task: task.clone(),
                    rx,
                    counted,
                },
            };
        }

        let (tx, rx) = watch::channel(None);
        let task = Arc::new(QueueTask {
            identity: identity.clone(),
            key: key.clone(),
            created_at: Utc::now(),
            started_at: StdMutex::new(None),
            stage: StageTracker::default(),
            in_process: AtomicBool::new(false),
            clients: AtomicUsize::new(1),
            rx: rx.clone(),
        });
        task.stage.set("pending");
        tasks.insert(key.clone(), task.clone());
        drop(tasks);

        debug!(identity = %key, "Queued build");
        let queue = self.clone();
        let job = task.clone();
        tokio::spawn(async move {
            queue.run_task(job, tx).await;
        });

        WaitHandle {
            key,
            state: WaitState::Waiting { task, rx, counted },
        }
    }

    async fn run_task(self: Arc<Self>, task: Arc<QueueTask>, tx: watch::Sender<Option<Arc<BuildOutcome>>>) {
        // FIFO admission: semaphore waiters are served in request order.
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("queue semaphore closed");

        *task.started_at.lock().expect("started_at lock") = Some(Utc::now());
        task.in_process.store(true, Ordering::SeqCst);
        task.stage.set("building");
        info!(identity = %task.key, "Build started");
        let started = Instant::now();

        let outcome = Arc::new(self.runner.run(&task.identity, task.stage.clone()).await);
        match outcome.as_ref() {
            Ok(_) => info!(
                identity = %task.key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Build finished"
            ),
            Err(e) => warn!(identity = %task.key, error = %e, "Build failed"),
        }

        // Publish, then retire the task into the grace cache.
        {
            let mut recent = self.recent.lock().await;
            recent.insert(task.key.clone(), (outcome.clone(), Instant::now()));
        }
        {
            let mut tasks = self.tasks.lock().await;
            tasks.remove(&task.key);
        }
        let _ = tx.send(Some(outcome));
    }

    /// Await the outcome behind `handle`. On timeout the waiter is detached
    /// and `Timeout` returned; the build itself keeps running.
    pub async fn wait(&self, handle: WaitHandle) -> Arc<BuildOutcome> {
        match handle.state {
            WaitState::Ready(outcome) => outcome,
            WaitState::Waiting { task, mut rx, counted } => {
                let result = tokio::time::timeout(self.wait_timeout, async {
                    loop {
                        if let Some(outcome) = rx.borrow().clone() {
                            return outcome;
                        }
                        if rx.changed().await.is_err() {
                            // Sender dropped without publishing; treat as an
                            // internal failure rather than hanging forever.
                            return Arc::new(Err(CdnError::Other(anyhow::anyhow!(
                                "build task vanished"
                            ))));
                        }
                    }
                })
                .await;

                if counted {
                    task.clients.fetch_sub(1, Ordering::SeqCst);
                }
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Arc::new(Err(CdnError::Timeout(handle.key))),
                }
            }
        }
    }

    /// Detach a waiter without awaiting. Never cancels the underlying job.
    pub async fn remove_consumer(&self, handle: WaitHandle) {
        if let WaitState::Waiting { task, counted: true, .. } = handle.state {
            task.clients.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Snapshot of live tasks for `/status.json`, oldest first.
    pub async fn status(&self) -> Vec<QueueTaskStatus> {
        let tasks = self.tasks.lock().await;
        let mut list: Vec<QueueTaskStatus> = tasks
            .values()
            .map(|task| QueueTaskStatus {
                identity: task.key.clone(),
                stage: task.stage.get(),
                in_process: task.in_process.load(Ordering::SeqCst),
                created_at: task.created_at,
                started_at: *task.started_at.lock().expect("started_at lock"),
                clients: task.clients.load(Ordering::SeqCst),
                deps: task.identity.args.deps.iter().map(|d| d.spec()).collect(),
            })
            .collect();
        list.sort_by_key(|t| t.created_at);
        list
    }

    async fn is_duplicate(&self, requester: &str, key: &str) -> bool {
        if requester.is_empty() {
            return false;
        }
        let log_key = format!("{requester} {key}");
        let mut log = self.requester_log.lock().await;
        log.retain(|_, at| at.elapsed() < REQUESTER_WINDOW);
        match log.get(&log_key) {
            Some(_) => {
                debug!(requester, identity = key, "Dropped duplicate add");
                true
            }
            None => {
                log.insert(log_key, Instant::now());
                false
            }
        }
    }
}
