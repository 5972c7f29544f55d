use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dailypoll_core::config::SchedulerConfig;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::cleaner::spawn_retention_sweeper;
use crate::error::Result;
use crate::handlers::HandlerRegistry;
use crate::store::JobStore;
use crate::types::Job;

/// How long a worker sleeps after the store itself errors, before retrying.
const STORE_BACKOFF: Duration = Duration::from_secs(5);
/// Grace period for in-flight handlers at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// One polling executor: claims due jobs and runs their handlers.
pub struct Worker {
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    poll_interval: Duration,
    claim_batch_size: usize,
    handler_timeout: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<HandlerRegistry>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            claim_batch_size: config.claim_batch_size,
            handler_timeout: Duration::from_secs(config.handler_timeout_secs),
        }
    }

    /// Poll until `shutdown` broadcasts `true`.
    ///
    /// Store errors on claim are logged and backed off, never propagated:
    /// the backing store being briefly unreachable must not kill the pool
    /// while the rest of the process stays healthy.
    pub async fn run(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "worker started");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(worker_id, "claim failed: {e}; backing off");
                        tokio::time::sleep(STORE_BACKOFF).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(worker_id, "worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One claim-and-execute pass. Returns how many jobs were run.
    pub async fn poll_once(&self) -> Result<usize> {
        let claimed = self.store.claim_due(self.claim_batch_size)?;
        let count = claimed.len();
        for job in claimed {
            let span = info_span!("job", job_id = %job.id, kind = job.kind.name());
            self.run_job(&job).instrument(span).await?;
        }
        Ok(count)
    }

    /// Run one claimed job under the execution guard: whatever the handler
    /// does — return, panic, or hang past the timeout — exactly one of
    /// `complete`/`fail` is recorded.
    async fn run_job(&self, job: &Job) -> Result<()> {
        let handler = self.registry.handler_for(&job.kind);

        let guarded = AssertUnwindSafe(handler.execute(job)).catch_unwind();
        let outcome = match tokio::time::timeout(self.handler_timeout, guarded).await {
            Err(_elapsed) => Err(format!(
                "handler timed out after {}s",
                self.handler_timeout.as_secs()
            )),
            Ok(Err(panic)) => Err(format!("handler panicked: {}", panic_message(&*panic))),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Ok(Ok(()))) => Ok(()),
        };

        match outcome {
            Ok(()) => self.store.complete(&job.id),
            Err(msg) => self.store.fail(&job.id, &msg),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "<opaque panic payload>"
    }
}

/// A pool of [`Worker`] tasks plus the retention sweeper, sharing one
/// shutdown channel.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers and the hourly retention sweeper.
    pub fn start(
        store: Arc<JobStore>,
        registry: Arc<HandlerRegistry>,
        config: &SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(config.worker_count + 1);
        for worker_id in 0..config.worker_count {
            let worker = Worker::new(store.clone(), registry.clone(), config);
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { worker.run(worker_id, rx).await }));
        }
        handles.push(spawn_retention_sweeper(store, shutdown_rx));

        info!(workers = config.worker_count, "worker pool started");
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Stop claiming new jobs and wait for in-flight handlers to finish,
    /// bounded by a grace period.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let join_all = futures_util::future::join_all(self.handles);
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
            error!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "workers did not stop within the grace period"
            );
        } else {
            info!("worker pool stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::handlers::{PollRepository, ResultsCache, ScheduledPoll, StatsComputer};
    use crate::scheduler::Scheduler;
    use crate::types::{JobKind, JobState};
    use async_trait::async_trait;
    use chrono::Utc;
    use rusqlite::Connection;
    use std::sync::Mutex;

    struct EmptyRepository;

    #[async_trait]
    impl PollRepository for EmptyRepository {
        async fn list_future_polls(&self) -> anyhow::Result<Vec<ScheduledPoll>> {
            Ok(Vec::new())
        }
    }

    /// Cache stub whose `invalidate` behaviour is scripted per test.
    enum CacheMode {
        Ok,
        Fail,
        Panic,
        Hang,
    }

    struct ScriptedCache {
        mode: CacheMode,
        invalidations: Mutex<Vec<String>>,
    }

    impl ScriptedCache {
        fn new(mode: CacheMode) -> Self {
            Self {
                mode,
                invalidations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResultsCache for ScriptedCache {
        async fn invalidate(&self, key: &str) -> anyhow::Result<()> {
            match self.mode {
                CacheMode::Ok => {
                    self.invalidations.lock().unwrap().push(key.to_string());
                    Ok(())
                }
                CacheMode::Fail => anyhow::bail!("redis connection refused"),
                CacheMode::Panic => panic!("cache client bug"),
                CacheMode::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }

        async fn invalidate_pattern(&self, _pattern: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn set(
            &self,
            _key: &str,
            _value: serde_json::Value,
            _ttl_secs: u64,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoStats;

    #[async_trait]
    impl StatsComputer for NoStats {
        async fn primary_aggregate(&self, _poll_id: &str) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    fn rig(mode: CacheMode, config: &SchedulerConfig) -> (Worker, Arc<JobStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let conn = Connection::open_in_memory().expect("open failed");
        let store =
            Arc::new(JobStore::new(conn, clock.clone(), config).expect("store init failed"));
        let scheduler = Scheduler::new(store.clone(), clock.clone(), Arc::new(EmptyRepository));
        let registry = Arc::new(HandlerRegistry::new(
            Arc::new(ScriptedCache::new(mode)),
            Arc::new(NoStats),
            scheduler,
        ));
        let worker = Worker::new(store.clone(), registry, config);
        (worker, store, clock)
    }

    fn due_publish(store: &JobStore, clock: &ManualClock) {
        store
            .enqueue(
                JobKind::Publish {
                    poll_id: "p-1".into(),
                },
                chrono::Duration::seconds(1),
            )
            .unwrap();
        clock.advance(chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn successful_handler_completes_the_job() {
        let config = SchedulerConfig::default();
        let (worker, store, clock) = rig(CacheMode::Ok, &config);
        due_publish(&store, &clock);

        assert_eq!(worker.poll_once().await.unwrap(), 1);
        let job = store.get("publish-p-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn failing_handler_is_rearmed_with_backoff() {
        let config = SchedulerConfig::default();
        let (worker, store, clock) = rig(CacheMode::Fail, &config);
        due_publish(&store, &clock);

        assert_eq!(worker.poll_once().await.unwrap(), 1);
        let job = store.get("publish-p-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.as_deref().unwrap().contains("redis"));
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_a_failure() {
        let config = SchedulerConfig::default();
        let (worker, store, clock) = rig(CacheMode::Panic, &config);
        due_publish(&store, &clock);

        assert_eq!(worker.poll_once().await.unwrap(), 1);
        let job = store.get("publish-p-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job
            .last_error
            .as_deref()
            .unwrap()
            .contains("handler panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_hits_the_timeout() {
        let config = SchedulerConfig {
            handler_timeout_secs: 1,
            ..SchedulerConfig::default()
        };
        let (worker, store, clock) = rig(CacheMode::Hang, &config);
        due_publish(&store, &clock);

        assert_eq!(worker.poll_once().await.unwrap(), 1);
        let job = store.get("publish-p-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
    }
}
