use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Utc};
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::handlers::PollRepository;
use crate::store::JobStore;
use crate::types::{JobKind, QueueStats, UpcomingJob, RECONCILE_JOB_ID};

/// Orchestrates poll scheduling: turns domain dates into delayed jobs and
/// keeps the job set reconciled with the poll repository.
///
/// Cheap to clone — all fields are shared handles. Lifecycle belongs to the
/// composing application: construct once, call [`recover_at_startup`] and
/// [`arm_daily_reconcile`], hand clones to whoever needs them.
///
/// [`recover_at_startup`]: Scheduler::recover_at_startup
/// [`arm_daily_reconcile`]: Scheduler::arm_daily_reconcile
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<JobStore>,
    clock: Arc<dyn Clock>,
    repository: Arc<dyn PollRepository>,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        clock: Arc<dyn Clock>,
        repository: Arc<dyn PollRepository>,
    ) -> Self {
        Self {
            store,
            clock,
            repository,
        }
    }

    /// Enqueue the publish and reveal jobs for a poll.
    ///
    /// Targets already in the past are skipped, never back-filled: the daily
    /// reconcile sweep runs often enough that a past-due target here means a
    /// backfill scenario or an upstream logic error, not work to do.
    #[instrument(skip(self))]
    pub fn schedule_poll(
        &self,
        poll_id: &str,
        publish_at: DateTime<Utc>,
        reveal_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = self.clock.now();
        let jobs = [
            (
                JobKind::Publish {
                    poll_id: poll_id.to_string(),
                },
                publish_at,
            ),
            (
                JobKind::Reveal {
                    poll_id: poll_id.to_string(),
                },
                reveal_at,
            ),
        ];

        for (kind, target) in jobs {
            let delay = target - now;
            if delay <= Duration::zero() {
                debug!(
                    job_id = %kind.job_id(),
                    target = %target,
                    "target already past; skipping"
                );
                continue;
            }
            self.store.enqueue(kind, delay)?;
        }
        Ok(())
    }

    /// Remove both jobs for a poll. Idempotent — absent jobs are fine.
    ///
    /// Best-effort cooperative: a job already claimed by a worker finishes
    /// its in-flight attempt; removal only stops jobs that have not started.
    #[instrument(skip(self))]
    pub fn unschedule_poll(&self, poll_id: &str) -> Result<()> {
        self.store.remove(&format!("publish-{poll_id}"))?;
        self.store.remove(&format!("reveal-{poll_id}"))?;
        Ok(())
    }

    /// Replace a poll's schedule with new times.
    ///
    /// Not atomic across the two steps, but safe: removal happens first, and
    /// `enqueue` replaces by ID anyway.
    #[instrument(skip(self))]
    pub fn reschedule_poll(
        &self,
        poll_id: &str,
        publish_at: DateTime<Utc>,
        reveal_at: DateTime<Utc>,
    ) -> Result<()> {
        self.unschedule_poll(poll_id)?;
        self.schedule_poll(poll_id, publish_at, reveal_at)
    }

    /// Re-derive the job set from the repository's future-dated polls.
    ///
    /// Called at process startup and by the daily reconcile job. Delayed jobs
    /// are not trusted to survive restarts; the poll table is the source of
    /// truth, so re-deriving from it catches anything the queue lost.
    pub async fn recover_at_startup(&self) -> Result<usize> {
        let polls = self
            .repository
            .list_future_polls()
            .await
            .map_err(|e| SchedulerError::Repository(e.to_string()))?;

        let mut scheduled = 0;
        for poll in &polls {
            self.schedule_poll(&poll.id, poll.publish_at, poll.reveal_at)?;
            scheduled += 1;
        }
        info!(polls = scheduled, "job set reconciled from repository");
        Ok(scheduled)
    }

    /// Arm the daily reconciliation job, first firing at the next local
    /// midnight. No-op if a live reconcile job already exists, so calling
    /// this at every startup is safe.
    pub fn arm_daily_reconcile(&self) -> Result<()> {
        if let Some(job) = self.store.get(RECONCILE_JOB_ID)? {
            if !job.state.is_terminal() {
                debug!("reconcile job already armed");
                return Ok(());
            }
        }
        let now = self.clock.now();
        let delay = next_local_midnight(now)? - now;
        self.store.enqueue(JobKind::DailyReconcile, delay)?;
        Ok(())
    }

    /// Re-arm the reconcile job for 24 hours from now. Called by the
    /// reconcile handler itself before it finishes, which keeps the repeat
    /// mechanism visible as an ordinary job in the same store.
    pub fn rearm_daily_reconcile(&self) -> Result<()> {
        self.store.enqueue(JobKind::DailyReconcile, Duration::hours(24))?;
        Ok(())
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.store.counts()
    }

    pub fn list_upcoming(&self, limit: usize) -> Result<Vec<UpcomingJob>> {
        self.store.list_upcoming(limit)
    }
}

/// The first local midnight strictly after `now`.
fn next_local_midnight(now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let local = now.with_timezone(&Local);
    let next_day = local
        .date_naive()
        .succ_opt()
        .ok_or_else(|| SchedulerError::InvalidTime("date overflow".into()))?;
    let midnight = next_day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| SchedulerError::InvalidTime("invalid midnight".into()))?;
    midnight
        .and_local_timezone(Local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            SchedulerError::InvalidTime(format!("no local midnight for {next_day}"))
        })
}
