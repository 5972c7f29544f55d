use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::scheduler::Scheduler;
use crate::types::{Job, JobKind};

/// Cache key for the currently published poll.
pub const TODAY_POLL_KEY: &str = "poll:today";
/// Cache key for the upcoming poll teaser.
pub const TOMORROW_POLL_KEY: &str = "poll:tomorrow";
/// TTL for the pre-populated primary aggregate.
pub const SUMMARY_TTL_SECS: u64 = 86_400;

/// Wildcard pattern covering every cached statistic for a poll.
pub fn stats_pattern(poll_id: &str) -> String {
    format!("stats:{poll_id}:*")
}

/// Key of the primary aggregate statistic for a poll.
pub fn summary_key(poll_id: &str) -> String {
    format!("stats:{poll_id}:summary")
}

/// A poll with its two scheduling targets, as read from the repository.
///
/// Read-only to the scheduler. `reveal_at` is derived by the poll owner as a
/// fixed wall-clock hour on the publish date; the scheduler does not check or
/// enforce the relation between the two.
#[derive(Debug, Clone)]
pub struct ScheduledPoll {
    pub id: String,
    pub publish_at: DateTime<Utc>,
    pub reveal_at: DateTime<Utc>,
}

/// Read access to the poll table — the source of truth the job set is
/// re-derived from.
#[async_trait]
pub trait PollRepository: Send + Sync {
    /// All polls whose publish time is still in the future.
    async fn list_future_polls(&self) -> anyhow::Result<Vec<ScheduledPoll>>;
}

/// Key/pattern invalidation and write-through interface of the cache store.
#[async_trait]
pub trait ResultsCache: Send + Sync {
    async fn invalidate(&self, key: &str) -> anyhow::Result<()>;
    async fn invalidate_pattern(&self, pattern: &str) -> anyhow::Result<()>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl_secs: u64)
        -> anyhow::Result<()>;
}

/// Pure read computing a poll's primary statistic from vote counts.
#[async_trait]
pub trait StatsComputer: Send + Sync {
    async fn primary_aggregate(&self, poll_id: &str) -> anyhow::Result<serde_json::Value>;
}

/// A handler for one job kind. Handlers must be idempotent: at-least-once
/// execution means a retry may repeat work that partially succeeded.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> anyhow::Result<()>;
}

/// Publish: drop the today/tomorrow cache entries so the next read sees the
/// newly published poll. Invalidating an already-empty key is a no-op.
pub struct PublishHandler {
    cache: Arc<dyn ResultsCache>,
}

impl PublishHandler {
    pub fn new(cache: Arc<dyn ResultsCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl JobHandler for PublishHandler {
    async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        let poll_id = job
            .kind
            .poll_id()
            .ok_or_else(|| anyhow::anyhow!("publish job without a poll id: {}", job.id))?;
        self.cache.invalidate(TODAY_POLL_KEY).await?;
        self.cache.invalidate(TOMORROW_POLL_KEY).await?;
        info!(poll_id, "poll published; today/tomorrow cache invalidated");
        Ok(())
    }
}

/// Reveal: pattern-invalidate the poll's cached statistics, then recompute
/// and re-cache the primary aggregate so the first post-reveal read is fast.
///
/// One unit of work: either step failing fails the whole job and goes through
/// the retry policy. Both steps are idempotent, so a retry is safe.
pub struct RevealHandler {
    cache: Arc<dyn ResultsCache>,
    stats: Arc<dyn StatsComputer>,
}

impl RevealHandler {
    pub fn new(cache: Arc<dyn ResultsCache>, stats: Arc<dyn StatsComputer>) -> Self {
        Self { cache, stats }
    }
}

#[async_trait]
impl JobHandler for RevealHandler {
    async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        let poll_id = job
            .kind
            .poll_id()
            .ok_or_else(|| anyhow::anyhow!("reveal job without a poll id: {}", job.id))?;
        self.cache.invalidate_pattern(&stats_pattern(poll_id)).await?;

        let aggregate = self.stats.primary_aggregate(poll_id).await?;
        self.cache
            .set(&summary_key(poll_id), aggregate, SUMMARY_TTL_SECS)
            .await?;
        info!(poll_id, "poll revealed; stats invalidated and summary re-cached");
        Ok(())
    }
}

/// Daily reconcile: re-run the startup recovery sweep, then re-arm the next
/// occurrence 24 hours out. Re-arming from inside the handler keeps the
/// repeat mechanism an ordinary job in the same store, subject to the same
/// retry policy and visible in the same listings.
pub struct ReconcileHandler {
    scheduler: Scheduler,
}

impl ReconcileHandler {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl JobHandler for ReconcileHandler {
    async fn execute(&self, _job: &Job) -> anyhow::Result<()> {
        let scheduled = self.scheduler.recover_at_startup().await?;
        debug!(polls = scheduled, "daily reconcile sweep finished");
        self.scheduler.rearm_daily_reconcile()?;
        Ok(())
    }
}

/// Maps each job kind to its handler. Dispatch is exhaustive over
/// [`JobKind`], so adding a variant forces a handler decision here.
pub struct HandlerRegistry {
    publish: PublishHandler,
    reveal: RevealHandler,
    reconcile: ReconcileHandler,
}

impl HandlerRegistry {
    pub fn new(
        cache: Arc<dyn ResultsCache>,
        stats: Arc<dyn StatsComputer>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            publish: PublishHandler::new(cache.clone()),
            reveal: RevealHandler::new(cache, stats),
            reconcile: ReconcileHandler::new(scheduler),
        }
    }

    pub fn handler_for(&self, kind: &JobKind) -> &dyn JobHandler {
        match kind {
            JobKind::Publish { .. } => &self.publish,
            JobKind::Reveal { .. } => &self.reveal,
            JobKind::DailyReconcile => &self.reconcile,
        }
    }
}
