use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed job ID of the self-re-arming daily reconciliation job.
///
/// A single ID means there is never more than one live reconcile job,
/// no matter how many times `arm_daily_reconcile` is called.
pub const RECONCILE_JOB_ID: &str = "daily-reconcile";

/// What a job does, together with the payload its handler needs.
///
/// Serialised as tagged JSON into the `kind` column, so handler dispatch is
/// exhaustive over this enum rather than driven by loose strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Make a poll visible to clients at its publish time.
    Publish { poll_id: String },

    /// Reveal a poll's results at the fixed reveal hour.
    Reveal { poll_id: String },

    /// Daily sweep that re-derives the job set from the poll repository.
    DailyReconcile,
}

impl JobKind {
    /// Deterministic idempotency key: re-enqueueing the same kind for the
    /// same poll replaces the existing job instead of duplicating it.
    pub fn job_id(&self) -> String {
        match self {
            JobKind::Publish { poll_id } => format!("publish-{poll_id}"),
            JobKind::Reveal { poll_id } => format!("reveal-{poll_id}"),
            JobKind::DailyReconcile => RECONCILE_JOB_ID.to_string(),
        }
    }

    /// Short label used in logs and listings.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Publish { .. } => "publish",
            JobKind::Reveal { .. } => "reveal",
            JobKind::DailyReconcile => "daily_reconcile",
        }
    }

    /// The poll this job refers to, if any.
    pub fn poll_id(&self) -> Option<&str> {
        match self {
            JobKind::Publish { poll_id } | JobKind::Reveal { poll_id } => Some(poll_id),
            JobKind::DailyReconcile => None,
        }
    }
}

/// Lifecycle state of a job.
///
/// The store persists four states; `Ready` is derived — a pending job whose
/// `not_before` has elapsed but which no worker has claimed yet. See
/// [`Job::state_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `not_before` to elapse.
    Pending,
    /// Due and eligible for a worker claim (derived, never persisted).
    Ready,
    /// Claimed by a worker; an execution attempt is in flight.
    Active,
    /// Finished successfully. Terminal.
    Completed,
    /// Attempts exhausted. Terminal; kept visible for inspection.
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Ready => "ready",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "ready" => Ok(JobState::Ready),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Idempotency key — primary key, derived from the kind.
    pub id: String,
    /// What to do and for which poll.
    pub kind: JobKind,
    /// Persisted lifecycle state.
    pub state: JobState,
    /// The job is not eligible for execution before this instant.
    pub not_before: DateTime<Utc>,
    /// Execution attempts made so far.
    pub attempts: u32,
    /// Attempts before the job is marked terminally failed.
    pub max_attempts: u32,
    /// Error message from the most recent failed attempt, if any.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the most recent attempt was claimed, if any.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state, if it has.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Effective state at `now`: a pending job whose delay has elapsed
    /// reports as `Ready`.
    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        if self.state == JobState::Pending && self.not_before <= now {
            JobState::Ready
        } else {
            self.state
        }
    }
}

/// Per-state job counts, for observability.
///
/// `pending` counts due-but-unclaimed (ready) jobs; `delayed` counts jobs
/// still waiting for their `not_before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// A row of `list_upcoming`: a live job and when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpcomingJob {
    pub job_id: String,
    pub kind: JobKind,
    pub scheduled_for: DateTime<Utc>,
}
