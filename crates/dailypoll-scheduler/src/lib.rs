//! `dailypoll-scheduler` — Tokio-based delayed job scheduler with SQLite
//! persistence.
//!
//! # Overview
//!
//! Publishes each day's poll at its scheduled time and reveals results at the
//! fixed reveal hour. Jobs are persisted to a SQLite `jobs` table keyed by a
//! deterministic idempotency key; a pool of workers polls the store, claims
//! due jobs and runs the handler for the job's kind. Failed attempts retry
//! with exponential backoff up to a fixed attempt limit; the job set is
//! re-derived from the poll repository at startup and once per day, so
//! schedules survive restarts without trusting queue durability.
//!
//! # Job kinds
//!
//! | Kind             | ID                  | Behaviour                                      |
//! |------------------|---------------------|------------------------------------------------|
//! | `Publish`        | `publish-<pollId>`  | Invalidate the today/tomorrow poll cache       |
//! | `Reveal`         | `reveal-<pollId>`   | Invalidate per-poll stats, re-cache the summary |
//! | `DailyReconcile` | `daily-reconcile`   | Re-derive the job set; re-arms itself +24 h    |

pub mod cleaner;
pub mod clock;
pub mod db;
pub mod error;
pub mod handlers;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SchedulerError};
pub use handlers::{
    HandlerRegistry, JobHandler, PollRepository, ResultsCache, ScheduledPoll, StatsComputer,
};
pub use retry::{Decision, RetryPolicy};
pub use scheduler::Scheduler;
pub use store::JobStore;
pub use types::{Job, JobKind, JobState, QueueStats, UpcomingJob, RECONCILE_JOB_ID};
pub use worker::{Worker, WorkerPool};
