use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dailypoll_core::config::{
    COMPLETED_RETENTION_DAYS, FAILED_RETENTION_DAYS, SchedulerConfig,
};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::retry::{Decision, RetryPolicy};
use crate::types::{Job, JobKind, JobState, QueueStats, UpcomingJob};

const JOB_COLUMNS: &str = "id, kind, state, not_before, attempts, max_attempts,
                           last_error, created_at, last_attempt_at, finished_at";

/// Durable job queue over a single SQLite connection.
///
/// Wraps the connection in a `Mutex`, which doubles as the mutual-exclusion
/// guarantee for state transitions: two workers can never claim the same job
/// because `claim_due` holds the lock across its SELECT and UPDATE. A
/// connection pool would buy more throughput, but the volume here is two jobs
/// per poll per day.
pub struct JobStore {
    db: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    max_attempts: u32,
}

impl JobStore {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(
        conn: Connection,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            clock,
            retry: RetryPolicy::from_config(config),
            max_attempts: config.max_attempts,
        })
    }

    /// Insert or replace the job derived from `kind`, eligible after `delay`.
    ///
    /// Replacement is the idempotent-reschedule path: the job ID is the
    /// idempotency key, so a second enqueue for the same kind+poll overwrites
    /// the first (attempts reset, new `not_before`). A non-positive delay is
    /// a caller contract violation and is rejected, not deferred.
    pub fn enqueue(&self, kind: JobKind, delay: Duration) -> Result<Job> {
        let job_id = kind.job_id();
        if delay <= Duration::zero() {
            return Err(SchedulerError::NonPositiveDelay {
                job_id,
                delay_secs: delay.num_seconds(),
            });
        }

        let now = self.clock.now();
        let not_before = now + delay;
        let kind_json = serde_json::to_string(&kind)?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO jobs
             (id, kind, state, not_before, attempts, max_attempts,
              last_error, created_at, last_attempt_at, finished_at)
             VALUES (?1, ?2, 'pending', ?3, 0, ?4, NULL, ?5, NULL, NULL)",
            rusqlite::params![
                job_id,
                kind_json,
                not_before.to_rfc3339(),
                self.max_attempts,
                now.to_rfc3339(),
            ],
        )?;

        info!(job_id = %job_id, kind = kind.name(), not_before = %not_before, "job enqueued");

        Ok(Job {
            id: job_id,
            kind,
            state: JobState::Pending,
            not_before,
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            created_at: now,
            last_attempt_at: None,
            finished_at: None,
        })
    }

    /// Atomically claim up to `limit` due jobs, transitioning them
    /// `Pending → Active` and counting the new attempt.
    ///
    /// The store lock is held across the SELECT and the UPDATEs, so no two
    /// concurrent callers can claim the same job.
    pub fn claim_due(&self, limit: usize) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let now_str = now.to_rfc3339();

        let db = self.db.lock().unwrap();

        let ids: Vec<String> = {
            let mut stmt = db.prepare_cached(
                "SELECT id FROM jobs
                 WHERE state = 'pending' AND not_before <= ?1
                 ORDER BY not_before ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![now_str, limit as i64], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let n = db.execute(
                "UPDATE jobs
                 SET state = 'active', attempts = attempts + 1, last_attempt_at = ?2
                 WHERE id = ?1 AND state = 'pending'",
                rusqlite::params![id, now_str],
            )?;
            if n == 0 {
                continue;
            }
            let job = db.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                rusqlite::params![id],
                row_to_job,
            )?;
            debug!(job_id = %job.id, attempt = job.attempts, "job claimed");
            claimed.push(job);
        }
        Ok(claimed)
    }

    /// Transition an active job to `Completed`.
    ///
    /// A missing active row is not an error: the job may have been removed
    /// (cancellation race) or replaced by a re-enqueue while the handler ran.
    pub fn complete(&self, job_id: &str) -> Result<()> {
        let now = self.clock.now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET state = 'completed', finished_at = ?2
             WHERE id = ?1 AND state = 'active'",
            rusqlite::params![job_id, now],
        )?;
        if n == 0 {
            debug!(job_id, "completion for a job no longer active (removed or replaced)");
        } else {
            info!(job_id, "job completed");
        }
        Ok(())
    }

    /// Record a failed attempt for an active job.
    ///
    /// The retry policy decides the outcome: re-arm as `Pending` with a
    /// backoff `not_before`, or mark terminally `Failed`. Like [`complete`],
    /// a missing active row is tolerated.
    ///
    /// [`complete`]: JobStore::complete
    pub fn fail(&self, job_id: &str, error_msg: &str) -> Result<()> {
        let now = self.clock.now();
        let db = self.db.lock().unwrap();

        let counters: Option<(u32, u32)> = match db.query_row(
            "SELECT attempts, max_attempts FROM jobs WHERE id = ?1 AND state = 'active'",
            rusqlite::params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(pair) => Some(pair),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        let Some((attempts, max_attempts)) = counters else {
            debug!(job_id, "failure for a job no longer active (removed or replaced)");
            return Ok(());
        };

        match self.retry.decide(attempts, max_attempts) {
            Decision::Retry(delay) => {
                let next = now + Duration::milliseconds(delay.as_millis() as i64);
                db.execute(
                    "UPDATE jobs SET state = 'pending', not_before = ?2, last_error = ?3
                     WHERE id = ?1 AND state = 'active'",
                    rusqlite::params![job_id, next.to_rfc3339(), error_msg],
                )?;
                warn!(
                    job_id,
                    attempt = attempts,
                    backoff_secs = delay.as_secs(),
                    error = error_msg,
                    "job attempt failed; retry scheduled"
                );
            }
            Decision::GiveUp => {
                db.execute(
                    "UPDATE jobs SET state = 'failed', last_error = ?2, finished_at = ?3
                     WHERE id = ?1 AND state = 'active'",
                    rusqlite::params![job_id, error_msg, now.to_rfc3339()],
                )?;
                error!(
                    job_id,
                    attempts,
                    error = error_msg,
                    "job failed terminally; attempts exhausted"
                );
            }
        }
        Ok(())
    }

    /// Delete a job in any state. Idempotent — an absent job is a no-op.
    ///
    /// Returns whether a row was actually deleted. An `Active` job is deleted
    /// too, but the in-flight handler still finishes; only its final
    /// `complete`/`fail` becomes a no-op.
    pub fn remove(&self, job_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM jobs WHERE id = ?1", rusqlite::params![job_id])?;
        if n > 0 {
            info!(job_id, "job removed");
        }
        Ok(n > 0)
    }

    /// Fetch a single job by ID.
    pub fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            rusqlite::params![job_id],
            row_to_job,
        ) {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Per-state counts. Pending rows are split into due (`pending`) and
    /// still-waiting (`delayed`) against the current clock.
    pub fn counts(&self) -> Result<QueueStats> {
        let now = self.clock.now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let stats = db.query_row(
            "SELECT
                SUM(state = 'pending' AND not_before <= ?1),
                SUM(state = 'pending' AND not_before > ?1),
                SUM(state = 'active'),
                SUM(state = 'completed'),
                SUM(state = 'failed'),
                COUNT(*)
             FROM jobs",
            rusqlite::params![now],
            |row| {
                // SUM over zero rows is NULL; counts are never negative.
                let count = |idx: usize| -> rusqlite::Result<u64> {
                    Ok(row.get::<_, Option<i64>>(idx)?.unwrap_or(0) as u64)
                };
                Ok(QueueStats {
                    pending: count(0)?,
                    delayed: count(1)?,
                    active: count(2)?,
                    completed: count(3)?,
                    failed: count(4)?,
                    total: count(5)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Live (pending) jobs ordered by `not_before` ascending.
    pub fn list_upcoming(&self, limit: usize) -> Result<Vec<UpcomingJob>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(
            "SELECT id, kind, not_before FROM jobs
             WHERE state = 'pending'
             ORDER BY not_before ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut upcoming = Vec::with_capacity(rows.len());
        for (job_id, kind_json, not_before) in rows {
            upcoming.push(UpcomingJob {
                job_id,
                kind: serde_json::from_str(&kind_json)?,
                scheduled_for: parse_rfc3339(&not_before)?,
            });
        }
        Ok(upcoming)
    }

    /// Drop terminal jobs past their retention window: completed jobs after
    /// 7 days, failed jobs after 30. Returns `(completed, failed)` counts.
    pub fn prune(&self) -> Result<(usize, usize)> {
        let now = self.clock.now();
        let completed_cutoff = (now - Duration::days(COMPLETED_RETENTION_DAYS)).to_rfc3339();
        let failed_cutoff = (now - Duration::days(FAILED_RETENTION_DAYS)).to_rfc3339();

        let db = self.db.lock().unwrap();
        let completed = db.execute(
            "DELETE FROM jobs
             WHERE state = 'completed' AND finished_at IS NOT NULL AND finished_at < ?1",
            rusqlite::params![completed_cutoff],
        )?;
        let failed = db.execute(
            "DELETE FROM jobs
             WHERE state = 'failed' AND finished_at IS NOT NULL AND finished_at < ?1",
            rusqlite::params![failed_cutoff],
        )?;
        if completed + failed > 0 {
            info!(completed, failed, "pruned terminal jobs past retention");
        }
        Ok((completed, failed))
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let kind_json: String = row.get(1)?;
    let state_str: String = row.get(2)?;
    let not_before: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    let last_attempt_at: Option<String> = row.get(8)?;
    let finished_at: Option<String> = row.get(9)?;

    Ok(Job {
        id: row.get(0)?,
        kind: serde_json::from_str(&kind_json).map_err(|e| text_conversion_err(1, e))?,
        state: state_str
            .parse()
            .map_err(|e: String| text_conversion_err(2, StateParseError(e)))?,
        not_before: parse_rfc3339_sql(3, &not_before)?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        last_error: row.get(6)?,
        created_at: parse_rfc3339_sql(7, &created_at)?,
        last_attempt_at: last_attempt_at
            .map(|s| parse_rfc3339_sql(8, &s))
            .transpose()?,
        finished_at: finished_at.map(|s| parse_rfc3339_sql(9, &s)).transpose()?,
    })
}

#[derive(Debug)]
struct StateParseError(String);

impl std::fmt::Display for StateParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StateParseError {}

fn text_conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_rfc3339_sql(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| text_conversion_err(idx, e))
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::InvalidTime(format!("bad stored timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_store(clock: Arc<ManualClock>) -> JobStore {
        let conn = Connection::open_in_memory().expect("open failed");
        JobStore::new(conn, clock, &SchedulerConfig::default()).expect("store init failed")
    }

    fn publish(poll_id: &str) -> JobKind {
        JobKind::Publish {
            poll_id: poll_id.into(),
        }
    }

    #[test]
    fn enqueue_rejects_non_positive_delay() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(clock);
        let err = store
            .enqueue(publish("p-1"), Duration::seconds(0))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NonPositiveDelay { .. }));
        let err = store
            .enqueue(publish("p-1"), Duration::seconds(-5))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NonPositiveDelay { .. }));
        assert!(store.get("publish-p-1").unwrap().is_none());
    }

    #[test]
    fn enqueue_twice_keeps_one_job_with_latest_timing() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = test_store(clock);

        store.enqueue(publish("p-1"), Duration::seconds(60)).unwrap();
        store.enqueue(publish("p-1"), Duration::seconds(300)).unwrap();

        let stats = store.counts().unwrap();
        assert_eq!(stats.total, 1);
        let job = store.get("publish-p-1").unwrap().expect("job missing");
        assert_eq!(job.not_before, start + Duration::seconds(300));
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn claim_due_only_returns_due_jobs() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = test_store(clock.clone());

        store.enqueue(publish("p-1"), Duration::seconds(5)).unwrap();
        store.enqueue(publish("p-2"), Duration::seconds(500)).unwrap();

        assert!(store.claim_due(10).unwrap().is_empty());

        clock.advance(Duration::seconds(6));
        let claimed = store.claim_due(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "publish-p-1");
        assert_eq!(claimed[0].state, JobState::Active);
        assert_eq!(claimed[0].attempts, 1);

        // Already active — a second claim finds nothing.
        assert!(store.claim_due(10).unwrap().is_empty());
    }

    #[test]
    fn concurrent_claims_never_hand_out_the_same_job() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(test_store(clock.clone()));
        store.enqueue(publish("p-1"), Duration::seconds(1)).unwrap();
        clock.advance(Duration::seconds(2));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.claim_due(10).unwrap().len()
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn failed_attempts_back_off_then_terminate() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = test_store(clock.clone());
        store.enqueue(publish("p-1"), Duration::seconds(1)).unwrap();

        // Attempt 1: retry in 2s.
        clock.advance(Duration::seconds(2));
        let t1 = clock.now();
        assert_eq!(store.claim_due(10).unwrap().len(), 1);
        store.fail("publish-p-1", "cache unreachable").unwrap();
        let job = store.get("publish-p-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.not_before, t1 + Duration::seconds(2));
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("cache unreachable"));

        // Attempt 2: retry in 4s.
        clock.advance(Duration::seconds(3));
        let t2 = clock.now();
        assert_eq!(store.claim_due(10).unwrap().len(), 1);
        store.fail("publish-p-1", "cache unreachable").unwrap();
        let job = store.get("publish-p-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.not_before, t2 + Duration::seconds(4));

        // Attempt 3: attempts exhausted, terminal.
        clock.advance(Duration::seconds(5));
        assert_eq!(store.claim_due(10).unwrap().len(), 1);
        store.fail("publish-p-1", "cache unreachable").unwrap();
        let job = store.get("publish-p-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.finished_at.is_some());
        let frozen = job.not_before;

        // Terminal jobs are never claimed again.
        clock.advance(Duration::days(1));
        assert!(store.claim_due(10).unwrap().is_empty());
        assert_eq!(store.get("publish-p-1").unwrap().unwrap().not_before, frozen);
    }

    #[test]
    fn remove_is_idempotent_and_tolerated_mid_flight() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = test_store(clock.clone());
        store.enqueue(publish("p-1"), Duration::seconds(1)).unwrap();
        clock.advance(Duration::seconds(2));
        assert_eq!(store.claim_due(10).unwrap().len(), 1);

        // Cancellation while active: the claim already happened, so the
        // in-flight attempt finishes and its completion is a no-op.
        assert!(store.remove("publish-p-1").unwrap());
        assert!(!store.remove("publish-p-1").unwrap());
        store.complete("publish-p-1").unwrap();
        assert!(store.get("publish-p-1").unwrap().is_none());
    }

    #[test]
    fn counts_split_pending_and_delayed() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = test_store(clock.clone());
        store.enqueue(publish("p-1"), Duration::seconds(5)).unwrap();
        store.enqueue(publish("p-2"), Duration::seconds(500)).unwrap();
        clock.advance(Duration::seconds(10));

        let stats = store.counts().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn list_upcoming_orders_by_not_before() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(clock);
        store.enqueue(publish("late"), Duration::seconds(300)).unwrap();
        store.enqueue(publish("soon"), Duration::seconds(30)).unwrap();

        let upcoming = store.list_upcoming(10).unwrap();
        assert_eq!(upcoming.len(), 2);
        assert_eq!(upcoming[0].job_id, "publish-soon");
        assert_eq!(upcoming[1].job_id, "publish-late");
        assert!(upcoming[0].scheduled_for < upcoming[1].scheduled_for);
    }

    #[test]
    fn prune_respects_retention_windows() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = test_store(clock.clone());

        store.enqueue(publish("done"), Duration::seconds(1)).unwrap();
        clock.advance(Duration::seconds(2));
        store.claim_due(10).unwrap();
        store.complete("publish-done").unwrap();

        // 6 days in: still within the 7-day window.
        clock.advance(Duration::days(6));
        assert_eq!(store.prune().unwrap(), (0, 0));
        assert!(store.get("publish-done").unwrap().is_some());

        // 8 days in: gone.
        clock.advance(Duration::days(2));
        assert_eq!(store.prune().unwrap(), (1, 0));
        assert!(store.get("publish-done").unwrap().is_none());
    }
}
