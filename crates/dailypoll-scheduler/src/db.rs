use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and an index on `(state, not_before)`
/// so the due-job polling query stays cheap as terminal rows accumulate
/// between retention sweeps.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            kind            TEXT    NOT NULL,   -- JSON-encoded JobKind enum
            state           TEXT    NOT NULL DEFAULT 'pending',
            not_before      TEXT    NOT NULL,   -- RFC 3339
            attempts        INTEGER NOT NULL DEFAULT 0,
            max_attempts    INTEGER NOT NULL,
            last_error      TEXT,
            created_at      TEXT    NOT NULL,
            last_attempt_at TEXT,
            finished_at     TEXT
        ) STRICT;

        -- Efficient polling: SELECT … WHERE state = 'pending' AND not_before <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_state_not_before
            ON jobs (state, not_before);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open failed");
        init_db(&conn).expect("first init failed");
        init_db(&conn).expect("second init failed");
    }
}
