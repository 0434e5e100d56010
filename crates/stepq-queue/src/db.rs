use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue schema in `conn`.
///
/// Creates the `queue_jobs` table (idempotent) plus the indexes backing the
/// claim query, the exclusivity check and the zombie scan.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queue_jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            type            TEXT    NOT NULL,
            dataset         TEXT    NOT NULL,
            config          TEXT,
            split           TEXT,
            namespace       TEXT    NOT NULL,
            force           INTEGER NOT NULL DEFAULT 0,
            status          TEXT    NOT NULL DEFAULT 'waiting',
            created_at      TEXT    NOT NULL,   -- RFC 3339, microseconds, UTC
            started_at      TEXT,
            last_heartbeat  TEXT,
            finished_at     TEXT
        );

        -- start_job: waiting / started sets of one type
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_type_status
            ON queue_jobs (type, status, created_at);
        -- is_job_in_process and the unicity check
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_unicity
            ON queue_jobs (type, dataset, config, split, status);
        -- get_zombies
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_status
            ON queue_jobs (status);
        ",
    )?;
    Ok(())
}

/// Open (or create) the queue database at `path`, ready for use by many
/// processes at once.
///
/// WAL lets readers proceed while a claim transaction holds the write lock;
/// `busy_timeout` makes competing writers wait instead of failing.
pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    init_db(&conn)?;
    Ok(conn)
}
