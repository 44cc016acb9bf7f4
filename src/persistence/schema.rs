//! `SQLite` schema bootstrap logic.
//!
//! Every statement is `CREATE ... IF NOT EXISTS` and runs on each startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the bot table definition to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS bot (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    owner_id        TEXT NOT NULL,
    repo_url        TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','pairing','pairing_failed','online','offline','restarting','error')),
    phone_number    TEXT,
    pairing_code    TEXT,
    pairing_status  TEXT NOT NULL DEFAULT 'none' CHECK(pairing_status IN ('none','pairing','connected','failed','timed_out')),
    pid             INTEGER,
    error           TEXT,
    logs            TEXT NOT NULL DEFAULT '[]',
    deployed_at     TEXT,
    last_restart_at TEXT,
    last_stopped_at TEXT,
    last_checked_at TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bot_owner ON bot(owner_id);
CREATE INDEX IF NOT EXISTS idx_bot_status ON bot(status);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
