//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so it is safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS system (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    version         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instance (
    id              TEXT PRIMARY KEY NOT NULL,
    system_id       TEXT NOT NULL,
    name            TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('UNKNOWN','INITIALIZING','STARTING','RUNNING','UNRESPONSIVE','STOPPED','DEAD')),
    last_heartbeat  TEXT
);

CREATE INDEX IF NOT EXISTS idx_instance_system ON instance(system_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
