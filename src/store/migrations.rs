//! Schema versions for the libSQL job store.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Applied in order; append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "jobs_table",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'pending',
                request TEXT NOT NULL,
                result_ref TEXT,
                error_message TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
        "#,
    },
    Migration {
        version: 2,
        name: "jobs_eviction_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_state_updated ON jobs(state, updated_at);
        "#,
    },
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_versions (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Bring the job schema up to the latest version. Safe to call on every open.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(VERSION_TABLE, ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("schema_versions: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    let mut latest = applied;
    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Migrating job schema");
        conn.execute_batch(step.sql)
            .await
            .map_err(|e| DatabaseError::Migration(format!("V{} {}: {e}", step.version, step.name)))?;
        record(conn, step).await?;
        latest = step.version;
    }

    if latest > applied {
        tracing::debug!(from = applied, to = latest, "Job schema migrated");
    }
    Ok(())
}

/// Highest recorded version, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    else {
        return Ok(0);
    };
    row.get(0)
        .map_err(|e| DatabaseError::Migration(format!("bad schema version: {e}")))
}

async fn record(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await
    .map(|_| ())
    .map_err(|e| DatabaseError::Migration(format!("recording V{}: {e}", step.version)))
}
