//! libSQL backend: persistent `JobStore` implementation.
//!
//! Compare-and-swap is a conditional `UPDATE ... WHERE id = ? AND state = ?`;
//! zero affected rows means the swap lost.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, JobError};
use crate::jobs::state::{GenerationRequest, JobRecord, JobState, TransitionPayload};
use crate::store::migrations;
use crate::store::traits::{JobStore, check_transition};

const JOB_COLUMNS: &str =
    "id, state, request, result_ref, error_message, cancel_requested, created_at, updated_at";

/// libSQL job store.
///
/// `libsql::Connection` is `Send + Sync`; one connection serves every call.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Job database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamps so string comparison matches time order.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Map a libsql Row to a JobRecord. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Serialization(format!("job row: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let state_str: String = row.get(1).map_err(read)?;
    let request_str: String = row.get(2).map_err(read)?;
    let result_ref: Option<String> = row.get(3).ok();
    let error_message: Option<String> = row.get(4).ok();
    let cancel_requested: i64 = row.get(5).map_err(read)?;
    let created_str: String = row.get(6).map_err(read)?;
    let updated_str: String = row.get(7).map_err(read)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?;
    let state: JobState = state_str.parse().map_err(DatabaseError::Serialization)?;
    let request: GenerationRequest = serde_json::from_str(&request_str)
        .map_err(|e| DatabaseError::Serialization(format!("job {id} request: {e}")))?;

    Ok(JobRecord {
        id,
        state,
        request,
        result_ref,
        error_message,
        cancel_requested: cancel_requested != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn insert(&self, request: GenerationRequest) -> Result<Uuid, JobError> {
        let record = JobRecord::new(request);
        let request_json = serde_json::to_string(&record.request)
            .map_err(|e| DatabaseError::Serialization(format!("job request: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO jobs (id, state, request, cancel_requested, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                params![
                    record.id.to_string(),
                    record.state.as_str(),
                    request_json,
                    format_datetime(record.created_at),
                    format_datetime(record.updated_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %record.id, "Job row inserted");
        Ok(record.id)
    }

    async fn get(&self, id: Uuid) -> Result<JobRecord, JobError> {
        self.fetch(id).await?.ok_or(JobError::NotFound { id })
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobState,
        to: JobState,
        payload: TransitionPayload,
    ) -> Result<JobRecord, JobError> {
        // Edge and payload are checked up front; the UPDATE only races on state.
        check_transition(id, from, from, to, &payload)?;

        let (result_ref, error_message) = match payload {
            TransitionPayload::Done { result_ref } => (Some(result_ref), None),
            TransitionPayload::Error { message } => (None, Some(message)),
            TransitionPayload::None => (None, None),
        };

        let affected = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET state = ?1,
                     result_ref = COALESCE(?2, result_ref),
                     error_message = COALESCE(?3, error_message),
                     updated_at = ?4
                 WHERE id = ?5 AND state = ?6",
                params![
                    to.as_str(),
                    result_ref,
                    error_message,
                    format_datetime(Utc::now()),
                    id.to_string(),
                    from.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_job: {e}")))?;

        let record = self.fetch(id).await?.ok_or(JobError::NotFound { id })?;
        if affected == 0 {
            return Err(JobError::InvalidTransition {
                id,
                state: record.state,
                from,
                target: to,
            });
        }
        Ok(record)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<JobRecord, JobError> {
        self.conn()
            .execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ?1
                 WHERE id = ?2 AND cancel_requested = 0 AND state IN ('pending', 'processing')",
                params![format_datetime(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("request_cancel: {e}")))?;

        self.get(id).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), JobError> {
        let affected = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;

        if affected == 0 {
            return Err(JobError::NotFound { id });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<JobRecord>, JobError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {JOB_COLUMNS} FROM jobs"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?
        {
            match row_to_job(&row) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping unreadable job row"),
            }
        }
        Ok(records)
    }

    async fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM jobs
                 WHERE state IN ('done', 'error', 'cancelled') AND updated_at < ?1",
                params![format_datetime(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("evict_jobs: {e}")))?;

        Ok(count as usize)
    }

    async fn fail_interrupted(&self, message: &str) -> Result<usize, JobError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET state = 'error', error_message = ?1, updated_at = ?2
                 WHERE state IN ('pending', 'processing')",
                params![message, format_datetime(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_interrupted: {e}")))?;

        if count > 0 {
            info!(count, "Marked interrupted jobs as failed");
        }
        Ok(count as usize)
    }
}
