//! Worker record queries.

use vigil_core::protocol::WorkerStatus;

use super::db::{ControlDatabase, DatabaseError};
use super::models::Worker;

/// Fields written when a worker registers.
#[derive(Debug, Clone)]
pub struct WorkerUpsert<'a> {
    pub id: &'a str,
    pub tenant_id: &'a str,
    pub site_id: &'a str,
    pub capacity: u32,
    pub version: &'a str,
    pub source_types: &'a [String],
}

impl ControlDatabase {
    /// Insert or refresh a worker record at REGISTER. Resets status to
    /// `registered` and clears the reason, except for a worker in `error`,
    /// which keeps both until [`Self::clear_worker_error`].
    pub async fn upsert_worker(
        &self,
        worker: &WorkerUpsert<'_>,
        now: i64,
    ) -> Result<Worker, DatabaseError> {
        let source_types = serde_json::to_string(worker.source_types)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        sqlx::query(
            "INSERT INTO workers (id, tenant_id, site_id, status, capacity, version, source_types, registered_at, last_seen, reason)
             VALUES (?, ?, ?, 'registered', ?, ?, ?, ?, ?, NULL)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                site_id = excluded.site_id,
                status = CASE WHEN workers.status = 'error' THEN 'error' ELSE 'registered' END,
                capacity = excluded.capacity,
                version = excluded.version,
                source_types = excluded.source_types,
                last_seen = excluded.last_seen,
                reason = CASE WHEN workers.status = 'error' THEN workers.reason ELSE NULL END",
        )
        .bind(worker.id)
        .bind(worker.tenant_id)
        .bind(worker.site_id)
        .bind(i64::from(worker.capacity))
        .bind(worker.version)
        .bind(&source_types)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_worker(worker.id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Worker {}", worker.id)))
    }

    /// Get a worker by ID.
    pub async fn get_worker(&self, id: &str) -> Result<Option<Worker>, DatabaseError> {
        let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(worker)
    }

    /// List all worker records.
    pub async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        let workers = sqlx::query_as::<_, Worker>("SELECT * FROM workers ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(workers)
    }

    /// Record a heartbeat: refresh `last_seen` and the reported status. A
    /// worker in `error` stays there whatever it reports.
    pub async fn touch_worker(
        &self,
        id: &str,
        status: WorkerStatus,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE workers
             SET status = CASE WHEN status = 'error' THEN 'error' ELSE ? END, last_seen = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set a worker's status and reason without touching `last_seen`.
    ///
    /// Never moves a worker out of `error`; returns `false` in that case and
    /// for an unknown worker.
    pub async fn set_worker_status(
        &self,
        id: &str,
        status: WorkerStatus,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE workers SET status = ?, reason = ?
             WHERE id = ? AND (status != 'error' OR ? = 'error')",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(id)
        .bind(status.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Take a worker out of `error` back to `idle`. Returns `false` if it was
    /// not in `error`.
    pub async fn clear_worker_error(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE workers SET status = 'idle', reason = NULL WHERE id = ? AND status = 'error'",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
