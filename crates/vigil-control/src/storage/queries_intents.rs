//! Issued intent queries.

use super::db::{ControlDatabase, DatabaseError};
use super::models::{IntentKind, IntentRecord, IntentStatus};

impl ControlDatabase {
    /// Record an intent as pending before it is sent.
    pub async fn record_intent(
        &self,
        id: &str,
        camera_id: &str,
        generation: i64,
        worker_id: &str,
        kind: IntentKind,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO intents (id, camera_id, generation, worker_id, kind, status, issued_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(id)
        .bind(camera_id)
        .bind(generation)
        .bind(worker_id)
        .bind(kind.as_str())
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Get an intent by ID.
    pub async fn get_intent(&self, id: &str) -> Result<Option<IntentRecord>, DatabaseError> {
        let intent = sqlx::query_as::<_, IntentRecord>("SELECT * FROM intents WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(intent)
    }

    /// Resolve a pending intent. Returns `false` if it was already resolved,
    /// which makes duplicate ACKs harmless.
    pub async fn resolve_intent(
        &self,
        id: &str,
        status: IntentStatus,
        detail: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE intents SET status = ?, detail = ?, resolved_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(detail)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unacknowledged START intents for leases the worker still owns at the
    /// intent's generation. These are redelivered after a reconnect.
    pub async fn unacked_starts(&self, worker_id: &str) -> Result<Vec<IntentRecord>, DatabaseError> {
        let intents = sqlx::query_as::<_, IntentRecord>(
            "SELECT i.* FROM intents i
             JOIN leases l ON l.camera_id = i.camera_id AND l.generation = i.generation
             WHERE i.worker_id = ? AND i.kind = 'start' AND i.status = 'pending'
               AND l.worker_id = i.worker_id AND l.state IN ('active', 'orphaned')
             ORDER BY i.issued_at, i.id",
        )
        .bind(worker_id)
        .fetch_all(self.pool())
        .await?;
        Ok(intents)
    }

    /// Expire STOP and DRAIN intents issued before `issued_before` that were
    /// never acknowledged. Returns the expired records.
    pub async fn expire_stale_intents(
        &self,
        issued_before: i64,
        now: i64,
    ) -> Result<Vec<IntentRecord>, DatabaseError> {
        let intents = sqlx::query_as::<_, IntentRecord>(
            "UPDATE intents SET status = 'expired', detail = 'ack timeout', resolved_at = ?
             WHERE status = 'pending' AND kind IN ('stop', 'drain') AND issued_at < ?
             RETURNING *",
        )
        .bind(now)
        .bind(issued_before)
        .fetch_all(self.pool())
        .await?;
        Ok(intents)
    }
}
