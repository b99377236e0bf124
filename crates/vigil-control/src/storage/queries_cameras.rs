//! Camera catalog queries.

use super::db::{ControlDatabase, DatabaseError};
use super::models::Camera;

impl ControlDatabase {
    /// Insert or update a camera and make sure it has a lease row.
    ///
    /// Upserting re-enables a disabled camera. The lease row is created at
    /// generation 0 in `pending` state and is never overwritten.
    pub async fn upsert_camera(
        &self,
        id: &str,
        tenant_id: &str,
        site_id: &str,
        source_kind: &str,
        source_uri: &str,
        now: i64,
    ) -> Result<Camera, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO cameras (id, tenant_id, site_id, source_kind, source_uri, enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                site_id = excluded.site_id,
                source_kind = excluded.source_kind,
                source_uri = excluded.source_uri,
                enabled = 1,
                updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(site_id)
        .bind(source_kind)
        .bind(source_uri)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO leases (camera_id, generation, state, updated_at)
             VALUES (?, 0, 'pending', ?)",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_camera(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Camera {id}")))
    }

    /// Get a camera by ID.
    pub async fn get_camera(&self, id: &str) -> Result<Option<Camera>, DatabaseError> {
        let camera = sqlx::query_as::<_, Camera>("SELECT * FROM cameras WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(camera)
    }

    /// Enable or disable a camera. Disabled cameras are never assignment
    /// candidates and cannot be acquired.
    pub async fn set_camera_enabled(
        &self,
        id: &str,
        enabled: bool,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE cameras SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(enabled))
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List cameras in a tenant/site scope.
    pub async fn list_cameras(
        &self,
        tenant_id: &str,
        site_id: &str,
    ) -> Result<Vec<Camera>, DatabaseError> {
        let cameras = sqlx::query_as::<_, Camera>(
            "SELECT * FROM cameras WHERE tenant_id = ? AND site_id = ? ORDER BY id",
        )
        .bind(tenant_id)
        .bind(site_id)
        .fetch_all(self.pool())
        .await?;
        Ok(cameras)
    }
}
