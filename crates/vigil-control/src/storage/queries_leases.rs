//! Lease queries.
//!
//! Each mutation is one conditional `UPDATE` guarded by the generation the
//! caller last observed. A `false`/`None` result means the guard failed and
//! nothing changed.

use vigil_core::protocol::LeaseRef;

use super::db::{ControlDatabase, DatabaseError};
use super::models::{Candidate, ExpiredLease, Lease};

/// Filter and cursor for one page of assignment candidates.
#[derive(Debug, Clone)]
pub struct CandidateScan<'a> {
    pub tenant_id: &'a str,
    pub site_id: &'a str,
    pub source_kinds: &'a [String],
    /// Last `(generation, camera_id)` of the previous page.
    pub after: Option<(i64, &'a str)>,
}

impl ControlDatabase {
    /// Create the lease row for a camera if it does not exist yet.
    pub async fn ensure_lease(&self, camera_id: &str, now: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT OR IGNORE INTO leases (camera_id, generation, state, updated_at)
             VALUES (?, 0, 'pending', ?)",
        )
        .bind(camera_id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Get the lease row of a camera.
    pub async fn get_lease(&self, camera_id: &str) -> Result<Option<Lease>, DatabaseError> {
        let lease = sqlx::query_as::<_, Lease>("SELECT * FROM leases WHERE camera_id = ?")
            .bind(camera_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(lease)
    }

    /// List lease rows, optionally restricted to one site.
    pub async fn list_leases(&self, site_id: Option<&str>) -> Result<Vec<Lease>, DatabaseError> {
        let leases = match site_id {
            Some(site) => {
                sqlx::query_as::<_, Lease>(
                    "SELECT l.* FROM leases l JOIN cameras c ON c.id = l.camera_id
                     WHERE c.site_id = ? ORDER BY l.camera_id",
                )
                .bind(site)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Lease>("SELECT * FROM leases ORDER BY camera_id")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(leases)
    }

    /// Compare-and-set acquisition.
    ///
    /// Succeeds only when the row is still at `expected_generation` and is
    /// unowned (pending, terminated or hard-reclaimed) or orphaned past its
    /// reclaim instant. Paused leases and disabled cameras never match. An
    /// ACTIVE lease past `expires_at` that the sweep has not orphaned yet is
    /// still owned. The worker's held-lease count is checked in the same
    /// statement so concurrent fills cannot push it past `capacity`.
    /// Returns the new generation on success.
    pub async fn try_acquire(
        &self,
        camera_id: &str,
        worker_id: &str,
        expected_generation: i64,
        capacity: u32,
        expires_at: i64,
        now: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let generation: Option<i64> = sqlx::query_scalar(
            "UPDATE leases
             SET worker_id = ?, generation = generation + 1, state = 'active',
                 expires_at = ?, reclaim_at = NULL, last_event_seq = 0,
                 reason = 'acquired', updated_at = ?
             WHERE camera_id = ? AND generation = ? AND state != 'paused'
               AND (worker_id IS NULL OR (state = 'orphaned' AND reclaim_at <= ?))
               AND EXISTS (SELECT 1 FROM cameras c WHERE c.id = leases.camera_id AND c.enabled = 1)
               AND (SELECT COUNT(*) FROM leases h
                    WHERE h.worker_id = ? AND h.state IN ('active', 'orphaned')) < ?
             RETURNING generation",
        )
        .bind(worker_id)
        .bind(expires_at)
        .bind(now)
        .bind(camera_id)
        .bind(expected_generation)
        .bind(now)
        .bind(worker_id)
        .bind(i64::from(capacity))
        .fetch_optional(self.pool())
        .await?;
        Ok(generation)
    }

    /// Extend a lease held by `worker_id` at `generation`.
    ///
    /// An orphaned lease still inside its grace window is revived to ACTIVE.
    /// Past the reclaim instant renewal fails and the holder must stop.
    pub async fn renew_lease(
        &self,
        camera_id: &str,
        generation: i64,
        worker_id: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE leases
             SET expires_at = ?, state = 'active', reclaim_at = NULL, updated_at = ?
             WHERE camera_id = ? AND generation = ? AND worker_id = ?
               AND (state = 'active' OR (state = 'orphaned' AND reclaim_at > ?))",
        )
        .bind(expires_at)
        .bind(now)
        .bind(camera_id)
        .bind(generation)
        .bind(worker_id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear ownership of the lease at `generation` and mark it terminated.
    ///
    /// The generation is kept; the next acquisition bumps it.
    pub async fn release_lease(
        &self,
        camera_id: &str,
        generation: i64,
        reason: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE leases
             SET worker_id = NULL, state = 'terminated', reclaim_at = NULL,
                 reason = ?, updated_at = ?
             WHERE camera_id = ? AND generation = ? AND worker_id IS NOT NULL",
        )
        .bind(reason)
        .bind(now)
        .bind(camera_id)
        .bind(generation)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Like [`Self::release_lease`], but only while `worker_id` still owns
    /// the lease. Used on every path where a worker speaks for itself.
    pub async fn release_held_lease(
        &self,
        camera_id: &str,
        generation: i64,
        worker_id: &str,
        reason: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE leases
             SET worker_id = NULL, state = 'terminated', reclaim_at = NULL,
                 reason = ?, updated_at = ?
             WHERE camera_id = ? AND generation = ? AND worker_id = ?",
        )
        .bind(reason)
        .bind(now)
        .bind(camera_id)
        .bind(generation)
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// ACTIVE leases whose expiry has passed, with the site they belong to.
    pub async fn expired_active_leases(
        &self,
        now: i64,
    ) -> Result<Vec<ExpiredLease>, DatabaseError> {
        let rows = sqlx::query_as::<_, ExpiredLease>(
            "SELECT l.camera_id, l.generation, l.worker_id, c.site_id
             FROM leases l JOIN cameras c ON c.id = l.camera_id
             WHERE l.state = 'active' AND l.expires_at < ?
             ORDER BY l.camera_id",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Soft reclaim: move an expired ACTIVE lease to ORPHANED, keeping the
    /// owner so it can still renew until `reclaim_at`.
    pub async fn orphan_lease(
        &self,
        camera_id: &str,
        generation: i64,
        reclaim_at: i64,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE leases
             SET state = 'orphaned', reclaim_at = ?, reason = 'lease expired', updated_at = ?
             WHERE camera_id = ? AND generation = ? AND state = 'active' AND expires_at < ?",
        )
        .bind(reclaim_at)
        .bind(now)
        .bind(camera_id)
        .bind(generation)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Hard reclaim: clear the owner of every orphaned lease whose grace has
    /// elapsed. Returns the leases that were cleared.
    pub async fn hard_reclaim(&self, now: i64) -> Result<Vec<LeaseRef>, DatabaseError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "UPDATE leases
             SET worker_id = NULL, reason = 'hard reclaim', updated_at = ?
             WHERE state = 'orphaned' AND worker_id IS NOT NULL AND reclaim_at <= ?
             RETURNING camera_id, generation",
        )
        .bind(now)
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(camera_id, generation)| LeaseRef::new(camera_id, generation))
            .collect())
    }

    /// Record an event sequence number if it is newer than the last one seen
    /// for the current generation.
    pub async fn accept_event(
        &self,
        camera_id: &str,
        generation: i64,
        sequence: i64,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE leases SET last_event_seq = ?, updated_at = ?
             WHERE camera_id = ? AND generation = ? AND last_event_seq < ?",
        )
        .bind(sequence)
        .bind(now)
        .bind(camera_id)
        .bind(generation)
        .bind(sequence)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update the human-readable reason of the lease at `generation`.
    pub async fn set_lease_reason(
        &self,
        camera_id: &str,
        generation: i64,
        reason: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE leases SET reason = ?, updated_at = ? WHERE camera_id = ? AND generation = ?",
        )
        .bind(reason)
        .bind(now)
        .bind(camera_id)
        .bind(generation)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Pause the lease at `generation`, clearing any owner.
    pub async fn pause_lease(
        &self,
        camera_id: &str,
        generation: i64,
        reason: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE leases
             SET worker_id = NULL, state = 'paused', reclaim_at = NULL, reason = ?, updated_at = ?
             WHERE camera_id = ? AND generation = ? AND state != 'paused'",
        )
        .bind(reason)
        .bind(now)
        .bind(camera_id)
        .bind(generation)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return a paused lease to PENDING so it can be assigned again.
    pub async fn resume_lease(&self, camera_id: &str, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE leases SET state = 'pending', reason = 'resumed', updated_at = ?
             WHERE camera_id = ? AND state = 'paused'",
        )
        .bind(now)
        .bind(camera_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Leases currently owned by a worker (ACTIVE or ORPHANED in grace).
    pub async fn leases_held_by(&self, worker_id: &str) -> Result<Vec<Lease>, DatabaseError> {
        let leases = sqlx::query_as::<_, Lease>(
            "SELECT * FROM leases
             WHERE worker_id = ? AND state IN ('active', 'orphaned')
             ORDER BY camera_id",
        )
        .bind(worker_id)
        .fetch_all(self.pool())
        .await?;
        Ok(leases)
    }

    /// Number of leases a worker owns; this is the worker's load.
    pub async fn count_held_leases(&self, worker_id: &str) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM leases WHERE worker_id = ? AND state IN ('active', 'orphaned')",
        )
        .bind(worker_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Unowned cameras in a tenant/site scope whose source kind the worker
    /// supports, lowest generation first, then camera id.
    ///
    /// Cameras without a lease row show up at generation 0; the caller
    /// creates the row before acquiring. Pages are keyed on
    /// `(generation, camera_id)` through [`CandidateScan::after`].
    pub async fn assignment_candidates(
        &self,
        scan: &CandidateScan<'_>,
        now: i64,
        limit: i64,
    ) -> Result<Vec<Candidate>, DatabaseError> {
        let source_kinds = serde_json::to_string(scan.source_kinds)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let (after_generation, after_camera) = scan.after.unwrap_or((-1, ""));

        let candidates = sqlx::query_as::<_, Candidate>(
            "SELECT c.id AS camera_id, c.source_kind, c.source_uri,
                    COALESCE(l.generation, 0) AS generation
             FROM cameras c LEFT JOIN leases l ON l.camera_id = c.id
             WHERE c.tenant_id = ? AND c.site_id = ? AND c.enabled = 1
               AND c.source_kind IN (SELECT value FROM json_each(?))
               AND (l.camera_id IS NULL
                    OR (l.state != 'paused'
                        AND (l.worker_id IS NULL
                             OR (l.state = 'orphaned' AND l.reclaim_at <= ?))))
               AND (COALESCE(l.generation, 0) > ?
                    OR (COALESCE(l.generation, 0) = ? AND c.id > ?))
             ORDER BY COALESCE(l.generation, 0), c.id
             LIMIT ?",
        )
        .bind(scan.tenant_id)
        .bind(scan.site_id)
        .bind(&source_kinds)
        .bind(now)
        .bind(after_generation)
        .bind(after_generation)
        .bind(after_camera)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(candidates)
    }
}
