//! Lease store over the control database.
//!
//! Converts the configured TTL into absolute expiry instants using the
//! injected clock and exposes the lease primitives the rest of the control
//! plane is built on. Nothing here caches ownership.

use std::time::Duration;

use tracing::debug;

use vigil_core::SharedClock;
use vigil_core::clock::secs;

use crate::storage::{ControlDatabase, DatabaseError, Lease};

#[derive(Clone)]
pub struct LeaseStore {
    db: ControlDatabase,
    clock: SharedClock,
    ttl: Duration,
}

impl LeaseStore {
    pub fn new(db: ControlDatabase, clock: SharedClock, ttl: Duration) -> Self {
        Self { db, clock, ttl }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create the PENDING generation-0 row for a camera if it is missing.
    pub async fn ensure(&self, camera_id: &str) -> Result<(), DatabaseError> {
        self.db.ensure_lease(camera_id, self.now()).await
    }

    /// Attempt to take a camera at `expected_generation` for a worker that
    /// may hold at most `capacity` leases. Returns the new generation, or
    /// `None` when another caller got there first or the lease is not
    /// acquirable.
    pub async fn try_acquire(
        &self,
        camera_id: &str,
        worker_id: &str,
        expected_generation: i64,
        capacity: u32,
    ) -> Result<Option<i64>, DatabaseError> {
        let now = self.now();
        let acquired = self
            .db
            .try_acquire(
                camera_id,
                worker_id,
                expected_generation,
                capacity,
                now + secs(self.ttl),
                now,
            )
            .await?;
        if acquired.is_some() {
            record("acquire");
        } else {
            debug!(camera_id, worker_id, expected_generation, "Acquisition lost");
        }
        Ok(acquired)
    }

    /// Extend the lease for another TTL.
    pub async fn renew(
        &self,
        camera_id: &str,
        generation: i64,
        worker_id: &str,
    ) -> Result<bool, DatabaseError> {
        let now = self.now();
        let renewed = self
            .db
            .renew_lease(camera_id, generation, worker_id, now + secs(self.ttl), now)
            .await?;
        if renewed {
            record("renew");
        }
        Ok(renewed)
    }

    /// Cooperatively release the lease at `generation`.
    pub async fn release(
        &self,
        camera_id: &str,
        generation: i64,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        let released = self
            .db
            .release_lease(camera_id, generation, reason, self.now())
            .await?;
        if released {
            record("release");
        }
        Ok(released)
    }

    /// Release the lease at `generation` only if `worker_id` still holds it.
    pub async fn release_held(
        &self,
        camera_id: &str,
        generation: i64,
        worker_id: &str,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        let released = self
            .db
            .release_held_lease(camera_id, generation, worker_id, reason, self.now())
            .await?;
        if released {
            record("release");
        } else {
            debug!(camera_id, generation, worker_id, "Release by a non-owner refused");
        }
        Ok(released)
    }

    pub async fn get(&self, camera_id: &str) -> Result<Option<Lease>, DatabaseError> {
        self.db.get_lease(camera_id).await
    }

    pub async fn leases_for_worker(&self, worker_id: &str) -> Result<Vec<Lease>, DatabaseError> {
        self.db.leases_held_by(worker_id).await
    }

    /// Number of leases the worker holds.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn load_of(&self, worker_id: &str) -> Result<u32, DatabaseError> {
        let count = self.db.count_held_leases(worker_id).await?;
        Ok(count.max(0) as u32)
    }

    /// Record an event sequence number for the current generation.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn accept_event(
        &self,
        camera_id: &str,
        generation: i64,
        sequence: u64,
    ) -> Result<bool, DatabaseError> {
        self.db
            .accept_event(
                camera_id,
                generation,
                i64::try_from(sequence).unwrap_or(i64::MAX),
                self.now(),
            )
            .await
    }

    pub async fn set_reason(
        &self,
        camera_id: &str,
        generation: i64,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        self.db
            .set_lease_reason(camera_id, generation, reason, self.now())
            .await
    }

    /// Current generation of a camera, 0 when it has no lease row.
    pub async fn current_generation(&self, camera_id: &str) -> Result<i64, DatabaseError> {
        Ok(self.get(camera_id).await?.map_or(0, |l| l.generation))
    }
}

#[cfg(feature = "metrics")]
fn record(transition: &'static str) {
    vigil_core::metrics::lease_counters::record(transition);
}

#[cfg(not(feature = "metrics"))]
const fn record(_transition: &'static str) {}
