//! Durable worker records: registration, liveness and status.

use std::time::Duration;

use semver::Version;
use tracing::{info, warn};

use vigil_core::SharedClock;
use vigil_core::clock::secs;
use vigil_core::protocol::{Register, WorkerStatus};

use crate::storage::{ControlDatabase, DatabaseError, Worker, WorkerUpsert};

/// Why a REGISTER was refused.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("invalid registration: {0}")]
    Invalid(String),

    #[error("worker version {version} is older than the minimum {minimum}")]
    UnsupportedVersion { version: String, minimum: String },

    #[error("minimum worker version is misconfigured: {0}")]
    MinimumVersion(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Clone)]
pub struct WorkerRegistry {
    db: ControlDatabase,
    clock: SharedClock,
    liveness_threshold: Duration,
    min_version: String,
}

impl WorkerRegistry {
    pub fn new(
        db: ControlDatabase,
        clock: SharedClock,
        liveness_threshold: Duration,
        min_version: String,
    ) -> Self {
        Self {
            db,
            clock,
            liveness_threshold,
            min_version,
        }
    }

    /// Validate a REGISTER and upsert the worker record.
    pub async fn register(&self, req: &Register) -> Result<Worker, RegisterError> {
        if req.worker_id.trim().is_empty() {
            return Err(RegisterError::Invalid("worker_id is empty".into()));
        }
        if req.tenant_id.trim().is_empty() || req.site_id.trim().is_empty() {
            return Err(RegisterError::Invalid("tenant_id and site_id are required".into()));
        }
        if req.capacity == 0 {
            return Err(RegisterError::Invalid("capacity must be at least 1".into()));
        }
        self.check_version(&req.capability.version)?;

        let worker = self
            .db
            .upsert_worker(
                &WorkerUpsert {
                    id: &req.worker_id,
                    tenant_id: &req.tenant_id,
                    site_id: &req.site_id,
                    capacity: req.capacity,
                    version: &req.capability.version,
                    source_types: &req.capability.source_types,
                },
                self.clock.now(),
            )
            .await?;

        info!(
            worker_id = %worker.id,
            tenant_id = %worker.tenant_id,
            site_id = %worker.site_id,
            capacity = worker.capacity,
            version = %worker.version,
            "Worker registered"
        );
        Ok(worker)
    }

    fn check_version(&self, version: &str) -> Result<(), RegisterError> {
        let minimum = Version::parse(&self.min_version)
            .map_err(|e| RegisterError::MinimumVersion(e.to_string()))?;
        let reported = Version::parse(version)
            .map_err(|e| RegisterError::Invalid(format!("bad version '{version}': {e}")))?;
        if reported < minimum {
            return Err(RegisterError::UnsupportedVersion {
                version: version.to_string(),
                minimum: self.min_version.clone(),
            });
        }
        Ok(())
    }

    /// Record a heartbeat. Returns `false` for an unknown worker.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<bool, DatabaseError> {
        self.db.touch_worker(worker_id, status, self.clock.now()).await
    }

    pub async fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        if !self.db.set_worker_status(worker_id, status, reason).await? {
            warn!(worker_id, %status, "Status not applied: unknown worker or held in error");
        }
        Ok(())
    }

    /// Leave ERROR. This is the only way out of it; returns `false` when the
    /// worker was not in ERROR.
    pub async fn clear(&self, worker_id: &str) -> Result<bool, DatabaseError> {
        let cleared = self.db.clear_worker_error(worker_id).await?;
        if cleared {
            info!(worker_id, "Worker error cleared");
        }
        Ok(cleared)
    }

    pub async fn get(&self, worker_id: &str) -> Result<Option<Worker>, DatabaseError> {
        self.db.get_worker(worker_id).await
    }

    pub async fn list(&self) -> Result<Vec<Worker>, DatabaseError> {
        self.db.list_workers().await
    }

    pub fn is_stale(&self, worker: &Worker) -> bool {
        worker.is_stale(self.clock.now(), secs(self.liveness_threshold))
    }

    /// Whether a worker may be handed new cameras, ignoring capacity.
    pub fn accepts_work(&self, worker: &Worker) -> bool {
        worker.status().accepts_work() && !self.is_stale(worker)
    }
}
