//! Assignment service.
//!
//! Scans candidate cameras in a deterministic order and races for them with
//! the lease store's compare-and-set. Losing a race just moves on to the next
//! candidate; the winner gets a START intent.

use tracing::{debug, info, instrument};

use vigil_core::SharedClock;

use crate::dispatch::Dispatcher;
use crate::lease::LeaseStore;
use crate::registry::WorkerRegistry;
use crate::storage::{Candidate, CandidateScan, ControlDatabase, DatabaseError, Lease, Worker};

/// Candidates fetched per page of the scan.
const CANDIDATE_BATCH: i64 = 64;

/// Tenant and site a worker may be assigned cameras from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteScope {
    pub tenant_id: String,
    pub site_id: String,
}

impl SiteScope {
    pub fn new(tenant_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            site_id: site_id.into(),
        }
    }

    pub fn of(worker: &Worker) -> Self {
        Self::new(worker.tenant_id.clone(), worker.site_id.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("unknown worker {0}")]
    UnknownWorker(String),

    #[error("worker {worker_id} is not eligible: {reason}")]
    Ineligible { worker_id: String, reason: String },

    #[error("worker {worker_id} is outside scope {tenant_id}/{site_id}")]
    OutOfScope {
        worker_id: String,
        tenant_id: String,
        site_id: String,
    },

    #[error(transparent)]
    Store(#[from] DatabaseError),
}

#[derive(Clone)]
pub struct AssignmentService {
    db: ControlDatabase,
    clock: SharedClock,
    leases: LeaseStore,
    workers: WorkerRegistry,
    dispatcher: Dispatcher,
}

impl AssignmentService {
    pub fn new(
        db: ControlDatabase,
        clock: SharedClock,
        leases: LeaseStore,
        workers: WorkerRegistry,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            db,
            clock,
            leases,
            workers,
            dispatcher,
        }
    }

    async fn eligible_worker(&self, worker_id: &str) -> Result<(Worker, u32), AssignError> {
        let worker = self
            .workers
            .get(worker_id)
            .await?
            .ok_or_else(|| AssignError::UnknownWorker(worker_id.to_string()))?;

        let ineligible = |reason: String| AssignError::Ineligible {
            worker_id: worker_id.to_string(),
            reason,
        };
        if !worker.status().accepts_work() {
            return Err(ineligible(format!("status {}", worker.status)));
        }
        if self.workers.is_stale(&worker) {
            return Err(ineligible("stale".into()));
        }
        let load = self.leases.load_of(worker_id).await?;
        if i64::from(load) >= worker.capacity {
            return Err(ineligible(format!("at capacity ({load}/{})", worker.capacity)));
        }
        Ok((worker, load))
    }

    /// Try to hand one camera in `scope` to the worker.
    ///
    /// Returns `Ok(None)` when every candidate was taken by someone else or
    /// there is nothing to assign. Store errors fail closed.
    #[instrument(skip(self, scope), fields(site_id = %scope.site_id))]
    pub async fn assign(
        &self,
        worker_id: &str,
        scope: &SiteScope,
    ) -> Result<Option<Lease>, AssignError> {
        let (worker, _load) = self.eligible_worker(worker_id).await?;
        if worker.tenant_id != scope.tenant_id || worker.site_id != scope.site_id {
            return Err(AssignError::OutOfScope {
                worker_id: worker_id.to_string(),
                tenant_id: scope.tenant_id.clone(),
                site_id: scope.site_id.clone(),
            });
        }
        let capacity = u32::try_from(worker.capacity).unwrap_or(0);
        let source_types = worker.source_types();

        let mut after: Option<(i64, String)> = None;
        loop {
            let scan = CandidateScan {
                tenant_id: &scope.tenant_id,
                site_id: &scope.site_id,
                source_kinds: &source_types,
                after: after.as_ref().map(|(g, id)| (*g, id.as_str())),
            };
            let candidates = self
                .db
                .assignment_candidates(&scan, self.clock.now(), CANDIDATE_BATCH)
                .await?;
            let exhausted = candidates.len() < usize::try_from(CANDIDATE_BATCH).unwrap_or(0);
            after = candidates
                .last()
                .map(|c| (c.generation, c.camera_id.clone()));

            for candidate in candidates {
                if let Some(lease) = self.take(worker_id, capacity, candidate).await? {
                    return Ok(Some(lease));
                }
            }
            if exhausted {
                break;
            }
        }

        debug!("No assignable camera");
        Ok(None)
    }

    /// Race for one candidate. `None` means another caller won it.
    async fn take(
        &self,
        worker_id: &str,
        capacity: u32,
        candidate: Candidate,
    ) -> Result<Option<Lease>, AssignError> {
        if candidate.generation == 0 {
            self.leases.ensure(&candidate.camera_id).await?;
        }

        let Some(generation) = self
            .leases
            .try_acquire(
                &candidate.camera_id,
                worker_id,
                candidate.generation,
                capacity,
            )
            .await?
        else {
            debug!(camera_id = %candidate.camera_id, "Lost race, trying next candidate");
            return Ok(None);
        };

        info!(camera_id = %candidate.camera_id, generation, "Lease acquired");
        let source = vigil_core::protocol::SourceDescriptor {
            kind: candidate.source_kind,
            uri: candidate.source_uri,
        };
        self.dispatcher
            .start(worker_id, &candidate.camera_id, generation, source)
            .await?;
        Ok(self.leases.get(&candidate.camera_id).await?)
    }

    /// Assign until the worker's capacity is used up or nothing is left.
    pub async fn fill(&self, worker_id: &str) -> Result<Vec<Lease>, AssignError> {
        let mut acquired = Vec::new();
        loop {
            let worker = match self.eligible_worker(worker_id).await {
                Ok((worker, _)) => worker,
                Err(AssignError::Ineligible { .. }) => break,
                Err(e) => return Err(e),
            };
            match self.assign(worker_id, &SiteScope::of(&worker)).await {
                Ok(Some(lease)) => acquired.push(lease),
                Ok(None) | Err(AssignError::Ineligible { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(acquired)
    }
}
