//! Wiring of the control plane services around one database and clock.

use std::sync::Arc;

use vigil_core::SharedClock;
use vigil_core::config::{ControlConfig, ReclaimConfig};

use crate::assignment::AssignmentService;
use crate::dispatch::Dispatcher;
use crate::lease::LeaseStore;
use crate::reclaim::ReclaimScheduler;
use crate::registry::{ConnectionRegistry, WorkerRegistry};
use crate::storage::ControlDatabase;

/// Shared handles used by worker sessions, the admin surface and the reclaim
/// scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ControlPlane {
    pub db: ControlDatabase,
    pub clock: SharedClock,
    pub config: Arc<ControlConfig>,
    pub leases: LeaseStore,
    pub workers: WorkerRegistry,
    pub connections: ConnectionRegistry,
    pub dispatcher: Dispatcher,
    pub assignment: AssignmentService,
}

impl ControlPlane {
    pub fn new(db: ControlDatabase, clock: SharedClock, config: ControlConfig) -> Self {
        let leases = LeaseStore::new(db.clone(), Arc::clone(&clock), config.lease_ttl());
        let workers = WorkerRegistry::new(
            db.clone(),
            Arc::clone(&clock),
            config.liveness_threshold(),
            config.min_worker_version.clone(),
        );
        let connections = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(
            db.clone(),
            Arc::clone(&clock),
            leases.clone(),
            connections.clone(),
            config.drain_ack_timeout(),
            config.model_version.clone(),
        );
        let assignment = AssignmentService::new(
            db.clone(),
            Arc::clone(&clock),
            leases.clone(),
            workers.clone(),
            dispatcher.clone(),
        );
        Self {
            db,
            clock,
            config: Arc::new(config),
            leases,
            workers,
            connections,
            dispatcher,
            assignment,
        }
    }

    pub fn reclaim_scheduler(&self, config: ReclaimConfig) -> ReclaimScheduler {
        ReclaimScheduler::new(
            self.db.clone(),
            Arc::clone(&self.clock),
            self.leases.clone(),
            self.dispatcher.clone(),
            config,
        )
    }
}
