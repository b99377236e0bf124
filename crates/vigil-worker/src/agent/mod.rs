//! Worker agent: runs the lifecycle machine against a real pipeline.
//!
//! The agent owns the [`WorkerMachine`](crate::fsm::WorkerMachine) and is the
//! only place its effects are executed. It talks to the control client over
//! channels, so it survives control channel reconnects untouched.

mod runtime;


use std::time::Duration;

use tokio::sync::{mpsc, watch};

use vigil_core::protocol::{ControlMessage, LeaseRef, WorkerMessage, WorkerMetrics, WorkerStatus};

use crate::client::ReconnectPolicy;

pub use runtime::WorkerAgent;

/// Who this worker is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub tenant_id: String,
    pub site_id: String,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub identity: WorkerIdentity,
    pub readiness_timeout: Duration,
    /// Backoff between pipeline retries while reconnecting.
    pub retry: ReconnectPolicy,
    pub max_consecutive_faults: u32,
}

/// What the control client reports on the next heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub status: WorkerStatus,
    pub state: &'static str,
    pub renewals: Vec<LeaseRef>,
    pub metrics: WorkerMetrics,
}

impl Default for AgentSnapshot {
    fn default() -> Self {
        Self {
            status: WorkerStatus::Registered,
            state: "init",
            renewals: Vec::new(),
            metrics: WorkerMetrics::default(),
        }
    }
}

/// The client side of an agent.
pub struct AgentChannels {
    /// Control plane messages for the agent.
    pub control: mpsc::Sender<ControlMessage>,
    /// ACKs and events produced by the agent, in order.
    pub outbound: mpsc::Receiver<WorkerMessage>,
    pub snapshot: watch::Receiver<AgentSnapshot>,
}
