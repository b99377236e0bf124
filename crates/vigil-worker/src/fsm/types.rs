//! States, inputs and effects of the worker machine.

use serde_json::Value;

use vigil_core::protocol::{
    AckStatus, DrainIntent, EventKind, Invalidation, LeaseRef, StartIntent, StopIntent,
    WorkerStatus,
};

/// Where a drain ends up once processing has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTarget {
    Idle,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Registered,
    Idle,
    /// Pipeline start requested, readiness not yet proven.
    Starting { lease: LeaseRef, intent_id: String },
    Running { lease: LeaseRef },
    /// Local fault; binding and generation kept while retrying.
    Reconnecting { lease: LeaseRef, attempt: u32 },
    Draining { then: DrainTarget },
    Stopped,
    Error { reason: String },
}

impl WorkerState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Registered => "registered",
            Self::Idle => "idle",
            Self::Starting { .. } => "starting",
            Self::Running { .. } => "running",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Draining { .. } => "draining",
            Self::Stopped => "stopped",
            Self::Error { .. } => "error",
        }
    }

    /// Status reported on heartbeats. STARTING reports as idle until the
    /// pipeline is ready.
    pub const fn status(&self) -> WorkerStatus {
        match self {
            Self::Init | Self::Registered => WorkerStatus::Registered,
            Self::Idle | Self::Starting { .. } => WorkerStatus::Idle,
            Self::Running { .. } => WorkerStatus::Running,
            Self::Reconnecting { .. } => WorkerStatus::Reconnecting,
            Self::Draining { .. } => WorkerStatus::Draining,
            Self::Stopped => WorkerStatus::Stopped,
            Self::Error { .. } => WorkerStatus::Error,
        }
    }

    /// The lease this state is bound to, if any.
    pub const fn lease(&self) -> Option<&LeaseRef> {
        match self {
            Self::Starting { lease, .. } | Self::Running { lease } | Self::Reconnecting { lease, .. } => {
                Some(lease)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Registered,
    Idle,
    Start(StartIntent),
    PipelineReady,
    ReadinessTimeout(LeaseRef),
    TransientFault { detail: String },
    Recovered,
    RetryFailed { detail: String },
    RetriesExhausted { detail: String },
    Stop(StopIntent),
    Drain(DrainIntent),
    Drained,
    UnrecoverableFault { detail: String },
    Invalidated(Invalidation),
    Clear,
}

impl Input {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Idle => "idle",
            Self::Start(_) => "start",
            Self::PipelineReady => "pipeline_ready",
            Self::ReadinessTimeout(_) => "readiness_timeout",
            Self::TransientFault { .. } => "transient_fault",
            Self::Recovered => "recovered",
            Self::RetryFailed { .. } => "retry_failed",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Stop(_) => "stop",
            Self::Drain(_) => "drain",
            Self::Drained => "drained",
            Self::UnrecoverableFault { .. } => "unrecoverable_fault",
            Self::Invalidated(_) => "invalidated",
            Self::Clear => "clear",
        }
    }
}

/// Side effects requested by a transition, executed in order by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartPipeline(StartIntent),
    StopPipeline,
    ArmReadinessTimer(LeaseRef),
    CancelReadinessTimer,
    ScheduleRetry {
        lease: LeaseRef,
        attempt: u32,
    },
    Ack {
        intent_id: String,
        lease: LeaseRef,
        status: AckStatus,
        detail: String,
    },
    Emit {
        lease: LeaseRef,
        kind: EventKind,
        payload: Value,
    },
    /// Give the lease back cooperatively.
    ReleaseLease {
        lease: LeaseRef,
        reason: String,
    },
    /// Feed [`Input::Drained`] once the preceding effects are done.
    FinishDrain,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{input} is not valid in state {state}")]
pub struct TransitionError {
    pub state: &'static str,
    pub input: &'static str,
}
