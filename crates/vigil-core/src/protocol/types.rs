//! Control channel message types.
//!
//! Every frame is a JSON object internally tagged by `type`. Intents flowing
//! to a worker are keyed by `(camera_id, generation, intent_id)`; events
//! flowing back are keyed by `(camera_id, generation, sequence)`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Lifecycle status of a worker as recorded by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Registered,
    Idle,
    Running,
    Reconnecting,
    Draining,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether the assignment service may hand this worker new cameras.
    pub const fn accepts_work(&self) -> bool {
        matches!(self, Self::Registered | Self::Idle | Self::Running)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "reconnecting" => Ok(Self::Reconnecting),
            "draining" => Ok(Self::Draining),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(Error::Protocol(format!("unknown worker status '{other}'"))),
        }
    }
}

/// State of a camera lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Pending,
    Active,
    Paused,
    Orphaned,
    Terminated,
}

impl LeaseState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Orphaned => "orphaned",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaseState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "orphaned" => Ok(Self::Orphaned),
            "terminated" => Ok(Self::Terminated),
            other => Err(Error::Protocol(format!("unknown lease state '{other}'"))),
        }
    }
}

/// A `(camera, generation)` pair: the identity of one lease epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseRef {
    pub camera_id: String,
    pub generation: i64,
}

impl LeaseRef {
    pub fn new(camera_id: impl Into<String>, generation: i64) -> Self {
        Self {
            camera_id: camera_id.into(),
            generation,
        }
    }
}

/// Idempotency key of an intent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntentKey {
    pub camera_id: String,
    pub generation: i64,
    pub intent_id: String,
}

/// Ordering key of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey<'a> {
    pub camera_id: &'a str,
    pub generation: i64,
    pub sequence: u64,
}

/// Where a camera stream comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Source kind matched against worker capabilities, e.g. `rtsp`.
    pub kind: String,
    pub uri: String,
}

/// What a worker build can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub version: String,
    #[serde(default)]
    pub source_types: Vec<String>,
}

// =========================================================================
// Worker -> control plane
// =========================================================================

/// Frames sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register(Register),
    Heartbeat(Heartbeat),
    Ack(Ack),
    Event(Event),
    Deregister { worker_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub worker_id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub capacity: u32,
    pub capability: Capability,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    #[serde(default)]
    pub frames_processed: u64,
    #[serde(default)]
    pub detections: u64,
    #[serde(default)]
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub metrics: WorkerMetrics,
    #[serde(default)]
    pub renewals: Vec<LeaseRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Intent applied (or already applied).
    Ok,
    /// Intent not applicable in the worker's current state.
    Rejected,
    /// Intent accepted but its effect failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub intent_id: String,
    pub camera_id: String,
    pub generation: i64,
    pub status: AckStatus,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PipelineReady,
    PipelineError,
    Reconnecting,
    Recovered,
    LeaseReleased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub camera_id: String,
    pub generation: i64,
    pub sequence: u64,
    pub kind: EventKind,
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn key(&self) -> EventKey<'_> {
        EventKey {
            camera_id: &self.camera_id,
            generation: self.generation,
            sequence: self.sequence,
        }
    }

    /// Human-readable detail carried in the payload, if any.
    pub fn detail(&self) -> Option<&str> {
        self.payload.get("detail").and_then(Value::as_str)
    }
}

// =========================================================================
// Control plane -> worker
// =========================================================================

/// Frames sent by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Registered(Registered),
    Rejected { reason: String },
    HeartbeatAck(HeartbeatAck),
    Start(StartIntent),
    Stop(StopIntent),
    Drain(DrainIntent),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registered {
    pub worker_id: String,
    pub heartbeat_interval_secs: u64,
    pub lease_ttl_secs: u64,
}

/// A renewal the control plane refused: a newer generation (or nobody) owns
/// the camera now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub camera_id: String,
    pub stale_generation: i64,
    pub current_generation: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatAck {
    #[serde(default)]
    pub renewed: Vec<LeaseRef>,
    #[serde(default)]
    pub invalidated: Vec<Invalidation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartParams {
    pub model_version: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartIntent {
    pub intent_id: String,
    pub camera_id: String,
    pub generation: i64,
    pub source: SourceDescriptor,
    pub params: StartParams,
}

impl StartIntent {
    pub fn key(&self) -> IntentKey {
        IntentKey {
            camera_id: self.camera_id.clone(),
            generation: self.generation,
            intent_id: self.intent_id.clone(),
        }
    }

    pub fn lease(&self) -> LeaseRef {
        LeaseRef::new(self.camera_id.clone(), self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopIntent {
    pub intent_id: String,
    pub camera_id: String,
    pub generation: i64,
    pub reason: String,
}

impl StopIntent {
    pub fn key(&self) -> IntentKey {
        IntentKey {
            camera_id: self.camera_id.clone(),
            generation: self.generation,
            intent_id: self.intent_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainIntent {
    pub intent_id: String,
    pub reason: String,
}

// =========================================================================
// Administrative surface
// =========================================================================

/// Camera catalog entry supplied by the business layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSpec {
    pub camera_id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub source: SourceDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AdminRequest {
    LeaseState { camera_id: String },
    ListLeases { site_id: Option<String> },
    ForceRelease { camera_id: String, reason: String },
    WorkerHealth,
    UpsertCamera(CameraSpec),
    DisableCamera { camera_id: String },
    PauseCamera { camera_id: String, reason: String },
    ResumeCamera { camera_id: String },
    ClearWorker { worker_id: String },
    DrainWorker { worker_id: String, reason: String },
}

/// Operator view of one lease row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseView {
    pub camera_id: String,
    pub worker_id: Option<String>,
    pub generation: i64,
    pub state: LeaseState,
    pub expires_at: i64,
    pub reclaim_at: Option<i64>,
    pub reason: String,
    pub updated_at: i64,
}

/// Operator view of one worker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub status: WorkerStatus,
    pub capacity: u32,
    /// Leases currently held, derived from the lease table.
    pub load: u32,
    pub version: String,
    pub last_seen: i64,
    pub stale: bool,
    pub connected: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum AdminResponse {
    Lease(Option<LeaseView>),
    Leases(Vec<LeaseView>),
    Released(bool),
    Workers(Vec<WorkerHealth>),
    Ok,
    Error(String),
}
