//! Data models for the control plane storage.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use vigil_core::protocol::{LeaseState, LeaseView, SourceDescriptor, WorkerStatus};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Camera {
    pub id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub source_kind: String,
    pub source_uri: String,
    pub enabled: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Camera {
    pub fn source(&self) -> SourceDescriptor {
        SourceDescriptor {
            kind: self.source_kind.clone(),
            uri: self.source_uri.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lease {
    pub camera_id: String,
    pub worker_id: Option<String>,
    pub generation: i64,
    pub state: String,
    pub expires_at: i64,
    pub reclaim_at: Option<i64>,
    pub last_event_seq: i64,
    pub reason: String,
    pub updated_at: i64,
}

impl Lease {
    /// Parsed state; the column is constrained by a CHECK so this only falls
    /// back on a hand-edited database.
    pub fn state(&self) -> LeaseState {
        LeaseState::from_str(&self.state).unwrap_or(LeaseState::Terminated)
    }

    pub fn view(&self) -> LeaseView {
        LeaseView {
            camera_id: self.camera_id.clone(),
            worker_id: self.worker_id.clone(),
            generation: self.generation,
            state: self.state(),
            expires_at: self.expires_at,
            reclaim_at: self.reclaim_at,
            reason: self.reason.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// An assignment candidate produced by the candidate scan.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Candidate {
    pub camera_id: String,
    pub source_kind: String,
    pub source_uri: String,
    /// Current lease generation, 0 when the camera has never been leased.
    pub generation: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Worker {
    pub id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub status: String,
    pub capacity: i64,
    pub version: String,
    /// JSON array of source kinds.
    pub source_types: String,
    pub registered_at: i64,
    pub last_seen: i64,
    pub reason: Option<String>,
}

impl Worker {
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_str(&self.status).unwrap_or(WorkerStatus::Error)
    }

    pub fn source_types(&self) -> Vec<String> {
        serde_json::from_str(&self.source_types).unwrap_or_default()
    }

    pub const fn is_stale(&self, now: i64, threshold_secs: i64) -> bool {
        now - self.last_seen > threshold_secs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IntentRecord {
    pub id: String,
    pub camera_id: String,
    pub generation: i64,
    pub worker_id: String,
    pub kind: String,
    pub status: String,
    pub detail: String,
    pub issued_at: i64,
    pub resolved_at: Option<i64>,
}

/// Kind of an issued intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Start,
    Stop,
    Drain,
}

impl IntentKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Drain => "drain",
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl IntentRecord {
    pub fn kind(&self) -> Option<IntentKind> {
        match self.kind.as_str() {
            "start" => Some(IntentKind::Start),
            "stop" => Some(IntentKind::Stop),
            "drain" => Some(IntentKind::Drain),
            _ => None,
        }
    }
}

/// Resolution status of an issued intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Pending,
    Acked,
    Failed,
    Expired,
}

impl IntentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acked => "acked",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

/// An ACTIVE lease found past its expiry by the reclaim sweep.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExpiredLease {
    pub camera_id: String,
    pub generation: i64,
    pub worker_id: Option<String>,
    pub site_id: String,
}
