//! Face detection pipeline seam.
//!
//! The recognition pipeline is an external capability. The agent only starts
//! and stops it and consumes the signals it reports.

mod process;

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use vigil_core::protocol::{LeaseRef, SourceDescriptor, StartParams};

pub use process::ProcessPipeline;

/// Errors from pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to spawn pipeline: {reason}")]
    SpawnFailed { reason: String },

    #[error("Unsupported source kind: {0}")]
    UnsupportedSource(String),
}

/// One running pipeline instance.
#[derive(Debug)]
pub struct PipelineHandle {
    pub id: String,
    pub lease: LeaseRef,
}

/// Bounding box in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A face found in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub timestamp: i64,
    /// Reference to the embedding stored by the pipeline.
    pub embedding_ref: String,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub confidence: f32,
}

/// What a pipeline reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PipelineSignal {
    Ready,
    Detection(Detection),
    /// Frames decoded since the previous report.
    Stats { frames_processed: u64 },
    TransientFault { detail: String },
    UnrecoverableFault { detail: String },
}

/// A signal tagged with the handle that produced it, so signals from a
/// stopped instance can be told apart from the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedSignal {
    pub handle_id: String,
    pub signal: PipelineSignal,
}

/// Start/stop control over the external pipeline.
pub trait Pipeline: Send + Sync + 'static {
    /// Start processing `source` for `lease`. Signals are pushed into
    /// `signals` until the instance stops.
    fn start(
        &self,
        lease: &LeaseRef,
        source: &SourceDescriptor,
        params: &StartParams,
        signals: mpsc::Sender<TaggedSignal>,
    ) -> impl Future<Output = Result<PipelineHandle, PipelineError>> + Send;

    fn stop(&self, handle: PipelineHandle) -> impl Future<Output = Result<(), PipelineError>> + Send;
}
