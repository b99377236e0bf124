//! Downstream delivery of detections.
//!
//! Sink failures are logged by the caller and never touch lease state.

mod http;

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pipeline::BoundingBox;

pub use http::HttpDetectionSink;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ingestion endpoint returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Sink configuration error: {0}")]
    Config(String),
}

/// A detection enriched with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub tenant_id: String,
    pub site_id: String,
    pub camera_id: String,
    pub generation: i64,
    pub worker_id: String,
    pub timestamp: i64,
    pub embedding_ref: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

pub trait DetectionSink: Send + Sync + 'static {
    fn deliver(&self, record: DetectionRecord) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Logs detections; used when no ingestion endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDetectionSink;

impl DetectionSink for LogDetectionSink {
    async fn deliver(&self, record: DetectionRecord) -> Result<(), SinkError> {
        info!(
            camera_id = %record.camera_id,
            generation = record.generation,
            embedding_ref = %record.embedding_ref,
            confidence = record.confidence,
            "Detection"
        );
        Ok(())
    }
}

/// Either configured sink, chosen at startup.
#[derive(Debug)]
pub enum AnySink {
    Http(HttpDetectionSink),
    Log(LogDetectionSink),
}

impl DetectionSink for AnySink {
    async fn deliver(&self, record: DetectionRecord) -> Result<(), SinkError> {
        match self {
            Self::Http(sink) => sink.deliver(record).await,
            Self::Log(sink) => sink.deliver(record).await,
        }
    }
}
