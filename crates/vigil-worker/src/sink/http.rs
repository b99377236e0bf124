//! JSON POST delivery to the business application's ingestion endpoint.

use std::time::Duration;

use super::{DetectionRecord, DetectionSink, SinkError};

#[derive(Debug, Clone)]
pub struct HttpDetectionSink {
    http: reqwest::Client,
    url: String,
}

impl HttpDetectionSink {
    pub fn new(url: &str) -> Result<Self, SinkError> {
        if url.is_empty() {
            return Err(SinkError::Config("ingest url is empty".into()));
        }

        // reqwest is built with `rustls-no-provider`; an `Err` here only means
        // a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl DetectionSink for HttpDetectionSink {
    async fn deliver(&self, record: DetectionRecord) -> Result<(), SinkError> {
        let resp = self.http.post(&self.url).json(&record).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SinkError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").into(),
            });
        }
        Ok(())
    }
}
