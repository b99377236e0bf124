//! OTLP export of traces and lease metrics.
//!
//! Compiled only with the `metrics` feature. Both signals go to the same
//! collector endpoint over gRPC.

use std::sync::OnceLock;

use opentelemetry::metrics::Counter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracerProvider, Tracer};

const METER: &str = "vigil";

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the export pipeline alive. Dropping it does not flush; call
/// [`MetricsGuard::shutdown`] before exit.
pub struct MetricsGuard {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
}

impl MetricsGuard {
    pub fn tracer(&self, name: &'static str) -> Tracer {
        self.traces.tracer(name)
    }

    /// Flush buffered spans and metrics and stop exporting.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.traces.shutdown()?;
        self.metrics.shutdown()?;
        Ok(())
    }
}

/// Install global tracer and meter providers exporting to `endpoint`
/// (e.g. `http://localhost:4317`).
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let readings = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let traces = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .build();
    let metrics = SdkMeterProvider::builder()
        .with_periodic_exporter(readings)
        .build();
    global::set_tracer_provider(traces.clone());
    global::set_meter_provider(metrics.clone());

    Ok(MetricsGuard { traces, metrics })
}

/// Lease transitions recorded by the control plane.
pub mod lease_counters {
    use super::{Counter, KeyValue, METER, OnceLock, global};

    fn transitions() -> &'static Counter<u64> {
        static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
        COUNTER.get_or_init(|| {
            global::meter(METER)
                .u64_counter("vigil.lease.transitions")
                .with_description("Lease state transitions by kind")
                .build()
        })
    }

    /// Count one `acquired`, `renewed`, `released`, `orphaned` or
    /// `reclaimed` transition.
    pub fn record(transition: &'static str) {
        transitions().add(1, &[KeyValue::new("transition", transition)]);
    }
}
