//! Log subscriber setup shared by `vigil-control` and `vigil-worker`.
//!
//! `RUST_LOG` wins over the binary's default filter. `--log-json` switches
//! the formatter to one JSON object per line for log shippers.

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

fn formatter<S>(log_json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if log_json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    }
}

/// Install the global subscriber, e.g. `init_tracing("vigil_worker=info", false)`.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(formatter(log_json))
        .init();
}

/// Install the global subscriber plus, when `metrics_endpoint` is set, an
/// OTLP span bridge. Hold the returned guard until exit.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    let Some(endpoint) = metrics_endpoint else {
        init_tracing(default_filter, log_json);
        return None;
    };
    let guard = match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => guard,
        Err(e) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, endpoint, "OTLP export unavailable, logging only");
            return None;
        }
    };

    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(tracing_opentelemetry::layer().with_tracer(guard.tracer("vigil")))
        .with(formatter(log_json))
        .init();
    Some(guard)
}

#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    _metrics_endpoint: Option<&str>,
) -> Option<()> {
    init_tracing(default_filter, log_json);
    None
}
