//! Vigil Edge Worker
//!
//! Registers with the control plane, heartbeats, and runs the camera pipeline
//! it is assigned.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use vigil_core::config::load_config;
use vigil_core::protocol::{Capability, Register};
use vigil_worker::agent::{AgentSettings, WorkerAgent, WorkerIdentity};
use vigil_worker::client::{ClientConfig, ControlClient, ReconnectPolicy};
use vigil_worker::identity;
use vigil_worker::pipeline::ProcessPipeline;
use vigil_worker::sink::{AnySink, HttpDetectionSink, LogDetectionSink};

#[derive(Parser, Debug)]
#[command(name = "vigil-worker")]
#[command(version, about = "Vigil edge worker - runs camera pipelines under leases")]
struct Args {
    /// Explicit config file (JSON), merged over the global settings file.
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Control plane worker channel address.
    #[arg(long, env = "VIGIL_CONTROL_ADDR")]
    control_addr: Option<String>,

    /// Worker id (defaults to a generated id kept in the state directory).
    #[arg(long, env = "VIGIL_WORKER_ID")]
    worker_id: Option<String>,

    #[arg(long, env = "VIGIL_TENANT_ID")]
    tenant: Option<String>,

    #[arg(long, env = "VIGIL_SITE_ID")]
    site: Option<String>,

    /// Pipeline executable launched per camera.
    #[arg(long, env = "VIGIL_PIPELINE_COMMAND")]
    pipeline_command: Option<PathBuf>,

    /// Detection ingestion endpoint. Detections are only logged when unset.
    #[arg(long, env = "VIGIL_INGEST_URL")]
    ingest_url: Option<String>,

    /// Log level filter (e.g. "info", "debug").
    #[arg(long, default_value = "info", env = "VIGIL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "VIGIL_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "VIGIL_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[cfg(feature = "metrics")]
fn metrics_endpoint(args: &Args) -> Option<&str> {
    args.metrics_endpoint.as_deref()
}

#[cfg(not(feature = "metrics"))]
const fn metrics_endpoint(_args: &Args) -> Option<&str> {
    None
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!("vigil_worker={}", args.log_level);
    let _metrics_guard = vigil_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint(&args),
    );

    let mut settings = load_config(args.config.as_deref())?.worker;
    if let Some(addr) = args.control_addr {
        settings.control_addr = addr;
    }
    if let Some(tenant) = args.tenant {
        settings.tenant_id = tenant;
    }
    if let Some(site) = args.site {
        settings.site_id = site;
    }
    if let Some(command) = args.pipeline_command {
        settings.pipeline_command = Some(command);
    }
    if let Some(url) = args.ingest_url {
        settings.ingest_url = Some(url);
    }

    if settings.tenant_id.is_empty() || settings.site_id.is_empty() {
        anyhow::bail!("tenant and site must be configured (--tenant, --site)");
    }
    let Some(command) = settings.pipeline_command.clone() else {
        anyhow::bail!("no pipeline command configured (--pipeline-command)");
    };

    let worker_id = match args.worker_id {
        Some(id) => id,
        None => {
            let state_dir = match settings.state_dir.clone() {
                Some(dir) => dir,
                None => identity::default_state_dir()?,
            };
            identity::load_or_generate(&state_dir)?
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_id = %worker_id,
        tenant_id = %settings.tenant_id,
        site_id = %settings.site_id,
        control_addr = %settings.control_addr,
        "Starting vigil-worker"
    );

    let pipeline = ProcessPipeline::new(command, settings.source_types.clone())
        .with_args(settings.pipeline_args.clone());
    let sink = match settings.ingest_url.as_deref() {
        Some(url) => {
            let sink = HttpDetectionSink::new(url)?;
            info!(url = %sink.url(), "Delivering detections over HTTP");
            AnySink::Http(sink)
        }
        None => AnySink::Log(LogDetectionSink),
    };

    let agent_settings = AgentSettings {
        identity: WorkerIdentity {
            worker_id: worker_id.clone(),
            tenant_id: settings.tenant_id.clone(),
            site_id: settings.site_id.clone(),
        },
        readiness_timeout: settings.readiness_timeout(),
        retry: ReconnectPolicy::from_settings(&settings),
        max_consecutive_faults: settings.max_consecutive_faults,
    };
    let (agent, channels) = WorkerAgent::new(agent_settings, pipeline, sink);

    // One lifecycle machine per process, so one camera at a time.
    let registration = Register {
        worker_id,
        tenant_id: settings.tenant_id.clone(),
        site_id: settings.site_id.clone(),
        capacity: 1,
        capability: Capability {
            version: env!("CARGO_PKG_VERSION").to_string(),
            source_types: settings.source_types.clone(),
        },
    };
    let client = ControlClient::new(
        ClientConfig::new(settings.control_addr.clone(), registration),
        channels,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let agent_task = tokio::spawn(agent.run(shutdown_rx.clone()));
    let mut client_task = tokio::spawn(client.run(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let finished = tokio::select! {
        result = &mut client_task => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            None
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            None
        }
    };

    let _ = shutdown_tx.send(true);
    let result = match finished {
        Some(result) => result,
        None => client_task.await,
    };
    let _ = agent_task.await;

    match result {
        Ok(Ok(())) => {
            info!("Worker stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Control client failed");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("control client task failed: {e}")),
    }
}
