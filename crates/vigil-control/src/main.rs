//! Vigil Control Plane
//!
//! Owns camera leases, assigns cameras to edge workers and reclaims leases
//! from workers that go silent.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use vigil_control::ControlPlane;
use vigil_control::server::{AdminService, send_admin_request, serve_admin, serve_workers};
use vigil_control::storage::ControlDatabase;
use vigil_core::SystemClock;
use vigil_core::config::load_config;
use vigil_core::protocol::{AdminRequest, AdminResponse, CameraSpec, SourceDescriptor};

#[derive(Parser, Debug)]
#[command(name = "vigil-control")]
#[command(version, about = "Vigil control plane - camera leases and worker lifecycle")]
struct Cli {
    /// Explicit config file (JSON), merged over the global settings file.
    #[arg(long, global = true, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug").
    #[arg(long, global = true, default_value = "info", env = "VIGIL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "VIGIL_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, global = true, env = "VIGIL_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control plane (default).
    Serve(ServeArgs),
    /// Talk to a running control plane's admin listener.
    Admin(AdminArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Worker channel listen address.
    #[arg(long)]
    addr: Option<String>,

    /// Admin listen address.
    #[arg(long)]
    admin_addr: Option<String>,

    /// Path to SQLite database file.
    #[arg(long, env = "VIGIL_DB_PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AdminArgs {
    /// Admin listener to connect to (defaults to `control.admin_addr`).
    #[arg(long, env = "VIGIL_ADMIN_ADDR")]
    addr: Option<String>,

    #[command(subcommand)]
    op: AdminOp,
}

#[derive(Subcommand, Debug)]
enum AdminOp {
    /// Show a camera's lease.
    Lease { camera_id: String },
    /// List leases, optionally for one site.
    Leases {
        #[arg(long)]
        site: Option<String>,
    },
    /// Force-release a camera's lease and stop its owner.
    Release {
        camera_id: String,
        #[arg(long, default_value = "operator release")]
        reason: String,
    },
    /// List worker health.
    Workers,
    /// Add or update a camera.
    UpsertCamera {
        camera_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        site: String,
        #[arg(long)]
        uri: String,
        #[arg(long, default_value = "rtsp")]
        kind: String,
    },
    /// Disable a camera and stop whoever processes it.
    Disable { camera_id: String },
    /// Pause a camera until resumed.
    Pause {
        camera_id: String,
        #[arg(long, default_value = "paused by operator")]
        reason: String,
    },
    /// Resume a paused camera.
    Resume { camera_id: String },
    /// Clear a worker's error state.
    Clear { worker_id: String },
    /// Drain a worker.
    Drain {
        worker_id: String,
        #[arg(long, default_value = "drained by operator")]
        reason: String,
    },
}

impl AdminOp {
    fn into_request(self) -> AdminRequest {
        match self {
            Self::Lease { camera_id } => AdminRequest::LeaseState { camera_id },
            Self::Leases { site } => AdminRequest::ListLeases { site_id: site },
            Self::Release { camera_id, reason } => AdminRequest::ForceRelease { camera_id, reason },
            Self::Workers => AdminRequest::WorkerHealth,
            Self::UpsertCamera {
                camera_id,
                tenant,
                site,
                uri,
                kind,
            } => AdminRequest::UpsertCamera(CameraSpec {
                camera_id,
                tenant_id: tenant,
                site_id: site,
                source: SourceDescriptor { kind, uri },
            }),
            Self::Disable { camera_id } => AdminRequest::DisableCamera { camera_id },
            Self::Pause { camera_id, reason } => AdminRequest::PauseCamera { camera_id, reason },
            Self::Resume { camera_id } => AdminRequest::ResumeCamera { camera_id },
            Self::Clear { worker_id } => AdminRequest::ClearWorker { worker_id },
            Self::Drain { worker_id, reason } => AdminRequest::DrainWorker { worker_id, reason },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let metrics_endpoint = metrics_endpoint(&cli);

    match cli.command {
        Some(Command::Admin(args)) => {
            let addr = args.addr.unwrap_or(config.control.admin_addr);
            run_admin(&addr, args.op.into_request()).await
        }
        command => {
            let args = match command {
                Some(Command::Serve(args)) => args,
                _ => ServeArgs::default(),
            };
            serve(&cli.log_level, cli.log_json, metrics_endpoint, config, args).await
        }
    }
}

#[cfg(feature = "metrics")]
fn metrics_endpoint(cli: &Cli) -> Option<String> {
    cli.metrics_endpoint.clone()
}

#[cfg(not(feature = "metrics"))]
const fn metrics_endpoint(_cli: &Cli) -> Option<String> {
    None
}

#[allow(clippy::print_stdout)]
async fn run_admin(addr: &str, request: AdminRequest) -> anyhow::Result<()> {
    let response = send_admin_request(addr, request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if let AdminResponse::Error(message) = response {
        anyhow::bail!(message);
    }
    Ok(())
}

async fn serve(
    log_level: &str,
    log_json: bool,
    metrics_endpoint: Option<String>,
    mut config: vigil_core::Config,
    args: ServeArgs,
) -> anyhow::Result<()> {
    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!("vigil_control={log_level}");
    let _metrics_guard = vigil_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        log_json,
        metrics_endpoint.as_deref(),
    );

    if let Some(addr) = args.addr {
        config.control.listen_addr = addr;
    }
    if let Some(addr) = args.admin_addr {
        config.control.admin_addr = addr;
    }
    if let Some(path) = args.db_path {
        config.control.database_path = Some(path);
    }
    semver::Version::parse(&config.control.min_worker_version).map_err(|e| {
        anyhow::anyhow!(
            "invalid min_worker_version '{}': {e}",
            config.control.min_worker_version
        )
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.control.listen_addr,
        admin_addr = %config.control.admin_addr,
        lease_ttl_secs = config.control.lease_ttl_secs,
        grace_secs = config.reclaim.grace_secs,
        "Starting vigil-control"
    );

    let db_path = match config.control.database_path.clone() {
        Some(path) => path,
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening control database");
    let db = ControlDatabase::open(&db_path).await?;

    let plane = ControlPlane::new(db.clone(), Arc::new(SystemClock), config.control.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler = plane.reclaim_scheduler(config.reclaim.clone());
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let admin_listener = TcpListener::bind(&config.control.admin_addr).await?;
    let admin_handle = tokio::spawn(serve_admin(
        admin_listener,
        AdminService::new(plane.clone()),
        shutdown_rx.clone(),
    ));

    let worker_listener = TcpListener::bind(&config.control.listen_addr).await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = serve_workers(worker_listener, plane, shutdown_rx) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    match admin_handle.await {
        Ok(Err(e)) => warn!(error = %e, "Admin listener failed"),
        Err(e) => warn!(error = %e, "Admin listener task panicked"),
        Ok(Ok(())) => {}
    }
    db.close().await;

    info!("Control plane stopped");
    Ok(())
}

/// Default database path: ~/.vigil/control.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".vigil").join("control.db"))
}
