//! Administrative surface.
//!
//! `AdminService` answers operator requests against the lease table and
//! worker records. It is served over its own TCP listener with the same
//! NDJSON framing as the worker channel and is what the `vigil-control
//! admin` subcommands talk to.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use vigil_core::protocol::{
    AdminRequest, AdminResponse, CameraSpec, ControlMessage, LeaseView, WorkerHealth,
    WorkerStatus, bridge,
};

use crate::ControlPlane;
use crate::storage::DatabaseError;

/// Attempts at a read-then-CAS admin mutation before giving up.
const CAS_ATTEMPTS: usize = 3;

/// How long the admin client waits for a response.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] DatabaseError),

    #[error("admin connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("admin request timed out")]
    Timeout,

    #[error("admin connection closed without a response")]
    Closed,
}

#[derive(Clone)]
pub struct AdminService {
    plane: ControlPlane,
}

impl AdminService {
    pub const fn new(plane: ControlPlane) -> Self {
        Self { plane }
    }

    /// Dispatch one request. Errors become `AdminResponse::Error`.
    pub async fn handle(&self, request: AdminRequest) -> AdminResponse {
        let result = match request {
            AdminRequest::LeaseState { camera_id } => {
                self.lease_state(&camera_id).await.map(AdminResponse::Lease)
            }
            AdminRequest::ListLeases { site_id } => {
                self.list_leases(site_id.as_deref()).await.map(AdminResponse::Leases)
            }
            AdminRequest::ForceRelease { camera_id, reason } => self
                .force_release(&camera_id, &reason)
                .await
                .map(AdminResponse::Released),
            AdminRequest::WorkerHealth => self.worker_health().await.map(AdminResponse::Workers),
            AdminRequest::UpsertCamera(spec) => {
                self.upsert_camera(&spec).await.map(|()| AdminResponse::Ok)
            }
            AdminRequest::DisableCamera { camera_id } => {
                self.disable_camera(&camera_id).await.map(|()| AdminResponse::Ok)
            }
            AdminRequest::PauseCamera { camera_id, reason } => self
                .pause_camera(&camera_id, &reason)
                .await
                .map(|()| AdminResponse::Ok),
            AdminRequest::ResumeCamera { camera_id } => {
                self.resume_camera(&camera_id).await.map(|()| AdminResponse::Ok)
            }
            AdminRequest::ClearWorker { worker_id } => {
                self.clear_worker(&worker_id).await.map(|()| AdminResponse::Ok)
            }
            AdminRequest::DrainWorker { worker_id, reason } => self
                .drain_worker(&worker_id, &reason)
                .await
                .map(|()| AdminResponse::Ok),
        };
        result.unwrap_or_else(|e| AdminResponse::Error(e.to_string()))
    }

    pub async fn lease_state(&self, camera_id: &str) -> Result<Option<LeaseView>, AdminError> {
        Ok(self.plane.leases.get(camera_id).await?.map(|l| l.view()))
    }

    pub async fn list_leases(&self, site_id: Option<&str>) -> Result<Vec<LeaseView>, AdminError> {
        let leases = self.plane.db.list_leases(site_id).await?;
        Ok(leases.iter().map(crate::storage::Lease::view).collect())
    }

    /// Release a camera's lease regardless of its owner's state and tell the
    /// owner to stop. Returns `false` when the lease had no owner.
    ///
    /// The lease is terminated before the STOP goes out, not when it is
    /// acknowledged. The camera can be reassigned while the old owner is
    /// still tearing its pipeline down; the bumped generation makes that
    /// owner's later renewals and events stale, and its STOP ACK finds
    /// nothing left to release.
    #[instrument(skip(self))]
    pub async fn force_release(&self, camera_id: &str, reason: &str) -> Result<bool, AdminError> {
        for _ in 0..CAS_ATTEMPTS {
            let lease = self
                .plane
                .leases
                .get(camera_id)
                .await?
                .ok_or_else(|| AdminError::NotFound(format!("camera {camera_id}")))?;
            let Some(owner) = lease.worker_id.clone() else {
                return Ok(false);
            };
            if self
                .plane
                .leases
                .release(camera_id, lease.generation, reason)
                .await?
            {
                info!(worker_id = %owner, generation = lease.generation, "Lease force-released");
                self.plane
                    .dispatcher
                    .stop(&owner, camera_id, lease.generation, reason)
                    .await?;
                return Ok(true);
            }
            debug!("Lease changed under force release, retrying");
        }
        Err(AdminError::Conflict(format!("lease for {camera_id} kept changing")))
    }

    pub async fn worker_health(&self) -> Result<Vec<WorkerHealth>, AdminError> {
        let mut health = Vec::new();
        for worker in self.plane.workers.list().await? {
            let load = self.plane.leases.load_of(&worker.id).await?;
            health.push(WorkerHealth {
                stale: self.plane.workers.is_stale(&worker),
                connected: self.plane.connections.is_connected(&worker.id).await,
                status: worker.status(),
                capacity: u32::try_from(worker.capacity).unwrap_or(0),
                load,
                worker_id: worker.id,
                tenant_id: worker.tenant_id,
                site_id: worker.site_id,
                version: worker.version,
                last_seen: worker.last_seen,
                reason: worker.reason,
            });
        }
        Ok(health)
    }

    #[instrument(skip(self, spec), fields(camera_id = %spec.camera_id))]
    pub async fn upsert_camera(&self, spec: &CameraSpec) -> Result<(), AdminError> {
        self.plane
            .db
            .upsert_camera(
                &spec.camera_id,
                &spec.tenant_id,
                &spec.site_id,
                &spec.source.kind,
                &spec.source.uri,
                self.plane.clock.now(),
            )
            .await?;
        info!(site_id = %spec.site_id, "Camera upserted");
        Ok(())
    }

    /// Disable a camera and stop whoever is processing it.
    #[instrument(skip(self))]
    pub async fn disable_camera(&self, camera_id: &str) -> Result<(), AdminError> {
        if !self
            .plane
            .db
            .set_camera_enabled(camera_id, false, self.plane.clock.now())
            .await?
        {
            return Err(AdminError::NotFound(format!("camera {camera_id}")));
        }
        self.force_release(camera_id, "camera disabled").await?;
        info!("Camera disabled");
        Ok(())
    }

    /// Pause a camera: it keeps its generation but is not assignable until
    /// resumed. A current owner is told to stop.
    #[instrument(skip(self))]
    pub async fn pause_camera(&self, camera_id: &str, reason: &str) -> Result<(), AdminError> {
        if self.plane.db.get_camera(camera_id).await?.is_none() {
            return Err(AdminError::NotFound(format!("camera {camera_id}")));
        }
        self.plane.leases.ensure(camera_id).await?;

        for _ in 0..CAS_ATTEMPTS {
            let Some(lease) = self.plane.leases.get(camera_id).await? else {
                break;
            };
            if lease.state() == vigil_core::protocol::LeaseState::Paused {
                return Ok(());
            }
            let now = self.plane.clock.now();
            if self
                .plane
                .db
                .pause_lease(camera_id, lease.generation, reason, now)
                .await?
            {
                if let Some(owner) = lease.worker_id {
                    self.plane
                        .dispatcher
                        .stop(&owner, camera_id, lease.generation, reason)
                        .await?;
                }
                info!("Camera paused");
                return Ok(());
            }
        }
        Err(AdminError::Conflict(format!("lease for {camera_id} kept changing")))
    }

    pub async fn resume_camera(&self, camera_id: &str) -> Result<(), AdminError> {
        if self
            .plane
            .db
            .resume_lease(camera_id, self.plane.clock.now())
            .await?
        {
            info!(camera_id, "Camera resumed");
            Ok(())
        } else {
            Err(AdminError::Conflict(format!("camera {camera_id} is not paused")))
        }
    }

    /// Clear a worker's ERROR state.
    #[instrument(skip(self))]
    pub async fn clear_worker(&self, worker_id: &str) -> Result<(), AdminError> {
        let worker = self
            .plane
            .workers
            .get(worker_id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("worker {worker_id}")))?;
        if !self.plane.workers.clear(worker_id).await? {
            return Err(AdminError::Conflict(format!(
                "worker {worker_id} is {}, not error",
                worker.status
            )));
        }
        if !self
            .plane
            .connections
            .send_to(worker_id, ControlMessage::Clear)
            .await
        {
            warn!("Worker not connected, clearing the record only");
        }
        info!("Worker cleared");
        Ok(())
    }

    /// Drain a worker: it stops everything, releases its leases and goes to
    /// STOPPED.
    #[instrument(skip(self))]
    pub async fn drain_worker(&self, worker_id: &str, reason: &str) -> Result<(), AdminError> {
        if self.plane.workers.get(worker_id).await?.is_none() {
            return Err(AdminError::NotFound(format!("worker {worker_id}")));
        }
        self.plane
            .workers
            .set_status(worker_id, WorkerStatus::Draining, Some(reason))
            .await?;
        self.plane.dispatcher.drain(worker_id, reason).await?;
        info!("Drain requested");
        Ok(())
    }
}

/// Serve admin connections until `shutdown` flips to true.
pub async fn serve_admin(
    listener: TcpListener,
    service: AdminService,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Admin listener started");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Admin accept failed");
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    let channel = bridge::<AdminRequest, AdminResponse, _>(stream, 16);
                    let (mut requests, responses, tasks) = channel.into_parts();
                    while let Some(request) = requests.recv().await {
                        debug!(peer = %peer, ?request, "Admin request");
                        let response = service.handle(request).await;
                        if responses.send(response).await.is_err() {
                            break;
                        }
                    }
                    drop(responses);
                    tasks.shutdown().await;
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Admin listener stopped");
    Ok(())
}

/// Send one request to an admin listener and wait for the response.
pub async fn send_admin_request(
    addr: &str,
    request: AdminRequest,
) -> Result<AdminResponse, AdminError> {
    let stream = TcpStream::connect(addr).await?;
    let channel = bridge::<AdminResponse, AdminRequest, _>(stream, 4);
    let (mut responses, requests, tasks) = channel.into_parts();

    requests.send(request).await.map_err(|_| AdminError::Closed)?;
    let response = tokio::time::timeout(CLIENT_TIMEOUT, responses.recv())
        .await
        .map_err(|_| AdminError::Timeout)?
        .ok_or(AdminError::Closed);

    drop(requests);
    tasks.shutdown().await;
    response
}
