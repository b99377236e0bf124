//! Per-worker control channel session.
//!
//! One task per connection. The first frame must be REGISTER; after that the
//! session renews leases on heartbeats, resolves ACKs against the intents
//! table and applies events in per-(camera, generation) sequence order. Any
//! frame carrying a generation older than the stored one is dropped and
//! answered with an invalidation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use vigil_core::protocol::{
    Ack, AckStatus, ControlMessage, Event, EventKind, Heartbeat, HeartbeatAck, Invalidation,
    Registered, WorkerMessage, WorkerStatus,
};

use crate::ControlPlane;
use crate::registry::{RegisterError, WorkerConnection};
use crate::storage::{DatabaseError, IntentKind, IntentStatus};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection closed before REGISTER")]
    NotRegistered,

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Drive one worker connection until it closes or the worker deregisters.
pub async fn run_session(
    plane: ControlPlane,
    mut inbound: mpsc::Receiver<WorkerMessage>,
    outbound: mpsc::Sender<ControlMessage>,
) -> Result<(), SessionError> {
    let register = match inbound.recv().await {
        Some(WorkerMessage::Register(register)) => register,
        Some(other) => {
            let reason = "first frame must be REGISTER".to_string();
            warn!(frame = ?other, "{reason}");
            let _ = outbound.send(ControlMessage::Rejected { reason: reason.clone() }).await;
            return Err(SessionError::Rejected(reason));
        }
        None => return Err(SessionError::NotRegistered),
    };

    let worker = match plane.workers.register(&register).await {
        Ok(worker) => worker,
        Err(RegisterError::Database(e)) => return Err(e.into()),
        Err(e) => {
            let reason = e.to_string();
            warn!(worker_id = %register.worker_id, reason = %reason, "Registration rejected");
            let _ = outbound.send(ControlMessage::Rejected { reason: reason.clone() }).await;
            return Err(SessionError::Rejected(reason));
        }
    };

    let registered = ControlMessage::Registered(Registered {
        worker_id: worker.id.clone(),
        heartbeat_interval_secs: plane.config.heartbeat_interval_secs,
        lease_ttl_secs: plane.config.lease_ttl_secs,
    });
    if outbound.send(registered).await.is_err() {
        return Ok(());
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let conn = plane
        .connections
        .register(WorkerConnection::new(
            worker.id.clone(),
            session_id.clone(),
            worker.tenant_id.clone(),
            worker.site_id.clone(),
            outbound,
        ))
        .await;

    let session = Session {
        plane,
        conn: Arc::clone(&conn),
        worker_id: worker.id.clone(),
    };
    let outcome = session.serve(&mut inbound).await;

    conn.cancel_all_pending().await;
    let current = session
        .plane
        .connections
        .unregister(&session.worker_id, &session_id)
        .await;
    match outcome {
        Ok(Closed::Deregistered) => {
            session
                .plane
                .dispatcher
                .release_all(&session.worker_id, "worker deregistered")
                .await?;
            session
                .plane
                .workers
                .set_status(&session.worker_id, WorkerStatus::Stopped, Some("deregistered"))
                .await?;
        }
        Ok(Closed::Disconnected) if current => {
            info!(worker_id = %session.worker_id, "Worker channel lost");
            session
                .plane
                .workers
                .set_status(&session.worker_id, WorkerStatus::Reconnecting, Some("channel lost"))
                .await?;
        }
        Ok(Closed::Disconnected) => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

enum Closed {
    Disconnected,
    Deregistered,
}

struct Session {
    plane: ControlPlane,
    conn: Arc<WorkerConnection>,
    worker_id: String,
}

impl Session {
    async fn serve(
        &self,
        inbound: &mut mpsc::Receiver<WorkerMessage>,
    ) -> Result<Closed, SessionError> {
        match self.plane.dispatcher.redeliver_starts(&self.worker_id).await {
            Ok(_) => {}
            Err(e) => warn!(worker_id = %self.worker_id, error = %e, "START redelivery failed"),
        }
        self.fill().await;

        while let Some(msg) = inbound.recv().await {
            match msg {
                WorkerMessage::Register(register) => {
                    warn!(
                        worker_id = %self.worker_id,
                        claimed = %register.worker_id,
                        "Ignoring REGISTER on an established session"
                    );
                }
                WorkerMessage::Heartbeat(heartbeat) => {
                    if heartbeat.worker_id != self.worker_id {
                        warn!(
                            worker_id = %self.worker_id,
                            claimed = %heartbeat.worker_id,
                            "Heartbeat for another worker ignored"
                        );
                        continue;
                    }
                    let ack = self.handle_heartbeat(&heartbeat).await?;
                    if self.conn.send(ControlMessage::HeartbeatAck(ack)).await.is_err() {
                        break;
                    }
                    self.fill().await;
                }
                WorkerMessage::Ack(ack) => self.handle_ack(ack).await?,
                WorkerMessage::Event(event) => self.handle_event(&event).await?,
                WorkerMessage::Deregister { worker_id } => {
                    if worker_id == self.worker_id {
                        info!(worker_id = %self.worker_id, "Worker deregistered");
                        return Ok(Closed::Deregistered);
                    }
                    warn!(worker_id = %self.worker_id, claimed = %worker_id, "Foreign DEREGISTER ignored");
                }
            }
        }
        Ok(Closed::Disconnected)
    }

    async fn fill(&self) {
        match self.plane.assignment.fill(&self.worker_id).await {
            Ok(acquired) if !acquired.is_empty() => {
                debug!(worker_id = %self.worker_id, count = acquired.len(), "Assigned cameras");
            }
            Ok(_) => {}
            Err(e) => warn!(worker_id = %self.worker_id, error = %e, "Assignment failed"),
        }
    }

    /// Tell the worker to abandon a camera it no longer owns.
    async fn invalidate(&self, camera_id: &str, stale_generation: i64, current_generation: i64) {
        let msg = ControlMessage::HeartbeatAck(HeartbeatAck {
            renewed: Vec::new(),
            invalidated: vec![Invalidation {
                camera_id: camera_id.to_string(),
                stale_generation,
                current_generation,
            }],
        });
        let _ = self.conn.send(msg).await;
    }

    #[instrument(skip(self, heartbeat), fields(worker_id = %self.worker_id, status = %heartbeat.status))]
    async fn handle_heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatAck, SessionError> {
        if !self
            .plane
            .workers
            .heartbeat(&self.worker_id, heartbeat.status)
            .await?
        {
            warn!("Heartbeat from a worker without a record");
        }

        let mut ack = HeartbeatAck::default();
        for lease in &heartbeat.renewals {
            match self
                .plane
                .leases
                .renew(&lease.camera_id, lease.generation, &self.worker_id)
                .await
            {
                Ok(true) => ack.renewed.push(lease.clone()),
                Ok(false) => {
                    let current = self
                        .plane
                        .leases
                        .current_generation(&lease.camera_id)
                        .await?;
                    warn!(
                        camera_id = %lease.camera_id,
                        stale_generation = lease.generation,
                        current_generation = current,
                        "Renewal refused, invalidating"
                    );
                    ack.invalidated.push(Invalidation {
                        camera_id: lease.camera_id.clone(),
                        stale_generation: lease.generation,
                        current_generation: current,
                    });
                }
                // Neither renewed nor invalidated: the worker keeps going and
                // the next heartbeat retries.
                Err(e) => warn!(camera_id = %lease.camera_id, error = %e, "Renewal failed"),
            }
        }
        Ok(ack)
    }

    #[instrument(skip(self, ack), fields(worker_id = %self.worker_id, intent_id = %ack.intent_id))]
    async fn handle_ack(&self, ack: Ack) -> Result<(), SessionError> {
        let plane = &self.plane;
        let Some(intent) = plane.db.get_intent(&ack.intent_id).await? else {
            warn!("ACK for unknown intent");
            self.conn.complete_pending(ack).await;
            return Ok(());
        };
        if intent.worker_id != self.worker_id {
            warn!(owner = %intent.worker_id, "ACK for another worker's intent ignored");
            return Ok(());
        }

        let status = match ack.status {
            AckStatus::Ok => IntentStatus::Acked,
            AckStatus::Rejected | AckStatus::Failed => IntentStatus::Failed,
        };
        let now = plane.clock.now();
        if !plane
            .db
            .resolve_intent(&ack.intent_id, status, &ack.detail, now)
            .await?
        {
            debug!("Duplicate ACK");
            self.conn.complete_pending(ack).await;
            return Ok(());
        }

        match intent.kind() {
            Some(IntentKind::Start) => {
                if ack.status != AckStatus::Ok {
                    let reason = format!("start failed: {}", ack.detail);
                    if plane
                        .leases
                        .release_held(&intent.camera_id, intent.generation, &self.worker_id, &reason)
                        .await?
                    {
                        info!(camera_id = %intent.camera_id, generation = intent.generation, "Released after failed START");
                    }
                } else {
                    self.reject_if_stale(&intent.camera_id, intent.generation).await?;
                }
            }
            Some(IntentKind::Stop) => {
                plane
                    .leases
                    .release_held(&intent.camera_id, intent.generation, &self.worker_id, "stopped")
                    .await?;
                self.conn.complete_pending(ack).await;
                self.fill().await;
                return Ok(());
            }
            Some(IntentKind::Drain) => {
                let released = plane.dispatcher.release_all(&self.worker_id, "drained").await?;
                info!(released, "Drain acknowledged");
            }
            None => warn!(kind = %intent.kind, "Intent of unknown kind"),
        }
        self.conn.complete_pending(ack).await;
        Ok(())
    }

    /// Whether this worker owns `camera_id` at `generation`, plus the
    /// camera's current generation.
    async fn holds(&self, camera_id: &str, generation: i64) -> Result<(bool, i64), SessionError> {
        let lease = self.plane.leases.get(camera_id).await?;
        let current = lease.as_ref().map_or(0, |l| l.generation);
        let owned = lease
            .as_ref()
            .is_some_and(|l| l.worker_id.as_deref() == Some(self.worker_id.as_str()));
        Ok((owned && generation == current, current))
    }

    /// Send an invalidation if `generation` is no longer the camera's current
    /// generation for this worker. Returns whether it was stale.
    async fn reject_if_stale(&self, camera_id: &str, generation: i64) -> Result<bool, SessionError> {
        let (held, current) = self.holds(camera_id, generation).await?;
        if held {
            return Ok(false);
        }
        debug!(camera_id, generation, current, "Stale generation");
        self.invalidate(camera_id, generation, current).await;
        Ok(true)
    }

    #[instrument(
        skip(self, event),
        fields(
            worker_id = %self.worker_id,
            camera_id = %event.camera_id,
            generation = event.generation,
            sequence = event.sequence,
        )
    )]
    async fn handle_event(&self, event: &Event) -> Result<(), SessionError> {
        let plane = &self.plane;
        let camera_id = event.camera_id.as_str();
        let generation = event.generation;

        // A release for a lease already given up needs no invalidation, but
        // it must never touch a lease someone else holds.
        let foreign = if event.kind == EventKind::LeaseReleased {
            !self.holds(camera_id, generation).await?.0
        } else {
            self.reject_if_stale(camera_id, generation).await?
        };
        if foreign {
            warn!(kind = ?event.kind, "Event for a lease this worker does not hold dropped");
            return Ok(());
        }

        if !plane
            .leases
            .accept_event(camera_id, generation, event.sequence)
            .await?
        {
            debug!("Duplicate, out-of-order or stale event dropped");
            return Ok(());
        }

        let detail = event.detail().unwrap_or_default();
        match event.kind {
            EventKind::PipelineReady => {
                plane.leases.set_reason(camera_id, generation, "pipeline ready").await?;
                plane
                    .workers
                    .set_status(&self.worker_id, WorkerStatus::Running, None)
                    .await?;
                info!("Pipeline ready");
            }
            EventKind::PipelineError => {
                let reason = if detail.is_empty() {
                    "pipeline error".to_string()
                } else {
                    format!("pipeline error: {detail}")
                };
                plane
                    .leases
                    .release_held(camera_id, generation, &self.worker_id, &reason)
                    .await?;
                let fatal = event
                    .payload
                    .get("fatal")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if fatal {
                    plane
                        .workers
                        .set_status(&self.worker_id, WorkerStatus::Error, Some(&reason))
                        .await?;
                }
                warn!(fatal, reason = %reason, "Pipeline failure reported, lease released");
            }
            EventKind::Reconnecting => {
                let reason = format!("reconnecting: {detail}");
                plane.leases.set_reason(camera_id, generation, &reason).await?;
                plane
                    .workers
                    .set_status(&self.worker_id, WorkerStatus::Reconnecting, Some(detail))
                    .await?;
            }
            EventKind::Recovered => {
                plane.leases.set_reason(camera_id, generation, "recovered").await?;
                plane
                    .workers
                    .set_status(&self.worker_id, WorkerStatus::Running, None)
                    .await?;
            }
            EventKind::LeaseReleased => {
                let reason = if detail.is_empty() { "released by worker" } else { detail };
                if plane
                    .leases
                    .release_held(camera_id, generation, &self.worker_id, reason)
                    .await?
                {
                    info!(reason, "Worker released lease");
                }
            }
        }
        Ok(())
    }
}
