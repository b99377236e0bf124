//! Issues START, STOP and DRAIN intents.
//!
//! Every intent is recorded as pending before it is sent, so an ACK can be
//! resolved from the table and unacked STARTs can be redelivered after a
//! reconnect. STOP and DRAIN arm an ACK watchdog: if the worker does not
//! answer within the drain-ack timeout the affected leases are released
//! anyway.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_core::SharedClock;
use vigil_core::protocol::{
    Ack, ControlMessage, DrainIntent, SourceDescriptor, StartIntent, StartParams, StopIntent,
};

use crate::lease::LeaseStore;
use crate::registry::ConnectionRegistry;
use crate::storage::{ControlDatabase, DatabaseError, IntentKind, IntentStatus};

#[derive(Clone)]
pub struct Dispatcher {
    db: ControlDatabase,
    clock: SharedClock,
    leases: LeaseStore,
    connections: ConnectionRegistry,
    drain_ack_timeout: Duration,
    model_version: String,
}

impl Dispatcher {
    pub fn new(
        db: ControlDatabase,
        clock: SharedClock,
        leases: LeaseStore,
        connections: ConnectionRegistry,
        drain_ack_timeout: Duration,
        model_version: String,
    ) -> Self {
        Self {
            db,
            clock,
            leases,
            connections,
            drain_ack_timeout,
            model_version,
        }
    }

    pub const fn drain_ack_timeout(&self) -> Duration {
        self.drain_ack_timeout
    }

    fn start_intent(
        &self,
        intent_id: String,
        camera_id: &str,
        generation: i64,
        source: SourceDescriptor,
    ) -> StartIntent {
        StartIntent {
            intent_id,
            camera_id: camera_id.to_string(),
            generation,
            source,
            params: StartParams {
                model_version: self.model_version.clone(),
                extra: HashMap::new(),
            },
        }
    }

    /// Record and send a START for a freshly acquired lease. A worker that is
    /// not connected gets it on its next REGISTER.
    pub async fn start(
        &self,
        worker_id: &str,
        camera_id: &str,
        generation: i64,
        source: SourceDescriptor,
    ) -> Result<StartIntent, DatabaseError> {
        let intent_id = uuid::Uuid::new_v4().to_string();
        self.db
            .record_intent(
                &intent_id,
                camera_id,
                generation,
                worker_id,
                IntentKind::Start,
                self.clock.now(),
            )
            .await?;

        let intent = self.start_intent(intent_id, camera_id, generation, source);
        if self
            .connections
            .send_to(worker_id, ControlMessage::Start(intent.clone()))
            .await
        {
            debug!(worker_id, camera_id, generation, intent_id = %intent.intent_id, "START sent");
        } else {
            warn!(worker_id, camera_id, generation, "Worker not connected, START held for redelivery");
        }
        Ok(intent)
    }

    /// Resend every unacknowledged START for leases the worker still holds.
    pub async fn redeliver_starts(&self, worker_id: &str) -> Result<usize, DatabaseError> {
        let pending = self.db.unacked_starts(worker_id).await?;
        let mut sent = 0;
        for record in pending {
            let Some(camera) = self.db.get_camera(&record.camera_id).await? else {
                continue;
            };
            let intent = self.start_intent(
                record.id,
                &record.camera_id,
                record.generation,
                camera.source(),
            );
            if self
                .connections
                .send_to(worker_id, ControlMessage::Start(intent))
                .await
            {
                sent += 1;
            }
        }
        if sent > 0 {
            info!(worker_id, count = sent, "Redelivered unacknowledged START intents");
        }
        Ok(sent)
    }

    /// Ask the owner to stop a camera. The lease is released when the ACK
    /// arrives, when the watchdog fires, or immediately if the owner is not
    /// connected.
    pub async fn stop(
        &self,
        worker_id: &str,
        camera_id: &str,
        generation: i64,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let Some(conn) = self.connections.get(worker_id).await else {
            info!(worker_id, camera_id, generation, reason, "Owner not connected, releasing directly");
            self.leases.release(camera_id, generation, reason).await?;
            return Ok(());
        };

        let intent_id = uuid::Uuid::new_v4().to_string();
        self.db
            .record_intent(
                &intent_id,
                camera_id,
                generation,
                worker_id,
                IntentKind::Stop,
                self.clock.now(),
            )
            .await?;

        let waiter = conn.register_pending(intent_id.clone()).await;
        let msg = ControlMessage::Stop(StopIntent {
            intent_id: intent_id.clone(),
            camera_id: camera_id.to_string(),
            generation,
            reason: reason.to_string(),
        });
        if conn.send(msg).await.is_err() {
            warn!(worker_id, camera_id, "Channel closed while sending STOP");
        }

        let this = self.clone();
        let camera_id = camera_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            if this.await_ack(waiter).await {
                return;
            }
            this.expire_stop(&intent_id, &camera_id, generation, &reason).await;
        });
        Ok(())
    }

    /// Wait for an ACK until the drain-ack deadline. A waiter dropped by a
    /// lost connection keeps the full deadline; the ACK may still arrive on a
    /// new session and resolve the intent from the table.
    async fn await_ack(&self, waiter: oneshot::Receiver<Ack>) -> bool {
        let deadline = Instant::now() + self.drain_ack_timeout;
        match tokio::time::timeout_at(deadline, waiter).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => {
                tokio::time::sleep_until(deadline).await;
                false
            }
            Err(_) => false,
        }
    }

    async fn expire_stop(&self, intent_id: &str, camera_id: &str, generation: i64, reason: &str) {
        let now = self.clock.now();
        match self
            .db
            .resolve_intent(intent_id, IntentStatus::Expired, "ack timeout", now)
            .await
        {
            Ok(true) => {
                warn!(camera_id, generation, intent_id, "STOP not acknowledged, force-releasing");
                let reason = format!("{reason} (ack timeout)");
                if let Err(e) = self.leases.release(camera_id, generation, &reason).await {
                    warn!(camera_id, error = %e, "Force release failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(intent_id, error = %e, "Failed to expire STOP intent"),
        }
    }

    /// Ask a worker to drain: stop everything and go to STOPPED.
    pub async fn drain(&self, worker_id: &str, reason: &str) -> Result<(), DatabaseError> {
        let Some(conn) = self.connections.get(worker_id).await else {
            info!(worker_id, reason, "Worker not connected, releasing its leases directly");
            self.release_all(worker_id, reason).await?;
            return Ok(());
        };

        let intent_id = uuid::Uuid::new_v4().to_string();
        self.db
            .record_intent(&intent_id, "", 0, worker_id, IntentKind::Drain, self.clock.now())
            .await?;

        let waiter = conn.register_pending(intent_id.clone()).await;
        let msg = ControlMessage::Drain(DrainIntent {
            intent_id: intent_id.clone(),
            reason: reason.to_string(),
        });
        if conn.send(msg).await.is_err() {
            warn!(worker_id, "Channel closed while sending DRAIN");
        }

        let this = self.clone();
        let worker_id = worker_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            if this.await_ack(waiter).await {
                return;
            }
            let now = this.clock.now();
            match this
                .db
                .resolve_intent(&intent_id, IntentStatus::Expired, "ack timeout", now)
                .await
            {
                Ok(true) => {
                    warn!(worker_id = %worker_id, "DRAIN not acknowledged, force-releasing leases");
                    let reason = format!("{reason} (ack timeout)");
                    if let Err(e) = this.release_all(&worker_id, &reason).await {
                        warn!(worker_id = %worker_id, error = %e, "Force release failed");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(intent_id = %intent_id, error = %e, "Failed to expire DRAIN intent"),
            }
        });
        Ok(())
    }

    /// Release every lease a worker holds. Returns how many were released.
    pub async fn release_all(&self, worker_id: &str, reason: &str) -> Result<usize, DatabaseError> {
        let mut released = 0;
        for lease in self.leases.leases_for_worker(worker_id).await? {
            if self
                .leases
                .release_held(&lease.camera_id, lease.generation, worker_id, reason)
                .await?
            {
                released += 1;
            }
        }
        Ok(released)
    }
}
