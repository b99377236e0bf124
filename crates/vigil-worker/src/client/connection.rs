//! Control channel connection with automatic reconnection.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, sleep};
use tracing::{debug, error, info, warn};

use vigil_core::protocol::{ControlMessage, Heartbeat, Registered, WorkerMessage, WorkerStatus, bridge};

use super::config::ClientConfig;
use super::error::ClientError;
use crate::agent::{AgentChannels, AgentSnapshot};

const CHANNEL_CAPACITY: usize = 256;

/// A connection that stayed up this long resets the reconnect backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

/// Keeps a worker registered with the control plane and relays traffic
/// between the wire and the worker agent.
pub struct ControlClient {
    config: ClientConfig,
    control: mpsc::Sender<ControlMessage>,
    outbound: mpsc::Receiver<WorkerMessage>,
    snapshot: watch::Receiver<AgentSnapshot>,
}

impl ControlClient {
    pub fn new(config: ClientConfig, channels: AgentChannels) -> Self {
        Self {
            config,
            control: channels.control,
            outbound: channels.outbound,
            snapshot: channels.snapshot,
        }
    }

    /// Run until shutdown, the worker stops, or registration is refused.
    ///
    /// Lost connections are retried with the configured backoff. Messages the
    /// agent produces meanwhile stay queued and go out after re-registering.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Control client shutting down");
                return Ok(());
            }

            let started = Instant::now();
            match self.connect_and_run(&mut shutdown).await {
                Ok(()) => {
                    info!("Control channel closed cleanly");
                    return Ok(());
                }
                Err(e @ (ClientError::Rejected(_) | ClientError::AgentGone)) => {
                    error!(error = %e, "Control client giving up");
                    return Err(e);
                }
                Err(e) => {
                    if started.elapsed() > STABLE_CONNECTION {
                        attempt = 0;
                    }

                    if !self.config.reconnect.should_retry(attempt) {
                        error!(error = %e, attempt, "Max reconnect attempts reached");
                        return Err(e);
                    }

                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");

                    tokio::select! {
                        () = sleep(delay) => {}
                        _ = shutdown.changed() => {
                            info!("Control client shutting down during reconnect wait");
                            return Ok(());
                        }
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn connect_and_run(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
        let addr = self.config.control_addr.clone();
        let stream = tokio::time::timeout(self.config.register_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Connection(format!("Timed out connecting to {addr}")))?
            .map_err(|e| ClientError::Connection(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let (mut inbound, tx, tasks) =
            bridge::<ControlMessage, WorkerMessage, _>(stream, CHANNEL_CAPACITY).into_parts();

        let result = async {
            let registered = self.register(&mut inbound, &tx).await?;
            info!(
                worker_id = %registered.worker_id,
                heartbeat_interval_secs = registered.heartbeat_interval_secs,
                "Registered with control plane"
            );
            let interval = Duration::from_secs(registered.heartbeat_interval_secs.max(1));
            self.control
                .send(ControlMessage::Registered(registered))
                .await
                .map_err(|_| ClientError::AgentGone)?;
            self.serve(&mut inbound, &tx, interval, shutdown).await
        }
        .await;

        drop(tx);
        tasks.shutdown().await;
        result
    }

    async fn register(
        &self,
        inbound: &mut mpsc::Receiver<ControlMessage>,
        tx: &mpsc::Sender<WorkerMessage>,
    ) -> Result<Registered, ClientError> {
        send(tx, WorkerMessage::Register(self.config.registration.clone())).await?;

        let reply = tokio::time::timeout(self.config.register_timeout, inbound.recv())
            .await
            .map_err(|_| ClientError::Protocol("No reply to REGISTER".into()))?;
        match reply {
            Some(ControlMessage::Registered(registered)) => Ok(registered),
            Some(ControlMessage::Rejected { reason }) => Err(ClientError::Rejected(reason)),
            Some(other) => Err(ClientError::Protocol(format!(
                "Expected REGISTERED, got {other:?}"
            ))),
            None => Err(ClientError::Connection(
                "Connection closed during registration".into(),
            )),
        }
    }

    async fn serve(
        &mut self,
        inbound: &mut mpsc::Receiver<ControlMessage>,
        tx: &mpsc::Sender<WorkerMessage>,
        interval: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        let mut heartbeat = tokio::time::interval(interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        return Err(ClientError::Connection("Control plane closed the channel".into()));
                    };
                    if let ControlMessage::Rejected { reason } = msg {
                        return Err(ClientError::Rejected(reason));
                    }
                    self.control.send(msg).await.map_err(|_| ClientError::AgentGone)?;
                }
                msg = self.outbound.recv() => {
                    let Some(msg) = msg else {
                        return Err(ClientError::AgentGone);
                    };
                    send(tx, msg).await?;
                }
                _ = heartbeat.tick() => {
                    let beat = self.heartbeat();
                    debug!(status = %beat.status, renewals = beat.renewals.len(), "Heartbeat");
                    send(tx, WorkerMessage::Heartbeat(beat)).await?;
                }
                changed = self.snapshot.changed() => {
                    if changed.is_err() {
                        return Err(ClientError::AgentGone);
                    }
                    if self.snapshot.borrow().status == WorkerStatus::Stopped {
                        info!("Worker stopped, deregistering");
                        return self.deregister(tx).await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("Deregistering before shutdown");
                    return self.deregister(tx).await;
                }
            }
        }
    }

    fn heartbeat(&self) -> Heartbeat {
        let snapshot = self.snapshot.borrow();
        Heartbeat {
            worker_id: self.config.registration.worker_id.clone(),
            status: snapshot.status,
            metrics: snapshot.metrics.clone(),
            renewals: snapshot.renewals.clone(),
        }
    }

    /// Flush whatever the agent already queued, then say goodbye.
    async fn deregister(&mut self, tx: &mpsc::Sender<WorkerMessage>) -> Result<(), ClientError> {
        while let Ok(msg) = self.outbound.try_recv() {
            send(tx, msg).await?;
        }
        send(tx, WorkerMessage::Heartbeat(self.heartbeat())).await?;
        send(
            tx,
            WorkerMessage::Deregister {
                worker_id: self.config.registration.worker_id.clone(),
            },
        )
        .await
    }
}

async fn send(tx: &mpsc::Sender<WorkerMessage>, msg: WorkerMessage) -> Result<(), ClientError> {
    tx.send(msg)
        .await
        .map_err(|_| ClientError::Connection("Control channel writer closed".into()))
}
