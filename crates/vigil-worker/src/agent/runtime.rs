use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use vigil_core::db::unix_timestamp;
use vigil_core::protocol::{
    Ack, AckStatus, ControlMessage, Event, EventKind, LeaseRef, StartIntent, WorkerMessage,
    WorkerMetrics,
};

use super::{AgentChannels, AgentSettings, AgentSnapshot};
use crate::fsm::{Effect, Input, TransitionError, WorkerMachine, WorkerState};
use crate::pipeline::{Detection, Pipeline, PipelineHandle, PipelineSignal, TaggedSignal};
use crate::sink::{DetectionRecord, DetectionSink};

const CONTROL_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 256;
const SIGNAL_CAPACITY: usize = 256;

#[derive(Debug)]
enum Timer {
    Readiness(LeaseRef),
    Retry { lease: LeaseRef, attempt: u32 },
}

pub struct WorkerAgent<P: Pipeline, S: DetectionSink> {
    settings: AgentSettings,
    machine: WorkerMachine,
    pipeline: P,
    sink: Arc<S>,
    /// Current pipeline instance; signals from any other handle are stale.
    handle: Option<PipelineHandle>,
    /// The START being served, kept for pipeline retries.
    current_start: Option<StartIntent>,
    /// A retry is scheduled and the faulted instance is still around.
    awaiting_retry: bool,
    sequence: u64,
    started_at: Instant,
    metrics: WorkerMetrics,
    control_rx: mpsc::Receiver<ControlMessage>,
    outbound: mpsc::Sender<WorkerMessage>,
    snapshot: watch::Sender<AgentSnapshot>,
    signal_tx: mpsc::Sender<TaggedSignal>,
    signal_rx: mpsc::Receiver<TaggedSignal>,
    timer_tx: mpsc::Sender<Timer>,
    timer_rx: mpsc::Receiver<Timer>,
    readiness_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl<P: Pipeline, S: DetectionSink> WorkerAgent<P, S> {
    pub fn new(settings: AgentSettings, pipeline: P, sink: S) -> (Self, AgentChannels) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(AgentSnapshot::default());
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        let (timer_tx, timer_rx) = mpsc::channel(16);

        let machine = WorkerMachine::new(settings.max_consecutive_faults);
        let agent = Self {
            settings,
            machine,
            pipeline,
            sink: Arc::new(sink),
            handle: None,
            current_start: None,
            awaiting_retry: false,
            sequence: initial_sequence(),
            started_at: Instant::now(),
            metrics: WorkerMetrics::default(),
            control_rx,
            outbound: outbound_tx,
            snapshot: snapshot_tx,
            signal_tx,
            signal_rx,
            timer_tx,
            timer_rx,
            readiness_timer: None,
            retry_timer: None,
        };
        let channels = AgentChannels {
            control: control_tx,
            outbound: outbound_rx,
            snapshot: snapshot_rx,
        };
        (agent, channels)
    }

    /// Process control messages, pipeline signals and timers until the
    /// client goes away or `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.settings.identity.worker_id, "Worker agent started");
        loop {
            tokio::select! {
                msg = self.control_rx.recv() => {
                    let Some(msg) = msg else {
                        info!("Control client gone, stopping agent");
                        break;
                    };
                    self.on_control(msg).await;
                }
                Some(signal) = self.signal_rx.recv() => self.on_signal(signal).await,
                Some(timer) = self.timer_rx.recv() => self.on_timer(timer).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Worker agent shutting down");
                        break;
                    }
                }
            }
        }
        self.abort_timers();
        if let Some(handle) = self.handle.take() {
            self.stop_handle(handle).await;
        }
    }

    async fn on_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Registered(registered) => {
                if *self.machine.state() == WorkerState::Init {
                    let _ = self.apply(Input::Registered).await;
                    let _ = self.apply(Input::Idle).await;
                } else {
                    debug!(
                        state = self.machine.state().name(),
                        lease_ttl_secs = registered.lease_ttl_secs,
                        "Re-registered after reconnect"
                    );
                }
            }
            ControlMessage::Rejected { reason } => warn!(reason, "Registration rejected"),
            ControlMessage::HeartbeatAck(ack) => {
                for notice in ack.invalidated {
                    let camera_id = notice.camera_id.clone();
                    let stale = notice.stale_generation;
                    match self.apply(Input::Invalidated(notice)).await {
                        Ok(()) => warn!(camera_id, generation = stale, "Lease taken over, processing stopped"),
                        Err(e) => debug!(camera_id, error = %e, "Invalidation for unbound lease ignored"),
                    }
                }
            }
            ControlMessage::Start(intent) => {
                let (intent_id, lease) = (intent.intent_id.clone(), intent.lease());
                self.apply_intent(Input::Start(intent), intent_id, lease).await;
            }
            ControlMessage::Stop(stop) => {
                let (intent_id, lease) = (
                    stop.intent_id.clone(),
                    LeaseRef::new(stop.camera_id.clone(), stop.generation),
                );
                self.apply_intent(Input::Stop(stop), intent_id, lease).await;
            }
            ControlMessage::Drain(drain) => {
                let intent_id = drain.intent_id.clone();
                self.apply_intent(Input::Drain(drain), intent_id, LeaseRef::new(String::new(), 0))
                    .await;
            }
            ControlMessage::Clear => match self.apply(Input::Clear).await {
                Ok(()) => info!("Error state cleared"),
                Err(e) => debug!(error = %e, "Clear ignored"),
            },
        }
    }

    /// Apply an intent, answering REJECTED when the current state cannot
    /// take it.
    async fn apply_intent(&mut self, input: Input, intent_id: String, lease: LeaseRef) {
        if let Err(e) = self.apply(input).await {
            warn!(intent_id, camera_id = %lease.camera_id, error = %e, "Intent rejected");
            self.send(WorkerMessage::Ack(Ack {
                intent_id,
                camera_id: lease.camera_id,
                generation: lease.generation,
                status: AckStatus::Rejected,
                detail: e.to_string(),
            }));
        }
    }

    async fn on_signal(&mut self, tagged: TaggedSignal) {
        if self.handle.as_ref().map(|h| h.id.as_str()) != Some(tagged.handle_id.as_str()) {
            debug!(handle_id = %tagged.handle_id, "Signal from a stopped pipeline ignored");
            return;
        }
        let state = self.machine.state().clone();
        if matches!(state, WorkerState::Reconnecting { .. }) && self.awaiting_retry {
            debug!(signal = ?tagged.signal, "Signal from faulted pipeline ignored until retry");
            return;
        }

        match tagged.signal {
            PipelineSignal::Ready => match state {
                WorkerState::Starting { .. } => {
                    let _ = self.apply(Input::PipelineReady).await;
                }
                WorkerState::Reconnecting { .. } => {
                    let _ = self.apply(Input::Recovered).await;
                }
                _ => debug!(state = state.name(), "Ready signal ignored"),
            },
            PipelineSignal::Detection(detection) => {
                self.metrics.detections = self.metrics.detections.saturating_add(1);
                if let WorkerState::Running { lease } = state {
                    self.forward(&lease, detection);
                }
            }
            PipelineSignal::Stats { frames_processed } => {
                self.metrics.frames_processed =
                    self.metrics.frames_processed.saturating_add(frames_processed);
                self.publish();
            }
            PipelineSignal::TransientFault { detail } => match state {
                WorkerState::Running { .. } => {
                    let _ = self.apply(Input::TransientFault { detail }).await;
                }
                WorkerState::Reconnecting { attempt, .. } => self.retry_failed(attempt, detail).await,
                _ => debug!(state = state.name(), detail, "Transient fault ignored"),
            },
            PipelineSignal::UnrecoverableFault { detail } => {
                warn!(detail, "Unrecoverable pipeline fault");
                let _ = self.apply(Input::UnrecoverableFault { detail }).await;
            }
        }
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Readiness(lease) => {
                if let Err(e) = self.apply(Input::ReadinessTimeout(lease)).await {
                    debug!(error = %e, "Stale readiness timer");
                }
            }
            Timer::Retry { lease, attempt } => self.retry(lease, attempt).await,
        }
    }

    /// Replace the faulted instance with a fresh one for the same lease.
    #[instrument(skip(self), fields(camera_id = %lease.camera_id, generation = lease.generation))]
    async fn retry(&mut self, lease: LeaseRef, attempt: u32) {
        let current = matches!(
            self.machine.state(),
            WorkerState::Reconnecting { lease: l, attempt: a } if *l == lease && *a == attempt
        );
        let Some(intent) = self.current_start.clone().filter(|_| current) else {
            debug!("Retry no longer applies");
            return;
        };

        if let Some(handle) = self.handle.take() {
            self.stop_handle(handle).await;
        }
        self.awaiting_retry = false;
        info!("Restarting pipeline");
        match self
            .pipeline
            .start(&lease, &intent.source, &intent.params, self.signal_tx.clone())
            .await
        {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => self.retry_failed(attempt, e.to_string()).await,
        }
    }

    async fn retry_failed(&mut self, attempt: u32, detail: String) {
        let input = if self.settings.retry.should_retry(attempt.saturating_add(1)) {
            Input::RetryFailed { detail }
        } else {
            warn!(attempt, detail, "Pipeline retries exhausted");
            Input::RetriesExhausted { detail }
        };
        let _ = self.apply(input).await;
    }

    /// Apply `input` and every follow-up input its effects produce. Only a
    /// rejection of `input` itself is returned.
    async fn apply(&mut self, input: Input) -> Result<(), TransitionError> {
        let mut queue = VecDeque::from([input]);
        let mut first = true;
        while let Some(input) = queue.pop_front() {
            let name = input.name();
            let from = self.machine.state().name();
            match self.machine.apply(input) {
                Ok(effects) => {
                    debug!(from, input = name, to = self.machine.state().name(), "Transition");
                    for effect in effects {
                        if let Some(next) = self.execute(effect).await {
                            queue.push_back(next);
                        }
                    }
                }
                Err(e) if first => {
                    self.publish();
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "Follow-up input rejected"),
            }
            first = false;
        }
        self.publish();
        Ok(())
    }

    async fn execute(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::StartPipeline(intent) => {
                let lease = intent.lease();
                let started = self
                    .pipeline
                    .start(&lease, &intent.source, &intent.params, self.signal_tx.clone())
                    .await;
                self.current_start = Some(intent);
                match started {
                    Ok(handle) => {
                        info!(camera_id = %lease.camera_id, generation = lease.generation, "Pipeline starting");
                        self.handle = Some(handle);
                        None
                    }
                    Err(e) => {
                        warn!(camera_id = %lease.camera_id, error = %e, "Pipeline failed to start");
                        Some(Input::UnrecoverableFault {
                            detail: e.to_string(),
                        })
                    }
                }
            }
            Effect::StopPipeline => {
                abort(&mut self.retry_timer);
                self.awaiting_retry = false;
                if let Some(handle) = self.handle.take() {
                    self.stop_handle(handle).await;
                }
                None
            }
            Effect::ArmReadinessTimer(lease) => {
                let tx = self.timer_tx.clone();
                let after = self.settings.readiness_timeout;
                self.rearm(TimerSlot::Readiness, after, Timer::Readiness(lease), tx);
                None
            }
            Effect::CancelReadinessTimer => {
                abort(&mut self.readiness_timer);
                None
            }
            Effect::ScheduleRetry { lease, attempt } => {
                let after = self.settings.retry.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = after.as_millis(), "Pipeline retry scheduled");
                self.awaiting_retry = true;
                let tx = self.timer_tx.clone();
                self.rearm(TimerSlot::Retry, after, Timer::Retry { lease, attempt }, tx);
                None
            }
            Effect::Ack {
                intent_id,
                lease,
                status,
                detail,
            } => {
                self.send(WorkerMessage::Ack(Ack {
                    intent_id,
                    camera_id: lease.camera_id,
                    generation: lease.generation,
                    status,
                    detail,
                }));
                None
            }
            Effect::Emit {
                lease,
                kind,
                payload,
            } => {
                self.emit(lease, kind, payload);
                None
            }
            Effect::ReleaseLease { lease, reason } => {
                info!(camera_id = %lease.camera_id, generation = lease.generation, reason, "Releasing lease");
                self.emit(lease, EventKind::LeaseReleased, json!({ "detail": reason }));
                None
            }
            Effect::FinishDrain => Some(Input::Drained),
        }
    }

    fn rearm(&mut self, slot: TimerSlot, after: std::time::Duration, timer: Timer, tx: mpsc::Sender<Timer>) {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(timer).await;
        });
        let previous = match slot {
            TimerSlot::Readiness => self.readiness_timer.replace(task),
            TimerSlot::Retry => self.retry_timer.replace(task),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn abort_timers(&mut self) {
        abort(&mut self.readiness_timer);
        abort(&mut self.retry_timer);
    }

    async fn stop_handle(&self, handle: PipelineHandle) {
        let id = handle.id.clone();
        if let Err(e) = self.pipeline.stop(handle).await {
            warn!(handle_id = %id, error = %e, "Pipeline stop failed");
        }
    }

    fn emit(&mut self, lease: LeaseRef, kind: EventKind, payload: serde_json::Value) {
        self.sequence += 1;
        self.send(WorkerMessage::Event(Event {
            camera_id: lease.camera_id,
            generation: lease.generation,
            sequence: self.sequence,
            kind,
            timestamp: unix_timestamp(),
            payload,
        }));
    }

    fn forward(&self, lease: &LeaseRef, detection: Detection) {
        let identity = &self.settings.identity;
        let record = DetectionRecord {
            tenant_id: identity.tenant_id.clone(),
            site_id: identity.site_id.clone(),
            camera_id: lease.camera_id.clone(),
            generation: lease.generation,
            worker_id: identity.worker_id.clone(),
            timestamp: detection.timestamp,
            embedding_ref: detection.embedding_ref,
            bbox: detection.bbox,
            confidence: detection.confidence,
        };
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let camera_id = record.camera_id.clone();
            if let Err(e) = sink.deliver(record).await {
                warn!(camera_id, error = %e, "Detection delivery failed");
            }
        });
    }

    /// Queue a message for the control plane. While the channel is down the
    /// queue fills; overflow is dropped and recovered by redelivery and
    /// ACK timeouts on the control plane.
    fn send(&self, msg: WorkerMessage) {
        if let Err(e) = self.outbound.try_send(msg) {
            warn!(error = %e, "Dropping outbound message");
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        let mut metrics = self.metrics.clone();
        metrics.uptime_secs = self.started_at.elapsed().as_secs();
        self.snapshot.send_replace(AgentSnapshot {
            status: state.status(),
            state: state.name(),
            renewals: state.lease().cloned().into_iter().collect(),
            metrics,
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerSlot {
    Readiness,
    Retry,
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.take() {
        task.abort();
    }
}

/// Event sequences start from wall-clock milliseconds so a restarted worker
/// never reuses numbers the control plane has already accepted.
fn initial_sequence() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(0))
}
