//! End-to-end lease scenarios over real TCP worker channels.
//!
//! The control plane runs on an ephemeral port with a manual clock, so lease
//! expiry and reclaim are driven by advancing time and sweeping explicitly.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use vigil_control::ControlPlane;
use vigil_control::assignment::SiteScope;
use vigil_control::reclaim::ReclaimScheduler;
use vigil_control::server::serve_workers;
use vigil_control::storage::ControlDatabase;
use vigil_core::ManualClock;
use vigil_core::config::{ControlConfig, ReclaimConfig};
use vigil_core::protocol::transport::ChannelTasks;
use vigil_core::protocol::{
    Ack, AckStatus, Capability, ControlMessage, Event, EventKind, Heartbeat, HeartbeatAck,
    LeaseRef, LeaseState, Register, StartIntent, WorkerMessage, WorkerMetrics, WorkerStatus,
    bridge,
};

const T0: i64 = 1_700_000_000;

struct Harness {
    plane: ControlPlane,
    clock: ManualClock,
    scheduler: ReclaimScheduler,
    addr: String,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start() -> Self {
        let db = ControlDatabase::open_in_memory().await.unwrap();
        let clock = ManualClock::new(T0);
        let config = ControlConfig {
            drain_ack_timeout_secs: 1,
            min_worker_version: "0.1.0".into(),
            ..ControlConfig::default()
        };
        let plane = ControlPlane::new(db, Arc::new(clock.clone()), config);
        let scheduler = plane.reclaim_scheduler(ReclaimConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve_workers(listener, plane.clone(), shutdown_rx));

        Self {
            plane,
            clock,
            scheduler,
            addr,
            shutdown,
        }
    }

    async fn add_camera(&self, camera_id: &str) {
        self.plane
            .db
            .upsert_camera(camera_id, "t1", "s1", "rtsp", &format!("rtsp://{camera_id}"), T0)
            .await
            .unwrap();
    }

    async fn lease_state(&self, camera_id: &str) -> (LeaseState, Option<String>, i64) {
        let lease = self.plane.leases.get(camera_id).await.unwrap().unwrap();
        (lease.state(), lease.worker_id.clone(), lease.generation)
    }

    async fn worker_status(&self, worker_id: &str) -> WorkerStatus {
        self.plane.workers.get(worker_id).await.unwrap().unwrap().status()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct TcpWorker {
    worker_id: String,
    tx: mpsc::Sender<WorkerMessage>,
    rx: mpsc::Receiver<ControlMessage>,
    tasks: ChannelTasks,
    sequence: u64,
}

impl TcpWorker {
    async fn connect(addr: &str, worker_id: &str, capacity: u32) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rx, tx, tasks) = bridge::<ControlMessage, WorkerMessage, _>(stream, 32).into_parts();
        let mut worker = Self {
            worker_id: worker_id.into(),
            tx,
            rx,
            tasks,
            sequence: 0,
        };
        worker
            .send(WorkerMessage::Register(Register {
                worker_id: worker_id.into(),
                tenant_id: "t1".into(),
                site_id: "s1".into(),
                capacity,
                capability: Capability {
                    version: "0.1.0".into(),
                    source_types: vec!["rtsp".into()],
                },
            }))
            .await;
        match worker.recv().await {
            ControlMessage::Registered(r) => assert_eq!(r.worker_id, worker_id),
            other => panic!("expected REGISTERED, got {other:?}"),
        }
        worker
    }

    async fn send(&self, msg: WorkerMessage) {
        self.tx.send(msg).await.unwrap();
    }

    async fn recv(&mut self) -> ControlMessage {
        tokio::time::timeout(Duration::from_secs(3), self.rx.recv())
            .await
            .expect("timed out waiting for control message")
            .expect("connection closed")
    }

    async fn expect_start(&mut self) -> StartIntent {
        match self.recv().await {
            ControlMessage::Start(start) => start,
            other => panic!("expected START, got {other:?}"),
        }
    }

    async fn heartbeat(&mut self, status: WorkerStatus, renewals: Vec<LeaseRef>) -> HeartbeatAck {
        self.send(WorkerMessage::Heartbeat(Heartbeat {
            worker_id: self.worker_id.clone(),
            status,
            metrics: WorkerMetrics::default(),
            renewals,
        }))
        .await;
        match self.recv().await {
            ControlMessage::HeartbeatAck(ack) => ack,
            other => panic!("expected HEARTBEAT_ACK, got {other:?}"),
        }
    }

    async fn ready(&mut self, start: &StartIntent) {
        self.sequence += 1;
        self.send(WorkerMessage::Event(Event {
            camera_id: start.camera_id.clone(),
            generation: start.generation,
            sequence: self.sequence,
            kind: EventKind::PipelineReady,
            timestamp: T0,
            payload: serde_json::json!({ "detail": "first frame decoded" }),
        }))
        .await;
    }

    async fn close(self) {
        drop(self.tx);
        drop(self.rx);
        self.tasks.shutdown().await;
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn healthy_worker_takes_and_runs_camera() {
    let h = Harness::start().await;
    h.add_camera("cam-1").await;

    let mut worker = TcpWorker::connect(&h.addr, "w1", 2).await;
    let start = worker.expect_start().await;
    assert_eq!(start.camera_id, "cam-1");
    assert_eq!(start.generation, 1);
    assert_eq!(start.source.uri, "rtsp://cam-1");

    worker.ready(&start).await;
    eventually(|| async { h.worker_status("w1").await == WorkerStatus::Running }).await;

    let ack = worker
        .heartbeat(WorkerStatus::Running, vec![start.lease()])
        .await;
    assert_eq!(ack.renewed, vec![start.lease()]);
    assert!(ack.invalidated.is_empty());

    let (state, owner, generation) = h.lease_state("cam-1").await;
    assert_eq!(state, LeaseState::Active);
    assert_eq!(owner.as_deref(), Some("w1"));
    assert_eq!(generation, 1);
    assert_eq!(h.plane.leases.load_of("w1").await.unwrap(), 1);

    worker.close().await;
}

#[tokio::test]
async fn silent_worker_is_reclaimed_and_camera_moves() {
    let h = Harness::start().await;
    h.add_camera("cam-1").await;

    let mut w1 = TcpWorker::connect(&h.addr, "w1", 1).await;
    let start = w1.expect_start().await;
    w1.ready(&start).await;
    eventually(|| async { h.worker_status("w1").await == WorkerStatus::Running }).await;

    // w1 drops off the network.
    w1.close().await;
    eventually(|| async { h.worker_status("w1").await == WorkerStatus::Reconnecting }).await;

    // Lease TTL passes: soft reclaim keeps w1 as owner inside the grace window.
    h.clock.advance(Duration::from_secs(91));
    let report = h.scheduler.sweep().await.unwrap();
    assert_eq!(report.orphaned, 1);
    let (state, owner, _) = h.lease_state("cam-1").await;
    assert_eq!(state, LeaseState::Orphaned);
    assert_eq!(owner.as_deref(), Some("w1"));

    // Grace passes: hard reclaim frees the camera.
    h.clock.advance(Duration::from_secs(91));
    let report = h.scheduler.sweep().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    let (_, owner, _) = h.lease_state("cam-1").await;
    assert_eq!(owner, None);

    let mut w2 = TcpWorker::connect(&h.addr, "w2", 1).await;
    let moved = w2.expect_start().await;
    assert_eq!(moved.camera_id, "cam-1");
    assert_eq!(moved.generation, 2);

    // w1 comes back and tries to renew its old epoch.
    let mut w1 = TcpWorker::connect(&h.addr, "w1", 1).await;
    let ack = w1.heartbeat(WorkerStatus::Running, vec![start.lease()]).await;
    assert!(ack.renewed.is_empty());
    assert_eq!(ack.invalidated.len(), 1);
    assert_eq!(ack.invalidated[0].stale_generation, 1);
    assert_eq!(ack.invalidated[0].current_generation, 2);

    let (state, owner, generation) = h.lease_state("cam-1").await;
    assert_eq!(state, LeaseState::Active);
    assert_eq!(owner.as_deref(), Some("w2"));
    assert_eq!(generation, 2);

    w1.close().await;
    w2.close().await;
}

#[tokio::test]
async fn steady_heartbeats_keep_lease_active_across_sweeps() {
    let h = Harness::start().await;
    h.add_camera("cam-1").await;

    let mut worker = TcpWorker::connect(&h.addr, "w1", 1).await;
    let start = worker.expect_start().await;
    worker.ready(&start).await;

    for _ in 0..10 {
        h.clock.advance(Duration::from_secs(10));
        let ack = worker
            .heartbeat(WorkerStatus::Running, vec![start.lease()])
            .await;
        assert_eq!(ack.renewed.len(), 1);
        let report = h.scheduler.sweep().await.unwrap();
        assert_eq!(report.orphaned, 0);
        assert_eq!(report.reclaimed, 0);
    }

    let (state, owner, generation) = h.lease_state("cam-1").await;
    assert_eq!(state, LeaseState::Active);
    assert_eq!(owner.as_deref(), Some("w1"));
    assert_eq!(generation, 1);

    worker.close().await;
}

#[tokio::test]
async fn racing_assignments_produce_a_single_owner() {
    let h = Harness::start().await;
    h.add_camera("cam-1").await;

    for id in ["w1", "w2", "w3", "w4"] {
        h.plane
            .workers
            .register(&Register {
                worker_id: id.into(),
                tenant_id: "t1".into(),
                site_id: "s1".into(),
                capacity: 1,
                capability: Capability {
                    version: "0.1.0".into(),
                    source_types: vec!["rtsp".into()],
                },
            })
            .await
            .unwrap();
    }

    let scope = SiteScope::new("t1", "s1");
    let attempts = ["w1", "w2", "w3", "w4"].map(|id| {
        let assignment = h.plane.assignment.clone();
        let scope = scope.clone();
        tokio::spawn(async move { assignment.assign(id, &scope).await })
    });

    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let (state, owner, generation) = h.lease_state("cam-1").await;
    assert_eq!(state, LeaseState::Active);
    assert!(owner.is_some());
    assert_eq!(generation, 1);
}

#[tokio::test]
async fn renewal_of_reclaimed_epoch_never_resurrects_it() {
    let h = Harness::start().await;
    h.add_camera("cam-1").await;

    let mut w1 = TcpWorker::connect(&h.addr, "w1", 1).await;
    let start = w1.expect_start().await;

    h.clock.advance(Duration::from_secs(91));
    h.scheduler.sweep().await.unwrap();
    h.clock.advance(Duration::from_secs(91));
    let report = h.scheduler.sweep().await.unwrap();
    assert_eq!(report.reclaimed, 1);

    let renewed = h
        .plane
        .leases
        .renew("cam-1", start.generation, "w1")
        .await
        .unwrap();
    assert!(!renewed);
    let (_, owner, _) = h.lease_state("cam-1").await;
    assert_eq!(owner, None);

    w1.close().await;
}

#[tokio::test]
async fn acknowledged_stop_frees_camera_for_immediate_reassignment() {
    let h = Harness::start().await;
    h.add_camera("cam-1").await;

    let mut worker = TcpWorker::connect(&h.addr, "w1", 1).await;
    let start = worker.expect_start().await;
    worker.ready(&start).await;

    h.plane
        .dispatcher
        .stop("w1", "cam-1", start.generation, "operator stop")
        .await
        .unwrap();
    let stop = match worker.recv().await {
        ControlMessage::Stop(stop) => stop,
        other => panic!("expected STOP, got {other:?}"),
    };
    assert_eq!(stop.generation, 1);

    worker
        .send(WorkerMessage::Ack(Ack {
            intent_id: stop.intent_id.clone(),
            camera_id: stop.camera_id.clone(),
            generation: stop.generation,
            status: AckStatus::Ok,
            detail: String::new(),
        }))
        .await;

    // The freed camera is handed straight back out under a new epoch.
    let restart = worker.expect_start().await;
    assert_eq!(restart.camera_id, "cam-1");
    assert_eq!(restart.generation, 2);
    assert_ne!(restart.intent_id, start.intent_id);

    worker.close().await;
}
