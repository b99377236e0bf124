//! Shared fixtures for session and admin tests.
//!
//! A `FakeWorker` talks to a real `run_session` task over in-memory
//! channels, so tests exercise the full message handling without sockets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vigil_core::ManualClock;
use vigil_core::config::ControlConfig;
use vigil_core::protocol::{
    Capability, ControlMessage, HeartbeatAck, LeaseRef, Register, StartIntent, WorkerMessage,
    WorkerMetrics, WorkerStatus,
};

use super::session::{SessionError, run_session};
use crate::ControlPlane;
use crate::storage::{ControlDatabase, Lease};

pub const T0: i64 = 1_700_000_000;

pub struct TestPlane {
    pub plane: ControlPlane,
    pub clock: ManualClock,
}

pub async fn test_plane() -> TestPlane {
    let db = ControlDatabase::open_in_memory().await.unwrap();
    let clock = ManualClock::new(T0);
    let config = ControlConfig {
        drain_ack_timeout_secs: 1,
        min_worker_version: "0.1.0".into(),
        ..ControlConfig::default()
    };
    TestPlane {
        plane: ControlPlane::new(db, Arc::new(clock.clone()), config),
        clock,
    }
}

pub async fn add_camera(plane: &ControlPlane, camera_id: &str) {
    plane
        .db
        .upsert_camera(camera_id, "t1", "s1", "rtsp", &format!("rtsp://{camera_id}"), T0)
        .await
        .unwrap();
}

pub async fn lease(plane: &ControlPlane, camera_id: &str) -> Lease {
    plane.leases.get(camera_id).await.unwrap().unwrap()
}

/// Poll `check` until it returns true or three seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

pub fn register_msg(worker_id: &str, capacity: u32, version: &str) -> WorkerMessage {
    WorkerMessage::Register(Register {
        worker_id: worker_id.into(),
        tenant_id: "t1".into(),
        site_id: "s1".into(),
        capacity,
        capability: Capability {
            version: version.into(),
            source_types: vec!["rtsp".into()],
        },
    })
}

pub struct FakeWorker {
    pub worker_id: String,
    pub tx: mpsc::Sender<WorkerMessage>,
    pub rx: mpsc::Receiver<ControlMessage>,
    pub session: JoinHandle<Result<(), SessionError>>,
    sequence: u64,
}

impl FakeWorker {
    /// Open a session without sending anything.
    pub fn open(plane: &ControlPlane, worker_id: &str) -> Self {
        let (worker_tx, session_rx) = mpsc::channel(64);
        let (session_tx, worker_rx) = mpsc::channel(64);
        let session = tokio::spawn(run_session(plane.clone(), session_rx, session_tx));
        Self {
            worker_id: worker_id.into(),
            tx: worker_tx,
            rx: worker_rx,
            session,
            sequence: 0,
        }
    }

    /// Open a session and complete REGISTER.
    pub async fn connect(plane: &ControlPlane, worker_id: &str, capacity: u32) -> Self {
        let mut worker = Self::open(plane, worker_id);
        worker.send(register_msg(worker_id, capacity, "0.1.0")).await;
        match worker.recv().await {
            ControlMessage::Registered(r) => assert_eq!(r.worker_id, worker_id),
            other => panic!("expected REGISTERED, got {other:?}"),
        }
        worker
    }

    pub async fn send(&self, msg: WorkerMessage) {
        self.tx.send(msg).await.unwrap();
    }

    pub async fn recv(&mut self) -> ControlMessage {
        tokio::time::timeout(Duration::from_secs(3), self.rx.recv())
            .await
            .expect("timed out waiting for control message")
            .expect("session closed")
    }

    pub async fn expect_start(&mut self) -> StartIntent {
        match self.recv().await {
            ControlMessage::Start(start) => start,
            other => panic!("expected START, got {other:?}"),
        }
    }

    /// Send a heartbeat and return its acknowledgement.
    pub async fn heartbeat(&mut self, status: WorkerStatus, renewals: Vec<LeaseRef>) -> HeartbeatAck {
        self.send(WorkerMessage::Heartbeat(vigil_core::protocol::Heartbeat {
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

    /// Send an event with the next sequence number.
    pub async fn event(
        &mut self,
        camera_id: &str,
        generation: i64,
        kind: vigil_core::protocol::EventKind,
        payload: serde_json::Value,
    ) {
        self.sequence += 1;
        let sequence = self.sequence;
        self.event_with_sequence(camera_id, generation, sequence, kind, payload)
            .await;
    }

    pub async fn event_with_sequence(
        &self,
        camera_id: &str,
        generation: i64,
        sequence: u64,
        kind: vigil_core::protocol::EventKind,
        payload: serde_json::Value,
    ) {
        self.send(WorkerMessage::Event(vigil_core::protocol::Event {
            camera_id: camera_id.into(),
            generation,
            sequence,
            kind,
            timestamp: T0,
            payload,
        }))
        .await;
    }

    /// Close the connection and wait for the session to finish.
    pub async fn disconnect(self) -> Result<(), SessionError> {
        drop(self.tx);
        drop(self.rx);
        self.session.await.unwrap()
    }
}
