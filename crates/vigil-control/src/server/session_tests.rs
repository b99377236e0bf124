use serde_json::json;

use vigil_core::Clock;
use vigil_core::protocol::{
    Ack, AckStatus, ControlMessage, EventKind, LeaseRef, LeaseState, WorkerMessage, WorkerStatus,
};

use super::admin::AdminService;
use super::session::SessionError;
use super::test_helpers::{FakeWorker, add_camera, eventually, lease, register_msg, test_plane};

fn ack(intent_id: &str, camera_id: &str, generation: i64, status: AckStatus) -> WorkerMessage {
    WorkerMessage::Ack(Ack {
        intent_id: intent_id.into(),
        camera_id: camera_id.into(),
        generation,
        status,
        detail: String::new(),
    })
}

// === Registration ===

#[tokio::test]
async fn register_assigns_available_camera() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;

    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    let start = w1.expect_start().await;
    assert_eq!(start.camera_id, "cam-1");
    assert_eq!(start.generation, 1);
    assert_eq!(start.source.uri, "rtsp://cam-1");
    assert_eq!(start.params.model_version, "face-embed-v1");

    let lease = lease(&t.plane, "cam-1").await;
    assert_eq!(lease.worker_id.as_deref(), Some("w1"));
    assert_eq!(lease.state(), LeaseState::Active);
}

#[tokio::test]
async fn old_worker_version_is_rejected() {
    let t = test_plane().await;
    let mut w1 = FakeWorker::open(&t.plane, "w1");
    w1.send(register_msg("w1", 1, "0.0.9")).await;

    match w1.recv().await {
        ControlMessage::Rejected { reason } => assert!(reason.contains("0.0.9")),
        other => panic!("expected REJECTED, got {other:?}"),
    }
    assert!(matches!(w1.session.await.unwrap(), Err(SessionError::Rejected(_))));
}

#[tokio::test]
async fn first_frame_must_be_register() {
    let t = test_plane().await;
    let mut w1 = FakeWorker::open(&t.plane, "w1");
    w1.send(WorkerMessage::Deregister { worker_id: "w1".into() }).await;

    assert!(matches!(w1.recv().await, ControlMessage::Rejected { .. }));
}

// === Heartbeats ===

#[tokio::test]
async fn heartbeat_renews_current_and_invalidates_stale() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    t.clock.advance(std::time::Duration::from_secs(10));
    let ack = w1
        .heartbeat(
            WorkerStatus::Running,
            vec![LeaseRef::new("cam-1", 1), LeaseRef::new("cam-1", 0)],
        )
        .await;

    assert_eq!(ack.renewed, vec![LeaseRef::new("cam-1", 1)]);
    assert_eq!(ack.invalidated.len(), 1);
    assert_eq!(ack.invalidated[0].stale_generation, 0);
    assert_eq!(ack.invalidated[0].current_generation, 1);
    assert_eq!(lease(&t.plane, "cam-1").await.expires_at, t.clock.now() + 90);
}

#[tokio::test]
async fn heartbeat_refreshes_worker_status() {
    let t = test_plane().await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.heartbeat(WorkerStatus::Idle, Vec::new()).await;

    let worker = t.plane.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status(), WorkerStatus::Idle);
}

// === Acknowledgements ===

#[tokio::test]
async fn failed_start_releases_lease() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    let start = w1.expect_start().await;

    w1.send(ack(&start.intent_id, "cam-1", 1, AckStatus::Failed)).await;

    let plane = t.plane.clone();
    eventually(|| {
        let plane = plane.clone();
        async move { lease(&plane, "cam-1").await.state() == LeaseState::Terminated }
    })
    .await;
    let intent = t.plane.db.get_intent(&start.intent_id).await.unwrap().unwrap();
    assert_eq!(intent.status, "failed");
}

#[tokio::test]
async fn stop_ack_releases_and_reassigns() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    let start = w1.expect_start().await;
    w1.send(ack(&start.intent_id, "cam-1", 1, AckStatus::Ok)).await;

    t.plane.dispatcher.stop("w1", "cam-1", 1, "rebalance").await.unwrap();
    let stop = match w1.recv().await {
        ControlMessage::Stop(stop) => stop,
        other => panic!("expected STOP, got {other:?}"),
    };
    assert_eq!(stop.generation, 1);
    w1.send(ack(&stop.intent_id, "cam-1", 1, AckStatus::Ok)).await;

    // Released, then immediately assignable again at the next generation
    let restart = w1.expect_start().await;
    assert_eq!(restart.camera_id, "cam-1");
    assert_eq!(restart.generation, 2);
}

#[tokio::test]
async fn unacknowledged_stop_is_force_released() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    t.plane.dispatcher.stop("w1", "cam-1", 1, "rebalance").await.unwrap();
    assert!(matches!(w1.recv().await, ControlMessage::Stop(_)));

    let plane = t.plane.clone();
    eventually(|| {
        let plane = plane.clone();
        async move { lease(&plane, "cam-1").await.state() == LeaseState::Terminated }
    })
    .await;
    assert!(lease(&t.plane, "cam-1").await.reason.contains("ack timeout"));
}

// === Events ===

#[tokio::test]
async fn events_apply_in_sequence_order() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    w1.event_with_sequence("cam-1", 1, 2, EventKind::PipelineReady, json!({}))
        .await;
    // Older sequence number arrives late and must be ignored
    w1.event_with_sequence("cam-1", 1, 1, EventKind::Reconnecting, json!({"detail": "rtsp timeout"}))
        .await;
    w1.heartbeat(WorkerStatus::Running, vec![LeaseRef::new("cam-1", 1)])
        .await;

    let lease = lease(&t.plane, "cam-1").await;
    assert_eq!(lease.reason, "pipeline ready");
    assert_eq!(lease.last_event_seq, 2);
}

#[tokio::test]
async fn stale_generation_event_is_dropped_and_invalidated() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    // cam-1 moves on to generation 2 under another worker
    assert!(t.plane.leases.release("cam-1", 1, "test").await.unwrap());
    assert_eq!(
        t.plane.leases.try_acquire("cam-1", "w2", 1, 1).await.unwrap(),
        Some(2)
    );

    w1.event("cam-1", 1, EventKind::PipelineReady, json!({})).await;
    match w1.recv().await {
        ControlMessage::HeartbeatAck(ack) => {
            assert!(ack.renewed.is_empty());
            assert_eq!(ack.invalidated[0].stale_generation, 1);
            assert_eq!(ack.invalidated[0].current_generation, 2);
        }
        other => panic!("expected invalidation, got {other:?}"),
    }

    let lease = lease(&t.plane, "cam-1").await;
    assert_eq!(lease.reason, "acquired");
    assert_eq!(lease.last_event_seq, 0);
    assert_eq!(lease.worker_id.as_deref(), Some("w2"));
}

#[tokio::test]
async fn fatal_pipeline_error_marks_worker_errored() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    w1.event(
        "cam-1",
        1,
        EventKind::PipelineError,
        json!({"detail": "decoder crashed", "fatal": true}),
    )
    .await;

    let plane = t.plane.clone();
    eventually(|| {
        let plane = plane.clone();
        async move {
            plane
                .workers
                .get("w1")
                .await
                .unwrap()
                .is_some_and(|w| w.status() == WorkerStatus::Error)
        }
    })
    .await;
    let lease = lease(&t.plane, "cam-1").await;
    assert_eq!(lease.state(), LeaseState::Terminated);
    assert_eq!(lease.reason, "pipeline error: decoder crashed");
}

#[tokio::test]
async fn errored_worker_gets_no_work_after_reregistering() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;
    w1.event(
        "cam-1",
        1,
        EventKind::PipelineError,
        json!({"detail": "gpu lost", "fatal": true}),
    )
    .await;
    let plane = t.plane.clone();
    eventually(|| {
        let plane = plane.clone();
        async move {
            plane
                .workers
                .get("w1")
                .await
                .unwrap()
                .is_some_and(|w| w.status() == WorkerStatus::Error)
        }
    })
    .await;
    w1.disconnect().await.unwrap();

    add_camera(&t.plane, "cam-2").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    // Each ack must come straight back: a START in between fails the helper.
    w1.heartbeat(WorkerStatus::Idle, Vec::new()).await;
    w1.heartbeat(WorkerStatus::Running, Vec::new()).await;

    let worker = t.plane.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status(), WorkerStatus::Error);
    assert_eq!(worker.reason.as_deref(), Some("pipeline error: gpu lost"));
    assert_eq!(t.plane.leases.load_of("w1").await.unwrap(), 0);
    assert!(lease(&t.plane, "cam-2").await.worker_id.is_none());

    AdminService::new(t.plane.clone())
        .clear_worker("w1")
        .await
        .unwrap();
    assert!(matches!(w1.recv().await, ControlMessage::Clear));
    w1.heartbeat(WorkerStatus::Idle, Vec::new()).await;
    let start = w1.expect_start().await;
    assert!(start.camera_id == "cam-1" || start.camera_id == "cam-2");
}

#[tokio::test]
async fn release_from_non_owner_leaves_lease_alone() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    let start = w1.expect_start().await;
    w1.send(ack(&start.intent_id, "cam-1", 1, AckStatus::Ok)).await;
    w1.event("cam-1", 1, EventKind::PipelineReady, json!({})).await;
    w1.heartbeat(WorkerStatus::Running, Vec::new()).await;
    let before = lease(&t.plane, "cam-1").await;
    assert_eq!(before.last_event_seq, 1);

    let mut w2 = FakeWorker::connect(&t.plane, "w2", 1).await;
    w2.event_with_sequence(
        "cam-1",
        1,
        5,
        EventKind::LeaseReleased,
        json!({"detail": "not mine"}),
    )
    .await;
    w2.event_with_sequence(
        "cam-1",
        1,
        6,
        EventKind::PipelineError,
        json!({"detail": "not mine either"}),
    )
    .await;
    w2.send(ack(&start.intent_id, "cam-1", 1, AckStatus::Failed)).await;

    // The PipelineError is answered with an invalidation; drain it before
    // the heartbeat so the ack is next in line.
    match w2.recv().await {
        ControlMessage::HeartbeatAck(ack) => {
            assert!(ack.renewed.is_empty());
            assert_eq!(ack.invalidated[0].camera_id, "cam-1");
        }
        other => panic!("expected invalidation, got {other:?}"),
    }
    w2.heartbeat(WorkerStatus::Idle, Vec::new()).await;

    let after = lease(&t.plane, "cam-1").await;
    assert_eq!(after.state(), LeaseState::Active);
    assert_eq!(after.worker_id.as_deref(), Some("w1"));
    assert_eq!(after.generation, 1);
    assert_eq!(after.last_event_seq, 1);
    assert_eq!(t.plane.leases.load_of("w1").await.unwrap(), 1);
}

// === Connection lifecycle ===

#[tokio::test]
async fn reconnect_redelivers_unacked_start() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    let start = w1.expect_start().await;
    w1.disconnect().await.unwrap();

    let worker = t.plane.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status(), WorkerStatus::Reconnecting);

    let mut again = FakeWorker::connect(&t.plane, "w1", 1).await;
    let redelivered = again.expect_start().await;
    assert_eq!(redelivered.intent_id, start.intent_id);
    assert_eq!(redelivered.generation, 1);
}

#[tokio::test]
async fn deregister_releases_and_stops_worker() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    w1.send(WorkerMessage::Deregister { worker_id: "w1".into() }).await;
    w1.session.await.unwrap().unwrap();

    let worker = t.plane.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status(), WorkerStatus::Stopped);
    assert_eq!(lease(&t.plane, "cam-1").await.state(), LeaseState::Terminated);
    assert!(!t.plane.connections.is_connected("w1").await);
}
