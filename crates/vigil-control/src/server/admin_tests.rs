use tokio::net::TcpListener;
use tokio::sync::watch;

use vigil_core::protocol::{
    Ack, AckStatus, AdminRequest, AdminResponse, CameraSpec, ControlMessage, Heartbeat,
    LeaseState, SourceDescriptor, WorkerMessage, WorkerMetrics, WorkerStatus,
};

use super::admin::{AdminError, AdminService, send_admin_request, serve_admin};
use super::test_helpers::{FakeWorker, add_camera, eventually, lease, test_plane};

fn spec(camera_id: &str) -> CameraSpec {
    CameraSpec {
        camera_id: camera_id.into(),
        tenant_id: "t1".into(),
        site_id: "s1".into(),
        source: SourceDescriptor {
            kind: "rtsp".into(),
            uri: format!("rtsp://{camera_id}"),
        },
    }
}

#[tokio::test]
async fn lease_state_and_listing() {
    let t = test_plane().await;
    let admin = AdminService::new(t.plane.clone());
    assert_eq!(
        admin.handle(AdminRequest::UpsertCamera(spec("cam-1"))).await,
        AdminResponse::Ok
    );

    let view = admin.lease_state("cam-1").await.unwrap().unwrap();
    assert_eq!(view.state, LeaseState::Pending);
    assert_eq!(view.generation, 0);
    assert!(admin.lease_state("nope").await.unwrap().is_none());

    assert_eq!(admin.list_leases(Some("s1")).await.unwrap().len(), 1);
    assert!(admin.list_leases(Some("s2")).await.unwrap().is_empty());
}

#[tokio::test]
async fn force_release_stops_connected_owner() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let admin = AdminService::new(t.plane.clone());
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    assert!(admin.force_release("cam-1", "operator").await.unwrap());
    let released = lease(&t.plane, "cam-1").await;
    assert_eq!(released.state(), LeaseState::Terminated);
    assert_eq!(released.reason, "operator");

    match w1.recv().await {
        ControlMessage::Stop(stop) => {
            assert_eq!(stop.camera_id, "cam-1");
            assert_eq!(stop.generation, 1);
            assert_eq!(stop.reason, "operator");
        }
        other => panic!("expected STOP, got {other:?}"),
    }

    // Nothing left to release
    assert!(!admin.force_release("cam-1", "operator").await.unwrap());
    assert!(matches!(
        admin.force_release("missing", "operator").await,
        Err(AdminError::NotFound(_))
    ));
}

#[tokio::test]
async fn paused_camera_is_not_assigned_until_resumed() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let admin = AdminService::new(t.plane.clone());
    admin.pause_camera("cam-1", "maintenance").await.unwrap();

    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    let ack = w1.heartbeat(WorkerStatus::Idle, Vec::new()).await;
    assert!(ack.renewed.is_empty());
    assert_eq!(lease(&t.plane, "cam-1").await.state(), LeaseState::Paused);
    assert_eq!(t.plane.leases.load_of("w1").await.unwrap(), 0);

    admin.resume_camera("cam-1").await.unwrap();
    assert!(matches!(
        admin.resume_camera("cam-1").await,
        Err(AdminError::Conflict(_))
    ));
    // The fill after the previous ack may already have picked the camera
    // up, so the START can land on either side of this heartbeat's ack.
    w1.send(WorkerMessage::Heartbeat(Heartbeat {
        worker_id: "w1".into(),
        status: WorkerStatus::Idle,
        metrics: WorkerMetrics::default(),
        renewals: Vec::new(),
    }))
    .await;
    let (mut starts, mut acks) = (Vec::new(), 0);
    for _ in 0..2 {
        match w1.recv().await {
            ControlMessage::Start(start) => starts.push(start.camera_id),
            ControlMessage::HeartbeatAck(_) => acks += 1,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(starts, vec!["cam-1".to_string()]);
    assert_eq!(acks, 1);
    assert_eq!(lease(&t.plane, "cam-1").await.worker_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn disabling_held_camera_stops_owner() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let admin = AdminService::new(t.plane.clone());
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    admin.disable_camera("cam-1").await.unwrap();
    assert!(matches!(w1.recv().await, ControlMessage::Stop(_)));
    assert_eq!(lease(&t.plane, "cam-1").await.reason, "camera disabled");
    assert!(matches!(
        admin.disable_camera("missing").await,
        Err(AdminError::NotFound(_))
    ));
}

#[tokio::test]
async fn clear_worker_requires_error_state() {
    let t = test_plane().await;
    let admin = AdminService::new(t.plane.clone());
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;

    assert!(matches!(
        admin.clear_worker("w1").await,
        Err(AdminError::Conflict(_))
    ));

    t.plane
        .workers
        .set_status("w1", WorkerStatus::Error, Some("3 consecutive faults"))
        .await
        .unwrap();
    admin.clear_worker("w1").await.unwrap();
    assert_eq!(w1.recv().await, ControlMessage::Clear);

    let worker = t.plane.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status(), WorkerStatus::Idle);
    assert!(worker.reason.is_none());
}

#[tokio::test]
async fn drain_worker_releases_on_ack() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let admin = AdminService::new(t.plane.clone());
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 1).await;
    w1.expect_start().await;

    admin.drain_worker("w1", "host maintenance").await.unwrap();
    let drain = match w1.recv().await {
        ControlMessage::Drain(drain) => drain,
        other => panic!("expected DRAIN, got {other:?}"),
    };
    w1.send(WorkerMessage::Ack(Ack {
        intent_id: drain.intent_id,
        camera_id: String::new(),
        generation: 0,
        status: AckStatus::Ok,
        detail: String::new(),
    }))
    .await;

    let plane = t.plane.clone();
    eventually(|| {
        let plane = plane.clone();
        async move { lease(&plane, "cam-1").await.state() == LeaseState::Terminated }
    })
    .await;
    let worker = t.plane.workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.status(), WorkerStatus::Draining);
}

#[tokio::test]
async fn worker_health_reports_load_and_connectivity() {
    let t = test_plane().await;
    add_camera(&t.plane, "cam-1").await;
    let admin = AdminService::new(t.plane.clone());
    let mut w1 = FakeWorker::connect(&t.plane, "w1", 2).await;
    w1.expect_start().await;

    let health = admin.worker_health().await.unwrap();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].worker_id, "w1");
    assert_eq!(health[0].load, 1);
    assert_eq!(health[0].capacity, 2);
    assert!(health[0].connected);
    assert!(!health[0].stale);

    t.clock.advance(std::time::Duration::from_secs(31));
    assert!(admin.worker_health().await.unwrap()[0].stale);
}

#[tokio::test]
async fn admin_requests_over_tcp() {
    let t = test_plane().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve_admin(
        listener,
        AdminService::new(t.plane.clone()),
        shutdown_rx,
    ));

    let response = send_admin_request(&addr, AdminRequest::UpsertCamera(spec("cam-9")))
        .await
        .unwrap();
    assert_eq!(response, AdminResponse::Ok);

    let response = send_admin_request(&addr, AdminRequest::LeaseState { camera_id: "cam-9".into() })
        .await
        .unwrap();
    let AdminResponse::Lease(Some(view)) = response else {
        panic!("expected a lease view, got {response:?}");
    };
    assert_eq!(view.camera_id, "cam-9");

    let response = send_admin_request(&addr, AdminRequest::ResumeCamera { camera_id: "cam-9".into() })
        .await
        .unwrap();
    assert!(matches!(response, AdminResponse::Error(_)));

    shutdown_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}
