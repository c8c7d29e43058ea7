//! Fan-out and liveness against mock peers served by axum on loopback.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use signage_sync_lib::error::{CoreError, Result};
use signage_sync_lib::fanout::{FanoutDispatcher, FanoutOperation};
use signage_sync_lib::events::{CoreEvent, EventBus};
use signage_sync_lib::health::{spawn_liveness_poller, LivenessProbe};
use signage_sync_lib::local::LocalTarget;
use signage_sync_lib::registry::{LocalIdentity, PeerRegistry};
use signage_sync_lib::transport::PeerClient;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// =============================================================================
// TEST INFRASTRUCTURE
// =============================================================================

#[derive(Clone, Default)]
struct MockPeer {
    delay: Duration,
    configs: Arc<parking_lot::Mutex<Vec<Value>>>,
    uploads: Arc<parking_lot::Mutex<Vec<Bytes>>>,
}

async fn get_config(State(peer): State<MockPeer>) -> Json<Value> {
    tokio::time::sleep(peer.delay).await;
    Json(json!({ "displayName": "Alpha", "port": 3006 }))
}

async fn post_config(State(peer): State<MockPeer>, Json(body): Json<Value>) -> Json<Value> {
    tokio::time::sleep(peer.delay).await;
    peer.configs.lock().push(body);
    Json(json!({ "success": true }))
}

async fn post_upload(State(peer): State<MockPeer>, body: Bytes) -> &'static str {
    tokio::time::sleep(peer.delay).await;
    peer.uploads.lock().push(body);
    "ok"
}

async fn spawn_peer(peer: MockPeer) -> SocketAddr {
    let app = Router::new()
        .route("/api/config", get(get_config).post(post_config))
        .route("/api/media/upload", post(post_upload))
        .route("/api/update", post(post_upload))
        .with_state(peer);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

/// Peer whose admin API answers every write with a 500.
async fn spawn_failing_peer() -> SocketAddr {
    let app = Router::new().route(
        "/api/config",
        get(|| async { Json(json!({ "displayName": "Broken" })) })
            .post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "disk full") }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

/// Port nothing listens on.
fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[derive(Default)]
struct RecordingLocal {
    applied: parking_lot::Mutex<Vec<String>>,
}

impl LocalTarget for RecordingLocal {
    fn apply<'a>(&'a self, operation: &'a FanoutOperation) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.applied.lock().push(format!("{:?}", operation.kind()));
            Ok(())
        })
    }
}

fn add_peer(registry: &PeerRegistry, name: &str, addr: SocketAddr, online: bool) -> String {
    let peer = registry.add_manual(addr.ip(), name, addr.port());
    if online {
        registry.record_liveness(&peer.id, true, None);
    }
    peer.id
}

fn targets(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn temp_file(name: &str, content: &[u8]) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("signage-fanout-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

// =============================================================================
// FAN-OUT TESTS
// =============================================================================

#[tokio::test]
async fn test_partial_failure_is_reported_per_target() {
    let fast = MockPeer::default();
    let slow = MockPeer {
        delay: Duration::from_secs(5),
        ..Default::default()
    };
    let a_addr = spawn_peer(fast.clone()).await;
    let c_addr = spawn_peer(slow).await;

    let registry = PeerRegistry::new(LocalIdentity::default());
    let a = add_peer(&registry, "A", a_addr, true);
    let b = add_peer(&registry, "B", dead_addr(), false);
    let c = add_peer(&registry, "C", c_addr, true);

    let local = Arc::new(RecordingLocal::default());
    let dispatcher = FanoutDispatcher::new(registry, PeerClient::new().unwrap(), local.clone());

    let update = json!({
        "imageDuration": 8000,
        "displayName": "Nope",
        "token": "secret",
        "addons": { "clock": { "enabled": false } }
    });
    let op = FanoutOperation::ApplyConfig(update.as_object().unwrap().clone());
    let timeout = Duration::from_millis(500);

    let started = Instant::now();
    let result = dispatcher
        .dispatch(&targets(&[a.as_str(), b.as_str(), c.as_str(), "local", "ghost"]), &op, timeout)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < timeout + Duration::from_millis(750), "took {elapsed:?}");
    assert_eq!(result.success_count, 2);
    assert_eq!(result.fail_count, 3);

    let outcome = |id: &str| result.results.iter().find(|r| r.target_id == id).unwrap();
    assert!(outcome(a.as_str()).success);
    assert!(outcome("local").success);
    assert_eq!(outcome(b.as_str()).error.as_deref(), Some("peer offline"));
    assert!(!outcome(c.as_str()).success);
    assert_eq!(outcome("ghost").error.as_deref(), Some("unknown peer"));

    let received = fast.configs.lock().clone();
    assert_eq!(received, vec![json!({ "imageDuration": 8000 })]);
    assert_eq!(*local.applied.lock(), vec!["ApplyConfig".to_string()]);
}

#[tokio::test]
async fn test_error_status_fails_only_that_target() {
    let healthy = MockPeer::default();
    let registry = PeerRegistry::new(LocalIdentity::default());
    let good = add_peer(&registry, "Good", spawn_peer(healthy.clone()).await, true);
    let bad = add_peer(&registry, "Bad", spawn_failing_peer().await, true);
    let dispatcher = FanoutDispatcher::new(
        registry,
        PeerClient::new().unwrap(),
        Arc::new(RecordingLocal::default()),
    );

    let update = json!({ "rotation": 90 });
    let op = FanoutOperation::ApplyConfig(update.as_object().unwrap().clone());
    let result = dispatcher
        .dispatch(&targets(&[good.as_str(), bad.as_str()]), &op, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(result.fail_count, 1);
    let failed = result.results.iter().find(|r| r.target_id == bad).unwrap();
    assert!(!failed.success);
    assert!(failed.error.as_deref().unwrap().contains("500"), "{:?}", failed.error);
    assert_eq!(*healthy.configs.lock(), vec![update]);
}

#[tokio::test]
async fn test_empty_target_set_is_an_error() {
    let dispatcher = FanoutDispatcher::new(
        PeerRegistry::default(),
        PeerClient::new().unwrap(),
        Arc::new(RecordingLocal::default()),
    );
    let op = FanoutOperation::PushUpdate("update.bin".into());
    let err = dispatcher
        .dispatch(&BTreeSet::new(), &op, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::EmptyTargets));
}

#[tokio::test]
async fn test_media_is_streamed_to_each_peer() {
    let first = MockPeer::default();
    let second = MockPeer::default();
    let registry = PeerRegistry::new(LocalIdentity::default());
    let one = add_peer(&registry, "One", spawn_peer(first.clone()).await, true);
    let two = add_peer(&registry, "Two", spawn_peer(second.clone()).await, true);

    let file = temp_file("poster.png", b"PNGDATA-0123456789");
    let dispatcher = FanoutDispatcher::new(
        registry,
        PeerClient::new().unwrap(),
        Arc::new(RecordingLocal::default()),
    );
    let op = FanoutOperation::UploadMedia(vec![file.clone()]);
    let result = dispatcher
        .dispatch(&targets(&[one.as_str(), two.as_str()]), &op, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.success_count, 2);

    for peer in [&first, &second] {
        let uploads = peer.uploads.lock();
        assert_eq!(uploads.len(), 1);
        let body = String::from_utf8_lossy(&uploads[0]);
        assert!(body.contains("filename=\"poster.png\""));
        assert!(body.contains("PNGDATA-0123456789"));
    }
    let _ = std::fs::remove_dir_all(file.parent().unwrap());
}

#[tokio::test]
async fn test_missing_update_file_fails_every_target() {
    let peer = MockPeer::default();
    let registry = PeerRegistry::new(LocalIdentity::default());
    let id = add_peer(&registry, "One", spawn_peer(peer.clone()).await, true);
    let dispatcher = FanoutDispatcher::new(
        registry,
        PeerClient::new().unwrap(),
        Arc::new(RecordingLocal::default()),
    );

    let op = FanoutOperation::PushUpdate("/definitely/not/here/update.bin".into());
    let result = dispatcher
        .dispatch(&targets(&[id.as_str()]), &op, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.fail_count, 1);
    assert!(peer.uploads.lock().is_empty());
}

// =============================================================================
// LIVENESS TESTS
// =============================================================================

#[tokio::test]
async fn test_liveness_marks_online_and_refreshes_name() {
    let registry = PeerRegistry::new(LocalIdentity::default());
    let up = add_peer(&registry, "Unnamed", spawn_peer(MockPeer::default()).await, false);
    let down = add_peer(&registry, "Gone", dead_addr(), true);

    let liveness = LivenessProbe::new(PeerClient::new().unwrap(), Duration::from_secs(2));

    let peer = registry.get(&up).unwrap();
    assert!(liveness.check(&registry, &peer).await);
    let peer = registry.get(&up).unwrap();
    assert!(peer.online);
    assert_eq!(peer.name, "Alpha");
    assert!(peer.last_checked.is_some());

    let peer = registry.get(&down).unwrap();
    assert!(!liveness.check(&registry, &peer).await);
    assert!(!registry.get(&down).unwrap().online);
}

#[tokio::test]
async fn test_liveness_times_out_on_slow_peer() {
    let slow = MockPeer {
        delay: Duration::from_secs(5),
        ..Default::default()
    };
    let registry = PeerRegistry::new(LocalIdentity::default());
    let id = add_peer(&registry, "Slow", spawn_peer(slow).await, true);
    let liveness = LivenessProbe::new(PeerClient::new().unwrap(), Duration::from_millis(300));

    let started = Instant::now();
    let peer = registry.get(&id).unwrap();
    assert!(!liveness.check(&registry, &peer).await);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_poller_announces_peer_coming_online() {
    let registry = PeerRegistry::new(LocalIdentity::default());
    let id = add_peer(&registry, "Waiting", spawn_peer(MockPeer::default()).await, false);
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let cancel = CancellationToken::new();

    let liveness = LivenessProbe::new(PeerClient::new().unwrap(), Duration::from_secs(1));
    let poller = spawn_liveness_poller(
        registry.clone(),
        liveness,
        Duration::from_millis(50),
        events,
        cancel.clone(),
    );

    let updated = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(CoreEvent::PeerUpdated(peer)) = rx.recv().await {
                if peer.id == id {
                    return peer;
                }
            }
        }
    })
    .await
    .unwrap();
    assert!(updated.online);
    assert_eq!(updated.name, "Alpha");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), poller).await.unwrap().unwrap();
}
