use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::bridge_messages::{ErrorKind, Request, RequestId, Response};
use crate::bridge_server::BridgeServer;
use crate::discovery_client::*;
use crate::frame_codec::{FrameReader, MAX_MESSAGE_SIZE, decode_message, encode_message, write_encoded};
use crate::lock_coordinator::{LockCoordinator, LockMarker};
use crate::test_utils::*;

/// Stand-in bridge that answers `{"echo": method}` after a delay and can drop its connection
///
/// With a `read_delay` it leaves each new connection unread for a while, like a busy editor.
struct FakeServer {
    port: u16,
    close: CancellationToken,
    received: Arc<AtomicUsize>,
    cancels: Arc<Mutex<Vec<RequestId>>>,
}

async fn fake_server(delay: Duration) -> FakeServer {
    fake_server_with(delay, Duration::ZERO).await
}

async fn fake_server_with(delay: Duration, read_delay: Duration) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let close = CancellationToken::new();
    let received = Arc::new(AtomicUsize::new(0));
    let cancels = Arc::new(Mutex::new(Vec::new()));

    let server = FakeServer {
        port,
        close: close.clone(),
        received: Arc::clone(&received),
        cancels: Arc::clone(&cancels),
    };

    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = close.cancelled() => return,
                accepted = listener.accept() => accepted.unwrap().0,
            };
            let (read_half, write_half) = stream.into_split();
            let write_half = Arc::new(TokioMutex::new(write_half));
            let mut reader = FrameReader::new(read_half);
            sleep(read_delay).await;

            loop {
                let frame = tokio::select! {
                    _ = close.cancelled() => break,
                    frame = reader.next_frame() => frame,
                };
                let Ok(Some(payload)) = frame else {
                    break;
                };
                let request: Request = decode_message(&payload).unwrap();
                if let Some(target) = request.cancel_target() {
                    cancels.lock().unwrap().push(target);
                    continue;
                }
                received.fetch_add(1, Ordering::SeqCst);

                let write_half = Arc::clone(&write_half);
                let close = close.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    if close.is_cancelled() {
                        return;
                    }
                    let response = Response::success(request.id, json!({ "echo": request.method }));
                    let frame = encode_message(&response, MAX_MESSAGE_SIZE).unwrap();
                    let _ = write_encoded(&mut *write_half.lock().await, &frame).await;
                });
            }

            let _ = write_half.lock().await.shutdown().await;
        }
    });

    server
}

async fn wait_for_state(client: &DiscoveryClient, predicate: impl Fn(&ClientState) -> bool) {
    let mut states = client.subscribe_state();
    timeout(Duration::from_secs(5), states.wait_for(|state| predicate(state)))
        .await
        .expect("Timed out waiting for client state")
        .unwrap();
}

async fn started_server(project: &tempfile::TempDir) -> (BridgeServer, u16) {
    let mut server = BridgeServer::new(test_server_config(project.path()), test_dispatcher());
    let port = server.start().await.unwrap();
    (server, port)
}

#[test]
fn test_discovery_context_cache() {
    let context = DiscoveryContext::new();
    let target = DiscoveryTarget::Port(58231);

    assert_eq!(context.last_reachable_port(&target), None);
    context.remember(&target, 58231);
    assert_eq!(context.last_reachable_port(&target), Some(58231));

    context.invalidate(&target);
    assert_eq!(context.last_reachable_port(&target), None);

    context.remember(&DiscoveryTarget::ProjectPath("/p".into()), 1);
    context.invalidate_all();
    assert_eq!(context.last_reachable_port(&DiscoveryTarget::ProjectPath("/p".into())), None);
}

#[tokio::test]
async fn test_connects_through_port_record() {
    let project = create_test_project();
    let (_server, port) = started_server(&project).await;

    let context = Arc::new(DiscoveryContext::new());
    let target = DiscoveryTarget::ProjectPath(project.path().to_path_buf());
    let client = DiscoveryClient::with_context(target.clone(), test_client_config(), Arc::clone(&context));

    assert_eq!(client.wait_connected(Duration::from_secs(5)).await.unwrap(), port);
    assert_eq!(client.state(), ClientState::Connected { port });
    assert_eq!(context.last_reachable_port(&target), Some(port));
}

#[tokio::test]
async fn test_call_round_trip_and_errors() {
    let project = create_test_project();
    let (_server, port) = started_server(&project).await;
    let client = DiscoveryClient::start(DiscoveryTarget::Port(port), test_client_config());

    let result = client.call("add", json!({"a": 40, "b": 2}), None).await.unwrap();
    assert_eq!(result, json!(42));

    let error = client.call("missing", Value::Null, None).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::UnknownTool);

    let error = client.call("add", json!({"a": "x"}), None).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::InvalidParams);

    let error = client.call("fail", Value::Null, None).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::ToolFailed);
    assert_eq!(error.message, "editor exploded");

    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_are_correlated() {
    let project = create_test_project();
    let (_server, port) = started_server(&project).await;
    let client = Arc::new(DiscoveryClient::start(DiscoveryTarget::Port(port), test_client_config()));
    client.wait_connected(Duration::from_secs(5)).await.unwrap();

    let calls: Vec<_> = (0..20)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let result = client.call("add", json!({"a": i, "b": i}), None).await.unwrap();
                (i, result)
            })
        })
        .collect();

    for call in calls {
        let (i, result) = call.await.unwrap();
        assert_eq!(result, json!(i * 2));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_order_responses() {
    let project = create_test_project();
    let (_server, port) = started_server(&project).await;
    let client = DiscoveryClient::start(DiscoveryTarget::Port(port), test_client_config());

    let slow = client.send_request("slow", json!({"tag": "slow"}), None).await.unwrap();
    let ping = client.send_request("ping", json!({"tag": "fast"}), None).await.unwrap();

    let fast = ping.response().await.unwrap();
    assert_eq!(fast["tag"], "fast");
    // The slow call is still waiting after the later one completed
    assert_eq!(client.pending_count(), 1);

    let slow = slow.response().await.unwrap();
    assert_eq!(slow["tag"], "slow");
}

#[tokio::test]
async fn test_pending_calls_fail_when_connection_drops() {
    let server = fake_server(Duration::from_secs(60)).await;
    let client = DiscoveryClient::start(DiscoveryTarget::Port(server.port), test_client_config());

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(client.send_request("compile", Value::Null, None).await.unwrap());
    }
    while server.received.load(Ordering::SeqCst) < 3 {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.pending_count(), 3);

    server.close.cancel();

    for handle in handles {
        let error = timeout(Duration::from_secs(1), handle.response())
            .await
            .expect("Pending call was left hanging")
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::ConnectionLost);
    }
    assert_eq!(client.pending_count(), 0);
    wait_for_state(&client, |state| *state == ClientState::Reconnecting).await;
}

#[tokio::test]
async fn test_timeout_discards_late_response() {
    let server = fake_server(Duration::from_millis(200)).await;
    let client = DiscoveryClient::start(DiscoveryTarget::Port(server.port), test_client_config());
    client.wait_connected(Duration::from_secs(5)).await.unwrap();

    let handle = client
        .send_request("compile", Value::Null, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    let id = handle.id();
    let error = handle.response().await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.data["timeoutMs"], json!(50));
    assert_eq!(client.pending_count(), 0);

    // The late response arrives and is dropped, the connection stays healthy
    sleep(Duration::from_millis(300)).await;
    assert!(server.cancels.lock().unwrap().contains(&id));
    assert!(matches!(client.state(), ClientState::Connected { .. }));

    let result = client
        .call("ping", Value::Null, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result, json!({"echo": "ping"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_abandoned_mid_write_keeps_stream_intact() {
    let server = fake_server_with(Duration::ZERO, Duration::from_millis(800)).await;
    let client = DiscoveryClient::start(DiscoveryTarget::Port(server.port), test_client_config());
    client.wait_connected(Duration::from_secs(5)).await.unwrap();

    // Far larger than the socket buffers, so the write is still going when the caller gives up
    let upload = json!({ "blob": "x".repeat(12 * 1024 * 1024) });
    let error = client
        .call("upload", upload, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Timeout);

    let result = client
        .call("ping", Value::Null, Some(Duration::from_secs(3)))
        .await
        .unwrap();
    assert_eq!(result, json!({"echo": "ping"}));
    assert!(matches!(client.state(), ClientState::Connected { .. }));
    assert_eq!(server.received.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancel_pending_request() {
    let project = create_test_project();
    let (_server, port) = started_server(&project).await;
    let client = DiscoveryClient::start(DiscoveryTarget::Port(port), test_client_config());

    let handle = client.send_request("slow", Value::Null, None).await.unwrap();
    let id = handle.id();
    assert!(client.cancel(id).await);
    assert!(!client.cancel(id).await);

    let error = handle.response().await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_call_without_editor_is_discovery_error() {
    let project = create_test_project();
    let client = DiscoveryClient::start(
        DiscoveryTarget::ProjectPath(project.path().to_path_buf()),
        test_client_config(),
    );

    let started = Instant::now();
    let error = client
        .call("ping", Value::Null, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::DiscoveryError);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.state(), ClientState::Discovering);
    assert!(client.last_failure().is_some());
}

#[tokio::test]
async fn test_waits_while_marker_is_live() {
    let project = create_test_project();
    let (server, port) = started_server(&project).await;
    let locks = LockCoordinator::for_project(server.project());
    locks.acquire(LockMarker::Compiling).unwrap();

    let client = DiscoveryClient::start(
        DiscoveryTarget::ProjectPath(project.path().to_path_buf()),
        test_client_config(),
    );
    let error = client.wait_connected(Duration::from_millis(300)).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::DiscoveryError);
    assert!(client.last_failure().unwrap().contains("busy"));

    locks.release(LockMarker::Compiling).unwrap();
    assert_eq!(client.wait_connected(Duration::from_secs(5)).await.unwrap(), port);
}

#[tokio::test]
async fn test_port_target_ignores_markers() {
    let project = create_test_project();
    let (server, port) = started_server(&project).await;
    server.set_compiling(true).unwrap();

    let client = DiscoveryClient::start(DiscoveryTarget::Port(port), test_client_config());
    assert_eq!(client.wait_connected(Duration::from_secs(5)).await.unwrap(), port);
}

#[tokio::test]
async fn test_reconnects_after_domain_reload() {
    let project = create_test_project();
    let (mut server, _port) = started_server(&project).await;

    let clients: Vec<DiscoveryClient> = (0..3)
        .map(|_| {
            DiscoveryClient::start(
                DiscoveryTarget::ProjectPath(project.path().to_path_buf()),
                test_client_config(),
            )
        })
        .collect();
    for client in &clients {
        client.wait_connected(Duration::from_secs(5)).await.unwrap();
    }

    server.begin_domain_reload().await.unwrap();
    for client in &clients {
        wait_for_state(client, |state| *state == ClientState::Reconnecting).await;
    }

    // The reload marker keeps clients away until the server is back
    let error = clients[0]
        .call("ping", Value::Null, Some(Duration::from_millis(150)))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::DiscoveryError);

    let new_port = server.finish_domain_reload().await.unwrap();
    for client in &clients {
        assert_eq!(client.wait_connected(Duration::from_secs(5)).await.unwrap(), new_port);
        let result = client.call("ping", json!({"tag": "after"}), None).await.unwrap();
        assert_eq!(result["tag"], "after");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compile_is_serialized_while_ping_runs() {
    let project = create_test_project();
    let (dispatcher, compile_stats) = test_dispatcher_with_compile_stats();
    let mut server = BridgeServer::new(test_server_config(project.path()), dispatcher);
    let port = server.start().await.unwrap();
    let client = DiscoveryClient::start(DiscoveryTarget::Port(port), test_client_config());
    client.wait_connected(Duration::from_secs(5)).await.unwrap();

    let started = Instant::now();
    let first = client.send_request("compile", json!({"tag": "one"}), None).await.unwrap();
    let second = client.send_request("compile", json!({"tag": "two"}), None).await.unwrap();
    sleep(Duration::from_millis(20)).await;

    let ping_started = Instant::now();
    client.call("ping", Value::Null, None).await.unwrap();
    assert!(ping_started.elapsed() < Duration::from_millis(150));

    assert_eq!(first.response().await.unwrap()["tag"], "one");
    assert_eq!(second.response().await.unwrap()["tag"], "two");
    // The second compile starts only once the first one has ended
    assert_eq!(
        compile_stats.events(),
        vec!["start:one", "end:one", "start:two", "end:two"]
    );
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_shutdown_fails_pending_calls() {
    let project = create_test_project();
    let (_server, port) = started_server(&project).await;
    let client = DiscoveryClient::start(DiscoveryTarget::Port(port), test_client_config());

    let handle = client.send_request("slow", Value::Null, None).await.unwrap();
    client.shutdown().await;

    assert_eq!(handle.response().await.unwrap_err().kind, ErrorKind::ConnectionLost);
    assert_eq!(client.state(), ClientState::Shutdown);
    assert!(client.call("ping", Value::Null, None).await.is_err());
}
