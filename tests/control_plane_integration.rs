//! Control plane integration tests over real TCP connections.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use dispatchd::config::DaemonConfig;
use dispatchd::control::{ControlPlane, ControlPlaneHandle};
use dispatchd::pool::WorkerPoolManager;

async fn start_control_plane() -> (Arc<WorkerPoolManager>, ControlPlaneHandle) {
    let manager = Arc::new(WorkerPoolManager::new(&DaemonConfig::standard()));
    manager.initialize_pools();
    let handle = ControlPlane::new(Arc::clone(&manager), 0)
        .start()
        .await
        .expect("control plane should bind an ephemeral port");
    (manager, handle)
}

/// Send one raw HTTP request and return (status, headers, json body).
async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> (u16, String, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let body = body.unwrap_or("");
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();

    let (head, payload) = response
        .split_once("\r\n\r\n")
        .expect("response should have a header/body separator");
    let status: u16 = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("response should have a status line");

    (status, head.to_string(), serde_json::from_str(payload).unwrap())
}

#[tokio::test]
async fn health_check_over_tcp() {
    let (_manager, handle) = start_control_plane().await;
    let addr = handle.local_addr();

    let (status, headers, body) = request(addr, "GET", "/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert!(headers.contains("Connection: close"));
    assert!(headers.contains("Content-Type: application/json"));

    handle.stop().await;
}

#[tokio::test]
async fn webhook_enqueue_is_visible_in_queue_depth() {
    let (manager, handle) = start_control_plane().await;
    let addr = handle.local_addr();

    let payload = r#"{"action":"create","type":"Issue","data":{"identifier":"ENG-1","title":"Add retry","description":"","state":{"name":"Todo"},"labels":{"nodes":[]}}}"#;
    let (status, _, body) = request(addr, "POST", "/webhook/linear", Some(payload)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "enqueued");
    assert_eq!(body["ticket"], "ENG-1");

    let (_, _, queue) = request(addr, "GET", "/queue", None).await;
    assert_eq!(queue["queue_depth"], 1);

    let drained = manager.drain_queue();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].key, "ENG-1");

    handle.stop().await;
}

#[tokio::test]
async fn scale_out_then_list_workers() {
    let (_manager, handle) = start_control_plane().await;
    let addr = handle.local_addr();

    let (status, _, body) = request(
        addr,
        "POST",
        "/workers",
        Some(r#"{"pool":"coding","count":5}"#),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["added"], 2);
    assert_eq!(body["total_workers"], 3);

    let (_, _, listing) = request(addr, "GET", "/workers", None).await;
    let coding = listing["workers"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|w| w["pool"] == "coding")
        .count();
    assert_eq!(coding, 3);

    handle.stop().await;
}

#[tokio::test]
async fn resize_pool_via_patch() {
    let (_manager, handle) = start_control_plane().await;
    let addr = handle.local_addr();

    let (status, _, body) = request(
        addr,
        "PATCH",
        "/pools/coding",
        Some(r#"{"max_workers":6}"#),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["max_workers"], 6);

    let (_, _, pools) = request(addr, "GET", "/pools", None).await;
    assert_eq!(pools["pools"]["coding"]["max_workers"], 6);

    handle.stop().await;
}

#[tokio::test]
async fn unknown_route_and_bad_body_error_codes() {
    let (_manager, handle) = start_control_plane().await;
    let addr = handle.local_addr();

    let (status, _, _) = request(addr, "GET", "/metrics", None).await;
    assert_eq!(status, 404);

    let (status, _, body) = request(addr, "POST", "/workers", Some("{oops")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Invalid JSON");

    handle.stop().await;
}

#[tokio::test]
async fn listener_refuses_new_connections_after_stop() {
    let (_manager, handle) = start_control_plane().await;
    let addr = handle.local_addr();
    handle.stop().await;

    let result = TcpStream::connect(addr).await;
    assert!(result.is_err());
}
