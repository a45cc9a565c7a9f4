//! HTTP control plane for runtime management.
//!
//! A deliberately small server: one tokio task accepts connections, each
//! connection gets one request parsed by hand (request line, headers,
//! body), a JSON response, and `Connection: close`. No HTTP framework —
//! the endpoint surface is seven routes and the daemon must not grow a
//! second web stack for it.
//!
//! Handlers only read or mutate the pool manager through its thread-safe
//! operations, so the control plane never blocks the dispatcher and never
//! holds a worker across an agent invocation.

use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};
use crate::pool::WorkerPoolManager;
use crate::ticket::{PoolType, Ticket};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// States a webhook issue may be in for the daemon to care about it.
const ACTIONABLE_STATES: &[&str] = &["todo", "backlog", "triage"];

pub struct ControlPlane {
    pool_manager: Arc<WorkerPoolManager>,
    port: u16,
}

/// Handle to a running control plane; dropping it leaves the server
/// running detached, so the daemon keeps it and calls [`stop`].
///
/// [`stop`]: ControlPlaneHandle::stop
pub struct ControlPlaneHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ControlPlaneHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener and drain in-flight connections.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl ControlPlane {
    pub fn new(pool_manager: Arc<WorkerPoolManager>, port: u16) -> Self {
        Self { pool_manager, port }
    }

    /// Bind and start serving. Binding failures surface as
    /// [`DaemonError::ControlPlaneBind`]; the daemon treats them as
    /// non-fatal.
    pub async fn start(self) -> Result<ControlPlaneHandle> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .map_err(|e| DaemonError::ControlPlaneBind(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::ControlPlaneBind(e.to_string()))?;
        info!("Control plane listening on http://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let pool_manager = self.pool_manager;

        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let manager = Arc::clone(&pool_manager);
                                connections.spawn(handle_connection(stream, manager));
                            }
                            Err(e) => warn!("Control plane accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
                // Reap connections that already finished.
                while connections.try_join_next().is_some() {}
            }

            while connections.join_next().await.is_some() {}
            info!("Control plane stopped");
        });

        Ok(ControlPlaneHandle {
            shutdown: shutdown_tx,
            task,
            local_addr,
        })
    }
}

async fn handle_connection(stream: TcpStream, manager: Arc<WorkerPoolManager>) {
    if let Err(e) = serve_request(stream, manager).await {
        debug!("Control plane connection error: {}", e);
    }
}

/// Read one request, route it, write one response.
async fn serve_request(
    mut stream: TcpStream,
    manager: Arc<WorkerPoolManager>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut request_line)).await {
        Ok(read) => {
            if read? == 0 {
                return Ok(());
            }
        }
        Err(_) => return Ok(()), // slow client, drop it
    }

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return write_response(&mut write_half, 400, &json!({"error": "Bad request"})).await;
    }
    let method = parts[0].to_uppercase();
    let path = parts[1].to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(read) => {
                if read? == 0 {
                    break;
                }
            }
            Err(_) => return Ok(()),
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
            .and_then(|v| v.parse::<usize>().ok())
        {
            content_length = value;
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        use tokio::io::AsyncReadExt;
        match tokio::time::timeout(READ_TIMEOUT, reader.read_exact(&mut body)).await {
            Ok(read) => {
                read?;
            }
            Err(_) => return Ok(()),
        }
    }

    let (status, response) = route(&manager, &method, &path, &body);
    write_response(&mut write_half, status, &response).await
}

async fn write_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    status: u16,
    body: &Value,
) -> std::io::Result<()> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    };
    let body_bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let header = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body_bytes.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body_bytes).await?;
    writer.flush().await
}

/// Dispatch a request to its handler. Handler failures render as 500
/// instead of tearing down the connection task.
fn route(manager: &WorkerPoolManager, method: &str, path: &str, body: &[u8]) -> (u16, Value) {
    let result = match (method, path) {
        ("GET", "/health") => Ok((200, json!({"status": "ok"}))),
        ("GET", "/workers") => handle_get_workers(manager),
        ("POST", "/workers") => handle_add_workers(manager, body),
        ("GET", "/pools") => handle_get_pools(manager),
        ("GET", "/queue") => Ok((200, json!({"queue_depth": manager.queue_depth()}))),
        ("POST", "/webhook/linear") => handle_linear_webhook(manager, body),
        ("PATCH", patch_path) if patch_path.starts_with("/pools/") => {
            let pool_name = patch_path["/pools/".len()..].trim_end_matches('/');
            handle_resize_pool(manager, pool_name, body)
        }
        _ => Ok((404, json!({"error": "Not found"}))),
    };

    result.unwrap_or_else(|e| {
        warn!("Control plane request error: {}", e);
        (500, json!({"error": e}))
    })
}

type RouteResult = std::result::Result<(u16, Value), String>;

fn handle_get_workers(manager: &WorkerPoolManager) -> RouteResult {
    let workers = serde_json::to_value(manager.workers_snapshot()).map_err(|e| e.to_string())?;
    Ok((200, json!({"workers": workers})))
}

#[derive(Deserialize)]
struct AddWorkersRequest {
    #[serde(default = "AddWorkersRequest::default_pool")]
    pool: String,
    #[serde(default = "AddWorkersRequest::default_count")]
    count: usize,
}

impl AddWorkersRequest {
    fn default_pool() -> String {
        "coding".to_string()
    }

    fn default_count() -> usize {
        1
    }
}

fn handle_add_workers(manager: &WorkerPoolManager, body: &[u8]) -> RouteResult {
    let request: AddWorkersRequest = match parse_body(body) {
        Ok(req) => req,
        Err(response) => return Ok(response),
    };

    let Some(pool_type) = PoolType::from_name(&request.pool) else {
        return Ok((400, json!({"error": format!("Unknown pool: {}", request.pool)})));
    };

    match manager.add_workers(pool_type, request.count) {
        Ok((added, total_workers)) => Ok((
            200,
            json!({
                "added": added,
                "pool": request.pool,
                "total_workers": total_workers,
            }),
        )),
        Err(DaemonError::PoolNotFound(_)) => Ok((
            404,
            json!({"error": format!("Pool '{}' not found", request.pool)}),
        )),
        Err(e) => Err(e.to_string()),
    }
}

fn handle_get_pools(manager: &WorkerPoolManager) -> RouteResult {
    let summary = serde_json::to_value(manager.status_summary()).map_err(|e| e.to_string())?;
    Ok((200, summary))
}

fn handle_resize_pool(manager: &WorkerPoolManager, pool_name: &str, body: &[u8]) -> RouteResult {
    let parsed: Value = match parse_body(body) {
        Ok(value) => value,
        Err(response) => return Ok(response),
    };

    let Some(pool_type) = PoolType::from_name(pool_name) else {
        return Ok((400, json!({"error": format!("Unknown pool: {pool_name}")})));
    };

    let max_workers = parsed.get("max_workers").and_then(Value::as_u64);
    let Some(max_workers) = max_workers.filter(|&n| n >= 1) else {
        return Ok((
            400,
            json!({"error": "max_workers must be a positive integer"}),
        ));
    };

    match manager.resize_pool(pool_type, max_workers as usize) {
        Ok(()) => {
            let current_workers = manager
                .status_summary()
                .pools
                .get(pool_name)
                .map(|p| p.worker_count)
                .unwrap_or(0);
            Ok((
                200,
                json!({
                    "pool": pool_name,
                    "max_workers": max_workers,
                    "current_workers": current_workers,
                }),
            ))
        }
        Err(DaemonError::PoolNotFound(_)) => Ok((
            404,
            json!({"error": format!("Pool '{pool_name}' not found")}),
        )),
        Err(e) => Err(e.to_string()),
    }
}

// Webhook payload shapes. Everything is optional: tracker webhooks evolve
// and a missing field should downgrade gracefully, not 500.

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: String,
    #[serde(default, rename = "type")]
    event_type: String,
    #[serde(default)]
    data: WebhookIssue,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookIssue {
    identifier: Option<String>,
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    description: String,
    priority: Option<Value>,
    state: Option<WebhookState>,
    labels: Option<WebhookLabels>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookState {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookLabels {
    #[serde(default)]
    nodes: Vec<WebhookLabel>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookLabel {
    #[serde(default)]
    name: String,
}

fn handle_linear_webhook(manager: &WorkerPoolManager, body: &[u8]) -> RouteResult {
    let payload: WebhookPayload = match parse_body(body) {
        Ok(payload) => payload,
        Err(response) => return Ok(response),
    };

    if payload.event_type != "Issue" {
        return Ok((
            200,
            json!({"status": "ignored", "reason": format!("type={}", payload.event_type)}),
        ));
    }

    let state_name = payload
        .data
        .state
        .as_ref()
        .map(|s| s.name.to_lowercase())
        .unwrap_or_default();

    let actionable = matches!(payload.action.as_str(), "create" | "update")
        && ACTIONABLE_STATES.contains(&state_name.as_str());
    if !actionable {
        return Ok((
            200,
            json!({
                "status": "ignored",
                "reason": format!("action={}, state={}", payload.action, state_name),
            }),
        ));
    }

    let issue = payload.data;
    let key = issue
        .identifier
        .or(issue.id)
        .unwrap_or_else(|| "UNKNOWN".to_string());
    let mut ticket = Ticket::new(key, issue.title.unwrap_or_else(|| "Untitled".to_string()));
    ticket.description = issue.description;
    ticket.priority = match issue.priority {
        Some(Value::String(s)) => s,
        Some(other) if !other.is_null() => other.to_string(),
        _ => "medium".to_string(),
    };
    ticket.labels = issue
        .labels
        .map(|l| l.nodes.into_iter().map(|n| n.name).collect())
        .unwrap_or_default();

    info!(
        "Webhook: enqueued {} '{}' (action={}, state={})",
        ticket.key, ticket.title, payload.action, state_name,
    );
    let key = ticket.key.clone();
    manager.enqueue_ticket(ticket);

    Ok((200, json!({"status": "enqueued", "ticket": key})))
}

/// Parse a JSON body, treating an empty body as `{}` the way curl-driven
/// operators expect. The error branch carries a ready-made 400 response.
fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> std::result::Result<T, (u16, Value)> {
    let text = if body.is_empty() { b"{}" as &[u8] } else { body };
    serde_json::from_slice(text).map_err(|_| (400, json!({"error": "Invalid JSON"})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    fn manager() -> WorkerPoolManager {
        let manager = WorkerPoolManager::new(&DaemonConfig::standard());
        manager.initialize_pools();
        manager
    }

    fn get(manager: &WorkerPoolManager, path: &str) -> (u16, Value) {
        route(manager, "GET", path, b"")
    }

    #[test]
    fn health_endpoint() {
        let manager = manager();
        let (status, body) = get(&manager, "/health");
        assert_eq!(status, 200);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[test]
    fn unknown_path_is_404() {
        let manager = manager();
        let (status, body) = get(&manager, "/nope");
        assert_eq!(status, 404);
        assert_eq!(body["error"], "Not found");
    }

    #[test]
    fn workers_listing_includes_all_pools() {
        let manager = manager();
        let (status, body) = get(&manager, "/workers");
        assert_eq!(status, 200);
        let workers = body["workers"].as_array().unwrap();
        assert_eq!(workers.len(), 3);
        assert!(workers.iter().any(|w| w["worker_id"] == "coding-0"));
        assert!(workers.iter().all(|w| w.get("current_ticket").is_none()));
    }

    #[test]
    fn scale_out_adds_up_to_max_workers() {
        // Default config: coding starts at 1 with max 3. Asking for 5 adds 2.
        let manager = manager();
        let body = br#"{"pool": "coding", "count": 5}"#;
        let (status, response) = route(&manager, "POST", "/workers", body);
        assert_eq!(status, 200);
        assert_eq!(
            response,
            json!({"added": 2, "pool": "coding", "total_workers": 3})
        );

        let (_, listing) = get(&manager, "/workers");
        let coding: Vec<&Value> = listing["workers"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|w| w["pool"] == "coding")
            .collect();
        assert_eq!(coding.len(), 3);
    }

    #[test]
    fn add_workers_defaults_to_one_coding_worker() {
        let manager = manager();
        let (status, response) = route(&manager, "POST", "/workers", b"");
        assert_eq!(status, 200);
        assert_eq!(response["added"], 1);
        assert_eq!(response["pool"], "coding");
    }

    #[test]
    fn add_workers_rejects_unknown_pool_name() {
        let manager = manager();
        let (status, response) =
            route(&manager, "POST", "/workers", br#"{"pool": "gpu"}"#);
        assert_eq!(status, 400);
        assert!(response["error"].as_str().unwrap().contains("gpu"));
    }

    #[test]
    fn add_workers_404_for_uninitialized_pool() {
        let mut config = DaemonConfig::standard();
        config.pools.remove("review");
        let manager = WorkerPoolManager::new(&config);
        manager.initialize_pools();

        let (status, _) = route(&manager, "POST", "/workers", br#"{"pool": "review"}"#);
        assert_eq!(status, 404);
    }

    #[test]
    fn add_workers_rejects_bad_json() {
        let manager = manager();
        let (status, response) = route(&manager, "POST", "/workers", b"{not json");
        assert_eq!(status, 400);
        assert_eq!(response["error"], "Invalid JSON");
    }

    #[test]
    fn pools_endpoint_returns_summary() {
        let manager = manager();
        let (status, body) = get(&manager, "/pools");
        assert_eq!(status, 200);
        assert_eq!(body["total_workers"], 3);
        assert_eq!(body["pools"]["coding"]["max_workers"], 3);
        assert_eq!(body["active_leases"], 0);
    }

    #[test]
    fn resize_pool_updates_max_workers() {
        let manager = manager();
        let (status, response) = route(
            &manager,
            "PATCH",
            "/pools/coding",
            br#"{"max_workers": 6}"#,
        );
        assert_eq!(status, 200);
        assert_eq!(
            response,
            json!({"pool": "coding", "max_workers": 6, "current_workers": 1})
        );

        let (_, summary) = get(&manager, "/pools");
        assert_eq!(summary["pools"]["coding"]["max_workers"], 6);
    }

    #[test]
    fn resize_pool_validates_max_workers() {
        let manager = manager();
        for body in [
            br#"{"max_workers": 0}"#.as_slice(),
            br#"{"max_workers": -2}"#.as_slice(),
            br#"{"max_workers": "six"}"#.as_slice(),
            br#"{}"#.as_slice(),
        ] {
            let (status, response) = route(&manager, "PATCH", "/pools/coding", body);
            assert_eq!(status, 400, "body: {:?}", String::from_utf8_lossy(body));
            assert_eq!(response["error"], "max_workers must be a positive integer");
        }
    }

    #[test]
    fn resize_unknown_pool_name_is_400_and_missing_pool_is_404() {
        let manager = manager();
        let (status, _) = route(&manager, "PATCH", "/pools/gpu", br#"{"max_workers": 2}"#);
        assert_eq!(status, 400);

        let mut config = DaemonConfig::standard();
        config.pools.remove("linear");
        let partial = WorkerPoolManager::new(&config);
        partial.initialize_pools();
        let (status, _) = route(&partial, "PATCH", "/pools/linear", br#"{"max_workers": 2}"#);
        assert_eq!(status, 404);
    }

    #[test]
    fn queue_depth_reflects_enqueued_tickets() {
        let manager = manager();
        let (_, body) = get(&manager, "/queue");
        assert_eq!(body["queue_depth"], 0);

        manager.enqueue_ticket(Ticket::new("ENG-1", "x"));
        let (_, body) = get(&manager, "/queue");
        assert_eq!(body["queue_depth"], 1);
    }

    #[test]
    fn webhook_enqueues_actionable_issue() {
        let manager = manager();
        let body = br#"{
            "action": "create",
            "type": "Issue",
            "data": {
                "identifier": "ENG-1",
                "title": "Add retry",
                "description": "",
                "state": {"name": "Todo"},
                "labels": {"nodes": []}
            }
        }"#;
        let (status, response) = route(&manager, "POST", "/webhook/linear", body);
        assert_eq!(status, 200);
        assert_eq!(response, json!({"status": "enqueued", "ticket": "ENG-1"}));
        assert_eq!(manager.queue_depth(), 1);

        let drained = manager.drain_queue();
        assert_eq!(drained[0].key, "ENG-1");
        assert_eq!(drained[0].title, "Add retry");
    }

    #[test]
    fn webhook_extracts_labels_and_priority() {
        let manager = manager();
        let body = br#"{
            "action": "update",
            "type": "Issue",
            "data": {
                "identifier": "ENG-2",
                "title": "Review the PR",
                "priority": 2,
                "state": {"name": "Triage"},
                "labels": {"nodes": [{"name": "review"}, {"name": "urgent"}]}
            }
        }"#;
        let (status, _) = route(&manager, "POST", "/webhook/linear", body);
        assert_eq!(status, 200);

        let ticket = manager.drain_queue().pop().unwrap();
        assert_eq!(ticket.labels, vec!["review", "urgent"]);
        assert_eq!(ticket.priority, "2");
    }

    #[test]
    fn webhook_falls_back_to_id_and_untitled() {
        let manager = manager();
        let body = br#"{
            "action": "create",
            "type": "Issue",
            "data": {"id": "uuid-123", "state": {"name": "backlog"}}
        }"#;
        let (_, response) = route(&manager, "POST", "/webhook/linear", body);
        assert_eq!(response["ticket"], "uuid-123");

        let ticket = manager.drain_queue().pop().unwrap();
        assert_eq!(ticket.title, "Untitled");
        assert_eq!(ticket.priority, "medium");
    }

    #[test]
    fn webhook_ignores_non_issue_types() {
        let manager = manager();
        let body = br#"{"action": "create", "type": "Comment", "data": {}}"#;
        let (status, response) = route(&manager, "POST", "/webhook/linear", body);
        assert_eq!(status, 200);
        assert_eq!(response["status"], "ignored");
        assert_eq!(response["reason"], "type=Comment");
        assert_eq!(manager.queue_depth(), 0);
    }

    #[test]
    fn webhook_ignores_non_actionable_states_and_actions() {
        let manager = manager();

        let done = br#"{
            "action": "update", "type": "Issue",
            "data": {"identifier": "ENG-3", "title": "t", "state": {"name": "Done"}}
        }"#;
        let (_, response) = route(&manager, "POST", "/webhook/linear", done);
        assert_eq!(response["status"], "ignored");
        assert_eq!(response["reason"], "action=update, state=done");

        let removed = br#"{
            "action": "remove", "type": "Issue",
            "data": {"identifier": "ENG-4", "title": "t", "state": {"name": "Todo"}}
        }"#;
        let (_, response) = route(&manager, "POST", "/webhook/linear", removed);
        assert_eq!(response["status"], "ignored");
        assert_eq!(manager.queue_depth(), 0);
    }

    #[test]
    fn webhook_rejects_bad_json() {
        let manager = manager();
        let (status, response) = route(&manager, "POST", "/webhook/linear", b"[1, 2");
        assert_eq!(status, 400);
        assert_eq!(response["error"], "Invalid JSON");
    }
}
