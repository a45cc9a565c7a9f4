//! The dispatch daemon: main loop, worker pipelines, and lifecycle.
//!
//! One cooperative loop drains the webhook queue (or falls back to a
//! synthetic tracker-check ticket), routes each candidate to a pool,
//! claims a lease, and launches a per-ticket worker task. Coding workers
//! run inside isolated git worktrees and merge back to main on success;
//! review and linear workers run directly in the project directory.
//!
//! All shared state lives in the pool manager or behind the daemon's own
//! mutexes; worker tasks only touch it through release-style operations at
//! completion, so the dispatcher never races its own workers.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{self, AgentRuntime, SessionResult, SessionStatus};
use crate::config::DaemonConfig;
use crate::control::{ControlPlane, ControlPlaneHandle};
use crate::error::{DaemonError, Result};
use crate::pool::WorkerPoolManager;
use crate::router::TicketRouter;
use crate::subprocess::SubprocessManager;
use crate::ticket::{ModelTier, PoolType, Ticket};
use crate::worktree::{self, WorktreeManager};

/// A worker with this many consecutive errors gets benched for a backoff
/// round instead of receiving another ticket.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

const ERROR_RETRY_DELAY: u64 = 30;
const BACKOFF_CEILING: u64 = 300;
const WORKER_COOLDOWN: Duration = Duration::from_secs(0);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
const RESPONSE_LOG_LIMIT: usize = 200;

const STATE_FILE: &str = ".dispatchd_state.json";

/// Exponential backoff for repeated failures: `30 * 2^errors`, capped at
/// five minutes.
fn backoff_delay(errors: u32) -> u64 {
    ERROR_RETRY_DELAY
        .saturating_mul(2u64.saturating_pow(errors))
        .min(BACKOFF_CEILING)
}

/// Truncate a response for logging without splitting a UTF-8 character.
fn truncate_response(response: &str, limit: usize) -> &str {
    if response.len() <= limit {
        return response;
    }
    let mut end = limit;
    while !response.is_char_boundary(end) {
        end -= 1;
    }
    &response[..end]
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectState {
    #[serde(default)]
    initialized: bool,
}

/// The ticket-dispatch daemon.
pub struct Daemon {
    project_dir: PathBuf,
    config: Mutex<DaemonConfig>,
    pool_manager: Arc<WorkerPoolManager>,
    worktree: Arc<WorktreeManager>,
    router: Mutex<Arc<TicketRouter>>,
    runtime: Arc<dyn AgentRuntime>,

    worker_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    active_tickets: Mutex<HashSet<String>>,

    shutdown: tokio::sync::watch::Sender<bool>,
    interrupted: AtomicBool,
    control_addr: Mutex<Option<std::net::SocketAddr>>,

    total_tickets: AtomicU64,
    poll_count: AtomicU64,
    consecutive_poll_errors: AtomicU32,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Daemon {
    pub fn new(
        project_dir: PathBuf,
        config: DaemonConfig,
        runtime: Arc<dyn AgentRuntime>,
        subprocess: SubprocessManager,
    ) -> Self {
        let pool_manager = Arc::new(WorkerPoolManager::new(&config));
        let worktree = Arc::new(WorktreeManager::new(project_dir.clone(), subprocess));
        let router = TicketRouter::from_config(&config.routing_rules);
        let (shutdown, _) = tokio::sync::watch::channel(false);

        Self {
            project_dir,
            config: Mutex::new(config),
            pool_manager,
            worktree,
            router: Mutex::new(Arc::new(router)),
            runtime,
            worker_tasks: Mutex::new(HashMap::new()),
            active_tickets: Mutex::new(HashSet::new()),
            shutdown,
            interrupted: AtomicBool::new(false),
            control_addr: Mutex::new(None),
            total_tickets: AtomicU64::new(0),
            poll_count: AtomicU64::new(0),
            consecutive_poll_errors: AtomicU32::new(0),
            started_at: Mutex::new(None),
        }
    }

    pub fn pool_manager(&self) -> Arc<WorkerPoolManager> {
        Arc::clone(&self.pool_manager)
    }

    /// Address the control plane actually bound to, once it is up. Useful
    /// when the configured port is 0.
    pub fn control_addr(&self) -> Option<std::net::SocketAddr> {
        *self.control_addr.lock().unwrap()
    }

    /// Signal the daemon to shut down gracefully.
    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.interrupted.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    /// True once a shutdown signal has been received.
    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    // --- Initialization ---

    fn is_project_initialized(&self) -> bool {
        let state_path = self.project_dir.join(STATE_FILE);
        match std::fs::read_to_string(&state_path) {
            Ok(raw) => match serde_json::from_str::<ProjectState>(&raw) {
                Ok(state) => state.initialized,
                Err(_) => {
                    warn!(
                        "Corrupted state file in {}, treating as uninitialized",
                        self.project_dir.display()
                    );
                    false
                }
            },
            Err(_) => false,
        }
    }

    fn mark_initialized(&self) -> Result<()> {
        let state = ProjectState { initialized: true };
        let raw = serde_json::to_string_pretty(&state)?;
        std::fs::write(self.project_dir.join(STATE_FILE), raw)?;
        Ok(())
    }

    /// Run the initialization session if the project has never been set up.
    /// Failure here is fatal: a daemon with no project has nothing to do.
    async fn ensure_initialized(&self) -> Result<()> {
        if self.is_project_initialized() {
            return Ok(());
        }

        info!("Project not initialized, running initialization session...");
        std::fs::create_dir_all(&self.project_dir)?;

        let prompt = agent::initializer_prompt(&self.project_dir);
        let result = self
            .runtime
            .run_session(&self.project_dir, ModelTier::Sonnet.resolve(), &prompt)
            .await
            .map_err(|e| DaemonError::Initialization(e.to_string()))?;

        if result.is_error() {
            let detail = truncate_response(&result.response, 500);
            error!("Initialization failed: {}", detail);
            return Err(DaemonError::Initialization(detail.to_string()));
        }

        self.mark_initialized()?;
        info!("Project initialized successfully");
        Ok(())
    }

    // --- Ticket gathering ---

    /// Queue drain first; with an empty queue, a single synthetic
    /// tracker-check ticket (unless disabled in config).
    fn poll_tickets(&self) -> Vec<Ticket> {
        let queued = self.pool_manager.drain_queue();
        if !queued.is_empty() {
            info!("Event queue: {} tickets from webhooks", queued.len());
            return queued;
        }

        if self.config.lock().unwrap().synthetic_poll {
            vec![Ticket::tracker_check()]
        } else {
            Vec::new()
        }
    }

    fn filter_actionable(&self, tickets: Vec<Ticket>) -> Vec<Ticket> {
        let active = self.active_tickets.lock().unwrap();
        tickets
            .into_iter()
            .filter(|t| !active.contains(&t.key))
            .collect()
    }

    // --- Dispatch ---

    /// Assign tickets to idle workers. Returns the number dispatched.
    fn dispatch_tickets(self: &Arc<Self>, tickets: Vec<Ticket>) -> usize {
        let router = Arc::clone(&self.router.lock().unwrap());
        let mut dispatched = 0;

        for ticket in tickets {
            let pool_type = router.route(&ticket);

            let mut idle = self.pool_manager.idle_workers(Some(pool_type));
            if idle.is_empty() && pool_type != PoolType::Coding {
                // Overflow into the coding pool rather than stalling.
                idle = self.pool_manager.idle_workers(Some(PoolType::Coding));
            }

            let Some(worker) = idle.into_iter().min_by_key(|w| w.consecutive_errors) else {
                debug!("No idle workers for {} (pool={})", ticket.key, pool_type);
                continue;
            };

            if worker.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                let backoff = backoff_delay(worker.consecutive_errors);
                warn!(
                    "{} has {} consecutive errors, backing off {}s",
                    worker.worker_id, worker.consecutive_errors, backoff
                );
                self.pool_manager.reset_error_counter(&worker.worker_id);
                continue;
            }

            if let Err(e) = self.pool_manager.claim_ticket(&ticket, &worker.worker_id) {
                warn!("Could not claim {}: {}", ticket.key, e);
                continue;
            }
            if !self.pool_manager.begin_execution(&worker.worker_id, &ticket) {
                self.pool_manager.release_ticket(&ticket.key);
                continue;
            }
            self.active_tickets.lock().unwrap().insert(ticket.key.clone());

            let daemon = Arc::clone(self);
            let worker_id = worker.worker_id.clone();
            let worker_pool = worker.pool;
            // Hold the registry lock across spawn + insert so the task's
            // own removal cannot run before the handle is registered.
            let mut tasks = self.worker_tasks.lock().unwrap();
            let handle = tokio::spawn(async move {
                daemon.run_worker_task(worker_id, worker_pool, ticket).await;
            });
            tasks.insert(worker.worker_id.clone(), handle);
            drop(tasks);
            dispatched += 1;
        }

        dispatched
    }

    /// One worker's end-to-end handling of one ticket, including all
    /// bookkeeping. Never propagates errors into the dispatcher.
    async fn run_worker_task(self: Arc<Self>, worker_id: String, pool: PoolType, ticket: Ticket) {
        let result = match pool {
            PoolType::Coding => self.run_coding_worker(&worker_id, &ticket).await,
            _ => self.run_standard_worker(&worker_id, &ticket).await,
        };

        let success = !result.is_error();

        self.pool_manager.release_ticket(&ticket.key);
        self.active_tickets.lock().unwrap().remove(&ticket.key);

        if WORKER_COOLDOWN > Duration::ZERO {
            tokio::time::sleep(WORKER_COOLDOWN).await;
        }

        let (errors, completed) = self.pool_manager.finish_execution(&worker_id, success);

        if success {
            self.total_tickets.fetch_add(1, Ordering::SeqCst);
            info!(
                "{} finished {} (completed={}, daemon_total={})",
                worker_id,
                ticket.key,
                completed,
                self.total_tickets.load(Ordering::SeqCst),
            );
        } else {
            warn!(
                "{} error on {} (attempt {}): {}",
                worker_id,
                ticket.key,
                errors,
                truncate_response(&result.response, RESPONSE_LOG_LIMIT),
            );
        }

        if result.status == SessionStatus::Complete {
            info!("{} reports PROJECT_COMPLETE for {}", worker_id, ticket.key);
        }

        self.worker_tasks.lock().unwrap().remove(&worker_id);
    }

    /// Coding pipeline: worktree, port, agent session, merge, cleanup.
    async fn run_coding_worker(&self, worker_id: &str, ticket: &Ticket) -> SessionResult {
        let branch = worktree::branch_for_ticket(&ticket.key, &ticket.title);

        let worktree_path = match self.worktree.create_worktree(worker_id, &branch).await {
            Ok(path) => path,
            Err(e) => {
                error!("{} failed to create worktree: {}", worker_id, e);
                return SessionResult::error(e.to_string());
            }
        };

        // Port allocation is best-effort; a ticket can proceed without a
        // dev server.
        let port = match self.worktree.allocate_port() {
            Ok(port) => Some(port),
            Err(e) => {
                warn!("{} no free port: {}", worker_id, e);
                None
            }
        };
        self.pool_manager
            .set_worker_isolation(worker_id, Some(worktree_path.clone()), port);

        let router = Arc::clone(&self.router.lock().unwrap());
        let (_, model_id) =
            router.route_and_select(ticket, &self.pool_manager.pool_default_models());
        let model_label = ModelTier::from_model_id(&model_id)
            .map(|tier| tier.to_string())
            .unwrap_or_else(|| model_id.clone());

        info!(
            "{} running on {} (branch={}, model={}, port={})",
            worker_id,
            ticket.key,
            branch,
            model_label,
            port.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string()),
        );

        let prompt = agent::continuation_prompt(&self.project_dir);
        let mut result = match self
            .runtime
            .run_session(&worktree_path, &model_id, &prompt)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("{} session error: {}", worker_id, e);
                SessionResult::error(e.to_string())
            }
        };

        if !result.is_error() {
            match self.worktree.merge_to_main(&branch).await {
                Ok(true) => info!("{} merged {} to main", worker_id, branch),
                Ok(false) => warn!(
                    "{} merge conflict on {}, leaving branch for manual review",
                    worker_id, branch
                ),
                Err(e) => {
                    error!("{} merge failed: {}", worker_id, e);
                    result = SessionResult::error(e.to_string());
                }
            }
        }

        if let Err(e) = self.worktree.remove_worktree(worker_id).await {
            warn!("{} worktree cleanup failed: {}", worker_id, e);
        }
        if let Some(port) = port {
            self.worktree.release_port(port);
        }
        self.pool_manager.set_worker_isolation(worker_id, None, None);

        result
    }

    /// Review/linear pipeline: run directly in the project directory.
    async fn run_standard_worker(&self, worker_id: &str, ticket: &Ticket) -> SessionResult {
        let router = Arc::clone(&self.router.lock().unwrap());
        let (_, model_id) =
            router.route_and_select(ticket, &self.pool_manager.pool_default_models());

        info!("{} running on {} (model={})", worker_id, ticket.key, model_id);

        let prompt = agent::continuation_prompt(&self.project_dir);
        match self
            .runtime
            .run_session(&self.project_dir, &model_id, &prompt)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("{} session error: {}", worker_id, e);
                SessionResult::error(e.to_string())
            }
        }
    }

    // --- Lease maintenance ---

    /// Release expired leases so stuck tickets become reclaimable. The
    /// worker tied to an expired lease is never preempted; a late result
    /// is still recorded.
    fn maintain_leases(&self) {
        for lease in self.pool_manager.expired_leases() {
            warn!(
                "Lease expired for ticket '{}' (worker={}), releasing",
                lease.ticket_key, lease.worker_id
            );
            self.pool_manager.release_ticket(&lease.ticket_key);
            self.active_tickets.lock().unwrap().remove(&lease.ticket_key);
        }
    }

    // --- Status ---

    fn print_status(&self) {
        let summary = self.pool_manager.status_summary();
        info!(
            "Status: {} workers total, {} tickets processed, poll #{}",
            summary.total_workers,
            self.total_tickets.load(Ordering::SeqCst),
            self.poll_count.load(Ordering::SeqCst),
        );
        for (pool_name, pool) in &summary.pools {
            info!(
                "  Pool {}: {}/{} busy, model={}",
                pool_name, pool.busy, pool.worker_count, pool.default_model
            );
        }
        for worker in self.pool_manager.workers_snapshot() {
            if let Some(ticket) = worker.current_ticket {
                info!("  {}: BUSY on {}: {}", worker.worker_id, ticket.key, ticket.title);
            }
        }
    }

    // --- Config reload ---

    /// Re-parse the config file (SIGHUP). Pool resizes and the new routing
    /// rules apply between dispatch rounds; a round in flight keeps the
    /// router it started with. Reload failures are logged, never fatal.
    pub fn reload_config(&self, config_path: Option<&Path>) {
        let Some(path) = config_path.filter(|p| p.exists()) else {
            warn!("No config file to reload");
            return;
        };

        let new_config = match DaemonConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Config reload failed: {:#}", e);
                return;
            }
        };

        for (pool_name, pool_config) in &new_config.pools {
            let Some(pool_type) = PoolType::from_name(pool_name) else {
                continue;
            };
            if self
                .pool_manager
                .resize_pool(pool_type, pool_config.max_workers)
                .is_ok()
            {
                info!("Resized {} pool: max={}", pool_name, pool_config.max_workers);
            }
        }

        *self.router.lock().unwrap() =
            Arc::new(TicketRouter::from_config(&new_config.routing_rules));
        *self.config.lock().unwrap() = new_config;

        info!("Configuration reloaded successfully");
    }

    // --- Main loop ---

    /// Run the daemon until shutdown is requested. Returns an error only
    /// for fatal startup failures (project initialization).
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        *self.started_at.lock().unwrap() = Some(Utc::now());

        let (control_port, poll_interval, lease_ttl, pools) = {
            let config = self.config.lock().unwrap();
            (
                config.control_port,
                config.poll_interval,
                config.lease_ttl,
                config.pools.clone(),
            )
        };

        info!("Ticket dispatch daemon starting");
        info!("Project directory: {}", self.project_dir.display());
        info!("Control plane: http://127.0.0.1:{}", control_port);
        info!("Poll interval: {}s, lease TTL: {}s", poll_interval, lease_ttl);
        for (pool_name, pool_cfg) in &pools {
            info!(
                "  Pool {}: min={}, max={}, model={}",
                pool_name, pool_cfg.min_workers, pool_cfg.max_workers, pool_cfg.default_model
            );
        }

        self.ensure_initialized().await?;
        self.pool_manager.initialize_pools();

        let control_handle = match ControlPlane::new(self.pool_manager(), control_port)
            .start()
            .await
        {
            Ok(handle) => {
                *self.control_addr.lock().unwrap() = Some(handle.local_addr());
                Some(handle)
            }
            Err(e) => {
                warn!("Control plane failed to start: {}", e);
                None
            }
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        while !*self.shutdown.borrow() {
            self.poll_count.fetch_add(1, Ordering::SeqCst);

            match self.run_round() {
                Ok(()) => {
                    self.consecutive_poll_errors.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    let attempt = self.consecutive_poll_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    let backoff = backoff_delay(attempt);
                    error!("Poll error (attempt {}, backoff {}s): {}", attempt, backoff, e);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                    continue;
                }
            }

            self.print_status();

            let poll_interval = self.config.lock().unwrap().poll_interval;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(poll_interval)) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        self.shutdown_gracefully(control_handle).await;
        Ok(())
    }

    /// One dispatch round: maintain leases, gather, filter, dispatch.
    fn run_round(self: &Arc<Self>) -> Result<()> {
        self.maintain_leases();

        let all_tickets = self.poll_tickets();
        let actionable = self.filter_actionable(all_tickets.clone());
        let idle = self.pool_manager.idle_workers(None);

        info!(
            "Poll #{}: {} total, {} actionable, {} idle workers",
            self.poll_count.load(Ordering::SeqCst),
            all_tickets.len(),
            actionable.len(),
            idle.len(),
        );

        if !actionable.is_empty() && !idle.is_empty() {
            let dispatched = self.dispatch_tickets(actionable);
            if dispatched > 0 {
                info!("Dispatched {} tickets", dispatched);
            }
        }
        Ok(())
    }

    // --- Shutdown ---

    async fn shutdown_gracefully(&self, control_handle: Option<ControlPlaneHandle>) {
        info!("Shutting down daemon...");

        if let Some(handle) = control_handle {
            handle.stop().await;
        }

        let mut handles: Vec<(String, JoinHandle<()>)> =
            self.worker_tasks.lock().unwrap().drain().collect();

        if !handles.is_empty() {
            info!("Waiting for {} active workers to finish...", handles.len());

            let all_done = tokio::time::timeout(
                SHUTDOWN_GRACE,
                join_all(handles.iter_mut().map(|(_, handle)| handle)),
            )
            .await
            .is_ok();

            if !all_done {
                let stragglers: Vec<&mut JoinHandle<()>> = handles
                    .iter_mut()
                    .filter(|(_, handle)| !handle.is_finished())
                    .map(|(_, handle)| handle)
                    .collect();
                warn!(
                    "Cancelling {} workers that didn't finish in time",
                    stragglers.len()
                );
                for handle in &stragglers {
                    handle.abort();
                }
                join_all(stragglers).await;
            }
        }

        match self.worktree.cleanup_stale_worktrees().await {
            Ok(cleaned) if cleaned > 0 => info!("Cleaned up {} stale worktrees", cleaned),
            Ok(_) => {}
            Err(e) => warn!("Worktree cleanup error: {}", e),
        }

        info!("Daemon stopped");
        info!(
            "Total tickets processed: {}",
            self.total_tickets.load(Ordering::SeqCst)
        );
        info!("Total polls: {}", self.poll_count.load(Ordering::SeqCst));
        if let Some(started_at) = *self.started_at.lock().unwrap() {
            info!("Uptime: {}", Utc::now() - started_at);
        }
        for worker in self.pool_manager.workers_snapshot() {
            info!(
                "  {}: {} tickets completed",
                worker.worker_id, worker.tickets_completed
            );
        }
    }
}
