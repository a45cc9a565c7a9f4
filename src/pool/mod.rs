//! Typed worker pools with lease-based ticket tracking.
//!
//! The [`WorkerPoolManager`] owns all cross-task mutable state: the pools
//! and their workers, the ticket leases, and the inbound webhook queue.
//! Everything lives behind a single mutex — the dispatcher and the control
//! plane both go through these methods, and critical sections never await,
//! so contention stays negligible.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config::{DaemonConfig, PoolConfig};
use crate::error::{DaemonError, Result};
use crate::ticket::{ModelTier, PoolType, Ticket, WorkerStatus};

/// A named worker slot within a pool.
///
/// Worker IDs are `{pool}-{ordinal}`, assigned at creation and never reused;
/// they appear in logs and on the control plane, so they must stay stable.
/// Workers are never destroyed while the daemon runs — pools only grow.
#[derive(Debug, Clone)]
pub struct TypedWorker {
    pub worker_id: String,
    pub pool_type: PoolType,
    pub status: WorkerStatus,
    pub current_ticket: Option<Ticket>,
    pub started_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub tickets_completed: u64,
    pub worktree_path: Option<PathBuf>,
    pub port: Option<u16>,
}

impl TypedWorker {
    fn new(worker_id: String, pool_type: PoolType) -> Self {
        Self {
            worker_id,
            pool_type,
            status: WorkerStatus::Idle,
            current_ticket: None,
            started_at: None,
            consecutive_errors: 0,
            tickets_completed: 0,
            worktree_path: None,
            port: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }
}

/// A time-bounded claim on a ticket by a specific worker.
#[derive(Debug, Clone)]
pub struct TicketLease {
    pub ticket_key: String,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    /// Seconds until the lease expires.
    pub ttl: u64,
}

impl TicketLease {
    pub fn is_expired(&self) -> bool {
        let elapsed_ms = (Utc::now() - self.acquired_at).num_milliseconds();
        elapsed_ms > (self.ttl as i64).saturating_mul(1000)
    }
}

struct WorkerPool {
    pool_type: PoolType,
    config: PoolConfig,
    workers: Vec<TypedWorker>,
}

impl WorkerPool {
    fn new(pool_type: PoolType, config: PoolConfig) -> Self {
        Self {
            pool_type,
            config,
            workers: Vec::new(),
        }
    }

    /// Add a worker if under `max_workers`. Returns the new worker's ID.
    fn add_worker(&mut self) -> Option<String> {
        if self.workers.len() >= self.config.max_workers {
            return None;
        }
        let worker_id = format!("{}-{}", self.pool_type, self.workers.len());
        self.workers
            .push(TypedWorker::new(worker_id.clone(), self.pool_type));
        Some(worker_id)
    }

    fn idle_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_idle()).count()
    }
}

/// JSON shape of one worker for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub pool: PoolType,
    pub status: WorkerStatus,
    pub tickets_completed: u64,
    pub consecutive_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_ticket: Option<CurrentTicketInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentTicketInfo {
    pub key: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub worker_count: usize,
    pub idle: usize,
    pub busy: usize,
    pub default_model: String,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub total_workers: usize,
    pub pools: BTreeMap<String, PoolSummary>,
    pub active_leases: usize,
}

fn snapshot_of(worker: &TypedWorker) -> WorkerSnapshot {
    WorkerSnapshot {
        worker_id: worker.worker_id.clone(),
        pool: worker.pool_type,
        status: worker.status,
        tickets_completed: worker.tickets_completed,
        consecutive_errors: worker.consecutive_errors,
        current_ticket: worker.current_ticket.as_ref().map(|t| CurrentTicketInfo {
            key: t.key.clone(),
            title: t.title.clone(),
        }),
    }
}

struct ManagerState {
    pools: HashMap<PoolType, WorkerPool>,
    leases: HashMap<String, TicketLease>,
    queue: VecDeque<Ticket>,
}

/// Owns the typed worker pools, ticket leases, and the inbound queue.
pub struct WorkerPoolManager {
    lease_ttl: u64,
    pool_configs: HashMap<String, PoolConfig>,
    state: Mutex<ManagerState>,
}

impl WorkerPoolManager {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            lease_ttl: config.lease_ttl,
            pool_configs: config.pools.clone(),
            state: Mutex::new(ManagerState {
                pools: HashMap::new(),
                leases: HashMap::new(),
                queue: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create pools and spawn `min_workers` workers per configured pool.
    /// Unknown pool names are logged and skipped.
    pub fn initialize_pools(&self) {
        let mut state = self.lock();
        for (pool_name, pool_config) in &self.pool_configs {
            let Some(pool_type) = PoolType::from_name(pool_name) else {
                warn!("Unknown pool type '{}' in config, skipping", pool_name);
                continue;
            };

            let mut pool = WorkerPool::new(pool_type, pool_config.clone());
            for _ in 0..pool_config.min_workers {
                if pool.add_worker().is_none() {
                    break;
                }
            }
            info!(
                "Initialized {} pool: {} workers (min={}, max={}, model={})",
                pool_name,
                pool.workers.len(),
                pool_config.min_workers,
                pool_config.max_workers,
                pool_config.default_model,
            );
            state.pools.insert(pool_type, pool);
        }
    }

    /// Snapshot the idle workers, optionally filtered by pool.
    pub fn idle_workers(&self, pool_type: Option<PoolType>) -> Vec<WorkerSnapshot> {
        let state = self.lock();
        let mut idle = Vec::new();
        for pool in state.pools.values() {
            if pool_type.is_some_and(|pt| pt != pool.pool_type) {
                continue;
            }
            idle.extend(pool.workers.iter().filter(|w| w.is_idle()).map(snapshot_of));
        }
        idle
    }

    /// Create a lease for a ticket assigned to a worker. Refuses a second
    /// lease on the same key.
    pub fn claim_ticket(&self, ticket: &Ticket, worker_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.leases.contains_key(&ticket.key) {
            return Err(DaemonError::LeaseConflict(ticket.key.clone()));
        }
        state.leases.insert(
            ticket.key.clone(),
            TicketLease {
                ticket_key: ticket.key.clone(),
                worker_id: worker_id.to_string(),
                acquired_at: Utc::now(),
                ttl: self.lease_ttl,
            },
        );
        Ok(())
    }

    /// Release the lease on a ticket. Idempotent.
    pub fn release_ticket(&self, ticket_key: &str) {
        self.lock().leases.remove(ticket_key);
    }

    pub fn expired_leases(&self) -> Vec<TicketLease> {
        self.lock()
            .leases
            .values()
            .filter(|lease| lease.is_expired())
            .cloned()
            .collect()
    }

    /// Update a pool's `max_workers` and grow it back to `min_workers` if
    /// needed. Never removes existing workers.
    pub fn resize_pool(&self, pool_type: PoolType, max_workers: usize) -> Result<()> {
        let mut state = self.lock();
        let pool = state
            .pools
            .get_mut(&pool_type)
            .ok_or_else(|| DaemonError::PoolNotFound(pool_type.to_string()))?;

        pool.config.max_workers = max_workers;
        while pool.workers.len() < pool.config.min_workers {
            if pool.add_worker().is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Add up to `count` workers to a pool, stopping at `max_workers`.
    /// Returns `(added, total_workers)`.
    pub fn add_workers(&self, pool_type: PoolType, count: usize) -> Result<(usize, usize)> {
        let mut state = self.lock();
        let pool = state
            .pools
            .get_mut(&pool_type)
            .ok_or_else(|| DaemonError::PoolNotFound(pool_type.to_string()))?;

        let mut added = 0;
        for _ in 0..count {
            if pool.add_worker().is_none() {
                break;
            }
            added += 1;
        }
        Ok((added, pool.workers.len()))
    }

    /// Mark a worker as executing the given ticket. Returns false if the
    /// worker is unknown or not idle.
    pub fn begin_execution(&self, worker_id: &str, ticket: &Ticket) -> bool {
        let mut state = self.lock();
        let Some(worker) = find_worker(&mut state, worker_id) else {
            return false;
        };
        if !worker.is_idle() {
            return false;
        }
        worker.status = WorkerStatus::Executing;
        worker.current_ticket = Some(ticket.clone());
        worker.started_at = Some(Utc::now());
        true
    }

    /// Record a session outcome and return the worker to idle. Returns the
    /// worker's `(consecutive_errors, tickets_completed)` after the update.
    pub fn finish_execution(&self, worker_id: &str, success: bool) -> (u32, u64) {
        let mut state = self.lock();
        let Some(worker) = find_worker(&mut state, worker_id) else {
            return (0, 0);
        };
        if success {
            worker.consecutive_errors = 0;
            worker.tickets_completed += 1;
        } else {
            worker.consecutive_errors += 1;
        }
        worker.status = WorkerStatus::Idle;
        worker.current_ticket = None;
        worker.started_at = None;
        (worker.consecutive_errors, worker.tickets_completed)
    }

    /// Reset a worker's error counter (used when the dispatcher benches a
    /// worker instead of dispatching to it).
    pub fn reset_error_counter(&self, worker_id: &str) {
        let mut state = self.lock();
        if let Some(worker) = find_worker(&mut state, worker_id) {
            worker.consecutive_errors = 0;
        }
    }

    /// Record or clear a coding worker's worktree checkout and dev port.
    pub fn set_worker_isolation(
        &self,
        worker_id: &str,
        worktree_path: Option<PathBuf>,
        port: Option<u16>,
    ) {
        let mut state = self.lock();
        if let Some(worker) = find_worker(&mut state, worker_id) {
            worker.worktree_path = worktree_path;
            worker.port = port;
        }
    }

    pub fn workers_snapshot(&self) -> Vec<WorkerSnapshot> {
        let state = self.lock();
        let mut workers: Vec<WorkerSnapshot> = state
            .pools
            .values()
            .flat_map(|pool| pool.workers.iter().map(snapshot_of))
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn status_summary(&self) -> StatusSummary {
        let state = self.lock();
        let mut total_workers = 0;
        let mut pools = BTreeMap::new();

        for pool in state.pools.values() {
            let idle = pool.idle_count();
            total_workers += pool.workers.len();
            pools.insert(
                pool.pool_type.to_string(),
                PoolSummary {
                    worker_count: pool.workers.len(),
                    idle,
                    busy: pool.workers.len() - idle,
                    default_model: pool.config.default_model.clone(),
                    max_workers: pool.config.max_workers,
                },
            );
        }

        StatusSummary {
            total_workers,
            pools,
            active_leases: state.leases.len(),
        }
    }

    /// The configured default model tier per initialized pool, for the
    /// router's pool-default override.
    pub fn pool_default_models(&self) -> HashMap<PoolType, ModelTier> {
        let state = self.lock();
        state
            .pools
            .values()
            .filter_map(|pool| {
                ModelTier::from_name(&pool.config.default_model)
                    .map(|tier| (pool.pool_type, tier))
            })
            .collect()
    }

    pub fn pool_exists(&self, pool_type: PoolType) -> bool {
        self.lock().pools.contains_key(&pool_type)
    }

    // Inbound webhook queue. FIFO between arrival and dispatch drain.

    pub fn enqueue_ticket(&self, ticket: Ticket) {
        self.lock().queue.push_back(ticket);
    }

    pub fn drain_queue(&self) -> Vec<Ticket> {
        self.lock().queue.drain(..).collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.lock().queue.len()
    }
}

fn find_worker<'a>(state: &'a mut ManagerState, worker_id: &str) -> Option<&'a mut TypedWorker> {
    state
        .pools
        .values_mut()
        .flat_map(|pool| pool.workers.iter_mut())
        .find(|w| w.worker_id == worker_id)
}
