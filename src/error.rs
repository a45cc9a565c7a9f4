use thiserror::Error;

/// Error taxonomy for the dispatch daemon.
///
/// Only `Config` (at startup) and `Initialization` are fatal; everything else
/// is logged and handled at the point it occurs. Worker-level failures never
/// propagate into the dispatcher loop.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Worktree error: {0}")]
    Worktree(String),

    #[error("Agent runtime error: {0}")]
    AgentRuntime(String),

    #[error("Ticket '{0}' is already leased")]
    LeaseConflict(String),

    #[error("Pool '{0}' not found")]
    PoolNotFound(String),

    #[error("Control plane failed to bind: {0}")]
    ControlPlaneBind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
