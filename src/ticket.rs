//! Core ticket model and the enums shared across the daemon.
//!
//! A [`Ticket`] is the unit of work. Identity is the stable tracker key
//! (e.g. `ENG-123`); equality and hashing use the key alone so the same
//! ticket delivered twice (webhook plus poll) dedupes cleanly in sets and
//! maps. Everything else on the ticket is informational.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Lifecycle state as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Todo,
    InProgress,
    Review,
    Done,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Todo => "todo",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Review => "review",
            TicketStatus::Done => "done",
        }
    }
}

/// Estimated complexity of a ticket, used for model routing.
///
/// `Medium` doubles as "unset": the router only runs its keyword heuristic
/// when the complexity is medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TicketComplexity {
    Low,
    #[default]
    Medium,
    High,
}

impl TicketComplexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketComplexity::Low => "low",
            TicketComplexity::Medium => "medium",
            TicketComplexity::High => "high",
        }
    }
}

/// Type of worker pool. A static set; unknown pool names in configuration
/// are logged and skipped rather than invented at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    Coding,
    Review,
    Linear,
}

impl PoolType {
    /// Parse a configured pool name. Returns `None` for unknown names.
    pub fn from_name(name: &str) -> Option<PoolType> {
        match name {
            "coding" => Some(PoolType::Coding),
            "review" => Some(PoolType::Review),
            "linear" => Some(PoolType::Linear),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Coding => "coding",
            PoolType::Review => "review",
            PoolType::Linear => "linear",
        }
    }
}

impl std::fmt::Display for PoolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Executing,
    Draining,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Executing => "executing",
            WorkerStatus::Draining => "draining",
        }
    }
}

/// Symbolic model tier, resolved to a concrete model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    /// Parse a tier name from configuration. Returns `None` for unknown names.
    pub fn from_name(name: &str) -> Option<ModelTier> {
        match name {
            "haiku" => Some(ModelTier::Haiku),
            "sonnet" => Some(ModelTier::Sonnet),
            "opus" => Some(ModelTier::Opus),
            _ => None,
        }
    }

    /// Resolve the tier to the full model identifier passed to the agent
    /// runtime.
    pub fn resolve(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "claude-haiku-4-5-20251001",
            ModelTier::Sonnet => "claude-sonnet-4-5-20250929",
            ModelTier::Opus => "claude-opus-4-5-20251101",
        }
    }

    /// Reverse lookup of a concrete model identifier, for log lines that
    /// prefer the short tier name.
    pub fn from_model_id(model_id: &str) -> Option<ModelTier> {
        [ModelTier::Haiku, ModelTier::Sonnet, ModelTier::Opus]
            .into_iter()
            .find(|tier| tier.resolve() == model_id)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "haiku",
            ModelTier::Sonnet => "sonnet",
            ModelTier::Opus => "opus",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work pulled from the tracker.
///
/// Immutable after enqueue; tracker-side state changes produce new values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TicketStatus,
    #[serde(default = "Ticket::default_priority")]
    pub priority: String,
    #[serde(default)]
    pub complexity: TicketComplexity,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Ticket {
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            description: String::new(),
            status: TicketStatus::Todo,
            priority: Self::default_priority(),
            complexity: TicketComplexity::Medium,
            labels: Vec::new(),
        }
    }

    fn default_priority() -> String {
        "medium".to_string()
    }

    /// The synthetic placeholder dispatched when the webhook queue is empty.
    /// The agent runtime interprets it as "go look for work yourself".
    pub fn tracker_check() -> Self {
        let mut ticket = Ticket::new("LINEAR_CHECK", "Check the tracker for available tickets");
        ticket.description = "Run a continuation session to check for work.".to_string();
        ticket
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Ticket {}

impl Hash for Ticket {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ticket_identity_is_key_only() {
        let mut a = Ticket::new("ENG-1", "Add retry");
        let mut b = Ticket::new("ENG-1", "Completely different title");
        a.labels = vec!["backend".to_string()];
        b.complexity = TicketComplexity::High;

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn pool_type_parsing_rejects_unknown_names() {
        assert_eq!(PoolType::from_name("coding"), Some(PoolType::Coding));
        assert_eq!(PoolType::from_name("review"), Some(PoolType::Review));
        assert_eq!(PoolType::from_name("linear"), Some(PoolType::Linear));
        assert_eq!(PoolType::from_name("gpu"), None);
        assert_eq!(PoolType::from_name(""), None);
    }

    #[test]
    fn model_tier_round_trips_through_model_id() {
        for tier in [ModelTier::Haiku, ModelTier::Sonnet, ModelTier::Opus] {
            assert_eq!(ModelTier::from_model_id(tier.resolve()), Some(tier));
        }
        assert_eq!(ModelTier::from_model_id("gpt-4"), None);
    }

    #[test]
    fn complexity_defaults_to_medium() {
        assert_eq!(TicketComplexity::default(), TicketComplexity::Medium);
        let ticket = Ticket::new("ENG-2", "Something");
        assert_eq!(ticket.complexity, TicketComplexity::Medium);
        assert_eq!(ticket.priority, "medium");
    }

    #[test]
    fn tracker_check_placeholder_shape() {
        let ticket = Ticket::tracker_check();
        assert_eq!(ticket.key, "LINEAR_CHECK");
        assert_eq!(ticket.status, TicketStatus::Todo);
        assert!(ticket.labels.is_empty());
    }
}
