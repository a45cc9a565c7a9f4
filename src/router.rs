//! Ticket routing.
//!
//! Routes tickets to a worker pool and selects the model tier, using an
//! ordered rule list first and falling back to label inference plus a
//! keyword complexity heuristic. Rules come from configuration and are
//! compiled once; the daemon swaps in a fresh router on config reload.

use regex::RegexBuilder;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::RoutingRuleConfig;
use crate::ticket::{ModelTier, PoolType, Ticket, TicketComplexity};

/// Keywords that push a medium ticket up to high complexity.
const HIGH_COMPLEXITY_KEYWORDS: &[&str] = &[
    "refactor",
    "redesign",
    "migrate",
    "architecture",
    "performance",
    "security",
    "database",
    "auth",
    "authentication",
    "integration",
    "real-time",
    "websocket",
    "infrastructure",
];

/// Keywords that pull a medium ticket down to low complexity.
const LOW_COMPLEXITY_KEYWORDS: &[&str] = &[
    "typo",
    "rename",
    "label",
    "color",
    "text",
    "copy",
    "readme",
    "comment",
    "lint",
    "format",
    "style",
    "docs",
    "documentation",
];

/// One compiled matcher from a rule's `match` map.
enum MatchClause {
    /// Any-of: the ticket must carry at least one of these labels.
    Labels(Vec<String>),
    Complexity(String),
    Priority(String),
    TitlePattern(regex::Regex),
    Status(String),
    /// Unknown match key or uncompilable pattern. Fails the whole rule,
    /// so a typo in config never silently widens a rule's reach.
    Unmatchable(String),
}

impl MatchClause {
    fn from_entry(key: &str, value: &serde_json::Value) -> MatchClause {
        match key {
            "labels" => {
                let labels = match value {
                    serde_json::Value::Array(items) => items
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect(),
                    serde_json::Value::String(s) => vec![s.clone()],
                    _ => Vec::new(),
                };
                MatchClause::Labels(labels)
            }
            "complexity" => MatchClause::Complexity(string_of(value)),
            "priority" => MatchClause::Priority(string_of(value)),
            "status" => MatchClause::Status(string_of(value)),
            "title_pattern" => {
                let pattern = string_of(value);
                match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                    Ok(re) => MatchClause::TitlePattern(re),
                    Err(e) => {
                        warn!("Invalid title_pattern '{}' in routing rule: {}", pattern, e);
                        MatchClause::Unmatchable(format!("title_pattern:{pattern}"))
                    }
                }
            }
            other => {
                debug!("Unknown match key '{}' in routing rule", other);
                MatchClause::Unmatchable(other.to_string())
            }
        }
    }

    fn matches(&self, ticket: &Ticket) -> bool {
        match self {
            MatchClause::Labels(expected) => {
                expected.iter().any(|label| ticket.has_label(label))
            }
            MatchClause::Complexity(expected) => ticket.complexity.as_str() == expected,
            MatchClause::Priority(expected) => &ticket.priority == expected,
            MatchClause::TitlePattern(re) => re.is_match(&ticket.title),
            MatchClause::Status(expected) => ticket.status.as_str() == expected,
            MatchClause::Unmatchable(_) => false,
        }
    }
}

fn string_of(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A compiled routing rule: all clauses must match, first matching rule wins.
pub struct RoutingRule {
    clauses: Vec<MatchClause>,
    pub pool: PoolType,
    pub model: ModelTier,
}

impl RoutingRule {
    pub fn from_config(config: &RoutingRuleConfig) -> RoutingRule {
        let pool = PoolType::from_name(&config.pool).unwrap_or_else(|| {
            warn!(
                "Unknown pool '{}' in routing rule, defaulting to coding",
                config.pool
            );
            PoolType::Coding
        });
        let model = ModelTier::from_name(&config.model).unwrap_or_else(|| {
            warn!(
                "Unknown model '{}' in routing rule, defaulting to sonnet",
                config.model
            );
            ModelTier::Sonnet
        });

        let clauses = config
            .matchers
            .iter()
            .map(|(key, value)| MatchClause::from_entry(key, value))
            .collect();

        RoutingRule {
            clauses,
            pool,
            model,
        }
    }

    /// A rule with an empty `match` map matches every ticket.
    pub fn matches(&self, ticket: &Ticket) -> bool {
        self.clauses.iter().all(|clause| clause.matches(ticket))
    }
}

/// Estimate ticket complexity from title and description keywords.
///
/// Only runs when complexity is unset (medium); an explicit low/high wins.
pub fn estimate_complexity(ticket: &Ticket) -> TicketComplexity {
    if ticket.complexity != TicketComplexity::Medium {
        return ticket.complexity;
    }

    let text = format!("{} {}", ticket.title, ticket.description).to_lowercase();

    if HIGH_COMPLEXITY_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return TicketComplexity::High;
    }
    if LOW_COMPLEXITY_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return TicketComplexity::Low;
    }
    TicketComplexity::Medium
}

pub fn model_for_complexity(complexity: TicketComplexity) -> ModelTier {
    match complexity {
        TicketComplexity::Low => ModelTier::Haiku,
        TicketComplexity::Medium => ModelTier::Sonnet,
        TicketComplexity::High => ModelTier::Opus,
    }
}

/// Routes tickets to pools and selects models from rules plus heuristics.
pub struct TicketRouter {
    rules: Vec<RoutingRule>,
}

impl TicketRouter {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(rule_configs: &[RoutingRuleConfig]) -> Self {
        Self::new(rule_configs.iter().map(RoutingRule::from_config).collect())
    }

    /// Determine which pool should handle this ticket. Rules are tried in
    /// order; without a match the pool is inferred from labels.
    pub fn route(&self, ticket: &Ticket) -> PoolType {
        for rule in &self.rules {
            if rule.matches(ticket) {
                return rule.pool;
            }
        }
        self.infer_pool(ticket)
    }

    /// Route the ticket and pick the model to run it with.
    ///
    /// A matching rule supplies both. Otherwise the model comes from the
    /// complexity estimate, with the chosen pool's `default_model` taking
    /// precedence when one is configured.
    pub fn route_and_select(
        &self,
        ticket: &Ticket,
        pool_models: &HashMap<PoolType, ModelTier>,
    ) -> (PoolType, String) {
        for rule in &self.rules {
            if rule.matches(ticket) {
                return (rule.pool, rule.model.resolve().to_string());
            }
        }

        let complexity = estimate_complexity(ticket);
        let mut model = model_for_complexity(complexity);

        let pool_type = self.infer_pool(ticket);
        if let Some(pool_model) = pool_models.get(&pool_type) {
            model = *pool_model;
        }

        (pool_type, model.resolve().to_string())
    }

    fn infer_pool(&self, ticket: &Ticket) -> PoolType {
        let labels_lower: Vec<String> = ticket.labels.iter().map(|l| l.to_lowercase()).collect();

        if ["review", "pr", "code-review"]
            .iter()
            .any(|l| labels_lower.iter().any(|have| have == l))
        {
            return PoolType::Review;
        }
        if ["linear", "triage", "planning"]
            .iter()
            .any(|l| labels_lower.iter().any(|have| have == l))
        {
            return PoolType::Linear;
        }
        PoolType::Coding
    }
}
