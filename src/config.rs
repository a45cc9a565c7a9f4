//! Daemon configuration.
//!
//! Loaded from a JSON file (see `DaemonConfig::from_file`) or built from
//! defaults. Pool names are kept as plain strings here — unknown names are
//! only diagnosed when pools are initialized, so a config written for a
//! newer daemon degrades gracefully instead of failing to parse.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::DaemonError;

/// Configuration for a single worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "PoolConfig::default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "PoolConfig::default_model")]
    pub default_model: String,
}

impl PoolConfig {
    pub fn new(min_workers: usize, max_workers: usize, default_model: &str) -> Self {
        Self {
            min_workers,
            max_workers,
            default_model: default_model.to_string(),
        }
    }

    fn default_min_workers() -> usize {
        1
    }

    fn default_max_workers() -> usize {
        3
    }

    fn default_model() -> String {
        "sonnet".to_string()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(1, 3, "sonnet")
    }
}

/// A routing rule as written in the config file. The router compiles these
/// into matchers; see [`crate::router::RoutingRule`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    #[serde(default, rename = "match")]
    pub matchers: HashMap<String, serde_json::Value>,
    #[serde(default = "RoutingRuleConfig::default_pool")]
    pub pool: String,
    #[serde(default = "RoutingRuleConfig::default_model")]
    pub model: String,
}

impl RoutingRuleConfig {
    fn default_pool() -> String {
        "coding".to_string()
    }

    fn default_model() -> String {
        "sonnet".to_string()
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "DaemonConfig::default_control_port")]
    pub control_port: u16,
    /// Seconds between dispatch rounds.
    #[serde(default = "DaemonConfig::default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds before a ticket lease expires and the ticket is reclaimable.
    #[serde(default = "DaemonConfig::default_lease_ttl")]
    pub lease_ttl: u64,
    /// When true (the default), an empty webhook queue yields a single
    /// synthetic tracker-check ticket instead of an idle round.
    #[serde(default = "DaemonConfig::default_synthetic_poll")]
    pub synthetic_poll: bool,
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRuleConfig>,
}

impl DaemonConfig {
    fn default_control_port() -> u16 {
        9100
    }

    fn default_poll_interval() -> u64 {
        30
    }

    fn default_lease_ttl() -> u64 {
        600
    }

    fn default_synthetic_poll() -> bool {
        true
    }

    /// Built-in configuration: one coding pool that can grow to three
    /// workers, single-worker review and linear pools, and the standard
    /// label/complexity rules.
    pub fn standard() -> Self {
        let mut pools = HashMap::new();
        pools.insert("coding".to_string(), PoolConfig::new(1, 3, "sonnet"));
        pools.insert("review".to_string(), PoolConfig::new(1, 1, "haiku"));
        pools.insert("linear".to_string(), PoolConfig::new(1, 1, "haiku"));

        let routing_rules = vec![
            rule(&[("labels", serde_json::json!(["review"]))], "review", "haiku"),
            rule(
                &[("labels", serde_json::json!(["linear", "triage"]))],
                "linear",
                "haiku",
            ),
            rule(&[("complexity", serde_json::json!("high"))], "coding", "opus"),
            rule(&[("complexity", serde_json::json!("low"))], "coding", "haiku"),
        ];

        Self {
            control_port: Self::default_control_port(),
            poll_interval: Self::default_poll_interval(),
            lease_ttl: Self::default_lease_ttl(),
            synthetic_poll: Self::default_synthetic_poll(),
            pools,
            routing_rules,
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: DaemonConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), DaemonError> {
        for (name, pool) in &self.pools {
            if pool.min_workers > pool.max_workers {
                return Err(DaemonError::Config(format!(
                    "pool '{}': min_workers ({}) exceeds max_workers ({})",
                    name, pool.min_workers, pool.max_workers
                )));
            }
        }
        Ok(())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::standard()
    }
}

fn rule(matchers: &[(&str, serde_json::Value)], pool: &str, model: &str) -> RoutingRuleConfig {
    RoutingRuleConfig {
        matchers: matchers
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        pool: pool.to_string(),
        model: model.to_string(),
    }
}
