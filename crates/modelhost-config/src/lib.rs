//! Host configuration: memory budget, loader retry policy, eviction weight,
//! credit tiers, queue options and the model catalog.
//!
//! Stored as a JSON file. Every field has a default, so a partial file (or
//! no file at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use modelhost_types::{HostError, ModelCategory, Priority, SubscriptionTier, GB, MB};

/// What to do when eviction cannot free enough memory for a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OvercommitPolicy {
    /// Fail the load; the waiting job ends in `Error`.
    Reject,
    /// Load anyway and run over the ceiling until something is released.
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub ceiling_bytes: u64,
    /// Fraction of the ceiling at which proactive eviction starts.
    pub warning_threshold: f64,
    pub overcommit: OvercommitPolicy,
    pub monitor_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: 8 * GB,
            warning_threshold: 0.85,
            overcommit: OvercommitPolicy::Reject,
            monitor_interval_secs: 30,
        }
    }
}

impl MemoryConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_unit_secs * 2^n`.
    pub backoff_unit_secs: u64,
    /// Models at or above this footprint are acquired in chunks.
    pub progressive_threshold_bytes: u64,
    pub default_chunk_size_bytes: u64,
    /// How long a failed load is served from cache before a new attempt is allowed.
    pub failure_cooldown_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_unit_secs: 1,
            progressive_threshold_bytes: 256 * MB,
            default_chunk_size_bytes: 16 * MB,
            failure_cooldown_secs: 30,
        }
    }
}

impl LoaderConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_secs(self.backoff_unit_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// How many milliseconds of recency one recorded use is worth.
    pub use_count_weight_ms: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            use_count_weight_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub initial_balance: u64,
    pub tier: SubscriptionTier,
    /// Maximum balance per tier.
    pub tier_limits: BTreeMap<SubscriptionTier, u64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let tier_limits = BTreeMap::from([
            (SubscriptionTier::Free, 100),
            (SubscriptionTier::Standard, 1_000),
            (SubscriptionTier::Premium, 10_000),
        ]);
        Self {
            initial_balance: 100,
            tier: SubscriptionTier::Free,
            tier_limits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deadline for a single operation; unset means wait forever.
    pub operation_timeout_secs: Option<u64>,
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: None,
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }
}

/// One model in the catalog as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub category: ModelCategory,
    pub footprint_bytes: u64,
    /// Defaults to `footprint_bytes`.
    #[serde(default)]
    pub required_memory_bytes: Option<u64>,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default = "default_max_users")]
    pub max_concurrent_users: u32,
    #[serde(default)]
    pub has_fallback: bool,
    #[serde(default)]
    pub chunk_size_bytes: Option<u64>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

fn default_max_users() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub memory: MemoryConfig,
    pub loader: LoaderConfig,
    pub eviction: EvictionConfig,
    pub ledger: LedgerConfig,
    pub queue: QueueConfig,
    pub models: Vec<ModelConfig>,
    pub database_path: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            loader: LoaderConfig::default(),
            eviction: EvictionConfig::default(),
            ledger: LedgerConfig::default(),
            queue: QueueConfig::default(),
            models: Vec::new(),
            database_path: "assets/modelhost.db".to_string(),
        }
    }
}

impl HostConfig {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), HostError> {
        let threshold = self.memory.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(HostError::Config(format!(
                "memory.warning_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.memory.ceiling_bytes == 0 {
            return Err(HostError::Config("memory.ceiling_bytes must be > 0".into()));
        }
        if self.loader.default_chunk_size_bytes == 0 {
            return Err(HostError::Config(
                "loader.default_chunk_size_bytes must be > 0".into(),
            ));
        }
        for model in &self.models {
            if model.max_concurrent_users == 0 {
                return Err(HostError::Config(format!(
                    "model {} must allow at least one concurrent user",
                    model.name
                )));
            }
            if model.chunk_size_bytes == Some(0) {
                return Err(HostError::Config(format!(
                    "model {} has a zero chunk size",
                    model.name
                )));
            }
        }
        if !self.ledger.tier_limits.contains_key(&self.ledger.tier) {
            return Err(HostError::Config(format!(
                "no balance limit configured for tier {}",
                self.ledger.tier
            )));
        }
        Ok(())
    }
}

/// Parse and validate a config from a JSON string.
pub fn parse_config(json: &str) -> Result<HostConfig, HostError> {
    let config: HostConfig = serde_json::from_str(json)
        .map_err(|e| HostError::Config(format!("Failed to parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a JSON file. A missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<HostConfig, HostError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(HostConfig::default());
    }
    let json = std::fs::read_to_string(path)
        .map_err(|e| HostError::Config(format!("Failed to read {}: {e}", path.display())))?;
    parse_config(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.loader.max_retries, 3);
        assert_eq!(config.memory.warning_threshold, 0.85);
        assert_eq!(config.memory.overcommit, OvercommitPolicy::Reject);
        assert_eq!(config.queue.operation_timeout(), None);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(
            r#"{
                "memory": { "ceiling_bytes": 104857600 },
                "models": [
                    { "name": "esrgan", "category": "image", "footprint_bytes": 62914560,
                      "priority": "low", "has_fallback": true }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.memory.ceiling_bytes, 100 * MB);
        assert_eq!(config.memory.warning_threshold, 0.85);
        assert_eq!(config.loader.backoff_unit(), Duration::from_secs(1));

        let model = &config.models[0];
        assert_eq!(model.priority, Priority::Low);
        assert_eq!(model.max_concurrent_users, 1);
        assert_eq!(model.required_memory_bytes, None);
        assert!(model.has_fallback);
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let err = parse_config(r#"{ "memory": { "warning_threshold": 1.5 } }"#).unwrap_err();
        assert!(matches!(err, HostError::Config(msg) if msg.contains("warning_threshold")));
    }

    #[test]
    fn test_rejects_zero_user_models() {
        let err = parse_config(
            r#"{ "models": [ { "name": "m", "category": "text", "footprint_bytes": 1,
                 "max_concurrent_users": 0 } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, HostError::Config(_)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config("definitely/not/here.json").unwrap();
        assert!(config.models.is_empty());
        assert_eq!(config.ledger.tier, SubscriptionTier::Free);
    }
}
