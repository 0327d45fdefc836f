use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::taskgroup::TaskGroup;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Identity of this master, also used as the host of logic tasks. Generated when absent.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_looper_count")]
    pub dispatch_looper_count: usize,

    #[serde(default)]
    pub dispatch_retry: DispatchRetryConfig,

    /// Static worker registry: worker group name to worker hosts.
    #[serde(default = "default_worker_groups")]
    pub worker_groups: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,

    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

/// Bounded exponential backoff for transient dispatch failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRetryConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: None,
            dispatch_looper_count: default_looper_count(),
            dispatch_retry: DispatchRetryConfig::default(),
            worker_groups: default_worker_groups(),
            task_groups: Vec::new(),
            redis: None,
        }
    }
}

impl Default for DispatchRetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            max_attempts: 10,
        }
    }
}

impl DispatchRetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {}", path.display()))?;
        let config: MasterConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

fn default_looper_count() -> usize {
    1
}

fn default_worker_groups() -> HashMap<String, Vec<String>> {
    HashMap::from([("default".to_string(), vec!["localhost".to_string()])])
}

fn default_key_prefix() -> String {
    "dagmaster".to_string()
}
