//! Engine configuration.
//!
//! Every field has a default, so an empty TOML table is a valid config.
//! Durations are stored as milliseconds and exposed as [`Duration`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::InstanceId;
use crate::queue::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("parsing TOML config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Stable claim owner. Generated at startup when absent, in which case
    /// claims left by a crashed run are not recovered.
    pub instance_id: Option<String>,

    pub lookahead_ms: u64,

    /// Tasks due within `lookahead * safety_coefficient` are claimed at
    /// creation. Must be > 1.
    pub safety_coefficient: f64,

    /// Maximum collections claimed per poll.
    pub search_batch_size: usize,
    pub preload_workers: usize,

    /// Events drained per waiter wake-up before the timer is re-armed.
    pub drain_limit: usize,

    pub batch_max_items: usize,
    pub batch_timeout_ms: u64,
    pub confirm_workers: usize,

    pub delivery_workers: usize,
    pub redelivery_delay_ms: u64,

    pub collection_capacity: usize,
    pub cleaning_frequency: u64,

    pub max_retry: u32,
    pub retry_delay_ms: u64,

    /// Capacity of every internal queue.
    pub queue_capacity: usize,

    pub metrics_period_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            lookahead_ms: 5_000,
            safety_coefficient: 1.5,
            search_batch_size: 1_000,
            preload_workers: 4,
            drain_limit: 16,
            batch_max_items: 1_000,
            batch_timeout_ms: 50,
            confirm_workers: 4,
            delivery_workers: 8,
            redelivery_delay_ms: 1_000,
            collection_capacity: 500,
            cleaning_frequency: 100,
            max_retry: 5,
            retry_delay_ms: 100,
            queue_capacity: 100_000,
            metrics_period_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document holding only engine settings.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safety_coefficient.is_nan() || self.safety_coefficient <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "safety_coefficient must be > 1, got {}",
                self.safety_coefficient
            )));
        }
        if self.lookahead_ms == 0 {
            return Err(ConfigError::Invalid("lookahead_ms must be > 0".into()));
        }

        let non_zero = [
            ("search_batch_size", self.search_batch_size),
            ("preload_workers", self.preload_workers),
            ("drain_limit", self.drain_limit),
            ("batch_max_items", self.batch_max_items),
            ("confirm_workers", self.confirm_workers),
            ("delivery_workers", self.delivery_workers),
            ("collection_capacity", self.collection_capacity),
            ("queue_capacity", self.queue_capacity),
            ("cleaning_frequency", self.cleaning_frequency as usize),
            ("max_retry", self.max_retry as usize),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be > 0")));
        }

        if let Some(id) = &self.instance_id
            && (id.is_empty() || id.len() > 64)
        {
            return Err(ConfigError::Invalid(
                "instance_id must be 1..=64 characters".into(),
            ));
        }
        Ok(())
    }

    /// Configured instance id, or a fresh one.
    pub fn resolve_instance_id(&self) -> InstanceId {
        self.instance_id
            .as_deref()
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::generate)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    /// Relative deadline below which a new task is claimed at creation.
    pub fn safety_window(&self) -> Duration {
        self.lookahead().mul_f64(self.safety_coefficient)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn metrics_period(&self) -> Duration {
        Duration::from_millis(self.metrics_period_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry, Duration::from_millis(self.retry_delay_ms))
    }
}
