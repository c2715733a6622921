//! Exchange relay configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::retry::RetryConfig;
use crate::config::{positive, ConfigError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Relay `host:port`. The server binds it, clients connect to it.
    pub address: String,
    /// Transitions per worker push.
    pub samples_per_push: usize,
    /// Capacity of the worker-side channel between the acting loop and its link.
    pub worker_queue: usize,
    /// Relay backlog; the oldest transitions are dropped beyond it.
    pub max_pending_samples: usize,
    /// Upper bound on transitions returned by one pull.
    pub max_pull_samples: usize,
    /// How often a worker link asks for new weights.
    pub weights_poll_ms: u64,
    /// Trainer link pause after an empty sample pull.
    pub samples_poll_ms: u64,
    /// Socket read/write timeout for a single request.
    pub io_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub retry: RetryConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:55555".to_string(),
            samples_per_push: 1000,
            worker_queue: 10_000,
            max_pending_samples: 100_000,
            max_pull_samples: 10_000,
            weights_poll_ms: 1_000,
            samples_poll_ms: 100,
            io_timeout_ms: 10_000,
            max_frame_bytes: 256 * 1024 * 1024,
            retry: RetryConfig::default(),
        }
    }
}

impl ExchangeConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_samples_per_push(mut self, n: usize) -> Self {
        self.samples_per_push = n;
        self
    }

    pub fn with_max_pending_samples(mut self, n: usize) -> Self {
        self.max_pending_samples = n;
        self
    }

    pub fn with_weights_poll_ms(mut self, ms: u64) -> Self {
        self.weights_poll_ms = ms;
        self
    }

    pub fn with_samples_poll_ms(mut self, ms: u64) -> Self {
        self.samples_poll_ms = ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn weights_poll(&self) -> Duration {
        Duration::from_millis(self.weights_poll_ms)
    }

    pub fn samples_poll(&self) -> Duration {
        Duration::from_millis(self.samples_poll_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("samples_per_push", self.samples_per_push)?;
        positive("worker_queue", self.worker_queue)?;
        positive("max_pending_samples", self.max_pending_samples)?;
        positive("max_pull_samples", self.max_pull_samples)?;
        positive("max_frame_bytes", self.max_frame_bytes)?;
        positive("io_timeout_ms", self.io_timeout_ms as usize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ExchangeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.samples_per_push, 1000);
        assert_eq!(config.retry.initial_ms, 100);
    }

    #[test]
    fn test_partial_json() {
        let config: ExchangeConfig =
            serde_json::from_str(r#"{"address": "10.0.0.2:4000", "retry": {"max_ms": 1000}}"#).unwrap();
        assert_eq!(config.address, "10.0.0.2:4000");
        assert_eq!(config.retry.max_ms, 1000);
        assert_eq!(config.retry.factor, 2.0);
        assert_eq!(config.samples_per_push, 1000);
    }

    #[test]
    fn test_zero_push_size_rejected() {
        assert!(ExchangeConfig::default().with_samples_per_push(0).validate().is_err());
    }
}
