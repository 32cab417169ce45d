//! Analysis configuration.

use std::time::Duration;

use chrono::TimeDelta;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::detector::DetectorConfig;
use ft_common::Error;

/// Retry policy for contended store commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> ft_common::Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be >= 1".into()));
        }
        if self.base_backoff_ms == 0 {
            return Err(Error::Config("retry base_backoff_ms must be >= 1".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(Error::Config(
                "retry max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Exponential backoff with full jitter, capped at the maximum.
    /// `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        let floor = self.base_backoff_ms.min(ceiling);
        let jittered = rand::rng().random_range(floor..=ceiling);
        Duration::from_millis(jittered)
    }
}

/// Top-level tuning for the analysis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Verdicts ingested per checkpointed batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_hot_buffer_capacity")]
    pub hot_buffer_capacity: usize,

    #[serde(default = "default_cold_buffer_capacity")]
    pub cold_buffer_capacity: usize,

    /// Cap on stored finalized segments per branch.
    #[serde(default = "default_max_finalized_segments")]
    pub max_finalized_segments: usize,

    /// Age horizon for finalized segments and statistics buckets.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Window for the exported "has recent unexpected results" flag.
    #[serde(default = "default_recent_unexpected_days")]
    pub recent_unexpected_days: i64,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_batch_size() -> usize {
    1000
}

fn default_hot_buffer_capacity() -> usize {
    100
}

fn default_cold_buffer_capacity() -> usize {
    2000
}

fn default_max_finalized_segments() -> usize {
    100
}

fn default_retention_days() -> i64 {
    1825
}

fn default_recent_unexpected_days() -> i64 {
    90
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            hot_buffer_capacity: default_hot_buffer_capacity(),
            cold_buffer_capacity: default_cold_buffer_capacity(),
            max_finalized_segments: default_max_finalized_segments(),
            retention_days: default_retention_days(),
            recent_unexpected_days: default_recent_unexpected_days(),
            detector: DetectorConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> ft_common::Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be >= 1".into()));
        }
        if self.hot_buffer_capacity == 0 {
            return Err(Error::Config("hot_buffer_capacity must be >= 1".into()));
        }
        if self.cold_buffer_capacity < self.hot_buffer_capacity {
            return Err(Error::Config(
                "cold_buffer_capacity must be >= hot_buffer_capacity".into(),
            ));
        }
        if self.max_finalized_segments == 0 {
            return Err(Error::Config("max_finalized_segments must be >= 1".into()));
        }
        if self.retention_days <= 0 {
            return Err(Error::Config("retention_days must be positive".into()));
        }
        if self.recent_unexpected_days <= 0 {
            return Err(Error::Config(
                "recent_unexpected_days must be positive".into(),
            ));
        }
        self.detector.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    pub fn retention(&self) -> TimeDelta {
        TimeDelta::days(self.retention_days)
    }

    pub fn recent_unexpected_window(&self) -> TimeDelta {
        TimeDelta::days(self.recent_unexpected_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AnalysisConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_values() {
        let mut config = AnalysisConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.cold_buffer_capacity = config.hot_buffer_capacity - 1;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.retry.max_backoff_ms = 1;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.detector.min_segment_verdicts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: AnalysisConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.hot_buffer_capacity, 100);
        assert_eq!(config.cold_buffer_capacity, 2000);
        assert_eq!(config.max_finalized_segments, 100);
        assert_eq!(config.retention_days, 1825);
        assert_eq!(config.recent_unexpected_days, 90);
        assert_eq!(config.detector.min_log_bayes_factor, 5.0);
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn partial_overrides_keep_the_rest() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"batch_size": 50, "detector": {"min_log_bayes_factor": 9.0}}"#)
                .unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.detector.min_log_bayes_factor, 9.0);
        assert_eq!(config.detector.min_segment_verdicts, 1);
        assert_eq!(config.cold_buffer_capacity, 2000);
    }

    #[test]
    fn backoff_is_jittered_and_capped() {
        let retry = RetryConfig::default();
        for attempt in 1..=10 {
            let delay = retry.backoff(attempt).as_millis() as u64;
            assert!(delay >= retry.base_backoff_ms.min(retry.max_backoff_ms));
            assert!(delay <= retry.max_backoff_ms);
        }
    }

    #[test]
    fn first_attempt_backoff_is_the_base() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1).as_millis() as u64, retry.base_backoff_ms);
    }
}
