//! Pipeline definitions and the save retry policy.
//!
//! A pipeline is a fixed, ordered list of step names. The default provider
//! pipeline is `auth → model_select → call`; custom executors bring their own.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::events::ERROR_SUFFIX;
use crate::error::{CheckpointError, Result};

pub const STEP_AUTH: &str = "auth";
pub const STEP_MODEL_SELECT: &str = "model_select";
pub const STEP_CALL: &str = "call";

/// An ordered step sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    /// Pipeline name (shown in logs)
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Step names, executed in order
    pub steps: Vec<String>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            name: "provider".to_string(),
            description: "Authenticate, pick a model, call the provider".to_string(),
            steps: vec![
                STEP_AUTH.to_string(),
                STEP_MODEL_SELECT.to_string(),
                STEP_CALL.to_string(),
            ],
        }
    }
}

impl Pipeline {
    /// A named pipeline over the given steps
    pub fn new(name: impl Into<String>, steps: &[&str]) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(CheckpointError::validation(
                "PIPELINE_EMPTY",
                format!("pipeline '{}' has no steps", self.name),
            ));
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.trim().is_empty() {
                return Err(CheckpointError::validation(
                    "STEP_NAME_EMPTY",
                    format!("step {} has an empty name", i),
                ));
            }
            if step.ends_with(ERROR_SUFFIX) {
                return Err(CheckpointError::validation(
                    "STEP_NAME_RESERVED",
                    format!("step '{}' uses the reserved '{}' suffix", step, ERROR_SUFFIX),
                ));
            }
            if self.steps[..i].contains(step) {
                return Err(CheckpointError::validation(
                    "STEP_NAME_DUPLICATE",
                    format!("step '{}' appears more than once", step),
                ));
            }
        }

        Ok(())
    }

    /// Get the index of a step by name
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s == name)
    }

    /// Index of the first step still to run after `last_step` completed.
    ///
    /// An empty `last_step` means nothing has completed yet.
    pub fn resume_index(&self, run_id: &str, last_step: &str) -> Result<usize> {
        if last_step.is_empty() {
            return Ok(0);
        }
        self.step_index(last_step)
            .map(|i| i + 1)
            .ok_or_else(|| CheckpointError::UnknownStep {
                run_id: run_id.to_string(),
                step: last_step.to_string(),
            })
    }
}

/// Retry policy for transient persistence failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    100
}
fn default_max_delay() -> u64 {
    2000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pipeline() {
        let pipeline = Pipeline::default();
        assert_eq!(pipeline.steps, vec!["auth", "model_select", "call"]);
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_custom_pipeline() {
        let pipeline = Pipeline::new("etl", &["extract", "load"]);

        assert_eq!(pipeline.name, "etl");
        assert!(pipeline.validate().is_ok());
        assert_eq!(pipeline.step_index("load"), Some(1));
        assert_eq!(pipeline.resume_index("R1", "extract").unwrap(), 1);
    }

    #[test]
    fn test_duplicate_and_reserved_names_rejected() {
        let dup = Pipeline {
            steps: vec!["a".into(), "b".into(), "a".into()],
            ..Default::default()
        };
        assert_eq!(dup.validate().unwrap_err().code(), "STEP_NAME_DUPLICATE");

        let reserved = Pipeline {
            steps: vec!["call_error".into()],
            ..Default::default()
        };
        assert_eq!(reserved.validate().unwrap_err().code(), "STEP_NAME_RESERVED");

        let empty = Pipeline {
            steps: vec![],
            ..Default::default()
        };
        assert_eq!(empty.validate().unwrap_err().code(), "PIPELINE_EMPTY");
    }

    #[test]
    fn test_resume_index() {
        let pipeline = Pipeline::default();
        assert_eq!(pipeline.resume_index("R1", "").unwrap(), 0);
        assert_eq!(pipeline.resume_index("R1", "auth").unwrap(), 1);
        assert_eq!(pipeline.resume_index("R1", "call").unwrap(), 3);

        let err = pipeline.resume_index("R1", "publish").unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_RUN_STATE");
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_retry_policy_from_partial_yaml() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 100);
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!RetryPolicy::none().should_retry(1));
    }
}
