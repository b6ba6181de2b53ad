// SPDX-License-Identifier: GPL-3.0-only

//! Restart policy and supervisor timing

use crate::constants::timing;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay between a failure and the next start attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    Fixed { delay_ms: u64 },
    /// `initial * factor^(attempt-1)`, capped at `max`
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed {
            delay_ms: timing::BACKOFF_DELAY.as_millis() as u64,
        }
    }
}

/// How the supervisor reacts to pipeline failures
///
/// The default retries forever with a fixed delay. Setting `max_retries`
/// makes the supervisor give up and return to Stopped once the restart
/// count exceeds it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub backoff: BackoffStrategy,
    pub max_retries: Option<u32>,
}

impl RestartPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: BackoffStrategy::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Backoff before the attempt following failure number `restart_count` (1-based)
    pub fn delay_for(&self, restart_count: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Exponential {
                initial_ms,
                max_ms,
                factor,
            } => {
                let exponent = restart_count.saturating_sub(1).min(63) as i32;
                let delay = (*initial_ms as f64) * factor.powi(exponent);
                Duration::from_millis(delay.min(*max_ms as f64) as u64)
            }
        }
    }

    /// True once `restart_count` failures have used up the retry budget
    pub fn exhausted(&self, restart_count: u32) -> bool {
        self.max_retries
            .is_some_and(|max_retries| restart_count > max_retries)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let BackoffStrategy::Exponential {
            initial_ms,
            max_ms,
            factor,
        } = &self.backoff
        {
            if !factor.is_finite() || *factor < 1.0 {
                return Err(ConfigError::Invalid(
                    "exponential backoff factor must be at least 1.0".into(),
                ));
            }
            if initial_ms > max_ms {
                return Err(ConfigError::Invalid(
                    "exponential backoff initial delay exceeds its maximum".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Timing knobs for one supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorPolicy {
    pub restart: RestartPolicy,
    /// Time allowed for the first frame to reach the device
    pub startup_timeout: Duration,
    /// Continuous Running time after which `restart_count` resets
    pub stability_threshold: Duration,
    /// Graceful termination window before escalating to SIGKILL
    pub stop_grace: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            startup_timeout: timing::STARTUP_TIMEOUT,
            stability_threshold: timing::STABILITY_THRESHOLD,
            stop_grace: timing::STOP_GRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_retries_forever() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_retries, None);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(5));
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let policy = RestartPolicy {
            backoff: BackoffStrategy::Exponential {
                initial_ms: 100,
                max_ms: 1000,
                factor: 2.0,
            },
            max_retries: None,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_cap() {
        let policy = RestartPolicy::fixed(Duration::from_millis(10)).with_max_retries(2);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[test]
    fn test_policy_json_shape() {
        let policy: RestartPolicy = serde_json::from_str(
            r#"{"backoff": {"kind": "exponential", "initial_ms": 500, "max_ms": 8000, "factor": 2.0}, "max_retries": 5}"#,
        )
        .unwrap();
        assert_eq!(policy.max_retries, Some(5));
        assert!(policy.validate().is_ok());

        let bad = RestartPolicy {
            backoff: BackoffStrategy::Exponential {
                initial_ms: 10,
                max_ms: 100,
                factor: 0.5,
            },
            max_retries: None,
        };
        assert!(bad.validate().is_err());
    }
}
