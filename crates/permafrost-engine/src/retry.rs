//! Bounded retry with per-operation named policies
//!
//! Each wrapped operation is identified by name (e.g. `events-Archive`) and
//! resolved against a default policy plus optional per-name overrides. Which
//! failures are worth retrying is pluggable; the default classification
//! retries deadlock victims and dropped connections, and nothing else.
//! Cancellation is never retried and the backoff sleep itself is cancellable.

use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ArchiveError, Result};

const MAX_RETRY_COUNT_LIMIT: u32 = 10;
const MAX_RETRY_DELAY_SECONDS: u64 = 300;

fn default_enabled() -> bool {
    true
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    5
}

/// Retry policy for one named operation
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// `false` bypasses retry entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Retries after the initial attempt (0..=10)
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Sleep between attempts, in seconds (0..=300)
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_retry_count: default_max_retry_count(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

impl RetryPolicy {
    /// Sleep between attempts
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Check the configured bounds
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_retry_count > MAX_RETRY_COUNT_LIMIT {
            return Err(ArchiveError::config(format!(
                "retry policy '{name}': max_retry_count {} exceeds limit {MAX_RETRY_COUNT_LIMIT}",
                self.max_retry_count
            )));
        }
        if self.retry_delay_seconds > MAX_RETRY_DELAY_SECONDS {
            return Err(ArchiveError::config(format!(
                "retry policy '{name}': retry_delay_seconds {} exceeds limit {MAX_RETRY_DELAY_SECONDS}",
                self.retry_delay_seconds
            )));
        }
        Ok(())
    }
}

/// Default policy plus per-operation-name overrides
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicies {
    /// Policy applied when no override matches
    #[serde(default)]
    pub default: RetryPolicy,
    /// Per-operation-name overrides (e.g. `events-Csv`)
    #[serde(default)]
    pub overrides: HashMap<String, RetryPolicy>,
}

impl RetryPolicies {
    /// Resolve the policy for a named operation
    pub fn for_operation(&self, name: &str) -> RetryPolicy {
        self.overrides.get(name).copied().unwrap_or(self.default)
    }

    /// Validate the default and every override
    pub fn validate(&self) -> Result<()> {
        self.default.validate("default")?;
        for (name, policy) in &self.overrides {
            policy.validate(name)?;
        }
        Ok(())
    }
}

/// Decides whether a failure is worth another attempt
pub type RetryClassifier = Arc<dyn Fn(&ArchiveError) -> bool + Send + Sync>;

/// The default classification: deadlock victims and dropped connections
/// retry; query timeouts, configuration and everything else surface at once.
pub fn default_classifier() -> RetryClassifier {
    Arc::new(ArchiveError::is_retriable)
}

/// Runs operations under their named retry policy
#[derive(Clone)]
pub struct RetryExecutor {
    policies: RetryPolicies,
    classifier: RetryClassifier,
}

impl RetryExecutor {
    /// Create an executor with the default failure classification
    pub fn new(policies: RetryPolicies) -> Self {
        Self {
            policies,
            classifier: default_classifier(),
        }
    }

    /// Replace the retryable-failure classification
    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Run `op` up to `1 + max_retry_count` times under the policy named
    /// `operation`. Each attempt starts from scratch; the backoff between
    /// attempts honors `cancel`.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policies.for_operation(operation);
        let max_attempts = if policy.enabled {
            policy.max_retry_count + 1
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    if !(self.classifier)(&e) || attempt >= max_attempts {
                        return Err(e);
                    }
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                        _ = tokio::time::sleep(policy.delay()) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policies(max_retry_count: u32) -> RetryPolicies {
        RetryPolicies {
            default: RetryPolicy {
                enabled: true,
                max_retry_count,
                retry_delay_seconds: 0,
            },
            overrides: HashMap::new(),
        }
    }

    #[test]
    fn test_policy_bounds() {
        assert!(RetryPolicy::default().validate("default").is_ok());

        let over = RetryPolicy {
            enabled: true,
            max_retry_count: 11,
            retry_delay_seconds: 5,
        };
        assert!(over.validate("x").is_err());

        let slow = RetryPolicy {
            enabled: true,
            max_retry_count: 3,
            retry_delay_seconds: 301,
        };
        assert!(slow.validate("x").is_err());
    }

    #[test]
    fn test_override_resolution() {
        let mut policies = fast_policies(3);
        policies.overrides.insert(
            "events-Csv".into(),
            RetryPolicy {
                enabled: false,
                max_retry_count: 0,
                retry_delay_seconds: 0,
            },
        );

        assert!(policies.for_operation("events-Archive").enabled);
        assert!(!policies.for_operation("events-Csv").enabled);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_to_success() {
        let executor = RetryExecutor::new(fast_policies(3));
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = executor
            .execute("events-Archive", &cancel, || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ArchiveError::from(permafrost_db::Error::Deadlock))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhaust() {
        let executor = RetryExecutor::new(fast_policies(2));
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute("events-Archive", &cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ArchiveError::from(permafrost_db::Error::Deadlock))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn test_timeout_not_retried() {
        let executor = RetryExecutor::new(fast_policies(5));
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute("events-Archive", &cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ArchiveError::from(permafrost_db::Error::timeout("bulk load")))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_policy_bypasses_retry() {
        let policies = RetryPolicies {
            default: RetryPolicy {
                enabled: false,
                max_retry_count: 5,
                retry_delay_seconds: 0,
            },
            overrides: HashMap::new(),
        };
        let executor = RetryExecutor::new(policies);
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute("events-Archive", &cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ArchiveError::from(permafrost_db::Error::Deadlock))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_not_retried() {
        let executor = RetryExecutor::new(fast_policies(5));
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute("events-Archive", &cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ArchiveError::Cancelled)
            })
            .await;

        assert!(matches!(result, Err(ArchiveError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_short_circuits() {
        let executor = RetryExecutor::new(fast_policies(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = executor
            .execute("events-Archive", &cancel, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ArchiveError::Cancelled)));
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        // classify nothing as retryable
        let executor =
            RetryExecutor::new(fast_policies(5)).with_classifier(Arc::new(|_| false));
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute("events-Archive", &cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ArchiveError::from(permafrost_db::Error::Deadlock))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
