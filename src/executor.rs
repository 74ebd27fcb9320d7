/// Bounded retry around every remote call
///
/// Each attempt runs against the current master. A connection-level failure
/// (or having no master at all) asks the failover worker for a new election
/// before the next attempt; data-level failures are retried without one.
use crate::cluster::{Elector, FailoverHandle};
use crate::config::RetryConfig;
use crate::error::{CerrojoError, CerrojoResult, StoreResult};
use crate::store::StoreClient;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            backoff: Duration::from_millis(500),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Total attempts for one call
    pub fn attempts(&self, retry: bool) -> u32 {
        if retry {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }
}

pub struct RetryingExecutor {
    elector: Arc<Elector>,
    failover: FailoverHandle,
    policy: RetryPolicy,
}

impl RetryingExecutor {
    pub fn new(elector: Arc<Elector>, failover: FailoverHandle, policy: RetryPolicy) -> Self {
        Self {
            elector,
            failover,
            policy,
        }
    }

    pub fn elector(&self) -> &Arc<Elector> {
        &self.elector
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn failover(&self) -> &FailoverHandle {
        &self.failover
    }

    /// Run `call` against the current master, retrying per the policy.
    ///
    /// Returns the last error once every attempt has failed.
    pub async fn execute<T, F, Fut>(&self, operation: &str, retry: bool, call: F) -> CerrojoResult<T>
    where
        F: Fn(Arc<dyn StoreClient>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let attempts = self.policy.attempts(retry);
        let mut last_error = CerrojoError::NoMaster;

        for attempt in 1..=attempts {
            match self.elector.current_master().await {
                None => {
                    warn!(operation = %operation, attempt, "No master available");
                    self.failover.trigger("no master available");
                    last_error = CerrojoError::NoMaster;
                }
                Some(master) => match call(master.client()).await {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_connection() => {
                        warn!(operation = %operation, attempt, node = %master.name(), error = %e, "Connection to master failed");
                        self.failover
                            .trigger(&format!("{} failed on {}: {}", operation, master.descriptor(), e));
                        last_error = CerrojoError::Store(e);
                    }
                    Err(e) => {
                        warn!(operation = %operation, attempt, error = %e, "Store rejected the call");
                        last_error = CerrojoError::Store(e);
                    }
                },
            }

            if attempt < attempts {
                debug!(operation = %operation, backoff_ms = self.policy.backoff.as_millis() as u64, "Retrying");
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        error!(operation = %operation, attempts, error = %last_error, "Giving up");
        Err(last_error)
    }
}
