/// Non-blocking mutual exclusion keyed by name
///
/// The lock value is the caller's ownership token. Release compares and
/// deletes in one script, so an owner whose lock already expired and was
/// taken by someone else cannot delete the new holder's lock.
use super::{absorb_no_master, integer_reply, require_non_empty};
use crate::error::CerrojoResult;
use crate::executor::RetryingExecutor;
use crate::health::{probe_master, ExpiryProbeCheck, HealthCheck, HealthStatus};
use crate::store::scripts::RELEASE_LOCK;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct DistributedLock {
    executor: Arc<RetryingExecutor>,
    health: Arc<dyn HealthCheck>,
}

impl DistributedLock {
    pub fn new(executor: Arc<RetryingExecutor>) -> Self {
        Self {
            executor,
            health: Arc::new(ExpiryProbeCheck::new("lock-health", Duration::from_secs(5))),
        }
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health = check;
        self
    }

    /// Single attempt to take `name` for `ttl`. Never waits for the lock.
    pub async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> CerrojoResult<bool> {
        require_non_empty("lock name", name)?;
        require_non_empty("lock token", token)?;

        let result = self
            .executor
            .execute("try_lock", true, |client| async move { client.set_nx_ex(name, token, ttl).await })
            .await;
        let acquired = absorb_no_master("try_lock", result, false)?;
        debug!(lock = %name, acquired, "try_lock");
        Ok(acquired)
    }

    /// Release `name` if it is still held with `token`
    pub async fn unlock(&self, name: &str, token: &str) -> CerrojoResult<bool> {
        require_non_empty("lock name", name)?;

        let args = [token.to_string()];
        let result = self
            .executor
            .execute("unlock", true, |client| {
                let args = &args;
                async move {
                    let reply = client.eval(&RELEASE_LOCK, &[name], args).await?;
                    integer_reply("EVAL release_lock", reply)
                }
            })
            .await;
        let released = absorb_no_master("unlock", result.map(|n| n == 1), false)?;
        debug!(lock = %name, released, "unlock");
        Ok(released)
    }

    /// True when the event `name` was already seen within the last
    /// `ttl_minutes`, i.e. the lock could not be taken.
    pub async fn debounced(&self, name: &str, token: &str, ttl_minutes: u64) -> CerrojoResult<bool> {
        let ttl = Duration::from_secs(ttl_minutes.saturating_mul(60));
        Ok(!self.try_lock(name, token, ttl).await?)
    }

    pub fn health_check(&self) -> Arc<dyn HealthCheck> {
        Arc::clone(&self.health)
    }

    pub async fn health(&self) -> HealthStatus {
        probe_master(self.executor.elector(), self.health.as_ref()).await
    }
}
