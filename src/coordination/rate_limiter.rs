/// Request throttling
///
/// `RateLimiter` runs a token bucket inside one script call. The sorted-set
/// sliding window below it is the older approach, kept for callers that
/// still depend on its counting semantics.
use super::{absorb_no_master, integer_reply, require_non_empty};
use crate::error::{CerrojoError, CerrojoResult, StoreError};
use crate::executor::RetryingExecutor;
use crate::health::{probe_master, HealthCheck, HealthStatus, PingCheck};
use crate::store::scripts::{THROTTLE, THROTTLE_ALLOWED};
use crate::utils::now_unix_ms;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Token bucket shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSpec {
    /// Bucket capacity, also the initial allowance
    pub burst: u32,
    /// Tokens added back per period
    pub max_per_period: u32,
    pub period: Duration,
}

impl ThrottleSpec {
    pub fn new(burst: u32, max_per_period: u32, period: Duration) -> CerrojoResult<Self> {
        if burst == 0 || max_per_period == 0 {
            return Err(CerrojoError::invalid_argument(
                "burst and max_per_period must be greater than 0",
            ));
        }
        if period.as_secs() == 0 {
            return Err(CerrojoError::invalid_argument("period must be at least one second"));
        }
        Ok(Self {
            burst,
            max_per_period,
            period,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    /// Retry after this long
    Wait(Duration),
}

impl ThrottleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ThrottleDecision::Allowed)
    }

    fn from_reply(reply: i64) -> Result<Self, StoreError> {
        match reply {
            THROTTLE_ALLOWED => Ok(ThrottleDecision::Allowed),
            secs if secs >= 0 => Ok(ThrottleDecision::Wait(Duration::from_secs(secs as u64))),
            other => Err(StoreError::unexpected("EVAL throttle", other)),
        }
    }
}

pub struct RateLimiter {
    executor: Arc<RetryingExecutor>,
    health: Arc<dyn HealthCheck>,
}

impl RateLimiter {
    pub fn new(executor: Arc<RetryingExecutor>) -> Self {
        Self {
            executor,
            health: Arc::new(PingCheck),
        }
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health = check;
        self
    }

    /// Take `quota` tokens from the bucket named `name`
    pub async fn throttle(&self, name: &str, spec: &ThrottleSpec, quota: u32) -> CerrojoResult<ThrottleDecision> {
        require_non_empty("limiter name", name)?;
        if quota == 0 {
            return Err(CerrojoError::invalid_argument("quota must be greater than 0"));
        }
        if quota > spec.burst {
            return Err(CerrojoError::invalid_argument(format!(
                "quota {} exceeds burst {} and could never be granted",
                quota, spec.burst
            )));
        }

        let args = [
            spec.burst.to_string(),
            spec.max_per_period.to_string(),
            spec.period.as_secs().to_string(),
            quota.to_string(),
        ];
        let result = self
            .executor
            .execute("throttle", true, |client| {
                let args = &args;
                async move {
                    let reply = client.eval(&THROTTLE, &[name], args).await?;
                    ThrottleDecision::from_reply(integer_reply("EVAL throttle", reply)?)
                }
            })
            .await;

        let decision = absorb_no_master("throttle", result, ThrottleDecision::Allowed)?;
        debug!(limiter = %name, ?decision, "throttle");
        Ok(decision)
    }

    pub fn health_check(&self) -> Arc<dyn HealthCheck> {
        Arc::clone(&self.health)
    }

    pub async fn health(&self) -> HealthStatus {
        probe_master(self.executor.elector(), self.health.as_ref()).await
    }
}

/// Counts events in a trailing window with a sorted set of timestamps.
///
/// Insert, prune and count are separate round trips, so concurrent callers
/// can over-admit, and the set grows with event volume. Low rates only.
#[deprecated(note = "not atomic under concurrency; use RateLimiter::throttle")]
pub struct SlidingWindowLimiter {
    executor: Arc<RetryingExecutor>,
}

#[allow(deprecated)]
impl SlidingWindowLimiter {
    pub fn new(executor: Arc<RetryingExecutor>) -> Self {
        Self { executor }
    }

    /// Record one event and return how many fall inside `window`,
    /// this one included.
    pub async fn record(&self, name: &str, window: Duration) -> CerrojoResult<u64> {
        require_non_empty("limiter name", name)?;

        let now = now_unix_ms();
        let member = format!("{}-{:x}", now, rand::random::<u32>());
        let oldest_kept = now - window.as_millis() as i64;

        let result = self
            .executor
            .execute("sliding_window", false, |client| {
                let member = &member;
                async move {
                    client.zadd(name, now, member).await?;
                    client.zrem_range_by_score(name, i64::MIN, oldest_kept - 1).await?;
                    let count = client.zcard(name).await?;
                    client.expire(name, window).await?;
                    Ok::<_, StoreError>(count)
                }
            })
            .await;
        absorb_no_master("sliding_window", result, 0)
    }

    /// Record one event; true while the window holds at most `limit` events
    pub async fn allow(&self, name: &str, window: Duration, limit: u64) -> CerrojoResult<bool> {
        Ok(self.record(name, window).await? <= limit)
    }
}
