/// Flash sale inventory
///
/// Each item is a hash at `flash_sale:<item_id>` with the fields `status`,
/// `total`, `limit` and `booked`. Allocation reads and increments inside one
/// script; a request is granted in full or not at all.
use super::{absorb_no_master, integer_reply, require_non_empty};
use crate::error::{CerrojoError, CerrojoResult};
use crate::executor::RetryingExecutor;
use crate::health::{probe_master, HealthCheck, HealthStatus, PingCheck};
use crate::store::scripts::ACQUIRE_QUOTA;
use std::sync::Arc;
use tracing::{debug, info};

const FIELDS: [&str; 4] = ["status", "total", "limit", "booked"];

/// Snapshot of one sale item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSaleItem {
    pub item_id: String,
    pub enabled: bool,
    pub total: i64,
    /// Largest amount a single request may take
    pub limit: i64,
    pub booked: i64,
}

impl FlashSaleItem {
    pub fn remaining(&self) -> i64 {
        self.total - self.booked
    }
}

pub fn item_key(item_id: &str) -> String {
    format!("flash_sale:{}", item_id)
}

pub struct QuotaAllocator {
    executor: Arc<RetryingExecutor>,
    health: Arc<dyn HealthCheck>,
}

impl QuotaAllocator {
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

    /// Create or reset an item. It starts disabled with nothing booked.
    pub async fn init(&self, item_id: &str, total: i64, limit: i64) -> CerrojoResult<()> {
        require_non_empty("item id", item_id)?;
        if total < 0 || limit < 1 {
            return Err(CerrojoError::invalid_argument(format!(
                "invalid quota for {}: total={} limit={}",
                item_id, total, limit
            )));
        }

        let key = item_key(item_id);
        let fields = [
            ("status", "0".to_string()),
            ("total", total.to_string()),
            ("limit", limit.to_string()),
            ("booked", "0".to_string()),
        ];
        let result = self
            .executor
            .execute("quota_init", true, |client| {
                let (key, fields) = (&key, &fields);
                async move { client.hset(key, fields).await }
            })
            .await;
        absorb_no_master("quota_init", result, ())?;
        info!(item = %item_id, total, limit, "Flash sale item initialized");
        Ok(())
    }

    pub async fn enable(&self, item_id: &str, on: bool) -> CerrojoResult<()> {
        require_non_empty("item id", item_id)?;

        let key = item_key(item_id);
        let fields = [("status", if on { "1" } else { "0" }.to_string())];
        let result = self
            .executor
            .execute("quota_enable", true, |client| {
                let (key, fields) = (&key, &fields);
                async move { client.hset(key, fields).await }
            })
            .await;
        absorb_no_master("quota_enable", result, ())?;
        info!(item = %item_id, enabled = on, "Flash sale item toggled");
        Ok(())
    }

    /// Book `order` units. Returns `order` when granted, 0 when rejected.
    pub async fn acquire(&self, item_id: &str, order: i64) -> CerrojoResult<i64> {
        require_non_empty("item id", item_id)?;

        let key = item_key(item_id);
        let args = [order.to_string()];
        let result = self
            .executor
            .execute("quota_acquire", true, |client| {
                let (key, args) = (&key, &args);
                async move {
                    let reply = client.eval(&ACQUIRE_QUOTA, &[key.as_str()], args).await?;
                    integer_reply("EVAL acquire_quota", reply)
                }
            })
            .await;
        let granted = absorb_no_master("quota_acquire", result, 0)?;
        debug!(item = %item_id, order, granted, "acquire quota");
        Ok(granted)
    }

    /// Give back `amount` units and return the new booked count.
    ///
    /// No lower bound is enforced; revoking more than was booked drives
    /// `booked` negative.
    pub async fn revoke(&self, item_id: &str, amount: i64) -> CerrojoResult<i64> {
        require_non_empty("item id", item_id)?;

        let key = item_key(item_id);
        let result = self
            .executor
            .execute("quota_revoke", true, |client| {
                let key = &key;
                async move { client.hincr_by(key, "booked", -amount).await }
            })
            .await;
        let booked = absorb_no_master("quota_revoke", result, 0)?;
        debug!(item = %item_id, amount, booked, "revoke quota");
        Ok(booked)
    }

    /// Current state of the item, `None` if it is missing or malformed
    pub async fn report(&self, item_id: &str) -> CerrojoResult<Option<FlashSaleItem>> {
        require_non_empty("item id", item_id)?;

        let key = item_key(item_id);
        let result = self
            .executor
            .execute("quota_report", true, |client| {
                let key = &key;
                async move { client.hmget(key, &FIELDS).await }
            })
            .await;
        let values = absorb_no_master("quota_report", result, Vec::new())?;

        let numbers: Option<Vec<i64>> = values
            .iter()
            .map(|v| v.as_deref().and_then(|v| v.parse().ok()))
            .collect();
        let item = match numbers.as_deref() {
            Some(&[status, total, limit, booked]) => Some(FlashSaleItem {
                item_id: item_id.to_string(),
                enabled: status == 1,
                total,
                limit,
                booked,
            }),
            _ => None,
        };
        Ok(item)
    }

    pub fn health_check(&self) -> Arc<dyn HealthCheck> {
        Arc::clone(&self.health)
    }

    pub async fn health(&self) -> HealthStatus {
        probe_master(self.executor.elector(), self.health.as_ref()).await
    }
}
