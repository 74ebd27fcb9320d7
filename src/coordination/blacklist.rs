/// Revoked-token cache used by the authentication layer
///
/// `RemoteBlacklist` keeps entries on the master with a TTL. `LocalBlacklist`
/// keeps them in process and evicts expired entries with a full scan on
/// every access, which only suits small maps.
use super::{absorb_no_master, require_non_empty};
use crate::config::{BlacklistBackend, BlacklistConfig};
use crate::error::CerrojoResult;
use crate::executor::RetryingExecutor;
use crate::health::{probe_master, ExpiryProbeCheck, HealthCheck, HealthStatus};
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[async_trait]
pub trait Blacklist: Send + Sync {
    /// Blacklist `key` for `ttl`
    async fn blacklist(&self, key: &str, value: &str, ttl: Duration) -> CerrojoResult<()>;

    async fn is_blacklisted(&self, key: &str) -> CerrojoResult<bool>;

    async fn health(&self) -> HealthStatus;
}

pub struct RemoteBlacklist {
    executor: Arc<RetryingExecutor>,
    health: Arc<dyn HealthCheck>,
}

impl RemoteBlacklist {
    pub fn new(executor: Arc<RetryingExecutor>) -> Self {
        Self {
            executor,
            health: Arc::new(ExpiryProbeCheck::new("blacklist-health", Duration::from_secs(5))),
        }
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health = check;
        self
    }

    pub fn health_check(&self) -> Arc<dyn HealthCheck> {
        Arc::clone(&self.health)
    }
}

#[async_trait]
impl Blacklist for RemoteBlacklist {
    async fn blacklist(&self, key: &str, value: &str, ttl: Duration) -> CerrojoResult<()> {
        require_non_empty("blacklist key", key)?;
        let result = self
            .executor
            .execute("blacklist", true, |client| async move { client.set_ex(key, value, ttl).await })
            .await;
        absorb_no_master("blacklist", result, ())
    }

    async fn is_blacklisted(&self, key: &str) -> CerrojoResult<bool> {
        let result = self
            .executor
            .execute("is_blacklisted", true, |client| async move { client.exists(key).await })
            .await;
        absorb_no_master("is_blacklisted", result, false)
    }

    async fn health(&self) -> HealthStatus {
        probe_master(self.executor.elector(), self.health.as_ref()).await
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct LocalEntry {
    value: String,
    expires_at: Instant,
}

/// In-process blacklist
#[derive(Debug, Default)]
pub struct LocalBlacklist {
    entries: Mutex<FnvHashMap<String, LocalEntry>>,
}

impl LocalBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the map and drop everything that has expired
    fn live_entries(&self) -> MutexGuard<'_, FnvHashMap<String, LocalEntry>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.len() != before {
            debug!(evicted = before - entries.len(), "Evicted expired blacklist entries");
        }
        entries
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.live_entries().get(key).map(|e| e.value.clone())
    }

    /// Store `key` for `ttl`; lifetimes the clock cannot represent are
    /// clamped to a century
    pub fn put(&self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.live_entries().insert(
            key.to_string(),
            LocalEntry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.live_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Blacklist for LocalBlacklist {
    async fn blacklist(&self, key: &str, value: &str, ttl: Duration) -> CerrojoResult<()> {
        require_non_empty("blacklist key", key)?;
        self.put(key, value, ttl);
        Ok(())
    }

    async fn is_blacklisted(&self, key: &str) -> CerrojoResult<bool> {
        Ok(self.get(key).is_some())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

/// Blacklist for the configured backend
pub fn build_blacklist(config: &BlacklistConfig, executor: Arc<RetryingExecutor>) -> Arc<dyn Blacklist> {
    match config.backend {
        BlacklistBackend::Remote => Arc::new(RemoteBlacklist::new(executor)),
        BlacklistBackend::Local => Arc::new(LocalBlacklist::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::testing::memory_executor;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_remote_blacklist_expires() {
        let (store, executor) = memory_executor().await;
        let blacklist = RemoteBlacklist::new(executor);

        assert!(!blacklist.is_blacklisted("jti:1").await.unwrap());
        blacklist.blacklist("jti:1", "logout", Duration::from_secs(60)).await.unwrap();
        assert!(blacklist.is_blacklisted("jti:1").await.unwrap());
        assert!(store.key_count() >= 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!blacklist.is_blacklisted("jti:1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_blacklist_evicts_on_access() {
        let blacklist = LocalBlacklist::new();
        blacklist.blacklist("a", "1", Duration::from_secs(10)).await.unwrap();
        blacklist.blacklist("b", "2", HOUR).await.unwrap();
        assert_eq!(blacklist.len(), 2);
        assert_eq!(blacklist.get("a"), Some("1".to_string()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!blacklist.is_blacklisted("a").await.unwrap());
        assert!(blacklist.is_blacklisted("b").await.unwrap());
        assert_eq!(blacklist.len(), 1);
    }

    #[tokio::test]
    async fn test_local_blacklist_accepts_unbounded_ttl() {
        let blacklist = LocalBlacklist::new();
        blacklist.blacklist("jti", "forever", Duration::MAX).await.unwrap();
        assert!(blacklist.is_blacklisted("jti").await.unwrap());
    }

    #[tokio::test]
    async fn test_build_from_config() {
        let (_store, executor) = memory_executor().await;

        let local = build_blacklist(
            &BlacklistConfig {
                backend: BlacklistBackend::Local,
            },
            Arc::clone(&executor),
        );
        local.blacklist("k", "v", HOUR).await.unwrap();
        assert!(local.is_blacklisted("k").await.unwrap());
        assert!(local.health().await.is_healthy());

        let remote = build_blacklist(&BlacklistConfig::default(), executor);
        assert!(!remote.is_blacklisted("k").await.unwrap());
        assert!(remote.health().await.is_healthy());
    }

    #[tokio::test]
    async fn test_no_master_reads_as_not_blacklisted() {
        let (store, executor) = memory_executor().await;
        let blacklist = RemoteBlacklist::new(Arc::clone(&executor));
        store.set_reachable(false);
        assert_eq!(executor.elector().elect("node lost").await, None);

        assert!(!blacklist.is_blacklisted("k").await.unwrap());
        assert!(!blacklist.health().await.is_healthy());
    }
}
