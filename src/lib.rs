pub mod cluster;
pub mod config;
pub mod coordination;
pub mod error;
pub mod executor;
pub mod health;
pub mod store;
pub mod utils;
/// cerrojo - distributed coordination over Redis-compatible store replicas
///
/// One node among the configured replicas is elected master and serves
/// every call. On top of it cerrojo offers:
/// 1. Locks: token-owned, expiring mutual exclusion with atomic release
/// 2. Throttling: a token bucket evaluated by one server-side script
/// 3. Quotas: all-or-nothing flash sale inventory allocation
/// 4. Blacklist: revoked-token cache, remote or in process
///
/// Lost connections trigger a background re-election, and every call is
/// retried with a fixed backoff within a bounded budget.
pub use error::{CerrojoError, CerrojoResult};

use crate::cluster::{
    AlertSink, Elector, ElectorSettings, FailoverNotifier, FailoverWorker, LogAlertSink, NoDecryptor, NodeRegistry,
    SecretDecryptor,
};
use crate::config::{Config, StoreConfig};
use crate::coordination::{build_blacklist, Blacklist, DistributedLock, QuotaAllocator, RateLimiter};
use crate::executor::{RetryPolicy, RetryingExecutor};
use crate::health::{HealthCheck, HealthMonitor, HealthStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Owns the node registry, the elector, the failover worker and the
/// capabilities built on them.
pub struct Coordinator {
    config: Config,
    registry: Arc<NodeRegistry>,
    elector: Arc<Elector>,
    executor: Arc<RetryingExecutor>,
    monitor: Arc<HealthMonitor>,
    lock: DistributedLock,
    rate_limiter: RateLimiter,
    quota: QuotaAllocator,
    blacklist: Arc<dyn Blacklist>,
    failover_task: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Connect to the configured nodes with plain-text credentials only and
    /// alerts written to the log
    pub async fn connect(config: Config) -> CerrojoResult<Self> {
        Self::connect_with(config, &NoDecryptor, Arc::new(LogAlertSink)).await
    }

    pub async fn connect_with(
        config: Config,
        decryptor: &dyn SecretDecryptor,
        sink: Arc<dyn AlertSink>,
    ) -> CerrojoResult<Self> {
        config.validate()?;
        let registry = Arc::new(NodeRegistry::from_config(&config.store, decryptor)?);
        Ok(Self::from_registry(config, registry, sink).await)
    }

    /// Build every component over an existing registry and run the first
    /// election. A failed first election is not fatal; the first call will
    /// request another one.
    pub async fn from_registry(config: Config, registry: Arc<NodeRegistry>, sink: Arc<dyn AlertSink>) -> Self {
        let settings = ElectorSettings {
            master_key: config.store.master_key.clone(),
            ..Default::default()
        };
        let elector = Arc::new(Elector::new(Arc::clone(&registry), settings));
        match elector.elect("startup").await {
            Some(master) => info!(master = %master, "Coordinator started"),
            None => warn!("Coordinator started without a master"),
        }

        let notifier = Arc::new(FailoverNotifier::new(
            sink,
            Duration::from_secs(config.failover.alert_interval_sec),
        ));
        let (failover, failover_task) = FailoverWorker::spawn(Arc::clone(&elector), notifier);
        let executor = Arc::new(RetryingExecutor::new(
            Arc::clone(&elector),
            failover,
            RetryPolicy::from(&config.retry),
        ));

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&elector),
            Duration::from_secs(config.health.interval_sec),
            Duration::from_secs(config.health.timeout_sec),
        ));

        Self {
            lock: DistributedLock::new(Arc::clone(&executor)),
            rate_limiter: RateLimiter::new(Arc::clone(&executor)),
            quota: QuotaAllocator::new(Arc::clone(&executor)),
            blacklist: build_blacklist(&config.blacklist, Arc::clone(&executor)),
            config,
            registry,
            elector,
            executor,
            monitor,
            failover_task: Some(failover_task),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn elector(&self) -> &Arc<Elector> {
        &self.elector
    }

    pub fn executor(&self) -> &Arc<RetryingExecutor> {
        &self.executor
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn quota(&self) -> &QuotaAllocator {
        &self.quota
    }

    pub fn blacklist(&self) -> &Arc<dyn Blacklist> {
        &self.blacklist
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Descriptor of the current master
    pub async fn master(&self) -> Option<String> {
        self.elector.master_descriptor().await
    }

    /// Health check strategies of the store-backed capabilities
    pub fn health_checks(&self) -> Vec<(String, Arc<dyn HealthCheck>)> {
        vec![
            ("lock".to_string(), self.lock.health_check()),
            ("rate_limiter".to_string(), self.rate_limiter.health_check()),
            ("quota".to_string(), self.quota.health_check()),
        ]
    }

    /// Run every capability's health check once
    pub async fn health(&self) -> Vec<(String, HealthStatus)> {
        let mut results = self.monitor.check_all(&self.health_checks()).await;
        let blacklist = match tokio::time::timeout(
            Duration::from_secs(self.config.health.timeout_sec),
            self.blacklist.health(),
        )
        .await
        {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };
        results.push(("blacklist".to_string(), blacklist));
        results
    }

    /// Rebuild the node set and elect again
    pub async fn reload(&self, store: &StoreConfig, decryptor: &dyn SecretDecryptor) -> CerrojoResult<Option<String>> {
        self.registry.reload(store, decryptor).await?;
        Ok(self.elector.elect("configuration reload").await)
    }

    /// Stop the failover worker. Calls made afterwards still run but no
    /// longer trigger elections.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.failover_task.take() {
            task.abort();
            info!("Coordinator shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.failover_task.is_some()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::config::{BlacklistBackend, ConfigError};
    use crate::coordination::ThrottleSpec;
    use crate::store::{MemoryStore, StoreClient};

    fn memory_registry(count: usize) -> (Vec<Arc<MemoryStore>>, Arc<NodeRegistry>) {
        let stores: Vec<Arc<MemoryStore>> = (0..count).map(|_| Arc::new(MemoryStore::new())).collect();
        let nodes = stores
            .iter()
            .enumerate()
            .map(|(i, store)| {
                let client: Arc<dyn StoreClient> = store.clone();
                Node::new(format!("node{}", i + 1), format!("10.0.0.{}", i + 1), 6379, client)
            })
            .collect();
        (stores, Arc::new(NodeRegistry::new(nodes)))
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.retry.backoff_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_coordinator_elects_on_start() {
        let (_stores, registry) = memory_registry(3);
        let coordinator = Coordinator::from_registry(fast_config(), registry, Arc::new(LogAlertSink)).await;

        assert_eq!(coordinator.master().await, Some("10.0.0.1:6379".to_string()));
        assert!(coordinator.is_running());
    }

    #[tokio::test]
    async fn test_capabilities_share_master() {
        let (stores, registry) = memory_registry(2);
        let coordinator = Coordinator::from_registry(fast_config(), registry, Arc::new(LogAlertSink)).await;

        assert!(coordinator.lock().try_lock("job", "t", Duration::from_secs(30)).await.unwrap());
        coordinator.quota().init("sku", 5, 5).await.unwrap();
        coordinator.quota().enable("sku", true).await.unwrap();
        assert_eq!(coordinator.quota().acquire("sku", 5).await.unwrap(), 5);

        let spec = ThrottleSpec::new(1, 1, Duration::from_secs(60)).unwrap();
        assert!(coordinator.rate_limiter().throttle("api", &spec, 1).await.unwrap().is_allowed());

        coordinator.blacklist().blacklist("jti", "x", Duration::from_secs(60)).await.unwrap();
        assert!(stores[0].get("jti").await.unwrap().is_some());
        assert!(stores[1].get("jti").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_calls_survive_master_loss() {
        let (stores, registry) = memory_registry(2);
        let coordinator = Coordinator::from_registry(fast_config(), registry, Arc::new(LogAlertSink)).await;
        stores[0].set_reachable(false);

        assert!(coordinator.lock().try_lock("job", "t", Duration::from_secs(30)).await.unwrap());
        assert_eq!(coordinator.master().await, Some("10.0.0.2:6379".to_string()));
        assert_eq!(stores[1].get("job").await.unwrap(), Some("t".to_string()));
    }

    #[tokio::test]
    async fn test_health_reports_every_capability() {
        let (stores, registry) = memory_registry(1);
        let mut config = fast_config();
        config.blacklist.backend = BlacklistBackend::Local;
        let coordinator = Coordinator::from_registry(config, registry, Arc::new(LogAlertSink)).await;

        let results = coordinator.health().await;
        let names: Vec<&str> = results.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["lock", "rate_limiter", "quota", "blacklist"]);
        assert!(results.iter().all(|(_, status)| status.is_healthy()));

        stores[0].set_reachable(false);
        let results = coordinator.health().await;
        assert!(!results[0].1.is_healthy());
        // the local blacklist does not depend on the store
        assert!(results[3].1.is_healthy());
    }

    #[tokio::test]
    async fn test_reload_replaces_nodes() {
        let (_stores, registry) = memory_registry(1);
        let coordinator = Coordinator::from_registry(fast_config(), registry, Arc::new(LogAlertSink)).await;

        let mut store = StoreConfig::default();
        store.nodes.insert("bad".to_string(), "ENC(x)@10.0.0.9:6379".to_string());
        let err = coordinator.reload(&store, &NoDecryptor).await.unwrap_err();
        assert!(matches!(err, CerrojoError::Config(ConfigError::ValidationError(_))));
        assert_eq!(coordinator.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let mut config = Config::default();
        config.store.nodes.clear();
        assert!(matches!(
            Coordinator::connect(config).await,
            Err(CerrojoError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (_stores, registry) = memory_registry(1);
        let mut coordinator = Coordinator::from_registry(fast_config(), registry, Arc::new(LogAlertSink)).await;
        coordinator.shutdown();
        assert!(!coordinator.is_running());
        coordinator.shutdown();
    }
}
