/// Health checking for the elected master
///
/// A `HealthCheck` is a strategy run against one store client. Each
/// coordination capability owns the strategy that suits it; the
/// `HealthMonitor` resolves the master, applies the timeout and can loop
/// over a set of named checks.
use crate::cluster::Elector;
use crate::store::{KeyTtl, StoreClient};
use crate::utils::generate_id;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Health status of the master as seen by one check
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn unhealthy(reason: impl fmt::Display) -> Self {
        HealthStatus::Unhealthy {
            reason: reason.to_string(),
        }
    }
}

/// Health check strategy
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, client: &dyn StoreClient) -> HealthStatus;
}

/// PING round trip
#[derive(Debug, Default, Clone, Copy)]
pub struct PingCheck;

#[async_trait]
impl HealthCheck for PingCheck {
    fn name(&self) -> &str {
        "ping"
    }

    async fn check(&self, client: &dyn StoreClient) -> HealthStatus {
        match client.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::unhealthy(e),
        }
    }
}

/// Writes a short-lived probe key and checks that the store kept it with
/// an expiry no longer than requested.
#[derive(Debug, Clone)]
pub struct ExpiryProbeCheck {
    prefix: String,
    ttl: Duration,
}

impl Default for ExpiryProbeCheck {
    fn default() -> Self {
        Self::new("health", Duration::from_secs(5))
    }
}

impl ExpiryProbeCheck {
    pub fn new(prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            ttl,
        }
    }
}

#[async_trait]
impl HealthCheck for ExpiryProbeCheck {
    fn name(&self) -> &str {
        "expiry-probe"
    }

    async fn check(&self, client: &dyn StoreClient) -> HealthStatus {
        let key = generate_id(&self.prefix);

        if let Err(e) = client.set_ex(&key, "1", self.ttl).await {
            return HealthStatus::unhealthy(format!("probe write failed: {}", e));
        }
        let status = match client.ttl(&key).await {
            Ok(KeyTtl::Expires(remaining)) if remaining <= self.ttl => HealthStatus::Healthy,
            Ok(other) => HealthStatus::unhealthy(format!("probe key has unexpected TTL {:?}", other)),
            Err(e) => HealthStatus::unhealthy(format!("probe TTL failed: {}", e)),
        };
        if let Err(e) = client.del(&key).await {
            tracing::debug!("Could not remove health probe {}: {}", key, e);
        }
        status
    }
}

/// Run `check` against the current master without a timeout
pub async fn probe_master(elector: &Elector, check: &dyn HealthCheck) -> HealthStatus {
    match elector.current_master().await {
        Some(master) => check.check(master.client().as_ref()).await,
        None => HealthStatus::unhealthy("no master elected"),
    }
}

pub struct HealthMonitor {
    elector: Arc<Elector>,
    interval: Duration,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(elector: Arc<Elector>, interval: Duration, timeout: Duration) -> Self {
        Self {
            elector,
            interval,
            timeout,
        }
    }

    /// Perform a health check against the master with timeout
    pub async fn check(&self, check: &dyn HealthCheck) -> HealthStatus {
        match timeout(self.timeout, probe_master(&self.elector, check)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        }
    }

    /// Run every named check once
    pub async fn check_all(&self, checks: &[(String, Arc<dyn HealthCheck>)]) -> Vec<(String, HealthStatus)> {
        let mut results = Vec::with_capacity(checks.len());
        for (name, check) in checks {
            results.push((name.clone(), self.check(check.as_ref()).await));
        }
        results
    }

    /// Check continuously until the task is dropped
    pub async fn run(&self, checks: Vec<(String, Arc<dyn HealthCheck>)>) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;

            for (name, status) in self.check_all(&checks).await {
                match status {
                    HealthStatus::Healthy => {
                        tracing::debug!("{} is healthy", name);
                    }
                    HealthStatus::Unhealthy { reason } => {
                        tracing::warn!("{} is unhealthy: {}", name, reason);
                    }
                    HealthStatus::Timeout => {
                        tracing::warn!("Health check timeout for {}", name);
                    }
                    HealthStatus::Unknown => {
                        tracing::warn!("Unknown health status for {}", name);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ElectorSettings, Node, NodeRegistry};
    use crate::store::MemoryStore;

    struct StallingCheck;

    #[async_trait]
    impl HealthCheck for StallingCheck {
        fn name(&self) -> &str {
            "stall"
        }

        async fn check(&self, _client: &dyn StoreClient) -> HealthStatus {
            tokio::time::sleep(Duration::from_secs(60)).await;
            HealthStatus::Healthy
        }
    }

    async fn elected(store: Arc<MemoryStore>) -> Arc<Elector> {
        let client: Arc<dyn StoreClient> = store;
        let registry = Arc::new(NodeRegistry::new(vec![Node::new("a", "10.0.0.1", 6379, client)]));
        let elector = Arc::new(Elector::new(registry, ElectorSettings::default()));
        elector.elect("test").await;
        elector
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy { reason: "test".to_string() }.to_string(),
            "Unhealthy: test"
        );
        assert_eq!(HealthStatus::Timeout.to_string(), "Timeout");
        assert!(!HealthStatus::Unknown.is_healthy());
    }

    #[tokio::test]
    async fn test_ping_check() {
        let store = MemoryStore::new();
        assert!(PingCheck.check(&store).await.is_healthy());

        store.set_reachable(false);
        assert!(!PingCheck.check(&store).await.is_healthy());
    }

    #[tokio::test]
    async fn test_expiry_probe_cleans_up() {
        let store = MemoryStore::new();
        let check = ExpiryProbeCheck::default();
        assert!(check.check(&store).await.is_healthy());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_without_master() {
        let client: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let registry = Arc::new(NodeRegistry::new(vec![Node::new("a", "h", 1, client)]));
        let elector = Elector::new(registry, ElectorSettings::default());

        let status = probe_master(&elector, &PingCheck).await;
        assert!(matches!(status, HealthStatus::Unhealthy { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_applies_timeout() {
        let elector = elected(Arc::new(MemoryStore::new())).await;
        let monitor = HealthMonitor::new(elector, Duration::from_secs(10), Duration::from_secs(1));

        assert_eq!(monitor.check(&StallingCheck).await, HealthStatus::Timeout);
        assert!(monitor.check(&PingCheck).await.is_healthy());
    }

    #[tokio::test]
    async fn test_check_all_reports_each_check() {
        let elector = elected(Arc::new(MemoryStore::new())).await;
        let monitor = HealthMonitor::new(elector, Duration::from_secs(10), Duration::from_secs(1));
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = vec![
            ("ping".to_string(), Arc::new(PingCheck)),
            ("probe".to_string(), Arc::new(ExpiryProbeCheck::default())),
        ];

        let results = monitor.check_all(&checks).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, status)| status.is_healthy()));
    }
}
