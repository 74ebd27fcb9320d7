/// Master election across the configured store nodes
///
/// Every node may carry a master pointer key. A reachable node holding the
/// pointer with the largest remaining TTL (compared in milliseconds) wins,
/// with ties kept by the current master; otherwise the first reachable node
/// without a pointer does. The winner rewrites its pointer
/// with a fresh, effectively unbounded TTL, so a freshly elected master
/// keeps winning later rounds instead of flapping back to an older claim.
use super::{Node, NodeRegistry};
use crate::error::StoreResult;
use crate::store::KeyTtl;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Ten years; the pointer is replaced by elections, never by expiry
pub const MASTER_POINTER_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ElectorSettings {
    pub master_key: String,
    pub pointer_ttl: Duration,
}

impl Default for ElectorSettings {
    fn default() -> Self {
        Self {
            master_key: "primary".to_string(),
            pointer_ttl: MASTER_POINTER_TTL,
        }
    }
}

/// What a node said about the master pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Vacant,
    Claimed { remaining: Duration },
}

pub struct Elector {
    registry: Arc<NodeRegistry>,
    settings: ElectorSettings,
    master: RwLock<Option<Arc<Node>>>,
    elections: AtomicU64,
}

impl Elector {
    pub fn new(registry: Arc<NodeRegistry>, settings: ElectorSettings) -> Self {
        Self {
            registry,
            settings,
            master: RwLock::new(None),
            elections: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Node currently used for every remote call
    pub async fn current_master(&self) -> Option<Arc<Node>> {
        self.master.read().await.clone()
    }

    pub async fn master_descriptor(&self) -> Option<String> {
        self.master.read().await.as_ref().map(|n| n.descriptor())
    }

    /// Number of completed election rounds
    pub fn election_count(&self) -> u64 {
        self.elections.load(Ordering::SeqCst)
    }

    async fn probe(&self, node: &Node) -> StoreResult<Probe> {
        let client = node.client();
        let key = &self.settings.master_key;

        if client.get(key).await?.is_none() {
            return Ok(Probe::Vacant);
        }
        let probe = match client.ttl(key).await? {
            KeyTtl::Expires(remaining) => Probe::Claimed { remaining },
            KeyTtl::Persistent => Probe::Claimed {
                remaining: Duration::MAX,
            },
            // Expired between GET and TTL
            KeyTtl::Missing => Probe::Vacant,
        };
        Ok(probe)
    }

    /// Run one election round and adopt the winner as master.
    ///
    /// Returns the winner's descriptor, or `None` when no node answered.
    pub async fn elect(&self, cause: &str) -> Option<String> {
        let nodes = self.registry.nodes().await;
        info!(cause = %cause, candidates = nodes.len(), "Starting master election");

        let probes = join_all(nodes.iter().map(|node| self.probe(node))).await;
        let current = self.current_master().await;
        let is_current = |node: &Arc<Node>| current.as_ref().map_or(false, |m| Arc::ptr_eq(m, node));

        let mut first_available: Option<&Arc<Node>> = None;
        let mut incumbent: Option<(&Arc<Node>, Duration)> = None;
        for (node, probe) in nodes.iter().zip(probes) {
            match probe {
                Err(e) => {
                    warn!(node = %node.name(), error = %e, "Skipping unreachable node");
                }
                Ok(Probe::Vacant) => {
                    debug!(node = %node.name(), "Node holds no master pointer");
                    if first_available.is_none() {
                        first_available = Some(node);
                    }
                }
                Ok(Probe::Claimed { remaining }) => {
                    debug!(node = %node.name(), remaining_ms = remaining.as_millis() as u64, "Node holds master pointer");
                    let better = incumbent.map_or(true, |(_, best)| {
                        remaining > best || (remaining == best && is_current(node))
                    });
                    if better {
                        incumbent = Some((node, remaining));
                    }
                }
            }
        }

        let winner = incumbent.map(|(node, _)| node).or(first_available).cloned();
        self.elections.fetch_add(1, Ordering::SeqCst);

        let winner = match winner {
            Some(winner) => winner,
            None => {
                error!(cause = %cause, "Election failed: no store node is reachable");
                *self.master.write().await = None;
                return None;
            }
        };

        let descriptor = winner.descriptor();
        if let Err(e) = winner
            .client()
            .set_ex(&self.settings.master_key, &descriptor, self.settings.pointer_ttl)
            .await
        {
            warn!(node = %winner.name(), error = %e, "Elected master could not refresh its pointer");
        }

        let previous = self.master.write().await.replace(Arc::clone(&winner));
        match previous {
            Some(prev) if Arc::ptr_eq(&prev, &winner) => {
                debug!(master = %descriptor, "Master unchanged");
            }
            _ => info!(master = %descriptor, node = %winner.name(), "Master elected"),
        }

        Some(descriptor)
    }
}
