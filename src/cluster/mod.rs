/// Store replica nodes, master election and failover
pub mod elector;
pub mod failover;

pub use elector::{Elector, ElectorSettings};
pub use failover::{AlertSink, FailoverHandle, FailoverNotifier, FailoverWorker, LogAlertSink};

use crate::config::{ConfigError, StoreConfig};
use crate::store::connection::PoolSettings;
use crate::store::{RespClient, StoreClient};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Credential part of a node entry
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    Plain(String),
    /// `ENC(...)` wrapper, decrypted by a `SecretDecryptor` before use
    Encrypted(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => write!(f, "None"),
            Credential::Plain(_) => write!(f, "Plain(***)"),
            Credential::Encrypted(_) => write!(f, "Encrypted(***)"),
        }
    }
}

/// Parsed `<credential>@<host>:<port>` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub credential: Credential,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let entry = entry.trim();
        // The credential may itself contain '@', the host part never does
        let (credential, host_port) = entry.rsplit_once('@').unwrap_or(("", entry));

        let (host, port) = host_port.rsplit_once(':').ok_or_else(|| {
            ConfigError::ValidationError(format!("missing port in '{}'", host_port))
        })?;
        if host.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "missing host in '{}'",
                host_port
            )));
        }
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ConfigError::ValidationError(format!("invalid port '{}'", port)))?;

        let credential = if credential.is_empty() {
            Credential::None
        } else if let Some(inner) = credential
            .strip_prefix("ENC(")
            .and_then(|c| c.strip_suffix(')'))
        {
            Credential::Encrypted(inner.to_string())
        } else {
            Credential::Plain(credential.to_string())
        };

        Ok(Self {
            credential,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, also used as the node descriptor
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Turns `ENC(...)` credentials into plain text
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, ConfigError>;
}

/// Decryptor used when none is configured; refuses encrypted credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDecryptor;

impl SecretDecryptor for NoDecryptor {
    fn decrypt(&self, _ciphertext: &str) -> Result<String, ConfigError> {
        Err(ConfigError::ValidationError(
            "encrypted credential found but no decryptor is configured".to_string(),
        ))
    }
}

/// One store replica
pub struct Node {
    name: String,
    host: String,
    port: u16,
    client: Arc<dyn StoreClient>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl Node {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, client: Arc<dyn StoreClient>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            client,
        }
    }

    /// Build a RESP-backed node from a configuration entry
    pub fn from_entry(
        name: &str,
        entry: &str,
        settings: &PoolSettings,
        decryptor: &dyn SecretDecryptor,
    ) -> Result<Self, ConfigError> {
        let address = NodeAddress::parse(entry)?;
        let credential = match &address.credential {
            Credential::None => None,
            Credential::Plain(secret) => Some(secret.clone()),
            Credential::Encrypted(ciphertext) => Some(decryptor.decrypt(ciphertext)?),
        };

        let client = RespClient::new(address.addr(), credential, settings.clone());
        Ok(Self::new(name, address.host, address.port, Arc::new(client)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque descriptor written into the master pointer
    pub fn descriptor(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client(&self) -> Arc<dyn StoreClient> {
        Arc::clone(&self.client)
    }
}

/// Configured candidate nodes, in ascending name order
pub struct NodeRegistry {
    nodes: RwLock<Vec<Arc<Node>>>,
}

impl NodeRegistry {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(Arc::new).collect()),
        }
    }

    /// Build every node named in the store configuration
    pub fn from_config(config: &StoreConfig, decryptor: &dyn SecretDecryptor) -> Result<Self, ConfigError> {
        Ok(Self::new(Self::build_nodes(config, decryptor)?))
    }

    fn build_nodes(config: &StoreConfig, decryptor: &dyn SecretDecryptor) -> Result<Vec<Node>, ConfigError> {
        let settings = PoolSettings {
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            max_idle: config.pool_size,
        };

        // BTreeMap iteration gives ascending name order
        config
            .nodes
            .iter()
            .map(|(name, entry)| Node::from_entry(name, entry, &settings, decryptor))
            .collect()
    }

    /// Rebuild the node set after a configuration reload
    pub async fn reload(&self, config: &StoreConfig, decryptor: &dyn SecretDecryptor) -> Result<(), ConfigError> {
        let nodes = Self::build_nodes(config, decryptor)?;
        self.replace(nodes).await;
        Ok(())
    }

    pub async fn replace(&self, nodes: Vec<Node>) {
        let mut current = self.nodes.write().await;
        *current = nodes.into_iter().map(Arc::new).collect();
        tracing::info!("Node registry now holds {} node(s)", current.len());
    }

    /// Snapshot of the current node set
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .await
            .iter()
            .find(|n| n.name == name)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct ReverseDecryptor;

    impl SecretDecryptor for ReverseDecryptor {
        fn decrypt(&self, ciphertext: &str) -> Result<String, ConfigError> {
            Ok(ciphertext.chars().rev().collect())
        }
    }

    #[test]
    fn test_parse_node_address() {
        let addr = NodeAddress::parse("s3cret@10.0.0.1:6379").unwrap();
        assert_eq!(addr.credential, Credential::Plain("s3cret".to_string()));
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 6379);
        assert_eq!(addr.addr(), "10.0.0.1:6379");
    }

    #[test]
    fn test_parse_credential_variants() {
        assert_eq!(
            NodeAddress::parse("@redis.local:6380").unwrap().credential,
            Credential::None
        );
        assert_eq!(
            NodeAddress::parse("redis.local:6380").unwrap().credential,
            Credential::None
        );
        assert_eq!(
            NodeAddress::parse("p@ss@host:1").unwrap().credential,
            Credential::Plain("p@ss".to_string())
        );
        assert_eq!(
            NodeAddress::parse("ENC(abc)@host:1").unwrap().credential,
            Credential::Encrypted("abc".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(NodeAddress::parse("pw@host").is_err());
        assert!(NodeAddress::parse("pw@:6379").is_err());
        assert!(NodeAddress::parse("pw@host:0").is_err());
        assert!(NodeAddress::parse("pw@host:99999").is_err());
    }

    #[test]
    fn test_credential_debug_hides_secret() {
        let rendered = format!("{:?}", Credential::Plain("hunter2".to_string()));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_encrypted_credential_needs_decryptor() {
        let settings = PoolSettings::default();
        assert!(Node::from_entry("a", "ENC(x)@h:1", &settings, &NoDecryptor).is_err());
        assert!(Node::from_entry("a", "ENC(x)@h:1", &settings, &ReverseDecryptor).is_ok());
    }

    #[tokio::test]
    async fn test_registry_from_config_is_ordered() {
        let mut config = StoreConfig::default();
        config.nodes.clear();
        config.nodes.insert("zeta".to_string(), "@10.0.0.3:6379".to_string());
        config.nodes.insert("alpha".to_string(), "@10.0.0.1:6379".to_string());
        config.nodes.insert("mid".to_string(), "@10.0.0.2:6379".to_string());

        let registry = NodeRegistry::from_config(&config, &NoDecryptor).unwrap();
        let names: Vec<String> = registry
            .nodes()
            .await
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(
            registry.get("mid").await.unwrap().descriptor(),
            "10.0.0.2:6379"
        );
    }

    #[tokio::test]
    async fn test_example_config_builds_without_decryptor() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        crate::config::Config::create_example_config(temp_file.path()).unwrap();
        let config = crate::config::Config::load_from_file(temp_file.path()).unwrap();

        let registry = NodeRegistry::from_config(&config.store, &NoDecryptor).unwrap();
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn test_registry_replace() {
        let registry = NodeRegistry::new(vec![Node::new(
            "a",
            "10.0.0.1",
            6379,
            Arc::new(MemoryStore::new()),
        )]);
        assert_eq!(registry.len().await, 1);

        registry
            .replace(vec![
                Node::new("b", "10.0.0.2", 6379, Arc::new(MemoryStore::new())),
                Node::new("c", "10.0.0.3", 6379, Arc::new(MemoryStore::new())),
            ])
            .await;
        assert_eq!(registry.len().await, 2);
        assert!(registry.get("a").await.is_none());
    }
}
