/// Remote key-value store access
///
/// `StoreClient` is the seam between the coordination primitives and a
/// concrete store node. `RespClient` talks RESP to a Redis-compatible server
/// through a small connection pool; `MemoryStore` keeps everything in
/// process and runs the scripts natively.
pub mod connection;
pub mod memory;
pub mod resp;
pub mod scripts;

pub use connection::{ConnectionPool, RespClient, RespConnection};
pub use memory::MemoryStore;
pub use resp::{RespEncoder, RespParser, RespValue};
pub use scripts::Script;

use crate::error::StoreResult;
use async_trait::async_trait;
use std::time::Duration;

/// Remaining lifetime of a key as reported by PTTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (TTL -2)
    Missing,
    /// The key exists without an expiry (TTL -1)
    Persistent,
    /// The key expires after the given duration
    Expires(Duration),
}

impl KeyTtl {
    /// Decode the integer reply of PTTL
    pub fn from_reply(millis: i64) -> Self {
        match millis {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms as u64)),
        }
    }
}

/// Operations the coordination layer needs from one store node
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Round trip used by health checks
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// SET key value PX ttl
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// SET key value NX PX ttl, returns whether the key was written
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn del(&self, key: &str) -> StoreResult<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// HSET with one or more field/value pairs, applied atomically
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;

    async fn hmget(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;

    /// ZREMRANGEBYSCORE key min max (inclusive), returns removed count
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Run one of the known scripts atomically on the node
    async fn eval(&self, script: &Script, keys: &[&str], args: &[String]) -> StoreResult<RespValue>;
}

/// Milliseconds for PX/PEXPIRE arguments. Sub-millisecond remainders round
/// up so a key never expires before the requested lifetime.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis() + u128::from(ttl.subsec_nanos() % 1_000_000 != 0);
    u64::try_from(millis).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ttl_from_reply() {
        assert_eq!(KeyTtl::from_reply(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_reply(-1), KeyTtl::Persistent);
        assert_eq!(
            KeyTtl::from_reply(30_500),
            KeyTtl::Expires(Duration::from_millis(30_500))
        );
    }

    #[test]
    fn test_ttl_millis_keeps_fractions() {
        assert_eq!(ttl_millis(Duration::from_millis(1900)), 1900);
        assert_eq!(ttl_millis(Duration::from_secs(90)), 90_000);
        assert_eq!(ttl_millis(Duration::from_micros(1500)), 2);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }
}
