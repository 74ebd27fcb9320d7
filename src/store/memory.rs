/// In-process store node
///
/// Implements every `StoreClient` operation over a mutex-guarded map. A read
/// evicts the key it touches once expired, and writes sweep the whole map
/// at most once per `SWEEP_INTERVAL`. Scripts run under the same lock, which gives them the
/// all-or-nothing behavior they have on a real server. Reachability can be
/// toggled and failures injected, so failover paths can be exercised
/// without a network.
use super::resp::RespValue;
use super::scripts::{Script, ACQUIRE_QUOTA, RELEASE_LOCK, THROTTLE};
use super::{ttl_millis, KeyTtl, StoreClient};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Minimum spacing between full sweeps of expired keys
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Expiry instant for a key written at `now`. Lifetimes past what the clock
/// can represent are clamped to a century.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    let ttl = Duration::from_millis(ttl_millis(ttl));
    now.checked_add(ttl)
        .or_else(|| now.checked_add(Duration::from_secs(100 * 365 * 24 * 60 * 60)))
        .unwrap_or(now)
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(Vec<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: FnvHashMap<String, Entry>,
    next_sweep: Option<Instant>,
}

impl MemoryState {
    /// Drop every expired key, unless a sweep ran less than
    /// `SWEEP_INTERVAL` ago
    fn sweep(&mut self, now: Instant) {
        if self.next_sweep.map_or(false, |at| now < at) {
            return;
        }
        self.next_sweep = Some(expiry(now, SWEEP_INTERVAL));

        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        if self.entries.len() != before {
            debug!(evicted = before - self.entries.len(), "Swept expired keys");
        }
    }

    /// Live entry for `key`, evicting it first if it has expired
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= now
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn string(&mut self, key: &str, now: Instant) -> StoreResult<Option<String>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash(&mut self, key: &str, now: Instant) -> StoreResult<&mut HashMap<String, String>> {
        if self.live(key, now).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h),
            _ => Err(wrong_type()),
        }
    }

    fn hash_fields(&mut self, key: &str, fields: &[&str], now: Instant) -> StoreResult<Vec<Option<String>>> {
        match self.live(key, now) {
            None => Ok(vec![None; fields.len()]),
            Some(Entry { value: Value::Hash(h), .. }) => {
                Ok(fields.iter().map(|f| h.get(*f).cloned()).collect())
            }
            Some(_) => Err(wrong_type()),
        }
    }

    fn hincr_by(&mut self, key: &str, field: &str, delta: i64, now: Instant) -> StoreResult<i64> {
        let hash = self.hash(key, now)?;
        let current = match hash.get(field) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| StoreError::command("HINCRBY", "ERR hash value is not an integer"))?,
            None => 0,
        };
        let updated = current + delta;
        hash.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    fn zset(&mut self, key: &str, now: Instant) -> StoreResult<Option<&mut Vec<(i64, String)>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::ZSet(z), .. }) => Ok(Some(z)),
            Some(_) => Err(wrong_type()),
        }
    }
}

fn wrong_type() -> StoreError {
    StoreError::command(
        "WRONGTYPE",
        "Operation against a key holding the wrong kind of value",
    )
}

/// `StoreClient` kept entirely in process memory
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    reachable: AtomicBool,
    injected_failures: AtomicU32,
    calls: AtomicU64,
    epoch: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            reachable: AtomicBool::new(true),
            injected_failures: AtomicU32::new(0),
            calls: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Simulate the node going away (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Make the next `n` calls fail with a connection error
    pub fn fail_next(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Number of calls that reached this node, failed ones included
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of stored keys, including expired ones not evicted yet
    pub fn stored_key_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Number of keys that have not expired yet
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        let state = self.lock();
        state
            .entries
            .values()
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for a write, sweeping expired keys first
    fn lock_for_write(&self, now: Instant) -> MutexGuard<'_, MemoryState> {
        let mut state = self.lock();
        state.sweep(now);
        state
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_reachable() {
            return Err(StoreError::connection("memory node is unreachable"));
        }
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::connection("injected connection failure"));
        }
        Ok(())
    }

    fn now_ms(&self, now: Instant) -> i64 {
        now.duration_since(self.epoch).as_millis() as i64
    }

    fn release_lock(state: &mut MemoryState, keys: &[&str], args: &[String], now: Instant) -> StoreResult<RespValue> {
        let (key, token) = match (keys.first(), args.first()) {
            (Some(key), Some(token)) => (*key, token),
            _ => return Err(StoreError::command("EVAL", "ERR release_lock needs 1 key and 1 arg")),
        };
        if state.string(key, now)?.as_deref() == Some(token.as_str()) {
            state.entries.remove(key);
            Ok(RespValue::Integer(1))
        } else {
            Ok(RespValue::Integer(0))
        }
    }

    fn acquire_quota(state: &mut MemoryState, keys: &[&str], args: &[String], now: Instant) -> StoreResult<RespValue> {
        let key = match keys.first() {
            Some(key) => *key,
            None => return Err(StoreError::command("EVAL", "ERR acquire_quota needs 1 key")),
        };
        let order = match args.first().and_then(|a| a.parse::<i64>().ok()) {
            Some(order) if order >= 1 => order,
            _ => return Ok(RespValue::Integer(0)),
        };

        let fields = state.hash_fields(key, &["status", "total", "limit", "booked"], now)?;
        let numbers: Option<Vec<i64>> = fields
            .iter()
            .map(|f| f.as_deref().and_then(|v| v.parse().ok()))
            .collect();
        let (status, total, limit, booked) = match numbers.as_deref() {
            Some(&[status, total, limit, booked]) => (status, total, limit, booked),
            _ => return Ok(RespValue::Integer(0)),
        };

        if status != 1 || order > limit || booked + order > total {
            return Ok(RespValue::Integer(0));
        }
        state.hincr_by(key, "booked", order, now)?;
        Ok(RespValue::Integer(order))
    }

    fn throttle(&self, state: &mut MemoryState, keys: &[&str], args: &[String], now: Instant) -> StoreResult<RespValue> {
        let parsed: Option<Vec<f64>> = args.iter().map(|a| a.parse::<f64>().ok()).collect();
        let (key, capacity, per_period, period, quota) = match (keys.first(), parsed.as_deref()) {
            (Some(key), Some(&[capacity, per_period, period, quota])) if per_period > 0.0 && period > 0.0 => {
                (*key, capacity, per_period, period, quota)
            }
            _ => return Err(StoreError::command("EVAL", "ERR invalid throttle arguments")),
        };
        let rate = per_period / period;
        let now_ms = self.now_ms(now);

        let stored = state.hash_fields(key, &["tokens", "ts"], now)?;
        let (tokens, ts) = match (
            stored[0].as_deref().and_then(|v| v.parse::<f64>().ok()),
            stored[1].as_deref().and_then(|v| v.parse::<i64>().ok()),
        ) {
            (Some(tokens), Some(ts)) => (tokens, ts),
            _ => (capacity, now_ms),
        };

        let elapsed_secs = (now_ms - ts).max(0) as f64 / 1000.0;
        let mut tokens = (tokens + elapsed_secs * rate).min(capacity);
        let wait = if quota <= tokens {
            tokens -= quota;
            -1
        } else {
            ((quota - tokens) / rate).ceil() as i64
        };

        let hash = state.hash(key, now)?;
        hash.insert("tokens".to_string(), tokens.to_string());
        hash.insert("ts".to_string(), now_ms.to_string());
        let ttl = Duration::from_secs(((capacity / rate).ceil() as u64).saturating_add(1));
        if let Some(entry) = state.entries.get_mut(key) {
            entry.expires_at = Some(expiry(now, ttl));
        }
        Ok(RespValue::Integer(wait))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.lock().string(key, Instant::now())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        let now = Instant::now();
        let expires_at = expiry(now, ttl);
        self.lock_for_write(now).entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock_for_write(now);
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(expiry(now, ttl)),
            },
        );
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        self.check()?;
        let now = Instant::now();
        let ttl = match self.lock().live(key, now) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry { expires_at: Some(at), .. }) => {
                // PTTL truncates to whole milliseconds
                let remaining = at.duration_since(now).as_millis();
                KeyTtl::Expires(Duration::from_millis(u64::try_from(remaining).unwrap_or(u64::MAX)))
            }
        };
        Ok(ttl)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.lock().live(key, Instant::now()).is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock();
        let existed = state.live(key, now).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        match self.lock_for_write(now).live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(expiry(now, ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock_for_write(now);
        let hash = state.hash(key, now)?;
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>> {
        self.check()?;
        self.lock().hash_fields(key, fields, Instant::now())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.check()?;
        let now = Instant::now();
        self.lock_for_write(now).hincr_by(key, field, delta, now)
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock_for_write(now);
        match state.zset(key, now)? {
            Some(zset) => {
                zset.retain(|(_, m)| m != member);
                zset.push((score, member.to_string()));
            }
            None => {
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::ZSet(vec![(score, member.to_string())]),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.check()?;
        let mut state = self.lock();
        match state.zset(key, Instant::now())? {
            Some(zset) => {
                let before = zset.len();
                zset.retain(|(score, _)| *score < min || *score > max);
                Ok((before - zset.len()) as u64)
            }
            None => Ok(0),
        }
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.check()?;
        let mut state = self.lock();
        Ok(state
            .zset(key, Instant::now())?
            .map_or(0, |zset| zset.len() as u64))
    }

    async fn eval(&self, script: &Script, keys: &[&str], args: &[String]) -> StoreResult<RespValue> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock_for_write(now);

        if *script == RELEASE_LOCK {
            Self::release_lock(&mut state, keys, args, now)
        } else if *script == ACQUIRE_QUOTA {
            Self::acquire_quota(&mut state, keys, args, now)
        } else if *script == THROTTLE {
            self.throttle(&mut state, keys, args, now)
        } else {
            Err(StoreError::command(
                "EVAL",
                format!("NOSCRIPT unknown script {}", script.name),
            ))
        }
    }
}
