/// Lua scripts executed atomically on the master node
///
/// Every invariant that needs a read followed by a write lives in one of
/// these, so no other client can observe or act between the two steps.
/// `MemoryStore` recognizes them by name and runs the same logic natively.

/// A named server-side script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    pub name: &'static str,
    pub source: &'static str,
}

/// KEYS[1] = lock name, ARGV[1] = ownership token.
/// Returns 1 when the lock was deleted, 0 otherwise.
pub const RELEASE_LOCK: Script = Script {
    name: "release_lock",
    source: r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#,
};

/// KEYS[1] = flash sale item hash, ARGV[1] = requested amount.
/// Returns the granted amount, 0 when rejected.
pub const ACQUIRE_QUOTA: Script = Script {
    name: "acquire_quota",
    source: r#"
local order = tonumber(ARGV[1])
if order == nil or order < 1 then
    return 0
end
local fields = redis.call('HMGET', KEYS[1], 'status', 'total', 'limit', 'booked')
local status = tonumber(fields[1])
local total = tonumber(fields[2])
local limit = tonumber(fields[3])
local booked = tonumber(fields[4])
if status == nil or total == nil or limit == nil or booked == nil then
    return 0
end
if status ~= 1 or order > limit or booked + order > total then
    return 0
end
redis.call('HINCRBY', KEYS[1], 'booked', order)
return order
"#,
};

/// KEYS[1] = limiter name, ARGV = burst, max burst per period, period
/// seconds, requested quota. Returns -1 when allowed, otherwise the whole
/// seconds to wait before retrying.
pub const THROTTLE: Script = Script {
    name: "throttle",
    source: r#"
local capacity = tonumber(ARGV[1])
local per_period = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local quota = tonumber(ARGV[4])
local rate = per_period / period
local now = redis.call('TIME')
local now_ms = tonumber(now[1]) * 1000 + math.floor(tonumber(now[2]) / 1000)
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now_ms
end
tokens = math.min(capacity, tokens + math.max(0, now_ms - ts) / 1000 * rate)
local wait = -1
if quota <= tokens then
    tokens = tokens - quota
else
    wait = math.ceil((quota - tokens) / rate)
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(now_ms))
redis.call('EXPIRE', KEYS[1], math.ceil(capacity / rate) + 1)
return wait
"#,
};

/// Reply of THROTTLE meaning "allowed now"
pub const THROTTLE_ALLOWED: i64 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_names_are_distinct() {
        let names = [RELEASE_LOCK.name, ACQUIRE_QUOTA.name, THROTTLE.name];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_release_lock_compares_before_delete() {
        let get = RELEASE_LOCK.source.find("GET").unwrap();
        let del = RELEASE_LOCK.source.find("DEL").unwrap();
        assert!(get < del);
    }
}
