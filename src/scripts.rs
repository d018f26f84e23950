//! Lua scripts run server-side by the Redis backend.
//!
//! Both scripts compare the stored token with the caller's token and act in
//! the same atomic step, so an expiry followed by another instance's acquire
//! can never slip between the read and the write.

/// KEYS[1] = lock key, ARGV[1] = ownership token.
/// Returns 1 if the record was deleted, 0 otherwise.
pub const RELEASE_LOCK: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// KEYS[1] = lock key, ARGV[1] = ownership token, ARGV[2] = TTL in milliseconds.
/// Returns 1 if the expiry was refreshed, 0 otherwise.
pub const EXTEND_LOCK: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;
