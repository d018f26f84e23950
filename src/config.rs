use std::env;
use std::time::Duration;

use crate::models::{FailurePolicy, LOCK_KEY_PREFIX};

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub failure_policy: FailurePolicy,
    /// Deadline applied to every individual backing store call.
    pub op_timeout: Duration,
    pub probe_before_acquire: bool,
    pub default_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: LOCK_KEY_PREFIX.to_string(),
            failure_policy: FailurePolicy::FailOpen,
            op_timeout: Duration::from_millis(2000),
            probe_before_acquire: true,
            default_ttl: Duration::from_secs(60),
        }
    }
}

impl LockConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(LockConfig {
            redis_url: env::var("DISTLOCK_REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: env::var("DISTLOCK_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            failure_policy: match env::var("DISTLOCK_FAILURE_POLICY") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.failure_policy,
            },
            op_timeout: match env::var("DISTLOCK_OP_TIMEOUT_MS") {
                Ok(raw) => Duration::from_millis(parse_positive("DISTLOCK_OP_TIMEOUT_MS", &raw)?),
                Err(_) => defaults.op_timeout,
            },
            probe_before_acquire: match env::var("DISTLOCK_PROBE_BEFORE_ACQUIRE") {
                Ok(raw) => parse_bool("DISTLOCK_PROBE_BEFORE_ACQUIRE", &raw)?,
                Err(_) => defaults.probe_before_acquire,
            },
            default_ttl: match env::var("DISTLOCK_DEFAULT_TTL_SECS") {
                Ok(raw) => Duration::from_secs(parse_positive("DISTLOCK_DEFAULT_TTL_SECS", &raw)?),
                Err(_) => defaults.default_ttl,
            },
        })
    }
}

fn parse_positive(name: &str, raw: &str) -> anyhow::Result<u64> {
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a positive integer, got {:?}", name, raw))?;
    if value == 0 {
        anyhow::bail!("{} must be greater than 0", name);
    }
    Ok(value)
}

fn parse_bool(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!("{} must be a boolean, got {:?}", name, raw)),
    }
}
