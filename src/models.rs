use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LockError, Result};

/// Namespace shared by every scheduled-job lock key.
pub const LOCK_KEY_PREFIX: &str = "cron:lock:";

/// Builds a lock key with the standard prefix.
pub fn build_lock_key(job_name: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, job_name)
}

/// Opaque value proving which acquisition currently owns a lock.
///
/// A new token is minted for every successful acquire, so a stale holder can
/// never release or extend a record created by a later acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnershipToken(Uuid);

impl OwnershipToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OwnershipToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A lock this process believes it holds.
#[derive(Debug, Clone, Serialize)]
pub struct HeldLock {
    pub key: String,
    pub token: OwnershipToken,
    pub acquired_at: DateTime<Utc>,
    /// Local estimate only; the backing store decides actual expiry.
    pub expires_at: DateTime<Utc>,
}

impl HeldLock {
    pub fn new(key: impl Into<String>, token: OwnershipToken, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            token,
            acquired_at: now,
            expires_at: deadline_after(now, ttl),
        }
    }

    /// Moves the local expiry estimate after a successful extend.
    pub fn refresh(&mut self, ttl: Duration) {
        self.expires_at = deadline_after(Utc::now(), ttl);
    }

    pub fn is_probably_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

fn deadline_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How the protocol reacts when the backing store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Treat the lock as unavailable and let the caller skip its work.
    #[default]
    FailOpen,
    /// Surface the outage to the caller as an error.
    FailClosed,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-open" | "open" => Ok(Self::FailOpen),
            "fail-closed" | "closed" => Ok(Self::FailClosed),
            other => Err(anyhow::anyhow!(
                "Unknown failure policy {:?} (expected fail-open or fail-closed)",
                other
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailOpen => f.write_str("fail-open"),
            Self::FailClosed => f.write_str("fail-closed"),
        }
    }
}

/// Diagnostic category of an acquire attempt.
///
/// Everything except `Acquired` collapses to `false` for the caller; the
/// distinction only shows up in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireOutcome {
    Acquired,
    HeldElsewhere,
    BackendUnreachable,
    BackendError,
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::HeldElsewhere => "held_elsewhere",
            Self::BackendUnreachable => "backend_unreachable",
            Self::BackendError => "backend_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// The store record carried our token and was deleted.
    Released,
    /// The record had already expired or belongs to another acquisition.
    NotOwned,
    /// Nothing in the registry for this key.
    NotHeld,
}

impl ReleaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::NotOwned => "not_owned",
            Self::NotHeld => "not_held",
        }
    }
}

/// Checks the lock TTL precondition. The store works at millisecond
/// resolution, so anything below one millisecond is rejected.
pub fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl.as_millis() == 0 {
        return Err(LockError::InvalidTtl {
            reason: "TTL must be at least 1 millisecond".to_string(),
        });
    }

    if ttl.as_millis() > i64::MAX as u128 {
        return Err(LockError::InvalidTtl {
            reason: "TTL is too large".to_string(),
        });
    }

    Ok(())
}

/// Validates a caller-supplied job name before it is turned into a lock key.
///
/// Names must be 1 to 256 bytes of alphanumeric characters, hyphens,
/// underscores, dots, colons and forward slashes.
pub fn validate_job_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LockError::InvalidJobName {
            reason: "Job name cannot be empty".to_string(),
        });
    }

    if name.len() > 256 {
        return Err(LockError::InvalidJobName {
            reason: "Job name cannot exceed 256 characters".to_string(),
        });
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'))
    {
        return Err(LockError::InvalidJobName {
            reason: "Job name can only contain alphanumeric characters, hyphens, underscores, dots, colons, and slashes"
                .to_string(),
        });
    }

    Ok(())
}
