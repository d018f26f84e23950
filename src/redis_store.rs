use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use tracing::{debug, info};

use crate::{error::StoreError, scripts, store::LockBackend};

/// Redis-backed lock store.
///
/// Uses `SET key token NX PX ttl` for acquisition and server-side Lua scripts
/// for the compare-and-delete and compare-and-extend operations. The
/// connection manager is cheap to clone and reconnects on its own, so one
/// instance is shared across every lock call.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    release_script: Script,
    extend_script: Script,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        info!("Connected lock backend to {}", redact_url(redis_url));
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: Script::new(scripts::RELEASE_LOCK),
            extend_script: Script::new(scripts::EXTEND_LOCK),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Strips credentials before a URL is written to the log.
fn redact_url(redis_url: &str) -> String {
    match (redis_url.find("://"), redis_url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &redis_url[..scheme_end], &redis_url[at..])
        }
        _ => redis_url.to_string(),
    }
}

#[async_trait]
impl LockBackend for RedisBackend {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        // Redis answers OK when the key was set and nil when it already existed
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: u64 = self
            .release_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        debug!("compare_and_delete {} -> {}", key, deleted);
        Ok(deleted)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let refreshed: u64 = self
            .extend_script
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        debug!("compare_and_expire {} -> {}", key, refreshed);
        Ok(refreshed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply {:?}", pong)));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
