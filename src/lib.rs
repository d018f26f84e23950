pub mod config;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod models;
#[cfg(feature = "redis-backend")]
pub mod redis_store;
pub mod registry;
pub mod scripts;
pub mod store;

pub use config::LockConfig;
pub use error::{LockError, Result, StoreError};
pub use locks::{DistributedLock, LockManager};
pub use models::{build_lock_key, AcquireOutcome, FailurePolicy, ReleaseOutcome, LOCK_KEY_PREFIX};
#[cfg(feature = "redis-backend")]
pub use redis_store::RedisBackend;
pub use store::{LockBackend, MemoryBackend};
