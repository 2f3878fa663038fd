//! Distributed locks on top of Redis.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use redislock::{LockClient, LockOpts, RedisConfig, RedisStore};
//!
//! # async fn run() -> Result<(), redislock::LockError> {
//! let store = RedisStore::connect(&RedisConfig::default()).await?;
//! let lock_client = LockClient::new(Arc::new(store), "prefix:");
//!
//! // 10s lease, renewed in the background while we hold the lock.
//! let mut lock = lock_client.new_lock(LockOpts {
//!     lock_key: String::from("my_key"),
//!     holder: String::from("my_lock"),
//!     auto_renew: true,
//!     lease_duration: Duration::from_secs(10),
//! })?;
//!
//! if lock.try_lock().await? {
//!     // ... do the work ...
//!     lock.unlock().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod connect;
pub mod error;
pub mod ids;
pub mod lock;
pub mod store;

mod testing;

pub use connect::{RedisConfig, RedisMode};
pub use error::LockError;
pub use lock::{KeyScheme, Lock, LockClient, LockOpts, Ownership};
pub use store::{LockStore, RedisConnection, RedisStore, SentinelConnection};
