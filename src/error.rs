use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong while creating, acquiring, or releasing a lock.
///
/// Lock contention is *not* an error. `Lock::try_lock` reports it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lease is too short to be renewed at half its duration before it expires.
    #[error("lease duration {lease_duration:?} is too short, must be greater than {minimum:?}")]
    LeaseTooShort {
        lease_duration: Duration,
        minimum: Duration,
    },

    /// The lease is longer than Redis TTLs and the lease renewer can handle.
    #[error("lease duration {lease_duration:?} is too long, must be at most {maximum:?}")]
    LeaseTooLong {
        lease_duration: Duration,
        maximum: Duration,
    },

    /// The Redis connection settings are unusable.
    #[error("invalid Redis configuration: {0}")]
    Config(String),

    /// Communication with Redis failed.
    #[error("Redis error: {0}")]
    Store(#[from] redis::RedisError),

    /// `Lock::lock` gave up waiting.
    #[error("timed out after {timeout:?} waiting for lock {lock_key}")]
    Timeout { lock_key: String, timeout: Duration },

    /// Our lease is gone. Either it expired, or someone else now holds the lock.
    #[error("lock {lock_key} is no longer held by this client")]
    LockLost { lock_key: String },
}

impl LockError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}
