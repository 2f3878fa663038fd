//! Distributed locking, powered by Redis.
//!
//! # Problem
//!
//! Multiple processes want to access a resource, but only one of them should access it at a time.
//! There is no coordinator process. All they share is a Redis deployment.
//!
//! # Solution
//!
//! A client acquires a lock by creating a key in Redis with `SET key value NX PX <lease>`. Redis
//! creates the key only if it does not already exist, so at most one client wins. The key expires
//! on its own when the lease runs out, which frees the lock if its holder crashes.
//!
//! When a client acquires a lock, it can ask for the lease to be renewed in the background. Every
//! half lease, a renewer resets the key's TTL to the full lease duration. The client then holds the
//! lock until it releases it or crashes.
//!
//! Releasing a lock deletes the key and stops the renewer.
//!
//! # Keys
//!
//! Every lock key starts with the client's namespace prefix, so applications sharing one Redis do
//! not collide. By default the holder token is part of the key (`<prefix><resource>:<holder>`):
//! only locks with the same resource key *and* the same holder token exclude each other. Use
//! `KeyScheme::PerResource` to key locks by resource alone, so that any two holders exclude each
//! other.
//!
//! # Ownership
//!
//! By default release is an unconditional `DEL` and renewal is an unconditional `PEXPIRE`. A
//! client whose lease already expired will delete or extend whoever holds the key now, and the
//! renewer never notices that the key went away. With `Ownership::Verified`, every acquisition
//! writes a fresh lease id as the key's value, and release and renewal only touch the key while
//! it still carries that lease id. Losing the lease is then reported as `LockError::LockLost`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::error::LockError;
use crate::ids::{Id, IdType};
use crate::store::LockStore;

/// Leases must be longer than this. Renewal happens at half the lease, and needs some room.
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(3);

/// Leases must not be longer than this. Redis keeps TTLs in milliseconds, and the renewer schedules
/// itself half a lease ahead on tokio's clock, so both need a bound.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How long `Lock::lock` sleeps between acquisition attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How lock keys are formed from resource keys and holder tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyScheme {
    /// `<prefix><resource>:<holder>`. Holders with different tokens never contend.
    PerHolder,

    /// `<prefix><resource>`. The holder token is only recorded in the key's value.
    PerResource,
}

/// Whether release and renewal check that we still own the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Delete and extend the key no matter who holds it.
    Unchecked,

    /// Delete and extend the key only while it carries our lease id.
    Verified,
}

/// Creates locks in one namespace of one Redis deployment.
#[derive(Clone)]
pub struct LockClient {
    store: Arc<dyn LockStore>,
    prefix: String,
    key_scheme: KeyScheme,
    ownership: Ownership,
}

/// Options to pass in when creating a lock.
#[derive(Clone, Debug, Default)]
pub struct LockOpts {
    /// Identifies the resource. The client's prefix is prepended if it is not already there.
    pub lock_key: String,

    /// Identifies who wants the lock. A good value here might be something like
    /// "<host>:<feature>:<random_uuid>".
    ///
    /// NOTE: A thread id is *not* a good holder token. This code is async, and the thread that
    /// starts an asynchronous call may not be the thread that finishes it.
    pub holder: String,

    /// If true, the lease is renewed in the background every `lease_duration / 2` for as long as
    /// the lock is held.
    pub auto_renew: bool,

    /// How long the lock stays held without renewal. Must be longer than `MIN_LEASE_DURATION`.
    pub lease_duration: Duration,
}

/// A lock on one key. Create it with `LockClient::new_lock`, then `try_lock` or `lock` it.
///
/// Dropping a `Lock` stops its lease renewer but does not release it. The key stays in Redis until
/// its lease runs out.
pub struct Lock {
    store: Arc<dyn LockStore>,
    lock_key: String,
    holder: String,
    lease_duration: Duration,
    auto_renew: bool,
    ownership: Ownership,
    lease_value: Option<String>,
    lease_renewer: Option<Arc<LeaseRenewer>>,
}

/// Worker that renews a lease in the background until it is stopped.
///
/// `stop` is the lock's release signal. It may be called any number of times.
struct LeaseRenewer {
    running: AtomicBool,
    lost: AtomicBool,
    awake_from_sleep: Notify,
}

impl LockClient {
    /// A client with the default policies, `KeyScheme::PerHolder` and `Ownership::Unchecked`.
    pub fn new(store: Arc<dyn LockStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            key_scheme: KeyScheme::PerHolder,
            ownership: Ownership::Unchecked,
        }
    }

    pub fn with_key_scheme(mut self, key_scheme: KeyScheme) -> Self {
        self.key_scheme = key_scheme;
        self
    }

    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    /// Create a lock. Does not talk to Redis.
    ///
    /// ### Error
    ///
    /// Returns `Err(LockError::LeaseTooShort)` if `opts.lease_duration` is not longer than
    /// `MIN_LEASE_DURATION`, and `Err(LockError::LeaseTooLong)` if it is longer than
    /// `MAX_LEASE_DURATION`.
    pub fn new_lock(&self, opts: LockOpts) -> Result<Lock, LockError> {
        if opts.lease_duration <= MIN_LEASE_DURATION {
            return Err(LockError::LeaseTooShort {
                lease_duration: opts.lease_duration,
                minimum: MIN_LEASE_DURATION,
            });
        }
        if opts.lease_duration > MAX_LEASE_DURATION {
            return Err(LockError::LeaseTooLong {
                lease_duration: opts.lease_duration,
                maximum: MAX_LEASE_DURATION,
            });
        }
        Ok(Lock {
            store: self.store.clone(),
            lock_key: self.lock_key(&opts.lock_key, &opts.holder),
            holder: opts.holder,
            lease_duration: opts.lease_duration,
            auto_renew: opts.auto_renew,
            ownership: self.ownership,
            lease_value: None,
            lease_renewer: None,
        })
    }

    fn lock_key(&self, resource_key: &str, holder: &str) -> String {
        let namespaced = if resource_key.starts_with(&self.prefix) {
            resource_key.to_string()
        } else {
            format!("{}{}", self.prefix, resource_key)
        };
        match self.key_scheme {
            KeyScheme::PerHolder => format!("{}:{}", namespaced, holder),
            KeyScheme::PerResource => namespaced,
        }
    }
}

impl Lock {
    /// Try to acquire the lock without waiting.
    ///
    /// ### Lock Success
    ///
    /// Returns `Ok(true)`. We hold the lock until the lease expires or we call `unlock`. If the
    /// lock was created with `auto_renew`, a lease renewer starts in the background.
    ///
    /// ### Lock Conflict
    ///
    /// Returns `Ok(false)` if someone holds the key. Nothing else happens.
    ///
    /// ### Error
    ///
    /// Returns `Err(LockError::Store)` if we fail to talk to Redis.
    pub async fn try_lock(&mut self) -> Result<bool, LockError> {
        let lease_id = Id::new(IdType::LockLease);
        let lease_value = format!("{}:{}", &self.holder, lease_id);
        let acquired = self
            .store
            .set_if_absent(&self.lock_key, &lease_value, self.lease_duration)
            .await?;
        if !acquired {
            return Ok(false);
        }

        // A renewer left over from an earlier acquisition whose lease ran out belongs to a lease
        // we no longer have.
        self.stop_lease_renewer();
        if self.auto_renew {
            self.lease_renewer = Some(LeaseRenewer::start(
                self.store.clone(),
                self.lock_key.clone(),
                lease_value.clone(),
                self.lease_duration,
                self.ownership,
            ));
        }
        self.lease_value = Some(lease_value);
        log::debug!("Acquired lock {} with lease {}", &self.lock_key, lease_id);
        Ok(true)
    }

    /// Wait until we acquire the lock, polling every `RETRY_INTERVAL`. A `timeout` too large to
    /// put a deadline on, such as `Duration::MAX`, waits for as long as it takes.
    ///
    /// ### Error
    ///
    /// Returns `Err(LockError::Timeout)` if the lock is still held by someone else once `timeout`
    /// has passed. A Redis error ends the wait right away and is returned as is.
    pub async fn lock(&mut self, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now().checked_add(timeout);
        while deadline.map_or(true, |deadline| Instant::now() < deadline) {
            if self.try_lock().await? {
                return Ok(());
            }
            log::debug!("Failed to acquire lock {}, retrying...", &self.lock_key);
            time::sleep(RETRY_INTERVAL).await;
        }
        Err(LockError::Timeout {
            lock_key: self.lock_key.clone(),
            timeout,
        })
    }

    /// Release the lock: delete the key, then stop the lease renewer.
    ///
    /// The renewer is stopped even if the delete fails. Calling `unlock` again is harmless.
    ///
    /// ### Error
    ///
    /// Returns `Err(LockError::Store)` if we fail to talk to Redis. With `Ownership::Verified`,
    /// returns `Err(LockError::LockLost)` if the key no longer carries our lease, in which case
    /// the key is left alone.
    pub async fn unlock(&mut self) -> Result<(), LockError> {
        let result = self.delete_key().await;
        self.stop_lease_renewer();
        self.lease_value = None;
        if result.is_ok() {
            log::debug!("Released lock {}", &self.lock_key);
        }
        result
    }

    async fn delete_key(&self) -> Result<(), LockError> {
        match self.ownership {
            Ownership::Unchecked => {
                self.store.delete(&self.lock_key).await?;
                Ok(())
            }
            Ownership::Verified => {
                let deleted = match self.lease_value.as_ref() {
                    Some(lease_value) => {
                        self.store
                            .delete_if_value(&self.lock_key, lease_value)
                            .await?
                    }
                    None => false,
                };
                if deleted {
                    Ok(())
                } else {
                    Err(LockError::LockLost {
                        lock_key: self.lock_key.clone(),
                    })
                }
            }
        }
    }

    /// The key this lock occupies in Redis.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// The value written with the key by the last successful acquisition, if we have not released
    /// it since.
    pub fn lease_value(&self) -> Option<&str> {
        self.lease_value.as_deref()
    }

    /// True if the lease renewer found that our lease is gone. Only ever detected with
    /// `Ownership::Verified`.
    pub fn is_lost(&self) -> bool {
        self.lease_renewer
            .as_ref()
            .map(|lease_renewer| lease_renewer.is_lost())
            .unwrap_or(false)
    }

    fn stop_lease_renewer(&mut self) {
        if let Some(lease_renewer) = self.lease_renewer.take() {
            lease_renewer.stop();
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.stop_lease_renewer();
    }
}

impl LeaseRenewer {
    fn start(
        store: Arc<dyn LockStore>,
        lock_key: String,
        lease_value: String,
        lease_duration: Duration,
        ownership: Ownership,
    ) -> Arc<Self> {
        let lease_renewer = Arc::new(Self {
            running: AtomicBool::new(true),
            lost: AtomicBool::new(false),
            awake_from_sleep: Notify::new(),
        });
        let renew_interval = lease_duration / 2;
        let renewer = lease_renewer.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + renew_interval, renew_interval);
            while renewer.is_running() {
                // Notified when stopped. A stop that lands while we are renewing leaves a permit
                // behind, so it is never missed.
                tokio::select! {
                    biased;
                    _ = renewer.awake_from_sleep.notified() => {}
                    _ = ticker.tick() => {}
                }
                if !renewer.is_running() {
                    break;
                }
                let renewed = match ownership {
                    Ownership::Unchecked => store
                        .refresh_expiry(&lock_key, lease_duration)
                        .await
                        .map(|_| true),
                    Ownership::Verified => {
                        store
                            .refresh_expiry_if_value(&lock_key, &lease_value, lease_duration)
                            .await
                    }
                };
                match renewed {
                    Ok(true) => {}
                    Ok(false) => {
                        log::warn!(
                            "Lease on lock {} is gone. Stopping lease renewer.",
                            &lock_key
                        );
                        renewer.lost.store(true, Ordering::SeqCst);
                        renewer.stop();
                    }
                    Err(e) => {
                        log::warn!(
                            "Error occurred renewing lease on lock {}. Will retry in {:?}. Error: {}",
                            &lock_key,
                            renew_interval,
                            &e
                        );
                    }
                }
            }
        });
        lease_renewer
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.awake_from_sleep.notify_one();
    }
}
