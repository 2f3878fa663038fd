#[cfg(test)]
pub mod utils {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use lazy_static::lazy_static;
    use redis::{ErrorKind, RedisError, RedisResult};
    use tokio::time::Instant;
    use uuid::Uuid;

    use crate::connect::RedisConfig;
    use crate::lock::LockClient;
    use crate::store::{LockStore, RedisStore};

    /// In-memory `LockStore` that keeps time with tokio's clock, so tests can use
    /// `#[tokio::test(start_paused = true)]` to sleep through leases instantly.
    ///
    /// ```ignore
    /// let store = Arc::new(MemoryStore::new());
    /// let lock_client = LockClient::new(store.clone(), "prefix:");
    ///
    /// // Every store call fails until this is set back to false.
    /// store.set_unavailable(true);
    /// ```
    #[derive(Default)]
    pub struct MemoryStore {
        entries: Mutex<HashMap<String, Entry>>,
        calls: AtomicUsize,
        unavailable: AtomicBool,
    }

    struct Entry {
        value: String,
        expires_at: Instant,
    }

    impl Entry {
        fn is_live(&self, now: Instant) -> bool {
            now < self.expires_at
        }
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of store operations attempted so far, failed ones included.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// The value of a live key.
        pub fn value(&self, key: &str) -> Option<String> {
            let entries = self.entries.lock().unwrap();
            entries
                .get(key)
                .filter(|entry| entry.is_live(Instant::now()))
                .map(|entry| entry.value.clone())
        }

        /// Time left before a live key expires.
        pub fn expires_in(&self, key: &str) -> Option<Duration> {
            let now = Instant::now();
            let entries = self.entries.lock().unwrap();
            entries
                .get(key)
                .filter(|entry| entry.is_live(now))
                .map(|entry| entry.expires_at.duration_since(now))
        }

        /// Overwrite a key, the way a misbehaving client would.
        pub fn force_set(&self, key: &str, value: &str, ttl: Duration) {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }

        fn begin(&self) -> RedisResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(RedisError::from((
                    ErrorKind::IoError,
                    "store unavailable",
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LockStore for MemoryStore {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RedisResult<bool> {
            self.begin()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(key) {
                if entry.is_live(now) {
                    return Ok(false);
                }
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: now + ttl,
                },
            );
            Ok(true)
        }

        async fn delete(&self, key: &str) -> RedisResult<bool> {
            self.begin()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            Ok(entries
                .remove(key)
                .map(|entry| entry.is_live(now))
                .unwrap_or(false))
        }

        async fn refresh_expiry(&self, key: &str, ttl: Duration) -> RedisResult<bool> {
            self.begin()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(key) {
                Some(entry) if entry.is_live(now) => {
                    entry.expires_at = now + ttl;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn delete_if_value(&self, key: &str, value: &str) -> RedisResult<bool> {
            self.begin()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            let matches = entries
                .get(key)
                .map(|entry| entry.is_live(now) && entry.value == value)
                .unwrap_or(false);
            if matches {
                entries.remove(key);
            }
            Ok(matches)
        }

        async fn refresh_expiry_if_value(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> RedisResult<bool> {
            self.begin()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(key) {
                Some(entry) if entry.is_live(now) && entry.value == value => {
                    entry.expires_at = now + ttl;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn ping(&self) -> RedisResult<()> {
            self.begin()
        }
    }

    lazy_static! {
        static ref TEST_REDIS_ADDR: String = std::env::var("REDISLOCK_TEST_ADDR")
            .unwrap_or_else(|_| String::from("127.0.0.1:6379"));
    }

    /// Connection to a real Redis server for tests marked `#[ignore]`. Run them with
    /// `cargo test -- --ignored` against the server at `$REDISLOCK_TEST_ADDR`
    /// (default `127.0.0.1:6379`).
    ///
    /// Each `TestRedis` gets its own random key prefix, so tests running in parallel do not see
    /// each other's keys.
    pub struct TestRedis {
        pub store: RedisStore,
        pub prefix: String,
    }

    impl TestRedis {
        pub async fn new() -> Self {
            let config = RedisConfig {
                addresses: vec![TEST_REDIS_ADDR.clone()],
                ..Default::default()
            };
            let store = RedisStore::connect(&config).await.unwrap_or_else(|e| {
                panic!("Could not connect to Redis at {}: {}", &*TEST_REDIS_ADDR, e);
            });
            let prefix = format!("test-{}:", Uuid::new_v4().to_simple());
            TestRedis { store, prefix }
        }

        pub fn key(&self, name: &str) -> String {
            format!("{}{}", &self.prefix, name)
        }

        pub fn lock_client(&self) -> LockClient {
            LockClient::new(Arc::new(self.store.clone()), &self.prefix)
        }
    }
}
