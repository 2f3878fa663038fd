//! The handful of key-value operations a lock needs, and their Redis implementation.

use std::convert::TryFrom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use redis::cluster_async::ClusterConnection;
use redis::sentinel::SentinelClient;
use redis::{Cmd, ErrorKind, Pipeline, RedisError, RedisFuture, RedisResult, Script, Value};
use tokio::sync::Mutex;

lazy_static! {
    static ref DELETE_IF_VALUE: Script = Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("DEL", KEYS[1])
        end
        return 0
        "#
    );
    static ref EXTEND_IF_VALUE: Script = Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("PEXPIRE", KEYS[1], ARGV[2])
        end
        return 0
        "#
    );
}

/// Store operations used by `Lock`. Every operation must be atomic on the store side.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `value` with a TTL, only if `key` does not exist. Returns whether the key was
    /// set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RedisResult<bool>;

    /// Delete `key`. Deleting a missing key is not an error. Returns whether a key was removed.
    async fn delete(&self, key: &str) -> RedisResult<bool>;

    /// Replace the TTL on `key`, keeping its value. Returns false if the key does not exist.
    async fn refresh_expiry(&self, key: &str, ttl: Duration) -> RedisResult<bool>;

    /// Delete `key` only if it still holds `value`.
    async fn delete_if_value(&self, key: &str, value: &str) -> RedisResult<bool>;

    /// Replace the TTL on `key` only if it still holds `value`.
    async fn refresh_expiry_if_value(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> RedisResult<bool>;

    /// Round trip to the store to check that it is reachable.
    async fn ping(&self) -> RedisResult<()>;
}

/// An async connection to one of the supported Redis topologies.
#[derive(Clone)]
pub enum RedisConnection {
    Single(ConnectionManager),
    Sentinel(SentinelConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            RedisConnection::Single(con) => con.req_packed_command(cmd),
            RedisConnection::Sentinel(con) => con.req_packed_command(cmd),
            RedisConnection::Cluster(con) => con.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            RedisConnection::Single(con) => con.req_packed_commands(cmd, offset, count),
            RedisConnection::Sentinel(con) => con.req_packed_commands(cmd, offset, count),
            RedisConnection::Cluster(con) => con.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Single(con) => con.get_db(),
            RedisConnection::Sentinel(con) => con.get_db(),
            RedisConnection::Cluster(con) => con.get_db(),
        }
    }
}

/// Connection to the master of a sentinel-monitored deployment.
///
/// The master is looked up through the sentinels when the connection is created, and again
/// whenever a command fails in a way that suggests a failover (see `needs_rediscovery`). The failed
/// command is then retried once on the new master.
#[derive(Clone)]
pub struct SentinelConnection {
    client: Arc<Mutex<SentinelClient>>,
    master: Arc<Mutex<MultiplexedConnection>>,
    db: i64,
}

impl SentinelConnection {
    pub async fn new(mut client: SentinelClient, db: i64) -> RedisResult<Self> {
        let master = client.get_async_connection().await?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            master: Arc::new(Mutex::new(master)),
            db,
        })
    }

    async fn current_master(&self) -> MultiplexedConnection {
        self.master.lock().await.clone()
    }

    async fn rediscover_master(&self) -> RedisResult<MultiplexedConnection> {
        let master = self.client.lock().await.get_async_connection().await?;
        *self.master.lock().await = master.clone();
        log::info!("Reconnected to the Redis master through the sentinels");
        Ok(master)
    }
}

impl ConnectionLike for SentinelConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        Box::pin(async move {
            let mut master = self.current_master().await;
            match master.req_packed_command(cmd).await {
                Err(e) if needs_rediscovery(&e) => {
                    log::warn!("Redis master unusable, asking the sentinels. Error: {}", &e);
                    let mut master = self.rediscover_master().await?;
                    master.req_packed_command(cmd).await
                }
                result => result,
            }
        })
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let mut master = self.current_master().await;
            match master.req_packed_commands(cmd, offset, count).await {
                Err(e) if needs_rediscovery(&e) => {
                    log::warn!("Redis master unusable, asking the sentinels. Error: {}", &e);
                    let mut master = self.rediscover_master().await?;
                    master.req_packed_commands(cmd, offset, count).await
                }
                result => result,
            }
        })
    }

    fn get_db(&self) -> i64 {
        self.db
    }
}

/// True if `err` means we may be talking to a master that is gone or was demoted to a replica.
fn needs_rediscovery(err: &RedisError) -> bool {
    err.kind() == ErrorKind::ReadOnly
        || err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
}

/// `LockStore` backed by Redis. Cheap to clone; clones share the underlying connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: RedisConnection,
    response_timeout: Duration,
}

impl RedisStore {
    /// Wrap an established connection. Every command gives up after `response_timeout`.
    pub fn new(connection: RedisConnection, response_timeout: Duration) -> Self {
        Self {
            connection,
            response_timeout,
        }
    }

    async fn with_timeout<T, F>(&self, command: &str, future: F) -> RedisResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.response_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(RedisError::from((
                ErrorKind::IoError,
                "Redis command timed out",
                format!("{} after {:?}", command, self.response_timeout),
            ))),
        }
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RedisResult<bool> {
        let mut con = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(millis(ttl));
        // SET ... NX replies OK when the key was set, nil otherwise.
        let reply: Option<String> = self.with_timeout("SET", cmd.query_async(&mut con)).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> RedisResult<bool> {
        let mut con = self.connection.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self.with_timeout("DEL", cmd.query_async(&mut con)).await?;
        Ok(removed > 0)
    }

    async fn refresh_expiry(&self, key: &str, ttl: Duration) -> RedisResult<bool> {
        let mut con = self.connection.clone();
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(millis(ttl));
        let updated: i64 = self.with_timeout("PEXPIRE", cmd.query_async(&mut con)).await?;
        Ok(updated == 1)
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> RedisResult<bool> {
        let mut con = self.connection.clone();
        let mut invocation = DELETE_IF_VALUE.key(key);
        invocation.arg(value);
        let removed: i64 = self
            .with_timeout("EVALSHA", invocation.invoke_async(&mut con))
            .await?;
        Ok(removed > 0)
    }

    async fn refresh_expiry_if_value(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> RedisResult<bool> {
        let mut con = self.connection.clone();
        let mut invocation = EXTEND_IF_VALUE.key(key);
        invocation.arg(value).arg(millis(ttl));
        let updated: i64 = self
            .with_timeout("EVALSHA", invocation.invoke_async(&mut con))
            .await?;
        Ok(updated == 1)
    }

    async fn ping(&self) -> RedisResult<()> {
        let mut con = self.connection.clone();
        let cmd = redis::cmd("PING");
        let _pong: String = self.with_timeout("PING", cmd.query_async(&mut con)).await?;
        Ok(())
    }
}

/// Redis TTLs are whole milliseconds. Never round a nonzero TTL down to zero, which Redis rejects.
/// Leases are bounded by `MAX_LEASE_DURATION`, so saturating never kicks in for a real lock.
fn millis(ttl: Duration) -> u64 {
    let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 && ttl > Duration::from_millis(0) {
        1
    } else {
        ms
    }
}
