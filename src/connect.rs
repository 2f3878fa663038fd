//! Connecting to Redis.
//!
//! Three deployment modes are supported:
//!
//! - `single`: one Redis server, `addresses[0]`.
//! - `sentinel`: a replicated setup with failover. `addresses` lists the sentinels and
//!   `master_name` names the monitored master.
//! - `cluster`: a sharded Redis Cluster. `addresses` lists one or more seed nodes.
//!
//! A successful connect always ends with a PING, so a returned `RedisStore` has talked to the
//! server at least once.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use redis::cluster::ClusterClientBuilder;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{ConnectionInfo, ErrorKind, IntoConnectionInfo, RedisConnectionInfo, RedisError};

use crate::error::LockError;
use crate::store::{LockStore, RedisConnection, RedisStore, SentinelConnection};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedisMode {
    Single,
    Sentinel,
    Cluster,
}

impl RedisMode {
    pub fn as_str(&self) -> &'static str {
        match *self {
            RedisMode::Single => "single",
            RedisMode::Sentinel => "sentinel",
            RedisMode::Cluster => "cluster",
        }
    }
}

impl fmt::Display for RedisMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedisMode {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(RedisMode::Single),
            "sentinel" => Ok(RedisMode::Sentinel),
            "cluster" => Ok(RedisMode::Cluster),
            other => Err(LockError::Config(format!("unknown redis type {}", other))),
        }
    }
}

/// How to reach Redis.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub mode: RedisMode,

    /// `host:port` pairs. Must not be empty.
    pub addresses: Vec<String>,

    pub password: Option<String>,

    /// Name of the master monitored by the sentinels. Only used in `sentinel` mode.
    pub master_name: String,

    /// Database number. Redis Cluster only has database 0.
    pub db: i64,

    /// How long to wait for the connection to be established, including the initial PING.
    pub connect_timeout: Duration,

    /// How long to wait for the reply to any single command.
    pub response_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::Single,
            addresses: vec![String::from("127.0.0.1:6379")],
            password: None,
            master_name: String::new(),
            db: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl RedisConfig {
    /// Check the settings without touching the network.
    pub fn validate(&self) -> Result<(), LockError> {
        if self.addresses.is_empty() {
            return Err(LockError::Config(String::from("no addresses provided")));
        }
        match self.mode {
            RedisMode::Sentinel if self.master_name.is_empty() => Err(LockError::Config(
                String::from("sentinel mode requires a master name"),
            )),
            RedisMode::Cluster if self.db != 0 => Err(LockError::Config(format!(
                "cluster mode only supports db 0, got {}",
                self.db
            ))),
            _ => Ok(()),
        }
    }

    /// One `ConnectionInfo` per address. In sentinel mode the addresses are the sentinels, which
    /// know neither the master's password nor `SELECT`, so `db` and `password` go to the master
    /// only (see `master_connection_info`).
    fn connection_infos(&self) -> Result<Vec<ConnectionInfo>, LockError> {
        self.addresses
            .iter()
            .map(|address| -> Result<ConnectionInfo, LockError> {
                let mut info = format!("redis://{}", address).into_connection_info()?;
                if self.mode != RedisMode::Sentinel {
                    info.redis = self.master_connection_info();
                }
                Ok(info)
            })
            .collect()
    }

    fn master_connection_info(&self) -> RedisConnectionInfo {
        RedisConnectionInfo {
            db: self.db,
            password: self.password.clone(),
            ..Default::default()
        }
    }
}

impl RedisStore {
    /// Open a connection as described by `config` and verify it with a PING.
    pub async fn connect(config: &RedisConfig) -> Result<RedisStore, LockError> {
        config.validate()?;
        let connection_infos = config.connection_infos()?;

        let connecting = async {
            let connection = match config.mode {
                RedisMode::Single => {
                    let client = redis::Client::open(connection_infos[0].clone())?;
                    RedisConnection::Single(client.get_connection_manager().await?)
                }
                RedisMode::Sentinel => {
                    let node_connection_info = SentinelNodeConnectionInfo {
                        redis_connection_info: Some(config.master_connection_info()),
                        ..Default::default()
                    };
                    let client = SentinelClient::build(
                        connection_infos.clone(),
                        config.master_name.clone(),
                        Some(node_connection_info),
                        SentinelServerType::Master,
                    )?;
                    RedisConnection::Sentinel(SentinelConnection::new(client, config.db).await?)
                }
                RedisMode::Cluster => {
                    let mut builder = ClusterClientBuilder::new(connection_infos.clone());
                    if let Some(password) = config.password.as_ref() {
                        builder = builder.password(password.clone());
                    }
                    let client = builder.build()?;
                    RedisConnection::Cluster(client.get_async_connection().await?)
                }
            };
            let store = RedisStore::new(connection, config.response_timeout);
            store.ping().await?;
            Ok::<_, LockError>(store)
        };

        let store = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| {
                LockError::Store(RedisError::from((
                    ErrorKind::IoError,
                    "failed to connect to Redis",
                    format!("timed out after {:?}", config.connect_timeout),
                )))
            })??;

        log::info!(
            "Connected to Redis ({}) at {}",
            config.mode,
            config.addresses.join(",")
        );
        Ok(store)
    }
}
