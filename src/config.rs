use std::time::Duration;

use clap::{value_t, App, Arg, ArgMatches};
use lazy_static::lazy_static;
use redislock::connect::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT};
use redislock::ids::{Id, IdType};
use redislock::{RedisConfig, RedisMode};

lazy_static! {
    static ref CONFIG: Config = parse_command_line_flags();
}

const PASSWORD_ENV_VAR: &str = "REDISLOCK_PASSWORD";

#[derive(Debug)]
pub struct Config {
    pub redis: RedisConfig,
    pub prefix: String,
    pub lock_key: String,
    pub holder: String,
    pub lease_duration: Duration,
    pub auto_renew: bool,
    pub per_resource: bool,
    pub verify_ownership: bool,
    /// `None` means try once and give up if the lock is taken.
    pub wait: Option<Duration>,
    pub hold: Duration,
    pub log_level: log::LevelFilter,
}

pub fn config() -> &'static Config {
    &CONFIG
}

fn parse_command_line_flags() -> Config {
    let connect_timeout_ms = DEFAULT_CONNECT_TIMEOUT.as_millis().to_string();
    let response_timeout_ms = DEFAULT_RESPONSE_TIMEOUT.as_millis().to_string();
    let matches = App::new("redislock")
        .version("0.1")
        .about("Acquires a Redis lock, holds it for a while, then releases it")
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .help("How Redis is deployed")
                .takes_value(true)
                .possible_values(&["single", "sentinel", "cluster"])
                .default_value("single"),
        )
        .arg(
            Arg::with_name("addresses")
                .long("addresses")
                .help("Comma-separated Redis (or sentinel) addresses")
                .takes_value(true)
                .value_name("HOST:PORT")
                .use_delimiter(true)
                .default_value("127.0.0.1:6379"),
        )
        .arg(
            Arg::with_name("master_name")
                .long("master-name")
                .help("Name of the master monitored by the sentinels")
                .takes_value(true)
                .value_name("NAME")
                .default_value(""),
        )
        .arg(
            Arg::with_name("db")
                .long("db")
                .help("Redis database number")
                .takes_value(true)
                .value_name("DB")
                .default_value("0"),
        )
        .arg(
            Arg::with_name("connect_timeout_ms")
                .long("connect-timeout-ms")
                .help("How long to wait for the connection to Redis")
                .takes_value(true)
                .value_name("MILLIS")
                .default_value(&connect_timeout_ms),
        )
        .arg(
            Arg::with_name("response_timeout_ms")
                .long("response-timeout-ms")
                .help("How long to wait for a reply to each Redis command")
                .takes_value(true)
                .value_name("MILLIS")
                .default_value(&response_timeout_ms),
        )
        .arg(
            Arg::with_name("prefix")
                .long("prefix")
                .help("Namespace prefix of every lock key")
                .takes_value(true)
                .value_name("PREFIX")
                .default_value("prefix:"),
        )
        .arg(
            Arg::with_name("key")
                .long("key")
                .help("Resource to lock")
                .takes_value(true)
                .value_name("KEY")
                .default_value("my_key"),
        )
        .arg(
            Arg::with_name("holder")
                .long("holder")
                .help("Holder token. A random one is generated if missing")
                .takes_value(true)
                .value_name("TOKEN"),
        )
        .arg(
            Arg::with_name("lease_secs")
                .long("lease-secs")
                .help("Lease duration. Must be more than 3 seconds")
                .takes_value(true)
                .value_name("SECS")
                .default_value("10"),
        )
        .arg(
            Arg::with_name("no_renew")
                .long("no-renew")
                .help("Do not renew the lease in the background"),
        )
        .arg(
            Arg::with_name("per_resource")
                .long("per-resource")
                .help("Key the lock by resource only, so all holders contend"),
        )
        .arg(
            Arg::with_name("verify_ownership")
                .long("verify-ownership")
                .help("Only release or renew the lock while it still carries our lease"),
        )
        .arg(
            Arg::with_name("wait_secs")
                .long("wait-secs")
                .help("Wait up to this long for the lock. 0 tries once")
                .takes_value(true)
                .value_name("SECS")
                .default_value("0"),
        )
        .arg(
            Arg::with_name("hold_secs")
                .long("hold-secs")
                .help("How long to hold the lock before releasing it")
                .takes_value(true)
                .value_name("SECS")
                .default_value("15"),
        )
        .arg(
            Arg::with_name("log_level")
                .long("log-level")
                .help("error, warn, info, debug or trace")
                .takes_value(true)
                .value_name("LEVEL")
                .default_value("info"),
        )
        .get_matches();

    config_from_matches(&matches)
}

fn config_from_matches(matches: &ArgMatches) -> Config {
    let wait_secs = value_t!(matches, "wait_secs", u64).unwrap_or_else(|e| e.exit());
    Config {
        redis: RedisConfig {
            mode: value_t!(matches, "mode", RedisMode).unwrap_or_else(|e| e.exit()),
            addresses: matches
                .values_of("addresses")
                .map(|addresses| addresses.map(String::from).collect())
                .unwrap_or_default(),
            password: std::env::var(PASSWORD_ENV_VAR).ok(),
            master_name: matches.value_of("master_name").unwrap_or("").to_string(),
            db: value_t!(matches, "db", i64).unwrap_or_else(|e| e.exit()),
            connect_timeout: Duration::from_millis(
                value_t!(matches, "connect_timeout_ms", u64).unwrap_or_else(|e| e.exit()),
            ),
            response_timeout: Duration::from_millis(
                value_t!(matches, "response_timeout_ms", u64).unwrap_or_else(|e| e.exit()),
            ),
        },
        prefix: matches.value_of("prefix").unwrap_or("").to_string(),
        lock_key: matches.value_of("key").unwrap_or("").to_string(),
        holder: match matches.value_of("holder") {
            Some(holder) => holder.to_string(),
            None => Id::new(IdType::Holder).as_str().to_string(),
        },
        lease_duration: Duration::from_secs(
            value_t!(matches, "lease_secs", u64).unwrap_or_else(|e| e.exit()),
        ),
        auto_renew: !matches.is_present("no_renew"),
        per_resource: matches.is_present("per_resource"),
        verify_ownership: matches.is_present("verify_ownership"),
        wait: if wait_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(wait_secs))
        },
        hold: Duration::from_secs(
            value_t!(matches, "hold_secs", u64).unwrap_or_else(|e| e.exit()),
        ),
        log_level: value_t!(matches, "log_level", log::LevelFilter)
            .unwrap_or_else(|e| e.exit()),
    }
}
