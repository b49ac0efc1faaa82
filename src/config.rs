use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::error;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::connection::ConnectionSettings;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("TLS_CERT_PATH and TLS_KEY_PATH must be set together")]
    PartialTls,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Shared pub/sub server that lets several relay processes serve one room.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub http_port: u16,
    pub max_workers: usize,
    pub keepalive_interval: Duration,
    pub read_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub room_ttl: Duration,
    pub broker_capacity: usize,
    pub tls: Option<TlsConfig>,
    pub redis: Option<RedisConfig>,
}

const DEFAULT_REDIS_PORT: u16 = 6379;
/// Ten years; keeps `now + ttl` representable on every platform.
const MAX_ROOM_TTL_HOURS: u64 = 10 * 365 * 24;

impl Default for Config {
    fn default() -> Self {
        Config {
            http_port: 2052,
            max_workers: 1000,
            keepalive_interval: Duration::from_secs(30),
            read_timeout: Some(Duration::from_secs(90)),
            shutdown_timeout: Duration::from_secs(15),
            room_ttl: Duration::from_secs(24 * 60 * 60),
            broker_capacity: 1024,
            tls: None,
            redis: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let max_workers = parse(
            &lookup,
            "MAX_WORKERS",
            defaults.max_workers,
            "a positive integer",
        )?;
        if max_workers == 0 || max_workers > Semaphore::MAX_PERMITS {
            return Err(invalid(
                "MAX_WORKERS",
                &max_workers.to_string(),
                "a positive integer within the permit limit",
            ));
        }
        let keepalive_secs = parse(
            &lookup,
            "KEEPALIVE_INTERVAL_SECS",
            30u64,
            "a positive integer",
        )?;
        if keepalive_secs == 0 {
            return Err(invalid("KEEPALIVE_INTERVAL_SECS", "0", "a positive integer"));
        }
        let read_timeout_secs = parse(&lookup, "READ_TIMEOUT_SECS", 90u64, "an integer")?;
        let ttl_hours = parse(&lookup, "ROOM_TTL_HOURS", 24u64, "an integer")?;
        let room_ttl = ttl_hours
            .checked_mul(60 * 60)
            .filter(|_| ttl_hours <= MAX_ROOM_TTL_HOURS)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                invalid("ROOM_TTL_HOURS", &ttl_hours.to_string(), "at most ten years in hours")
            })?;
        let shutdown_secs = parse(&lookup, "SHUTDOWN_TIMEOUT_SECS", 15u64, "an integer")?;
        let broker_capacity = parse(
            &lookup,
            "BROKER_CAPACITY",
            defaults.broker_capacity,
            "an integer",
        )?;

        let tls = match (lookup("TLS_CERT_PATH"), lookup("TLS_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: cert.into(),
                key_path: key.into(),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTls),
        };

        let redis = match lookup("REDIS_ADDR").filter(|addr| !addr.trim().is_empty()) {
            Some(addr) => Some(redis_config(&lookup, addr.trim())?),
            None => None,
        };

        Ok(Config {
            http_port: parse(&lookup, "HTTP_PORT", defaults.http_port, "a port number")?,
            max_workers,
            keepalive_interval: Duration::from_secs(keepalive_secs),
            read_timeout: (read_timeout_secs > 0).then(|| Duration::from_secs(read_timeout_secs)),
            shutdown_timeout: Duration::from_secs(shutdown_secs),
            room_ttl,
            broker_capacity,
            tls,
            redis,
        })
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            keepalive_interval: self.keepalive_interval,
            read_timeout: self.read_timeout,
        }
    }
}

fn invalid(name: &'static str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        expected,
    }
}

/// `REDIS_ADDR` is `host` or `host:port`; password and db come from their
/// own variables.
fn redis_config(
    lookup: &impl Fn(&str) -> Option<String>,
    addr: &str,
) -> Result<RedisConfig, ConfigError> {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| invalid("REDIS_ADDR", addr, "host or host:port"))?;
            (host, port)
        }
        None => (addr, DEFAULT_REDIS_PORT),
    };
    if host.is_empty() {
        return Err(invalid("REDIS_ADDR", addr, "host or host:port"));
    }

    Ok(RedisConfig {
        host: host.to_string(),
        port,
        password: lookup("REDIS_PASSWORD").filter(|password| !password.is_empty()),
        db: parse(lookup, "REDIS_DB", 0i64, "a database index")?,
    })
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| invalid(name, &value, expected)),
        None => Ok(default),
    }
}

impl TlsConfig {
    /// Checks that the certificate chain and private key parse before the
    /// server commits to serving TLS.
    pub fn preflight(&self) -> bool {
        let cert_file = match File::open(&self.cert_path) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to open certificate file: {e}");
                return false;
            }
        };
        let key_file = match File::open(&self.key_path) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to open private key file: {e}");
                return false;
            }
        };

        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>();
        match certs {
            Ok(certs) if !certs.is_empty() => {}
            Ok(_) => {
                error!("No certificates found in {}", self.cert_path.display());
                return false;
            }
            Err(e) => {
                error!("Failed to parse certificate: {e}");
                return false;
            }
        }

        match rustls_pemfile::private_key(&mut BufReader::new(key_file)) {
            Ok(Some(_)) => true,
            Ok(None) => {
                error!("No private key found in {}", self.key_path.display());
                false
            }
            Err(e) => {
                error!("Failed to parse private key: {e}");
                false
            }
        }
    }
}
