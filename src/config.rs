//! Device identity and connection configuration.
//!
//! Both halves are plain serde structs so they can be loaded from a TOML file.
//! [`DeviceConfig::validate`] fills defaults for zero or missing values and
//! rejects anything the client cannot run with. After validation the config
//! is treated as read-only.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ConfigError;

const CONFIG_DIR: &str = ".config/devicelink";
const SERVER_RECORD_FILE: &str = "server_info.json";

pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 120;
const KEEP_ALIVE_RANGE_SECS: std::ops::RangeInclusive<u64> = 30..=12000;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WORKER_POOL_SIZE: usize = 10;
const DEFAULT_INFLIGHT: u16 = 20;
const DEFAULT_BATCH_SIZE: usize = 10;

/// How the device proves its identity to the broker
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    Password,
    X509,
}

/// Registration group the device is provisioned under.
///
/// With password scoping the device secret is the base64 group secret and the
/// per-device password is derived from it. With X.509 scoping no password is
/// sent and the client certificate authenticates the device.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RegistrationScope {
    pub scope_id: String,
    #[serde(default)]
    pub scope_type: AuthType,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub secret: Option<String>,
    pub auth_type: AuthType,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub scope: Option<RegistrationScope>,
    /// Ask the broker to check the hour timestamp embedded in the client id
    pub verify_timestamp: bool,
}

impl DeviceIdentity {
    pub fn uses_client_certificate(&self) -> bool {
        self.auth_type == AuthType::X509
            || self
                .scope
                .as_ref()
                .is_some_and(|s| s.scope_type == AuthType::X509)
    }
}

/// Reconnection backoff parameters, all in milliseconds
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            min_ms: 1000,
            max_ms: 30_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub enabled: bool,
    /// Provisioning broker; the operational `server` is used when empty
    pub server: String,
    /// Sent as `baseStrategyKeyword` in the provisioning request
    pub base_strategy_keyword: Option<String>,
    /// Location of the cached server record
    pub server_record_path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub server: String,
    pub server_ca_path: Option<PathBuf>,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub operation_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub backoff: BackoffConfig,
    pub worker_pool_size: usize,
    pub inflight_messages: u16,
    pub sub_device_batch_size: usize,
    /// Zero disables offline buffering
    pub offline_buffer_capacity: usize,
    pub rule_engine_enabled: bool,
    pub provisioning: ProvisioningConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            server_ca_path: None,
            qos: 0,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            auto_reconnect: true,
            backoff: BackoffConfig::default(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            inflight_messages: DEFAULT_INFLIGHT,
            sub_device_batch_size: DEFAULT_BATCH_SIZE,
            offline_buffer_capacity: 0,
            rule_engine_enabled: false,
            provisioning: ProvisioningConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn server_record_path(&self) -> PathBuf {
        self.provisioning.server_record_path.clone().unwrap_or_else(|| {
            let mut path = get_home_dir();
            path.push(CONFIG_DIR);
            path.push(SERVER_RECORD_FILE);
            path
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub identity: DeviceIdentity,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl DeviceConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: DeviceConfig = toml::from_str(&content)?;
        info!("Loaded device configuration from {}", path.display());
        config.validate()
    }

    /// Applies defaults and checks required fields.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let identity = &self.identity;
        if identity.device_id.trim().is_empty() {
            return Err(ConfigError::MissingDeviceId);
        }
        if identity.auth_type == AuthType::Password
            && identity.secret.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::MissingSecret);
        }
        if identity.uses_client_certificate()
            && (identity.cert_path.is_none() || identity.key_path.is_none())
        {
            return Err(ConfigError::MissingCertificate);
        }

        let conn = &mut self.connection;
        if conn.server.trim().is_empty() {
            return Err(ConfigError::MissingServer);
        }
        BrokerAddress::parse(&conn.server)?;
        if conn.provisioning.enabled && !conn.provisioning.server.is_empty() {
            BrokerAddress::parse(&conn.provisioning.server)?;
        }
        if conn.qos > 2 {
            return Err(ConfigError::InvalidQos(conn.qos));
        }

        if !KEEP_ALIVE_RANGE_SECS.contains(&conn.keep_alive_secs) {
            debug!(
                "keep-alive {}s outside supported range, using {}s",
                conn.keep_alive_secs, DEFAULT_KEEP_ALIVE_SECS
            );
            conn.keep_alive_secs = DEFAULT_KEEP_ALIVE_SECS;
        }
        if conn.connect_timeout_secs == 0 {
            conn.connect_timeout_secs = DEFAULT_CONNECT_TIMEOUT_SECS;
        }
        if conn.operation_timeout_ms == 0 {
            conn.operation_timeout_ms = DEFAULT_OPERATION_TIMEOUT_MS;
        }
        if conn.worker_pool_size == 0 {
            conn.worker_pool_size = DEFAULT_WORKER_POOL_SIZE;
        }
        if conn.inflight_messages == 0 {
            conn.inflight_messages = DEFAULT_INFLIGHT;
        }
        if conn.sub_device_batch_size == 0 {
            conn.sub_device_batch_size = DEFAULT_BATCH_SIZE;
        }

        let defaults = BackoffConfig::default();
        let backoff = &mut conn.backoff;
        if backoff.base_ms == 0 {
            backoff.base_ms = defaults.base_ms;
        }
        if backoff.min_ms == 0 {
            backoff.min_ms = defaults.min_ms;
        }
        if backoff.max_ms == 0 {
            backoff.max_ms = defaults.max_ms;
        }
        if backoff.min_ms > backoff.max_ms {
            return Err(ConfigError::InvalidBackoff {
                min_ms: backoff.min_ms,
                max_ms: backoff.max_ms,
            });
        }

        Ok(self)
    }
}

/// Host, port and transport security parsed from a broker URI.
///
/// `ssl://`, `tls://` and `mqtts://` select TLS (default port 8883), `tcp://`
/// and `mqtt://` plain TCP (default port 1883). A bare `host:port` is taken
/// as TLS since the platform only exposes encrypted endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidServer {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let normalized = if address.contains("://") {
            address.to_string()
        } else {
            format!("ssl://{address}")
        };
        let url = Url::parse(&normalized).map_err(|e| invalid(&e.to_string()))?;

        let tls = match url.scheme() {
            "ssl" | "tls" | "mqtts" => true,
            "tcp" | "mqtt" => false,
            other => return Err(invalid(&format!("unsupported scheme {other}"))),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self { host, port, tls })
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
