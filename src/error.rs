//! Error types shared across the client.
//!
//! Configuration errors are fatal and surface at construction. Everything
//! else is logged and turned into a failed attempt or a dropped message by
//! the caller that owns the operation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Malformed local configuration, surfaced once at construction
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device id is required")]
    MissingDeviceId,

    #[error("a secret is required for password authentication")]
    MissingSecret,

    #[error("certificate and key paths are required for X.509 authentication")]
    MissingCertificate,

    #[error("a broker address is required")]
    MissingServer,

    #[error("invalid broker address {address}: {reason}")]
    InvalidServer { address: String, reason: String },

    #[error("min backoff {min_ms}ms exceeds max backoff {max_ms}ms")]
    InvalidBackoff { min_ms: u64, max_ms: u64 },

    #[error("unsupported QoS level: {0}")]
    InvalidQos(u8),

    #[error("a trust root (server_ca_path) is required for TLS brokers")]
    MissingTrustRoot,

    #[error("failed to read TLS material {path}: {source}")]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable certificate or key in {0}")]
    EmptyTlsMaterial(PathBuf),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Password derivation failures
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("registration group secret is not valid base64: {0}")]
    GroupSecret(#[from] base64::DecodeError),

    #[error("invalid HMAC key length")]
    InvalidKey,
}

/// Failures reported by the publish/subscribe transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("not connected")]
    NotConnected,
}

/// Provisioning handshake failures; each one is a failed connect attempt
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no provisioning response within {0:?}")]
    Timeout(Duration),

    #[error("malformed provisioning response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("provisioning response carried no broker address")]
    MissingAddress,

    #[error("provisioned broker address is unusable: {0}")]
    InvalidAddress(String),

    #[error("provisioning transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("provisioning credentials: {0}")]
    Credentials(#[from] CredentialError),

    #[error("provisioning result already completed")]
    AlreadyCompleted,

    #[error("provisioning session dropped before completion")]
    Abandoned,
}

/// Outcome of a single failed connect attempt
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("client is shutting down")]
    ShuttingDown,
}

/// Inbound messages that could not be dispatched
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to decode {category} payload: {source}")]
    Decode {
        category: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("no {0} handler registered")]
    MissingHandler(&'static str),

    #[error("topic {0} carries no request id")]
    MissingRequestId(String),
}

/// Malformed rule content; the offending condition or rule is skipped
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid time of day: {0}")]
    InvalidTime(String),

    #[error("invalid day of week: {0}")]
    InvalidDay(String),

    #[error("invalid start time: {0}")]
    InvalidStartTime(String),

    #[error("repeat interval must be positive, got {0}")]
    InvalidInterval(i64),

    #[error("rule {0} combines timer conditions under AND logic")]
    UnsupportedTimerLogic(String),
}

/// Cached server record I/O
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("server record io: {0}")]
    Io(#[from] std::io::Error),

    #[error("server record json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is saturated")]
    Saturated,

    #[error("worker pool is closed")]
    Closed,
}
