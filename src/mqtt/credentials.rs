//! Password and client-id derivation.
//!
//! The broker expects an HMAC-SHA256 of the device secret keyed with the
//! current UTC hour (`YYYYMMDDHH`), hex encoded. Devices registered under a
//! password-scoped group first derive their own secret from the base64 group
//! secret and the device id.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::{AuthType, DeviceIdentity};
use crate::error::CredentialError;

type HmacSha256 = Hmac<Sha256>;

/// Username, password and client id for one connect attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub username: String,
    pub password: Option<String>,
}

pub fn hour_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H").to_string()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CredentialError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CredentialError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_hex(key: &[u8], data: &[u8]) -> Result<String, CredentialError> {
    hmac_sha256(key, data).map(hex::encode)
}

/// Password for a directly registered device.
pub fn device_password(secret: &str, timestamp: &str) -> Result<String, CredentialError> {
    hmac_hex(timestamp.as_bytes(), secret.as_bytes())
}

/// Password for a device registered under a password-scoped group.
pub fn group_password(
    group_secret: &str,
    device_id: &str,
    timestamp: &str,
) -> Result<String, CredentialError> {
    let decoded = STANDARD.decode(group_secret)?;
    let device_secret = hmac_hex(device_id.as_bytes(), &decoded)?;
    device_password(&device_secret, timestamp)
}

/// Credentials for the operational broker.
///
/// `secret_override` carries the secret returned by provisioning, which
/// replaces the configured one.
pub fn device_credentials(
    identity: &DeviceIdentity,
    secret_override: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Credentials, CredentialError> {
    let timestamp = hour_timestamp(now);
    let verify = if identity.verify_timestamp { 1 } else { 0 };
    let client_id = format!("{}_0_{verify}_{timestamp}", identity.device_id);

    let password = if identity.auth_type == AuthType::X509 {
        None
    } else {
        let secret = secret_override
            .filter(|s| !s.is_empty())
            .or(identity.secret.as_deref())
            .unwrap_or_default();
        match (&identity.scope, secret_override) {
            (Some(scope), None) if scope.scope_type == AuthType::Password => {
                Some(group_password(secret, &identity.device_id, &timestamp)?)
            }
            _ => Some(device_password(secret, &timestamp)?),
        }
    };

    Ok(Credentials {
        client_id,
        username: identity.device_id.clone(),
        password,
    })
}

/// Credentials for the provisioning broker.
pub fn provisioning_credentials(
    identity: &DeviceIdentity,
    now: DateTime<Utc>,
) -> Result<Credentials, CredentialError> {
    let timestamp = hour_timestamp(now);
    let id = &identity.device_id;
    let secret = identity.secret.as_deref().unwrap_or_default();

    let (client_id, password) = match &identity.scope {
        Some(scope) if scope.scope_type == AuthType::X509 => {
            (format!("{id}_0_{}", scope.scope_id), None)
        }
        Some(scope) => (
            format!("{id}_0_{}_0_{timestamp}", scope.scope_id),
            Some(group_password(secret, id, &timestamp)?),
        ),
        None if identity.auth_type == AuthType::X509 => (format!("{id}_0_0_{timestamp}"), None),
        None => (
            format!("{id}_0_0_{timestamp}"),
            Some(device_password(secret, &timestamp)?),
        ),
    };

    Ok(Credentials {
        client_id,
        username: id.clone(),
        password,
    })
}
