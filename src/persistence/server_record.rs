use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::PersistenceError;

/// Broker address and secret learned from provisioning
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerRecord {
    pub server_uri: String,
    pub secret: String,
    pub port: u16,
}

impl ServerRecord {
    pub fn is_usable(&self) -> bool {
        !self.server_uri.is_empty()
    }
}

/// File holding the single cached [`ServerRecord`]
#[derive(Clone, Debug)]
pub struct ServerRecordStore {
    path: PathBuf,
}

impl ServerRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the cached record. A missing or unreadable file counts as no record.
    pub async fn load(&self) -> Option<ServerRecord> {
        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("No cached server record at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to check server record {}: {}", self.path.display(), e);
                return None;
            }
        }

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read server record {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str::<ServerRecord>(&content) {
            Ok(record) if record.is_usable() => Some(record),
            Ok(_) => {
                warn!("Cached server record has no broker address, ignoring");
                None
            }
            Err(e) => {
                warn!("Failed to parse server record: {}", e);
                None
            }
        }
    }

    pub async fn save(&self, record: &ServerRecord) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !tokio::fs::try_exists(parent).await? {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&self.path, content).await?;
        info!("Server record saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerRecordStore::new(dir.path().join("nested/server_info.json"));
        assert!(store.load().await.is_none());

        let record = ServerRecord {
            server_uri: "tls://iot.example.com:8883".into(),
            secret: "rotated".into(),
            port: 8883,
        };
        store.save(&record).await.unwrap();
        assert_eq!(store.load().await, Some(record));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_info.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(ServerRecordStore::new(path).load().await.is_none());
    }

    #[tokio::test]
    async fn test_wire_field_names() {
        let record = ServerRecord {
            server_uri: "tls://a:1".into(),
            secret: "s".into(),
            port: 1,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["server_uri"], "tls://a:1");
        assert_eq!(value["secret"], "s");
        assert_eq!(value["port"], 1);
    }
}
