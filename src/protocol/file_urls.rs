//! Upload and download URLs handed out by the platform.
//!
//! The dispatcher records each `get_*_url_response`; the application polls
//! for the URL belonging to the file it asked about.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::events::FileAction;
use super::model::FileUrlResponse;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Default)]
pub struct FileUrlTable {
    urls: Arc<Mutex<HashMap<(String, FileAction), FileUrlResponse>>>,
}

impl FileUrlTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, action: FileAction, response: FileUrlResponse) {
        let key = (response.object_name.clone(), action);
        self.urls.lock().await.insert(key, response);
    }

    pub async fn get(&self, object_name: &str, action: FileAction) -> Option<FileUrlResponse> {
        self.urls
            .lock()
            .await
            .get(&(object_name.to_string(), action))
            .cloned()
    }

    /// Drops a stale entry before a fresh request is sent.
    pub async fn forget(&self, object_name: &str, action: FileAction) {
        self.urls.lock().await.remove(&(object_name.to_string(), action));
    }

    /// Polls until the URL for `object_name` arrives or `timeout` elapses.
    pub async fn wait(
        &self,
        object_name: &str,
        action: FileAction,
        timeout: Duration,
    ) -> Option<FileUrlResponse> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = self.get(object_name, action).await {
                return Some(response);
            }
            if Instant::now() >= deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }
}
