//! Response Publisher
//!
//! Full LLM responses are published under a fresh UUIDv4 id, mirrored to the
//! backend as `web_responses/<id>.json` and served by the web page until they
//! expire.

use crate::backend::{BackendError, SharedBackend};
use crate::cache::{Entry, ExpiringStore};
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Backend prefix for published responses
pub const RESPONSE_PREFIX: &str = "web_responses";

/// A published response as seen by readers
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedResponse {
    pub id: String,
    pub content: String,
    pub owner_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PublishedResponse {
    fn from_entry(id: String, entry: Entry<String>) -> Self {
        Self {
            id,
            content: entry.value,
            owner_id: entry.owner_id,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        }
    }
}

/// Store of published responses
pub struct ResponseStore {
    store: Arc<ExpiringStore<String>>,
    retention: Duration,
}

/// Canonical form of `id`, or `None` if it is not a UUID
fn canonical_id(id: &str) -> Option<String> {
    Uuid::parse_str(id).ok().map(|u| u.hyphenated().to_string())
}

impl ResponseStore {
    pub fn new(backend: SharedBackend, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        let store = ExpiringStore::new("responses")
            .with_clock(clock)
            .with_backend(backend, RESPONSE_PREFIX);
        Self {
            store: Arc::new(store),
            retention,
        }
    }

    /// Store `content` for `owner_id` and return its new id
    pub async fn publish(&self, content: &str, owner_id: i64) -> String {
        let id = Uuid::new_v4().to_string();
        self.store
            .put_owned(&id, content.to_string(), self.retention, owner_id)
            .await;
        debug!("Published response {} for user {}", id, owner_id);
        id
    }

    /// Full record for `id`, using a single read-through
    pub async fn record(&self, id: &str) -> Option<PublishedResponse> {
        let id = canonical_id(id)?;
        let entry = self.store.entry(&id).await?;
        Some(PublishedResponse::from_entry(id, entry))
    }

    pub async fn fetch(&self, id: &str) -> Option<String> {
        self.record(id).await.map(|r| r.content)
    }

    pub async fn creation_time(&self, id: &str) -> Option<DateTime<Utc>> {
        self.record(id).await.map(|r| r.created_at)
    }

    pub async fn expiration_time(&self, id: &str) -> Option<DateTime<Utc>> {
        self.record(id).await.map(|r| r.expires_at)
    }

    /// Live responses owned by `owner_id`, oldest first
    pub async fn list_by_owner(&self, owner_id: i64) -> Vec<PublishedResponse> {
        let mut records: Vec<PublishedResponse> = self
            .store
            .live_entries()
            .await
            .into_iter()
            .filter(|(_, e)| e.owner_id == Some(owner_id))
            .map(|(id, e)| PublishedResponse::from_entry(id, e))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Delete one response. Unknown or malformed ids are a no-op.
    pub async fn remove(&self, id: &str) {
        if let Some(id) = canonical_id(id) {
            self.store.delete(&id).await;
        }
    }

    /// Delete every response owned by `owner_id`
    pub async fn remove_all_for_owner(&self, owner_id: i64) -> usize {
        let owned = self.list_by_owner(owner_id).await;
        for record in &owned {
            self.store.delete(&record.id).await;
        }
        if !owned.is_empty() {
            info!("Removed {} responses for user {}", owned.len(), owner_id);
        }
        owned.len()
    }

    pub async fn load_all_from_backend(&self) -> Result<usize, BackendError> {
        self.store.load_from_backend().await
    }

    pub async fn sweep(&self) -> usize {
        self.store.sweep().await
    }

    pub fn spawn_sweeper(&self, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.store.spawn_sweeper(interval, shutdown)
    }
}
