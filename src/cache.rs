//! Expiring Entry Store
//!
//! Generic string-keyed map of timestamped, expiring values with optional
//! write-through/read-through to an [`ObjectBackend`].
//!
//! - Memory is the source of truth for the running process; the backend is a
//!   best-effort mirror. Backend failures are logged, never rolled back.
//! - Expired entries are deleted as soon as they are seen: on read, during
//!   the startup load, and by the periodic sweep.
//! - One `RwLock` per store. No lock is held across a backend call.

use crate::backend::{BackendError, SharedBackend};
use crate::clock::{self, Clock};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Smallest ttl accepted; keeps `expires_at > created_at`
const MIN_TTL: Duration = Duration::from_millis(1);

/// Stored value with its lifetime
///
/// Serialized field names match the persisted response layout
/// (`content`, `created_at`, `expires_at`, `owner_user_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<V> {
    #[serde(rename = "content")]
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "owner_user_id", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<i64>,
}

impl<V> Entry<V> {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Backend link: objects are written to `<prefix>/<key>.json`
struct Mirror {
    backend: SharedBackend,
    prefix: String,
}

impl Mirror {
    fn object_key(&self, key: &str) -> String {
        format!("{}/{}.json", self.prefix, key)
    }

    fn key_from_object<'a>(&self, object_key: &'a str) -> Option<&'a str> {
        object_key
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('/')?
            .strip_suffix(".json")
            .filter(|k| !k.is_empty() && !k.contains('/'))
    }
}

/// Expiring key-value store
pub struct ExpiringStore<V> {
    name: &'static str,
    entries: RwLock<HashMap<String, Entry<V>>>,
    mirror: Option<Mirror>,
    clock: Arc<dyn Clock>,
}

impl<V> ExpiringStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// In-memory store using the system clock
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
            mirror: None,
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mirror every entry to `backend` under `prefix`
    pub fn with_backend(mut self, backend: SharedBackend, prefix: &str) -> Self {
        self.mirror = Some(Mirror {
            backend,
            prefix: prefix.trim_end_matches('/').to_string(),
        });
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert or overwrite `key`, expiring `ttl` from now
    pub async fn put(&self, key: &str, value: V, ttl: Duration) -> Entry<V> {
        self.put_entry(key, value, ttl, None).await
    }

    /// Same as [`put`](Self::put) with an owner attached
    pub async fn put_owned(&self, key: &str, value: V, ttl: Duration, owner_id: i64) -> Entry<V> {
        self.put_entry(key, value, ttl, Some(owner_id)).await
    }

    async fn put_entry(
        &self,
        key: &str,
        value: V,
        ttl: Duration,
        owner_id: Option<i64>,
    ) -> Entry<V> {
        let now = self.clock.now();
        let entry = Entry {
            value,
            created_at: now,
            expires_at: clock::add_duration(now, ttl.max(MIN_TTL)),
            owner_id,
        };

        self.entries
            .write()
            .await
            .insert(key.to_string(), entry.clone());

        if let Some(mirror) = &self.mirror {
            if let Err(e) = self.persist(mirror, key, &entry).await {
                warn!("[{}] Failed to mirror {} to {}: {}", self.name, key, mirror.backend.name(), e);
            }
        }

        entry
    }

    async fn persist(&self, mirror: &Mirror, key: &str, entry: &Entry<V>) -> Result<(), BackendError> {
        let body = serde_json::to_vec(entry)?;
        mirror
            .backend
            .put(&mirror.object_key(key), body, HashMap::new())
            .await
    }

    /// Live value for `key`
    pub async fn get(&self, key: &str) -> Option<V> {
        self.entry(key).await.map(|e| e.value)
    }

    /// Live entry for `key`, reading through to the backend on a memory miss
    pub async fn entry(&self, key: &str) -> Option<Entry<V>> {
        let now = self.clock.now();

        let cached = self.entries.read().await.get(key).cloned();
        match cached {
            Some(entry) if entry.is_live_at(now) => return Some(entry),
            Some(_) => {
                debug!("[{}] {} expired on read", self.name, key);
                return self.expire(key).await;
            }
            None => {}
        }

        let mirror = self.mirror.as_ref()?;
        let entry = match self.load_object(mirror, &mirror.object_key(key)).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!("[{}] Read-through for {} failed: {}", self.name, key, e);
                return None;
            }
        };

        if !entry.is_live_at(now) {
            debug!("[{}] {} found expired in {}", self.name, key, mirror.backend.name());
            return self.expire(key).await;
        }

        // A concurrent put may have landed meanwhile; keep the newer one
        let mut entries = self.entries.write().await;
        let current = entries.entry(key.to_string()).or_insert(entry);
        Some(current.clone())
    }

    async fn load_object(&self, mirror: &Mirror, object_key: &str) -> Result<Option<Entry<V>>, BackendError> {
        match mirror.backend.get(object_key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop `key` after it was seen expired, unless a put replaced it since
    ///
    /// Returns the replacing entry when there is one.
    async fn expire(&self, key: &str) -> Option<Entry<V>> {
        let now = self.clock.now();
        {
            let mut entries = self.entries.write().await;
            match entries.get(key) {
                Some(current) if current.is_live_at(now) => return Some(current.clone()),
                Some(_) => {
                    entries.remove(key);
                }
                None => {}
            }
        }

        if let Some(mirror) = &self.mirror {
            self.purge_object(mirror, key).await;
        }
        None
    }

    /// Delete the backend object of an expired `key`
    ///
    /// Skipped while memory holds a live entry for the key. A put that lands
    /// during the delete is mirrored again afterwards.
    async fn purge_object(&self, mirror: &Mirror, key: &str) {
        if self.live_in_memory(key).await.is_some() {
            return;
        }

        if let Err(e) = mirror.backend.delete(&mirror.object_key(key)).await {
            warn!("[{}] Failed to delete expired {} from {}: {}", self.name, key, mirror.backend.name(), e);
        }

        if let Some(entry) = self.live_in_memory(key).await {
            debug!("[{}] {} was replaced during delete, mirroring again", self.name, key);
            if let Err(e) = self.persist(mirror, key, &entry).await {
                warn!("[{}] Failed to mirror {} to {}: {}", self.name, key, mirror.backend.name(), e);
            }
        }
    }

    async fn live_in_memory(&self, key: &str) -> Option<Entry<V>> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .get(key)
            .filter(|e| e.is_live_at(now))
            .cloned()
    }

    /// Remove `key` from memory and the backend. Absent keys are fine.
    pub async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.backend.delete(&mirror.object_key(key)).await {
                warn!("[{}] Failed to delete {} from {}: {}", self.name, key, mirror.backend.name(), e);
            }
        }
    }

    /// Snapshot of every live entry
    pub async fn live_entries(&self) -> Vec<(String, Entry<V>)> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.is_live_at(now))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Entries currently held in memory, live or not
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Evict every expired entry from memory, then from the backend
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = {
            let mut entries = self.entries.write().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| !e.is_live_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        if let Some(mirror) = &self.mirror {
            for key in &expired {
                self.purge_object(mirror, key).await;
            }
        }

        if !expired.is_empty() {
            info!("[{}] Swept {} expired entries", self.name, expired.len());
        }
        expired.len()
    }

    /// Populate memory from the backend, deleting objects that already expired
    ///
    /// Objects that fail to load are logged and skipped; only a listing
    /// failure is returned as an error.
    pub async fn load_from_backend(&self) -> Result<usize, BackendError> {
        let Some(mirror) = &self.mirror else {
            return Ok(0);
        };

        let now = self.clock.now();
        let object_keys = mirror.backend.list(&format!("{}/", mirror.prefix)).await?;
        let mut loaded = 0;

        for object_key in object_keys {
            let Some(key) = mirror.key_from_object(&object_key) else {
                debug!("[{}] Skipping foreign object {}", self.name, object_key);
                continue;
            };

            let entry = match self.load_object(mirror, &object_key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!("[{}] Failed to load {}: {}", self.name, object_key, e);
                    continue;
                }
            };

            if !entry.is_live_at(now) {
                self.purge_object(mirror, key).await;
                continue;
            }

            self.entries
                .write()
                .await
                .entry(key.to_string())
                .or_insert(entry);
            loaded += 1;
        }

        info!("[{}] Loaded {} entries from {}", self.name, loaded, mirror.backend.name());
        Ok(loaded)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` flips to true
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        spawn_periodic(store.name, interval, shutdown, move || {
            let store = Arc::clone(&store);
            async move {
                store.sweep().await;
            }
        })
    }
}

/// Run `task` on a fixed interval until the shutdown flag is set
///
/// The first run happens one full interval after spawning.
pub(crate) fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => task().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("[{}] sweeper stopped", name);
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, ObjectBackend, ObjectMeta};
    use crate::clock::ManualClock;
    use async_trait::async_trait;

    const HOUR: Duration = Duration::from_secs(3600);

    /// Memory backend whose reads and deletes take a while
    struct SlowBackend {
        inner: Arc<MemoryBackend>,
        get_delay: Duration,
        delete_delay: Duration,
    }

    #[async_trait]
    impl ObjectBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            metadata: HashMap<String, String>,
        ) -> Result<(), BackendError> {
            self.inner.put(key, body, metadata).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            let body = self.inner.get(key).await;
            tokio::time::sleep(self.get_delay).await;
            body
        }

        async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BackendError> {
            self.inner.head(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<(), BackendError> {
            tokio::time::sleep(self.delete_delay).await;
            self.inner.delete(key).await
        }
    }

    fn slow_store(
        clock: Arc<ManualClock>,
        inner: Arc<MemoryBackend>,
        get_delay: Duration,
        delete_delay: Duration,
    ) -> Arc<ExpiringStore<String>> {
        let backend = Arc::new(SlowBackend {
            inner,
            get_delay,
            delete_delay,
        });
        Arc::new(linked_store_on(clock, backend))
    }

    fn linked_store_on(clock: Arc<ManualClock>, backend: SharedBackend) -> ExpiringStore<String> {
        ExpiringStore::new("test")
            .with_clock(clock)
            .with_backend(backend, "things")
    }

    async fn stored_value(backend: &MemoryBackend, object_key: &str) -> Option<String> {
        let raw = backend.get(object_key).await.unwrap()?;
        let entry: Entry<String> = serde_json::from_slice(&raw).unwrap();
        Some(entry.value)
    }

    fn memory_store(clock: Arc<ManualClock>) -> ExpiringStore<String> {
        ExpiringStore::new("test").with_clock(clock)
    }

    fn linked_store(clock: Arc<ManualClock>, backend: Arc<MemoryBackend>) -> ExpiringStore<String> {
        linked_store_on(clock, backend)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = memory_store(ManualClock::starting_now());
        store.put("k", "v".to_string(), HOUR).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        assert!(store.get("other").await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let clock = ManualClock::starting_now();
        let store = memory_store(clock.clone());
        store.put("k", "v".to_string(), Duration::from_secs(10)).await;

        clock.advance(Duration::from_millis(9_999));
        assert!(store.get("k").await.is_some());

        clock.advance(Duration::from_millis(1));
        assert!(store.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_read_deletes_eagerly() {
        let clock = ManualClock::starting_now();
        let store = memory_store(clock.clone());
        store.put("k", "v".to_string(), Duration::from_secs(1)).await;

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.len().await, 1);
        assert!(store.get("k").await.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_put_resets_expiry() {
        let clock = ManualClock::starting_now();
        let store = memory_store(clock.clone());
        store.put("k", "a".to_string(), Duration::from_secs(10)).await;

        clock.advance(Duration::from_secs(8));
        store.put("k", "b".to_string(), Duration::from_secs(10)).await;

        clock.advance(Duration::from_secs(8));
        assert_eq!(store.get("k").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_zero_ttl_still_orders_timestamps() {
        let store = memory_store(ManualClock::starting_now());
        let entry = store.put("k", "v".to_string(), Duration::ZERO).await;
        assert!(entry.expires_at > entry.created_at);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let store = linked_store(ManualClock::starting_now(), backend.clone());
        store.put("k", "v".to_string(), HOUR).await;

        store.delete("k").await;
        store.delete("k").await;
        assert!(store.get("k").await.is_none());
        assert!(!backend.contains("things/k.json"));
    }

    #[tokio::test]
    async fn test_write_through_layout() {
        let backend = Arc::new(MemoryBackend::new());
        let store = linked_store(ManualClock::starting_now(), backend.clone());
        store.put_owned("abc", "hello".to_string(), HOUR, 42).await;

        let raw = backend.get("things/abc.json").await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["content"], "hello");
        assert_eq!(json["owner_user_id"], 42);
        assert!(json["created_at"].is_string());
        assert!(json["expires_at"].is_string());
    }

    #[tokio::test]
    async fn test_read_through_populates_memory() {
        let clock = ManualClock::starting_now();
        let backend = Arc::new(MemoryBackend::new());

        let first = linked_store(clock.clone(), backend.clone());
        first.put("k", "persisted".to_string(), HOUR).await;

        let second = linked_store(clock.clone(), backend.clone());
        assert_eq!(second.len().await, 0);
        assert_eq!(second.get("k").await.as_deref(), Some("persisted"));
        assert_eq!(second.len().await, 1);
    }

    #[tokio::test]
    async fn test_read_through_deletes_expired_object() {
        let clock = ManualClock::starting_now();
        let backend = Arc::new(MemoryBackend::new());

        linked_store(clock.clone(), backend.clone())
            .put("k", "old".to_string(), Duration::from_secs(5))
            .await;
        clock.advance(Duration::from_secs(6));

        let fresh = linked_store(clock.clone(), backend.clone());
        assert!(fresh.get("k").await.is_none());
        assert!(!backend.contains("things/k.json"));
    }

    #[tokio::test]
    async fn test_put_during_expired_read_through_survives() {
        let clock = ManualClock::starting_now();
        let inner = Arc::new(MemoryBackend::new());

        let now = clock.now();
        let stale = Entry {
            value: "stale".to_string(),
            created_at: now - chrono::Duration::hours(2),
            expires_at: now - chrono::Duration::hours(1),
            owner_id: None,
        };
        inner
            .put("things/k.json", serde_json::to_vec(&stale).unwrap(), HashMap::new())
            .await
            .unwrap();

        let store = slow_store(clock, inner.clone(), Duration::from_millis(200), Duration::ZERO);
        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.get("k").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.put("k", "fresh".to_string(), HOUR).await;

        assert_eq!(reader.await.unwrap().as_deref(), Some("fresh"));
        assert_eq!(store.get("k").await.as_deref(), Some("fresh"));
        assert_eq!(stored_value(&inner, "things/k.json").await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_put_during_sweep_delete_stays_mirrored() {
        let clock = ManualClock::starting_now();
        let inner = Arc::new(MemoryBackend::new());
        let store = slow_store(clock.clone(), inner.clone(), Duration::ZERO, Duration::from_millis(200));

        store.put("k", "old".to_string(), HOUR).await;
        clock.advance(2 * HOUR);

        let sweeper = {
            let store = store.clone();
            tokio::spawn(async move { store.sweep().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.put("k", "fresh".to_string(), HOUR).await;

        assert_eq!(sweeper.await.unwrap(), 1);
        assert_eq!(store.get("k").await.as_deref(), Some("fresh"));
        assert_eq!(stored_value(&inner, "things/k.json").await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_memory() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_offline(true);
        let store = linked_store(ManualClock::starting_now(), backend.clone());

        store.put("k", "v".to_string(), HOUR).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));

        store.delete("k").await;
        assert!(store.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_backend_object_is_absent() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .put("things/bad.json", b"not json".to_vec(), HashMap::new())
            .await
            .unwrap();

        let store = linked_store(ManualClock::starting_now(), backend);
        assert!(store.get("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_memory_and_backend() {
        let clock = ManualClock::starting_now();
        let backend = Arc::new(MemoryBackend::new());
        let store = linked_store(clock.clone(), backend.clone());

        store.put("short", "a".to_string(), Duration::from_secs(60)).await;
        store.put("long", "b".to_string(), HOUR).await;

        clock.advance(Duration::from_secs(120));
        assert_eq!(store.sweep().await, 1);
        assert_eq!(store.len().await, 1);
        assert!(!backend.contains("things/short.json"));
        assert!(backend.contains("things/long.json"));
    }

    #[tokio::test]
    async fn test_sweep_continues_when_backend_down() {
        let clock = ManualClock::starting_now();
        let backend = Arc::new(MemoryBackend::new());
        let store = linked_store(clock.clone(), backend.clone());
        store.put("a", "1".to_string(), Duration::from_secs(1)).await;
        store.put("b", "2".to_string(), Duration::from_secs(1)).await;

        clock.advance(Duration::from_secs(2));
        backend.set_offline(true);
        assert_eq!(store.sweep().await, 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_load_from_backend() {
        let clock = ManualClock::starting_now();
        let backend = Arc::new(MemoryBackend::new());
        let writer = linked_store(clock.clone(), backend.clone());
        writer.put("live", "x".to_string(), HOUR).await;
        writer.put("dead", "y".to_string(), Duration::from_secs(30)).await;
        backend
            .put("things/nested/skip.json", b"{}".to_vec(), HashMap::new())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));

        let reader = linked_store(clock.clone(), backend.clone());
        assert_eq!(reader.load_from_backend().await.unwrap(), 1);
        assert_eq!(reader.get("live").await.as_deref(), Some("x"));
        assert!(!backend.contains("things/dead.json"));
    }

    #[tokio::test]
    async fn test_load_from_backend_list_failure() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_offline(true);
        let store = linked_store(ManualClock::starting_now(), backend);
        assert!(store.load_from_backend().await.is_err());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let store = Arc::new(memory_store(ManualClock::starting_now()));
        let (tx, rx) = watch::channel(false);
        let handle = store.spawn_sweeper(Duration::from_millis(20), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
