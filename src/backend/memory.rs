//! In-memory object backend
//!
//! Non-durable. Used as the test double for every store and as a fallback
//! backend for local development (`STORAGE_BACKEND=memory`).

use super::{validate_key, BackendError, ObjectBackend, ObjectMeta};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    metadata: HashMap<String, String>,
}

/// Map-backed object store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    /// When set, every call fails with `Unavailable`
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (all calls fail) or recovery
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), BackendError> {
        self.check_online()?;
        validate_key(key)?;
        self.objects
            .write()
            .insert(key.to_string(), StoredObject { body, metadata });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.check_online()?;
        validate_key(key)?;
        Ok(self.objects.read().get(key).map(|o| o.body.clone()))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BackendError> {
        self.check_online()?;
        validate_key(key)?;
        Ok(self.objects.read().get(key).map(|o| ObjectMeta {
            key: key.to_string(),
            size: o.body.len() as u64,
            metadata: o.metadata.clone(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        self.check_online()?;
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.check_online()?;
        validate_key(key)?;
        self.objects.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_head_delete() {
        let backend = MemoryBackend::new();
        let mut meta = HashMap::new();
        meta.insert("uploaded_at".to_string(), "2024-01-01T00:00:00Z".to_string());

        backend.put("a/one.txt", b"hello".to_vec(), meta).await.unwrap();

        assert_eq!(backend.get("a/one.txt").await.unwrap(), Some(b"hello".to_vec()));
        let head = backend.head("a/one.txt").await.unwrap().unwrap();
        assert_eq!(head.size, 5);
        assert_eq!(head.metadata["uploaded_at"], "2024-01-01T00:00:00Z");

        backend.delete("a/one.txt").await.unwrap();
        backend.delete("a/one.txt").await.unwrap();
        assert!(backend.get("a/one.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let backend = MemoryBackend::new();
        for key in ["a/1", "a/2", "ab/3", "b/4"] {
            backend.put(key, Vec::new(), HashMap::new()).await.unwrap();
        }

        assert_eq!(backend.list("a/").await.unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(backend.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_offline_fails() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert!(matches!(
            backend.get("a").await,
            Err(BackendError::Unavailable(_))
        ));
        backend.set_offline(false);
        assert!(backend.get("a").await.unwrap().is_none());
    }
}
