//! Durable Object Backend
//!
//! Key-prefixed blob storage used to mirror responses, hold uploaded
//! artifacts and append the interaction log. The stores only ever talk to the
//! [`ObjectBackend`] trait:
//! - `redis`: production backend (one hash per object)
//! - `fs`: local directory with metadata sidecars
//! - `memory`: in-process map, used as the test double

pub mod fs;
pub mod memory;
pub mod redis;

pub use self::fs::FsBackend;
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Error types for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Object metadata returned by `head`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub metadata: HashMap<String, String>,
}

/// Key-prefixed blob store
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short name for logging ("redis", "fs", "memory")
    fn name(&self) -> &'static str;

    /// Create or overwrite an object. Metadata replaces any previous metadata.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), BackendError>;

    /// Object body, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Object size and metadata without the body, `None` if absent
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BackendError>;

    /// All keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Remove an object. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;
}

pub type SharedBackend = Arc<dyn ObjectBackend>;

/// Reject keys that could escape the namespace (absolute, `..`, empty segments)
pub fn validate_key(key: &str) -> Result<(), BackendError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");

    if bad {
        return Err(BackendError::InvalidKey(key.to_string()));
    }
    Ok(())
}
