//! Uploaded Artifacts
//!
//! User-submitted files stored directly in the backend as
//! `user_source_code/<ownerId>/<filename>` with an `uploaded_at` (RFC 3339)
//! metadata entry. An artifact is live for the retention period after its
//! upload; re-uploading the same name overwrites it and restarts the clock.
//! Objects without a readable `uploaded_at` are treated as expired.

use crate::backend::{BackendError, ObjectMeta, SharedBackend};
use crate::cache::spawn_periodic;
use crate::clock::{self, Clock};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backend prefix for uploaded files
pub const ARTIFACT_PREFIX: &str = "user_source_code";

/// File name used for a user's uploaded source code
pub const SOURCE_CODE_FILE: &str = "source_code.txt";

/// Metadata entry holding the upload time
pub const UPLOADED_AT: &str = "uploaded_at";

/// Listing entry for a stored artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactInfo {
    /// Full backend key, also the `/files/` path
    pub key: String,
    pub owner_id: i64,
    pub file_name: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Artifact body plus its listing entry
#[derive(Debug, Clone)]
pub struct ArtifactFile {
    pub info: ArtifactInfo,
    pub body: Vec<u8>,
}

pub struct ArtifactStore {
    backend: SharedBackend,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

pub fn artifact_key(owner_id: i64, file_name: &str) -> String {
    format!("{}/{}/{}", ARTIFACT_PREFIX, owner_id, file_name)
}

fn owner_prefix(owner_id: i64) -> String {
    format!("{}/{}/", ARTIFACT_PREFIX, owner_id)
}

/// Split `user_source_code/<owner>/<file>` into owner and file name
fn parse_key(key: &str) -> Option<(i64, &str)> {
    let rest = key.strip_prefix(ARTIFACT_PREFIX)?.strip_prefix('/')?;
    let (owner, file_name) = rest.split_once('/')?;
    if file_name.is_empty() || file_name.contains('/') {
        return None;
    }
    Some((owner.parse().ok()?, file_name))
}

impl ArtifactStore {
    pub fn new(backend: SharedBackend, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            retention,
            clock,
        }
    }

    fn info_from_meta(&self, meta: &ObjectMeta) -> Option<ArtifactInfo> {
        let (owner_id, file_name) = parse_key(&meta.key)?;
        let uploaded_at = match meta.metadata.get(UPLOADED_AT) {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    warn!("Invalid '{}' on {}: {}", UPLOADED_AT, meta.key, e);
                    return None;
                }
            },
            None => {
                debug!("No '{}' metadata on {}", UPLOADED_AT, meta.key);
                return None;
            }
        };

        Some(ArtifactInfo {
            key: meta.key.clone(),
            owner_id,
            file_name: file_name.to_string(),
            size: meta.size,
            uploaded_at,
            expires_at: clock::add_duration(uploaded_at, self.retention),
        })
    }

    /// Live listing entry for `key`, `None` if absent, expired or outside the prefix
    async fn live_info(&self, key: &str) -> Result<Option<ArtifactInfo>, BackendError> {
        if parse_key(key).is_none() {
            return Ok(None);
        }
        let Some(meta) = self.backend.head(key).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        Ok(self.info_from_meta(&meta).filter(|info| now < info.expires_at))
    }

    /// Store (or overwrite) a file for `owner_id`
    pub async fn store(&self, owner_id: i64, file_name: &str, body: Vec<u8>) -> Result<ArtifactInfo, BackendError> {
        let key = artifact_key(owner_id, file_name);
        if parse_key(&key).is_none() {
            return Err(BackendError::InvalidKey(key));
        }

        let uploaded_at = self.clock.now();
        let size = body.len() as u64;
        let mut metadata = HashMap::new();
        metadata.insert(
            UPLOADED_AT.to_string(),
            uploaded_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );

        self.backend.put(&key, body, metadata).await?;
        info!("Stored artifact {} ({} bytes)", key, size);

        Ok(ArtifactInfo {
            key,
            owner_id,
            file_name: file_name.to_string(),
            size,
            uploaded_at,
            expires_at: clock::add_duration(uploaded_at, self.retention),
        })
    }

    pub async fn store_source_code(&self, owner_id: i64, code: &str) -> Result<ArtifactInfo, BackendError> {
        self.store(owner_id, SOURCE_CODE_FILE, code.as_bytes().to_vec()).await
    }

    /// The user's live uploaded source code, if any
    pub async fn source_code(&self, owner_id: i64) -> Option<String> {
        let file = self.get_by_key(&artifact_key(owner_id, SOURCE_CODE_FILE)).await?;
        Some(String::from_utf8_lossy(&file.body).into_owned())
    }

    /// Live artifact at a full backend key. Backend errors read as absent.
    pub async fn get_by_key(&self, key: &str) -> Option<ArtifactFile> {
        let info = match self.live_info(key).await {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read artifact {}: {}", key, e);
                return None;
            }
        };

        match self.backend.get(key).await {
            Ok(Some(body)) => Some(ArtifactFile { info, body }),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read artifact {}: {}", key, e);
                None
            }
        }
    }

    /// Live artifacts owned by `owner_id`, sorted by key
    pub async fn list_by_owner(&self, owner_id: i64) -> Result<Vec<ArtifactInfo>, BackendError> {
        let now = self.clock.now();
        let mut files = Vec::new();

        for key in self.backend.list(&owner_prefix(owner_id)).await? {
            match self.backend.head(&key).await {
                Ok(Some(meta)) => {
                    if let Some(info) = self.info_from_meta(&meta) {
                        if now < info.expires_at {
                            files.push(info);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to retrieve metadata for {}: {}", key, e),
            }
        }

        Ok(files)
    }

    /// Delete every artifact owned by `owner_id`, live or not
    pub async fn delete_all_for_owner(&self, owner_id: i64) -> Result<usize, BackendError> {
        let keys = self.backend.list(&owner_prefix(owner_id)).await?;
        for key in &keys {
            self.backend.delete(key).await?;
        }
        if !keys.is_empty() {
            info!("Deleted {} artifacts for user {}", keys.len(), owner_id);
        }
        Ok(keys.len())
    }

    /// Delete every expired artifact from the backend
    pub async fn sweep(&self) -> usize {
        let keys = match self.backend.list(&format!("{}/", ARTIFACT_PREFIX)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("[artifacts] Sweep could not list objects: {}", e);
                return 0;
            }
        };

        let now = self.clock.now();
        let mut removed = 0;

        for key in keys {
            let expired = match self.backend.head(&key).await {
                Ok(Some(meta)) => self
                    .info_from_meta(&meta)
                    .map_or(true, |info| now >= info.expires_at),
                Ok(None) => false,
                Err(e) => {
                    warn!("[artifacts] Sweep could not inspect {}: {}", key, e);
                    false
                }
            };

            if expired {
                match self.backend.delete(&key).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("[artifacts] Sweep could not delete {}: {}", key, e),
                }
            }
        }

        if removed > 0 {
            info!("[artifacts] Swept {} expired files", removed);
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        spawn_periodic("artifacts", interval, shutdown, move || {
            let store = Arc::clone(&store);
            async move {
                store.sweep().await;
            }
        })
    }
}
