//! Filesystem object backend
//!
//! Objects live at `<root>/<key>`; metadata is a JSON map at
//! `<root>/.meta/<key>.json`. Listing skips the `.meta` tree.

use super::{validate_key, BackendError, ObjectBackend, ObjectMeta};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

const META_DIR: &str = ".meta";

/// Infix of in-flight temp files, skipped by `list`
const TMP_MARKER: &str = ".tmp-write-";

/// Directory-backed object store
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Open (and create) the root directory. `~` is expanded.
    pub async fn open(root: &str) -> Result<Self, BackendError> {
        let root = PathBuf::from(shellexpand::tilde(root).into_owned());
        tokio::fs::create_dir_all(root.join(META_DIR)).await?;
        info!("Filesystem backend opened: {}", root.display());
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, BackendError> {
        validate_key(key)?;
        if key == META_DIR || key.starts_with(&format!("{}/", META_DIR)) {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{}.json", key))
    }
}

async fn ensure_parent(path: &Path) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Write to a uniquely named temp file, then rename over `path`
///
/// Readers never see a partial body and concurrent writers never share a
/// temp file.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), BackendError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!("{}{}", TMP_MARKER, Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), BackendError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectBackend for FsBackend {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), BackendError> {
        let path = self.object_path(key)?;
        let meta_path = self.meta_path(key);

        ensure_parent(&path).await?;
        ensure_parent(&meta_path).await?;

        write_atomic(&path, &body).await?;

        if metadata.is_empty() {
            remove_if_exists(&meta_path).await?;
        } else {
            write_atomic(&meta_path, &serde_json::to_vec(&metadata)?).await?;
        }

        debug!("fs put {} ({} bytes)", key, body.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BackendError> {
        let path = self.object_path(key)?;
        let size = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m.len(),
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let metadata = match tokio::fs::read(self.meta_path(key)).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size,
            metadata,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if dir == self.root && entry.file_name() == META_DIR {
                        continue;
                    }
                    pending.push(path);
                } else if file_type.is_file() {
                    let Ok(rel) = path.strip_prefix(&self.root) else {
                        continue;
                    };
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.contains(TMP_MARKER) {
                        continue;
                    }
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.object_path(key)?;
        remove_if_exists(&path).await?;
        remove_if_exists(&self.meta_path(key)).await?;
        debug!("fs delete {}", key);
        Ok(())
    }
}
