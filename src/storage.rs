//! Content-addressed blob storage for source documents and page images.
//!
//! Every blob is keyed by the SHA-256 of its bytes, so `put` is idempotent:
//! storing the same bytes twice returns the same [`ContentId`] and keeps a
//! single copy.
//!
//! ## Durability
//!
//! [`FsStorage::put`] writes into `tmp/`, fsyncs the file, renames it into
//! `blobs/<2-hex-prefix>/<id>` and fsyncs the parent directory before
//! returning. A crash mid-write leaves only a temp file, which
//! [`FsStorage::open`] removes, so partially written blobs are never visible.

use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Hex-encoded SHA-256 of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Derive the id of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        ContentId(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentId {
    type Err = StorageError;

    /// Only 64 lowercase hex chars are accepted; this also keeps ids safe to
    /// use as file names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(ContentId(s.to_string()))
        } else {
            Err(StorageError::InvalidContentId(s.to_string()))
        }
    }
}

impl TryFrom<String> for ContentId {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}

/// Blob store used by the ingress (documents) and the workers (pages).
///
/// Implementations must be safe for concurrent use by many workers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `bytes` and return their content id. Durable once it returns.
    async fn put(&self, bytes: &[u8]) -> Result<ContentId, StorageError>;

    /// Read a blob. `StorageError::NotFound` if absent.
    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, StorageError>;

    /// Remove a blob. Deleting an absent blob is not an error.
    async fn delete(&self, id: &ContentId) -> Result<(), StorageError>;

    /// Whether a blob is present.
    async fn contains(&self, id: &ContentId) -> Result<bool, StorageError>;
}

// ── Filesystem backend ───────────────────────────────────────────────────

/// Durable filesystem store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Open (or create) a store under `root`, discarding leftover temp files.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let storage = Self { root };
        let tmp = storage.tmp_dir();
        tokio::fs::create_dir_all(storage.root.join("blobs"))
            .await
            .map_err(StorageError::io("create blob directory"))?;
        tokio::fs::create_dir_all(&tmp)
            .await
            .map_err(StorageError::io("create temp directory"))?;

        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&tmp)
            .await
            .map_err(StorageError::io("scan temp directory"))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StorageError::io("scan temp directory"))?
        {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!("Could not remove stale temp file {}: {}", entry.path().display(), e);
            } else {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} partially written blobs", removed);
        }
        info!("Storage opened at {}", storage.root.display());
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// `blobs/ab/abcdef…`: two-level fan-out on the first hex byte.
    fn blob_path(&self, id: &ContentId) -> PathBuf {
        self.root.join("blobs").join(&id.as_str()[..2]).join(id.as_str())
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn put(&self, bytes: &[u8]) -> Result<ContentId, StorageError> {
        let id = ContentId::of(bytes);
        let path = self.blob_path(&id);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(StorageError::io("stat blob"))?
        {
            debug!("Blob {} already stored", id);
            return Ok(id);
        }

        let tmp_dir = self.tmp_dir();
        let data = bytes.to_vec();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_durably(&tmp_dir, &target, &data))
            .await
            .map_err(|e| StorageError::Io {
                op: "write blob",
                source: std::io::Error::other(e.to_string()),
            })??;

        debug!("Stored blob {} ({} bytes)", id, bytes.len());
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { id: id.clone() })
            }
            Err(e) => Err(StorageError::Io {
                op: "read blob",
                source: e,
            }),
        }
    }

    async fn delete(&self, id: &ContentId) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => {
                debug!("Deleted blob {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io {
                op: "delete blob",
                source: e,
            }),
        }
    }

    async fn contains(&self, id: &ContentId) -> Result<bool, StorageError> {
        tokio::fs::try_exists(self.blob_path(id))
            .await
            .map_err(StorageError::io("stat blob"))
    }
}

/// Temp file → fsync → rename → fsync(dir).
pub(crate) fn write_durably(tmp_dir: &Path, target: &Path, data: &[u8]) -> Result<(), StorageError> {
    let parent = target
        .parent()
        .ok_or_else(|| StorageError::Io {
            op: "resolve blob directory",
            source: std::io::Error::other("target has no parent"),
        })?;
    std::fs::create_dir_all(parent).map_err(StorageError::io("create blob directory"))?;

    let mut tmp =
        tempfile::NamedTempFile::new_in(tmp_dir).map_err(StorageError::io("create temp file"))?;
    tmp.write_all(data).map_err(StorageError::io("write temp file"))?;
    tmp.as_file()
        .sync_all()
        .map_err(StorageError::io("fsync temp file"))?;
    tmp.persist(target)
        .map_err(|e| StorageError::Io {
            op: "rename temp file",
            source: e.error,
        })?;
    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(StorageError::io("fsync directory"))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

// ── In-memory backend ────────────────────────────────────────────────────

/// Non-durable store with the same contract, for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    blobs: Arc<Mutex<HashMap<ContentId, Arc<Vec<u8>>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ContentId, Arc<Vec<u8>>>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, bytes: &[u8]) -> Result<ContentId, StorageError> {
        let id = ContentId::of(bytes);
        self.lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(bytes.to_vec()));
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(id)
            .map(|b| b.as_ref().clone())
            .ok_or_else(|| StorageError::NotFound { id: id.clone() })
    }

    async fn delete(&self, id: &ContentId) -> Result<(), StorageError> {
        self.lock().remove(id);
        Ok(())
    }

    async fn contains(&self, id: &ContentId) -> Result<bool, StorageError> {
        Ok(self.lock().contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_sha256_hex() {
        let id = ContentId::of(b"abc");
        assert_eq!(
            id.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn content_id_rejects_paths() {
        assert!("../etc/passwd".parse::<ContentId>().is_err());
        assert!("ABCDEF".parse::<ContentId>().is_err());
        assert!(ContentId::of(b"x").as_str().parse::<ContentId>().is_ok());
    }

    #[tokio::test]
    async fn fs_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).await.unwrap();

        let a = storage.put(b"page bytes").await.unwrap();
        let b = storage.put(b"page bytes").await.unwrap();
        assert_eq!(a, b);

        let shard = dir.path().join("blobs").join(&a.as_str()[..2]);
        let copies = std::fs::read_dir(shard).unwrap().count();
        assert_eq!(copies, 1, "identical bytes must be stored once");
        assert_eq!(storage.get(&a).await.unwrap(), b"page bytes");
    }

    #[tokio::test]
    async fn fs_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).await.unwrap();
        let err = storage.get(&ContentId::of(b"nope")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn fs_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).await.unwrap();
        let id = storage.put(b"doc").await.unwrap();
        storage.delete(&id).await.unwrap();
        storage.delete(&id).await.unwrap();
        assert!(!storage.contains(&id).await.unwrap());
    }

    #[tokio::test]
    async fn fs_open_discards_partial_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("tmp").join(".tmpXYZ"), b"half a page").unwrap();

        let _storage = FsStorage::open(dir.path()).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn memory_put_does_not_duplicate() {
        let storage = MemoryStorage::new();
        let a = storage.put(b"same").await.unwrap();
        let b = storage.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(storage.len(), 1);
    }
}
