//! On-disk journal of job records: one JSON file per job, replaced
//! atomically on every change.

use crate::error::ServiceError;
use crate::model::{JobId, JobRecord};
use crate::storage::write_durably;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    /// Last revision written per job. Writes are serialised through this
    /// lock so an older snapshot can never replace a newer one.
    written: Mutex<HashMap<JobId, u64>>,
}

impl Journal {
    /// Open (or create) the journal directory. Temp files left by a write
    /// that never reached its rename are removed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ServiceError> {
        let dir = dir.into();
        let tmp = dir.join("tmp");
        tokio::fs::create_dir_all(&tmp)
            .await
            .map_err(|e| ServiceError::Journal(format!("create {}: {e}", dir.display())))?;

        let removed = clear_dir(&tmp)
            .await
            .map_err(|e| ServiceError::Journal(format!("scan {}: {e}", tmp.display())))?;
        if removed > 0 {
            info!("Removed {} partially written journal entries", removed);
        }
        Ok(Self {
            dir,
            written: Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Durably write `record`, unless a newer revision is already on disk.
    pub async fn write(&self, record: &JobRecord) -> Result<(), ServiceError> {
        let mut written = self.written.lock().await;
        if written.get(&record.id).is_some_and(|&rev| rev > record.revision) {
            debug!(
                "Skipping stale journal write for {} (rev {})",
                record.id, record.revision
            );
            return Ok(());
        }

        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| ServiceError::Journal(format!("serialise {}: {e}", record.id)))?;
        let tmp_dir = self.dir.join("tmp");
        let path = self.path(record.id);
        tokio::task::spawn_blocking(move || write_durably(&tmp_dir, &path, &bytes))
            .await
            .map_err(|e| ServiceError::Journal(format!("journal task panicked: {e}")))?
            .map_err(|e| ServiceError::Journal(e.to_string()))?;

        written.insert(record.id, record.revision);
        Ok(())
    }

    /// Forget a job.
    pub async fn remove(&self, id: JobId) -> Result<(), ServiceError> {
        let mut written = self.written.lock().await;
        written.remove(&id);
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::Journal(format!("remove {id}: {e}"))),
        }
    }

    /// Read every record. Unreadable files are logged and skipped.
    pub async fn load(&self) -> Result<Vec<JobRecord>, ServiceError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ServiceError::Journal(format!("scan {}: {e}", self.dir.display())))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServiceError::Journal(format!("scan {}: {e}", self.dir.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<JobRecord>(&b).map_err(|e| e.to_string()));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable journal entry {}: {}", path.display(), e),
            }
        }

        let mut written = self.written.lock().await;
        for r in &records {
            written.insert(r.id, r.revision);
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

/// Remove every file in `dir`, returning how many went.
async fn clear_dir(dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not remove stale temp file {}: {}", entry.path().display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_clears_leftover_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("tmp").join(".tmpA1b2C3"), b"{\"half").unwrap();

        let journal = Journal::open(dir.path()).await.unwrap();

        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
        assert!(journal.load().await.unwrap().is_empty());
    }
}
