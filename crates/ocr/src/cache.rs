use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::hash::CacheKey;
use crate::types::ExtractionResult;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub created_at: DateTime<Utc>,
    pub result: ExtractionResult,
}

/// Durable store of finished extractions. Never a source of truth: every
/// failure on the read side is reported as a miss.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn lookup(&self, key: &CacheKey) -> Option<ExtractionResult>;

    /// Best effort; failures are logged.
    async fn store(&self, key: &CacheKey, result: &ExtractionResult);

    /// Delete entries older than `max_age`. Returns how many were removed.
    async fn sweep(&self, max_age: chrono::Duration) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<usize, CacheError>;
}

/// One JSON file per key under a two-level fan-out; see [`CacheKey::entry_path`].
/// Distinct keys never touch the same file, so there is no cross-key locking.
pub struct FsResultCache {
    root: PathBuf,
    io_timeout: Duration,
    retention: chrono::Duration,
}

impl FsResultCache {
    pub fn new(
        root: impl Into<PathBuf>,
        io_timeout: Duration,
        retention: chrono::Duration,
    ) -> Self {
        Self { root: root.into(), io_timeout, retention }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| CacheError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a uniquely named temp file and rename, so readers never see
    /// a partial entry. Concurrent writers of one key: last rename wins.
    pub(crate) async fn write_entry(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
    ) -> Result<(), CacheError> {
        let path = key.entry_path(&self.root);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec(entry)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Every file below the fan-out directories.
    async fn files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut out = Vec::new();
        let mut top = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(shard) = top.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = tokio::fs::read_dir(shard.path()).await?;
            while let Some(file) = inner.next_entry().await? {
                if file.file_type().await?.is_file() {
                    out.push(file.path());
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ResultStore for FsResultCache {
    async fn lookup(&self, key: &CacheKey) -> Option<ExtractionResult> {
        let path = key.entry_path(&self.root);
        match tokio::time::timeout(self.io_timeout, self.read_entry(&path)).await {
            Err(_) => {
                warn!(%key, "Cache read exceeded {:?}, treating as miss", self.io_timeout);
                None
            }
            Ok(Err(e)) => {
                warn!(%key, "Unreadable cache entry, treating as miss: {e}");
                None
            }
            Ok(Ok(None)) => None,
            Ok(Ok(Some(entry))) => {
                if Utc::now() - entry.created_at > self.retention {
                    debug!(%key, "Cache entry expired");
                    return None;
                }
                Some(entry.result)
            }
        }
    }

    async fn store(&self, key: &CacheKey, result: &ExtractionResult) {
        let entry = CacheEntry { created_at: Utc::now(), result: result.clone() };
        match tokio::time::timeout(self.io_timeout, self.write_entry(key, &entry)).await {
            Err(_) => warn!(%key, "Cache write exceeded {:?}, skipped", self.io_timeout),
            Ok(Err(e)) => warn!(%key, "Cache write failed: {e}"),
            Ok(Ok(())) => debug!(%key, "Cached extraction result"),
        }
    }

    async fn sweep(&self, max_age: chrono::Duration) -> Result<usize, CacheError> {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;
        for path in self.files().await? {
            let stale = if path.extension().is_some_and(|ext| ext == "json") {
                match self.read_entry(&path).await {
                    Ok(Some(entry)) => entry.created_at < cutoff,
                    Ok(None) => false,
                    Err(e) => {
                        warn!("Removing unreadable cache entry: {e}");
                        true
                    }
                }
            } else {
                // Leftover temp files from interrupted writes.
                let modified = tokio::fs::metadata(&path).await?.modified()?;
                DateTime::<Utc>::from(modified) < cutoff
            };
            if stale {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        debug!(removed, "Cache sweep finished");
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let files = self.files().await?;
        let count = files.len();
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityReport;
    use crate::types::{ExtractionMetadata, Strategy};
    use std::sync::Arc;

    fn result(text: &str) -> ExtractionResult {
        ExtractionResult {
            text: text.to_string(),
            confidence: 81.5,
            strategy: Strategy::Standard,
            metadata: ExtractionMetadata {
                attempts: vec![],
                quality_assessment: QualityReport::undecodable(),
                cache_hit: false,
                escalated: false,
                elapsed_ms: 12,
                stages: vec![],
            },
        }
    }

    fn cache(dir: &Path) -> FsResultCache {
        FsResultCache::new(dir, Duration::from_secs(2), chrono::Duration::days(7))
    }

    #[tokio::test]
    async fn store_then_lookup_returns_same_result() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let key = CacheKey::derive(b"image", &"receipt").unwrap();
        assert!(cache.lookup(&key).await.is_none());

        cache.store(&key, &result("TOTAL 5.50")).await;
        assert_eq!(cache.lookup(&key).await, Some(result("TOTAL 5.50")));
        assert!(key.entry_path(dir.path()).exists());

        let other = CacheKey::derive(b"image", &"invoice").unwrap();
        assert!(cache.lookup(&other).await.is_none());
    }

    #[tokio::test]
    async fn survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::derive(b"persisted", &1).unwrap();
        cache(dir.path()).store(&key, &result("kept")).await;
        assert_eq!(cache(dir.path()).lookup(&key).await.map(|r| r.text), Some("kept".into()));
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let key = CacheKey::derive(b"x", &"general").unwrap();
        let path = key.entry_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ truncated").unwrap();
        assert!(cache.lookup(&key).await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let key = CacheKey::derive(b"old", &"receipt").unwrap();
        let entry = CacheEntry {
            created_at: Utc::now() - chrono::Duration::days(30),
            result: result("stale"),
        };
        cache.write_entry(&key, &entry).await.unwrap();
        assert!(cache.lookup(&key).await.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_old_and_broken_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let fresh = CacheKey::derive(b"fresh", &0).unwrap();
        let old = CacheKey::derive(b"old", &0).unwrap();
        let broken = CacheKey::derive(b"broken", &0).unwrap();

        cache.store(&fresh, &result("fresh")).await;
        let entry = CacheEntry {
            created_at: Utc::now() - chrono::Duration::days(8),
            result: result("old"),
        };
        cache.write_entry(&old, &entry).await.unwrap();
        let broken_path = broken.entry_path(dir.path());
        std::fs::create_dir_all(broken_path.parent().unwrap()).unwrap();
        std::fs::write(&broken_path, b"not json").unwrap();

        let removed = cache.sweep(chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.lookup(&fresh).await.is_some());
        assert!(!old.entry_path(dir.path()).exists());
        assert!(!broken_path.exists());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir.path().join("cache"));
        for i in 0..3u8 {
            cache.store(&CacheKey::derive(&[i], &0).unwrap(), &result("r")).await;
        }
        assert_eq!(cache.clear().await.unwrap(), 3);
        assert_eq!(cache.clear().await.unwrap(), 0);
        assert!(cache.lookup(&CacheKey::derive(&[0u8], &0).unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(dir.path()));
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                // Half the tasks share a key to exercise last-writer-wins.
                let key = CacheKey::derive(&[i % 8], &"receipt").unwrap();
                cache.store(&key, &result(&format!("text-{}", i % 8))).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for i in 0..8u8 {
            let key = CacheKey::derive(&[i], &"receipt").unwrap();
            assert_eq!(cache.lookup(&key).await.map(|r| r.text), Some(format!("text-{i}")));
        }
        let leftovers = cache
            .files()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
