//! Memoized notebook snapshots keyed by file path and modification time.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use tracing::{debug, warn};

use crate::application::backend::NotebookSource;
use crate::domain::cells::NotebookSnapshot;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";
pub(crate) const METRIC_MEMO_HIT: &str = "gateway_snapshot_memo_hit_total";
pub(crate) const METRIC_MEMO_MISS: &str = "gateway_snapshot_memo_miss_total";

type MemoKey = (PathBuf, SystemTime);

/// Wraps a [`NotebookSource`] so an unchanged file is only loaded once.
///
/// Failed loads are remembered as well; touching the file invalidates them.
pub struct MemoizedNotebookSource {
    inner: Arc<dyn NotebookSource>,
    entries: Mutex<LruCache<MemoKey, Option<NotebookSnapshot>>>,
}

impl MemoizedNotebookSource {
    pub fn new(inner: Arc<dyn NotebookSource>, limit: NonZeroUsize) -> Self {
        Self {
            inner,
            entries: Mutex::new(LruCache::new(limit)),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotebookSource for MemoizedNotebookSource {
    async fn notebook_snapshot(&self, path: &Path) -> Option<NotebookSnapshot> {
        let modified = match tokio::fs::metadata(path)
            .await
            .and_then(|metadata| metadata.modified())
        {
            Ok(modified) => modified,
            Err(err) => {
                warn!(
                    target = "marimo_gateway::cache::store",
                    path = %path.display(),
                    error = %err,
                    "Failed to stat notebook"
                );
                return None;
            }
        };

        let key = (path.to_path_buf(), modified);
        let cached = mutex_lock(&self.entries, SOURCE, "notebook_snapshot.get")
            .get(&key)
            .cloned();
        if let Some(snapshot) = cached {
            counter!(METRIC_MEMO_HIT).increment(1);
            return snapshot;
        }

        counter!(METRIC_MEMO_MISS).increment(1);
        debug!(
            target = "marimo_gateway::cache::store",
            path = %path.display(),
            "Loading notebook snapshot"
        );
        let snapshot = self.inner.notebook_snapshot(path).await;
        mutex_lock(&self.entries, SOURCE, "notebook_snapshot.put").put(key, snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::{self, File};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::domain::cells::{NotebookCell, SnapshotMetadata};

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NotebookSource for CountingSource {
        async fn notebook_snapshot(&self, _path: &Path) -> Option<NotebookSnapshot> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Some(NotebookSnapshot {
                version: "1".to_string(),
                metadata: SnapshotMetadata::default(),
                cells: vec![NotebookCell::new(format!("cell-{call}"), "x = 1")],
            })
        }
    }

    fn limit(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    #[tokio::test]
    async fn unchanged_file_is_loaded_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.py");
        fs::write(&path, "").unwrap();

        let inner = Arc::new(CountingSource::default());
        let memo = MemoizedNotebookSource::new(inner.clone(), limit(4));

        let first = memo.notebook_snapshot(&path).await.unwrap();
        let second = memo.notebook_snapshot(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.len(), 1);
    }

    #[tokio::test]
    async fn modification_time_invalidates_the_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.py");
        fs::write(&path, "").unwrap();

        let inner = Arc::new(CountingSource::default());
        let memo = MemoizedNotebookSource::new(inner.clone(), limit(4));
        memo.notebook_snapshot(&path).await.unwrap();

        let later = SystemTime::now() + Duration::from_secs(60);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let refreshed = memo.notebook_snapshot(&path).await.unwrap();
        assert_eq!(refreshed.cells[0].id, "cell-1");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_file_yields_none_without_loading() {
        let dir = TempDir::new().unwrap();
        let inner = Arc::new(CountingSource::default());
        let memo = MemoizedNotebookSource::new(inner.clone(), limit(1));

        assert!(memo.notebook_snapshot(&dir.path().join("gone.py")).await.is_none());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        assert!(memo.is_empty());
    }
}
