//! Durable processed-task store.
//!
//! The in-memory processed set is authoritative for the lifetime of the
//! process; the store exists so a restart does not re-dispatch finished
//! work. `mark` is durable before it returns (temp file + fsync + rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use pilot_types::{TaskOutcome, TrackerKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedRecord {
    pub outcome: TaskOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Durable set of `(tracker, native-id) → outcome`. Implementations own
/// their locking and must be safe for arbitrary concurrent callers.
#[async_trait]
pub trait ProcessedStore: Send + Sync {
    /// Durable before it returns. Re-marking overwrites the outcome.
    async fn mark(
        &self,
        tracker: TrackerKind,
        native_id: &str,
        outcome: TaskOutcome,
    ) -> Result<(), StoreError>;

    async fn unmark(&self, tracker: TrackerKind, native_id: &str) -> Result<(), StoreError>;

    async fn is(&self, tracker: TrackerKind, native_id: &str) -> Result<bool, StoreError>;

    /// Every completed `mark` since the store was created, for one tracker.
    async fn load_all(
        &self,
        tracker: TrackerKind,
    ) -> Result<HashMap<String, ProcessedRecord>, StoreError>;
}

type TrackerMap = HashMap<String, ProcessedRecord>;

/// One JSON file per tracker under `<dir>/processed/`. Writes go through a
/// temp file that is fsynced and renamed into place.
pub struct FileProcessedStore {
    dir: PathBuf,
    /// Serializes writers and caches file contents once loaded.
    inner: Mutex<HashMap<TrackerKind, TrackerMap>>,
}

impl FileProcessedStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("processed"),
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, tracker: TrackerKind) -> PathBuf {
        self.dir.join(format!("{}.json", tracker.as_str()))
    }

    async fn load_file(&self, tracker: TrackerKind) -> Result<TrackerMap, StoreError> {
        let path = self.file_path(tracker);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        // A corrupt file loses history rather than wedging the poller.
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!("processed store {} is corrupt ({e}); starting empty", path.display());
                Ok(HashMap::new())
            }
        }
    }

    async fn ensure_loaded<'a>(
        &self,
        cache: &'a mut HashMap<TrackerKind, TrackerMap>,
        tracker: TrackerKind,
    ) -> Result<&'a mut TrackerMap, StoreError> {
        if !cache.contains_key(&tracker) {
            let map = self.load_file(tracker).await?;
            cache.insert(tracker, map);
        }
        Ok(cache.get_mut(&tracker).unwrap())
    }

    async fn persist(&self, tracker: TrackerKind, map: &TrackerMap) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.file_path(tracker);
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(map)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessedStore for FileProcessedStore {
    async fn mark(
        &self,
        tracker: TrackerKind,
        native_id: &str,
        outcome: TaskOutcome,
    ) -> Result<(), StoreError> {
        let mut cache = self.inner.lock().await;
        let map = self.ensure_loaded(&mut cache, tracker).await?;
        map.insert(
            native_id.to_string(),
            ProcessedRecord {
                outcome,
                recorded_at: Utc::now(),
            },
        );
        let snapshot = map.clone();
        self.persist(tracker, &snapshot).await
    }

    async fn unmark(&self, tracker: TrackerKind, native_id: &str) -> Result<(), StoreError> {
        let mut cache = self.inner.lock().await;
        let map = self.ensure_loaded(&mut cache, tracker).await?;
        if map.remove(native_id).is_none() {
            return Ok(());
        }
        let snapshot = map.clone();
        self.persist(tracker, &snapshot).await
    }

    async fn is(&self, tracker: TrackerKind, native_id: &str) -> Result<bool, StoreError> {
        let mut cache = self.inner.lock().await;
        let map = self.ensure_loaded(&mut cache, tracker).await?;
        Ok(map.contains_key(native_id))
    }

    async fn load_all(
        &self,
        tracker: TrackerKind,
    ) -> Result<HashMap<String, ProcessedRecord>, StoreError> {
        let mut cache = self.inner.lock().await;
        let map = self.ensure_loaded(&mut cache, tracker).await?;
        Ok(map.clone())
    }
}
