//! Checkpoint store: the last processed global position per
//! (pooler, source, handler).
//!
//! Rows for different poolers never overlap, so runners share one store
//! without contending on keys. Positions are written only after a batch has
//! been fully dispatched; a crash between dispatch and write redelivers the
//! batch on restart.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifies one checkpoint row by contract names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// Contract name of the pooler.
    pub pooler: String,
    /// Contract name of the source.
    pub source: String,
    /// Contract name of the handler.
    pub handler: String,
}

impl CheckpointKey {
    /// Build a key from its three contract names.
    ///
    /// # Arguments
    ///
    /// * `pooler` - Contract name of the pooler owning the row.
    /// * `source` - Contract name of the source the position refers to.
    /// * `handler` - Contract name of the handler that processed it.
    pub fn new(
        pooler: impl Into<String>,
        source: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            pooler: pooler.into(),
            source: source.into(),
            handler: handler.into(),
        }
    }
}

/// Persistence for subscription progress.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// The stored position for `key`, or `None` if never recorded.
    async fn get(&self, key: &CheckpointKey) -> io::Result<Option<u64>>;

    /// Upsert every `(key, position)` pair.
    ///
    /// The rows of one pooler are written together or not at all. A batch
    /// that spans several poolers may be applied for some of them before an
    /// error is returned; runners only ever save rows of their own pooler.
    async fn save(&self, positions: &[(CheckpointKey, u64)]) -> io::Result<()>;

    /// Delete every row of `pooler` whose handler is not in `handlers` or
    /// whose source is not in `sources`. Returns the number of rows removed.
    async fn remove_not_used_states(
        &self,
        pooler: &str,
        handlers: &[&str],
        sources: &[&str],
    ) -> io::Result<usize>;
}

fn is_used(handlers: &[&str], sources: &[&str], handler: &str, source: &str) -> bool {
    handlers.contains(&handler) && sources.contains(&source)
}

/// Volatile [`CheckpointStore`]. Cheap to clone; clones share rows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    rows: Arc<Mutex<BTreeMap<CheckpointKey, u64>>>,
}

impl InMemoryCheckpointStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every stored row, in key order.
    pub fn rows(&self) -> Vec<(CheckpointKey, u64)> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &CheckpointKey) -> io::Result<Option<u64>> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(key).copied())
    }

    async fn save(&self, positions: &[(CheckpointKey, u64)]) -> io::Result<()> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, position) in positions {
            rows.insert(key.clone(), *position);
        }
        Ok(())
    }

    async fn remove_not_used_states(
        &self,
        pooler: &str,
        handlers: &[&str],
        sources: &[&str],
    ) -> io::Result<usize> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|key, _| {
            key.pooler != pooler || is_used(handlers, sources, &key.handler, &key.source)
        });
        Ok(before - rows.len())
    }
}

/// On-disk form of one pooler's checkpoint file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolerCheckpoint {
    /// Positions keyed by (source, handler).
    #[serde(with = "cursor_map")]
    positions: HashMap<(String, String), u64>,
}

/// JSON object keys must be strings, so each `(source, handler)` pair is
/// encoded as `"source/handler"`.
mod cursor_map {
    use std::collections::HashMap;

    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) const SEP: char = '/';

    pub fn serialize<S>(map: &HashMap<(String, String), u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut ser_map = serializer.serialize_map(Some(map.len()))?;
        for ((source, handler), position) in map {
            let key = format!("{source}{SEP}{handler}");
            ser_map.serialize_entry(&key, position)?;
        }
        ser_map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<(String, String), u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: HashMap<String, u64> = HashMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, position)| {
                let (source, handler) = key.split_once(SEP).ok_or_else(|| {
                    serde::de::Error::custom(format!("checkpoint key missing '{SEP}' separator: {key}"))
                })?;
                Ok(((source.to_string(), handler.to_string()), position))
            })
            .collect()
    }
}

/// [`CheckpointStore`] keeping one JSON file per pooler at
/// `<dir>/<pooler>/checkpoint.json`.
///
/// Writes are atomic via temp-file rename. Contract names used with this
/// store must not contain path separators.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileCheckpointStore {
    /// Store checkpoint files under `dir`.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory holding one subdirectory per pooler, usually
    ///   [`StoreLayout::checkpoints_dir`](crate::StoreLayout::checkpoints_dir).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn pooler_dir(&self, pooler: &str) -> io::Result<PathBuf> {
        if pooler.is_empty() || pooler.contains(['/', '\\']) || pooler == "." || pooler == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pooler name `{pooler}` cannot be used as a directory name"),
            ));
        }
        Ok(self.dir.join(pooler))
    }

    fn read(&self, pooler: &str) -> io::Result<PoolerCheckpoint> {
        let path = self.pooler_dir(pooler)?.join("checkpoint.json");
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(checkpoint) => Ok(checkpoint),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupt checkpoint file, replaying from the beginning"
                    );
                    Ok(PoolerCheckpoint::default())
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PoolerCheckpoint::default()),
            Err(e) => Err(e),
        }
    }

    fn write(&self, pooler: &str, checkpoint: &PoolerCheckpoint) -> io::Result<()> {
        let dir = self.pooler_dir(pooler)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("checkpoint.json");
        let tmp_path = dir.join("checkpoint.json.tmp");
        let json = serde_json::to_string_pretty(checkpoint).map_err(io::Error::other)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

fn check_key_part(part: &str) -> io::Result<()> {
    if part.contains(cursor_map::SEP) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("contract name `{part}` contains '{}'", cursor_map::SEP),
        ));
    }
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, key: &CheckpointKey) -> io::Result<Option<u64>> {
        let checkpoint = self.read(&key.pooler)?;
        Ok(checkpoint
            .positions
            .get(&(key.source.clone(), key.handler.clone()))
            .copied())
    }

    async fn save(&self, positions: &[(CheckpointKey, u64)]) -> io::Result<()> {
        let mut by_pooler: BTreeMap<&str, Vec<(&CheckpointKey, u64)>> = BTreeMap::new();
        for (key, position) in positions {
            check_key_part(&key.source)?;
            check_key_part(&key.handler)?;
            by_pooler
                .entry(key.pooler.as_str())
                .or_default()
                .push((key, *position));
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for (pooler, rows) in by_pooler {
            let mut checkpoint = self.read(pooler)?;
            for (key, position) in rows {
                checkpoint
                    .positions
                    .insert((key.source.clone(), key.handler.clone()), position);
            }
            self.write(pooler, &checkpoint)?;
        }
        Ok(())
    }

    async fn remove_not_used_states(
        &self,
        pooler: &str,
        handlers: &[&str],
        sources: &[&str],
    ) -> io::Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut checkpoint = self.read(pooler)?;
        let before = checkpoint.positions.len();
        checkpoint
            .positions
            .retain(|(source, handler), _| is_used(handlers, sources, handler, source));
        let removed = before - checkpoint.positions.len();
        if removed > 0 {
            self.write(pooler, &checkpoint)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pooler: &str, source: &str, handler: &str) -> CheckpointKey {
        CheckpointKey::new(pooler, source, handler)
    }

    async fn seed(store: &dyn CheckpointStore) {
        store
            .save(&[
                (key("p1", "orders", "emailer"), 10),
                (key("p1", "orders", "auditor"), 12),
                (key("p1", "retired-source", "emailer"), 3),
                (key("p1", "orders", "retired-handler"), 4),
                (key("p2", "retired-source", "emailer"), 5),
            ])
            .await
            .expect("seed");
    }

    async fn cleanup_keeps_valid_and_drops_stale(store: &dyn CheckpointStore) {
        seed(store).await;

        let removed = store
            .remove_not_used_states("p1", &["emailer", "auditor"], &["orders"])
            .await
            .expect("cleanup");
        assert_eq!(removed, 2);

        assert_eq!(store.get(&key("p1", "orders", "emailer")).await.unwrap(), Some(10));
        assert_eq!(store.get(&key("p1", "orders", "auditor")).await.unwrap(), Some(12));
        assert_eq!(store.get(&key("p1", "retired-source", "emailer")).await.unwrap(), None);
        assert_eq!(store.get(&key("p1", "orders", "retired-handler")).await.unwrap(), None);
        // Other poolers are untouched.
        assert_eq!(store.get(&key("p2", "retired-source", "emailer")).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn in_memory_cleanup() {
        let store = InMemoryCheckpointStore::new();
        cleanup_keeps_valid_and_drops_stale(&store).await;
        assert_eq!(store.rows().len(), 3);
    }

    #[tokio::test]
    async fn file_cleanup() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileCheckpointStore::new(dir.path());
        cleanup_keeps_valid_and_drops_stale(&store).await;
    }

    #[tokio::test]
    async fn missing_row_is_none() {
        let store = InMemoryCheckpointStore::new();
        assert_eq!(store.get(&key("p", "s", "h")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        FileCheckpointStore::new(dir.path())
            .save(&[(key("billing", "ledger", "totals"), 42)])
            .await
            .expect("save");

        let reopened = FileCheckpointStore::new(dir.path());
        assert_eq!(
            reopened.get(&key("billing", "ledger", "totals")).await.unwrap(),
            Some(42)
        );
        let tmp = dir.path().join("billing").join("checkpoint.json.tmp");
        assert!(!tmp.exists(), "temp file should be renamed away");
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let pooler_dir = dir.path().join("billing");
        std::fs::create_dir_all(&pooler_dir).expect("mkdir");
        std::fs::write(pooler_dir.join("checkpoint.json"), "{not json").expect("write");

        let store = FileCheckpointStore::new(dir.path());
        assert_eq!(store.get(&key("billing", "ledger", "totals")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_rejects_separator_in_names() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileCheckpointStore::new(dir.path());
        let err = store
            .save(&[(key("p", "a/b", "h"), 1)])
            .await
            .expect_err("separator should be rejected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = store
            .get(&key("../escape", "s", "h"))
            .await
            .expect_err("path traversal should be rejected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn file_save_is_all_or_nothing_per_pooler() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileCheckpointStore::new(dir.path());

        store
            .save(&[(key("p", "s", "first"), 1), (key("p", "s", "bad/name"), 2)])
            .await
            .expect_err("invalid row rejects the batch");
        assert_eq!(store.get(&key("p", "s", "first")).await.unwrap(), None);

        // Poolers are committed one at a time.
        store
            .save(&[(key("a", "s", "h"), 1), (key("z/bad", "s", "h"), 2)])
            .await
            .expect_err("invalid pooler name");
        assert_eq!(store.get(&key("a", "s", "h")).await.unwrap(), Some(1));
    }
}
