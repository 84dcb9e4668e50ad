//! Snapshot (memento) persistence for aggregate state.
//!
//! Snapshots are stored as JSON files at
//! `<base_dir>/snapshots/<aggregate_type>/<stream_id>/snapshot.json`.
//! Writes are atomic via a temp-rename pattern to prevent corruption
//! from crashes mid-write. A snapshot is a cache: a missing or unreadable
//! file only means a longer replay.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::aggregate::Aggregate;

/// Aggregate state captured at a stream version.
///
/// `version` is the number of facts folded into `state`, so replay resumes
/// at stream version `version + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The aggregate state at the time of the snapshot.
    pub state: A,
    /// The stream version (number of facts applied) at snapshot time.
    pub version: u64,
}

/// Storage for untyped snapshots, addressed by aggregate type and stream id.
///
/// Typed access goes through the `load` and `save` methods on
/// `dyn SnapshotStore`.
pub trait SnapshotStore: Send + Sync {
    /// Read the stored snapshot, if any.
    fn load_raw(
        &self,
        aggregate_type: &str,
        stream_id: Uuid,
    ) -> io::Result<Option<Snapshot<serde_json::Value>>>;

    /// Replace the stored snapshot.
    fn save_raw(
        &self,
        aggregate_type: &str,
        stream_id: Uuid,
        snapshot: &Snapshot<serde_json::Value>,
    ) -> io::Result<()>;
}

impl dyn SnapshotStore + '_ {
    /// Load a typed snapshot for `A`.
    ///
    /// A stored state that no longer deserializes into `A` is logged and
    /// treated as a cache miss.
    pub fn load<A: Aggregate>(&self, stream_id: Uuid) -> io::Result<Option<Snapshot<A>>> {
        let Some(raw) = self.load_raw(A::AGGREGATE_TYPE, stream_id)? else {
            return Ok(None);
        };
        match serde_json::from_value::<A>(raw.state) {
            Ok(state) => Ok(Some(Snapshot {
                state,
                version: raw.version,
            })),
            Err(e) => {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    %stream_id,
                    error = %e,
                    "snapshot state does not match aggregate; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    /// Save a typed snapshot for `A`.
    pub fn save<A: Aggregate>(&self, stream_id: Uuid, snapshot: &Snapshot<A>) -> io::Result<()> {
        let raw = Snapshot {
            state: serde_json::to_value(&snapshot.state).map_err(io::Error::other)?,
            version: snapshot.version,
        };
        self.save_raw(A::AGGREGATE_TYPE, stream_id, &raw)
    }
}

/// [`SnapshotStore`] backed by one JSON file per stream.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    base_dir: PathBuf,
}

impl FileSnapshotStore {
    /// Store snapshots under `<base_dir>/snapshots`.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory of the store. Created lazily on the
    ///   first save.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// `<base_dir>/snapshots/<aggregate_type>/<stream_id>/snapshot.json`
    pub fn snapshot_path(&self, aggregate_type: &str, stream_id: Uuid) -> PathBuf {
        snapshot_path(&self.base_dir, aggregate_type, stream_id)
    }
}

fn snapshot_path(base_dir: &Path, aggregate_type: &str, stream_id: Uuid) -> PathBuf {
    base_dir
        .join("snapshots")
        .join(aggregate_type)
        .join(stream_id.to_string())
        .join("snapshot.json")
}

impl SnapshotStore for FileSnapshotStore {
    fn load_raw(
        &self,
        aggregate_type: &str,
        stream_id: Uuid,
    ) -> io::Result<Option<Snapshot<serde_json::Value>>> {
        let path = self.snapshot_path(aggregate_type, stream_id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice(&bytes) {
            Ok(snap) => Ok(Some(snap)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    fn save_raw(
        &self,
        aggregate_type: &str,
        stream_id: Uuid,
        snapshot: &Snapshot<serde_json::Value>,
    ) -> io::Result<()> {
        let path = self.snapshot_path(aggregate_type, stream_id);
        let Some(dir) = path.parent() else {
            return Err(io::Error::other("snapshot path has no parent directory"));
        };
        std::fs::create_dir_all(dir)?;

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::Counter;

    fn store(dir: &Path) -> Box<dyn SnapshotStore> {
        Box::new(FileSnapshotStore::new(dir))
    }

    #[test]
    fn snapshot_path_layout() {
        let store = FileSnapshotStore::new("/data/app");
        let id = Uuid::nil();
        assert_eq!(
            store.snapshot_path("counter", id),
            PathBuf::from(format!("/data/app/snapshots/counter/{id}/snapshot.json"))
        );
    }

    #[test]
    fn save_then_load_typed() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = store(dir.path());
        let id = Uuid::new_v4();
        let snap = Snapshot {
            state: Counter { value: 42 },
            version: 7,
        };

        store.save::<Counter>(id, &snap).expect("save should succeed");
        let loaded = store
            .load::<Counter>(id)
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded, snap);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let loaded = store(dir.path())
            .load::<Counter>(Uuid::new_v4())
            .expect("load should succeed");
        assert!(loaded.is_none());
    }

    #[test]
    fn corrupt_file_is_a_cache_miss() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let fs_store = FileSnapshotStore::new(dir.path());
        let id = Uuid::new_v4();
        let path = fs_store.snapshot_path("counter", id);
        std::fs::create_dir_all(path.parent().unwrap()).expect("create dir");
        std::fs::write(&path, b"this is not valid json!!!").expect("write corrupt file");

        let store: &dyn SnapshotStore = &fs_store;
        assert!(store.load::<Counter>(id).expect("not an error").is_none());
    }

    #[test]
    fn mismatched_state_is_a_cache_miss() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let fs_store = FileSnapshotStore::new(dir.path());
        let id = Uuid::new_v4();
        fs_store
            .save_raw(
                "counter",
                id,
                &Snapshot {
                    state: serde_json::json!({"value": "not a number"}),
                    version: 1,
                },
            )
            .expect("save raw");

        let store: &dyn SnapshotStore = &fs_store;
        assert!(store.load::<Counter>(id).expect("not an error").is_none());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let fs_store = FileSnapshotStore::new(dir.path());
        let id = Uuid::new_v4();
        let store: &dyn SnapshotStore = &fs_store;
        store
            .save::<Counter>(
                id,
                &Snapshot {
                    state: Counter { value: 10 },
                    version: 3,
                },
            )
            .expect("save should succeed");

        let final_path = fs_store.snapshot_path("counter", id);
        assert!(final_path.exists());
        assert!(!final_path.with_extension("json.tmp").exists());
    }
}
