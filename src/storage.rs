//! Durable, file-backed event log.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventStream, ExpectedVersion, ProposedEvent, RecordedEvent};
use crate::event_log::{EventLog, LogCore};

/// Manages the on-disk directory layout for a store.
///
/// ```text
/// <base_dir>/
///     streams/
///         <stream_id>/
///             events.jsonl    -- one JSON array per committed batch
///     snapshots/              -- see FileSnapshotStore
///     checkpoints/            -- see FileCheckpointStore
/// ```
///
/// `StoreLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    base_dir: PathBuf,
}

impl StoreLayout {
    /// Create a new `StoreLayout` rooted at the given base directory.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory for all store data. The directory does
    ///   not need to exist yet; it is created when the log is opened.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/streams`
    pub fn streams_dir(&self) -> PathBuf {
        self.base_dir.join("streams")
    }

    /// Returns the directory holding one stream's journal.
    ///
    /// # Returns
    ///
    /// `<base_dir>/streams/<stream_id>`
    pub fn stream_dir(&self, stream_id: Uuid) -> PathBuf {
        self.streams_dir().join(stream_id.to_string())
    }

    /// Returns the path of one stream's journal.
    ///
    /// # Returns
    ///
    /// `<base_dir>/streams/<stream_id>/events.jsonl`
    pub fn journal_path(&self, stream_id: Uuid) -> PathBuf {
        self.stream_dir(stream_id).join("events.jsonl")
    }

    /// `<base_dir>/checkpoints`
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.base_dir.join("checkpoints")
    }
}

/// [`EventLog`] persisted to one JSONL journal per stream.
///
/// Each committed batch is written and synced as a single line before it
/// becomes visible, so a batch is either fully in its journal or absent. A
/// write or sync that fails is rolled back by truncating the journal to its
/// previous length. If that rollback fails too, the log stops accepting
/// appends until it is reopened. A torn trailing line left by a crash is
/// discarded on open. The whole log is indexed in memory; reads never touch
/// the disk.
///
/// Writers on different streams touch different files and never wait on
/// each other's sync.
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone)]
pub struct FileEventLog {
    core: Arc<LogCore>,
    layout: StoreLayout,
    failed: Arc<OnceLock<String>>,
}

impl FileEventLog {
    /// Open (or create) the log under `base_dir`.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory of the store; see [`StoreLayout`].
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if a directory or journal cannot be read, and
    /// [`StoreError::Corrupt`] if a line other than the last fails to parse,
    /// a fact sits in the wrong stream's journal, or the recorded positions
    /// and versions are inconsistent.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(base_dir);
        let streams_dir = layout.streams_dir();
        fs::create_dir_all(&streams_dir)?;

        let mut events = Vec::new();
        for entry in fs::read_dir(&streams_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stream_id) = name.to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                tracing::warn!(
                    path = %entry.path().display(),
                    "ignoring unexpected entry in streams directory"
                );
                continue;
            };
            let batch = recover_journal(&layout.journal_path(stream_id))?;
            if let Some(stray) = batch.iter().find(|e| e.stream_id != stream_id) {
                return Err(StoreError::Corrupt(format!(
                    "journal of stream {stream_id} holds a fact of stream {}",
                    stray.stream_id
                )));
            }
            events.extend(batch);
        }
        let core = LogCore::from_recorded(events)?;

        tracing::debug!(
            path = %streams_dir.display(),
            last_position = core.last_position(),
            "opened event log"
        );
        Ok(Self {
            core: Arc::new(core),
            layout,
            failed: Arc::new(OnceLock::new()),
        })
    }

    /// The layout this log was opened with.
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Highest position the global feed currently exposes (0 if empty).
    pub fn last_position(&self) -> u64 {
        self.core.last_position()
    }

    fn refuse_appends(&self, reason: String) {
        if self.failed.set(reason.clone()).is_ok() {
            tracing::error!(reason = %reason, "event log refuses further appends");
        }
    }

    fn write_batch(&self, stream_id: Uuid, batch: &[RecordedEvent]) -> Result<(), StoreError> {
        if let Some(reason) = self.failed.get() {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        let mut line = serde_json::to_vec(batch)?;
        line.push(b'\n');

        fs::create_dir_all(self.layout.stream_dir(stream_id))?;
        let path = self.layout.journal_path(stream_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        match append_line(&mut file, &line) {
            Ok(()) => Ok(()),
            Err(AppendFailure::RolledBack(e)) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "journal write failed and was rolled back"
                );
                Err(e.into())
            }
            Err(AppendFailure::Dirty { cause, undo }) => {
                self.refuse_appends(format!(
                    "{}: write failed ({cause}) and could not be rolled back ({undo})",
                    path.display()
                ));
                Err(cause.into())
            }
        }
    }
}

/// The file operations an append needs.
trait JournalFile: Write {
    fn byte_len(&self) -> io::Result<u64>;
    fn sync(&self) -> io::Result<()>;
    fn truncate(&self, len: u64) -> io::Result<()>;
}

impl JournalFile for File {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }
}

enum AppendFailure {
    /// The journal is back at its previous length.
    RolledBack(io::Error),
    /// The journal may still hold part of the batch.
    Dirty { cause: io::Error, undo: io::Error },
}

/// Append and sync `line`, truncating back to the previous length on any
/// failure.
fn append_line(file: &mut impl JournalFile, line: &[u8]) -> Result<(), AppendFailure> {
    let len = file.byte_len().map_err(AppendFailure::RolledBack)?;
    let written = file.write_all(line).and_then(|()| file.sync());
    let Err(cause) = written else {
        return Ok(());
    };
    match file.truncate(len) {
        Ok(()) => Err(AppendFailure::RolledBack(cause)),
        Err(undo) => Err(AppendFailure::Dirty { cause, undo }),
    }
}

/// Read one stream's journal, truncating a torn trailing line.
fn recover_journal(path: &Path) -> Result<Vec<RecordedEvent>, StoreError> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let (events, valid_len) = parse_journal(&content)?;
    if valid_len < content.len() {
        tracing::warn!(
            path = %path.display(),
            discarded_bytes = content.len() - valid_len,
            "discarding torn trailing journal entry"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len as u64)?;
        file.sync_data()?;
    }
    Ok(events)
}

/// Parse journal lines into facts, returning the byte length of the valid
/// prefix. Only the final line may be unreadable.
fn parse_journal(content: &[u8]) -> Result<(Vec<RecordedEvent>, usize), StoreError> {
    let mut events = Vec::new();
    let mut offset = 0;
    let mut lines = content.split_inclusive(|b| *b == b'\n').peekable();

    while let Some(line) = lines.next() {
        let is_last = lines.peek().is_none();
        let complete = line.ends_with(b"\n");
        if line.iter().all(u8::is_ascii_whitespace) {
            if complete {
                offset += line.len();
            }
            continue;
        }
        match serde_json::from_slice::<Vec<RecordedEvent>>(line) {
            Ok(batch) if complete => {
                events.extend(batch);
                offset += line.len();
            }
            _ if is_last => break,
            Ok(_) => {
                return Err(StoreError::Corrupt(format!(
                    "unterminated journal entry at byte {offset}"
                )));
            }
            Err(e) => {
                return Err(StoreError::Corrupt(format!(
                    "unreadable journal entry at byte {offset}: {e}"
                )));
            }
        }
    }
    Ok((events, offset))
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn save_changes(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        self.core
            .append(stream_id, expected, events, |batch| {
                self.write_batch(stream_id, batch)
            })
            .await
    }

    async fn load(
        &self,
        stream_id: Uuid,
        from_version: u64,
        metadata_only: bool,
    ) -> Result<Option<EventStream>, StoreError> {
        Ok(self.core.load(stream_id, from_version, metadata_only))
    }

    async fn read_all(&self, after: u64, max: usize) -> Result<Vec<RecordedEvent>, StoreError> {
        Ok(self.core.read_all(after, max))
    }
}
