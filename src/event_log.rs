//! The event log contract and its in-memory backend.
//!
//! A log is a set of append-only streams keyed by [`Uuid`]. Every committed
//! fact gets a one-based version within its stream and a strictly increasing
//! position in the global log. Appends are conditional on an
//! [`ExpectedVersion`] checked under a lock scoped to the target stream, so
//! different streams append in parallel while writers on the same stream are
//! serialized.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventStream, ExpectedVersion, ProposedEvent, RecordedEvent, now_millis};

/// Append-only, per-stream ordered storage with conditional append.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Append `events` to `stream_id` if its committed version satisfies
    /// `expected`.
    ///
    /// An empty `events` is a complete no-op: no existence check, no
    /// conflict, nothing persisted. Otherwise the batch is committed
    /// atomically and the recorded facts are returned.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the precondition fails; the stream is
    /// left untouched. I/O and serialization errors from durable backends.
    async fn save_changes(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Load a stream's committed facts with version `>= from_version`.
    ///
    /// Returns `None` if the stream has no committed facts. With
    /// `metadata_only` the result carries the committed version and an empty
    /// fact list.
    async fn load(
        &self,
        stream_id: Uuid,
        from_version: u64,
        metadata_only: bool,
    ) -> Result<Option<EventStream>, StoreError>;

    /// Up to `max` facts with global position `> after`, in position order.
    ///
    /// A fact is only returned once every append holding a lower position
    /// has finished, so a reader that advances past a position never misses
    /// a fact committed below it. Positions may skip values left by failed
    /// appends.
    async fn read_all(&self, after: u64, max: usize) -> Result<Vec<RecordedEvent>, StoreError>;
}

#[derive(Debug)]
struct LogState {
    /// Published facts in global position order.
    events: Vec<RecordedEvent>,
    /// Global positions per stream, in version order.
    streams: HashMap<Uuid, Vec<u64>>,
    /// Next global position to hand out.
    next_position: u64,
    /// First position of every reserved batch that is not yet published or
    /// released.
    in_flight: BTreeSet<u64>,
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            streams: HashMap::new(),
            next_position: 1,
            in_flight: BTreeSet::new(),
        }
    }
}

impl LogState {
    fn stream_version(&self, stream_id: Uuid) -> u64 {
        self.streams.get(&stream_id).map_or(0, |p| p.len() as u64)
    }

    /// Highest position the global feed may expose: everything below the
    /// oldest unfinished append.
    fn visible_upto(&self) -> u64 {
        self.in_flight.first().map_or(u64::MAX, |first| first - 1)
    }

    fn event_at(&self, position: u64) -> Option<&RecordedEvent> {
        self.events
            .binary_search_by_key(&position, |e| e.global_position)
            .ok()
            .map(|ix| &self.events[ix])
    }

    fn reserve(&mut self, count: u64) -> u64 {
        let first = self.next_position;
        self.next_position += count;
        self.in_flight.insert(first);
        first
    }

    /// Give back a reservation whose batch was never written. The positions
    /// are reused unless a later batch has reserved after it.
    fn release(&mut self, first: u64, count: u64) {
        self.in_flight.remove(&first);
        if self.next_position == first + count {
            self.next_position = first;
        }
    }

    fn publish(&mut self, batch: &[RecordedEvent]) {
        if let Some(first) = batch.first() {
            self.in_flight.remove(&first.global_position);
        }
        for event in batch {
            self.insert(event.clone());
        }
    }

    fn insert(&mut self, event: RecordedEvent) {
        self.streams
            .entry(event.stream_id)
            .or_default()
            .push(event.global_position);
        let at = self
            .events
            .partition_point(|e| e.global_position < event.global_position);
        self.events.insert(at, event);
    }
}

/// Shared bookkeeping behind every bundled backend: per-stream locks and the
/// committed state.
///
/// The state lock is only held to check a version, reserve positions, and
/// publish a batch. Persisting runs under the stream lock alone.
#[derive(Debug, Default)]
pub(crate) struct LogCore {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    state: RwLock<LogState>,
}

/// Exclusive right to append to one stream. Dropping it removes the stream's
/// lock from the table when nobody else is waiting on it.
struct StreamPermit<'a> {
    core: &'a LogCore,
    stream_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for StreamPermit<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let lock = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);
        let mut locks = self
            .core
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&self.stream_id);
        }
    }
}

impl LogCore {
    /// Rebuild from previously committed facts, in any order, validating
    /// positions and versions.
    pub(crate) fn from_recorded(
        events: impl IntoIterator<Item = RecordedEvent>,
    ) -> Result<Self, StoreError> {
        let mut events: Vec<RecordedEvent> = events.into_iter().collect();
        events.sort_by_key(|e| e.global_position);

        let mut state = LogState::default();
        for event in events {
            if event.global_position < state.next_position {
                return Err(StoreError::Corrupt(format!(
                    "global position {} is out of sequence",
                    event.global_position
                )));
            }
            let expected_version = state.stream_version(event.stream_id) + 1;
            if event.version != expected_version {
                return Err(StoreError::Corrupt(format!(
                    "stream {} expected version {expected_version}, found {}",
                    event.stream_id, event.version
                )));
            }
            state.next_position = event.global_position + 1;
            state.insert(event);
        }
        Ok(Self {
            locks: Mutex::default(),
            state: RwLock::new(state),
        })
    }

    async fn lock_stream(&self, stream_id: Uuid) -> StreamPermit<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(stream_id).or_default())
        };
        StreamPermit {
            core: self,
            stream_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_streams(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check-and-append under the stream's lock.
    ///
    /// `persist` runs after positions are reserved and before the batch
    /// becomes visible; if it fails the reservation is released and nothing
    /// is committed.
    pub(crate) async fn append<F>(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
        persist: F,
    ) -> Result<Vec<RecordedEvent>, StoreError>
    where
        F: FnOnce(&[RecordedEvent]) -> Result<(), StoreError>,
    {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self.lock_stream(stream_id).await;

        let count = events.len() as u64;
        let (current, first_position) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let current = state.stream_version(stream_id);
            if !expected.matches(current) {
                return Err(StoreError::Conflict {
                    stream_id,
                    expected,
                    actual: current,
                });
            }
            (current, state.reserve(count))
        };

        let recorded_at = now_millis();
        let recorded: Vec<RecordedEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, proposed)| RecordedEvent {
                event_id: proposed.event_id,
                stream_id,
                version: current + i as u64 + 1,
                global_position: first_position + i as u64,
                contract_name: proposed.contract_name,
                payload: proposed.payload,
                metadata: proposed.metadata,
                recorded_at,
            })
            .collect();

        let persisted = persist(&recorded);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = persisted {
            state.release(first_position, count);
            return Err(e);
        }
        state.publish(&recorded);
        tracing::trace!(
            %stream_id,
            count,
            version = current + count,
            position = first_position,
            "appended batch"
        );
        Ok(recorded)
    }

    pub(crate) fn load(
        &self,
        stream_id: Uuid,
        from_version: u64,
        metadata_only: bool,
    ) -> Option<EventStream> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let positions = state.streams.get(&stream_id)?;
        if positions.is_empty() {
            return None;
        }
        let committed_version = positions.len() as u64;
        let committed_events = if metadata_only {
            Vec::new()
        } else {
            let skip = from_version.saturating_sub(1) as usize;
            positions
                .iter()
                .skip(skip)
                .filter_map(|&p| state.event_at(p).cloned())
                .collect()
        };
        Some(EventStream {
            stream_id,
            committed_version,
            committed_events,
        })
    }

    pub(crate) fn read_all(&self, after: u64, max: usize) -> Vec<RecordedEvent> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let visible = state.visible_upto();
        let start = state.events.partition_point(|e| e.global_position <= after);
        state.events[start..]
            .iter()
            .take_while(|e| e.global_position <= visible)
            .take(max)
            .cloned()
            .collect()
    }

    /// Highest position the global feed currently exposes (0 if none).
    pub(crate) fn last_position(&self) -> u64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let visible = state.visible_upto();
        let end = state.events.partition_point(|e| e.global_position <= visible);
        end.checked_sub(1)
            .map_or(0, |ix| state.events[ix].global_position)
    }
}

/// Volatile [`EventLog`] for tests and single-process use.
///
/// Cheap to clone; clones share the same log.
///
/// # Examples
///
/// ```
/// use ses::{EventLog, ExpectedVersion, InMemoryEventLog, ProposedEvent};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let log = InMemoryEventLog::new();
/// let id = uuid::Uuid::new_v4();
/// log.save_changes(id, ExpectedVersion::NoStream, vec![
///     ProposedEvent::new("Opened", serde_json::Value::Null),
/// ]).await.unwrap();
///
/// let stream = log.load(id, 1, false).await.unwrap().expect("stream exists");
/// assert_eq!(stream.committed_version, 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLog {
    core: Arc<LogCore>,
}

impl InMemoryEventLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Global position of the most recently committed fact (0 if empty).
    pub fn last_position(&self) -> u64 {
        self.core.last_position()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn save_changes(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        self.core
            .append(stream_id, expected, events, |_| Ok(()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;
    use std::time::Duration;

    fn facts(names: &[&str]) -> Vec<ProposedEvent> {
        names
            .iter()
            .map(|n| ProposedEvent::new(*n, json!({ "n": n })))
            .collect()
    }

    fn names(stream: &EventStream) -> Vec<&str> {
        stream
            .committed_events
            .iter()
            .map(|e| e.contract_name.as_str())
            .collect()
    }

    #[tokio::test]
    async fn fresh_stream_append_then_load() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();
        let recorded = log
            .save_changes(id, ExpectedVersion::NoStream, facts(&["A", "B", "C"]))
            .await
            .expect("append");
        assert_eq!(
            recorded.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let stream = log.load(id, 1, false).await.expect("load").expect("exists");
        assert_eq!(stream.committed_version, 3);
        assert_eq!(names(&stream), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn empty_append_is_a_no_op() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();

        // Even a precondition that could never match is not checked.
        let out = log
            .save_changes(id, ExpectedVersion::Exact(99), Vec::new())
            .await
            .expect("no-op");
        assert!(out.is_empty());
        assert!(log.load(id, 1, false).await.expect("load").is_none());
        assert_eq!(log.last_position(), 0);
    }

    #[tokio::test]
    async fn wrong_expected_version_conflicts_and_changes_nothing() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();
        log.save_changes(id, ExpectedVersion::NoStream, facts(&["A", "B"]))
            .await
            .expect("append");
        let before = log.load(id, 1, false).await.expect("load");

        for expected in [
            ExpectedVersion::NoStream,
            ExpectedVersion::Exact(1),
            ExpectedVersion::Exact(3),
        ] {
            let err = log
                .save_changes(id, expected, facts(&["X"]))
                .await
                .expect_err("should conflict");
            assert!(
                matches!(err, StoreError::Conflict { actual: 2, .. }),
                "unexpected error: {err}"
            );
        }

        let after = log.load(id, 1, false).await.expect("load");
        assert_eq!(before, after);
        assert_eq!(log.last_position(), 2);
    }

    #[tokio::test]
    async fn any_skips_the_check() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();
        log.save_changes(id, ExpectedVersion::Any, facts(&["A"]))
            .await
            .expect("first");
        log.save_changes(id, ExpectedVersion::Any, facts(&["B"]))
            .await
            .expect("second");
        let stream = log.load(id, 1, false).await.expect("load").expect("exists");
        assert_eq!(stream.committed_version, 2);
    }

    #[tokio::test]
    async fn load_truncates_from_version() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();
        log.save_changes(id, ExpectedVersion::NoStream, facts(&["A", "B", "C", "D"]))
            .await
            .expect("append");

        let stream = log.load(id, 3, false).await.expect("load").expect("exists");
        assert_eq!(stream.committed_version, 4);
        assert_eq!(names(&stream), vec!["C", "D"]);

        let past_end = log.load(id, 9, false).await.expect("load").expect("exists");
        assert_eq!(past_end.committed_version, 4);
        assert!(past_end.committed_events.is_empty());
    }

    #[tokio::test]
    async fn metadata_only_omits_facts() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();
        log.save_changes(id, ExpectedVersion::NoStream, facts(&["A", "B"]))
            .await
            .expect("append");
        let stream = log.load(id, 1, true).await.expect("load").expect("exists");
        assert_eq!(stream.committed_version, 2);
        assert!(stream.committed_events.is_empty());
    }

    #[tokio::test]
    async fn global_positions_interleave_streams() {
        let log = InMemoryEventLog::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        log.save_changes(a, ExpectedVersion::NoStream, facts(&["A1"]))
            .await
            .expect("a1");
        log.save_changes(b, ExpectedVersion::NoStream, facts(&["B1", "B2"]))
            .await
            .expect("b");
        log.save_changes(a, ExpectedVersion::Exact(1), facts(&["A2"]))
            .await
            .expect("a2");

        let all = log.read_all(0, 100).await.expect("read_all");
        let positions: Vec<u64> = all.iter().map(|e| e.global_position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
        assert_eq!(all[3].stream_id, a);
        assert_eq!(all[3].version, 2);

        let tail = log.read_all(2, 1).await.expect("read_all");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].contract_name, "B2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_with_same_expectation_have_one_winner() {
        let log = InMemoryEventLog::new();
        let id = Uuid::new_v4();
        log.save_changes(id, ExpectedVersion::NoStream, facts(&["seed"]))
            .await
            .expect("seed");

        let mut tasks = Vec::new();
        for i in 0..16 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.save_changes(id, ExpectedVersion::Exact(1), facts(&[format!("w{i}").as_str()]))
                    .await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            match task.await.expect("join") {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
        let stream = log.load(id, 1, true).await.expect("load").expect("exists");
        assert_eq!(stream.committed_version, 2);
    }

    fn recorded(stream_id: Uuid, version: u64, global_position: u64) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            stream_id,
            version,
            global_position,
            contract_name: "A".into(),
            payload: serde_json::Value::Null,
            metadata: Default::default(),
            recorded_at: 0,
        }
    }

    fn positions(events: &[RecordedEvent]) -> Vec<u64> {
        events.iter().map(|e| e.global_position).collect()
    }

    /// A persist step that blocks until the test releases it, then returns
    /// the supplied outcome.
    fn held_persist(
        entered: tokio::sync::oneshot::Sender<()>,
        release: std::sync::mpsc::Receiver<Result<(), StoreError>>,
    ) -> impl FnOnce(&[RecordedEvent]) -> Result<(), StoreError> + Send {
        move |_| {
            let _ = entered.send(());
            release
                .recv_timeout(Duration::from_secs(5))
                .map_err(|e| StoreError::Io(io::Error::other(e)))?
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unrelated_stream_appends_while_another_persists() {
        let core = Arc::new(LogCore::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();

        let slow = tokio::spawn({
            let core = Arc::clone(&core);
            async move {
                core.append(
                    a,
                    ExpectedVersion::NoStream,
                    facts(&["A"]),
                    held_persist(entered_tx, release_rx),
                )
                .await
            }
        });
        entered_rx.await.expect("persist on A started");

        let fast = tokio::time::timeout(
            Duration::from_secs(2),
            core.append(b, ExpectedVersion::NoStream, facts(&["B"]), |_| Ok(())),
        )
        .await
        .expect("append on B must not wait for A")
        .expect("append on B");
        assert_eq!(fast[0].global_position, 2);

        // B's stream is readable at once; the feed holds it back behind A.
        assert!(core.load(b, 1, false).is_some());
        assert!(core.read_all(0, 10).is_empty());
        assert_eq!(core.last_position(), 0);

        release_tx.send(Ok(())).expect("release A");
        let slow = slow.await.expect("join").expect("append on A");
        assert_eq!(slow[0].global_position, 1);
        assert_eq!(positions(&core.read_all(0, 10)), vec![1, 2]);
        assert_eq!(core.last_position(), 2);
    }

    #[tokio::test]
    async fn failed_persist_releases_its_positions() {
        let core = LogCore::default();
        let id = Uuid::new_v4();

        let err = core
            .append(id, ExpectedVersion::NoStream, facts(&["A"]), |_| {
                Err(StoreError::Io(io::Error::other("disk full")))
            })
            .await
            .expect_err("persist failure surfaces");
        assert!(matches!(err, StoreError::Io(_)));
        assert!(core.load(id, 1, false).is_none());

        let retry = core
            .append(id, ExpectedVersion::NoStream, facts(&["A"]), |_| Ok(()))
            .await
            .expect("retry");
        assert_eq!(retry[0].global_position, 1);
        assert_eq!(retry[0].version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_persist_behind_a_later_batch_leaves_a_gap() {
        let core = Arc::new(LogCore::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();

        let failing = tokio::spawn({
            let core = Arc::clone(&core);
            async move {
                core.append(
                    a,
                    ExpectedVersion::NoStream,
                    facts(&["A"]),
                    held_persist(entered_tx, release_rx),
                )
                .await
            }
        });
        entered_rx.await.expect("persist on A started");
        core.append(b, ExpectedVersion::NoStream, facts(&["B"]), |_| Ok(()))
            .await
            .expect("append on B");

        release_tx
            .send(Err(StoreError::Io(io::Error::other("sync failed"))))
            .expect("release A");
        failing
            .await
            .expect("join")
            .expect_err("A's persist failed");

        assert_eq!(positions(&core.read_all(0, 10)), vec![2]);
        let next = core
            .append(a, ExpectedVersion::NoStream, facts(&["A"]), |_| Ok(()))
            .await
            .expect("append after gap");
        assert_eq!(next[0].global_position, 3);
        assert_eq!(positions(&core.read_all(0, 10)), vec![2, 3]);
    }

    #[tokio::test]
    async fn stream_locks_are_dropped_when_idle() {
        let core = LogCore::default();
        for _ in 0..3 {
            core.append(Uuid::new_v4(), ExpectedVersion::NoStream, facts(&["A"]), |_| Ok(()))
                .await
                .expect("append");
        }
        let id = Uuid::new_v4();
        core.append(id, ExpectedVersion::Exact(4), facts(&["A"]), |_| Ok(()))
            .await
            .expect_err("conflict");
        assert_eq!(core.tracked_streams(), 0);
    }

    #[test]
    fn from_recorded_accepts_unordered_input_with_gaps() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let core = LogCore::from_recorded(vec![
            recorded(b, 1, 4),
            recorded(a, 1, 1),
            recorded(a, 2, 2),
        ])
        .expect("valid history");
        assert_eq!(positions(&core.read_all(0, 10)), vec![1, 2, 4]);
        assert_eq!(core.last_position(), 4);
        assert_eq!(core.load(a, 1, true).map(|s| s.committed_version), Some(2));
    }

    #[test]
    fn from_recorded_rejects_duplicate_positions() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let err = LogCore::from_recorded(vec![recorded(a, 1, 1), recorded(b, 1, 1)])
            .expect_err("duplicate position should be rejected");
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn from_recorded_rejects_version_gaps() {
        let id = Uuid::new_v4();
        let err = LogCore::from_recorded(vec![recorded(id, 1, 1), recorded(id, 3, 2)])
            .expect_err("version gap should be rejected");
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
