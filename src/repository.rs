//! Unit of work over an [`EventLog`]: load an aggregate, run a command,
//! persist the produced facts under an optimistic concurrency check.

use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRoot, HistoryEntry};
use crate::codec::{decode_domain_event, encode_domain_event};
use crate::command::CommandContext;
use crate::error::{ExecuteError, RepositoryError};
use crate::event::{EventStream, ExpectedVersion};
use crate::event_log::EventLog;
use crate::snapshot::SnapshotStore;

/// Conflict retries attempted by [`Repository::execute`] unless configured
/// otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Loads and persists aggregates through an [`EventLog`].
///
/// Cheap to clone; clones share the log and snapshot store.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use ses::{FileSnapshotStore, InMemoryEventLog, Repository};
///
/// let repo = Repository::new(Arc::new(InMemoryEventLog::new()))
///     .with_snapshots(FileSnapshotStore::new("/tmp/app"), 100)
///     .max_retries(5);
/// ```
pub struct Repository<L> {
    log: Arc<L>,
    snapshots: Option<(Arc<dyn SnapshotStore>, u64)>,
    max_retries: u32,
}

impl<L> Clone for Repository<L> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            snapshots: self.snapshots.clone(),
            max_retries: self.max_retries,
        }
    }
}

impl<L: EventLog> Repository<L> {
    /// A repository over `log` without snapshots.
    ///
    /// # Arguments
    ///
    /// * `log` - The event log aggregates are loaded from and saved to.
    ///
    /// # Returns
    ///
    /// A repository retrying conflicts up to [`DEFAULT_MAX_RETRIES`] times.
    pub fn new(log: Arc<L>) -> Self {
        Self {
            log,
            snapshots: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Save a snapshot each time an aggregate's version crosses a multiple of
    /// `every`, and seed loads from it. `every == 0` disables snapshotting.
    ///
    /// # Arguments
    ///
    /// * `store` - Where snapshots are written and read.
    /// * `every` - Snapshot interval in committed versions.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn with_snapshots(mut self, store: impl SnapshotStore + 'static, every: u64) -> Self {
        self.snapshots = (every > 0).then(|| (Arc::new(store) as Arc<dyn SnapshotStore>, every));
        self
    }

    /// Number of times [`execute`](Self::execute) reloads and retries after a
    /// version conflict.
    ///
    /// # Arguments
    ///
    /// * `retries` - Retries after the first attempt. `0` fails on the first
    ///   conflict.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    /// Rebuild aggregate `id` from its snapshot (if any) and the tail of its
    /// stream. A stream that does not exist yields a fresh aggregate at
    /// version 0.
    ///
    /// # Errors
    ///
    /// Log failures, snapshot read failures, and malformed histories.
    pub async fn load<A: Aggregate>(&self, id: Uuid) -> Result<AggregateRoot<A>, RepositoryError> {
        let snapshot = match &self.snapshots {
            Some((store, _)) => store.load::<A>(id).map_err(RepositoryError::Snapshot)?,
            None => None,
        };

        let from_version = snapshot.as_ref().map_or(1, |s| s.version + 1);
        let Some(stream) = self.log.load(id, from_version, false).await? else {
            if snapshot.is_some() {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    %id,
                    "snapshot found for a stream with no facts; ignoring it"
                );
            }
            return Ok(AggregateRoot::new(id));
        };

        let mut history = Vec::with_capacity(stream.committed_events.len() + 1);
        match snapshot {
            Some(snapshot) if snapshot.version <= stream.committed_version => {
                history.push(HistoryEntry::Snapshot(snapshot));
                push_events::<A>(&mut history, &stream);
            }
            Some(snapshot) => {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    %id,
                    snapshot_version = snapshot.version,
                    committed_version = stream.committed_version,
                    "snapshot is ahead of the stream; replaying full history"
                );
                let full = self.log.load(id, 1, false).await?;
                if let Some(full) = full {
                    push_events::<A>(&mut history, &full);
                }
            }
            None => push_events::<A>(&mut history, &stream),
        }

        Ok(AggregateRoot::restore(id, history)?)
    }

    /// Drain `root`'s pending facts and append them, expecting the stream to
    /// still be at `root`'s committed version. Returns the number of facts
    /// appended.
    ///
    /// The drained facts are gone even if the append fails: reload the
    /// aggregate before trying again.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`](crate::StoreError::Conflict) (wrapped in
    /// [`RepositoryError::Store`]) if another writer got there first.
    pub async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &CommandContext,
    ) -> Result<usize, RepositoryError> {
        let events = root.take_uncommitted_events();
        if events.is_empty() {
            return Ok(0);
        }

        let metadata = ctx.event_metadata(A::AGGREGATE_TYPE);
        let proposed = events
            .iter()
            .map(|e| encode_domain_event(e, metadata.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let before = root.committed_version();
        let expected = ExpectedVersion::from_committed(before);
        let recorded = self.log.save_changes(root.id(), expected, proposed).await?;
        root.mark_committed(recorded.len() as u64);

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            id = %root.id(),
            version = root.committed_version(),
            "saved aggregate"
        );

        if let Some((store, every)) = &self.snapshots
            && before / every != root.committed_version() / every
            && let Err(e) = store.save(root.id(), &root.snapshot())
        {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                id = %root.id(),
                error = %e,
                "failed to save snapshot"
            );
        }

        Ok(recorded.len())
    }

    /// Load aggregate `id`, run `cmd`, and persist the produced facts.
    ///
    /// On a version conflict the aggregate is reloaded and the command re-run,
    /// up to the configured number of retries. Returns the facts that were
    /// appended.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Domain`] if the aggregate rejects the command.
    /// - [`ExecuteError::Conflict`] if every attempt hit a conflict.
    /// - Other variants for log, codec, snapshot, and history failures.
    pub async fn execute<A>(
        &self,
        id: Uuid,
        cmd: A::Command,
        ctx: &CommandContext,
    ) -> Result<Vec<A::DomainEvent>, ExecuteError<A::Error>>
    where
        A: Aggregate,
        A::Command: Clone,
    {
        let mut retries = 0;
        loop {
            let mut root = self.load::<A>(id).await?;
            root.execute(cmd.clone()).map_err(ExecuteError::Domain)?;
            let produced = root.uncommitted_events().to_vec();

            match self.save(&mut root, ctx).await {
                Ok(_) => return Ok(produced),
                Err(RepositoryError::Store(e)) if e.is_conflict() && retries < self.max_retries => {
                    retries += 1;
                    tracing::debug!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        %id,
                        retries,
                        "version conflict, reloading"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn push_events<A: Aggregate>(history: &mut Vec<HistoryEntry<A>>, stream: &EventStream) {
    history.extend(stream.committed_events.iter().map(|recorded| {
        match decode_domain_event::<A::DomainEvent>(recorded) {
            Some(event) => HistoryEntry::Event(event),
            None => HistoryEntry::Unrecognized(recorded.contract_name.clone()),
        }
    }));
}
