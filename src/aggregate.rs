//! Aggregate trait and the replay engine that tracks committed and pending
//! facts for one aggregate instance.

use std::fmt;

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::HistoryError;
use crate::snapshot::Snapshot;

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
///   Must use adjacently tagged serde (`#[serde(tag = "type", content = "data")]`);
///   the tag is the fact's contract name.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O, no side effects.
///   It validates a command against the current state and returns zero or more events.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes ownership of
///   the current state and a reference to a domain event, returning the next state.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "order"). Used in snapshot paths
    /// and event metadata.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// One entry of a loaded history, in the order it must be replayed.
pub enum HistoryEntry<A: Aggregate> {
    /// Captured state; only valid at index 0.
    Snapshot(Snapshot<A>),
    /// A fact the aggregate understands.
    Event(A::DomainEvent),
    /// A fact whose contract name no longer maps to a variant of
    /// `A::DomainEvent`. It still counts toward the committed version.
    Unrecognized(String),
}

/// Runtime wrapper around one aggregate instance.
///
/// Holds the folded state, the number of facts already persisted
/// (`committed_version`), and the facts applied since load that have not yet
/// been persisted. `current_version` is always
/// `committed_version + pending count`.
///
/// Not safe for concurrent mutation: load it, mutate it, persist it, and
/// drop it within one unit of work.
///
/// # Examples
///
/// ```
/// use ses::{Aggregate, AggregateRoot};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// # struct Tally { n: u64 }
/// # #[derive(Debug, Clone, Serialize, Deserialize)]
/// # #[serde(tag = "type", content = "data")]
/// # enum TallyEvent { Bumped }
/// # #[derive(Debug, thiserror::Error)]
/// # #[error("never")]
/// # struct Never;
/// # impl Aggregate for Tally {
/// #     const AGGREGATE_TYPE: &'static str = "tally";
/// #     type Command = ();
/// #     type DomainEvent = TallyEvent;
/// #     type Error = Never;
/// #     fn handle(&self, _: ()) -> Result<Vec<TallyEvent>, Never> { Ok(vec![TallyEvent::Bumped]) }
/// #     fn apply(mut self, _: &TallyEvent) -> Self { self.n += 1; self }
/// # }
/// let mut root = AggregateRoot::<Tally>::new(uuid::Uuid::new_v4());
/// root.execute(()).unwrap();
/// assert_eq!(root.current_version(), 1);
/// assert_eq!(root.take_uncommitted_events().len(), 1);
/// assert!(root.take_uncommitted_events().is_empty());
/// ```
pub struct AggregateRoot<A: Aggregate> {
    id: Uuid,
    state: A,
    committed_version: u64,
    uncommitted: Vec<A::DomainEvent>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh aggregate at version 0 with default state.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: A::default(),
            committed_version: 0,
            uncommitted: Vec::new(),
        }
    }

    /// Rebuild an aggregate from a loaded history.
    ///
    /// An empty history leaves the aggregate at version 0. A snapshot at
    /// index 0 seeds the state and the committed version directly; every
    /// following entry advances the committed version by one, including
    /// [`HistoryEntry::Unrecognized`] entries, which leave state unchanged.
    ///
    /// # Errors
    ///
    /// [`HistoryError::MisplacedSnapshot`] if a snapshot appears at any index
    /// other than 0.
    pub fn restore(
        id: Uuid,
        history: impl IntoIterator<Item = HistoryEntry<A>>,
    ) -> Result<Self, HistoryError> {
        let mut root = Self::new(id);
        for (index, entry) in history.into_iter().enumerate() {
            match entry {
                HistoryEntry::Snapshot(snapshot) if index == 0 => {
                    root.state = snapshot.state;
                    root.committed_version = snapshot.version;
                }
                HistoryEntry::Snapshot(_) => {
                    return Err(HistoryError::MisplacedSnapshot { index });
                }
                HistoryEntry::Event(event) => {
                    root.state = std::mem::take(&mut root.state).apply(&event);
                    root.committed_version += 1;
                }
                HistoryEntry::Unrecognized(contract_name) => {
                    tracing::trace!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        %id,
                        contract_name,
                        "skipping unrecognized fact during replay"
                    );
                    root.committed_version += 1;
                }
            }
        }
        Ok(root)
    }

    /// Apply a fact to the state and buffer it for persistence.
    pub fn apply(&mut self, event: A::DomainEvent) {
        self.state = std::mem::take(&mut self.state).apply(&event);
        self.uncommitted.push(event);
    }

    /// Run a command through [`Aggregate::handle`] and apply every produced
    /// fact. Returns the number of facts buffered.
    ///
    /// # Errors
    ///
    /// Returns the aggregate's error unchanged; nothing is applied on rejection.
    pub fn execute(&mut self, cmd: A::Command) -> Result<usize, A::Error> {
        let events = self.state.handle(cmd)?;
        let count = events.len();
        for event in events {
            self.apply(event);
        }
        Ok(count)
    }

    /// Drain the pending buffer. A second call returns an empty vector.
    pub fn take_uncommitted_events(&mut self) -> Vec<A::DomainEvent> {
        std::mem::take(&mut self.uncommitted)
    }

    /// Facts applied since load and not yet drained.
    pub fn uncommitted_events(&self) -> &[A::DomainEvent] {
        &self.uncommitted
    }

    /// Record that `count` drained facts were durably appended.
    pub(crate) fn mark_committed(&mut self, count: u64) {
        self.committed_version += count;
    }

    /// The aggregate's identity (its stream id).
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The folded state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Number of persisted facts the state reflects.
    pub fn committed_version(&self) -> u64 {
        self.committed_version
    }

    /// `committed_version` plus the number of pending facts.
    pub fn current_version(&self) -> u64 {
        self.committed_version + self.uncommitted.len() as u64
    }

    /// Capture the current state as a snapshot at [`current_version`](Self::current_version).
    pub fn snapshot(&self) -> Snapshot<A> {
        Snapshot {
            state: self.state.clone(),
            version: self.current_version(),
        }
    }
}

impl<A: Aggregate + fmt::Debug> fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("committed_version", &self.committed_version)
            .field("pending", &self.uncommitted.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::Aggregate;
    use serde::{Deserialize, Serialize};

    /// A simple counter aggregate used as a test fixture.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Counter {
        pub value: u64,
    }

    #[derive(Debug, Clone)]
    pub(crate) enum CounterCommand {
        Increment,
        Decrement,
        Add(u64),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        Incremented,
        Decremented,
        Added { amount: u64 },
    }

    #[derive(Debug, thiserror::Error)]
    pub(crate) enum CounterError {
        #[error("cannot decrement: counter is already zero")]
        AlreadyZero,
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "counter";

        type Command = CounterCommand;
        type DomainEvent = CounterEvent;
        type Error = CounterError;

        fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
            match cmd {
                CounterCommand::Increment => Ok(vec![CounterEvent::Incremented]),
                CounterCommand::Decrement => {
                    if self.value == 0 {
                        return Err(CounterError::AlreadyZero);
                    }
                    Ok(vec![CounterEvent::Decremented])
                }
                CounterCommand::Add(n) => Ok(vec![CounterEvent::Added { amount: n }]),
            }
        }

        fn apply(mut self, event: &Self::DomainEvent) -> Self {
            match event {
                CounterEvent::Incremented => self.value += 1,
                CounterEvent::Decremented => self.value -= 1,
                CounterEvent::Added { amount } => self.value += amount,
            }
            self
        }
    }
}
