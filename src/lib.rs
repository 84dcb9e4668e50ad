//! Event-sourcing core: aggregate replay, an append-only event log with
//! optimistic concurrency, and polling subscriptions with durable checkpoints.

mod aggregate;
pub use aggregate::{Aggregate, AggregateRoot, HistoryEntry};
mod checkpoint;
pub use checkpoint::{CheckpointKey, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
mod codec;
pub use codec::{decode_domain_event, decode_payload, encode_domain_event, encode_payload};
mod command;
mod contracts;
mod error;
mod event;
mod event_log;
mod pooler;
mod repository;
mod runner;
mod snapshot;
mod storage;
mod subscriptions;

pub use async_trait::async_trait;
pub use command::CommandContext;
pub use contracts::{
    ContractType, ContractsRegistry, StaticContractsRegistry, StaticContractsRegistryBuilder,
};
pub use error::{
    ContractError, ExecuteError, HistoryError, RepositoryError, StoreError, SubscriptionError,
};
pub use event::{
    EventMetadata, EventStream, ExpectedVersion, ProposedEvent, RecordedEvent, stream_uuid,
};
pub use event_log::{EventLog, InMemoryEventLog};
pub use pooler::{EventHandler, EventLogSource, SubscriptionPooler, SubscriptionSource};
pub use repository::{DEFAULT_MAX_RETRIES, Repository};
pub use runner::{Runner, RunnerConfig};
pub use snapshot::{FileSnapshotStore, Snapshot, SnapshotStore};
pub use storage::{FileEventLog, StoreLayout};
pub use subscriptions::{EventStoreSubscriptions, SubscriptionsBuilder};
