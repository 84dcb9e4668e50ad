//! Subscription declarations: poolers, the sources they read, and the
//! handlers they dispatch to.
//!
//! A pooler is a consumer's declaration of interest. It names its sources
//! (origins of facts) and its handler catalog. Every pooler, source, and
//! handler type must be registered in the
//! [`ContractsRegistry`](crate::ContractsRegistry); the registered names are
//! the checkpoint keys.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::contracts::{ContractType, ContractsRegistry};
use crate::event::RecordedEvent;
use crate::event_log::EventLog;

/// Reacts to facts delivered by a runner.
///
/// Delivery is at-least-once: after a crash or a retried batch a handler may
/// see a fact it already processed, so `handle` should be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Returns `true` if this handler wants facts with `contract_name`.
    /// Facts it does not handle are skipped, but still advance its position.
    fn handles(&self, contract_name: &str) -> bool;

    /// Process one fact. An error makes the runner retry the whole batch.
    async fn handle(&self, event: &RecordedEvent) -> io::Result<()>;

    /// Runtime identity used to look up the handler's contract name.
    fn contract_type(&self) -> ContractType {
        ContractType::of::<Self>()
    }
}

/// An origin of facts, ordered by global position.
#[async_trait]
pub trait SubscriptionSource: Send + Sync + 'static {
    /// Up to `max` facts with position strictly greater than `after`, in
    /// position order.
    async fn fetch(&self, after: u64, max: usize) -> io::Result<Vec<RecordedEvent>>;

    /// Runtime identity used to look up the source's contract name.
    fn contract_type(&self) -> ContractType {
        ContractType::of::<Self>()
    }
}

/// A subscription unit: sources plus handlers, driven by one runner.
#[async_trait]
pub trait SubscriptionPooler: Send + Sync + 'static {
    /// The sources this pooler reads.
    fn sources(&self) -> Vec<Arc<dyn SubscriptionSource>>;

    /// The handler catalog.
    fn handlers(&self) -> Vec<Arc<dyn EventHandler>>;

    /// Called once by the coordinator before the pooler's runner starts.
    async fn on_start(&self, _registry: &dyn ContractsRegistry) -> io::Result<()> {
        Ok(())
    }

    /// Runtime identity used to look up the pooler's contract name.
    fn contract_type(&self) -> ContractType {
        ContractType::of::<Self>()
    }
}

/// Reads the global feed of an [`EventLog`].
///
/// Register `EventLogSource<L>` for the concrete log type `L` in the
/// contracts registry.
pub struct EventLogSource<L> {
    log: Arc<L>,
}

impl<L: EventLog> EventLogSource<L> {
    /// Wrap a shared log.
    pub fn new(log: Arc<L>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl<L: EventLog> SubscriptionSource for EventLogSource<L> {
    async fn fetch(&self, after: u64, max: usize) -> io::Result<Vec<RecordedEvent>> {
        self.log.read_all(after, max).await.map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ExpectedVersion, ProposedEvent};
    use crate::event_log::InMemoryEventLog;

    struct Noop;

    #[async_trait]
    impl EventHandler for Noop {
        fn handles(&self, _contract_name: &str) -> bool {
            true
        }

        async fn handle(&self, _event: &RecordedEvent) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn event_log_source_reads_global_feed() {
        let log = Arc::new(InMemoryEventLog::new());
        let id = uuid::Uuid::new_v4();
        log.save_changes(
            id,
            ExpectedVersion::NoStream,
            vec![
                ProposedEvent::new("A", serde_json::Value::Null),
                ProposedEvent::new("B", serde_json::Value::Null),
            ],
        )
        .await
        .expect("append");

        let source = EventLogSource::new(Arc::clone(&log));
        let tail = source.fetch(1, 10).await.expect("fetch");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].contract_name, "B");
        assert_eq!(tail[0].global_position, 2);
    }

    #[test]
    fn default_contract_type_is_the_concrete_type() {
        let handler: Arc<dyn EventHandler> = Arc::new(Noop);
        assert_eq!(handler.contract_type(), ContractType::of::<Noop>());

        let source: Arc<dyn SubscriptionSource> =
            Arc::new(EventLogSource::new(Arc::new(InMemoryEventLog::new())));
        assert_eq!(
            source.contract_type(),
            ContractType::of::<EventLogSource<InMemoryEventLog>>()
        );
    }
}
