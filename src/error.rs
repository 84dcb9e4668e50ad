//! Crate-level error types for the event log, contract registry, aggregate
//! replay, command execution, and subscriptions.

use std::io;

use uuid::Uuid;

use crate::event::ExpectedVersion;

/// Error returned by an [`EventLog`](crate::EventLog) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream's committed version did not match the expected version.
    ///
    /// Detected before any write; the stored stream is left untouched. The
    /// caller should reload the aggregate and retry its command.
    #[error(
        "concurrency conflict on stream {stream_id}: expected {expected}, current version is {actual}"
    )]
    Conflict {
        /// The stream that was targeted by the append.
        stream_id: Uuid,
        /// The precondition supplied by the caller.
        expected: ExpectedVersion,
        /// The stream's committed version at append time.
        actual: u64,
    },

    /// Disk I/O failure in a durable backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted data violates an invariant of the log (e.g. a version gap).
    #[error("corrupt event log: {0}")]
    Corrupt(String),

    /// A failed write could not be rolled back. The log refuses further
    /// appends until it is reopened; reads keep working.
    #[error("event log no longer accepts appends: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns `true` if this error is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Error returned by a [`ContractsRegistry`](crate::ContractsRegistry).
///
/// All variants are configuration errors: they indicate a startup
/// misconfiguration and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    /// The runtime type has no registered contract name.
    #[error("type `{type_name}` has no registered contract name")]
    Unregistered {
        /// Rust type name, for diagnostics only.
        type_name: &'static str,
    },

    /// No type is registered under the given contract name.
    #[error("no type registered under contract name `{0}`")]
    UnknownName(String),

    /// Two types were registered under the same contract name.
    #[error("contract name `{0}` is registered more than once")]
    DuplicateName(String),

    /// The same type was registered twice.
    #[error("type `{0}` is registered more than once")]
    DuplicateType(&'static str),
}

/// Error returned when a replay history is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// A snapshot appeared anywhere other than position 0.
    #[error("snapshot found at history index {index}; snapshots may only occupy index 0")]
    MisplacedSnapshot {
        /// Position of the offending entry.
        index: usize,
    },
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    #[error(transparent)]
    Domain(E),

    /// Optimistic concurrency retries exhausted.
    ///
    /// Every attempt encountered a version conflict with a concurrent writer.
    #[error("optimistic concurrency conflict: retries exhausted")]
    Conflict,

    /// The event log failed for a reason other than a version conflict.
    #[error("event log error: {0}")]
    Store(StoreError),

    /// The loaded history could not be replayed.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// A domain event could not be encoded for persistence.
    #[error("event encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// Snapshot persistence failed.
    #[error("snapshot I/O error: {0}")]
    Snapshot(#[source] io::Error),
}

impl<E: std::error::Error + Send + Sync + 'static> From<StoreError> for ExecuteError<E> {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => Self::Conflict,
            other => Self::Store(other),
        }
    }
}

/// Error returned when loading or saving an aggregate outside of `execute`.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The event log rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The loaded history could not be replayed.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// A domain event could not be encoded for persistence.
    #[error("event encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// Snapshot persistence failed.
    #[error("snapshot I/O error: {0}")]
    Snapshot(#[source] io::Error),
}

impl<E: std::error::Error + Send + Sync + 'static> From<RepositoryError> for ExecuteError<E> {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Store(e) => e.into(),
            RepositoryError::History(e) => Self::History(e),
            RepositoryError::Codec(e) => Self::Codec(e),
            RepositoryError::Snapshot(e) => Self::Snapshot(e),
        }
    }
}

/// Error returned by the subscriptions coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// `start` was called before a contracts registry was configured.
    #[error(
        "contracts registry is not set; configure one with `with_contracts_registry` before starting"
    )]
    RegistryNotConfigured,

    /// A pooler, source, or handler type could not be resolved.
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// `run_pooler` was called for a pooler type that was never registered.
    #[error("pooler `{0}` is not registered")]
    UnknownPooler(String),

    /// Two distinct pooler instances share the same contract name.
    #[error("pooler `{0}` is registered more than once")]
    DuplicatePooler(String),

    /// The checkpoint store failed during startup cleanup.
    #[error("checkpoint store error: {0}")]
    Checkpoint(#[source] io::Error),

    /// A pooler's startup hook failed.
    #[error("pooler `{pooler}` failed to start: {source}")]
    Startup {
        /// Contract name of the failing pooler.
        pooler: String,
        /// The error returned by the hook.
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn conflict_display_names_versions() {
        let err = StoreError::Conflict {
            stream_id: Uuid::nil(),
            expected: ExpectedVersion::Exact(3),
            actual: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 3"), "got: {msg}");
        assert!(msg.contains("current version is 5"), "got: {msg}");
        assert!(err.is_conflict());
    }

    #[test]
    fn io_error_is_not_conflict() {
        let err = StoreError::from(io::Error::other("disk gone"));
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn store_conflict_maps_to_execute_conflict() {
        let err: ExecuteError<TestDomainError> = StoreError::Conflict {
            stream_id: Uuid::nil(),
            expected: ExpectedVersion::NoStream,
            actual: 1,
        }
        .into();
        assert!(matches!(err, ExecuteError::Conflict));
        assert_eq!(
            err.to_string(),
            "optimistic concurrency conflict: retries exhausted"
        );
    }

    #[test]
    fn store_io_maps_to_execute_store() {
        let err: ExecuteError<TestDomainError> =
            StoreError::from(io::Error::other("file missing")).into();
        assert!(matches!(err, ExecuteError::Store(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn unregistered_contract_names_type() {
        let err = ContractError::Unregistered {
            type_name: "my_app::Pooler",
        };
        assert!(err.to_string().contains("my_app::Pooler"));
    }

    #[test]
    fn misplaced_snapshot_reports_index() {
        let err = HistoryError::MisplacedSnapshot { index: 2 };
        assert!(err.to_string().contains("index 2"));
    }

    // Errors must cross task boundaries.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StoreError>();
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<RepositoryError>();
            assert_send_sync::<SubscriptionError>();
        }
    };
}
