//! Shared event types: append preconditions, proposed and recorded facts,
//! loaded streams, and deterministic stream identifiers.
//!
//! No I/O happens here. The event log backends, the repository, and the
//! subscription runners all build on these types.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed namespace UUID for deterministic stream ID derivation.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5e, 0x51, 0x0c, 0x7a, 0x2b, 0x94, 0x4f, 0x61, 0x9d, 0x3e, 0x70, 0x18, 0xc2, 0x4b, 0xa6, 0x0f,
]);

/// Derive a deterministic stream UUID from aggregate type and a natural key.
///
/// Useful when an aggregate is addressed by a business identifier (an order
/// number, an email) rather than a generated UUID. The same inputs always
/// map to the same stream.
///
/// # Examples
///
/// ```
/// use ses::stream_uuid;
/// let id = stream_uuid("counter", "c-1");
/// assert_eq!(id, stream_uuid("counter", "c-1"));
/// ```
pub fn stream_uuid(aggregate_type: &str, natural_key: &str) -> Uuid {
    let name = format!("{aggregate_type}/{natural_key}");
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}

/// Optimistic concurrency precondition checked before an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// The stream must have no committed facts yet (first write).
    NoStream,
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream's committed version must equal this value exactly.
    Exact(u64),
}

impl ExpectedVersion {
    /// The precondition for persisting changes made on top of `committed_version`.
    ///
    /// Version 0 means the aggregate was never persisted, so the stream must
    /// not exist yet.
    pub fn from_committed(committed_version: u64) -> Self {
        if committed_version == 0 {
            Self::NoStream
        } else {
            Self::Exact(committed_version)
        }
    }

    /// Returns `true` if a stream at `current` version satisfies this precondition.
    pub fn matches(self, current: u64) -> bool {
        match self {
            Self::NoStream => current == 0,
            Self::Any => true,
            Self::Exact(v) => v == current,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStream => f.write_str("no stream"),
            Self::Any => f.write_str("any version"),
            Self::Exact(v) => write!(f, "version {v}"),
        }
    }
}

/// Infrastructure metadata stamped on every fact written through the
/// [`Repository`](crate::Repository).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g., "counter").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,
    /// Actor identity from the command context, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form metadata from the command context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// A fact ready to be appended to a stream.
///
/// The `contract_name` is the stable header the serializer assigns; the
/// event log stores `payload` opaquely and never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Stable contract name of the fact (e.g., "Incremented").
    pub contract_name: String,
    /// Serialized fact body.
    pub payload: serde_json::Value,
    /// Infrastructure metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl ProposedEvent {
    /// Build a proposed event with a fresh v4 ID and empty metadata.
    ///
    /// # Arguments
    ///
    /// * `contract_name` - Stable name of the fact's type.
    /// * `payload` - The fact's body as JSON.
    pub fn new(contract_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            contract_name: contract_name.into(),
            payload,
            metadata: EventMetadata::default(),
        }
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A fact as committed to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Stream the fact belongs to.
    pub stream_id: Uuid,
    /// One-based version within the stream.
    pub version: u64,
    /// One-based position in the global log. Strictly increasing across
    /// facts; a failed append may leave a gap.
    pub global_position: u64,
    /// Stable contract name of the fact.
    pub contract_name: String,
    /// Serialized fact body.
    pub payload: serde_json::Value,
    /// Infrastructure metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
    /// Commit timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

/// A loaded stream: its committed version and the committed facts at or
/// after the requested starting version.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStream {
    /// Stream identifier.
    pub stream_id: Uuid,
    /// Number of facts committed to the stream.
    pub committed_version: u64,
    /// Committed facts, in version order.
    pub committed_events: Vec<RecordedEvent>,
}

/// Current wall-clock time in Unix epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_uuid_is_deterministic() {
        let a = stream_uuid("counter", "c-1");
        let b = stream_uuid("counter", "c-1");
        assert_eq!(a, b, "same inputs must produce the same UUID");
    }

    #[test]
    fn stream_uuid_differs_by_key_and_type() {
        assert_ne!(stream_uuid("counter", "c-1"), stream_uuid("counter", "c-2"));
        assert_ne!(stream_uuid("counter", "c-1"), stream_uuid("order", "c-1"));
    }

    #[test]
    fn no_stream_only_matches_zero() {
        assert!(ExpectedVersion::NoStream.matches(0));
        assert!(!ExpectedVersion::NoStream.matches(1));
    }

    #[test]
    fn any_matches_everything() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(42));
    }

    #[test]
    fn exact_requires_equality() {
        assert!(ExpectedVersion::Exact(2).matches(2));
        assert!(!ExpectedVersion::Exact(2).matches(1));
        assert!(!ExpectedVersion::Exact(2).matches(3));
        // Exact(0) behaves like NoStream.
        assert!(ExpectedVersion::Exact(0).matches(0));
    }

    #[test]
    fn from_committed_picks_no_stream_for_fresh_aggregates() {
        assert_eq!(ExpectedVersion::from_committed(0), ExpectedVersion::NoStream);
        assert_eq!(ExpectedVersion::from_committed(4), ExpectedVersion::Exact(4));
    }

    #[test]
    fn metadata_skips_none_fields_in_serialization() {
        let json = serde_json::to_string(&EventMetadata::default()).expect("serialize");
        assert_eq!(json, "{}");
    }

    #[test]
    fn recorded_event_tolerates_missing_metadata() {
        let json = serde_json::json!({
            "event_id": Uuid::nil(),
            "stream_id": Uuid::nil(),
            "version": 1,
            "global_position": 1,
            "contract_name": "Incremented",
            "payload": null,
            "recorded_at": 0,
        });
        let event: RecordedEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(event.metadata, EventMetadata::default());
    }
}
