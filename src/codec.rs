//! Serializer collaborator: converts domain events to and from a persisted
//! payload plus a contract-name header.
//!
//! Domain events are enums using adjacently tagged serde
//! (`#[serde(tag = "type", content = "data")]`). The `"type"` tag becomes the
//! contract name and the `"data"` portion becomes the payload. Renaming a
//! Rust variant does not change history as long as the tag is pinned with
//! `#[serde(rename = "...")]`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::ser::Error as _;

use crate::event::{EventMetadata, ProposedEvent, RecordedEvent};

/// Split an adjacently tagged domain event into its contract name and payload.
///
/// Unit variants have no `"data"` field and produce a `null` payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does not
/// serialize to an object with a string `"type"` field.
pub fn encode_payload<E: Serialize>(
    event: &E,
) -> serde_json::Result<(String, serde_json::Value)> {
    let value = serde_json::to_value(event)?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to an adjacently tagged object",
        ));
    };
    let contract_name = match obj.remove("type") {
        Some(serde_json::Value::String(name)) => name,
        _ => {
            return Err(serde_json::Error::custom(
                "domain event is missing a string `type` tag",
            ));
        }
    };
    let payload = obj.remove("data").unwrap_or(serde_json::Value::Null);
    Ok((contract_name, payload))
}

/// Encode a domain event into a [`ProposedEvent`] carrying `metadata`.
///
/// # Errors
///
/// See [`encode_payload`].
pub fn encode_domain_event<E: Serialize>(
    event: &E,
    metadata: EventMetadata,
) -> serde_json::Result<ProposedEvent> {
    let (contract_name, payload) = encode_payload(event)?;
    Ok(ProposedEvent::new(contract_name, payload).with_metadata(metadata))
}

/// Rebuild a domain event from its contract name and payload.
///
/// Returns `None` when the contract name is not a variant of `E` (or the
/// payload no longer fits it). Callers treat `None` as an unknown fact and
/// skip it, so retired event types never break old history.
pub fn decode_payload<E: DeserializeOwned>(
    contract_name: &str,
    payload: &serde_json::Value,
) -> Option<E> {
    let with_data = || serde_json::json!({ "type": contract_name, "data": payload });
    // A null payload is either a unit variant (no `"data"` field) or a
    // variant whose content serializes to null, such as `Noted(Value::Null)`.
    let decoded = if payload.is_null() {
        serde_json::from_value::<E>(serde_json::json!({ "type": contract_name }))
            .or_else(|_| serde_json::from_value::<E>(with_data()))
    } else {
        serde_json::from_value::<E>(with_data())
    };

    match decoded {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(
                contract_name,
                error = %e,
                "fact does not decode into the requested event type, skipping"
            );
            None
        }
    }
}

/// Decode a recorded fact into a domain event. See [`decode_payload`].
pub fn decode_domain_event<E: DeserializeOwned>(recorded: &RecordedEvent) -> Option<E> {
    decode_payload(&recorded.contract_name, &recorded.payload)
}
