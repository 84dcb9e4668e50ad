//! Cross-cutting command metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventMetadata;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and correlation information without polluting the
/// aggregate's command or event types. The repository stamps these fields
/// onto every fact the command produces.
///
/// # Examples
///
/// ```
/// use ses::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata forwarded to [`EventMetadata::extra`].
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Identity of whoever issues the command (e.g. a user ID).
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier shared by every fact produced for one request.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata.
    ///
    /// # Arguments
    ///
    /// * `meta` - JSON value copied into [`EventMetadata::extra`] of every
    ///   fact produced under this context.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }

    /// Build the event metadata stamped on facts produced under this context.
    pub(crate) fn event_metadata(&self, aggregate_type: &str) -> EventMetadata {
        EventMetadata {
            aggregate_type: Some(aggregate_type.to_owned()),
            actor: self.actor.clone(),
            correlation_id: self.correlation_id.clone(),
            extra: self.metadata.clone(),
        }
    }
}
