use shared::domain::MessageId;
use thiserror::Error;

/// Errors surfaced by [`crate::ChatSession`] operations.
///
/// Internal consistency guards (duplicate deliveries, expired typing entries)
/// are resolved silently and never reach this type.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Transport unreachable or identity missing. Fatal to the operation,
    /// safe to retry.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A backend fetch or sync failed. Local state is left intact and the
    /// caller may retry.
    #[error("failed to load {what}: {source}")]
    Load {
        what: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Message dispatch failed after the optimistic append. The placeholder
    /// stays in the log marked failed; `message_id` identifies it for retry.
    #[error("message dispatch failed for {message_id}: {source}")]
    Send {
        message_id: MessageId,
        #[source]
        source: anyhow::Error,
    },

    /// Rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(&'static str),
}
