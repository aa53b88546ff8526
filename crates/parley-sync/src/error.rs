use thiserror::Error;
use uuid::Uuid;

use parley_rest::RestError;

/// Failures surfaced to the intent caller. Connection trouble degrades the
/// connection state instead of appearing here; these are per-intent.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Rejected synchronously before any optimistic mutation.
    #[error("not connected")]
    NotConnected,

    /// REST collaborator failed (create conversation, reconcile).
    #[error(transparent)]
    Rest(#[from] RestError),

    /// The referenced message is unknown or not retryable.
    #[error("unknown or non-retryable message {0}")]
    UnknownMessage(Uuid),

    /// The coordinator task is gone; the session was shut down.
    #[error("chat session closed")]
    SessionClosed,
}
