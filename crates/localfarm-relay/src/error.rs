use std::time::Duration;

use thiserror::Error;

/// Rejection of an inbound chat request. Raised before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The body is not a JSON object, or a field has the wrong JSON type.
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("message too large ({len} bytes); maximum is {max} bytes")]
    MessageTooLong { len: usize, max: usize },

    #[error("invalid history entry at index {index}: {reason}")]
    InvalidHistoryEntry { index: usize, reason: String },
}

impl ValidationError {
    /// Stable machine-checkable identifier for clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MalformedBody(_) => "malformed_body",
            ValidationError::EmptyMessage => "empty_message",
            ValidationError::MessageTooLong { .. } => "message_too_long",
            ValidationError::InvalidHistoryEntry { .. } => "invalid_history_entry",
        }
    }
}

/// Failure of the completion provider.
///
/// Returned from `completions` when the call never produced a stream, or
/// yielded as a stream item when the stream broke mid-flight.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("provider stream error: {0}")]
    Stream(String),

    #[error("provider sent an undecodable event: {0}")]
    Decode(String),

    #[error("provider produced nothing for {0:?}")]
    Timeout(Duration),
}

/// The history backend could not complete a read or write.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PersistenceError {
    pub fn backend(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        PersistenceError::Backend(Box::new(e))
    }
}

/// Errors that abort a relay before any byte reaches the client.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The user turn could not be persisted; the provider was not called.
    #[error("failed to persist user message: {0}")]
    Persistence(#[from] PersistenceError),

    /// The provider call failed to start; no stream was opened.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Why a stream stopped before the provider signalled the end.
///
/// Never surfaced to a client that is already streaming; only logged and
/// reported through [`RelayReport`](crate::relay::RelayReport).
#[derive(Debug, Error)]
pub enum StreamInterruption {
    #[error(transparent)]
    Provider(ProviderError),

    #[error("provider idle for {0:?}")]
    ProviderIdle(Duration),

    #[error("client disconnected")]
    ClientGone,

    #[error("client did not accept a fragment within {0:?}")]
    ClientStalled(Duration),
}

impl StreamInterruption {
    /// Whether the client side is still able to receive a trailer.
    pub fn client_reachable(&self) -> bool {
        !matches!(self, StreamInterruption::ClientGone | StreamInterruption::ClientStalled(_))
    }
}
