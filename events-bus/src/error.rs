use thiserror::Error;

/// Error taxonomy for the event bus.
///
/// Only the publish path and lifecycle operations surface errors to callers
/// synchronously. The consume path keeps its failures inside the worker loop:
/// malformed entries are dead-lettered, handler failures are logged and
/// counted, transport hiccups back off and retry.
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("event bus is not connected")]
    NotConnected,

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("event publish failed: {0}")]
    Publish(String),

    #[error("envelope validation failed: {0}")]
    Validation(String),

    #[error("stream transport error: {0}")]
    Transport(String),

    #[error("subscription setup failed: {0}")]
    Subscription(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EventBusError>;
