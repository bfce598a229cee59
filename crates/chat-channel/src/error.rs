//! Error types for channel session operations

/// Errors from the realtime channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No access credential and renewal produced none; transport never opened
    #[error("no credential available, login required")]
    NoCredential,

    /// A `disconnect()` or newer attempt superseded this connection attempt
    #[error("connection attempt cancelled")]
    Cancelled,

    /// Send attempted without an authenticated connection
    #[error("not connected to a channel")]
    NotConnected,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Result alias for channel operations.
pub type Result<T> = std::result::Result<T, Error>;
