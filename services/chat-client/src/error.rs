//! Service-specific error types

use thiserror::Error;

/// Errors surfaced by the session facade.
///
/// Library failures keep their own variants so callers can still tell an
/// auth problem from a transport one.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("not connected to a conversation")]
    NotConnected,

    #[error(transparent)]
    Auth(#[from] chat_auth::Error),

    #[error(transparent)]
    Channel(#[from] chat_channel::Error),

    #[error(transparent)]
    Config(#[from] common::Error),
}

impl ClientError {
    /// Whether the user has to log in again.
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            Self::Auth(chat_auth::Error::Unauthorized)
                | Self::Channel(chat_channel::Error::NoCredential)
        )
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, ClientError>;
