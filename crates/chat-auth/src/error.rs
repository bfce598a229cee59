//! Error types for credential and request operations

/// Errors from credential storage, token renewal, and authenticated requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request rejected with 401 after one renew-and-retry
    #[error("unauthorized: access credential rejected after renewal")]
    Unauthorized,

    /// Non-auth HTTP failure, status preserved
    #[error("request failed: {status}")]
    RequestFailed { status: u16 },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
