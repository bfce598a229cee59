//! Server endpoint paths and well-known names
//!
//! Paths are joined onto the configured server base URL. The names match the
//! chat server's REST and cookie contract.

/// Token reissue endpoint: exchanges the renewal credential for an access token
pub const TOKEN_PATH: &str = "/api/token";

/// Renewal credential revocation endpoint (cookie-authenticated)
pub const REFRESH_TOKEN_PATH: &str = "/api/refresh-token";

/// Room resource: create or fetch the conversation with another participant
pub const CHAT_ROOM_PATH: &str = "/v1/chatRoom";

/// External identity provider entry point
pub const LOGIN_PATH: &str = "/oauth2/authorization/google";

/// Cookie holding the long-lived renewal credential
pub const RENEWAL_COOKIE: &str = "refresh_token";

/// Query parameter carrying the access token back from the login redirect
pub const REDIRECT_TOKEN_PARAM: &str = "token";
