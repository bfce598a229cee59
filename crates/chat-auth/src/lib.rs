//! Credential lifecycle for the chat client
//!
//! Holds the short-lived access credential, renews it from the long-lived
//! renewal cookie, and wraps REST calls so a rejected credential is renewed
//! and retried once before the caller sees a failure. Standalone: nothing here
//! knows about the realtime channel.
//!
//! Credential flow:
//! 1. User opens `login::build_login_url()` in a browser
//! 2. The redirect token is taken with `login::consume_redirect_token()`
//! 3. It is stored via `credentials::CredentialStore::set()`
//! 4. A 401 on any call goes through `renewer::TokenRenewer::renew()`
//! 5. Logout revokes the renewal cookie and clears the store

pub mod constants;
pub mod credentials;
pub mod error;
pub mod login;
pub mod renewer;
pub mod requester;
pub mod token;

pub use constants::*;
pub use credentials::{AccessCredential, Claims, CredentialStore, Identity, decode_claims};
pub use error::{Error, Result};
pub use login::{build_login_url, consume_redirect_token};
pub use renewer::TokenRenewer;
pub use requester::AuthenticatedRequester;
pub use token::{TokenResponse, build_client, reissue_access_token, revoke_renewal_credential};
