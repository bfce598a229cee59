//! Access-token reissue and renewal-credential revocation
//!
//! Two calls against the chat server's auth endpoints:
//! 1. Reissue: exchange the long-lived renewal credential for a new access token
//! 2. Revoke: invalidate the renewal credential server-side on logout
//!
//! Both rely on the cookie jar attached to the HTTP client; reissue also sends
//! the renewal credential in the JSON body because the server accepts either.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::cookie::Jar;
use serde::{Deserialize, Serialize};

use crate::constants::{REFRESH_TOKEN_PATH, TOKEN_PATH};
use crate::error::{Error, Result};

/// Request body for the reissue endpoint.
#[derive(Debug, Serialize)]
struct ReissueRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

/// Response from the reissue endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(rename = "accessToken")]
    pub access_token: String,
}

/// Build the HTTP client shared by the requester and the renewer.
///
/// The cookie jar is the ambient store holding the renewal credential, so
/// every call carries it the way a browser's `credentials: include` would.
pub fn build_client(jar: Arc<Jar>, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .cookie_provider(jar)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Http(format!("building HTTP client: {e}")))
}

/// Join an endpoint path onto the server base URL.
///
/// Any path prefix on the base is kept: `http://host/chat-api` and
/// `/api/token` give `http://host/chat-api/api/token`.
pub fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let prefixed = format!("{}/", base.path());
        base.set_path(&prefixed);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| Error::Http(format!("invalid endpoint {path}: {e}")))
}

/// Exchange a renewal credential for a new access token.
///
/// A 401/403 means the renewal credential is revoked or expired; any other
/// non-success status or an empty `accessToken` is a failed exchange.
pub async fn reissue_access_token(
    client: &reqwest::Client,
    base: &Url,
    renewal: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint(base, TOKEN_PATH)?)
        .json(&ReissueRequest {
            refresh_token: renewal,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token reissue request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "renewal credential rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid reissue response: {e}")))?;

    if token.access_token.is_empty() {
        return Err(Error::TokenExchange(
            "reissue response carried an empty accessToken".into(),
        ));
    }
    Ok(token)
}

/// Revoke the renewal credential server-side.
///
/// Authenticated by the cookie alone: no bearer header and no renewal, since
/// the caller is tearing the session down.
pub async fn revoke_renewal_credential(client: &reqwest::Client, base: &Url) -> Result<()> {
    let response = client
        .delete(endpoint(base, REFRESH_TOKEN_PATH)?)
        .send()
        .await
        .map_err(|e| Error::Http(format!("revocation request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::RequestFailed {
            status: status.as_u16(),
        });
    }
    Ok(())
}
