//! Bearer-authenticated requests with transparent renewal
//!
//! Every call attaches the current access credential. A 401 triggers one
//! renewal through the shared `TokenRenewer` and exactly one retry with the
//! new credential; a second 401 (or a failed renewal) clears the local
//! credential and surfaces `Unauthorized`. There is no loop: a call costs at
//! most two requests plus one (possibly shared) renewal exchange.

use std::sync::Arc;

use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::credentials::{AccessCredential, CredentialStore};
use crate::error::{Error, Result};
use crate::renewer::TokenRenewer;
use crate::token;

/// HTTP front door for the chat server's authenticated REST resources.
pub struct AuthenticatedRequester {
    client: reqwest::Client,
    base: Url,
    store: Arc<CredentialStore>,
    renewer: Arc<TokenRenewer>,
}

impl AuthenticatedRequester {
    pub fn new(
        client: reqwest::Client,
        base: Url,
        store: Arc<CredentialStore>,
        renewer: Arc<TokenRenewer>,
    ) -> Self {
        Self {
            client,
            base,
            store,
            renewer,
        }
    }

    /// Issue `method path` with an optional JSON body.
    ///
    /// Returns the successful response; `Unauthorized` after a failed
    /// renew-and-retry; `RequestFailed` for any other non-2xx status.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = token::endpoint(&self.base, path)?;
        let credential = self.store.get().await;

        let response = self
            .send(method.clone(), &url, body, credential.as_ref())
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status != StatusCode::UNAUTHORIZED {
            warn!(%method, path, status = status.as_u16(), "request failed");
            return Err(Error::RequestFailed {
                status: status.as_u16(),
            });
        }

        debug!(%method, path, "request unauthorized, renewing access credential");
        let Some(renewed) = self.renewer.renew().await else {
            return Err(self.unauthorized(path).await);
        };

        let retry = self.send(method.clone(), &url, body, Some(&renewed)).await?;
        let status = retry.status();
        if status.is_success() {
            info!(%method, path, "request succeeded after renewal");
            Ok(retry)
        } else if status == StatusCode::UNAUTHORIZED {
            Err(self.unauthorized(path).await)
        } else {
            warn!(%method, path, status = status.as_u16(), "retried request failed");
            Err(Error::RequestFailed {
                status: status.as_u16(),
            })
        }
    }

    /// `request` with a serializable body, decoding the success body as JSON.
    pub async fn request_json<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::Http(format!("encoding request body: {e}")))?;
        let response = self.request(method, path, body.as_ref()).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Http(format!("decoding response from {path}: {e}")))
    }

    /// Revoke the renewal credential server-side (cookie-authenticated).
    pub async fn revoke_renewal_credential(&self) -> Result<()> {
        token::revoke_renewal_credential(&self.client, &self.base).await
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        body: Option<&serde_json::Value>,
        credential: Option<&AccessCredential>,
    ) -> Result<reqwest::Response> {
        let mut builder = self.client.request(method, url.clone());
        if let Some(credential) = credential {
            builder = builder.header(reqwest::header::AUTHORIZATION, credential.bearer());
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Http(format!("request to {url} failed: {e}")))?;
        metrics::counter!("chat_requests_total", "status" => response.status().as_u16().to_string())
            .increment(1);
        Ok(response)
    }

    /// Terminal auth failure: drop the rejected credential.
    async fn unauthorized(&self, path: &str) -> Error {
        warn!(path, "request unauthorized after renewal attempt, clearing access credential");
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear access credential");
        }
        Error::Unauthorized
    }
}
