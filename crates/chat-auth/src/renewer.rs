//! Single-flight access-token renewal
//!
//! Every auth failure (401 on a request, ERROR frame on the channel) funnels
//! through `TokenRenewer::renew`. Concurrent callers join the exchange that is
//! already in flight instead of issuing their own, so a burst of 401s costs one
//! round-trip to the token endpoint. The shared handle is dropped as soon as
//! the exchange settles; the next failure starts a fresh exchange. A handle
//! that settled after its last caller went away is never joined.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::Url;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{AccessCredential, CredentialStore};
use crate::error::Error;
use crate::token;

type PendingRenewal = Shared<BoxFuture<'static, Option<AccessCredential>>>;

/// Exchanges the renewal cookie for fresh access credentials.
pub struct TokenRenewer {
    client: reqwest::Client,
    base: Url,
    store: Arc<CredentialStore>,
    /// In-flight exchange tagged with its generation, so a finished caller
    /// only clears its own handle.
    pending: Mutex<Option<(u64, PendingRenewal)>>,
    generation: AtomicU64,
}

impl TokenRenewer {
    pub fn new(client: reqwest::Client, base: Url, store: Arc<CredentialStore>) -> Self {
        Self {
            client,
            base,
            store,
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Obtain a new access credential, or `None` if renewal is impossible.
    ///
    /// Never errors: a missing renewal cookie returns immediately without a
    /// network call, and every exchange failure is logged and mapped to `None`.
    /// On success the new credential is already in the store when this returns.
    pub async fn renew(&self) -> Option<AccessCredential> {
        let (id, exchange) = {
            let mut pending = self.pending.lock().await;
            match pending.as_ref() {
                Some((id, exchange)) if exchange.peek().is_none() => {
                    debug!(generation = id, "joining in-flight renewal");
                    (*id, exchange.clone())
                }
                _ => {
                    let Some(renewal) = self.store.renewal_credential() else {
                        debug!("no renewal credential in cookie jar, skipping renewal");
                        metrics::counter!("chat_token_renewals_total", "outcome" => "skipped")
                            .increment(1);
                        return None;
                    };
                    let id = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let exchange = run_exchange(
                        self.client.clone(),
                        self.base.clone(),
                        Arc::clone(&self.store),
                        Secret::new(renewal),
                    )
                    .boxed()
                    .shared();
                    *pending = Some((id, exchange.clone()));
                    debug!(generation = id, "starting renewal exchange");
                    (id, exchange)
                }
            }
        };

        let result = exchange.await;

        let mut pending = self.pending.lock().await;
        if matches!(pending.as_ref(), Some((current, _)) if *current == id) {
            *pending = None;
        }
        result
    }

    /// Whether an exchange is currently outstanding.
    pub async fn in_flight(&self) -> bool {
        self.pending
            .lock()
            .await
            .as_ref()
            .is_some_and(|(_, exchange)| exchange.peek().is_none())
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }
}

/// One reissue round-trip; stores the credential on success.
async fn run_exchange(
    client: reqwest::Client,
    base: Url,
    store: Arc<CredentialStore>,
    renewal: Secret<String>,
) -> Option<AccessCredential> {
    match token::reissue_access_token(&client, &base, renewal.expose_str()).await {
        Ok(response) => {
            let credential = AccessCredential::new(response.access_token);
            if let Err(e) = store.set(credential.clone()).await {
                warn!(error = %e, "failed to persist renewed access credential");
            }
            metrics::counter!("chat_token_renewals_total", "outcome" => "renewed").increment(1);
            info!("access credential renewed");
            Some(credential)
        }
        Err(Error::InvalidCredentials(msg)) => {
            warn!(error = %msg, "renewal credential rejected, re-login required");
            metrics::counter!("chat_token_renewals_total", "outcome" => "rejected").increment(1);
            None
        }
        Err(e) => {
            warn!(error = %e, "token renewal failed");
            metrics::counter!("chat_token_renewals_total", "outcome" => "failed").increment(1);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TOKEN_PATH;
    use axum::http::StatusCode;
    use axum::routing::post;
    use reqwest::cookie::Jar;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Reissue endpoint that counts hits and answers after `delay`.
    async fn start_renewal_server(
        status: StatusCode,
        access_token: &'static str,
        delay: Duration,
    ) -> (Url, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            TOKEN_PATH,
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    (status, format!(r#"{{"accessToken":"{access_token}"}}"#))
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), hits)
    }

    fn renewer_for(base: &Url, with_cookie: bool) -> Arc<TokenRenewer> {
        let store = Arc::new(CredentialStore::ephemeral(
            Arc::new(Jar::default()),
            base.clone(),
        ));
        if with_cookie {
            store.seed_renewal_credential(&Secret::new("rt_valid".to_string()));
        }
        Arc::new(TokenRenewer::new(reqwest::Client::new(), base.clone(), store))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let (base, hits) =
            start_renewal_server(StatusCode::OK, "at_fresh", Duration::from_millis(150)).await;
        let renewer = renewer_for(&base, true);

        let calls = (0..10).map(|_| {
            let renewer = renewer.clone();
            async move { renewer.renew().await }
        });
        let results = futures_util::future::join_all(calls).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one exchange");
        for result in results {
            assert_eq!(result.unwrap().expose(), "at_fresh");
        }
        assert!(!renewer.in_flight().await, "handle cleared on completion");
        assert_eq!(renewer.store().get().await.unwrap().expose(), "at_fresh");
    }

    #[tokio::test]
    async fn sequential_renewals_issue_fresh_exchanges() {
        let (base, hits) =
            start_renewal_server(StatusCode::OK, "at_fresh", Duration::ZERO).await;
        let renewer = renewer_for(&base, true);

        assert!(renewer.renew().await.is_some());
        assert!(renewer.renew().await.is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn settled_exchange_abandoned_by_its_caller_is_not_reused() {
        let (base, hits) =
            start_renewal_server(StatusCode::OK, "at_fresh", Duration::ZERO).await;
        let renewer = renewer_for(&base, true);

        let caller = tokio::spawn({
            let renewer = renewer.clone();
            async move { renewer.renew().await }
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            while !renewer.in_flight().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Keep the caller from clearing its handle once the exchange settles
        let guard = renewer.pending.lock().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while renewer.store().get().await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert!(guard.is_some(), "settled handle left behind");
        drop(guard);

        renewer.store().clear().await.unwrap();
        assert!(!renewer.in_flight().await);
        assert_eq!(renewer.renew().await.unwrap().expose(), "at_fresh");
        assert_eq!(hits.load(Ordering::SeqCst), 2, "fresh exchange issued");
    }

    #[tokio::test]
    async fn missing_cookie_skips_the_call() {
        let (base, hits) =
            start_renewal_server(StatusCode::OK, "at_fresh", Duration::ZERO).await;
        let renewer = renewer_for(&base, false);

        assert!(renewer.renew().await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_renewal_returns_none_and_keeps_store() {
        let (base, hits) =
            start_renewal_server(StatusCode::UNAUTHORIZED, "ignored", Duration::ZERO).await;
        let renewer = renewer_for(&base, true);
        renewer
            .store()
            .set(AccessCredential::new("at_old"))
            .await
            .unwrap();

        assert!(renewer.renew().await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(renewer.store().get().await.unwrap().expose(), "at_old");
    }

    #[tokio::test]
    async fn unreachable_endpoint_returns_none() {
        let base = Url::parse("http://127.0.0.1:9/").unwrap();
        let renewer = renewer_for(&base, true);
        assert!(renewer.renew().await.is_none());
        assert!(!renewer.in_flight().await);
    }
}
