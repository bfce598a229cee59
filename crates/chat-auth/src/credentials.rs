//! Credential storage for the access token and the ambient renewal cookie
//!
//! The access credential lives in memory and is optionally mirrored to a file
//! (atomic temp-file + rename, mode 0600) so a restarted client can resume
//! without a renewal round-trip. The renewal credential is never owned by the
//! store: it lives in the cookie jar shared with the HTTP client, exactly as a
//! browser would hold an HTTP-only cookie. The store only reads it, seeds it
//! from configuration, or evicts it locally on logout.
//!
//! Every change to the access credential republishes the derived `Identity`
//! on a watch channel so observers never see a stale identity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use reqwest::Url;
use reqwest::cookie::{CookieStore, Jar};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::constants::RENEWAL_COOKIE;
use crate::error::{Error, Result};

/// Short-lived bearer token authorizing API calls and the channel handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCredential(Secret<String>);

impl AccessCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    /// Raw token value (use sparingly, never log)
    pub fn expose(&self) -> &str {
        self.0.expose_str()
    }

    /// `Authorization` header value for this credential
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.expose())
    }

    /// Claims carried in the token payload, decoded without verification.
    pub fn claims(&self) -> Option<Claims> {
        decode_claims(self.expose())
    }
}

/// Identity claims embedded in the access token.
///
/// Advisory only: the signature and expiry are never checked here, the server
/// is the authority on whether a token is valid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default, rename = "userId")]
    pub user_id: Option<serde_json::Value>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
}

/// Read-only projection of the current access credential's claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub nickname: Option<String>,
}

impl Identity {
    /// Project an identity from token claims. `email` falls back to `sub`
    /// because some issuers only carry the address in the subject.
    pub fn from_claims(claims: Claims) -> Self {
        let user_id = claims.user_id.and_then(|v| match v {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) => Some(s),
            _ => None,
        });
        Self {
            user_id,
            email: claims.email.or(claims.sub),
            nickname: claims.nickname,
        }
    }

    fn of(credential: Option<&AccessCredential>) -> Option<Self> {
        credential.map(|c| c.claims().map(Self::from_claims).unwrap_or_default())
    }
}

/// Decode the payload segment of a JWT without verifying it.
///
/// Returns `None` for anything that is not `header.payload.signature` with a
/// base64url JSON payload.
pub fn decode_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// On-disk form of the access credential.
#[derive(Serialize, Deserialize)]
struct PersistedCredential {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Holder of the access credential plus a view onto the ambient cookie jar.
///
/// Shared as `Arc<CredentialStore>` between the requester, the renewer, the
/// channel session and the facade. The Mutex makes each set/clear atomic with
/// respect to its persistence write; it is never held across a network call.
pub struct CredentialStore {
    path: Option<PathBuf>,
    access: Mutex<Option<AccessCredential>>,
    identity: watch::Sender<Option<Identity>>,
    jar: Arc<Jar>,
    origin: Url,
}

impl CredentialStore {
    /// In-memory store (the default): the access credential lives only as long
    /// as the process.
    pub fn ephemeral(jar: Arc<Jar>, origin: Url) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            path: None,
            access: Mutex::new(None),
            identity,
            jar,
            origin,
        }
    }

    /// Store mirrored to `path`. A missing file is a cold start with no
    /// credential; the file is only created on the first `set`.
    pub async fn load(path: PathBuf, jar: Arc<Jar>, origin: Url) -> Result<Self> {
        let access = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let persisted: PersistedCredential = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), "loaded access credential");
            Some(AccessCredential::new(persisted.access_token)).filter(|c| !c.expose().is_empty())
        } else {
            info!(path = %path.display(), "credential file not found, starting without access credential");
            None
        };

        let (identity, _) = watch::channel(Identity::of(access.as_ref()));
        Ok(Self {
            path: Some(path),
            access: Mutex::new(access),
            identity,
            jar,
            origin,
        })
    }

    /// Current access credential, if any.
    pub async fn get(&self) -> Option<AccessCredential> {
        self.access.lock().await.clone()
    }

    /// Replace the access credential and republish the identity.
    ///
    /// The in-memory value is updated even if persisting it fails; the error
    /// is still returned so the caller can log it.
    pub async fn set(&self, credential: AccessCredential) -> Result<()> {
        let mut access = self.access.lock().await;
        self.identity
            .send_replace(Identity::of(Some(&credential)));
        let persisted = PersistedCredential {
            access_token: credential.expose().to_owned(),
        };
        *access = Some(credential);
        debug!("access credential updated");
        match &self.path {
            Some(path) => write_atomic(path, &persisted).await,
            None => Ok(()),
        }
    }

    /// Drop the access credential (memory and disk). Identity becomes `None`.
    pub async fn clear(&self) -> Result<()> {
        let mut access = self.access.lock().await;
        *access = None;
        self.identity.send_replace(None);
        debug!("access credential cleared");
        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(format!("removing credential file: {e}"))),
            }
        }
        Ok(())
    }

    /// Renewal credential from the ambient cookie jar.
    pub fn renewal_credential(&self) -> Option<String> {
        let header = self.jar.cookies(&self.origin)?;
        let header = header.to_str().ok()?;
        cookie_value(header, RENEWAL_COOKIE)
    }

    /// Place a renewal credential into the jar, as if the server had set it.
    pub fn seed_renewal_credential(&self, value: &Secret<String>) {
        self.jar.add_cookie_str(
            &format!("{RENEWAL_COOKIE}={}; Path=/", value.expose_str()),
            &self.origin,
        );
        debug!("renewal credential seeded into cookie jar");
    }

    /// Evict the renewal cookie locally by overwriting it with an expired one.
    ///
    /// Best effort only: the server-side credential stays valid until revoked.
    pub fn clear_renewal_credential(&self) {
        self.jar.add_cookie_str(
            &format!(
                "{RENEWAL_COOKIE}=; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:01 GMT; Path=/"
            ),
            &self.origin,
        );
        if self.renewal_credential().is_some() {
            warn!("renewal cookie still present after local clear");
        }
    }

    /// Identity derived from the current access credential.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    /// Watch identity changes (fires on every set/clear).
    pub fn subscribe_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    /// Cookie jar shared with the HTTP client.
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Server origin the cookies are scoped to.
    pub fn origin(&self) -> &Url {
        &self.origin
    }
}

/// Find `name` in a `Cookie:` header value (`a=1; b=2`).
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_owned())
        .filter(|v| !v.is_empty())
}

/// Write the credential file atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &PersistedCredential) -> Result<()> {
    let json = serde_json::to_string(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".access-token.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted access credential");
    Ok(())
}
