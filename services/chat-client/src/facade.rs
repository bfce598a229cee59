//! Single entry point for the UI layer
//!
//! Composes the credential store, the authenticated requester, the renewer
//! and the channel session, and keeps the current conversation plus its
//! message log. History fetched on entry and messages arriving on the
//! subscription are appended to one log in arrival order.

use std::sync::Arc;

use chat_auth::{
    AuthenticatedRequester, CHAT_ROOM_PATH, CredentialStore, Identity, TokenRenewer,
    build_login_url, consume_redirect_token,
};
use chat_channel::{
    ChannelSession, ConnectionState, Connector, Message, SessionConfig, SessionEvent,
};
use reqwest::{Method, Url};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, OpenConversation};
use crate::error::{ClientError, Result};

pub struct SessionFacade {
    base: Url,
    store: Arc<CredentialStore>,
    renewer: Arc<TokenRenewer>,
    requester: AuthenticatedRequester,
    channel: ChannelSession,
    conversation: Arc<Mutex<Option<Conversation>>>,
    messages: Arc<Mutex<Vec<Message>>>,
}

impl SessionFacade {
    /// Wire the components together.
    ///
    /// `client` must share the store's cookie jar. The returned receiver
    /// carries every channel event after it has been applied to the log.
    pub fn new(
        base: Url,
        client: reqwest::Client,
        store: Arc<CredentialStore>,
        connector: Arc<dyn Connector>,
        session: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let renewer = Arc::new(TokenRenewer::new(client.clone(), base.clone(), store.clone()));
        let requester =
            AuthenticatedRequester::new(client, base.clone(), store.clone(), renewer.clone());
        let (channel, events) = ChannelSession::new(session, connector, store.clone(), renewer.clone());

        let conversation = Arc::new(Mutex::new(None));
        let messages = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(events, tx, conversation.clone(), messages.clone()));

        (
            Self {
                base,
                store,
                renewer,
                requester,
                channel,
                conversation,
                messages,
            },
            rx,
        )
    }

    /// Take the access token handed back by the login redirect, then try a
    /// silent renewal if there is still no credential.
    ///
    /// Returns the redirect URL with the token stripped.
    pub async fn initialize(&self, redirect: Option<&str>) -> Result<Option<Url>> {
        let mut stripped = None;
        if let Some(redirect) = redirect {
            let mut url = Url::parse(redirect).map_err(|e| common::Error::InvalidUrl {
                field: "redirect",
                reason: e.to_string(),
            })?;
            if let Some(token) = consume_redirect_token(&mut url) {
                self.store
                    .set(chat_auth::AccessCredential::new(token))
                    .await?;
                info!("access credential taken from login redirect");
            }
            stripped = Some(url);
        }

        if self.store.get().await.is_none() {
            match self.renewer.renew().await {
                Some(_) => info!("session restored by silent renewal"),
                None => debug!("no session to restore"),
            }
        }
        Ok(stripped)
    }

    /// URL to open in a browser to log in.
    pub fn login(&self) -> Result<Url> {
        Ok(build_login_url(&self.base)?)
    }

    /// End the session: the channel goes DISCONNECTED before any credential
    /// is touched.
    pub async fn logout(&self) -> Result<()> {
        self.channel.disconnect().await;

        if let Err(e) = self.requester.revoke_renewal_credential().await {
            warn!(error = %e, "renewal credential revocation failed");
        }
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear access credential");
        }
        self.store.clear_renewal_credential();

        *self.conversation.lock().await = None;
        self.messages.lock().await.clear();
        info!("logged out");
        Ok(())
    }

    /// Open (or fetch) the conversation with `other_participant_id` and join
    /// its channel.
    pub async fn enter_conversation(&self, other_participant_id: i64) -> Result<Conversation> {
        let conversation: Conversation = self
            .requester
            .request_json(
                Method::POST,
                CHAT_ROOM_PATH,
                Some(&OpenConversation {
                    other_participant_id,
                }),
            )
            .await?;
        info!(
            channel_id = %conversation.channel_id,
            history = conversation.messages.len(),
            "conversation opened"
        );

        {
            let mut current = self.conversation.lock().await;
            *self.messages.lock().await = conversation.messages.clone();
            *current = Some(conversation.clone());
        }
        self.channel.connect(conversation.channel_id).await?;
        Ok(conversation)
    }

    /// Drop and re-establish the channel for the current conversation.
    pub async fn reconnect(&self) -> Result<()> {
        let channel_id = self
            .conversation
            .lock()
            .await
            .as_ref()
            .map(|c| c.channel_id)
            .ok_or(ClientError::NotConnected)?;
        self.channel.disconnect().await;
        self.channel.connect(channel_id).await?;
        Ok(())
    }

    /// Leave the channel but keep the session and conversation.
    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    /// Publish `text` as typed; blank text is rejected.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if self.conversation.lock().await.is_none() {
            return Err(ClientError::NotConnected);
        }
        self.channel.send(text).await.map_err(|e| match e {
            chat_channel::Error::NotConnected => ClientError::NotConnected,
            other => other.into(),
        })
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.subscribe_state()
    }

    pub fn identity(&self) -> watch::Receiver<Option<Identity>> {
        self.store.subscribe_identity()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub async fn conversation(&self) -> Option<Conversation> {
        self.conversation.lock().await.clone()
    }
}

/// Apply channel events to the log, then forward them.
///
/// Keeps logging after the consumer hangs up.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    out: mpsc::UnboundedSender<SessionEvent>,
    conversation: Arc<Mutex<Option<Conversation>>>,
    messages: Arc<Mutex<Vec<Message>>>,
) {
    while let Some(event) = events.recv().await {
        if let SessionEvent::Message {
            channel_id,
            message,
        } = &event
        {
            let current = conversation.lock().await;
            if current.as_ref().is_some_and(|c| c.channel_id == *channel_id) {
                messages.lock().await.push(message.clone());
            } else {
                debug!(%channel_id, "message for a conversation no longer open");
            }
        }
        let _ = out.send(event);
    }
}
