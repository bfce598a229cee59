//! Channel session state machine
//!
//! Owns at most one transport and at most one subscription. Each transport
//! gets an epoch; the reader task and any scheduled reconnect carry the epoch
//! they were created under, so anything belonging to a torn-down connection
//! finds its epoch stale and does nothing.
//!
//! ```text
//! DISCONNECTED --connect--> CONNECTING --CONNECTED frame--> CONNECTED
//!      ^                        |                               |
//!      +------ ERROR / close / disconnect() --------------------+
//! ```
//!
//! A handshake `ERROR` goes through the renewer and, when a new credential
//! results, schedules one reconnect. An unexpected close schedules one
//! reconnect if the policy allows it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chat_auth::{AccessCredential, CredentialStore, TokenRenewer};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{ChannelId, ConnectionState, Message, OutboundMessage, SessionEvent};
use crate::reconnect::{self, ReconnectHandle, ReconnectPolicy, ReconnectReason};
use crate::stomp::{Command, Frame};
use crate::transport::{Connection, Connector, TransportEvent};

/// Destinations and handshake parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Value of the STOMP `host` header
    pub host: String,
    pub sub_prefix: String,
    pub pub_prefix: String,
    /// Advertised heart-beat in both directions; 0 disables
    pub heartbeat_ms: u64,
    pub policy: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            sub_prefix: "/sub".into(),
            pub_prefix: "/pub".into(),
            heartbeat_ms: 10_000,
            policy: ReconnectPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn subscribe_topic(&self, channel_id: ChannelId) -> String {
        format!("{}/channel/{channel_id}", self.sub_prefix)
    }

    pub fn publish_topic(&self) -> String {
        format!("{}/message", self.pub_prefix)
    }
}

struct ActiveConnection {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    /// Target channel; replaced while CONNECTING, resubscribed while CONNECTED
    channel_id: ChannelId,
    subscription: Option<String>,
    reader: Option<JoinHandle<()>>,
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    store: Arc<CredentialStore>,
    renewer: Arc<TokenRenewer>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    conn: Mutex<Option<ActiveConnection>>,
    /// Serializes connection attempts
    connecting: Mutex<()>,
    epoch: AtomicU64,
    reconnect: Mutex<Option<ReconnectHandle>>,
}

/// Authenticated realtime session on one channel at a time.
pub struct ChannelSession {
    inner: Arc<Inner>,
}

impl ChannelSession {
    /// Build a session and the receiver for its events.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        store: Arc<CredentialStore>,
        renewer: Arc<TokenRenewer>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            config,
            connector,
            store,
            renewer,
            state,
            events,
            conn: Mutex::new(None),
            connecting: Mutex::new(()),
            epoch: AtomicU64::new(0),
            reconnect: Mutex::new(None),
        });
        (Self { inner }, rx)
    }

    /// Connect to `channel_id`, or move the live session onto it.
    ///
    /// Returns once the handshake is written; CONNECTED follows when the
    /// server accepts it. Cancels any scheduled reconnect.
    pub async fn connect(&self, channel_id: ChannelId) -> Result<()> {
        if let Some(handle) = self.inner.reconnect.lock().await.take() {
            handle.cancel();
        }
        self.inner.connect(channel_id, None).await
    }

    /// Drop the connection. Idempotent.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.inner.reconnect.lock().await.take() {
            handle.cancel();
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let active = self.inner.conn.lock().await.take();
        if let Some(active) = active {
            if let Some(subscription) = &active.subscription {
                let _ = active.outbound.send(Frame::unsubscribe(subscription));
            }
            let _ = active.outbound.send(Frame::disconnect());
            if let Some(reader) = active.reader {
                reader.abort();
            }
            info!(channel_id = %active.channel_id, "channel disconnected");
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Publish `content` on the active channel.
    pub async fn send(&self, content: &str) -> Result<()> {
        let conn = self.inner.conn.lock().await;
        let Some(active) = conn.as_ref() else {
            return Err(Error::NotConnected);
        };
        if *self.inner.state.borrow() != ConnectionState::Connected || active.subscription.is_none()
        {
            return Err(Error::NotConnected);
        }

        let body = serde_json::to_string(&OutboundMessage {
            channel_id: active.channel_id,
            content,
        })
        .map_err(|e| Error::Transport(format!("encoding message: {e}")))?;
        active
            .outbound
            .send(Frame::send(&self.inner.config.publish_topic(), body))
            .map_err(|_| Error::NotConnected)?;
        metrics::counter!("chat_messages_sent_total").increment(1);
        debug!(channel_id = %active.channel_id, "message sent");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Channel the session is connected or connecting to.
    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.inner.conn.lock().await.as_ref().map(|a| a.channel_id)
    }

    pub async fn has_pending_reconnect(&self) -> bool {
        self.inner
            .reconnect
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Inner {
    /// `expected_epoch` is set for scheduled reconnects, which must not run
    /// once anything newer has happened.
    ///
    /// The attempt claims the epoch it started under with a compare-exchange
    /// after credential resolution, so a `disconnect()` that lands while the
    /// renewer is running cancels it.
    async fn connect(
        self: &Arc<Self>,
        channel_id: ChannelId,
        expected_epoch: Option<u64>,
    ) -> Result<()> {
        let _serial = self.connecting.lock().await;
        let started = self.epoch.load(Ordering::SeqCst);
        if expected_epoch.is_some_and(|e| e != started) {
            debug!(%channel_id, "stale reconnect skipped");
            return Ok(());
        }

        {
            let mut conn = self.conn.lock().await;
            let state = *self.state.borrow();
            if let Some(active) = conn.as_mut() {
                match state {
                    ConnectionState::Connected => {
                        self.subscribe(active, channel_id);
                        return Ok(());
                    }
                    ConnectionState::Connecting => {
                        debug!(from = %active.channel_id, to = %channel_id, "retargeting pending connection");
                        active.channel_id = channel_id;
                        return Ok(());
                    }
                    ConnectionState::Disconnected => {}
                }
            }
        }

        let Some(credential) = self.resolve_credential().await else {
            if self.epoch.load(Ordering::SeqCst) != started {
                debug!(%channel_id, "session changed during credential resolution");
                return superseded(expected_epoch);
            }
            info!(%channel_id, "no credential for channel handshake");
            self.set_state(ConnectionState::Disconnected);
            return Err(Error::NoCredential);
        };

        let epoch = started + 1;
        if self
            .epoch
            .compare_exchange(started, epoch, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%channel_id, "session changed during credential resolution");
            return superseded(expected_epoch);
        }
        self.set_state(ConnectionState::Connecting);

        let Connection { outbound, inbound } = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(%channel_id, error = %e, "channel transport failed to open");
                if self.epoch.load(Ordering::SeqCst) == epoch {
                    self.set_state(ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(%channel_id, "connection attempt superseded");
            return Err(Error::Cancelled);
        }

        outbound
            .send(Frame::connect(
                &self.config.host,
                self.config.heartbeat_ms,
                &credential.bearer(),
            ))
            .map_err(|_| Error::Transport("transport closed before handshake".into()))?;

        let mut conn = self.conn.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(%channel_id, "connection attempt superseded");
            return Err(Error::Cancelled);
        }
        let reader = tokio::spawn(read_loop(Arc::downgrade(self), epoch, inbound));
        *conn = Some(ActiveConnection {
            epoch,
            outbound,
            channel_id,
            subscription: None,
            reader: Some(reader),
        });
        info!(%channel_id, epoch, "channel handshake sent");
        Ok(())
    }

    async fn resolve_credential(&self) -> Option<AccessCredential> {
        match self.store.get().await {
            Some(credential) => Some(credential),
            None => {
                debug!("no access credential, renewing before handshake");
                self.renewer.renew().await
            }
        }
    }

    /// Replace the active subscription: old UNSUBSCRIBE is written first.
    fn subscribe(&self, active: &mut ActiveConnection, channel_id: ChannelId) {
        if let Some(old) = active.subscription.take() {
            let _ = active.outbound.send(Frame::unsubscribe(&old));
        }
        let id = format!("sub-{}", Uuid::new_v4());
        let topic = self.config.subscribe_topic(channel_id);
        let _ = active.outbound.send(Frame::subscribe(&id, &topic));
        active.subscription = Some(id);
        active.channel_id = channel_id;
        info!(%channel_id, topic = %topic, "subscribed");
        let _ = self.events.send(SessionEvent::Subscribed { channel_id });
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
            metrics::gauge!("chat_connection_state").set(state.as_gauge());
        }
    }

    /// Returns `false` when the reader should stop.
    async fn handle_event(self: &Arc<Self>, epoch: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Frame(frame) => match frame.command {
                Command::Connected => {
                    let mut conn = self.conn.lock().await;
                    let Some(active) = conn.as_mut().filter(|a| a.epoch == epoch) else {
                        return false;
                    };
                    self.set_state(ConnectionState::Connected);
                    info!(channel_id = %active.channel_id, version = frame.get("version"), "channel connected");
                    let channel_id = active.channel_id;
                    self.subscribe(active, channel_id);
                    true
                }
                Command::Message => {
                    self.deliver(epoch, &frame).await;
                    true
                }
                Command::Error => {
                    warn!(
                        reason = frame.get("message").unwrap_or_default(),
                        "channel rejected the session"
                    );
                    self.on_auth_error(epoch).await;
                    false
                }
                other => {
                    debug!(command = %other, "ignoring frame");
                    true
                }
            },
            TransportEvent::Malformed(reason) => {
                warn!(reason = %reason, "dropping malformed frame");
                metrics::counter!("chat_frames_dropped_total", "reason" => "malformed").increment(1);
                true
            }
            TransportEvent::Closed(reason) => {
                self.on_closed(epoch, reason).await;
                false
            }
        }
    }

    async fn deliver(&self, epoch: u64, frame: &Frame) {
        let conn = self.conn.lock().await;
        let Some(active) = conn.as_ref().filter(|a| a.epoch == epoch) else {
            return;
        };
        if active.subscription.is_none() || frame.get("subscription") != active.subscription.as_deref() {
            debug!(subscription = frame.get("subscription"), "message for inactive subscription dropped");
            metrics::counter!("chat_frames_dropped_total", "reason" => "stale_subscription").increment(1);
            return;
        }
        match serde_json::from_str::<Message>(&frame.body) {
            Ok(message) => {
                metrics::counter!("chat_messages_received_total").increment(1);
                let _ = self.events.send(SessionEvent::Message {
                    channel_id: active.channel_id,
                    message,
                });
            }
            Err(e) => {
                warn!(error = %e, "dropping message with malformed body");
                metrics::counter!("chat_frames_dropped_total", "reason" => "bad_body").increment(1);
            }
        }
    }

    /// Take the connection if it still belongs to `epoch`.
    ///
    /// Bumps the epoch and leaves the reader detached; the caller is the reader.
    async fn teardown(&self, epoch: u64) -> Option<ChannelId> {
        let mut conn = self.conn.lock().await;
        if !conn.as_ref().is_some_and(|a| a.epoch == epoch) {
            return None;
        }
        let active = conn.take()?;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        Some(active.channel_id)
    }

    async fn on_auth_error(self: &Arc<Self>, epoch: u64) {
        let Some(channel_id) = self.teardown(epoch).await else {
            return;
        };
        let torn_down = self.epoch.load(Ordering::SeqCst);

        match self.renewer.renew().await {
            Some(_) => {
                if self.epoch.load(Ordering::SeqCst) != torn_down {
                    debug!(%channel_id, "session changed during renewal, not reconnecting");
                    return;
                }
                info!(%channel_id, "credential renewed after handshake rejection");
                self.schedule_reconnect(
                    channel_id,
                    self.config.policy.auth_retry_delay,
                    ReconnectReason::AuthRenewed,
                )
                .await;
            }
            None => {
                warn!(%channel_id, "channel authentication failed, login required");
                let _ = self.events.send(SessionEvent::AuthFailed);
            }
        }
    }

    async fn on_closed(self: &Arc<Self>, epoch: u64, reason: Option<String>) {
        let Some(channel_id) = self.teardown(epoch).await else {
            return;
        };
        warn!(%channel_id, reason = ?reason, "channel transport closed");
        if let Some(delay) = self.config.policy.close_retry_delay {
            self.schedule_reconnect(channel_id, delay, ReconnectReason::TransportClosed)
                .await;
        }
        let _ = self.events.send(SessionEvent::Disconnected);
    }

    async fn schedule_reconnect(
        self: &Arc<Self>,
        channel_id: ChannelId,
        delay: Duration,
        reason: ReconnectReason,
    ) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let task = reconnect_task(Arc::downgrade(self), epoch, channel_id);
        let handle = reconnect::schedule(delay, epoch, reason, task);
        if let Some(previous) = self.reconnect.lock().await.replace(handle) {
            previous.cancel();
        }
    }

    async fn fire_reconnect(self: &Arc<Self>, epoch: u64, channel_id: ChannelId) {
        {
            // Release our own slot without aborting the running task
            let mut slot = self.reconnect.lock().await;
            if slot.as_ref().is_some_and(|h| h.epoch() == epoch) {
                slot.take();
            }
        }
        info!(%channel_id, epoch, "reconnecting");
        match self.connect(channel_id, Some(epoch)).await {
            Ok(()) => {}
            Err(Error::NoCredential) => {
                let _ = self.events.send(SessionEvent::AuthFailed);
            }
            Err(Error::Cancelled) => debug!(%channel_id, "reconnect superseded"),
            Err(e) => warn!(%channel_id, error = %e, "reconnect failed"),
        }
    }
}

/// Outcome of an attempt overtaken by a newer epoch: quiet for scheduled
/// reconnects, `Cancelled` for callers.
fn superseded(expected_epoch: Option<u64>) -> Result<()> {
    match expected_epoch {
        Some(_) => Ok(()),
        None => Err(Error::Cancelled),
    }
}

/// Boxed so the reconnect path (which spawns a reader that may schedule
/// another reconnect) has a nameable `Send` type.
fn reconnect_task(inner: Weak<Inner>, epoch: u64, channel_id: ChannelId) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Some(inner) = inner.upgrade() {
            inner.fire_reconnect(epoch, channel_id).await;
        }
    })
}

async fn read_loop(inner: Weak<Inner>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.handle_event(epoch, event).await {
            return;
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.on_closed(epoch, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryConnector, MemoryPeer};
    use axum::http::StatusCode;
    use axum::routing::post;
    use chat_auth::TOKEN_PATH;
    use common::Secret;
    use reqwest::Url;
    use reqwest::cookie::Jar;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(2);

    enum Renewal {
        NoCookie,
        Grants,
        /// Grants after the given delay
        Slow(Duration),
        Revoked,
    }

    struct Harness {
        session: ChannelSession,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        peers: mpsc::UnboundedReceiver<MemoryPeer>,
        connector: Arc<MemoryConnector>,
        store: Arc<CredentialStore>,
        renewals: Arc<AtomicUsize>,
    }

    async fn start_token_server(grants: bool, delay: Duration, hits: Arc<AtomicUsize>) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            TOKEN_PATH,
            post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    if grants {
                        (StatusCode::OK, r#"{"accessToken":"at_renewed"}"#)
                    } else {
                        (StatusCode::UNAUTHORIZED, "revoked")
                    }
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    async fn harness(access: Option<&str>, renewal: Renewal, close_retry: Option<Duration>) -> Harness {
        let renewals = Arc::new(AtomicUsize::new(0));
        let delay = match renewal {
            Renewal::Slow(delay) => delay,
            _ => Duration::ZERO,
        };
        let base = start_token_server(!matches!(renewal, Renewal::Revoked), delay, renewals.clone()).await;
        let jar = Arc::new(Jar::default());
        let store = Arc::new(CredentialStore::ephemeral(jar.clone(), base.clone()));
        if let Some(access) = access {
            store.set(AccessCredential::new(access)).await.unwrap();
        }
        if !matches!(renewal, Renewal::NoCookie) {
            store.seed_renewal_credential(&Secret::new("rt_1".to_string()));
        }
        let client = chat_auth::build_client(jar, Duration::from_secs(5)).unwrap();
        let renewer = Arc::new(TokenRenewer::new(client, base, store.clone()));

        let (connector, peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let config = SessionConfig {
            policy: ReconnectPolicy {
                auth_retry_delay: Duration::from_millis(50),
                close_retry_delay: close_retry,
            },
            ..SessionConfig::default()
        };
        let (session, events) = ChannelSession::new(config, connector.clone(), store.clone(), renewer);
        Harness {
            session,
            events,
            peers,
            connector,
            store,
            renewals,
        }
    }

    impl Harness {
        async fn next_peer(&mut self) -> MemoryPeer {
            tokio::time::timeout(WAIT, self.peers.recv())
                .await
                .expect("no connection attempt")
                .expect("connector dropped")
        }

        async fn next_event(&mut self) -> SessionEvent {
            tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("no session event")
                .expect("events closed")
        }

        async fn wait_for(&self, target: ConnectionState) {
            let mut rx = self.session.subscribe_state();
            tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
                .await
                .expect("state not reached")
                .unwrap();
        }

        /// Connect and complete the handshake; returns the peer and SUBSCRIBE frame.
        async fn connected(&mut self, channel: i64) -> (MemoryPeer, Frame) {
            self.session.connect(ChannelId(channel)).await.unwrap();
            let mut peer = self.next_peer().await;
            let (connect, subscribe) = handshake(&mut peer).await;
            assert_eq!(connect.command, Command::Connect);
            self.wait_for(ConnectionState::Connected).await;
            assert_eq!(
                self.next_event().await,
                SessionEvent::Subscribed {
                    channel_id: ChannelId(channel)
                }
            );
            (peer, subscribe)
        }
    }

    async fn next_frame(peer: &mut MemoryPeer) -> Frame {
        tokio::time::timeout(WAIT, peer.recv())
            .await
            .expect("no frame")
            .expect("client closed")
    }

    /// Read CONNECT, answer CONNECTED, read SUBSCRIBE.
    async fn handshake(peer: &mut MemoryPeer) -> (Frame, Frame) {
        let connect = next_frame(peer).await;
        peer.send(Frame::new(Command::Connected).header("version", "1.2"));
        let subscribe = next_frame(peer).await;
        assert_eq!(subscribe.command, Command::Subscribe);
        (connect, subscribe)
    }

    fn message_frame(subscription: &str, body: &str) -> Frame {
        Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("destination", "/sub/channel/42")
            .body(body)
    }

    #[tokio::test]
    async fn connect_without_credentials_never_opens_transport() {
        let mut h = harness(None, Renewal::NoCookie, None).await;

        let err = h.session.connect(ChannelId(42)).await.unwrap_err();
        assert!(matches!(err, Error::NoCredential), "got {err:?}");
        assert_eq!(h.connector.connects(), 0);
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(h.peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn handshake_authenticates_then_subscribes() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, None).await;
        h.session.connect(ChannelId(42)).await.unwrap();
        assert_eq!(h.session.state(), ConnectionState::Connecting);

        let mut peer = h.next_peer().await;
        let (connect, subscribe) = handshake(&mut peer).await;
        assert_eq!(connect.get("Authorization"), Some("Bearer at_1"));
        assert_eq!(connect.get("accept-version"), Some("1.2"));
        assert_eq!(connect.get("heart-beat"), Some("10000,10000"));
        assert_eq!(subscribe.get("destination"), Some("/sub/channel/42"));

        h.wait_for(ConnectionState::Connected).await;
        assert_eq!(h.session.active_channel().await, Some(ChannelId(42)));
    }

    #[tokio::test]
    async fn fresh_session_renews_before_handshake() {
        let mut h = harness(None, Renewal::Grants, None).await;
        h.session.connect(ChannelId(42)).await.unwrap();

        let mut peer = h.next_peer().await;
        let (connect, _) = handshake(&mut peer).await;
        assert_eq!(connect.get("Authorization"), Some("Bearer at_renewed"));
        assert_eq!(h.store.get().await.unwrap().expose(), "at_renewed");
        assert_eq!(h.renewals.load(Ordering::SeqCst), 1);
        h.wait_for(ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn repeated_connect_keeps_one_subscription_on_latest_channel() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, None).await;
        let (mut peer, first) = h.connected(42).await;
        let first_id = first.get("id").unwrap().to_string();

        h.session.connect(ChannelId(43)).await.unwrap();
        h.session.connect(ChannelId(44)).await.unwrap();

        let unsub = next_frame(&mut peer).await;
        assert_eq!(unsub.command, Command::Unsubscribe);
        assert_eq!(unsub.get("id"), Some(first_id.as_str()));
        let sub43 = next_frame(&mut peer).await;
        assert_eq!(sub43.get("destination"), Some("/sub/channel/43"));
        let unsub43 = next_frame(&mut peer).await;
        assert_eq!(unsub43.command, Command::Unsubscribe);
        assert_eq!(unsub43.get("id"), sub43.get("id"));
        let sub44 = next_frame(&mut peer).await;
        assert_eq!(sub44.command, Command::Subscribe);
        assert_eq!(sub44.get("destination"), Some("/sub/channel/44"));
        assert!(peer.try_recv().is_none());

        assert_eq!(h.connector.connects(), 1, "no second transport");
        assert_eq!(h.session.active_channel().await, Some(ChannelId(44)));
    }

    #[tokio::test]
    async fn connect_while_connecting_retargets_pending_channel() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, None).await;
        h.session.connect(ChannelId(42)).await.unwrap();
        h.session.connect(ChannelId(43)).await.unwrap();

        let mut peer = h.next_peer().await;
        let (_, subscribe) = handshake(&mut peer).await;
        assert_eq!(subscribe.get("destination"), Some("/sub/channel/43"));
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test]
    async fn inbound_messages_are_forwarded_in_order() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, None).await;
        let (peer, subscribe) = h.connected(42).await;
        let id = subscribe.get("id").unwrap().to_string();

        peer.send(message_frame(&id, r#"{"senderId":1,"content":"one"}"#));
        peer.send(message_frame("sub-other", r#"{"senderId":1,"content":"foreign"}"#));
        peer.send(message_frame(&id, "not json"));
        peer.send_raw("NONSENSE\n\n\0");
        peer.send(message_frame(&id, r#"{"senderId":2,"content":"two","nickname":"kim"}"#));

        for expected in ["one", "two"] {
            match h.next_event().await {
                SessionEvent::Message {
                    channel_id,
                    message,
                } => {
                    assert_eq!(channel_id, ChannelId(42));
                    assert_eq!(message.content, expected);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(h.session.state(), ConnectionState::Connected, "bad frames are not fatal");
    }

    #[tokio::test]
    async fn send_while_disconnected_writes_nothing() {
        let h = harness(Some("at_1"), Renewal::NoCookie, None).await;
        let err = h.session.send("hi").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(h.connector.connects(), 0);
    }

    #[tokio::test]
    async fn send_before_connected_frame_is_rejected() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, None).await;
        h.session.connect(ChannelId(42)).await.unwrap();
        let mut peer = h.next_peer().await;
        let connect = next_frame(&mut peer).await;
        assert_eq!(connect.command, Command::Connect);

        assert!(matches!(h.session.send("hi").await, Err(Error::NotConnected)));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn send_publishes_to_outbound_topic() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, None).await;
        let (mut peer, _) = h.connected(42).await;

        h.session.send("hi").await.unwrap();
        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.command, Command::Send);
        assert_eq!(frame.get("destination"), Some("/pub/message"));
        let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
        assert_eq!(body, serde_json::json!({"chatRoomId": 42, "content": "hi"}));
    }

    #[tokio::test]
    async fn handshake_rejection_renews_and_resubscribes_once() {
        let mut h = harness(Some("at_1"), Renewal::Grants, None).await;
        let (mut old_peer, _) = h.connected(42).await;

        old_peer.send(Frame::new(Command::Error).header("message", "Unauthorized"));
        assert!(
            tokio::time::timeout(WAIT, old_peer.recv()).await.unwrap().is_none(),
            "failed connection torn down"
        );

        let mut peer = h.next_peer().await;
        let (connect, subscribe) = handshake(&mut peer).await;
        assert_eq!(connect.get("Authorization"), Some("Bearer at_renewed"));
        assert_eq!(subscribe.get("destination"), Some("/sub/channel/42"));
        h.wait_for(ConnectionState::Connected).await;
        assert_eq!(
            h.next_event().await,
            SessionEvent::Subscribed {
                channel_id: ChannelId(42)
            }
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(peer.try_recv().is_none(), "exactly one subscription");
        assert_eq!(h.connector.connects(), 2);
        assert_eq!(h.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handshake_rejection_without_renewal_reports_auth_failure() {
        let mut h = harness(Some("at_1"), Renewal::Revoked, None).await;
        let (old_peer, _) = h.connected(42).await;

        old_peer.send(Frame::new(Command::Error).header("message", "Unauthorized"));
        assert_eq!(h.next_event().await, SessionEvent::AuthFailed);
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(!h.session.has_pending_reconnect().await);
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test]
    async fn transport_close_schedules_one_reconnect() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, Some(Duration::from_millis(50))).await;
        let (old_peer, _) = h.connected(42).await;

        old_peer.close();
        assert_eq!(h.next_event().await, SessionEvent::Disconnected);

        let mut peer = h.next_peer().await;
        let (_, subscribe) = handshake(&mut peer).await;
        assert_eq!(subscribe.get("destination"), Some("/sub/channel/42"));
        h.wait_for(ConnectionState::Connected).await;
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test]
    async fn disconnect_cancels_scheduled_reconnect() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, Some(Duration::from_millis(100))).await;
        let (old_peer, _) = h.connected(42).await;

        old_peer.close();
        assert_eq!(h.next_event().await, SessionEvent::Disconnected);
        assert!(h.session.has_pending_reconnect().await);

        h.session.disconnect().await;
        assert!(!h.session.has_pending_reconnect().await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.connector.connects(), 1, "no reconnection after disconnect");
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_during_reconnect_renewal_stops_the_attempt() {
        let mut h = harness(
            Some("at_1"),
            Renewal::Slow(Duration::from_millis(300)),
            Some(Duration::from_millis(50)),
        )
        .await;
        let (old_peer, _) = h.connected(42).await;

        // The fired reconnect has to renew before it can open a transport
        h.store.clear().await.unwrap();
        old_peer.close();
        assert_eq!(h.next_event().await, SessionEvent::Disconnected);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.renewals.load(Ordering::SeqCst), 1, "reconnect is renewing");

        h.session.disconnect().await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(h.connector.connects(), 1, "no transport after disconnect");
        assert!(h.peers.try_recv().is_err());
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_during_connect_renewal_cancels_connect() {
        let h = harness(None, Renewal::Slow(Duration::from_millis(300)), None).await;
        let session = Arc::new(h.session);

        let connecting = tokio::spawn({
            let session = session.clone();
            async move { session.connect(ChannelId(42)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.disconnect().await;

        let result = tokio::time::timeout(WAIT, connecting).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)), "got {result:?}");
        assert_eq!(h.connector.connects(), 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_unsubscribes_and_is_idempotent() {
        let mut h = harness(Some("at_1"), Renewal::NoCookie, Some(Duration::from_millis(50))).await;
        let (mut peer, subscribe) = h.connected(42).await;

        h.session.disconnect().await;
        let unsub = next_frame(&mut peer).await;
        assert_eq!(unsub.command, Command::Unsubscribe);
        assert_eq!(unsub.get("id"), subscribe.get("id"));
        assert_eq!(next_frame(&mut peer).await.command, Command::Disconnect);
        assert!(tokio::time::timeout(WAIT, peer.recv()).await.unwrap().is_none());

        h.session.disconnect().await;
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert_eq!(h.session.active_channel().await, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.connector.connects(), 1, "manual disconnect is not a close to recover from");
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_open_failure_returns_to_disconnected() {
        let h = harness(Some("at_1"), Renewal::NoCookie, None).await;
        h.connector.refuse(true);
        let err = h.session.connect(ChannelId(42)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
    }
}
