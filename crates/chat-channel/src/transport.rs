//! Persistent-connection transports
//!
//! The session never touches a socket directly. A `Connector` opens a
//! `Connection`: an outbound frame sender plus an inbound event receiver fed
//! by a bridge task. Dropping the outbound sender closes the transport.
//!
//! Two connectors exist: `WsConnector` speaks STOMP over a WebSocket, and
//! `MemoryConnector` hands the server side of each connection to the caller,
//! which makes it a scriptable broker for tests and offline runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::stomp::{Command, Frame};

/// What the bridge task reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// Inbound text that did not parse as a frame
    Malformed(String),
    /// Transport ended; optional reason from the peer or the error
    Closed(Option<String>),
}

/// An open transport.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports for a `ChannelSession`.
///
/// Uses `Pin<Box<dyn Future>>` so the session can hold an `Arc<dyn Connector>`.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + 'a>>;
}

/// STOMP over WebSocket.
pub struct WsConnector {
    url: Url,
    /// Outgoing heart-beat period; `None` disables
    heartbeat: Option<Duration>,
}

impl WsConnector {
    pub fn new(url: Url, heartbeat: Option<Duration>) -> Self {
        Self { url, heartbeat }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + 'a>> {
        Box::pin(async move {
            let (ws, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| Error::Transport(format!("connecting to {}: {e}", self.url)))?;
            info!(url = %self.url, "websocket connected");

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            tokio::spawn(bridge(ws, out_rx, in_tx, self.heartbeat));
            Ok(Connection {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

/// Server silence beyond this many negotiated periods closes the transport.
const HEARTBEAT_TOLERANCE: u32 = 2;

/// Period the server committed to sending at, from the CONNECTED `heart-beat`
/// header and the period we advertised. `None` when either side sends 0.
fn incoming_heartbeat(connected: &Frame, ours: Option<Duration>) -> Option<Duration> {
    let ours = ours.filter(|d| !d.is_zero())?;
    let (server_sends, _) = connected.get("heart-beat")?.split_once(',')?;
    let server_sends: u64 = server_sends.trim().parse().ok()?;
    if server_sends == 0 {
        return None;
    }
    Some(ours.max(Duration::from_millis(server_sends)))
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Pump frames between the socket and the session until either side ends.
async fn bridge(
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    in_tx: mpsc::UnboundedSender<TransportEvent>,
    heartbeat: Option<Duration>,
) {
    let (mut write, mut read) = ws.split();
    let mut ticker = tokio::time::interval(heartbeat.unwrap_or(Duration::from_secs(3600)));
    // First tick fires immediately
    ticker.tick().await;

    // Armed by the CONNECTED frame
    let mut incoming: Option<Duration> = None;
    let mut last_inbound = Instant::now();

    loop {
        let deadline = incoming.map(|period| last_inbound + period * HEARTBEAT_TOLERANCE);
        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    debug!(command = %frame.command, "frame out");
                    if let Err(e) = write.send(WsMessage::text(frame.encode())).await {
                        warn!(error = %e, "websocket write failed");
                        let _ = in_tx.send(TransportEvent::Closed(Some(e.to_string())));
                        return;
                    }
                    if frame.command == Command::Disconnect {
                        debug!("disconnect sent");
                    }
                }
                None => {
                    // Session dropped its sender: close politely
                    let _ = write.close().await;
                    debug!("websocket closed by session");
                    return;
                }
            },
            _ = ticker.tick(), if heartbeat.is_some() => {
                if let Err(e) = write.send(WsMessage::text("\n")).await {
                    warn!(error = %e, "heart-beat write failed");
                    let _ = in_tx.send(TransportEvent::Closed(Some(e.to_string())));
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!(period = ?incoming, "no heart-beat from server, closing");
                let _ = in_tx.send(TransportEvent::Closed(Some("server heart-beat missed".into())));
                return;
            }
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    last_inbound = Instant::now();
                    let event = match Frame::decode(text.as_str()) {
                        Ok(Some(frame)) => {
                            debug!(command = %frame.command, "frame in");
                            if frame.command == Command::Connected {
                                incoming = incoming_heartbeat(&frame, heartbeat);
                                debug!(period = ?incoming, "server heart-beat negotiated");
                            }
                            TransportEvent::Frame(frame)
                        }
                        Ok(None) => continue,
                        Err(e) => TransportEvent::Malformed(e.to_string()),
                    };
                    if in_tx.send(event).is_err() {
                        return;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.as_str().to_string());
                    info!(reason = ?reason, "websocket closed by server");
                    let _ = in_tx.send(TransportEvent::Closed(reason));
                    return;
                }
                Some(Ok(_)) => {
                    // Ping/pong handled by tungstenite; binary unused
                    last_inbound = Instant::now();
                }
                Some(Err(e)) => {
                    warn!(error = %e, "websocket error");
                    let _ = in_tx.send(TransportEvent::Closed(Some(e.to_string())));
                    return;
                }
                None => {
                    let _ = in_tx.send(TransportEvent::Closed(None));
                    return;
                }
            }
        }
    }
}

/// Server side of one in-memory connection.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Next frame written by the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Frame already written, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.from_client.try_recv().ok()
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.to_client.send(TransportEvent::Frame(frame));
    }

    /// Deliver raw text as if it arrived on the wire.
    pub fn send_raw(&self, text: &str) {
        let event = match Frame::decode(text) {
            Ok(Some(frame)) => TransportEvent::Frame(frame),
            Ok(None) => return,
            Err(e) => TransportEvent::Malformed(e.to_string()),
        };
        let _ = self.to_client.send(event);
    }

    pub fn close(&self) {
        let _ = self.to_client.send(TransportEvent::Closed(None));
    }
}

/// Connector whose peers are handed to the caller.
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                connects: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Connection attempts so far, refused ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make later attempts fail with a transport error.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + 'a>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::Transport("connection refused".into()));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.peers
                .send(MemoryPeer {
                    from_client: out_rx,
                    to_client: in_tx,
                })
                .map_err(|_| Error::Transport("memory broker gone".into()))?;
            Ok(Connection {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_connection_carries_frames_both_ways() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut conn = connector.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        conn.outbound.send(Frame::disconnect()).unwrap();
        assert_eq!(peer.recv().await.unwrap().command, Command::Disconnect);

        peer.send_raw("CONNECTED\nversion:1.2\n\n\0");
        peer.send_raw("\n");
        peer.send_raw("garbage");
        match conn.inbound.recv().await.unwrap() {
            TransportEvent::Frame(f) => assert_eq!(f.command, Command::Connected),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            conn.inbound.recv().await.unwrap(),
            TransportEvent::Malformed(_)
        ));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn dropping_outbound_closes_peer_side() {
        let (connector, mut peers) = MemoryConnector::new();
        let conn = connector.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        drop(conn);
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn refused_connects_are_counted() {
        let (connector, _peers) = MemoryConnector::new();
        connector.refuse(true);
        assert!(matches!(
            connector.connect().await,
            Err(Error::Transport(_))
        ));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn ws_connector_fails_fast_on_closed_port() {
        let connector = WsConnector::new(Url::parse("ws://127.0.0.1:9/ws").unwrap(), None);
        assert!(matches!(
            connector.connect().await,
            Err(Error::Transport(_))
        ));
    }

    /// WebSocket server that answers CONNECT with `connected`, then sends a
    /// heart-beat every `beat` (or stays silent) while draining client frames.
    async fn start_ws_server(connected: &'static str, beat: Option<Duration>) -> Url {
        use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
        use axum::routing::get;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| async move {
                ws.on_upgrade(move |mut socket| async move {
                    if let Some(Ok(AxumMessage::Text(text))) = socket.recv().await {
                        assert!(text.as_str().starts_with("CONNECT\n"));
                        let _ = socket.send(AxumMessage::Text(connected.into())).await;
                    }
                    let mut ticker = tokio::time::interval(beat.unwrap_or(Duration::from_secs(3600)));
                    loop {
                        tokio::select! {
                            _ = ticker.tick(), if beat.is_some() => {
                                if socket.send(AxumMessage::Text("\n".into())).await.is_err() {
                                    return;
                                }
                            }
                            msg = socket.recv() => {
                                if msg.is_none() {
                                    return;
                                }
                            }
                        }
                    }
                })
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("ws://{addr}/ws")).unwrap()
    }

    async fn open_and_handshake(url: Url, heartbeat: Duration) -> Connection {
        let connector = WsConnector::new(url, Some(heartbeat));
        let mut conn = connector.connect().await.unwrap();
        conn.outbound
            .send(Frame::connect("localhost", heartbeat.as_millis() as u64, "Bearer at"))
            .unwrap();
        match conn.inbound.recv().await.unwrap() {
            TransportEvent::Frame(f) => assert_eq!(f.command, Command::Connected),
            other => panic!("unexpected {other:?}"),
        }
        conn
    }

    #[test]
    fn incoming_heartbeat_takes_the_slower_side() {
        let ours = Some(Duration::from_millis(100));
        let connected = |hb: &str| Frame::new(Command::Connected).header("heart-beat", hb);
        assert_eq!(
            incoming_heartbeat(&connected("250,0"), ours),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            incoming_heartbeat(&connected("50,50"), ours),
            Some(Duration::from_millis(100))
        );
        assert_eq!(incoming_heartbeat(&connected("0,0"), ours), None);
        assert_eq!(incoming_heartbeat(&connected("250,250"), None), None);
        assert_eq!(incoming_heartbeat(&Frame::new(Command::Connected), ours), None);
        assert_eq!(incoming_heartbeat(&connected("soon"), ours), None);
    }

    #[tokio::test]
    async fn ws_connector_speaks_stomp_text_frames() {
        let url = start_ws_server("CONNECTED\nversion:1.2\n\n\0", None).await;
        let mut conn = open_and_handshake(url, Duration::from_millis(50)).await;

        // No heart-beat negotiated: silence is not a failure
        assert!(
            tokio::time::timeout(Duration::from_millis(300), conn.inbound.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn silent_server_is_treated_as_closed() {
        let url = start_ws_server("CONNECTED\nversion:1.2\nheart-beat:100,100\n\n\0", None).await;
        let mut conn = open_and_handshake(url, Duration::from_millis(100)).await;

        let event = tokio::time::timeout(Duration::from_secs(2), conn.inbound.recv())
            .await
            .expect("dead server not detected")
            .unwrap();
        match event {
            TransportEvent::Closed(Some(reason)) => assert!(reason.contains("heart-beat")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn beating_server_keeps_transport_open() {
        let url = start_ws_server(
            "CONNECTED\nversion:1.2\nheart-beat:100,100\n\n\0",
            Some(Duration::from_millis(50)),
        )
        .await;
        let mut conn = open_and_handshake(url, Duration::from_millis(100)).await;

        assert!(
            tokio::time::timeout(Duration::from_millis(600), conn.inbound.recv())
                .await
                .is_err(),
            "heart-beats are not surfaced and keep the watchdog fed"
        );
    }
}
