//! Realtime chat channel over STOMP
//!
//! Maintains one authenticated persistent connection, one subscription at a
//! time, and routes inbound messages to a single consumer. Authentication
//! failures on the handshake go through `chat_auth::TokenRenewer` before a
//! single scheduled reconnect.
//!
//! Session lifecycle:
//! 1. `ChannelSession::connect()` resolves a credential, opens a transport, sends CONNECT
//! 2. CONNECTED frame → state CONNECTED, SUBSCRIBE to the channel topic
//! 3. MESSAGE frames → `SessionEvent::Message` in arrival order
//! 4. ERROR frame → renew; success schedules one reconnect, failure emits `AuthFailed`
//! 5. Transport close → `Disconnected` event, optional single reconnect
//! 6. `disconnect()` cancels any scheduled reconnect and closes cleanly

pub mod error;
pub mod message;
pub mod reconnect;
pub mod session;
pub mod stomp;
pub mod transport;

pub use error::{Error, Result};
pub use message::{ChannelId, ConnectionState, Message, SessionEvent};
pub use reconnect::{ReconnectHandle, ReconnectPolicy, ReconnectReason};
pub use session::{ChannelSession, SessionConfig};
pub use stomp::{Command, Frame};
pub use transport::{Connection, Connector, MemoryConnector, MemoryPeer, TransportEvent, WsConnector};
