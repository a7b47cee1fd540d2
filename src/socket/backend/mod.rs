//! WebSocket transport seam.
//!
//! The connection state machine only talks to [`WebSocketBackend`]. Two
//! variants exist: [`NativeBackend`] drives `tokio-tungstenite` on the
//! network worker, and [`BridgeBackend`] hands the socket to a host
//! environment (a sandboxed runtime that owns the real socket) through a
//! [`BridgeHost`].
//!
//! A backend session reports `Open` once the handshake completes, then any
//! number of `Message`s, and ends with exactly one `Close` or `Error`.

pub mod bridge;
pub mod native;

use std::sync::Arc;

use crate::core::EventQueue;
use crate::error::NetError;
use crate::types::websocket::{ConnectionId, WebSocketConfig, WebSocketEvent, WsFrame};

pub use bridge::{BridgeBackend, BridgeHost, BridgeSession};
pub use native::NativeBackend;

/// One backend session: a single connection attempt and what follows it.
#[derive(Clone)]
pub struct BackendHandle {
    pub session: u64,
    pub connection_id: ConnectionId,
    events: Arc<EventQueue<WebSocketEvent>>,
}

impl BackendHandle {
    pub(crate) fn new(session: u64, connection_id: ConnectionId, events: Arc<EventQueue<WebSocketEvent>>) -> Self {
        Self {
            session,
            connection_id,
            events,
        }
    }

    pub(crate) fn events(&self) -> &Arc<EventQueue<WebSocketEvent>> {
        &self.events
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("session", &self.session)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

pub trait WebSocketBackend: Send + Sync {
    /// Start a handshake. Progress is reported through `poll`.
    fn connect(&self, connection_id: ConnectionId, config: &WebSocketConfig) -> Result<BackendHandle, NetError>;

    fn send(&self, handle: &BackendHandle, frame: WsFrame) -> Result<(), NetError>;

    /// Next event of the session, if any.
    fn poll(&self, handle: &BackendHandle) -> Option<WebSocketEvent> {
        handle.events().try_pop()
    }

    /// Begin the closing handshake. The session later reports `Close`.
    fn close(&self, handle: &BackendHandle, code: u16, reason: &str);
}
