//! Backend for sandboxed runtimes where the host environment owns the socket.
//!
//! `BridgeBackend` records what the state machine asks for; the host side,
//! `BridgeHost`, picks up connect requests and outbound frames and reports
//! socket activity back. Tests drive the host side directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::core::EventQueue;
use crate::error::{ClientError, NetError};
use crate::socket::backend::{BackendHandle, WebSocketBackend};
use crate::types::websocket::{ConnectionId, WebSocketConfig, WebSocketEvent, WsFrame};

/// A connect request as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSession {
    pub session: u64,
    pub connection_id: ConnectionId,
    pub uri: String,
    pub protocols: Vec<String>,
    pub headers: Vec<(String, String)>,
}

struct SessionState {
    info: BridgeSession,
    events: Arc<EventQueue<WebSocketEvent>>,
    outbound: VecDeque<WsFrame>,
    close_requested: Option<(u16, String)>,
    announced: bool,
    finished: bool,
}

#[derive(Default)]
struct Shared {
    sessions: Mutex<HashMap<u64, SessionState>>,
    next_session: AtomicU64,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, SessionState>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a host-side event unless the session already ended.
    fn report(&self, session: u64, event: WebSocketEvent, terminal: bool) -> bool {
        let mut sessions = self.sessions();
        let Some(state) = sessions.get_mut(&session) else {
            return false;
        };
        if state.finished {
            return false;
        }
        state.finished = terminal;
        state.events.push(event);
        true
    }
}

pub struct BridgeBackend {
    shared: Arc<Shared>,
}

/// Host side of a [`BridgeBackend`].
#[derive(Clone)]
pub struct BridgeHost {
    shared: Arc<Shared>,
}

impl BridgeBackend {
    pub fn new() -> (BridgeBackend, BridgeHost) {
        let shared = Arc::new(Shared::default());
        (
            BridgeBackend {
                shared: shared.clone(),
            },
            BridgeHost { shared },
        )
    }
}

impl WebSocketBackend for BridgeBackend {
    fn connect(&self, connection_id: ConnectionId, config: &WebSocketConfig) -> Result<BackendHandle, NetError> {
        if let Some(proxy) = &config.proxy {
            return Err(ClientError::UnsupportedProxy(proxy.kind.scheme()).into());
        }
        let session = self.shared.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let events = Arc::new(EventQueue::new());
        let info = BridgeSession {
            session,
            connection_id,
            uri: config.uri.clone(),
            protocols: config.protocols.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        debug!(conn_id = %connection_id, session, uri = %config.uri, "Bridge connect requested");
        self.shared.sessions().insert(
            session,
            SessionState {
                info,
                events: events.clone(),
                outbound: VecDeque::new(),
                close_requested: None,
                announced: false,
                finished: false,
            },
        );
        Ok(BackendHandle::new(session, connection_id, events))
    }

    fn send(&self, handle: &BackendHandle, frame: WsFrame) -> Result<(), NetError> {
        let mut sessions = self.shared.sessions();
        match sessions.get_mut(&handle.session) {
            Some(state) if !state.finished && state.close_requested.is_none() => {
                state.outbound.push_back(frame);
                Ok(())
            }
            _ => Err(NetError::not_connected()),
        }
    }

    fn close(&self, handle: &BackendHandle, code: u16, reason: &str) {
        if let Some(state) = self.shared.sessions().get_mut(&handle.session) {
            if state.close_requested.is_none() {
                state.close_requested = Some((code, reason.to_string()));
            }
        }
    }
}

impl BridgeHost {
    /// Connect requests not yet handed to the host.
    pub fn take_connects(&self) -> Vec<BridgeSession> {
        let mut sessions = self.shared.sessions();
        let mut fresh: Vec<BridgeSession> = sessions
            .values_mut()
            .filter(|state| !state.announced)
            .map(|state| {
                state.announced = true;
                state.info.clone()
            })
            .collect();
        fresh.sort_by_key(|info| info.session);
        fresh
    }

    /// Most recent session of a connection.
    pub fn latest_session(&self, connection_id: ConnectionId) -> Option<u64> {
        self.shared
            .sessions()
            .values()
            .filter(|state| state.info.connection_id == connection_id)
            .map(|state| state.info.session)
            .max()
    }

    pub fn session_count(&self, connection_id: ConnectionId) -> usize {
        self.shared
            .sessions()
            .values()
            .filter(|state| state.info.connection_id == connection_id)
            .count()
    }

    pub fn open(&self, session: u64) -> bool {
        self.shared.report(session, WebSocketEvent::Open, false)
    }

    pub fn text(&self, session: u64, text: &str) -> bool {
        self.shared.report(session, WebSocketEvent::text(text), false)
    }

    pub fn binary(&self, session: u64, data: &[u8]) -> bool {
        self.shared.report(session, WebSocketEvent::binary(data), false)
    }

    /// The socket closed, by either side.
    pub fn close(&self, session: u64, code: u16, reason: &str) -> bool {
        self.shared.report(
            session,
            WebSocketEvent::Close {
                code,
                reason: reason.to_string(),
            },
            true,
        )
    }

    pub fn error(&self, session: u64, err: NetError) -> bool {
        self.shared.report(session, WebSocketEvent::Error(err), true)
    }

    pub fn take_outbound(&self, session: u64) -> Vec<WsFrame> {
        self.shared
            .sessions()
            .get_mut(&session)
            .map(|state| state.outbound.drain(..).collect())
            .unwrap_or_default()
    }

    /// Close code and reason the client asked for, if it did.
    pub fn close_requested(&self, session: u64) -> Option<(u16, String)> {
        self.shared
            .sessions()
            .get(&session)
            .and_then(|state| state.close_requested.clone())
    }
}
