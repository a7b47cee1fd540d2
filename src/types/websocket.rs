//! WebSocket connection configuration and the events delivered to callers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::NetError;
use crate::types::config::RateLimitData;
use crate::types::headers::Headers;
use crate::types::proxy::ProxyConfig;

/// Close codes used by the connection state machine.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    /// Close frame without a status code.
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RECONNECT POLICY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` = unlimited.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    /// Whether reconnect attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

// =============================================================================
// CONNECTION CONFIG
// =============================================================================

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// `ws://` or `wss://` target.
    pub uri: String,
    /// Extra handshake headers.
    pub headers: Headers,
    /// Offered subprotocols (`Sec-WebSocket-Protocol`).
    pub protocols: Vec<String>,
    pub reconnect: ReconnectPolicy,
    /// Per-connection send limit, installed under `rate_limit_key`.
    pub rate_limit: Option<RateLimitData>,
    /// Admission key for sends; defaults to the URI host.
    pub rate_limit_key: Option<String>,
    /// Proxy for the opening handshake. The native backend tunnels through
    /// HTTP proxies with `CONNECT` only; other proxy types fail with
    /// `UnsupportedProxy`, and the bridge backend accepts none.
    pub proxy: Option<Arc<ProxyConfig>>,
    /// Keep-alive ping period for backends that send pings. `None` disables.
    pub ping_interval: Option<Duration>,
    /// Upper bound on connecting plus the opening handshake.
    pub handshake_timeout: Duration,
    /// How long `Closing` waits for the backend to confirm teardown.
    pub close_timeout: Duration,
    /// Sends held back by the limiter beyond this depth fail with `Backpressure`.
    pub send_queue_depth: usize,
}

impl WebSocketConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            headers: Headers::new(),
            protocols: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            rate_limit: None,
            rate_limit_key: None,
            proxy: None,
            ping_interval: Some(Duration::from_millis(15_000)),
            handshake_timeout: Duration::from_millis(30_000),
            close_timeout: Duration::from_millis(5_000),
            send_queue_depth: 64,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn rate_limit(mut self, limit: RateLimitData) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    pub fn proxy(mut self, proxy: Arc<ProxyConfig>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn send_queue_depth(mut self, depth: usize) -> Self {
        self.send_queue_depth = depth;
        self
    }

    /// Admission key: the explicit key, else the URI host.
    pub fn resolved_key(&self) -> Option<String> {
        match &self.rate_limit_key {
            Some(key) => Some(key.clone()),
            None => reqwest::Url::parse(&self.uri)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string)),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Outbound frame handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WsFrame {
    pub fn len(&self) -> usize {
        match self {
            WsFrame::Text(text) => text.len(),
            WsFrame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketEvent {
    Open,
    Message { payload: Vec<u8>, is_binary: bool },
    Close { code: u16, reason: String },
    Error(NetError),
}

impl WebSocketEvent {
    pub fn text(text: impl Into<String>) -> Self {
        WebSocketEvent::Message {
            payload: text.into().into_bytes(),
            is_binary: false,
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        WebSocketEvent::Message {
            payload: data.into(),
            is_binary: true,
        }
    }
}

/// An event tagged with the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketEventData {
    pub connection_id: ConnectionId,
    pub event: WebSocketEvent,
}

impl WebSocketEventData {
    /// Message payload as text, if this is a text message.
    pub fn message_text(&self) -> Option<&str> {
        match &self.event {
            WebSocketEvent::Message {
                payload,
                is_binary: false,
            } => std::str::from_utf8(payload).ok(),
            _ => None,
        }
    }
}
