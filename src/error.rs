//! Unified error taxonomy.
//!
//! Every failure that reaches a caller is a [`NetError`] carrying a stable
//! `(category, code)` pair, so caller code can branch on
//! [`NetError::category`] without inspecting message text. Backend-specific
//! errors (`reqwest`, `tungstenite`) are translated here, at the worker
//! boundary, and never leak into manager logic.

use std::fmt;

// =============================================================================
// CATEGORIES
// =============================================================================

/// Top-level error category, stable across the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Http,
    WebSocket,
    Client,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Http => "http",
            ErrorCategory::WebSocket => "websocket",
            ErrorCategory::Client => "client",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection-level failures raised by a transport backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused")]
    ConnectionRefused = 1,
    #[error("DNS resolution failed")]
    DnsFailure = 2,
    #[error("TLS handshake failed")]
    TlsFailure = 3,
    #[error("connection reset")]
    ConnectionReset = 4,
    #[error("operation timed out")]
    TimedOut = 5,
    #[error("proxy negotiation failed")]
    ProxyFailure = 6,
    #[error("I/O error")]
    Io = 7,
    #[error("transport failure")]
    Other = 99,
}

/// Protocol-level WebSocket failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum WebSocketError {
    #[error("failed to establish WebSocket connection")]
    ConnectionFailed = 1,
    #[error("WebSocket connection was closed unexpectedly")]
    UnexpectedClose = 2,
    #[error("WebSocket protocol violation")]
    ProtocolViolation = 3,
    #[error("unsupported WebSocket data type")]
    UnsupportedDataType = 4,
    #[error("invalid WebSocket close code")]
    InvalidCloseCode = 5,
    #[error("WebSocket compression error")]
    CompressionError = 6,
}

/// Failures originating in the client itself rather than the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("operation was cancelled")]
    Cancelled,
    #[error("operation did not finish within the grace period")]
    Timeout,
    #[error("client is not initialized")]
    NotInitialized,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("rate-limit key is missing")]
    RateLimitKeyMissing,
    #[error("not connected")]
    NotConnected,
    #[error("send queue is full ({depth} pending)")]
    Backpressure { depth: usize },
    #[error("network worker failed: {0}")]
    FatalWorker(String),
    #[error("proxy type {0} is not supported by this backend")]
    UnsupportedProxy(&'static str),
    #[error("manager is shutting down")]
    ShuttingDown,
    #[error("unknown id {0}")]
    UnknownId(u64),
}

impl ClientError {
    pub fn code(&self) -> u32 {
        match self {
            ClientError::Cancelled => 1,
            ClientError::Timeout => 2,
            ClientError::NotInitialized => 3,
            ClientError::InvalidConfiguration(_) => 4,
            ClientError::MalformedRequest(_) => 5,
            ClientError::RateLimitKeyMissing => 6,
            ClientError::NotConnected => 7,
            ClientError::Backpressure { .. } => 8,
            ClientError::FatalWorker(_) => 9,
            ClientError::UnsupportedProxy(_) => 10,
            ClientError::ShuttingDown => 11,
            ClientError::UnknownId(_) => 12,
        }
    }
}

// =============================================================================
// NET ERROR
// =============================================================================

/// The single error type surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("{kind}: {message}")]
    Transport {
        kind: TransportError,
        message: String,
    },
    #[error("HTTP {status} {}", http_reason(*status))]
    Http { status: u16 },
    #[error("{kind}: {message}")]
    WebSocket {
        kind: WebSocketError,
        message: String,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl NetError {
    pub fn transport(kind: TransportError, message: impl Into<String>) -> Self {
        NetError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn websocket(kind: WebSocketError, message: impl Into<String>) -> Self {
        NetError::WebSocket {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        NetError::Client(ClientError::Cancelled)
    }

    pub fn timeout() -> Self {
        NetError::Client(ClientError::Timeout)
    }

    pub fn not_connected() -> Self {
        NetError::Client(ClientError::NotConnected)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            NetError::Transport { .. } => ErrorCategory::Transport,
            NetError::Http { .. } => ErrorCategory::Http,
            NetError::WebSocket { .. } => ErrorCategory::WebSocket,
            NetError::Client(_) => ErrorCategory::Client,
        }
    }

    /// Numeric code, unique within the category.
    pub fn code(&self) -> u32 {
        match self {
            NetError::Transport { kind, .. } => *kind as u32,
            NetError::Http { status } => u32::from(*status),
            NetError::WebSocket { kind, .. } => *kind as u32,
            NetError::Client(e) => e.code(),
        }
    }

    /// Whether the HTTP manager may retry the attempt that produced this error.
    ///
    /// Transport failures are retryable; HTTP 408, 429 and 5xx are retryable;
    /// everything in the client category is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::Transport { .. } => true,
            NetError::Http { status } => is_retryable_status(*status),
            NetError::WebSocket { .. } => false,
            NetError::Client(_) => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

fn http_reason(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

// =============================================================================
// BACKEND TRANSLATION
// =============================================================================

fn io_kind_to_transport(kind: std::io::ErrorKind) -> TransportError {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            TransportError::ConnectionReset
        }
        ErrorKind::TimedOut => TransportError::TimedOut,
        _ => TransportError::Io,
    }
}

pub(crate) fn from_io(err: &std::io::Error) -> NetError {
    NetError::transport(io_kind_to_transport(err.kind()), err.to_string())
}

/// Classify an error chain by its innermost I/O cause or by well-known
/// resolver/TLS wording.
fn classify_chain(err: &(dyn std::error::Error + 'static)) -> TransportError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return io_kind_to_transport(io.kind());
        }
        source = e.source();
    }
    let text = format!("{err:?}").to_ascii_lowercase();
    if text.contains("dns error") || text.contains("failed to lookup") {
        TransportError::DnsFailure
    } else if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
        TransportError::TlsFailure
    } else if text.contains("proxy") || text.contains("socks") {
        TransportError::ProxyFailure
    } else {
        TransportError::Other
    }
}

impl From<reqwest::Error> for NetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return ClientError::MalformedRequest(err.to_string()).into();
        }
        let kind = if err.is_timeout() {
            TransportError::TimedOut
        } else {
            classify_chain(&err)
        };
        NetError::transport(kind, err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Io(ref io) => from_io(io),
            WsError::Tls(ref tls) => NetError::transport(TransportError::TlsFailure, tls.to_string()),
            WsError::Http(ref response) => NetError::websocket(
                WebSocketError::ConnectionFailed,
                format!("handshake rejected with HTTP {}", response.status()),
            ),
            WsError::Url(ref url) => ClientError::InvalidConfiguration(url.to_string()).into(),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                NetError::websocket(WebSocketError::UnexpectedClose, err.to_string())
            }
            WsError::Utf8 => NetError::websocket(WebSocketError::UnsupportedDataType, err.to_string()),
            _ => NetError::websocket(WebSocketError::ProtocolViolation, err.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_and_code() {
        let e = NetError::transport(TransportError::ConnectionReset, "peer reset");
        assert_eq!(e.category(), ErrorCategory::Transport);
        assert_eq!(e.code(), 4);

        let e = NetError::Http { status: 404 };
        assert_eq!(e.category(), ErrorCategory::Http);
        assert_eq!(e.code(), 404);
        assert_eq!(e.to_string(), "HTTP 404 Not Found");

        let e: NetError = ClientError::Backpressure { depth: 3 }.into();
        assert_eq!(e.category(), ErrorCategory::Client);
        assert_eq!(e.code(), 8);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(NetError::transport(TransportError::TimedOut, "slow").is_retryable());
        assert!(NetError::Http { status: 429 }.is_retryable());
        assert!(NetError::Http { status: 503 }.is_retryable());
        assert!(NetError::Http { status: 408 }.is_retryable());
        assert!(!NetError::Http { status: 404 }.is_retryable());
        assert!(!NetError::cancelled().is_retryable());
        assert!(!NetError::from(ClientError::RateLimitKeyMissing).is_retryable());
    }

    #[test]
    fn test_io_translation() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        match from_io(&io) {
            NetError::Transport { kind, .. } => assert_eq!(kind, TransportError::ConnectionRefused),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tungstenite_closed_is_unexpected_close() {
        let e = NetError::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert_eq!(e.category(), ErrorCategory::WebSocket);
        assert_eq!(e.code(), WebSocketError::UnexpectedClose as u32);
    }
}
