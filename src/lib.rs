//! # net-engine: rate-limited HTTP and WebSocket client engine
//!
//! Callers submit HTTP requests and WebSocket connections; the I/O runs on a
//! small background worker and results come back only when the caller ticks
//! a manager:
//!
//! - **HTTP** via `reqwest`: per-key admission, retry with backoff and
//!   `Retry-After`, cancellation, batches, cookies
//! - **WebSocket** via `tokio-tungstenite` (or a host-driven bridge):
//!   connection state machine with reconnect backoff and paced sends
//! - **Multi-threaded async runtime** via `tokio`
//!
//! ## Architecture
//!
//! ```text
//! caller ──submit──▶ [Manager] ──admission──▶ [RateLimiter]
//!                        │
//!                        ▼ spawn
//!                  [NetworkWorker] ──▶ HttpBackend / WebSocketBackend
//!                        │
//!                        ▼ push
//!                   [EventQueue] ──tick()──▶ caller callbacks
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use net_engine::{runtime, EngineConfig, HttpRequestManager, RequestDescriptor, TaskManager};
//! use std::time::Duration;
//!
//! let config = EngineConfig::default();
//! runtime::init(&config)?;
//!
//! let mut http = HttpRequestManager::from_config(&config)?;
//! http.submit_with(RequestDescriptor::get("https://api.example.com/v1/time"), |result| {
//!     println!("{:?}", result.map(|r| r.status));
//! })?;
//! while http.is_loaded() {
//!     http.tick_timeout(Duration::from_millis(50))?;
//! }
//!
//! http.shutdown(config.shutdown_grace());
//! runtime::teardown();
//! # Ok::<(), net_engine::NetError>(())
//! ```

pub mod core;
pub mod error;
pub mod http;
pub mod runtime;
pub mod socket;
pub mod types;

pub use crate::core::{RateLimiter, TaskManager};
pub use error::{ClientError, ErrorCategory, NetError, TransportError, WebSocketError};
pub use http::{HttpRequestManager, ReqwestBackend};
pub use socket::{BridgeBackend, NativeBackend, WebSocketManager, WebSocketSender};
pub use types::{
    ConnectionId, ConnectionState, EngineConfig, Headers, ProxyConfig, RequestDescriptor, RequestId,
    ResponseRecord, WebSocketConfig, WebSocketEvent, WebSocketEventData,
};
