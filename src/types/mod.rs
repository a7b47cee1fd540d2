pub mod config;
pub mod cookie;
pub mod headers;
pub mod proxy;
pub mod request;
pub mod websocket;

pub use config::{EngineConfig, RateLimitData};
pub use cookie::CookieJar;
pub use headers::Headers;
pub use proxy::{ProxyConfig, ProxyType};
pub use request::{RequestDescriptor, RequestId, ResponseRecord, RetryPolicy};
pub use websocket::{
    ConnectionId, ConnectionState, ReconnectPolicy, WebSocketConfig, WebSocketEvent,
    WebSocketEventData, WsFrame,
};
