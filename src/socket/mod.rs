pub mod backend;
pub mod connection;
pub mod manager;

pub use backend::{BackendHandle, BridgeBackend, BridgeHost, BridgeSession, NativeBackend, WebSocketBackend};
pub use connection::{SendCallback, SendReceipt, WebSocketConnection};
pub use manager::{WebSocketCallback, WebSocketManager, WebSocketOptions, WebSocketSender};
