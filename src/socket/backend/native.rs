//! WebSocket backend using `tokio-tungstenite`.
//!
//! Every session is one supervised task on the network worker with:
//! - the handshake, optionally through an HTTP CONNECT tunnel
//! - a `select!` loop over inbound frames, outbound commands and the ping timer
//! - a bounded closing handshake

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::core::{EventQueue, NetworkWorker};
use crate::error::{from_io, ClientError, NetError, TransportError, WebSocketError};
use crate::socket::backend::{BackendHandle, WebSocketBackend};
use crate::types::proxy::{ProxyConfig, ProxyType};
use crate::types::websocket::{close_code, ConnectionId, WebSocketConfig, WebSocketEvent, WsFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sessions = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Command>>>>;

const MAX_PROXY_RESPONSE: usize = 8 * 1024;

enum Command {
    Send(WsFrame),
    Close { code: u16, reason: String },
}

pub struct NativeBackend {
    worker: Arc<NetworkWorker>,
    sessions: Sessions,
    next_session: AtomicU64,
}

impl NativeBackend {
    pub fn new(worker: Arc<NetworkWorker>) -> Self {
        Self {
            worker,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(0),
        }
    }

    /// Sessions whose task is still running.
    pub fn active_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }
}

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<Command>>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WebSocketBackend for NativeBackend {
    fn connect(&self, connection_id: ConnectionId, config: &WebSocketConfig) -> Result<BackendHandle, NetError> {
        let proxy = match &config.proxy {
            None => None,
            Some(proxy) if proxy.kind == ProxyType::Http => Some(proxy.clone()),
            Some(proxy) => return Err(ClientError::UnsupportedProxy(proxy.kind.scheme()).into()),
        };
        let request = build_request(config)?;

        let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let events = Arc::new(EventQueue::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            connection_id,
            session,
            proxy,
            ping_interval: config.ping_interval,
            handshake_timeout: config.handshake_timeout,
            close_timeout: config.close_timeout,
            events: events.clone(),
            commands: rx,
            sessions: self.sessions.clone(),
        };

        lock(&self.sessions).insert(session, tx);
        let panic_events = events.clone();
        let panic_sessions = self.sessions.clone();
        let spawned = self.worker.spawn_supervised(task.run(request), move |err| {
            lock(&panic_sessions).remove(&session);
            panic_events.push(WebSocketEvent::Error(err));
        });
        if let Err(e) = spawned {
            lock(&self.sessions).remove(&session);
            return Err(e);
        }
        Ok(BackendHandle::new(session, connection_id, events))
    }

    fn send(&self, handle: &BackendHandle, frame: WsFrame) -> Result<(), NetError> {
        let sessions = lock(&self.sessions);
        let tx = sessions.get(&handle.session).ok_or_else(NetError::not_connected)?;
        tx.send(Command::Send(frame)).map_err(|_| NetError::not_connected())
    }

    fn close(&self, handle: &BackendHandle, code: u16, reason: &str) {
        if let Some(tx) = lock(&self.sessions).get(&handle.session) {
            let _ = tx.send(Command::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}

// =============================================================================
// SESSION TASK
// =============================================================================

struct SessionTask {
    connection_id: ConnectionId,
    session: u64,
    proxy: Option<Arc<ProxyConfig>>,
    ping_interval: Option<Duration>,
    handshake_timeout: Duration,
    close_timeout: Duration,
    events: Arc<EventQueue<WebSocketEvent>>,
    commands: mpsc::UnboundedReceiver<Command>,
    sessions: Sessions,
}

impl SessionTask {
    /// Drive the session and report its single terminal event.
    async fn run(mut self, request: Request) {
        let outcome = self.drive(request).await;
        lock(&self.sessions).remove(&self.session);
        match outcome {
            Ok((code, reason)) => {
                info!(conn_id = %self.connection_id, session = self.session, code, "WebSocket closed");
                self.events.push(WebSocketEvent::Close { code, reason });
            }
            Err(e) => {
                warn!(conn_id = %self.connection_id, session = self.session, error = %e, "WebSocket error");
                self.events.push(WebSocketEvent::Error(e));
            }
        }
    }

    async fn drive(&mut self, request: Request) -> Result<(u16, String), NetError> {
        info!(conn_id = %self.connection_id, session = self.session, uri = %request.uri(), "Connecting to WebSocket");

        let stream = match timeout(self.handshake_timeout, open_stream(request, self.proxy.as_deref())).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NetError::transport(
                    TransportError::TimedOut,
                    "websocket handshake timed out",
                ))
            }
        };
        self.events.push(WebSocketEvent::Open);
        let (mut write, mut read) = stream.split();

        let mut ping_timer = self.ping_interval.map(|period| {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        if let Some(timer) = ping_timer.as_mut() {
            timer.tick().await; // Skip first immediate tick
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.events.push(WebSocketEvent::text(text)),
                        Some(Ok(Message::Binary(data))) => self.events.push(WebSocketEvent::binary(data)),
                        Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = close_parts(frame);
                            info!(conn_id = %self.connection_id, code, "Server closed connection");
                            let _ = write.close().await;
                            return Ok((code, reason));
                        }
                        Some(Ok(_)) => {} // Pong and raw frames
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(NetError::websocket(
                                WebSocketError::UnexpectedClose,
                                "stream ended without a close frame",
                            ));
                        }
                    }
                }
                _ = next_ping(&mut ping_timer) => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Send(frame)) => write.send(to_message(frame)).await?,
                        Some(Command::Close { code, reason }) => {
                            return Ok(self.close_handshake(&mut write, &mut read, code, reason).await);
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok((close_code::GOING_AWAY, String::new()));
                        }
                    }
                }
            }
        }
    }

    /// Send our close frame and wait, bounded, for the peer's reply.
    async fn close_handshake(
        &self,
        write: &mut SplitSink<WsStream, Message>,
        read: &mut SplitStream<WsStream>,
        code: u16,
        reason: String,
    ) -> (u16, String) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.clone().into(),
        };
        if let Err(e) = write.send(Message::Close(Some(frame))).await {
            debug!(conn_id = %self.connection_id, error = %e, "Close frame not sent");
            return (code, reason);
        }

        let drain = async {
            while let Some(Ok(msg)) = read.next().await {
                if msg.is_close() {
                    break;
                }
            }
        };
        if timeout(self.close_timeout, drain).await.is_err() {
            warn!(conn_id = %self.connection_id, "Close handshake timed out");
        }
        (code, reason)
    }
}

async fn next_ping(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn to_message(frame: WsFrame) -> Message {
    match frame {
        WsFrame::Text(text) => Message::Text(text),
        WsFrame::Binary(data) => Message::Binary(data),
    }
}

fn close_parts(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
        None => (close_code::NO_STATUS, String::new()),
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

fn build_request(config: &WebSocketConfig) -> Result<Request, NetError> {
    let invalid = |what: &str| -> NetError { ClientError::InvalidConfiguration(format!("invalid header {what}")).into() };

    let mut request = config.uri.as_str().into_client_request()?;
    let headers = request.headers_mut();
    for (name, value) in config.headers.iter() {
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid(name))?;
        headers.append(header, value);
    }
    if !config.protocols.is_empty() {
        let offered = HeaderValue::from_str(&config.protocols.join(", ")).map_err(|_| invalid("Sec-WebSocket-Protocol"))?;
        headers.insert("Sec-WebSocket-Protocol", offered);
    }
    Ok(request)
}

async fn open_stream(request: Request, proxy: Option<&ProxyConfig>) -> Result<WsStream, NetError> {
    let Some(proxy) = proxy else {
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        return Ok(stream);
    };

    let target = target_authority(&request)?;
    let mut tcp = TcpStream::connect(proxy.authority())
        .await
        .map_err(|e| proxy_failure(&format!("connect to {}: {e}", proxy.authority())))?;
    tunnel(&mut tcp, &target, proxy).await?;
    debug!(proxy = %proxy.authority(), target = %target, "Proxy tunnel established");

    let (stream, _) = tokio_tungstenite::client_async_tls(request, tcp).await?;
    Ok(stream)
}

fn target_authority(request: &Request) -> Result<String, NetError> {
    let uri = request.uri();
    let host = uri
        .host()
        .ok_or_else(|| ClientError::InvalidConfiguration(format!("websocket uri has no host: {uri}")))?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });
    Ok(format!("{host}:{port}"))
}

/// HTTP CONNECT handshake with the proxy.
async fn tunnel(tcp: &mut TcpStream, target: &str, proxy: &ProxyConfig) -> Result<(), NetError> {
    let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(creds) = &proxy.credentials {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", creds.username, creds.password));
        head.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    head.push_str("\r\n");
    tcp.write_all(head.as_bytes()).await.map_err(|e| from_io(&e))?;

    let mut response = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        if response.len() > MAX_PROXY_RESPONSE {
            return Err(proxy_failure("oversized CONNECT response"));
        }
        let n = tcp.read(&mut chunk).await.map_err(|e| from_io(&e))?;
        if n == 0 {
            return Err(proxy_failure("proxy closed the connection during CONNECT"));
        }
        response.extend_from_slice(&chunk[..n]);
    }

    let text = String::from_utf8_lossy(&response);
    let status_line = text.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some("200") => Ok(()),
        _ => Err(proxy_failure(&format!("CONNECT rejected: {status_line}"))),
    }
}

fn proxy_failure(message: &str) -> NetError {
    NetError::transport(TransportError::ProxyFailure, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use tokio::net::TcpListener;

    fn next_event(handle: &BackendHandle) -> WebSocketEvent {
        handle
            .events()
            .pop_blocking(Duration::from_secs(5))
            .expect("no event before deadline")
    }

    fn echo_server(worker: &NetworkWorker) -> String {
        let listener = worker.handle().block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        worker.handle().spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                    break;
                }
            }
        });
        format!("ws://{addr}/echo")
    }

    #[test]
    fn test_echo_round_trip_and_close() {
        let worker = Arc::new(NetworkWorker::new(2).unwrap());
        let uri = echo_server(&worker);
        let backend = NativeBackend::new(worker.clone());

        let handle = backend.connect(ConnectionId(1), &WebSocketConfig::new(uri)).unwrap();
        assert_eq!(next_event(&handle), WebSocketEvent::Open);

        backend.send(&handle, WsFrame::Text("tick".into())).unwrap();
        assert_eq!(next_event(&handle), WebSocketEvent::text("tick"));
        backend.send(&handle, WsFrame::Binary(vec![1, 2, 3])).unwrap();
        assert_eq!(next_event(&handle), WebSocketEvent::binary(vec![1, 2, 3]));

        backend.close(&handle, close_code::NORMAL, "done");
        assert_eq!(
            next_event(&handle),
            WebSocketEvent::Close {
                code: close_code::NORMAL,
                reason: "done".to_string()
            }
        );
        assert_eq!(backend.active_sessions(), 0);
        assert!(backend.send(&handle, WsFrame::Text("late".into())).is_err());
    }

    #[test]
    fn test_refused_handshake_is_error() {
        let worker = Arc::new(NetworkWorker::new(1).unwrap());
        let listener = worker.handle().block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = NativeBackend::new(worker);
        let handle = backend
            .connect(ConnectionId(2), &WebSocketConfig::new(format!("ws://{addr}/")))
            .unwrap();
        assert!(matches!(next_event(&handle), WebSocketEvent::Error(NetError::Transport { .. })));
    }

    #[test]
    fn test_silent_server_hits_handshake_timeout() {
        let worker = Arc::new(NetworkWorker::new(1).unwrap());
        let listener = worker.handle().block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        worker.handle().spawn(async move {
            // Accept and never answer the upgrade.
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = WebSocketConfig::new(format!("ws://{addr}/"));
        config.handshake_timeout = Duration::from_millis(100);
        let backend = NativeBackend::new(worker);
        let handle = backend.connect(ConnectionId(5), &config).unwrap();
        match next_event(&handle) {
            WebSocketEvent::Error(NetError::Transport { kind, .. }) => assert_eq!(kind, TransportError::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_proxy_connect_rejected() {
        let worker = Arc::new(NetworkWorker::new(1).unwrap());
        let listener = worker.handle().block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = std_mpsc::channel();
        worker.handle().spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let n = tcp.read(&mut buf).await.unwrap();
            seen_tx.send(String::from_utf8_lossy(&buf[..n]).to_string()).unwrap();
            let _ = tcp
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let proxy = ProxyConfig::new(ProxyType::Http, "127.0.0.1", port).with_credentials("user", "pass");
        let config = WebSocketConfig::new("ws://target.test/feed").proxy(Arc::new(proxy));
        let backend = NativeBackend::new(worker);
        let handle = backend.connect(ConnectionId(3), &config).unwrap();

        match next_event(&handle) {
            WebSocketEvent::Error(NetError::Transport { kind, message }) => {
                assert_eq!(kind, TransportError::ProxyFailure);
                assert!(message.contains("407"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let seen = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(seen.starts_with("CONNECT target.test:80 HTTP/1.1\r\n"));
        assert!(seen.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn test_socks_proxy_unsupported() {
        let worker = Arc::new(NetworkWorker::new(1).unwrap());
        let backend = NativeBackend::new(worker);
        let config = WebSocketConfig::new("wss://feed.test/")
            .proxy(Arc::new(ProxyConfig::new(ProxyType::Socks5, "127.0.0.1", 1080)));
        let err = backend.connect(ConnectionId(4), &config).unwrap_err();
        assert_eq!(err, NetError::Client(ClientError::UnsupportedProxy("socks5")));
    }

    #[test]
    fn test_request_carries_headers_and_protocols() {
        let config = WebSocketConfig::new("wss://feed.test/ws")
            .header("X-Api-Key", "abc")
            .protocol("graphql-ws")
            .protocol("v2");
        let request = build_request(&config).unwrap();
        assert_eq!(request.headers()["x-api-key"], "abc");
        assert_eq!(request.headers()["sec-websocket-protocol"], "graphql-ws, v2");
        assert_eq!(target_authority(&request).unwrap(), "feed.test:443");
    }
}
