//! WebSocket connection manager.
//!
//! Owns every [`WebSocketConnection`], advances them on `tick()` and hands
//! each event to its connection's callback along with a [`WebSocketSender`].
//! Callbacks run on the thread calling `tick()` and may reply, close, or
//! inspect state through the sender; the sender holds only a weak reference
//! so it never keeps a removed connection alive.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::{EventQueue, NetworkWorker, RateLimiter, TaskManager};
use crate::error::{ClientError, NetError};
use crate::runtime;
use crate::socket::backend::{NativeBackend, WebSocketBackend};
use crate::socket::connection::{SendCallback, WebSocketConnection};
use crate::types::config::EngineConfig;
use crate::types::headers::Headers;
use crate::types::proxy::ProxyConfig;
use crate::types::websocket::{
    close_code, ConnectionId, ConnectionState, ReconnectPolicy, WebSocketConfig, WebSocketEventData, WsFrame,
};

pub type WebSocketCallback = Box<dyn FnMut(&WebSocketEventData, &WebSocketSender) + Send>;

/// How often `tick_timeout` and `shutdown` re-check backend sessions.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// =============================================================================
// OPTIONS
// =============================================================================

/// Manager-wide defaults for new connections.
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    pub default_headers: Headers,
    pub default_proxy: Option<Arc<ProxyConfig>>,
    pub reconnect: ReconnectPolicy,
    pub ping_interval: Option<Duration>,
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
    pub send_queue_depth: usize,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        let base = WebSocketConfig::new("");
        Self {
            default_headers: Headers::new(),
            default_proxy: None,
            reconnect: base.reconnect,
            ping_interval: base.ping_interval,
            handshake_timeout: base.handshake_timeout,
            close_timeout: base.close_timeout,
            send_queue_depth: base.send_queue_depth,
        }
    }
}

impl WebSocketOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        let ping = config.ping_interval();
        Self {
            default_headers: config.default_headers(),
            default_proxy: config.proxy.clone().map(Arc::new),
            reconnect: config.reconnect_policy(),
            ping_interval: (!ping.is_zero()).then_some(ping),
            handshake_timeout: config.handshake_timeout(),
            close_timeout: config.close_timeout(),
            send_queue_depth: config.send_queue_depth(),
        }
    }

    /// Connection config for `uri` seeded with these defaults.
    pub fn config(&self, uri: impl Into<String>) -> WebSocketConfig {
        let mut config = WebSocketConfig::new(uri);
        config.headers = self.default_headers.clone();
        config.proxy = self.default_proxy.clone();
        config.reconnect = self.reconnect.clone();
        config.ping_interval = self.ping_interval;
        config.handshake_timeout = self.handshake_timeout;
        config.close_timeout = self.close_timeout;
        config.send_queue_depth = self.send_queue_depth;
        config
    }
}

// =============================================================================
// SENDER
// =============================================================================

/// Handle passed to callbacks for replying on their connection.
#[derive(Clone)]
pub struct WebSocketSender {
    id: ConnectionId,
    connection: Weak<Mutex<WebSocketConnection>>,
    limiter: Arc<RateLimiter>,
}

impl WebSocketSender {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state; `Closed` once the connection has been removed.
    pub fn state(&self) -> ConnectionState {
        self.with_connection(|conn| conn.state())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn send(&self, frame: WsFrame) -> Result<(), NetError> {
        let limiter = self.limiter.clone();
        self.with_connection(|conn| conn.queue_send(frame, &limiter, Instant::now()))?
    }

    /// Send admitted under `rate_limit_key` (the connection's key when
    /// `None`). `on_sent` runs inside a later `tick()` with the outcome.
    pub fn send_with<F>(&self, frame: WsFrame, rate_limit_key: Option<&str>, on_sent: F) -> Result<(), NetError>
    where
        F: FnOnce(Result<(), NetError>) + Send + 'static,
    {
        let limiter = self.limiter.clone();
        self.with_connection(|conn| {
            conn.queue_send_with(frame, rate_limit_key, Some(Box::new(on_sent)), &limiter, Instant::now())
        })?
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), NetError> {
        self.send(WsFrame::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), NetError> {
        self.send(WsFrame::Binary(data.into()))
    }

    pub fn close(&self, code: u16, reason: &str) -> Result<(), NetError> {
        self.with_connection(|conn| conn.disconnect(code, reason, Instant::now()))
    }

    pub fn disconnect(&self) -> Result<(), NetError> {
        self.close(close_code::NORMAL, "")
    }

    fn with_connection<R>(&self, f: impl FnOnce(&mut WebSocketConnection) -> R) -> Result<R, NetError> {
        let connection = self.connection.upgrade().ok_or_else(NetError::not_connected)?;
        let mut guard = lock(&connection);
        Ok(f(&mut guard))
    }
}

fn lock(connection: &Mutex<WebSocketConnection>) -> MutexGuard<'_, WebSocketConnection> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MANAGER
// =============================================================================

struct Entry {
    connection: Arc<Mutex<WebSocketConnection>>,
    callback: WebSocketCallback,
    sender: WebSocketSender,
    /// Limiter key installed for this connection alone.
    own_limit: Option<String>,
    /// Dropped once its connection has settled and its events are delivered.
    removing: bool,
}

pub struct WebSocketManager {
    backend: Arc<dyn WebSocketBackend>,
    limiter: Arc<RateLimiter>,
    options: WebSocketOptions,
    worker: Option<Arc<NetworkWorker>>,
    events: Arc<EventQueue<WebSocketEventData>>,
    entries: BTreeMap<ConnectionId, Entry>,
    next_id: u64,
    shutting_down: bool,
}

impl WebSocketManager {
    pub fn new(backend: Arc<dyn WebSocketBackend>, limiter: Arc<RateLimiter>, options: WebSocketOptions) -> Self {
        Self {
            backend,
            limiter,
            options,
            worker: None,
            events: Arc::new(EventQueue::new()),
            entries: BTreeMap::new(),
            next_id: 1,
            shutting_down: false,
        }
    }

    /// Report `FatalWorker` from `tick` once `worker` has failed.
    pub fn with_worker(mut self, worker: Arc<NetworkWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Manager on the process-wide worker and limiter set up by
    /// [`runtime::init`], using the native backend.
    pub fn from_config(config: &EngineConfig) -> Result<Self, NetError> {
        let worker = runtime::shared_worker()?;
        let backend = Arc::new(NativeBackend::new(worker.clone()));
        Ok(Self::new(backend, runtime::shared_limiter()?, WebSocketOptions::from_config(config)).with_worker(worker))
    }

    pub fn options(&self) -> &WebSocketOptions {
        &self.options
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.entries.get(&id).map(|entry| lock(&entry.connection).state())
    }

    pub fn sender(&self, id: ConnectionId) -> Option<WebSocketSender> {
        self.entries.get(&id).map(|entry| entry.sender.clone())
    }

    pub fn submit_with<F>(&mut self, config: WebSocketConfig, callback: F) -> Result<ConnectionId, NetError>
    where
        F: FnMut(&WebSocketEventData, &WebSocketSender) + Send + 'static,
    {
        self.submit_at(config, Box::new(callback), Instant::now())
    }

    pub fn submit_at(
        &mut self,
        mut config: WebSocketConfig,
        callback: WebSocketCallback,
        now: Instant,
    ) -> Result<ConnectionId, NetError> {
        if self.shutting_down {
            return Err(ClientError::ShuttingDown.into());
        }
        if let Some(err) = self.worker.as_ref().and_then(|w| w.failure()) {
            return Err(err);
        }
        config.headers.merge_defaults(&self.options.default_headers);
        if config.proxy.is_none() {
            config.proxy = self.options.default_proxy.clone();
        }
        let key = validate(&config)?;

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        // A per-connection limit gets its own key so it never replaces a
        // limit other connections or HTTP traffic share.
        let own_limit = config.rate_limit.map(|limit| {
            let scoped = format!("{key}#ws{}", id.0);
            self.limiter.set_limit(&scoped, limit);
            scoped
        });
        let key = own_limit.clone().unwrap_or(key);
        info!(conn_id = %id, uri = %config.uri, key = %key, "Opening WebSocket connection");

        let mut connection = WebSocketConnection::new(id, config, key, self.backend.clone(), self.events.clone());
        if let Err(e) = connection.connect(now) {
            if let Some(scoped) = &own_limit {
                self.limiter.remove_limit(scoped);
            }
            return Err(e);
        }
        let connection = Arc::new(Mutex::new(connection));
        let sender = WebSocketSender {
            id,
            connection: Arc::downgrade(&connection),
            limiter: self.limiter.clone(),
        };
        self.entries.insert(
            id,
            Entry {
                connection,
                callback,
                sender,
                own_limit,
                removing: false,
            },
        );
        Ok(id)
    }

    pub fn send(&self, id: ConnectionId, frame: WsFrame) -> Result<(), NetError> {
        self.send_at(id, frame, Instant::now())
    }

    pub fn send_at(&self, id: ConnectionId, frame: WsFrame, now: Instant) -> Result<(), NetError> {
        let entry = self.entries.get(&id).ok_or(ClientError::UnknownId(id.0))?;
        lock(&entry.connection).queue_send(frame, &self.limiter, now)
    }

    /// See [`WebSocketSender::send_with`].
    pub fn send_with<F>(
        &self,
        id: ConnectionId,
        frame: WsFrame,
        rate_limit_key: Option<&str>,
        on_sent: F,
    ) -> Result<(), NetError>
    where
        F: FnOnce(Result<(), NetError>) + Send + 'static,
    {
        self.send_with_at(id, frame, rate_limit_key, Box::new(on_sent), Instant::now())
    }

    pub fn send_with_at(
        &self,
        id: ConnectionId,
        frame: WsFrame,
        rate_limit_key: Option<&str>,
        on_sent: SendCallback,
        now: Instant,
    ) -> Result<(), NetError> {
        let entry = self.entries.get(&id).ok_or(ClientError::UnknownId(id.0))?;
        lock(&entry.connection).queue_send_with(frame, rate_limit_key, Some(on_sent), &self.limiter, now)
    }

    /// Caller-initiated close with `code` and `reason`.
    pub fn close(&mut self, id: ConnectionId, code: u16, reason: &str) -> Result<(), NetError> {
        let entry = self.entries.get(&id).ok_or(ClientError::UnknownId(id.0))?;
        lock(&entry.connection).disconnect(code, reason, Instant::now());
        Ok(())
    }

    pub fn disconnect(&mut self, id: ConnectionId) -> Result<(), NetError> {
        self.close(id, close_code::NORMAL, "")
    }

    /// Tear the connection down and forget it after its last events are
    /// delivered by the next `tick`.
    pub fn remove(&mut self, id: ConnectionId) -> Result<(), NetError> {
        let entry = self.entries.get_mut(&id).ok_or(ClientError::UnknownId(id.0))?;
        lock(&entry.connection).shutdown();
        entry.removing = true;
        debug!(conn_id = %id, "Connection marked for removal");
        Ok(())
    }

    /// `tick` with an explicit timestamp (for testing).
    pub fn tick_at(&mut self, now: Instant) -> Result<usize, NetError> {
        self.advance_all(now);
        let delivered = self.dispatch();
        let limiter = &self.limiter;
        self.entries.retain(|id, entry| {
            let keep = !entry.removing || lock(&entry.connection).is_active();
            if !keep {
                if let Some(scoped) = &entry.own_limit {
                    limiter.remove_limit(scoped);
                }
                debug!(conn_id = %id, "Connection removed");
            }
            keep
        });

        if let Some(err) = self.worker.as_ref().and_then(|w| w.failure()) {
            return Err(err);
        }
        Ok(delivered)
    }

    fn advance_all(&self, now: Instant) {
        for entry in self.entries.values() {
            let mut connection = lock(&entry.connection);
            connection.advance(now);
            connection.flush_outbox(&self.limiter, now);
        }
    }

    /// Hand queued events and send receipts to their callbacks. No
    /// connection lock is held while a callback runs.
    fn dispatch(&mut self) -> usize {
        let mut delivered = 0;
        for data in self.events.pop_all_nonblocking() {
            if let Some(entry) = self.entries.get_mut(&data.connection_id) {
                (entry.callback)(&data, &entry.sender);
                delivered += 1;
            }
        }
        for entry in self.entries.values() {
            let receipts = lock(&entry.connection).take_receipts();
            for receipt in receipts {
                receipt.deliver();
                delivered += 1;
            }
        }
        delivered
    }

    fn any_active(&self) -> bool {
        self.entries
            .values()
            .any(|entry| lock(&entry.connection).is_active())
    }

    fn any_receipts(&self) -> bool {
        self.entries
            .values()
            .any(|entry| lock(&entry.connection).has_receipts())
    }
}

fn validate(config: &WebSocketConfig) -> Result<String, NetError> {
    let uri = reqwest::Url::parse(&config.uri)
        .map_err(|e| ClientError::MalformedRequest(format!("websocket uri {:?}: {e}", config.uri)))?;
    if !matches!(uri.scheme(), "ws" | "wss") {
        return Err(ClientError::MalformedRequest(format!("unsupported websocket scheme {:?}", uri.scheme())).into());
    }
    if let Some(proxy) = &config.proxy {
        if !proxy.is_valid() {
            return Err(ClientError::InvalidConfiguration("proxy needs a host and a port".into()).into());
        }
    }
    match config.resolved_key() {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(ClientError::RateLimitKeyMissing.into()),
    }
}

// =============================================================================
// TASK MANAGER
// =============================================================================

impl TaskManager for WebSocketManager {
    type Descriptor = WebSocketConfig;
    type Callback = WebSocketCallback;
    type Id = ConnectionId;

    fn submit(&mut self, config: WebSocketConfig, callback: WebSocketCallback) -> Result<ConnectionId, NetError> {
        self.submit_at(config, callback, Instant::now())
    }

    fn tick(&mut self) -> Result<usize, NetError> {
        self.tick_at(Instant::now())
    }

    fn tick_timeout(&mut self, timeout: Duration) -> Result<usize, NetError> {
        let deadline = Instant::now() + timeout;
        loop {
            let delivered = self.tick_at(Instant::now())?;
            let now = Instant::now();
            if delivered > 0 || now >= deadline || !self.is_loaded() {
                return Ok(delivered);
            }
            std::thread::sleep(std::cmp::min(deadline - now, POLL_INTERVAL));
        }
    }

    fn shutdown(&mut self, grace: Duration) {
        self.shutting_down = true;
        info!(
            connections = self.entries.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down WebSocket manager"
        );

        let now = Instant::now();
        for entry in self.entries.values() {
            lock(&entry.connection).disconnect(close_code::NORMAL, "shutdown", now);
        }

        let deadline = now + grace;
        while self.any_active() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.advance_all(now);
            self.dispatch();
            std::thread::sleep(std::cmp::min(deadline - now, POLL_INTERVAL));
        }

        for entry in self.entries.values() {
            let mut connection = lock(&entry.connection);
            connection.advance(Instant::now());
            connection.shutdown();
        }
        self.dispatch();
        for entry in std::mem::take(&mut self.entries).into_values() {
            if let Some(scoped) = &entry.own_limit {
                self.limiter.remove_limit(scoped);
            }
        }
    }

    fn is_loaded(&self) -> bool {
        !self.events.is_empty() || self.any_active() || self.any_receipts()
    }
}

impl Drop for WebSocketManager {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            self.shutdown(Duration::ZERO);
        }
    }
}
