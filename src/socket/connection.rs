//! Per-connection state machine.
//!
//! ```text
//! Disconnected --connect--> Connecting --Open--> Open --disconnect--> Closing --> Closed
//!                               |                 |                                ^
//!                               |            Close/Error                          |
//!                               v                 v                                |
//!                          Reconnecting <---------+--- policy exhausted/disabled --+
//! ```
//!
//! A segment is one backend session. `Close` is only reported for segments
//! that reached `Open`; a failed handshake reports `Error` alone. Events go
//! to the manager's queue tagged with the connection id.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::{EventQueue, RateLimiter};
use crate::error::{ClientError, ErrorCategory, NetError, WebSocketError};
use crate::socket::backend::{BackendHandle, WebSocketBackend};
use crate::types::websocket::{
    close_code, ConnectionId, ConnectionState, WebSocketConfig, WebSocketEvent, WebSocketEventData, WsFrame,
};

pub type SendCallback = Box<dyn FnOnce(Result<(), NetError>) + Send>;

/// Outcome of a send that asked to be notified, delivered inside `tick()`.
pub struct SendReceipt {
    callback: SendCallback,
    result: Result<(), NetError>,
}

impl SendReceipt {
    pub fn deliver(self) {
        (self.callback)(self.result);
    }
}

/// A send held back by the limiter.
struct Outgoing {
    frame: WsFrame,
    /// Admission key overriding the connection's.
    key: Option<String>,
    on_sent: Option<SendCallback>,
}

/// Caller-initiated close in progress.
#[derive(Debug, Clone)]
struct Closing {
    deadline: Instant,
    code: u16,
    reason: String,
}

pub struct WebSocketConnection {
    id: ConnectionId,
    config: WebSocketConfig,
    key: String,
    backend: Arc<dyn WebSocketBackend>,
    events: Arc<EventQueue<WebSocketEventData>>,
    state: ConnectionState,
    handle: Option<BackendHandle>,
    /// The current segment reached `Open`.
    reached_open: bool,
    user_closing: bool,
    closing: Option<Closing>,
    /// Consecutive reconnect attempts; reset by a clean close.
    attempt: u32,
    reconnect_at: Option<Instant>,
    last_delay: Option<Duration>,
    /// Sends held back by the limiter, oldest first.
    outbox: VecDeque<Outgoing>,
    receipts: Vec<SendReceipt>,
    shut_down: bool,
}

impl WebSocketConnection {
    pub fn new(
        id: ConnectionId,
        config: WebSocketConfig,
        key: String,
        backend: Arc<dyn WebSocketBackend>,
        events: Arc<EventQueue<WebSocketEventData>>,
    ) -> Self {
        Self {
            id,
            config,
            key,
            backend,
            events,
            state: ConnectionState::Disconnected,
            handle: None,
            reached_open: false,
            user_closing: false,
            closing: None,
            attempt: 0,
            reconnect_at: None,
            last_delay: None,
            outbox: VecDeque::new(),
            receipts: Vec::new(),
            shut_down: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Rate-limit key for sends.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Delay before the pending reconnect, while `Reconnecting`.
    pub fn reconnect_delay(&self) -> Option<Duration> {
        match self.state {
            ConnectionState::Reconnecting => self.last_delay,
            _ => None,
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempt
    }

    pub fn queued_sends(&self) -> usize {
        self.outbox.len()
    }

    /// Send outcomes waiting to be delivered.
    pub fn take_receipts(&mut self) -> Vec<SendReceipt> {
        std::mem::take(&mut self.receipts)
    }

    pub fn has_receipts(&self) -> bool {
        !self.receipts.is_empty()
    }

    /// Not yet settled in `Closed` (or never started).
    pub fn is_active(&self) -> bool {
        !matches!(self.state, ConnectionState::Disconnected | ConnectionState::Closed)
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    /// Start connecting. A no-op while a segment is already underway.
    pub fn connect(&mut self, now: Instant) -> Result<(), NetError> {
        if self.shut_down {
            return Err(ClientError::ShuttingDown.into());
        }
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Closed) {
            self.attempt = 0;
            self.user_closing = false;
            self.start_segment(now);
        }
        Ok(())
    }

    /// Caller-initiated close with `code` and `reason`.
    pub fn disconnect(&mut self, code: u16, reason: &str, now: Instant) {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                info!(conn_id = %self.id, code, "Closing connection");
                self.user_closing = true;
                if let Some(handle) = &self.handle {
                    self.backend.close(handle, code, reason);
                }
                self.closing = Some(Closing {
                    deadline: now + self.config.close_timeout,
                    code,
                    reason: reason.to_string(),
                });
                self.state = ConnectionState::Closing;
            }
            ConnectionState::Reconnecting => {
                info!(conn_id = %self.id, "Reconnect cancelled");
                self.reconnect_at = None;
                self.state = ConnectionState::Closed;
            }
            _ => {}
        }
    }

    /// Tear down immediately from any state. No further reconnects.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.backend.close(&handle, close_code::NORMAL, "shutdown");
        }
        if self.reached_open {
            let (code, reason) = match self.closing.take() {
                Some(closing) => (closing.code, closing.reason),
                None => (close_code::NORMAL, "shutdown".to_string()),
            };
            self.emit(WebSocketEvent::Close { code, reason });
        }
        self.drop_outbox();
        self.reached_open = false;
        self.closing = None;
        self.reconnect_at = None;
        self.shut_down = true;
        self.state = ConnectionState::Closed;
    }

    /// Apply backend events and timers up to `now`.
    pub fn advance(&mut self, now: Instant) {
        loop {
            let Some(handle) = self.handle.as_ref() else {
                break;
            };
            let Some(event) = self.backend.poll(handle) else {
                break;
            };
            self.on_backend_event(event, now);
        }

        let close_expired = matches!(&self.closing, Some(closing) if now >= closing.deadline);
        if self.state == ConnectionState::Closing && close_expired {
            warn!(conn_id = %self.id, "Close not confirmed in time, dropping session");
            if let Some(closing) = self.closing.take() {
                if self.reached_open {
                    self.emit(WebSocketEvent::Close {
                        code: closing.code,
                        reason: closing.reason,
                    });
                }
            }
            self.end_segment(now, false, false);
        }

        let reconnect_due = matches!(self.reconnect_at, Some(at) if now >= at);
        if self.state == ConnectionState::Reconnecting && reconnect_due {
            self.start_segment(now);
        }
    }

    /// Earliest instant at which `advance` or a flush has timed work to do.
    pub fn next_deadline(&self, limiter: &RateLimiter, now: Instant) -> Option<Instant> {
        let flush = self
            .outbox
            .front()
            .filter(|_| self.state == ConnectionState::Open)
            .map(|next| now + limiter.time_until_allowed_at(next.key.as_deref().unwrap_or(&self.key), now));
        [self.reconnect_at, self.closing.as_ref().map(|c| c.deadline), flush]
            .into_iter()
            .flatten()
            .min()
    }

    fn start_segment(&mut self, now: Instant) {
        self.reconnect_at = None;
        match self.backend.connect(self.id, &self.config) {
            Ok(handle) => {
                debug!(conn_id = %self.id, session = handle.session, uri = %self.config.uri, "Connecting");
                self.handle = Some(handle);
                self.state = ConnectionState::Connecting;
            }
            Err(err) => {
                warn!(conn_id = %self.id, error = %err, "Connect failed");
                let retryable = err.category() != ErrorCategory::Client;
                self.emit(WebSocketEvent::Error(err));
                self.state = ConnectionState::Connecting;
                self.end_segment(now, false, retryable);
            }
        }
    }

    fn on_backend_event(&mut self, event: WebSocketEvent, now: Instant) {
        match event {
            WebSocketEvent::Open => {
                if self.state == ConnectionState::Connecting {
                    info!(conn_id = %self.id, "WebSocket open");
                    self.state = ConnectionState::Open;
                    self.reached_open = true;
                    self.emit(WebSocketEvent::Open);
                }
            }
            WebSocketEvent::Message { .. } => {
                if self.reached_open {
                    self.emit(event);
                }
            }
            WebSocketEvent::Close { code, reason } => {
                if self.state == ConnectionState::Connecting {
                    self.emit(WebSocketEvent::Error(NetError::websocket(
                        WebSocketError::ConnectionFailed,
                        format!("closed during handshake ({code})"),
                    )));
                } else if self.reached_open {
                    self.state = ConnectionState::Closing;
                    self.emit(WebSocketEvent::Close { code, reason });
                }
                self.end_segment(now, code == close_code::NORMAL, true);
            }
            WebSocketEvent::Error(err) => {
                let retryable = err.category() != ErrorCategory::Client;
                let reason = err.to_string();
                self.emit(WebSocketEvent::Error(err));
                if self.reached_open {
                    self.emit(WebSocketEvent::Close {
                        code: close_code::ABNORMAL,
                        reason,
                    });
                }
                self.end_segment(now, false, retryable);
            }
        }
    }

    /// Finish the current segment and pick `Reconnecting` or `Closed`.
    fn end_segment(&mut self, now: Instant, clean: bool, may_reconnect: bool) {
        self.handle = None;
        self.reached_open = false;
        self.closing = None;
        self.drop_outbox();

        if self.user_closing || self.shut_down || !may_reconnect || !self.config.reconnect.enabled {
            self.user_closing = false;
            self.state = ConnectionState::Closed;
            return;
        }

        if clean {
            self.attempt = 0;
        }
        self.attempt += 1;
        if !self.config.reconnect.allows(self.attempt) {
            warn!(conn_id = %self.id, attempts = self.attempt, "Max reconnection attempts reached, giving up");
            self.state = ConnectionState::Closed;
            return;
        }

        let delay = self.config.reconnect.delay_for(self.attempt);
        info!(
            conn_id = %self.id,
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempt,
            "Reconnecting after delay"
        );
        self.reconnect_at = Some(now + delay);
        self.last_delay = Some(delay);
        self.state = ConnectionState::Reconnecting;
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Hand `frame` to the backend. Only valid while `Open`.
    pub fn send(&mut self, frame: WsFrame) -> Result<(), NetError> {
        match (&self.state, &self.handle) {
            (ConnectionState::Open, Some(handle)) => self.backend.send(handle, frame),
            _ => Err(NetError::not_connected()),
        }
    }

    /// Send through the limiter: immediately when admitted, otherwise held
    /// in the outbox behind earlier deferred frames.
    pub fn queue_send(&mut self, frame: WsFrame, limiter: &RateLimiter, now: Instant) -> Result<(), NetError> {
        self.queue_send_with(frame, None, None, limiter, now)
    }

    /// `queue_send` admitted under `key` instead of the connection's key.
    /// `on_sent` gets the outcome once the frame reaches the backend or is
    /// dropped with its segment; it is not called when this returns `Err`.
    pub fn queue_send_with(
        &mut self,
        frame: WsFrame,
        key: Option<&str>,
        on_sent: Option<SendCallback>,
        limiter: &RateLimiter,
        now: Instant,
    ) -> Result<(), NetError> {
        if self.state != ConnectionState::Open {
            return Err(NetError::not_connected());
        }
        if self.outbox.is_empty() && limiter.try_acquire_at(key.unwrap_or(&self.key), now).is_permit() {
            self.send(frame)?;
            if let Some(callback) = on_sent {
                self.receipts.push(SendReceipt { callback, result: Ok(()) });
            }
            return Ok(());
        }
        if self.outbox.len() >= self.config.send_queue_depth {
            return Err(ClientError::Backpressure {
                depth: self.config.send_queue_depth,
            }
            .into());
        }
        self.outbox.push_back(Outgoing {
            frame,
            key: key.map(str::to_string),
            on_sent,
        });
        debug!(conn_id = %self.id, queued = self.outbox.len(), "Send deferred by rate limit");
        Ok(())
    }

    /// Send deferred frames the limiter now admits. Returns how many went out.
    /// A frame the backend refuses stays at the head of the outbox.
    pub fn flush_outbox(&mut self, limiter: &RateLimiter, now: Instant) -> usize {
        let mut sent = 0;
        while self.state == ConnectionState::Open {
            let Some(next) = self.outbox.front() else {
                break;
            };
            if !limiter
                .try_acquire_at(next.key.as_deref().unwrap_or(&self.key), now)
                .is_permit()
            {
                break;
            }
            let Some(outgoing) = self.outbox.pop_front() else {
                break;
            };
            if let Err(e) = self.send(outgoing.frame.clone()) {
                warn!(conn_id = %self.id, error = %e, "Deferred send failed");
                self.outbox.push_front(outgoing);
                break;
            }
            if let Some(callback) = outgoing.on_sent {
                self.receipts.push(SendReceipt { callback, result: Ok(()) });
            }
            sent += 1;
        }
        sent
    }

    fn drop_outbox(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        warn!(conn_id = %self.id, dropped = self.outbox.len(), "Dropping deferred sends");
        for outgoing in self.outbox.drain(..) {
            if let Some(callback) = outgoing.on_sent {
                self.receipts.push(SendReceipt {
                    callback,
                    result: Err(NetError::not_connected()),
                });
            }
        }
    }

    fn emit(&self, event: WebSocketEvent) {
        self.events.push(WebSocketEventData {
            connection_id: self.id,
            event,
        });
    }
}
