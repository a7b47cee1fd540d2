use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;

use crate::error::NetError;
use crate::types::proxy::ProxyConfig;
use crate::types::request::{RequestDescriptor, RequestId, ResponseRecord, RetryPolicy};

pub type HttpCallback = Box<dyn FnOnce(Result<ResponseRecord, NetError>) + Send>;

/// Where a request currently sits inside the manager.
#[derive(Debug)]
pub(crate) enum Phase {
    /// Waiting in its key queue for admission.
    Queued,
    /// Backing off after a retryable failure.
    Retrying { ready_at: Instant },
    InFlight { abort: AbortHandle },
}

/// Per-request bookkeeping, owned by the manager until the callback fires.
pub(crate) struct RequestContext {
    pub id: RequestId,
    pub descriptor: Arc<RequestDescriptor>,
    pub method: reqwest::Method,
    pub url: reqwest::Url,
    pub key: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub proxy: Option<Arc<ProxyConfig>>,
    pub max_redirects: usize,
    pub connect_timeout: Option<Duration>,
    pub attempts: u32,
    pub last_error: Option<NetError>,
    pub prev_delay: Duration,
    pub phase: Phase,
    callback: Option<HttpCallback>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: RequestId,
        descriptor: Arc<RequestDescriptor>,
        method: reqwest::Method,
        url: reqwest::Url,
        key: String,
        timeout: Duration,
        retry: RetryPolicy,
        proxy: Option<Arc<ProxyConfig>>,
        max_redirects: usize,
        connect_timeout: Option<Duration>,
        callback: HttpCallback,
    ) -> Self {
        Self {
            id,
            descriptor,
            method,
            url,
            key,
            timeout,
            retry,
            proxy,
            max_redirects,
            connect_timeout,
            attempts: 0,
            last_error: None,
            prev_delay: Duration::ZERO,
            phase: Phase::Queued,
            callback: Some(callback),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.phase, Phase::InFlight { .. })
    }

    /// Whether another attempt is allowed after `err`.
    pub fn can_retry(&self, err: &NetError) -> bool {
        err.is_retryable() && self.attempts < self.retry.max_attempts
    }

    /// Abort the running attempt, if any.
    pub fn abort(&self) {
        if let Phase::InFlight { abort } = &self.phase {
            abort.abort();
        }
    }

    /// Consume the context and fire its callback.
    pub fn complete(mut self, result: Result<ResponseRecord, NetError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}
