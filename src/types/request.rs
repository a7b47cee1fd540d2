//! HTTP request and response records.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::types::headers::Headers;
use crate::types::proxy::ProxyConfig;

/// Identifier handed out by `HttpRequestManager::submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req_{}", self.0)
    }
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Retry shape for retryable failures (transport errors, 408, 429, 5xx).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(10_000),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// `base * 2^(failures-1)`, capped at `max_delay`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// With jitter the raw backoff is drawn from `[backoff/2, backoff]`; the
    /// result never drops below `previous` and never exceeds `max_delay`.
    pub fn next_delay(&self, failures: u32, previous: Duration) -> Duration {
        let raw = self.backoff(failures);
        let delay = if self.jitter && !raw.is_zero() {
            let half = raw / 2;
            let spread = (raw - half).as_millis() as u64;
            half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
        } else {
            raw
        };
        std::cmp::min(std::cmp::max(delay, previous), self.max_delay)
    }
}

// =============================================================================
// REQUEST DESCRIPTOR
// =============================================================================

/// Everything needed to issue one HTTP request. Frozen once submitted; the
/// manager shares it as `Arc<RequestDescriptor>` across retries.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: String,
    /// Absolute URL, or a path resolved against the manager's base URL.
    pub url: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Per-attempt timeout; the manager default applies when `None`.
    pub timeout: Option<Duration>,
    /// The manager default proxy applies when `None`.
    pub proxy: Option<Arc<ProxyConfig>>,
    /// Admission key; defaults to the URL host.
    pub rate_limit_key: Option<String>,
    /// The manager default policy applies when `None`.
    pub retry: Option<RetryPolicy>,
    /// Statuses treated as success in addition to 2xx.
    pub valid_statuses: HashSet<u16>,
    /// Follow 3xx `Location` headers; the manager default applies when `None`.
    pub follow_redirects: Option<bool>,
    /// Redirect hop limit when following; the manager default applies when `None`.
    pub max_redirects: Option<usize>,
    /// TCP/TLS connect timeout; the manager default applies when `None`.
    pub connect_timeout: Option<Duration>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: Vec::new(),
            timeout: None,
            proxy: None,
            rate_limit_key: None,
            retry: None,
            valid_statuses: HashSet::new(),
            follow_redirects: None,
            max_redirects: None,
            connect_timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new("POST", url).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn proxy(mut self, proxy: Arc<ProxyConfig>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = Some(follow);
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = Some(max);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn valid_status(mut self, status: u16) -> Self {
        self.valid_statuses.insert(status);
        self
    }

    pub fn is_success_status(&self, status: u16) -> bool {
        (200..300).contains(&status) || self.valid_statuses.contains(&status)
    }
}

// =============================================================================
// RESPONSE RECORD
// =============================================================================

#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub request_id: RequestId,
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Wall time of the final attempt.
    pub latency: Duration,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

impl ResponseRecord {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
