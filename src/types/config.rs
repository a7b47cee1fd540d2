use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ClientError, NetError};
use crate::types::headers::Headers;
use crate::types::proxy::ProxyConfig;
use crate::types::request::RetryPolicy;
use crate::types::websocket::ReconnectPolicy;

/// A ceiling of permits per sliding window. `ceiling == 0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitData {
    pub ceiling: u32,
    pub window_ms: u64,
}

impl RateLimitData {
    pub fn new(ceiling: u32, window: Duration) -> Self {
        Self {
            ceiling,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            ceiling: 0,
            window_ms: 0,
        }
    }

    pub fn per_second(ceiling: u32) -> Self {
        Self::new(ceiling, Duration::from_secs(1))
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn is_unlimited(&self) -> bool {
        self.ceiling == 0 || self.window_ms == 0
    }
}

/// Retry section of [`EngineConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 1)
    pub max_attempts: Option<u32>,
    /// Backoff base in milliseconds (default: 100)
    pub base_delay_ms: Option<u64>,
    /// Backoff cap in milliseconds (default: 10000)
    pub max_delay_ms: Option<u64>,
    /// Randomize delays (default: false)
    pub jitter: Option<bool>,
}

/// Reconnect section of [`EngineConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect after abnormal closure (default: true)
    pub enabled: Option<bool>,
    /// Reconnection base delay in milliseconds (default: 1000)
    pub base_delay_ms: Option<u64>,
    /// Maximum reconnection delay in milliseconds (default: 30000)
    pub max_delay_ms: Option<u64>,
    /// Maximum reconnection attempts before giving up (default: unlimited = -1)
    pub max_attempts: Option<i32>,
}

/// Process-wide configuration for the engine and both managers.
/// Usually loaded with [`EngineConfig::from_json`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Background I/O threads (default: 2)
    pub worker_threads: Option<usize>,

    /// Tracing filter used when `RUST_LOG` is unset (default: "info")
    pub log_filter: Option<String>,

    /// Base URL joined with relative request URLs
    pub base_url: Option<String>,

    /// Headers added to every request that does not set them
    #[serde(default)]
    pub default_headers: HashMap<String, String>,

    /// Per-attempt request timeout in milliseconds (default: 30000)
    pub default_timeout_ms: Option<u64>,

    /// Follow HTTP redirects (default: true)
    pub follow_redirects: Option<bool>,

    /// Redirect hop limit (default: 10)
    pub max_redirects: Option<usize>,

    /// HTTP connect timeout in milliseconds (default: none)
    pub connect_timeout_ms: Option<u64>,

    /// Proxy used when a request or connection names none
    pub proxy: Option<ProxyConfig>,

    /// Ceiling shared by all traffic
    pub general_rate_limit: Option<RateLimitData>,

    /// Ceiling applied to every key without an explicit limit
    pub per_key_rate_limit: Option<RateLimitData>,

    /// Explicit ceilings by rate-limit key
    #[serde(default)]
    pub key_rate_limits: HashMap<String, RateLimitData>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Deferred WebSocket sends per connection (default: 64)
    pub send_queue_depth: Option<usize>,

    /// Grace period for in-flight work at shutdown in milliseconds (default: 5000)
    pub shutdown_grace_ms: Option<u64>,

    /// Ping interval in milliseconds (default: 15000)
    pub ping_interval_ms: Option<u64>,

    /// Close handshake timeout in milliseconds (default: 5000)
    pub close_timeout_ms: Option<u64>,

    /// WebSocket opening handshake timeout in milliseconds (default: 30000)
    pub handshake_timeout_ms: Option<u64>,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, NetError> {
        serde_json::from_str(json)
            .map_err(|e| ClientError::InvalidConfiguration(e.to_string()).into())
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or(2).max(1)
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or("info")
    }

    pub fn default_headers(&self) -> Headers {
        self.default_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms.unwrap_or(30_000))
    }

    /// Redirect hops the HTTP client follows; `0` when following is off.
    pub fn max_redirects(&self) -> usize {
        if self.follow_redirects.unwrap_or(true) {
            self.max_redirects.unwrap_or(10)
        } else {
            0
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts.unwrap_or(1),
            Duration::from_millis(self.retry.base_delay_ms.unwrap_or(100)),
            Duration::from_millis(self.retry.max_delay_ms.unwrap_or(10_000)),
        )
        .with_jitter(self.retry.jitter.unwrap_or(false))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.reconnect.enabled.unwrap_or(true),
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms.unwrap_or(1_000)),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms.unwrap_or(30_000)),
            max_attempts: match self.reconnect.max_attempts {
                Some(n) if n >= 0 => Some(n as u32),
                _ => None, // unlimited
            },
        }
    }

    pub fn send_queue_depth(&self) -> usize {
        self.send_queue_depth.unwrap_or(64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms.unwrap_or(5_000))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.unwrap_or(15_000))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms.unwrap_or(5_000))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.unwrap_or(30_000))
    }
}
