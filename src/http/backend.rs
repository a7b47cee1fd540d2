//! HTTP transport seam.
//!
//! Connection pooling lives inside the backend, so a request is one future:
//! connect, send and receive are not separate steps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::error::{ClientError, NetError};
use crate::types::headers::Headers;
use crate::types::proxy::{ProxyConfig, ProxyType};
use crate::types::request::{RequestId, ResponseRecord};

/// A validated attempt, ready for the wire.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub id: RequestId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub method: reqwest::Method,
    pub url: reqwest::Url,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub timeout: Duration,
    pub proxy: Option<Arc<ProxyConfig>>,
    /// Redirects to follow; `0` hands 3xx responses back as they are.
    pub max_redirects: usize,
    pub connect_timeout: Option<Duration>,
}

impl PreparedRequest {
    pub fn profile(&self) -> ClientProfile {
        ClientProfile {
            proxy: self.proxy.as_deref().cloned(),
            max_redirects: self.max_redirects,
            connect_timeout: self.connect_timeout,
        }
    }
}

pub type BackendFuture = BoxFuture<'static, Result<ResponseRecord, NetError>>;

pub trait HttpBackend: Send + Sync {
    /// Perform one attempt. Any status counts as `Ok`; status classification
    /// belongs to the manager.
    fn execute(&self, request: PreparedRequest) -> BackendFuture;
}

// =============================================================================
// REQWEST BACKEND
// =============================================================================

/// Client-level settings. `reqwest` fixes these per client, so requests
/// that differ in any of them need their own pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientProfile {
    pub proxy: Option<ProxyConfig>,
    pub max_redirects: usize,
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            proxy: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout: None,
        }
    }
}

pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default backend on top of `reqwest`, one pooled client per profile.
pub struct ReqwestBackend {
    clients: Mutex<HashMap<ClientProfile, reqwest::Client>>,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self, NetError> {
        let profile = ClientProfile::default();
        let client = build_client(&profile)?;
        Ok(Self {
            clients: Mutex::new(HashMap::from([(profile, client)])),
        })
    }

    fn client_for(&self, profile: ClientProfile) -> Result<reqwest::Client, NetError> {
        let mut cache = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = cache.get(&profile) {
            return Ok(client.clone());
        }
        let client = build_client(&profile)?;
        debug!(
            proxy = %profile.proxy.as_ref().map(|p| p.authority()).unwrap_or_default(),
            max_redirects = profile.max_redirects,
            "Created HTTP client"
        );
        cache.insert(profile, client.clone());
        Ok(client)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn build_client(profile: &ClientProfile) -> Result<reqwest::Client, NetError> {
    // Keep idle connections warm across bursts.
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .pool_idle_timeout(Duration::from_secs(25))
        .pool_max_idle_per_host(10)
        .redirect(match profile.max_redirects {
            0 => reqwest::redirect::Policy::none(),
            n => reqwest::redirect::Policy::limited(n),
        });

    if let Some(timeout) = profile.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }

    if let Some(proxy) = &profile.proxy {
        if matches!(proxy.kind, ProxyType::Socks4 | ProxyType::Socks4a) {
            return Err(ClientError::UnsupportedProxy(proxy.kind.scheme()).into());
        }
        let proxy = reqwest::Proxy::all(proxy.to_url()?)
            .map_err(|e| ClientError::InvalidConfiguration(format!("proxy: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| ClientError::InvalidConfiguration(format!("failed to create HTTP client: {e}")).into())
}

impl HttpBackend for ReqwestBackend {
    fn execute(&self, request: PreparedRequest) -> BackendFuture {
        let client = self.client_for(request.profile());
        Box::pin(async move {
            let client = client?;
            let mut builder = client
                .request(request.method, request.url)
                .timeout(request.timeout)
                .body(request.body);
            for (name, value) in request.headers.iter() {
                builder = builder.header(name, value);
            }

            let started = Instant::now();
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let mut headers = Headers::new();
            for (name, value) in response.headers() {
                if let Ok(value) = value.to_str() {
                    headers.append(name.as_str(), value);
                }
            }
            let body = response.bytes().await?.to_vec();

            Ok(ResponseRecord {
                request_id: request.id,
                status,
                headers,
                body,
                latency: started.elapsed(),
                attempts: request.attempt,
            })
        })
    }
}

// =============================================================================
// SCRIPTED BACKEND (tests)
// =============================================================================

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;

    /// What the scripted backend does for one attempt.
    #[derive(Debug, Clone)]
    pub(crate) struct Step {
        pub delay: Duration,
        pub outcome: Result<(u16, Vec<(&'static str, String)>), NetError>,
    }

    impl Step {
        pub fn status(status: u16) -> Self {
            Self {
                delay: Duration::ZERO,
                outcome: Ok((status, Vec::new())),
            }
        }

        pub fn fail(err: NetError) -> Self {
            Self {
                delay: Duration::ZERO,
                outcome: Err(err),
            }
        }

        pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
            if let Ok((_, headers)) = &mut self.outcome {
                headers.push((name, value.into()));
            }
            self
        }

        pub fn after(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    type Script = Box<dyn Fn(&PreparedRequest) -> Step + Send + Sync>;

    /// Records every attempt and answers from a script.
    pub(crate) struct ScriptedBackend {
        script: Script,
        calls: Mutex<Vec<PreparedRequest>>,
    }

    impl ScriptedBackend {
        pub fn new(script: impl Fn(&PreparedRequest) -> Step + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn ok() -> Arc<Self> {
            Self::new(|_| Step::status(200))
        }

        pub fn calls(&self) -> Vec<PreparedRequest> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl HttpBackend for ScriptedBackend {
        fn execute(&self, request: PreparedRequest) -> BackendFuture {
            let step = (self.script)(&request);
            self.calls.lock().unwrap().push(request.clone());
            Box::pin(async move {
                if !step.delay.is_zero() {
                    tokio::time::sleep(step.delay).await;
                }
                let (status, raw_headers) = step.outcome?;
                Ok(ResponseRecord {
                    request_id: request.id,
                    status,
                    headers: raw_headers.into_iter().collect(),
                    body: format!("{} {}", request.method, request.url.path()).into_bytes(),
                    latency: step.delay,
                    attempts: request.attempt,
                })
            })
        }
    }
}
