//! HTTP request manager.
//!
//! Requests are admitted through the shared [`RateLimiter`] and executed on
//! the [`NetworkWorker`]; results come back through an [`EventQueue`] and
//! reach callbacks only inside `tick()`.
//!
//! Requests denied admission wait in a FIFO per rate-limit key. While a key
//! has waiting requests, new submissions for that key join the back of its
//! queue instead of trying the limiter, so same-key requests dispatch in
//! submission order. Retries sit on a timer until their backoff elapses and
//! then re-enter admission like a new submission.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, trace, warn};

use crate::core::{Admission, EventQueue, NetworkWorker, RateLimiter, TaskManager};
use crate::error::{ClientError, NetError, TransportError};
use crate::http::backend::{HttpBackend, PreparedRequest, ReqwestBackend, DEFAULT_MAX_REDIRECTS};
use crate::http::batch::{BatchCallback, BatchRequestHandler};
use crate::http::context::{HttpCallback, Phase, RequestContext};
use crate::runtime;
use crate::types::config::EngineConfig;
use crate::types::cookie::CookieJar;
use crate::types::headers::Headers;
use crate::types::proxy::ProxyConfig;
use crate::types::request::{RequestDescriptor, RequestId, ResponseRecord, RetryPolicy};

// =============================================================================
// OPTIONS
// =============================================================================

/// Manager-wide defaults applied to every descriptor.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub base_url: Option<reqwest::Url>,
    pub default_headers: Headers,
    pub default_timeout: Duration,
    pub default_proxy: Option<Arc<ProxyConfig>>,
    pub retry: RetryPolicy,
    /// Redirect hops followed by default; `0` disables following.
    pub max_redirects: usize,
    pub connect_timeout: Option<Duration>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: Headers::new(),
            default_timeout: Duration::from_millis(30_000),
            default_proxy: None,
            retry: RetryPolicy::default(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout: None,
        }
    }
}

impl HttpOptions {
    pub fn from_config(config: &EngineConfig) -> Result<Self, NetError> {
        let base_url = match &config.base_url {
            Some(raw) => Some(
                reqwest::Url::parse(raw)
                    .map_err(|e| ClientError::InvalidConfiguration(format!("base_url {raw:?}: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            base_url,
            default_headers: config.default_headers(),
            default_timeout: config.default_timeout(),
            default_proxy: config.proxy.clone().map(Arc::new),
            retry: config.retry_policy(),
            max_redirects: config.max_redirects(),
            connect_timeout: config.connect_timeout(),
        })
    }
}

// =============================================================================
// MANAGER STATE
// =============================================================================

struct Completion {
    id: RequestId,
    result: Result<ResponseRecord, NetError>,
}

/// Requests of one key waiting for admission.
struct KeyQueue {
    waiting: VecDeque<RequestId>,
    /// Earliest time the limiter may admit the head.
    not_before: Instant,
}

pub struct HttpRequestManager {
    worker: Arc<NetworkWorker>,
    backend: Arc<dyn HttpBackend>,
    limiter: Arc<RateLimiter>,
    options: HttpOptions,
    completions: Arc<EventQueue<Completion>>,
    contexts: HashMap<RequestId, RequestContext>,
    queues: HashMap<String, KeyQueue>,
    retries: BTreeSet<(Instant, RequestId)>,
    batches: Vec<BatchRequestHandler>,
    cookies: CookieJar,
    next_id: u64,
    /// Callbacks fired so far; `tick` reports the difference.
    delivered: usize,
    shutting_down: bool,
}

impl HttpRequestManager {
    pub fn new(
        worker: Arc<NetworkWorker>,
        backend: Arc<dyn HttpBackend>,
        limiter: Arc<RateLimiter>,
        options: HttpOptions,
    ) -> Self {
        Self {
            worker,
            backend,
            limiter,
            options,
            completions: Arc::new(EventQueue::new()),
            contexts: HashMap::new(),
            queues: HashMap::new(),
            retries: BTreeSet::new(),
            batches: Vec::new(),
            cookies: CookieJar::new(),
            next_id: 1,
            delivered: 0,
            shutting_down: false,
        }
    }

    /// Manager on the process-wide worker and limiter set up by
    /// [`runtime::init`], using the `reqwest` backend.
    pub fn from_config(config: &EngineConfig) -> Result<Self, NetError> {
        Ok(Self::new(
            runtime::shared_worker()?,
            Arc::new(ReqwestBackend::new()?),
            runtime::shared_limiter()?,
            HttpOptions::from_config(config)?,
        ))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut CookieJar {
        &mut self.cookies
    }

    /// Requests currently executing on the worker.
    pub fn in_flight(&self) -> usize {
        self.contexts.values().filter(|c| c.is_in_flight()).count()
    }

    /// Requests waiting for admission or for a retry timer.
    pub fn waiting(&self) -> usize {
        self.contexts.len() - self.in_flight()
    }

    pub fn submit_with<F>(&mut self, descriptor: RequestDescriptor, callback: F) -> Result<RequestId, NetError>
    where
        F: FnOnce(Result<ResponseRecord, NetError>) + Send + 'static,
    {
        self.submit(descriptor, Box::new(callback))
    }

    /// `submit` with an explicit timestamp (for testing).
    pub fn submit_at(
        &mut self,
        descriptor: RequestDescriptor,
        callback: HttpCallback,
        now: Instant,
    ) -> Result<RequestId, NetError> {
        self.check_accepting()?;
        let id = self.allocate_id();
        self.enqueue(id, descriptor, callback, now)?;
        Ok(id)
    }

    /// Submit descriptors sharing one rate-limit key. They are fed in order,
    /// each only when the key would admit it. Ids are allocated up front.
    pub fn submit_batch(
        &mut self,
        descriptors: Vec<RequestDescriptor>,
        callback: BatchCallback,
    ) -> Result<Vec<RequestId>, NetError> {
        self.submit_batch_at(descriptors, callback, Instant::now())
    }

    pub fn submit_batch_at(
        &mut self,
        descriptors: Vec<RequestDescriptor>,
        callback: BatchCallback,
        now: Instant,
    ) -> Result<Vec<RequestId>, NetError> {
        self.check_accepting()?;
        let mut keys = descriptors.iter().map(|d| self.resolve(d).map(|r| r.key));
        let Some(key) = keys.next().transpose()? else {
            return Ok(Vec::new());
        };
        for other in keys {
            let other = other?;
            if other != key {
                return Err(ClientError::MalformedRequest(format!(
                    "batch mixes rate-limit keys {key:?} and {other:?}"
                ))
                .into());
            }
        }

        let items: Vec<(RequestId, RequestDescriptor)> = descriptors
            .into_iter()
            .map(|descriptor| (self.allocate_id(), descriptor))
            .collect();
        let ids: Vec<RequestId> = items.iter().map(|(id, _)| *id).collect();
        info!(key = %key, size = ids.len(), "Batch submitted");

        self.batches.push(BatchRequestHandler::new(key, items, callback));
        self.feed_batches(now);
        Ok(ids)
    }

    /// Cancel a request. Its callback fires with `Cancelled` before this
    /// returns; a result arriving later is ignored.
    pub fn cancel(&mut self, id: RequestId) -> Result<(), NetError> {
        if let Some(ctx) = self.contexts.remove(&id) {
            match &ctx.phase {
                Phase::Queued => self.unqueue(&ctx.key, id),
                Phase::Retrying { ready_at } => {
                    self.retries.remove(&(*ready_at, id));
                }
                Phase::InFlight { .. } => ctx.abort(),
            }
            self.finish(ctx, Err(NetError::cancelled()));
            return Ok(());
        }
        for batch in &mut self.batches {
            if batch.cancel(id) {
                self.delivered += 1;
                return Ok(());
            }
        }
        Err(ClientError::UnknownId(id.0).into())
    }

    /// `tick` with an explicit timestamp (for testing).
    pub fn tick_at(&mut self, now: Instant) -> Result<usize, NetError> {
        let before = self.delivered;
        for completion in self.completions.pop_all_nonblocking() {
            self.handle_completion(completion, now);
        }
        self.promote_retries(now);
        self.drain_queues(now);
        self.feed_batches(now);
        self.cookies.prune();

        match self.worker.failure() {
            Some(err) => Err(err),
            None => Ok(self.delivered - before),
        }
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    fn check_accepting(&self) -> Result<(), NetError> {
        if self.shutting_down {
            return Err(ClientError::ShuttingDown.into());
        }
        match self.worker.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn allocate_id(&mut self) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Apply manager defaults and validate.
    fn resolve(&self, descriptor: &RequestDescriptor) -> Result<Resolved, NetError> {
        let method = reqwest::Method::from_bytes(descriptor.method.as_bytes())
            .map_err(|_| ClientError::MalformedRequest(format!("invalid method {:?}", descriptor.method)))?;

        let url = match &self.options.base_url {
            Some(base) => base.join(&descriptor.url),
            None => reqwest::Url::parse(&descriptor.url),
        }
        .map_err(|e| ClientError::MalformedRequest(format!("invalid URL {:?}: {e}", descriptor.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::MalformedRequest(format!("unsupported scheme {:?}", url.scheme())).into());
        }

        let key = match &descriptor.rate_limit_key {
            Some(key) => key.clone(),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        if key.is_empty() {
            return Err(ClientError::RateLimitKeyMissing.into());
        }

        let proxy = descriptor
            .proxy
            .clone()
            .or_else(|| self.options.default_proxy.clone());
        if let Some(proxy) = &proxy {
            if !proxy.is_valid() {
                return Err(ClientError::InvalidConfiguration(format!(
                    "proxy {:?} has no host or port",
                    proxy.authority()
                ))
                .into());
            }
        }

        Ok(Resolved {
            method,
            url,
            key,
            timeout: descriptor.timeout.unwrap_or(self.options.default_timeout),
            retry: descriptor.retry.clone().unwrap_or_else(|| self.options.retry.clone()),
            proxy,
            max_redirects: match descriptor.follow_redirects {
                Some(false) => 0,
                Some(true) => descriptor.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
                None => descriptor.max_redirects.unwrap_or(self.options.max_redirects),
            },
            connect_timeout: descriptor.connect_timeout.or(self.options.connect_timeout),
        })
    }

    fn enqueue(
        &mut self,
        id: RequestId,
        descriptor: RequestDescriptor,
        callback: HttpCallback,
        now: Instant,
    ) -> Result<(), NetError> {
        let resolved = self.resolve(&descriptor)?;
        let key = resolved.key.clone();
        let ctx = RequestContext::new(
            id,
            Arc::new(descriptor),
            resolved.method,
            resolved.url,
            resolved.key,
            resolved.timeout,
            resolved.retry,
            resolved.proxy,
            resolved.max_redirects,
            resolved.connect_timeout,
            callback,
        );
        trace!(request_id = %id, key = %key, "Request submitted");
        self.contexts.insert(id, ctx);
        self.admit_or_queue(id, &key, now);
        Ok(())
    }

    fn admit_or_queue(&mut self, id: RequestId, key: &str, now: Instant) {
        if let Some(ctx) = self.contexts.get_mut(&id) {
            ctx.phase = Phase::Queued;
        }
        if let Some(queue) = self.queues.get_mut(key) {
            queue.waiting.push_back(id);
            return;
        }
        match self.limiter.try_acquire_at(key, now) {
            Admission::Permit => self.dispatch(id),
            Admission::Denied { retry_after } => {
                debug!(
                    request_id = %id,
                    key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request deferred by rate limit"
                );
                self.queues.insert(
                    key.to_string(),
                    KeyQueue {
                        waiting: VecDeque::from([id]),
                        not_before: now + retry_after,
                    },
                );
            }
        }
    }

    fn unqueue(&mut self, key: &str, id: RequestId) {
        if let Some(queue) = self.queues.get_mut(key) {
            queue.waiting.retain(|waiting| *waiting != id);
            if queue.waiting.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    fn promote_retries(&mut self, now: Instant) {
        while let Some(&(ready_at, id)) = self.retries.first() {
            if ready_at > now {
                break;
            }
            self.retries.pop_first();
            let Some(key) = self.contexts.get(&id).map(|ctx| ctx.key.clone()) else {
                continue;
            };
            self.admit_or_queue(id, &key, now);
        }
    }

    /// Dispatch from each key queue whose head may be admitted, stopping
    /// at the first denial per key.
    fn drain_queues(&mut self, now: Instant) {
        let due: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.not_before <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            loop {
                let Some(queue) = self.queues.get_mut(&key) else {
                    break;
                };
                let Some(&id) = queue.waiting.front() else {
                    self.queues.remove(&key);
                    break;
                };
                match self.limiter.try_acquire_at(&key, now) {
                    Admission::Permit => {
                        queue.waiting.pop_front();
                        if queue.waiting.is_empty() {
                            self.queues.remove(&key);
                        }
                        self.dispatch(id);
                    }
                    Admission::Denied { retry_after } => {
                        queue.not_before = now + retry_after;
                        break;
                    }
                }
            }
        }
    }

    fn feed_batches(&mut self, now: Instant) {
        let mut batches = std::mem::take(&mut self.batches);
        for batch in &mut batches {
            while !self.queues.contains_key(batch.key())
                && self.limiter.time_until_allowed_at(batch.key(), now).is_zero()
            {
                let Some((id, descriptor, callback)) = batch.pop_next() else {
                    break;
                };
                if let Err(err) = self.enqueue(id, descriptor, callback, now) {
                    batch.deliver(id, Err(err));
                    self.delivered += 1;
                }
            }
        }
        batches.retain(|batch| !batch.is_empty());
        self.batches = batches;
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    fn dispatch(&mut self, id: RequestId) {
        let Some(ctx) = self.contexts.get_mut(&id) else {
            return;
        };
        ctx.attempts += 1;

        let mut headers = ctx.descriptor.headers.clone();
        headers.merge_defaults(&self.options.default_headers);
        if !headers.contains("cookie") {
            if let Some(cookie) = self.cookies.header_for(&ctx.url) {
                headers.insert("Cookie", cookie);
            }
        }

        let request = PreparedRequest {
            id,
            attempt: ctx.attempts,
            method: ctx.method.clone(),
            url: ctx.url.clone(),
            headers,
            body: ctx.descriptor.body.clone(),
            timeout: ctx.timeout,
            proxy: ctx.proxy.clone(),
            max_redirects: ctx.max_redirects,
            connect_timeout: ctx.connect_timeout,
        };
        debug!(
            request_id = %id,
            key = %ctx.key,
            attempt = ctx.attempts,
            method = %ctx.method,
            url = %ctx.url,
            "Dispatching request"
        );

        let timeout = ctx.timeout;
        let future = self.backend.execute(request);
        let completions = self.completions.clone();
        let panic_completions = self.completions.clone();
        let spawned = self.worker.spawn_supervised(
            async move {
                let result = match tokio::time::timeout(timeout, future).await {
                    Ok(result) => result,
                    Err(_) => Err(NetError::transport(
                        TransportError::TimedOut,
                        format!("no response within {} ms", timeout.as_millis()),
                    )),
                };
                completions.push(Completion { id, result });
            },
            move |err| panic_completions.push(Completion { id, result: Err(err) }),
        );

        match spawned {
            Ok(abort) => ctx.phase = Phase::InFlight { abort },
            Err(err) => {
                if let Some(ctx) = self.contexts.remove(&id) {
                    self.finish(ctx, Err(err));
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion, now: Instant) {
        let id = completion.id;
        let Some(ctx) = self.contexts.get_mut(&id) else {
            trace!(request_id = %id, "Ignoring result for finished request");
            return;
        };
        if !ctx.is_in_flight() {
            trace!(request_id = %id, "Ignoring stale result");
            return;
        }

        let outcome = match completion.result {
            Ok(mut response) => {
                let set_cookies = response.headers.get_all("set-cookie");
                if !set_cookies.is_empty() {
                    self.cookies.store_response(&ctx.url, set_cookies);
                }
                if ctx.descriptor.is_success_status(response.status) {
                    response.attempts = ctx.attempts;
                    Ok(response)
                } else {
                    let hint = retry_after_hint(&response);
                    Err((NetError::Http { status: response.status }, hint))
                }
            }
            Err(err) => Err((err, None)),
        };

        match outcome {
            Ok(response) => {
                if let Some(ctx) = self.contexts.remove(&id) {
                    self.finish(ctx, Ok(response));
                }
            }
            Err((err, hint)) => {
                let retry_at = if !self.shutting_down && ctx.can_retry(&err) {
                    let mut delay = ctx.retry.next_delay(ctx.attempts, ctx.prev_delay);
                    if let Some(hint) = hint {
                        // The server may ask for longer than the policy allows.
                        delay = std::cmp::max(delay, std::cmp::min(hint, ctx.retry.max_delay));
                    }
                    now.checked_add(delay).map(|ready_at| (ready_at, delay))
                } else {
                    None
                };
                if let Some((ready_at, delay)) = retry_at {
                    info!(
                        request_id = %id,
                        attempt = ctx.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying request"
                    );
                    ctx.prev_delay = delay;
                    ctx.last_error = Some(err);
                    ctx.phase = Phase::Retrying { ready_at };
                    self.retries.insert((ready_at, id));
                } else if let Some(ctx) = self.contexts.remove(&id) {
                    self.finish(ctx, Err(err));
                }
            }
        }
    }

    fn finish(&mut self, ctx: RequestContext, result: Result<ResponseRecord, NetError>) {
        match &result {
            Ok(response) => debug!(
                request_id = %ctx.id,
                status = response.status,
                attempts = response.attempts,
                latency_ms = response.latency.as_millis() as u64,
                "Request completed"
            ),
            Err(err) if *err == NetError::cancelled() => {
                debug!(request_id = %ctx.id, "Request cancelled")
            }
            Err(err) => warn!(
                request_id = %ctx.id,
                attempts = ctx.attempts,
                error = %err,
                "Request failed"
            ),
        }
        self.delivered += 1;
        ctx.complete(result);
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let retry = self.retries.first().map(|(at, _)| *at);
        let queued = self.queues.values().map(|queue| queue.not_before).min();
        match (retry, queued) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Validated descriptor with manager defaults applied.
struct Resolved {
    method: reqwest::Method,
    url: reqwest::Url,
    key: String,
    timeout: Duration,
    retry: RetryPolicy,
    proxy: Option<Arc<ProxyConfig>>,
    max_redirects: usize,
    connect_timeout: Option<Duration>,
}

/// `Retry-After` of a 429 or 503 response: delay-seconds or an HTTP-date.
fn retry_after_hint(response: &ResponseRecord) -> Option<Duration> {
    if response.status != 429 && response.status != 503 {
        return None;
    }
    parse_retry_after(response.headers.get("retry-after")?, SystemTime::now())
}

pub(crate) fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    value.parse::<u64>().map(Duration::from_secs).ok().or_else(|| {
        httpdate::parse_http_date(value)
            .ok()
            // a date in the past means "now"
            .map(|at| at.duration_since(now).unwrap_or(Duration::ZERO))
    })
}

// =============================================================================
// TASK MANAGER
// =============================================================================

impl TaskManager for HttpRequestManager {
    type Descriptor = RequestDescriptor;
    type Callback = HttpCallback;
    type Id = RequestId;

    fn submit(&mut self, descriptor: RequestDescriptor, callback: HttpCallback) -> Result<RequestId, NetError> {
        self.submit_at(descriptor, callback, Instant::now())
    }

    fn tick(&mut self) -> Result<usize, NetError> {
        self.tick_at(Instant::now())
    }

    fn tick_timeout(&mut self, timeout: Duration) -> Result<usize, NetError> {
        let before = self.delivered;
        let now = Instant::now();
        if self.completions.is_empty() {
            let wait = match self.next_wakeup() {
                Some(at) => std::cmp::min(timeout, at.saturating_duration_since(now)),
                None => timeout,
            };
            if !wait.is_zero() {
                if let Some(completion) = self.completions.pop_blocking(wait) {
                    self.handle_completion(completion, Instant::now());
                }
            }
        }
        self.tick_at(Instant::now())?;
        Ok(self.delivered - before)
    }

    fn shutdown(&mut self, grace: Duration) {
        self.shutting_down = true;
        info!(
            in_flight = self.in_flight(),
            waiting = self.waiting(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down HTTP manager"
        );

        for mut batch in std::mem::take(&mut self.batches) {
            self.delivered += batch.cancel_all();
        }
        self.queues.clear();
        self.retries.clear();
        let undispatched: Vec<RequestId> = self
            .contexts
            .iter()
            .filter(|(_, ctx)| !ctx.is_in_flight())
            .map(|(id, _)| *id)
            .collect();
        for id in undispatched {
            if let Some(ctx) = self.contexts.remove(&id) {
                self.finish(ctx, Err(NetError::cancelled()));
            }
        }

        let deadline = Instant::now() + grace;
        while !self.contexts.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.completions.pop_blocking(deadline - now) {
                Some(completion) => self.handle_completion(completion, now),
                None => break,
            }
        }

        let remaining: Vec<RequestContext> = self.contexts.drain().map(|(_, ctx)| ctx).collect();
        for ctx in remaining {
            ctx.abort();
            self.finish(ctx, Err(NetError::timeout()));
        }
    }

    fn is_loaded(&self) -> bool {
        !self.contexts.is_empty() || self.batches.iter().any(|batch| !batch.is_empty())
    }
}

impl Drop for HttpRequestManager {
    fn drop(&mut self) {
        if self.is_loaded() {
            self.shutdown(Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::backend::scripted::{ScriptedBackend, Step};
    use crate::http::backend::BackendFuture;
    use crate::types::config::RateLimitData;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<(RequestId, Result<ResponseRecord, NetError>)>>>;

    fn worker() -> Arc<NetworkWorker> {
        Arc::new(NetworkWorker::new(2).unwrap())
    }

    fn manager_with(backend: Arc<dyn HttpBackend>, limiter: Arc<RateLimiter>, options: HttpOptions) -> HttpRequestManager {
        HttpRequestManager::new(worker(), backend, limiter, options)
    }

    fn manager(backend: Arc<ScriptedBackend>) -> HttpRequestManager {
        manager_with(backend, Arc::new(RateLimiter::new()), HttpOptions::default())
    }

    fn submit(manager: &mut HttpRequestManager, log: &Log, descriptor: RequestDescriptor, now: Instant) -> RequestId {
        let sink = log.clone();
        let slot = Arc::new(Mutex::new(None::<RequestId>));
        let slot_in = slot.clone();
        let id = manager
            .submit_at(
                descriptor,
                Box::new(move |result| {
                    let id = slot_in.lock().unwrap().unwrap_or(RequestId(0));
                    sink.lock().unwrap().push((id, result));
                }),
                now,
            )
            .unwrap();
        *slot.lock().unwrap() = Some(id);
        id
    }

    /// Tick at a fixed fake time until nothing is in flight.
    fn settle(manager: &mut HttpRequestManager, now: Instant) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            manager.tick_at(now).unwrap();
            if manager.in_flight() == 0 || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn get(url: &str) -> RequestDescriptor {
        RequestDescriptor::get(url)
    }

    #[test]
    fn test_rate_limited_requests_dispatch_in_later_windows() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.set_limit("X", RateLimitData::per_second(2));
        let backend = ScriptedBackend::ok();
        let mut manager = manager_with(backend.clone(), limiter, HttpOptions::default());
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let t0 = Instant::now();
        let ids: Vec<RequestId> = (0..5)
            .map(|i| submit(&mut manager, &log, get(&format!("http://x.test/{i}")).rate_limit_key("X"), t0))
            .collect();
        assert_eq!(backend.call_count(), 2);

        manager.tick_at(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(backend.call_count(), 2);
        manager.tick_at(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(backend.call_count(), 4);
        manager.tick_at(t0 + Duration::from_millis(1_500)).unwrap();
        assert_eq!(backend.call_count(), 4);
        manager.tick_at(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(backend.call_count(), 5);

        let dispatched: Vec<RequestId> = backend.calls().iter().map(|c| c.id).collect();
        assert_eq!(dispatched, ids);

        settle(&mut manager, t0 + Duration::from_secs(2));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 5);
        for (_, result) in log.iter() {
            assert_eq!(result.as_ref().unwrap().status, 200);
        }
        assert!(!manager.is_loaded());
    }

    #[test]
    fn test_retry_with_exponential_backoff() {
        let backend = ScriptedBackend::new(|req| match req.attempt {
            1 => Step::status(503),
            2 => Step::fail(NetError::transport(TransportError::ConnectionReset, "reset")),
            _ => Step::status(200),
        });
        let options = HttpOptions {
            retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), Arc::new(RateLimiter::new()), options);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let t0 = Instant::now();
        submit(&mut manager, &log, get("http://api.test/"), t0);
        settle(&mut manager, t0);
        assert_eq!(backend.call_count(), 1);

        manager.tick_at(t0 + Duration::from_millis(99)).unwrap();
        assert_eq!(backend.call_count(), 1);
        manager.tick_at(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(backend.call_count(), 2);
        settle(&mut manager, t0 + Duration::from_millis(100));

        manager.tick_at(t0 + Duration::from_millis(299)).unwrap();
        assert_eq!(backend.call_count(), 2);
        manager.tick_at(t0 + Duration::from_millis(300)).unwrap();
        assert_eq!(backend.call_count(), 3);
        settle(&mut manager, t0 + Duration::from_millis(300));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        let response = log[0].1.as_ref().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.attempts, 3);
    }

    #[test]
    fn test_retry_after_raises_delay() {
        let backend = ScriptedBackend::new(|req| match req.attempt {
            1 => Step::status(429).header("Retry-After", "2"),
            _ => Step::status(200),
        });
        let options = HttpOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(5)),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), Arc::new(RateLimiter::new()), options);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let t0 = Instant::now();
        submit(&mut manager, &log, get("http://api.test/"), t0);
        settle(&mut manager, t0);
        manager.tick_at(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(backend.call_count(), 1);
        manager.tick_at(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn test_retry_after_capped_at_max_delay() {
        let backend = ScriptedBackend::new(|req| match req.attempt {
            1 => Step::status(429).header("Retry-After", "86400"),
            _ => Step::status(200),
        });
        let options = HttpOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1)),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), Arc::new(RateLimiter::new()), options);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let t0 = Instant::now();
        submit(&mut manager, &log, get("http://api.test/"), t0);
        settle(&mut manager, t0);
        manager.tick_at(t0 + Duration::from_millis(999)).unwrap();
        assert_eq!(backend.call_count(), 1);
        manager.tick_at(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(backend.call_count(), 2);
        settle(&mut manager, t0 + Duration::from_secs(1));
        assert_eq!(log.lock().unwrap()[0].1.as_ref().unwrap().status, 200);
    }

    #[test]
    fn test_huge_retry_after_does_not_overflow() {
        let backend = ScriptedBackend::new(|_| Step::status(503).header("Retry-After", "18446744073709551615"));
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let t0 = Instant::now();

        // Clamped to the policy cap.
        let options = HttpOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1)),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), Arc::new(RateLimiter::new()), options);
        submit(&mut manager, &log, get("http://api.test/"), t0);
        settle(&mut manager, t0);
        manager.tick_at(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(backend.call_count(), 2);
        settle(&mut manager, t0 + Duration::from_secs(1));

        // An unrepresentable retry time ends the request with its last error.
        let backend = ScriptedBackend::new(|_| Step::status(503).header("Retry-After", "18446744073709551615"));
        let options = HttpOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(100), Duration::MAX),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), Arc::new(RateLimiter::new()), options);
        submit(&mut manager, &log, get("http://api.test/"), t0);
        settle(&mut manager, t0);
        assert_eq!(backend.call_count(), 1);
        assert!(!manager.is_loaded());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        for (_, result) in log.iter() {
            assert_eq!(result.as_ref().unwrap_err(), &NetError::Http { status: 503 });
        }
    }

    #[test]
    fn test_exhausted_retries_report_last_error_once() {
        let backend = ScriptedBackend::new(|_| Step::status(500));
        let options = HttpOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10)),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), Arc::new(RateLimiter::new()), options);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let t0 = Instant::now();
        submit(&mut manager, &log, get("http://api.test/"), t0);
        settle(&mut manager, t0);
        manager.tick_at(t0 + Duration::from_millis(10)).unwrap();
        settle(&mut manager, t0 + Duration::from_millis(10));
        manager.tick_at(t0 + Duration::from_secs(10)).unwrap();

        assert_eq!(backend.call_count(), 2);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1.as_ref().unwrap_err(), &NetError::Http { status: 500 });
    }

    #[test]
    fn test_non_retryable_status_and_valid_status() {
        let backend = ScriptedBackend::new(|_| Step::status(404));
        let options = HttpOptions {
            retry: RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(10)),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), Arc::new(RateLimiter::new()), options);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let t0 = Instant::now();
        submit(&mut manager, &log, get("http://api.test/missing"), t0);
        submit(&mut manager, &log, get("http://api.test/optional").valid_status(404), t0);
        settle(&mut manager, t0);

        assert_eq!(backend.call_count(), 2);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        let failed = log.iter().filter(|(_, r)| r.is_err()).count();
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_validation_errors() {
        let backend = ScriptedBackend::ok();
        let mut manager = manager(backend.clone());
        let now = Instant::now();

        let err = manager.submit_at(get("not a url"), Box::new(|_| panic!("called")), now).unwrap_err();
        assert!(matches!(err, NetError::Client(ClientError::MalformedRequest(_))));

        let err = manager
            .submit_at(RequestDescriptor::new("GE T", "http://a.test/"), Box::new(|_| panic!("called")), now)
            .unwrap_err();
        assert!(matches!(err, NetError::Client(ClientError::MalformedRequest(_))));

        let err = manager
            .submit_at(get("http://a.test/").rate_limit_key(""), Box::new(|_| panic!("called")), now)
            .unwrap_err();
        assert_eq!(err, NetError::Client(ClientError::RateLimitKeyMissing));

        assert_eq!(backend.call_count(), 0);
        assert!(!manager.is_loaded());
    }

    #[test]
    fn test_base_url_default_headers_and_key() {
        let backend = ScriptedBackend::ok();
        let limiter = Arc::new(RateLimiter::new());
        let options = HttpOptions {
            base_url: Some(reqwest::Url::parse("https://api.example.com/v1/").unwrap()),
            default_headers: [("User-Agent", "net-engine"), ("Accept", "*/*")].into_iter().collect(),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), limiter.clone(), options);
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        submit(&mut manager, &log, get("orders?limit=5").header("accept", "application/json"), Instant::now());
        let call = &backend.calls()[0];
        assert_eq!(call.url.as_str(), "https://api.example.com/v1/orders?limit=5");
        assert_eq!(call.headers.get("user-agent"), Some("net-engine"));
        assert_eq!(call.headers.get_all("Accept"), &["application/json".to_string()]);
        assert_eq!(call.timeout, Duration::from_secs(30));

        limiter.set_limit("api.example.com", RateLimitData::per_second(1));
        let t = Instant::now();
        submit(&mut manager, &log, get("a"), t);
        submit(&mut manager, &log, get("b"), t);
        assert_eq!(backend.call_count(), 2);
        assert_eq!(manager.waiting(), 1);
    }

    #[test]
    fn test_redirect_and_connect_timeout_settings() {
        let backend = ScriptedBackend::ok();
        let options = HttpOptions {
            max_redirects: 4,
            connect_timeout: Some(Duration::from_secs(2)),
            ..HttpOptions::default()
        };
        let mut manager = manager_with(backend.clone(), Arc::new(RateLimiter::new()), options);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        submit(&mut manager, &log, get("http://r.test/default"), now);
        submit(&mut manager, &log, get("http://r.test/off").follow_redirects(false).max_redirects(7), now);
        submit(
            &mut manager,
            &log,
            get("http://r.test/own").max_redirects(1).connect_timeout(Duration::from_millis(500)),
            now,
        );
        submit(&mut manager, &log, get("http://r.test/on").follow_redirects(true), now);

        let calls = backend.calls();
        assert_eq!(calls[0].max_redirects, 4);
        assert_eq!(calls[0].connect_timeout, Some(Duration::from_secs(2)));
        assert_eq!(calls[1].max_redirects, 0);
        assert_eq!(calls[2].max_redirects, 1);
        assert_eq!(calls[2].connect_timeout, Some(Duration::from_millis(500)));
        assert_eq!(calls[3].max_redirects, DEFAULT_MAX_REDIRECTS);
        assert_eq!(calls[1].profile().max_redirects, 0);
        settle(&mut manager, now);
    }

    #[test]
    fn test_cookies_stored_and_sent() {
        let backend = ScriptedBackend::new(|req| {
            if req.url.path() == "/login" {
                Step::status(200).header("Set-Cookie", "sid=abc; Path=/")
            } else {
                Step::status(200)
            }
        });
        let mut manager = manager(backend.clone());
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let t0 = Instant::now();
        submit(&mut manager, &log, get("https://site.test/login"), t0);
        settle(&mut manager, t0);
        assert_eq!(manager.cookies().len(), 1);

        submit(&mut manager, &log, get("https://site.test/account"), t0);
        submit(&mut manager, &log, get("https://site.test/raw").header("Cookie", "mine=1"), t0);
        let calls = backend.calls();
        assert_eq!(calls[1].headers.get("cookie"), Some("sid=abc"));
        assert_eq!(calls[2].headers.get("cookie"), Some("mine=1"));
    }

    #[test]
    fn test_cancel_queued_and_in_flight() {
        let backend = ScriptedBackend::new(|_| Step::status(200).after(Duration::from_secs(60)));
        let limiter = Arc::new(RateLimiter::new());
        limiter.set_limit("slow", RateLimitData::per_second(1));
        let mut manager = manager_with(backend.clone(), limiter, HttpOptions::default());
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let t0 = Instant::now();
        let running = submit(&mut manager, &log, get("http://slow.test/1").rate_limit_key("slow"), t0);
        let queued = submit(&mut manager, &log, get("http://slow.test/2").rate_limit_key("slow"), t0);
        assert_eq!(manager.in_flight(), 1);

        manager.cancel(queued).unwrap();
        manager.cancel(running).unwrap();
        {
            let log = log.lock().unwrap();
            let ids: Vec<RequestId> = log.iter().map(|(id, _)| *id).collect();
            assert_eq!(ids, vec![queued, running]);
            assert!(log.iter().all(|(_, r)| r.as_ref().unwrap_err() == &NetError::cancelled()));
        }

        manager.tick_at(t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(backend.call_count(), 1);
        assert!(!manager.is_loaded());
        assert_eq!(
            manager.cancel(running).unwrap_err(),
            NetError::Client(ClientError::UnknownId(running.0))
        );
    }

    #[test]
    fn test_shutdown_cancels_queued_and_times_out_stragglers() {
        let backend = ScriptedBackend::new(|req| match req.id.0 {
            1 => Step::status(200).after(Duration::from_millis(50)),
            _ => Step::status(200).after(Duration::from_secs(60)),
        });
        let limiter = Arc::new(RateLimiter::new());
        limiter.set_limit("X", RateLimitData::per_second(2));
        let mut manager = manager_with(backend.clone(), limiter, HttpOptions::default());
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let now = Instant::now();
        let fast = submit(&mut manager, &log, get("http://x.test/fast").rate_limit_key("X"), now);
        let hung = submit(&mut manager, &log, get("http://x.test/hung").rate_limit_key("X"), now);
        let queued = submit(&mut manager, &log, get("http://x.test/queued").rate_limit_key("X"), now);
        assert_eq!(manager.in_flight(), 2);

        let started = Instant::now();
        manager.shutdown(Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].0, queued);
        assert_eq!(log[0].1.as_ref().unwrap_err(), &NetError::cancelled());
        let outcome = |id: RequestId| log.iter().find(|(i, _)| *i == id).map(|(_, r)| r.clone()).unwrap();
        assert_eq!(outcome(fast).unwrap().status, 200);
        assert_eq!(outcome(hung).unwrap_err(), NetError::timeout());

        assert_eq!(
            manager.submit_at(get("http://x.test/late"), Box::new(|_| {}), Instant::now()).unwrap_err(),
            NetError::Client(ClientError::ShuttingDown)
        );
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn test_tick_timeout_waits_for_completion() {
        let backend = ScriptedBackend::new(|_| Step::status(200).after(Duration::from_millis(20)));
        let mut manager = manager(backend);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        submit(&mut manager, &log, get("http://api.test/"), Instant::now());

        let delivered = manager.tick_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_request_timeout_is_transport_error() {
        let backend = ScriptedBackend::new(|_| Step::status(200).after(Duration::from_secs(60)));
        let mut manager = manager(backend);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        submit(
            &mut manager,
            &log,
            get("http://api.test/").timeout(Duration::from_millis(20)),
            Instant::now(),
        );

        let delivered = manager.tick_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivered, 1);
        let log = log.lock().unwrap();
        match log[0].1.as_ref().unwrap_err() {
            NetError::Transport { kind, .. } => assert_eq!(*kind, TransportError::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
    }

    struct PanickingBackend;

    impl HttpBackend for PanickingBackend {
        fn execute(&self, _request: PreparedRequest) -> BackendFuture {
            Box::pin(async { panic!("backend exploded") })
        }
    }

    #[test]
    fn test_worker_panic_is_fatal() {
        let mut manager = manager_with(Arc::new(PanickingBackend), Arc::new(RateLimiter::new()), HttpOptions::default());
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        submit(&mut manager, &log, get("http://api.test/"), Instant::now());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut outcome = Ok(0);
        while log.lock().unwrap().is_empty() && Instant::now() < deadline {
            outcome = manager.tick_timeout(Duration::from_millis(50));
        }
        let fatal = NetError::Client(ClientError::FatalWorker("backend exploded".to_string()));
        assert_eq!(outcome.unwrap_err(), fatal);
        assert_eq!(log.lock().unwrap()[0].1.as_ref().unwrap_err(), &fatal);
        assert_eq!(
            manager.submit_at(get("http://api.test/"), Box::new(|_| {}), Instant::now()).unwrap_err(),
            fatal
        );
    }

    #[test]
    fn test_parse_retry_after() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }
}
