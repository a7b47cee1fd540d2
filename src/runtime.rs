//! Process-wide setup: logging, the shared network worker and rate limiter.
//!
//! Nothing is created implicitly. `init` builds the worker and limiter once;
//! later calls are no-ops until `teardown` releases them. Managers built
//! with `from_config` pick them up through `shared_worker` and
//! `shared_limiter`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::core::{NetworkWorker, RateLimiter};
use crate::error::{ClientError, NetError};
use crate::types::config::EngineConfig;

struct Shared {
    worker: Arc<NetworkWorker>,
    limiter: Arc<RateLimiter>,
    grace: Duration,
}

static STATE: Mutex<Option<Shared>> = Mutex::new(None);

fn state() -> MutexGuard<'static, Option<Shared>> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install logging and start the shared worker. Idempotent.
pub fn init(config: &EngineConfig) -> Result<(), NetError> {
    init_logging(config.log_filter());

    let mut state = state();
    if state.is_some() {
        debug!("Network runtime already initialized");
        return Ok(());
    }

    let worker = Arc::new(NetworkWorker::new(config.worker_threads())?);
    let limiter = Arc::new(build_limiter(config));
    info!(
        threads = config.worker_threads(),
        keys = config.key_rate_limits.len(),
        "Network runtime initialized"
    );
    *state = Some(Shared {
        worker,
        limiter,
        grace: config.shutdown_grace(),
    });
    Ok(())
}

/// Initialize tracing subscriber (only once, ignore error if already init).
/// `RUST_LOG` wins over `filter`.
pub fn init_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .try_init();
}

/// Limiter with the general, default per-key and explicit key limits of `config`.
pub fn build_limiter(config: &EngineConfig) -> RateLimiter {
    let limiter = RateLimiter::new();
    if let Some(general) = config.general_rate_limit {
        limiter.set_general(general);
    }
    limiter.set_default_per_key(config.per_key_rate_limit);
    for (key, limit) in &config.key_rate_limits {
        limiter.set_limit(key, *limit);
    }
    limiter
}

/// Stop the shared worker, waiting up to the configured grace period.
///
/// Must not be called from inside the worker's runtime.
pub fn teardown() {
    let shared = state().take();
    if let Some(shared) = shared {
        info!(grace_ms = shared.grace.as_millis() as u64, "Tearing down network runtime");
        shared.worker.shutdown(shared.grace);
    }
}

pub fn is_initialized() -> bool {
    state().is_some()
}

pub fn shared_worker() -> Result<Arc<NetworkWorker>, NetError> {
    state()
        .as_ref()
        .map(|shared| shared.worker.clone())
        .ok_or_else(|| ClientError::NotInitialized.into())
}

pub fn shared_limiter() -> Result<Arc<RateLimiter>, NetError> {
    state()
        .as_ref()
        .map(|shared| shared.limiter.clone())
        .ok_or_else(|| ClientError::NotInitialized.into())
}
