//! Admission control shared by both managers.
//!
//! DESIGN
//! ======
//! Every limit is a sliding permit log: a `VecDeque<Instant>` of the permits
//! granted inside the last window. The window starts at the oldest live
//! permit, so at most `ceiling` permits exist in any window-length interval.
//!
//! A request passes only if the general limit and the limit of its key both
//! have room. Both logs are checked and updated under one lock, so a permit is
//! never taken from one limit without the other. Denial is a query: the caller
//! gets `retry_after` and re-queues; nothing is held.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::types::config::RateLimitData;

/// Outcome of [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Permit,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_permit(&self) -> bool {
        matches!(self, Admission::Permit)
    }
}

/// Permit log for one limit.
#[derive(Debug, Clone)]
pub struct LimitData {
    ceiling: u32,
    window: Duration,
    log: VecDeque<Instant>,
    /// Created from the default per-key limit rather than set explicitly.
    implicit: bool,
}

impl LimitData {
    pub fn new(limit: RateLimitData) -> Self {
        Self {
            ceiling: limit.ceiling,
            window: limit.window(),
            log: VecDeque::new(),
            implicit: false,
        }
    }

    fn unlimited() -> Self {
        Self::new(RateLimitData::unlimited())
    }

    pub fn is_unlimited(&self) -> bool {
        self.ceiling == 0 || self.window.is_zero()
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Permits granted in the current window.
    pub fn permits_consumed(&self) -> usize {
        self.log.len()
    }

    pub fn window_start(&self) -> Option<Instant> {
        self.log.front().copied()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.log.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until one more permit fits. Call after `expire`.
    fn wait_time(&self, now: Instant) -> Duration {
        let ceiling = self.ceiling as usize;
        if self.is_unlimited() || self.log.len() < ceiling {
            return Duration::ZERO;
        }
        // The permit whose expiry frees the slot we need.
        let blocking = self.log[self.log.len() - ceiling];
        (blocking + self.window).saturating_duration_since(now)
    }

    fn record(&mut self, now: Instant) {
        if !self.is_unlimited() {
            self.log.push_back(now);
        }
    }

    /// Swap in a new ceiling/window, keeping the permits already granted.
    fn reconfigure(&mut self, limit: RateLimitData) {
        self.ceiling = limit.ceiling;
        self.window = limit.window();
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

struct Limits {
    general: LimitData,
    /// Installed lazily the first time an unknown key is admitted.
    default_per_key: Option<RateLimitData>,
    keys: HashMap<String, LimitData>,
}

impl Limits {
    fn specific(&mut self, key: &str) -> Option<&mut LimitData> {
        if !self.keys.contains_key(key) {
            let mut limit = LimitData::new(self.default_per_key?);
            limit.implicit = true;
            self.keys.insert(key.to_string(), limit);
        }
        self.keys.get_mut(key)
    }

    /// Forget implicit keys with no live permits; they would be recreated
    /// identical on next use.
    fn prune_idle(&mut self, now: Instant) {
        self.keys.retain(|_, limit| {
            if !limit.implicit {
                return true;
            }
            limit.expire(now);
            !limit.log.is_empty()
        });
    }
}

pub struct RateLimiter {
    inner: Mutex<Limits>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// A limiter with no general ceiling and no per-key limits.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Limits {
                general: LimitData::unlimited(),
                default_per_key: None,
                keys: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Limits> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_general(&self, limit: RateLimitData) {
        self.lock().general.reconfigure(limit);
    }

    /// Limit applied to any key without an explicit one. Keys already seen
    /// keep the limit they were given.
    pub fn set_default_per_key(&self, limit: Option<RateLimitData>) {
        self.lock().default_per_key = limit;
    }

    pub fn set_limit(&self, key: &str, limit: RateLimitData) {
        let mut limits = self.lock();
        match limits.keys.get_mut(key) {
            Some(existing) => {
                existing.reconfigure(limit);
                existing.implicit = false;
            }
            None => {
                limits.keys.insert(key.to_string(), LimitData::new(limit));
            }
        }
    }

    pub fn remove_limit(&self, key: &str) -> bool {
        self.lock().keys.remove(key).is_some()
    }

    pub fn has_limit(&self, key: &str) -> bool {
        self.lock().keys.contains_key(key)
    }

    pub fn try_acquire(&self, key: &str) -> Admission {
        self.try_acquire_at(key, Instant::now())
    }

    /// Admission check with an explicit timestamp (for testing).
    pub fn try_acquire_at(&self, key: &str, now: Instant) -> Admission {
        let mut limits = self.lock();
        limits.prune_idle(now);
        limits.general.expire(now);
        let general_wait = limits.general.wait_time(now);

        let specific_wait = match limits.specific(key) {
            Some(limit) => {
                limit.expire(now);
                limit.wait_time(now)
            }
            None => Duration::ZERO,
        };

        let retry_after = std::cmp::max(general_wait, specific_wait);
        if !retry_after.is_zero() {
            trace!(key, retry_after_ms = retry_after.as_millis() as u64, "Admission denied");
            return Admission::Denied { retry_after };
        }

        limits.general.record(now);
        if let Some(limit) = limits.specific(key) {
            limit.record(now);
        }
        Admission::Permit
    }

    pub fn time_until_allowed(&self, key: &str) -> Duration {
        self.time_until_allowed_at(key, Instant::now())
    }

    /// How long until `try_acquire(key)` would admit. Consumes nothing.
    pub fn time_until_allowed_at(&self, key: &str, now: Instant) -> Duration {
        let mut limits = self.lock();
        limits.general.expire(now);
        let general_wait = limits.general.wait_time(now);
        let specific_wait = match limits.keys.get_mut(key) {
            Some(limit) => {
                limit.expire(now);
                limit.wait_time(now)
            }
            None => Duration::ZERO,
        };
        std::cmp::max(general_wait, specific_wait)
    }

    pub fn time_until_any_allows(&self) -> Duration {
        self.time_until_any_allows_at(Instant::now())
    }

    /// Shortest wait until some key would be admitted.
    pub fn time_until_any_allows_at(&self, now: Instant) -> Duration {
        let mut limits = self.lock();
        limits.general.expire(now);
        let general_wait = limits.general.wait_time(now);

        // A key never seen before passes its specific check at once.
        let mut shortest = Duration::ZERO;
        if limits.default_per_key.is_none() && !limits.keys.is_empty() {
            shortest = Duration::MAX;
            for limit in limits.keys.values_mut() {
                limit.expire(now);
                shortest = std::cmp::min(shortest, limit.wait_time(now));
            }
        }
        std::cmp::max(general_wait, shortest)
    }

    /// Permits consumed in the current window of `key`, if it has a limit.
    pub fn permits_consumed(&self, key: &str) -> Option<usize> {
        self.lock().keys.get(key).map(LimitData::permits_consumed)
    }
}
