//! Per-host cookie jar kept by the HTTP manager.
//!
//! The jar is only touched on the consumer thread: responses update it
//! inside `tick()`, and outgoing requests read it when they are dispatched.
//! Parsing, domain/path matching and expiry come from `cookie_store`.

use cookie_store::CookieStore;
use reqwest::Url;
use tracing::trace;

#[derive(Debug, Default)]
pub struct CookieJar {
    store: CookieStore,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store every `Set-Cookie` value received for `url`. A cookie that is
    /// already expired deletes its stored counterpart.
    pub fn store_response(&mut self, url: &Url, set_cookies: &[String]) {
        for header in set_cookies {
            if let Err(e) = self.store.parse(header, url) {
                trace!(url = %url, header = %header, error = %e, "Ignoring invalid Set-Cookie");
            }
        }
    }

    /// `Cookie` header value for a request to `url`.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let value = self
            .store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        (!value.is_empty()).then_some(value)
    }

    /// Drop expired cookies. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let expired = self.store.iter_any().count() - self.store.iter_unexpired().count();
        if expired == 0 {
            return 0;
        }
        let live = self.store.iter_unexpired().cloned().map(Ok::<_, ()>);
        if let Ok(store) = CookieStore::from_cookies(live, false) {
            self.store = store;
        }
        expired
    }

    /// Unexpired cookies in the jar.
    pub fn len(&self) -> usize {
        self.store.iter_unexpired().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.store.clear();
    }

    pub fn store(&self) -> &CookieStore {
        &self.store
    }
}
