//! Bulk submission paced by one rate-limit key.
//!
//! A batch is parked inside the manager and fed one descriptor at a time,
//! only when the limiter reports that its key would admit right now. The
//! caller's order is kept; nothing in a batch ever waits in a key queue
//! ahead of another request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::NetError;
use crate::http::context::HttpCallback;
use crate::types::request::{RequestDescriptor, RequestId, ResponseRecord};

pub type BatchCallback = Box<dyn FnMut(RequestId, Result<ResponseRecord, NetError>) + Send>;

pub struct BatchRequestHandler {
    key: String,
    pending: VecDeque<(RequestId, RequestDescriptor)>,
    callback: Arc<Mutex<BatchCallback>>,
}

impl BatchRequestHandler {
    pub(crate) fn new(key: String, items: Vec<(RequestId, RequestDescriptor)>, callback: BatchCallback) -> Self {
        Self {
            key,
            pending: items.into(),
            callback: Arc::new(Mutex::new(callback)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Descriptors not yet handed to the manager.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.iter().any(|(pending, _)| *pending == id)
    }

    /// Next descriptor in caller order, with a callback routed to the batch.
    pub(crate) fn pop_next(&mut self) -> Option<(RequestId, RequestDescriptor, HttpCallback)> {
        let (id, descriptor) = self.pending.pop_front()?;
        Some((id, descriptor, self.callback_for(id)))
    }

    fn callback_for(&self, id: RequestId) -> HttpCallback {
        let shared = self.callback.clone();
        Box::new(move |result| {
            let mut callback = shared.lock().unwrap_or_else(PoisonError::into_inner);
            (*callback)(id, result);
        })
    }

    pub(crate) fn deliver(&self, id: RequestId, result: Result<ResponseRecord, NetError>) {
        self.callback_for(id)(result);
    }

    /// Drop a not-yet-fed descriptor and report it cancelled.
    pub(crate) fn cancel(&mut self, id: RequestId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|(pending, _)| *pending != id);
        if self.pending.len() == before {
            return false;
        }
        self.deliver(id, Err(NetError::cancelled()));
        true
    }

    /// Report every remaining descriptor cancelled. Returns how many.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let ids: Vec<RequestId> = self.pending.drain(..).map(|(id, _)| id).collect();
        for id in &ids {
            self.deliver(*id, Err(NetError::cancelled()));
        }
        ids.len()
    }
}
