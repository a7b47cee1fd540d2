use std::time::Duration;

use crate::error::NetError;

/// Contract shared by the HTTP and WebSocket managers.
///
/// Work is handed over with `submit` and runs on the network worker. Its
/// results only reach callers from inside `tick`, on the thread that calls
/// it, so callbacks never race with each other or with manager state.
pub trait TaskManager {
    type Descriptor;
    type Callback;
    type Id: Copy;

    /// Validate and schedule work. A rejected submission returns the error
    /// and its callback is never invoked.
    fn submit(&mut self, descriptor: Self::Descriptor, callback: Self::Callback) -> Result<Self::Id, NetError>;

    /// Deliver pending results and advance deferred work. Returns the number
    /// of callbacks invoked, or `FatalWorker` once the worker has failed.
    fn tick(&mut self) -> Result<usize, NetError>;

    /// Like `tick`, but waits up to `timeout` for a result when none is ready.
    fn tick_timeout(&mut self, timeout: Duration) -> Result<usize, NetError>;

    /// Stop accepting work and settle everything outstanding within `grace`.
    fn shutdown(&mut self, grace: Duration);

    /// Whether any submitted work has not reached its terminal callback yet.
    fn is_loaded(&self) -> bool;
}
