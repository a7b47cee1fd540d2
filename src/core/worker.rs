//! Background I/O threads.
//!
//! A `NetworkWorker` owns a multi-thread tokio runtime with a fixed number
//! of named threads. Managers spawn transport futures on it; results travel
//! back through an `EventQueue`. A panicking task marks the worker failed and
//! its `on_panic` hook still produces a terminal event for the affected
//! request or connection.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::{error, info};

use crate::error::{ClientError, NetError};

pub struct NetworkWorker {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    running: Arc<AtomicBool>,
    failure: Arc<OnceLock<String>>,
}

impl std::fmt::Debug for NetworkWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkWorker")
            .field("running", &self.is_running())
            .field("failure", &self.failure.get())
            .finish()
    }
}

impl NetworkWorker {
    pub fn new(threads: usize) -> Result<Self, NetError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("net-engine-io")
            .enable_all()
            .build()
            .map_err(|e| ClientError::FatalWorker(format!("failed to start runtime: {e}")))?;
        info!(threads = threads.max(1), "Network worker started");

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            running: Arc::new(AtomicBool::new(true)),
            failure: Arc::new(OnceLock::new()),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failure.get().is_some()
    }

    /// The first fatal failure recorded, as a `FatalWorker` error.
    pub fn failure(&self) -> Option<NetError> {
        self.failure
            .get()
            .map(|message| ClientError::FatalWorker(message.clone()).into())
    }

    /// Run `task` on the worker. If it panics, the worker is marked failed
    /// and `on_panic` receives the resulting `FatalWorker` error.
    pub fn spawn_supervised<F, P>(&self, task: F, on_panic: P) -> Result<AbortHandle, NetError>
    where
        F: Future<Output = ()> + Send + 'static,
        P: FnOnce(NetError) + Send + 'static,
    {
        if !self.is_running() {
            return Err(ClientError::ShuttingDown.into());
        }

        let inner = self.handle.spawn(task);
        let abort = inner.abort_handle();
        let failure = self.failure.clone();
        self.handle.spawn(async move {
            let Err(join_error) = inner.await else {
                return;
            };
            if !join_error.is_panic() {
                return; // aborted
            }
            let message = panic_message(join_error.into_panic());
            error!(error = %message, "Worker task panicked");
            let _ = failure.set(message.clone());
            on_panic(ClientError::FatalWorker(message).into());
        });
        Ok(abort)
    }

    /// Stop the runtime, giving running tasks at most `grace` to finish.
    pub fn shutdown(&self, grace: Duration) {
        self.running.store(false, Ordering::Release);
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            info!(grace_ms = grace.as_millis() as u64, "Shutting down network worker");
            runtime.shutdown_timeout(grace);
        }
    }
}

impl Drop for NetworkWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_spawned_task_runs() {
        let worker = NetworkWorker::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        worker
            .spawn_supervised(
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    tx.send(42).unwrap();
                },
                |_| {},
            )
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert!(!worker.is_failed());
    }

    #[test]
    fn test_panic_marks_worker_failed() {
        let worker = NetworkWorker::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        worker
            .spawn_supervised(async { panic!("boom") }, move |err| {
                tx.send(err).unwrap();
            })
            .unwrap();

        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(err, NetError::Client(ClientError::FatalWorker("boom".to_string())));
        assert!(worker.is_failed());
        assert_eq!(worker.failure(), Some(err));
    }

    #[test]
    fn test_abort_does_not_fail_worker() {
        let worker = NetworkWorker::new(1).unwrap();
        let (tx, rx) = mpsc::channel::<NetError>();
        let abort = worker
            .spawn_supervised(
                async move { tokio::time::sleep(Duration::from_secs(60)).await },
                move |err| {
                    let _ = tx.send(err);
                },
            )
            .unwrap();
        abort.abort();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!worker.is_failed());
    }

    #[test]
    fn test_spawn_after_shutdown_is_rejected() {
        let worker = NetworkWorker::new(1).unwrap();
        worker.shutdown(Duration::from_millis(100));
        assert!(!worker.is_running());
        let err = worker.spawn_supervised(async {}, |_| {}).unwrap_err();
        assert_eq!(err, NetError::Client(ClientError::ShuttingDown));
    }
}
