//! Blocking sections.
//!
//! Work that may block an OS thread runs on tokio's blocking pool instead
//! of a scheduling worker. The pool grows on demand up to
//! `max_blocking_threads` and idle threads exit after
//! `blocking_keep_alive`, so a burst of blocking sections never shrinks the
//! set of threads running ordinary processes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;

pub(crate) struct BlockingPool {
    /// Taken on shutdown; `None` refuses further work.
    runtime: Mutex<Option<Runtime>>,
    /// Jobs submitted and not yet finished
    active: Arc<AtomicUsize>,
}

/// Decrements the active count when a job finishes, even by panicking.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BlockingPool {
    pub(crate) fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_blocking_threads)
            .thread_keep_alive(config.blocking_keep_alive)
            .thread_name("islet-blocking")
            .build()
            .map_err(|e| RuntimeError::Startup {
                what: "blocking pool",
                reason: e.to_string(),
            })?;

        tracing::debug!(
            max_threads = config.max_blocking_threads,
            keep_alive = ?config.blocking_keep_alive,
            "blocking pool started"
        );

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run `job` on a blocking thread. Hands `job` back after shutdown.
    pub(crate) fn submit<F>(&self, job: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.runtime.lock();
        let Some(runtime) = guard.as_ref() else {
            return Err(job);
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        let active = ActiveGuard(Arc::clone(&self.active));
        runtime.spawn_blocking(move || {
            let _active = active;
            job()
        });
        Ok(())
    }

    /// Jobs currently queued or running.
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting work. Jobs already running finish in the background.
    pub(crate) fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            tracing::debug!("blocking pool stopped");
        }
    }
}
