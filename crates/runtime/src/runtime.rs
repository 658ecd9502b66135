//! Host interface.
//!
//! A `Runtime` owns the worker threads, the timer thread, the preemption
//! monitor and the blocking pool. The host spawns processes into it, may
//! send them messages, and eventually joins or shuts it down.
//!
//! ```
//! use islet_runtime::process::{from_fn, Step};
//! use islet_runtime::Runtime;
//!
//! let runtime = Runtime::builder().workers(2).build().unwrap();
//! runtime.spawn(from_fn(|_cx| Step::Done)).unwrap();
//! let stats = runtime.join().unwrap();
//! assert_eq!(stats.terminated, 1);
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::collector::{Collector, NoCollector};
use crate::config::{HeapConfig, RuntimeConfig};
use crate::copy::Message;
use crate::error::{RuntimeError, SpawnError};
use crate::pid::Pid;
use crate::process::{Continuation, ProcessState};
use crate::scheduler::Shared;
use crate::worker::WorkerPool;

/// Snapshot of runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub spawned: u64,
    /// Exited normally
    pub terminated: u64,
    /// Exited by panicking, handled or not
    pub panicked: u64,
    /// Spawned and not yet exited
    pub live: u64,
    pub messages_sent: u64,
    /// Sends to processes that no longer exist
    pub messages_dropped: u64,
    /// Slices ended by the quantum or the reduction budget
    pub preemptions: u64,
    /// Receives that ended without a message
    pub timeouts: u64,
    pub blocking_sections: u64,
    pub gc_pauses: u64,
    /// Receive deadlines not yet fired or cancelled
    pub pending_timers: u64,
    /// Blocking sections currently queued or running
    pub blocking_active: u64,
}

/// A running process runtime.
pub struct Runtime {
    shared: Arc<Shared>,
    pool: WorkerPool,
    stopped: bool,
}

impl Runtime {
    /// Start a runtime with default settings.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::builder().build()
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Start a process running `continuation`.
    pub fn spawn<C: Continuation>(&self, continuation: C) -> Result<Pid, SpawnError> {
        self.shared.spawn(Box::new(continuation))
    }

    /// Send a message from the host. Returns `false` if `to` has exited.
    pub fn send(&self, to: Pid, msg: impl Into<Message>) -> bool {
        self.shared.deliver(to, msg.into())
    }

    /// Current state of `pid`, or `None` once it has exited.
    pub fn process_state(&self, pid: Pid) -> Option<ProcessState> {
        let control = self.shared.table.get(pid)?;
        let state = control.inner.lock().state;
        Some(state)
    }

    /// Number of live processes.
    pub fn process_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Pids of all live processes, in slot order.
    pub fn processes(&self) -> Vec<Pid> {
        self.shared.table.pids()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }

    /// The fatal error that stopped the runtime, if any.
    pub fn error(&self) -> Option<RuntimeError> {
        self.shared.fatal()
    }

    /// Wait until every process has exited or the runtime stopped.
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.wait_idle(Some(timeout))
    }

    /// Wait for every process to exit, then stop the runtime.
    ///
    /// Returns the final counters, or the fatal error that stopped the
    /// runtime early (an unhandled panic, a failed message copy).
    pub fn join(mut self) -> Result<RuntimeStats, RuntimeError> {
        self.shared.wait_idle(None);
        self.stop();
        match self.shared.fatal() {
            Some(err) => Err(err),
            None => Ok(self.shared.stats()),
        }
    }

    /// Stop the runtime now. Processes still live are dropped without
    /// running further.
    pub fn shutdown(mut self) -> Result<(), RuntimeError> {
        self.stop();
        match self.shared.fatal() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shared.begin_shutdown();
        self.pool.join();
        self.shared.blocking.shutdown();
        self.shared.drain();

        let stats = self.shared.stats();
        tracing::info!(
            spawned = stats.spawned,
            terminated = stats.terminated,
            panicked = stats.panicked,
            abandoned = stats.live,
            "runtime stopped"
        );
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.shared.workers.len())
            .field("live", &self.shared.live())
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// Configures and starts a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    collector: Arc<dyn Collector>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            collector: Arc::new(NoCollector),
        }
    }
}

impl RuntimeBuilder {
    /// Replace every setting with `config`.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of worker threads (0 = number of CPUs).
    pub fn workers(mut self, n: usize) -> Self {
        self.config.num_workers = n;
        self
    }

    pub fn quantum(mut self, quantum: Duration) -> Self {
        self.config.quantum = quantum;
        self
    }

    pub fn reductions(mut self, n: usize) -> Self {
        self.config.reductions_per_slice = n;
        self
    }

    pub fn max_processes(mut self, n: usize) -> Self {
        self.config.max_processes = n;
        self
    }

    pub fn heap(mut self, heap: HeapConfig) -> Self {
        self.config.heap = heap;
        self
    }

    /// Collector consulted at every safe point. Defaults to [`NoCollector`].
    pub fn collector(mut self, collector: impl Collector) -> Self {
        self.collector = Arc::new(collector);
        self
    }

    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let (shared, pool) = WorkerPool::start(self.config.normalized(), self.collector)?;
        Ok(Runtime {
            shared,
            pool,
            stopped: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{from_fn, Step};

    #[test]
    fn test_empty_runtime_joins() {
        let runtime = Runtime::builder().workers(1).build().unwrap();
        let stats = runtime.join().unwrap();
        assert_eq!(stats, RuntimeStats::default());
    }

    #[test]
    fn test_builder_normalizes_config() {
        let runtime = Runtime::builder()
            .workers(1)
            .reductions(0)
            .quantum(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(runtime.config().reductions_per_slice, 1);
        assert!(!runtime.config().quantum.is_zero());
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_spawn_after_exit_reports_none_state() {
        let runtime = Runtime::builder().workers(1).build().unwrap();
        let pid = runtime.spawn(from_fn(|_cx| Step::Done)).unwrap();
        assert!(runtime.wait_timeout(Duration::from_secs(5)));
        assert_eq!(runtime.process_state(pid), None);
        assert_eq!(runtime.process_count(), 0);
        assert!(!runtime.send(pid, 1i64));
        let stats = runtime.join().unwrap();
        assert_eq!(stats.spawned, 1);
        assert_eq!(stats.terminated, 1);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[test]
    fn test_shutdown_abandons_blocked_processes() {
        let runtime = Runtime::builder().workers(1).build().unwrap();
        let pid = runtime.spawn(from_fn(|_cx| Step::Receive)).unwrap();
        assert!(!runtime.wait_timeout(Duration::from_millis(50)));
        assert_eq!(
            runtime.process_state(pid),
            Some(ProcessState::BlockedOnReceive)
        );
        runtime.shutdown().unwrap();
    }
}
