//! Worker threads for parallel process execution.
//!
//! Each worker has:
//! - A local FIFO deque of ready processes
//! - Access to the global injector and to every other worker's stealer
//! - A slice clock the preemption monitor watches
//!
//! A worker runs one process at a time for at most one slice, then puts it
//! back on its local queue. Work stealing keeps the load balanced without
//! central coordination.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::deque::{Steal, Worker as WorkQueue};
use crossbeam::sync::{Parker, Unparker};

use crate::collector::Collector;
use crate::config::RuntimeConfig;
use crate::error::{AllocError, RuntimeError};
use crate::pid::Pid;
use crate::preempt::{self, SliceClock};
use crate::process::{
    panic_message, BlockingOp, ExitReason, Outcome, PanicPayload, Process, ProcessState, Step,
    Wake,
};
use crate::scheduler::{bump, Shared};

/// Every this many scheduling ticks a worker checks the global queue
/// before its local one, so injected work cannot be starved by a busy
/// local queue.
const GLOBAL_POLL_INTERVAL: u64 = 61;

/// Upper bound on an idle worker's sleep. Work pushed onto a peer's local
/// queue does not unpark anyone, so idle workers look again this often.
const IDLE_PARK: Duration = Duration::from_millis(10);

/// What other threads know about a worker.
pub(crate) struct WorkerSlot {
    pub(crate) sleeping: AtomicBool,
    pub(crate) unparker: Unparker,
    pub(crate) clock: SliceClock,
}

/// The runtime's threads: workers, the timer thread and the preemption
/// monitor.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Build the shared state and start every runtime thread.
    pub(crate) fn start(
        config: RuntimeConfig,
        collector: Arc<dyn Collector>,
    ) -> Result<(Arc<Shared>, Self), RuntimeError> {
        let num_workers = config.worker_count();

        let mut queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        let mut slots = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let queue = WorkQueue::new_fifo();
            let parker = Parker::new();
            stealers.push(queue.stealer());
            slots.push(WorkerSlot {
                sleeping: AtomicBool::new(false),
                unparker: parker.unparker().clone(),
                clock: SliceClock::default(),
            });
            queues.push((queue, parker));
        }

        let shared = Arc::new(Shared::new(
            config,
            collector,
            slots.into_boxed_slice(),
            stealers.into_boxed_slice(),
        )?);

        let mut pool = Self {
            handles: Vec::with_capacity(num_workers + 2),
        };

        for (id, (local, parker)) in queues.into_iter().enumerate() {
            let worker = Worker {
                id,
                local,
                parker,
                shared: Arc::clone(&shared),
                tick: 0,
            };
            let name = format!("{}-{}", shared.config.thread_name, id);
            pool.spawn_thread(&shared, name, move || worker.run())?;
        }

        let timer_shared = Arc::clone(&shared);
        pool.spawn_thread(&shared, "islet-timer".to_string(), move || {
            timer_shared
                .timers
                .run(|pid, key| timer_shared.expire_timer(pid, key))
        })?;

        let monitor_shared = Arc::clone(&shared);
        pool.spawn_thread(&shared, "islet-preempt".to_string(), move || {
            preempt::run_monitor(&monitor_shared)
        })?;

        tracing::info!(
            workers = num_workers,
            quantum = ?shared.config.quantum,
            reductions = shared.config.reductions_per_slice,
            "runtime started"
        );

        Ok((shared, pool))
    }

    fn spawn_thread(
        &mut self,
        shared: &Arc<Shared>,
        name: String,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<(), RuntimeError> {
        match thread::Builder::new().name(name).spawn(body) {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                shared.begin_shutdown();
                self.join();
                shared.blocking.shutdown();
                Err(RuntimeError::Startup {
                    what: "runtime thread",
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Wait for every runtime thread to exit. Call after shutdown began.
    pub(crate) fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("runtime thread panicked");
            }
        }
    }
}

/// A single worker thread.
struct Worker {
    id: usize,
    /// Local work queue (FIFO deque)
    local: WorkQueue<Box<Process>>,
    parker: Parker,
    shared: Arc<Shared>,
    /// Scheduling ticks so far
    tick: u64,
}

impl Worker {
    /// Run the worker loop.
    fn run(mut self) {
        tracing::debug!(worker = self.id, "worker started");

        while !self.shared.is_shutdown() {
            match self.find_work() {
                Some(process) => self.run_slice(process),
                None => self.idle(),
            }
        }

        tracing::debug!(worker = self.id, "worker stopped");
    }

    /// Find work: (periodically global first) local queue -> global
    /// injector -> steal from others.
    fn find_work(&mut self) -> Option<Box<Process>> {
        self.tick = self.tick.wrapping_add(1);
        if self.tick % GLOBAL_POLL_INTERVAL == 0 {
            if let Some(process) = self.steal_global() {
                return Some(process);
            }
        }

        if let Some(process) = self.local.pop() {
            return Some(process);
        }

        if let Some(process) = self.steal_global() {
            return Some(process);
        }

        let stealers = &self.shared.stealers;
        for i in 1..stealers.len() {
            let idx = (self.id + i) % stealers.len();
            loop {
                match stealers[idx].steal() {
                    Steal::Success(process) => return Some(process),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn steal_global(&self) -> Option<Box<Process>> {
        loop {
            match self.shared.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(process) => return Some(process),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn idle(&self) {
        let slot = &self.shared.workers[self.id];
        slot.sleeping.store(true, Ordering::SeqCst);
        if self.shared.injector.is_empty() && !self.shared.is_shutdown() {
            self.parker.park_timeout(IDLE_PARK);
        }
        slot.sleeping.store(false, Ordering::SeqCst);
    }

    // ============================================================
    // Running a slice
    // ============================================================

    /// Run `process` until it suspends, exits, or uses up its slice.
    fn run_slice(&self, mut process: Box<Process>) {
        let shared = &self.shared;
        let clock = &shared.workers[self.id].clock;

        {
            let mut ctl = process.control.inner.lock();
            if ctl.state.is_terminal() {
                return;
            }
            ctl.state = ProcessState::Running;
        }
        clock.begin(shared.now_nanos());
        process.reductions = shared.config.reductions_per_slice;

        loop {
            if let Some(wake) = process.wake.take() {
                if let Err(payload) = self.settle(&mut process, wake) {
                    clock.end();
                    self.panicked(process, payload);
                    return;
                }
            }

            if process.reductions == 0 || clock.should_yield() {
                break;
            }
            process.reductions -= 1;

            let step = panic::catch_unwind(AssertUnwindSafe(|| process.resume(shared)));
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Receive) => match self.receive(process, None) {
                    Some(resumed) => process = resumed,
                    None => {
                        clock.end();
                        return;
                    }
                },
                Ok(Step::ReceiveTimeout(timeout)) => match self.receive(process, Some(timeout)) {
                    Some(resumed) => process = resumed,
                    None => {
                        clock.end();
                        return;
                    }
                },
                Ok(Step::Blocking(op)) => {
                    clock.end();
                    self.enter_blocking(process, op);
                    return;
                }
                Ok(Step::Done) => {
                    clock.end();
                    shared.terminate(process, ExitReason::Normal);
                    return;
                }
                Err(payload) => {
                    clock.end();
                    let payload = PanicPayload::new(process.pid, payload);
                    self.panicked(process, payload);
                    return;
                }
            }
        }

        clock.end();
        self.yield_slice(process);
    }

    /// Turn a wake reason into the outcome the continuation will see.
    fn settle(&self, process: &mut Process, wake: Wake) -> Result<(), PanicPayload> {
        let pid = process.pid;
        match wake {
            Wake::Message => {
                let msg = process.control.inner.lock().mailbox.pop();
                if let Some(msg) = msg {
                    let value = msg
                        .materialize(&mut process.heap)
                        .map_err(|err| self.copy_failed(pid, err))?;
                    process.outcome = Some(Outcome::Message(value));
                }
            }
            Wake::Timeout => process.outcome = Some(Outcome::TimedOut),
            Wake::Blocking(Ok(msg)) => {
                let value = msg
                    .materialize(&mut process.heap)
                    .map_err(|err| self.copy_failed(pid, err))?;
                process.outcome = Some(Outcome::Completed(value));
            }
            Wake::Blocking(Err(payload)) => return Err(payload),
        }
        Ok(())
    }

    fn copy_failed(&self, pid: Pid, err: AllocError) -> PanicPayload {
        tracing::error!(pid = %pid, %err, "message copy failed");
        self.shared.fail(RuntimeError::Alloc(err));
        PanicPayload::new(pid, Box::new(err))
    }

    /// Handle a receive step. Returns the process if it can keep running
    /// (a message is queued or the timeout is zero); otherwise parks it in
    /// its control block and returns `None`.
    fn receive(&self, mut process: Box<Process>, timeout: Option<Duration>) -> Option<Box<Process>> {
        let queued = !process.control.inner.lock().mailbox.is_empty();
        if queued {
            process.wake = Some(Wake::Message);
            return Some(process);
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            bump(&self.shared.counters.timeouts);
            process.wake = Some(Wake::Timeout);
            return Some(process);
        }

        self.shared.safe_point(&mut process);

        let control = Arc::clone(&process.control);
        let mut ctl = control.inner.lock();
        if !ctl.mailbox.is_empty() {
            drop(ctl);
            process.wake = Some(Wake::Message);
            return Some(process);
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        match deadline {
            Some(deadline) => {
                ctl.state = ProcessState::BlockedOnTimeout;
                ctl.timer = Some(self.shared.timers.register(deadline, process.pid));
            }
            None => ctl.state = ProcessState::BlockedOnReceive,
        }
        tracing::trace!(pid = %process.pid, timeout = ?timeout, "park in receive");
        ctl.parked = Some(process);
        None
    }

    /// Hand the process to the blocking pool.
    fn enter_blocking(&self, mut process: Box<Process>, op: BlockingOp) {
        process.control.inner.lock().state = ProcessState::InBlockingSection;
        bump(&self.shared.counters.blocking_sections);
        self.shared.safe_point(&mut process);

        let pid = process.pid;
        tracing::trace!(pid = %pid, "enter blocking section");
        let shared = Arc::clone(&self.shared);
        let job = move || {
            let result = panic::catch_unwind(AssertUnwindSafe(op))
                .map_err(|payload| PanicPayload::new(pid, payload));
            process.wake = Some(Wake::Blocking(result));
            shared.readmit(process);
        };

        if self.shared.blocking.submit(job).is_err() {
            tracing::warn!(pid = %pid, "blocking section refused during shutdown");
        }
    }

    /// Slice used up: offer a GC pause and requeue locally.
    fn yield_slice(&self, mut process: Box<Process>) {
        bump(&self.shared.counters.preemptions);
        tracing::trace!(pid = %process.pid, worker = self.id, "preempt");
        self.shared.safe_point(&mut process);

        {
            let mut ctl = process.control.inner.lock();
            if ctl.state == ProcessState::Running {
                ctl.state = ProcessState::Ready;
            }
        }
        self.local.push(process);
        if self.local.len() > 1 {
            self.shared.notify_one();
        }
    }

    /// Unwind a panicked process: run its handler once, then retire it.
    /// A missing or panicking handler takes the runtime down.
    fn panicked(&self, mut process: Box<Process>, payload: PanicPayload) {
        let pid = process.pid;
        process.control.inner.lock().state = ProcessState::Panicked;
        let message = payload.message().to_string();

        let Some(handler) = process.panic_handler.take() else {
            tracing::error!(pid = %pid, %message, "unhandled panic");
            self.shared.terminate(process, ExitReason::Panicked(message.clone()));
            self.shared.fail(RuntimeError::UnhandledPanic { pid, message });
            return;
        };

        let shared = &self.shared;
        let handled = panic::catch_unwind(AssertUnwindSafe(|| {
            process.run_panic_handler(handler, &payload, shared)
        }));

        match handled {
            Ok(()) => {
                tracing::debug!(pid = %pid, %message, "panic handled");
                shared.terminate(process, ExitReason::Panicked(message));
            }
            Err(inner) => {
                let inner = panic_message(&*inner);
                tracing::error!(pid = %pid, %message, handler = %inner, "panic handler panicked");
                shared.terminate(process, ExitReason::Panicked(message));
                shared.fail(RuntimeError::UnhandledPanic {
                    pid,
                    message: inner,
                });
            }
        }
    }
}
