//! Scheduler state shared by every thread of a runtime.
//!
//! The scheduler manages:
//! - Process registry (`ProcessTable`, pid -> control block)
//! - Global run queue (`Injector`) and idle-worker wake-ups
//! - Message routing between processes
//! - Receive deadlines and blocking-section re-admission
//! - Monitor notification on exit
//!
//! It never runs process code itself; that is the workers' job.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::deque::{Injector, Steal, Stealer};
use parking_lot::{Condvar, Mutex};

use crate::blocking::BlockingPool;
use crate::collector::{Collector, SafePoint};
use crate::config::RuntimeConfig;
use crate::copy::Message;
use crate::error::{RuntimeError, SpawnError};
use crate::gc::{GcValue, Heap};
use crate::pid::Pid;
use crate::process::{Continuation, Control, ExitReason, MonitorRef, Process, ProcessState, Wake};
use crate::runtime::RuntimeStats;
use crate::table::ProcessTable;
use crate::timer::{TimerKey, TimerService};
use crate::worker::WorkerSlot;

/// Event counters behind `RuntimeStats`.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) spawned: AtomicU64,
    pub(crate) terminated: AtomicU64,
    pub(crate) panicked: AtomicU64,
    pub(crate) messages_sent: AtomicU64,
    pub(crate) messages_dropped: AtomicU64,
    pub(crate) preemptions: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) blocking_sections: AtomicU64,
    pub(crate) gc_pauses: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) table: ProcessTable,
    /// Global run queue for spawned and woken processes
    pub(crate) injector: Injector<Box<Process>>,
    pub(crate) stealers: Box<[Stealer<Box<Process>>]>,
    pub(crate) workers: Box<[WorkerSlot]>,
    pub(crate) timers: TimerService,
    pub(crate) blocking: BlockingPool,
    pub(crate) collector: Arc<dyn Collector>,
    pub(crate) counters: Counters,
    /// Spawned and not yet terminated
    live: AtomicUsize,
    done_lock: Mutex<()>,
    done: Condvar,
    shutdown: AtomicBool,
    fatal: Mutex<Option<RuntimeError>>,
    next_monitor: AtomicU64,
    epoch: Instant,
}

impl Shared {
    pub(crate) fn new(
        config: RuntimeConfig,
        collector: Arc<dyn Collector>,
        workers: Box<[WorkerSlot]>,
        stealers: Box<[Stealer<Box<Process>>]>,
    ) -> Result<Self, RuntimeError> {
        let blocking = BlockingPool::new(&config)?;
        Ok(Self {
            table: ProcessTable::with_capacity(config.max_processes),
            injector: Injector::new(),
            stealers,
            workers,
            timers: TimerService::new(),
            blocking,
            collector,
            counters: Counters::default(),
            live: AtomicUsize::new(0),
            done_lock: Mutex::new(()),
            done: Condvar::new(),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
            next_monitor: AtomicU64::new(0),
            epoch: Instant::now(),
            config,
        })
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Nanoseconds since the runtime started. Never zero.
    pub(crate) fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos().min(u64::MAX as u128 - 1) as u64 + 1
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    // ============================================================
    // Run queue
    // ============================================================

    /// Create a process and queue it.
    pub(crate) fn spawn(&self, continuation: Box<dyn Continuation>) -> Result<Pid, SpawnError> {
        if self.is_shutdown() {
            return Err(SpawnError::ShuttingDown);
        }
        let control = self.table.insert(|pid| Arc::new(Control::new(pid)))?;
        let pid = control.pid;
        let heap = Heap::with_config(self.config.heap.clone());
        let process = Box::new(Process::new(control, heap, continuation));

        self.live.fetch_add(1, Ordering::AcqRel);
        bump(&self.counters.spawned);
        tracing::trace!(pid = %pid, "spawn");
        self.schedule(process);
        Ok(pid)
    }

    /// Queue a ready process on the global run queue.
    pub(crate) fn schedule(&self, process: Box<Process>) {
        self.injector.push(process);
        self.notify_one();
    }

    /// Wake one sleeping worker, if any.
    pub(crate) fn notify_one(&self) {
        for slot in self.workers.iter() {
            if slot.sleeping.load(Ordering::SeqCst) && slot.sleeping.swap(false, Ordering::SeqCst) {
                slot.unparker.unpark();
                return;
            }
        }
    }

    fn notify_all(&self) {
        for slot in self.workers.iter() {
            slot.sleeping.store(false, Ordering::SeqCst);
            slot.unparker.unpark();
        }
    }

    // ============================================================
    // Messaging
    // ============================================================

    /// Append `msg` to `to`'s mailbox, waking it if it is blocked in
    /// receive. Messages to exited processes are dropped.
    pub(crate) fn deliver(&self, to: Pid, msg: Message) -> bool {
        let Some(control) = self.table.get(to) else {
            bump(&self.counters.messages_dropped);
            tracing::trace!(pid = %to, "send to dead process dropped");
            return false;
        };

        let mut ctl = control.inner.lock();
        if ctl.state.is_terminal() {
            drop(ctl);
            bump(&self.counters.messages_dropped);
            tracing::trace!(pid = %to, "send to exiting process dropped");
            return false;
        }

        ctl.mailbox.push(msg);
        bump(&self.counters.messages_sent);

        if ctl.state.is_blocked() {
            if let Some(key) = ctl.timer.take() {
                self.timers.cancel(key);
            }
            ctl.state = ProcessState::Ready;
            if let Some(mut process) = ctl.parked.take() {
                drop(ctl);
                process.wake = Some(Wake::Message);
                tracing::trace!(pid = %to, "wake on message");
                self.schedule(process);
            }
        }
        true
    }

    /// Called by the timer thread when a receive deadline passes.
    pub(crate) fn expire_timer(&self, pid: Pid, key: TimerKey) {
        let Some(control) = self.table.get(pid) else {
            return;
        };

        let mut ctl = control.inner.lock();
        if ctl.state != ProcessState::BlockedOnTimeout || ctl.timer != Some(key) {
            return;
        }
        ctl.timer = None;
        ctl.state = ProcessState::Ready;
        let Some(mut process) = ctl.parked.take() else {
            return;
        };
        drop(ctl);

        process.wake = Some(Wake::Timeout);
        bump(&self.counters.timeouts);
        tracing::trace!(pid = %pid, "wake on timeout");
        self.schedule(process);
    }

    /// Return a process from the blocking pool to the run queue.
    pub(crate) fn readmit(&self, process: Box<Process>) {
        {
            let mut ctl = process.control.inner.lock();
            if ctl.state == ProcessState::InBlockingSection {
                ctl.state = ProcessState::Ready;
            }
        }
        tracing::trace!(pid = %process.pid, "blocking section finished");
        self.schedule(process);
    }

    // ============================================================
    // Monitors and exit
    // ============================================================

    pub(crate) fn monitor(&self, watcher: Pid, target: Pid) -> MonitorRef {
        let mref = MonitorRef(self.next_monitor.fetch_add(1, Ordering::Relaxed) + 1);
        if let Some(control) = self.table.get(target) {
            let mut ctl = control.inner.lock();
            if !ctl.state.is_terminal() {
                ctl.monitors.push((mref, watcher));
                return mref;
            }
        }
        self.send_down(watcher, mref, target, "noproc");
        mref
    }

    fn send_down(&self, watcher: Pid, mref: MonitorRef, pid: Pid, reason: &str) {
        let msg = Message::build(|heap| {
            let tuple = heap.alloc_tuple(vec![
                GcValue::text("DOWN"),
                GcValue::Int(mref.id() as i64),
                GcValue::Pid(pid),
                GcValue::text(reason),
            ]);
            GcValue::Tuple(tuple)
        });
        self.deliver(watcher, msg);
    }

    /// Retire a process: final state, empty mailbox, free its pid, tell
    /// monitors. The body (and its heap) is dropped here.
    pub(crate) fn terminate(&self, process: Box<Process>, reason: ExitReason) {
        let pid = process.pid;
        let (monitors, discarded) = {
            let mut ctl = process.control.inner.lock();
            ctl.state = match reason {
                ExitReason::Normal => ProcessState::Terminated,
                ExitReason::Panicked(_) => ProcessState::Panicked,
            };
            if let Some(key) = ctl.timer.take() {
                self.timers.cancel(key);
            }
            let discarded = ctl.mailbox.clear();
            (std::mem::take(&mut ctl.monitors), discarded)
        };
        self.table.remove(pid);

        match reason {
            ExitReason::Normal => bump(&self.counters.terminated),
            ExitReason::Panicked(_) => bump(&self.counters.panicked),
        }
        tracing::debug!(pid = %pid, reason = %reason, discarded, "process exited");

        let reason = reason.to_string();
        for (mref, watcher) in monitors {
            self.send_down(watcher, mref, pid, &reason);
        }
        drop(process);

        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.done_lock.lock();
            self.done.notify_all();
        }
    }

    // ============================================================
    // Garbage collection
    // ============================================================

    /// Offer the collector a pause. The caller owns `process` exclusively.
    pub(crate) fn safe_point(&self, process: &mut Process) {
        if !self.collector.wants_pause(process.pid, &process.heap) {
            return;
        }
        let roots = process.gc_roots();
        let mut point = SafePoint {
            pid: process.pid,
            heap: &mut process.heap,
            roots,
        };
        self.collector.request_pause(&mut point);
        self.collector.resume(process.pid, &process.heap);
        bump(&self.counters.gc_pauses);
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    /// Record a fatal error and stop the runtime. The first error wins.
    pub(crate) fn fail(&self, err: RuntimeError) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                tracing::error!(%err, "runtime failed");
                *fatal = Some(err);
            }
        }
        self.begin_shutdown();
    }

    pub(crate) fn fatal(&self) -> Option<RuntimeError> {
        self.fatal.lock().clone()
    }

    /// Stop workers and timers. Idempotent.
    pub(crate) fn begin_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify_all();
        self.timers.shutdown();
        let _guard = self.done_lock.lock();
        self.done.notify_all();
    }

    /// Block until no process is live or the runtime stops.
    /// Returns false if `timeout` elapsed first.
    pub(crate) fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.done_lock.lock();
        loop {
            if self.live() == 0 || self.is_shutdown() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut guard, deadline).timed_out() {
                        return self.live() == 0 || self.is_shutdown();
                    }
                }
                None => self.done.wait(&mut guard),
            }
        }
    }

    /// Drop every process body still held anywhere but a worker's local
    /// queue. Run after the workers have exited.
    pub(crate) fn drain(&self) {
        let mut bodies = Vec::new();
        for control in self.table.drain() {
            let mut ctl = control.inner.lock();
            ctl.mailbox.clear();
            ctl.timer = None;
            if let Some(process) = ctl.parked.take() {
                bodies.push(process);
            }
        }
        loop {
            match self.injector.steal() {
                Steal::Success(process) => bodies.push(process),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        tracing::debug!(dropped = bodies.len(), "process bodies released");
    }

    pub(crate) fn stats(&self) -> RuntimeStats {
        let c = &self.counters;
        RuntimeStats {
            spawned: c.spawned.load(Ordering::Relaxed),
            terminated: c.terminated.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            live: self.live() as u64,
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_dropped: c.messages_dropped.load(Ordering::Relaxed),
            preemptions: c.preemptions.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            blocking_sections: c.blocking_sections.load(Ordering::Relaxed),
            gc_pauses: c.gc_pauses.load(Ordering::Relaxed),
            pending_timers: self.timers.len() as u64,
            blocking_active: self.blocking.active() as u64,
        }
    }
}
