//! Lightweight processes.
//!
//! Each process has:
//! - Its own heap (GC isolation)
//! - A continuation (its code, resumed one step at a time)
//! - A mailbox (held in its control block, shared with senders)
//! - A reduction counter (for preemptive scheduling)
//!
//! The body of a process (`Process`) is owned by exactly one place at a
//! time: a run queue, the worker running it, the blocking pool, or the
//! `parked` slot of its control block while it waits for a message. The
//! control block (`Control`) is what other threads see.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::copy::Message;
use crate::error::{RuntimeError, SpawnError};
use crate::gc::{GcValue, Heap};
use crate::mailbox::Mailbox;
use crate::pid::Pid;
use crate::scheduler::Shared;
use crate::timer::TimerKey;

// ============================================================================
// States
// ============================================================================

/// Process execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Queued, waiting for a worker.
    Ready,
    /// Executing on a worker.
    Running,
    /// Waiting for a message with no deadline.
    BlockedOnReceive,
    /// Waiting for a message or a deadline, whichever comes first.
    BlockedOnTimeout,
    /// Running a blocking operation on the blocking pool.
    InBlockingSection,
    /// Finished normally.
    Terminated,
    /// Finished by panicking.
    Panicked,
}

impl ProcessState {
    /// True once the process can never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::Panicked)
    }

    /// True while the process waits in a receive.
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            ProcessState::BlockedOnReceive | ProcessState::BlockedOnTimeout
        )
    }
}

/// Reason for process exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Continuation returned `Step::Done`.
    Normal,
    /// Panicked; carries the rendered panic message.
    Panicked(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Panicked(msg) => f.write_str(msg),
        }
    }
}

/// Identifies one `Context::monitor` registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorRef(pub(crate) u64);

impl MonitorRef {
    pub fn id(&self) -> u64 {
        self.0
    }
}

// ============================================================================
// Continuations
// ============================================================================

/// Work run on a blocking-pool thread. Its result is handed back to the
/// process as `Outcome::Completed`.
pub type BlockingOp = Box<dyn FnOnce() -> Message + Send + 'static>;

/// What a continuation wants after one step.
pub enum Step {
    /// Step finished; run the next one when the scheduler allows.
    Continue,
    /// Wait for a message. Suspends only if the mailbox is empty.
    Receive,
    /// Wait for a message or until the duration elapses.
    ReceiveTimeout(Duration),
    /// Run the operation off the scheduling workers.
    Blocking(BlockingOp),
    /// The process is finished.
    Done,
}

impl Step {
    /// Enter a blocking section running `op`.
    pub fn blocking<F, M>(op: F) -> Step
    where
        F: FnOnce() -> M + Send + 'static,
        M: Into<Message>,
    {
        Step::Blocking(Box::new(move || op().into()))
    }

    pub fn receive_timeout_ms(ms: u64) -> Step {
        Step::ReceiveTimeout(Duration::from_millis(ms))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Continue => f.write_str("Continue"),
            Step::Receive => f.write_str("Receive"),
            Step::ReceiveTimeout(d) => write!(f, "ReceiveTimeout({:?})", d),
            Step::Blocking(_) => f.write_str("Blocking(..)"),
            Step::Done => f.write_str("Done"),
        }
    }
}

/// Result of the last suspending step, read with `Context::take_outcome`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A message, already copied into this process's heap.
    Message(GcValue),
    /// The receive deadline passed with an empty mailbox.
    TimedOut,
    /// A blocking section finished with this value.
    Completed(GcValue),
}

impl Outcome {
    /// The received message, if this outcome is one.
    pub fn into_message(self) -> Option<GcValue> {
        match self {
            Outcome::Message(v) => Some(v),
            _ => None,
        }
    }

    /// The carried value, for messages and completed blocking sections.
    pub fn into_value(self) -> Option<GcValue> {
        match self {
            Outcome::Message(v) | Outcome::Completed(v) => Some(v),
            Outcome::TimedOut => None,
        }
    }

    fn value(&self) -> Option<&GcValue> {
        match self {
            Outcome::Message(v) | Outcome::Completed(v) => Some(v),
            Outcome::TimedOut => None,
        }
    }
}

/// The code of a process.
///
/// Each call to `resume` is one step and should do a bounded amount of
/// work; the scheduler may switch to another process between any two
/// steps. State that must survive across steps lives in `self` (and, for
/// heap values, in the process heap reachable from what `trace` reports).
pub trait Continuation: Send + 'static {
    fn resume(&mut self, cx: &mut Context<'_>) -> Step;

    /// Push every heap value this continuation keeps across steps.
    ///
    /// Only consulted by collectors that free memory. The default reports
    /// nothing, which is correct for continuations that hold no `GcValue`
    /// pointing into the heap between steps.
    fn trace(&self, _roots: &mut Vec<GcValue>) {}
}

impl Continuation for Box<dyn Continuation> {
    fn resume(&mut self, cx: &mut Context<'_>) -> Step {
        (**self).resume(cx)
    }

    fn trace(&self, roots: &mut Vec<GcValue>) {
        (**self).trace(roots)
    }
}

/// A continuation backed by a closure. See [`from_fn`].
pub struct FnContinuation<F>(F);

impl<F> Continuation for FnContinuation<F>
where
    F: FnMut(&mut Context<'_>) -> Step + Send + 'static,
{
    fn resume(&mut self, cx: &mut Context<'_>) -> Step {
        (self.0)(cx)
    }
}

/// Wrap a closure as a continuation. The closure is called once per step.
///
/// ```
/// use islet_runtime::process::{from_fn, Step};
///
/// let mut countdown = 3;
/// let _body = from_fn(move |_cx| {
///     countdown -= 1;
///     if countdown == 0 { Step::Done } else { Step::Continue }
/// });
/// ```
pub fn from_fn<F>(f: F) -> FnContinuation<F>
where
    F: FnMut(&mut Context<'_>) -> Step + Send + 'static,
{
    FnContinuation(f)
}

// ============================================================================
// Panics
// ============================================================================

/// A caught panic, handed to the process's panic handler.
pub struct PanicPayload {
    pid: Pid,
    message: String,
    payload: Box<dyn Any + Send>,
}

impl PanicPayload {
    pub(crate) fn new(pid: Pid, payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        Self {
            pid,
            message,
            payload,
        }
    }

    /// The process that panicked.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The panic message, rendered as text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The original payload passed to `panic!` or `panic_any`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicPayload")
            .field("pid", &self.pid)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<crate::error::AllocError>() {
        err.to_string()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Called once, on the panicking process, before it terminates.
pub type PanicHandler = Box<dyn FnOnce(&PanicPayload, &mut Context<'_>) + Send + 'static>;

// ============================================================================
// Process body and control block
// ============================================================================

/// Why a parked process was made runnable again.
pub(crate) enum Wake {
    /// A message arrived while it was blocked in receive.
    Message,
    /// Its receive deadline passed.
    Timeout,
    /// Its blocking section finished.
    Blocking(Result<Message, PanicPayload>),
}

/// The part of a process only its current owner touches.
pub(crate) struct Process {
    pub(crate) pid: Pid,
    pub(crate) heap: Heap,
    pub(crate) continuation: Box<dyn Continuation>,
    pub(crate) panic_handler: Option<PanicHandler>,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) wake: Option<Wake>,
    /// Reductions remaining in the current slice.
    pub(crate) reductions: usize,
    pub(crate) control: Arc<Control>,
}

impl Process {
    pub(crate) fn new(
        control: Arc<Control>,
        heap: Heap,
        continuation: Box<dyn Continuation>,
    ) -> Self {
        Self {
            pid: control.pid,
            heap,
            continuation,
            panic_handler: None,
            outcome: None,
            wake: None,
            reductions: 0,
            control,
        }
    }

    /// Run one step of the continuation.
    pub(crate) fn resume(&mut self, shared: &Arc<Shared>) -> Step {
        let mut cx = Context {
            pid: self.pid,
            heap: &mut self.heap,
            outcome: &mut self.outcome,
            panic_handler: &mut self.panic_handler,
            control: &self.control,
            shared,
        };
        self.continuation.resume(&mut cx)
    }

    pub(crate) fn run_panic_handler(
        &mut self,
        handler: PanicHandler,
        payload: &PanicPayload,
        shared: &Arc<Shared>,
    ) {
        let mut cx = Context {
            pid: self.pid,
            heap: &mut self.heap,
            outcome: &mut self.outcome,
            panic_handler: &mut self.panic_handler,
            control: &self.control,
            shared,
        };
        handler(payload, &mut cx);
    }

    /// Heap values the runtime and the continuation keep alive.
    pub(crate) fn gc_roots(&self) -> Vec<GcValue> {
        let mut roots = Vec::new();
        self.continuation.trace(&mut roots);
        if let Some(value) = self.outcome.as_ref().and_then(Outcome::value) {
            roots.push(value.clone());
        }
        roots
    }
}

/// The shared half of a process: state, mailbox, and the parked body.
pub(crate) struct Control {
    pub(crate) pid: Pid,
    pub(crate) inner: Mutex<ControlState>,
}

pub(crate) struct ControlState {
    pub(crate) state: ProcessState,
    pub(crate) mailbox: Mailbox,
    /// Body of a process blocked in receive.
    pub(crate) parked: Option<Box<Process>>,
    /// Pending receive deadline.
    pub(crate) timer: Option<TimerKey>,
    /// Watchers to notify on exit.
    pub(crate) monitors: Vec<(MonitorRef, Pid)>,
}

impl Control {
    pub(crate) fn new(pid: Pid) -> Self {
        Self {
            pid,
            inner: Mutex::new(ControlState {
                state: ProcessState::Ready,
                mailbox: Mailbox::new(),
                parked: None,
                timer: None,
                monitors: Vec::new(),
            }),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// What a continuation can do during a step.
pub struct Context<'a> {
    pid: Pid,
    heap: &'a mut Heap,
    outcome: &'a mut Option<Outcome>,
    panic_handler: &'a mut Option<PanicHandler>,
    control: &'a Arc<Control>,
    shared: &'a Arc<Shared>,
}

impl<'a> Context<'a> {
    /// This process's own handle.
    pub fn current(&self) -> Pid {
        self.pid
    }

    pub fn heap(&self) -> &Heap {
        &*self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut *self.heap
    }

    /// Result of the previous suspending step, if not yet taken.
    pub fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    /// Start a new process.
    pub fn spawn<C: Continuation>(&self, continuation: C) -> Result<Pid, SpawnError> {
        self.shared.spawn(Box::new(continuation))
    }

    /// Copy `value` out of this heap and deliver it to `to`.
    ///
    /// Returns `false` if `to` no longer exists; the message is dropped.
    pub fn send(&mut self, to: Pid, value: &GcValue) -> bool {
        match Message::capture(value, &*self.heap) {
            Ok(msg) => self.shared.deliver(to, msg),
            Err(err) => self.abort_on_alloc(err),
        }
    }

    /// Deliver an already detached message.
    pub fn send_message(&self, to: Pid, msg: impl Into<Message>) -> bool {
        self.shared.deliver(to, msg.into())
    }

    /// Take the next message if one is queued. Never suspends.
    pub fn try_receive(&mut self) -> Option<GcValue> {
        let msg = self.control.inner.lock().mailbox.pop()?;
        match msg.materialize(&mut *self.heap) {
            Ok(value) => Some(value),
            Err(err) => self.abort_on_alloc(err),
        }
    }

    /// Number of queued messages.
    pub fn mailbox_len(&self) -> usize {
        self.control.inner.lock().mailbox.len()
    }

    /// Install the handler run if this process panics. Replaces any
    /// previously registered handler.
    pub fn register_panic_handler<F>(&mut self, handler: F)
    where
        F: FnOnce(&PanicPayload, &mut Context<'_>) + Send + 'static,
    {
        *self.panic_handler = Some(Box::new(handler));
    }

    /// Ask to be told when `target` exits.
    ///
    /// The notification is the message `("DOWN", ref, pid, reason)`.
    pub fn monitor(&self, target: Pid) -> MonitorRef {
        self.shared.monitor(self.pid, target)
    }

    /// Message copying ran out of heap: fatal for the runtime.
    fn abort_on_alloc(&self, err: crate::error::AllocError) -> ! {
        tracing::error!(pid = %self.pid, %err, "message copy failed");
        self.shared.fail(RuntimeError::Alloc(err));
        std::panic::panic_any(err)
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("pid", &self.pid)
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(ProcessState::Terminated.is_terminal());
        assert!(ProcessState::Panicked.is_terminal());
        assert!(!ProcessState::InBlockingSection.is_terminal());
        assert!(ProcessState::BlockedOnTimeout.is_blocked());
        assert!(!ProcessState::Ready.is_blocked());
    }

    #[test]
    fn test_panic_message_rendering() {
        let pid = Pid::new(1, 0);
        let payload = PanicPayload::new(pid, Box::new("static str"));
        assert_eq!(payload.message(), "static str");

        let payload = PanicPayload::new(pid, Box::new(String::from("owned")));
        assert_eq!(payload.message(), "owned");

        let payload = PanicPayload::new(pid, Box::new(17u32));
        assert_eq!(payload.message(), "Box<dyn Any>");
        assert_eq!(payload.downcast_ref::<u32>(), Some(&17));
    }

    #[test]
    fn test_outcome_accessors() {
        assert_eq!(
            Outcome::Message(GcValue::Int(1)).into_message(),
            Some(GcValue::Int(1))
        );
        assert_eq!(Outcome::Completed(GcValue::Unit).into_message(), None);
        assert_eq!(
            Outcome::Completed(GcValue::Bool(true)).into_value(),
            Some(GcValue::Bool(true))
        );
        assert_eq!(Outcome::TimedOut.into_value(), None);
    }

    #[test]
    fn test_blocking_step_converts_result() {
        let Step::Blocking(op) = Step::blocking(|| 5i64) else {
            panic!("expected blocking step");
        };
        assert_eq!(op().root(), &GcValue::Int(5));
        assert!(matches!(Step::receive_timeout_ms(0), Step::ReceiveTimeout(d) if d.is_zero()));
    }
}
