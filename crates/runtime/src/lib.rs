//! Islet process runtime
//!
//! Isolated lightweight processes for Rust programs:
//! - One private, garbage-collectable heap per process
//! - Preemptive scheduling over a fixed set of worker threads
//! - Messages deep-copied between heaps, never shared
//! - Blocking and timed receive
//! - Blocking sections that run off the scheduling workers
//! - Per-process panic handlers and exit monitors
//!
//! A process is a [`Continuation`]: the runtime calls `resume` once per
//! step and may switch to another process between any two steps.
//!
//! ```
//! use islet_runtime::process::{from_fn, Outcome, Step};
//! use islet_runtime::gc::GcValue;
//! use islet_runtime::Runtime;
//!
//! let runtime = Runtime::builder().workers(2).build().unwrap();
//! let (tx, rx) = crossbeam::channel::bounded(1);
//!
//! let echo = runtime
//!     .spawn(from_fn(move |cx| match cx.take_outcome() {
//!         Some(Outcome::Message(GcValue::Int(n))) => {
//!             let _ = tx.send(n * 2);
//!             Step::Done
//!         }
//!         _ => Step::Receive,
//!     }))
//!     .unwrap();
//!
//! runtime.send(echo, 21i64);
//! assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 42);
//! runtime.join().unwrap();
//! ```

pub mod collector;
pub mod config;
pub mod copy;
pub mod error;
pub mod gc;
pub mod process;

mod blocking;
mod mailbox;
mod pid;
mod preempt;
mod runtime;
mod scheduler;
mod table;
mod timer;
mod worker;

pub use collector::{Collector, MarkSweep, NoCollector, SafePoint};
pub use config::{HeapConfig, RuntimeConfig};
pub use copy::Message;
pub use error::{AllocError, RuntimeError, SpawnError};
pub use gc::{GcValue, Heap};
pub use pid::Pid;
pub use process::{
    from_fn, Context, Continuation, ExitReason, MonitorRef, Outcome, PanicPayload, ProcessState,
    Step,
};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStats};
