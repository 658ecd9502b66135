//! Integration tests for scheduling
//!
//! These tests verify that:
//! 1. A process that never suspends cannot starve others (preemption)
//! 2. Blocking sections run off the scheduling workers
//! 3. The process table bounds and recycles pids
//! 4. A collector only runs at safe points and sees traced roots

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded};
use islet_runtime::gc::{GcPtr, GcList, GcValue};
use islet_runtime::process::{from_fn, Context, Continuation, Outcome, Step};
use islet_runtime::{HeapConfig, MarkSweep, ProcessState, Runtime, SpawnError};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spinner(stop: &Arc<AtomicBool>) -> impl Continuation {
    let stop = Arc::clone(stop);
    from_fn(move |_cx| {
        if stop.load(Ordering::Relaxed) {
            Step::Done
        } else {
            Step::Continue
        }
    })
}

// ============================================================================
// Preemption
// ============================================================================

#[test]
fn test_spinning_process_does_not_starve_others() {
    init_tracing();
    let runtime = Runtime::builder().workers(1).build().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = bounded(1);

    runtime.spawn(spinner(&stop)).unwrap();
    runtime
        .spawn(from_fn(move |_cx| {
            let _ = tx.send(());
            Step::Done
        }))
        .unwrap();

    let ran = rx.recv_timeout(WAIT);
    stop.store(true, Ordering::Relaxed);
    assert!(ran.is_ok(), "second process never ran");

    let stats = runtime.join().unwrap();
    assert!(stats.preemptions > 0);
    assert_eq!(stats.terminated, 2);
}

#[test]
fn test_quantum_preempts_slow_steps() {
    init_tracing();
    // Reduction budget out of reach: only the clock can end a slice
    let runtime = Runtime::builder()
        .workers(1)
        .reductions(usize::MAX)
        .quantum(Duration::from_millis(1))
        .build()
        .unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = bounded(1);

    let flag = Arc::clone(&stop);
    runtime
        .spawn(from_fn(move |_cx| {
            if flag.load(Ordering::Relaxed) {
                return Step::Done;
            }
            std::thread::sleep(Duration::from_micros(200));
            Step::Continue
        }))
        .unwrap();
    runtime
        .spawn(from_fn(move |_cx| {
            let _ = tx.send(());
            Step::Done
        }))
        .unwrap();

    let ran = rx.recv_timeout(WAIT);
    stop.store(true, Ordering::Relaxed);
    assert!(ran.is_ok(), "quantum never expired");

    let stats = runtime.join().unwrap();
    assert!(stats.preemptions > 0);
}

#[test]
fn test_many_spinners_all_progress() {
    init_tracing();
    let runtime = Runtime::builder().workers(2).reductions(50).build().unwrap();
    let progressed = Arc::new(AtomicUsize::new(0));

    for _ in 0..16 {
        let progressed = Arc::clone(&progressed);
        let mut steps = 0;
        runtime
            .spawn(from_fn(move |_cx| {
                steps += 1;
                if steps == 500 {
                    progressed.fetch_add(1, Ordering::Relaxed);
                    Step::Done
                } else {
                    Step::Continue
                }
            }))
            .unwrap();
    }

    assert!(runtime.wait_timeout(WAIT));
    assert_eq!(progressed.load(Ordering::Relaxed), 16);
    let stats = runtime.join().unwrap();
    assert_eq!(stats.terminated, 16);
    assert!(stats.preemptions >= 16);
}

// ============================================================================
// Blocking sections
// ============================================================================

#[test]
fn test_blocking_section_frees_worker() {
    init_tracing();
    let runtime = Runtime::builder().workers(1).build().unwrap();
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let (other_tx, other_rx) = bounded(1);
    let (done_tx, done_rx) = bounded(1);

    let mut entered = false;
    let blocker = runtime
        .spawn(from_fn(move |cx| {
            if entered {
                let _ = done_tx.send(cx.take_outcome());
                return Step::Done;
            }
            entered = true;
            let entered_tx = entered_tx.clone();
            let release_rx = release_rx.clone();
            Step::blocking(move || {
                let _ = entered_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
                42i64
            })
        }))
        .unwrap();

    entered_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(
        runtime.process_state(blocker),
        Some(ProcessState::InBlockingSection)
    );

    // The only worker is free while the blocker waits
    runtime
        .spawn(from_fn(move |_cx| {
            let _ = other_tx.send(());
            Step::Done
        }))
        .unwrap();
    other_rx.recv_timeout(WAIT).unwrap();

    release_tx.send(()).unwrap();
    assert_eq!(
        done_rx.recv_timeout(WAIT).unwrap(),
        Some(Outcome::Completed(GcValue::Int(42)))
    );

    let stats = runtime.join().unwrap();
    assert_eq!(stats.blocking_sections, 1);
}

#[test]
fn test_blocking_result_lands_in_process_heap() {
    init_tracing();
    let runtime = Runtime::builder().workers(2).build().unwrap();
    let (tx, rx) = bounded(1);

    let mut waiting = false;
    runtime
        .spawn(from_fn(move |cx| {
            if !waiting {
                waiting = true;
                return Step::blocking(|| {
                    islet_runtime::Message::build(|heap| {
                        let items = (0..5).map(GcValue::Int).collect();
                        GcValue::List(heap.alloc_list(items))
                    })
                });
            }
            let shown = match cx.take_outcome().and_then(Outcome::into_value) {
                Some(value) => cx.heap().display_value(&value),
                None => String::new(),
            };
            let _ = tx.send(shown);
            Step::Done
        }))
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "[0, 1, 2, 3, 4]");
    runtime.join().unwrap();
}

// ============================================================================
// Process table
// ============================================================================

#[test]
fn test_table_capacity_is_enforced() {
    init_tracing();
    let runtime = Runtime::builder()
        .workers(1)
        .max_processes(2)
        .build()
        .unwrap();

    runtime.spawn(from_fn(|_cx| Step::Receive)).unwrap();
    runtime.spawn(from_fn(|_cx| Step::Receive)).unwrap();
    let err = runtime.spawn(from_fn(|_cx| Step::Done)).unwrap_err();
    assert_eq!(err, SpawnError::TableFull { capacity: 2 });
    assert_eq!(runtime.process_count(), 2);

    runtime.shutdown().unwrap();
}

#[test]
fn test_stale_pid_does_not_reach_new_process() {
    init_tracing();
    let runtime = Runtime::builder()
        .workers(1)
        .max_processes(1)
        .build()
        .unwrap();

    let first = runtime.spawn(from_fn(|_cx| Step::Done)).unwrap();
    assert!(runtime.wait_timeout(WAIT));

    let (tx, rx) = unbounded();
    let second = runtime
        .spawn(from_fn(move |cx| {
            if let Some(outcome) = cx.take_outcome() {
                let _ = tx.send(outcome);
                return Step::Done;
            }
            Step::Receive
        }))
        .unwrap();

    assert_eq!(first.index(), second.index());
    assert_ne!(first, second);
    assert!(!runtime.send(first, 1i64));
    assert!(runtime.send(second, 2i64));

    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Message(GcValue::Int(2))
    );
    assert!(rx.try_recv().is_err());
    runtime.join().unwrap();
}

#[test]
fn test_many_short_processes() {
    init_tracing();
    let runtime = Runtime::builder().workers(4).build().unwrap();
    for _ in 0..10_000 {
        runtime.spawn(from_fn(|_cx| Step::Done)).unwrap();
    }
    let stats = runtime.join().unwrap();
    assert_eq!(stats.spawned, 10_000);
    assert_eq!(stats.terminated, 10_000);
    assert_eq!(stats.live, 0);
}

// ============================================================================
// Garbage collection
// ============================================================================

/// Keeps one list alive across steps while producing garbage.
struct Hoarder {
    kept: Option<GcPtr<GcList>>,
    steps: usize,
    report: crossbeam::channel::Sender<(String, usize)>,
}

impl Continuation for Hoarder {
    fn resume(&mut self, cx: &mut Context<'_>) -> Step {
        let kept = match self.kept {
            Some(kept) => kept,
            None => {
                let kept = cx
                    .heap_mut()
                    .alloc_list(vec![GcValue::Int(7), GcValue::text("kept")]);
                self.kept = Some(kept);
                kept
            }
        };

        cx.heap_mut().alloc_string(format!("garbage {}", self.steps));
        self.steps += 1;

        if self.steps == 5_000 {
            let shown = cx.heap().display_value(&GcValue::List(kept));
            let _ = self.report.send((shown, cx.heap().live_objects()));
            return Step::Done;
        }
        Step::Continue
    }

    fn trace(&self, roots: &mut Vec<GcValue>) {
        if let Some(kept) = self.kept {
            roots.push(GcValue::List(kept));
        }
    }
}

#[test]
fn test_mark_sweep_collects_between_slices() {
    init_tracing();
    let runtime = Runtime::builder()
        .workers(1)
        .reductions(100)
        .heap(HeapConfig {
            gc_threshold: 0,
            ..Default::default()
        })
        .collector(MarkSweep)
        .build()
        .unwrap();
    let (tx, rx) = bounded(1);

    runtime
        .spawn(Hoarder {
            kept: None,
            steps: 0,
            report: tx,
        })
        .unwrap();

    let (shown, live) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(shown, "[7, kept]");
    // The kept list plus at most one slice worth of garbage
    assert!(live <= 101, "{} objects still live", live);

    let stats = runtime.join().unwrap();
    assert!(stats.gc_pauses >= 49);
}
