//! Time-slice preemption.
//!
//! Every worker publishes when its current slice started. A monitor thread
//! samples those clocks and raises a worker's preemption flag once its
//! slice has run for a full quantum. Workers poll the flag between steps,
//! so a process is interrupted at most one step after its quantum expires.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::scheduler::Shared;

/// Shortest interval between monitor samples.
const MIN_TICK: Duration = Duration::from_micros(100);

/// One worker's slice clock.
#[derive(Debug, Default)]
pub(crate) struct SliceClock {
    /// Start of the running slice in runtime nanoseconds; 0 when idle
    started: AtomicU64,
    preempt: AtomicBool,
}

impl SliceClock {
    pub(crate) fn begin(&self, now: u64) {
        self.preempt.store(false, Ordering::Relaxed);
        self.started.store(now.max(1), Ordering::Release);
    }

    pub(crate) fn end(&self) {
        self.started.store(0, Ordering::Release);
        self.preempt.store(false, Ordering::Relaxed);
    }

    /// Polled by the worker between steps.
    pub(crate) fn should_yield(&self) -> bool {
        self.preempt.load(Ordering::Relaxed)
    }

    /// Raise the flag if the running slice is older than `quantum`.
    /// Returns true when the flag was newly raised.
    pub(crate) fn check(&self, now: u64, quantum: u64) -> bool {
        let started = self.started.load(Ordering::Acquire);
        if started == 0 || now.saturating_sub(started) < quantum {
            return false;
        }
        !self.preempt.swap(true, Ordering::Relaxed)
    }
}

/// Sampling interval for a given quantum.
pub(crate) fn tick_for(quantum: Duration) -> Duration {
    (quantum / 4).max(MIN_TICK)
}

/// Monitor thread body. Returns after shutdown.
pub(crate) fn run_monitor(shared: &Shared) {
    let quantum = shared.config.quantum;
    let quantum_nanos = quantum.as_nanos().min(u64::MAX as u128) as u64;
    let tick = tick_for(quantum);
    tracing::debug!(?quantum, ?tick, "preemption monitor started");

    while !shared.is_shutdown() {
        std::thread::sleep(tick);
        let now = shared.now_nanos();
        for (worker, slot) in shared.workers.iter().enumerate() {
            if slot.clock.check(now, quantum_nanos) {
                tracing::trace!(worker, "quantum expired");
            }
        }
    }

    tracing::debug!("preemption monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_clock_never_preempts() {
        let clock = SliceClock::default();
        assert!(!clock.check(u64::MAX, 1));
        assert!(!clock.should_yield());
    }

    #[test]
    fn test_flag_raised_after_quantum() {
        let clock = SliceClock::default();
        clock.begin(1_000);
        assert!(!clock.check(1_500, 1_000));
        assert!(!clock.should_yield());

        assert!(clock.check(2_000, 1_000));
        assert!(clock.should_yield());
        // Already raised
        assert!(!clock.check(3_000, 1_000));

        clock.end();
        assert!(!clock.should_yield());
    }

    #[test]
    fn test_tick_has_floor() {
        assert_eq!(tick_for(Duration::from_millis(2)), Duration::from_micros(500));
        assert_eq!(tick_for(Duration::from_micros(40)), MIN_TICK);
    }
}
