//! Garbage collection hooks.
//!
//! The scheduler decides *when* a heap may be collected: only at a safe
//! point, while a worker exclusively owns the process body and no step is
//! in progress. A [`Collector`] decides *whether* and *how*. Safe points
//! happen at the end of every slice: on preemption, before parking in
//! receive, and before entering a blocking section.

use crate::gc::{GcValue, Heap};
use crate::pid::Pid;

/// A paused process, as seen by a collector.
pub struct SafePoint<'a> {
    pub pid: Pid,
    pub heap: &'a mut Heap,
    /// Values live across the pause: what the continuation traced plus any
    /// outcome not yet taken.
    pub roots: Vec<GcValue>,
}

/// Contract between the scheduler and a collector.
///
/// `request_pause` runs with the process paused and its heap borrowed
/// exclusively. `resume` runs right after, before the process can be
/// scheduled again.
pub trait Collector: Send + Sync + 'static {
    /// Cheap check made at every safe point.
    fn wants_pause(&self, pid: Pid, heap: &Heap) -> bool;

    fn request_pause(&self, point: &mut SafePoint<'_>);

    fn resume(&self, _pid: Pid, _heap: &Heap) {}
}

/// Never collects. Heaps are freed when their process exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCollector;

impl Collector for NoCollector {
    fn wants_pause(&self, _pid: Pid, _heap: &Heap) -> bool {
        false
    }

    fn request_pause(&self, _point: &mut SafePoint<'_>) {}
}

/// Mark-and-sweep once a heap crosses its allocation threshold.
///
/// Requires continuations to report their live values through
/// `Continuation::trace`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkSweep;

impl Collector for MarkSweep {
    fn wants_pause(&self, _pid: Pid, heap: &Heap) -> bool {
        heap.should_collect()
    }

    fn request_pause(&self, point: &mut SafePoint<'_>) {
        let freed = point.heap.collect_with(&point.roots);
        tracing::debug!(pid = %point.pid, freed, live = point.heap.live_objects(), "gc pause");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    #[test]
    fn test_mark_sweep_keeps_roots() {
        let mut heap = Heap::with_config(HeapConfig {
            gc_threshold: 0,
            ..Default::default()
        });
        let keep = heap.alloc_string("keep".to_string());
        let _drop = heap.alloc_string("drop".to_string());
        let pid = Pid::new(0, 0);

        let collector = MarkSweep;
        assert!(collector.wants_pause(pid, &heap));

        let mut point = SafePoint {
            pid,
            heap: &mut heap,
            roots: vec![GcValue::String(keep)],
        };
        collector.request_pause(&mut point);
        collector.resume(pid, &heap);

        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.get_string(keep).unwrap().data, "keep");
    }

    #[test]
    fn test_no_collector_never_pauses() {
        let heap = Heap::new();
        assert!(!NoCollector.wants_pause(Pid::new(0, 0), &heap));
    }
}
