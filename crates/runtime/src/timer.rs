//! Receive deadlines.
//!
//! One dedicated thread sleeps until the earliest registered deadline and
//! reports every entry that has come due. Entries are ordered by
//! `(deadline, sequence)`, so equal deadlines fire in registration order.
//! The timer lock is never held while expiry callbacks run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::pid::Pid;

/// Handle for one registered deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    deadline: Instant,
    seq: u64,
}

impl TimerKey {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

struct TimerState {
    entries: BTreeMap<TimerKey, Pid>,
    shutdown: bool,
}

pub(crate) struct TimerService {
    state: Mutex<TimerState>,
    cond: Condvar,
    seq: AtomicU64,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                entries: BTreeMap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Arrange for `pid`'s deadline to be reported.
    pub(crate) fn register(&self, deadline: Instant, pid: Pid) -> TimerKey {
        let key = TimerKey {
            deadline,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut state = self.state.lock();
        let earliest = state
            .entries
            .keys()
            .next()
            .map_or(true, |first| key < *first);
        state.entries.insert(key, pid);
        if earliest {
            self.cond.notify_one();
        }
        key
    }

    /// Forget a deadline. Returns `false` if it already fired.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        self.state.lock().entries.remove(&key).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Timer thread body. Returns after `shutdown`.
    pub(crate) fn run(&self, mut expire: impl FnMut(Pid, TimerKey)) {
        tracing::debug!("timer thread started");
        let mut due = Vec::new();
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        tracing::debug!(pending = state.entries.len(), "timer thread stopped");
                        return;
                    }
                    let next = state.entries.keys().next().map(|key| key.deadline);
                    match next {
                        Some(deadline) if deadline <= Instant::now() => break,
                        Some(deadline) => {
                            self.cond.wait_until(&mut state, deadline);
                        }
                        None => self.cond.wait(&mut state),
                    }
                }

                let now = Instant::now();
                while let Some(entry) = state.entries.first_entry() {
                    if entry.key().deadline > now {
                        break;
                    }
                    let (key, pid) = entry.remove_entry();
                    due.push((pid, key));
                }
            }

            for (pid, key) in due.drain(..) {
                tracing::trace!(pid = %pid, "receive deadline expired");
                expire(pid, key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn start(service: &Arc<TimerService>) -> (
        std::thread::JoinHandle<()>,
        crossbeam::channel::Receiver<Pid>,
    ) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let service = Arc::clone(service);
        let handle = std::thread::spawn(move || {
            service.run(|pid, _key| {
                let _ = tx.send(pid);
            })
        });
        (handle, rx)
    }

    #[test]
    fn test_expires_in_deadline_order() {
        let service = Arc::new(TimerService::new());
        let (handle, rx) = start(&service);

        let now = Instant::now();
        service.register(now + Duration::from_millis(60), Pid::new(3, 0));
        service.register(now + Duration::from_millis(20), Pid::new(1, 0));
        service.register(now + Duration::from_millis(40), Pid::new(2, 0));

        let order: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().index())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(service.len(), 0);

        service.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let service = Arc::new(TimerService::new());
        let (handle, rx) = start(&service);

        let now = Instant::now();
        let key = service.register(now + Duration::from_millis(10), Pid::new(1, 0));
        service.register(now + Duration::from_millis(30), Pid::new(2, 0));
        assert!(service.cancel(key));
        assert!(!service.cancel(key));

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired.index(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        service.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_past_deadline_fires_immediately() {
        let service = Arc::new(TimerService::new());
        let (handle, rx) = start(&service);

        service.register(Instant::now(), Pid::new(9, 0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().index(), 9);

        service.shutdown();
        handle.join().unwrap();
    }
}
