//! Process table.
//!
//! A fixed-capacity arena of process control blocks addressed by
//! generation-checked `Pid`s. Each slot has its own lock, so lookups of
//! different processes never contend; only allocating and freeing a slot
//! touch the shared free list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::SpawnError;
use crate::pid::Pid;
use crate::process::Control;

struct Slot {
    generation: u32,
    control: Option<Arc<Control>>,
}

struct FreeList {
    /// Released slots, reused oldest first
    released: VecDeque<u32>,
    /// Slots never handed out yet start here
    next_fresh: u32,
}

pub(crate) struct ProcessTable {
    slots: Box<[RwLock<Slot>]>,
    free: Mutex<FreeList>,
    len: AtomicUsize,
}

impl ProcessTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize);
        let slots = (0..capacity)
            .map(|_| {
                RwLock::new(Slot {
                    generation: 0,
                    control: None,
                })
            })
            .collect();
        Self {
            slots,
            free: Mutex::new(FreeList {
                released: VecDeque::new(),
                next_fresh: 0,
            }),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Claim a slot and fill it with the control block built by `make`.
    pub(crate) fn insert(
        &self,
        make: impl FnOnce(Pid) -> Arc<Control>,
    ) -> Result<Arc<Control>, SpawnError> {
        let index = {
            let mut free = self.free.lock();
            match free.released.pop_front() {
                Some(index) => index,
                None if (free.next_fresh as usize) < self.slots.len() => {
                    free.next_fresh += 1;
                    free.next_fresh - 1
                }
                None => {
                    return Err(SpawnError::TableFull {
                        capacity: self.slots.len(),
                    })
                }
            }
        };

        let mut slot = self.slots[index as usize].write();
        let control = make(Pid::new(index, slot.generation));
        slot.control = Some(Arc::clone(&control));
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok(control)
    }

    /// Look up a live process. Stale pids miss.
    pub(crate) fn get(&self, pid: Pid) -> Option<Arc<Control>> {
        let slot = self.slots.get(pid.index() as usize)?.read();
        if slot.generation != pid.generation() {
            return None;
        }
        slot.control.clone()
    }

    /// Remove a process and retire its pid.
    pub(crate) fn remove(&self, pid: Pid) -> Option<Arc<Control>> {
        let control = {
            let mut slot = self.slots.get(pid.index() as usize)?.write();
            if slot.generation != pid.generation() {
                return None;
            }
            let control = slot.control.take()?;
            slot.generation = slot.generation.wrapping_add(1);
            control
        };
        self.free.lock().released.push_back(pid.index());
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(control)
    }

    /// Snapshot of live pids.
    pub(crate) fn pids(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let slot = slot.read();
                slot.control
                    .as_ref()
                    .map(|_| Pid::new(index as u32, slot.generation))
            })
            .collect()
    }

    /// Empty every slot, returning what was there. Used at shutdown.
    pub(crate) fn drain(&self) -> Vec<Arc<Control>> {
        let drained: Vec<Arc<Control>> = self
            .slots
            .iter()
            .filter_map(|slot| slot.write().control.take())
            .collect();
        self.len.fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(table: &ProcessTable) -> Pid {
        table
            .insert(|pid| Arc::new(Control::new(pid)))
            .map(|control| control.pid)
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let table = ProcessTable::with_capacity(4);
        let a = insert(&table);
        let b = insert(&table);

        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a).unwrap().pid, a);
        assert_eq!(table.pids(), vec![a, b]);
    }

    #[test]
    fn test_stale_pid_misses_after_reuse() {
        let table = ProcessTable::with_capacity(1);
        let old = insert(&table);
        assert!(table.remove(old).is_some());
        assert!(table.get(old).is_none());

        let new = insert(&table);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert!(table.get(old).is_none());
        assert!(table.remove(old).is_none());
        assert!(table.get(new).is_some());
    }

    #[test]
    fn test_table_full() {
        let table = ProcessTable::with_capacity(2);
        insert(&table);
        insert(&table);
        let err = table
            .insert(|pid| Arc::new(Control::new(pid)))
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, SpawnError::TableFull { capacity: 2 });
    }

    #[test]
    fn test_drain_empties_table() {
        let table = ProcessTable::with_capacity(8);
        let pid = insert(&table);
        insert(&table);

        assert_eq!(table.drain().len(), 2);
        assert_eq!(table.len(), 0);
        assert!(table.get(pid).is_none());
    }
}
