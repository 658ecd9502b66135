//! Process identifiers.
//!
//! A `Pid` is an index into the process table plus the generation of the
//! slot at the time the process was spawned. When a process terminates its
//! slot generation is bumped, so stale handles fail lookup instead of
//! reaching whichever process reuses the slot.

use std::fmt;

/// Handle to a process.
///
/// Cheap to copy, comparable, and valid as a message payload
/// (`GcValue::Pid`). Holding a `Pid` does not keep the process alive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid {
    index: u32,
    generation: u32,
}

impl Pid {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the process table.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this process was spawned.
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single integer (index in the high half).
    pub const fn to_bits(&self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }

    /// Inverse of [`Pid::to_bits`].
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({}.{})", self.index, self.generation)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}>", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_roundtrip_keeps_generation() {
        let pid = Pid::new(7, 3);
        let back = Pid::from_bits(pid.to_bits());
        assert_eq!(back, pid);
        assert_eq!(back.index(), 7);
        assert_eq!(back.generation(), 3);
    }

    #[test]
    fn test_same_index_different_generation() {
        assert_ne!(Pid::new(1, 0), Pid::new(1, 1));
        assert_eq!(Pid::new(4, 2).to_string(), "<4.2>");
    }
}
