//! Copying values between heaps.
//!
//! `copy` duplicates everything reachable from a value into another heap.
//! Scalars are copied by value and `Arc` buffers by bumping their count;
//! heap objects are cloned structurally. A visited map keyed by source
//! index keeps shared substructure shared and makes cycles terminate. The
//! traversal uses an explicit work list, so graph depth never grows the
//! native stack.
//!
//! `Message` is a value graph in transit: captured out of the sender's heap
//! into a private staging heap, and materialised into the receiver's heap
//! on dequeue.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::HeapConfig;
use crate::error::AllocError;
use crate::gc::{GcValue, Heap, HeapData, RawGcPtr};
use crate::pid::Pid;

/// Deep copy `value` (which lives in `source`) into `dest`.
///
/// Never fails on the kind of value; the only failure is `dest` running
/// out of room. Pointers that do not resolve in `source` copy as `Unit`.
pub fn copy(value: &GcValue, source: &Heap, dest: &mut Heap) -> Result<GcValue, AllocError> {
    let Some(root) = value.heap_ptr() else {
        return Ok(value.clone());
    };

    let mut copier = Copier {
        source,
        dest,
        visited: HashMap::new(),
        pending: Vec::new(),
    };
    let copied = match copier.visit(root)? {
        Some(dst) => value.with_ptr(dst),
        None => GcValue::Unit,
    };
    copier.drain()?;
    Ok(copied)
}

struct Copier<'a> {
    source: &'a Heap,
    dest: &'a mut Heap,
    /// source index -> destination index
    visited: HashMap<RawGcPtr, RawGcPtr>,
    /// Destination objects whose children still point into `source`
    pending: Vec<RawGcPtr>,
}

impl Copier<'_> {
    /// Destination index for a source object, allocating it on first sight.
    fn visit(&mut self, src: RawGcPtr) -> Result<Option<RawGcPtr>, AllocError> {
        if let Some(&dst) = self.visited.get(&src) {
            return Ok(Some(dst));
        }
        let Some(obj) = self.source.get(src) else {
            return Ok(None);
        };
        let dst = self.dest.try_alloc(obj.data.clone())?;
        self.visited.insert(src, dst);
        self.pending.push(dst);
        Ok(Some(dst))
    }

    fn drain(&mut self) -> Result<(), AllocError> {
        while let Some(dst) = self.pending.pop() {
            let Some(mut data) = self.dest.take_data(dst) else {
                continue;
            };
            let result = self.remap(&mut data);
            self.dest.put_data(dst, data);
            result?;
        }
        Ok(())
    }

    fn remap(&mut self, data: &mut HeapData) -> Result<(), AllocError> {
        for child in data.children_mut() {
            if let Some(src) = child.heap_ptr() {
                *child = match self.visit(src)? {
                    Some(dst) => child.with_ptr(dst),
                    None => GcValue::Unit,
                };
            }
        }
        Ok(())
    }
}

// ============================================================
// Messages
// ============================================================

/// A value detached from any process heap.
///
/// Owns a staging heap holding a private copy of the graph, so it can cross
/// threads. Inline values carry an empty staging heap and never allocate.
#[derive(Debug)]
pub struct Message {
    heap: Heap,
    root: GcValue,
}

impl Message {
    /// Copy `value` out of `source`.
    pub fn capture(value: &GcValue, source: &Heap) -> Result<Self, AllocError> {
        let mut heap = Heap::with_config(HeapConfig::staging());
        let root = copy(value, source, &mut heap)?;
        Ok(Self { heap, root })
    }

    /// Build a message directly in a fresh staging heap.
    ///
    /// ```
    /// use islet_runtime::Message;
    /// use islet_runtime::gc::GcValue;
    ///
    /// let msg = Message::build(|heap| {
    ///     let s = heap.alloc_string("hi".to_string());
    ///     GcValue::Tuple(heap.alloc_tuple(vec![GcValue::Int(1), GcValue::String(s)]))
    /// });
    /// assert!(!msg.is_inline());
    /// ```
    pub fn build(f: impl FnOnce(&mut Heap) -> GcValue) -> Self {
        let mut heap = Heap::with_config(HeapConfig::staging());
        let root = f(&mut heap);
        Self { heap, root }
    }

    fn inline(root: GcValue) -> Self {
        Self {
            heap: Heap::with_config(HeapConfig::staging()),
            root,
        }
    }

    /// Copy this message into `dest`, returning the new root.
    pub fn materialize(&self, dest: &mut Heap) -> Result<GcValue, AllocError> {
        copy(&self.root, &self.heap, dest)
    }

    /// True when the payload needs no heap at all.
    pub fn is_inline(&self) -> bool {
        self.root.heap_ptr().is_none()
    }

    pub fn root(&self) -> &GcValue {
        &self.root
    }

    /// The staging heap backing `root`.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }
}

impl From<()> for Message {
    fn from(_: ()) -> Self {
        Message::inline(GcValue::Unit)
    }
}

impl From<bool> for Message {
    fn from(b: bool) -> Self {
        Message::inline(GcValue::Bool(b))
    }
}

impl From<i64> for Message {
    fn from(i: i64) -> Self {
        Message::inline(GcValue::Int(i))
    }
}

impl From<f64> for Message {
    fn from(f: f64) -> Self {
        Message::inline(GcValue::Float(f))
    }
}

impl From<char> for Message {
    fn from(c: char) -> Self {
        Message::inline(GcValue::Char(c))
    }
}

impl From<Pid> for Message {
    fn from(pid: Pid) -> Self {
        Message::inline(GcValue::Pid(pid))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::inline(GcValue::text(s))
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::inline(GcValue::text(s))
    }
}

impl From<Arc<str>> for Message {
    fn from(s: Arc<str>) -> Self {
        Message::inline(GcValue::Text(s))
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Message::inline(GcValue::bytes(b))
    }
}
