//! Per-process heaps.
//!
//! A simple mark-and-sweep heap designed for:
//! - Per-process isolation (one `Heap` per process, never shared)
//! - Collection only at scheduler safe points
//! - Cheap transfer of immutable buffers between processes
//!
//! # Design
//!
//! Objects live in a vector with a free list for slot reuse and are
//! addressed by `GcPtr<T>`, a typed `u32` index. Scalars and `Arc`-backed
//! immutable buffers are stored inline in `GcValue` and never touch the
//! object table. Collection marks everything reachable from the pinned
//! root set plus the roots supplied by the caller, then sweeps the rest
//! back onto the free list.
//!
//! # Usage
//!
//! ```
//! use islet_runtime::gc::{GcValue, Heap};
//!
//! let mut heap = Heap::new();
//! let ptr = heap.alloc_string("hello".to_string());
//! heap.add_root(ptr.as_raw());
//! heap.collect(); // ptr is a root, so it survives
//! assert_eq!(heap.display_value(&GcValue::String(ptr)), "hello");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::HeapConfig;
use crate::error::AllocError;
use crate::pid::Pid;

/// Raw index into the heap. Used for type-erased operations.
pub type RawGcPtr = u32;

/// A typed pointer to a heap object.
///
/// Just a `u32` index, so it is `Copy` and `Send`. It is only meaningful
/// together with the heap it was allocated from.
pub struct GcPtr<T> {
    index: RawGcPtr,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls avoid `T: Copy` style bounds
impl<T> Copy for GcPtr<T> {}

impl<T> Clone for GcPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> GcPtr<T> {
    pub(crate) fn from_raw(index: RawGcPtr) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    /// Get the raw index for this pointer.
    pub fn as_raw(&self) -> RawGcPtr {
        self.index
    }

    /// Check if two pointers point to the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcPtr({})", self.index)
    }
}

impl<T> PartialEq for GcPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for GcPtr<T> {}

impl<T> std::hash::Hash for GcPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

// ============================================================
// Heap object payloads
// ============================================================

/// A mutable, heap-resident string.
#[derive(Clone, Debug, PartialEq)]
pub struct GcString {
    pub data: String,
}

/// An immutable list.
#[derive(Clone, Debug)]
pub struct GcList {
    pub items: Vec<GcValue>,
}

/// A mutable array. Arrays may contain pointers to themselves.
#[derive(Clone, Debug)]
pub struct GcArray {
    pub items: Vec<GcValue>,
}

/// An immutable tuple.
#[derive(Clone, Debug)]
pub struct GcTuple {
    pub items: Vec<GcValue>,
}

/// A map with inline keys.
#[derive(Clone, Debug)]
pub struct GcMap {
    pub entries: HashMap<GcMapKey, GcValue>,
}

/// Keys usable in a `GcMap`. None of them reference the heap.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GcMapKey {
    Unit,
    Bool(bool),
    Int(i64),
    Char(char),
    Text(Arc<str>),
    Pid(Pid),
}

impl GcMapKey {
    pub fn text(s: impl Into<Arc<str>>) -> Self {
        GcMapKey::Text(s.into())
    }
}

/// A record with named, mutable fields.
#[derive(Clone, Debug)]
pub struct GcRecord {
    pub type_name: String,
    pub field_names: Vec<String>,
    pub fields: Vec<GcValue>,
}

impl GcRecord {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&GcValue> {
        self.field_names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.fields.get(i))
    }
}

// ============================================================
// Values
// ============================================================

/// A value as seen by process code.
///
/// Scalars and `Arc` buffers are inline. Everything else is a pointer
/// into the owning process's heap. `PartialEq` compares heap values by
/// identity, not structure.
#[derive(Clone, Debug, PartialEq)]
pub enum GcValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Pid(Pid),
    /// Immutable shared text; copying bumps the reference count
    Text(Arc<str>),
    /// Immutable shared bytes; copying bumps the reference count
    Bytes(Arc<[u8]>),
    String(GcPtr<GcString>),
    List(GcPtr<GcList>),
    Array(GcPtr<GcArray>),
    Tuple(GcPtr<GcTuple>),
    Map(GcPtr<GcMap>),
    Record(GcPtr<GcRecord>),
}

impl GcValue {
    /// Shared immutable text.
    pub fn text(s: impl Into<Arc<str>>) -> Self {
        GcValue::Text(s.into())
    }

    /// Shared immutable bytes.
    pub fn bytes(b: impl Into<Arc<[u8]>>) -> Self {
        GcValue::Bytes(b.into())
    }

    /// The heap object this value points at, if any.
    pub fn heap_ptr(&self) -> Option<RawGcPtr> {
        match self {
            GcValue::String(p) => Some(p.as_raw()),
            GcValue::List(p) => Some(p.as_raw()),
            GcValue::Array(p) => Some(p.as_raw()),
            GcValue::Tuple(p) => Some(p.as_raw()),
            GcValue::Map(p) => Some(p.as_raw()),
            GcValue::Record(p) => Some(p.as_raw()),
            _ => None,
        }
    }

    /// Same kind of heap value, pointing at `raw` instead.
    pub(crate) fn with_ptr(&self, raw: RawGcPtr) -> GcValue {
        match self {
            GcValue::String(_) => GcValue::String(GcPtr::from_raw(raw)),
            GcValue::List(_) => GcValue::List(GcPtr::from_raw(raw)),
            GcValue::Array(_) => GcValue::Array(GcPtr::from_raw(raw)),
            GcValue::Tuple(_) => GcValue::Tuple(GcPtr::from_raw(raw)),
            GcValue::Map(_) => GcValue::Map(GcPtr::from_raw(raw)),
            GcValue::Record(_) => GcValue::Record(GcPtr::from_raw(raw)),
            other => other.clone(),
        }
    }

    /// Check if this is an immediate (non-heap, non-buffer) value.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            GcValue::Unit
                | GcValue::Bool(_)
                | GcValue::Int(_)
                | GcValue::Float(_)
                | GcValue::Char(_)
                | GcValue::Pid(_)
        )
    }

    /// Check if this is a reference-counted immutable buffer.
    pub fn is_shared(&self) -> bool {
        matches!(self, GcValue::Text(_) | GcValue::Bytes(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            GcValue::Unit => "Unit",
            GcValue::Bool(_) => "Bool",
            GcValue::Int(_) => "Int",
            GcValue::Float(_) => "Float",
            GcValue::Char(_) => "Char",
            GcValue::Pid(_) => "Pid",
            GcValue::Text(_) => "Text",
            GcValue::Bytes(_) => "Bytes",
            GcValue::String(_) => "String",
            GcValue::List(_) => "List",
            GcValue::Array(_) => "Array",
            GcValue::Tuple(_) => "Tuple",
            GcValue::Map(_) => "Map",
            GcValue::Record(_) => "Record",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            GcValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_pid(&self) -> Option<Pid> {
        match self {
            GcValue::Pid(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            GcValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to a map key, if this value can be one.
    pub fn to_map_key(&self) -> Option<GcMapKey> {
        match self {
            GcValue::Unit => Some(GcMapKey::Unit),
            GcValue::Bool(b) => Some(GcMapKey::Bool(*b)),
            GcValue::Int(i) => Some(GcMapKey::Int(*i)),
            GcValue::Char(c) => Some(GcMapKey::Char(*c)),
            GcValue::Text(s) => Some(GcMapKey::Text(s.clone())),
            GcValue::Pid(p) => Some(GcMapKey::Pid(*p)),
            _ => None,
        }
    }
}

impl From<GcMapKey> for GcValue {
    fn from(key: GcMapKey) -> Self {
        match key {
            GcMapKey::Unit => GcValue::Unit,
            GcMapKey::Bool(b) => GcValue::Bool(b),
            GcMapKey::Int(i) => GcValue::Int(i),
            GcMapKey::Char(c) => GcValue::Char(c),
            GcMapKey::Text(s) => GcValue::Text(s),
            GcMapKey::Pid(p) => GcValue::Pid(p),
        }
    }
}

// ============================================================
// Heap objects
// ============================================================

/// A heap object with GC metadata.
#[derive(Clone, Debug)]
pub struct GcObject {
    /// The actual data
    pub data: HeapData,
    /// Mark bit for garbage collection
    pub marked: bool,
    /// Size estimate in bytes (for memory pressure tracking)
    pub size: usize,
}

/// The data stored in a heap object.
#[derive(Clone, Debug)]
pub enum HeapData {
    String(GcString),
    List(GcList),
    Array(GcArray),
    Tuple(GcTuple),
    Map(GcMap),
    Record(GcRecord),
}

impl HeapData {
    /// An empty stand-in, used while an object's payload is taken out.
    pub(crate) fn placeholder() -> Self {
        HeapData::Tuple(GcTuple { items: Vec::new() })
    }

    /// Visit every value stored directly in this object.
    pub fn children(&self) -> impl Iterator<Item = &GcValue> {
        let (items, map): (&[GcValue], Option<&HashMap<GcMapKey, GcValue>>) = match self {
            HeapData::String(_) => (&[][..], None),
            HeapData::List(l) => (l.items.as_slice(), None),
            HeapData::Array(a) => (a.items.as_slice(), None),
            HeapData::Tuple(t) => (t.items.as_slice(), None),
            HeapData::Map(m) => (&[][..], Some(&m.entries)),
            HeapData::Record(r) => (r.fields.as_slice(), None),
        };
        items.iter().chain(map.into_iter().flat_map(|m| m.values()))
    }

    /// Mutable counterpart of [`HeapData::children`].
    pub(crate) fn children_mut(&mut self) -> Box<dyn Iterator<Item = &mut GcValue> + '_> {
        match self {
            HeapData::String(_) => Box::new(std::iter::empty()),
            HeapData::List(l) => Box::new(l.items.iter_mut()),
            HeapData::Array(a) => Box::new(a.items.iter_mut()),
            HeapData::Tuple(t) => Box::new(t.items.iter_mut()),
            HeapData::Map(m) => Box::new(m.entries.values_mut()),
            HeapData::Record(r) => Box::new(r.fields.iter_mut()),
        }
    }

    /// Estimate the size of this object in bytes.
    pub fn estimate_size(&self) -> usize {
        let value = std::mem::size_of::<GcValue>();
        match self {
            HeapData::String(s) => std::mem::size_of::<GcString>() + s.data.len(),
            HeapData::List(l) => std::mem::size_of::<GcList>() + l.items.len() * value,
            HeapData::Array(a) => std::mem::size_of::<GcArray>() + a.items.len() * value,
            HeapData::Tuple(t) => std::mem::size_of::<GcTuple>() + t.items.len() * value,
            HeapData::Map(m) => {
                std::mem::size_of::<GcMap>()
                    + m.entries.len() * (std::mem::size_of::<GcMapKey>() + value)
            }
            HeapData::Record(r) => {
                std::mem::size_of::<GcRecord>()
                    + r.fields.len() * value
                    + r.type_name.len()
                    + r.field_names.iter().map(|s| s.len()).sum::<usize>()
            }
        }
    }
}

/// Statistics about GC activity.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    /// Number of collections performed
    pub collections: u64,
    /// Total objects allocated
    pub total_allocated: u64,
    /// Total objects freed
    pub total_freed: u64,
    /// Total bytes allocated
    pub total_bytes_allocated: u64,
    /// Total bytes freed
    pub total_bytes_freed: u64,
    /// Peak number of live objects
    pub peak_objects: usize,
    /// Peak heap size in bytes
    pub peak_bytes: usize,
}

// ============================================================
// Heap
// ============================================================

/// A garbage-collected heap owned by exactly one process.
pub struct Heap {
    /// Storage for all objects
    objects: Vec<Option<GcObject>>,
    /// Free list (indices of available slots)
    free_list: Vec<RawGcPtr>,
    /// Pinned roots that survive every collection
    roots: Vec<RawGcPtr>,
    /// Bytes allocated since last collection
    bytes_since_gc: usize,
    /// Bytes held by live objects
    bytes_live: usize,
    /// Number of live objects
    live: usize,
    config: HeapConfig,
    stats: GcStats,
}

impl Heap {
    /// Create a new heap with default configuration.
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Create a new heap with custom configuration.
    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            objects: Vec::with_capacity(config.initial_capacity),
            free_list: Vec::new(),
            roots: Vec::new(),
            bytes_since_gc: 0,
            bytes_live: 0,
            live: 0,
            config,
            stats: GcStats::default(),
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Bytes held by live objects.
    pub fn bytes_live(&self) -> usize {
        self.bytes_live
    }

    /// Total slots in the object table, live or free.
    pub fn capacity(&self) -> usize {
        self.objects.len()
    }

    /// Allocate an object, failing if it would exceed `max_bytes`.
    pub fn try_alloc(&mut self, data: HeapData) -> Result<RawGcPtr, AllocError> {
        let size = data.estimate_size();
        if let Some(limit) = self.config.max_bytes {
            if self.bytes_live + size > limit {
                return Err(AllocError {
                    limit,
                    used: self.bytes_live,
                    requested: size,
                });
            }
        }

        let obj = GcObject {
            data,
            marked: false,
            size,
        };

        self.stats.total_allocated += 1;
        self.stats.total_bytes_allocated += size as u64;
        self.bytes_since_gc += size;
        self.bytes_live += size;
        self.live += 1;

        let index = if let Some(free_idx) = self.free_list.pop() {
            self.objects[free_idx as usize] = Some(obj);
            free_idx
        } else {
            let idx = self.objects.len() as RawGcPtr;
            self.objects.push(Some(obj));
            idx
        };

        self.stats.peak_objects = self.stats.peak_objects.max(self.live);
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.bytes_live);

        Ok(index)
    }

    /// Allocate from process code. Exceeding the heap limit panics the
    /// process with an `AllocError` payload.
    fn alloc(&mut self, data: HeapData) -> RawGcPtr {
        match self.try_alloc(data) {
            Ok(ptr) => ptr,
            Err(err) => std::panic::panic_any(err),
        }
    }

    pub fn alloc_string(&mut self, s: String) -> GcPtr<GcString> {
        GcPtr::from_raw(self.alloc(HeapData::String(GcString { data: s })))
    }

    pub fn alloc_list(&mut self, items: Vec<GcValue>) -> GcPtr<GcList> {
        GcPtr::from_raw(self.alloc(HeapData::List(GcList { items })))
    }

    pub fn alloc_array(&mut self, items: Vec<GcValue>) -> GcPtr<GcArray> {
        GcPtr::from_raw(self.alloc(HeapData::Array(GcArray { items })))
    }

    pub fn alloc_tuple(&mut self, items: Vec<GcValue>) -> GcPtr<GcTuple> {
        GcPtr::from_raw(self.alloc(HeapData::Tuple(GcTuple { items })))
    }

    pub fn alloc_map(&mut self, entries: HashMap<GcMapKey, GcValue>) -> GcPtr<GcMap> {
        GcPtr::from_raw(self.alloc(HeapData::Map(GcMap { entries })))
    }

    pub fn alloc_record(
        &mut self,
        type_name: impl Into<String>,
        field_names: Vec<String>,
        fields: Vec<GcValue>,
    ) -> GcPtr<GcRecord> {
        let data = HeapData::Record(GcRecord {
            type_name: type_name.into(),
            field_names,
            fields,
        });
        GcPtr::from_raw(self.alloc(data))
    }

    pub fn get(&self, ptr: RawGcPtr) -> Option<&GcObject> {
        self.objects.get(ptr as usize).and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, ptr: RawGcPtr) -> Option<&mut GcObject> {
        self.objects.get_mut(ptr as usize).and_then(|o| o.as_mut())
    }

    pub fn get_string(&self, ptr: GcPtr<GcString>) -> Option<&GcString> {
        match &self.get(ptr.as_raw())?.data {
            HeapData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_string_mut(&mut self, ptr: GcPtr<GcString>) -> Option<&mut GcString> {
        match &mut self.get_mut(ptr.as_raw())?.data {
            HeapData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_list(&self, ptr: GcPtr<GcList>) -> Option<&GcList> {
        match &self.get(ptr.as_raw())?.data {
            HeapData::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get_array(&self, ptr: GcPtr<GcArray>) -> Option<&GcArray> {
        match &self.get(ptr.as_raw())?.data {
            HeapData::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn get_array_mut(&mut self, ptr: GcPtr<GcArray>) -> Option<&mut GcArray> {
        match &mut self.get_mut(ptr.as_raw())?.data {
            HeapData::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn get_tuple(&self, ptr: GcPtr<GcTuple>) -> Option<&GcTuple> {
        match &self.get(ptr.as_raw())?.data {
            HeapData::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn get_map(&self, ptr: GcPtr<GcMap>) -> Option<&GcMap> {
        match &self.get(ptr.as_raw())?.data {
            HeapData::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get_map_mut(&mut self, ptr: GcPtr<GcMap>) -> Option<&mut GcMap> {
        match &mut self.get_mut(ptr.as_raw())?.data {
            HeapData::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get_record(&self, ptr: GcPtr<GcRecord>) -> Option<&GcRecord> {
        match &self.get(ptr.as_raw())?.data {
            HeapData::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_record_mut(&mut self, ptr: GcPtr<GcRecord>) -> Option<&mut GcRecord> {
        match &mut self.get_mut(ptr.as_raw())?.data {
            HeapData::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Take an object's payload out, leaving a placeholder.
    pub(crate) fn take_data(&mut self, ptr: RawGcPtr) -> Option<HeapData> {
        self.get_mut(ptr)
            .map(|obj| std::mem::replace(&mut obj.data, HeapData::placeholder()))
    }

    /// Put back a payload removed with `take_data`.
    pub(crate) fn put_data(&mut self, ptr: RawGcPtr, data: HeapData) {
        if let Some(obj) = self.get_mut(ptr) {
            obj.data = data;
        }
    }

    /// Deep copy a value from another heap into this one.
    pub fn deep_copy(&mut self, value: &GcValue, source: &Heap) -> Result<GcValue, AllocError> {
        crate::copy::copy(value, source, self)
    }

    /// Format a value for display.
    pub fn display_value(&self, value: &GcValue) -> String {
        match value {
            GcValue::Unit => "()".to_string(),
            GcValue::Bool(b) => b.to_string(),
            GcValue::Int(i) => i.to_string(),
            GcValue::Float(f) => f.to_string(),
            GcValue::Char(c) => c.to_string(),
            GcValue::Pid(p) => p.to_string(),
            GcValue::Text(s) => s.to_string(),
            GcValue::Bytes(b) => format!("<<{} bytes>>", b.len()),
            GcValue::String(ptr) => match self.get_string(*ptr) {
                Some(s) => s.data.clone(),
                None => "<invalid string>".to_string(),
            },
            GcValue::List(ptr) => match self.get_list(*ptr) {
                Some(list) => format!("[{}]", self.display_items(&list.items)),
                None => "<invalid list>".to_string(),
            },
            GcValue::Array(ptr) => match self.get_array(*ptr) {
                Some(arr) => format!("Array[{}]", arr.items.len()),
                None => "<invalid array>".to_string(),
            },
            GcValue::Tuple(ptr) => match self.get_tuple(*ptr) {
                Some(tuple) => format!("({})", self.display_items(&tuple.items)),
                None => "<invalid tuple>".to_string(),
            },
            GcValue::Map(ptr) => match self.get_map(*ptr) {
                Some(map) => format!("%{{...{} entries}}", map.entries.len()),
                None => "<invalid map>".to_string(),
            },
            GcValue::Record(ptr) => match self.get_record(*ptr) {
                Some(rec) => {
                    let fields: Vec<String> = rec
                        .field_names
                        .iter()
                        .zip(rec.fields.iter())
                        .map(|(name, val)| format!("{}: {}", name, self.display_value(val)))
                        .collect();
                    format!("{}{{{}}}", rec.type_name, fields.join(", "))
                }
                None => "<invalid record>".to_string(),
            },
        }
    }

    fn display_items(&self, items: &[GcValue]) -> String {
        items
            .iter()
            .map(|v| self.display_value(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    // ============================================================
    // Collection
    // ============================================================

    /// Pin an object so it survives every collection.
    pub fn add_root(&mut self, ptr: RawGcPtr) {
        if !self.roots.contains(&ptr) {
            self.roots.push(ptr);
        }
    }

    pub fn remove_root(&mut self, ptr: RawGcPtr) {
        self.roots.retain(|&r| r != ptr);
    }

    pub fn roots(&self) -> &[RawGcPtr] {
        &self.roots
    }

    /// Check if enough has been allocated to warrant a collection.
    pub fn should_collect(&self) -> bool {
        self.bytes_since_gc >= self.config.gc_threshold
    }

    /// Collect using only the pinned roots.
    pub fn collect(&mut self) -> usize {
        self.collect_with(&[])
    }

    /// Collect, treating `extra` as additional roots. Returns the number
    /// of objects freed.
    pub fn collect_with(&mut self, extra: &[GcValue]) -> usize {
        self.stats.collections += 1;
        let before = self.live;

        self.mark_phase(extra);
        let freed = self.sweep_phase();

        tracing::debug!(
            collection = self.stats.collections,
            before,
            freed,
            live = self.live,
            bytes_live = self.bytes_live,
            "heap collected"
        );

        self.bytes_since_gc = 0;
        freed
    }

    /// Collect if threshold exceeded, otherwise do nothing.
    pub fn maybe_collect(&mut self, extra: &[GcValue]) {
        if self.should_collect() {
            self.collect_with(extra);
        }
    }

    fn mark_phase(&mut self, extra: &[GcValue]) {
        for obj in self.objects.iter_mut().flatten() {
            obj.marked = false;
        }

        let mut worklist: Vec<RawGcPtr> = self.roots.clone();
        worklist.extend(extra.iter().filter_map(GcValue::heap_ptr));

        while let Some(ptr) = worklist.pop() {
            if let Some(obj) = self.objects.get_mut(ptr as usize).and_then(|o| o.as_mut()) {
                if !obj.marked {
                    obj.marked = true;
                    worklist.extend(obj.data.children().filter_map(GcValue::heap_ptr));
                }
            }
        }
    }

    fn sweep_phase(&mut self) -> usize {
        let mut freed = 0;
        let mut bytes_freed = 0;

        for (i, slot) in self.objects.iter_mut().enumerate() {
            if matches!(slot, Some(obj) if !obj.marked) {
                if let Some(obj) = slot.take() {
                    bytes_freed += obj.size;
                    freed += 1;
                    self.free_list.push(i as RawGcPtr);
                }
            }
        }

        self.live -= freed;
        self.bytes_live -= bytes_freed;
        self.stats.total_freed += freed as u64;
        self.stats.total_bytes_freed += bytes_freed as u64;

        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live_objects", &self.live)
            .field("bytes_live", &self.bytes_live)
            .field("roots", &self.roots.len())
            .field("collections", &self.stats.collections)
            .finish()
    }
}
