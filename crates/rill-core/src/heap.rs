//! Generational handle heap with explicit strong counts.
//!
//! Heap-resident values are stored in slots addressed by [`Handle`]s. A
//! handle carries the slot generation, so a stale handle to a reused slot is
//! detected instead of aliasing the new occupant.
//!
//! ## Ownership
//!
//! Every *slot* that holds a value (a register, a global, a container
//! element, a pending exception, a host pin) owns one strong count, taken
//! through [`Heap::shift_ref`] or [`Heap::inc_ref`] and given back through
//! [`Heap::dec_ref`]. Fresh allocations start at zero. When a count drops to
//! zero the object is freed and its children are released iteratively.
//!
//! Instance→class and closure→routine edges are not heap edges at all (a
//! [`ClassId`] and an `Arc<Routine>` respectively), so the only cycles the
//! counts cannot reclaim are container/instance cycles. Those are found by
//! [`Heap::collect_cycles`], a synchronous trial-deletion pass: an object is
//! externally referenced when its strong count exceeds the references held by
//! other heap objects, and everything unreachable from externally referenced
//! objects is garbage.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::bytecode::Constant;
use crate::routine::Routine;
use crate::types::{ClassId, Ty, TypeTable};
use crate::value::{MapKey, Value};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// ============================================================================
// Heap objects
// ============================================================================

#[derive(Debug)]
pub struct ListObject {
    pub ty: Ty,
    pub items: Vec<Value>,
}

#[derive(Debug)]
pub struct MapObject {
    pub ty: Ty,
    pub entries: BTreeMap<MapKey, Value>,
}

/// Element storage of a numeric array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Int(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Int(v) => v.len(),
            ArrayData::Float(v) => v.len(),
            ArrayData::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        match self {
            ArrayData::Int(v) => v.get(i).map(|x| Value::Int(*x)),
            ArrayData::Float(v) => v.get(i).map(|x| Value::Float(*x)),
            ArrayData::Double(v) => v.get(i).map(|x| Value::Double(*x)),
        }
    }

    /// Store `value` converted to the element kind; `false` when out of range or not numeric.
    pub fn set(&mut self, i: usize, value: &Value) -> bool {
        match self {
            ArrayData::Int(v) => match (v.get_mut(i), value.as_int()) {
                (Some(slot), Some(x)) if value.is_numeric() => *slot = x,
                _ => return false,
            },
            ArrayData::Float(v) => match (v.get_mut(i), value.as_f64()) {
                (Some(slot), Some(x)) => *slot = x as f32,
                _ => return false,
            },
            ArrayData::Double(v) => match (v.get_mut(i), value.as_f64()) {
                (Some(slot), Some(x)) => *slot = x,
                _ => return false,
            },
        }
        true
    }
}

#[derive(Debug)]
pub struct ArrayObject {
    pub ty: Ty,
    pub data: ArrayData,
}

#[derive(Debug)]
pub struct TupleObject {
    pub ty: Ty,
    pub items: Vec<Value>,
}

/// Instance of a class; the class is reached by id lookup, never by a counted edge.
#[derive(Debug)]
pub struct InstanceObject {
    pub class: ClassId,
    pub ty: Ty,
    pub fields: Vec<Value>,
}

#[derive(Debug)]
pub struct ClosureObject {
    pub routine: Arc<Routine>,
    pub captures: Vec<Value>,
}

/// One call-chain entry recorded on an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub routine: Arc<str>,
    pub line: u32,
}

#[derive(Debug)]
pub struct ExceptionObject {
    pub ty: Ty,
    pub message: String,
    pub routine: Arc<str>,
    pub line: u32,
    pub trace: Vec<TraceEntry>,
    pub data: Value,
}

impl ExceptionObject {
    /// Most call-chain frames an exception records.
    pub const MAX_TRACE: usize = 5;

    pub fn category(&self) -> &str {
        self.ty.name()
    }
}

pub struct CDataObject {
    pub ty: Ty,
    pub data: Box<dyn Any + Send + Sync>,
}

impl fmt::Debug for CDataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CData({})", self.ty.name())
    }
}

#[derive(Debug)]
pub enum HeapObject {
    List(ListObject),
    Map(MapObject),
    Array(ArrayObject),
    Tuple(TupleObject),
    Instance(InstanceObject),
    Closure(ClosureObject),
    Exception(ExceptionObject),
    CData(CDataObject),
}

impl HeapObject {
    /// Values directly referenced by this object.
    fn children(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            HeapObject::List(l) => Box::new(l.items.iter()),
            HeapObject::Map(m) => Box::new(m.entries.values()),
            HeapObject::Tuple(t) => Box::new(t.items.iter()),
            HeapObject::Instance(o) => Box::new(o.fields.iter()),
            HeapObject::Closure(c) => Box::new(c.captures.iter()),
            HeapObject::Exception(e) => Box::new(std::iter::once(&e.data)),
            HeapObject::Array(_) | HeapObject::CData(_) => Box::new(std::iter::empty()),
        }
    }

    fn into_children(self) -> Vec<Value> {
        match self {
            HeapObject::List(l) => l.items,
            HeapObject::Map(m) => m.entries.into_values().collect(),
            HeapObject::Tuple(t) => t.items,
            HeapObject::Instance(o) => o.fields,
            HeapObject::Closure(c) => c.captures,
            HeapObject::Exception(e) => vec![e.data],
            HeapObject::Array(_) | HeapObject::CData(_) => Vec::new(),
        }
    }
}

// ============================================================================
// Heap
// ============================================================================

struct Slot {
    generation: u32,
    object: Option<HeapObject>,
    ref_count: u32,
    frozen: bool,
}

#[derive(Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
    since_collect: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an object with a zero strong count.
    pub fn alloc(&mut self, object: HeapObject) -> Handle {
        self.live += 1;
        self.since_collect += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.ref_count = 0;
            slot.frozen = false;
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                object: Some(object),
                ref_count: 0,
                frozen: false,
            });
            Handle {
                index,
                generation: 0,
            }
        }
    }

    fn slot(&self, h: Handle) -> Option<&Slot> {
        self.slots
            .get(h.index as usize)
            .filter(|s| s.generation == h.generation && s.object.is_some())
    }

    fn slot_mut(&mut self, h: Handle) -> Option<&mut Slot> {
        self.slots
            .get_mut(h.index as usize)
            .filter(|s| s.generation == h.generation && s.object.is_some())
    }

    pub fn get(&self, h: Handle) -> Option<&HeapObject> {
        self.slot(h).and_then(|s| s.object.as_ref())
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut HeapObject> {
        self.slot_mut(h).and_then(|s| s.object.as_mut())
    }

    pub fn contains(&self, h: Handle) -> bool {
        self.slot(h).is_some()
    }

    pub fn ref_count(&self, h: Handle) -> Option<u32> {
        self.slot(h).map(|s| s.ref_count)
    }

    /// Mark an object read-only; writes through it must be rejected.
    pub fn freeze(&mut self, h: Handle) {
        if let Some(slot) = self.slot_mut(h) {
            slot.frozen = true;
        }
    }

    pub fn is_frozen(&self, h: Handle) -> bool {
        self.slot(h).is_some_and(|s| s.frozen)
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Allocations since the last cycle collection.
    pub fn allocations_since_collect(&self) -> usize {
        self.since_collect
    }

    pub fn inc_ref(&mut self, value: &Value) {
        if let Some(slot) = value.handle().and_then(|h| self.slot_mut(h)) {
            slot.ref_count += 1;
        }
    }

    /// Give back one strong count, freeing the object (and releasing its
    /// children) when none remain.
    pub fn dec_ref(&mut self, value: &Value) {
        let mut pending: Vec<Value> = Vec::new();
        self.release_one(value, &mut pending);
        while let Some(next) = pending.pop() {
            self.release_one(&next, &mut pending);
        }
    }

    fn release_one(&mut self, value: &Value, pending: &mut Vec<Value>) {
        let Some(h) = value.handle() else { return };
        let Some(slot) = self.slot_mut(h) else { return };
        slot.ref_count = slot.ref_count.saturating_sub(1);
        if slot.ref_count == 0 {
            if let Some(object) = self.free(h) {
                pending.extend(object.into_children());
            }
        }
    }

    fn free(&mut self, h: Handle) -> Option<HeapObject> {
        let slot = self.slot_mut(h)?;
        let object = slot.object.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.ref_count = 0;
        slot.frozen = false;
        self.free_list.push(h.index);
        self.live -= 1;
        object
    }

    /// Store `new` into `slot`, taking a count for it before giving back the old one.
    pub fn shift_ref(&mut self, new: Value, slot: &mut Value) {
        self.inc_ref(&new);
        let old = std::mem::replace(slot, new);
        self.dec_ref(&old);
    }

    /// Reclaim unreachable cycles; returns the number of objects freed.
    pub fn collect_cycles(&mut self) -> usize {
        self.since_collect = 0;
        let n = self.slots.len();
        let mut internal = vec![0u32; n];
        for slot in &self.slots {
            let Some(object) = &slot.object else { continue };
            for child in object.children() {
                if let Some(h) = child.handle() {
                    if self.slot(h).is_some() {
                        internal[h.index as usize] += 1;
                    }
                }
            }
        }

        let mut marked = vec![false; n];
        let mut stack: Vec<usize> = (0..n)
            .filter(|&i| {
                let slot = &self.slots[i];
                slot.object.is_some() && slot.ref_count > internal[i]
            })
            .collect();
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut marked[i], true) {
                continue;
            }
            if let Some(object) = &self.slots[i].object {
                for child in object.children() {
                    if let Some(h) = child.handle() {
                        if self.slot(h).is_some() && !marked[h.index as usize] {
                            stack.push(h.index as usize);
                        }
                    }
                }
            }
        }

        let garbage: Vec<Handle> = (0..n)
            .filter(|&i| self.slots[i].object.is_some() && !marked[i])
            .map(|i| Handle {
                index: i as u32,
                generation: self.slots[i].generation,
            })
            .collect();
        let mut survivors_released: Vec<Handle> = Vec::new();
        for h in &garbage {
            if let Some(object) = self.get(*h) {
                for child in object.children() {
                    if let Some(c) = child.handle() {
                        if self.slot(c).is_some() && marked[c.index as usize] {
                            survivors_released.push(c);
                        }
                    }
                }
            }
        }
        for h in &garbage {
            self.free(*h);
        }
        for c in survivors_released {
            if let Some(slot) = self.slot_mut(c) {
                slot.ref_count = slot.ref_count.saturating_sub(1);
            }
        }
        if !garbage.is_empty() {
            tracing::debug!(freed = garbage.len(), live = self.live, "collected heap cycles");
        }
        garbage.len()
    }

    // ========================================================================
    // Construction helpers
    // ========================================================================

    /// Allocate a container holding `items`, taking a count for each item.
    pub fn new_list(&mut self, ty: Ty, items: Vec<Value>) -> Value {
        for item in &items {
            self.inc_ref(item);
        }
        Value::List(self.alloc(HeapObject::List(ListObject { ty, items })))
    }

    pub fn new_tuple(&mut self, ty: Ty, items: Vec<Value>) -> Value {
        for item in &items {
            self.inc_ref(item);
        }
        Value::Tuple(self.alloc(HeapObject::Tuple(TupleObject { ty, items })))
    }

    pub fn new_map(&mut self, ty: Ty, entries: BTreeMap<MapKey, Value>) -> Value {
        for v in entries.values() {
            self.inc_ref(v);
        }
        Value::Map(self.alloc(HeapObject::Map(MapObject { ty, entries })))
    }

    pub fn new_array(&mut self, ty: Ty, data: ArrayData) -> Value {
        Value::Array(self.alloc(HeapObject::Array(ArrayObject { ty, data })))
    }

    pub fn new_instance(&mut self, class: ClassId, ty: Ty, fields: Vec<Value>) -> Value {
        for f in &fields {
            self.inc_ref(f);
        }
        Value::Object(self.alloc(HeapObject::Instance(InstanceObject { class, ty, fields })))
    }

    pub fn new_closure(&mut self, routine: Arc<Routine>, captures: Vec<Value>) -> Value {
        for c in &captures {
            self.inc_ref(c);
        }
        Value::Closure(self.alloc(HeapObject::Closure(ClosureObject { routine, captures })))
    }

    pub fn new_cdata(&mut self, ty: Ty, data: Box<dyn Any + Send + Sync>) -> Value {
        Value::CData(self.alloc(HeapObject::CData(CDataObject { ty, data })))
    }

    pub fn new_exception(&mut self, exception: ExceptionObject) -> Value {
        self.inc_ref(&exception.data);
        Value::Exception(self.alloc(HeapObject::Exception(exception)))
    }

    /// Turn a constant into a value. Container constants become frozen objects.
    pub fn materialize(&mut self, constant: &Constant) -> Value {
        match constant {
            Constant::List(ty, items) => {
                let values = items.iter().map(|c| self.materialize(c)).collect();
                let v = self.new_list(ty.clone(), values);
                self.freeze_value(&v);
                v
            }
            Constant::Tuple(ty, items) => {
                let values = items.iter().map(|c| self.materialize(c)).collect();
                let v = self.new_tuple(ty.clone(), values);
                self.freeze_value(&v);
                v
            }
            Constant::Map(ty, entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let key = self.materialize(k);
                    let value = self.materialize(v);
                    if let Some(key) = MapKey::from_value(&key) {
                        map.insert(key, value);
                    }
                }
                let v = self.new_map(ty.clone(), map);
                self.freeze_value(&v);
                v
            }
            other => other.scalar_value().unwrap_or_default(),
        }
    }

    fn freeze_value(&mut self, v: &Value) {
        if let Some(h) = v.handle() {
            self.freeze(h);
        }
    }

    /// Run-time type of a value.
    pub fn type_of(&self, value: &Value) -> Ty {
        let types = TypeTable::global();
        match value {
            Value::None => types.none(),
            Value::Int(_) => types.int(),
            Value::Float(_) => types.float(),
            Value::Double(_) => types.double(),
            Value::Complex(_) => types.complex(),
            Value::Enum(ty, _) => ty.clone(),
            Value::String(_) => types.string(),
            Value::Routine(r) => r.signature(),
            Value::Overloads(o) => o
                .routines()
                .first()
                .map(|r| r.signature())
                .unwrap_or_else(|| types.any()),
            Value::Class(c) => c.class_type.clone(),
            Value::Process(_) => types.process(types.any()),
            _ => match value.handle().and_then(|h| self.get(h)) {
                Some(HeapObject::List(l)) => l.ty.clone(),
                Some(HeapObject::Map(m)) => m.ty.clone(),
                Some(HeapObject::Array(a)) => a.ty.clone(),
                Some(HeapObject::Tuple(t)) => t.ty.clone(),
                Some(HeapObject::Instance(o)) => o.ty.clone(),
                Some(HeapObject::Closure(c)) => c.routine.signature(),
                Some(HeapObject::Exception(e)) => e.ty.clone(),
                Some(HeapObject::CData(c)) => c.ty.clone(),
                None => types.none(),
            },
        }
    }

    /// Printable rendering of a value, following containers.
    pub fn display(&self, value: &Value) -> String {
        let join = |items: &[Value]| {
            items
                .iter()
                .map(|v| self.display(v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match value {
            Value::None => "none".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Double(d) => d.to_string(),
            Value::Complex(c) => c.to_string(),
            Value::String(s) => s.to_string(),
            _ => match value.handle().and_then(|h| self.get(h)) {
                Some(HeapObject::List(l)) => format!("{{ {} }}", join(&l.items)),
                Some(HeapObject::Tuple(t)) => format!("( {} )", join(&t.items)),
                Some(HeapObject::Map(m)) => {
                    let key_ty = m.ty.key_value().map(|(k, _)| k.clone());
                    let parts: Vec<String> = m
                        .entries
                        .iter()
                        .map(|(k, v)| {
                            format!(
                                "{} => {}",
                                self.display(&k.to_value(key_ty.as_ref())),
                                self.display(v)
                            )
                        })
                        .collect();
                    format!("{{ {} }}", parts.join(", "))
                }
                Some(HeapObject::Array(a)) => {
                    let items: Vec<Value> = (0..a.data.len()).filter_map(|i| a.data.get(i)).collect();
                    format!("[ {} ]", join(&items))
                }
                Some(HeapObject::Exception(e)) => format!("{}: {}", e.category(), e.message),
                _ => format!("{value:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_list(heap: &mut Heap, items: Vec<Value>) -> Value {
        let types = TypeTable::global();
        heap.new_list(types.list(types.int()), items)
    }

    #[test]
    fn shift_ref_counts_slots() {
        let mut heap = Heap::new();
        let list = int_list(&mut heap, vec![Value::Int(1)]);
        let h = list.handle().unwrap();
        assert_eq!(heap.ref_count(h), Some(0));

        let mut reg_a = Value::None;
        let mut reg_b = Value::None;
        heap.shift_ref(list.clone(), &mut reg_a);
        heap.shift_ref(list.clone(), &mut reg_b);
        assert_eq!(heap.ref_count(h), Some(2));

        heap.shift_ref(Value::None, &mut reg_a);
        assert!(heap.contains(h));
        heap.shift_ref(Value::None, &mut reg_b);
        assert!(!heap.contains(h));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn freeing_releases_children() {
        let mut heap = Heap::new();
        let inner = int_list(&mut heap, vec![Value::Int(7)]);
        let types = TypeTable::global();
        let outer = heap.new_list(types.list(types.any()), vec![inner.clone()]);
        let mut reg = Value::None;
        heap.shift_ref(outer, &mut reg);
        assert_eq!(heap.live_count(), 2);
        heap.dec_ref(&reg);
        assert_eq!(heap.live_count(), 0);
        assert!(!heap.contains(inner.handle().unwrap()));
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut heap = Heap::new();
        let a = int_list(&mut heap, vec![]);
        let mut reg = Value::None;
        heap.shift_ref(a.clone(), &mut reg);
        heap.shift_ref(Value::None, &mut reg);
        let b = int_list(&mut heap, vec![]);
        assert_eq!(a.handle().unwrap().index(), b.handle().unwrap().index());
        assert!(heap.get(a.handle().unwrap()).is_none());
        assert!(heap.get(b.handle().unwrap()).is_some());
    }

    #[test]
    fn collect_cycles_frees_unreachable_cycle() {
        let types = TypeTable::global();
        let mut heap = Heap::new();
        let a = heap.new_list(types.list(types.any()), vec![]);
        let b = heap.new_list(types.list(types.any()), vec![a.clone()]);
        // close the cycle a -> b -> a
        if let Some(HeapObject::List(l)) = heap.get_mut(a.handle().unwrap()) {
            l.items.push(b.clone());
        }
        heap.inc_ref(&b);
        let kept = int_list(&mut heap, vec![]);
        let mut root = Value::None;
        heap.shift_ref(kept.clone(), &mut root);

        assert_eq!(heap.collect_cycles(), 2);
        assert_eq!(heap.live_count(), 1);
        assert!(heap.contains(kept.handle().unwrap()));
    }

    #[test]
    fn collect_cycles_keeps_externally_held_cycle() {
        let types = TypeTable::global();
        let mut heap = Heap::new();
        let a = heap.new_list(types.list(types.any()), vec![]);
        let b = heap.new_list(types.list(types.any()), vec![a.clone()]);
        if let Some(HeapObject::List(l)) = heap.get_mut(a.handle().unwrap()) {
            l.items.push(b.clone());
        }
        heap.inc_ref(&b);
        let mut reg = Value::None;
        heap.shift_ref(a.clone(), &mut reg);
        assert_eq!(heap.collect_cycles(), 0);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn materialized_containers_are_frozen() {
        let types = TypeTable::global();
        let mut heap = Heap::new();
        let c = Constant::List(
            types.list(types.int()),
            vec![Constant::Int(1), Constant::Int(2)],
        );
        let v = heap.materialize(&c);
        assert!(heap.is_frozen(v.handle().unwrap()));
        assert_eq!(heap.display(&v), "{ 1, 2 }");
    }

    #[test]
    fn array_set_converts_elements() {
        let mut data = ArrayData::Float(vec![0.0; 2]);
        assert!(data.set(1, &Value::Int(3)));
        assert!(!data.set(2, &Value::Int(3)));
        assert!(matches!(data.get(1), Some(Value::Float(f)) if f == 3.0));
    }
}
