//! Container items, fields and construction.
//!
//! Items are addressed by integer position (lists, tuples, arrays, strings)
//! or by key (maps); objects route `[]` and `[]=` to their operator methods.
//! Positions are never negative and never wrap. Containers materialized from
//! constants are frozen and reject every store.

use std::collections::BTreeMap;
use std::sync::Arc;

use rill_core::heap::ArrayData;
use rill_core::{
    ClassDef, FieldFlags, Handle, Heap, HeapObject, Instruction, MapKey, OpCode, RuntimeError, Ty,
    TypeKind, TypeTable, Value,
};

use super::Vm;
use super::call::conform;
use super::frame::{Landing, Process};
use crate::error::RillResult;

/// Validate `index` against a container of `size` items.
fn index_of(heap: &Heap, index: &Value, size: usize) -> Result<usize, RuntimeError> {
    if !index.is_numeric() {
        return Err(RuntimeError::type_mismatch("int", heap.type_of(index).name()));
    }
    let i = index.as_int().unwrap_or(-1);
    usize::try_from(i)
        .ok()
        .filter(|&i| i < size)
        .ok_or(RuntimeError::InvalidIndex { index: i, size })
}

/// Key of a map whose key type is `key_ty`.
fn map_key(heap: &Heap, key: Value, key_ty: Option<&Ty>) -> Result<MapKey, RuntimeError> {
    let shown = heap.display(&key);
    let key = match key_ty {
        Some(ty) => conform(heap, key, ty).map_err(|_| RuntimeError::InvalidKey(shown.clone()))?,
        None => key,
    };
    MapKey::from_value(&key).ok_or(RuntimeError::InvalidKey(shown))
}

fn dangling() -> RuntimeError {
    RuntimeError::InvalidOperation("dangling container".into())
}

fn field_name(constant: rill_core::Constant) -> Result<String, RuntimeError> {
    constant
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RuntimeError::InvalidOperation("field name is not a string".into()))
}

/// Where a store into a container goes.
enum Slot {
    Position(usize),
    Key(MapKey),
}

impl Vm {
    // ========================================================================
    // Items
    // ========================================================================

    pub(super) fn get_item(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let frame = process.top()?;
        let container = frame.get(instr.a).clone();
        let index = frame.get(instr.b).clone();
        let heap = &self.heap;
        let value = match &container {
            Value::String(s) => {
                let i = index_of(heap, &index, s.chars().count())?;
                Value::Int(s.chars().nth(i).map_or(0, |ch| ch as i64))
            }
            Value::List(h) | Value::Tuple(h) | Value::Array(h) | Value::Map(h) => match heap.get(*h) {
                Some(HeapObject::List(l)) => l.items[index_of(heap, &index, l.items.len())?].clone(),
                Some(HeapObject::Tuple(t)) => t.items[index_of(heap, &index, t.items.len())?].clone(),
                Some(HeapObject::Array(a)) => {
                    let i = index_of(heap, &index, a.data.len())?;
                    a.data.get(i).unwrap_or_default()
                }
                Some(HeapObject::Map(m)) => {
                    let shown = heap.display(&index);
                    let key = map_key(heap, index, m.ty.key_value().map(|(k, _)| k))?;
                    m.entries
                        .get(&key)
                        .cloned()
                        .ok_or(RuntimeError::InvalidKey(shown))?
                }
                _ => return Err(dangling().into()),
            },
            Value::Object(_) => {
                let args = vec![container.clone(), index];
                if self.call_method(process, &container, "[]", args, Landing::Register(instr.c))? {
                    return Ok(());
                }
                return Err(self.not_indexable(&container).into());
            }
            other => return Err(self.not_indexable(other).into()),
        };
        self.store(process, instr.c, value)?;
        Ok(())
    }

    pub(super) fn set_item(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let frame = process.top()?;
        let container = frame.get(instr.c).clone();
        let index = frame.get(instr.b).clone();
        let value = frame.get(instr.a).clone();
        match &container {
            Value::String(s) => {
                let mut chars: Vec<char> = s.chars().collect();
                let i = index_of(&self.heap, &index, chars.len())?;
                let ch = value
                    .as_int()
                    .and_then(|code| u32::try_from(code).ok())
                    .and_then(char::from_u32)
                    .ok_or_else(|| RuntimeError::type_mismatch("character code", self.heap.display(&value)))?;
                chars[i] = ch;
                let rebuilt: String = chars.into_iter().collect();
                self.store(process, instr.c, Value::String(Arc::from(rebuilt)))?;
            }
            Value::List(h) | Value::Tuple(h) | Value::Array(h) | Value::Map(h) => {
                self.store_item(*h, index, value)?;
            }
            Value::Object(_) => {
                let args = vec![container.clone(), index, value];
                if !self.call_method(process, &container, "[]=", args, Landing::Discard)? {
                    return Err(self.not_indexable(&container).into());
                }
            }
            other => return Err(self.not_indexable(other).into()),
        }
        Ok(())
    }

    fn not_indexable(&self, container: &Value) -> RuntimeError {
        RuntimeError::InvalidOperation(format!("{} cannot be indexed", self.heap.type_of(container).name()))
    }

    fn store_item(&mut self, h: Handle, index: Value, value: Value) -> Result<(), RuntimeError> {
        if self.heap.is_frozen(h) {
            return Err(RuntimeError::ConstModification);
        }
        let heap = &self.heap;
        let (slot, item_ty) = match heap.get(h) {
            Some(HeapObject::List(l)) => (
                Slot::Position(index_of(heap, &index, l.items.len())?),
                l.ty.element().cloned(),
            ),
            Some(HeapObject::Tuple(t)) => {
                let i = index_of(heap, &index, t.items.len())?;
                (Slot::Position(i), t.ty.params().get(i).cloned())
            }
            Some(HeapObject::Array(a)) => {
                let i = index_of(heap, &index, a.data.len())?;
                (Slot::Position(i), a.ty.element().cloned())
            }
            Some(HeapObject::Map(m)) => {
                let (key_ty, value_ty) = m.ty.key_value().map_or((None, None), |(k, v)| (Some(k), Some(v.clone())));
                (Slot::Key(map_key(heap, index, key_ty)?), value_ty)
            }
            _ => return Err(dangling()),
        };
        let value = match item_ty {
            Some(ty) => conform(&self.heap, value, &ty)?,
            None => value,
        };

        let old = match (self.heap.get_mut(h), slot) {
            (Some(HeapObject::Array(a)), Slot::Position(i)) => {
                return if a.data.set(i, &value) {
                    Ok(())
                } else {
                    Err(RuntimeError::type_mismatch(a.ty.name(), format!("{:?}", value.kind())))
                };
            }
            (Some(HeapObject::List(l)), Slot::Position(i)) => Some(std::mem::replace(&mut l.items[i], value.clone())),
            (Some(HeapObject::Tuple(t)), Slot::Position(i)) => Some(std::mem::replace(&mut t.items[i], value.clone())),
            (Some(HeapObject::Map(m)), Slot::Key(key)) => m.entries.insert(key, value.clone()),
            _ => return Err(dangling()),
        };
        self.heap.inc_ref(&value);
        if let Some(old) = old {
            self.heap.dec_ref(&old);
        }
        Ok(())
    }

    /// Overwrite item `position` of a tuple, list or instance.
    fn replace_at(&mut self, h: Handle, position: usize, value: Value) -> Result<(), RuntimeError> {
        if self.heap.is_frozen(h) {
            return Err(RuntimeError::ConstModification);
        }
        let slot = match self.heap.get_mut(h) {
            Some(HeapObject::Tuple(t)) => t.items.get_mut(position),
            Some(HeapObject::List(l)) => l.items.get_mut(position),
            Some(HeapObject::Instance(o)) => o.fields.get_mut(position),
            _ => return Err(dangling()),
        };
        let Some(slot) = slot else {
            return Err(RuntimeError::InvalidOperation(format!("no item {position}")));
        };
        let old = std::mem::replace(slot, value.clone());
        self.heap.inc_ref(&value);
        self.heap.dec_ref(&old);
        Ok(())
    }

    // ========================================================================
    // Fields
    // ========================================================================

    fn instance_class(&self, h: Handle) -> Result<Arc<ClassDef>, RuntimeError> {
        match self.heap.get(h) {
            Some(HeapObject::Instance(o)) => self
                .program
                .class(o.class)
                .cloned()
                .ok_or_else(|| RuntimeError::InvalidOperation(format!("unknown class {}", o.class.0))),
            _ => Err(dangling()),
        }
    }

    pub(super) fn get_field(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let name = field_name(self.constant(process, instr.b)?)?;
        let frame = process.top()?;
        let host = frame.routine.decl().host;
        let container = frame.get(instr.a).clone();
        let missing = |ty: &str| RuntimeError::InvalidField(format!("{ty}.{name}"));

        let value = match &container {
            Value::Tuple(h) => match self.heap.get(*h) {
                Some(HeapObject::Tuple(t)) => t
                    .ty
                    .field_index(&name)
                    .and_then(|i| t.items.get(i))
                    .cloned()
                    .ok_or_else(|| missing(t.ty.name()))?,
                _ => return Err(dangling().into()),
            },
            Value::Object(h) => {
                let class = self.instance_class(*h)?;
                match class.field_index(&name) {
                    Some(slot) => {
                        if !class.field_accessible(&class.fields[slot], host) {
                            return Err(RuntimeError::InvalidField(format!(
                                "{}.{name} is not accessible here",
                                class.name
                            ))
                            .into());
                        }
                        match self.heap.get(*h) {
                            Some(HeapObject::Instance(o)) => o.fields[slot].clone(),
                            _ => return Err(dangling().into()),
                        }
                    }
                    None => self.class_member(&class, &name).ok_or_else(|| missing(&class.name))?,
                }
            }
            Value::Class(class) => self.class_member(class, &name).ok_or_else(|| missing(&class.name))?,
            other => return Err(missing(self.heap.type_of(other).name()).into()),
        };
        self.store(process, instr.c, value)?;
        Ok(())
    }

    /// A method set or constant of `class`.
    fn class_member(&mut self, class: &ClassDef, name: &str) -> Option<Value> {
        if let Some(set) = class.method(name) {
            return Some(Value::Overloads(set.clone()));
        }
        let constant = class.constant(name)?;
        Some(self.heap.materialize(constant))
    }

    pub(super) fn set_field(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let name = field_name(self.constant(process, instr.b)?)?;
        let frame = process.top()?;
        let host = frame.routine.decl().host;
        let container = frame.get(instr.c).clone();
        let value = frame.get(instr.a).clone();
        let missing = |ty: &str| RuntimeError::InvalidField(format!("{ty}.{name}"));

        match &container {
            Value::Tuple(h) => {
                let (position, ty) = match self.heap.get(*h) {
                    Some(HeapObject::Tuple(t)) => {
                        let position = t.ty.field_index(&name).ok_or_else(|| missing(t.ty.name()))?;
                        (position, t.ty.params()[position].clone())
                    }
                    _ => return Err(dangling().into()),
                };
                let value = conform(&self.heap, value, &ty)?;
                self.replace_at(*h, position, value)?;
            }
            Value::Object(h) => {
                let class = self.instance_class(*h)?;
                let Some(slot) = class.field_index(&name) else {
                    if class.constant(&name).is_some() {
                        return Err(RuntimeError::ConstModification.into());
                    }
                    return Err(missing(&class.name).into());
                };
                let field = &class.fields[slot];
                if !class.field_accessible(field, host) {
                    return Err(RuntimeError::InvalidField(format!("{}.{name} is not accessible here", class.name)).into());
                }
                if field.flags.contains(FieldFlags::CONST) {
                    return Err(RuntimeError::ConstModification.into());
                }
                let value = conform(&self.heap, value, &field.ty)?;
                self.replace_at(*h, slot, value)?;
            }
            other => return Err(missing(self.heap.type_of(other).name()).into()),
        }
        Ok(())
    }

    /// `C = A.items[B]` with a position resolved during inference.
    pub(super) fn get_tuple_position(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let container = process.top()?.get(instr.a).clone();
        let value = match container.handle().and_then(|h| self.heap.get(h)) {
            Some(HeapObject::Tuple(t)) => t.items.get(instr.b as usize).cloned().ok_or(RuntimeError::InvalidIndex {
                index: instr.b as i64,
                size: t.items.len(),
            })?,
            _ => return Err(RuntimeError::type_mismatch("tuple", self.heap.type_of(&container).name()).into()),
        };
        self.store(process, instr.c, value)?;
        Ok(())
    }

    pub(super) fn set_tuple_position(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let frame = process.top()?;
        let container = frame.get(instr.c).clone();
        let value = frame.get(instr.a).clone();
        let &Value::Tuple(h) = &container else {
            return Err(RuntimeError::type_mismatch("tuple", self.heap.type_of(&container).name()).into());
        };
        let item_ty = match self.heap.get(h) {
            Some(HeapObject::Tuple(t)) => t.ty.params().get(instr.b as usize).cloned(),
            _ => return Err(dangling().into()),
        };
        let value = match item_ty {
            Some(ty) => conform(&self.heap, value, &ty)?,
            None => value,
        };
        self.replace_at(h, instr.b as usize, value)?;
        Ok(())
    }

    /// `C = A.fields[B]` with a slot resolved during inference.
    pub(super) fn get_object_slot(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let container = process.top()?.get(instr.a).clone();
        let value = match container.handle().and_then(|h| self.heap.get(h)) {
            Some(HeapObject::Instance(o)) => o
                .fields
                .get(instr.b as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::InvalidField(format!("slot {}", instr.b)))?,
            _ => return Err(RuntimeError::type_mismatch("object", self.heap.type_of(&container).name()).into()),
        };
        self.store(process, instr.c, value)?;
        Ok(())
    }

    pub(super) fn set_object_slot(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let frame = process.top()?;
        let container = frame.get(instr.c).clone();
        let value = frame.get(instr.a).clone();
        let &Value::Object(h) = &container else {
            return Err(RuntimeError::type_mismatch("object", self.heap.type_of(&container).name()).into());
        };
        let class = self.instance_class(h)?;
        let field = class
            .fields
            .get(instr.b as usize)
            .ok_or_else(|| RuntimeError::InvalidField(format!("{} slot {}", class.name, instr.b)))?;
        let value = conform(&self.heap, value, &field.ty)?;
        self.replace_at(h, instr.b as usize, value)?;
        Ok(())
    }

    // ========================================================================
    // Construction
    // ========================================================================

    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(super) fn construct(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let types = TypeTable::global();
        let frame = process.top()?;
        let items: Vec<Value> = (instr.a..instr.a + instr.b).map(|r| frame.get(r).clone()).collect();
        let wanted = match instr.op {
            OpCode::Tuple => TypeKind::Tuple,
            OpCode::List => TypeKind::List,
            OpCode::Map => TypeKind::Map,
            _ => TypeKind::Array,
        };
        let declared = frame
            .body
            .register_types
            .get(instr.c as usize)
            .filter(|d| d.kind() == wanted)
            .cloned();
        let item_types = self.argument_types(&items);

        let value = match wanted {
            TypeKind::Tuple => {
                let ty = declared
                    .filter(|d| d.params().len() == items.len())
                    .unwrap_or_else(|| types.tuple(item_types));
                let items = items
                    .into_iter()
                    .zip(ty.params())
                    .map(|(v, t)| conform(&self.heap, v, t))
                    .collect::<Result<Vec<_>, _>>()?;
                self.heap.new_tuple(ty, items)
            }
            TypeKind::List => {
                let ty = declared.unwrap_or_else(|| types.list(types.common(&item_types)));
                let elem = ty.element().cloned().unwrap_or_else(|| types.any());
                let items = items
                    .into_iter()
                    .map(|v| conform(&self.heap, v, &elem))
                    .collect::<Result<Vec<_>, _>>()?;
                self.heap.new_list(ty, items)
            }
            TypeKind::Map => {
                if items.len() % 2 != 0 {
                    return Err(RuntimeError::InvalidOperation("map built from an odd number of registers".into()).into());
                }
                let ty = declared.unwrap_or_else(|| {
                    let keys: Vec<Ty> = item_types.iter().step_by(2).cloned().collect();
                    let values: Vec<Ty> = item_types.iter().skip(1).step_by(2).cloned().collect();
                    types.map(types.common(&keys), types.common(&values))
                });
                let (key_ty, value_ty) = ty
                    .key_value()
                    .map_or((types.any(), types.any()), |(k, v)| (k.clone(), v.clone()));
                let mut entries = BTreeMap::new();
                let mut pairs = items.into_iter();
                while let (Some(k), Some(v)) = (pairs.next(), pairs.next()) {
                    let key = map_key(&self.heap, k, Some(&key_ty))?;
                    entries.insert(key, conform(&self.heap, v, &value_ty)?);
                }
                self.heap.new_map(ty, entries)
            }
            _ => {
                let ty = declared.unwrap_or_else(|| {
                    let numeric: Vec<Ty> = item_types.iter().filter(|t| t.is_numeric()).cloned().collect();
                    types.array(if numeric.is_empty() { types.int() } else { types.common(&numeric) })
                });
                let elem = ty.element().map_or(TypeKind::Int, |e| e.kind());
                let data = match elem {
                    TypeKind::Float => items
                        .iter()
                        .map(|v| v.as_f64().map(|x| x as f32))
                        .collect::<Option<Vec<_>>>()
                        .map(ArrayData::Float),
                    TypeKind::Double => items.iter().map(Value::as_f64).collect::<Option<Vec<_>>>().map(ArrayData::Double),
                    _ => items.iter().map(Value::as_int).collect::<Option<Vec<_>>>().map(ArrayData::Int),
                };
                let data = data.ok_or_else(|| RuntimeError::type_mismatch(ty.name(), "non-numeric item"))?;
                self.heap.new_array(ty, data)
            }
        };
        self.store(process, instr.c, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RillError, RillResult};
    use crate::program::Program;
    use rill_core::bytecode::data_kind;
    use rill_core::{ClassBuilder, ClassId, Constant, EngineProperty, RoutineBuilder};

    fn vm_with(routines: Vec<Arc<rill_core::Routine>>) -> Vm {
        let mut program = Program::new();
        for r in routines {
            program.add_routine(r).unwrap();
        }
        Vm::new(Arc::new(program))
    }

    fn category(result: RillResult<Value>) -> String {
        match result {
            Err(RillError::Uncaught(report)) => report.category,
            other => panic!("expected an uncaught exception, got {other:?}"),
        }
    }

    /// `at(i) = {10, 20, 30}[i]`
    fn list_at() -> Arc<rill_core::Routine> {
        RoutineBuilder::new("at")
            .param("i", TypeTable::global().int())
            .emit(OpCode::Data, data_kind::INT, 10, 1)
            .emit(OpCode::Data, data_kind::INT, 20, 2)
            .emit(OpCode::Data, data_kind::INT, 30, 3)
            .emit(OpCode::List, 1, 3, 4)
            .emit(OpCode::GetItem, 4, 0, 5)
            .emit(OpCode::Return, 5, 1, 0)
            .build()
    }

    #[test]
    fn list_positions_are_bounds_checked() {
        let mut vm = vm_with(vec![list_at()]);
        assert!(matches!(vm.call("at", vec![Value::Int(1)]), Ok(Value::Int(20))));
        assert_eq!(category(vm.call("at", vec![Value::Int(3)])), "Error::Index");
        assert_eq!(category(vm.call("at", vec![Value::Int(-1)])), "Error::Index");
        assert_eq!(vm.heap().live_count(), 0);
    }

    #[test]
    fn strings_index_by_character() {
        let t = TypeTable::global();
        let code_at = RoutineBuilder::new("code_at")
            .param("s", t.string())
            .param("i", t.int())
            .emit(OpCode::GetItem, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let mut vm = vm_with(vec![code_at]);
        let result = vm.call("code_at", vec![Value::string("héllo"), Value::Int(2)]);
        assert!(matches!(result, Ok(Value::Int(c)) if c == 'l' as i64));
    }

    #[test]
    fn missing_map_keys_raise_key_errors() {
        let t = TypeTable::global();
        let lookup = RoutineBuilder::new("lookup")
            .param("k", t.string())
            .constant(Constant::string("a"))
            .emit(OpCode::GetConst, 0, 0, 1)
            .emit(OpCode::Data, data_kind::INT, 1, 2)
            .emit(OpCode::Map, 1, 2, 3)
            .emit(OpCode::GetItem, 3, 0, 4)
            .emit(OpCode::Return, 4, 1, 0)
            .build();
        let mut vm = vm_with(vec![lookup]);
        assert!(matches!(vm.call("lookup", vec![Value::string("a")]), Ok(Value::Int(1))));
        assert_eq!(category(vm.call("lookup", vec![Value::string("b")])), "Error::Key");
    }

    #[test]
    fn named_tuple_fields_resolve_with_and_without_specialization() {
        for typed in [1, 0] {
            let t = TypeTable::global();
            let point = t.tuple(vec![t.named("x", t.int()), t.named("y", t.int())]);
            let y_of = RoutineBuilder::new("y_of")
                .constant(Constant::string("y"))
                .local(2, point)
                .emit(OpCode::Data, data_kind::INT, 3, 0)
                .emit(OpCode::Data, data_kind::INT, 4, 1)
                .emit(OpCode::Tuple, 0, 2, 2)
                .emit(OpCode::GetField, 2, 0, 3)
                .emit(OpCode::Return, 3, 1, 0)
                .build();
            let mut program = Program::new();
            program.set_property(EngineProperty::TypedCode, typed);
            program.add_routine(y_of).unwrap();
            let mut vm = Vm::new(Arc::new(program));
            assert!(matches!(vm.call("y_of", vec![]), Ok(Value::Int(4))), "typed = {typed}");
        }
    }

    #[test]
    fn constant_containers_are_frozen() {
        let t = TypeTable::global();
        let poke = RoutineBuilder::new("poke")
            .constant(Constant::List(t.list(t.int()), vec![Constant::Int(1), Constant::Int(2)]))
            .emit(OpCode::GetConst, 0, 0, 0)
            .emit(OpCode::Data, data_kind::INT, 0, 1)
            .emit(OpCode::Data, data_kind::INT, 9, 2)
            .emit(OpCode::SetItem, 2, 1, 0)
            .emit(OpCode::Return, 0, 1, 0)
            .build();
        let mut vm = vm_with(vec![poke]);
        assert_eq!(category(vm.call("poke", vec![])), "Error::Value");
    }

    #[test]
    fn private_fields_are_checked_on_dynamic_access() {
        let t = TypeTable::global();
        let class = ClassBuilder::new(ClassId(7), "Vault", None)
            .field_with("secret", t.int(), Constant::Int(42), FieldFlags::PRIVATE)
            .build();
        let peek = RoutineBuilder::new("peek")
            .param("v", t.any())
            .constant(Constant::string("secret"))
            .emit(OpCode::GetField, 0, 0, 1)
            .emit(OpCode::Return, 1, 1, 0)
            .build();
        let mut program = Program::new();
        program.add_class(class.clone()).unwrap();
        program.add_routine(peek).unwrap();
        let mut vm = Vm::new(Arc::new(program));
        let vault = vm.call_value(Value::Class(class), vec![]).unwrap();
        assert_eq!(category(vm.call("peek", vec![vault.clone()])), "Error::Field");
        vm.release(&vault);
        assert_eq!(vm.heap().live_count(), 0);
    }
}
