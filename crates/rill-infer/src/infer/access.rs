//! Item and field access.
//!
//! Item access specializes on the container kind and, for lists and
//! arrays, on the element kind (`GetItemLFI`: list, float element, int
//! index). Tuple items addressed by a constant index and tuple fields
//! addressed by name both become positional `GetFieldT*`/`SetFieldT*` with
//! the position in `B`; object fields become `GetFieldOV`/`SetFieldOV` with
//! the field slot in `B`.

use rill_core::{
    ClassDef, Constant, FieldFlags, InferErrorKind, Instruction, OpCode, Ty, TypeKind, TypeTable,
};

use super::{Callee, Pass, Step, calls};
use crate::matcher::match_type;

pub(super) fn infer_item(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    if instr.op == OpCode::GetItem {
        get_item(pass, pc, instr)
    } else {
        set_item(pass, pc, instr)
    }
}

pub(super) fn infer_field(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let Some(name) = pass.constant_name(instr.b) else {
        return Err(pass.fail(pc, InferErrorKind::InvalidOperation));
    };
    if instr.op == OpCode::GetField {
        get_field(pass, pc, instr, &name)
    } else {
        set_field(pass, pc, instr, &name)
    }
}

// ============================================================================
// Items
// ============================================================================

fn get_item(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    let container = pass.ty(instr.a);
    let index = pass.ty(instr.b);

    let result = match container.kind() {
        TypeKind::List => {
            let elem = element_of(&container);
            if int_index(pass, pc, instr.b)? {
                let op = match elem.kind() {
                    TypeKind::Int => OpCode::GetItemLII,
                    TypeKind::Float => OpCode::GetItemLFI,
                    TypeKind::Double => OpCode::GetItemLDI,
                    TypeKind::String => OpCode::GetItemLSI,
                    _ => OpCode::GetItemLI,
                };
                pass.specialize(pc, op);
            }
            elem
        }
        TypeKind::String => {
            if int_index(pass, pc, instr.b)? {
                pass.specialize(pc, OpCode::GetItemSI);
            }
            types.int()
        }
        TypeKind::Array => {
            let elem = element_of(&container);
            if int_index(pass, pc, instr.b)? {
                match elem.kind() {
                    TypeKind::Int => pass.specialize(pc, OpCode::GetItemAII),
                    TypeKind::Float => pass.specialize(pc, OpCode::GetItemAFI),
                    TypeKind::Double => pass.specialize(pc, OpCode::GetItemADI),
                    _ => {}
                }
            }
            elem
        }
        TypeKind::Map => {
            let (key, value) = map_types(&container);
            if map_key(pass, pc, &index, &key)? {
                pass.specialize(pc, OpCode::GetItemM);
            }
            value
        }
        TypeKind::Tuple => {
            let position = pass.constant_of(instr.b).and_then(Constant::as_int);
            match position {
                Some(i) => {
                    let Some(item) = usize::try_from(i).ok().and_then(|i| container.params().get(i))
                    else {
                        return Err(pass.fail(pc, InferErrorKind::IndexNotValid));
                    };
                    let item = item.strip();
                    rewrite(pass, pc, tuple_get(item.kind()), i as u16);
                    item
                }
                None => {
                    if int_index(pass, pc, instr.b)? {
                        pass.specialize(pc, OpCode::GetItemTI);
                    }
                    types.any()
                }
            }
        }
        TypeKind::Object => {
            let args = [container.clone(), index.clone()];
            match calls::operator_call(pass, pc, &container, "[]", &args)? {
                Some(Ok(ret)) => ret,
                Some(Err(rejections)) => {
                    return Err(pass.fail_with(pc, InferErrorKind::ItemWrongAccess, |d| {
                        d.with_rejections(rejections)
                    }));
                }
                None => return Err(item_wrong_access(pass, pc, &container)),
            }
        }
        TypeKind::Any | TypeKind::Undefined => types.any(),
        _ => return Err(item_wrong_access(pass, pc, &container)),
    };
    pass.bind(pc, instr.c, &result)
}

fn set_item(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let container = pass.ty(instr.c);
    let index = pass.ty(instr.b);

    match container.kind() {
        TypeKind::List => {
            let elem = element_of(&container);
            let value = pass.coerce(pc, instr.a, &elem)?;
            pass.instr_mut(pc).a = value;
            if int_index(pass, pc, instr.b)? {
                let op = match elem.kind() {
                    TypeKind::Int => OpCode::SetItemLIII,
                    TypeKind::Float => OpCode::SetItemLFIF,
                    TypeKind::Double => OpCode::SetItemLDID,
                    TypeKind::String => OpCode::SetItemLSIS,
                    _ => OpCode::SetItemLI,
                };
                pass.specialize(pc, op);
            }
        }
        TypeKind::String => {
            let value = pass.coerce(pc, instr.a, &TypeTable::global().int())?;
            pass.instr_mut(pc).a = value;
            if int_index(pass, pc, instr.b)? {
                pass.specialize(pc, OpCode::SetItemSII);
            }
        }
        TypeKind::Array => {
            let elem = element_of(&container);
            let value = pass.coerce(pc, instr.a, &elem)?;
            pass.instr_mut(pc).a = value;
            if int_index(pass, pc, instr.b)? {
                match elem.kind() {
                    TypeKind::Int => pass.specialize(pc, OpCode::SetItemAIII),
                    TypeKind::Float => pass.specialize(pc, OpCode::SetItemAFIF),
                    TypeKind::Double => pass.specialize(pc, OpCode::SetItemADID),
                    _ => {}
                }
            }
        }
        TypeKind::Map => {
            let (key, value_ty) = map_types(&container);
            let value = pass.coerce(pc, instr.a, &value_ty)?;
            pass.instr_mut(pc).a = value;
            if map_key(pass, pc, &index, &key)? {
                pass.specialize(pc, OpCode::SetItemM);
            }
        }
        TypeKind::Tuple => {
            if let Some(i) = pass.constant_of(instr.b).and_then(Constant::as_int) {
                let Some(item) = usize::try_from(i).ok().and_then(|i| container.params().get(i))
                else {
                    return Err(pass.fail(pc, InferErrorKind::IndexNotValid));
                };
                let item = item.strip();
                let value = pass.coerce(pc, instr.a, &item)?;
                pass.instr_mut(pc).a = value;
                rewrite(pass, pc, tuple_set(item.kind()), i as u16);
            } else {
                int_index(pass, pc, instr.b)?;
            }
        }
        TypeKind::Object => {
            let args = [container.clone(), index, pass.ty(instr.a)];
            match calls::operator_call(pass, pc, &container, "[]=", &args)? {
                Some(Ok(_)) => {}
                Some(Err(rejections)) => {
                    return Err(pass.fail_with(pc, InferErrorKind::ItemWrongAccess, |d| {
                        d.with_rejections(rejections)
                    }));
                }
                None => return Err(item_wrong_access(pass, pc, &container)),
            }
        }
        TypeKind::Any | TypeKind::Undefined => {}
        _ => return Err(item_wrong_access(pass, pc, &container)),
    }
    Ok(())
}

fn element_of(container: &Ty) -> Ty {
    container
        .element()
        .map_or_else(|| TypeTable::global().any(), |e| e.strip())
}

fn map_types(container: &Ty) -> (Ty, Ty) {
    let any = TypeTable::global().any();
    container
        .key_value()
        .map_or((any.clone(), any), |(k, v)| (k.strip(), v.strip()))
}

/// Check an index operand is an integer, converting a float or double index.
///
/// Returns whether the index is statically an `int` afterwards.
fn int_index(pass: &mut Pass<'_, '_, '_>, pc: usize, reg: u16) -> Result<bool, super::Abort> {
    let index = pass.ty(reg);
    match index.kind() {
        TypeKind::Int => Ok(true),
        TypeKind::Float | TypeKind::Double => {
            let converted = pass.coerce(pc, reg, &TypeTable::global().int())?;
            pass.instr_mut(pc).b = converted;
            Ok(true)
        }
        TypeKind::Any | TypeKind::Undefined => Ok(false),
        _ => Err(pass.fail_with(pc, InferErrorKind::IndexWrongType, |d| {
            d.mismatch(index.name(), "int")
        })),
    }
}

/// Check a map key; returns whether it is statically known to fit.
fn map_key(pass: &Pass<'_, '_, '_>, pc: usize, index: &Ty, key: &Ty) -> Result<bool, super::Abort> {
    if index.is_dynamic() || key.is_dynamic() {
        return Ok(false);
    }
    if match_type(index, key).is_match() {
        Ok(true)
    } else {
        Err(pass.fail_with(pc, InferErrorKind::KeyNotValid, |d| {
            d.mismatch(index.name(), key.name())
        }))
    }
}

fn item_wrong_access(pass: &Pass<'_, '_, '_>, pc: usize, container: &Ty) -> super::Abort {
    pass.fail_with(pc, InferErrorKind::ItemWrongAccess, |d| {
        d.with_subject(container.name())
    })
}

fn tuple_get(kind: TypeKind) -> OpCode {
    match kind {
        TypeKind::Int => OpCode::GetFieldTI,
        TypeKind::Float => OpCode::GetFieldTF,
        TypeKind::Double => OpCode::GetFieldTD,
        TypeKind::String => OpCode::GetFieldTS,
        _ => OpCode::GetFieldT,
    }
}

fn tuple_set(kind: TypeKind) -> OpCode {
    match kind {
        TypeKind::Int => OpCode::SetFieldTII,
        TypeKind::Float => OpCode::SetFieldTFF,
        TypeKind::Double => OpCode::SetFieldTDD,
        TypeKind::String => OpCode::SetFieldTSS,
        _ => OpCode::SetFieldT,
    }
}

/// Specialize to a positional opcode, moving the position into `B`.
fn rewrite(pass: &mut Pass<'_, '_, '_>, pc: usize, op: OpCode, position: u16) {
    if pass.options.typed_code {
        let instr = pass.instr_mut(pc);
        instr.op = op;
        instr.b = position;
    }
}

// ============================================================================
// Fields
// ============================================================================

fn get_field(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction, name: &str) -> Step {
    let types = TypeTable::global();
    let container = pass.ty(instr.a);

    match container.kind() {
        TypeKind::Tuple => {
            let Some(position) = container.field_index(name) else {
                return Err(field_not_exist(pass, pc, &container, name));
            };
            let item = container.params()[position].strip();
            rewrite(pass, pc, tuple_get(item.kind()), position as u16);
            pass.bind(pc, instr.c, &item)
        }
        TypeKind::Object | TypeKind::Class => {
            let Some(class) = class_of(pass, &container) else {
                return Err(field_not_exist(pass, pc, &container, name));
            };
            if let Some(slot) = class.field_index(name) {
                if container.kind() == TypeKind::Class {
                    return Err(pass.fail_with(pc, InferErrorKind::NeedInstance, |d| {
                        d.with_subject(name)
                    }));
                }
                let field = &class.fields[slot];
                if !class.field_accessible(field, pass.decl.host) {
                    return Err(pass.fail_with(pc, InferErrorKind::FieldNotPermitted, |d| {
                        d.with_subject(name)
                    }));
                }
                let ty = field.ty.strip();
                rewrite(pass, pc, OpCode::GetFieldOV, slot as u16);
                return pass.bind(pc, instr.c, &ty);
            }
            if let Some(set) = class.method(name).cloned() {
                let ty = match set.routines() {
                    [only] => only.signature(),
                    _ => types.any(),
                };
                pass.bind(pc, instr.c, &ty)?;
                pass.remember_callee(instr.c, Callee::Overloads(set));
                return Ok(());
            }
            if let Some(constant) = class.constant(name).cloned() {
                pass.bind(pc, instr.c, &constant.type_of())?;
                pass.remember(instr.c, Some(constant));
                return Ok(());
            }
            Err(field_not_exist(pass, pc, &container, name))
        }
        TypeKind::Any | TypeKind::Undefined => pass.bind(pc, instr.c, &types.any()),
        _ => Err(field_not_exist(pass, pc, &container, name)),
    }
}

fn set_field(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction, name: &str) -> Step {
    let container = pass.ty(instr.c);

    match container.kind() {
        TypeKind::Tuple => {
            let Some(position) = container.field_index(name) else {
                return Err(field_not_exist(pass, pc, &container, name));
            };
            let item = container.params()[position].strip();
            let value = pass.coerce(pc, instr.a, &item)?;
            pass.instr_mut(pc).a = value;
            rewrite(pass, pc, tuple_set(item.kind()), position as u16);
            Ok(())
        }
        TypeKind::Object | TypeKind::Class => {
            let Some(class) = class_of(pass, &container) else {
                return Err(field_not_exist(pass, pc, &container, name));
            };
            if let Some(slot) = class.field_index(name) {
                if container.kind() == TypeKind::Class {
                    return Err(pass.fail_with(pc, InferErrorKind::NeedInstance, |d| {
                        d.with_subject(name)
                    }));
                }
                let field = &class.fields[slot];
                if !class.field_accessible(field, pass.decl.host) {
                    return Err(pass.fail_with(pc, InferErrorKind::FieldNotPermitted, |d| {
                        d.with_subject(name)
                    }));
                }
                if field.flags.contains(FieldFlags::CONST) {
                    return Err(pass.fail_with(pc, InferErrorKind::ConstModified, |d| {
                        d.with_subject(name)
                    }));
                }
                let ty = field.ty.strip();
                let value = pass.coerce(pc, instr.a, &ty)?;
                pass.instr_mut(pc).a = value;
                rewrite(pass, pc, OpCode::SetFieldOV, slot as u16);
                return Ok(());
            }
            if class.constant(name).is_some() {
                return Err(pass.fail_with(pc, InferErrorKind::ConstModified, |d| {
                    d.with_subject(name)
                }));
            }
            Err(field_not_exist(pass, pc, &container, name))
        }
        TypeKind::Any | TypeKind::Undefined => Ok(()),
        _ => Err(field_not_exist(pass, pc, &container, name)),
    }
}

fn class_of(pass: &Pass<'_, '_, '_>, ty: &Ty) -> Option<std::sync::Arc<ClassDef>> {
    ty.class_id().and_then(|id| pass.session.env().class(id))
}

fn field_not_exist(pass: &Pass<'_, '_, '_>, pc: usize, container: &Ty, name: &str) -> super::Abort {
    let subject = format!("{}.{}", container.name(), name);
    pass.fail_with(pc, InferErrorKind::FieldNotExist, |d| d.with_subject(subject))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_tuple_opcodes_follow_item_kind() {
        assert_eq!(tuple_get(TypeKind::Double), OpCode::GetFieldTD);
        assert_eq!(tuple_get(TypeKind::List), OpCode::GetFieldT);
        assert_eq!(tuple_set(TypeKind::String), OpCode::SetFieldTSS);
        assert_eq!(tuple_set(TypeKind::Any), OpCode::SetFieldT);
    }
}
