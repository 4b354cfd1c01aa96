//! Definite assignment, branches, switches, handlers and tail calls.

use rill_core::bytecode::RESCUE_ANY;
use rill_core::{
    AnnotatedInstr, CallFlags, CaseMode, Constant, Diagnostic, InferError, InferErrorKind,
    Instruction, OpCode, RegSet, RoutineDecl, TypeKind, classify, exception_type,
};

use super::{Pass, Step, typing_error};
use crate::flow::{
    Liveness, PossiblyAssigned, PossiblyUnassigned, build_flow_graph, live_at_entry,
    solve_flow_equation,
};

/// Minimum fraction of a value range that must be covered by cases for a
/// switch to get a jump table.
const TABLE_DENSITY: f64 = 0.75;

// ============================================================================
// Definite assignment
// ============================================================================

/// Reject reads of registers no path has written.
///
/// In strict mode a register written on some but not all paths reaching a
/// read is rejected as well.
#[cfg_attr(feature = "profiling", profiling::function)]
pub(super) fn check_definite_assignment(
    decl: &RoutineDecl,
    strict: bool,
    silent: bool,
) -> Result<(), InferError> {
    let params = decl.params.len() + usize::from(decl.variadic);
    let graph = build_flow_graph(&decl.code, decl.register_count);
    let liveness = solve_flow_equation(&graph, &Liveness::new(&decl.code));
    let entry = live_at_entry(&graph, &liveness);
    if entry.is_subset(&RegSet::prefix(decl.register_count, params)) {
        return Ok(());
    }

    let reachable = graph.reachable();
    let check = |problem: &dyn Fn(usize, usize) -> bool| -> Result<(), InferError> {
        for (pc, ai) in decl.code.iter().enumerate() {
            if !reachable[pc] {
                continue;
            }
            if let Some(reg) = classify(&ai.instr).reads.iter().find(|&r| problem(pc, r)) {
                tracing::trace!(routine = %decl.name, pc, register = reg, "read before assignment");
                return Err(typing_error(
                    silent,
                    Diagnostic::new(InferErrorKind::NotInitialized, decl, pc, ai)
                        .with_subject(format!("register {reg}")),
                ));
            }
        }
        Ok(())
    };

    let assigned = solve_flow_equation(&graph, &PossiblyAssigned::new(&decl.code, params));
    check(&|pc, reg| !assigned.before(pc).contains(reg))?;
    if strict {
        let unassigned = solve_flow_equation(&graph, &PossiblyUnassigned::new(&decl.code, params));
        check(&|pc, reg| unassigned.before(pc).contains(reg))?;
    }
    Ok(())
}

// ============================================================================
// Branches
// ============================================================================

pub(super) fn infer_test(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    match pass.kind(instr.a) {
        TypeKind::Int => pass.specialize(pc, OpCode::TestI),
        TypeKind::Float => pass.specialize(pc, OpCode::TestF),
        TypeKind::Double => pass.specialize(pc, OpCode::TestD),
        _ => {}
    }
    Ok(())
}

/// `Switch`: pick the case lookup strategy, or jump directly when the
/// scrutinee is a known constant.
///
/// Integer cases covering most of their value range become a jump table:
/// the cases are rewritten in value order, one per value, with the missing
/// values filled in by synthesized cases that jump to the default. Other
/// integer or string cases are sorted for binary search.
pub(super) fn infer_switch(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let count = instr.c as usize;
    let cases: Vec<(Constant, u16)> = pass.code[pc + 1..]
        .iter()
        .take(count)
        .filter(|ai| ai.op() == OpCode::Case)
        .filter_map(|ai| Some((pass.constants.get(ai.instr.a)?.clone(), ai.instr.b)))
        .collect();
    if cases.len() != count {
        return Err(pass.fail(pc, InferErrorKind::InvalidOperation));
    }

    if pass.options.typed_code {
        if let Some(known) = pass.constant_of(instr.a).cloned() {
            let target = cases
                .iter()
                .find(|(value, _)| value.same(&known))
                .map_or(instr.b, |(_, target)| *target);
            *pass.instr_mut(pc) = Instruction::new(OpCode::Goto, 0, target, 0);
            return Ok(());
        }
    }
    if count == 0 {
        return Ok(());
    }

    match pass.kind(instr.a) {
        TypeKind::Int | TypeKind::Enum => {
            let Some(mut values) = cases
                .iter()
                .map(|(value, target)| Some((value.as_int()?, *target)))
                .collect::<Option<Vec<(i64, u16)>>>()
            else {
                return Ok(());
            };
            values.sort_by_key(|(v, _)| *v);
            if values.windows(2).any(|w| w[0].0 == w[1].0) {
                return Ok(());
            }
            let (first, last) = (values[0].0, values[values.len() - 1].0);
            let range = last
                .checked_sub(first)
                .and_then(|d| usize::try_from(d).ok())
                .map(|d| d + 1)
                .filter(|&r| r <= u16::MAX as usize);
            if let Some(range) = range.filter(|&r| count as f64 > TABLE_DENSITY * r as f64) {
                build_table(pass, pc, instr, first, range, &values);
            } else {
                let sorted: Vec<(Constant, u16)> =
                    values.into_iter().map(|(v, t)| (Constant::Int(v), t)).collect();
                write_cases(pass, pc, &sorted, CaseMode::Ordered);
            }
        }
        TypeKind::String => {
            let mut sorted = cases;
            if !sorted.iter().all(|(v, _)| matches!(v, Constant::String(_))) {
                return Ok(());
            }
            sorted.sort_by(|(a, _), (b, _)| a.as_str().cmp(&b.as_str()));
            if sorted.windows(2).any(|w| w[0].0.as_str() == w[1].0.as_str()) {
                return Ok(());
            }
            write_cases(pass, pc, &sorted, CaseMode::Ordered);
        }
        _ => {}
    }
    Ok(())
}

fn build_table(
    pass: &mut Pass<'_, '_, '_>,
    pc: usize,
    switch: Instruction,
    first: i64,
    range: usize,
    values: &[(i64, u16)],
) {
    let mut table: Vec<(Constant, u16)> = Vec::with_capacity(range);
    let mut next = values.iter().peekable();
    for slot in 0..range as i64 {
        let value = first + slot;
        match next.peek() {
            Some((v, target)) if *v == value => {
                table.push((Constant::Int(value), *target));
                next.next();
            }
            _ => table.push((Constant::Int(value), switch.b)),
        }
    }

    let existing = switch.c as usize;
    let (in_place, extra) = table.split_at(existing.min(table.len()));
    write_cases(pass, pc, in_place, CaseMode::Table);
    for (value, target) in extra {
        let index = pass.constants.add(value.clone());
        pass.insert_after(
            pc + existing,
            Instruction::new(OpCode::Case, index, *target, CaseMode::Table as u16),
        );
    }
    pass.instr_mut(pc).c = range as u16;
}

/// Overwrite the case instructions following the switch at `pc`.
fn write_cases(pass: &mut Pass<'_, '_, '_>, pc: usize, cases: &[(Constant, u16)], mode: CaseMode) {
    for (i, (value, target)) in cases.iter().enumerate() {
        let index = pass.constants.add(value.clone());
        *pass.instr_mut(pc + 1 + i) = Instruction::new(OpCode::Case, index, *target, mode as u16);
    }
}

/// `Rescue`: the handler register holds the caught exception.
pub(super) fn infer_rescue(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let caught = if instr.b == RESCUE_ANY {
        exception_type("Exception")
    } else {
        match pass.constants.get(instr.b) {
            Some(Constant::Type(ty)) => ty.clone(),
            Some(Constant::String(category)) => exception_type(category),
            _ => return Err(pass.fail(pc, InferErrorKind::InvalidOperation)),
        }
    };
    pass.bind(pc, instr.a, &caught)
}

// ============================================================================
// Tail calls
// ============================================================================

/// Flag calls whose result is immediately returned unchanged.
pub(super) fn mark_tail_calls(code: &mut [AnnotatedInstr]) {
    for pc in 1..code.len() {
        let ret = code[pc].instr;
        let call = &mut code[pc - 1].instr;
        if call.op.is_call() && ret.op == OpCode::Return && ret.b == 1 && ret.a == call.c {
            let flags = call.call_flags() | CallFlags::TAIL;
            call.set_call_flags(flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{RoutineBuilder, Span, TypeTable};

    #[test]
    fn read_before_any_write_is_rejected() {
        let t = TypeTable::global();
        let f = RoutineBuilder::new("f")
            .param("x", t.int())
            .line(2)
            .emit(OpCode::Add, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let err = check_definite_assignment(f.decl(), false, false).unwrap_err();
        let InferError::Typing(d) = err else {
            panic!("expected a typing error");
        };
        assert_eq!(d.kind, InferErrorKind::NotInitialized);
        assert_eq!(d.line(), 2);
        assert!(matches!(
            check_definite_assignment(f.decl(), false, true),
            Err(InferError::Silent)
        ));
    }

    #[test]
    fn one_sided_assignment_depends_on_strictness() {
        let t = TypeTable::global();
        // if x { y = 1 } return y
        let f = RoutineBuilder::new("g")
            .param("x", t.int())
            .emit(OpCode::Test, 0, 2, 0)
            .emit(OpCode::Data, 1, 1, 1)
            .emit(OpCode::Return, 1, 1, 0)
            .build();
        assert!(check_definite_assignment(f.decl(), false, false).is_ok());
        assert!(check_definite_assignment(f.decl(), true, false).is_err());
    }

    #[test]
    fn returned_call_results_become_tail_calls() {
        let mut code = vec![
            AnnotatedInstr::new(Instruction::new(OpCode::Call, 0, 1, 2), Span::line(1)),
            AnnotatedInstr::new(Instruction::new(OpCode::Return, 2, 1, 0), Span::line(1)),
            AnnotatedInstr::new(Instruction::new(OpCode::Call, 0, 1, 3), Span::line(2)),
            AnnotatedInstr::new(Instruction::new(OpCode::Return, 2, 1, 0), Span::line(2)),
        ];
        mark_tail_calls(&mut code);
        assert!(code[0].instr.call_flags().contains(CallFlags::TAIL));
        assert_eq!(code[0].instr.call_argc(), 1);
        assert!(!code[2].instr.call_flags().contains(CallFlags::TAIL));
    }
}
