//! Splicing synthesized instructions into a routine.
//!
//! Coercions are recorded against the original instruction index they belong
//! to, either before it (preparing an operand) or after it (converting its
//! result). Splicing keeps every original instruction's relative order, gives
//! inserted instructions the span of their anchor, and remaps every branch
//! target, including those of inserted instructions. A jump to an original
//! instruction lands on the first instruction inserted before it, so operand
//! preparation is never skipped.
//!
//! Pruning drops instructions no path from the entry reaches, such as the
//! cases of a switch folded into a jump, with the same target remapping.

use std::sync::Arc;

use rill_core::{AnnotatedInstr, Instruction, OpCode, Routine};
use rustc_hash::FxHashMap;

use crate::flow::build_flow_graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Before,
    After,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Insertion {
    pub pc: usize,
    pub placement: Placement,
    pub instr: Instruction,
}

/// Splice `inserts` into `code`; static callees are re-keyed to their new index.
pub(crate) fn splice(
    code: &[AnnotatedInstr],
    inserts: &[Insertion],
    static_callees: FxHashMap<usize, Arc<Routine>>,
) -> (Vec<AnnotatedInstr>, FxHashMap<usize, Arc<Routine>>) {
    if inserts.is_empty() {
        return (code.to_vec(), static_callees);
    }
    let n = code.len();
    let mut before: Vec<Vec<Instruction>> = vec![Vec::new(); n];
    let mut after: Vec<Vec<Instruction>> = vec![Vec::new(); n];
    for ins in inserts.iter().filter(|i| i.pc < n) {
        match ins.placement {
            Placement::Before => before[ins.pc].push(ins.instr),
            Placement::After => after[ins.pc].push(ins.instr),
        }
    }

    // Landing index of each original instruction and its own new index.
    let mut landing = Vec::with_capacity(n + 1);
    let mut position = Vec::with_capacity(n);
    let mut next = 0usize;
    for pc in 0..n {
        landing.push(next);
        next += before[pc].len();
        position.push(next);
        next += 1 + after[pc].len();
    }
    landing.push(next);

    let mut out = Vec::with_capacity(next);
    for (pc, ai) in code.iter().enumerate() {
        for instr in &before[pc] {
            out.push(AnnotatedInstr::new(*instr, ai.span));
        }
        out.push(*ai);
        for instr in &after[pc] {
            out.push(AnnotatedInstr::new(*instr, ai.span));
        }
    }
    for ai in &mut out {
        if let Some(target) = ai.instr.target() {
            ai.instr.set_target(landing[target.min(n)]);
        }
    }

    let callees = static_callees
        .into_iter()
        .filter(|(pc, _)| *pc < n)
        .map(|(pc, r)| (position[pc], r))
        .collect();
    (out, callees)
}

/// Remove unreachable instructions; static callees are re-keyed to their new index.
pub(crate) fn prune_unreachable(
    code: Vec<AnnotatedInstr>,
    static_callees: FxHashMap<usize, Arc<Routine>>,
) -> (Vec<AnnotatedInstr>, FxHashMap<usize, Arc<Routine>>) {
    let n = code.len();
    let mut keep = build_flow_graph(&code, 0).reachable();
    for pc in 0..n {
        let instr = code[pc].instr;
        if keep[pc] && instr.op == OpCode::Switch {
            // Case data of a live switch.
            for case in (pc + 1..n).take(instr.c as usize) {
                keep[case] = true;
            }
        }
    }
    if keep.iter().all(|&k| k) {
        return (code, static_callees);
    }

    // New index of each kept instruction; a removed one maps to the next kept.
    let mut landing = vec![0usize; n + 1];
    let mut next = 0usize;
    for pc in 0..n {
        landing[pc] = next;
        next += keep[pc] as usize;
    }
    landing[n] = next;

    let mut out: Vec<AnnotatedInstr> = code
        .into_iter()
        .zip(&keep)
        .filter_map(|(ai, &k)| k.then_some(ai))
        .collect();
    for ai in &mut out {
        if let Some(target) = ai.instr.target() {
            ai.instr.set_target(landing[target.min(n)]);
        }
    }
    tracing::trace!(removed = n - out.len(), "pruned unreachable instructions");

    let callees = static_callees
        .into_iter()
        .filter(|(pc, _)| *pc < n && keep[*pc])
        .map(|(pc, r)| (landing[pc], r))
        .collect();
    (out, callees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{OpCode, Span};

    fn code(ops: &[(OpCode, u16, u16, u16)]) -> Vec<AnnotatedInstr> {
        ops.iter()
            .enumerate()
            .map(|(i, &(op, a, b, c))| {
                AnnotatedInstr::new(Instruction::new(op, a, b, c), Span::line(i as u32 + 1))
            })
            .collect()
    }

    #[test]
    fn targets_land_before_inserted_preparation() {
        let original = code(&[
            (OpCode::Data, 1, 0, 0),
            (OpCode::Goto, 0, 3, 0),
            (OpCode::Nop, 0, 0, 0),
            (OpCode::Return, 0, 1, 0),
        ]);
        let inserts = [
            Insertion {
                pc: 3,
                placement: Placement::Before,
                instr: Instruction::new(OpCode::MoveDI, 0, 0, 1),
            },
            Insertion {
                pc: 0,
                placement: Placement::After,
                instr: Instruction::new(OpCode::Nop, 0, 0, 0),
            },
        ];
        let (spliced, _) = splice(&original, &inserts, FxHashMap::default());
        assert_eq!(spliced.len(), 6);
        assert_eq!(spliced[2].op(), OpCode::Goto);
        assert_eq!(spliced[2].instr.b, 4);
        assert_eq!(spliced[4].op(), OpCode::MoveDI);
        assert_eq!(spliced[4].line(), 4);
        assert_eq!(spliced[5].op(), OpCode::Return);
    }

    #[test]
    fn inserted_branches_are_remapped() {
        let original = code(&[
            (OpCode::Switch, 0, 2, 1),
            (OpCode::Case, 0, 2, 2),
            (OpCode::Return, 0, 0, 0),
        ]);
        let inserts = [Insertion {
            pc: 1,
            placement: Placement::After,
            instr: Instruction::new(OpCode::Case, 1, 2, 2),
        }];
        let (spliced, _) = splice(&original, &inserts, FxHashMap::default());
        assert_eq!(spliced[0].instr.b, 3);
        assert_eq!(spliced[1].instr.b, 3);
        assert_eq!(spliced[2].instr.b, 3);
    }

    #[test]
    fn unreachable_code_is_pruned() {
        // 0: goto 3; 1-2: dead; 3: switch r0 with two cases; 6: return
        let original = code(&[
            (OpCode::Goto, 0, 3, 0),
            (OpCode::Data, 1, 1, 0),
            (OpCode::Return, 0, 1, 0),
            (OpCode::Switch, 0, 6, 2),
            (OpCode::Case, 0, 6, 0),
            (OpCode::Case, 1, 6, 0),
            (OpCode::Return, 0, 0, 0),
        ]);
        let routine = rill_core::RoutineBuilder::new("f").build();
        let mut callees = FxHashMap::default();
        callees.insert(6, routine);
        let (pruned, callees) = prune_unreachable(original, callees);
        let ops: Vec<OpCode> = pruned.iter().map(|ai| ai.op()).collect();
        assert_eq!(
            ops,
            vec![OpCode::Goto, OpCode::Switch, OpCode::Case, OpCode::Case, OpCode::Return]
        );
        assert_eq!(pruned[0].instr.b, 1);
        assert_eq!(pruned[1].instr.b, 4);
        assert_eq!(pruned[3].instr.b, 4);
        assert_eq!(pruned[1].line(), 4);
        assert!(callees.contains_key(&4));
    }

    #[test]
    fn reachable_code_is_left_alone() {
        let original = code(&[(OpCode::Data, 1, 1, 0), (OpCode::Return, 0, 1, 0)]);
        let (pruned, _) = prune_unreachable(original.clone(), FxHashMap::default());
        assert_eq!(pruned, original);
    }

    #[test]
    fn static_callees_follow_their_call() {
        let original = code(&[(OpCode::Data, 1, 1, 0), (OpCode::Call, 1, 0, 2)]);
        let inserts = [Insertion {
            pc: 0,
            placement: Placement::After,
            instr: Instruction::new(OpCode::MoveDI, 0, 0, 3),
        }];
        let routine = rill_core::RoutineBuilder::new("f").build();
        let mut callees = FxHashMap::default();
        callees.insert(1, routine);
        let (_, callees) = splice(&original, &inserts, callees);
        assert!(callees.contains_key(&2));
    }
}
