//! Register liveness and definite-assignment problems.
//!
//! All three problems share the operand classifier: a register is *used* by
//! the instruction's read set and *defined* by its write register.
//!
//! - [`Liveness`]: backward; may the register's value still be read before
//!   being overwritten. Nothing is live past an exit.
//! - [`PossiblyAssigned`]: forward; has the register been written on at
//!   least one path reaching the instruction. Parameters are assigned at entry.
//! - [`PossiblyUnassigned`]: forward; is there a path reaching the
//!   instruction on which the register was never written.

use rill_core::{AnnotatedInstr, RegSet, classify};

use super::{Direction, FlowGraph, FlowProblem, FlowSolution};

pub struct Liveness<'a> {
    code: &'a [AnnotatedInstr],
}

impl<'a> Liveness<'a> {
    pub fn new(code: &'a [AnnotatedInstr]) -> Self {
        Liveness { code }
    }
}

impl FlowProblem for Liveness<'_> {
    fn direction(&self) -> Direction {
        Direction::Backward
    }

    fn boundary(&self, universe: usize) -> RegSet {
        RegSet::new(universe)
    }

    fn transfer(&self, pc: usize, live_out: &RegSet) -> RegSet {
        let ops = classify(&self.code[pc].instr);
        let mut live = live_out.clone();
        if let Some(w) = ops.write {
            live.remove(w as usize);
        }
        for r in ops.reads.iter() {
            live.insert(r);
        }
        live
    }
}

pub struct PossiblyAssigned<'a> {
    code: &'a [AnnotatedInstr],
    params: usize,
}

impl<'a> PossiblyAssigned<'a> {
    pub fn new(code: &'a [AnnotatedInstr], params: usize) -> Self {
        PossiblyAssigned { code, params }
    }
}

impl FlowProblem for PossiblyAssigned<'_> {
    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn boundary(&self, universe: usize) -> RegSet {
        RegSet::prefix(universe, self.params)
    }

    fn transfer(&self, pc: usize, input: &RegSet) -> RegSet {
        let mut out = input.clone();
        if let Some(w) = classify(&self.code[pc].instr).write {
            out.insert(w as usize);
        }
        out
    }
}

pub struct PossiblyUnassigned<'a> {
    code: &'a [AnnotatedInstr],
    params: usize,
}

impl<'a> PossiblyUnassigned<'a> {
    pub fn new(code: &'a [AnnotatedInstr], params: usize) -> Self {
        PossiblyUnassigned { code, params }
    }
}

impl FlowProblem for PossiblyUnassigned<'_> {
    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn boundary(&self, universe: usize) -> RegSet {
        let mut set = RegSet::full(universe);
        for r in 0..self.params.min(universe) {
            set.remove(r);
        }
        set
    }

    fn transfer(&self, pc: usize, input: &RegSet) -> RegSet {
        let mut out = input.clone();
        if let Some(w) = classify(&self.code[pc].instr).write {
            out.remove(w as usize);
        }
        out
    }
}

/// Registers live when the routine is entered.
pub fn live_at_entry(graph: &FlowGraph, liveness: &FlowSolution) -> RegSet {
    graph
        .entries
        .iter()
        .fold(RegSet::new(graph.universe), |mut acc, &e| {
            acc.union_with(liveness.before(e));
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{build_flow_graph, solve_flow_equation, solve_flow_equation_observed};
    use rill_core::{Instruction, OpCode, Span};

    fn code(ops: &[(OpCode, u16, u16, u16)]) -> Vec<AnnotatedInstr> {
        ops.iter()
            .map(|&(op, a, b, c)| AnnotatedInstr::new(Instruction::new(op, a, b, c), Span::line(1)))
            .collect()
    }

    /// `r1 = 0; while (r1 < r0) r1 = r1 + r2; return r1` with r2 = 1 loaded inside.
    fn counting_loop() -> Vec<AnnotatedInstr> {
        code(&[
            (OpCode::Data, 1, 0, 1),
            (OpCode::Lt, 1, 0, 3),
            (OpCode::Test, 3, 6, 0),
            (OpCode::Data, 1, 1, 2),
            (OpCode::Add, 1, 2, 1),
            (OpCode::Goto, 0, 1, 0),
            (OpCode::Return, 1, 1, 0),
        ])
    }

    #[test]
    fn straight_line_liveness() {
        let code = code(&[
            (OpCode::Data, 1, 1, 1),
            (OpCode::Add, 0, 1, 2),
            (OpCode::Return, 2, 1, 0),
        ]);
        let g = build_flow_graph(&code, 3);
        let live = solve_flow_equation(&g, &Liveness::new(&code));
        assert_eq!(live.before(0).iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(live.before(1).iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(live.before(2).iter().collect::<Vec<_>>(), vec![2]);
        assert!(live.after(2).is_empty());
    }

    #[test]
    fn loop_carries_liveness_around_back_edge() {
        let code = counting_loop();
        let g = build_flow_graph(&code, 4);
        let live = solve_flow_equation(&g, &Liveness::new(&code));
        assert!(live.after(5).contains(0));
        assert!(live.after(5).contains(1));
        assert_eq!(live_at_entry(&g, &live).iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn fixed_point_is_idempotent() {
        let code = counting_loop();
        let g = build_flow_graph(&code, 4);
        let problem = Liveness::new(&code);
        let first = solve_flow_equation(&g, &problem);
        let second = solve_flow_equation(&g, &problem);
        assert_eq!(first, second);
        for pc in 0..code.len() {
            assert_eq!(&problem.transfer(pc, first.after(pc)), first.before(pc));
        }
    }

    #[test]
    fn states_only_grow() {
        let code = counting_loop();
        let g = build_flow_graph(&code, 4);
        let mut last: Vec<Option<RegSet>> = vec![None; code.len()];
        solve_flow_equation_observed(&g, &Liveness::new(&code), |pc, state| {
            if let Some(prev) = &last[pc] {
                assert!(prev.is_subset(state));
            }
            last[pc] = Some(state.clone());
        });
    }

    #[test]
    fn assignment_on_one_branch_only() {
        // 0: if !r0 goto 3; 1: r1 = 1; 2: return r1; 3: return r1
        let code = code(&[
            (OpCode::Test, 0, 3, 0),
            (OpCode::Data, 1, 1, 1),
            (OpCode::Return, 1, 1, 0),
            (OpCode::Return, 1, 1, 0),
        ]);
        let g = build_flow_graph(&code, 2);
        let assigned = solve_flow_equation(&g, &PossiblyAssigned::new(&code, 1));
        assert!(assigned.before(2).contains(1));
        assert!(!assigned.before(3).contains(1));
        let unassigned = solve_flow_equation(&g, &PossiblyUnassigned::new(&code, 1));
        assert!(!unassigned.before(2).contains(1));
        assert!(unassigned.before(3).contains(1));
        assert!(!unassigned.before(3).contains(0));
    }
}
