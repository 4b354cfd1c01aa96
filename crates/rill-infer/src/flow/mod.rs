//! Control-flow graphs over one routine's instructions.
//!
//! One [`CodeNode`] per instruction. Edges come from fall-through (skipped
//! after unconditional jumps, returns and raises) and from explicit targets:
//! conditional tests, switch fan-out to every case target and the default,
//! exception handler entry, and rescue fall-through. `Case` instructions are
//! switch data, never executed, so they get no edges of their own.
//!
//! Building the graph never rewrites code.

mod definitions;
mod liveness;
mod solver;

pub use definitions::{DefUse, ReachingDefinitions, def_use_chains};
pub use liveness::{Liveness, PossiblyAssigned, PossiblyUnassigned, live_at_entry};
pub use solver::{Direction, FlowProblem, FlowSolution, solve_flow_equation, solve_flow_equation_observed};

use rill_core::{AnnotatedInstr, OpCode};

/// One instruction in the flow graph.
#[derive(Debug, Clone, Default)]
pub struct CodeNode {
    pub index: usize,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    pub nodes: Vec<CodeNode>,
    /// Nodes control enters through.
    pub entries: Vec<usize>,
    /// Nodes control leaves through: returns, raises, falling off the end.
    pub exits: Vec<usize>,
    /// Number of registers; the default width of lattice elements.
    pub universe: usize,
}

impl FlowGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes reachable from an entry.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = self.entries.clone();
        while let Some(n) = stack.pop() {
            if std::mem::replace(&mut seen[n], true) {
                continue;
            }
            stack.extend(self.nodes[n].succs.iter().copied().filter(|&s| !seen[s]));
        }
        seen
    }
}

/// Successor indices of instruction `pc`, before bounds filtering.
fn successors(code: &[AnnotatedInstr], pc: usize) -> Vec<usize> {
    let instr = &code[pc].instr;
    let next = pc + 1;
    match instr.op {
        OpCode::Goto => vec![instr.b as usize],
        OpCode::Return | OpCode::Raise => Vec::new(),
        OpCode::Case => Vec::new(),
        OpCode::Switch => {
            let mut targets = vec![instr.b as usize];
            for case in code.iter().skip(next).take(instr.c as usize) {
                if case.instr.op == OpCode::Case {
                    targets.push(case.instr.b as usize);
                }
            }
            targets
        }
        OpCode::Test | OpCode::TestI | OpCode::TestF | OpCode::TestD | OpCode::Try => {
            vec![next, instr.b as usize]
        }
        OpCode::Rescue => vec![next, instr.c as usize],
        _ => vec![next],
    }
}

/// Build the flow graph of `code` over `register_count` registers.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn build_flow_graph(code: &[AnnotatedInstr], register_count: usize) -> FlowGraph {
    let n = code.len();
    let mut nodes: Vec<CodeNode> = (0..n)
        .map(|index| CodeNode {
            index,
            ..CodeNode::default()
        })
        .collect();
    let mut exits = Vec::new();

    for pc in 0..n {
        let targets = successors(code, pc);
        let falls_off = targets.iter().any(|&s| s >= n);
        let mut succs: Vec<usize> = Vec::with_capacity(targets.len());
        for s in targets {
            if s < n && !succs.contains(&s) {
                succs.push(s);
            }
        }
        let is_case = code[pc].instr.op == OpCode::Case;
        if !is_case && (succs.is_empty() || falls_off) {
            exits.push(pc);
        }
        for &s in &succs {
            if !nodes[s].preds.contains(&pc) {
                nodes[s].preds.push(pc);
            }
        }
        nodes[pc].succs = succs;
    }

    FlowGraph {
        nodes,
        entries: if n > 0 { vec![0] } else { Vec::new() },
        exits,
        universe: register_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{Instruction, Span};

    fn code(ops: &[(OpCode, u16, u16, u16)]) -> Vec<AnnotatedInstr> {
        ops.iter()
            .map(|&(op, a, b, c)| AnnotatedInstr::new(Instruction::new(op, a, b, c), Span::line(1)))
            .collect()
    }

    #[test]
    fn branches_and_fallthrough() {
        let code = code(&[
            (OpCode::Test, 0, 3, 0),
            (OpCode::Data, 1, 1, 1),
            (OpCode::Goto, 0, 4, 0),
            (OpCode::Data, 1, 2, 1),
            (OpCode::Return, 1, 1, 0),
        ]);
        let g = build_flow_graph(&code, 2);
        assert_eq!(g.nodes[0].succs, vec![1, 3]);
        assert_eq!(g.nodes[2].succs, vec![4]);
        assert_eq!(g.nodes[4].preds, vec![2, 3]);
        assert_eq!(g.exits, vec![4]);
    }

    #[test]
    fn switch_fans_out_to_cases() {
        let code = code(&[
            (OpCode::Switch, 0, 4, 2),
            (OpCode::Case, 0, 3, 0),
            (OpCode::Case, 1, 4, 0),
            (OpCode::Return, 0, 0, 0),
            (OpCode::Return, 0, 0, 0),
        ]);
        let g = build_flow_graph(&code, 1);
        assert_eq!(g.nodes[0].succs, vec![4, 3]);
        assert!(g.nodes[1].succs.is_empty());
        assert!(g.nodes[1].preds.is_empty());
        let reach = g.reachable();
        assert!(!reach[1] && !reach[2]);
        assert!(reach[3] && reach[4]);
    }

    #[test]
    fn falling_off_the_end_is_an_exit() {
        let code = code(&[(OpCode::Data, 1, 1, 0), (OpCode::Move, 0, 0, 1)]);
        let g = build_flow_graph(&code, 2);
        assert_eq!(g.exits, vec![1]);
    }
}
