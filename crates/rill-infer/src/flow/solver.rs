//! Generic worklist dataflow solver.
//!
//! ## Algorithm
//!
//! Every node starts at the bottom element (the empty register set). Nodes
//! are visited from a worklist seeded with all nodes in direction order; a
//! visit merges the neighbouring states (union), adds the problem's boundary
//! value at boundary nodes, applies the transfer function and grows the
//! node's output state. Only when the output grew are the downstream nodes
//! queued again.
//!
//! Output states are grown with a union, never replaced, so they only ever
//! increase. Since every state is bounded by the register universe, the
//! solver terminates for any transfer function; a monotone transfer function
//! makes the result the least fixed point.

use std::collections::VecDeque;

use rill_core::RegSet;

use super::FlowGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A dataflow problem over register sets.
pub trait FlowProblem {
    fn direction(&self) -> Direction;

    /// Value injected at boundary nodes: entries for forward problems, exits for backward ones.
    fn boundary(&self, universe: usize) -> RegSet;

    /// Transfer through instruction `pc`, from its input side to its output side.
    ///
    /// Must be monotone: a larger input never yields a smaller output.
    fn transfer(&self, pc: usize, input: &RegSet) -> RegSet;

    /// Width of the lattice elements. Register problems use the graph's
    /// register count; problems over instructions override it.
    fn width(&self, graph: &FlowGraph) -> usize {
        graph.universe
    }
}

/// Fixed-point states, in program order regardless of direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSolution {
    /// State just before each instruction executes.
    pub before: Vec<RegSet>,
    /// State just after each instruction executes.
    pub after: Vec<RegSet>,
}

impl FlowSolution {
    #[inline]
    pub fn before(&self, pc: usize) -> &RegSet {
        &self.before[pc]
    }

    #[inline]
    pub fn after(&self, pc: usize) -> &RegSet {
        &self.after[pc]
    }
}

/// Solve `problem` over `graph` to its fixed point.
pub fn solve_flow_equation<P: FlowProblem>(graph: &FlowGraph, problem: &P) -> FlowSolution {
    solve_flow_equation_observed(graph, problem, |_, _| {})
}

/// Like [`solve_flow_equation`], calling `observer` with each node's output state after every visit.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn solve_flow_equation_observed<P, F>(graph: &FlowGraph, problem: &P, mut observer: F) -> FlowSolution
where
    P: FlowProblem,
    F: FnMut(usize, &RegSet),
{
    let n = graph.len();
    let width = problem.width(graph);
    let direction = problem.direction();
    let boundary = problem.boundary(width);
    let mut before = vec![RegSet::new(width); n];
    let mut after = vec![RegSet::new(width); n];

    let mut is_boundary = vec![false; n];
    let boundary_nodes = match direction {
        Direction::Forward => &graph.entries,
        Direction::Backward => &graph.exits,
    };
    for &b in boundary_nodes {
        is_boundary[b] = true;
    }

    let mut queued = vec![true; n];
    let mut worklist: VecDeque<usize> = match direction {
        Direction::Forward => (0..n).collect(),
        Direction::Backward => (0..n).rev().collect(),
    };

    while let Some(node) = worklist.pop_front() {
        queued[node] = false;
        let mut input = RegSet::new(width);
        if is_boundary[node] {
            input.union_with(&boundary);
        }
        let (upstream, downstream) = match direction {
            Direction::Forward => (&graph.nodes[node].preds, &graph.nodes[node].succs),
            Direction::Backward => (&graph.nodes[node].succs, &graph.nodes[node].preds),
        };
        for &u in upstream {
            match direction {
                Direction::Forward => input.union_with(&after[u]),
                Direction::Backward => input.union_with(&before[u]),
            };
        }

        let output = problem.transfer(node, &input);
        let (input_side, output_side) = match direction {
            Direction::Forward => (&mut before[node], &mut after[node]),
            Direction::Backward => (&mut after[node], &mut before[node]),
        };
        input_side.union_with(&input);
        let grew = output_side.union_with(&output);
        observer(node, &*output_side);

        if grew {
            for &d in downstream {
                if !queued[d] {
                    queued[d] = true;
                    worklist.push_back(d);
                }
            }
        }
    }

    FlowSolution { before, after }
}
