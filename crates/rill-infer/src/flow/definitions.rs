//! Reaching definitions and def-use chains.
//!
//! A definition is an instruction that writes a register; the lattice is a
//! set of instruction indices rather than registers. A definition reaches an
//! instruction when some path from it gets there without another write to the
//! same register. Parameters are defined at entry and have no instruction, so
//! they never appear in the sets.

use rill_core::{AnnotatedInstr, RegSet, classify};

use super::{Direction, FlowGraph, FlowProblem, FlowSolution};

pub struct ReachingDefinitions {
    /// Register written by each instruction.
    writes: Vec<Option<usize>>,
    /// Every instruction writing each register.
    defs_of: Vec<RegSet>,
}

impl ReachingDefinitions {
    pub fn new(code: &[AnnotatedInstr], register_count: usize) -> Self {
        let n = code.len();
        let writes: Vec<Option<usize>> = code
            .iter()
            .map(|ai| classify(&ai.instr).write.map(usize::from))
            .collect();
        let mut defs_of = vec![RegSet::new(n); register_count];
        for (pc, w) in writes.iter().enumerate() {
            if let Some(set) = w.and_then(|r| defs_of.get_mut(r)) {
                set.insert(pc);
            }
        }
        ReachingDefinitions { writes, defs_of }
    }

    /// Register defined by instruction `pc`, if it writes one.
    pub fn register_of(&self, pc: usize) -> Option<usize> {
        self.writes.get(pc).copied().flatten()
    }
}

impl FlowProblem for ReachingDefinitions {
    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn boundary(&self, width: usize) -> RegSet {
        RegSet::new(width)
    }

    fn transfer(&self, pc: usize, input: &RegSet) -> RegSet {
        let mut out = input.clone();
        if let Some(reg) = self.register_of(pc) {
            if let Some(killed) = self.defs_of.get(reg) {
                for def in killed.iter() {
                    out.remove(def);
                }
            }
            out.insert(pc);
        }
        out
    }

    fn width(&self, graph: &FlowGraph) -> usize {
        graph.len()
    }
}

/// Links between definitions and the instructions reading them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefUse {
    /// Instructions reading the value defined at each index.
    pub uses: Vec<Vec<usize>>,
    /// Definitions each instruction may read.
    pub defs: Vec<Vec<usize>>,
}

impl DefUse {
    /// Definitions nothing reads.
    pub fn unused(&self, reaching: &ReachingDefinitions) -> Vec<usize> {
        (0..self.uses.len())
            .filter(|&pc| reaching.register_of(pc).is_some() && self.uses[pc].is_empty())
            .collect()
    }
}

/// Def-use chains from a solved [`ReachingDefinitions`] problem.
pub fn def_use_chains(
    code: &[AnnotatedInstr],
    reaching: &ReachingDefinitions,
    solution: &FlowSolution,
) -> DefUse {
    let n = code.len();
    let mut chains = DefUse {
        uses: vec![Vec::new(); n],
        defs: vec![Vec::new(); n],
    };
    for (pc, ai) in code.iter().enumerate() {
        let mut reads: Vec<usize> = classify(&ai.instr).reads.iter().collect();
        reads.sort_unstable();
        reads.dedup();
        for def in solution.before(pc).iter() {
            if reaching.register_of(def).is_some_and(|r| reads.contains(&r)) {
                chains.uses[def].push(pc);
                chains.defs[pc].push(def);
            }
        }
    }
    chains
}
