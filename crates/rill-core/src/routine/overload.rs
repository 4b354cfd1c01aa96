//! Overload sets and their parameter tries.
//!
//! Routines sharing a name are grouped in an [`OverloadSet`]. Each set keeps
//! two [`ParamTrie`]s, one per call shape: the *plain* trie holds every
//! routine's full parameter list, the *method* trie holds only receiver-taking
//! routines. A trie edge is one parameter type; walking the trie with the
//! argument types visits every candidate sharing a parameter prefix once.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;

use super::{Routine, RoutineFlags};
use crate::types::{Ty, TypeKind};
use crate::TypeHash;

/// One trie node.
#[derive(Debug, Default)]
pub struct TrieNode {
    /// Outgoing edges: parameter type at this position, child node index.
    pub edges: Vec<(Ty, usize)>,
    /// Routines whose parameter list can end at this node (rest defaulted).
    pub complete: Vec<usize>,
    /// Routines taking any number of further arguments from this node.
    pub variadic: Vec<usize>,
}

#[derive(Debug)]
pub struct ParamTrie {
    nodes: Vec<TrieNode>,
}

impl Default for ParamTrie {
    fn default() -> Self {
        ParamTrie {
            nodes: vec![TrieNode::default()],
        }
    }
}

impl ParamTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the parameter list of candidate `routine`.
    pub fn insert(&mut self, params: &[Ty], routine: usize) {
        let mut node = 0;
        for (i, param) in params.iter().enumerate() {
            if param.kind() == TypeKind::VarArgs {
                self.nodes[node].variadic.push(routine);
                return;
            }
            let rest_defaulted = params[i..]
                .iter()
                .all(|p| matches!(p.kind(), TypeKind::Default | TypeKind::VarArgs));
            if rest_defaulted {
                self.nodes[node].complete.push(routine);
            }
            node = match self.nodes[node]
                .edges
                .iter()
                .find(|(t, _)| t.hash() == param.hash())
            {
                Some((_, child)) => *child,
                None => {
                    self.nodes.push(TrieNode::default());
                    let child = self.nodes.len() - 1;
                    self.nodes[node].edges.push((param.clone(), child));
                    child
                }
            };
        }
        if !self.nodes[node].complete.contains(&routine) {
            self.nodes[node].complete.push(routine);
        }
    }

    #[inline]
    pub fn root(&self) -> &TrieNode {
        &self.nodes[0]
    }

    #[inline]
    pub fn node(&self, index: usize) -> &TrieNode {
        &self.nodes[index]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Same-named routines, in declaration order.
pub struct OverloadSet {
    name: Arc<str>,
    routines: Vec<Arc<Routine>>,
    plain: ParamTrie,
    method: ParamTrie,
    resolved: Mutex<FxHashMap<(bool, TypeHash), usize>>,
}

impl std::fmt::Debug for OverloadSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverloadSet")
            .field("name", &self.name)
            .field("routines", &self.routines.len())
            .finish()
    }
}

impl OverloadSet {
    pub fn new(name: impl Into<Arc<str>>, routines: Vec<Arc<Routine>>) -> Self {
        let mut plain = ParamTrie::new();
        let mut method = ParamTrie::new();
        for (i, routine) in routines.iter().enumerate() {
            let sig = routine.signature();
            plain.insert(sig.params(), i);
            if routine.flags().contains(RoutineFlags::METHOD) {
                method.insert(sig.params(), i);
            }
        }
        OverloadSet {
            name: name.into(),
            routines,
            plain,
            method,
            resolved: Mutex::new(FxHashMap::default()),
        }
    }

    /// A new set with `routine` appended after the existing candidates.
    pub fn with(&self, routine: Arc<Routine>) -> OverloadSet {
        let mut routines = self.routines.clone();
        routines.push(routine);
        OverloadSet::new(self.name.clone(), routines)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn routines(&self) -> &[Arc<Routine>] {
        &self.routines
    }

    pub fn trie(&self, method_call: bool) -> &ParamTrie {
        if method_call { &self.method } else { &self.plain }
    }

    /// Previously resolved candidate for an argument signature.
    pub fn cached(&self, method_call: bool, key: TypeHash) -> Option<usize> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(method_call, key))
            .copied()
    }

    pub fn remember(&self, method_call: bool, key: TypeHash, index: usize) {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((method_call, key), index);
    }
}
