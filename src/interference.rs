//! Interference graph construction
//!
//! Two virtual registers interfere when their live ranges hold distinct
//! values at the same program point; interfering registers must not share a
//! physical register. The graph is built per allocation round by walking
//! each block backward from its live-out set:
//!
//! - defs of an instruction interfere with everything live across it
//! - for a move `dst := src`, `src` is taken out of the live set first, so
//!   the pair stays coalescable, and the move is recorded for the coalescer
//! - defs then leave the live set and uses enter it
//!
//! Precolored registers appear as fixed-color nodes: they take part in
//! edges, but their own adjacency is never enumerated and their degree is
//! pinned effectively infinite, so the coloring engine can never simplify
//! or spill them.

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::liveness::Liveness;
use crate::mir::{Function, PReg, VReg};

/// Degree assigned to precolored nodes; never decremented
pub(crate) const PRECOLORED_DEGREE: usize = usize::MAX;

/// A move recorded for coalescing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MovePair {
    pub dst: VReg,
    pub src: VReg,
}

/// Interference graph over the function's virtual registers
#[derive(Debug)]
pub struct InterferenceGraph {
    /// Edge set in canonical (low, high) order, for O(1) membership checks
    adj_set: HashSet<(u32, u32)>,
    /// Adjacency lists; empty for precolored nodes
    pub(crate) adj_list: Vec<Vec<VReg>>,
    /// Current degree of each node
    pub(crate) degree: Vec<usize>,
    /// All recorded moves, deduplicated
    pub(crate) moves: Vec<MovePair>,
    /// Per-node indices into `moves`
    pub(crate) move_list: Vec<Vec<usize>>,
    /// Which nodes carry a fixed color
    pub(crate) precolored: Vec<Option<PReg>>,
}

impl InterferenceGraph {
    fn new(num_nodes: usize, precolored: Vec<Option<PReg>>) -> Self {
        let degree = precolored
            .iter()
            .map(|p| if p.is_some() { PRECOLORED_DEGREE } else { 0 })
            .collect();
        Self {
            adj_set: HashSet::new(),
            adj_list: vec![Vec::new(); num_nodes],
            degree,
            moves: Vec::new(),
            move_list: vec![Vec::new(); num_nodes],
            precolored,
        }
    }

    /// Build the graph from liveness information
    ///
    /// Any valid liveness result yields a valid graph; block order does not
    /// matter, and unreachable blocks contribute their local edges.
    pub fn build(func: &Function, liveness: &Liveness, precolored: &[Option<PReg>]) -> Self {
        let mut graph = Self::new(func.vreg_count as usize, precolored.to_vec());
        let mut seen_moves: HashSet<(u32, u32)> = HashSet::new();

        for block in &func.blocks {
            let mut live = liveness.live_out[block.id.0 as usize].clone();

            for inst in block.insts.iter().rev() {
                if let Some((dst, src)) = inst.move_operands() {
                    live.remove(&src);
                    if dst != src && seen_moves.insert((dst.0, src.0)) {
                        let idx = graph.moves.len();
                        graph.moves.push(MovePair { dst, src });
                        graph.move_list[dst.0 as usize].push(idx);
                        graph.move_list[src.0 as usize].push(idx);
                    }
                }

                // Defs join the live set before edges are added, so the
                // defs of one instruction also conflict with each other
                for &def in inst.defs() {
                    live.insert(def);
                }
                for &def in inst.defs() {
                    for &other in &live {
                        if other != def {
                            graph.add_edge(def, other);
                        }
                    }
                }
                for &def in inst.defs() {
                    live.remove(&def);
                }
                for &used in inst.uses() {
                    live.insert(used);
                }
            }
        }

        graph
    }

    /// Add an interference edge between two nodes
    pub(crate) fn add_edge(&mut self, u: VReg, v: VReg) {
        if u == v {
            return;
        }
        let key = if u.0 < v.0 { (u.0, v.0) } else { (v.0, u.0) };
        if self.adj_set.insert(key) {
            if self.precolored[u.0 as usize].is_none() {
                self.adj_list[u.0 as usize].push(v);
                self.degree[u.0 as usize] += 1;
            }
            if self.precolored[v.0 as usize].is_none() {
                self.adj_list[v.0 as usize].push(u);
                self.degree[v.0 as usize] += 1;
            }
        }
    }

    /// Check if two nodes interfere
    pub fn interferes(&self, u: VReg, v: VReg) -> bool {
        let key = if u.0 < v.0 { (u.0, v.0) } else { (v.0, u.0) };
        self.adj_set.contains(&key)
    }

    /// Get the current degree of a node
    pub fn degree(&self, v: VReg) -> usize {
        self.degree[v.0 as usize]
    }

    /// Number of nodes in the graph
    pub fn num_nodes(&self) -> usize {
        self.adj_list.len()
    }

    /// All interference edges, in canonical order
    pub fn edges(&self) -> impl Iterator<Item = (VReg, VReg)> + '_ {
        self.adj_set.iter().map(|&(a, b)| (VReg(a), VReg(b)))
    }

    /// Render the graph in Graphviz format for debugging failed colorings
    ///
    /// Interference edges are solid, recorded moves dashed, precolored
    /// nodes boxed with their fixed color.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("graph interference {\n");

        for (idx, pre) in self.precolored.iter().enumerate() {
            if let Some(color) = pre {
                let _ = writeln!(
                    out,
                    "    v{} [shape=box, label=\"v{}:{}\"];",
                    idx, idx, color
                );
            }
        }

        let mut edges: Vec<(u32, u32)> = self.adj_set.iter().copied().collect();
        edges.sort_unstable();
        for (a, b) in edges {
            let _ = writeln!(out, "    v{} -- v{};", a, b);
        }
        for mv in &self.moves {
            let _ = writeln!(out, "    {} -- {} [style=dashed];", mv.dst, mv.src);
        }

        out.push_str("}\n");
        out
    }
}
