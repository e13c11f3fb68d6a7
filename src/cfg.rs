//! Control flow graph construction and analysis
//!
//! This module builds a CFG view over a function's blocks and provides the
//! analyses the allocator needs on top of it:
//! - Predecessor/successor relationships
//! - Traversal orders for dataflow analysis
//! - Dominators and natural-loop detection, used to derive loop depths

use std::collections::{HashMap, HashSet, VecDeque};

use crate::mir::{BlockId, Function};

/// Control flow graph over a function's block arena
///
/// The graph is read-only to the allocator: it is rebuilt whenever the
/// instruction stream changes and never mutates the function itself.
/// Successor edges pointing at blocks outside the arena are dropped here,
/// so downstream analyses never have to re-check them.
#[derive(Debug)]
pub struct Cfg {
    /// Entry block
    pub entry: BlockId,
    /// Predecessors for each block, indexed by block id
    pub predecessors: Vec<Vec<BlockId>>,
    /// Successors for each block, indexed by block id
    pub successors: Vec<Vec<BlockId>>,
    /// Reverse post-order traversal of the reachable blocks
    pub rpo: Vec<BlockId>,
    /// Post-order traversal of the reachable blocks
    pub post_order: Vec<BlockId>,
    /// Immediate dominator for each block, if reachable and not the entry
    idom: Vec<Option<BlockId>>,
}

impl Cfg {
    /// Build a CFG from a function
    pub fn build(func: &Function) -> Self {
        let n = func.blocks.len();
        let mut cfg = Cfg {
            entry: func.entry,
            predecessors: vec![Vec::new(); n],
            successors: vec![Vec::new(); n],
            rpo: Vec::new(),
            post_order: Vec::new(),
            idom: vec![None; n],
        };

        for block in &func.blocks {
            // Tolerate dangling edges: a successor outside the arena is dropped
            let succs: Vec<BlockId> = block
                .succs
                .iter()
                .copied()
                .filter(|s| func.has_block(*s))
                .collect();
            for &succ in &succs {
                cfg.predecessors[succ.0 as usize].push(block.id);
            }
            cfg.successors[block.id.0 as usize] = succs;
        }

        if n > 0 {
            cfg.compute_post_order();
            cfg.compute_dominators();
        }

        cfg
    }

    /// Compute post-order traversal using DFS from the entry
    fn compute_post_order(&mut self) {
        let mut visited = vec![false; self.successors.len()];
        let mut post_order = Vec::new();

        fn dfs(
            block: BlockId,
            successors: &[Vec<BlockId>],
            visited: &mut [bool],
            post_order: &mut Vec<BlockId>,
        ) {
            if visited[block.0 as usize] {
                return;
            }
            visited[block.0 as usize] = true;
            for &succ in &successors[block.0 as usize] {
                dfs(succ, successors, visited, post_order);
            }
            post_order.push(block);
        }

        if (self.entry.0 as usize) < visited.len() {
            dfs(self.entry, &self.successors, &mut visited, &mut post_order);
        }

        self.post_order = post_order.clone();
        self.rpo = post_order.into_iter().rev().collect();
    }

    /// Compute immediate dominators with the iterative Cooper-Harvey-Kennedy scheme
    fn compute_dominators(&mut self) {
        if self.rpo.is_empty() {
            return;
        }
        let rpo_index: HashMap<BlockId, usize> =
            self.rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut doms: Vec<Option<BlockId>> = vec![None; self.successors.len()];
        doms[self.entry.0 as usize] = Some(self.entry);

        let mut changed = true;
        while changed {
            changed = false;

            for &block in &self.rpo {
                if block == self.entry {
                    continue;
                }

                // First processed predecessor seeds the intersection
                let preds = &self.predecessors[block.0 as usize];
                let mut new_idom = None;
                for &pred in preds {
                    if doms[pred.0 as usize].is_some() {
                        new_idom = Some(pred);
                        break;
                    }
                }

                if let Some(mut idom) = new_idom {
                    for &pred in preds {
                        if pred != idom && doms[pred.0 as usize].is_some() {
                            idom = Self::intersect(pred, idom, &doms, &rpo_index);
                        }
                    }

                    if doms[block.0 as usize] != Some(idom) {
                        doms[block.0 as usize] = Some(idom);
                        changed = true;
                    }
                }
            }
        }

        for (idx, dom) in doms.into_iter().enumerate() {
            if let Some(idom) = dom
                && idom.0 as usize != idx
            {
                self.idom[idx] = Some(idom);
            }
        }
    }

    /// Find the common dominator of two blocks by walking both fingers up the tree
    fn intersect(
        b1: BlockId,
        b2: BlockId,
        doms: &[Option<BlockId>],
        rpo_index: &HashMap<BlockId, usize>,
    ) -> BlockId {
        let get_idx = |b: BlockId| rpo_index.get(&b).copied().unwrap_or(usize::MAX);

        let mut finger1 = b1;
        let mut finger2 = b2;

        while finger1 != finger2 {
            while get_idx(finger1) > get_idx(finger2) {
                match doms[finger1.0 as usize] {
                    Some(dom) if dom != finger1 => finger1 = dom,
                    _ => return finger2,
                }
            }
            while get_idx(finger2) > get_idx(finger1) {
                match doms[finger2.0 as usize] {
                    Some(dom) if dom != finger2 => finger2 = dom,
                    _ => return finger1,
                }
            }
        }
        finger1
    }

    /// Check if block `a` dominates block `b`
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(idom) = self.idom[current.0 as usize] {
            if idom == a {
                return true;
            }
            current = idom;
        }
        false
    }
}

/// Natural-loop structure of a CFG
#[derive(Debug)]
pub struct LoopInfo {
    /// Natural loops: header -> blocks in the loop (header included)
    pub loops: HashMap<BlockId, HashSet<BlockId>>,
    /// Loop depth for each block (0 = not in a loop), indexed by block id
    pub loop_depth: Vec<u32>,
}

impl LoopInfo {
    /// Detect natural loops from back edges
    pub fn compute(func: &Function, cfg: &Cfg) -> Self {
        let mut info = LoopInfo {
            loops: HashMap::new(),
            loop_depth: vec![0; func.blocks.len()],
        };

        // A back edge runs from B to a header H that dominates B
        let mut back_edges: Vec<(BlockId, BlockId)> = Vec::new();
        for block in &func.blocks {
            for &succ in &cfg.successors[block.id.0 as usize] {
                if cfg.dominates(succ, block.id) {
                    back_edges.push((block.id, succ));
                }
            }
        }

        // The natural loop of a back edge is everything that reaches its
        // tail without passing through the header
        for (tail, header) in back_edges {
            let mut loop_blocks = HashSet::new();
            loop_blocks.insert(header);

            let mut worklist = VecDeque::new();
            if tail != header {
                loop_blocks.insert(tail);
                worklist.push_back(tail);
            }

            while let Some(block) = worklist.pop_front() {
                for &pred in &cfg.predecessors[block.0 as usize] {
                    if !loop_blocks.contains(&pred) {
                        loop_blocks.insert(pred);
                        worklist.push_back(pred);
                    }
                }
            }

            // Loops with several back edges share one header entry
            info.loops.entry(header).or_default().extend(loop_blocks);
        }

        for blocks in info.loops.values() {
            for &block in blocks {
                info.loop_depth[block.0 as usize] += 1;
            }
        }

        info
    }

    /// Check if a block is a loop header
    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loops.contains_key(&block)
    }

    /// Get the loop depth of a block
    pub fn depth(&self, block: BlockId) -> u32 {
        self.loop_depth[block.0 as usize]
    }

    /// Write the per-block depths onto every instruction
    ///
    /// For front-ends that do not annotate loop depths themselves; the
    /// allocator only ever reads the instruction annotation.
    pub fn annotate(&self, func: &mut Function) {
        for block in &mut func.blocks {
            let depth = self.loop_depth[block.id.0 as usize];
            for inst in &mut block.insts {
                inst.loop_depth = depth;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::Inst;

    fn make_diamond_function() -> Function {
        // bb0: v0 = op        -> bb1, bb2
        // bb1: v1 = op v0     -> bb3
        // bb2: v1 = op v0     -> bb3
        // bb3: use v1
        let mut func = Function::new();
        let bb0 = func.alloc_block();
        let bb1 = func.alloc_block();
        let bb2 = func.alloc_block();
        let bb3 = func.alloc_block();
        func.entry = bb0;

        let v0 = func.alloc_vreg();
        let v1 = func.alloc_vreg();

        func.block_mut(bb0).insts.push(Inst::op(vec![v0], vec![]));
        func.block_mut(bb0).succs = vec![bb1, bb2];
        func.block_mut(bb1).insts.push(Inst::op(vec![v1], vec![v0]));
        func.block_mut(bb1).succs = vec![bb3];
        func.block_mut(bb2).insts.push(Inst::op(vec![v1], vec![v0]));
        func.block_mut(bb2).succs = vec![bb3];
        func.block_mut(bb3).insts.push(Inst::op(vec![], vec![v1]));

        func
    }

    fn make_loop_function() -> Function {
        // bb0: v0 = op            -> bb1
        // bb1: v1 = op v0         -> bb2, bb3   (loop header)
        // bb2: v0 = op v1         -> bb1        (back edge)
        // bb3: use v1
        let mut func = Function::new();
        let bb0 = func.alloc_block();
        let bb1 = func.alloc_block();
        let bb2 = func.alloc_block();
        let bb3 = func.alloc_block();
        func.entry = bb0;

        let v0 = func.alloc_vreg();
        let v1 = func.alloc_vreg();

        func.block_mut(bb0).insts.push(Inst::op(vec![v0], vec![]));
        func.block_mut(bb0).succs = vec![bb1];
        func.block_mut(bb1).insts.push(Inst::op(vec![v1], vec![v0]));
        func.block_mut(bb1).succs = vec![bb2, bb3];
        func.block_mut(bb2).insts.push(Inst::op(vec![v0], vec![v1]));
        func.block_mut(bb2).succs = vec![bb1];
        func.block_mut(bb3).insts.push(Inst::op(vec![], vec![v1]));

        func
    }

    #[test]
    fn test_cfg_construction() {
        let func = make_diamond_function();
        let cfg = Cfg::build(&func);

        assert_eq!(cfg.successors[0].len(), 2);
        assert_eq!(cfg.successors[1], vec![BlockId(3)]);
        assert_eq!(cfg.successors[2], vec![BlockId(3)]);
        assert!(cfg.successors[3].is_empty());

        assert!(cfg.predecessors[0].is_empty());
        assert_eq!(cfg.predecessors[3].len(), 2);
    }

    #[test]
    fn test_post_order_ends_at_entry() {
        let func = make_diamond_function();
        let cfg = Cfg::build(&func);

        assert_eq!(cfg.post_order.len(), 4);
        assert_eq!(*cfg.post_order.last().unwrap(), BlockId(0));
        assert_eq!(cfg.rpo[0], BlockId(0));
    }

    #[test]
    fn test_dominators() {
        let func = make_diamond_function();
        let cfg = Cfg::build(&func);

        assert!(cfg.dominates(BlockId(0), BlockId(0)));
        assert!(cfg.dominates(BlockId(0), BlockId(1)));
        assert!(cfg.dominates(BlockId(0), BlockId(2)));
        assert!(cfg.dominates(BlockId(0), BlockId(3)));

        // Neither arm dominates the join point
        assert!(!cfg.dominates(BlockId(1), BlockId(3)));
        assert!(!cfg.dominates(BlockId(2), BlockId(3)));
    }

    #[test]
    fn test_dangling_edge_dropped() {
        let mut func = make_diamond_function();
        func.block_mut(BlockId(3)).succs.push(BlockId(17));

        let cfg = Cfg::build(&func);
        assert!(cfg.successors[3].is_empty());
    }

    #[test]
    fn test_loop_detection() {
        let func = make_loop_function();
        let cfg = Cfg::build(&func);
        let loops = LoopInfo::compute(&func, &cfg);

        assert!(loops.is_loop_header(BlockId(1)));
        assert_eq!(loops.depth(BlockId(0)), 0);
        assert_eq!(loops.depth(BlockId(1)), 1);
        assert_eq!(loops.depth(BlockId(2)), 1);
        assert_eq!(loops.depth(BlockId(3)), 0);
    }

    #[test]
    fn test_annotate_writes_instruction_depths() {
        let mut func = make_loop_function();
        let cfg = Cfg::build(&func);
        let loops = LoopInfo::compute(&func, &cfg);
        loops.annotate(&mut func);

        assert_eq!(func.block(BlockId(0)).insts[0].loop_depth, 0);
        assert_eq!(func.block(BlockId(1)).insts[0].loop_depth, 1);
        assert_eq!(func.block(BlockId(2)).insts[0].loop_depth, 1);
        assert_eq!(func.block(BlockId(3)).insts[0].loop_depth, 0);
    }
}
