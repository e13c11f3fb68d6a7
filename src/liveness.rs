//! Liveness analysis
//!
//! Backward dataflow over the CFG, iterated to a fixed point:
//! - live_in[B]  = use[B] ∪ (live_out[B] - def[B])
//! - live_out[B] = ∪ live_in[S] for all successors S of B
//!
//! The fixed point is order-independent, so back edges need no special
//! handling; the traversal order only affects how fast the sets converge.
//! The analysis never mutates the instruction stream.

use std::collections::HashSet;

use crate::cfg::Cfg;
use crate::mir::{BlockId, Function, VReg};

/// Per-block live-in/live-out sets
#[derive(Debug)]
pub struct Liveness {
    /// Registers live at block entry, indexed by block id
    pub live_in: Vec<HashSet<VReg>>,
    /// Registers live at block exit, indexed by block id
    pub live_out: Vec<HashSet<VReg>>,
}

impl Liveness {
    /// Compute liveness for a function
    pub fn compute(func: &Function, cfg: &Cfg) -> Self {
        let n = func.blocks.len();
        let mut info = Liveness {
            live_in: vec![HashSet::new(); n],
            live_out: vec![HashSet::new(); n],
        };

        // Post-order converges fastest for a backward problem; blocks
        // unreachable from the entry are appended so they still get locally
        // correct sets (they contribute nothing to reachable blocks).
        let mut order: Vec<BlockId> = cfg.post_order.clone();
        let reached: HashSet<BlockId> = order.iter().copied().collect();
        for block in &func.blocks {
            if !reached.contains(&block.id) {
                order.push(block.id);
            }
        }

        let mut changed = true;
        while changed {
            changed = false;

            for &block_id in &order {
                let idx = block_id.0 as usize;

                let mut live_out: HashSet<VReg> = HashSet::new();
                for &succ in &cfg.successors[idx] {
                    live_out.extend(&info.live_in[succ.0 as usize]);
                }

                let mut live_in = live_out.clone();
                for inst in func.block(block_id).insts.iter().rev() {
                    for &def in inst.defs() {
                        live_in.remove(&def);
                    }
                    for &used in inst.uses() {
                        live_in.insert(used);
                    }
                }

                if live_in != info.live_in[idx] || live_out != info.live_out[idx] {
                    changed = true;
                    info.live_in[idx] = live_in;
                    info.live_out[idx] = live_out;
                }
            }
        }

        info
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

    #[test]
    fn test_liveness_across_branches() {
        let func = make_diamond_function();
        let cfg = Cfg::build(&func);
        let liveness = Liveness::compute(&func, &cfg);

        // v0 flows from the entry into both arms
        assert!(liveness.live_out[0].contains(&VReg(0)));
        assert!(liveness.live_in[1].contains(&VReg(0)));
        assert!(liveness.live_in[2].contains(&VReg(0)));

        // v1 flows from the arms into the join
        assert!(liveness.live_in[3].contains(&VReg(1)));
        assert!(liveness.live_out[1].contains(&VReg(1)));

        // Nothing is live into the entry or out of the exit
        assert!(liveness.live_in[0].is_empty());
        assert!(liveness.live_out[3].is_empty());
    }

    #[test]
    fn test_liveness_through_loop() {
        // bb0: v0 = op         -> bb1
        // bb1: v1 = op v0      -> bb2, bb3
        // bb2: v2 = op v1, v0  -> bb1     (v0 live around the back edge)
        // bb3: use v1
        let mut func = Function::new();
        let bb0 = func.alloc_block();
        let bb1 = func.alloc_block();
        let bb2 = func.alloc_block();
        let bb3 = func.alloc_block();
        func.entry = bb0;

        let v0 = func.alloc_vreg();
        let v1 = func.alloc_vreg();
        let v2 = func.alloc_vreg();

        func.block_mut(bb0).insts.push(Inst::op(vec![v0], vec![]));
        func.block_mut(bb0).succs = vec![bb1];
        func.block_mut(bb1).insts.push(Inst::op(vec![v1], vec![v0]));
        func.block_mut(bb1).succs = vec![bb2, bb3];
        func.block_mut(bb2)
            .insts
            .push(Inst::op(vec![v2], vec![v1, v0]));
        func.block_mut(bb2).succs = vec![bb1];
        func.block_mut(bb3).insts.push(Inst::op(vec![], vec![v1]));

        let cfg = Cfg::build(&func);
        let liveness = Liveness::compute(&func, &cfg);

        // v0 is used in the loop body, so it stays live around the back edge
        assert!(liveness.live_in[1].contains(&VReg(0)));
        assert!(liveness.live_out[2].contains(&VReg(0)));
        assert!(liveness.live_out[1].contains(&VReg(0)));
    }

    #[test]
    fn test_unreachable_block_gets_local_sets() {
        let mut func = make_diamond_function();
        let orphan = func.alloc_block();
        let v1 = VReg(1);
        func.block_mut(orphan).insts.push(Inst::op(vec![], vec![v1]));

        let cfg = Cfg::build(&func);
        let liveness = Liveness::compute(&func, &cfg);

        // The orphan computes its own live-in but feeds nothing reachable
        assert!(liveness.live_in[orphan.0 as usize].contains(&v1));
        assert!(liveness.live_out[orphan.0 as usize].is_empty());
        assert!(liveness.live_in[0].is_empty());
    }
}
