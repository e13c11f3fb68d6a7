//! Spill code insertion
//!
//! When a round fails to color some registers, their values move to stack
//! slots and the instruction stream is rewritten: every def gets a store
//! right after it, every use a reload right before it, each through a fresh
//! virtual register that lives only from the adjacent store/reload to the
//! one instruction it serves. The rewritten ranges are strictly smaller
//! than the original, which is what bounds the retry loop: a register
//! introduced here can never again span more than its two instructions.

use std::collections::HashMap;

use log::debug;

use crate::mir::{Function, Inst, SpillSlot, VReg};

/// Rewrite the function so every register in `spilled` lives in memory
///
/// Returns the number of store/reload sites inserted.
pub(crate) fn rewrite_spills(func: &mut Function, spilled: &[VReg]) -> usize {
    let slots: HashMap<VReg, SpillSlot> = spilled
        .iter()
        .map(|&v| (v, func.alloc_spill_slot()))
        .collect();
    for (&vreg, &slot) in &slots {
        debug!("spilling {} to {}", vreg, slot);
    }

    let mut inserted = 0;

    for idx in 0..func.blocks.len() {
        let insts = std::mem::take(&mut func.blocks[idx].insts);
        let mut rewritten = Vec::with_capacity(insts.len());

        for mut inst in insts {
            // Reload each spilled use into its own fresh register
            let spilled_uses: Vec<VReg> = {
                let mut seen = Vec::new();
                for &u in inst.uses() {
                    if slots.contains_key(&u) && !seen.contains(&u) {
                        seen.push(u);
                    }
                }
                seen
            };
            for vreg in spilled_uses {
                let fresh = func.alloc_vreg();
                rewritten.push(Inst::reload(fresh, slots[&vreg]).with_depth(inst.loop_depth));
                inst.replace_use(vreg, fresh);
                inserted += 1;
            }

            // Store each spilled def from its own fresh register
            let spilled_defs: Vec<VReg> = {
                let mut seen = Vec::new();
                for &d in inst.defs() {
                    if slots.contains_key(&d) && !seen.contains(&d) {
                        seen.push(d);
                    }
                }
                seen
            };
            let mut stores = Vec::new();
            for vreg in spilled_defs {
                let fresh = func.alloc_vreg();
                inst.replace_def(vreg, fresh);
                stores.push(Inst::store(fresh, slots[&vreg]).with_depth(inst.loop_depth));
                inserted += 1;
            }

            rewritten.push(inst);
            rewritten.extend(stores);
        }

        func.blocks[idx].insts = rewritten;
    }

    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::InstKind;

    #[test]
    fn test_def_and_use_sites_rewritten() {
        // v0 = op
        // v1 = op v0
        // use v1
        let mut func = Function::new();
        let bb0 = func.alloc_block();
        func.entry = bb0;

        let v0 = func.alloc_vreg();
        let v1 = func.alloc_vreg();

        let block = func.block_mut(bb0);
        block.insts.push(Inst::op(vec![v0], vec![]));
        block.insts.push(Inst::op(vec![v1], vec![v0]).with_depth(1));
        block.insts.push(Inst::op(vec![], vec![v1]));

        let inserted = rewrite_spills(&mut func, &[v0]);
        assert_eq!(inserted, 2);
        assert_eq!(func.spill_slot_count, 1);

        let insts = &func.block(bb0).insts;
        assert_eq!(insts.len(), 5);

        // def site: the def now writes a fresh register, stored right after
        let fresh_def = insts[0].defs()[0];
        assert_ne!(fresh_def, v0);
        assert_eq!(
            insts[1].kind,
            InstKind::Store {
                src: fresh_def,
                slot: SpillSlot(0)
            }
        );

        // use site: a reload right before, into a different fresh register
        let InstKind::Reload { dst: fresh_use, .. } = insts[2].kind else {
            panic!("expected a reload before the use");
        };
        assert_ne!(fresh_use, fresh_def);
        assert_eq!(insts[3].uses(), &[fresh_use]);

        // inserted code inherits the loop depth of the instruction it serves
        assert_eq!(insts[2].loop_depth, 1);

        // the spilled register no longer appears anywhere
        for inst in insts {
            assert!(!inst.defs().contains(&v0));
            assert!(!inst.uses().contains(&v0));
        }
    }

    #[test]
    fn test_same_register_used_and_redefined() {
        // v0 = op v0 (in-place update): the use reloads, the def stores,
        // through two distinct fresh registers
        let mut func = Function::new();
        let bb0 = func.alloc_block();
        func.entry = bb0;

        let v0 = func.alloc_vreg();
        func.block_mut(bb0).insts.push(Inst::op(vec![v0], vec![v0]));

        let inserted = rewrite_spills(&mut func, &[v0]);
        assert_eq!(inserted, 2);

        let insts = &func.block(bb0).insts;
        assert_eq!(insts.len(), 3);
        let InstKind::Reload { dst: reloaded, .. } = insts[0].kind else {
            panic!("expected a reload first");
        };
        let InstKind::Store { src: stored, .. } = insts[2].kind else {
            panic!("expected a store last");
        };
        assert_ne!(reloaded, stored);
        assert_eq!(insts[1].uses(), &[reloaded]);
        assert_eq!(insts[1].defs(), &[stored]);
    }

    #[test]
    fn test_repeated_use_reloaded_once() {
        // use v0, v0: one reload feeds both operand slots
        let mut func = Function::new();
        let bb0 = func.alloc_block();
        func.entry = bb0;

        let v0 = func.alloc_vreg();
        func.block_mut(bb0)
            .insts
            .push(Inst::op(vec![], vec![v0, v0]));

        let inserted = rewrite_spills(&mut func, &[v0]);
        assert_eq!(inserted, 1);

        let insts = &func.block(bb0).insts;
        assert_eq!(insts.len(), 2);
        let InstKind::Reload { dst, .. } = insts[0].kind else {
            panic!("expected a reload");
        };
        assert_eq!(insts[1].uses(), &[dst, dst]);
    }

    #[test]
    fn test_untouched_registers_left_alone() {
        let mut func = Function::new();
        let bb0 = func.alloc_block();
        func.entry = bb0;

        let v0 = func.alloc_vreg();
        let v1 = func.alloc_vreg();
        func.block_mut(bb0).insts.push(Inst::op(vec![v1], vec![v0]));

        let before = func.block(bb0).insts.len();
        let inserted = rewrite_spills(&mut func, &[]);
        assert_eq!(inserted, 0);
        assert_eq!(func.block(bb0).insts.len(), before);
        assert_eq!(func.spill_slot_count, 0);
    }
}
