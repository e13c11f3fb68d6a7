//! Round driver and public allocation API
//!
//! Drives the analyses to a complete assignment:
//! liveness -> interference graph -> coloring round -> either done, or
//! rewrite the spilled registers and go again. Every round rebuilds the
//! graph from scratch; spilling strictly shrinks the rewritten live ranges,
//! so for well-formed input the loop converges in at most one round per
//! virtual register. A configured round cap turns a violated invariant
//! into an error instead of an endless loop.
//!
//! Allocation borrows one function exclusively and shares nothing, so
//! callers are free to allocate many functions from parallel workers.

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::cfg::Cfg;
use crate::coloring::{ColoringEngine, RoundOutcome, spill_costs};
use crate::interference::InterferenceGraph;
use crate::liveness::Liveness;
use crate::mir::{Function, PReg, VReg};
use crate::spill::rewrite_spills;

/// Errors surfaced by [`allocate`]
#[derive(Debug, Error)]
pub enum AllocError {
    /// No assignment can exist for this target, reported before any analysis
    #[error("unrepresentable target: {0}")]
    Unrepresentable(String),

    /// The input references registers outside its declared set
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The spill-retry loop passed its bound; an internal invariant was
    /// violated, not a property of the input program
    #[error("allocation did not converge after {0} rounds")]
    IterationLimitExceeded(usize),
}

/// The physical register file the allocator maps onto
#[derive(Debug, Clone, Default)]
pub struct Target {
    /// Number of available physical registers (k); colors are `0..k`
    pub num_regs: usize,
    /// Registers with calling-convention-fixed colors; never spilled
    pub precolored: Vec<(VReg, PReg)>,
}

impl Target {
    /// A target with k registers and nothing precolored
    pub fn new(num_regs: usize) -> Self {
        Self {
            num_regs,
            precolored: Vec::new(),
        }
    }
}

/// Allocation limits
#[derive(Debug, Clone, Default)]
pub struct AllocConfig {
    /// Maximum spill-retry rounds; defaults to well above the theoretical
    /// bound of one round per virtual register
    pub max_rounds: Option<usize>,
}

/// A complete register assignment
#[derive(Debug)]
pub struct Allocation {
    colors: Vec<PReg>,
    /// Number of rounds the allocation took
    pub rounds: usize,
    /// Coalesced move instructions deleted from the stream
    pub removed_moves: usize,
    /// Stack slots consumed by spilled registers
    pub spill_slots: u32,
}

impl Allocation {
    /// The physical register assigned to a virtual register
    pub fn preg(&self, vreg: VReg) -> PReg {
        self.colors[vreg.0 as usize]
    }

    /// The full assignment, indexed by vreg
    pub fn colors(&self) -> &[PReg] {
        &self.colors
    }
}

/// Allocate with default limits
pub fn allocate(func: &mut Function, target: &Target) -> Result<Allocation, AllocError> {
    allocate_with(func, target, &AllocConfig::default())
}

/// Map every virtual register of `func` onto a physical register
///
/// On success the function has been rewritten in place: spill stores and
/// reloads are inserted and coalesced moves are gone. Code emission maps
/// each operand through [`Allocation::preg`].
pub fn allocate_with(
    func: &mut Function,
    target: &Target,
    config: &AllocConfig,
) -> Result<Allocation, AllocError> {
    validate_target(target)?;
    validate_function(func, target)?;

    let initial_vregs = func.vreg_count as usize;
    let max_rounds = config.max_rounds.unwrap_or(2 * initial_vregs + 8);

    let mut rounds = 0;
    loop {
        rounds += 1;
        if rounds > max_rounds {
            return Err(AllocError::IterationLimitExceeded(max_rounds));
        }

        let cfg = Cfg::build(func);
        let liveness = Liveness::compute(func, &cfg);
        let precolored = dense_precolored(func, target);
        let graph = InterferenceGraph::build(func, &liveness, &precolored);
        check_precolored_conflicts(target, &graph)?;

        debug!(
            "round {}: coloring {} registers with k={}",
            rounds, func.vreg_count, target.num_regs
        );
        let dot = log::log_enabled!(log::Level::Debug).then(|| graph.to_dot());

        let engine = ColoringEngine::new(target.num_regs, graph, spill_costs(func));
        match engine.run() {
            RoundOutcome::Colored(colors) => {
                let removed_moves = remove_coalesced_moves(func, &colors);
                debug!(
                    "allocation complete in {} rounds, {} moves removed, {} spill slots",
                    rounds, removed_moves, func.spill_slot_count
                );
                return Ok(Allocation {
                    colors,
                    rounds,
                    removed_moves,
                    spill_slots: func.spill_slot_count,
                });
            }
            RoundOutcome::Spilled(spilled) => {
                debug!("round {}: {} actual spills", rounds, spilled.len());
                if let Some(dot) = dot {
                    debug!("round {} interference graph:\n{}", rounds, dot);
                }
                rewrite_spills(func, &spilled);
            }
        }
    }
}

/// Target problems detectable before looking at any instruction
fn validate_target(target: &Target) -> Result<(), AllocError> {
    if target.num_regs == 0 {
        return Err(AllocError::Unrepresentable(
            "no physical registers available".into(),
        ));
    }
    if target.num_regs > u16::MAX as usize + 1 {
        return Err(AllocError::Unrepresentable(format!(
            "{} physical registers exceed the supported register file",
            target.num_regs
        )));
    }
    if target.precolored.len() > target.num_regs {
        return Err(AllocError::Unrepresentable(format!(
            "{} precolored registers but only {} colors",
            target.precolored.len(),
            target.num_regs
        )));
    }
    for &(vreg, preg) in &target.precolored {
        if preg.0 as usize >= target.num_regs {
            return Err(AllocError::Unrepresentable(format!(
                "{} is precolored with {} but colors end at r{}",
                vreg,
                preg,
                target.num_regs - 1
            )));
        }
    }
    Ok(())
}

/// Reject references to registers outside the declared set
fn validate_function(func: &Function, target: &Target) -> Result<(), AllocError> {
    for block in &func.blocks {
        for inst in &block.insts {
            for &reg in inst.defs().iter().chain(inst.uses()) {
                if reg.0 >= func.vreg_count {
                    return Err(AllocError::MalformedInput(format!(
                        "{} references {} outside the declared set of {} registers",
                        block.id, reg, func.vreg_count
                    )));
                }
            }
        }
    }

    let mut seen: HashMap<VReg, PReg> = HashMap::new();
    for &(vreg, preg) in &target.precolored {
        if vreg.0 >= func.vreg_count {
            return Err(AllocError::MalformedInput(format!(
                "precolored {} is outside the declared set of {} registers",
                vreg, func.vreg_count
            )));
        }
        if let Some(&prev) = seen.get(&vreg)
            && prev != preg
        {
            return Err(AllocError::MalformedInput(format!(
                "{} is precolored as both {} and {}",
                vreg, prev, preg
            )));
        }
        seen.insert(vreg, preg);
    }
    Ok(())
}

/// Two precolored registers pinned to one color must never interfere;
/// neither can move, so no amount of spilling would fix it
fn check_precolored_conflicts(
    target: &Target,
    graph: &InterferenceGraph,
) -> Result<(), AllocError> {
    for (i, &(a, ca)) in target.precolored.iter().enumerate() {
        for &(b, cb) in &target.precolored[i + 1..] {
            if ca == cb && a != b && graph.interferes(a, b) {
                return Err(AllocError::Unrepresentable(format!(
                    "precolored registers {} and {} share {} but interfere",
                    a, b, ca
                )));
            }
        }
    }
    Ok(())
}

fn dense_precolored(func: &Function, target: &Target) -> Vec<Option<PReg>> {
    let mut pre = vec![None; func.vreg_count as usize];
    for &(vreg, preg) in &target.precolored {
        pre[vreg.0 as usize] = Some(preg);
    }
    pre
}

/// Delete every move whose endpoints ended up in the same register
fn remove_coalesced_moves(func: &mut Function, colors: &[PReg]) -> usize {
    let mut removed = 0;
    for block in &mut func.blocks {
        let before = block.insts.len();
        block.insts.retain(|inst| match inst.move_operands() {
            Some((dst, src)) => colors[dst.0 as usize] != colors[src.0 as usize],
            None => true,
        });
        removed += before - block.insts.len();
    }
    removed
}

/// Check an allocation against the function it was produced for
///
/// Recomputes liveness on the rewritten stream and confirms that the
/// assignment is total, stays inside the register file, honors every
/// precolored register, and never lets two simultaneously live registers
/// share a color.
pub fn verify(func: &Function, target: &Target, alloc: &Allocation) -> Result<(), String> {
    for block in &func.blocks {
        for inst in &block.insts {
            for &reg in inst.defs().iter().chain(inst.uses()) {
                if reg.0 as usize >= alloc.colors().len() {
                    return Err(format!("{} has no assigned register", reg));
                }
                if alloc.preg(reg).0 as usize >= target.num_regs {
                    return Err(format!(
                        "{} was assigned {} outside the register file",
                        reg,
                        alloc.preg(reg)
                    ));
                }
            }
        }
    }

    for &(vreg, preg) in &target.precolored {
        if alloc.preg(vreg) != preg {
            return Err(format!(
                "precolored {} ended up in {} instead of {}",
                vreg,
                alloc.preg(vreg),
                preg
            ));
        }
    }

    let cfg = Cfg::build(func);
    let liveness = Liveness::compute(func, &cfg);
    let precolored = dense_precolored(func, target);
    let graph = InterferenceGraph::build(func, &liveness, &precolored);
    for (a, b) in graph.edges() {
        if alloc.preg(a) == alloc.preg(b) {
            return Err(format!(
                "{} and {} are simultaneously live but share {}",
                a,
                b,
                alloc.preg(a)
            ));
        }
    }

    Ok(())
}
