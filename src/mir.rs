//! Virtual-register intermediate code
//!
//! This is the allocator's view of a function: basic blocks of instructions
//! that expose ordered def/use lists, a move flag, and a loop-nesting depth.
//! Instruction selection produces this form with an unlimited supply of
//! virtual registers; the allocator maps them onto a small fixed set of
//! physical registers, inserting spill stores and reloads where needed.

use std::fmt;

/// Virtual register ID - unlimited, will be allocated to physical registers later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Physical register (color) identifier, in `0..k` for a target with k registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PReg(pub u16);

impl fmt::Display for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Stack slot identifier for a spilled value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpillSlot(pub u32);

impl fmt::Display for SpillSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// What an instruction does, as far as allocation is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    /// Ordinary computation; the def/use lists carry its operands
    Op,
    /// Register-to-register copy, a candidate for coalescing
    Move { dst: VReg, src: VReg },
    /// Store of a spilled value to its stack slot (inserted by the spill rewriter)
    Store { src: VReg, slot: SpillSlot },
    /// Reload of a spilled value from its stack slot (inserted by the spill rewriter)
    Reload { dst: VReg, slot: SpillSlot },
}

/// One instruction of the virtual-register code
///
/// The def and use lists are ordered as instruction selection emitted them.
/// For a `Move`, the lists mirror the dst/src pair; for `Store`/`Reload`
/// they hold exactly the single stored/reloaded register. The constructors
/// maintain this, so the lists are read through [`Inst::defs`] and
/// [`Inst::uses`] rather than exposed for mutation.
#[derive(Debug, Clone)]
pub struct Inst {
    pub kind: InstKind,
    defs: Vec<VReg>,
    uses: Vec<VReg>,
    /// Loop-nesting depth of the enclosing code, used for spill-cost weighting
    pub loop_depth: u32,
}

impl Inst {
    /// An ordinary instruction writing `defs` and reading `uses`
    pub fn op(defs: Vec<VReg>, uses: Vec<VReg>) -> Self {
        Self {
            kind: InstKind::Op,
            defs,
            uses,
            loop_depth: 0,
        }
    }

    /// A register-to-register copy `dst := src`
    pub fn copy(dst: VReg, src: VReg) -> Self {
        Self {
            kind: InstKind::Move { dst, src },
            defs: vec![dst],
            uses: vec![src],
            loop_depth: 0,
        }
    }

    /// A spill store `slot := src`
    pub(crate) fn store(src: VReg, slot: SpillSlot) -> Self {
        Self {
            kind: InstKind::Store { src, slot },
            defs: Vec::new(),
            uses: vec![src],
            loop_depth: 0,
        }
    }

    /// A spill reload `dst := slot`
    pub(crate) fn reload(dst: VReg, slot: SpillSlot) -> Self {
        Self {
            kind: InstKind::Reload { dst, slot },
            defs: vec![dst],
            uses: Vec::new(),
            loop_depth: 0,
        }
    }

    /// Set the loop-nesting depth
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.loop_depth = depth;
        self
    }

    /// Registers written by this instruction
    pub fn defs(&self) -> &[VReg] {
        &self.defs
    }

    /// Registers read by this instruction
    pub fn uses(&self) -> &[VReg] {
        &self.uses
    }

    /// Returns true for a coalescable register-to-register copy
    pub fn is_move(&self) -> bool {
        matches!(self.kind, InstKind::Move { .. })
    }

    /// The (dst, src) pair of a move instruction
    pub fn move_operands(&self) -> Option<(VReg, VReg)> {
        match self.kind {
            InstKind::Move { dst, src } => Some((dst, src)),
            _ => None,
        }
    }

    /// Substitute `to` for every read of `from`
    pub(crate) fn replace_use(&mut self, from: VReg, to: VReg) {
        for u in &mut self.uses {
            if *u == from {
                *u = to;
            }
        }
        match &mut self.kind {
            InstKind::Move { src, .. } if *src == from => *src = to,
            InstKind::Store { src, .. } if *src == from => *src = to,
            _ => {}
        }
    }

    /// Substitute `to` for every write of `from`
    pub(crate) fn replace_def(&mut self, from: VReg, to: VReg) {
        for d in &mut self.defs {
            if *d == from {
                *d = to;
            }
        }
        match &mut self.kind {
            InstKind::Move { dst, .. } if *dst == from => *dst = to,
            InstKind::Reload { dst, .. } if *dst == from => *dst = to,
            _ => {}
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(regs: &[VReg]) -> String {
            regs.iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
        match &self.kind {
            InstKind::Move { dst, src } => write!(f, "{} = {}", dst, src),
            InstKind::Store { src, slot } => write!(f, "store {} -> {}", src, slot),
            InstKind::Reload { dst, slot } => write!(f, "{} = load {}", dst, slot),
            InstKind::Op if self.defs.is_empty() => write!(f, "use {}", join(&self.uses)),
            InstKind::Op if self.uses.is_empty() => write!(f, "{} = op", join(&self.defs)),
            InstKind::Op => write!(f, "{} = op {}", join(&self.defs), join(&self.uses)),
        }
    }
}

/// A basic block: an ordered instruction sequence plus its successor edges
///
/// Successors reference blocks in the owning function's arena; predecessor
/// lists are derived by [`crate::cfg::Cfg::build`].
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub insts: Vec<Inst>,
    pub succs: Vec<BlockId>,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            insts: Vec::new(),
            succs: Vec::new(),
        }
    }
}

/// A complete function in virtual-register form
#[derive(Debug, Clone)]
pub struct Function {
    /// Function name (for logs and text dumps)
    pub name: Option<String>,
    /// Basic blocks; ids index this arena
    pub blocks: Vec<Block>,
    /// Entry block ID
    pub entry: BlockId,
    /// Number of virtual registers allocated so far
    pub vreg_count: u32,
    /// Number of spill slots allocated so far
    pub spill_slot_count: u32,
}

impl Function {
    /// Create a new empty function
    pub fn new() -> Self {
        Self {
            name: None,
            blocks: Vec::new(),
            entry: BlockId(0),
            vreg_count: 0,
            spill_slot_count: 0,
        }
    }

    /// Create a new named function
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    /// Allocate a new virtual register
    pub fn alloc_vreg(&mut self) -> VReg {
        let vreg = VReg(self.vreg_count);
        self.vreg_count += 1;
        vreg
    }

    /// Allocate a new basic block
    pub fn alloc_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        id
    }

    /// Allocate a new spill slot
    pub(crate) fn alloc_spill_slot(&mut self) -> SpillSlot {
        let slot = SpillSlot(self.spill_slot_count);
        self.spill_slot_count += 1;
        slot
    }

    /// Get a reference to a block
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Get a mutable reference to a block
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    /// Check if a block id is in range
    pub fn has_block(&self, id: BlockId) -> bool {
        (id.0 as usize) < self.blocks.len()
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            writeln!(f, "fn {}:", name)?;
        }
        for block in &self.blocks {
            let succs = block
                .succs
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            if succs.is_empty() {
                writeln!(f, "{}:", block.id)?;
            } else {
                writeln!(f, "{}: -> {}", block.id, succs)?;
            }
            for inst in &block.insts {
                writeln!(f, "    {}", inst)?;
            }
        }
        Ok(())
    }
}
