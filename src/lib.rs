//! Graph coloring register allocation
//!
//! This crate maps the unbounded virtual registers of a compiler's
//! intermediate code onto a small fixed set of physical registers,
//! inserting stack spill code where the register file is too small. The
//! input is a CFG of basic blocks whose instructions expose ordered
//! def/use lists, a move flag, and a loop-nesting depth; the output is a
//! total register assignment plus the stream rewritten in place with spill
//! stores/reloads inserted and coalesced moves deleted.
//!
//! ## Pipeline
//!
//! 1. [`cfg`] builds the CFG view and can derive loop depths
//! 2. [`liveness`] runs backward dataflow to a fixed point
//! 3. [`interference`] turns liveness into an interference graph
//! 4. The coloring engine runs simplify/coalesce/freeze/spill worklists
//!    and assigns colors off a select stack
//! 5. Registers that get no color are rewritten to memory and the cycle
//!    repeats, shrinking live ranges every round until coloring succeeds
//!
//! Allocation is per function and shares nothing, so functions can be
//! allocated from parallel workers.
//!
//! ## Example
//!
//! ```
//! use regalloc::mir::{Function, Inst};
//! use regalloc::{Target, allocate};
//!
//! let mut func = Function::new();
//! let bb0 = func.alloc_block();
//! func.entry = bb0;
//! let v0 = func.alloc_vreg();
//! let v1 = func.alloc_vreg();
//! let block = func.block_mut(bb0);
//! block.insts.push(Inst::op(vec![v0], vec![]));
//! block.insts.push(Inst::op(vec![v1], vec![v0]));
//! block.insts.push(Inst::op(vec![], vec![v1]));
//!
//! let alloc = allocate(&mut func, &Target::new(2)).unwrap();
//! assert_eq!(alloc.rounds, 1);
//! assert!(alloc.preg(v0).0 < 2);
//! ```

pub mod allocator;
pub mod cfg;
mod coloring;
pub mod interference;
pub mod liveness;
pub mod mir;
mod spill;

pub use allocator::{
    AllocConfig, AllocError, Allocation, Target, allocate, allocate_with, verify,
};
