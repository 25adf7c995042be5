//! x86_64 System V Linux back end: ABI decisions, abstract assembly,
//! instruction selection, arity reduction, register allocation, and
//! emission.

pub mod abi;
pub mod asm;
pub mod emit;
pub mod reduce;
pub mod regalloc;
pub mod select;
pub mod validate;
