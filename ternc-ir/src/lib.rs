//! Typed, block-structured three-address IR of the Tern language compiler.
//!
//! The translator lowers typechecked ASTs into [`Frag`]s; the optimizer,
//! trace scheduler, and back end all transform the same representation in
//! place. [`validate`] holds the architecture-neutral well-formedness
//! checks run between passes.

#![warn(missing_docs)]

pub mod frag;
pub mod instruction;
pub mod op;
pub mod operand;
pub mod validate;

pub use frag::{Block, Frag};
pub use instruction::Instruction;
pub use op::IROperator;
pub use operand::{Datum, LabelRef, Operand};
pub use ternc_types::AllocHint;
pub use validate::{validate, IrForm, ValidationError};
