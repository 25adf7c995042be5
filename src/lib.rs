//! Middle and back end of the Tern language compiler.
//!
//! The pipeline consumes typechecked ASTs ([`ternc_types::ast`]) and
//! produces NASM-syntax assembly, one file per translation unit:
//! translation to blocked IR, blocked optimization, trace scheduling,
//! linear optimization, instruction selection, arity reduction, register
//! allocation, and emission. See [`pipeline::compile`].

pub mod consts;
pub mod context;
pub mod error;
pub mod optimize;
pub mod pipeline;
pub mod schedule;
pub mod translate;
pub mod x86_64;

pub mod prelude {
    //! Re-exports of the types most callers need.

    pub use crate::context::{Context, FileEntry, Options, TargetArch};
    pub use crate::error::BackendError;
    pub use crate::pipeline::compile;
    pub use ternc_ir::{Block, Datum, Frag, IROperator, Instruction, LabelRef, Operand};
    pub use ternc_types::{
        AllocHint, Qualifiers, SymbolId, SymbolKind, SymbolTable, SymbolTableEntry, Type,
        TypeKeyword,
    };
}
