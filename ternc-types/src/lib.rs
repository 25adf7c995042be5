//! Type model, symbol tables, and typechecked AST of the Tern language
//! compiler.
//!
//! Everything downstream of the typechecker consumes the data in this crate:
//! the translator walks [`ast`] trees, and every later pass sizes and
//! classifies values through [`ty`].

#![warn(missing_docs)]

pub mod ast;
pub mod symbol;
pub mod ty;

pub use symbol::{SymbolId, SymbolKind, SymbolTable, SymbolTableEntry};
pub use ty::{AllocHint, Qualifiers, Type, TypeKeyword, POINTER_WIDTH};
