//! The compilation context.
//!
//! All state the passes share is carried in one explicit [`Context`] value:
//! the options record, the symbol arena, and the per-file entries. Passes
//! receive the context (or one file entry) by reference; nothing is global.

use ternc_ir::Frag;
use ternc_types::ast::Module;
use ternc_types::SymbolTable;

use crate::x86_64::asm::AsmFile;

/// Code generation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetArch {
    /// x86_64 System V Linux.
    #[default]
    X86_64Linux,
}

/// Global options, set once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Selected target.
    pub arch: TargetArch,
}

/// Per-translation-unit state.
#[derive(Debug)]
pub struct FileEntry {
    /// Input file name, used in diagnostics.
    pub name: String,
    /// The typechecked AST; taken by the translator.
    pub ast: Option<Module>,
    /// IR fragments, filled by the translator and mutated in place by
    /// every later middle-end pass.
    pub frags: Vec<Frag>,
    /// Fresh-id counter shared by temps, blocks, and local labels.
    /// Id 0 is reserved for a function's entry block.
    pub next_id: usize,
    /// Set when IR validation failed for this file; later passes skip it.
    pub errored: bool,
    /// Selected and allocated assembly, filled by the back end.
    pub asm: Option<AsmFile>,
}

impl FileEntry {
    /// A fresh entry for `name` holding `ast`.
    pub fn new(name: impl Into<String>, ast: Module) -> Self {
        Self {
            name: name.into(),
            ast: Some(ast),
            frags: Vec::new(),
            next_id: 1,
            errored: false,
            asm: None,
        }
    }

    /// Draws a fresh numeric id.
    pub fn fresh(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Everything one compilation owns.
#[derive(Debug, Default)]
pub struct Context {
    /// Global options.
    pub options: Options,
    /// The symbol arena shared by all files.
    pub symbols: SymbolTable,
    /// Per-file entries, in driver order.
    pub files: Vec<FileEntry>,
}

impl Context {
    /// A context with the given options and symbols.
    pub fn new(options: Options, symbols: SymbolTable) -> Self {
        Self {
            options,
            symbols,
            files: Vec::new(),
        }
    }

    /// Registers a translation unit.
    pub fn add_file(&mut self, name: impl Into<String>, ast: Module) -> &mut FileEntry {
        self.files.push(FileEntry::new(name, ast));
        self.files.last_mut().expect("just pushed")
    }

    /// True when any file has errored.
    pub fn any_errored(&self) -> bool {
        self.files.iter().any(|f| f.errored)
    }
}
