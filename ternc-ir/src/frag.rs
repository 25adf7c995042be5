//! Fragments and blocks.

use crate::instruction::Instruction;
use crate::operand::{Datum, LabelRef};

/// A basic block: a numeric label and its instructions. In blocked form
/// the last instruction is a terminator and nothing before it is; after
/// trace scheduling a text frag holds a single block carrying the whole
/// linearized stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Block label, unique within its text frag.
    pub label: usize,
    /// The instructions.
    pub instructions: Vec<Instruction>,
}

impl Block {
    /// An empty block with the given label.
    pub fn new(label: usize) -> Self {
        Self {
            label,
            instructions: Vec::new(),
        }
    }

    /// Appends an instruction.
    pub fn push(&mut self, i: Instruction) {
        self.instructions.push(i);
    }

    /// The terminator, i.e. the last instruction.
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}

/// A top-level emit unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Frag {
    /// Zero-initialized writable storage.
    Bss {
        /// Fragment name.
        name: LabelRef,
        /// Alignment in bytes.
        align: u64,
        /// Only `Padding` datums.
        data: Vec<Datum>,
    },
    /// Read-only initialized storage.
    RoData {
        /// Fragment name.
        name: LabelRef,
        /// Alignment in bytes.
        align: u64,
        /// The initializer datums.
        data: Vec<Datum>,
    },
    /// Writable initialized storage.
    Data {
        /// Fragment name.
        name: LabelRef,
        /// Alignment in bytes.
        align: u64,
        /// The initializer datums.
        data: Vec<Datum>,
    },
    /// A function body.
    Text {
        /// Fragment name (always global: functions are mangled symbols).
        name: LabelRef,
        /// The blocks, entry first.
        blocks: Vec<Block>,
    },
}

impl Frag {
    /// The fragment's name.
    pub fn name(&self) -> &LabelRef {
        match self {
            Frag::Bss { name, .. }
            | Frag::RoData { name, .. }
            | Frag::Data { name, .. }
            | Frag::Text { name, .. } => name,
        }
    }

    /// Is this a function body?
    pub fn is_text(&self) -> bool {
        matches!(self, Frag::Text { .. })
    }
}
