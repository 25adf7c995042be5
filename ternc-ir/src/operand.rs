//! Operands and data elements.

use ternc_types::AllocHint;

/// A label, either file-local (numeric, rendered `L%zu` for blocks and
/// `.LC%zu` for local data frags) or global (mangled name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LabelRef {
    /// A numeric local label drawn from the per-file counter.
    Local(usize),
    /// A global symbol name.
    Global(String),
}

impl LabelRef {
    /// The local id, if this is a local label.
    pub fn local(&self) -> Option<usize> {
        match self {
            LabelRef::Local(id) => Some(*id),
            LabelRef::Global(_) => None,
        }
    }
}

/// A data element; the payload of constants and of data fragments.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// One byte.
    Byte(u8),
    /// Two bytes.
    Short(u16),
    /// Four bytes.
    Int(u32),
    /// Eight bytes.
    Long(u64),
    /// `n` zero bytes.
    Padding(u64),
    /// A nul-terminated byte string (terminator implicit).
    String(Vec<u8>),
    /// A nul-terminated wide string (terminator implicit).
    WString(Vec<u32>),
    /// The address of a local label (block or local data frag).
    Local(usize),
    /// The address of a global symbol.
    Global(String),
}

impl Datum {
    /// Size of the datum in bytes, including string terminators.
    pub fn size(&self) -> u64 {
        match self {
            Datum::Byte(_) => 1,
            Datum::Short(_) => 2,
            Datum::Int(_) => 4,
            Datum::Long(_) | Datum::Local(_) | Datum::Global(_) => 8,
            Datum::Padding(n) => *n,
            Datum::String(s) => s.len() as u64 + 1,
            Datum::WString(s) => (s.len() as u64 + 1) * 4,
        }
    }
}

/// An operand of an IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A virtual register. `Mem`-hinted temps are address-taken and live on
    /// the stack.
    Temp {
        /// Id, drawn from the per-file counter.
        id: usize,
        /// Alignment in bytes.
        align: u64,
        /// Size in bytes.
        size: u64,
        /// Register class.
        hint: AllocHint,
    },
    /// A physical register placeholder; the selector inserts these for ABI
    /// traffic. Ids are target-specific.
    Reg {
        /// Target register number.
        id: usize,
        /// Operating size in bytes.
        size: u64,
    },
    /// An immediate pool of one or more datums.
    Constant {
        /// Alignment in bytes.
        align: u64,
        /// The pooled datums.
        data: Vec<Datum>,
    },
    /// A label.
    Label(LabelRef),
    /// An integer offset, distinguished from a constant for clarity at
    /// call sites.
    Offset(i64),
}

impl Operand {
    /// A temp operand.
    pub fn temp(id: usize, align: u64, size: u64, hint: AllocHint) -> Self {
        Operand::Temp {
            id,
            align,
            size,
            hint,
        }
    }

    /// A register operand.
    pub fn reg(id: usize, size: u64) -> Self {
        Operand::Reg { id, size }
    }

    /// A single-datum constant.
    pub fn constant(align: u64, datum: Datum) -> Self {
        Operand::Constant {
            align,
            data: vec![datum],
        }
    }

    /// A local label operand.
    pub fn local(id: usize) -> Self {
        Operand::Label(LabelRef::Local(id))
    }

    /// A global label operand.
    pub fn global(name: impl Into<String>) -> Self {
        Operand::Label(LabelRef::Global(name.into()))
    }

    /// An offset operand.
    pub fn offset(value: i64) -> Self {
        Operand::Offset(value)
    }

    /// The temp id, if this is a temp.
    pub fn temp_id(&self) -> Option<usize> {
        match self {
            Operand::Temp { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// The local label id, if this is a local label.
    pub fn local_label(&self) -> Option<usize> {
        match self {
            Operand::Label(l) => l.local(),
            _ => None,
        }
    }

    /// Size in bytes of the value this operand holds, where meaningful.
    pub fn value_size(&self) -> Option<u64> {
        match self {
            Operand::Temp { size, .. } | Operand::Reg { size, .. } => Some(*size),
            Operand::Constant { data, .. } => Some(data.iter().map(Datum::size).sum()),
            Operand::Label(_) => Some(8),
            Operand::Offset(_) => Some(8),
        }
    }
}
