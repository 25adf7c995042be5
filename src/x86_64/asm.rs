//! Abstract assembly representation.
//!
//! Between instruction selection and emission, code is a list of
//! [`AsmInstruction`]s: a NASM skeleton string with `%d`/`%u` placeholders,
//! the printable operand list the placeholders resolve against, and the
//! define/use/other operand sets the register allocator feeds on.

use std::collections::HashSet;
use strum::EnumIter;

use ternc_types::AllocHint;

/// A physical x86_64 register. Discriminants match the register numbers
/// used in IR `Reg` operands.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
#[repr(usize)]
pub enum Register {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rsi = 4,
    Rdi = 5,
    Rsp = 6,
    Rbp = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Xmm0 = 16,
    Xmm1 = 17,
    Xmm2 = 18,
    Xmm3 = 19,
    Xmm4 = 20,
    Xmm5 = 21,
    Xmm6 = 22,
    Xmm7 = 23,
    Xmm8 = 24,
    Xmm9 = 25,
    Xmm10 = 26,
    Xmm11 = 27,
    Xmm12 = 28,
    Xmm13 = 29,
    Xmm14 = 30,
    Xmm15 = 31,
}

impl Register {
    /// The register for an IR `Reg` operand id.
    pub fn from_index(index: usize) -> Self {
        use Register::*;
        const ALL: [Register; 32] = [
            Rax, Rbx, Rcx, Rdx, Rsi, Rdi, Rsp, Rbp, R8, R9, R10, R11, R12, R13, R14, R15,
            Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7, Xmm8, Xmm9, Xmm10, Xmm11, Xmm12,
            Xmm13, Xmm14, Xmm15,
        ];
        ALL[index]
    }

    /// The IR `Reg` operand id for this register.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Is this an SSE register?
    pub fn is_sse(self) -> bool {
        self.index() >= Register::Xmm0.index()
    }

    /// Must a callee preserve this register?
    pub fn is_callee_save(self) -> bool {
        use Register::*;
        matches!(self, Rbx | Rbp | R12 | R13 | R14 | R15)
    }

    /// NASM name at the given operand size.
    pub fn name(self, size: u64) -> &'static str {
        use Register::*;
        if self.is_sse() {
            const SSE: [&str; 16] = [
                "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8",
                "xmm9", "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
            ];
            return SSE[self.index() - Xmm0.index()];
        }
        const NAMES: [[&str; 4]; 16] = [
            ["rax", "eax", "ax", "al"],
            ["rbx", "ebx", "bx", "bl"],
            ["rcx", "ecx", "cx", "cl"],
            ["rdx", "edx", "dx", "dl"],
            ["rsi", "esi", "si", "sil"],
            ["rdi", "edi", "di", "dil"],
            ["rsp", "esp", "sp", "spl"],
            ["rbp", "ebp", "bp", "bpl"],
            ["r8", "r8d", "r8w", "r8b"],
            ["r9", "r9d", "r9w", "r9b"],
            ["r10", "r10d", "r10w", "r10b"],
            ["r11", "r11d", "r11w", "r11b"],
            ["r12", "r12d", "r12w", "r12b"],
            ["r13", "r13d", "r13w", "r13b"],
            ["r14", "r14d", "r14w", "r14b"],
            ["r15", "r15d", "r15w", "r15b"],
        ];
        let column = match size {
            8 => 0,
            4 => 1,
            2 => 2,
            1 => 3,
            _ => unreachable!("invalid register size {size}"),
        };
        NAMES[self.index()][column]
    }
}

/// An abstract assembly operand.
#[derive(Debug, Clone, PartialEq)]
pub enum AsmOperand {
    /// A physical register at an operating size.
    Reg {
        /// The register.
        reg: Register,
        /// Operand size in bytes.
        size: u64,
    },
    /// A virtual register not yet assigned by the allocator.
    Temp {
        /// Temp id.
        id: usize,
        /// Alignment in bytes.
        align: u64,
        /// Size in bytes.
        size: u64,
        /// Register class.
        hint: AllocHint,
    },
    /// An immediate.
    Imm {
        /// Value bits.
        value: u64,
        /// Size in bytes.
        size: u64,
    },
    /// A local label used as a value (32-bit constant).
    LocalLabel(usize),
    /// A global label used as a value (32-bit constant).
    GlobalLabel(String),
    /// A memory reference `size [base + index*scale + disp]`.
    Memory {
        /// Base: a register, a stack-resident temp, or a label.
        base: Box<AsmOperand>,
        /// Optional index register/temp with scale.
        index: Option<(Box<AsmOperand>, u8)>,
        /// Constant displacement.
        disp: i64,
        /// Access size in bytes.
        size: u64,
    },
}

impl AsmOperand {
    /// A register operand.
    pub fn reg(reg: Register, size: u64) -> Self {
        AsmOperand::Reg { reg, size }
    }

    /// A plain `[base + disp]` memory operand.
    pub fn mem(base: AsmOperand, disp: i64, size: u64) -> Self {
        AsmOperand::Memory {
            base: Box::new(base),
            index: None,
            disp,
            size,
        }
    }

    /// The temp id if this is (or wraps) nothing but a temp.
    pub fn temp_id(&self) -> Option<usize> {
        match self {
            AsmOperand::Temp { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Collects every temp id mentioned, including inside memory operands.
    pub fn collect_temps(&self, out: &mut HashSet<usize>) {
        match self {
            AsmOperand::Temp { id, .. } => {
                out.insert(*id);
            }
            AsmOperand::Memory { base, index, .. } => {
                base.collect_temps(out);
                if let Some((index, _)) = index {
                    index.collect_temps(out);
                }
            }
            _ => {}
        }
    }

    /// Is this an SSE-class operand (an SSE register or FP temp)?
    pub fn is_sse_class(&self) -> bool {
        match self {
            AsmOperand::Reg { reg, .. } => reg.is_sse(),
            AsmOperand::Temp { hint, .. } => *hint == AllocHint::Fp,
            _ => false,
        }
    }
}

/// Control-flow classification of an abstract instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum AsmInstrKind {
    /// Falls through to the next instruction.
    Regular,
    /// A move; elidable when both sides land in the same register.
    Move,
    /// Unconditional jump to a local label.
    Jump {
        /// Target label id.
        target: usize,
    },
    /// Conditional jump: the target or fallthrough.
    CJump {
        /// Target label id.
        target: usize,
    },
    /// Indexed jump: any of the listed labels.
    JumpTable {
        /// All possible target label ids.
        targets: Vec<usize>,
    },
    /// Leaves the function; the epilogue materializes here.
    Leave,
    /// A local label definition.
    Label {
        /// Label id.
        id: usize,
    },
}

/// Which arity-reduction rule applies to an instruction still carrying a
/// three-operand shape out of selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceRule {
    /// `d = a op b` with commutable operands.
    Commutative,
    /// `d = a op b`, order fixed.
    NonCommutative,
    /// `d = op a`.
    Unary,
}

/// One abstract assembly instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct AsmInstruction {
    /// Control-flow classification.
    pub kind: AsmInstrKind,
    /// NASM template; `%d` and `%u` placeholders consume the printable
    /// operands left to right.
    pub skeleton: String,
    /// Printable operands, in placeholder order.
    pub operands: Vec<AsmOperand>,
    /// Operands written by the instruction (registers and temps).
    pub defines: Vec<AsmOperand>,
    /// Operands read by the instruction.
    pub uses: Vec<AsmOperand>,
    /// Implicit participants that are neither read nor written directly.
    pub other: Vec<AsmOperand>,
    /// Pending arity reduction, if any.
    pub reduce: Option<ReduceRule>,
}

impl AsmInstruction {
    /// A regular instruction.
    pub fn regular(skeleton: impl Into<String>) -> Self {
        Self {
            kind: AsmInstrKind::Regular,
            skeleton: skeleton.into(),
            operands: Vec::new(),
            defines: Vec::new(),
            uses: Vec::new(),
            other: Vec::new(),
            reduce: None,
        }
    }

    /// Builder: sets the kind.
    pub fn kind(mut self, kind: AsmInstrKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builder: appends a printable operand.
    pub fn operand(mut self, operand: AsmOperand) -> Self {
        self.operands.push(operand);
        self
    }

    /// Builder: appends a defined operand.
    pub fn def(mut self, operand: AsmOperand) -> Self {
        self.defines.push(operand);
        self
    }

    /// Builder: appends a used operand.
    pub fn use_(mut self, operand: AsmOperand) -> Self {
        self.uses.push(operand);
        self
    }

    /// Builder: appends an implicit operand.
    pub fn implicit(mut self, operand: AsmOperand) -> Self {
        self.other.push(operand);
        self
    }

    /// Builder: marks for arity reduction.
    pub fn reducible(mut self, rule: ReduceRule) -> Self {
        self.reduce = Some(rule);
        self
    }
}

/// A selected fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum AsmFrag {
    /// A fully rendered data fragment.
    Data(String),
    /// A function body awaiting allocation and emission.
    Text {
        /// Section/global/name header text.
        header: String,
        /// Size-directive footer text.
        footer: String,
        /// The instructions.
        instructions: Vec<AsmInstruction>,
        /// Bytes of outgoing stack-argument area the body needs.
        outgoing_area: u64,
    },
}

/// All selected fragments of one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsmFile {
    /// Fragments, in IR order.
    pub frags: Vec<AsmFrag>,
    /// Ids of local data frags, used to render `.LC%zu` vs `L%zu`.
    pub local_data_ids: HashSet<usize>,
}
