//! Instructions and the builder shorthand.
//!
//! The free functions at the bottom are the writing vocabulary of the
//! translator and of tests; they keep IR construction close to how the IR
//! reads when printed.

use crate::op::IROperator;
use crate::operand::Operand;

/// A single IR instruction: an operator and its operands, of the
/// operator's declared arity.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// The operator.
    pub op: IROperator,
    /// Operand slots, `op.arity()` of them.
    pub args: Vec<Operand>,
}

impl Instruction {
    /// Builds an instruction, checking arity.
    pub fn new(op: IROperator, args: Vec<Operand>) -> Self {
        debug_assert_eq!(args.len(), op.arity(), "{op} arity mismatch");
        Self { op, args }
    }

    /// Replaces this instruction with a nop in place, dropping operands.
    pub fn make_nop(&mut self) {
        self.op = IROperator::Nop;
        self.args.clear();
    }

    /// The operand this instruction writes, if any.
    pub fn written(&self) -> Option<&Operand> {
        self.op.written_index().map(|idx| &self.args[idx])
    }
}

/// `Label` pseudo-instruction, emitted during trace scheduling.
pub fn label(id: usize) -> Instruction {
    Instruction::new(IROperator::Label, vec![Operand::local(id)])
}

/// No-op.
pub fn nop() -> Instruction {
    Instruction::new(IROperator::Nop, Vec::new())
}

/// Marks a temp as observable in some non-code-generating way.
pub fn volatile_use(temp: Operand) -> Instruction {
    Instruction::new(IROperator::Volatile, vec![temp])
}

/// Declares a temp live without giving it a value.
pub fn uninit(temp: Operand) -> Instruction {
    Instruction::new(IROperator::Uninit, vec![temp])
}

/// Takes the address of a stack-resident temp.
pub fn addrof(dest: Operand, src: Operand) -> Instruction {
    Instruction::new(IROperator::Addrof, vec![dest, src])
}

/// Simple move.
pub fn mov(dest: Operand, src: Operand) -> Instruction {
    Instruction::new(IROperator::Move, vec![dest, src])
}

/// Store to memory at `addr + offset`.
pub fn mem_store(addr: Operand, src: Operand, offset: Operand) -> Instruction {
    Instruction::new(IROperator::MemStore, vec![addr, src, offset])
}

/// Load from memory at `addr + offset`.
pub fn mem_load(dest: Operand, addr: Operand, offset: Operand) -> Instruction {
    Instruction::new(IROperator::MemLoad, vec![dest, addr, offset])
}

/// Store to the outgoing stack area; offset 0 is the top of stack.
pub fn stk_store(offset: Operand, src: Operand) -> Instruction {
    Instruction::new(IROperator::StkStore, vec![offset, src])
}

/// Load from the stack.
pub fn stk_load(dest: Operand, offset: Operand) -> Instruction {
    Instruction::new(IROperator::StkLoad, vec![dest, offset])
}

/// Store into part of a stack-resident temp.
pub fn offset_store(dest: Operand, src: Operand, offset: Operand) -> Instruction {
    Instruction::new(IROperator::OffsetStore, vec![dest, src, offset])
}

/// Load from part of a stack-resident temp.
pub fn offset_load(dest: Operand, src: Operand, offset: Operand) -> Instruction {
    Instruction::new(IROperator::OffsetLoad, vec![dest, src, offset])
}

/// Generic arithmetic/bitwise/comparison binop.
pub fn binop(op: IROperator, dest: Operand, lhs: Operand, rhs: Operand) -> Instruction {
    Instruction::new(op, vec![dest, lhs, rhs])
}

/// Generic arithmetic/logic/conversion unop.
pub fn unop(op: IROperator, dest: Operand, src: Operand) -> Instruction {
    Instruction::new(op, vec![dest, src])
}

/// Unconditional jump to a local label.
pub fn jump(dest: usize) -> Instruction {
    Instruction::new(IROperator::Jump, vec![Operand::local(dest)])
}

/// Jump through a table of local labels held in a rodata frag.
pub fn jumptable(scrutinee: Operand, table: usize) -> Instruction {
    Instruction::new(
        IROperator::Jumptable,
        vec![scrutinee, Operand::local(table)],
    )
}

/// Comparison conditional jump with explicit true and false targets.
pub fn cjump(
    op: IROperator,
    true_dest: usize,
    false_dest: usize,
    lhs: Operand,
    rhs: Operand,
) -> Instruction {
    Instruction::new(
        op,
        vec![
            Operand::local(true_dest),
            Operand::local(false_dest),
            lhs,
            rhs,
        ],
    )
}

/// Against-zero conditional jump with explicit true and false targets.
pub fn bjump(op: IROperator, true_dest: usize, false_dest: usize, scrutinee: Operand) -> Instruction {
    Instruction::new(
        op,
        vec![
            Operand::local(true_dest),
            Operand::local(false_dest),
            scrutinee,
        ],
    )
}

/// Call a function by label, temp, or register.
pub fn call(target: Operand) -> Instruction {
    Instruction::new(IROperator::Call, vec![target])
}

/// Return from the function.
pub fn ret() -> Instruction {
    Instruction::new(IROperator::Return, Vec::new())
}
