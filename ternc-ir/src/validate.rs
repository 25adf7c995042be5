//! Architecture-neutral IR well-formedness checks.
//!
//! Run between passes; a failure is a compiler bug surfaced early, not a
//! user error, so diagnostics use the internal-compiler-error shape and the
//! caller aborts the pipeline for the offending file.

use std::collections::HashSet;

use thiserror::Error;
use tracing::error;

use crate::frag::Frag;
use crate::op::admit;
use crate::operand::{Datum, LabelRef, Operand};

/// Which shape the IR is expected to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrForm {
    /// Blocked: many blocks per text frag, two-arg conditional jumps,
    /// terminators only in the last slot.
    Blocked,
    /// Linear: one block per text frag, label pseudo-instructions and
    /// one-arg conditional jumps inline.
    Linear,
}

/// Validation failure for one file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{file}: internal compiler error: architecture-neutral IR validation after {phase} failed - {reason}")]
pub struct ValidationError {
    /// Input file the bad IR belongs to.
    pub file: String,
    /// Pipeline phase that just ran.
    pub phase: String,
    /// First problem found.
    pub reason: String,
}

struct Validator<'a> {
    file: &'a str,
    phase: &'a str,
    first: Option<String>,
}

impl<'a> Validator<'a> {
    fn report(&mut self, reason: String) {
        error!(
            "{}: internal compiler error: architecture-neutral IR validation after {} failed - {}",
            self.file, self.phase, reason
        );
        if self.first.is_none() {
            self.first = Some(reason);
        }
    }
}

fn operand_mask(operand: &Operand) -> u8 {
    match operand {
        Operand::Temp { .. } => admit::TEMP,
        Operand::Reg { .. } => admit::REG,
        Operand::Constant { .. } => admit::CONST,
        Operand::Label(LabelRef::Local(_)) => admit::LOCAL,
        Operand::Label(LabelRef::Global(_)) => admit::GLOBAL,
        Operand::Offset(_) => admit::OFFSET,
    }
}

/// Validates a file's fragments without mutating them. Returns the first
/// problem as an error; every problem is also logged.
pub fn validate(
    file: &str,
    phase: &str,
    frags: &[Frag],
    form: IrForm,
) -> Result<(), ValidationError> {
    let mut v = Validator {
        file,
        phase,
        first: None,
    };

    // label universes: local frag names, and block labels per text frag
    let mut frag_names = HashSet::new();
    let mut local_frag_ids = HashSet::new();
    let mut all_block_ids = HashSet::new();
    for frag in frags {
        if !frag_names.insert(frag.name().clone()) {
            v.report(format!("duplicate fragment name {:?}", frag.name()));
        }
        if let Some(id) = frag.name().local() {
            local_frag_ids.insert(id);
        }
        if let Frag::Text { blocks, .. } = frag {
            for block in blocks {
                all_block_ids.insert(block.label);
            }
        }
    }

    for frag in frags {
        match frag {
            Frag::Bss { data, .. } => {
                for datum in data {
                    if !matches!(datum, Datum::Padding(_)) {
                        v.report("bss fragment holds an initialized datum".into());
                    }
                }
            }
            Frag::RoData { data, .. } | Frag::Data { data, .. } => {
                for datum in data {
                    if let Datum::Local(id) = datum {
                        if !all_block_ids.contains(id) && !local_frag_ids.contains(id) {
                            v.report(format!("datum references unknown local label {id}"));
                        }
                    }
                }
            }
            Frag::Text { name, blocks } => {
                let mut block_ids = HashSet::new();
                for block in blocks {
                    if !block_ids.insert(block.label) {
                        v.report(format!(
                            "duplicate block label {} in {:?}",
                            block.label, name
                        ));
                    }
                    // in linear form jump targets are the inline labels
                    for inst in &block.instructions {
                        if inst.op == crate::op::IROperator::Label {
                            if let Some(id) = inst.args.first().and_then(Operand::local_label) {
                                block_ids.insert(id);
                            }
                        }
                    }
                }
                if form == IrForm::Linear && blocks.len() != 1 {
                    v.report(format!(
                        "linear-form text frag {:?} has {} blocks",
                        name,
                        blocks.len()
                    ));
                }

                for block in blocks {
                    if block.instructions.is_empty() {
                        v.report(format!("block {} is empty", block.label));
                        continue;
                    }
                    for (idx, inst) in block.instructions.iter().enumerate() {
                        let last = idx + 1 == block.instructions.len();
                        if inst.args.len() != inst.op.arity() {
                            v.report(format!(
                                "{} has {} operands, wants {}",
                                inst.op,
                                inst.args.len(),
                                inst.op.arity()
                            ));
                            continue;
                        }
                        for (slot, (arg, mask)) in inst
                            .args
                            .iter()
                            .zip(inst.op.admissible())
                            .enumerate()
                        {
                            if operand_mask(arg) & mask == 0 {
                                v.report(format!(
                                    "{} operand {slot} has inadmissible kind",
                                    inst.op
                                ));
                            }
                        }
                        match form {
                            IrForm::Blocked => {
                                if inst.op.is_one_arg_jump() {
                                    v.report(format!("{} in blocked form", inst.op));
                                }
                                if last && !inst.op.is_block_terminator() {
                                    v.report(format!(
                                        "block {} ends in non-terminator {}",
                                        block.label, inst.op
                                    ));
                                }
                                if !last && inst.op.is_block_terminator() {
                                    v.report(format!(
                                        "terminator {} before the end of block {}",
                                        inst.op, block.label
                                    ));
                                }
                            }
                            IrForm::Linear => {
                                if inst.op.is_two_arg_jump() {
                                    v.report(format!("{} in linear form", inst.op));
                                }
                            }
                        }
                        // local jump targets resolve within this frag;
                        // jumptable tables resolve to local rodata frags
                        if inst.op == crate::op::IROperator::Jumptable {
                            match inst.args[1].local_label() {
                                Some(id) if local_frag_ids.contains(&id) => {}
                                _ => v.report("jumptable references no rodata frag".into()),
                            }
                        } else if inst.op.is_jump_family()
                            || inst.op == crate::op::IROperator::Label
                        {
                            for arg in &inst.args {
                                if let Some(id) = arg.local_label() {
                                    if !block_ids.contains(&id) {
                                        v.report(format!(
                                            "jump to label {id} outside {:?}",
                                            name
                                        ));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    match v.first {
        None => Ok(()),
        Some(reason) => Err(ValidationError {
            file: file.into(),
            phase: phase.into(),
            reason,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{self, Instruction};
    use crate::op::IROperator;
    use crate::operand::Operand;
    use crate::Block;
    use ternc_types::AllocHint;

    fn text_frag(blocks: Vec<Block>) -> Frag {
        Frag::Text {
            name: LabelRef::Global("_T1a1f".into()),
            blocks,
        }
    }

    #[test]
    fn accepts_a_minimal_function() {
        let mut entry = Block::new(0);
        entry.push(instruction::mov(
            Operand::temp(1, 4, 4, AllocHint::Gp),
            Operand::constant(4, Datum::Int(42)),
        ));
        entry.push(instruction::ret());
        let frags = vec![text_frag(vec![entry])];
        assert!(validate("test.tn", "translation", &frags, IrForm::Blocked).is_ok());
    }

    #[test]
    fn rejects_mid_block_terminators() {
        let mut entry = Block::new(0);
        entry.push(instruction::jump(1));
        entry.push(instruction::ret());
        let mut exit = Block::new(1);
        exit.push(instruction::ret());
        let frags = vec![text_frag(vec![entry, exit])];
        let err = validate("test.tn", "translation", &frags, IrForm::Blocked).unwrap_err();
        assert!(err.reason.contains("terminator"));
    }

    #[test]
    fn rejects_arity_mismatch() {
        let mut entry = Block::new(0);
        entry.push(Instruction {
            op: IROperator::Move,
            args: vec![Operand::temp(1, 4, 4, AllocHint::Gp)],
        });
        entry.push(instruction::ret());
        let frags = vec![text_frag(vec![entry])];
        assert!(validate("test.tn", "translation", &frags, IrForm::Blocked).is_err());
    }

    #[test]
    fn rejects_dangling_jump_targets() {
        let mut entry = Block::new(0);
        entry.push(instruction::jump(7));
        let frags = vec![text_frag(vec![entry])];
        let err = validate("test.tn", "translation", &frags, IrForm::Blocked).unwrap_err();
        assert!(err.reason.contains("label 7"));
    }

    #[test]
    fn validation_is_idempotent() {
        let mut entry = Block::new(0);
        entry.push(instruction::ret());
        let frags = vec![text_frag(vec![entry])];
        let once = validate("test.tn", "translation", &frags, IrForm::Blocked);
        let twice = validate("test.tn", "translation", &frags, IrForm::Blocked);
        assert_eq!(once, twice);
    }
}
