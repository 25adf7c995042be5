//! x86_64-specific IR well-formedness checks.

use tracing::error;

use ternc_ir::{Frag, Operand};
use ternc_types::AllocHint;

use crate::error::BackendError;

/// Validates that every operand in a file's text frags is representable on
/// x86_64: register and GP/FP temp sizes must be register sizes, scalar
/// temps must be naturally aligned, and stack-resident temps must not
/// demand more than 16-byte alignment.
pub fn validate_arch(file: &str, phase: &str, frags: &[Frag]) -> Result<(), BackendError> {
    let mut first: Option<String> = None;
    let mut report = |reason: String| {
        error!(
            "{}: internal compiler error: x86_64-linux specific IR validation after {} failed - {}",
            file, phase, reason
        );
        if first.is_none() {
            first = Some(reason);
        }
    };

    for frag in frags {
        let Frag::Text { blocks, .. } = frag else {
            continue;
        };
        for block in blocks {
            for inst in &block.instructions {
                for arg in &inst.args {
                    match arg {
                        Operand::Reg { size, .. } => {
                            if !matches!(*size, 1 | 2 | 4 | 8) {
                                report(format!(
                                    "invalid register size ({size}) encountered"
                                ));
                            }
                        }
                        Operand::Temp {
                            size,
                            align,
                            hint: AllocHint::Gp,
                            ..
                        } => {
                            if !matches!(*size, 1 | 2 | 4 | 8) {
                                report(format!(
                                    "invalid temp size for GP temp ({size}) encountered"
                                ));
                            }
                            if align != size {
                                report(format!(
                                    "invalid temp alignment for GP temp ({align}) encountered"
                                ));
                            }
                        }
                        Operand::Temp {
                            size,
                            align,
                            hint: AllocHint::Fp,
                            ..
                        } => {
                            if !matches!(*size, 4 | 8) {
                                report(format!(
                                    "invalid temp size for FP temp ({size}) encountered"
                                ));
                            }
                            if align != size {
                                report(format!(
                                    "invalid temp alignment for FP temp ({align}) encountered"
                                ));
                            }
                        }
                        Operand::Temp {
                            align,
                            hint: AllocHint::Mem,
                            ..
                        } => {
                            if *align > 16 {
                                report(format!(
                                    "invalid mem temp alignment ({align}) encountered"
                                ));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    match first {
        None => Ok(()),
        Some(reason) => Err(BackendError::ArchValidation {
            file: file.into(),
            phase: phase.into(),
            reason,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ternc_ir::instruction::{self, mov};
    use ternc_ir::{Block, Datum, LabelRef};

    fn frag_with(instrs: Vec<ternc_ir::Instruction>) -> Vec<Frag> {
        let mut block = Block::new(0);
        for i in instrs {
            block.push(i);
        }
        block.push(instruction::ret());
        vec![Frag::Text {
            name: LabelRef::Global("_T1t1f".into()),
            blocks: vec![block],
        }]
    }

    #[test]
    fn accepts_register_sized_temps() {
        let frags = frag_with(vec![mov(
            Operand::temp(1, 8, 8, AllocHint::Gp),
            Operand::constant(8, Datum::Long(1)),
        )]);
        assert!(validate_arch("t.tn", "translation", &frags).is_ok());
    }

    #[test]
    fn rejects_odd_gp_temps() {
        let frags = frag_with(vec![mov(
            Operand::temp(1, 3, 3, AllocHint::Gp),
            Operand::constant(1, Datum::Byte(1)),
        )]);
        assert!(validate_arch("t.tn", "translation", &frags).is_err());
    }

    #[test]
    fn rejects_overaligned_mem_temps() {
        let frags = frag_with(vec![instruction::uninit(Operand::temp(
            1,
            32,
            64,
            AllocHint::Mem,
        ))]);
        assert!(validate_arch("t.tn", "translation", &frags).is_err());
    }
}
