//! Arity reduction: three-operand abstract instructions to two-operand
//! x86 forms.
//!
//! Selection leaves simple binops as `d = a op b` and unops as `d = op a`;
//! this pass rewrites them in place, prepending a move of the left operand
//! into the destination whenever the destination is not already one of the
//! operands. Commutative operators may reuse either side.

use tracing::debug;

use crate::context::FileEntry;
use crate::x86_64::asm::{AsmFrag, AsmInstrKind, AsmInstruction, AsmOperand, ReduceRule};

/// Reduces every text frag of a file's selected assembly.
pub fn reduce(file: &mut FileEntry) {
    let Some(asm) = file.asm.as_mut() else {
        return;
    };
    debug!(file = %file.name, "reducing operand arity");
    for frag in &mut asm.frags {
        if let AsmFrag::Text { instructions, .. } = frag {
            let old = std::mem::take(instructions);
            for inst in old {
                reduce_into(inst, instructions);
            }
        }
    }
}

fn mov_for(dst: &AsmOperand, size: u64) -> &'static str {
    if dst.is_sse_class() {
        if size == 4 {
            "\tmovss %d, %u\n"
        } else {
            "\tmovsd %d, %u\n"
        }
    } else {
        "\tmov %d, %u\n"
    }
}

fn prepend_move(dst: &AsmOperand, src: &AsmOperand, out: &mut Vec<AsmInstruction>) {
    let size = match dst {
        AsmOperand::Temp { size, .. } | AsmOperand::Reg { size, .. } => *size,
        _ => 8,
    };
    out.push(
        AsmInstruction::regular(mov_for(dst, size))
            .kind(AsmInstrKind::Move)
            .operand(dst.clone())
            .operand(src.clone())
            .def(dst.clone())
            .use_(src.clone()),
    );
}

fn reduce_into(mut inst: AsmInstruction, out: &mut Vec<AsmInstruction>) {
    let Some(rule) = inst.reduce.take() else {
        out.push(inst);
        return;
    };

    match rule {
        ReduceRule::Commutative | ReduceRule::NonCommutative => {
            let commutative = rule == ReduceRule::Commutative;
            let (dst, lhs, rhs) = {
                let mut ops = inst.operands.drain(..);
                (
                    ops.next().expect("reducible binop has a destination"),
                    ops.next().expect("reducible binop has a left operand"),
                    ops.next().expect("reducible binop has a right operand"),
                )
            };
            if dst == lhs {
                inst.operands = vec![dst.clone(), rhs];
            } else if commutative && dst == rhs {
                inst.operands = vec![dst.clone(), lhs];
            } else {
                prepend_move(&dst, &lhs, out);
                inst.operands = vec![dst.clone(), rhs];
            }
            // the two-operand form reads its destination as well
            inst.uses.push(dst);
            out.push(inst);
        }
        ReduceRule::Unary => {
            let (dst, src) = {
                let mut ops = inst.operands.drain(..);
                (
                    ops.next().expect("reducible unop has a destination"),
                    ops.next().expect("reducible unop has a source"),
                )
            };
            if dst != src {
                prepend_move(&dst, &src, out);
            }
            inst.operands = vec![dst.clone()];
            inst.uses.push(dst);
            out.push(inst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ternc_types::AllocHint;

    fn temp(id: usize) -> AsmOperand {
        AsmOperand::Temp {
            id,
            align: 4,
            size: 4,
            hint: AllocHint::Gp,
        }
    }

    fn binop(rule: ReduceRule, dst: usize, lhs: usize, rhs: usize) -> AsmInstruction {
        AsmInstruction::regular("\tadd %d, %u\n")
            .operand(temp(dst))
            .operand(temp(lhs))
            .operand(temp(rhs))
            .def(temp(dst))
            .use_(temp(lhs))
            .use_(temp(rhs))
            .reducible(rule)
    }

    #[rstest]
    // d = a op b with a distinct destination moves a in first
    #[case(ReduceRule::Commutative, (1, 2, 3), 2, vec![1, 3])]
    #[case(ReduceRule::NonCommutative, (1, 2, 3), 2, vec![1, 3])]
    // d = d op b works in place
    #[case(ReduceRule::Commutative, (1, 1, 3), 1, vec![1, 3])]
    #[case(ReduceRule::NonCommutative, (1, 1, 3), 1, vec![1, 3])]
    // d = a op d reuses the destination only when commutable
    #[case(ReduceRule::Commutative, (1, 2, 1), 1, vec![1, 2])]
    #[case(ReduceRule::NonCommutative, (1, 2, 1), 2, vec![1, 1])]
    fn binops_reduce_to_two_operands(
        #[case] rule: ReduceRule,
        #[case] shape: (usize, usize, usize),
        #[case] expected_len: usize,
        #[case] expected_operands: Vec<usize>,
    ) {
        let (dst, lhs, rhs) = shape;
        let mut out = Vec::new();
        reduce_into(binop(rule, dst, lhs, rhs), &mut out);
        assert_eq!(out.len(), expected_len);
        if expected_len == 2 {
            assert_eq!(out[0].kind, AsmInstrKind::Move);
            assert_eq!(out[0].operands, vec![temp(dst), temp(lhs)]);
        }
        let last = out.last().expect("reduction emits the operation");
        let expected: Vec<AsmOperand> = expected_operands.into_iter().map(temp).collect();
        assert_eq!(last.operands, expected);
        assert!(last.reduce.is_none());
    }

    #[test]
    fn unary_ops_collapse_to_one_operand() {
        let mut out = Vec::new();
        let neg = AsmInstruction::regular("\tneg %d\n")
            .operand(temp(4))
            .operand(temp(5))
            .def(temp(4))
            .use_(temp(5))
            .reducible(ReduceRule::Unary);
        reduce_into(neg, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].operands, vec![temp(4)]);
    }
}
