//! Trace scheduling: blocked IR to linear IR.
//!
//! The scheduler picks a trace starting at the entry block, preferring the
//! false branch of conditional jumps as fallthrough, and emits every block
//! exactly once as a `Label` pseudo-instruction followed by its body. Two-arg
//! conditional jumps become one-arg jumps whose false edge falls through;
//! jumps to the block scheduled next are dropped.

use std::collections::VecDeque;

use tracing::debug;

use ternc_ir::instruction::{jump, label};
use ternc_ir::{Block, Frag, Instruction, Operand};

/// Linearizes every text frag of a file.
pub fn trace_schedule(file: &mut crate::context::FileEntry) {
    for frag in &mut file.frags {
        if let Frag::Text { name, blocks } = frag {
            debug!(frag = ?name, "trace scheduling");
            let mut remaining: VecDeque<Block> = std::mem::take(blocks).into();
            let mut out = Block::new(0);
            // the entry trace first, then leftovers in original order
            while let Some(block) = remaining.pop_front() {
                schedule_block(block, &mut out, &mut remaining);
            }
            blocks.push(out);
        }
    }
}

fn take_block(remaining: &mut VecDeque<Block>, target: usize) -> Option<Block> {
    remaining
        .iter()
        .position(|b| b.label == target)
        .and_then(|idx| remaining.remove(idx))
}

fn schedule_block(mut block: Block, out: &mut Block, remaining: &mut VecDeque<Block>) {
    out.push(label(block.label));
    let term = block
        .instructions
        .pop()
        .expect("validated blocks are nonempty");
    for inst in block.instructions.drain(..) {
        out.push(inst);
    }

    match term.op {
        ternc_ir::IROperator::Jump => {
            match term.args[0].local_label().and_then(|t| take_block(remaining, t)) {
                // fallthrough: the target comes next, the jump disappears
                Some(next) => schedule_block(next, out, remaining),
                None => out.push(term),
            }
        }
        op if op.is_two_arg_jump() => {
            let true_label = term.args[0]
                .local_label()
                .expect("conditional jumps target local labels");
            let false_label = term.args[1]
                .local_label()
                .expect("conditional jumps target local labels");
            out.push(one_arg_form(term));
            // falsehood is assumed more likely: schedule it as fallthrough
            match take_block(remaining, false_label) {
                Some(next) => schedule_block(next, out, remaining),
                None => out.push(jump(false_label)),
            }
            if let Some(next) = take_block(remaining, true_label) {
                schedule_block(next, out, remaining);
            }
        }
        ternc_ir::IROperator::Return | ternc_ir::IROperator::Jumptable => out.push(term),
        _ => unreachable!("invalid terminator survived validation"),
    }
}

/// Rewrites a two-arg conditional jump into its one-arg form: the false
/// target is dropped, everything else is kept in order.
fn one_arg_form(term: Instruction) -> Instruction {
    let op = term.op.one_arg_form();
    let mut args = term.args;
    let mut iter = args.drain(..);
    let true_label = iter.next().expect("two-arg jumps have four or three args");
    let _false_label = iter.next();
    let rest: Vec<Operand> = iter.collect();
    let mut new_args = vec![true_label];
    new_args.extend(rest);
    Instruction::new(op, new_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ternc_ir::instruction::{self, binop, cjump, mov};
    use ternc_ir::{Datum, IROperator, LabelRef};
    use ternc_types::ast::Module;
    use ternc_types::AllocHint;

    fn schedule(blocks: Vec<Block>) -> Vec<Instruction> {
        let mut file = crate::context::FileEntry::new(
            "test.tn",
            Module {
                name: vec!["t".into()],
                decls: vec![],
            },
        );
        file.frags.push(Frag::Text {
            name: LabelRef::Global("_T1t1f".into()),
            blocks,
        });
        trace_schedule(&mut file);
        match file.frags.remove(0) {
            Frag::Text { mut blocks, .. } => {
                assert_eq!(blocks.len(), 1);
                blocks.remove(0).instructions
            }
            _ => unreachable!(),
        }
    }

    fn labels_in(instructions: &[Instruction]) -> Vec<usize> {
        instructions
            .iter()
            .filter(|i| i.op == IROperator::Label)
            .map(|i| i.args[0].local_label().expect("labels are local"))
            .collect()
    }

    #[test]
    fn false_branch_falls_through() {
        let t1 = Operand::temp(1, 4, 4, AllocHint::Gp);
        let mut b0 = Block::new(0);
        b0.push(cjump(
            IROperator::J2L,
            1,
            2,
            t1.clone(),
            Operand::constant(4, Datum::Int(10)),
        ));
        let mut b1 = Block::new(1);
        b1.push(instruction::ret());
        let mut b2 = Block::new(2);
        b2.push(instruction::ret());

        let out = schedule(vec![b0, b1, b2]);
        assert_eq!(labels_in(&out), vec![0, 2, 1]);
        let j1 = out
            .iter()
            .find(|i| i.op == IROperator::J1L)
            .expect("one-arg jump emitted");
        assert_eq!(j1.args[0].local_label(), Some(1));
        assert_eq!(j1.args.len(), 3);
    }

    #[test]
    fn every_block_is_emitted_exactly_once() {
        let t1 = Operand::temp(1, 4, 4, AllocHint::Gp);
        let mut b0 = Block::new(0);
        b0.push(instruction::jump(3));
        let mut b3 = Block::new(3);
        b3.push(mov(t1.clone(), Operand::constant(4, Datum::Int(1))));
        b3.push(cjump(
            IROperator::J2E,
            3,
            4,
            t1.clone(),
            Operand::constant(4, Datum::Int(0)),
        ));
        let mut b4 = Block::new(4);
        b4.push(instruction::ret());

        let out = schedule(vec![b0, b3, b4]);
        let mut seen = labels_in(&out);
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 3, 4]);
        // the loop back-edge to an already-scheduled block stays explicit
        assert!(out
            .iter()
            .any(|i| i.op == IROperator::J1E && i.args[0].local_label() == Some(3)));
    }

    #[test]
    fn jump_to_already_scheduled_block_is_kept() {
        // 0 -> 1 -> 0 (infinite loop shape after the cjump's arms merge)
        let mut b0 = Block::new(0);
        b0.push(instruction::jump(1));
        let mut b1 = Block::new(1);
        b1.push(instruction::jump(0));

        let out = schedule(vec![b0, b1]);
        assert_eq!(labels_in(&out), vec![0, 1]);
        assert_eq!(out.last().map(|i| i.op), Some(IROperator::Jump));
        assert_eq!(out.last().and_then(|i| i.args[0].local_label()), Some(0));
    }

    #[test]
    fn binop_bodies_are_carried_verbatim() {
        let t1 = Operand::temp(1, 4, 4, AllocHint::Gp);
        let t2 = Operand::temp(2, 4, 4, AllocHint::Gp);
        let mut b0 = Block::new(0);
        b0.push(binop(
            IROperator::Add,
            t1.clone(),
            t2.clone(),
            Operand::constant(4, Datum::Int(3)),
        ));
        b0.push(instruction::ret());
        let out = schedule(vec![b0]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].op, IROperator::Add);
    }
}
