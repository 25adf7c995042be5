//! IR optimization passes.
//!
//! Blocked form: short-circuit jumps, dead-block elimination, dead-temp
//! elimination, iterated to a fixpoint per fragment. Linear form: dead-label
//! elimination. All passes mutate the fragments in place and none crosses a
//! fragment boundary except to read rodata jump tables.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use ternc_ir::instruction::jump;
use ternc_ir::{Block, Datum, Frag, IROperator, Instruction};

use crate::context::FileEntry;

/// Jump-table entries and rodata label roots for one file: which block
/// labels each local rodata frag refers to.
struct DataRefs {
    /// Local frag id to the block labels its datums name.
    tables: HashMap<usize, Vec<usize>>,
    /// Every block label any data frag references.
    roots: Vec<usize>,
}

fn collect_data_refs(frags: &[Frag]) -> DataRefs {
    let mut tables = HashMap::new();
    let mut roots = Vec::new();
    for frag in frags {
        let (name, data) = match frag {
            Frag::RoData { name, data, .. } | Frag::Data { name, data, .. } => (name, data),
            _ => continue,
        };
        let labels: Vec<usize> = data
            .iter()
            .filter_map(|d| match d {
                Datum::Local(id) => Some(*id),
                _ => None,
            })
            .collect();
        roots.extend(labels.iter().copied());
        if let Some(id) = name.local() {
            tables.insert(id, labels);
        }
    }
    DataRefs { tables, roots }
}

/// Optimizes every text frag of a file in blocked form.
pub fn optimize_blocked(file: &mut FileEntry) {
    let refs = collect_data_refs(&file.frags);
    for frag in &mut file.frags {
        if let Frag::Text { name, blocks } = frag {
            debug!(frag = ?name, "optimizing blocked IR");
            loop {
                let mut changed = false;
                changed |= short_circuit_jumps(blocks);
                changed |= dead_block_elimination(blocks, &refs);
                changed |= dead_temp_elimination(blocks);
                if !changed {
                    break;
                }
            }
        }
    }
}

/// Replaces jumps to single-jump blocks with the jump those blocks perform.
/// Chains are followed to their end; cycles of empty jumps are left alone.
fn short_circuit_jumps(blocks: &mut [Block]) -> bool {
    // a shortcut block consists of exactly one instruction, necessarily a
    // terminator; RETURN counts as a jump here
    let shortcuts: HashMap<usize, Instruction> = blocks
        .iter()
        .filter(|b| b.instructions.len() == 1)
        .map(|b| (b.label, b.instructions[0].clone()))
        .collect();

    let mut changed = false;
    for block in blocks.iter_mut() {
        let Some(last) = block.instructions.last_mut() else {
            continue;
        };
        if last.op != IROperator::Jump {
            continue;
        }
        let Some(mut target) = last.args[0].local_label() else {
            continue;
        };
        // follow unconditional shortcut chains, stopping on a cycle
        let mut visited = HashSet::new();
        visited.insert(target);
        while let Some(next) = shortcuts.get(&target).and_then(|i| {
            (i.op == IROperator::Jump)
                .then(|| i.args[0].local_label())
                .flatten()
        }) {
            if !visited.insert(next) {
                break;
            }
            target = next;
        }
        let replacement = match shortcuts.get(&target) {
            Some(i) if i.op != IROperator::Jump => i.clone(),
            _ => jump(target),
        };
        if *last != replacement {
            *last = replacement;
            changed = true;
        }
    }
    changed
}

/// Frees blocks unreachable from the entry block and from rodata label
/// roots (jump tables keep their targets alive).
fn dead_block_elimination(blocks: &mut Vec<Block>, refs: &DataRefs) -> bool {
    let Some(entry) = blocks.first() else {
        return false;
    };
    let present: HashSet<usize> = blocks.iter().map(|b| b.label).collect();
    let mut reachable = HashSet::new();
    let mut work: Vec<usize> = vec![entry.label];
    work.extend(refs.roots.iter().filter(|l| present.contains(l)));

    while let Some(label) = work.pop() {
        if !reachable.insert(label) {
            continue;
        }
        let Some(block) = blocks.iter().find(|b| b.label == label) else {
            continue;
        };
        let Some(term) = block.terminator() else {
            continue;
        };
        match term.op {
            IROperator::Jump => {
                if let Some(t) = term.args[0].local_label() {
                    work.push(t);
                }
            }
            IROperator::Jumptable => {
                if let Some(table) = term.args[1].local_label() {
                    if let Some(entries) = refs.tables.get(&table) {
                        work.extend(entries.iter().copied());
                    }
                }
            }
            op if op.is_two_arg_jump() => {
                work.extend(term.args[0].local_label());
                work.extend(term.args[1].local_label());
            }
            _ => {} // leaves the function
        }
    }

    let before = blocks.len();
    blocks.retain(|b| reachable.contains(&b.label));
    blocks.len() != before
}

/// Replaces writes to never-read temps with nops. `Volatile` and `Addrof`
/// operands count as reads, keeping observable and address-taken temps
/// alive.
fn dead_temp_elimination(blocks: &mut [Block]) -> bool {
    let mut changed_any = false;
    loop {
        let mut seen: HashSet<usize> = HashSet::new();
        for block in blocks.iter() {
            for inst in &block.instructions {
                for &idx in inst.op.read_indices() {
                    if let Some(id) = inst.args[idx].temp_id() {
                        seen.insert(id);
                    }
                }
            }
        }

        let mut changed = false;
        for block in blocks.iter_mut() {
            for inst in &mut block.instructions {
                let dead = inst
                    .written()
                    .and_then(|w| w.temp_id())
                    .map_or(false, |id| !seen.contains(&id));
                if dead {
                    inst.make_nop();
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
        changed_any = true;
    }
    changed_any
}

/// Removes labels nothing jumps to from linearized text frags.
pub fn optimize_linear(file: &mut FileEntry) {
    let refs = collect_data_refs(&file.frags);
    for frag in &mut file.frags {
        if let Frag::Text { name, blocks } = frag {
            debug!(frag = ?name, "optimizing linear IR");
            for block in blocks {
                dead_label_elimination(block, &refs);
            }
        }
    }
}

fn dead_label_elimination(block: &mut Block, refs: &DataRefs) {
    let mut seen: HashSet<usize> = refs.roots.iter().copied().collect();
    for inst in &block.instructions {
        if inst.op.is_jump_family() {
            for arg in &inst.args {
                if let Some(id) = arg.local_label() {
                    seen.insert(id);
                }
            }
        }
    }
    block.instructions.retain(|inst| {
        inst.op != IROperator::Label
            || inst.args[0].local_label().map_or(true, |id| seen.contains(&id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ternc_ir::instruction::{self, binop, label, mov};
    use ternc_ir::{IROperator, LabelRef, Operand};
    use ternc_types::ast::Module;
    use ternc_types::AllocHint;

    fn file_with(blocks: Vec<Block>) -> FileEntry {
        let mut file = FileEntry::new(
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
        file
    }

    fn text_blocks(file: &FileEntry) -> &Vec<Block> {
        match &file.frags[0] {
            Frag::Text { blocks, .. } => blocks,
            _ => unreachable!(),
        }
    }

    #[test]
    fn jump_chains_short_circuit_and_die() {
        // 0: jump 1;  1: jump 2;  2: ret
        let mut b0 = Block::new(0);
        b0.push(instruction::jump(1));
        let mut b1 = Block::new(1);
        b1.push(instruction::jump(2));
        let mut b2 = Block::new(2);
        b2.push(instruction::ret());

        let mut file = file_with(vec![b0, b1, b2]);
        optimize_blocked(&mut file);

        let blocks = text_blocks(&file);
        // 0 jumps straight to the return; 1 (and 2, itself a shortcut) die
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label, 0);
        assert_eq!(blocks[0].instructions[0].op, IROperator::Return);
    }

    #[test]
    fn unreachable_blocks_are_freed() {
        let mut b0 = Block::new(0);
        b0.push(instruction::ret());
        let mut dead = Block::new(1);
        dead.push(mov(
            Operand::temp(5, 4, 4, AllocHint::Gp),
            Operand::constant(4, Datum::Int(1)),
        ));
        dead.push(instruction::jump(1));

        let mut file = file_with(vec![b0, dead]);
        optimize_blocked(&mut file);
        assert_eq!(text_blocks(&file).len(), 1);
    }

    #[test]
    fn jumptable_targets_stay_reachable() {
        let scrut = Operand::temp(9, 8, 8, AllocHint::Gp);
        let mut b0 = Block::new(0);
        b0.push(instruction::jumptable(scrut, 100));
        let mut b1 = Block::new(1);
        b1.push(instruction::ret());
        let mut file = file_with(vec![b0, b1]);
        file.frags.push(Frag::RoData {
            name: LabelRef::Local(100),
            align: 8,
            data: vec![Datum::Local(1)],
        });
        optimize_blocked(&mut file);
        assert_eq!(text_blocks(&file).len(), 2);
    }

    #[test]
    fn dead_temp_writes_become_nops() {
        let live = Operand::temp(1, 4, 4, AllocHint::Gp);
        let dead = Operand::temp(2, 4, 4, AllocHint::Gp);
        let mut b0 = Block::new(0);
        b0.push(mov(dead.clone(), Operand::constant(4, Datum::Int(9))));
        b0.push(mov(live.clone(), Operand::constant(4, Datum::Int(1))));
        b0.push(binop(
            IROperator::Add,
            Operand::reg(0, 4),
            live.clone(),
            Operand::constant(4, Datum::Int(2)),
        ));
        b0.push(instruction::ret());

        let mut file = file_with(vec![b0]);
        optimize_blocked(&mut file);
        let blocks = text_blocks(&file);
        assert_eq!(blocks[0].instructions[0].op, IROperator::Nop);
        assert_eq!(blocks[0].instructions[1].op, IROperator::Move);
    }

    #[test]
    fn volatile_temps_survive_dead_temp_elimination() {
        let observed = Operand::temp(3, 4, 4, AllocHint::Gp);
        let mut b0 = Block::new(0);
        b0.push(mov(observed.clone(), Operand::constant(4, Datum::Int(7))));
        b0.push(instruction::volatile_use(observed));
        b0.push(instruction::ret());

        let mut file = file_with(vec![b0]);
        optimize_blocked(&mut file);
        assert_eq!(
            text_blocks(&file)[0].instructions[0].op,
            IROperator::Move
        );
    }

    #[test]
    fn dead_labels_disappear_from_linear_code() {
        let mut linear = Block::new(0);
        linear.push(label(0));
        linear.push(label(7));
        // one-arg jump back to the entry label; label 7 has no referent
        linear.push(Instruction::new(
            IROperator::J1E,
            vec![
                Operand::local(0),
                Operand::temp(1, 1, 1, AllocHint::Gp),
                Operand::temp(2, 1, 1, AllocHint::Gp),
            ],
        ));
        linear.push(instruction::ret());
        let mut file = file_with(vec![linear]);
        optimize_linear(&mut file);
        let blocks = text_blocks(&file);
        assert_eq!(
            blocks[0]
                .instructions
                .iter()
                .filter(|i| i.op == IROperator::Label)
                .count(),
            1
        );
        assert_eq!(blocks[0].instructions[0].args[0].local_label(), Some(0));
    }
}
