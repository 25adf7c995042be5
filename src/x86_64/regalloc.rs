//! Graph-coloring register allocation.
//!
//! Liveness walks forward from each definition to its uses, stopping at
//! redefinitions; live temps interfere with each other and with registers
//! defined while they are live. Colors come from fixed preference lists.
//! Temps that cannot be colored are spilled to fresh stack slots (their
//! references rewritten through short-lived temps) and the allocator
//! restarts. Stack-resident temps and spill slots become `rbp`-relative
//! memory; the prologue and epilogue are materialized last.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use itertools::Itertools;
use tracing::debug;

use ternc_types::AllocHint;

use crate::consts::STACK_ALIGNMENT;
use crate::context::FileEntry;
use crate::x86_64::asm::{AsmFrag, AsmInstrKind, AsmInstruction, AsmOperand, Register};

/// GP registers in allocation preference order.
const GP_ALLOC_ORDER: [Register; 14] = [
    Register::Rax,
    Register::R11,
    Register::R10,
    Register::Rbx,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::R9,
    Register::R8,
    Register::Rcx,
    Register::Rdx,
    Register::Rsi,
    Register::Rdi,
];

/// SSE registers in allocation preference order.
const SSE_ALLOC_ORDER: [Register; 16] = [
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm8,
    Register::Xmm9,
    Register::Xmm10,
    Register::Xmm11,
    Register::Xmm12,
    Register::Xmm13,
    Register::Xmm14,
    Register::Xmm15,
    Register::Xmm7,
    Register::Xmm6,
    Register::Xmm5,
    Register::Xmm4,
    Register::Xmm3,
    Register::Xmm2,
];

#[derive(Debug, Clone, Copy)]
struct TempInfo {
    size: u64,
    align: u64,
    hint: AllocHint,
}

/// Allocates registers for every text frag of a file's selected assembly.
pub fn allocate(file: &mut FileEntry) {
    let Some(asm) = file.asm.as_mut() else {
        return;
    };
    debug!(file = %file.name, "allocating registers");
    let next_id = &mut file.next_id;
    for frag in &mut asm.frags {
        if let AsmFrag::Text {
            instructions,
            outgoing_area,
            ..
        } = frag
        {
            allocate_frag(instructions, *outgoing_area, next_id);
        }
    }
}

fn allocate_frag(instructions: &mut Vec<AsmInstruction>, outgoing: u64, next_id: &mut usize) {
    let (colors, graph_temps, temp_info) = loop {
        match try_color(instructions) {
            Ok(result) => break result,
            Err(spilled) => rewrite_spill(instructions, spilled, next_id),
        }
    };

    // callee-save bookkeeping, in the order coloring picked them
    let mut to_save: Vec<Register> = Vec::new();
    for reg in colors.values() {
        if reg.is_callee_save() && !to_save.contains(reg) {
            to_save.push(*reg);
        }
    }

    // frame layout: saves at the top, stack-resident temps below them,
    // the outgoing argument area at the bottom
    let mut cursor = 8 * to_save.len() as u64;
    let mut slots: HashMap<usize, i64> = HashMap::new();
    for (id, info) in first_appearance_mem_temps(instructions, &temp_info) {
        cursor += info.size;
        cursor = round_up(cursor, info.align.max(1));
        slots.insert(id, -(cursor as i64));
    }
    let frame_size = round_up(cursor + outgoing, STACK_ALIGNMENT);
    let local_size = frame_size - 8 * to_save.len() as u64;

    // delete instructions whose only effect is defining dead temps
    instructions.retain(|inst| {
        let temp_defs: Vec<usize> = inst
            .defines
            .iter()
            .filter_map(AsmOperand::temp_id)
            .collect();
        temp_defs.is_empty() || temp_defs.iter().any(|id| graph_temps.contains(id))
    });

    // substitute every temp with its register or stack slot
    for inst in instructions.iter_mut() {
        for operand in inst
            .operands
            .iter_mut()
            .chain(inst.defines.iter_mut())
            .chain(inst.uses.iter_mut())
            .chain(inst.other.iter_mut())
        {
            substitute(operand, &colors, &slots);
        }
    }

    // elide moves that landed in a single register
    instructions.retain(|inst| {
        inst.kind != AsmInstrKind::Move
            || inst.operands.len() != 2
            || inst.operands[0] != inst.operands[1]
    });

    // prologue
    let mut prologue = vec![
        AsmInstruction::regular("\tpush rbp\n"),
        AsmInstruction::regular("\tmov rbp, rsp\n"),
    ];
    for reg in &to_save {
        prologue.push(AsmInstruction::regular(format!("\tpush {}\n", reg.name(8))));
    }
    if local_size > 0 {
        prologue.push(AsmInstruction::regular(format!(
            "\tsub rsp, {local_size}\n"
        )));
    }
    instructions.splice(0..0, prologue);

    // epilogue, materialized at every leave site
    let mut epilogue = String::new();
    if local_size > 0 {
        epilogue.push_str(&format!("\tadd rsp, {local_size}\n"));
    }
    for reg in to_save.iter().rev() {
        epilogue.push_str(&format!("\tpop {}\n", reg.name(8)));
    }
    epilogue.push_str("\tpop rbp\n\tret\n");
    for inst in instructions.iter_mut() {
        if inst.kind == AsmInstrKind::Leave {
            inst.skeleton = epilogue.clone();
        }
    }
}

type Coloring = (BTreeMap<usize, Register>, BTreeSet<usize>, HashMap<usize, TempInfo>);

/// One coloring attempt. Returns the chosen colors and the set of temps
/// that were ever live, or the temp to spill.
fn try_color(instructions: &[AsmInstruction]) -> Result<Coloring, usize> {
    let temp_info = collect_temp_info(instructions);
    let succs = flow_graph(instructions);

    // per-instruction defined/used temp id sets
    let defs: Vec<HashSet<usize>> = instructions
        .iter()
        .map(|inst| inst.defines.iter().filter_map(AsmOperand::temp_id).collect())
        .collect();
    let uses: Vec<HashSet<usize>> = instructions
        .iter()
        .map(|inst| {
            let mut out = HashSet::new();
            for operand in &inst.uses {
                operand.collect_temps(&mut out);
            }
            for operand in &inst.other {
                operand.collect_temps(&mut out);
            }
            out
        })
        .collect();

    // liveness: forward walk from each definition
    let mut live: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); instructions.len()];
    for (idx, def_set) in defs.iter().enumerate() {
        for &temp in def_set {
            mark_live(temp, idx, &succs, &defs, &uses, &mut live);
        }
    }
    // uses with no reaching definition (arguments bound straight from
    // registers count, since the binding move defines them) still occupy
    // their instruction
    for (idx, use_set) in uses.iter().enumerate() {
        for &temp in use_set {
            live[idx].insert(temp);
        }
    }

    let graph_temps: BTreeSet<usize> = live.iter().flatten().copied().collect();

    // interference edges
    let mut neighbors: HashMap<usize, BTreeSet<usize>> = HashMap::new();
    let mut forbidden: HashMap<usize, BTreeSet<Register>> = HashMap::new();
    for (idx, live_here) in live.iter().enumerate() {
        for (&a, &b) in live_here.iter().tuple_combinations() {
            neighbors.entry(a).or_default().insert(b);
            neighbors.entry(b).or_default().insert(a);
        }
        let reg_defs: Vec<Register> = instructions[idx]
            .defines
            .iter()
            .filter_map(|op| match op {
                AsmOperand::Reg { reg, .. } => Some(*reg),
                _ => None,
            })
            .collect();
        for &temp in live_here {
            forbidden.entry(temp).or_default().extend(&reg_defs);
        }
    }

    // color in first-appearance order
    let mut colors: BTreeMap<usize, Register> = BTreeMap::new();
    for id in first_appearance_order(instructions) {
        let Some(info) = temp_info.get(&id) else {
            continue;
        };
        if info.hint == AllocHint::Mem || !graph_temps.contains(&id) {
            continue;
        }
        let order: &[Register] = if info.hint == AllocHint::Fp {
            &SSE_ALLOC_ORDER
        } else {
            &GP_ALLOC_ORDER
        };
        let banned = forbidden.get(&id).cloned().unwrap_or_default();
        let neighbor_colors: BTreeSet<Register> = neighbors
            .get(&id)
            .map(|ns| ns.iter().filter_map(|n| colors.get(n).copied()).collect())
            .unwrap_or_default();
        let choice = order
            .iter()
            .find(|reg| !banned.contains(reg) && !neighbor_colors.contains(reg));
        match choice {
            Some(reg) => {
                colors.insert(id, *reg);
            }
            None => return Err(id),
        }
    }

    Ok((colors, graph_temps, temp_info))
}

/// Walks forward from a definition, marking the temp live wherever a later
/// use is still reachable without an intervening redefinition.
fn mark_live(
    temp: usize,
    def_idx: usize,
    succs: &[Vec<usize>],
    defs: &[HashSet<usize>],
    uses: &[HashSet<usize>],
    live: &mut [BTreeSet<usize>],
) {
    let mut visited = HashSet::new();
    let mut stack = vec![def_idx];
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        if has_future_use(temp, node, def_idx, succs, defs, uses) {
            live[node].insert(temp);
            for &succ in &succs[node] {
                // a redefinition without a use ends this range
                if defs[succ].contains(&temp) && !uses[succ].contains(&temp) {
                    continue;
                }
                stack.push(succ);
            }
        }
    }
}

fn has_future_use(
    temp: usize,
    start: usize,
    def_idx: usize,
    succs: &[Vec<usize>],
    defs: &[HashSet<usize>],
    uses: &[HashSet<usize>],
) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        if uses[node].contains(&temp) {
            return true;
        }
        if node != start && node != def_idx && defs[node].contains(&temp) {
            continue; // killed
        }
        stack.extend(&succs[node]);
    }
    false
}

/// Successor indices per instruction.
fn flow_graph(instructions: &[AsmInstruction]) -> Vec<Vec<usize>> {
    let labels: HashMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .filter_map(|(idx, inst)| match &inst.kind {
            AsmInstrKind::Label { id } => Some((*id, idx)),
            _ => None,
        })
        .collect();

    instructions
        .iter()
        .enumerate()
        .map(|(idx, inst)| match &inst.kind {
            AsmInstrKind::Regular | AsmInstrKind::Move | AsmInstrKind::Label { .. } => {
                if idx + 1 < instructions.len() {
                    vec![idx + 1]
                } else {
                    Vec::new()
                }
            }
            AsmInstrKind::Jump { target } => labels.get(target).copied().into_iter().collect(),
            AsmInstrKind::CJump { target } => {
                let mut out = Vec::new();
                if idx + 1 < instructions.len() {
                    out.push(idx + 1);
                }
                out.extend(labels.get(target).copied());
                out
            }
            AsmInstrKind::JumpTable { targets } => targets
                .iter()
                .filter_map(|t| labels.get(t).copied())
                .collect(),
            AsmInstrKind::Leave => Vec::new(),
        })
        .collect()
}

fn collect_temp_info(instructions: &[AsmInstruction]) -> HashMap<usize, TempInfo> {
    let mut info = HashMap::new();
    let mut visit = |operand: &AsmOperand| {
        collect_info(operand, &mut info);
    };
    for inst in instructions {
        for operand in inst
            .operands
            .iter()
            .chain(&inst.defines)
            .chain(&inst.uses)
            .chain(&inst.other)
        {
            visit(operand);
        }
    }
    info
}

fn collect_info(operand: &AsmOperand, info: &mut HashMap<usize, TempInfo>) {
    match operand {
        AsmOperand::Temp {
            id,
            align,
            size,
            hint,
        } => {
            let entry = info.entry(*id).or_insert(TempInfo {
                size: *size,
                align: *align,
                hint: *hint,
            });
            // keep the widest view of the temp seen anywhere
            entry.size = entry.size.max(*size);
            entry.align = entry.align.max(*align);
        }
        AsmOperand::Memory { base, index, .. } => {
            collect_info(base, info);
            if let Some((index, _)) = index {
                collect_info(index, info);
            }
        }
        _ => {}
    }
}

/// Temp ids in order of first appearance in the instruction stream.
fn first_appearance_order(instructions: &[AsmInstruction]) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for inst in instructions {
        for operand in inst
            .operands
            .iter()
            .chain(&inst.defines)
            .chain(&inst.uses)
            .chain(&inst.other)
        {
            let mut temps = HashSet::new();
            operand.collect_temps(&mut temps);
            let mut sorted: Vec<usize> = temps.into_iter().collect();
            sorted.sort_unstable();
            for id in sorted {
                if seen.insert(id) {
                    order.push(id);
                }
            }
        }
    }
    order
}

fn first_appearance_mem_temps(
    instructions: &[AsmInstruction],
    info: &HashMap<usize, TempInfo>,
) -> Vec<(usize, TempInfo)> {
    first_appearance_order(instructions)
        .into_iter()
        .filter_map(|id| {
            info.get(&id)
                .filter(|i| i.hint == AllocHint::Mem)
                .map(|i| (id, *i))
        })
        .collect()
}

/// Rewrites every reference to an uncolorable temp through a fresh stack
/// slot: loads before uses, stores after definitions.
fn rewrite_spill(instructions: &mut Vec<AsmInstruction>, spilled: usize, next_id: &mut usize) {
    let info = collect_temp_info(instructions)
        .get(&spilled)
        .copied()
        .expect("spilled temp appears in the stream");
    debug!(temp = spilled, "spilling");

    // the slot is a fresh stack-resident temp; frame layout places it
    let slot_id = *next_id;
    *next_id += 1;
    let slot = AsmOperand::Temp {
        id: slot_id,
        align: info.align,
        size: info.size,
        hint: AllocHint::Mem,
    };
    let slot_mem = AsmOperand::Memory {
        base: Box::new(slot),
        index: None,
        disp: 0,
        size: info.size,
    };
    let mov = if info.hint == AllocHint::Fp {
        if info.size == 4 {
            "\tmovss %d, %u\n"
        } else {
            "\tmovsd %d, %u\n"
        }
    } else {
        "\tmov %d, %u\n"
    };

    let old = std::mem::take(instructions);
    for mut inst in old {
        let defines_spilled = inst
            .defines
            .iter()
            .filter_map(AsmOperand::temp_id)
            .any(|d| d == spilled);
        let mut read = HashSet::new();
        for operand in inst.uses.iter().chain(&inst.other) {
            operand.collect_temps(&mut read);
        }
        let reads_spilled = read.contains(&spilled);

        if !reads_spilled && !defines_spilled {
            instructions.push(inst);
            continue;
        }

        let fresh = *next_id;
        *next_id += 1;
        let replacement = AsmOperand::Temp {
            id: fresh,
            align: info.align,
            size: info.size,
            hint: info.hint,
        };
        for operand in inst
            .operands
            .iter_mut()
            .chain(inst.defines.iter_mut())
            .chain(inst.uses.iter_mut())
            .chain(inst.other.iter_mut())
        {
            rename_temp(operand, spilled, fresh);
        }
        if reads_spilled {
            instructions.push(
                AsmInstruction::regular(mov)
                    .kind(AsmInstrKind::Move)
                    .operand(replacement.clone())
                    .operand(slot_mem.clone())
                    .def(replacement.clone())
                    .use_(slot_mem.clone()),
            );
        }
        instructions.push(inst);
        if defines_spilled {
            instructions.push(
                AsmInstruction::regular(mov)
                    .kind(AsmInstrKind::Move)
                    .operand(slot_mem.clone())
                    .operand(replacement.clone())
                    .use_(replacement)
                    .use_(slot_mem.clone()),
            );
        }
    }
}

fn rename_temp(operand: &mut AsmOperand, from: usize, to: usize) {
    match operand {
        AsmOperand::Temp { id, .. } if *id == from => *id = to,
        AsmOperand::Memory { base, index, .. } => {
            rename_temp(base, from, to);
            if let Some((index, _)) = index {
                rename_temp(index, from, to);
            }
        }
        _ => {}
    }
}

/// Replaces a temp operand with its chosen register or its stack slot.
fn substitute(
    operand: &mut AsmOperand,
    colors: &BTreeMap<usize, Register>,
    slots: &HashMap<usize, i64>,
) {
    match operand {
        AsmOperand::Temp { id, size, .. } => {
            if let Some(reg) = colors.get(id) {
                *operand = AsmOperand::Reg {
                    reg: *reg,
                    size: *size,
                };
            } else if let Some(disp) = slots.get(id) {
                *operand = AsmOperand::Memory {
                    base: Box::new(AsmOperand::reg(Register::Rbp, 8)),
                    index: None,
                    disp: *disp,
                    size: *size,
                };
            }
        }
        AsmOperand::Memory {
            base, index, disp, ..
        } => {
            // a stack-resident base folds into an rbp-relative address
            let base_temp = match base.as_ref() {
                AsmOperand::Temp { id, .. } => Some(*id),
                _ => None,
            };
            match base_temp {
                Some(id) => {
                    if let Some(slot_disp) = slots.get(&id).copied() {
                        *base = Box::new(AsmOperand::reg(Register::Rbp, 8));
                        *disp += slot_disp;
                    } else if let Some(reg) = colors.get(&id).copied() {
                        *base = Box::new(AsmOperand::Reg { reg, size: 8 });
                    }
                }
                None => substitute(base, colors, slots),
            }
            if let Some((index, _)) = index {
                substitute(index, colors, slots);
            }
        }
        _ => {}
    }
}

fn round_up(value: u64, multiple: u64) -> u64 {
    if multiple == 0 || value % multiple == 0 {
        value
    } else {
        value + multiple - value % multiple
    }
}
