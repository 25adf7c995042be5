//! Instruction selection: linear IR to abstract assembly.
//!
//! Every IR instruction maps to one or more [`AsmInstruction`]s. Binary
//! operations keep their three-operand shape and are marked for the arity
//! reducer; division, shifts, compares, and casts expand into their fixed
//! x86 sequences here. SSE immediates are materialized through fresh local
//! rodata pools.

use std::collections::HashMap;

use tracing::debug;

use ternc_ir::{Datum, Frag, IROperator, Instruction, LabelRef, Operand};
use ternc_types::AllocHint;

use crate::context::FileEntry;
use crate::x86_64::abi::CALLER_SAVE;
use crate::x86_64::asm::{
    AsmFile, AsmFrag, AsmInstrKind, AsmInstruction, AsmOperand, ReduceRule, Register,
};
use crate::x86_64::emit;

/// Selects abstract assembly for every fragment of a file, leaving the
/// result in `file.asm`. Fresh rodata pools created for SSE constants are
/// appended to the file's fragment list.
pub fn select(file: &mut FileEntry) {
    debug!(file = %file.name, "selecting instructions");
    let mut frags = std::mem::take(&mut file.frags);
    let mut pools: Vec<Frag> = Vec::new();

    // jump tables need their entries known for the allocator's flow graph
    let tables: HashMap<usize, Vec<usize>> = frags
        .iter()
        .filter_map(|f| match f {
            Frag::RoData { name, data, .. } => name.local().map(|id| {
                (
                    id,
                    data.iter()
                        .filter_map(|d| match d {
                            Datum::Local(l) => Some(*l),
                            _ => None,
                        })
                        .collect(),
                )
            }),
            _ => None,
        })
        .collect();

    enum Pending {
        Data(usize),
        Text(AsmFrag),
    }

    let mut pending = Vec::new();
    for (idx, frag) in frags.iter().enumerate() {
        match frag {
            Frag::Text { name, blocks } => {
                let mut selector = Selector {
                    out: Vec::new(),
                    next_id: &mut file.next_id,
                    pools: &mut pools,
                    outgoing: 0,
                    tables: &tables,
                };
                let block = blocks.first().expect("linear text frags hold one block");
                for inst in &block.instructions {
                    selector.instruction(inst);
                }
                let name = match name {
                    LabelRef::Global(name) => name.clone(),
                    LabelRef::Local(_) => unreachable!("text frags are global symbols"),
                };
                pending.push(Pending::Text(AsmFrag::Text {
                    header: format!(
                        "section .text\nglobal {name}:function ({name}.end - {name})\n{name}:\n"
                    ),
                    footer: format!("{name}.end:\n"),
                    instructions: selector.out,
                    outgoing_area: selector.outgoing,
                }));
            }
            _ => pending.push(Pending::Data(idx)),
        }
    }

    let original_len = frags.len();
    frags.append(&mut pools);
    let local_data_ids: std::collections::HashSet<usize> = frags
        .iter()
        .filter(|f| !f.is_text())
        .filter_map(|f| f.name().local())
        .collect();

    let mut asm = AsmFile {
        frags: Vec::new(),
        local_data_ids: local_data_ids.clone(),
    };
    for item in pending {
        match item {
            Pending::Data(idx) => {
                asm.frags.push(AsmFrag::Data(emit::render_data_frag(
                    &frags[idx],
                    &local_data_ids,
                )));
            }
            Pending::Text(frag) => asm.frags.push(frag),
        }
    }
    // constant pools created during selection land after the original frags
    for frag in &frags[original_len..] {
        asm.frags.push(AsmFrag::Data(emit::render_data_frag(
            frag,
            &local_data_ids,
        )));
    }
    file.frags = frags;
    file.asm = Some(asm);
}

struct Selector<'a> {
    out: Vec<AsmInstruction>,
    next_id: &'a mut usize,
    pools: &'a mut Vec<Frag>,
    outgoing: u64,
    tables: &'a HashMap<usize, Vec<usize>>,
}

impl<'a> Selector<'a> {
    fn fresh(&mut self) -> usize {
        let id = *self.next_id;
        *self.next_id += 1;
        id
    }

    fn fresh_temp(&mut self, size: u64, hint: AllocHint) -> AsmOperand {
        let id = self.fresh();
        AsmOperand::Temp {
            id,
            align: size,
            size,
            hint,
        }
    }

    fn pool(&mut self, align: u64, data: Vec<Datum>) -> usize {
        let id = self.fresh();
        self.pools.push(Frag::RoData {
            name: LabelRef::Local(id),
            align,
            data,
        });
        id
    }

    fn push(&mut self, inst: AsmInstruction) {
        self.out.push(inst);
    }

    /// Converts an IR operand into the abstract operand used as a value.
    /// Stack-resident temps become memory references through themselves.
    fn value(&mut self, ir: &Operand) -> AsmOperand {
        match ir {
            Operand::Temp {
                id,
                align,
                size,
                hint,
            } => {
                let temp = AsmOperand::Temp {
                    id: *id,
                    align: *align,
                    size: *size,
                    hint: *hint,
                };
                if *hint == AllocHint::Mem {
                    AsmOperand::mem(temp, 0, *size)
                } else {
                    temp
                }
            }
            Operand::Reg { id, size } => AsmOperand::Reg {
                reg: Register::from_index(*id),
                size: *size,
            },
            Operand::Constant { data, .. } => {
                let datum = single_datum(data);
                match datum {
                    Datum::Byte(v) => AsmOperand::Imm {
                        value: *v as u64,
                        size: 1,
                    },
                    Datum::Short(v) => AsmOperand::Imm {
                        value: *v as u64,
                        size: 2,
                    },
                    Datum::Int(v) => AsmOperand::Imm {
                        value: *v as u64,
                        size: 4,
                    },
                    Datum::Long(v) => AsmOperand::Imm { value: *v, size: 8 },
                    Datum::Local(id) => AsmOperand::LocalLabel(*id),
                    Datum::Global(name) => AsmOperand::GlobalLabel(name.clone()),
                    _ => unreachable!("constant operand holds a non-scalar datum"),
                }
            }
            Operand::Label(LabelRef::Local(id)) => AsmOperand::LocalLabel(*id),
            Operand::Label(LabelRef::Global(name)) => AsmOperand::GlobalLabel(name.clone()),
            Operand::Offset(v) => AsmOperand::Imm {
                value: *v as u64,
                size: 8,
            },
        }
    }

    /// The raw temp operand, without the stack-resident memory wrapping.
    fn raw_temp(&self, ir: &Operand) -> AsmOperand {
        match ir {
            Operand::Temp {
                id,
                align,
                size,
                hint,
            } => AsmOperand::Temp {
                id: *id,
                align: *align,
                size: *size,
                hint: *hint,
            },
            _ => unreachable!("expected a temp operand"),
        }
    }

    /// Builds the memory operand `[addr + offset]` for mem loads/stores.
    fn memory(&mut self, addr: &Operand, offset: &Operand, size: u64) -> AsmOperand {
        let base = match addr {
            Operand::Temp { .. } => self.raw_temp(addr),
            Operand::Reg { id, size } => AsmOperand::Reg {
                reg: Register::from_index(*id),
                size: *size,
            },
            Operand::Label(LabelRef::Global(name)) => AsmOperand::GlobalLabel(name.clone()),
            Operand::Label(LabelRef::Local(id)) => AsmOperand::LocalLabel(*id),
            Operand::Constant { data, .. } => match single_datum(data) {
                Datum::Global(name) => AsmOperand::GlobalLabel(name.clone()),
                Datum::Local(id) => AsmOperand::LocalLabel(*id),
                _ => unreachable!("memory base constant is not a label"),
            },
            Operand::Offset(_) => unreachable!("memory base is never a bare offset"),
        };
        match offset {
            Operand::Offset(disp) => AsmOperand::Memory {
                base: Box::new(base),
                index: None,
                disp: *disp,
                size,
            },
            Operand::Constant { data, .. } => {
                let disp = match single_datum(data) {
                    Datum::Byte(v) => *v as i64,
                    Datum::Short(v) => *v as i64,
                    Datum::Int(v) => *v as i64,
                    Datum::Long(v) => *v as i64,
                    _ => unreachable!("memory offset constant is not an integer"),
                };
                AsmOperand::Memory {
                    base: Box::new(base),
                    index: None,
                    disp,
                    size,
                }
            }
            Operand::Temp { .. } => AsmOperand::Memory {
                base: Box::new(base),
                index: Some((Box::new(self.raw_temp(offset)), 1)),
                disp: 0,
                size,
            },
            Operand::Reg { id, size: rsize } => AsmOperand::Memory {
                base: Box::new(base),
                index: Some((
                    Box::new(AsmOperand::Reg {
                        reg: Register::from_index(*id),
                        size: *rsize,
                    }),
                    1,
                )),
                disp: 0,
                size,
            },
            Operand::Label(_) => unreachable!("memory offset is never a label"),
        }
    }

    /// A slice of a stack-resident temp: `[temp + offset]`.
    fn temp_slice(&mut self, temp: &Operand, offset: &Operand, size: u64) -> AsmOperand {
        let base = self.raw_temp(temp);
        match offset {
            Operand::Offset(disp) => AsmOperand::Memory {
                base: Box::new(base),
                index: None,
                disp: *disp,
                size,
            },
            Operand::Temp { .. } => AsmOperand::Memory {
                base: Box::new(base),
                index: Some((Box::new(self.raw_temp(offset)), 1)),
                disp: 0,
                size,
            },
            _ => unreachable!("temp slice offset is an offset or a temp"),
        }
    }

    /// Materializes an operand into a fresh GP temp if it is not already a
    /// register or temp (cmp and div want r/m operands).
    fn force_gp(&mut self, operand: AsmOperand, size: u64) -> AsmOperand {
        match operand {
            AsmOperand::Temp { .. } | AsmOperand::Reg { .. } => operand,
            other => {
                let temp = self.fresh_temp(size, AllocHint::Gp);
                self.push(
                    AsmInstruction::regular("\tmov %d, %u\n")
                        .kind(AsmInstrKind::Move)
                        .operand(temp.clone())
                        .operand(other.clone())
                        .def(temp.clone())
                        .use_(other),
                );
                temp
            }
        }
    }

    /// Materializes an SSE-class operand; float immediates go through a
    /// fresh rodata pool.
    fn force_fp(&mut self, operand: AsmOperand, size: u64) -> AsmOperand {
        match operand {
            AsmOperand::Temp { .. } | AsmOperand::Reg { .. } => operand,
            AsmOperand::Imm { value, .. } => {
                let datum = match size {
                    4 => Datum::Int(value as u32),
                    _ => Datum::Long(value),
                };
                let pool = self.pool(size, vec![datum]);
                let temp = self.fresh_temp(size, AllocHint::Fp);
                let src = AsmOperand::Memory {
                    base: Box::new(AsmOperand::LocalLabel(pool)),
                    index: None,
                    disp: 0,
                    size,
                };
                self.push(
                    AsmInstruction::regular(sse_mov(size))
                        .kind(AsmInstrKind::Move)
                        .operand(temp.clone())
                        .operand(src.clone())
                        .def(temp.clone())
                        .use_(src),
                );
                temp
            }
            other => other, // memory operands are fine as SSE sources
        }
    }

    /// A plain register-class move, choosing mov/movss/movsd. Aggregate
    /// widths degrade to a chunked memory copy.
    fn emit_move(&mut self, dst: AsmOperand, src: AsmOperand) {
        let size = operand_size(&dst);
        if size > 8 {
            self.emit_wide_copy(dst, src, size);
            return;
        }
        let sse = dst.is_sse_class() || src.is_sse_class();

        // SSE destinations cannot take immediates: pool them first
        let src = if sse {
            self.force_fp(src, size)
        } else {
            src
        };

        // x86 has no memory-to-memory mov
        let both_mem = matches!(dst, AsmOperand::Memory { .. })
            && matches!(src, AsmOperand::Memory { .. });
        let src = if both_mem {
            let scratch =
                self.fresh_temp(size, if sse { AllocHint::Fp } else { AllocHint::Gp });
            let mnemonic = if sse { sse_mov(size) } else { "\tmov %d, %u\n" };
            self.push(
                AsmInstruction::regular(mnemonic)
                    .kind(AsmInstrKind::Move)
                    .operand(scratch.clone())
                    .operand(src.clone())
                    .def(scratch.clone())
                    .use_(src),
            );
            scratch
        } else {
            src
        };

        // an immediate wider than 32 bits cannot go straight to memory
        let too_wide = matches!(dst, AsmOperand::Memory { .. })
            && matches!(&src, AsmOperand::Imm { value, .. }
                if i32::try_from(*value as i64).is_err());
        let src = if too_wide {
            self.force_gp(src, size)
        } else {
            src
        };

        let mnemonic = if sse { sse_mov(size) } else { "\tmov %d, %u\n" };
        let mut inst = AsmInstruction::regular(mnemonic)
            .kind(AsmInstrKind::Move)
            .operand(dst.clone())
            .operand(src.clone())
            .use_(src);
        // a store defines no temp; its address temps are uses
        inst = match &dst {
            AsmOperand::Memory { .. } => inst.use_(dst.clone()),
            _ => inst.def(dst.clone()),
        };
        self.push(inst);
    }

    /// Copies `size` bytes between two memory operands through GP scratch
    /// temps, eight bytes at a time.
    fn emit_wide_copy(&mut self, dst: AsmOperand, src: AsmOperand, size: u64) {
        let mut off = 0i64;
        let mut remaining = size;
        while remaining > 0 {
            let chunk = if remaining >= 8 {
                8
            } else if remaining >= 4 {
                4
            } else if remaining >= 2 {
                2
            } else {
                1
            };
            let s = narrow_memory(&src, off, chunk);
            let d = narrow_memory(&dst, off, chunk);
            let scratch = self.fresh_temp(chunk, AllocHint::Gp);
            self.push(
                AsmInstruction::regular("\tmov %d, %u\n")
                    .kind(AsmInstrKind::Move)
                    .operand(scratch.clone())
                    .operand(s.clone())
                    .def(scratch.clone())
                    .use_(s),
            );
            self.push(
                AsmInstruction::regular("\tmov %d, %u\n")
                    .kind(AsmInstrKind::Move)
                    .operand(d.clone())
                    .operand(scratch.clone())
                    .use_(scratch)
                    .use_(d),
            );
            off += chunk as i64;
            remaining -= chunk;
        }
    }

    // ----- the big dispatch -----

    fn instruction(&mut self, inst: &Instruction) {
        use IROperator::*;
        match inst.op {
            Nop | Uninit | Volatile => {}
            Label => {
                let id = inst.args[0].local_label().expect("labels are local");
                self.push(
                    AsmInstruction::regular("").kind(AsmInstrKind::Label { id }),
                );
            }
            Move => self.select_move(inst),
            Addrof => {
                let dst = self.value(&inst.args[0]);
                let src = self.raw_temp(&inst.args[1]);
                let slot = AsmOperand::Memory {
                    base: Box::new(src),
                    index: None,
                    disp: 0,
                    size: 8,
                };
                self.push(
                    AsmInstruction::regular("\tlea %d, %u\n")
                        .operand(dst.clone())
                        .operand(slot.clone())
                        .def(dst)
                        .use_(slot),
                );
            }
            MemStore => {
                let size = inst.args[1].value_size().unwrap_or(8);
                let dst = self.memory(&inst.args[0], &inst.args[2], size);
                let src = self.value(&inst.args[1]);
                self.emit_move(dst, src);
            }
            MemLoad => {
                let size = inst.args[0].value_size().unwrap_or(8);
                let src = self.memory(&inst.args[1], &inst.args[2], size);
                let dst = self.value(&inst.args[0]);
                self.emit_move(dst, src);
            }
            StkStore => {
                let offset = match &inst.args[0] {
                    Operand::Offset(v) => *v,
                    _ => unreachable!("stack stores use offset operands"),
                };
                let src = self.value(&inst.args[1]);
                let size = operand_size(&src);
                self.outgoing = self.outgoing.max(offset as u64 + size.max(8));
                let dst = AsmOperand::Memory {
                    base: Box::new(AsmOperand::reg(Register::Rsp, 8)),
                    index: None,
                    disp: offset,
                    size,
                };
                self.emit_move(dst, src);
            }
            StkLoad => {
                let offset = match &inst.args[1] {
                    Operand::Offset(v) => *v,
                    _ => unreachable!("stack loads use offset operands"),
                };
                let dst = self.value(&inst.args[0]);
                let size = operand_size(&dst);
                let src = AsmOperand::Memory {
                    base: Box::new(AsmOperand::reg(Register::Rbp, 8)),
                    index: None,
                    disp: offset,
                    size,
                };
                self.emit_move(dst, src);
            }
            OffsetStore => {
                let size = inst.args[1].value_size().unwrap_or(8);
                let dst = self.temp_slice(&inst.args[0], &inst.args[2], size);
                let src = self.value(&inst.args[1]);
                self.emit_move(dst, src);
            }
            OffsetLoad => {
                let size = inst.args[0].value_size().unwrap_or(8);
                let src = self.temp_slice(&inst.args[1], &inst.args[2], size);
                let dst = self.value(&inst.args[0]);
                self.emit_move(dst, src);
            }
            Add | Sub | And | Xor | Or => self.select_binop(inst),
            SMul | UMul => self.select_mul(inst),
            SDiv | UDiv | SMod | UMod => self.select_div(inst),
            FAdd | FSub | FMul | FDiv => self.select_fbinop(inst),
            FMod => self.select_fmod(inst),
            Sll | Slr | Sar => self.select_shift(inst),
            Neg | Not => {
                let mnemonic = if inst.op == Neg {
                    "\tneg %d\n"
                } else {
                    "\tnot %d\n"
                };
                let dst = self.value(&inst.args[0]);
                let src = self.value(&inst.args[1]);
                self.push(
                    AsmInstruction::regular(mnemonic)
                        .operand(dst.clone())
                        .operand(src.clone())
                        .def(dst)
                        .use_(src)
                        .reducible(ReduceRule::Unary),
                );
            }
            LNot => {
                let dst = self.value(&inst.args[0]);
                let src = self.value(&inst.args[1]);
                self.push(
                    AsmInstruction::regular("\txor %d, 1\n")
                        .operand(dst.clone())
                        .operand(src.clone())
                        .def(dst)
                        .use_(src)
                        .reducible(ReduceRule::Unary),
                );
            }
            FNeg => self.select_fneg(inst),
            L | Le | E | Ne | G | Ge | A | Ae | B | Be => self.select_compare(inst),
            Fl | Fle | Fe | Fne | Fg | Fge => self.select_fcompare(inst),
            Z | Nz => self.select_zero_test(inst),
            Fz | Fnz => self.select_fzero_test(inst),
            Sx | Zx | Trunc | U2F | S2F | FResize | F2I => self.select_cast(inst),
            Jump => {
                let target = inst.args[0].local_label().expect("jumps are local");
                self.push(
                    AsmInstruction::regular(format!("\tjmp L{target}\n"))
                        .kind(AsmInstrKind::Jump { target }),
                );
            }
            Jumptable => {
                let table = inst.args[1].local_label().expect("tables are local");
                let scrut = self.raw_temp(&inst.args[0]);
                let slot = AsmOperand::Memory {
                    base: Box::new(AsmOperand::LocalLabel(table)),
                    index: Some((Box::new(scrut.clone()), 8)),
                    disp: 0,
                    size: 8,
                };
                let targets = self
                    .tables
                    .get(&table)
                    .cloned()
                    .unwrap_or_default();
                self.push(
                    AsmInstruction::regular("\tjmp %u\n")
                        .kind(AsmInstrKind::JumpTable { targets })
                        .operand(slot.clone())
                        .use_(slot),
                );
            }
            op if op.is_one_arg_jump() => self.select_cond_jump(inst),
            Call => {
                let mut call = match &inst.args[0] {
                    Operand::Label(LabelRef::Global(name)) => {
                        AsmInstruction::regular(format!("\tcall {name}\n"))
                    }
                    Operand::Constant { data, .. } => match single_datum(data) {
                        Datum::Global(name) => {
                            AsmInstruction::regular(format!("\tcall {name}\n"))
                        }
                        _ => unreachable!("call target constant is not a symbol"),
                    },
                    Operand::Temp { .. } => {
                        let target = self.raw_temp(&inst.args[0]);
                        AsmInstruction::regular("\tcall %u\n")
                            .operand(target.clone())
                            .use_(target)
                    }
                    _ => unreachable!("invalid call target"),
                };
                for reg in CALLER_SAVE {
                    call = call.def(AsmOperand::reg(reg, 8));
                }
                self.push(call);
            }
            Return => {
                self.push(AsmInstruction::regular("").kind(AsmInstrKind::Leave));
            }
            _ => unreachable!("{} survived into instruction selection", inst.op),
        }
    }

    fn select_move(&mut self, inst: &Instruction) {
        let dst = self.value(&inst.args[0]);
        let src = self.value(&inst.args[1]);
        self.emit_move(dst, src);
    }

    fn select_binop(&mut self, inst: &Instruction) {
        let mnemonic = match inst.op {
            IROperator::Add => "\tadd %d, %u\n",
            IROperator::Sub => "\tsub %d, %u\n",
            IROperator::And => "\tand %d, %u\n",
            IROperator::Xor => "\txor %d, %u\n",
            IROperator::Or => "\tor %d, %u\n",
            _ => unreachable!(),
        };
        let rule = match inst.op {
            IROperator::Sub => ReduceRule::NonCommutative,
            _ => ReduceRule::Commutative,
        };
        let dst = self.value(&inst.args[0]);
        let lhs = self.value(&inst.args[1]);
        let rhs = self.value(&inst.args[2]);
        self.push(
            AsmInstruction::regular(mnemonic)
                .operand(dst.clone())
                .operand(lhs.clone())
                .operand(rhs.clone())
                .def(dst)
                .use_(lhs)
                .use_(rhs)
                .reducible(rule),
        );
    }

    fn select_mul(&mut self, inst: &Instruction) {
        let size = inst.args[0].value_size().unwrap_or(8);
        if size == 1 {
            // byte multiplies only exist in the one-operand rax form
            let lhs = self.value(&inst.args[1]);
            let rhs0 = self.value(&inst.args[2]);
            let rhs = self.force_gp(rhs0, 1);
            let al = AsmOperand::reg(Register::Rax, 1);
            self.emit_move(al.clone(), lhs);
            let mnemonic = if inst.op == IROperator::SMul {
                "\timul %u\n"
            } else {
                "\tmul %u\n"
            };
            self.push(
                AsmInstruction::regular(mnemonic)
                    .operand(rhs.clone())
                    .def(AsmOperand::reg(Register::Rax, 2))
                    .use_(rhs)
                    .use_(al.clone()),
            );
            let dst = self.value(&inst.args[0]);
            self.emit_move(dst, al);
            return;
        }
        // imul's two-operand form computes the same low bits either way
        let dst = self.value(&inst.args[0]);
        let lhs = self.value(&inst.args[1]);
        let rhs = self.value(&inst.args[2]);
        self.push(
            AsmInstruction::regular("\timul %d, %u\n")
                .operand(dst.clone())
                .operand(lhs.clone())
                .operand(rhs.clone())
                .def(dst)
                .use_(lhs)
                .use_(rhs)
                .reducible(ReduceRule::Commutative),
        );
    }

    fn select_div(&mut self, inst: &Instruction) {
        use IROperator::*;
        let signed = matches!(inst.op, SDiv | SMod);
        let wants_remainder = matches!(inst.op, SMod | UMod);
        let size = inst.args[0].value_size().unwrap_or(8);

        let lhs = self.value(&inst.args[1]);
        let rhs0 = self.value(&inst.args[2]);
        let rhs = self.force_gp(rhs0, size);

        if size == 1 {
            // dividend in ax via widening; quotient al, remainder ah
            let widen = if signed {
                "\tmovsx %d, %u\n"
            } else {
                "\tmovzx %d, %u\n"
            };
            let ax = AsmOperand::reg(Register::Rax, 2);
            let lhs = self.force_gp(lhs, 1);
            self.push(
                AsmInstruction::regular(widen)
                    .operand(ax.clone())
                    .operand(lhs.clone())
                    .def(ax.clone())
                    .use_(lhs),
            );
            let mnemonic = if signed { "\tidiv %u\n" } else { "\tdiv %u\n" };
            self.push(
                AsmInstruction::regular(mnemonic)
                    .operand(rhs.clone())
                    .def(ax.clone())
                    .use_(rhs)
                    .use_(ax.clone()),
            );
            let dst = self.value(&inst.args[0]);
            if wants_remainder {
                self.push(
                    AsmInstruction::regular("\tmov %d, ah\n")
                        .operand(dst.clone())
                        .def(dst)
                        .use_(ax),
                );
            } else {
                self.emit_move(dst, AsmOperand::reg(Register::Rax, 1));
            }
            return;
        }

        let rax = AsmOperand::reg(Register::Rax, size);
        let rdx = AsmOperand::reg(Register::Rdx, size);
        self.emit_move(rax.clone(), lhs);
        if signed {
            let extend = match size {
                2 => "\tcwd\n",
                4 => "\tcdq\n",
                _ => "\tcqo\n",
            };
            self.push(
                AsmInstruction::regular(extend)
                    .def(rdx.clone())
                    .use_(rax.clone()),
            );
        } else {
            self.push(
                AsmInstruction::regular("\txor %d, %u\n")
                    .operand(AsmOperand::reg(Register::Rdx, 4))
                    .operand(AsmOperand::reg(Register::Rdx, 4))
                    .def(rdx.clone()),
            );
        }
        let mnemonic = if signed { "\tidiv %u\n" } else { "\tdiv %u\n" };
        self.push(
            AsmInstruction::regular(mnemonic)
                .operand(rhs.clone())
                .def(rax.clone())
                .def(rdx.clone())
                .use_(rhs)
                .use_(rax.clone())
                .use_(rdx.clone()),
        );
        let dst = self.value(&inst.args[0]);
        let result = if wants_remainder { rdx } else { rax };
        self.emit_move(dst, result);
    }

    fn select_fbinop(&mut self, inst: &Instruction) {
        let size = inst.args[0].value_size().unwrap_or(8);
        let mnemonic = match (inst.op, size) {
            (IROperator::FAdd, 4) => "\taddss %d, %u\n",
            (IROperator::FAdd, _) => "\taddsd %d, %u\n",
            (IROperator::FSub, 4) => "\tsubss %d, %u\n",
            (IROperator::FSub, _) => "\tsubsd %d, %u\n",
            (IROperator::FMul, 4) => "\tmulss %d, %u\n",
            (IROperator::FMul, _) => "\tmulsd %d, %u\n",
            (IROperator::FDiv, 4) => "\tdivss %d, %u\n",
            (IROperator::FDiv, _) => "\tdivsd %d, %u\n",
            _ => unreachable!(),
        };
        let rule = match inst.op {
            IROperator::FAdd | IROperator::FMul => ReduceRule::Commutative,
            _ => ReduceRule::NonCommutative,
        };
        let dst = self.value(&inst.args[0]);
        let lhs0 = self.value(&inst.args[1]);
        let rhs0 = self.value(&inst.args[2]);
        let lhs = self.force_fp(lhs0, size);
        let rhs = self.force_fp(rhs0, size);
        self.push(
            AsmInstruction::regular(mnemonic)
                .operand(dst.clone())
                .operand(lhs.clone())
                .operand(rhs.clone())
                .def(dst)
                .use_(lhs)
                .use_(rhs)
                .reducible(rule),
        );
    }

    /// `fmod` has no SSE encoding; the libm routine computes it with the
    /// operands in the usual SSE argument registers.
    fn select_fmod(&mut self, inst: &Instruction) {
        let size = inst.args[0].value_size().unwrap_or(8);
        let lhs0 = self.value(&inst.args[1]);
        let rhs0 = self.value(&inst.args[2]);
        let lhs = self.force_fp(lhs0, size);
        let rhs = self.force_fp(rhs0, size);
        self.emit_move(AsmOperand::reg(Register::Xmm0, size), lhs);
        self.emit_move(AsmOperand::reg(Register::Xmm1, size), rhs);
        let callee = if size == 4 { "fmodf" } else { "fmod" };
        let mut call = AsmInstruction::regular(format!("\tcall {callee}\n"));
        for reg in CALLER_SAVE {
            call = call.def(AsmOperand::reg(reg, 8));
        }
        self.push(call);
        let dst = self.value(&inst.args[0]);
        self.emit_move(dst, AsmOperand::reg(Register::Xmm0, size));
    }

    fn select_shift(&mut self, inst: &Instruction) {
        let mnemonic_reg = match inst.op {
            IROperator::Sll => "\tshl %d, cl\n",
            IROperator::Slr => "\tshr %d, cl\n",
            IROperator::Sar => "\tsar %d, cl\n",
            _ => unreachable!(),
        };
        let mnemonic_imm = match inst.op {
            IROperator::Sll => "\tshl %d, %u\n",
            IROperator::Slr => "\tshr %d, %u\n",
            IROperator::Sar => "\tsar %d, %u\n",
            _ => unreachable!(),
        };
        let dst = self.value(&inst.args[0]);
        let lhs = self.value(&inst.args[1]);
        let count = self.value(&inst.args[2]);
        match count {
            AsmOperand::Imm { value, .. } => {
                self.push(
                    AsmInstruction::regular(mnemonic_imm)
                        .operand(dst.clone())
                        .operand(lhs.clone())
                        .operand(AsmOperand::Imm {
                            value: value & 0x3f,
                            size: 1,
                        })
                        .def(dst)
                        .use_(lhs)
                        .reducible(ReduceRule::NonCommutative),
                );
            }
            count => {
                let cl = AsmOperand::reg(Register::Rcx, 1);
                let count = resize(count, 1);
                self.emit_move(cl.clone(), count);
                self.push(
                    AsmInstruction::regular(mnemonic_reg)
                        .operand(dst.clone())
                        .operand(lhs.clone())
                        .def(dst)
                        .use_(lhs)
                        .use_(cl)
                        .reducible(ReduceRule::Unary),
                );
            }
        }
    }

    fn select_fneg(&mut self, inst: &Instruction) {
        let size = inst.args[0].value_size().unwrap_or(8);
        let dst = self.value(&inst.args[0]);
        let src0 = self.value(&inst.args[1]);
        let src = self.force_fp(src0, size);
        self.emit_move(dst.clone(), src);
        // flip the sign bit with a 16-byte xorps/xorpd mask
        let (mask, mnemonic) = if size == 4 {
            (
                vec![
                    Datum::Int(0x8000_0000),
                    Datum::Int(0),
                    Datum::Int(0),
                    Datum::Int(0),
                ],
                "\txorps %d, %u\n",
            )
        } else {
            (
                vec![Datum::Long(0x8000_0000_0000_0000), Datum::Long(0)],
                "\txorpd %d, %u\n",
            )
        };
        let pool = self.pool(16, mask);
        let mask_op = AsmOperand::Memory {
            base: Box::new(AsmOperand::LocalLabel(pool)),
            index: None,
            disp: 0,
            size: 16,
        };
        self.push(
            AsmInstruction::regular(mnemonic)
                .operand(dst.clone())
                .operand(mask_op.clone())
                .def(dst.clone())
                .use_(dst)
                .use_(mask_op),
        );
    }

    fn select_compare(&mut self, inst: &Instruction) {
        let size = inst.args[1].value_size().unwrap_or(8);
        let lhs0 = self.value(&inst.args[1]);
        let lhs = self.force_gp(lhs0, size);
        let rhs = self.value(&inst.args[2]);
        self.push(
            AsmInstruction::regular("\tcmp %u, %u\n")
                .operand(lhs.clone())
                .operand(rhs.clone())
                .use_(lhs)
                .use_(rhs),
        );
        let dst = self.value(&inst.args[0]);
        let cc = condition_code(inst.op);
        self.push(
            AsmInstruction::regular(format!("\tset{cc} %d\n"))
                .operand(dst.clone())
                .def(dst),
        );
    }

    fn select_fcompare(&mut self, inst: &Instruction) {
        let size = inst.args[1].value_size().unwrap_or(8);
        let mnemonic = if size == 4 {
            "\tcomiss %u, %u\n"
        } else {
            "\tcomisd %u, %u\n"
        };
        let lhs0 = self.value(&inst.args[1]);
        let rhs0 = self.value(&inst.args[2]);
        let lhs = self.force_fp(lhs0, size);
        let lhs = match lhs {
            AsmOperand::Temp { .. } | AsmOperand::Reg { .. } => lhs,
            other => self.force_fp_reg(other, size),
        };
        let rhs = self.force_fp(rhs0, size);
        self.push(
            AsmInstruction::regular(mnemonic)
                .operand(lhs.clone())
                .operand(rhs.clone())
                .use_(lhs)
                .use_(rhs),
        );
        let dst = self.value(&inst.args[0]);
        let cc = condition_code(inst.op);
        self.push(
            AsmInstruction::regular(format!("\tset{cc} %d\n"))
                .operand(dst.clone())
                .def(dst),
        );
    }

    /// Loads an SSE memory operand into a fresh FP temp; comis wants its
    /// first operand in a register.
    fn force_fp_reg(&mut self, operand: AsmOperand, size: u64) -> AsmOperand {
        let temp = self.fresh_temp(size, AllocHint::Fp);
        self.push(
            AsmInstruction::regular(sse_mov(size))
                .kind(AsmInstrKind::Move)
                .operand(temp.clone())
                .operand(operand.clone())
                .def(temp.clone())
                .use_(operand),
        );
        temp
    }

    fn select_zero_test(&mut self, inst: &Instruction) {
        let size = inst.args[1].value_size().unwrap_or(8);
        let src0 = self.value(&inst.args[1]);
        let src = self.force_gp(src0, size);
        self.push(
            AsmInstruction::regular("\ttest %u, %u\n")
                .operand(src.clone())
                .operand(src.clone())
                .use_(src),
        );
        let dst = self.value(&inst.args[0]);
        let cc = if inst.op == IROperator::Z { "z" } else { "nz" };
        self.push(
            AsmInstruction::regular(format!("\tset{cc} %d\n"))
                .operand(dst.clone())
                .def(dst),
        );
    }

    fn select_fzero_test(&mut self, inst: &Instruction) {
        let size = inst.args[1].value_size().unwrap_or(8);
        let mnemonic = if size == 4 {
            "\tcomiss %u, %u\n"
        } else {
            "\tcomisd %u, %u\n"
        };
        let src0 = self.value(&inst.args[1]);
        let src = self.force_fp(src0, size);
        let zero = self.fresh_temp(size, AllocHint::Fp);
        self.push(
            AsmInstruction::regular("\txorps %d, %u\n")
                .operand(zero.clone())
                .operand(zero.clone())
                .def(zero.clone()),
        );
        self.push(
            AsmInstruction::regular(mnemonic)
                .operand(src.clone())
                .operand(zero.clone())
                .use_(src)
                .use_(zero),
        );
        let dst = self.value(&inst.args[0]);
        let cc = if inst.op == IROperator::Fz { "e" } else { "ne" };
        self.push(
            AsmInstruction::regular(format!("\tset{cc} %d\n"))
                .operand(dst.clone())
                .def(dst),
        );
    }

    fn select_cast(&mut self, inst: &Instruction) {
        use IROperator::*;
        let dst = self.value(&inst.args[0]);
        let src = self.value(&inst.args[1]);
        let dst_size = operand_size(&dst);
        let src_size = operand_size(&src);

        match inst.op {
            Sx => {
                if dst_size == src_size {
                    self.emit_move(dst, src);
                } else {
                    let mnemonic = if src_size == 4 && dst_size == 8 {
                        "\tmovsxd %d, %u\n"
                    } else {
                        "\tmovsx %d, %u\n"
                    };
                    let src = self.force_gp(src, src_size);
                    self.push(
                        AsmInstruction::regular(mnemonic)
                            .operand(dst.clone())
                            .operand(src.clone())
                            .def(dst)
                            .use_(src),
                    );
                }
            }
            Zx => {
                if dst_size == src_size {
                    self.emit_move(dst, src);
                } else if src_size == 4 && dst_size == 8 {
                    // a 32-bit mov zero-extends on its own; kept even when
                    // both sides share a register, since it clears the
                    // upper half
                    let narrow = resize(dst.clone(), 4);
                    let src = self.force_gp(src, src_size);
                    self.push(
                        AsmInstruction::regular("\tmov %d, %u\n")
                            .operand(narrow)
                            .operand(src.clone())
                            .def(dst)
                            .use_(src),
                    );
                } else {
                    let src = self.force_gp(src, src_size);
                    self.push(
                        AsmInstruction::regular("\tmovzx %d, %u\n")
                            .operand(dst.clone())
                            .operand(src.clone())
                            .def(dst)
                            .use_(src),
                    );
                }
            }
            Trunc => {
                let narrow_src = resize(src, dst_size);
                self.emit_move(dst, narrow_src);
            }
            U2F => {
                // zero-extend to a full register, then convert
                let src = self.force_gp(src, src_size);
                let wide = if src_size < 8 {
                    let wide = self.fresh_temp(8, AllocHint::Gp);
                    if src_size == 4 {
                        self.push(
                            AsmInstruction::regular("\tmov %d, %u\n")
                                .operand(resize(wide.clone(), 4))
                                .operand(src.clone())
                                .def(wide.clone())
                                .use_(src),
                        );
                    } else {
                        self.push(
                            AsmInstruction::regular("\tmovzx %d, %u\n")
                                .operand(wide.clone())
                                .operand(src.clone())
                                .def(wide.clone())
                                .use_(src),
                        );
                    }
                    wide
                } else {
                    src
                };
                let mnemonic = if dst_size == 4 {
                    "\tcvtsi2ss %d, %u\n"
                } else {
                    "\tcvtsi2sd %d, %u\n"
                };
                self.push(
                    AsmInstruction::regular(mnemonic)
                        .operand(dst.clone())
                        .operand(wide.clone())
                        .def(dst)
                        .use_(wide),
                );
            }
            S2F => {
                let src = self.force_gp(src, src_size);
                let src = if src_size < 4 {
                    let wide = self.fresh_temp(4, AllocHint::Gp);
                    self.push(
                        AsmInstruction::regular("\tmovsx %d, %u\n")
                            .operand(wide.clone())
                            .operand(src.clone())
                            .def(wide.clone())
                            .use_(src),
                    );
                    wide
                } else {
                    src
                };
                let mnemonic = if dst_size == 4 {
                    "\tcvtsi2ss %d, %u\n"
                } else {
                    "\tcvtsi2sd %d, %u\n"
                };
                self.push(
                    AsmInstruction::regular(mnemonic)
                        .operand(dst.clone())
                        .operand(src.clone())
                        .def(dst)
                        .use_(src),
                );
            }
            FResize => {
                let mnemonic = if dst_size == 8 {
                    "\tcvtss2sd %d, %u\n"
                } else {
                    "\tcvtsd2ss %d, %u\n"
                };
                let src = self.force_fp(src, src_size);
                self.push(
                    AsmInstruction::regular(mnemonic)
                        .operand(dst.clone())
                        .operand(src.clone())
                        .def(dst)
                        .use_(src),
                );
            }
            F2I => {
                let mnemonic = if src_size == 4 {
                    "\tcvttss2si %d, %u\n"
                } else {
                    "\tcvttsd2si %d, %u\n"
                };
                let src = self.force_fp(src, src_size);
                // the convert only writes 32- or 64-bit registers
                let wide_dst = resize(dst.clone(), dst_size.max(4));
                self.push(
                    AsmInstruction::regular(mnemonic)
                        .operand(wide_dst)
                        .operand(src.clone())
                        .def(dst)
                        .use_(src),
                );
            }
            _ => unreachable!(),
        }
    }

    fn select_cond_jump(&mut self, inst: &Instruction) {
        use IROperator::*;
        let target = inst.args[0].local_label().expect("jump targets are local");
        match inst.op {
            J1Z | J1Nz => {
                let size = inst.args[1].value_size().unwrap_or(8);
                let src0 = self.value(&inst.args[1]);
                let src = self.force_gp(src0, size);
                self.push(
                    AsmInstruction::regular("\ttest %u, %u\n")
                        .operand(src.clone())
                        .operand(src.clone())
                        .use_(src),
                );
                let cc = if inst.op == J1Z { "z" } else { "nz" };
                self.push(
                    AsmInstruction::regular(format!("\tj{cc} L{target}\n"))
                        .kind(AsmInstrKind::CJump { target }),
                );
            }
            J1Fz | J1Fnz => {
                let size = inst.args[1].value_size().unwrap_or(8);
                let mnemonic = if size == 4 {
                    "\tcomiss %u, %u\n"
                } else {
                    "\tcomisd %u, %u\n"
                };
                let src0 = self.value(&inst.args[1]);
                let src = self.force_fp(src0, size);
                let zero = self.fresh_temp(size, AllocHint::Fp);
                self.push(
                    AsmInstruction::regular("\txorps %d, %u\n")
                        .operand(zero.clone())
                        .operand(zero.clone())
                        .def(zero.clone()),
                );
                self.push(
                    AsmInstruction::regular(mnemonic)
                        .operand(src.clone())
                        .operand(zero.clone())
                        .use_(src)
                        .use_(zero),
                );
                let cc = if inst.op == J1Fz { "e" } else { "ne" };
                self.push(
                    AsmInstruction::regular(format!("\tj{cc} L{target}\n"))
                        .kind(AsmInstrKind::CJump { target }),
                );
            }
            J1Fl | J1Fle | J1Fe | J1Fne | J1Fg | J1Fge => {
                let size = inst.args[1].value_size().unwrap_or(8);
                let mnemonic = if size == 4 {
                    "\tcomiss %u, %u\n"
                } else {
                    "\tcomisd %u, %u\n"
                };
                let lhs0 = self.value(&inst.args[1]);
                let rhs0 = self.value(&inst.args[2]);
                let lhs = self.force_fp(lhs0, size);
                let lhs = match lhs {
                    AsmOperand::Temp { .. } | AsmOperand::Reg { .. } => lhs,
                    other => self.force_fp_reg(other, size),
                };
                let rhs = self.force_fp(rhs0, size);
                self.push(
                    AsmInstruction::regular(mnemonic)
                        .operand(lhs.clone())
                        .operand(rhs.clone())
                        .use_(lhs)
                        .use_(rhs),
                );
                let cc = condition_code(inst.op);
                self.push(
                    AsmInstruction::regular(format!("\tj{cc} L{target}\n"))
                        .kind(AsmInstrKind::CJump { target }),
                );
            }
            _ => {
                let size = inst.args[1].value_size().unwrap_or(8);
                let lhs0 = self.value(&inst.args[1]);
                let lhs = self.force_gp(lhs0, size);
                let rhs = self.value(&inst.args[2]);
                self.push(
                    AsmInstruction::regular("\tcmp %u, %u\n")
                        .operand(lhs.clone())
                        .operand(rhs.clone())
                        .use_(lhs)
                        .use_(rhs),
                );
                let cc = condition_code(inst.op);
                self.push(
                    AsmInstruction::regular(format!("\tj{cc} L{target}\n"))
                        .kind(AsmInstrKind::CJump { target }),
                );
            }
        }
    }
}

/// NASM condition-code suffix for a comparison operator; float compares
/// read `comis` flags, which look like unsigned compares.
fn condition_code(op: IROperator) -> &'static str {
    use IROperator::*;
    match op {
        L | J1L => "l",
        Le | J1Le => "le",
        E | J1E => "e",
        Ne | J1Ne => "ne",
        G | J1G => "g",
        Ge | J1Ge => "ge",
        A | J1A | Fg | J1Fg => "a",
        Ae | J1Ae | Fge | J1Fge => "ae",
        B | J1B | Fl | J1Fl => "b",
        Be | J1Be | Fle | J1Fle => "be",
        Fe | J1Fe => "e",
        Fne | J1Fne => "ne",
        _ => unreachable!("{op} has no condition code"),
    }
}

fn sse_mov(size: u64) -> &'static str {
    if size == 4 {
        "\tmovss %d, %u\n"
    } else {
        "\tmovsd %d, %u\n"
    }
}

fn single_datum(data: &[Datum]) -> &Datum {
    match data {
        [single] => single,
        _ => unreachable!("constant operands hold exactly one datum"),
    }
}

fn operand_size(op: &AsmOperand) -> u64 {
    match op {
        AsmOperand::Reg { size, .. }
        | AsmOperand::Temp { size, .. }
        | AsmOperand::Imm { size, .. }
        | AsmOperand::Memory { size, .. } => *size,
        AsmOperand::LocalLabel(_) | AsmOperand::GlobalLabel(_) => 8,
    }
}

/// The same memory operand shifted `extra` bytes in and narrowed.
fn narrow_memory(mem: &AsmOperand, extra: i64, size: u64) -> AsmOperand {
    match mem {
        AsmOperand::Memory {
            base, index, disp, ..
        } => AsmOperand::Memory {
            base: base.clone(),
            index: index.clone(),
            disp: disp + extra,
            size,
        },
        _ => unreachable!("aggregate values travel through memory"),
    }
}

/// The same operand at a different operating size.
fn resize(op: AsmOperand, size: u64) -> AsmOperand {
    match op {
        AsmOperand::Reg { reg, .. } => AsmOperand::Reg { reg, size },
        AsmOperand::Temp {
            id, align, hint, ..
        } => AsmOperand::Temp {
            id,
            align,
            size,
            hint,
        },
        AsmOperand::Imm { value, .. } => AsmOperand::Imm { value, size },
        AsmOperand::Memory {
            base, index, disp, ..
        } => AsmOperand::Memory {
            base,
            index,
            disp,
            size,
        },
        other => other,
    }
}
