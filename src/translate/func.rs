//! Function body lowering: blocked IR generation, ABI argument binding,
//! control-flow templates, and expression translation.

use tracing::debug;

use ternc_ir::instruction::{
    self, addrof, binop, bjump, call, cjump, jump, jumptable, mem_load, mem_store, mov,
    offset_load, offset_store, stk_load, stk_store, uninit, unop, volatile_use,
};
use ternc_ir::{Block, Datum, Frag, IROperator, Instruction, LabelRef, Operand};
use ternc_types::ast::{BinaryOp, Expr, ExprKind, Stmt, SwitchCase, UnaryOp};
use ternc_types::{AllocHint, SymbolId, SymbolKind, SymbolTable, Type, TypeKeyword};

use super::{mangle, round_up};
use crate::consts::{EIGHTBYTE, FIRST_OVERFLOW_ARG};
use crate::context::FileEntry;
use crate::x86_64::abi::{
    self, EightbyteClass, Passing, GP_ARG_REGS, GP_RETURN_REGS, SSE_ARG_REGS, SSE_RETURN_REGS,
};
use crate::x86_64::asm::Register;

/// An lvalue: where a store can land.
#[derive(Clone)]
enum Place {
    /// A whole temp (scalar register temp or stack-resident MEM temp).
    Temp { op: Operand, volatile: bool },
    /// A slice of a MEM temp at some offset.
    Field {
        base: Operand,
        offset: Operand,
        size: u64,
        align: u64,
        hint: AllocHint,
    },
    /// Memory through an address operand (pointer temp or label).
    Mem {
        addr: Operand,
        offset: i64,
        size: u64,
        align: u64,
        hint: AllocHint,
    },
}

struct Lowering<'a> {
    file: &'a mut FileEntry,
    symbols: &'a mut SymbolTable,
    blocks: Vec<Block>,
    current: Block,
    break_labels: Vec<usize>,
    continue_labels: Vec<usize>,
    exit_label: usize,
    ret_value: Option<Operand>,
    ret_addr: Option<Operand>,
}

fn is_void(ty: &Type) -> bool {
    matches!(ty.strip_cv(), Type::Keyword(TypeKeyword::Void))
}

pub(super) fn translate_function(
    symbol: SymbolId,
    params: &[SymbolId],
    body: &[Stmt],
    file: &mut FileEntry,
    symbols: &mut SymbolTable,
) {
    let entry = symbols.get(symbol);
    let name = mangle(&entry.module, &entry.name);
    let ret_ty = match &entry.kind {
        SymbolKind::Function { ret, .. } => ret.clone(),
        _ => unreachable!("function declaration resolved to a non-function"),
    };
    debug!(function = %name, "lowering");

    let exit_label = file.fresh();
    let mut lo = Lowering {
        file,
        symbols,
        blocks: Vec::new(),
        current: Block::new(0),
        break_labels: Vec::new(),
        continue_labels: Vec::new(),
        exit_label,
        ret_value: None,
        ret_addr: None,
    };

    lo.bind_arguments(&ret_ty, params);

    for stmt in body {
        lo.stmt(stmt);
    }
    // falling off the end of the body routes through the exit sequence
    let after = lo.fresh();
    lo.terminate(jump(exit_label), after);

    lo.emit_exit(&ret_ty);

    let blocks = lo.blocks;
    file.frags.push(Frag::Text {
        name: LabelRef::Global(name),
        blocks,
    });
}

impl<'a> Lowering<'a> {
    fn fresh(&mut self) -> usize {
        self.file.fresh()
    }

    fn emit(&mut self, i: Instruction) {
        self.current.push(i);
    }

    /// Ends the current block with `term` and opens a new one labelled
    /// `next`.
    fn terminate(&mut self, term: Instruction, next: usize) {
        self.current.push(term);
        let finished = std::mem::replace(&mut self.current, Block::new(next));
        self.blocks.push(finished);
    }

    fn temp_raw(&mut self, size: u64, align: u64, hint: AllocHint) -> Operand {
        let id = self.fresh();
        Operand::temp(id, align, size, hint)
    }

    fn temp_for(&mut self, ty: &Type) -> Operand {
        let size = ty.size_of(self.symbols);
        let align = ty.align_of(self.symbols);
        let hint = ty.allocation_hint(self.symbols);
        self.temp_raw(size, align, hint)
    }

    fn gp8(&mut self) -> Operand {
        self.temp_raw(8, 8, AllocHint::Gp)
    }

    /// The temp bound to a local variable, creating it on first use.
    fn var_temp(&mut self, symbol: SymbolId) -> Operand {
        let entry = self.symbols.get(symbol);
        let (ty, escapes, existing) = match &entry.kind {
            SymbolKind::Variable { ty, escapes, temp } => (ty.clone(), *escapes, *temp),
            _ => unreachable!("variable reference resolved to a non-variable"),
        };
        let size = ty.size_of(self.symbols);
        let align = ty.align_of(self.symbols);
        let hint = if escapes {
            AllocHint::Mem
        } else {
            ty.allocation_hint(self.symbols)
        };
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.fresh();
                self.symbols.assign_temp(symbol, id);
                id
            }
        };
        Operand::temp(id, align, size, hint)
    }

    /// Module-level variables carry their module path; everything local to
    /// a function body was registered without one.
    fn is_global(&self, symbol: SymbolId) -> bool {
        let entry = self.symbols.get(symbol);
        matches!(entry.kind, SymbolKind::Variable { .. }) && !entry.module.is_empty()
    }

    // ----- ABI entry / exit -----

    fn bind_arguments(&mut self, ret_ty: &Type, params: &[SymbolId]) {
        let mut gp = 0usize;
        let mut sse = 0usize;
        let mut incoming = FIRST_OVERFLOW_ARG;

        if !is_void(ret_ty) {
            if abi::classify(ret_ty, self.symbols) == Passing::Memory {
                let addr = self.gp8();
                self.emit(mov(addr.clone(), Operand::reg(Register::Rdi.index(), 8)));
                self.ret_addr = Some(addr);
                gp = 1;
            }
            let slot = self.temp_for(ret_ty);
            self.ret_value = Some(slot);
        }

        for &param in params {
            let temp = self.var_temp(param);
            let ty = self.symbols.get(param).variable_type().clone();
            let size = ty.size_of(self.symbols);
            match abi::classify(&ty, self.symbols) {
                Passing::Gp => {
                    if gp < GP_ARG_REGS.len() {
                        self.emit(mov(temp, Operand::reg(GP_ARG_REGS[gp].index(), size)));
                        gp += 1;
                    } else {
                        self.emit(stk_load(temp, Operand::offset(incoming)));
                        incoming += EIGHTBYTE as i64;
                    }
                }
                Passing::Sse => {
                    if sse < SSE_ARG_REGS.len() {
                        self.emit(mov(temp, Operand::reg(SSE_ARG_REGS[sse].index(), size)));
                        sse += 1;
                    } else {
                        self.emit(stk_load(temp, Operand::offset(incoming)));
                        incoming += EIGHTBYTE as i64;
                    }
                }
                Passing::Registers(classes) if self.classes_fit(&classes, gp, sse) => {
                    for (idx, class) in classes.iter().enumerate() {
                        let (reg, hint) = match class {
                            EightbyteClass::Integer => {
                                let r = GP_ARG_REGS[gp];
                                gp += 1;
                                (r, AllocHint::Gp)
                            }
                            EightbyteClass::Sse => {
                                let r = SSE_ARG_REGS[sse];
                                sse += 1;
                                (r, AllocHint::Fp)
                            }
                        };
                        let chunk = self.temp_raw(8, 8, hint);
                        self.emit(mov(chunk.clone(), Operand::reg(reg.index(), 8)));
                        self.emit(offset_store(
                            temp.clone(),
                            chunk,
                            Operand::offset((idx as u64 * EIGHTBYTE) as i64),
                        ));
                    }
                }
                Passing::Registers(_) | Passing::Memory => {
                    // stack-passed aggregate: copy into the local temp
                    let mut off = 0;
                    while off < size {
                        let chunk_size = chunk_size(size - off);
                        let chunk = self.temp_raw(chunk_size, chunk_size, AllocHint::Gp);
                        self.emit(stk_load(
                            chunk.clone(),
                            Operand::offset(incoming + off as i64),
                        ));
                        self.emit(offset_store(
                            temp.clone(),
                            chunk,
                            Operand::offset(off as i64),
                        ));
                        off += chunk_size;
                    }
                    incoming += round_up(size, EIGHTBYTE) as i64;
                }
            }
        }
    }

    fn classes_fit(&self, classes: &[EightbyteClass], gp: usize, sse: usize) -> bool {
        let need_gp = classes
            .iter()
            .filter(|c| **c == EightbyteClass::Integer)
            .count();
        let need_sse = classes.len() - need_gp;
        gp + need_gp <= GP_ARG_REGS.len() && sse + need_sse <= SSE_ARG_REGS.len()
    }

    fn emit_exit(&mut self, ret_ty: &Type) {
        self.current = Block::new(self.exit_label);

        if let Some(value) = self.ret_value.clone() {
            let size = ret_ty.size_of(self.symbols);
            match abi::classify(ret_ty, self.symbols) {
                Passing::Gp => {
                    self.emit(mov(Operand::reg(Register::Rax.index(), size), value));
                }
                Passing::Sse => {
                    self.emit(mov(Operand::reg(Register::Xmm0.index(), size), value));
                }
                Passing::Registers(classes) => {
                    let mut gp = 0;
                    let mut sse = 0;
                    for (idx, class) in classes.iter().enumerate() {
                        let (reg, hint) = match class {
                            EightbyteClass::Integer => {
                                let r = GP_RETURN_REGS[gp];
                                gp += 1;
                                (r, AllocHint::Gp)
                            }
                            EightbyteClass::Sse => {
                                let r = SSE_RETURN_REGS[sse];
                                sse += 1;
                                (r, AllocHint::Fp)
                            }
                        };
                        let chunk = self.temp_raw(8, 8, hint);
                        self.emit(offset_load(
                            chunk.clone(),
                            value.clone(),
                            Operand::offset((idx as u64 * EIGHTBYTE) as i64),
                        ));
                        self.emit(mov(Operand::reg(reg.index(), 8), chunk));
                    }
                }
                Passing::Memory => {
                    let addr = self.ret_addr.clone().expect("memory return binds rdi");
                    let mut off = 0;
                    while off < size {
                        let chunk_size = chunk_size(size - off);
                        let chunk = self.temp_raw(chunk_size, chunk_size, AllocHint::Gp);
                        self.emit(offset_load(
                            chunk.clone(),
                            value.clone(),
                            Operand::offset(off as i64),
                        ));
                        self.emit(mem_store(addr.clone(), chunk, Operand::offset(off as i64)));
                        off += chunk_size;
                    }
                    self.emit(mov(Operand::reg(Register::Rax.index(), 8), addr));
                }
            }
        }
        self.current.push(instruction::ret());
        let exit = std::mem::replace(&mut self.current, Block::new(usize::MAX));
        self.blocks.push(exit);
    }

    // ----- statements -----

    fn stmt(&mut self, s: &Stmt) {
        match s {
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.stmt(s);
                }
            }
            Stmt::VarDef { symbol, init } => {
                let temp = self.var_temp(*symbol);
                let ty = self.symbols.get(*symbol).variable_type().clone();
                let volatile = ty.is_volatile();
                match init {
                    Some(expr) => {
                        self.store_into(Place::Temp { op: temp, volatile }, &ty, expr);
                    }
                    None => self.emit(uninit(temp)),
                }
            }
            Stmt::Expr(e) => {
                self.rvalue(e);
            }
            Stmt::If { cond, then, els } => {
                let then_l = self.fresh();
                let end_l = self.fresh();
                match els {
                    None => {
                        self.cond_jump(cond, then_l, end_l, then_l);
                        self.stmt(then);
                        self.terminate(jump(end_l), end_l);
                    }
                    Some(els) => {
                        let else_l = self.fresh();
                        self.cond_jump(cond, then_l, else_l, then_l);
                        self.stmt(then);
                        self.terminate(jump(end_l), else_l);
                        self.stmt(els);
                        self.terminate(jump(end_l), end_l);
                    }
                }
            }
            Stmt::While { cond, body } => {
                let header = self.fresh();
                let body_l = self.fresh();
                let exit = self.fresh();
                self.terminate(jump(header), header);
                self.cond_jump(cond, body_l, exit, body_l);
                self.break_labels.push(exit);
                self.continue_labels.push(header);
                self.stmt(body);
                self.break_labels.pop();
                self.continue_labels.pop();
                self.terminate(jump(header), exit);
            }
            Stmt::DoWhile { body, cond } => {
                let body_l = self.fresh();
                let test_l = self.fresh();
                let exit = self.fresh();
                self.terminate(jump(body_l), body_l);
                self.break_labels.push(exit);
                self.continue_labels.push(test_l);
                self.stmt(body);
                self.break_labels.pop();
                self.continue_labels.pop();
                self.terminate(jump(test_l), test_l);
                self.cond_jump(cond, body_l, exit, exit);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init);
                }
                let header = self.fresh();
                let body_l = self.fresh();
                let step_l = self.fresh();
                let exit = self.fresh();
                self.terminate(jump(header), header);
                self.cond_jump(cond, body_l, exit, body_l);
                self.break_labels.push(exit);
                self.continue_labels.push(step_l);
                self.stmt(body);
                self.break_labels.pop();
                self.continue_labels.pop();
                self.terminate(jump(step_l), step_l);
                if let Some(step) = step {
                    self.rvalue(step);
                }
                self.terminate(jump(header), exit);
            }
            Stmt::Switch { scrutinee, cases } => self.stmt_switch(scrutinee, cases),
            Stmt::Break => {
                let target = *self.break_labels.last().expect("break outside loop");
                let dead = self.fresh();
                self.terminate(jump(target), dead);
            }
            Stmt::Continue => {
                let target = *self.continue_labels.last().expect("continue outside loop");
                let dead = self.fresh();
                self.terminate(jump(target), dead);
            }
            Stmt::Return(value) => {
                if let Some(expr) = value {
                    let v = self.rvalue(expr);
                    let slot = self
                        .ret_value
                        .clone()
                        .expect("value return in void function");
                    self.emit(mov(slot, v));
                }
                let dead = self.fresh();
                let exit = self.exit_label;
                self.terminate(jump(exit), dead);
            }
        }
    }

    fn stmt_switch(&mut self, scrutinee: &Expr, cases: &[SwitchCase]) {
        let scrut = self.rvalue(scrutinee);
        let scrut_size = scrutinee.ty.size_of(self.symbols);
        let exit = self.fresh();

        let case_labels: Vec<usize> = cases.iter().map(|_| self.file.fresh()).collect();
        let first_body = case_labels.first().copied().unwrap_or(exit);
        let default_label = cases
            .iter()
            .position(|c| c.default)
            .map(|idx| case_labels[idx])
            .unwrap_or(exit);

        // (value, body label) pairs in source order
        let mut targets: Vec<(i64, usize)> = Vec::new();
        for (case, &label) in cases.iter().zip(&case_labels) {
            for &value in &case.values {
                targets.push((value, label));
            }
        }

        let bounds = targets
            .iter()
            .map(|(v, _)| *v)
            .fold(None, |acc: Option<(i64, i64)>, v| match acc {
                None => Some((v, v)),
                Some((min, max)) => Some((min.min(v), max.max(v))),
            });
        let dense = match bounds {
            Some((min, max)) => targets.len() >= 2 && (max - min + 1) as usize == targets.len(),
            None => false,
        };

        match bounds {
            Some((min, max)) if dense => {
                // idx = scrutinee - min, unsigned; anything above max - min
                // is out of range, including wrapped-under values
                let idx = self.temp_raw(scrut_size, scrut_size, AllocHint::Gp);
                self.emit(binop(
                    IROperator::Sub,
                    idx.clone(),
                    scrut,
                    int_constant(min as u64, scrut_size),
                ));
                let idx8 = if scrut_size < 8 {
                    let wide = self.gp8();
                    self.emit(unop(IROperator::Zx, wide.clone(), idx));
                    wide
                } else {
                    idx
                };
                let table_block = self.fresh();
                self.terminate(
                    cjump(
                        IROperator::J2A,
                        default_label,
                        table_block,
                        idx8.clone(),
                        int_constant((max - min) as u64, 8),
                    ),
                    table_block,
                );

                let table = self.fresh();
                let mut data = Vec::new();
                for value in min..=max {
                    let label = targets
                        .iter()
                        .find(|(v, _)| *v == value)
                        .map(|(_, l)| *l)
                        .expect("dense table has every value");
                    data.push(Datum::Local(label));
                }
                self.file.frags.push(Frag::RoData {
                    name: LabelRef::Local(table),
                    align: EIGHTBYTE,
                    data,
                });
                self.terminate(jumptable(idx8, table), first_body);
            }
            _ => {
                for (value, label) in &targets {
                    let next_test = self.fresh();
                    self.terminate(
                        cjump(
                            IROperator::J2E,
                            *label,
                            next_test,
                            scrut.clone(),
                            int_constant(*value as u64, scrut_size),
                        ),
                        next_test,
                    );
                }
                self.terminate(jump(default_label), first_body);
            }
        }

        // bodies, with C fallthrough into the next arm
        self.break_labels.push(exit);
        for (idx, case) in cases.iter().enumerate() {
            debug_assert_eq!(self.current.label, case_labels[idx]);
            for s in &case.body {
                self.stmt(s);
            }
            let next = case_labels.get(idx + 1).copied().unwrap_or(exit);
            self.terminate(jump(next), next);
        }
        self.break_labels.pop();
        debug_assert_eq!(self.current.label, exit);
    }

    // ----- conditions -----

    /// Lowers `e` as a branch condition with explicit true/false targets,
    /// then opens block `next` as current.
    fn cond_jump(&mut self, e: &Expr, true_l: usize, false_l: usize, next: usize) {
        match &e.kind {
            ExprKind::BoolLit(true) => {
                self.terminate(jump(true_l), next);
            }
            ExprKind::BoolLit(false) => {
                self.terminate(jump(false_l), next);
            }
            ExprKind::Unary {
                op: UnaryOp::LogNot,
                operand,
            } => self.cond_jump(operand, false_l, true_l, next),
            ExprKind::Binary {
                op: BinaryOp::LogAnd,
                lhs,
                rhs,
            } => {
                let mid = self.fresh();
                self.cond_jump(lhs, mid, false_l, mid);
                self.cond_jump(rhs, true_l, false_l, next);
            }
            ExprKind::Binary {
                op: BinaryOp::LogOr,
                lhs,
                rhs,
            } => {
                let mid = self.fresh();
                self.cond_jump(lhs, true_l, mid, mid);
                self.cond_jump(rhs, true_l, false_l, next);
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_comparison() => {
                let (_, j2) = self.comparison_ops(*op, &lhs.ty, &rhs.ty);
                let l = self.rvalue(lhs);
                let r = self.rvalue(rhs);
                self.terminate(cjump(j2, true_l, false_l, l, r), next);
            }
            _ => {
                let t = self.rvalue(e);
                self.terminate(bjump(IROperator::J2Nz, true_l, false_l, t), next);
            }
        }
    }

    /// Picks the value-comparison and jump operators from the merged
    /// comparison type: floats compare through `comis`, signed integers
    /// with the signed conditions, and everything else (unsigned integers,
    /// pointers, characters, booleans, enums) unsigned.
    fn comparison_ops(&self, op: BinaryOp, lhs: &Type, rhs: &Type) -> (IROperator, IROperator) {
        use IROperator::*;
        let merged = ternc_types::ty::comparison_merge(lhs, rhs, self.symbols);
        let float = merged.as_ref().map_or(false, Type::is_floating);
        let unsigned = !float
            && !merged
                .as_ref()
                .map_or(true, |t| t.is_signed_integral());
        if float {
            match op {
                BinaryOp::Lt => (Fl, J2Fl),
                BinaryOp::Le => (Fle, J2Fle),
                BinaryOp::Gt => (Fg, J2Fg),
                BinaryOp::Ge => (Fge, J2Fge),
                BinaryOp::Eq => (Fe, J2Fe),
                BinaryOp::Ne => (Fne, J2Fne),
                _ => unreachable!("non-comparison operator"),
            }
        } else if unsigned {
            match op {
                BinaryOp::Lt => (B, J2B),
                BinaryOp::Le => (Be, J2Be),
                BinaryOp::Gt => (A, J2A),
                BinaryOp::Ge => (Ae, J2Ae),
                BinaryOp::Eq => (E, J2E),
                BinaryOp::Ne => (Ne, J2Ne),
                _ => unreachable!("non-comparison operator"),
            }
        } else {
            match op {
                BinaryOp::Lt => (L, J2L),
                BinaryOp::Le => (Le, J2Le),
                BinaryOp::Gt => (G, J2G),
                BinaryOp::Ge => (Ge, J2Ge),
                BinaryOp::Eq => (E, J2E),
                BinaryOp::Ne => (Ne, J2Ne),
                _ => unreachable!("non-comparison operator"),
            }
        }
    }

    // ----- places -----

    fn place(&mut self, e: &Expr) -> Place {
        match &e.kind {
            ExprKind::Var(symbol) => {
                if self.is_global(*symbol) {
                    let entry = self.symbols.get(*symbol);
                    let label = mangle(&entry.module, &entry.name);
                    let ty = entry.variable_type().clone();
                    Place::Mem {
                        addr: Operand::global(label),
                        offset: 0,
                        size: ty.size_of(self.symbols),
                        align: ty.align_of(self.symbols),
                        hint: ty.allocation_hint(self.symbols),
                    }
                } else {
                    let volatile = self.symbols.get(*symbol).variable_type().is_volatile();
                    let op = self.var_temp(*symbol);
                    Place::Temp { op, volatile }
                }
            }
            ExprKind::Deref(inner) => {
                let addr = self.rvalue(inner);
                Place::Mem {
                    addr,
                    offset: 0,
                    size: e.ty.size_of(self.symbols),
                    align: e.ty.align_of(self.symbols),
                    hint: e.ty.allocation_hint(self.symbols),
                }
            }
            ExprKind::Index { base, index } => {
                let elem_size = e.ty.size_of(self.symbols);
                if base.ty.is_pointer() {
                    let addr = self.rvalue(base);
                    let combined = self.add_scaled(addr, index, elem_size);
                    Place::Mem {
                        addr: combined,
                        offset: 0,
                        size: elem_size,
                        align: e.ty.align_of(self.symbols),
                        hint: e.ty.allocation_hint(self.symbols),
                    }
                } else {
                    let base_place = self.place(base);
                    self.narrow_place(base_place, index, elem_size, &e.ty)
                }
            }
            ExprKind::Member { base, field } => {
                let offset = base.ty.struct_offset_of(field, self.symbols) as i64;
                let base_place = self.place(base);
                self.offset_place(base_place, offset, &e.ty.clone())
            }
            _ => unreachable!("expression is not an lvalue"),
        }
    }

    /// Narrows an aggregate place by a (possibly dynamic) scaled index.
    fn narrow_place(&mut self, base: Place, index: &Expr, elem_size: u64, elem_ty: &Type) -> Place {
        let size = elem_ty.size_of(self.symbols);
        let align = elem_ty.align_of(self.symbols);
        let hint = elem_ty.allocation_hint(self.symbols);
        if let ExprKind::IntLit(v) = &index.kind {
            return self.offset_place_raw(base, (*v * elem_size) as i64, size, align, hint);
        }
        match base {
            Place::Temp { op, .. } => {
                let scaled = self.scale_index(index, elem_size);
                Place::Field {
                    base: op,
                    offset: scaled,
                    size,
                    align,
                    hint,
                }
            }
            Place::Field { base, offset, .. } => {
                let scaled = self.scale_index(index, elem_size);
                let combined = self.gp8();
                self.emit(binop(IROperator::Add, combined.clone(), offset, scaled));
                Place::Field {
                    base,
                    offset: combined,
                    size,
                    align,
                    hint,
                }
            }
            Place::Mem { addr, offset, .. } => {
                let scaled = self.scale_index(index, elem_size);
                let combined = self.gp8();
                self.emit(binop(IROperator::Add, combined.clone(), addr, scaled));
                Place::Mem {
                    addr: combined,
                    offset,
                    size,
                    align,
                    hint,
                }
            }
        }
    }

    fn offset_place(&mut self, base: Place, offset: i64, ty: &Type) -> Place {
        let size = ty.size_of(self.symbols);
        let align = ty.align_of(self.symbols);
        let hint = ty.allocation_hint(self.symbols);
        self.offset_place_raw(base, offset, size, align, hint)
    }

    fn offset_place_raw(
        &mut self,
        base: Place,
        extra: i64,
        size: u64,
        align: u64,
        hint: AllocHint,
    ) -> Place {
        match base {
            Place::Temp { op, .. } => Place::Field {
                base: op,
                offset: Operand::offset(extra),
                size,
                align,
                hint,
            },
            Place::Field { base, offset, .. } => match offset {
                Operand::Offset(prior) => Place::Field {
                    base,
                    offset: Operand::offset(prior + extra),
                    size,
                    align,
                    hint,
                },
                dynamic => {
                    let combined = self.gp8();
                    self.emit(binop(
                        IROperator::Add,
                        combined.clone(),
                        dynamic,
                        Operand::offset(extra),
                    ));
                    Place::Field {
                        base,
                        offset: combined,
                        size,
                        align,
                        hint,
                    }
                }
            },
            Place::Mem { addr, offset, .. } => Place::Mem {
                addr,
                offset: offset + extra,
                size,
                align,
                hint,
            },
        }
    }

    /// Evaluates `index * elem_size` into an eight-byte GP temp.
    fn scale_index(&mut self, index: &Expr, elem_size: u64) -> Operand {
        let idx = self.rvalue(index);
        let idx_size = index.ty.size_of(self.symbols);
        let wide = if idx_size < 8 {
            let wide = self.gp8();
            let widen = if index.ty.is_signed_integral() {
                IROperator::Sx
            } else {
                IROperator::Zx
            };
            self.emit(unop(widen, wide.clone(), idx));
            wide
        } else {
            idx
        };
        if elem_size == 1 {
            return wide;
        }
        let scaled = self.gp8();
        self.emit(binop(
            IROperator::SMul,
            scaled.clone(),
            wide,
            int_constant(elem_size, 8),
        ));
        scaled
    }

    fn load(&mut self, place: Place) -> Operand {
        match place {
            Place::Temp { op, .. } => op,
            Place::Field {
                base,
                offset,
                size,
                align,
                hint,
            } => {
                let dest = self.temp_raw(size, align, hint);
                self.emit(offset_load(dest.clone(), base, offset));
                dest
            }
            Place::Mem {
                addr,
                offset,
                size,
                align,
                hint,
            } => {
                let dest = self.temp_raw(size, align, hint);
                self.emit(mem_load(dest.clone(), addr, Operand::offset(offset)));
                dest
            }
        }
    }

    fn store(&mut self, place: Place, value: Operand) {
        match place {
            Place::Temp { op, volatile } => {
                self.emit(mov(op.clone(), value));
                if volatile {
                    self.emit(volatile_use(op));
                }
            }
            Place::Field { base, offset, .. } => {
                self.emit(offset_store(base, value, offset));
            }
            Place::Mem { addr, offset, .. } => {
                self.emit(mem_store(addr, value, Operand::offset(offset)));
            }
        }
    }

    /// Stores `expr` into `place` of declared type `ty`, laying aggregate
    /// literals out field by field.
    fn store_into(&mut self, place: Place, ty: &Type, expr: &Expr) {
        if let ExprKind::AggregateLit(members) = &expr.kind {
            let field_types = self.aggregate_field_types(ty);
            let mut offset = 0i64;
            for (field_ty, member) in field_types.iter().zip(members) {
                let aligned = round_up(offset as u64, field_ty.align_of(self.symbols)) as i64;
                let field_place = self.offset_place(place.clone(), aligned, field_ty);
                self.store_into(field_place, field_ty, member);
                offset = aligned + field_ty.size_of(self.symbols) as i64;
            }
            return;
        }
        let value = self.rvalue(expr);
        self.store(place, value);
    }

    /// Field types of an aggregate-initializable type, in layout order.
    fn aggregate_field_types(&self, ty: &Type) -> Vec<Type> {
        match ty.strip_cv() {
            Type::Array { length, base } => vec![(**base).clone(); *length as usize],
            Type::Aggregate { members } => members.clone(),
            Type::Reference(id) => match &self.symbols.get(*id).kind {
                SymbolKind::Struct { field_types, .. } => field_types.clone(),
                SymbolKind::Union { option_types, .. } => {
                    option_types.first().cloned().into_iter().collect()
                }
                SymbolKind::Typedef { actual } => self.aggregate_field_types(actual),
                _ => unreachable!("aggregate literal for a non-aggregate type"),
            },
            _ => unreachable!("aggregate literal for a non-aggregate type"),
        }
    }

    // ----- expressions -----

    fn rvalue(&mut self, e: &Expr) -> Operand {
        match &e.kind {
            ExprKind::IntLit(v) => int_constant(*v, e.ty.size_of(self.symbols)),
            ExprKind::BoolLit(v) => int_constant(*v as u64, 1),
            ExprKind::CharLit(v) => int_constant(*v as u64, 1),
            ExprKind::WCharLit(v) => int_constant(*v as u64, 4),
            ExprKind::NullLit => int_constant(0, 8),
            ExprKind::FloatLit(v) => {
                let size = e.ty.size_of(self.symbols);
                match size {
                    4 => Operand::constant(4, Datum::Int((*v as f32).to_bits())),
                    _ => Operand::constant(8, Datum::Long(v.to_bits())),
                }
            }
            ExprKind::StringLit(bytes) => {
                let id = super::pool_string(Datum::String(bytes.clone()), 1, self.file);
                Operand::constant(8, Datum::Local(id))
            }
            ExprKind::WStringLit(chars) => {
                let id = super::pool_string(Datum::WString(chars.clone()), 4, self.file);
                Operand::constant(8, Datum::Local(id))
            }
            ExprKind::EnumConst(symbol) => {
                let (value, backing_size) = match &self.symbols.get(*symbol).kind {
                    SymbolKind::EnumConst { parent, value } => {
                        let size = Type::Reference(*parent).size_of(self.symbols);
                        (*value, size)
                    }
                    _ => unreachable!("enum constant resolved elsewhere"),
                };
                int_constant(value as u64, backing_size)
            }
            ExprKind::FuncRef(symbol) => {
                let entry = self.symbols.get(*symbol);
                Operand::constant(8, Datum::Global(mangle(&entry.module, &entry.name)))
            }
            ExprKind::AggregateLit(_) => {
                let temp = self.temp_for(&e.ty);
                let ty = e.ty.clone();
                self.store_into(
                    Place::Temp {
                        op: temp.clone(),
                        volatile: false,
                    },
                    &ty,
                    e,
                );
                temp
            }
            ExprKind::Var(_)
            | ExprKind::Index { .. }
            | ExprKind::Member { .. }
            | ExprKind::Deref(_) => {
                let place = self.place(e);
                self.load(place)
            }
            ExprKind::Unary { op, operand } => {
                let src = self.rvalue(operand);
                let dest = self.temp_for(&e.ty);
                let ir_op = match op {
                    UnaryOp::Neg if e.ty.is_floating() => IROperator::FNeg,
                    UnaryOp::Neg => IROperator::Neg,
                    UnaryOp::BitNot => IROperator::Not,
                    UnaryOp::LogNot => IROperator::LNot,
                };
                self.emit(unop(ir_op, dest.clone(), src));
                dest
            }
            ExprKind::Binary { op, lhs, rhs } => self.rvalue_binary(e, *op, lhs, rhs),
            ExprKind::Assign { target, value } => {
                let v = self.rvalue(value);
                let place = self.place(target);
                self.store(place, v.clone());
                v
            }
            ExprKind::Ternary { cond, then, els } => {
                let dest = self.temp_for(&e.ty);
                let then_l = self.fresh();
                let else_l = self.fresh();
                let end_l = self.fresh();
                self.cond_jump(cond, then_l, else_l, then_l);
                let tv = self.rvalue(then);
                self.emit(mov(dest.clone(), tv));
                self.terminate(jump(end_l), else_l);
                let ev = self.rvalue(els);
                self.emit(mov(dest.clone(), ev));
                self.terminate(jump(end_l), end_l);
                dest
            }
            ExprKind::AddrOf(inner) => {
                let dest = self.gp8();
                match self.place(inner) {
                    Place::Temp { op, .. } => {
                        self.emit(addrof(dest.clone(), op));
                    }
                    Place::Field { base, offset, .. } => {
                        self.emit(addrof(dest.clone(), base));
                        let combined = self.gp8();
                        self.emit(binop(IROperator::Add, combined.clone(), dest, offset));
                        return combined;
                    }
                    Place::Mem { addr, offset, .. } => {
                        if offset == 0 {
                            self.emit(mov(dest.clone(), addr));
                        } else {
                            self.emit(binop(
                                IROperator::Add,
                                dest.clone(),
                                addr,
                                Operand::offset(offset),
                            ));
                        }
                    }
                }
                dest
            }
            ExprKind::Cast(inner) => self.rvalue_cast(&e.ty, inner),
            ExprKind::Call { callee, args } => self
                .lower_call(callee, args, &e.ty)
                .unwrap_or_else(|| int_constant(0, 1)),
        }
    }

    fn rvalue_binary(&mut self, e: &Expr, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Operand {
        use BinaryOp::*;
        match op {
            LogAnd | LogOr => {
                let dest = self.temp_raw(1, 1, AllocHint::Gp);
                let true_l = self.fresh();
                let false_l = self.fresh();
                let end_l = self.fresh();
                self.cond_jump(e, true_l, false_l, true_l);
                self.emit(mov(dest.clone(), int_constant(1, 1)));
                self.terminate(jump(end_l), false_l);
                self.emit(mov(dest.clone(), int_constant(0, 1)));
                self.terminate(jump(end_l), end_l);
                dest
            }
            Lt | Le | Eq | Ne | Gt | Ge => {
                let (value_op, _) = self.comparison_ops(op, &lhs.ty, &rhs.ty);
                let l = self.rvalue(lhs);
                let r = self.rvalue(rhs);
                let dest = self.temp_raw(1, 1, AllocHint::Gp);
                self.emit(binop(value_op, dest.clone(), l, r));
                dest
            }
            Add | Sub if lhs.ty.is_any_pointer() || rhs.ty.is_any_pointer() => {
                self.pointer_arith(op, lhs, rhs)
            }
            _ => {
                let l = self.rvalue(lhs);
                let r = self.rvalue(rhs);
                let dest = self.temp_for(&e.ty);
                let float = e.ty.is_floating();
                let signed = e.ty.is_signed_integral();
                let ir_op = match op {
                    Add => {
                        if float {
                            IROperator::FAdd
                        } else {
                            IROperator::Add
                        }
                    }
                    Sub => {
                        if float {
                            IROperator::FSub
                        } else {
                            IROperator::Sub
                        }
                    }
                    Mul => {
                        if float {
                            IROperator::FMul
                        } else if signed {
                            IROperator::SMul
                        } else {
                            IROperator::UMul
                        }
                    }
                    Div => {
                        if float {
                            IROperator::FDiv
                        } else if signed {
                            IROperator::SDiv
                        } else {
                            IROperator::UDiv
                        }
                    }
                    Rem => {
                        if float {
                            IROperator::FMod
                        } else if signed {
                            IROperator::SMod
                        } else {
                            IROperator::UMod
                        }
                    }
                    Shl => IROperator::Sll,
                    Shr => {
                        if lhs.ty.is_signed_integral() {
                            IROperator::Sar
                        } else {
                            IROperator::Slr
                        }
                    }
                    BitAnd => IROperator::And,
                    BitXor => IROperator::Xor,
                    BitOr => IROperator::Or,
                    _ => unreachable!("handled above"),
                };
                self.emit(binop(ir_op, dest.clone(), l, r));
                dest
            }
        }
    }

    /// Pointer arithmetic scales the integer side by the pointee size;
    /// pointer difference divides the byte distance back down.
    fn pointer_arith(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Operand {
        let pointee_size = |ty: &Type, symbols: &SymbolTable| match ty.strip_cv() {
            Type::Pointer { base } => base.size_of(symbols),
            _ => 1,
        };
        if lhs.ty.is_any_pointer() && rhs.ty.is_any_pointer() {
            let l = self.rvalue(lhs);
            let r = self.rvalue(rhs);
            let raw = self.gp8();
            self.emit(binop(IROperator::Sub, raw.clone(), l, r));
            let size = pointee_size(&lhs.ty, self.symbols);
            if size == 1 {
                return raw;
            }
            let dest = self.gp8();
            self.emit(binop(
                IROperator::SDiv,
                dest.clone(),
                raw,
                int_constant(size, 8),
            ));
            return dest;
        }
        let (ptr, idx) = if lhs.ty.is_any_pointer() {
            (lhs, rhs)
        } else {
            (rhs, lhs)
        };
        let size = pointee_size(&ptr.ty, self.symbols);
        let p = self.rvalue(ptr);
        let scaled = self.scale_index(idx, size);
        let dest = self.gp8();
        let ir_op = if op == BinaryOp::Sub {
            IROperator::Sub
        } else {
            IROperator::Add
        };
        self.emit(binop(ir_op, dest.clone(), p, scaled));
        dest
    }

    /// Adds `index * elem_size` to an address operand.
    fn add_scaled(&mut self, addr: Operand, index: &Expr, elem_size: u64) -> Operand {
        let scaled = self.scale_index(index, elem_size);
        let dest = self.gp8();
        self.emit(binop(IROperator::Add, dest.clone(), addr, scaled));
        dest
    }

    fn rvalue_cast(&mut self, to: &Type, inner: &Expr) -> Operand {
        let src = self.rvalue(inner);
        let from = &inner.ty;
        let from_size = from.size_of(self.symbols);
        let to_size = to.size_of(self.symbols);
        let dest = self.temp_for(to);

        let op = if to.is_floating() {
            if from.is_floating() {
                if from_size == to_size {
                    IROperator::Move
                } else {
                    IROperator::FResize
                }
            } else if from.is_signed_integral() {
                IROperator::S2F
            } else {
                IROperator::U2F
            }
        } else if from.is_floating() {
            IROperator::F2I
        } else if to.is_boolean() && !from.is_boolean() {
            IROperator::Nz
        } else if to_size == from_size {
            IROperator::Move
        } else if to_size > from_size {
            if from.is_signed_integral() {
                IROperator::Sx
            } else {
                IROperator::Zx
            }
        } else {
            IROperator::Trunc
        };

        match op {
            IROperator::Move => self.emit(mov(dest.clone(), src)),
            other => self.emit(unop(other, dest.clone(), src)),
        }
        dest
    }

    // ----- calls -----

    fn lower_call(&mut self, callee: &Expr, args: &[Expr], ret_ty: &Type) -> Option<Operand> {
        let target = match &callee.kind {
            ExprKind::FuncRef(symbol) => {
                let entry = self.symbols.get(*symbol);
                Operand::global(mangle(&entry.module, &entry.name))
            }
            _ => self.rvalue(callee),
        };

        // evaluate every argument before any lands in its ABI slot
        let values: Vec<(Operand, Type)> = args
            .iter()
            .map(|arg| (self.rvalue(arg), arg.ty.clone()))
            .collect();

        let mut gp = 0usize;
        let mut sse = 0usize;
        let mut stack_off = 0i64;

        let ret_passing = (!is_void(ret_ty)).then(|| abi::classify(ret_ty, self.symbols));

        let mut result = None;
        if ret_passing == Some(Passing::Memory) {
            let slot = self.temp_for(ret_ty);
            let addr = self.gp8();
            self.emit(addrof(addr.clone(), slot.clone()));
            self.emit(mov(Operand::reg(GP_ARG_REGS[0].index(), 8), addr));
            gp = 1;
            result = Some(slot);
        }

        for (value, ty) in &values {
            let size = ty.size_of(self.symbols);
            match abi::classify(ty, self.symbols) {
                Passing::Gp => {
                    if gp < GP_ARG_REGS.len() {
                        self.emit(mov(
                            Operand::reg(GP_ARG_REGS[gp].index(), size),
                            value.clone(),
                        ));
                        gp += 1;
                    } else {
                        self.emit(stk_store(Operand::offset(stack_off), value.clone()));
                        stack_off += EIGHTBYTE as i64;
                    }
                }
                Passing::Sse => {
                    if sse < SSE_ARG_REGS.len() {
                        self.emit(mov(
                            Operand::reg(SSE_ARG_REGS[sse].index(), size),
                            value.clone(),
                        ));
                        sse += 1;
                    } else {
                        self.emit(stk_store(Operand::offset(stack_off), value.clone()));
                        stack_off += EIGHTBYTE as i64;
                    }
                }
                Passing::Registers(classes) if self.classes_fit(&classes, gp, sse) => {
                    for (idx, class) in classes.iter().enumerate() {
                        let (reg, hint) = match class {
                            EightbyteClass::Integer => {
                                let r = GP_ARG_REGS[gp];
                                gp += 1;
                                (r, AllocHint::Gp)
                            }
                            EightbyteClass::Sse => {
                                let r = SSE_ARG_REGS[sse];
                                sse += 1;
                                (r, AllocHint::Fp)
                            }
                        };
                        let chunk = self.temp_raw(8, 8, hint);
                        self.emit(offset_load(
                            chunk.clone(),
                            value.clone(),
                            Operand::offset((idx as u64 * EIGHTBYTE) as i64),
                        ));
                        self.emit(mov(Operand::reg(reg.index(), 8), chunk));
                    }
                }
                Passing::Registers(_) | Passing::Memory => {
                    let mut off = 0;
                    while off < size {
                        let chunk_size = chunk_size(size - off);
                        let chunk = self.temp_raw(chunk_size, chunk_size, AllocHint::Gp);
                        self.emit(offset_load(
                            chunk.clone(),
                            value.clone(),
                            Operand::offset(off as i64),
                        ));
                        self.emit(stk_store(Operand::offset(stack_off + off as i64), chunk));
                        off += chunk_size;
                    }
                    stack_off += round_up(size, EIGHTBYTE) as i64;
                }
            }
        }

        self.emit(call(target));

        match ret_passing {
            None => None,
            Some(Passing::Gp) => {
                let size = ret_ty.size_of(self.symbols);
                let dest = self.temp_for(ret_ty);
                self.emit(mov(dest.clone(), Operand::reg(Register::Rax.index(), size)));
                Some(dest)
            }
            Some(Passing::Sse) => {
                let size = ret_ty.size_of(self.symbols);
                let dest = self.temp_for(ret_ty);
                self.emit(mov(
                    dest.clone(),
                    Operand::reg(Register::Xmm0.index(), size),
                ));
                Some(dest)
            }
            Some(Passing::Registers(classes)) => {
                let dest = self.temp_for(ret_ty);
                let mut gp = 0;
                let mut sse = 0;
                for (idx, class) in classes.iter().enumerate() {
                    let (reg, hint) = match class {
                        EightbyteClass::Integer => {
                            let r = GP_RETURN_REGS[gp];
                            gp += 1;
                            (r, AllocHint::Gp)
                        }
                        EightbyteClass::Sse => {
                            let r = SSE_RETURN_REGS[sse];
                            sse += 1;
                            (r, AllocHint::Fp)
                        }
                    };
                    let chunk = self.temp_raw(8, 8, hint);
                    self.emit(mov(chunk.clone(), Operand::reg(reg.index(), 8)));
                    self.emit(offset_store(
                        dest.clone(),
                        chunk,
                        Operand::offset((idx as u64 * EIGHTBYTE) as i64),
                    ));
                }
                Some(dest)
            }
            Some(Passing::Memory) => result,
        }
    }
}

/// Largest power-of-two chunk not exceeding `remaining`, capped at eight.
fn chunk_size(remaining: u64) -> u64 {
    if remaining >= 8 {
        8
    } else if remaining >= 4 {
        4
    } else if remaining >= 2 {
        2
    } else {
        1
    }
}

/// An integer constant operand of the given byte width.
fn int_constant(bits: u64, size: u64) -> Operand {
    let datum = match size {
        1 => Datum::Byte(bits as u8),
        2 => Datum::Short(bits as u16),
        4 => Datum::Int(bits as u32),
        _ => Datum::Long(bits),
    };
    Operand::constant(size.max(1), datum)
}
