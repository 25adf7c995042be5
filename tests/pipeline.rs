//! End-to-end pipeline tests: typechecked ASTs in, NASM text out.

use ternc::optimize;
use ternc::prelude::*;
use ternc::translate;
use ternc_ir::IROperator;
use ternc_types::ast::{BinaryOp, Decl, Expr, ExprKind, Module, Stmt};

fn int_ty() -> Type {
    Type::Keyword(TypeKeyword::Int)
}

fn int_lit(v: u64) -> Expr {
    Expr::new(int_ty(), ExprKind::IntLit(v))
}

fn var(symbols: &SymbolTable, id: SymbolId) -> Expr {
    Expr::new(symbols.get(id).variable_type().clone(), ExprKind::Var(id))
}

fn local_int(symbols: &mut SymbolTable, name: &str) -> SymbolId {
    symbols.insert_local(
        name,
        SymbolKind::Variable {
            ty: int_ty(),
            escapes: false,
            temp: None,
        },
    )
}

fn module_fn(
    symbols: &mut SymbolTable,
    module: &str,
    name: &str,
    ret: Type,
    args: Vec<Type>,
) -> SymbolId {
    symbols.insert(SymbolTableEntry {
        module: vec![module.into()],
        name: name.into(),
        kind: SymbolKind::Function { ret, args },
    })
}

fn compile_one(symbols: SymbolTable, module: Module) -> String {
    let mut ctx = Context::new(Options::default(), symbols);
    ctx.add_file("test.tn", module);
    let out = ternc::pipeline::compile_to_strings(&mut ctx).expect("pipeline succeeds");
    out.into_iter().next().expect("one file").1
}

fn call(symbols: &SymbolTable, callee: SymbolId) -> Expr {
    let (ret, args) = match &symbols.get(callee).kind {
        SymbolKind::Function { ret, args } => (ret.clone(), args.clone()),
        _ => unreachable!(),
    };
    Expr::new(
        ret,
        ExprKind::Call {
            callee: Box::new(Expr::new(
                Type::fun_ptr(int_ty(), args),
                ExprKind::FuncRef(callee),
            )),
            args: vec![],
        },
    )
}

// S1: an uninitialized, non-const global becomes a bss frag with padding.
#[test]
fn zero_global_lands_in_bss() {
    let mut symbols = SymbolTable::new();
    let x = symbols.insert(SymbolTableEntry {
        module: vec!["a".into()],
        name: "x".into(),
        kind: SymbolKind::Variable {
            ty: int_ty(),
            escapes: false,
            temp: None,
        },
    });
    let module = Module {
        name: vec!["a".into()],
        decls: vec![Decl::GlobalVar {
            symbol: x,
            init: None,
        }],
    };
    let asm = compile_one(symbols, module);
    assert!(asm.contains("section .bss align=4\n"));
    assert!(asm.contains("global _T1a1x:data (_T1a1x.end - _T1a1x)\n_T1a1x:\n\tresb 4\n"));
    assert!(asm.contains("section .note.GNU-stack noalloc noexec nowrite progbits\n"));
}

// S2: a const pointer initialized with a string literal pools the string
// and stores the pool label.
#[test]
fn string_literal_init_pools_rodata() {
    let mut symbols = SymbolTable::new();
    let char_ptr = Type::qualified(
        Type::pointer(Type::qualified(
            Type::Keyword(TypeKeyword::Char),
            Qualifiers::CONST,
        )),
        Qualifiers::CONST,
    );
    let s = symbols.insert(SymbolTableEntry {
        module: vec!["a".into()],
        name: "s".into(),
        kind: SymbolKind::Variable {
            ty: char_ptr.clone(),
            escapes: false,
            temp: None,
        },
    });
    let module = Module {
        name: vec!["a".into()],
        decls: vec![Decl::GlobalVar {
            symbol: s,
            init: Some(Expr::new(
                char_ptr.strip_cv().clone(),
                ExprKind::StringLit(b"hi".to_vec()),
            )),
        }],
    };
    let asm = compile_one(symbols, module);
    // the pool: h, i, nul, one byte each
    assert!(asm.contains(".LC1:\n\tdb 104\n\tdb 105\n\tdb 0\n"));
    // the pointer frag references the pool and is read-only
    assert!(asm.contains("section .rodata align=8\nglobal _T1a1s:data"));
    assert!(asm.contains("\tdq .LC1\n"));
}

// S3: code after a return is unreachable and dead-block elimination
// removes it; the trivial exit collapses into the entry block.
#[test]
fn dead_blocks_are_eliminated() {
    let mut symbols = SymbolTable::new();
    let f = module_fn(
        &mut symbols,
        "m",
        "f",
        Type::Keyword(TypeKeyword::Void),
        vec![],
    );
    let x = local_int(&mut symbols, "x");
    let module = Module {
        name: vec!["m".into()],
        decls: vec![Decl::Function {
            symbol: f,
            params: vec![],
            body: vec![
                Stmt::VarDef {
                    symbol: x,
                    init: Some(int_lit(0)),
                },
                Stmt::Return(None),
                Stmt::Expr(Expr::new(
                    int_ty(),
                    ExprKind::Assign {
                        target: Box::new(var(&symbols, x)),
                        value: Box::new(int_lit(1)),
                    },
                )),
            ],
        }],
    };

    let mut ctx = Context::new(Options::default(), symbols);
    ctx.add_file("test.tn", module);
    translate::translate(&mut ctx);
    let blocked = match &ctx.files[0].frags[0] {
        Frag::Text { blocks, .. } => blocks.len(),
        _ => unreachable!("function frag comes first"),
    };
    assert!(blocked >= 2, "translation produced {blocked} blocks");

    optimize::optimize_blocked(&mut ctx.files[0]);
    match &ctx.files[0].frags[0] {
        Frag::Text { blocks, .. } => {
            assert_eq!(blocks.len(), 1, "only the entry survives");
            assert_eq!(
                blocks[0].terminator().map(|t| t.op),
                Some(IROperator::Return)
            );
            // the unreachable store is gone with its block
            assert!(blocks[0]
                .instructions
                .iter()
                .all(|i| i.op != IROperator::Move
                    || !matches!(&i.args[1], Operand::Constant { data, .. }
                        if data == &vec![Datum::Int(1)])));
        }
        _ => unreachable!(),
    }
}

// S6: values live across calls force callee-save registers, which the
// prologue pushes and the epilogue pops in reverse.
#[test]
fn callee_saves_are_pushed_and_popped() {
    let mut symbols = SymbolTable::new();
    let g = module_fn(&mut symbols, "m", "g", int_ty(), vec![]);
    let f = module_fn(&mut symbols, "m", "f", int_ty(), vec![]);
    let a = local_int(&mut symbols, "a");
    let b = local_int(&mut symbols, "b");
    let sum = Expr::new(
        int_ty(),
        ExprKind::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(var(&symbols, a)),
            rhs: Box::new(var(&symbols, b)),
        },
    );
    let module = Module {
        name: vec!["m".into()],
        decls: vec![Decl::Function {
            symbol: f,
            params: vec![],
            body: vec![
                Stmt::VarDef {
                    symbol: a,
                    init: Some(call(&symbols, g)),
                },
                Stmt::VarDef {
                    symbol: b,
                    init: Some(call(&symbols, g)),
                },
                Stmt::Return(Some(sum)),
            ],
        }],
    };
    let asm = compile_one(symbols, module);
    assert!(asm.contains("\tcall _T1m1g\n"));
    let prologue_at = asm.find("\tpush rbp\n\tmov rbp, rsp\n\tpush rbx\n").expect(
        "a live-across-call value takes the first callee-save register",
    );
    let epilogue_at = asm
        .find("\tpop rbx\n\tpop rbp\n\tret\n")
        .expect("epilogue pops in reverse");
    assert!(prologue_at < epilogue_at);
    assert!(asm.contains("\tsub rsp, "));
    assert!(asm.contains("\tadd rsp, "));
}

// A while loop end to end: conditional jump, fallthrough, back edge.
#[test]
fn loops_compile_to_conditional_jumps() {
    let mut symbols = SymbolTable::new();
    let f = module_fn(&mut symbols, "m", "sum", int_ty(), vec![int_ty()]);
    let n = local_int(&mut symbols, "n");
    let s = local_int(&mut symbols, "s");
    let i = local_int(&mut symbols, "i");

    let cond = Expr::new(
        Type::Keyword(TypeKeyword::Bool),
        ExprKind::Binary {
            op: BinaryOp::Lt,
            lhs: Box::new(var(&symbols, i)),
            rhs: Box::new(var(&symbols, n)),
        },
    );
    let add_s = Expr::new(
        int_ty(),
        ExprKind::Assign {
            target: Box::new(var(&symbols, s)),
            value: Box::new(Expr::new(
                int_ty(),
                ExprKind::Binary {
                    op: BinaryOp::Add,
                    lhs: Box::new(var(&symbols, s)),
                    rhs: Box::new(var(&symbols, i)),
                },
            )),
        },
    );
    let inc_i = Expr::new(
        int_ty(),
        ExprKind::Assign {
            target: Box::new(var(&symbols, i)),
            value: Box::new(Expr::new(
                int_ty(),
                ExprKind::Binary {
                    op: BinaryOp::Add,
                    lhs: Box::new(var(&symbols, i)),
                    rhs: Box::new(int_lit(1)),
                },
            )),
        },
    );
    let module = Module {
        name: vec!["m".into()],
        decls: vec![Decl::Function {
            symbol: f,
            params: vec![n],
            body: vec![
                Stmt::VarDef {
                    symbol: s,
                    init: Some(int_lit(0)),
                },
                Stmt::VarDef {
                    symbol: i,
                    init: Some(int_lit(0)),
                },
                Stmt::While {
                    cond,
                    body: Box::new(Stmt::Block(vec![Stmt::Expr(add_s), Stmt::Expr(inc_i)])),
                },
                Stmt::Return(Some(var(&symbols, s))),
            ],
        }],
    };
    let asm = compile_one(symbols, module);
    assert!(asm.contains("global _T1m3sum:function (_T1m3sum.end - _T1m3sum)\n"));
    // signed less-than branch into the loop body
    assert!(asm.contains("\tjl L"));
    // the back edge to the header survives as an explicit jump
    assert!(asm.contains("\tjmp L"));
    assert!(asm.contains("\tcmp "));
    assert!(asm.ends_with("section .note.GNU-stack noalloc noexec nowrite progbits\n"));
}

// Property 8: emission is byte-deterministic.
#[test]
fn emission_is_deterministic() {
    let build = || {
        let mut symbols = SymbolTable::new();
        let f = module_fn(&mut symbols, "m", "f", int_ty(), vec![int_ty()]);
        let x = local_int(&mut symbols, "x");
        let body = vec![
            Stmt::VarDef {
                symbol: x,
                init: Some(int_lit(3)),
            },
            Stmt::If {
                cond: Expr::new(
                    Type::Keyword(TypeKeyword::Bool),
                    ExprKind::Binary {
                        op: BinaryOp::Gt,
                        lhs: Box::new(var(&symbols, x)),
                        rhs: Box::new(int_lit(1)),
                    },
                ),
                then: Box::new(Stmt::Return(Some(int_lit(1)))),
                els: None,
            },
            Stmt::Return(Some(int_lit(0))),
        ];
        let module = Module {
            name: vec!["m".into()],
            decls: vec![Decl::Function {
                symbol: f,
                params: vec![x],
                body,
            }],
        };
        compile_one(symbols, module)
    };
    assert_eq!(build(), build());
}

// Property 7 is implied: emission panics if any temp survives allocation,
// so every end-to-end test doubles as an allocator coverage check. This
// one adds float traffic so SSE constants and registers take that path.
#[test]
fn float_arithmetic_uses_sse() {
    let mut symbols = SymbolTable::new();
    let double = Type::Keyword(TypeKeyword::Double);
    let f = module_fn(&mut symbols, "m", "scale", double.clone(), vec![double.clone()]);
    let x = symbols.insert_local(
        "x",
        SymbolKind::Variable {
            ty: double.clone(),
            escapes: false,
            temp: None,
        },
    );
    let product = Expr::new(
        double.clone(),
        ExprKind::Binary {
            op: BinaryOp::Mul,
            lhs: Box::new(var(&symbols, x)),
            rhs: Box::new(Expr::new(double.clone(), ExprKind::FloatLit(2.5))),
        },
    );
    let module = Module {
        name: vec!["m".into()],
        decls: vec![Decl::Function {
            symbol: f,
            params: vec![x],
            body: vec![Stmt::Return(Some(product))],
        }],
    };
    let asm = compile_one(symbols, module);
    assert!(asm.contains("\tmovsd "));
    assert!(asm.contains("\tmulsd "));
    // the 2.5 constant went through a rodata pool
    assert!(asm.contains(&format!("\tdq {}\n", 2.5f64.to_bits())));
}

// Switches over dense case sets emit jump tables.
#[test]
fn dense_switches_use_jump_tables() {
    let mut symbols = SymbolTable::new();
    let f = module_fn(&mut symbols, "m", "pick", int_ty(), vec![int_ty()]);
    let x = local_int(&mut symbols, "x");
    let case = |v: i64, ret: u64| ternc_types::ast::SwitchCase {
        values: vec![v],
        default: false,
        body: vec![Stmt::Return(Some(int_lit(ret)))],
    };
    let module = Module {
        name: vec!["m".into()],
        decls: vec![Decl::Function {
            symbol: f,
            params: vec![x],
            body: vec![
                Stmt::Switch {
                    scrutinee: var(&symbols, x),
                    cases: vec![case(0, 10), case(1, 20), case(2, 30), case(3, 40)],
                },
                Stmt::Return(Some(int_lit(0))),
            ],
        }],
    };
    let asm = compile_one(symbols, module);
    // the table is a local rodata frag of code labels
    assert!(asm.contains("\tdq L"));
    assert!(asm.contains("\tjmp qword [.LC"));
    // out-of-range scrutinees skip the table
    assert!(asm.contains("\tja L"));
}
