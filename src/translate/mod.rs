//! Lowering from typechecked AST to blocked IR.
//!
//! Each translation unit becomes a vector of fragments: one bss/rodata/data
//! frag per global variable and one text frag per function. Function
//! lowering lives in [`func`].

mod func;

use tracing::debug;

use ternc_ir::{Datum, Frag, LabelRef};
use ternc_types::ast::{Decl, Expr, ExprKind};
use ternc_types::{SymbolId, SymbolKind, SymbolTable, Type, TypeKeyword};

use crate::context::{Context, FileEntry};

/// Mangles a symbol: `_T` followed by length-prefixed module components and
/// the length-prefixed name. Module `a.b`, symbol `f` mangles to `_T1a1b1f`.
pub fn mangle(module: &[String], name: &str) -> String {
    let mut out = String::from("_T");
    for component in module {
        out.push_str(&component.len().to_string());
        out.push_str(component);
    }
    out.push_str(&name.len().to_string());
    out.push_str(name);
    out
}

/// Translates every file in the context.
pub fn translate(ctx: &mut Context) {
    let symbols = &mut ctx.symbols;
    for file in &mut ctx.files {
        translate_file(file, symbols);
    }
}

fn translate_file(file: &mut FileEntry, symbols: &mut SymbolTable) {
    let Some(ast) = file.ast.take() else {
        return;
    };
    debug!(file = %file.name, "translating");
    for decl in &ast.decls {
        match decl {
            Decl::GlobalVar { symbol, init } => {
                translate_global(*symbol, init.as_ref(), file, symbols);
            }
            Decl::Function {
                symbol,
                params,
                body,
            } => {
                func::translate_function(*symbol, params, body, file, symbols);
            }
        }
    }
}

/// Translates one global variable into a data-like fragment.
fn translate_global(
    symbol: SymbolId,
    init: Option<&Expr>,
    file: &mut FileEntry,
    symbols: &mut SymbolTable,
) {
    let entry = symbols.get(symbol);
    let ty = entry.variable_type().clone();
    let name = LabelRef::Global(mangle(&entry.module, &entry.name));
    let align = ty.align_of(symbols);
    let size = ty.size_of(symbols);

    match init {
        None => file.frags.push(Frag::Bss {
            name,
            align,
            data: vec![Datum::Padding(size)],
        }),
        Some(expr) if initializer_all_zero(expr) => file.frags.push(Frag::Bss {
            name,
            align,
            data: vec![Datum::Padding(size)],
        }),
        Some(expr) => {
            let mut data = Vec::new();
            flatten_initializer(&ty, expr, &mut data, file, symbols);
            let frag = if ty.quals().contains(ternc_types::Qualifiers::CONST) {
                Frag::RoData { name, align, data }
            } else {
                Frag::Data { name, align, data }
            };
            file.frags.push(frag);
        }
    }
}

/// Does this initializer produce all zero bytes?
fn initializer_all_zero(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::IntLit(v) => *v == 0,
        ExprKind::FloatLit(v) => v.to_bits() == 0,
        ExprKind::BoolLit(v) => !v,
        ExprKind::CharLit(v) => *v == 0,
        ExprKind::WCharLit(v) => *v == 0,
        ExprKind::NullLit => true,
        ExprKind::AggregateLit(members) => members.iter().all(initializer_all_zero),
        ExprKind::Cast(inner) => initializer_all_zero(inner),
        _ => false,
    }
}

/// Emits a scalar keyword-typed literal as a datum.
fn scalar_datum(kw: TypeKeyword, expr: &Expr) -> Datum {
    let bits = match &expr.kind {
        ExprKind::IntLit(v) => *v,
        ExprKind::BoolLit(v) => *v as u64,
        ExprKind::CharLit(v) => *v as u64,
        ExprKind::WCharLit(v) => *v as u64,
        ExprKind::FloatLit(v) => match kw {
            TypeKeyword::Float => (*v as f32).to_bits() as u64,
            _ => v.to_bits(),
        },
        ExprKind::Cast(inner) => return scalar_datum(kw, inner),
        _ => unreachable!("non-constant scalar initializer survived typechecking"),
    };
    match kw.size() {
        1 => Datum::Byte(bits as u8),
        2 => Datum::Short(bits as u16),
        4 => Datum::Int(bits as u32),
        8 => Datum::Long(bits),
        _ => unreachable!("invalid keyword size"),
    }
}

/// Pools a string literal into a fresh local rodata frag and returns its id.
fn pool_string(datum: Datum, align: u64, file: &mut FileEntry) -> usize {
    let id = file.fresh();
    file.frags.push(Frag::RoData {
        name: LabelRef::Local(id),
        align,
        data: vec![datum],
    });
    id
}

/// Flattens `expr` as an initializer of type `ty` into datums, padding
/// holes explicitly. Returns the number of bytes emitted.
fn flatten_initializer(
    ty: &Type,
    expr: &Expr,
    out: &mut Vec<Datum>,
    file: &mut FileEntry,
    symbols: &SymbolTable,
) -> u64 {
    match ty {
        Type::Qualified { base, .. } => flatten_initializer(base, expr, out, file, symbols),
        Type::Keyword(kw) => {
            let datum = scalar_datum(*kw, expr);
            let size = datum.size();
            out.push(datum);
            size
        }
        Type::Pointer { .. } | Type::FunPtr { .. } => {
            match &expr.kind {
                ExprKind::NullLit | ExprKind::IntLit(0) => out.push(Datum::Long(0)),
                ExprKind::StringLit(bytes) => {
                    let id = pool_string(Datum::String(bytes.clone()), 1, file);
                    out.push(Datum::Local(id));
                }
                ExprKind::WStringLit(chars) => {
                    let id = pool_string(Datum::WString(chars.clone()), 4, file);
                    out.push(Datum::Local(id));
                }
                ExprKind::FuncRef(f) => {
                    let entry = symbols.get(*f);
                    out.push(Datum::Global(mangle(&entry.module, &entry.name)));
                }
                ExprKind::AddrOf(inner) => match &inner.kind {
                    ExprKind::Var(v) => {
                        let entry = symbols.get(*v);
                        out.push(Datum::Global(mangle(&entry.module, &entry.name)));
                    }
                    _ => unreachable!("non-constant address initializer"),
                },
                ExprKind::Cast(inner) => {
                    return flatten_initializer(ty, inner, out, file, symbols);
                }
                _ => unreachable!("non-constant pointer initializer"),
            }
            8
        }
        Type::Array { length, base } => {
            let elem_size = base.size_of(symbols);
            let mut emitted = 0;
            match &expr.kind {
                ExprKind::AggregateLit(members) => {
                    for member in members {
                        emitted += flatten_initializer(base, member, out, file, symbols);
                    }
                    let want = elem_size * length;
                    if emitted < want {
                        out.push(Datum::Padding(want - emitted));
                        emitted = want;
                    }
                }
                ExprKind::StringLit(bytes) => {
                    out.push(Datum::String(bytes.clone()));
                    emitted = bytes.len() as u64 + 1;
                    let want = elem_size * length;
                    if emitted < want {
                        out.push(Datum::Padding(want - emitted));
                        emitted = want;
                    }
                }
                _ => unreachable!("non-aggregate array initializer"),
            }
            emitted
        }
        Type::Reference(id) => match &symbols.get(*id).kind {
            SymbolKind::Struct { field_types, .. } => {
                let field_types = field_types.clone();
                let members = match &expr.kind {
                    ExprKind::AggregateLit(members) => members,
                    _ => unreachable!("non-aggregate struct initializer"),
                };
                let whole = ty.size_of(symbols);
                let mut emitted = 0;
                for (field_ty, member) in field_types.iter().zip(members) {
                    let offset = emitted;
                    let align = field_ty.align_of(symbols);
                    let aligned = round_up(offset, align);
                    if aligned > offset {
                        out.push(Datum::Padding(aligned - offset));
                        emitted = aligned;
                    }
                    emitted += flatten_initializer(field_ty, member, out, file, symbols);
                }
                if emitted < whole {
                    out.push(Datum::Padding(whole - emitted));
                    emitted = whole;
                }
                emitted
            }
            SymbolKind::Union { option_types, .. } => {
                let first = option_types
                    .first()
                    .cloned()
                    .unwrap_or(Type::Keyword(TypeKeyword::Ubyte));
                let whole = ty.size_of(symbols);
                let members = match &expr.kind {
                    ExprKind::AggregateLit(members) => members,
                    _ => unreachable!("non-aggregate union initializer"),
                };
                let mut emitted = 0;
                if let Some(member) = members.first() {
                    emitted = flatten_initializer(&first, member, out, file, symbols);
                }
                if emitted < whole {
                    out.push(Datum::Padding(whole - emitted));
                    emitted = whole;
                }
                emitted
            }
            SymbolKind::Enum { backing, .. } => {
                flatten_initializer(&backing.clone(), expr, out, file, symbols)
            }
            SymbolKind::Typedef { actual } => {
                flatten_initializer(&actual.clone(), expr, out, file, symbols)
            }
            _ => unreachable!("initializer for an unsized symbol"),
        },
        Type::Aggregate { .. } => {
            unreachable!("aggregate type is never a declared global's type")
        }
    }
}

pub(crate) fn round_up(value: u64, multiple: u64) -> u64 {
    if multiple == 0 || value % multiple == 0 {
        value
    } else {
        value + multiple - value % multiple
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mangling_is_length_prefixed() {
        assert_eq!(mangle(&["a".into(), "b".into()], "f"), "_T1a1b1f");
        assert_eq!(mangle(&["core".into()], "main"), "_T4core4main");
        assert_eq!(mangle(&[], "x"), "_T1x");
    }

    proptest! {
        /// Length prefixes make mangling injective: the components can
        /// always be read back out.
        #[test]
        fn mangling_round_trips(
            module in prop::collection::vec("[a-z][a-z0-9]{0,7}", 0..4),
            name in "[a-z][a-z0-9]{0,7}",
        ) {
            let mangled = mangle(&module, &name);
            prop_assert!(mangled.starts_with("_T"));

            let mut rest = &mangled[2..];
            let mut components = Vec::new();
            while !rest.is_empty() {
                let digits: String =
                    rest.chars().take_while(char::is_ascii_digit).collect();
                let len: usize = digits.parse().expect("length prefix");
                rest = &rest[digits.len()..];
                components.push(rest[..len].to_string());
                rest = &rest[len..];
            }
            let mut expected = module.clone();
            expected.push(name.clone());
            prop_assert_eq!(components, expected);
        }
    }
}
