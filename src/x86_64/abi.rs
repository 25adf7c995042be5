//! System V AMD64 parameter and return classification.
//!
//! Scalars go to the next free GP or SSE argument register; aggregates are
//! split into eightbytes and classified INTEGER/SSE, passing in registers
//! when at most two eightbytes suffice and on the stack otherwise. Return
//! values mirror the same rules, with large aggregates returned through a
//! caller-provided buffer whose address travels in `rdi`.

use ternc_types::{AllocHint, SymbolKind, SymbolTable, Type};

use crate::consts::EIGHTBYTE;
use crate::x86_64::asm::Register;

/// GP argument registers, in order.
pub const GP_ARG_REGS: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::Rcx,
    Register::R8,
    Register::R9,
];

/// SSE argument registers, in order.
pub const SSE_ARG_REGS: [Register; 8] = [
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
    Register::Xmm4,
    Register::Xmm5,
    Register::Xmm6,
    Register::Xmm7,
];

/// GP registers used to return aggregate eightbytes.
pub const GP_RETURN_REGS: [Register; 2] = [Register::Rax, Register::Rdx];

/// SSE registers used to return aggregate eightbytes.
pub const SSE_RETURN_REGS: [Register; 2] = [Register::Xmm0, Register::Xmm1];

/// Registers a call may clobber; the allocator treats them as defined by
/// every call instruction.
pub const CALLER_SAVE: [Register; 25] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
    Register::Xmm4,
    Register::Xmm5,
    Register::Xmm6,
    Register::Xmm7,
    Register::Xmm8,
    Register::Xmm9,
    Register::Xmm10,
    Register::Xmm11,
    Register::Xmm12,
    Register::Xmm13,
    Register::Xmm14,
    Register::Xmm15,
];

/// Classification of one eightbyte of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EightbyteClass {
    /// Passed in a GP register.
    Integer,
    /// Passed in an SSE register.
    Sse,
}

/// How a value travels across a call boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Passing {
    /// A scalar in the next free GP register (or the stack).
    Gp,
    /// A scalar in the next free SSE register (or the stack).
    Sse,
    /// An aggregate of at most two eightbytes, each in a register of its
    /// class.
    Registers(Vec<EightbyteClass>),
    /// On the stack, by value.
    Memory,
}

/// Collects the offsets and register classes of every scalar leaf.
fn scalar_leaves(ty: &Type, base: u64, out: &mut Vec<(u64, AllocHint)>, symbols: &SymbolTable) {
    match ty {
        Type::Keyword(_) | Type::Pointer { .. } | Type::FunPtr { .. } => {
            out.push((base, ty.allocation_hint(symbols)));
        }
        Type::Qualified { base: inner, .. } => scalar_leaves(inner, base, out, symbols),
        Type::Array { length, base: elem } => {
            let stride = elem.size_of(symbols);
            for idx in 0..*length {
                scalar_leaves(elem, base + idx * stride, out, symbols);
            }
        }
        Type::Aggregate { members } => {
            let mut offset = base;
            for (idx, member) in members.iter().enumerate() {
                scalar_leaves(member, offset, out, symbols);
                offset += member.size_of(symbols);
                if idx + 1 < members.len() {
                    offset = crate::translate::round_up(offset, members[idx + 1].align_of(symbols));
                }
            }
        }
        Type::Reference(id) => match &symbols.get(*id).kind {
            SymbolKind::Struct { field_types, .. } => {
                let mut offset = base;
                for (idx, field) in field_types.iter().enumerate() {
                    scalar_leaves(field, offset, out, symbols);
                    offset += field.size_of(symbols);
                    if idx + 1 < field_types.len() {
                        offset =
                            crate::translate::round_up(offset, field_types[idx + 1].align_of(symbols));
                    }
                }
            }
            SymbolKind::Union { option_types, .. } => {
                for option in option_types {
                    scalar_leaves(option, base, out, symbols);
                }
            }
            SymbolKind::Enum { backing, .. } => scalar_leaves(backing, base, out, symbols),
            SymbolKind::Typedef { actual } => scalar_leaves(actual, base, out, symbols),
            _ => unreachable!("classifying a value of an unsized symbol"),
        },
    }
}

/// Classifies how a value of `ty` is passed.
pub fn classify(ty: &Type, symbols: &SymbolTable) -> Passing {
    match ty.allocation_hint(symbols) {
        AllocHint::Gp => Passing::Gp,
        AllocHint::Fp => Passing::Sse,
        AllocHint::Mem => {
            let size = ty.size_of(symbols);
            if size > 2 * EIGHTBYTE {
                return Passing::Memory;
            }
            let mut leaves = Vec::new();
            scalar_leaves(ty, 0, &mut leaves, symbols);
            let count = ((size + EIGHTBYTE - 1) / EIGHTBYTE).max(1) as usize;
            let mut classes = vec![EightbyteClass::Sse; count];
            for (offset, hint) in leaves {
                let idx = (offset / EIGHTBYTE) as usize;
                if hint != AllocHint::Fp {
                    classes[idx] = EightbyteClass::Integer;
                }
            }
            Passing::Registers(classes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ternc_types::{SymbolTable, TypeKeyword};

    fn kw(k: TypeKeyword) -> Type {
        Type::Keyword(k)
    }

    #[test]
    fn scalars_classify_by_register_class() {
        let symbols = SymbolTable::new();
        assert_eq!(classify(&kw(TypeKeyword::Int), &symbols), Passing::Gp);
        assert_eq!(classify(&kw(TypeKeyword::Double), &symbols), Passing::Sse);
        assert_eq!(
            classify(&Type::pointer(kw(TypeKeyword::Void)), &symbols),
            Passing::Gp
        );
    }

    #[test]
    fn small_mixed_struct_uses_both_classes() {
        let mut symbols = SymbolTable::new();
        let id = symbols.insert_local(
            "pair",
            SymbolKind::Struct {
                field_names: vec!["a".into(), "b".into()],
                field_types: vec![kw(TypeKeyword::Long), kw(TypeKeyword::Double)],
            },
        );
        assert_eq!(
            classify(&Type::Reference(id), &symbols),
            Passing::Registers(vec![EightbyteClass::Integer, EightbyteClass::Sse])
        );
    }

    #[test]
    fn float_pair_packs_into_one_sse_eightbyte() {
        let symbols = SymbolTable::new();
        let ty = Type::array(2, kw(TypeKeyword::Float));
        assert_eq!(
            classify(&ty, &symbols),
            Passing::Registers(vec![EightbyteClass::Sse])
        );
    }

    #[test]
    fn big_structs_go_to_memory() {
        let symbols = SymbolTable::new();
        let ty = Type::array(3, kw(TypeKeyword::Long));
        assert_eq!(classify(&ty, &symbols), Passing::Memory);
    }
}
