//! The type model.
//!
//! Every pass after the typechecker asks this module the same questions:
//! how big is a value, how is it aligned, which register class does it want,
//! and which conversions between two types are legal. All of the functions
//! here are total over well-formed types; an ill-formed type (e.g. sizing an
//! opaque reference) is a compiler bug and panics.

use bitflags::bitflags;
use strum::{Display, EnumIter};

use crate::symbol::{SymbolId, SymbolKind, SymbolTable};

/// Width of a pointer on every supported target, in bytes.
pub const POINTER_WIDTH: u64 = 8;

bitflags! {
    /// CV qualifier set carried by [`Type::Qualified`].
    pub struct Qualifiers: u8 {
        /// `const` — the value may be placed in read-only storage.
        const CONST = 0b01;
        /// `volatile` — reads and writes may not be elided.
        const VOLATILE = 0b10;
    }
}

/// A keyword (builtin scalar) type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TypeKeyword {
    /// No value; only meaningful behind a pointer or as a return type.
    Void,
    /// Unsigned 8-bit integer.
    Ubyte,
    /// Signed 8-bit integer.
    Byte,
    /// 8-bit character.
    Char,
    /// Unsigned 16-bit integer.
    Ushort,
    /// Signed 16-bit integer.
    Short,
    /// Unsigned 32-bit integer.
    Uint,
    /// Signed 32-bit integer.
    Int,
    /// 32-bit character.
    Wchar,
    /// Unsigned 64-bit integer.
    Ulong,
    /// Signed 64-bit integer.
    Long,
    /// IEEE-754 single.
    Float,
    /// IEEE-754 double.
    Double,
    /// Boolean.
    Bool,
}

impl TypeKeyword {
    /// Size in bytes. `void` is one byte so void-pointer arithmetic works.
    pub fn size(self) -> u64 {
        use TypeKeyword::*;
        match self {
            Void | Ubyte | Byte | Char | Bool => 1,
            Ushort | Short => 2,
            Uint | Int | Wchar | Float => 4,
            Ulong | Long | Double => 8,
        }
    }

    fn signed_integral(self) -> bool {
        use TypeKeyword::*;
        matches!(self, Byte | Short | Int | Long)
    }

    fn unsigned_integral(self) -> bool {
        use TypeKeyword::*;
        matches!(self, Ubyte | Ushort | Uint | Ulong)
    }

    fn floating(self) -> bool {
        matches!(self, TypeKeyword::Float | TypeKeyword::Double)
    }
}

/// Register class a value of some type wants to live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum AllocHint {
    /// Integer-like things; general-purpose registers.
    Gp,
    /// Floats and doubles; SSE registers.
    Fp,
    /// Structs, unions, arrays; always stack-resident.
    Mem,
}

/// The type of a variable or value.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    /// A builtin scalar.
    Keyword(TypeKeyword),
    /// A CV-qualified type. The base is never itself qualified.
    Qualified {
        /// Which qualifiers apply.
        quals: Qualifiers,
        /// The unqualified base.
        base: Box<Type>,
    },
    /// A pointer.
    Pointer {
        /// The pointee.
        base: Box<Type>,
    },
    /// A fixed-length array.
    Array {
        /// Element count.
        length: u64,
        /// Element type.
        base: Box<Type>,
    },
    /// A function pointer.
    FunPtr {
        /// Return type.
        ret: Box<Type>,
        /// Argument types.
        args: Vec<Type>,
    },
    /// The synthetic type of an aggregate-initializer literal; never
    /// declared, only produced by the typechecker for `{...}` expressions.
    Aggregate {
        /// Member types, in literal order.
        members: Vec<Type>,
    },
    /// A reference to a struct, union, enum, typedef, or opaque entry.
    Reference(SymbolId),
}

impl Type {
    /// Builds a keyword type.
    pub fn keyword(kw: TypeKeyword) -> Self {
        Type::Keyword(kw)
    }

    /// Wraps `base` in qualifiers. Qualifying a qualified type merges the
    /// flag sets instead of nesting.
    pub fn qualified(base: Type, quals: Qualifiers) -> Self {
        match base {
            Type::Qualified { quals: inner, base } => Type::Qualified {
                quals: quals | inner,
                base,
            },
            other => Type::Qualified {
                quals,
                base: Box::new(other),
            },
        }
    }

    /// Builds a pointer to `base`.
    pub fn pointer(base: Type) -> Self {
        Type::Pointer {
            base: Box::new(base),
        }
    }

    /// Builds an array of `length` elements of `base`.
    pub fn array(length: u64, base: Type) -> Self {
        Type::Array {
            length,
            base: Box::new(base),
        }
    }

    /// Builds a function pointer type.
    pub fn fun_ptr(ret: Type, args: Vec<Type>) -> Self {
        Type::FunPtr {
            ret: Box::new(ret),
            args,
        }
    }

    /// Strips any top-level CV qualification.
    pub fn strip_cv(&self) -> &Type {
        match self {
            Type::Qualified { base, .. } => base,
            other => other,
        }
    }

    /// Top-level qualifier set (empty when unqualified).
    pub fn quals(&self) -> Qualifiers {
        match self {
            Type::Qualified { quals, .. } => *quals,
            _ => Qualifiers::empty(),
        }
    }

    /// The keyword under any qualification, if this is a keyword type.
    fn as_keyword(&self) -> Option<TypeKeyword> {
        match self.strip_cv() {
            Type::Keyword(kw) => Some(*kw),
            _ => None,
        }
    }

    /// Is this a signed integer (byte, short, int, long)?
    pub fn is_signed_integral(&self) -> bool {
        self.as_keyword().map_or(false, TypeKeyword::signed_integral)
    }

    /// Is this an unsigned integer (ubyte, ushort, uint, ulong)?
    pub fn is_unsigned_integral(&self) -> bool {
        self.as_keyword()
            .map_or(false, TypeKeyword::unsigned_integral)
    }

    /// Is this any integer?
    pub fn is_integral(&self) -> bool {
        self.is_signed_integral() || self.is_unsigned_integral()
    }

    /// Is this a float of any size?
    pub fn is_floating(&self) -> bool {
        self.as_keyword().map_or(false, TypeKeyword::floating)
    }

    /// Is this any number?
    pub fn is_numeric(&self) -> bool {
        self.is_integral() || self.is_floating()
    }

    /// Is this a char or wchar?
    pub fn is_character(&self) -> bool {
        matches!(
            self.as_keyword(),
            Some(TypeKeyword::Char) | Some(TypeKeyword::Wchar)
        )
    }

    /// Is this a bool?
    pub fn is_boolean(&self) -> bool {
        self.as_keyword() == Some(TypeKeyword::Bool)
    }

    /// Is this a value pointer?
    pub fn is_pointer(&self) -> bool {
        matches!(self.strip_cv(), Type::Pointer { .. })
    }

    /// Is this a value pointer or a function pointer?
    pub fn is_any_pointer(&self) -> bool {
        matches!(
            self.strip_cv(),
            Type::Pointer { .. } | Type::FunPtr { .. }
        )
    }

    /// Is this an array?
    pub fn is_array(&self) -> bool {
        matches!(self.strip_cv(), Type::Array { .. })
    }

    /// Is this an enum reference?
    pub fn is_enum(&self, symbols: &SymbolTable) -> bool {
        match self.strip_cv() {
            Type::Reference(id) => matches!(symbols.get(*id).kind, SymbolKind::Enum { .. }),
            _ => false,
        }
    }

    /// Can a `switch` scrutinize this type?
    pub fn is_switchable(&self, symbols: &SymbolTable) -> bool {
        self.is_integral() || self.is_character() || self.is_enum(symbols)
    }

    /// Is this type volatile-qualified at the top level?
    pub fn is_volatile(&self) -> bool {
        self.quals().contains(Qualifiers::VOLATILE)
    }

    /// Size in bytes.
    pub fn size_of(&self, symbols: &SymbolTable) -> u64 {
        match self {
            Type::Keyword(kw) => kw.size(),
            Type::Qualified { base, .. } => base.size_of(symbols),
            Type::Pointer { .. } | Type::FunPtr { .. } => POINTER_WIDTH,
            Type::Array { length, base } => base.size_of(symbols) * length,
            Type::Aggregate { members } => {
                layout_size(members, self.align_of(symbols), symbols)
            }
            Type::Reference(id) => match &symbols.get(*id).kind {
                SymbolKind::Struct { field_types, .. } => {
                    layout_size(field_types, self.align_of(symbols), symbols)
                }
                SymbolKind::Union { option_types, .. } => option_types
                    .iter()
                    .map(|t| t.size_of(symbols))
                    .max()
                    .unwrap_or(0),
                SymbolKind::Enum { backing, .. } => backing.size_of(symbols),
                SymbolKind::Typedef { actual } => actual.size_of(symbols),
                _ => unreachable!("can't take the size of an unsized symbol"),
            },
        }
    }

    /// Alignment in bytes.
    pub fn align_of(&self, symbols: &SymbolTable) -> u64 {
        match self {
            Type::Keyword(_) | Type::Pointer { .. } | Type::FunPtr { .. } => {
                self.size_of(symbols)
            }
            Type::Qualified { base, .. } => base.align_of(symbols),
            Type::Array { base, .. } => base.align_of(symbols),
            Type::Aggregate { members } => members
                .iter()
                .map(|t| t.align_of(symbols))
                .max()
                .unwrap_or(0),
            Type::Reference(id) => match &symbols.get(*id).kind {
                SymbolKind::Struct { field_types, .. } => field_types
                    .iter()
                    .map(|t| t.align_of(symbols))
                    .max()
                    .unwrap_or(0),
                SymbolKind::Union { option_types, .. } => option_types
                    .iter()
                    .map(|t| t.align_of(symbols))
                    .max()
                    .unwrap_or(0),
                SymbolKind::Enum { backing, .. } => backing.align_of(symbols),
                SymbolKind::Typedef { actual } => actual.align_of(symbols),
                _ => unreachable!("can't take the alignment of an unsized symbol"),
            },
        }
    }

    /// Is the type complete? Recursive types count as complete; the
    /// recursion probes below reject the infinite ones.
    pub fn is_complete(&self, symbols: &SymbolTable) -> bool {
        match self {
            Type::Keyword(kw) => *kw != TypeKeyword::Void,
            Type::Qualified { base, .. } => base.is_complete(symbols),
            Type::Pointer { .. } | Type::FunPtr { .. } => true,
            Type::Array { length, base } => *length != 0 && base.is_complete(symbols),
            Type::Aggregate { members } => members.iter().all(|t| t.is_complete(symbols)),
            Type::Reference(id) => !matches!(symbols.get(*id).kind, SymbolKind::Opaque),
        }
    }

    /// Which register class a value of this type wants.
    pub fn allocation_hint(&self, symbols: &SymbolTable) -> AllocHint {
        match self {
            Type::Keyword(kw) => {
                if kw.floating() {
                    AllocHint::Fp
                } else {
                    AllocHint::Gp
                }
            }
            Type::Qualified { base, .. } => base.allocation_hint(symbols),
            Type::Pointer { .. } | Type::FunPtr { .. } => AllocHint::Gp,
            Type::Array { .. } | Type::Aggregate { .. } => AllocHint::Mem,
            Type::Reference(id) => match &symbols.get(*id).kind {
                SymbolKind::Struct { .. } | SymbolKind::Union { .. } => AllocHint::Mem,
                SymbolKind::Enum { backing, .. } => backing.allocation_hint(symbols),
                SymbolKind::Typedef { actual } => actual.allocation_hint(symbols),
                _ => unreachable!("can't allocate a value of an unsized symbol"),
            },
        }
    }

    /// Byte offset of `field` within the struct this type references.
    pub fn struct_offset_of(&self, field: &str, symbols: &SymbolTable) -> u64 {
        match self.strip_cv() {
            Type::Reference(id) => match &symbols.get(*id).kind {
                SymbolKind::Struct {
                    field_names,
                    field_types,
                } => {
                    let mut offset = 0;
                    for (idx, name) in field_names.iter().enumerate() {
                        if name == field {
                            return offset;
                        }
                        offset += field_types[idx].size_of(symbols);
                        if idx + 1 < field_types.len() {
                            offset = round_up(offset, field_types[idx + 1].align_of(symbols));
                        }
                    }
                    unreachable!("no field named {field} despite typechecking")
                }
                SymbolKind::Union { .. } => 0,
                SymbolKind::Typedef { actual } => actual.struct_offset_of(field, symbols),
                _ => unreachable!("field access on a non-compound symbol"),
            },
            _ => unreachable!("field access on a non-compound type"),
        }
    }
}

/// Rounds `value` up to the next multiple of `multiple`; zero multiples
/// leave the value alone.
fn round_up(value: u64, multiple: u64) -> u64 {
    if multiple == 0 || value % multiple == 0 {
        value
    } else {
        value + multiple - value % multiple
    }
}

/// Struct-style layout: each member padded to the next member's alignment,
/// trailing-padded to the whole's alignment.
fn layout_size(members: &[Type], whole_align: u64, symbols: &SymbolTable) -> u64 {
    let mut size = 0;
    for (idx, member) in members.iter().enumerate() {
        size += member.size_of(symbols);
        if idx + 1 < members.len() {
            size = round_up(size, members[idx + 1].align_of(symbols));
        } else {
            size = round_up(size, whole_align);
        }
    }
    size
}

/// Does `lhs` carry every qualifier `rhs` does?
fn at_least_as_cv(lhs: &Type, rhs: &Type) -> bool {
    rhs.quals() - lhs.quals() == Qualifiers::empty()
}

/// Pointer-base implicit convertibility: at least as CV-qualified, and
/// void on either side, equal bases, or pointers all the way down.
fn pointer_base_convertible(from: &Type, to: &Type) -> bool {
    let from_base = from.strip_cv();
    let to_base = to.strip_cv();
    at_least_as_cv(to, from)
        && (from_base.as_keyword() == Some(TypeKeyword::Void)
            || to_base.as_keyword() == Some(TypeKeyword::Void)
            || from_base == to_base
            || match (from_base, to_base) {
                (Type::Pointer { base: f }, Type::Pointer { base: t }) => {
                    pointer_base_convertible(f, t)
                }
                _ => false,
            })
}

/// Keyword-to-keyword implicit conversion table.
fn keyword_convertible(from: TypeKeyword, to: TypeKeyword) -> bool {
    use TypeKeyword::*;
    match to {
        Ubyte => from == Ubyte,
        Byte => from == Byte,
        Char => from == Char,
        Ushort => matches!(from, Ubyte | Ushort),
        Short => matches!(from, Ubyte | Byte | Short),
        Uint => matches!(from, Ubyte | Ushort | Uint),
        Int => matches!(from, Ubyte | Byte | Ushort | Short | Int),
        Wchar => matches!(from, Char | Wchar),
        Ulong => matches!(from, Ubyte | Ushort | Uint | Ulong),
        Long => matches!(from, Ubyte | Byte | Ushort | Short | Uint | Int | Long),
        Float => matches!(
            from,
            Ubyte | Byte | Ushort | Short | Uint | Int | Ulong | Long | Float
        ),
        Double => matches!(
            from,
            Ubyte | Byte | Ushort | Short | Uint | Int | Ulong | Long | Float | Double
        ),
        Bool => from == Bool,
        Void => false,
    }
}

/// Is `from` implicitly convertible to `to`?
pub fn implicitly_convertible(from: &Type, to: &Type, symbols: &SymbolTable) -> bool {
    let from = from.strip_cv();
    let to = to.strip_cv();

    match (from, to) {
        (Type::Keyword(f), Type::Keyword(t)) => keyword_convertible(*f, *t),
        (Type::Pointer { base: f }, Type::Pointer { base: t }) => {
            pointer_base_convertible(f, t)
        }
        (Type::Array { base: f, .. }, Type::Pointer { base: t }) => {
            // array-to-pointer decay
            at_least_as_cv(t, f)
                && (f.strip_cv() == t.strip_cv()
                    || t.strip_cv().as_keyword() == Some(TypeKeyword::Void))
        }
        (Type::Aggregate { members }, Type::Array { length, base }) => {
            members.len() as u64 == *length
                && members
                    .iter()
                    .all(|m| implicitly_convertible(m, base, symbols))
        }
        (Type::Aggregate { members }, Type::Reference(id)) => {
            match &symbols.get(*id).kind {
                SymbolKind::Struct { field_types, .. } => {
                    members.len() == field_types.len()
                        && members
                            .iter()
                            .zip(field_types)
                            .all(|(m, f)| implicitly_convertible(m, f, symbols))
                }
                _ => false,
            }
        }
        _ => from == to,
    }
}

/// Is `from` explicitly convertible (castable) to `to`?
pub fn explicitly_convertible(from: &Type, to: &Type, symbols: &SymbolTable) -> bool {
    let from = from.strip_cv();
    let to = to.strip_cv();

    if implicitly_convertible(from, to, symbols) {
        return true;
    }
    if (from.is_numeric() || from.is_character()) && (to.is_numeric() || to.is_character()) {
        return true;
    }
    if (from.is_integral() || from.is_any_pointer())
        && (to.is_integral() || to.is_any_pointer())
    {
        return true;
    }
    // typedefs are transparent to casts, on either side
    let unwraps = |t: &Type, other: &Type| match t {
        Type::Reference(id) => match &symbols.get(*id).kind {
            SymbolKind::Typedef { actual } => actual == other,
            _ => false,
        },
        _ => false,
    };
    if unwraps(to, from) || unwraps(from, to) {
        return true;
    }
    if (from.is_boolean() && to.is_numeric()) || (from.is_numeric() && to.is_boolean()) {
        return true;
    }
    if (from.is_numeric() && to.is_enum(symbols)) || (from.is_enum(symbols) && to.is_numeric()) {
        return true;
    }
    false
}

/// Keyword promotion matrix for integer pairs. `None` means no safe merge
/// exists (`ulong` against any signed type).
fn keyword_merge(a: TypeKeyword, b: TypeKeyword) -> Option<TypeKeyword> {
    use TypeKeyword::*;
    match a {
        Ubyte => match b {
            Ubyte => Some(a),
            Byte => Some(Short),
            _ => Some(b),
        },
        Byte => match b {
            Ubyte => Some(Short),
            Byte => Some(a),
            Ushort => Some(Int),
            Uint => Some(Long),
            Ulong => None,
            _ => Some(b),
        },
        Ushort => match b {
            Ubyte | Ushort => Some(a),
            Byte | Short => Some(Int),
            _ => Some(b),
        },
        Short => match b {
            Ubyte | Byte | Short => Some(a),
            Ushort => Some(Int),
            Uint => Some(Long),
            Ulong => None,
            _ => Some(b),
        },
        Uint => match b {
            Ubyte | Ushort | Uint => Some(a),
            Ulong => None,
            _ => Some(Long),
        },
        Int => match b {
            Uint | Long => Some(Long),
            Ulong => None,
            _ => Some(a),
        },
        Ulong => {
            if b.unsigned_integral() {
                Some(a)
            } else {
                None
            }
        }
        Long => {
            if b == Ulong {
                None
            } else {
                Some(a)
            }
        }
        _ => unreachable!("non-integral keyword in merge matrix"),
    }
}

/// Merges the operand types of an arithmetic expression. Char types never
/// merge; doubles absorb everything, floats absorb the integers.
pub fn arithmetic_merge(a: &Type, b: &Type) -> Option<Type> {
    if !a.is_numeric() || !b.is_numeric() {
        return None;
    }
    let ka = a.strip_cv().as_keyword()?;
    let kb = b.strip_cv().as_keyword()?;

    use TypeKeyword::*;
    if ka == Double || kb == Double {
        Some(Type::Keyword(Double))
    } else if ka == Float || kb == Float {
        Some(Type::Keyword(Float))
    } else {
        keyword_merge(ka, kb).map(Type::Keyword)
    }
}

fn ternary_pointer_base_merge(a: &Type, b: &Type) -> Type {
    let quals = a.quals() | b.quals();
    if !quals.is_empty() {
        Type::qualified(ternary_pointer_base_merge(a.strip_cv(), b.strip_cv()), quals)
    } else if a == b {
        a.clone()
    } else {
        Type::Keyword(TypeKeyword::Void)
    }
}

/// Merges the branch types of a ternary expression.
pub fn ternary_merge(a: &Type, b: &Type) -> Option<Type> {
    let quals = a.quals() | b.quals();
    if !quals.is_empty() {
        return Some(Type::qualified(
            ternary_merge(a.strip_cv(), b.strip_cv())?,
            quals,
        ));
    }
    if a == b {
        Some(a.clone())
    } else if a.is_numeric() && b.is_numeric() {
        arithmetic_merge(a, b)
    } else if a.is_character() && b.is_character() {
        Some(Type::Keyword(TypeKeyword::Wchar))
    } else if let (Type::Pointer { base: pa }, Type::Pointer { base: pb }) = (a, b) {
        Some(Type::pointer(ternary_pointer_base_merge(pa, pb)))
    } else {
        None
    }
}

/// Merges the operand types of a comparison.
pub fn comparison_merge(a: &Type, b: &Type, symbols: &SymbolTable) -> Option<Type> {
    let a = a.strip_cv();
    let b = b.strip_cv();

    if (a.is_numeric() || a.is_character()) && (b.is_numeric() || b.is_character()) {
        ternary_merge(a, b)
    } else if a.is_boolean() && b.is_boolean() {
        Some(a.clone())
    } else if a.is_enum(symbols) && b.is_enum(symbols) {
        Some(a.clone())
    } else if a.is_pointer()
        && b.is_pointer()
        && (implicitly_convertible(a, b, symbols) || implicitly_convertible(b, a, symbols))
    {
        Some(Type::pointer(Type::Keyword(TypeKeyword::Void)))
    } else {
        None
    }
}

/// Does `t`'s size depend directly on `entry`'s size?
fn directly_references(t: &Type, entry: SymbolId) -> bool {
    match t {
        Type::Keyword(_) | Type::Pointer { .. } | Type::FunPtr { .. } => false,
        Type::Qualified { base, .. } => directly_references(base, entry),
        Type::Array { base, .. } => directly_references(base, entry),
        Type::Aggregate { members } => members.iter().any(|m| directly_references(m, entry)),
        Type::Reference(id) => *id == entry,
    }
}

/// Is the struct infinitely recursive (a field contains the struct itself
/// by value)?
pub fn struct_recursive(entry: SymbolId, symbols: &SymbolTable) -> bool {
    match &symbols.get(entry).kind {
        SymbolKind::Struct { field_types, .. } => field_types
            .iter()
            .any(|t| directly_references(t, entry)),
        _ => unreachable!("recursion probe on a non-struct symbol"),
    }
}

/// Is the union infinitely recursive?
pub fn union_recursive(entry: SymbolId, symbols: &SymbolTable) -> bool {
    match &symbols.get(entry).kind {
        SymbolKind::Union { option_types, .. } => option_types
            .iter()
            .any(|t| directly_references(t, entry)),
        _ => unreachable!("recursion probe on a non-union symbol"),
    }
}

/// Is the typedef infinitely recursive?
pub fn typedef_recursive(entry: SymbolId, symbols: &SymbolTable) -> bool {
    match &symbols.get(entry).kind {
        SymbolKind::Typedef { actual } => directly_references(actual, entry),
        _ => unreachable!("recursion probe on a non-typedef symbol"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    fn kw(k: TypeKeyword) -> Type {
        Type::Keyword(k)
    }

    fn point3(symbols: &mut SymbolTable) -> Type {
        let id = symbols.insert_local(
            "point3",
            SymbolKind::Struct {
                field_names: vec!["x".into(), "y".into(), "tag".into()],
                field_types: vec![
                    kw(TypeKeyword::Int),
                    kw(TypeKeyword::Long),
                    kw(TypeKeyword::Char),
                ],
            },
        );
        Type::Reference(id)
    }

    #[rstest]
    #[case(TypeKeyword::Ubyte, TypeKeyword::Byte, Some(TypeKeyword::Short))]
    #[case(TypeKeyword::Byte, TypeKeyword::Ushort, Some(TypeKeyword::Int))]
    #[case(TypeKeyword::Short, TypeKeyword::Uint, Some(TypeKeyword::Long))]
    #[case(TypeKeyword::Int, TypeKeyword::Uint, Some(TypeKeyword::Long))]
    #[case(TypeKeyword::Int, TypeKeyword::Ulong, None)]
    #[case(TypeKeyword::Long, TypeKeyword::Ulong, None)]
    #[case(TypeKeyword::Ulong, TypeKeyword::Uint, Some(TypeKeyword::Ulong))]
    #[case(TypeKeyword::Float, TypeKeyword::Long, Some(TypeKeyword::Float))]
    #[case(TypeKeyword::Float, TypeKeyword::Double, Some(TypeKeyword::Double))]
    fn merge_matrix(
        #[case] a: TypeKeyword,
        #[case] b: TypeKeyword,
        #[case] expected: Option<TypeKeyword>,
    ) {
        assert_eq!(
            arithmetic_merge(&kw(a), &kw(b)),
            expected.map(Type::Keyword)
        );
    }

    proptest! {
        #[test]
        fn merge_is_commutative(
            a in prop::sample::select(TypeKeyword::iter().collect::<Vec<_>>()),
            b in prop::sample::select(TypeKeyword::iter().collect::<Vec<_>>()),
        ) {
            prop_assert_eq!(
                arithmetic_merge(&kw(a), &kw(b)),
                arithmetic_merge(&kw(b), &kw(a))
            );
        }

        #[test]
        fn array_size_scales(len in 1u64..64) {
            let symbols = SymbolTable::new();
            let arr = Type::array(len, kw(TypeKeyword::Wchar));
            prop_assert_eq!(arr.size_of(&symbols), len * 4);
        }
    }

    #[test]
    fn struct_layout_pads_fields() {
        let mut symbols = SymbolTable::new();
        let s = point3(&mut symbols);
        // int (4) + pad(4) + long (8) + char (1) + trailing pad to 8
        assert_eq!(s.size_of(&symbols), 24);
        assert_eq!(s.align_of(&symbols), 8);
        assert_eq!(s.size_of(&symbols) % s.align_of(&symbols), 0);
        assert_eq!(s.struct_offset_of("x", &symbols), 0);
        assert_eq!(s.struct_offset_of("y", &symbols), 8);
        assert_eq!(s.struct_offset_of("tag", &symbols), 16);
    }

    #[test]
    fn union_size_is_max_member() {
        let mut symbols = SymbolTable::new();
        let id = symbols.insert_local(
            "either",
            SymbolKind::Union {
                option_names: vec!["i".into(), "d".into()],
                option_types: vec![kw(TypeKeyword::Int), kw(TypeKeyword::Double)],
            },
        );
        let u = Type::Reference(id);
        assert_eq!(u.size_of(&symbols), 8);
        assert_eq!(u.align_of(&symbols), 8);
    }

    #[test]
    fn enum_follows_backing_type() {
        let mut symbols = SymbolTable::new();
        let id = symbols.insert_local(
            "color",
            SymbolKind::Enum {
                constant_names: vec!["red".into(), "green".into()],
                backing: kw(TypeKeyword::Ushort),
            },
        );
        let e = Type::Reference(id);
        assert_eq!(e.size_of(&symbols), 2);
        assert_eq!(e.allocation_hint(&symbols), AllocHint::Gp);
        assert!(e.is_switchable(&symbols));
    }

    #[rstest]
    #[case(TypeKeyword::Ubyte, TypeKeyword::Ushort, true)]
    #[case(TypeKeyword::Ubyte, TypeKeyword::Float, true)]
    #[case(TypeKeyword::Char, TypeKeyword::Wchar, true)]
    #[case(TypeKeyword::Wchar, TypeKeyword::Char, false)]
    #[case(TypeKeyword::Bool, TypeKeyword::Int, false)]
    #[case(TypeKeyword::Int, TypeKeyword::Uint, false)]
    #[case(TypeKeyword::Float, TypeKeyword::Double, true)]
    fn keyword_promotions(
        #[case] from: TypeKeyword,
        #[case] to: TypeKeyword,
        #[case] expected: bool,
    ) {
        let symbols = SymbolTable::new();
        assert_eq!(
            implicitly_convertible(&kw(from), &kw(to), &symbols),
            expected
        );
    }

    #[test]
    fn pointer_conversions_respect_cv() {
        let symbols = SymbolTable::new();
        let int_ptr = Type::pointer(kw(TypeKeyword::Int));
        let const_int_ptr = Type::pointer(Type::qualified(
            kw(TypeKeyword::Int),
            Qualifiers::CONST,
        ));
        let void_ptr = Type::pointer(kw(TypeKeyword::Void));

        assert!(implicitly_convertible(&int_ptr, &const_int_ptr, &symbols));
        assert!(!implicitly_convertible(&const_int_ptr, &int_ptr, &symbols));
        assert!(implicitly_convertible(&int_ptr, &void_ptr, &symbols));
        assert!(implicitly_convertible(&void_ptr, &int_ptr, &symbols));
    }

    #[test]
    fn array_decays_to_pointer() {
        let symbols = SymbolTable::new();
        let arr = Type::array(4, kw(TypeKeyword::Short));
        assert!(implicitly_convertible(
            &arr,
            &Type::pointer(kw(TypeKeyword::Short)),
            &symbols
        ));
        assert!(!implicitly_convertible(
            &arr,
            &Type::pointer(kw(TypeKeyword::Int)),
            &symbols
        ));
    }

    #[test]
    fn aggregate_initializes_struct_and_array() {
        let mut symbols = SymbolTable::new();
        let s = point3(&mut symbols);
        let agg = Type::Aggregate {
            members: vec![
                kw(TypeKeyword::Int),
                kw(TypeKeyword::Long),
                kw(TypeKeyword::Char),
            ],
        };
        assert!(implicitly_convertible(&agg, &s, &symbols));

        let agg2 = Type::Aggregate {
            members: vec![kw(TypeKeyword::Ubyte), kw(TypeKeyword::Ubyte)],
        };
        assert!(implicitly_convertible(
            &agg2,
            &Type::array(2, kw(TypeKeyword::Uint)),
            &symbols
        ));
        assert!(!implicitly_convertible(
            &agg2,
            &Type::array(3, kw(TypeKeyword::Uint)),
            &symbols
        ));
    }

    #[test]
    fn explicit_casts_widen_the_lattice() {
        let symbols = SymbolTable::new();
        assert!(explicitly_convertible(
            &kw(TypeKeyword::Double),
            &kw(TypeKeyword::Char),
            &symbols
        ));
        assert!(explicitly_convertible(
            &Type::pointer(kw(TypeKeyword::Int)),
            &kw(TypeKeyword::Ulong),
            &symbols
        ));
        assert!(explicitly_convertible(
            &kw(TypeKeyword::Bool),
            &kw(TypeKeyword::Int),
            &symbols
        ));
        assert!(!explicitly_convertible(
            &Type::pointer(kw(TypeKeyword::Int)),
            &kw(TypeKeyword::Double),
            &symbols
        ));
    }

    #[test]
    fn ternary_merge_unifies_pointers() {
        let a = Type::pointer(Type::qualified(kw(TypeKeyword::Int), Qualifiers::CONST));
        let b = Type::pointer(kw(TypeKeyword::Int));
        let merged = ternary_merge(&a, &b).expect("pointers merge");
        assert_eq!(
            merged,
            Type::pointer(Type::qualified(kw(TypeKeyword::Int), Qualifiers::CONST))
        );
    }

    #[test]
    fn completeness_follows_the_referent() {
        let mut symbols = SymbolTable::new();
        let opaque = symbols.insert_local("handle", SymbolKind::Opaque);
        assert!(!Type::Reference(opaque).is_complete(&symbols));
        assert!(Type::pointer(Type::Reference(opaque)).is_complete(&symbols));
        assert!(!kw(TypeKeyword::Void).is_complete(&symbols));
        assert!(!Type::array(0, kw(TypeKeyword::Int)).is_complete(&symbols));
        assert!(Type::array(3, kw(TypeKeyword::Int)).is_complete(&symbols));
    }

    #[test]
    fn recursion_probes() {
        let mut symbols = SymbolTable::new();
        let id = symbols.insert_local(
            "node",
            SymbolKind::Struct {
                field_names: vec!["next".into()],
                field_types: vec![],
            },
        );
        // by pointer: fine
        match &mut symbols.get_mut(id).kind {
            SymbolKind::Struct { field_types, .. } => {
                field_types.push(Type::pointer(Type::Reference(id)));
            }
            _ => unreachable!(),
        }
        assert!(!struct_recursive(id, &symbols));
        // by value: infinite
        match &mut symbols.get_mut(id).kind {
            SymbolKind::Struct { field_types, .. } => {
                field_types.push(Type::Reference(id));
            }
            _ => unreachable!(),
        }
        assert!(struct_recursive(id, &symbols));
    }
}
