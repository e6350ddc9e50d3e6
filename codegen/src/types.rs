//! The C type model.
//!
//! Every expression and declared variable carries a [`Type`]: an entity
//! reference into the per-translation-unit [`TypePool`]. Descriptors are
//! interned, so two structurally equal types always compare equal by
//! reference and identity compare is a legal fast path for equality.
//!
//! Sizes are measured in target *memory words* (the unit the assembler
//! counts addresses in), so the pool is constructed from the target
//! configuration and the same source program can size its types differently
//! per target.

use crate::isa::TargetConfig;
use crate::CodeOffset;
use lilycc_entity::{entity_impl, PrimaryMap};
use rustc_hash::FxHashMap;

/// An opaque reference to an interned type descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Type(u32);
entity_impl!(Type, "ty");

/// An enumerated primitive type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SimpleType {
    Void,
    Bool,
    SChar,
    UChar,
    SShort,
    UShort,
    SInt,
    UInt,
    SLong,
    ULong,
    SLongLong,
    ULongLong,
    Float,
    Double,
    LongDouble,
    /// Sentinel used as the `simple_type` of pointers.
    Pointer,
}

/// Total number of simple types.
pub const N_SIMPLE: usize = 16;

impl SimpleType {
    /// All simple types, in declaration order.
    pub const ALL: [SimpleType; N_SIMPLE] = [
        SimpleType::Void,
        SimpleType::Bool,
        SimpleType::SChar,
        SimpleType::UChar,
        SimpleType::SShort,
        SimpleType::UShort,
        SimpleType::SInt,
        SimpleType::UInt,
        SimpleType::SLong,
        SimpleType::ULong,
        SimpleType::SLongLong,
        SimpleType::ULongLong,
        SimpleType::Float,
        SimpleType::Double,
        SimpleType::LongDouble,
        SimpleType::Pointer,
    ];

    /// Whether values of this type are sign-extended.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            SimpleType::SChar
                | SimpleType::SShort
                | SimpleType::SInt
                | SimpleType::SLong
                | SimpleType::SLongLong
        )
    }

    /// Whether this is one of the floating-point types.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            SimpleType::Float | SimpleType::Double | SimpleType::LongDouble
        )
    }

    /// Size of this type in bits on the given target.
    fn bits(self, cfg: &TargetConfig) -> u32 {
        match self {
            SimpleType::Void => 0,
            SimpleType::Bool => cfg.mem_bits,
            SimpleType::SChar | SimpleType::UChar => cfg.char_bits,
            SimpleType::SShort | SimpleType::UShort => cfg.short_bits,
            SimpleType::SInt | SimpleType::UInt => cfg.int_bits,
            SimpleType::SLong | SimpleType::ULong => cfg.long_bits,
            SimpleType::SLongLong | SimpleType::ULongLong => cfg.long_long_bits,
            SimpleType::Float => cfg.float_bits,
            SimpleType::Double => cfg.double_bits,
            SimpleType::LongDouble => cfg.long_double_bits,
            SimpleType::Pointer => cfg.addr_bits,
        }
    }
}

/// The category in which a type descriptor lies.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeData {
    /// One of the enumerated primitives.
    Simple(SimpleType),
    /// Pointer to another type.
    Pointer(Type),
    /// Array of another type, with the length if known.
    Array(Type, Option<u32>),
    /// Struct or union with an ordered field list.
    Compound {
        union: bool,
        complete: bool,
        fields: Vec<(String, Type)>,
    },
}

/// The interning pool for type descriptors.
///
/// One pool per translation unit. Simple types are pre-interned so they can
/// be fetched without a hash lookup.
pub struct TypePool {
    data: PrimaryMap<Type, TypeData>,
    sizes: Vec<CodeOffset>,
    interned: FxHashMap<TypeData, Type>,
    simple: [Type; N_SIMPLE],
    /// `char` maps to this when written without `signed`/`unsigned`.
    plain_char: SimpleType,
    addr_words: CodeOffset,
}

impl TypePool {
    /// Create a pool with the simple types of the given target pre-interned.
    pub fn new(cfg: &TargetConfig) -> Self {
        let mut pool = Self {
            data: PrimaryMap::new(),
            sizes: Vec::new(),
            interned: FxHashMap::default(),
            simple: [Type(0); N_SIMPLE],
            plain_char: if cfg.char_signed {
                SimpleType::SChar
            } else {
                SimpleType::UChar
            },
            addr_words: cfg.addr_words(),
        };
        for (i, st) in SimpleType::ALL.iter().enumerate() {
            let size = (st.bits(cfg) + cfg.mem_bits - 1) / cfg.mem_bits;
            pool.simple[i] = pool.intern(TypeData::Simple(*st), size);
        }
        pool
    }

    fn intern(&mut self, data: TypeData, size: CodeOffset) -> Type {
        if let Some(ty) = self.interned.get(&data) {
            return *ty;
        }
        let ty = self.data.push(data.clone());
        self.sizes.push(size);
        self.interned.insert(data, ty);
        ty
    }

    /// Get the interned descriptor for a simple type.
    pub fn simple(&self, st: SimpleType) -> Type {
        self.simple[st as usize]
    }

    /// The type plain `char` resolves to on this target.
    pub fn plain_char(&self) -> Type {
        self.simple(self.plain_char)
    }

    /// Get or create a pointer to `to`.
    pub fn pointer_to(&mut self, to: Type) -> Type {
        let size = self.addr_words;
        self.intern(TypeData::Pointer(to), size)
    }

    /// Get or create an array of `of`, `len` elements long (`None` if the
    /// length is not yet known).
    pub fn array_of(&mut self, of: Type, len: Option<u32>) -> Type {
        let size = self.size_words(of) * len.unwrap_or(0);
        self.intern(TypeData::Array(of, len), size)
    }

    /// The descriptor behind a type reference.
    pub fn data(&self, ty: Type) -> &TypeData {
        &self.data[ty]
    }

    /// Size of a type in target memory words.
    pub fn size_words(&self, ty: Type) -> CodeOffset {
        self.sizes[ty.0 as usize]
    }

    /// Structural equality. Because descriptors are interned this is just an
    /// identity compare.
    pub fn equals(&self, a: Type, b: Type) -> bool {
        a == b
    }

    /// Whether the type is complete (structs and unions may not be; arrays
    /// of unknown length are not).
    pub fn is_complete(&self, ty: Type) -> bool {
        match self.data(ty) {
            TypeData::Simple(_) | TypeData::Pointer(_) => true,
            TypeData::Array(_, len) => len.is_some(),
            TypeData::Compound { complete, .. } => *complete,
        }
    }

    /// The simple type underlying a descriptor, if it is a primitive.
    pub fn simple_type(&self, ty: Type) -> Option<SimpleType> {
        match self.data(ty) {
            TypeData::Simple(st) => Some(*st),
            TypeData::Pointer(_) => Some(SimpleType::Pointer),
            _ => None,
        }
    }

    /// Whether arithmetic on this type is signed.
    pub fn is_signed(&self, ty: Type) -> bool {
        self.simple_type(ty).map_or(false, SimpleType::is_signed)
    }

    /// Whether this is a floating-point type.
    pub fn is_float(&self, ty: Type) -> bool {
        self.simple_type(ty).map_or(false, SimpleType::is_float)
    }

    /// The element type of a pointer or array; pointer arithmetic scales by
    /// this type's size.
    pub fn underlying(&self, ty: Type) -> Option<Type> {
        match self.data(ty) {
            TypeData::Pointer(to) => Some(*to),
            TypeData::Array(of, _) => Some(*of),
            _ => None,
        }
    }

    /// Whether this is a pointer type.
    pub fn is_pointer(&self, ty: Type) -> bool {
        matches!(self.data(ty), TypeData::Pointer(_))
    }

    /// Whether this is an array type.
    pub fn is_array(&self, ty: Type) -> bool {
        matches!(self.data(ty), TypeData::Array(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::lookup;

    fn pool() -> TypePool {
        let isa = lookup("px16").unwrap().finish(Flags::default()).unwrap();
        TypePool::new(isa.config())
    }

    use crate::isa::Flags;

    #[test]
    fn interning_is_identity() {
        let mut p = pool();
        let int = p.simple(SimpleType::SInt);
        let a = p.pointer_to(int);
        let b = p.pointer_to(int);
        assert_eq!(a, b);
        assert!(p.equals(a, b));

        let c = p.array_of(int, Some(4));
        let d = p.array_of(int, Some(4));
        let e = p.array_of(int, Some(5));
        assert_eq!(c, d);
        assert_ne!(c, e);
    }

    #[test]
    fn px16_sizes() {
        // On px16 every integer up to int is one 16-bit word.
        let mut p = pool();
        assert_eq!(p.size_words(p.simple(SimpleType::SChar)), 1);
        assert_eq!(p.size_words(p.simple(SimpleType::SInt)), 1);
        assert_eq!(p.size_words(p.simple(SimpleType::SLong)), 2);
        assert_eq!(p.size_words(p.simple(SimpleType::SLongLong)), 4);
        let int = p.simple(SimpleType::SInt);
        let ptr = p.pointer_to(int);
        assert_eq!(p.size_words(ptr), 1);
        let arr = p.array_of(int, Some(8));
        assert_eq!(p.size_words(arr), 8);
    }

    #[test]
    fn signedness() {
        let p = pool();
        assert!(p.is_signed(p.simple(SimpleType::SInt)));
        assert!(!p.is_signed(p.simple(SimpleType::UInt)));
        // px16 chars are unsigned by default.
        assert!(!p.is_signed(p.plain_char()));
    }
}
