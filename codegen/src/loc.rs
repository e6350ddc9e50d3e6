//! The variable-location model.
//!
//! A [`Loc`] describes *where* a value currently resides: a register, a
//! stack slot, static memory behind a label, a compile-time constant, a
//! deferred branch condition, or an address computation built from other
//! locations. Locations are allocated from a per-function arena
//! ([`LocArena`]) and addressed by entity reference, so locations can refer
//! to each other (a pointer to the location holding the pointer value, the
//! canonical spill slot of a register-resident variable) without ownership
//! cycles. The arena is cleared wholesale when the function is done.

use crate::types::Type;
use crate::{CodeOffset, Word};
use lilycc_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a location in the current function's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Loc(u32);
entity_impl!(Loc, "loc");

/// Where a value currently lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocKind {
    /// No storage at all (void returns).
    Void,
    /// A compile-time constant embedded in the instruction stream.
    Const(Word),
    /// Static memory at a named label.
    Label(String),
    /// In the current call frame, at a positive offset from the frame base.
    StackOffset(CodeOffset),
    /// In the caller's frame (stack-passed parameters).
    StackFrame(CodeOffset),
    /// Live in a register; multi-word values occupy `reg .. reg+size`.
    Register(u8),
    /// The ABI-mandated return-value slot, resolved at emission time.
    ReturnValue,
    /// A deferred branch condition: the value is whatever the flags
    /// register currently says, interpreted by the target condition code.
    Condition(u8),
    /// Dereference of the pointer held in another location.
    Pointer(Loc),
    /// `base[index]`. `combined` caches the materialised pointer once an
    /// access has had to compute it.
    Indexed {
        base: Loc,
        index: Loc,
        combined: Option<Loc>,
    },
    /// Declared but not yet written. Reads warn and substitute the
    /// location's `default_loc`; the first write replaces it.
    Unassigned,
}

/// A location plus the metadata every location carries.
#[derive(Clone, Debug)]
pub struct LocData {
    pub kind: LocKind,
    /// The C type of the value held here.
    pub ty: Type,
    /// Source-level name of the owning variable, if any.
    pub owner: Option<String>,
    /// Canonical spill location used when this value must be evicted.
    pub default_loc: Option<Loc>,
}

impl LocData {
    /// A location with no owner and no spill home.
    pub fn anon(kind: LocKind, ty: Type) -> Self {
        Self {
            kind,
            ty,
            owner: None,
            default_loc: None,
        }
    }
}

/// The per-function location arena.
pub type LocArena = PrimaryMap<Loc, LocData>;

/// Structural equivalence of two locations.
///
/// Used by the mover to elide no-op copies and to detect "destination
/// already equals source". Condition locations compare by condition code,
/// constants by value, registers by number, and pointers recursively.
pub fn locations_equivalent(arena: &LocArena, a: Loc, b: Loc) -> bool {
    if a == b {
        return true;
    }
    let (da, db) = (&arena[a], &arena[b]);
    match (&da.kind, &db.kind) {
        (LocKind::Void, LocKind::Void) => true,
        (LocKind::Const(x), LocKind::Const(y)) => x == y,
        (LocKind::Label(x), LocKind::Label(y)) => x == y,
        (LocKind::StackOffset(x), LocKind::StackOffset(y)) => x == y,
        (LocKind::StackFrame(x), LocKind::StackFrame(y)) => x == y,
        (LocKind::Register(x), LocKind::Register(y)) => x == y,
        (LocKind::ReturnValue, LocKind::ReturnValue) => true,
        (LocKind::Condition(x), LocKind::Condition(y)) => x == y,
        (LocKind::Pointer(x), LocKind::Pointer(y)) => locations_equivalent(arena, *x, *y),
        _ => false,
    }
}

/// Whether a location kind refers to memory the instruction stream can
/// address directly (as opposed to registers, constants and conditions).
pub fn is_memory(arena: &LocArena, loc: Loc) -> bool {
    matches!(
        arena[loc].kind,
        LocKind::Label(_)
            | LocKind::StackOffset(_)
            | LocKind::StackFrame(_)
            | LocKind::Pointer(_)
            | LocKind::Indexed { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lilycc_entity::EntityRef;

    fn ty() -> Type {
        Type::new(0)
    }

    #[test]
    fn equivalence() {
        let mut arena = LocArena::new();
        let c1 = arena.push(LocData::anon(LocKind::Const(4), ty()));
        let c2 = arena.push(LocData::anon(LocKind::Const(4), ty()));
        let c3 = arena.push(LocData::anon(LocKind::Const(5), ty()));
        assert!(locations_equivalent(&arena, c1, c2));
        assert!(!locations_equivalent(&arena, c1, c3));

        let r1 = arena.push(LocData::anon(LocKind::Register(2), ty()));
        let r2 = arena.push(LocData::anon(LocKind::Register(2), ty()));
        assert!(locations_equivalent(&arena, r1, r2));
        assert!(!locations_equivalent(&arena, r1, c1));

        // Pointer equivalence is structural through the pointee location.
        let p1 = arena.push(LocData::anon(LocKind::Pointer(r1), ty()));
        let p2 = arena.push(LocData::anon(LocKind::Pointer(r2), ty()));
        assert!(locations_equivalent(&arena, p1, p2));
    }
}
