//! Scoped register occupancy, stack accounting and the temp-slot pool.
//!
//! Each lexical scope carries its own register-occupancy snapshot and the
//! two stack counters. The occupancy array maps register units to the
//! location currently bound there; entries are validated lazily, because an
//! eviction rewrites the occupant's location data in place and outer-scope
//! snapshots are not chased down to be corrected.
//!
//! The temp pool hands out anonymous intermediate-value slots. It grows
//! monotonically within a function and slots are reused first-fit/LIFO as
//! they are released with [`unuse`]. On targets with stack-relative
//! addressing the slots are words in the frame; on memory machines they are
//! `<func>.LT<n>` labels in `.bss`.

use crate::context::{CompileCtx, MAX_REG_UNITS};
use crate::diag::{CodegenError, CodegenResult};
use crate::isa::TargetIsa;
use crate::loc::{Loc, LocData, LocKind};
use crate::CodeOffset;
use rustc_hash::FxHashMap;

/// One lexical scope.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    /// Identifiers bound in this scope.
    pub vars: FxHashMap<String, Loc>,
    /// Register occupancy: which location currently claims each unit.
    pub regs: [Option<Loc>; MAX_REG_UNITS],
    /// The compiler's logical count of words pushed in this frame.
    pub stack_size: CodeOffset,
    /// How far the hardware stack pointer has actually been moved.
    pub real_stack_size: CodeOffset,
}

/// The validated occupant of a register, if any.
///
/// An occupancy entry is only trusted if the occupant's location data still
/// claims a register range covering this unit; anything else is a stale
/// snapshot entry and reads as free.
pub fn occupant(ctx: &CompileCtx, reg: u8) -> Option<Loc> {
    let occ = ctx.scope().regs[reg as usize]?;
    if !ctx.locs.is_valid(occ) {
        return None;
    }
    match ctx.locs[occ].kind {
        LocKind::Register(base) => {
            let size = ctx.size_of(occ).max(1) as u8;
            if base <= reg && reg < base + size {
                Some(occ)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Whether a register unit is free for the taking.
pub fn is_free(ctx: &CompileCtx, reg: u8) -> bool {
    occupant(ctx, reg).is_none() && !ctx.reg_lock[reg as usize]
}

/// Bump a register to the top of the LRU order.
pub fn touch_reg(ctx: &mut CompileCtx, reg: u8) {
    let n = ctx.asm.config().reg_count as usize;
    if let Some(pos) = ctx.reg_order[..n].iter().position(|r| *r == reg) {
        ctx.reg_order[..=pos].rotate_right(1);
        debug_assert_eq!(ctx.reg_order[0], reg);
    }
}

/// Mark a register as occupied by `loc` (which must be register-resident).
pub fn claim_reg(ctx: &mut CompileCtx, reg: u8, loc: Loc) {
    let size = ctx.size_of(loc).max(1) as u8;
    for unit in reg..reg + size {
        ctx.scope_mut().regs[unit as usize] = Some(loc);
        touch_reg(ctx, unit);
    }
}

/// Release a register's occupancy entry without generating code.
pub fn release_reg(ctx: &mut CompileCtx, reg: u8) {
    ctx.scope_mut().regs[reg as usize] = None;
}

/// Pick a register to use.
///
/// Prefers a free register; otherwise takes the least-recently-used
/// non-locked one, moving its occupant to its default location (or a fresh
/// temp slot) when `evict` is set. Fails only if every register is locked
/// for the current instruction.
pub fn pick_register(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    evict: bool,
) -> CodegenResult<u8> {
    let n = ctx.asm.config().reg_count;
    // Check for a free register.
    for reg in 0..n {
        if is_free(ctx, reg) {
            return Ok(reg);
        }
    }

    // Otherwise, free up the least recently used one.
    let mut pick = None;
    for i in 0..n as usize {
        let reg = ctx.reg_order[i];
        if reg < n && !ctx.reg_lock[reg as usize] {
            pick = Some(reg);
        }
    }
    let pick = pick.ok_or(CodegenError::RegistersExhausted)?;

    if evict {
        vacate_reg(isa, ctx, pick)?;
    } else {
        release_reg(ctx, pick);
    }
    touch_reg(ctx, pick);
    Ok(pick)
}

/// Pick the first free run of `size` registers, without evicting.
pub fn pick_empty_regs(ctx: &CompileCtx, size: CodeOffset) -> Option<u8> {
    let n = ctx.asm.config().reg_count;
    if size == 0 || size > n as CodeOffset {
        return None;
    }
    let mut run = 0u32;
    for reg in 0..n {
        if occupant(ctx, reg).is_none() {
            run += 1;
            if run >= size {
                return Some(reg + 1 - size as u8);
            }
        } else {
            run = 0;
        }
    }
    None
}

/// Force-evict whatever lives in a register.
///
/// The occupant is copied to its default location if it has a non-register
/// one, otherwise to a fresh temp slot, and the occupant's location data is
/// rewritten in place so every holder of the `Loc` sees the move.
pub fn vacate_reg(isa: &dyn TargetIsa, ctx: &mut CompileCtx, reg: u8) -> CodegenResult<()> {
    let stored = match occupant(ctx, reg) {
        Some(loc) => loc,
        None => {
            release_reg(ctx, reg);
            return Ok(());
        }
    };
    let base = match ctx.locs[stored].kind {
        LocKind::Register(base) => base,
        _ => unreachable!("validated occupant is register-resident"),
    };
    let size = ctx.size_of(stored).max(1) as u8;

    let default_loc = ctx.locs[stored].default_loc;
    let target = match default_loc {
        Some(d) if !matches!(ctx.locs[d].kind, LocKind::Register(_)) => {
            log::debug!("vacate r{reg}: to default location");
            d
        }
        _ => {
            let tmp = get_tmp(ctx, size as CodeOffset, false)?;
            ctx.locs[tmp].ty = ctx.locs[stored].ty;
            log::debug!("vacate r{reg}: to temp slot");
            tmp
        }
    };

    isa.emit_mov(ctx, target, stored)?;
    // Rewrite the old owner's location in place.
    let new_kind = ctx.locs[target].kind.clone();
    ctx.locs[stored].kind = new_kind;
    for unit in base..base + size {
        release_reg(ctx, unit);
    }
    Ok(())
}

/// Gets or adds a temp slot run of `size` words.
///
/// Tries a free register first when `allow_reg` is set, then scans the pool
/// for a free run, then extends the pool.
pub fn get_tmp(ctx: &mut CompileCtx, size: CodeOffset, allow_reg: bool) -> CodegenResult<Loc> {
    debug_assert!(size >= 1);
    let word = ctx.types.simple(crate::types::SimpleType::UInt);

    if allow_reg {
        if let Some(reg) = pick_empty_regs(ctx, size) {
            let loc = ctx.alloc_anon(LocKind::Register(reg), word);
            // Claim the whole requested run; the caller sets the real type
            // (of the same width) right after.
            for unit in reg..reg + size as u8 {
                ctx.scope_mut().regs[unit as usize] = Some(loc);
                touch_reg(ctx, unit);
            }
            return Ok(loc);
        }
    }

    // Check existing slots for a free run.
    let mut remaining = size;
    for i in 0..ctx.temp_usage.len() {
        if !ctx.temp_usage[i] {
            remaining -= 1;
        } else {
            remaining = size;
        }
        if remaining == 0 {
            let index = i + 1 - size as usize;
            for slot in index..=i {
                ctx.temp_usage[slot] = true;
            }
            return Ok(tmp_loc(ctx, index, size, word));
        }
    }

    // Make some more.
    let index = ctx.temp_usage.len();
    for _ in 0..size {
        let no = ctx.cur.as_mut().expect("inside a function").temp_no;
        ctx.cur.as_mut().unwrap().temp_no += 1;
        let label = format!("{}.LT{:04x}", ctx.func_name(), no);
        if !ctx.asm.config().stack_temps {
            ctx.asm.bss_label(&label, 1);
        }
        ctx.temp_labels.push(label);
        ctx.temp_usage.push(true);
    }
    if ctx.asm.config().stack_temps {
        ctx.scope_mut().stack_size += size;
    }
    Ok(tmp_loc(ctx, index, size, word))
}

fn tmp_loc(ctx: &mut CompileCtx, index: usize, size: CodeOffset, ty: crate::types::Type) -> Loc {
    if ctx.asm.config().stack_temps {
        let offset = ctx.temp_base + index as CodeOffset;
        debug_assert!(offset + size <= ctx.scope().stack_size);
        ctx.alloc_anon(LocKind::StackOffset(offset), ty)
    } else {
        let label = ctx.temp_labels[index].clone();
        ctx.alloc_anon(LocKind::Label(label), ty)
    }
}

/// Free whichever resources a location claims: register units back to the
/// pool, temp slots back to the free list.
///
/// Named variables are left alone; their storage lives until their scope
/// ends, however often their value is read.
pub fn unuse(ctx: &mut CompileCtx, loc: Loc) {
    if ctx.locs[loc].owner.is_some() {
        return;
    }
    let size = ctx.size_of(loc).max(1);
    match ctx.locs[loc].kind.clone() {
        LocKind::Register(reg) => {
            for unit in reg..reg + size as u8 {
                if occupant(ctx, unit) == Some(loc) {
                    release_reg(ctx, unit);
                }
            }
        }
        LocKind::StackOffset(offset) if ctx.asm.config().stack_temps => {
            if offset >= ctx.temp_base {
                let index = (offset - ctx.temp_base) as usize;
                if index < ctx.temp_usage.len() {
                    for slot in index..(index + size as usize).min(ctx.temp_usage.len()) {
                        ctx.temp_usage[slot] = false;
                    }
                }
            }
        }
        LocKind::Label(label) => {
            if let Some(index) = ctx.temp_labels.iter().position(|l| *l == label) {
                for slot in index..(index + size as usize).min(ctx.temp_usage.len()) {
                    ctx.temp_usage[slot] = false;
                }
            }
        }
        LocKind::Pointer(inner) => unuse(ctx, inner),
        LocKind::Indexed {
            base,
            index,
            combined,
        } => {
            unuse(ctx, base);
            unuse(ctx, index);
            if let Some(combined) = combined {
                unuse(ctx, combined);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{lookup, Flags};
    use crate::types::SimpleType;

    fn ctx_with_isa() -> (Box<dyn TargetIsa>, CompileCtx) {
        let isa = lookup("px16").unwrap().finish(Flags::default()).unwrap();
        let mut ctx = CompileCtx::new(&*isa, "test.c");
        let sig = crate::ast::FuncSig {
            pos: Default::default(),
            name: "f".to_string(),
            ret: ctx.types.simple(SimpleType::SInt),
            params: Vec::new(),
            defined: true,
        };
        ctx.begin_function(sig);
        ctx.push_scope();
        (isa, ctx)
    }

    #[test]
    fn free_registers_first() {
        let (isa, mut ctx) = ctx_with_isa();
        let int = ctx.types.simple(SimpleType::SInt);
        // Claim r0 and r1.
        for reg in 0..2u8 {
            let loc = ctx.alloc_anon(LocKind::Register(reg), int);
            claim_reg(&mut ctx, reg, loc);
        }
        let pick = pick_register(&*isa, &mut ctx, false).unwrap();
        assert!(pick >= 2, "picked occupied register r{pick}");
    }

    #[test]
    fn lru_eviction_skips_locked() {
        let (isa, mut ctx) = ctx_with_isa();
        let int = ctx.types.simple(SimpleType::SInt);
        for reg in 0..4u8 {
            let loc = ctx.alloc_anon(LocKind::Register(reg), int);
            claim_reg(&mut ctx, reg, loc);
        }
        // r0 is the least recently used now; lock it.
        touch_reg(&mut ctx, 3);
        touch_reg(&mut ctx, 2);
        touch_reg(&mut ctx, 1);
        ctx.reg_lock[0] = true;
        let pick = pick_register(&*isa, &mut ctx, false).unwrap();
        assert_ne!(pick, 0, "picked a locked register");

        // With everything locked, picking must fail.
        ctx.reg_lock = [true; MAX_REG_UNITS];
        assert!(matches!(
            pick_register(&*isa, &mut ctx, false),
            Err(CodegenError::RegistersExhausted)
        ));
    }

    #[test]
    fn empty_run_selection() {
        let (_isa, mut ctx) = ctx_with_isa();
        let int = ctx.types.simple(SimpleType::SInt);
        // Occupy r1 only: the only run of two free registers is r2..r3.
        let loc = ctx.alloc_anon(LocKind::Register(1), int);
        claim_reg(&mut ctx, 1, loc);
        assert_eq!(pick_empty_regs(&ctx, 1), Some(0));
        assert_eq!(pick_empty_regs(&ctx, 2), Some(2));
        assert_eq!(pick_empty_regs(&ctx, 3), None);
    }

    #[test]
    fn temp_pool_reuses_slots() {
        let (_isa, mut ctx) = ctx_with_isa();
        // Fill the registers so temps go to the stack pool.
        let int = ctx.types.simple(SimpleType::SInt);
        for reg in 0..4u8 {
            let loc = ctx.alloc_anon(LocKind::Register(reg), int);
            claim_reg(&mut ctx, reg, loc);
        }
        let a = get_tmp(&mut ctx, 1, false).unwrap();
        let b = get_tmp(&mut ctx, 2, false).unwrap();
        let a_offs = match ctx.locs[a].kind {
            LocKind::StackOffset(o) => o,
            ref k => panic!("expected stack temp, got {k:?}"),
        };
        unuse(&mut ctx, a);
        // A one-word request reuses the freed slot.
        let c = get_tmp(&mut ctx, 1, false).unwrap();
        assert_eq!(ctx.locs[c].kind, LocKind::StackOffset(a_offs));
        // A two-word request does not fit the one-word hole before `b`.
        unuse(&mut ctx, b);
        let d = get_tmp(&mut ctx, 2, false).unwrap();
        match ctx.locs[d].kind {
            LocKind::StackOffset(o) => assert_ne!(o, a_offs),
            ref k => panic!("expected stack temp, got {k:?}"),
        }
        // Pool grew by exactly the three live words.
        assert_eq!(ctx.temp_usage.len(), 3);
    }
}
