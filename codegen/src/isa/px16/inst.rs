//! Pixie 16: instruction encoding, addressing-mode selection and the
//! checked instruction writer.
//!
//! Every instruction packs into one 16-bit word, `y:1 x:3 b:3 a:3 o:6`,
//! optionally followed by one immediate word per `imm` register field. The
//! `y` flag selects which of the two operands the addressing mode `x`
//! applies to; the other operand is a plain register or an immediate.
//!
//! The stack grows towards lower addresses, `ST` pointing at the most
//! recently pushed word. `[ST]` with operand A is a push (pre-decrement),
//! with operand B a pop (post-increment); `[ST+n]` addresses the live
//! stack without moving `ST`.

use super::Px16Backend;
use crate::asm::LabelRefMode;
use crate::context::CompileCtx;
use crate::diag::{CodegenError, CodegenResult};
use crate::loc::{Loc, LocKind};
use crate::scope;
use crate::{CodeOffset, Word};

/* ================= Registers ================= */

pub const REG_R0: u8 = 0;
pub const REG_R1: u8 = 1;
pub const REG_R2: u8 = 2;
pub const REG_R3: u8 = 3;
pub const REG_ST: u8 = 4;
pub const REG_PF: u8 = 5;
pub const REG_PC: u8 = 6;
/// The immediate pseudo-register: an `imm` in a register field means "an
/// immediate word follows".
pub const REG_IMM: u8 = 7;

/* =============== Addressing modes ============ */

/// `x` field values: `[R0+v]`..`[R3+v]`, `[ST+v]`, `[v]`, `[PC~v]`, plain.
pub const ADDR_R0: u8 = 0;
pub const ADDR_ST: u8 = 4;
pub const ADDR_MEM: u8 = 5;
pub const ADDR_PC: u8 = 6;
pub const ADDR_IMM: u8 = 7;

/* ================= Opcodes =================== */

pub const OP_ADD: u8 = 0o00;
pub const OP_SUB: u8 = 0o01;
pub const OP_CMP: u8 = 0o02;
pub const OP_AND: u8 = 0o03;
pub const OP_OR: u8 = 0o04;
pub const OP_XOR: u8 = 0o05;
/// Added to a math opcode to get its carry-continue variant.
pub const OFFS_CC: u8 = 0o10;
pub const OP_INC: u8 = 0o20;
pub const OP_DEC: u8 = 0o21;
pub const OP_CMP1: u8 = 0o22;
pub const OP_SHL: u8 = 0o26;
pub const OP_SHR: u8 = 0o27;
/// `MOV.cc` base; or with a condition code.
pub const OFFS_MOV: u8 = 0o40;
/// `LEA.cc` base; or with a condition code.
pub const OFFS_LEA: u8 = 0o60;
/// Unconditional MOV / LEA.
pub const OP_MOV: u8 = OFFS_MOV | COND_TRUE;
pub const OP_LEA: u8 = OFFS_LEA | COND_TRUE;

/* ================ Conditions ================= */

pub const COND_ULT: u8 = 0o00;
pub const COND_UGT: u8 = 0o01;
pub const COND_SLT: u8 = 0o02;
pub const COND_SGT: u8 = 0o03;
pub const COND_EQ: u8 = 0o04;
pub const COND_CS: u8 = 0o05;
pub const COND_TRUE: u8 = 0o06;
pub const COND_UGE: u8 = 0o10;
pub const COND_ULE: u8 = 0o11;
pub const COND_SGE: u8 = 0o12;
pub const COND_SLE: u8 = 0o13;
pub const COND_NE: u8 = 0o14;
pub const COND_CC: u8 = 0o15;
/// Reserved for the jump-to-subroutine form.
pub const COND_JSR: u8 = 0o16;
/// Reserved for the carry-extend form.
pub const COND_CX: u8 = 0o17;

/// Invert a branch condition.
pub fn inv_cond(cond: u8) -> u8 {
    debug_assert!(cond & 0o7 != COND_TRUE);
    cond ^ 0o10
}

/* ================ Instructions =============== */

/// Struct representation of one instruction word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Insn {
    /// Addressing mode applies to operand B instead of operand A.
    pub y: bool,
    /// Addressing mode.
    pub x: u8,
    /// Operand B register field.
    pub b: u8,
    /// Operand A register field.
    pub a: u8,
    /// Opcode.
    pub o: u8,
}

impl Insn {
    /// Pack into the 16-bit instruction word.
    pub fn pack(self) -> u16 {
        (self.y as u16) << 15
            | (self.x as u16 & 7) << 12
            | (self.b as u16 & 7) << 9
            | (self.a as u16 & 7) << 6
            | (self.o as u16 & 0o77)
    }

    /// Unpack from the 16-bit instruction word.
    pub fn unpack(word: u16) -> Self {
        Insn {
            y: word & 0x8000 != 0,
            x: ((word >> 12) & 7) as u8,
            b: ((word >> 9) & 7) as u8,
            a: ((word >> 6) & 7) as u8,
            o: (word & 0o77) as u8,
        }
    }
}

/// A resolved operand: the register field value plus the immediate (label
/// and/or constant) that accompanies it when the field is `imm`.
#[derive(Clone, Debug, Default)]
pub struct Operand {
    pub field: u8,
    pub mode: u8,
    pub label: Option<String>,
    pub offs: i64,
}

impl Px16Backend {
    /// Gets the constant for a stack-indexing memory access: how many words
    /// above `ST` the word `part` of a frame slot lives.
    pub(super) fn stack_depth(
        &self,
        ctx: &CompileCtx,
        offset: CodeOffset,
        size: CodeOffset,
        part: CodeOffset,
    ) -> i64 {
        ctx.scope().stack_size as i64 - offset as i64 - size as i64 + part as i64
    }

    /// Depth of word `part` of a caller-frame slot (stack-passed
    /// parameters), skipping the return address.
    fn frame_depth(&self, ctx: &CompileCtx, offset: CodeOffset, part: CodeOffset) -> i64 {
        ctx.scope().stack_size as i64 + 1 + offset as i64 + part as i64
    }

    /// Write an instruction without any stack bookkeeping.
    pub(super) fn write_insn_raw(
        &self,
        ctx: &mut CompileCtx,
        insn: Insn,
        label0: Option<&str>,
        offs0: i64,
        label1: Option<&str>,
        offs1: i64,
    ) {
        // Instructions that cannot be encoded are programming errors in the
        // selector, not source-level problems.
        debug_assert!(
            !(!insn.y && insn.x == ADDR_IMM && insn.a == REG_IMM),
            "operand A is an immediate destination"
        );
        debug_assert!(!(insn.y && insn.a == REG_IMM), "plain operand A is imm");

        ctx.asm.write_memword(insn.pack() as Word);

        if insn.a == REG_IMM {
            // The second immediate slot, if any, still precedes the end of
            // the instruction; PC-relative operands compensate.
            let extra = (insn.b == REG_IMM) as i64;
            match label0 {
                Some(label) => {
                    if !insn.y && insn.x == ADDR_PC {
                        ctx.asm
                            .write_label_ref(label, offs0 - extra, LabelRefMode::OffsPtr);
                    } else {
                        ctx.asm.write_label_ref(label, offs0, LabelRefMode::AbsPtr);
                    }
                }
                None => ctx.asm.write_memword(offs0 as Word),
            }
        }
        if insn.b == REG_IMM {
            match label1 {
                Some(label) => {
                    if insn.y && insn.x == ADDR_PC {
                        ctx.asm.write_label_ref(label, offs1, LabelRefMode::OffsPtr);
                    } else {
                        ctx.asm.write_label_ref(label, offs1, LabelRefMode::AbsPtr);
                    }
                }
                None => ctx.asm.write_memword(offs1 as Word),
            }
        }

        for reg in [insn.a, insn.b, insn.x] {
            if reg < 4 {
                scope::touch_reg(ctx, reg);
            }
        }
    }

    /// Write an instruction, checking for stack effects.
    ///
    /// A store to the word just past the hardware stack top is rewritten as
    /// a push; any other instruction that touches `ST` first reconciles the
    /// stack pointer.
    pub(super) fn write_insn(
        &self,
        ctx: &mut CompileCtx,
        mut insn: Insn,
        label0: Option<&str>,
        offs0: i64,
        label1: Option<&str>,
        offs1: i64,
    ) -> CodegenResult<()> {
        if !insn.y && insn.x == ADDR_ST && insn.a == REG_IMM && label0.is_none() {
            let scope = ctx.scope();
            let gap = scope.stack_size as i64 - scope.real_stack_size as i64;
            if gap - 1 == offs0 {
                log::trace!("stack write optimised into push");
                insn.x = ADDR_MEM;
                insn.a = REG_ST;
                self.write_insn_raw(ctx, insn, None, 0, label1, offs1);
                ctx.scope_mut().real_stack_size += 1;
                return Ok(());
            }
        }

        if insn.a == REG_ST || insn.b == REG_ST || insn.x == ADDR_ST {
            self.memclobber_impl(ctx, true)?;
        }
        self.write_insn_raw(ctx, insn, label0, offs0, label1, offs1);
        Ok(())
    }

    /// Reconcile the hardware stack pointer with the logical stack size.
    pub(super) fn memclobber_impl(
        &self,
        ctx: &mut CompileCtx,
        clobbers_stack: bool,
    ) -> CodegenResult<()> {
        if !clobbers_stack {
            return Ok(());
        }
        let scope = ctx.scope();
        let diff = scope.real_stack_size as i64 - scope.stack_size as i64;
        if diff == 0 {
            return Ok(());
        }
        // Prevent infinite recursion: the fixup below touches ST itself.
        ctx.scope_mut().real_stack_size = ctx.scope().stack_size;

        let insn = |o: u8, b: u8| Insn {
            y: false,
            x: ADDR_IMM,
            b,
            a: REG_ST,
            o,
        };
        if diff == 1 {
            self.write_insn_raw(ctx, insn(OP_INC, 0), None, 0, None, 0);
        } else if diff == -1 {
            self.write_insn_raw(ctx, insn(OP_DEC, 0), None, 0, None, 0);
        } else if diff > 1 {
            self.write_insn_raw(ctx, insn(OP_ADD, REG_IMM), None, 0, None, diff);
        } else {
            self.write_insn_raw(ctx, insn(OP_SUB, REG_IMM), None, 0, None, -diff);
        }
        Ok(())
    }

    /// Move one word of a value into a register.
    pub(super) fn part_to_reg(
        &self,
        ctx: &mut CompileCtx,
        src: Loc,
        dest: u8,
        part: CodeOffset,
    ) -> CodegenResult<()> {
        if let LocKind::Const(value) = ctx.locs[src].kind {
            let word = value >> (16 * part);
            if word & 0xffff == 0 {
                // XOR dest, dest loads zero one word shorter.
                let insn = Insn {
                    y: false,
                    x: ADDR_IMM,
                    b: dest,
                    a: dest,
                    o: OP_XOR,
                };
                return self.write_insn(ctx, insn, None, 0, None, 0);
            }
        }

        let op = self.operand(ctx, src, part, true, dest)?;
        let insn = Insn {
            y: true,
            x: op.mode,
            b: op.field,
            a: dest,
            o: OP_MOV,
        };
        self.write_insn(ctx, insn, None, 0, op.label.as_deref(), op.offs)
    }

    /// Move a whole value into a register run starting at `dest`.
    pub(super) fn mov_to_reg(&self, ctx: &mut CompileCtx, src: Loc, dest: u8) -> CodegenResult<()> {
        if matches!(ctx.locs[src].kind, LocKind::Register(r) if r == dest) {
            return Ok(());
        }
        if let LocKind::Condition(cond) = ctx.locs[src].kind {
            let ty = ctx.locs[src].ty;
            let dst = ctx.alloc_anon(LocKind::Register(dest), ty);
            return self.cond_to_value(ctx, dst, cond);
        }
        let n_words = ctx.size_of(src).max(1);
        for part in 0..n_words {
            self.part_to_reg(ctx, src, dest + part as u8, part)?;
        }
        Ok(())
    }

    /// Rewrite a location into a register, remembering its old home as the
    /// default location.
    pub(super) fn var_to_reg(
        &self,
        ctx: &mut CompileCtx,
        loc: Loc,
        allow_const: bool,
    ) -> CodegenResult<()> {
        let is_reg = matches!(ctx.locs[loc].kind, LocKind::Register(_));
        let is_const = matches!(ctx.locs[loc].kind, LocKind::Const(_));
        if is_reg || (is_const && allow_const) {
            return Ok(());
        }
        let orig = ctx.alloc(ctx.locs[loc].clone());
        let reg = scope::pick_register(self, ctx, true)?;
        self.mov_to_reg(ctx, orig, reg)?;
        ctx.locs[loc].kind = LocKind::Register(reg);
        if ctx.locs[loc].default_loc.is_none() {
            ctx.locs[loc].default_loc = Some(orig);
        }
        scope::claim_reg(ctx, reg, loc);
        Ok(())
    }

    /// Materialise the pointee of a pointer location into a register so the
    /// pointer can be used as an addressing base.
    pub(super) fn pointer_to_reg(&self, ctx: &mut CompileCtx, loc: Loc) -> CodegenResult<()> {
        if let LocKind::Pointer(ptr) = ctx.locs[loc].kind {
            if !matches!(
                ctx.locs[ptr].kind,
                LocKind::Register(_) | LocKind::Const(_)
            ) {
                let reg = scope::pick_register(self, ctx, true)?;
                self.mov_to_reg(ctx, ptr, reg)?;
                ctx.locs[ptr].kind = LocKind::Register(reg);
                scope::claim_reg(ctx, reg, ptr);
            }
        }
        Ok(())
    }

    /// Grab an addressing mode for word `part` of a location.
    ///
    /// With `allow_mode` unset the operand position cannot carry an
    /// addressing mode; anything that is not a plain register or constant
    /// is first moved into `dest`.
    pub(super) fn operand(
        &self,
        ctx: &mut CompileCtx,
        loc: Loc,
        part: CodeOffset,
        allow_mode: bool,
        dest: u8,
    ) -> CodegenResult<Operand> {
        if !allow_mode
            && !matches!(
                ctx.locs[loc].kind,
                LocKind::Const(_) | LocKind::Register(_)
            )
        {
            self.part_to_reg(ctx, loc, dest, part)?;
            return Ok(Operand {
                field: dest,
                mode: ADDR_IMM,
                ..Operand::default()
            });
        }

        let size = ctx.size_of(loc).max(1);
        match ctx.locs[loc].kind.clone() {
            LocKind::Const(value) => Ok(Operand {
                field: REG_IMM,
                mode: ADDR_IMM,
                label: None,
                offs: ((value >> (16 * part)) & 0xffff) as i64,
            }),
            LocKind::Label(label) => Ok(Operand {
                field: REG_IMM,
                mode: ADDR_MEM,
                label: Some(label),
                offs: part as i64,
            }),
            LocKind::StackOffset(offset) => Ok(Operand {
                field: REG_IMM,
                mode: ADDR_ST,
                label: None,
                offs: self.stack_depth(ctx, offset, size, part),
            }),
            LocKind::StackFrame(offset) => Ok(Operand {
                field: REG_IMM,
                mode: ADDR_ST,
                label: None,
                offs: self.frame_depth(ctx, offset, part),
            }),
            LocKind::Register(reg) => Ok(Operand {
                field: reg + part as u8,
                mode: ADDR_IMM,
                ..Operand::default()
            }),
            LocKind::ReturnValue => Ok(Operand {
                field: REG_R0 + part as u8,
                mode: ADDR_IMM,
                ..Operand::default()
            }),
            LocKind::Pointer(ptr) => self.pointer_operand(ctx, loc, ptr, part, dest),
            LocKind::Indexed { base, index, .. } => {
                self.indexed_operand(ctx, loc, base, index, part, dest)
            }
            LocKind::Void | LocKind::Condition(_) | LocKind::Unassigned => {
                Err(CodegenError::NoAddressingMode(
                    "value with no materialised storage",
                ))
            }
        }
    }

    fn pointer_operand(
        &self,
        ctx: &mut CompileCtx,
        _loc: Loc,
        ptr: Loc,
        part: CodeOffset,
        dest: u8,
    ) -> CodegenResult<Operand> {
        match ctx.locs[ptr].kind.clone() {
            LocKind::Register(reg) => {
                if part != 0 {
                    Ok(Operand {
                        field: REG_IMM,
                        mode: reg,
                        label: None,
                        offs: part as i64,
                    })
                } else {
                    Ok(Operand {
                        field: reg,
                        mode: ADDR_MEM,
                        ..Operand::default()
                    })
                }
            }
            // A constant pointer might as well be a normal memory access.
            LocKind::Const(addr) => Ok(Operand {
                field: REG_IMM,
                mode: ADDR_MEM,
                label: None,
                offs: addr as i64 + part as i64,
            }),
            _ => {
                // Load the pointer value into the scratch register, then
                // dereference through it.
                self.part_to_reg(ctx, ptr, dest, 0)?;
                if part != 0 {
                    Ok(Operand {
                        field: REG_IMM,
                        mode: dest,
                        label: None,
                        offs: part as i64,
                    })
                } else {
                    Ok(Operand {
                        field: dest,
                        mode: ADDR_MEM,
                        ..Operand::default()
                    })
                }
            }
        }
    }

    fn indexed_operand(
        &self,
        ctx: &mut CompileCtx,
        loc: Loc,
        base: Loc,
        index: Loc,
        part: CodeOffset,
        dest: u8,
    ) -> CodegenResult<Operand> {
        let elem = ctx.locs[loc].ty;
        let elem_size = ctx.types.size_words(elem).max(1);
        let base_ty = ctx.locs[base].ty;
        let array_base =
            ctx.types.is_array(base_ty) && !matches!(ctx.locs[base].kind, LocKind::Pointer(_));

        if array_base {
            // Indexing directly into in-place array storage.
            self.var_to_reg(ctx, index, true)?;
            if let LocKind::Const(i) = ctx.locs[index].kind {
                // Constant index: fold into the part offset.
                return self.operand(
                    ctx,
                    base,
                    part + i as CodeOffset * elem_size,
                    true,
                    dest,
                );
            }
            if elem_size != 1 {
                return Err(CodegenError::NoAddressingMode(
                    "variable index into array of multi-word elements",
                ));
            }
            let idx_reg = match ctx.locs[index].kind {
                LocKind::Register(reg) => reg,
                _ => unreachable!("index was forced into a register"),
            };
            if let LocKind::Label(label) = ctx.locs[base].kind.clone() {
                // [Rindex + label]
                return Ok(Operand {
                    field: REG_IMM,
                    mode: idx_reg,
                    label: Some(label),
                    offs: part as i64,
                });
            }
            // Array in the frame: take its address first, then index.
            let tmp = scope::get_tmp(ctx, 1, true)?;
            self.var_to_reg(ctx, tmp, false)?;
            let tmp_reg = match ctx.locs[tmp].kind {
                LocKind::Register(reg) => reg,
                _ => unreachable!("fresh temp was forced into a register"),
            };
            let op = self.operand(ctx, base, 0, true, dest)?;
            let insn = Insn {
                y: true,
                x: op.mode,
                b: op.field,
                a: tmp_reg,
                o: OP_LEA,
            };
            self.write_insn(ctx, insn, None, 0, op.label.as_deref(), op.offs)?;
            return Ok(Operand {
                field: idx_reg,
                mode: tmp_reg,
                ..Operand::default()
            });
        }

        // Pointer-typed base.
        self.var_to_reg(ctx, base, true)?;
        self.var_to_reg(ctx, index, true)?;
        let (base, index) = match (&ctx.locs[base].kind, &ctx.locs[index].kind) {
            // Keep any constant on the index side.
            (LocKind::Const(_), k) if !matches!(k, LocKind::Const(_)) => (index, base),
            _ => (base, index),
        };

        if let LocKind::Const(i) = ctx.locs[index].kind {
            let offs = i as i64 * elem_size as i64 + part as i64;
            let base_reg = match ctx.locs[base].kind {
                LocKind::Register(reg) => reg,
                LocKind::Const(addr) => {
                    return Ok(Operand {
                        field: REG_IMM,
                        mode: ADDR_MEM,
                        label: None,
                        offs: addr as i64 + offs,
                    });
                }
                _ => unreachable!("base was forced into a register"),
            };
            return Ok(if offs != 0 {
                Operand {
                    field: REG_IMM,
                    mode: base_reg,
                    label: None,
                    offs,
                }
            } else {
                Operand {
                    field: base_reg,
                    mode: ADDR_MEM,
                    ..Operand::default()
                }
            });
        }

        if elem_size != 1 {
            return Err(CodegenError::NoAddressingMode(
                "variable index with multi-word element type",
            ));
        }
        let base_reg = match ctx.locs[base].kind {
            LocKind::Register(reg) => reg,
            _ => unreachable!("base was forced into a register"),
        };
        let idx_reg = match ctx.locs[index].kind {
            LocKind::Register(reg) => reg,
            _ => unreachable!("index was forced into a register"),
        };
        if part == 0 {
            return Ok(Operand {
                field: idx_reg,
                mode: base_reg,
                ..Operand::default()
            });
        }

        // Word two onward of a doubly-variable index: materialise the sum
        // once and remember it.
        let combined = match ctx.locs[loc].kind.clone() {
            LocKind::Indexed {
                combined: Some(combined),
                ..
            } => combined,
            _ => {
                let sum_reg = scope::pick_register(self, ctx, true)?;
                let insn = Insn {
                    y: true,
                    x: base_reg,
                    b: idx_reg,
                    a: sum_reg,
                    o: OP_LEA,
                };
                self.write_insn(ctx, insn, None, 0, None, 0)?;
                let combined = ctx.alloc_anon(LocKind::Register(sum_reg), elem);
                scope::claim_reg(ctx, sum_reg, combined);
                if let LocKind::Indexed {
                    combined: cache, ..
                } = &mut ctx.locs[loc].kind
                {
                    *cache = Some(combined);
                }
                combined
            }
        };
        let combined_reg = match ctx.locs[combined].kind {
            LocKind::Register(reg) => reg,
            _ => unreachable!("combined pointer lives in a register"),
        };
        Ok(Operand {
            field: REG_IMM,
            mode: combined_reg,
            label: None,
            offs: part as i64,
        })
    }

    /// Turn any location into a branchable condition code.
    pub(super) fn to_condition(&self, ctx: &mut CompileCtx, loc: Loc) -> CodegenResult<u8> {
        if let LocKind::Condition(cond) = ctx.locs[loc].kind {
            return Ok(cond);
        }
        // Everything else tests against zero; CMP1 allows every addressing
        // mode.
        self.math1(ctx, OP_CMP1, None, loc)?;
        Ok(COND_UGE)
    }

    /// Generate a branch to one of two labels; either may be `None`.
    pub(super) fn branch(
        &self,
        ctx: &mut CompileCtx,
        cond_loc: Loc,
        l_true: Option<&str>,
        l_false: Option<&str>,
    ) -> CodegenResult<()> {
        if l_true.is_none() && l_false.is_none() {
            return Ok(());
        }
        // A constant condition branches one way unconditionally.
        if let LocKind::Const(value) = ctx.locs[cond_loc].kind {
            let target = if value != 0 { l_true } else { l_false };
            if let Some(label) = target {
                self.jump(ctx, label)?;
            }
            return Ok(());
        }
        let cond = self.to_condition(ctx, cond_loc)?;
        for (label, cond) in [(l_true, cond), (l_false, inv_cond(cond))] {
            let label = match label {
                Some(label) => label,
                None => continue,
            };
            let insn = if self.pie() {
                Insn {
                    y: true,
                    x: ADDR_PC,
                    b: REG_IMM,
                    a: REG_PC,
                    o: OFFS_LEA | cond,
                }
            } else {
                Insn {
                    y: true,
                    x: ADDR_IMM,
                    b: REG_IMM,
                    a: REG_PC,
                    o: OFFS_MOV | cond,
                }
            };
            self.write_insn(ctx, insn, None, 0, Some(label), 0)?;
        }
        Ok(())
    }

    /// Generate an unconditional jump to a label.
    pub(super) fn jump(&self, ctx: &mut CompileCtx, label: &str) -> CodegenResult<()> {
        let insn = if self.pie() {
            Insn {
                y: true,
                x: ADDR_PC,
                b: REG_IMM,
                a: REG_PC,
                o: OP_LEA,
            }
        } else {
            Insn {
                y: true,
                x: ADDR_IMM,
                b: REG_IMM,
                a: REG_PC,
                o: OP_MOV,
            }
        };
        self.write_insn(ctx, insn, None, 0, Some(label), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let insn = Insn {
            y: true,
            x: ADDR_PC,
            b: REG_IMM,
            a: REG_PC,
            o: OFFS_LEA | COND_JSR,
        };
        assert_eq!(Insn::unpack(insn.pack()), insn);

        // Every field lands in its slot.
        let insn = Insn {
            y: false,
            x: 5,
            b: 3,
            a: 2,
            o: 0o21,
        };
        assert_eq!(insn.pack(), (5 << 12) | (3 << 9) | (2 << 6) | 0o21);
    }

    #[test]
    fn condition_inversion() {
        assert_eq!(inv_cond(COND_EQ), COND_NE);
        assert_eq!(inv_cond(COND_NE), COND_EQ);
        assert_eq!(inv_cond(COND_ULT), COND_UGE);
        assert_eq!(inv_cond(COND_SGT), COND_SLE);
        assert_eq!(inv_cond(COND_CS), COND_CC);
    }
}
