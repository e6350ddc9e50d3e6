//! The GR8CPU Rev3 target: an 8-bit accumulator machine with 16-bit
//! addresses, three registers `A`, `X` and `Y`, and byte opcodes.
//!
//! There is no stack-relative addressing, so every variable and temporary
//! lives in static memory behind a per-function label; `A` is the working
//! register for nearly everything and `X:Y` carry 16-bit values across call
//! boundaries. Branch opcodes come in adjacent true/false pairs, and all
//! memory-touching opcodes have a PC-relative variant selected by the PIE
//! bit.

mod iasm;

use crate::asm::LabelRefMode;
use crate::ast::{Expr, FuncDef, FuncSig, Oper, Pos};
use crate::context::CompileCtx;
use crate::diag::{CodegenError, CodegenResult};
use crate::iasm::Constraint;
use crate::isa::{Flags, SetError, TargetBuilder, TargetConfig, TargetIsa};
use crate::loc::{locations_equivalent, Loc, LocKind};
use crate::lower;
use crate::scope;
use crate::types::{SimpleType, Type};
use crate::{CodeOffset, Word};

pub(crate) const REG_A: u8 = 0;
pub(crate) const REG_X: u8 = 1;
pub(crate) const REG_Y: u8 = 2;

/* ====== Branches ====== */
pub(crate) const INSN_JMP: u8 = 0x0e;
pub(crate) const OFFS_BRANCH: u8 = 0x0f;
pub(crate) const INSN_BEQ: u8 = 0x0f;
pub(crate) const INSN_BNE: u8 = 0x10;
pub(crate) const INSN_BGT: u8 = 0x11;
pub(crate) const INSN_BLE: u8 = 0x12;
pub(crate) const INSN_BLT: u8 = 0x13;
pub(crate) const INSN_BGE: u8 = 0x14;
pub(crate) const INSN_BCS: u8 = 0x15;
pub(crate) const INSN_BCC: u8 = 0x16;
/// Added to a memory-touching opcode for its PC-relative variant.
pub(crate) const OFFS_PIE: u8 = 0x80;

/* ====== Simple math on A ====== */
pub(crate) const OFFS_ADD: u8 = 0x32;
pub(crate) const OFFS_SUB: u8 = 0x34;
pub(crate) const OFFS_CMP: u8 = 0x36;
/// Opcode offsets selecting the operand pattern of a math instruction.
pub(crate) const OFFS_CALC_AV: u8 = 0x06;
pub(crate) const OFFS_CALC_AM: u8 = 0x07;
/// Carry-continue variant offset.
pub(crate) const OFFS_CALC_CC: u8 = 0x0c;

/* ====== Increments ====== */
pub(crate) const INSN_INC_A: u8 = 0x3e;
pub(crate) const INSN_DEC_A: u8 = 0x40;
pub(crate) const INSN_INC_M: u8 = 0x3f;
pub(crate) const INSN_DEC_M: u8 = 0x41;
pub(crate) const INSN_INCC_A: u8 = 0x4a;
pub(crate) const INSN_DECC_A: u8 = 0x4c;
pub(crate) const INSN_INCC_M: u8 = 0x3b;
pub(crate) const INSN_DECC_M: u8 = 0x4d;

/* ====== Bitwise operations ====== */
pub(crate) const OFFS_BIT_AV: u8 = 0x00;
pub(crate) const OFFS_BIT_AM: u8 = 0x01;
pub(crate) const OFFS_AND: u8 = 0x52;
pub(crate) const OFFS_OR: u8 = 0x54;
pub(crate) const OFFS_XOR: u8 = 0x56;

/* ====== Memory shifts ====== */
pub(crate) const OFFS_SHM: u8 = 0x42;
pub(crate) const OFFS_SHM_L: u8 = 0x00;
pub(crate) const OFFS_SHM_R: u8 = 0x01;
pub(crate) const OFFS_SHM_CC: u8 = 0x0c;

/* ====== Register moves ====== */
pub(crate) const INSN_MOV_AX: u8 = 0x17;
pub(crate) const INSN_MOV_AY: u8 = 0x18;
pub(crate) const INSN_MOV_XA: u8 = 0x19;
pub(crate) const INSN_MOV_XY: u8 = 0x1a;
pub(crate) const INSN_MOV_YA: u8 = 0x1b;
pub(crate) const INSN_MOV_YX: u8 = 0x1c;
/// `MOV reg, imm`: add the register number.
pub(crate) const OFFS_MOV_RI: u8 = 0x1d;

/* ====== Memory moves ====== */
pub(crate) const OFFS_MOVLD: u8 = 0x20;
pub(crate) const OFFS_MOVST: u8 = 0x29;
/// `MOV reg, [mem]` / `MOV [mem], reg`: add the register number.
pub(crate) const OFFS_MOVM_RM: u8 = 0x00;
/// `MOV A, [mem+X]`.
pub(crate) const OFFS_MOVM_AMX: u8 = 0x03;
/// `MOV A, [[ptr]+X]`.
pub(crate) const OFFS_MOVM_APX: u8 = 0x07;

/* ====== Subroutines ====== */
pub(crate) const INSN_CALL: u8 = 0x02;
pub(crate) const INSN_RET: u8 = 0x03;
pub(crate) const INSN_RTI: u8 = 0x74;

/// Invert the condition of a branch opcode; they come in pairs.
pub(crate) fn inv_branch(insn: u8) -> u8 {
    ((insn - OFFS_BRANCH) ^ 1) + OFFS_BRANCH
}

const CONFIG: TargetConfig = TargetConfig {
    name: "gr8",
    word_bits: 8,
    mem_bits: 8,
    addr_bits: 16,
    char_bits: 8,
    short_bits: 16,
    int_bits: 16,
    long_bits: 32,
    long_long_bits: 64,
    float_bits: 32,
    double_bits: 32,
    long_double_bits: 64,
    big_endian: false,
    char_signed: false,
    reg_count: 3,
    reg_names: &["A", "X", "Y"],
    stack_temps: false,
};

/// Builder for the gr8 backend; it has no machine options.
#[derive(Default)]
pub struct Gr8Builder;

impl TargetBuilder for Gr8Builder {
    fn set_machine_opt(&mut self, opt: &str) -> Result<(), SetError> {
        Err(SetError::UnknownOption(opt.to_string()))
    }

    fn finish(self: Box<Self>, flags: Flags) -> CodegenResult<Box<dyn TargetIsa>> {
        Ok(Box::new(Gr8Backend { flags }))
    }
}

/// Calling convention classes, by parameter pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallConv {
    /// Exactly one two-byte parameter, passed in `X:Y`.
    Int,
    /// Up to three one-byte parameters, passed in `A`, `X`, `Y`.
    Char,
    /// Anything else: parameters stored directly into the callee's
    /// argument labels.
    Mem,
}

/// The gr8 backend.
pub struct Gr8Backend {
    flags: Flags,
}

impl Gr8Backend {
    fn pie(&self) -> bool {
        // Position-independent unless explicitly disabled.
        self.flags.pie
    }

    fn pie_bit(&self) -> u8 {
        if self.pie() {
            OFFS_PIE
        } else {
            0
        }
    }

    fn ref_mode(&self) -> LabelRefMode {
        if self.pie() {
            LabelRefMode::OffsPtr
        } else {
            LabelRefMode::AbsPtr
        }
    }

    fn classify(&self, ctx: &CompileCtx, sig: &FuncSig) -> CallConv {
        if sig.params.len() == 1 && ctx.types.size_words(sig.params[0].ty) == 2 {
            CallConv::Int
        } else if !sig.params.is_empty()
            && sig.params.len() <= 3
            && sig
                .params
                .iter()
                .all(|p| ctx.types.size_words(p.ty) == 1)
        {
            CallConv::Char
        } else {
            CallConv::Mem
        }
    }

    /// The label of a callee's n'th argument slot.
    fn arg_label(func: &str, index: usize) -> String {
        format!("{func}.LA{index:04x}")
    }

    /// Move a register into another register.
    fn reg_to_reg(&self, ctx: &mut CompileCtx, dst: u8, src: u8) {
        if dst == src {
            return;
        }
        let opcode = match (dst, src) {
            (REG_A, REG_X) => INSN_MOV_AX,
            (REG_A, REG_Y) => INSN_MOV_AY,
            (REG_X, REG_A) => INSN_MOV_XA,
            (REG_X, REG_Y) => INSN_MOV_XY,
            (REG_Y, REG_A) => INSN_MOV_YA,
            (REG_Y, REG_X) => INSN_MOV_YX,
            _ => unreachable!("three registers only"),
        };
        ctx.asm.write_memword(opcode as Word);
    }

    /// Force a value into labelled memory, so it can be addressed by any
    /// instruction; returns the location to use instead.
    fn to_memory(&self, ctx: &mut CompileCtx, loc: Loc) -> CodegenResult<Loc> {
        match ctx.locs[loc].kind {
            LocKind::Label(_) | LocKind::Const(_) => Ok(loc),
            _ => {
                let size = ctx.size_of(loc).max(1);
                let tmp = scope::get_tmp(ctx, size, false)?;
                ctx.locs[tmp].ty = ctx.locs[loc].ty;
                self.emit_mov(ctx, tmp, loc)?;
                Ok(tmp)
            }
        }
    }

    /// Moves a byte of a value into the given register.
    fn load_part(
        &self,
        ctx: &mut CompileCtx,
        src: Loc,
        regno: u8,
        offs: CodeOffset,
    ) -> CodegenResult<()> {
        match ctx.locs[src].kind.clone() {
            LocKind::Const(value) => {
                ctx.asm.write_memword((OFFS_MOV_RI + regno) as Word);
                ctx.asm.write_memword((value >> (offs * 8)) as Word);
                Ok(())
            }
            LocKind::Label(label) => {
                ctx.asm
                    .write_memword((OFFS_MOVLD + OFFS_MOVM_RM + regno + self.pie_bit()) as Word);
                ctx.asm
                    .write_label_ref(&label, offs as i64, self.ref_mode());
                Ok(())
            }
            LocKind::Register(src_reg) => {
                self.reg_to_reg(ctx, regno, src_reg + offs as u8);
                Ok(())
            }
            LocKind::Pointer(ptr) => {
                // Indirect loads go through [[ptr]+X].
                let ptr = self.to_memory(ctx, ptr)?;
                let label = match ctx.locs[ptr].kind.clone() {
                    LocKind::Label(label) => label,
                    LocKind::Const(addr) => {
                        // A constant pointer is a plain absolute access.
                        ctx.asm.write_memword(
                            (OFFS_MOVLD + OFFS_MOVM_RM + regno) as Word,
                        );
                        ctx.asm.write_address(addr + offs as Word);
                        return Ok(());
                    }
                    _ => return Err(CodegenError::NoAddressingMode("pointer pointee")),
                };
                if regno != REG_A {
                    return Err(CodegenError::NoAddressingMode(
                        "indirect load into an index register",
                    ));
                }
                ctx.asm.write_memword((OFFS_MOV_RI + REG_X) as Word);
                ctx.asm.write_memword(offs as Word);
                ctx.asm
                    .write_memword((OFFS_MOVLD + OFFS_MOVM_APX + self.pie_bit()) as Word);
                ctx.asm.write_label_ref(&label, 0, self.ref_mode());
                Ok(())
            }
            LocKind::ReturnValue => {
                // Fresh from a call: byte 0 in A (or X:Y for pairs).
                let src_reg = if ctx.size_of(src) >= 2 { REG_X } else { REG_A };
                self.reg_to_reg(ctx, regno, src_reg + offs as u8);
                Ok(())
            }
            LocKind::Indexed { base, index, .. } => {
                self.indexed_access(ctx, base, index, regno, offs, false)
            }
            _ => Err(CodegenError::NoAddressingMode("unplaced operand")),
        }
    }

    /// Indexed load/store `base[index]` through the `[mem+X]` mode.
    fn indexed_access(
        &self,
        ctx: &mut CompileCtx,
        base: Loc,
        index: Loc,
        regno: u8,
        offs: CodeOffset,
        store: bool,
    ) -> CodegenResult<()> {
        let elem_size = 1;
        let base = self.to_memory(ctx, base)?;
        let label = match ctx.locs[base].kind.clone() {
            LocKind::Label(label) => label,
            _ => return Err(CodegenError::NoAddressingMode("indexed base")),
        };
        if let LocKind::Const(i) = ctx.locs[index].kind {
            // Constant index folds into the label offset.
            let opcode = if store { OFFS_MOVST } else { OFFS_MOVLD };
            ctx.asm
                .write_memword((opcode + OFFS_MOVM_RM + regno + self.pie_bit()) as Word);
            ctx.asm.write_label_ref(
                &label,
                i as i64 * elem_size + offs as i64,
                self.ref_mode(),
            );
            return Ok(());
        }
        if regno != REG_A {
            return Err(CodegenError::NoAddressingMode(
                "indexed access outside the accumulator",
            ));
        }
        // Variable index in X; byte offsets fold into the reference.
        self.load_part(ctx, index, REG_X, 0)?;
        let opcode = if store { OFFS_MOVST } else { OFFS_MOVLD };
        ctx.asm
            .write_memword((opcode + OFFS_MOVM_AMX + self.pie_bit()) as Word);
        ctx.asm
            .write_label_ref(&label, offs as i64, self.ref_mode());
        Ok(())
    }

    /// Moves the given register into a byte of a value.
    fn store_part(
        &self,
        ctx: &mut CompileCtx,
        dst: Loc,
        regno: u8,
        offs: CodeOffset,
    ) -> CodegenResult<()> {
        match ctx.locs[dst].kind.clone() {
            LocKind::Label(label) => {
                ctx.asm
                    .write_memword((OFFS_MOVST + OFFS_MOVM_RM + regno + self.pie_bit()) as Word);
                ctx.asm
                    .write_label_ref(&label, offs as i64, self.ref_mode());
                Ok(())
            }
            LocKind::Register(dst_reg) => {
                self.reg_to_reg(ctx, dst_reg + offs as u8, regno);
                Ok(())
            }
            LocKind::ReturnValue => {
                // Single bytes return in A, pairs in X:Y.
                if ctx.size_of(dst) >= 2 {
                    self.reg_to_reg(ctx, REG_X + offs as u8, regno);
                } else {
                    self.reg_to_reg(ctx, REG_A, regno);
                }
                Ok(())
            }
            LocKind::Pointer(ptr) => {
                let ptr = self.to_memory(ctx, ptr)?;
                let label = match ctx.locs[ptr].kind.clone() {
                    LocKind::Label(label) => label,
                    LocKind::Const(addr) => {
                        ctx.asm.write_memword(
                            (OFFS_MOVST + OFFS_MOVM_RM + regno) as Word,
                        );
                        ctx.asm.write_address(addr + offs as Word);
                        return Ok(());
                    }
                    _ => return Err(CodegenError::NoAddressingMode("pointer pointee")),
                };
                if regno != REG_A {
                    return Err(CodegenError::NoAddressingMode(
                        "indirect store from an index register",
                    ));
                }
                ctx.asm.write_memword((OFFS_MOV_RI + REG_X) as Word);
                ctx.asm.write_memword(offs as Word);
                ctx.asm
                    .write_memword((OFFS_MOVST + OFFS_MOVM_APX + self.pie_bit()) as Word);
                ctx.asm.write_label_ref(&label, 0, self.ref_mode());
                Ok(())
            }
            LocKind::Indexed { base, index, .. } => {
                self.indexed_access(ctx, base, index, regno, offs, true)
            }
            _ => Err(CodegenError::NoAddressingMode("unplaced destination")),
        }
    }

    /// Write a branch opcode plus target reference.
    fn branch_insn(&self, ctx: &mut CompileCtx, opcode: u8, label: &str) {
        ctx.asm.write_memword((opcode | self.pie_bit()) as Word);
        ctx.asm.write_label_ref(label, 0, self.ref_mode());
    }

    /// Convert a branch condition into 0/1 in a location.
    fn branch_to_var(&self, ctx: &mut CompileCtx, b_insn: u8, output: Loc) -> CodegenResult<()> {
        let n_words = ctx.size_of(output).max(1);
        let bool_ty = ctx.types.simple(SimpleType::Bool);
        let l_true = ctx.asm.numbered_label();
        let l_skip = ctx.asm.numbered_label();
        let zero = ctx.alloc_const(0, bool_ty);
        let one = ctx.alloc_const(1, bool_ty);

        self.branch_insn(ctx, b_insn, &l_true);
        // Code for false.
        self.load_part(ctx, zero, REG_A, 0)?;
        self.branch_insn(ctx, INSN_JMP, &l_skip);
        // Code for true.
        ctx.asm.write_label(&l_true);
        self.load_part(ctx, one, REG_A, 0)?;
        ctx.asm.write_label(&l_skip);
        self.store_part(ctx, output, REG_A, 0)?;
        // Upper bytes are zero either way.
        self.load_part(ctx, zero, REG_A, 1)?;
        for offs in 1..n_words {
            self.store_part(ctx, output, REG_A, offs)?;
        }
        Ok(())
    }

    /// Creates branch instructions for a condition location.
    fn branch(
        &self,
        ctx: &mut CompileCtx,
        cond: Loc,
        l_true: Option<&str>,
        l_false: Option<&str>,
    ) -> CodegenResult<()> {
        if l_true.is_none() && l_false.is_none() {
            return Ok(());
        }
        // A constant condition branches one way unconditionally.
        if let LocKind::Const(value) = ctx.locs[cond].kind {
            let target = if value != 0 { l_true } else { l_false };
            if let Some(label) = target {
                self.branch_insn(ctx, INSN_JMP, label);
            }
            return Ok(());
        }
        let b_insn = match ctx.locs[cond].kind.clone() {
            LocKind::Condition(cond) => cond,
            _ => {
                // Everything else is tested against zero: load the first
                // byte into A and OR the rest in.
                let mem = self.to_memory(ctx, cond)?;
                let n_words = ctx.size_of(mem).max(1);
                self.load_part(ctx, mem, REG_A, 0)?;
                if let LocKind::Label(label) = ctx.locs[mem].kind.clone() {
                    for offs in 1..n_words {
                        ctx.asm.write_memword(
                            (OFFS_OR + OFFS_BIT_AM + self.pie_bit()) as Word,
                        );
                        ctx.asm
                            .write_label_ref(&label, offs as i64, self.ref_mode());
                    }
                }
                INSN_BNE
            }
        };

        if let Some(l_true) = l_true {
            self.branch_insn(ctx, b_insn, l_true);
            if let Some(l_false) = l_false {
                self.branch_insn(ctx, INSN_JMP, l_false);
            }
        } else if let Some(l_false) = l_false {
            self.branch_insn(ctx, inv_branch(b_insn), l_false);
        }
        Ok(())
    }

    /// The output location of a math operation, copying `a` in when the
    /// operation cannot run in place.
    fn math_output(
        &self,
        ctx: &mut CompileCtx,
        hint: Option<Loc>,
        a: Loc,
    ) -> CodegenResult<Loc> {
        match hint {
            Some(h)
                if !matches!(
                    ctx.locs[h].kind,
                    LocKind::Condition(_)
                        | LocKind::Void
                        | LocKind::Unassigned
                        | LocKind::ReturnValue
                ) =>
            {
                Ok(h)
            }
            _ => {
                let size = ctx.size_of(a).max(1);
                let tmp = scope::get_tmp(ctx, size, false)?;
                ctx.locs[tmp].ty = ctx.locs[a].ty;
                Ok(tmp)
            }
        }
    }

    /// Binary math: accumulate through A, byte by byte, carry-continue for
    /// the adds, subs and compares.
    fn math2(
        &self,
        ctx: &mut CompileCtx,
        op: Oper,
        hint: Option<Loc>,
        a: Loc,
        b: Loc,
        pos: Pos,
    ) -> CodegenResult<Loc> {
        let a = self.to_memory(ctx, a)?;
        let b = self.to_memory(ctx, b)?;
        let n_words = ctx.size_of(a).max(1).min(ctx.size_of(b).max(1));
        let b_is_const = matches!(ctx.locs[b].kind, LocKind::Const(_));
        let is_comp = op.is_comparison();

        let calc = |base: u8| {
            if b_is_const {
                base + OFFS_CALC_AV
            } else {
                base + OFFS_CALC_AM + self.pie_bit()
            }
        };
        let bit = |base: u8| {
            if b_is_const {
                base + OFFS_BIT_AV
            } else {
                base + OFFS_BIT_AM + self.pie_bit()
            }
        };
        let (insn, does_cc, b_insn) = match op {
            Oper::Add => (calc(OFFS_ADD), true, 0),
            Oper::Sub => (calc(OFFS_SUB), true, 0),
            Oper::Eq => (calc(OFFS_CMP), true, INSN_BEQ),
            Oper::Ne => (calc(OFFS_CMP), true, INSN_BNE),
            Oper::Lt => (calc(OFFS_CMP), true, INSN_BLT),
            Oper::Ge => (calc(OFFS_CMP), true, INSN_BGE),
            Oper::Gt => (calc(OFFS_CMP), true, INSN_BGT),
            Oper::Le => (calc(OFFS_CMP), true, INSN_BLE),
            Oper::BitAnd => (bit(OFFS_AND), false, 0),
            Oper::BitOr => (bit(OFFS_OR), false, 0),
            Oper::BitXor => (bit(OFFS_XOR), false, 0),
            _ => {
                ctx.diag.error(
                    pos,
                    format!("operation {op:?} is not supported on this target"),
                );
                return Ok(a);
            }
        };

        let output = if is_comp {
            a
        } else {
            self.math_output(ctx, hint, a)?
        };
        for i in 0..n_words {
            self.load_part(ctx, a, REG_A, i)?;
            let opcode = insn + if i != 0 && does_cc { OFFS_CALC_CC } else { 0 };
            ctx.asm.write_memword(opcode as Word);
            match ctx.locs[b].kind.clone() {
                LocKind::Const(value) => {
                    ctx.asm.write_memword((value >> (i * 8)) as Word);
                }
                LocKind::Label(label) => {
                    ctx.asm.write_label_ref(&label, i as i64, self.ref_mode());
                }
                _ => unreachable!("b was forced into memory"),
            }
            if !is_comp {
                self.store_part(ctx, output, REG_A, i)?;
            }
        }

        if is_comp {
            let bool_ty = ctx.types.simple(SimpleType::Bool);
            return Ok(match hint {
                Some(h) if matches!(ctx.locs[h].kind, LocKind::Condition(_)) => {
                    ctx.locs[h].kind = LocKind::Condition(b_insn);
                    ctx.locs[h].ty = bool_ty;
                    h
                }
                Some(h) => {
                    self.branch_to_var(ctx, b_insn, h)?;
                    h
                }
                None => ctx.alloc_anon(LocKind::Condition(b_insn), bool_ty),
            });
        }
        Ok(output)
    }

    /// In-place unary math on memory: INC/DEC/SHL/SHR chains.
    fn math1_mem(
        &self,
        ctx: &mut CompileCtx,
        op: Oper,
        output: Loc,
    ) -> CodegenResult<()> {
        let label = match ctx.locs[output].kind.clone() {
            LocKind::Label(label) => label,
            _ => return Err(CodegenError::NoAddressingMode("in-place math needs memory")),
        };
        let n_words = ctx.size_of(output).max(1);
        let (insn, insn_cc) = match op {
            Oper::Add => (INSN_INC_M, INSN_INCC_M),
            Oper::Sub => (INSN_DEC_M, INSN_DECC_M),
            Oper::Shl => (
                OFFS_SHM + OFFS_SHM_L,
                OFFS_SHM + OFFS_SHM_L + OFFS_SHM_CC,
            ),
            Oper::Shr => (
                OFFS_SHM + OFFS_SHM_R,
                OFFS_SHM + OFFS_SHM_R + OFFS_SHM_CC,
            ),
            _ => return Err(CodegenError::Unsupported("unary operation")),
        };
        // Shift-right chains from the top byte down; everything else from
        // the bottom up.
        let parts: Vec<CodeOffset> = if op == Oper::Shr {
            (0..n_words).rev().collect()
        } else {
            (0..n_words).collect()
        };
        for (chain, offs) in parts.into_iter().enumerate() {
            let opcode = if chain == 0 { insn } else { insn_cc };
            ctx.asm
                .write_memword((opcode + self.pie_bit()) as Word);
            ctx.asm
                .write_label_ref(&label, offs as i64, self.ref_mode());
        }
        Ok(())
    }

    /// Load a two-byte value into `X:Y` (function results and the INT
    /// calling convention).
    fn movl_to_regs(&self, ctx: &mut CompileCtx, src: Loc) -> CodegenResult<()> {
        let src = self.to_memory(ctx, src)?;
        self.load_part(ctx, src, REG_X, 0)?;
        self.load_part(ctx, src, REG_Y, 1)
    }
}

impl TargetIsa for Gr8Backend {
    fn name(&self) -> &'static str {
        "gr8"
    }

    fn config(&self) -> &TargetConfig {
        &CONFIG
    }

    fn flags(&self) -> &Flags {
        &self.flags
    }

    fn emit_function_entry(&self, ctx: &mut CompileCtx, func: &FuncDef) -> CodegenResult<()> {
        let sig = FuncSig::of(func);
        let conv = self.classify(ctx, &sig);
        log::debug!("entry '{}': conv {conv:?}", func.name);

        // Every parameter gets an argument label in .bss, which is also its
        // home for the whole function.
        for (i, param) in func.params.iter().enumerate() {
            let label = Self::arg_label(&func.name, i);
            let size = ctx.types.size_words(param.ty).max(1);
            ctx.asm.bss_label(&label, size);
            let var = ctx.alloc(crate::loc::LocData {
                kind: LocKind::Label(label),
                ty: param.ty,
                owner: Some(param.name.clone()),
                default_loc: None,
            });
            if !ctx.define_var(&param.name, var) {
                ctx.diag
                    .error(param.pos, format!("duplicate parameter '{}'", param.name));
            }
        }

        ctx.asm.write_label(&func.name);
        match conv {
            CallConv::Int => {
                // The one two-byte argument arrives in X:Y.
                let label = Self::arg_label(&func.name, 0);
                ctx.asm
                    .write_memword((OFFS_MOVST + OFFS_MOVM_RM + REG_X + self.pie_bit()) as Word);
                ctx.asm.write_label_ref(&label, 0, self.ref_mode());
                ctx.asm
                    .write_memword((OFFS_MOVST + OFFS_MOVM_RM + REG_Y + self.pie_bit()) as Word);
                ctx.asm.write_label_ref(&label, 1, self.ref_mode());
            }
            CallConv::Char => {
                // Byte arguments arrive in A, X, Y.
                for (i, _) in func.params.iter().enumerate() {
                    let label = Self::arg_label(&func.name, i);
                    let reg = REG_A + i as u8;
                    ctx.asm.write_memword(
                        (OFFS_MOVST + OFFS_MOVM_RM + reg + self.pie_bit()) as Word,
                    );
                    ctx.asm.write_label_ref(&label, 0, self.ref_mode());
                }
            }
            CallConv::Mem => {
                // The caller stored the arguments already.
            }
        }
        Ok(())
    }

    fn emit_return(&self, ctx: &mut CompileCtx, retval: Option<Loc>) -> CodegenResult<()> {
        if let Some(retval) = retval {
            let ret_ty = ctx.cur_func().sig.ret;
            let words = ctx.types.size_words(ret_ty);
            match words {
                0 => {}
                1 => {
                    let retval = self.to_memory(ctx, retval)?;
                    self.load_part(ctx, retval, REG_A, 0)?;
                }
                2 => self.movl_to_regs(ctx, retval)?,
                _ => {
                    ctx.diag.error(
                        ctx.cur_func().sig.pos,
                        "return values wider than two bytes are not supported on this target",
                    );
                }
            }
        }
        ctx.asm.write_memword(INSN_RET as Word);
        Ok(())
    }

    fn emit_call(
        &self,
        ctx: &mut CompileCtx,
        sig: &FuncSig,
        callee: &Expr,
        args: &[Expr],
    ) -> CodegenResult<Loc> {
        let conv = self.classify(ctx, sig);
        log::debug!("call '{}' ({conv:?})", sig.name);
        let callee_loc = lower::expression(self, ctx, callee, None)?;

        // Evaluate arguments into memory, then load or store them by
        // convention.
        let mut locations = Vec::with_capacity(args.len());
        for arg in args {
            let loc = lower::expression(self, ctx, arg, None)?;
            locations.push(self.to_memory(ctx, loc)?);
        }
        match conv {
            CallConv::Int => {
                if let Some(loc) = locations.first() {
                    self.movl_to_regs(ctx, *loc)?;
                }
            }
            CallConv::Char => {
                // Load A last; it is the scratch register for everything.
                for (i, loc) in locations.iter().enumerate().rev() {
                    self.load_part(ctx, *loc, REG_A + i as u8, 0)?;
                }
            }
            CallConv::Mem => {
                for (i, loc) in locations.iter().enumerate() {
                    let label = Self::arg_label(&sig.name, i);
                    let size = ctx.size_of(*loc).max(1);
                    let dst = ctx.alloc_anon(LocKind::Label(label), ctx.locs[*loc].ty);
                    for offs in 0..size {
                        self.load_part(ctx, *loc, REG_A, offs)?;
                        self.store_part(ctx, dst, REG_A, offs)?;
                    }
                }
            }
        }

        match ctx.locs[callee_loc].kind.clone() {
            LocKind::Label(label) => {
                ctx.asm
                    .write_memword((INSN_CALL | self.pie_bit()) as Word);
                ctx.asm.write_label_ref(&label, 0, self.ref_mode());
            }
            LocKind::Const(addr) => {
                ctx.asm.write_memword(INSN_CALL as Word);
                ctx.asm.write_address(addr);
            }
            _ => {
                ctx.diag
                    .error(callee.pos, "computed calls are not supported on this target");
                return Ok(ctx.alloc_void());
            }
        }
        for loc in &locations {
            scope::unuse(ctx, *loc);
        }

        let ret_words = ctx.types.size_words(sig.ret);
        if ret_words == 0 {
            return Ok(ctx.alloc_void());
        }
        if ret_words > 2 {
            ctx.diag.error(
                callee.pos,
                format!("return value of '{}' is too wide for this target", sig.name),
            );
            return Ok(ctx.alloc_void());
        }
        // Park the result in a temp label; A and X:Y are too volatile to
        // hold it for long.
        let tmp = scope::get_tmp(ctx, ret_words, false)?;
        ctx.locs[tmp].ty = sig.ret;
        if ret_words == 1 {
            self.store_part(ctx, tmp, REG_A, 0)?;
        } else {
            self.store_part(ctx, tmp, REG_X, 0)?;
            self.store_part(ctx, tmp, REG_Y, 1)?;
        }
        Ok(tmp)
    }

    fn emit_math1(
        &self,
        ctx: &mut CompileCtx,
        op: Oper,
        hint: Option<Loc>,
        a: Loc,
        pos: Pos,
    ) -> CodegenResult<Loc> {
        let bool_ty = ctx.types.simple(SimpleType::Bool);
        match op {
            Oper::Add | Oper::Sub => {
                let a = self.to_memory(ctx, a)?;
                let output = match hint {
                    Some(h) if locations_equivalent(&ctx.locs, h, a) => a,
                    _ => {
                        let out = self.math_output(ctx, hint, a)?;
                        self.emit_mov(ctx, out, a)?;
                        out
                    }
                };
                let output = self.to_memory(ctx, output)?;
                self.math1_mem(ctx, op, output)?;
                Ok(output)
            }
            Oper::PostInc | Oper::PostDec => {
                let a = self.to_memory(ctx, a)?;
                let temp = self.math_output(ctx, hint, a)?;
                self.emit_mov(ctx, temp, a)?;
                let inner = if op == Oper::PostInc { Oper::Add } else { Oper::Sub };
                self.math1_mem(ctx, inner, a)?;
                Ok(temp)
            }
            Oper::Shl | Oper::Shr => {
                let a = self.to_memory(ctx, a)?;
                let output = match hint {
                    Some(h) if locations_equivalent(&ctx.locs, h, a) => a,
                    _ => {
                        let out = self.math_output(ctx, hint, a)?;
                        self.emit_mov(ctx, out, a)?;
                        out
                    }
                };
                let output = self.to_memory(ctx, output)?;
                self.math1_mem(ctx, op, output)?;
                Ok(output)
            }
            Oper::LogicNot => {
                if let LocKind::Condition(cond) = ctx.locs[a].kind {
                    ctx.locs[a].kind = LocKind::Condition(inv_branch(cond));
                    return Ok(a);
                }
                let zero = ctx.alloc_const(0, ctx.locs[a].ty);
                self.math2(ctx, Oper::Eq, hint, a, zero, pos)
            }
            op if op.is_comparison() => {
                // Arrives from the constant-one rewrite.
                let one = ctx.alloc_const(1, ctx.locs[a].ty);
                self.math2(ctx, op, hint, a, one, pos)
            }
            Oper::Deref => {
                let int = ctx.types.simple(SimpleType::SInt);
                let pointee = ctx.types.underlying(ctx.locs[a].ty).unwrap_or(int);
                Ok(ctx.alloc_anon(LocKind::Pointer(a), pointee))
            }
            Oper::AddrOf => {
                // &*p is p; anything else must live behind a label, whose
                // address is loaded byte by byte.
                if let LocKind::Pointer(ptr) = ctx.locs[a].kind {
                    return Ok(ptr);
                }
                let mem = self.to_memory(ctx, a)?;
                let label = match ctx.locs[mem].kind.clone() {
                    LocKind::Label(label) => label,
                    _ => {
                        ctx.diag
                            .error(pos, "cannot take the address of this value");
                        return Ok(ctx.alloc_const(0, bool_ty));
                    }
                };
                let pointee = ctx.locs[mem].ty;
                let ptr_ty = ctx.types.pointer_to(pointee);
                let out = match hint {
                    Some(h) if matches!(ctx.locs[h].kind, LocKind::Label(_)) => h,
                    _ => {
                        let tmp = scope::get_tmp(ctx, 2, false)?;
                        ctx.locs[tmp].ty = ptr_ty;
                        tmp
                    }
                };
                // Low byte, then high byte of the label's address.
                ctx.asm.write_memword((OFFS_MOV_RI + REG_A) as Word);
                ctx.asm
                    .write_label_ref(&label, 0, LabelRefMode::AbsWord);
                self.store_part(ctx, out, REG_A, 0)?;
                ctx.asm.write_memword((OFFS_MOV_RI + REG_A) as Word);
                ctx.asm
                    .write_label_ref(&label, 0, LabelRefMode::AbsWordHigh);
                self.store_part(ctx, out, REG_A, 1)?;
                Ok(out)
            }
            Oper::Neg => {
                let zero = ctx.alloc_const(0, ctx.locs[a].ty);
                self.math2(ctx, Oper::Sub, hint, zero, a, pos)
            }
            Oper::BitNot => {
                let size = ctx.size_of(a).max(1);
                let ones = ctx.alloc_const(
                    if size >= 8 { u64::MAX } else { (1u64 << (8 * size)) - 1 },
                    ctx.locs[a].ty,
                );
                self.math2(ctx, Oper::BitXor, hint, a, ones, pos)
            }
            _ => {
                ctx.diag
                    .error(pos, format!("operation {op:?} is not unary"));
                Ok(a)
            }
        }
    }

    fn emit_math2(
        &self,
        ctx: &mut CompileCtx,
        op: Oper,
        hint: Option<Loc>,
        mut a: Loc,
        mut b: Loc,
        pos: Pos,
    ) -> CodegenResult<Loc> {
        if op == Oper::Add
            && ctx.types.is_pointer(ctx.locs[b].ty)
            && !ctx.types.is_pointer(ctx.locs[a].ty)
        {
            core::mem::swap(&mut a, &mut b);
        }
        // A constant on a commutative operation goes second, where it can
        // be encoded as an immediate.
        if op.is_commutative()
            && matches!(ctx.locs[a].kind, LocKind::Const(_))
            && !matches!(ctx.locs[b].kind, LocKind::Const(_))
        {
            core::mem::swap(&mut a, &mut b);
        }
        // Pointer arithmetic scales by the element size.
        if op.is_add() && ctx.types.is_pointer(ctx.locs[a].ty) {
            let int = ctx.types.simple(SimpleType::SInt);
            let elem = ctx.types.underlying(ctx.locs[a].ty).unwrap_or(int);
            let scale = ctx.types.size_words(elem).max(1);
            if scale != 1 {
                match ctx.locs[b].kind {
                    LocKind::Const(v) => b = ctx.alloc_const(v * scale as Word, ctx.locs[b].ty),
                    _ => {
                        ctx.diag.error(
                            pos,
                            "variable offset from a pointer to multi-byte elements \
                             is not supported on this target",
                        );
                        return Ok(a);
                    }
                }
            }
        }

        // Adding or subtracting zero is a move, or nothing at all.
        if op.is_add() && matches!(ctx.locs[b].kind, LocKind::Const(0)) {
            return match hint.filter(|h| {
                !matches!(
                    ctx.locs[*h].kind,
                    LocKind::Condition(_)
                        | LocKind::Void
                        | LocKind::Unassigned
                        | LocKind::ReturnValue
                )
            }) {
                Some(h) if !locations_equivalent(&ctx.locs, h, a) => {
                    self.emit_mov(ctx, h, a)?;
                    Ok(h)
                }
                _ => Ok(a),
            };
        }
        // Counting by constant one has the shorter INC/DEC form.
        if op.is_add() && matches!(ctx.locs[b].kind, LocKind::Const(1)) {
            return self.emit_math1(ctx, op, hint, a, pos);
        }

        match op {
            Oper::Shl | Oper::Shr => {
                let count = match ctx.locs[b].kind {
                    LocKind::Const(v) => v,
                    _ => {
                        ctx.diag
                            .error(pos, "variable shift counts are not supported on this target");
                        return Ok(a);
                    }
                };
                let total_bits = 8 * ctx.size_of(a).max(1) as u64;
                if count >= total_bits {
                    let zero = ctx.alloc_const(0, ctx.locs[a].ty);
                    let out = self.math_output(ctx, hint, a)?;
                    self.emit_mov(ctx, out, zero)?;
                    return Ok(out);
                }
                let a = self.to_memory(ctx, a)?;
                let output = match hint {
                    Some(h) if locations_equivalent(&ctx.locs, h, a) => a,
                    _ => {
                        let out = self.math_output(ctx, hint, a)?;
                        self.emit_mov(ctx, out, a)?;
                        out
                    }
                };
                let output = self.to_memory(ctx, output)?;
                for _ in 0..count {
                    self.math1_mem(ctx, op, output)?;
                }
                Ok(output)
            }
            Oper::Mul | Oper::Div | Oper::Mod => {
                ctx.diag.error(
                    pos,
                    format!("operation {op:?} is not supported on this target"),
                );
                Ok(a)
            }
            _ => self.math2(ctx, op, hint, a, b, pos),
        }
    }

    fn emit_mov(&self, ctx: &mut CompileCtx, dst: Loc, src: Loc) -> CodegenResult<()> {
        if matches!(ctx.locs[dst].kind, LocKind::Unassigned) {
            let default = ctx.locs[dst].default_loc.expect("unassigned var has home");
            let kind = ctx.locs[default].kind.clone();
            ctx.locs[dst].kind = kind;
        }
        if locations_equivalent(&ctx.locs, dst, src) {
            return Ok(());
        }
        if let LocKind::Condition(cond) = ctx.locs[src].kind {
            return self.branch_to_var(ctx, cond, dst);
        }
        if matches!(ctx.locs[dst].kind, LocKind::Condition(_)) {
            // Fold the value into flags by testing it against zero.
            let mem = self.to_memory(ctx, src)?;
            let zero = ctx.alloc_const(0, ctx.locs[mem].ty);
            let res = self.math2(ctx, Oper::Ne, Some(dst), mem, zero, Pos::default())?;
            debug_assert_eq!(res, dst);
            return Ok(());
        }
        let n_words = if matches!(ctx.locs[src].kind, LocKind::Const(_)) {
            ctx.size_of(dst).max(1)
        } else {
            ctx.size_of(dst).max(1).min(ctx.size_of(src).max(1))
        };
        for offs in 0..n_words {
            self.load_part(ctx, src, REG_A, offs)?;
            self.store_part(ctx, dst, REG_A, offs)?;
        }
        Ok(())
    }

    fn emit_cast(&self, ctx: &mut CompileCtx, a: Loc, ty: Type) -> CodegenResult<Loc> {
        let src_ty = ctx.locs[a].ty;
        if ctx.types.equals(src_ty, ty) {
            return Ok(a);
        }
        if matches!(ctx.locs[a].kind, LocKind::Const(_))
            || ctx.types.size_words(src_ty) == ctx.types.size_words(ty)
        {
            let mut data = ctx.locs[a].clone();
            data.ty = ty;
            return Ok(ctx.alloc(data));
        }
        let old = ctx.types.size_words(src_ty).max(1);
        let new = ctx.types.size_words(ty).max(1);
        let out = scope::get_tmp(ctx, new, false)?;
        ctx.locs[out].ty = ty;
        let copy = old.min(new);
        for offs in 0..copy {
            self.load_part(ctx, a, REG_A, offs)?;
            self.store_part(ctx, out, REG_A, offs)?;
        }
        if new > old {
            // Zero extension; sign extension would need a conditional and
            // the unsigned types dominate on this machine.
            let zero = ctx.alloc_const(0, ty);
            self.load_part(ctx, zero, REG_A, 0)?;
            for offs in old..new {
                self.store_part(ctx, out, REG_A, offs)?;
            }
        }
        Ok(out)
    }

    fn emit_branch(
        &self,
        ctx: &mut CompileCtx,
        cond: Loc,
        l_true: Option<&str>,
        l_false: Option<&str>,
    ) -> CodegenResult<()> {
        self.branch(ctx, cond, l_true, l_false)
    }

    fn emit_jump(&self, ctx: &mut CompileCtx, label: &str) -> CodegenResult<()> {
        self.branch_insn(ctx, INSN_JMP, label);
        Ok(())
    }

    fn memclobber(&self, ctx: &mut CompileCtx, _stack_dirty: bool) -> CodegenResult<()> {
        // Nothing to reconcile: the generator never moves the hardware
        // stack pointer on this machine.
        let scope = ctx.scope_mut();
        scope.real_stack_size = scope.stack_size;
        Ok(())
    }

    fn iasm_operand(
        &self,
        ctx: &mut CompileCtx,
        loc: Loc,
        constraint: &Constraint,
    ) -> CodegenResult<String> {
        let needs_change = match &ctx.locs[loc].kind {
            LocKind::Const(_) => !constraint.known_const,
            LocKind::Register(_) => !constraint.register,
            LocKind::Label(_) => !constraint.memory,
            _ => true,
        };
        if needs_change {
            if constraint.memory {
                let mem = self.to_memory(ctx, loc)?;
                let kind = ctx.locs[mem].kind.clone();
                ctx.locs[loc].kind = kind;
            } else if constraint.register {
                let reg = scope::pick_register(self, ctx, true)?;
                self.load_part(ctx, loc, reg, 0)?;
                ctx.locs[loc].kind = LocKind::Register(reg);
                scope::claim_reg(ctx, reg, loc);
            } else {
                return Err(CodegenError::ImpossibleConstraint(constraint.raw.clone()));
            }
        }
        Ok(match &ctx.locs[loc].kind {
            LocKind::Const(value) => format!("0x{:02x}", *value as u8),
            LocKind::Register(reg) => CONFIG.reg_name(*reg).to_string(),
            LocKind::Label(label) => format!("[{label}]"),
            _ => return Err(CodegenError::ImpossibleConstraint(constraint.raw.clone())),
        })
    }

    fn asm_line(&self, ctx: &mut CompileCtx, line: &str, pos: Pos) -> CodegenResult<()> {
        iasm::asm_line(self, ctx, line, pos)
    }
}
