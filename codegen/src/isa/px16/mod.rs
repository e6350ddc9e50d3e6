//! The Pixie 16 target: a 16-bit little-endian machine with four general
//! registers `R0..R3`, a descending stack through `ST`, conditional
//! `MOV`/`LEA` as branches, and carry-continue opcode variants for
//! multi-word arithmetic.
//!
//! Position-independent executables are the default; giving the program a
//! fixed entry point with `-mentrypoint=<label>` switches to absolute
//! addressing and emits the `.entrypoints` vector table (IRQ, NMI, entry at
//! addresses 0, 1 and 2).

mod iasm;
mod inst;

use self::inst::*;
use crate::asm::output::Layout;
use crate::asm::LabelRefMode;
use crate::ast::{Expr, FuncDef, FuncSig, Oper, Pos};
use crate::context::CompileCtx;
use crate::diag::{CodegenError, CodegenResult};
use crate::iasm::Constraint;
use crate::isa::{Flags, SetError, TargetBuilder, TargetConfig, TargetIsa};
use crate::loc::{locations_equivalent, Loc, LocData, LocKind};
use crate::lower;
use crate::scope;
use crate::types::{SimpleType, Type};
use crate::{CodeOffset, Word};

/// Number of general registers.
const NUM_REGS: u8 = 4;

const CONFIG: TargetConfig = TargetConfig {
    name: "px16",
    word_bits: 16,
    mem_bits: 16,
    addr_bits: 16,
    char_bits: 16,
    short_bits: 16,
    int_bits: 16,
    long_bits: 32,
    long_long_bits: 64,
    float_bits: 32,
    double_bits: 32,
    long_double_bits: 64,
    big_endian: false,
    char_signed: false,
    reg_count: NUM_REGS,
    reg_names: &["R0", "R1", "R2", "R3", "ST", "PF", "PC", "imm"],
    stack_temps: true,
};

/// Builder applying `-m` options for the px16 backend.
#[derive(Default)]
pub struct Px16Builder {
    entrypoint: Option<String>,
    irqhandler: Option<String>,
    nmihandler: Option<String>,
}

impl TargetBuilder for Px16Builder {
    fn set_machine_opt(&mut self, opt: &str) -> Result<(), SetError> {
        let (key, value) = match opt.split_once('=') {
            Some((key, value)) if !value.is_empty() => (key, value),
            _ => (opt, ""),
        };
        let slot = match key {
            "entrypoint" => &mut self.entrypoint,
            "irqhandler" => &mut self.irqhandler,
            "nmihandler" => &mut self.nmihandler,
            _ => return Err(SetError::UnknownOption(opt.to_string())),
        };
        if value.is_empty() {
            return Err(SetError::MissingValue(key.to_string(), "<label name>"));
        }
        *slot = Some(value.to_string());
        Ok(())
    }

    fn finish(self: Box<Self>, flags: Flags) -> CodegenResult<Box<dyn TargetIsa>> {
        Ok(Box::new(Px16Backend {
            flags,
            entrypoint: self.entrypoint,
            irqhandler: self.irqhandler,
            nmihandler: self.nmihandler,
        }))
    }
}

/// Type of calling convention to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallConv {
    /// Functions with no parameters.
    None,
    /// Up to four words of parameters, in `R0` through `R3`.
    Regs,
    /// More than four words of parameters, on the stack, first parameter
    /// pushed last.
    Stack,
}

/// Per-function ABI decisions, derived from the signature.
#[derive(Clone, Debug)]
struct CallInfo {
    conv: CallConv,
    /// Total parameter size in words.
    arg_words: CodeOffset,
    /// Callee-saved registers pushed on entry (`R3` downward).
    num_reg_to_push: u8,
    is_entry: bool,
    is_irq: bool,
    is_nmi: bool,
}

/// The px16 backend.
pub struct Px16Backend {
    flags: Flags,
    entrypoint: Option<String>,
    irqhandler: Option<String>,
    nmihandler: Option<String>,
}

impl Px16Backend {
    /// Whether to use PC-relative addressing for label references.
    pub(super) fn pie(&self) -> bool {
        self.flags.pie && self.entrypoint.is_none()
    }

    /// Determine the calling convention for a function.
    fn classify(&self, ctx: &CompileCtx, sig: &FuncSig) -> CallInfo {
        let arg_words: CodeOffset = sig
            .params
            .iter()
            .map(|p| ctx.types.size_words(p.ty).max(1))
            .sum();
        let ret_words = ctx.types.size_words(sig.ret);

        let (conv, num_reg_to_push) = if arg_words > NUM_REGS as CodeOffset {
            let n = if ret_words < 4 { 4 - ret_words } else { 0 };
            (CallConv::Stack, n as u8)
        } else if arg_words != 0 {
            let n = if ret_words > 4 || ret_words == 0 {
                4 - arg_words
            } else {
                (4 - arg_words).min(4 - ret_words)
            };
            (CallConv::Regs, n as u8)
        } else {
            let n = if ret_words < 4 { 4 - ret_words } else { 0 };
            (CallConv::None, n as u8)
        };

        CallInfo {
            conv,
            arg_words,
            num_reg_to_push,
            is_entry: self.entrypoint.as_deref() == Some(&sig.name),
            is_irq: self.irqhandler.as_deref() == Some(&sig.name),
            is_nmi: self.nmihandler.as_deref() == Some(&sig.name),
        }
    }

    /// Push the callee-saved registers, `R3` downward.
    fn entry_push_regs(&self, ctx: &mut CompileCtx, info: &CallInfo) {
        if info.is_entry {
            // The entry point has nothing to return to.
            return;
        }
        for i in 0..info.num_reg_to_push {
            let insn = Insn {
                y: false,
                x: ADDR_MEM,
                b: 3 - i,
                a: REG_ST,
                o: OP_MOV,
            };
            self.write_insn_raw(ctx, insn, None, 0, None, 0);
            let scope = ctx.scope_mut();
            scope.stack_size += 1;
            scope.real_stack_size += 1;
        }
    }

    /// The shared tail of both math emitters: resolve the output location
    /// and copy the left operand into it when the operation cannot run in
    /// place.
    fn math_output(
        &self,
        ctx: &mut CompileCtx,
        hint: Option<Loc>,
        a: Loc,
        is_compare: bool,
        n_words: CodeOffset,
    ) -> CodegenResult<(Loc, Loc)> {
        let out_hint = hint.filter(|h| {
            !matches!(
                ctx.locs[*h].kind,
                LocKind::Condition(_) | LocKind::Void | LocKind::Unassigned
            )
        });
        if is_compare {
            // Compares only produce flags; operate on the source directly.
            return Ok((a, a));
        }
        match out_hint {
            Some(h) if locations_equivalent(&ctx.locs, h, a) => Ok((h, a)),
            Some(h) => {
                self.emit_mov(ctx, h, a)?;
                Ok((h, h))
            }
            None => {
                let tmp = scope::get_tmp(ctx, n_words, true)?;
                ctx.locs[tmp].ty = ctx.locs[a].ty;
                self.emit_mov(ctx, tmp, a)?;
                Ok((tmp, tmp))
            }
        }
    }

    /// Creates MATH1 instructions: one word at a time, carry-continue for
    /// every word after the first. `SHR` chains top-down instead.
    fn math1(
        &self,
        ctx: &mut CompileCtx,
        mut opcode: u8,
        hint: Option<Loc>,
        a: Loc,
    ) -> CodegenResult<Loc> {
        let n_words = ctx.size_of(a).max(1);
        let is_compare = opcode == OP_CMP1;
        let (output, mut target) = self.math_output(ctx, hint, a, is_compare, n_words)?;
        // Constants have no writable home; give them one.
        if matches!(ctx.locs[target].kind, LocKind::Const(_)) {
            let tmp = scope::get_tmp(ctx, n_words, true)?;
            ctx.locs[tmp].ty = ctx.locs[target].ty;
            self.emit_mov(ctx, tmp, target)?;
            target = tmp;
        }
        self.pointer_to_reg(ctx, target)?;

        let parts: Vec<CodeOffset> = if opcode == OP_SHR {
            (0..n_words).rev().collect()
        } else {
            (0..n_words).collect()
        };
        for part in parts {
            let op = self.operand(ctx, target, part, true, 0)?;
            let insn = Insn {
                y: false,
                x: op.mode,
                b: 0,
                a: op.field,
                o: opcode,
            };
            self.write_insn(ctx, insn, op.label.as_deref(), op.offs, None, 0)?;
            // The rest continue the carry chain.
            opcode |= OFFS_CC;
        }

        if is_compare {
            let bool_ty = ctx.types.simple(SimpleType::Bool);
            return Ok(hint.unwrap_or_else(|| ctx.alloc_anon(LocKind::Condition(COND_UGE), bool_ty)));
        }
        Ok(output)
    }

    /// Creates MATH2 instructions.
    fn math2(
        &self,
        ctx: &mut CompileCtx,
        mut opcode: u8,
        hint: Option<Loc>,
        mut a: Loc,
        mut b: Loc,
    ) -> CodegenResult<Loc> {
        // Match sizes when a signed operand is involved.
        let (sa, sb) = (ctx.size_of(a).max(1), ctx.size_of(b).max(1));
        if sa != sb
            && (ctx.types.is_signed(ctx.locs[a].ty) || ctx.types.is_signed(ctx.locs[b].ty))
        {
            if sa > sb {
                b = self.emit_cast(ctx, b, ctx.locs[a].ty)?;
            } else {
                a = self.emit_cast(ctx, a, ctx.locs[b].ty)?;
            }
        }
        let n_words = ctx.size_of(a).max(1).min(ctx.size_of(b).max(1));
        let swappable = matches!(opcode, OP_ADD | OP_XOR | OP_AND | OP_OR);
        let is_compare = opcode == OP_CMP;

        // Translate the return-value hint into its real location.
        if let Some(h) = hint {
            if matches!(ctx.locs[h].kind, LocKind::ReturnValue) {
                ctx.locs[h].kind = LocKind::Register(REG_R0);
                if matches!(ctx.locs[b].kind, LocKind::Register(REG_R0)) {
                    if swappable {
                        core::mem::swap(&mut a, &mut b);
                    } else {
                        scope::vacate_reg(self, ctx, REG_R0)?;
                    }
                }
            }
        }
        let cond_hint =
            hint.filter(|h| matches!(ctx.locs[*h].kind, LocKind::Condition(_)));

        let (output, target) = self.math_output(ctx, hint, a, is_compare, n_words)?;
        self.pointer_to_reg(ctx, target)?;
        self.pointer_to_reg(ctx, b)?;

        // A scratch register is needed when both operands sit in memory.
        let a_is_reg = matches!(ctx.locs[target].kind, LocKind::Register(_));
        let b_is_reg = matches!(ctx.locs[b].kind, LocKind::Register(_));
        let b_is_const = matches!(ctx.locs[b].kind, LocKind::Const(_));
        let conv_b = !a_is_reg && !b_is_reg && !b_is_const;
        let reg_b = if conv_b {
            let reg = scope::pick_register(self, ctx, true)?;
            scope::touch_reg(ctx, reg);
            ctx.reg_lock[reg as usize] = true;
            reg
        } else if let LocKind::Register(reg) = ctx.locs[b].kind {
            reg
        } else {
            REG_IMM
        };

        for part in 0..n_words {
            // Constant one of the low word (or zero of a later word)
            // reduces to the INC/DEC/CMP1 family.
            let mut do_inc = false;
            if let LocKind::Const(value) = ctx.locs[b].kind {
                let word = (value >> (16 * part)) & 0xffff;
                do_inc = (part == 0 && word == 1) || (part != 0 && word == 0);
                do_inc &= (opcode & !OFFS_CC) <= OP_CMP;
            }

            let mut insn = Insn {
                y: false,
                o: if do_inc { opcode | OP_INC } else { opcode },
                ..Insn::default()
            };
            let op_a = self.operand(ctx, target, part, true, 0)?;
            insn.x = op_a.mode;
            insn.a = op_a.field;
            let mut label1 = None;
            let mut offs1 = 0;
            if do_inc {
                insn.b = 0;
            } else if conv_b {
                self.part_to_reg(ctx, b, reg_b, part)?;
                insn.b = reg_b;
            } else if insn.x == ADDR_IMM {
                // Operand A took no addressing mode, so B may have one.
                let op_b = self.operand(ctx, b, part, true, reg_b)?;
                insn.y = true;
                insn.x = op_b.mode;
                insn.b = op_b.field;
                label1 = op_b.label;
                offs1 = op_b.offs;
            } else {
                let op_b = self.operand(ctx, b, part, false, reg_b)?;
                insn.b = op_b.field;
                label1 = op_b.label;
                offs1 = op_b.offs;
            }
            self.write_insn(
                ctx,
                insn,
                op_a.label.as_deref(),
                op_a.offs,
                label1.as_deref(),
                offs1,
            )?;
            opcode |= OFFS_CC;
        }

        if conv_b {
            ctx.reg_lock[reg_b as usize] = false;
        }

        if let Some(cond) = cond_hint {
            let bool_ty = ctx.types.simple(SimpleType::Bool);
            ctx.locs[cond].kind = LocKind::Condition(COND_NE);
            ctx.locs[cond].ty = bool_ty;
            return Ok(cond);
        }
        Ok(output)
    }

    /// Map a comparison operator to a condition code.
    fn compare_cond(&self, ctx: &CompileCtx, op: Oper, a: Loc, b: Loc) -> u8 {
        let signed =
            ctx.types.is_signed(ctx.locs[a].ty) && ctx.types.is_signed(ctx.locs[b].ty);
        match (op, signed) {
            (Oper::Gt, true) => COND_SGT,
            (Oper::Gt, false) => COND_UGT,
            (Oper::Ge, true) => COND_SGE,
            (Oper::Ge, false) => COND_UGE,
            (Oper::Lt, true) => COND_SLT,
            (Oper::Lt, false) => COND_ULT,
            (Oper::Le, true) => COND_SLE,
            (Oper::Le, false) => COND_ULE,
            (Oper::Eq, _) => COND_EQ,
            (Oper::Ne, _) => COND_NE,
            _ => unreachable!("not a comparison operator"),
        }
    }

    /// Compare against zero through `CMP1` (which tests `a - 1`, so
    /// equality to zero reads as unsigned-less-than).
    fn compare_zero(
        &self,
        ctx: &mut CompileCtx,
        hint: Option<Loc>,
        a: Loc,
        cond: u8,
    ) -> CodegenResult<Loc> {
        let bool_ty = ctx.types.simple(SimpleType::Bool);
        let output = match hint {
            Some(h) if matches!(ctx.locs[h].kind, LocKind::Condition(_)) => h,
            _ => ctx.alloc_anon(LocKind::Condition(cond), bool_ty),
        };
        self.math1(ctx, OP_CMP1, Some(output), a)?;
        ctx.locs[output].kind = LocKind::Condition(cond);
        ctx.locs[output].ty = bool_ty;
        Ok(output)
    }

    /// Reinterpret a value in place as another type.
    fn reinterpret(&self, ctx: &mut CompileCtx, a: Loc, ty: Type) -> Loc {
        let mut data = ctx.locs[a].clone();
        data.ty = ty;
        ctx.alloc(data)
    }

    /// The address-of operation: `LEA` of a memory location.
    fn addr_of(&self, ctx: &mut CompileCtx, hint: Option<Loc>, a: Loc) -> CodegenResult<Loc> {
        // &*p is just p.
        if let LocKind::Pointer(ptr) = ctx.locs[a].kind {
            return Ok(ptr);
        }

        let hint_reg = hint.filter(|h| matches!(ctx.locs[*h].kind, LocKind::Register(_)));
        let regno = match hint_reg {
            Some(h) => match ctx.locs[h].kind {
                LocKind::Register(reg) => reg,
                _ => unreachable!(),
            },
            None => scope::pick_register(self, ctx, true)?,
        };
        ctx.reg_lock[regno as usize] = true;

        let pointee = ctx.locs[a].ty;
        let size = ctx.size_of(a).max(1);
        match ctx.locs[a].kind.clone() {
            LocKind::Label(label) => {
                let insn = if self.pie() {
                    Insn {
                        y: true,
                        x: ADDR_PC,
                        b: REG_IMM,
                        a: regno,
                        o: OP_LEA,
                    }
                } else {
                    Insn {
                        y: true,
                        x: ADDR_MEM,
                        b: REG_IMM,
                        a: regno,
                        o: OP_LEA,
                    }
                };
                self.write_insn(ctx, insn, None, 0, Some(&label), 0)?;
            }
            LocKind::StackOffset(offset) => {
                let insn = Insn {
                    y: true,
                    x: ADDR_ST,
                    b: REG_IMM,
                    a: regno,
                    o: OP_LEA,
                };
                let depth = self.stack_depth(ctx, offset, size, 0);
                self.write_insn(ctx, insn, None, 0, None, depth)?;
            }
            _ => {
                // Anything else is first given a frame home to point at.
                ctx.reg_lock[regno as usize] = false;
                let tmp = scope::get_tmp(ctx, size, false)?;
                ctx.locs[tmp].ty = pointee;
                self.emit_mov(ctx, tmp, a)?;
                return self.addr_of(ctx, hint, tmp);
            }
        }
        ctx.reg_lock[regno as usize] = false;

        let result = match hint_reg {
            Some(h) => h,
            None => {
                let ptr_ty = ctx.types.pointer_to(pointee);
                let loc = ctx.alloc_anon(LocKind::Register(regno), ptr_ty);
                scope::claim_reg(ctx, regno, loc);
                loc
            }
        };
        Ok(result)
    }

    /// Convert a deferred condition into 0/1 at `dst` by branching to one
    /// of two constant stores.
    fn cond_to_value(&self, ctx: &mut CompileCtx, dst: Loc, cond: u8) -> CodegenResult<()> {
        let l_true = ctx.asm.numbered_label();
        let l_skip = ctx.asm.numbered_label();
        let ty = ctx.locs[dst].ty;
        let n_words = ctx.size_of(dst).max(1);
        let cond_loc = ctx.alloc_anon(LocKind::Condition(cond), ty);
        self.branch(ctx, cond_loc, Some(&l_true), None)?;
        let zero = ctx.alloc_const(0, ty);
        self.mov_n(ctx, dst, zero, n_words)?;
        self.jump(ctx, &l_skip)?;
        ctx.asm.write_label(&l_true);
        let one = ctx.alloc_const(1, ty);
        self.mov_n(ctx, dst, one, n_words)?;
        ctx.asm.write_label(&l_skip);
        Ok(())
    }

    /// Move a value word-by-word to an arbitrary destination.
    fn mov_n(
        &self,
        ctx: &mut CompileCtx,
        dst: Loc,
        src: Loc,
        n_words: CodeOffset,
    ) -> CodegenResult<()> {
        if locations_equivalent(&ctx.locs, dst, src) {
            return Ok(());
        }
        // Translate the return-value slot into its real location.
        if matches!(ctx.locs[dst].kind, LocKind::ReturnValue) {
            ctx.locs[dst].kind = LocKind::Register(REG_R0);
        }
        // A condition source materialises as 0/1, unless the destination
        // itself only wants flag state.
        if let LocKind::Condition(cond) = ctx.locs[src].kind {
            if !matches!(ctx.locs[dst].kind, LocKind::Condition(_)) {
                return self.cond_to_value(ctx, dst, cond);
            }
        }

        match ctx.locs[dst].kind.clone() {
            LocKind::Register(reg) => {
                for part in 0..n_words {
                    self.part_to_reg(ctx, src, reg + part as u8, part)?;
                }
                scope::claim_reg(ctx, reg, dst);
                Ok(())
            }
            LocKind::Condition(_) => {
                let cond = self.to_condition(ctx, src)?;
                ctx.locs[dst].kind = LocKind::Condition(cond);
                Ok(())
            }
            _ => {
                self.pointer_to_reg(ctx, dst)?;
                self.pointer_to_reg(ctx, src)?;
                let (scratch, through_scratch) = match ctx.locs[src].kind {
                    LocKind::Const(_) => (REG_IMM, false),
                    LocKind::Register(reg) => (reg, false),
                    _ => {
                        let reg = scope::pick_register(self, ctx, true)?;
                        scope::touch_reg(ctx, reg);
                        (reg, true)
                    }
                };
                if scratch < NUM_REGS {
                    ctx.reg_lock[scratch as usize] = true;
                }

                // Stores into the frame run top word first so consecutive
                // pushes hit the stack in physical order.
                let rev = matches!(ctx.locs[dst].kind, LocKind::StackOffset(_));
                let parts: Vec<CodeOffset> = if rev {
                    (0..n_words).rev().collect()
                } else {
                    (0..n_words).collect()
                };
                for part in parts {
                    let mut insn = Insn {
                        y: false,
                        o: OP_MOV,
                        ..Insn::default()
                    };
                    let op_a = self.operand(ctx, dst, part, true, 0)?;
                    insn.x = op_a.mode;
                    insn.a = op_a.field;
                    let mut label1 = None;
                    let mut offs1 = 0;
                    if through_scratch {
                        self.part_to_reg(ctx, src, scratch, part)?;
                        insn.b = scratch;
                    } else if insn.x == ADDR_IMM {
                        let op_b = self.operand(ctx, src, part, true, scratch)?;
                        insn.y = true;
                        insn.x = op_b.mode;
                        insn.b = op_b.field;
                        label1 = op_b.label;
                        offs1 = op_b.offs;
                    } else {
                        let op_b = self.operand(ctx, src, part, false, scratch)?;
                        insn.b = op_b.field;
                        label1 = op_b.label;
                        offs1 = op_b.offs;
                    }
                    self.write_insn(
                        ctx,
                        insn,
                        op_a.label.as_deref(),
                        op_a.offs,
                        label1.as_deref(),
                        offs1,
                    )?;
                }
                if scratch < NUM_REGS {
                    ctx.reg_lock[scratch as usize] = false;
                }
                Ok(())
            }
        }
    }
}

impl TargetIsa for Px16Backend {
    fn name(&self) -> &'static str {
        "px16"
    }

    fn config(&self) -> &TargetConfig {
        &CONFIG
    }

    fn flags(&self) -> &Flags {
        &self.flags
    }

    fn emit_function_entry(&self, ctx: &mut CompileCtx, func: &FuncDef) -> CodegenResult<()> {
        let sig = FuncSig::of(func);
        let info = self.classify(ctx, &sig);
        log::debug!(
            "entry '{}': conv {:?}, {} register(s) saved",
            func.name,
            info.conv,
            info.num_reg_to_push
        );
        ctx.asm.write_label(&func.name);
        self.entry_push_regs(ctx, &info);
        let base = ctx.scope().stack_size;
        ctx.cur.as_mut().expect("inside a function").base_stack_size = base;

        match info.conv {
            CallConv::Regs => {
                // Parameters arrive in R0.., each with a frame slot as its
                // canonical spill home.
                let mut reg = 0u8;
                for param in &func.params {
                    let size = ctx.types.size_words(param.ty).max(1);
                    let offset = ctx.scope().stack_size;
                    ctx.scope_mut().stack_size += size;
                    let home = ctx.alloc(LocData {
                        kind: LocKind::StackOffset(offset),
                        ty: param.ty,
                        owner: Some(param.name.clone()),
                        default_loc: None,
                    });
                    let var = ctx.alloc(LocData {
                        kind: LocKind::Register(reg),
                        ty: param.ty,
                        owner: Some(param.name.clone()),
                        default_loc: Some(home),
                    });
                    scope::claim_reg(ctx, reg, var);
                    if !ctx.define_var(&param.name, var) {
                        ctx.diag
                            .error(param.pos, format!("duplicate parameter '{}'", param.name));
                    }
                    reg += size as u8;
                }
            }
            CallConv::Stack => {
                // First parameter at the lowest offset above the return
                // address.
                let mut offset = 0;
                for param in &func.params {
                    let size = ctx.types.size_words(param.ty).max(1);
                    let home = ctx.alloc(LocData {
                        kind: LocKind::StackFrame(offset),
                        ty: param.ty,
                        owner: Some(param.name.clone()),
                        default_loc: None,
                    });
                    let var = ctx.alloc(LocData {
                        kind: LocKind::StackFrame(offset),
                        ty: param.ty,
                        owner: Some(param.name.clone()),
                        default_loc: Some(home),
                    });
                    if !ctx.define_var(&param.name, var) {
                        ctx.diag
                            .error(param.pos, format!("duplicate parameter '{}'", param.name));
                    }
                    offset += size;
                }
            }
            CallConv::None => {}
        }
        Ok(())
    }

    fn emit_return(&self, ctx: &mut CompileCtx, retval: Option<Loc>) -> CodegenResult<()> {
        let sig = ctx.cur_func().sig.clone();
        let info = self.classify(ctx, &sig);
        // The epilogue's unwinding is local to this control path; code
        // after the return continues with the stack it had.
        let saved_stack = (ctx.scope().stack_size, ctx.scope().real_stack_size);

        if let Some(mut retval) = retval {
            // Enforce the return value in R0.. with the declared type.
            let ret_words = ctx.types.size_words(sig.ret);
            if ctx.size_of(retval) != ret_words {
                retval = self.emit_cast(ctx, retval, sig.ret)?;
            }
            self.mov_to_reg(ctx, retval, REG_R0)?;
        }

        // Pop everything down to the saved registers.
        let base = ctx.cur_func().base_stack_size;
        ctx.scope_mut().stack_size = base;
        self.memclobber_impl(ctx, true)?;

        if !info.is_entry {
            for i in 0..info.num_reg_to_push {
                let insn = Insn {
                    y: true,
                    x: ADDR_MEM,
                    b: REG_ST,
                    a: 4 - info.num_reg_to_push + i,
                    o: OP_MOV,
                };
                self.write_insn_raw(ctx, insn, None, 0, None, 0);
                let scope = ctx.scope_mut();
                scope.stack_size -= 1;
                scope.real_stack_size -= 1;
            }
        }

        if info.is_irq || info.is_nmi {
            // Interrupt handlers restore the flags pushed by the hardware.
            let insn = Insn {
                y: true,
                x: ADDR_MEM,
                b: REG_ST,
                a: REG_PF,
                o: OP_MOV,
            };
            self.write_insn_raw(ctx, insn, None, 0, None, 0);
        }

        let insn = Insn {
            y: true,
            x: ADDR_MEM,
            b: REG_ST,
            a: REG_PC,
            o: OP_MOV,
        };
        self.write_insn_raw(ctx, insn, None, 0, None, 0);

        let scope = ctx.scope_mut();
        (scope.stack_size, scope.real_stack_size) = saved_stack;
        Ok(())
    }

    fn emit_call(
        &self,
        ctx: &mut CompileCtx,
        sig: &FuncSig,
        callee: &Expr,
        args: &[Expr],
    ) -> CodegenResult<Loc> {
        let info = self.classify(ctx, sig);
        let ret_words = ctx.types.size_words(sig.ret);
        log::debug!("call '{}' ({:?})", sig.name, info.conv);

        // The callee address first, so it won't contend with the argument
        // registers.
        let callee_loc = lower::expression(self, ctx, callee, None)?;

        match info.conv {
            CallConv::Regs | CallConv::None => {
                // Vacate every register the call will write: parameters and
                // the return value.
                let clobbered = info.arg_words.max(ret_words.min(4)) as u8;
                for reg in 0..clobbered {
                    scope::vacate_reg(self, ctx, reg)?;
                }

                let mut hints = Vec::with_capacity(args.len());
                let mut locations = Vec::with_capacity(args.len());
                let mut reg = 0u8;
                for (arg, param) in args.iter().zip(&sig.params) {
                    let hint = ctx.alloc_anon(LocKind::Register(reg), param.ty);
                    reg += ctx.types.size_words(param.ty).max(1) as u8;
                    let loc = lower::expression(self, ctx, arg, Some(hint))?;
                    hints.push(hint);
                    locations.push(loc);
                }
                // Everything into its register.
                for (hint, loc) in hints.iter().zip(&locations) {
                    self.emit_mov(ctx, *hint, *loc)?;
                }
                for (hint, loc) in hints.iter().zip(&locations) {
                    if !locations_equivalent(&ctx.locs, *hint, *loc) {
                        scope::unuse(ctx, *loc);
                    }
                }
            }
            CallConv::Stack => {
                let mut locations = Vec::with_capacity(args.len());
                for arg in args {
                    locations.push(lower::expression(self, ctx, arg, None)?);
                }
                self.memclobber_impl(ctx, true)?;

                // Push in reverse order, each argument top word first, so
                // the first parameter lands closest to the frame base.
                let scratch = scope::pick_register(self, ctx, true)?;
                ctx.reg_lock[scratch as usize] = true;
                for (arg, param) in locations.iter().zip(&sig.params).rev() {
                    let size = ctx.types.size_words(param.ty).max(1);
                    for part in (0..size).rev() {
                        let mut insn = Insn {
                            y: false,
                            x: ADDR_MEM,
                            a: REG_ST,
                            o: OP_MOV,
                            ..Insn::default()
                        };
                        let op = self.operand(ctx, *arg, part, false, scratch)?;
                        insn.b = op.field;
                        self.write_insn_raw(ctx, insn, None, 0, op.label.as_deref(), op.offs);
                        let scope = ctx.scope_mut();
                        scope.stack_size += 1;
                        scope.real_stack_size += 1;
                    }
                }
                ctx.reg_lock[scratch as usize] = false;
                for loc in &locations {
                    scope::unuse(ctx, *loc);
                }
            }
        }

        self.memclobber_impl(ctx, true)?;

        // Jump to the subroutine.
        match ctx.locs[callee_loc].kind.clone() {
            LocKind::Const(addr) => {
                let insn = Insn {
                    y: true,
                    x: ADDR_IMM,
                    b: REG_IMM,
                    a: REG_PC,
                    o: OFFS_MOV | COND_JSR,
                };
                self.write_insn(ctx, insn, None, 0, None, addr as i64)?;
            }
            LocKind::Label(label) => {
                let insn = if self.pie() {
                    Insn {
                        y: true,
                        x: ADDR_PC,
                        b: REG_IMM,
                        a: REG_PC,
                        o: OFFS_LEA | COND_JSR,
                    }
                } else {
                    Insn {
                        y: true,
                        x: ADDR_IMM,
                        b: REG_IMM,
                        a: REG_PC,
                        o: OFFS_MOV | COND_JSR,
                    }
                };
                self.write_insn(ctx, insn, None, 0, Some(&label), 0)?;
            }
            LocKind::Register(reg) => {
                let insn = Insn {
                    y: true,
                    x: ADDR_IMM,
                    b: reg,
                    a: REG_PC,
                    o: OFFS_MOV | COND_JSR,
                };
                self.write_insn(ctx, insn, None, 0, None, 0)?;
            }
            _ => {
                // Calls through computed values go via a register.
                let reg = scope::pick_register(self, ctx, true)?;
                self.mov_to_reg(ctx, callee_loc, reg)?;
                let insn = Insn {
                    y: true,
                    x: ADDR_IMM,
                    b: reg,
                    a: REG_PC,
                    o: OFFS_MOV | COND_JSR,
                };
                self.write_insn(ctx, insn, None, 0, None, 0)?;
            }
        }

        // The caller removes stack-passed arguments again.
        if info.conv == CallConv::Stack {
            ctx.scope_mut().stack_size -= info.arg_words;
            self.memclobber_impl(ctx, true)?;
        }

        if ret_words == 0 {
            return Ok(ctx.alloc_void());
        }
        if ret_words > NUM_REGS as CodeOffset {
            ctx.diag.error(
                callee.pos,
                format!("return value of '{}' is too large for registers", sig.name),
            );
            return Ok(ctx.alloc_void());
        }
        let retval = ctx.alloc_anon(LocKind::Register(REG_R0), sig.ret);
        scope::claim_reg(ctx, REG_R0, retval);
        Ok(retval)
    }

    fn emit_math1(
        &self,
        ctx: &mut CompileCtx,
        op: Oper,
        hint: Option<Loc>,
        a: Loc,
        pos: Pos,
    ) -> CodegenResult<Loc> {
        match op {
            Oper::PostInc | Oper::PostDec => {
                // Copy the current value out, then count in place.
                let temp = match hint {
                    Some(h)
                        if !matches!(
                            ctx.locs[h].kind,
                            LocKind::Condition(_) | LocKind::Void
                        ) =>
                    {
                        h
                    }
                    _ => {
                        let size = ctx.size_of(a).max(1);
                        let tmp = scope::get_tmp(ctx, size, true)?;
                        ctx.locs[tmp].ty = ctx.locs[a].ty;
                        tmp
                    }
                };
                self.emit_mov(ctx, temp, a)?;
                let opcode = if op == Oper::PostInc { OP_INC } else { OP_DEC };
                self.math1(ctx, opcode, Some(a), a)?;
                Ok(temp)
            }
            Oper::LogicNot => {
                if let LocKind::Condition(cond) = ctx.locs[a].kind {
                    ctx.locs[a].kind = LocKind::Condition(inv_cond(cond));
                    return Ok(a);
                }
                // !x is x == 0: a single CMP1.
                self.compare_zero(ctx, hint, a, COND_ULT)
            }
            op if op.is_comparison() => {
                // Unary comparisons arrive from the constant-one rewrite:
                // CMP1 compares against one.
                let signed = ctx.types.is_signed(ctx.locs[a].ty);
                let cond = match (op, signed) {
                    (Oper::Lt, true) => COND_SLT,
                    (Oper::Lt, false) => COND_ULT,
                    (Oper::Le, true) => COND_SLE,
                    (Oper::Le, false) => COND_ULE,
                    (Oper::Gt, true) => COND_SGT,
                    (Oper::Gt, false) => COND_UGT,
                    (Oper::Ge, true) => COND_SGE,
                    (Oper::Ge, false) => COND_UGE,
                    (Oper::Eq, _) => COND_EQ,
                    (Oper::Ne, _) => COND_NE,
                    _ => unreachable!(),
                };
                self.compare_zero(ctx, hint, a, cond)
            }
            Oper::Shl => self.math1(ctx, OP_SHL, hint, a),
            Oper::Shr => self.math1(ctx, OP_SHR, hint, a),
            Oper::Add => self.math1(ctx, OP_INC, hint, a),
            Oper::Sub => self.math1(ctx, OP_DEC, hint, a),
            Oper::Deref => {
                let int = ctx.types.simple(SimpleType::SInt);
                let pointee = ctx.types.underlying(ctx.locs[a].ty).unwrap_or(int);
                Ok(ctx.alloc_anon(LocKind::Pointer(a), pointee))
            }
            Oper::AddrOf => self.addr_of(ctx, hint, a),
            Oper::Neg => {
                // 0 - x.
                let zero = ctx.alloc_const(0, ctx.locs[a].ty);
                self.math2(ctx, OP_SUB, hint, zero, a)
            }
            Oper::BitNot => {
                let size = ctx.size_of(a).max(1);
                let ones = ctx.alloc_const(
                    if size >= 4 { u64::MAX } else { (1u64 << (16 * size)) - 1 },
                    ctx.locs[a].ty,
                );
                self.math2(ctx, OP_XOR, hint, a, ones)
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
        // int + pointer reads better the other way around.
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
                    LocKind::Const(v) => {
                        b = ctx.alloc_const(v * scale as Word, ctx.locs[b].ty);
                    }
                    _ => {
                        ctx.diag.error(
                            pos,
                            "variable offset from a pointer to multi-word elements \
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
                    LocKind::Condition(_) | LocKind::Void | LocKind::Unassigned
                )
            }) {
                Some(h) if !locations_equivalent(&ctx.locs, h, a) => {
                    self.emit_mov(ctx, h, a)?;
                    Ok(h)
                }
                _ => Ok(a),
            };
        }
        // Constant one on the right reduces to the unary forms.
        if (op.is_shift() || op.is_add() || op.is_comparison())
            && matches!(ctx.locs[b].kind, LocKind::Const(1))
        {
            return self.emit_math1(ctx, op, hint, a, pos);
        }
        // Comparison against constant zero is a single CMP1.
        if matches!(op, Oper::Eq | Oper::Ne)
            && matches!(ctx.locs[b].kind, LocKind::Const(0))
        {
            let cond = if op == Oper::Eq { COND_ULT } else { COND_UGE };
            return self.compare_zero(ctx, hint, a, cond);
        }

        match op {
            Oper::Add => self.math2(ctx, OP_ADD, hint, a, b),
            Oper::Sub => self.math2(ctx, OP_SUB, hint, a, b),
            Oper::BitAnd => self.math2(ctx, OP_AND, hint, a, b),
            Oper::BitOr => self.math2(ctx, OP_OR, hint, a, b),
            Oper::BitXor => self.math2(ctx, OP_XOR, hint, a, b),
            Oper::Shl | Oper::Shr => {
                // Shift by a known count unrolls; there is no variable
                // shift instruction.
                let count = match ctx.locs[b].kind {
                    LocKind::Const(v) => v,
                    _ => {
                        ctx.diag
                            .error(pos, "variable shift counts are not supported on this target");
                        return Ok(a);
                    }
                };
                let opcode = if op == Oper::Shl { OP_SHL } else { OP_SHR };
                let mut out = self.math1(ctx, opcode, hint, a)?;
                for _ in 1..count {
                    out = self.math1(ctx, opcode, Some(out), out)?;
                }
                Ok(out)
            }
            op if op.is_comparison() => {
                let ignored = self.math2(ctx, OP_CMP, None, a, b)?;
                scope::unuse(ctx, ignored);
                let cond = self.compare_cond(ctx, op, a, b);
                let bool_ty = ctx.types.simple(SimpleType::Bool);
                match hint {
                    Some(h) if matches!(ctx.locs[h].kind, LocKind::Condition(_)) => {
                        ctx.locs[h].kind = LocKind::Condition(cond);
                        ctx.locs[h].ty = bool_ty;
                        Ok(h)
                    }
                    _ => Ok(ctx.alloc_anon(LocKind::Condition(cond), bool_ty)),
                }
            }
            Oper::Mul | Oper::Div | Oper::Mod => {
                ctx.diag.error(
                    pos,
                    format!("operation {op:?} is not supported on this target"),
                );
                Ok(a)
            }
            _ => {
                ctx.diag
                    .error(pos, format!("operation {op:?} is not binary"));
                Ok(a)
            }
        }
    }

    fn emit_mov(&self, ctx: &mut CompileCtx, dst: Loc, src: Loc) -> CodegenResult<()> {
        // The first write to an unassigned variable settles it into its
        // default location.
        if matches!(ctx.locs[dst].kind, LocKind::Unassigned) {
            let default = ctx.locs[dst].default_loc.expect("unassigned var has home");
            let kind = ctx.locs[default].kind.clone();
            ctx.locs[dst].kind = kind;
        }
        let n_words = if matches!(ctx.locs[src].kind, LocKind::Const(_)) {
            ctx.size_of(dst).max(1)
        } else {
            ctx.size_of(dst).max(1).min(ctx.size_of(src).max(1))
        };
        self.mov_n(ctx, dst, src, n_words)
    }

    fn emit_cast(&self, ctx: &mut CompileCtx, a: Loc, ty: Type) -> CodegenResult<Loc> {
        let src_ty = ctx.locs[a].ty;
        if ctx.types.equals(src_ty, ty) {
            return Ok(a);
        }
        // No native floats; float-typed values are carried as-is.
        if ctx.types.is_float(src_ty) || ctx.types.is_float(ty) {
            return Ok(self.reinterpret(ctx, a, ty));
        }
        if matches!(ctx.locs[a].kind, LocKind::Const(_)) {
            return Ok(self.reinterpret(ctx, a, ty));
        }

        let old = ctx.types.size_words(src_ty).max(1);
        let new = ctx.types.size_words(ty).max(1);
        if old == new {
            return Ok(self.reinterpret(ctx, a, ty));
        }

        let out = scope::get_tmp(ctx, new, true)?;
        ctx.locs[out].ty = ty;
        if new < old {
            // Narrowing is a plain truncating copy.
            self.mov_n(ctx, out, a, new)?;
            return Ok(out);
        }

        self.mov_n(ctx, out, a, old)?;
        if ctx.types.is_signed(src_ty) {
            // Widen using the sign bit of the source's top word.
            let (src_reg, locked) = match ctx.locs[a].kind {
                LocKind::Register(reg) => (reg + old as u8 - 1, false),
                _ => {
                    let reg = scope::pick_register(self, ctx, true)?;
                    self.part_to_reg(ctx, a, reg, old - 1)?;
                    ctx.reg_lock[reg as usize] = true;
                    (reg, true)
                }
            };
            for part in old..new {
                let op = self.operand(ctx, out, part, true, 0)?;
                let insn = Insn {
                    y: false,
                    x: op.mode,
                    b: src_reg,
                    a: op.field,
                    o: OFFS_MOV | COND_CX,
                };
                self.write_insn(ctx, insn, op.label.as_deref(), op.offs, None, 0)?;
            }
            if locked {
                ctx.reg_lock[src_reg as usize] = false;
            }
        } else {
            // Unsigned values zero-extend.
            for part in old..new {
                let op = self.operand(ctx, out, part, true, 0)?;
                let insn = Insn {
                    y: false,
                    x: op.mode,
                    b: REG_IMM,
                    a: op.field,
                    o: OP_MOV,
                };
                self.write_insn(ctx, insn, op.label.as_deref(), op.offs, None, 0)?;
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
        self.jump(ctx, label)
    }

    fn memclobber(&self, ctx: &mut CompileCtx, stack_dirty: bool) -> CodegenResult<()> {
        self.memclobber_impl(ctx, stack_dirty)
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
            LocKind::Label(_) | LocKind::StackOffset(_) | LocKind::StackFrame(_) => {
                !constraint.memory
            }
            _ => true,
        };
        if needs_change {
            if constraint.register {
                let reg = scope::pick_register(self, ctx, true)?;
                self.mov_to_reg(ctx, loc, reg)?;
                let orig = ctx.alloc(ctx.locs[loc].clone());
                ctx.locs[loc].kind = LocKind::Register(reg);
                if ctx.locs[loc].default_loc.is_none() {
                    ctx.locs[loc].default_loc = Some(orig);
                }
                scope::claim_reg(ctx, reg, loc);
            } else if constraint.memory {
                let size = ctx.size_of(loc).max(1);
                let tmp = scope::get_tmp(ctx, size, false)?;
                ctx.locs[tmp].ty = ctx.locs[loc].ty;
                self.emit_mov(ctx, tmp, loc)?;
                let kind = ctx.locs[tmp].kind.clone();
                ctx.locs[loc].kind = kind;
            } else {
                return Err(CodegenError::ImpossibleConstraint(constraint.raw.clone()));
            }
        }

        let size = ctx.size_of(loc).max(1);
        Ok(match &ctx.locs[loc].kind {
            LocKind::Const(value) => format!("0x{:04x}", *value as u16),
            LocKind::Register(reg) => CONFIG.reg_name(*reg).to_string(),
            LocKind::Label(label) => format!("[{label}]"),
            LocKind::StackOffset(offset) => {
                format!("[ST+{}]", self.stack_depth(ctx, *offset, size, 0))
            }
            LocKind::StackFrame(offset) => {
                format!(
                    "[ST+{}]",
                    ctx.scope().stack_size as i64 + 1 + *offset as i64
                )
            }
            _ => return Err(CodegenError::ImpossibleConstraint(constraint.raw.clone())),
        })
    }

    fn asm_line(&self, ctx: &mut CompileCtx, line: &str, pos: Pos) -> CodegenResult<()> {
        iasm::asm_line(self, ctx, line, pos)
    }

    fn begin_output(&self, ctx: &mut CompileCtx) -> CodegenResult<()> {
        let zero = Pos::default();
        if self.irqhandler.is_some() && self.entrypoint.is_none() {
            ctx.diag.warning(
                zero,
                "-mirqhandler without -mentrypoint: -mirqhandler ignored",
            );
        }
        if self.nmihandler.is_some() && self.entrypoint.is_none() {
            ctx.diag.warning(
                zero,
                "-mnmihandler without -mentrypoint: -mnmihandler ignored",
            );
        }
        let entry = match &self.entrypoint {
            Some(entry) => entry.as_str(),
            None => return Ok(()),
        };
        if self.irqhandler.is_none() {
            ctx.diag
                .warning(zero, "-mentrypoint without -mirqhandler: IRQs unhandled");
        }
        if self.nmihandler.is_none() {
            ctx.diag
                .warning(zero, "-mentrypoint without -mnmihandler: NMIs unhandled");
        }

        // The vector table: IRQ, NMI, entry, at addresses 0, 1 and 2, each
        // falling back to the entry label.
        ctx.asm.use_sect(".entrypoints", 1);
        ctx.asm.write_label("__px16_vectors.irq");
        ctx.asm.write_label_ref(
            self.irqhandler.as_deref().unwrap_or(entry),
            0,
            LabelRefMode::AbsPtr,
        );
        ctx.asm.write_label("__px16_vectors.nmi");
        ctx.asm.write_label_ref(
            self.nmihandler.as_deref().unwrap_or(entry),
            0,
            LabelRefMode::AbsPtr,
        );
        ctx.asm.write_label("__px16_vectors.entry");
        ctx.asm.write_label_ref(entry, 0, LabelRefMode::AbsPtr);
        ctx.asm.use_sect(".text", 1);
        Ok(())
    }

    fn check_output(&self, ctx: &CompileCtx, layout: &Layout) {
        if self.entrypoint.is_none() {
            return;
        }
        let zero = Pos::default();
        for (vector, address) in [
            ("__px16_vectors.irq", 0),
            ("__px16_vectors.nmi", 1),
            ("__px16_vectors.entry", 2),
        ] {
            if layout.address_of(vector) != Some(address) {
                ctx.diag.warning(
                    zero,
                    format!(
                        "address of {vector} is not {address}, your program might not work"
                    ),
                );
            }
        }
    }
}
