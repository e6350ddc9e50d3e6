//! Statement and expression lowering.
//!
//! A recursive walk over the typed AST. The crucial parameter threaded
//! through expression lowering is the *output hint*: "if you would
//! otherwise pick a temporary, pick this instead". Common hints are a
//! condition (the consumer only needs flag state), the return-value slot,
//! a specific register demanded by the ABI, or the destination of an
//! assignment. The walker owns the rule that the left operand is the one
//! whose location is preferred for the output, so binary operations can
//! compute in place when the hint equals the left operand.
//!
//! Everything architecture-specific is reached through the
//! [`TargetIsa`] capability set; this module is shared by all targets.

use crate::ast::{Expr, ExprKind, FuncDef, FuncSig, Oper, Stmt, StmtKind, VarDecl};
use crate::context::CompileCtx;
use crate::diag::CodegenResult;
use crate::iasm;
use crate::isa::TargetIsa;
use crate::loc::{locations_equivalent, Loc, LocData, LocKind};
use crate::preproc::{self, PreScope};
use crate::scope::{self, claim_reg};
use crate::types::SimpleType;

/// Compile one function definition into the context's assembly buffer.
///
/// Runs the preprocessing pass, emits the entry sequence, lowers the body
/// and appends an implicit return when control can fall off the end.
/// Emission is abandoned (but not failed) when source-level errors are
/// reported for this function.
pub fn compile_function(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    func: &mut FuncDef,
) -> CodegenResult<()> {
    if func.body.is_none() {
        return Ok(());
    }
    let errors_at_entry = ctx.diag.error_count();
    ctx.begin_function(FuncSig::of(func));
    preproc::function(ctx, func);
    if ctx.diag.error_count() != errors_at_entry {
        ctx.end_function();
        return Ok(());
    }

    log::debug!("generating '{}'", func.name);
    ctx.push_scope();
    isa.emit_function_entry(ctx, func)?;
    // The temp pool sits directly above the entry-time stack.
    ctx.temp_base = ctx.scope().stack_size;

    let body = func.body.as_ref().expect("checked above");
    let explicit = stmt(isa, ctx, body)?;
    if !explicit {
        log::debug!("implicit return");
        isa.emit_return(ctx, None)?;
    }
    ctx.pop_scope();
    ctx.end_function();
    Ok(())
}

/// Define every variable declared in a scope, giving each its canonical
/// default location and an `Unassigned` binding.
fn define_scope_vars(ctx: &mut CompileCtx, pre: PreScope) -> CodegenResult<()> {
    for i in 0..ctx.preproc[pre].vars.len() {
        let var = ctx.preproc[pre].vars[i].clone();
        let size = ctx.types.size_words(var.ty).max(1);
        let default = match var.default {
            Some(loc) => loc,
            None => {
                // Stack machine: the variable's home is a frame slot.
                let home = scope::get_tmp(ctx, size, false)?;
                ctx.locs[home].ty = var.ty;
                ctx.locs[home].owner = Some(var.name.clone());
                home
            }
        };
        // Aggregates settle into their home immediately; only scalars go
        // through the unassigned state.
        let kind = if ctx.types.is_array(var.ty) {
            ctx.locs[default].kind.clone()
        } else {
            LocKind::Unassigned
        };
        let loc = ctx.alloc(LocData {
            kind,
            ty: var.ty,
            owner: Some(var.name.clone()),
            default_loc: Some(default),
        });
        if !ctx.define_var(&var.name, loc) {
            ctx.diag
                .error(var.pos, format!("redefinition of '{}'", var.name));
        }
    }
    Ok(())
}

/// Lower one statement. Returns true if the statement explicitly returned;
/// anything after it in the enclosing block is unreachable and silently
/// dropped.
pub fn stmt(isa: &dyn TargetIsa, ctx: &mut CompileCtx, stmt_: &Stmt) -> CodegenResult<bool> {
    match &stmt_.kind {
        StmtKind::Nop => Ok(false),
        StmtKind::Multi(stmts) => {
            ctx.push_scope();
            if let Some(pre) = stmt_.preproc {
                define_scope_vars(ctx, pre)?;
            }
            let mut explicit = false;
            for s in stmts {
                explicit = stmt(isa, ctx, s)?;
                // Re-establish real == logical stack at statement
                // boundaries.
                isa.memclobber(ctx, true)?;
                if explicit {
                    break;
                }
            }
            ctx.pop_scope();
            Ok(explicit)
        }
        StmtKind::If {
            cond,
            code_true,
            code_false,
        } => {
            ctx.mark_pos(stmt_.pos);
            lower_if(isa, ctx, cond, code_true, code_false.as_deref())
        }
        StmtKind::While {
            cond,
            body,
            do_while,
        } => {
            ctx.mark_pos(stmt_.pos);
            lower_while(isa, ctx, cond, body, *do_while)?;
            Ok(false)
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
        } => {
            ctx.mark_pos(stmt_.pos);
            ctx.push_scope();
            if let Some(pre) = stmt_.preproc {
                define_scope_vars(ctx, pre)?;
            }
            lower_for(isa, ctx, init.as_deref(), cond, step, body)?;
            ctx.pop_scope();
            Ok(false)
        }
        StmtKind::Ret(expr) => {
            ctx.mark_pos(stmt_.pos);
            let retval = match expr {
                Some(expr) => {
                    let ret_ty = ctx.cur_func().sig.ret;
                    let hint = ctx.alloc_anon(LocKind::ReturnValue, ret_ty);
                    Some(expression(isa, ctx, expr, Some(hint))?)
                }
                None => None,
            };
            isa.emit_return(ctx, retval)?;
            Ok(true)
        }
        StmtKind::Var(decls) => {
            ctx.mark_pos(stmt_.pos);
            for decl in decls {
                init_var(isa, ctx, decl)?;
            }
            Ok(false)
        }
        StmtKind::Expr(expr) => {
            ctx.mark_pos(stmt_.pos);
            let result = expression(isa, ctx, expr, None)?;
            scope::unuse(ctx, result);
            Ok(false)
        }
        StmtKind::InlineAsm(asm) => {
            iasm::inline_asm(isa, ctx, asm)?;
            Ok(false)
        }
    }
}

/// Populate a declared variable from its initialiser expression.
fn init_var(isa: &dyn TargetIsa, ctx: &mut CompileCtx, decl: &VarDecl) -> CodegenResult<()> {
    let init = match &decl.init {
        Some(init) => init,
        None => return Ok(()),
    };
    let var = ctx
        .get_variable(&decl.name)
        .expect("declared variable is bound");
    let res = expression(isa, ctx, init, Some(var))?;
    if locations_equivalent(&ctx.locs, var, res) {
        return Ok(());
    }
    if !matches!(ctx.locs[var].kind, LocKind::Unassigned) {
        isa.emit_mov(ctx, var, res)?;
        return Ok(());
    }
    // First write to a fresh variable: claim a register run when one is
    // free, otherwise settle into the default location.
    let size = ctx.size_of(var).max(1);
    if let Some(reg) = scope::pick_empty_regs(ctx, size) {
        ctx.locs[var].kind = LocKind::Register(reg);
        claim_reg(ctx, reg, var);
    } else {
        let default = ctx.locs[var].default_loc.expect("unassigned var has home");
        let kind = ctx.locs[default].kind.clone();
        ctx.locs[var].kind = kind;
    }
    isa.emit_mov(ctx, var, res)?;
    scope::unuse(ctx, res);
    Ok(())
}

fn lower_if(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    cond: &Expr,
    code_true: &Stmt,
    code_false: Option<&Stmt>,
) -> CodegenResult<bool> {
    // Optimise out empty branches.
    let s_if = (!code_true.is_empty()).then_some(code_true);
    let s_else = code_false.filter(|s| !s.is_empty());
    if s_if.is_none() && s_else.is_none() {
        let ignored = expression(isa, ctx, cond, None)?;
        scope::unuse(ctx, ignored);
        return Ok(false);
    }

    if cond.oper().is_some_and(Oper::is_logic) {
        // Short-circuit logic lowering produces the branches itself. The
        // code of the side that follows immediately is the fallthrough.
        let l_skip = ctx.asm.numbered_label();
        let l_true = match s_if {
            Some(_) => ctx.asm.numbered_label(),
            None => l_skip.clone(),
        };
        let l_false = match s_else {
            Some(_) => ctx.asm.numbered_label(),
            None => l_skip.clone(),
        };
        logic(
            isa,
            ctx,
            cond,
            Some(&l_true),
            Some(&l_false),
            s_if.is_some(),
        )?;

        let mut explicit = true;
        if let Some(s) = s_if {
            ctx.asm.write_label(&l_true);
            let e = stmt(isa, ctx, s)?;
            explicit &= e;
            if s_else.is_some() && !e {
                isa.emit_jump(ctx, &l_skip)?;
            }
        }
        if let Some(s) = s_else {
            ctx.asm.write_label(&l_false);
            explicit &= stmt(isa, ctx, s)?;
        } else {
            explicit = false;
        }
        ctx.asm.write_label(&l_skip);
        return Ok(explicit);
    }

    // Traditional branch.
    let cond_hint = ctx.alloc_anon(LocKind::Condition(0), ctx.types.simple(SimpleType::Bool));
    let cond_loc = expression(isa, ctx, cond, Some(cond_hint))?;

    match (s_if, s_else) {
        (Some(s_if), Some(s_else)) => {
            let l_else = ctx.asm.numbered_label();
            isa.emit_branch(ctx, cond_loc, None, Some(&l_else))?;
            let if_explicit = stmt(isa, ctx, s_if)?;
            // Don't insert a dead jump after an explicit return.
            let l_skip = if !if_explicit {
                let l_skip = ctx.asm.numbered_label();
                isa.emit_jump(ctx, &l_skip)?;
                Some(l_skip)
            } else {
                None
            };
            ctx.asm.write_label(&l_else);
            let else_explicit = stmt(isa, ctx, s_else)?;
            if let Some(l_skip) = l_skip {
                ctx.asm.write_label(&l_skip);
            }
            Ok(if_explicit && else_explicit)
        }
        (Some(s_if), None) => {
            let l_skip = ctx.asm.numbered_label();
            isa.emit_branch(ctx, cond_loc, None, Some(&l_skip))?;
            stmt(isa, ctx, s_if)?;
            ctx.asm.write_label(&l_skip);
            Ok(false)
        }
        (None, Some(s_else)) => {
            let l_skip = ctx.asm.numbered_label();
            isa.emit_branch(ctx, cond_loc, Some(&l_skip), None)?;
            stmt(isa, ctx, s_else)?;
            ctx.asm.write_label(&l_skip);
            Ok(false)
        }
        (None, None) => unreachable!("handled above"),
    }
}

fn lower_while(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    cond: &Expr,
    body: &Stmt,
    do_while: bool,
) -> CodegenResult<()> {
    let loop_label = ctx.asm.numbered_label();
    let check_label = ctx.asm.numbered_label();
    let is_forever = matches!(cond.const_value(), Some(v) if v != 0);

    isa.memclobber(ctx, true)?;
    if !do_while && !is_forever {
        // Check the condition before entering the loop body.
        isa.emit_jump(ctx, &check_label)?;
    }

    ctx.asm.write_label(&loop_label);
    stmt(isa, ctx, body)?;
    isa.memclobber(ctx, true)?;

    if is_forever {
        isa.emit_jump(ctx, &loop_label)?;
        // The check label may still be a branch target.
        ctx.asm.write_label(&check_label);
        return Ok(());
    }

    ctx.asm.write_label(&check_label);
    let cond_hint = ctx.alloc_anon(LocKind::Condition(0), ctx.types.simple(SimpleType::Bool));
    let cond_res = expression(isa, ctx, cond, Some(cond_hint))?;
    isa.emit_branch(ctx, cond_res, Some(&loop_label), None)?;
    if cond_res != cond_hint {
        scope::unuse(ctx, cond_res);
    }
    Ok(())
}

fn lower_for(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    init: Option<&Stmt>,
    cond: &[Expr],
    step: &[Expr],
    body: &Stmt,
) -> CodegenResult<()> {
    let is_forever = cond.is_empty();
    let loop_label = ctx.asm.numbered_label();
    let check_label = ctx.asm.numbered_label();

    if let Some(init) = init {
        stmt(isa, ctx, init)?;
    }
    isa.memclobber(ctx, true)?;

    if !is_forever {
        isa.emit_jump(ctx, &check_label)?;
    }

    ctx.asm.write_label(&loop_label);
    stmt(isa, ctx, body)?;
    isa.memclobber(ctx, true)?;

    // The step runs on every iteration but is skipped by the initial jump
    // straight to the check.
    for e in step {
        let ignored = expression(isa, ctx, e, None)?;
        scope::unuse(ctx, ignored);
    }
    isa.memclobber(ctx, true)?;

    if is_forever {
        isa.emit_jump(ctx, &loop_label)?;
        ctx.asm.write_label(&check_label);
        return Ok(());
    }

    ctx.asm.write_label(&check_label);
    // All but the last condition expression are evaluated for effect only.
    for e in &cond[..cond.len() - 1] {
        let ignored = expression(isa, ctx, e, None)?;
        scope::unuse(ctx, ignored);
    }
    let cond_hint = ctx.alloc_anon(LocKind::Condition(0), ctx.types.simple(SimpleType::Bool));
    let cond_res = expression(isa, ctx, &cond[cond.len() - 1], Some(cond_hint))?;
    isa.emit_branch(ctx, cond_res, Some(&loop_label), None)?;
    if cond_res != cond_hint {
        scope::unuse(ctx, cond_res);
    }
    Ok(())
}

/// Writes short-circuit logic code branching to `l_true` / `l_false`.
///
/// `flow_type` names which outcome is the fallthrough: the corresponding
/// final branch is eliminated. Either label may be `None` to mean "no
/// branch needed for this outcome".
pub fn logic(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    expr: &Expr,
    l_true: Option<&str>,
    l_false: Option<&str>,
    flow_type: bool,
) -> CodegenResult<()> {
    let bool_ty = ctx.types.simple(SimpleType::Bool);
    match (&expr.kind, expr.oper()) {
        (ExprKind::Binary { lhs, rhs, .. }, Some(Oper::LogicAnd)) => {
            // A false short-circuits.
            let hint = ctx.alloc_anon(LocKind::Condition(0), bool_ty);
            let a = expression(isa, ctx, lhs, Some(hint))?;
            isa.emit_branch(ctx, a, None, l_false)?;

            let hint = ctx.alloc_anon(LocKind::Condition(0), bool_ty);
            let b = expression(isa, ctx, rhs, Some(hint))?;
            let (lt, lf) = if flow_type {
                (None, l_false)
            } else {
                (l_true, None)
            };
            isa.emit_branch(ctx, b, lt, lf)
        }
        (ExprKind::Binary { lhs, rhs, .. }, Some(Oper::LogicOr)) => {
            // A true short-circuits.
            let hint = ctx.alloc_anon(LocKind::Condition(0), bool_ty);
            let a = expression(isa, ctx, lhs, Some(hint))?;
            isa.emit_branch(ctx, a, l_true, None)?;

            let hint = ctx.alloc_anon(LocKind::Condition(0), bool_ty);
            let b = expression(isa, ctx, rhs, Some(hint))?;
            let (lt, lf) = if flow_type {
                (None, l_false)
            } else {
                (l_true, None)
            };
            isa.emit_branch(ctx, b, lt, lf)
        }
        (ExprKind::Unary { expr: inner, .. }, Some(Oper::LogicNot)) => {
            // Invert by swapping the labels.
            logic(isa, ctx, inner, l_false, l_true, !flow_type)
        }
        (ExprKind::Const(v), _) => {
            let target = if *v != 0 { l_true } else { l_false };
            match target {
                Some(label) => isa.emit_jump(ctx, label),
                None => Ok(()),
            }
        }
        _ => {
            // Any other expression: evaluate and branch once.
            let hint = ctx.alloc_anon(LocKind::Condition(0), bool_ty);
            let a = expression(isa, ctx, expr, Some(hint))?;
            let (lt, lf) = if flow_type {
                (None, l_false)
            } else {
                (l_true, None)
            };
            isa.emit_branch(ctx, a, lt, lf)
        }
    }
}

/// Materialise a short-circuit logic expression as 0/1 in a value context.
fn logic_materialise(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    expr: &Expr,
    hint: Option<Loc>,
) -> CodegenResult<Loc> {
    let bool_ty = ctx.types.simple(SimpleType::Bool);
    let output = match hint {
        Some(h) if !matches!(ctx.locs[h].kind, LocKind::Condition(_)) => h,
        _ => {
            let tmp = scope::get_tmp(ctx, 1, true)?;
            ctx.locs[tmp].ty = bool_ty;
            tmp
        }
    };

    let l_true = ctx.asm.numbered_label();
    let l_false = ctx.asm.numbered_label();
    let l_skip = ctx.asm.numbered_label();
    logic(isa, ctx, expr, Some(&l_true), Some(&l_false), true)?;

    let one = ctx.alloc_const(1, bool_ty);
    let zero = ctx.alloc_const(0, bool_ty);
    ctx.asm.write_label(&l_true);
    isa.emit_mov(ctx, output, one)?;
    isa.emit_jump(ctx, &l_skip)?;
    ctx.asm.write_label(&l_false);
    isa.emit_mov(ctx, output, zero)?;
    ctx.asm.write_label(&l_skip);
    Ok(output)
}

/// Check for a read of a not-yet-written variable; warns and substitutes
/// the default location in place.
fn check_unassigned(ctx: &mut CompileCtx, expr: &Expr, loc: Loc) {
    if !matches!(ctx.locs[loc].kind, LocKind::Unassigned) {
        return;
    }
    let name = ctx.locs[loc]
        .owner
        .clone()
        .unwrap_or_else(|| "<anonymous variable>".to_string());
    ctx.diag
        .warning(expr.pos, format!("'{name}' is uninitialised at this point"));
    let default = ctx.locs[loc].default_loc.expect("unassigned var has home");
    let kind = ctx.locs[default].kind.clone();
    ctx.locs[loc].kind = kind;
}

/// Taking the address of a register-resident variable forces it into
/// memory for as long as the pointer may be live.
fn force_to_memory(isa: &dyn TargetIsa, ctx: &mut CompileCtx, loc: Loc) -> CodegenResult<()> {
    match ctx.locs[loc].kind {
        LocKind::Register(reg) => {
            let default = match ctx.locs[loc].default_loc {
                Some(d) => d,
                None => {
                    let size = ctx.size_of(loc).max(1);
                    let tmp = scope::get_tmp(ctx, size, false)?;
                    ctx.locs[tmp].ty = ctx.locs[loc].ty;
                    ctx.locs[loc].default_loc = Some(tmp);
                    tmp
                }
            };
            isa.emit_mov(ctx, default, loc)?;
            let size = ctx.size_of(loc).max(1) as u8;
            let kind = ctx.locs[default].kind.clone();
            ctx.locs[loc].kind = kind;
            for unit in reg..reg + size {
                scope::release_reg(ctx, unit);
            }
        }
        LocKind::Unassigned => {
            let default = ctx.locs[loc].default_loc.expect("unassigned var has home");
            let kind = ctx.locs[default].kind.clone();
            ctx.locs[loc].kind = kind;
        }
        _ => {}
    }
    Ok(())
}

/// Lower one expression, returning the location of its value.
pub fn expression(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    expr: &Expr,
    hint: Option<Loc>,
) -> CodegenResult<Loc> {
    let int = ctx.types.simple(SimpleType::SInt);
    let ty = expr.ty.unwrap_or(int);
    match &expr.kind {
        ExprKind::Const(value) => Ok(ctx.alloc_const(*value, ty)),

        ExprKind::Ident(name) => match ctx.get_variable(name) {
            Some(loc) => {
                check_unassigned(ctx, expr, loc);
                Ok(loc)
            }
            None if ctx.functions.contains_key(name.as_str()) => {
                // A function's value is the address of its label.
                Ok(ctx.alloc_anon(LocKind::Label(name.clone()), ty))
            }
            None => {
                // Already diagnosed by the preprocessing pass; keep
                // lowering to find more problems.
                Ok(ctx.alloc_const(0, ty))
            }
        },

        ExprKind::Call { callee, args } => {
            let name = match &callee.kind {
                ExprKind::Ident(name) => name.clone(),
                _ => {
                    ctx.diag
                        .error(expr.pos, "called object is not a function");
                    return Ok(ctx.alloc_const(0, ty));
                }
            };
            let sig = match ctx.functions.get(&name).cloned() {
                Some(sig) => sig,
                None => {
                    // A variable of non-function type, already diagnosed.
                    ctx.diag
                        .error(expr.pos, format!("'{name}' is not a function"));
                    return Ok(ctx.alloc_const(0, ty));
                }
            };
            isa.emit_call(ctx, &sig, callee, args)
        }

        ExprKind::Unary { op, expr: inner } => match op {
            Oper::LogicNot => {
                // Apply the condition output hint to logic not.
                let bool_ty = ctx.types.simple(SimpleType::Bool);
                let cond_hint = ctx.alloc_anon(LocKind::Condition(0), bool_ty);
                let a = expression(isa, ctx, inner, Some(cond_hint))?;
                isa.emit_math1(ctx, *op, hint, a, expr.pos)
            }
            Oper::AddrOf => {
                // Taking an address is not a read; don't warn about
                // not-yet-written variables here.
                let a = match &inner.kind {
                    ExprKind::Ident(name) => ctx.get_variable(name),
                    _ => None,
                };
                let a = match a {
                    Some(a) => a,
                    None => expression(isa, ctx, inner, None)?,
                };
                force_to_memory(isa, ctx, a)?;
                isa.emit_math1(ctx, *op, hint, a, expr.pos)
            }
            _ => {
                let a = expression(isa, ctx, inner, hint)?;
                check_unassigned(ctx, expr, a);
                isa.emit_math1(ctx, *op, hint, a, expr.pos)
            }
        },

        ExprKind::Binary { op, lhs, rhs } => match op {
            Oper::Assign => lower_assign(isa, ctx, lhs, rhs),
            Oper::LogicAnd | Oper::LogicOr => logic_materialise(isa, ctx, expr, hint),
            Oper::Index => {
                let a = expression(isa, ctx, lhs, None)?;
                check_unassigned(ctx, expr, a);
                let b = expression(isa, ctx, rhs, None)?;
                let indexed = ctx.alloc_anon(
                    LocKind::Indexed {
                        base: a,
                        index: b,
                        combined: None,
                    },
                    ty,
                );
                match hint {
                    Some(h) if !matches!(ctx.locs[h].kind, LocKind::Condition(_)) => {
                        isa.emit_mov(ctx, h, indexed)?;
                        scope::unuse(ctx, indexed);
                        Ok(h)
                    }
                    _ => Ok(indexed),
                }
            }
            _ => {
                let a = expression(isa, ctx, lhs, hint)?;
                check_unassigned(ctx, lhs, a);
                let b = expression(isa, ctx, rhs, None)?;
                check_unassigned(ctx, rhs, b);
                let out = isa.emit_math2(ctx, *op, hint, a, b, expr.pos)?;
                if !locations_equivalent(&ctx.locs, a, out) {
                    scope::unuse(ctx, a);
                }
                if !locations_equivalent(&ctx.locs, b, out) {
                    scope::unuse(ctx, b);
                }
                Ok(out)
            }
        },

        ExprKind::Cast { ty, expr: inner } => {
            let a = expression(isa, ctx, inner, None)?;
            check_unassigned(ctx, expr, a);
            isa.emit_cast(ctx, a, *ty)
        }
    }
}

/// Assignment is handled specially: the left-hand side is lowered first
/// (through the pointer when it is a dereference), then the right-hand
/// side with the destination as its hint, then a single move.
fn lower_assign(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    lhs: &Expr,
    rhs: &Expr,
) -> CodegenResult<Loc> {
    let dst = match &lhs.kind {
        // Assignment through a pointer dereference.
        ExprKind::Unary {
            op: Oper::Deref,
            expr: ptr,
        } => {
            let ptr_loc = expression(isa, ctx, ptr, None)?;
            check_unassigned(ctx, ptr, ptr_loc);
            let int = ctx.types.simple(SimpleType::SInt);
            let pointee = lhs.ty.unwrap_or(int);
            ctx.alloc_anon(LocKind::Pointer(ptr_loc), pointee)
        }
        _ => {
            // Writing to a variable is not a read of it.
            let dst = match &lhs.kind {
                ExprKind::Ident(name) => ctx.get_variable(name),
                _ => None,
            };
            let dst = match dst {
                Some(dst) => dst,
                None => expression(isa, ctx, lhs, None)?,
            };
            // The first write replaces an unassigned binding with the
            // writer's chosen location.
            if matches!(ctx.locs[dst].kind, LocKind::Unassigned) {
                let default = ctx.locs[dst].default_loc.expect("unassigned var has home");
                let kind = ctx.locs[default].kind.clone();
                ctx.locs[dst].kind = kind;
            }
            dst
        }
    };
    let src = expression(isa, ctx, rhs, Some(dst))?;
    check_unassigned(ctx, rhs, src);
    isa.emit_mov(ctx, dst, src)?;
    if !locations_equivalent(&ctx.locs, dst, src) {
        scope::unuse(ctx, src);
    }
    Ok(dst)
}
