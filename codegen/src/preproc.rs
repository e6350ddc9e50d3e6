//! The preprocessing pass.
//!
//! Before any code is emitted for a function, its statement tree is walked
//! once to:
//!
//!  * create a per-scope record of the variables declared there, and give
//!    every variable its canonical default location (a `.bss` label on
//!    memory machines; stack slots are assigned at scope entry on machines
//!    with stack-relative addressing),
//!  * resolve the type of every expression node,
//!  * compute a worst-case count of simultaneously live temporaries per
//!    scope, propagating child peaks upward so a parent knows what its
//!    children may use.

use crate::ast::{Expr, ExprKind, FuncDef, FuncSig, Oper, Param, Pos, Stmt, StmtKind};
use crate::context::CompileCtx;
use crate::loc::Loc;
use crate::types::{SimpleType, Type};
use lilycc_entity::entity_impl;
use rustc_hash::FxHashMap;

/// Reference to one scope's preprocessing record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreScope(u32);
entity_impl!(PreScope, "pre");

/// A variable declared in a scope.
#[derive(Clone, Debug)]
pub struct PreVar {
    pub name: String,
    pub ty: Type,
    pub pos: Pos,
    /// Canonical default location, when the target stores locals in static
    /// memory. `None` means "assign a stack slot at scope entry".
    pub default: Option<Loc>,
}

/// Preprocessing record for one scope.
#[derive(Clone, Debug, Default)]
pub struct PreprocData {
    /// All variables declared in this scope, in declaration order.
    pub vars: Vec<PreVar>,
    /// Upper bound on simultaneously live temporaries in this scope,
    /// including its children's peaks.
    pub n_temp: u32,
    /// Child scopes.
    pub children: Vec<PreScope>,
}

struct Preprocessor<'a> {
    ctx: &'a mut CompileCtx,
    /// Lexical environment for type resolution.
    env: Vec<FxHashMap<String, Type>>,
}

/// Preprocess one function. Fills `func.preproc` and the scope records in
/// the context, and sets `ty` on every expression node.
pub fn function(ctx: &mut CompileCtx, func: &mut FuncDef) {
    log::debug!("preprocessing '{}'", func.name);
    let mut pre = Preprocessor {
        ctx,
        env: Vec::new(),
    };
    let mut params = FxHashMap::default();
    for Param { name, ty, .. } in &func.params {
        params.insert(name.clone(), *ty);
    }
    pre.env.push(params);

    let root = pre.ctx.preproc.push(PreprocData::default());
    func.preproc = Some(root);
    if let Some(body) = &mut func.body {
        pre.stmt(root, &func.name, body);
    }
    pre.env.pop();
}

impl<'a> Preprocessor<'a> {
    /// Preprocess a statement; returns true on an explicit return, after
    /// which the remainder of the enclosing block is unreachable.
    fn stmt(&mut self, scope: PreScope, func: &str, stmt: &mut Stmt) -> bool {
        match &mut stmt.kind {
            StmtKind::Nop => false,
            StmtKind::Multi(stmts) => {
                let child = self.ctx.preproc.push(PreprocData::default());
                self.ctx.preproc[scope].children.push(child);
                stmt.preproc = Some(child);
                self.env.push(FxHashMap::default());
                let mut explicit = false;
                for s in stmts.iter_mut() {
                    explicit = self.stmt(child, func, s);
                    // We'll completely ignore unreachable code.
                    if explicit {
                        break;
                    }
                }
                self.env.pop();
                let peak = self.ctx.preproc[child].n_temp;
                self.bump(scope, peak);
                explicit
            }
            StmtKind::If {
                cond,
                code_true,
                code_false,
            } => {
                let n = self.expr(cond);
                self.bump(scope, n);
                let e_if = self.stmt(scope, func, code_true);
                let e_else = match code_false {
                    Some(stmt) => self.stmt(scope, func, stmt),
                    None => false,
                };
                e_if && e_else
            }
            StmtKind::While { cond, body, .. } => {
                let n = self.expr(cond);
                self.bump(scope, n);
                self.stmt(scope, func, body);
                false
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.env.push(FxHashMap::default());
                let child = self.ctx.preproc.push(PreprocData::default());
                self.ctx.preproc[scope].children.push(child);
                stmt.preproc = Some(child);
                if let Some(init) = init {
                    self.stmt(child, func, init);
                }
                for e in cond.iter_mut().chain(step.iter_mut()) {
                    let n = self.expr(e);
                    self.bump(child, n);
                }
                self.stmt(child, func, body);
                self.env.pop();
                let peak = self.ctx.preproc[child].n_temp;
                self.bump(scope, peak);
                false
            }
            StmtKind::Ret(expr) => {
                if let Some(expr) = expr {
                    let n = self.expr(expr);
                    self.bump(scope, n);
                }
                true
            }
            StmtKind::Var(decls) => {
                for decl in decls.iter_mut() {
                    if let Some(init) = &mut decl.init {
                        let n = self.expr(init);
                        self.bump(scope, n);
                    }
                    self.declare(scope, func, &decl.name, decl.ty, decl.pos);
                }
                false
            }
            StmtKind::Expr(expr) => {
                let n = self.expr(expr);
                self.bump(scope, n);
                false
            }
            StmtKind::InlineAsm(iasm) => {
                for op in iasm.outputs.iter_mut().chain(iasm.inputs.iter_mut()) {
                    let n = self.expr(&mut op.expr);
                    self.bump(scope, n);
                }
                false
            }
        }
    }

    /// Record a declared variable and allocate its canonical default
    /// location.
    fn declare(&mut self, scope: PreScope, func: &str, name: &str, ty: Type, pos: Pos) {
        self.env
            .last_mut()
            .expect("environment not empty")
            .insert(name.to_string(), ty);
        let default = if self.ctx.asm.config().stack_temps {
            None
        } else {
            // Memory machine: locals live behind per-function labels.
            let no = self.ctx.cur.as_mut().expect("inside a function").var_no;
            self.ctx.cur.as_mut().unwrap().var_no += 1;
            let label = format!("{func}.LV{no:04x}");
            let size = self.ctx.types.size_words(ty).max(1);
            self.ctx.asm.bss_label(&label, size);
            Some(self.ctx.alloc(crate::loc::LocData {
                kind: crate::loc::LocKind::Label(label),
                ty,
                owner: Some(name.to_string()),
                default_loc: None,
            }))
        };
        self.ctx.preproc[scope].vars.push(PreVar {
            name: name.to_string(),
            ty,
            pos,
            default,
        });
    }

    fn bump(&mut self, scope: PreScope, n: u32) {
        let data = &mut self.ctx.preproc[scope];
        if n > data.n_temp {
            data.n_temp = n;
        }
    }

    fn lookup(&self, name: &str) -> Option<Type> {
        for frame in self.env.iter().rev() {
            if let Some(ty) = frame.get(name) {
                return Some(*ty);
            }
        }
        self.ctx.globals.get(name).map(|(ty, _)| *ty)
    }

    /// Resolve the type of an expression and return the number of
    /// temporaries its evaluation may need at once.
    ///
    /// Constants and direct identifiers need none. A binary operation
    /// needs `max(count(a), count(b), count(a) + 1)` when it is
    /// non-commutative and both sides materialise an intermediate. A call
    /// needs the maximum across its arguments plus the ABI's
    /// parameter-register count.
    fn expr(&mut self, expr: &mut Expr) -> u32 {
        let int = self.ctx.types.simple(SimpleType::SInt);
        let boolean = self.ctx.types.simple(SimpleType::Bool);
        let (ty, count) = match &mut expr.kind {
            ExprKind::Const(_) => (int, 0),
            ExprKind::Ident(name) => match self.lookup(name) {
                Some(ty) => (ty, 0),
                None => {
                    if !self.ctx.functions.contains_key(name.as_str()) {
                        self.ctx
                            .diag
                            .error(expr.pos, format!("'{name}' is not declared"));
                    }
                    (int, 0)
                }
            },
            ExprKind::Call { callee, args } => {
                let mut n = 0;
                for arg in args.iter_mut() {
                    n = n.max(self.expr(arg));
                }
                let ret = self.call_ret_type(callee, args);
                self.expr(callee);
                (ret, n + self.ctx.asm.config().reg_count as u32)
            }
            ExprKind::Unary { op, expr: a } => {
                let n = self.expr(a);
                let at = a.ty.unwrap_or(int);
                let ty = match op {
                    Oper::AddrOf => self.ctx.types.pointer_to(at),
                    Oper::Deref => match self.ctx.types.underlying(at) {
                        Some(t) => t,
                        None => {
                            self.ctx
                                .diag
                                .error(expr.pos, "cannot dereference a non-pointer");
                            int
                        }
                    },
                    Oper::LogicNot => boolean,
                    _ => at,
                };
                (ty, n)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let ca = self.expr(lhs);
                let cb = self.expr(rhs);
                let lt = lhs.ty.unwrap_or(int);
                let rt = rhs.ty.unwrap_or(int);
                let ty = match op {
                    Oper::Assign => lt,
                    Oper::Index => self.ctx.types.underlying(lt).unwrap_or(int),
                    ref op if op.is_comparison() || op.is_logic() => boolean,
                    Oper::Shl | Oper::Shr => lt,
                    _ => {
                        // Pointer arithmetic keeps the pointer type; plain
                        // arithmetic widens to the larger operand.
                        if self.ctx.types.is_pointer(lt) {
                            lt
                        } else if self.ctx.types.is_pointer(rt) {
                            rt
                        } else if self.ctx.types.size_words(rt) > self.ctx.types.size_words(lt) {
                            rt
                        } else {
                            lt
                        }
                    }
                };
                let materialise =
                    |e: &Expr| !matches!(e.kind, ExprKind::Const(_) | ExprKind::Ident(_));
                let count = if !op.is_commutative() && materialise(lhs) && materialise(rhs) {
                    ca.max(cb).max(ca + 1)
                } else {
                    ca.max(cb)
                };
                (ty, count)
            }
            ExprKind::Cast { ty, expr: a } => {
                let n = self.expr(a);
                (*ty, n)
            }
        };
        expr.ty = Some(ty);
        count
    }

    /// Resolve the return type of a call, registering an implicit
    /// declaration when the callee is unknown.
    fn call_ret_type(&mut self, callee: &Expr, args: &[Expr]) -> Type {
        let int = self.ctx.types.simple(SimpleType::SInt);
        let name = match &callee.kind {
            ExprKind::Ident(name) => name.clone(),
            _ => return int,
        };
        if let Some(sig) = self.ctx.functions.get(&name) {
            return sig.ret;
        }
        if self.lookup(&name).is_some() {
            // Calling through a variable; leave it to lowering.
            return int;
        }
        self.ctx.diag.warning(
            callee.pos,
            format!("implicit declaration of function '{name}'"),
        );
        let sig = FuncSig {
            pos: callee.pos,
            name: name.clone(),
            ret: int,
            params: args
                .iter()
                .enumerate()
                .map(|(i, arg)| Param {
                    pos: arg.pos,
                    name: format!("arg{i}"),
                    ty: arg.ty.unwrap_or(int),
                })
                .collect(),
            defined: false,
        };
        self.ctx.functions.insert(name, sig);
        int
    }
}
