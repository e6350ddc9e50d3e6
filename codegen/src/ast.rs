//! The abstract syntax tree consumed by the code generator.
//!
//! The front-end (see the `lilycc-reader` crate) produces one [`FuncDef`]
//! per function definition. Types on declarations are resolved at parse
//! time; types on expression nodes are filled in by the preprocessing pass
//! before lowering starts.

use crate::preproc::PreScope;
use crate::types::Type;
use crate::Word;

/// A source position: a span from column `x0`, line `y0` to column `x1`,
/// line `y1`. Lines and columns are 1-based; line 0 means "unknown".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pos {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Pos {
    /// Merge two positions into the smallest span covering both.
    pub fn merge(self, other: Pos) -> Pos {
        let (x0, y0) = if (self.y0, self.x0) <= (other.y0, other.x0) {
            (self.x0, self.y0)
        } else {
            (other.x0, other.y0)
        };
        let (x1, y1) = if (self.y1, self.x1) >= (other.y1, other.x1) {
            (self.x1, self.y1)
        } else {
            (other.x1, other.y1)
        };
        Pos { x0, y0, x1, y1 }
    }
}

/// Unary and binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Oper {
    // Unary operators.
    AddrOf,
    Deref,
    Neg,
    LogicNot,
    BitNot,
    PostInc,
    PostDec,
    // Binary operators.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    LogicAnd,
    LogicOr,
    BitAnd,
    BitOr,
    BitXor,
    // Comparison operators.
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    // Assignment and indexing.
    Assign,
    Index,
}

impl Oper {
    /// Comparison operators produce a condition.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Oper::Gt | Oper::Ge | Oper::Lt | Oper::Le | Oper::Eq | Oper::Ne
        )
    }

    /// Short-circuiting logic operators.
    pub fn is_logic(self) -> bool {
        matches!(self, Oper::LogicAnd | Oper::LogicOr | Oper::LogicNot)
    }

    /// Additive operators.
    pub fn is_add(self) -> bool {
        matches!(self, Oper::Add | Oper::Sub)
    }

    /// Shift operators.
    pub fn is_shift(self) -> bool {
        matches!(self, Oper::Shl | Oper::Shr)
    }

    /// Operators whose operands may be swapped freely.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Oper::Add | Oper::Mul | Oper::BitAnd | Oper::BitOr | Oper::BitXor | Oper::Eq | Oper::Ne
        )
    }
}

/// An expression node.
#[derive(Clone, Debug)]
pub struct Expr {
    pub pos: Pos,
    pub kind: ExprKind,
    /// Resolved type, set by the preprocessing pass.
    pub ty: Option<Type>,
}

/// The expression variants.
#[derive(Clone, Debug)]
pub enum ExprKind {
    /// Integer constant.
    Const(Word),
    /// Identifier reference.
    Ident(String),
    /// Function call.
    Call { callee: Box<Expr>, args: Vec<Expr> },
    /// Unary operation.
    Unary { op: Oper, expr: Box<Expr> },
    /// Binary operation (including assignment and indexing).
    Binary {
        op: Oper,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Explicit type cast.
    Cast { ty: Type, expr: Box<Expr> },
}

impl Expr {
    /// Shorthand used all over the lowering code.
    pub fn is_const(&self) -> bool {
        matches!(self.kind, ExprKind::Const(_))
    }

    /// The constant value, if this is a constant expression node.
    pub fn const_value(&self) -> Option<Word> {
        match self.kind {
            ExprKind::Const(v) => Some(v),
            _ => None,
        }
    }

    /// The root operator, if this is an operator node.
    pub fn oper(&self) -> Option<Oper> {
        match self.kind {
            ExprKind::Unary { op, .. } | ExprKind::Binary { op, .. } => Some(op),
            _ => None,
        }
    }
}

/// One declarator in a variable-declaration statement.
#[derive(Clone, Debug)]
pub struct VarDecl {
    pub pos: Pos,
    pub name: String,
    pub ty: Type,
    pub init: Option<Expr>,
}

/// One operand of an inline-assembly statement.
#[derive(Clone, Debug)]
pub struct AsmOperand {
    pub pos: Pos,
    /// Symbolic name, as in `[result] "=r" (x)`.
    pub symbol: Option<String>,
    /// The raw constraint string, e.g. `"=r"` or `"+m"`.
    pub constraint: String,
    pub expr: Expr,
}

/// An inline-assembly statement.
#[derive(Clone, Debug)]
pub struct InlineAsm {
    pub pos: Pos,
    pub text: String,
    pub outputs: Vec<AsmOperand>,
    pub inputs: Vec<AsmOperand>,
    pub volatile: bool,
}

/// A statement node.
#[derive(Clone, Debug)]
pub struct Stmt {
    pub pos: Pos,
    pub kind: StmtKind,
    /// Per-scope record, set by the preprocessing pass on scope-creating
    /// statements.
    pub preproc: Option<PreScope>,
}

/// The statement variants.
#[derive(Clone, Debug)]
pub enum StmtKind {
    /// The empty statement.
    Nop,
    /// A braced block of statements with its own scope.
    Multi(Vec<Stmt>),
    /// If/else.
    If {
        cond: Expr,
        code_true: Box<Stmt>,
        code_false: Option<Box<Stmt>>,
    },
    /// While and do-while loops.
    While {
        cond: Expr,
        body: Box<Stmt>,
        do_while: bool,
    },
    /// For loops. The condition and step are expression lists; all but the
    /// last condition expression are evaluated for effect only.
    For {
        init: Option<Box<Stmt>>,
        cond: Vec<Expr>,
        step: Vec<Expr>,
        body: Box<Stmt>,
    },
    /// Return, with optional value.
    Ret(Option<Expr>),
    /// Variable declarations.
    Var(Vec<VarDecl>),
    /// Expression statement.
    Expr(Expr),
    /// Inline assembly.
    InlineAsm(InlineAsm),
}

impl Stmt {
    /// Whether the statement generates no code at all.
    pub fn is_empty(&self) -> bool {
        match &self.kind {
            StmtKind::Nop => true,
            StmtKind::Multi(stmts) => stmts.iter().all(Stmt::is_empty),
            _ => false,
        }
    }
}

/// One function parameter.
#[derive(Clone, Debug)]
pub struct Param {
    pub pos: Pos,
    pub name: String,
    pub ty: Type,
}

/// A function definition (or declaration, when `body` is `None`).
#[derive(Clone, Debug)]
pub struct FuncDef {
    pub pos: Pos,
    pub name: String,
    pub ret: Type,
    pub params: Vec<Param>,
    pub body: Option<Stmt>,
    /// Root per-scope record, set by the preprocessing pass.
    pub preproc: Option<PreScope>,
}

/// The callable signature of a function, as stored in the translation
/// unit's function registry. Cheap to clone; carries no body.
#[derive(Clone, Debug)]
pub struct FuncSig {
    pub pos: Pos,
    pub name: String,
    pub ret: Type,
    pub params: Vec<Param>,
    /// Whether a definition (with body) has been seen.
    pub defined: bool,
}

impl FuncSig {
    /// Extract the signature of a definition.
    pub fn of(func: &FuncDef) -> Self {
        Self {
            pos: func.pos,
            name: func.name.clone(),
            ret: func.ret,
            params: func.params.clone(),
            defined: func.body.is_some(),
        }
    }
}

/// A global variable definition.
#[derive(Clone, Debug)]
pub struct GlobalDef {
    pub pos: Pos,
    pub name: String,
    pub ty: Type,
    /// Constant initialiser, if any; decides `.data` vs `.bss`.
    pub init: Option<Word>,
}
