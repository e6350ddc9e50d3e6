//! The recursive-descent parser.

use crate::lexer::{Lexer, Token, TokenKind};
use lilycc_codegen::ast::{
    AsmOperand, Expr, ExprKind, FuncDef, GlobalDef, InlineAsm, Oper, Param, Pos, Stmt, StmtKind,
    VarDecl,
};
use lilycc_codegen::types::{SimpleType, Type, TypePool};
use thiserror::Error;

/// A syntax error with its source position.
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct ParseError {
    pub pos: Pos,
    pub msg: String,
}

type ParseResult<T> = Result<T, ParseError>;

/// One top-level item of a translation unit.
#[derive(Debug)]
pub enum Item {
    Func(FuncDef),
    Global(GlobalDef),
}

/// Parse a whole translation unit.
pub fn parse_unit(src: &str, types: &mut TypePool) -> ParseResult<Vec<Item>> {
    let mut parser = Parser {
        lexer: Lexer::new(src),
        types,
    };
    let mut items = Vec::new();
    while parser.lexer.peek().kind != TokenKind::Eof {
        items.push(parser.item()?);
    }
    Ok(items)
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    types: &'a mut TypePool,
}

impl<'a> Parser<'a> {
    fn error<T>(&mut self, msg: impl Into<String>) -> ParseResult<T> {
        let pos = self.lexer.peek().pos;
        Err(ParseError {
            pos,
            msg: msg.into(),
        })
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.lexer.peek().kind, TokenKind::Punct(p) if p == punct) {
            self.lexer.next_token();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &'static str) -> ParseResult<Token> {
        let token = self.lexer.next_token();
        match &token.kind {
            TokenKind::Punct(p) if *p == punct => Ok(token),
            other => Err(ParseError {
                pos: token.pos,
                msg: format!("expected '{punct}', found {other}"),
            }),
        }
    }

    fn expect_ident(&mut self) -> ParseResult<(String, Pos)> {
        let token = self.lexer.next_token();
        match token.kind {
            TokenKind::Ident(name) => Ok((name, token.pos)),
            other => Err(ParseError {
                pos: token.pos,
                msg: format!("expected an identifier, found {other}"),
            }),
        }
    }

    fn peek_punct(&mut self) -> Option<&'static str> {
        match self.lexer.peek().kind {
            TokenKind::Punct(p) => Some(p),
            _ => None,
        }
    }

    /* ================ Types ================ */

    /// Whether the upcoming token starts a type name.
    fn at_type(&mut self) -> bool {
        matches!(
            self.peek_punct(),
            Some(
                "void" | "bool" | "char" | "short" | "int" | "long" | "signed" | "unsigned"
                    | "float" | "double" | "const" | "volatile"
            )
        )
    }

    /// Parse a type specifier (without declarator pointers).
    fn type_specifier(&mut self) -> ParseResult<Type> {
        let mut signed: Option<bool> = None;
        let mut base: Option<&'static str> = None;
        let mut longs = 0;
        loop {
            match self.peek_punct() {
                Some("const" | "volatile") => {
                    self.lexer.next_token();
                }
                Some("signed") => {
                    self.lexer.next_token();
                    signed = Some(true);
                }
                Some("unsigned") => {
                    self.lexer.next_token();
                    signed = Some(false);
                }
                Some("long") => {
                    self.lexer.next_token();
                    longs += 1;
                }
                Some(kw @ ("void" | "bool" | "char" | "short" | "int" | "float" | "double")) => {
                    if base.is_some() {
                        return self.error("too many type specifiers");
                    }
                    self.lexer.next_token();
                    base = Some(kw);
                }
                _ => break,
            }
        }
        if base.is_none() && longs == 0 && signed.is_none() {
            return self.error("expected a type name");
        }

        let ty = match (base, longs) {
            (Some("void"), 0) => self.types.simple(SimpleType::Void),
            (Some("bool"), 0) => self.types.simple(SimpleType::Bool),
            (Some("char"), 0) => match signed {
                Some(true) => self.types.simple(SimpleType::SChar),
                Some(false) => self.types.simple(SimpleType::UChar),
                None => self.types.plain_char(),
            },
            (Some("short"), 0) => self.types.simple(if signed == Some(false) {
                SimpleType::UShort
            } else {
                SimpleType::SShort
            }),
            (Some("int") | None, 0) => self.types.simple(if signed == Some(false) {
                SimpleType::UInt
            } else {
                SimpleType::SInt
            }),
            (Some("int") | None, 1) => self.types.simple(if signed == Some(false) {
                SimpleType::ULong
            } else {
                SimpleType::SLong
            }),
            (Some("int") | None, 2) => self.types.simple(if signed == Some(false) {
                SimpleType::ULongLong
            } else {
                SimpleType::SLongLong
            }),
            (Some("float"), 0) => self.types.simple(SimpleType::Float),
            (Some("double"), 0) => self.types.simple(SimpleType::Double),
            (Some("double"), 1) => self.types.simple(SimpleType::LongDouble),
            _ => return self.error("malformed type name"),
        };
        Ok(ty)
    }

    /// Parse declarator pointer stars.
    fn pointers(&mut self, mut ty: Type) -> Type {
        while self.eat("*") {
            while self.eat("const") || self.eat("volatile") {}
            ty = self.types.pointer_to(ty);
        }
        ty
    }

    /// Parse a trailing array declarator, if any.
    fn array_suffix(&mut self, ty: Type) -> ParseResult<Type> {
        if !self.eat("[") {
            return Ok(ty);
        }
        let len = match self.lexer.peek().kind {
            TokenKind::Int(value) => {
                self.lexer.next_token();
                Some(value as u32)
            }
            _ => None,
        };
        self.expect("]")?;
        Ok(self.types.array_of(ty, len))
    }

    /* ============ Top-level items ============ */

    fn item(&mut self) -> ParseResult<Item> {
        let start = self.lexer.peek().pos;
        let base = self.type_specifier()?;
        let ty = self.pointers(base);
        let (name, name_pos) = self.expect_ident()?;

        if self.eat("(") {
            // Function definition or declaration.
            let mut params = Vec::new();
            if !self.eat(")") {
                loop {
                    // A lone `void` means no parameters.
                    if params.is_empty() && self.peek_punct() == Some("void") {
                        let mut probe = self.clone_probe();
                        probe.next_token();
                        if matches!(probe.peek().kind, TokenKind::Punct(")")) {
                            self.lexer.next_token();
                            break;
                        }
                    }
                    let pty = self.type_specifier()?;
                    let pty = self.pointers(pty);
                    let (pname, ppos) = self.expect_ident()?;
                    let pty = self.array_suffix(pty)?;
                    params.push(Param {
                        pos: ppos,
                        name: pname,
                        ty: pty,
                    });
                    if !self.eat(",") {
                        break;
                    }
                }
                self.expect(")")?;
            }
            let body = if self.eat(";") {
                None
            } else {
                Some(self.block()?)
            };
            return Ok(Item::Func(FuncDef {
                pos: start.merge(name_pos),
                name,
                ret: ty,
                params,
                body,
                preproc: None,
            }));
        }

        // Global variable.
        let ty = self.array_suffix(ty)?;
        let init = if self.eat("=") {
            let expr = self.expression()?;
            match fold_const(&expr) {
                Some(value) => Some(value),
                None => {
                    return Err(ParseError {
                        pos: expr.pos,
                        msg: "global initialiser must be a constant expression".to_string(),
                    })
                }
            }
        } else {
            None
        };
        self.expect(";")?;
        Ok(Item::Global(GlobalDef {
            pos: start.merge(name_pos),
            name,
            ty,
            init,
        }))
    }

    /* ============== Statements ============== */

    fn block(&mut self) -> ParseResult<Stmt> {
        let open = self.expect("{")?;
        let mut stmts = Vec::new();
        while !self.eat("}") {
            if self.lexer.peek().kind == TokenKind::Eof {
                return self.error("unterminated block");
            }
            stmts.push(self.statement()?);
        }
        Ok(Stmt {
            pos: open.pos,
            kind: StmtKind::Multi(stmts),
            preproc: None,
        })
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        let pos = self.lexer.peek().pos;
        match self.peek_punct() {
            Some("{") => self.block(),
            Some(";") => {
                self.lexer.next_token();
                Ok(Stmt {
                    pos,
                    kind: StmtKind::Nop,
                    preproc: None,
                })
            }
            Some("if") => {
                self.lexer.next_token();
                self.expect("(")?;
                let cond = self.expression()?;
                self.expect(")")?;
                let code_true = Box::new(self.statement()?);
                let code_false = if self.eat("else") {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(Stmt {
                    pos,
                    kind: StmtKind::If {
                        cond,
                        code_true,
                        code_false,
                    },
                    preproc: None,
                })
            }
            Some("while") => {
                self.lexer.next_token();
                self.expect("(")?;
                let cond = self.expression()?;
                self.expect(")")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt {
                    pos,
                    kind: StmtKind::While {
                        cond,
                        body,
                        do_while: false,
                    },
                    preproc: None,
                })
            }
            Some("do") => {
                self.lexer.next_token();
                let body = Box::new(self.statement()?);
                self.expect("while")?;
                self.expect("(")?;
                let cond = self.expression()?;
                self.expect(")")?;
                self.expect(";")?;
                Ok(Stmt {
                    pos,
                    kind: StmtKind::While {
                        cond,
                        body,
                        do_while: true,
                    },
                    preproc: None,
                })
            }
            Some("for") => {
                self.lexer.next_token();
                self.expect("(")?;
                let init = if self.eat(";") {
                    None
                } else {
                    Some(Box::new(self.simple_statement()?))
                };
                let mut cond = Vec::new();
                if !self.eat(";") {
                    loop {
                        cond.push(self.expression()?);
                        if !self.eat(",") {
                            break;
                        }
                    }
                    self.expect(";")?;
                }
                let mut step = Vec::new();
                if self.peek_punct() != Some(")") {
                    loop {
                        step.push(self.expression()?);
                        if !self.eat(",") {
                            break;
                        }
                    }
                }
                self.expect(")")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt {
                    pos,
                    kind: StmtKind::For {
                        init,
                        cond,
                        step,
                        body,
                    },
                    preproc: None,
                })
            }
            Some("return") => {
                self.lexer.next_token();
                let expr = if self.peek_punct() == Some(";") {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(";")?;
                Ok(Stmt {
                    pos,
                    kind: StmtKind::Ret(expr),
                    preproc: None,
                })
            }
            Some("asm") => {
                let stmt = self.asm_statement(pos)?;
                Ok(stmt)
            }
            _ => self.simple_statement(),
        }
    }

    /// Declarations and expression statements, including the `;`.
    fn simple_statement(&mut self) -> ParseResult<Stmt> {
        let pos = self.lexer.peek().pos;
        if self.at_type() {
            let base = self.type_specifier()?;
            let mut decls = Vec::new();
            loop {
                let ty = self.pointers(base);
                let (name, npos) = self.expect_ident()?;
                let ty = self.array_suffix(ty)?;
                let init = if self.eat("=") {
                    Some(self.assignment()?)
                } else {
                    None
                };
                decls.push(VarDecl {
                    pos: npos,
                    name,
                    ty,
                    init,
                });
                if !self.eat(",") {
                    break;
                }
            }
            self.expect(";")?;
            return Ok(Stmt {
                pos,
                kind: StmtKind::Var(decls),
                preproc: None,
            });
        }
        let expr = self.expression()?;
        self.expect(";")?;
        Ok(Stmt {
            pos,
            kind: StmtKind::Expr(expr),
            preproc: None,
        })
    }

    fn asm_operands(&mut self) -> ParseResult<Vec<AsmOperand>> {
        let mut out = Vec::new();
        if matches!(self.peek_punct(), Some(":" | ")")) {
            return Ok(out);
        }
        loop {
            let pos = self.lexer.peek().pos;
            let symbol = if self.eat("[") {
                let (name, _) = self.expect_ident()?;
                self.expect("]")?;
                Some(name)
            } else {
                None
            };
            let constraint = match self.lexer.next_token() {
                Token {
                    kind: TokenKind::Str(text),
                    ..
                } => text,
                token => {
                    return Err(ParseError {
                        pos: token.pos,
                        msg: "expected a constraint string".to_string(),
                    })
                }
            };
            self.expect("(")?;
            let expr = self.expression()?;
            self.expect(")")?;
            out.push(AsmOperand {
                pos,
                symbol,
                constraint,
                expr,
            });
            if !self.eat(",") {
                return Ok(out);
            }
        }
    }

    fn asm_statement(&mut self, pos: Pos) -> ParseResult<Stmt> {
        self.expect("asm")?;
        let volatile = self.eat("volatile");
        self.expect("(")?;
        let mut text = match self.lexer.next_token() {
            Token {
                kind: TokenKind::Str(text),
                ..
            } => text,
            token => {
                return Err(ParseError {
                    pos: token.pos,
                    msg: "expected an assembly string".to_string(),
                })
            }
        };
        // Adjacent string literals concatenate.
        while let TokenKind::Str(_) = self.lexer.peek().kind {
            match self.lexer.next_token().kind {
                TokenKind::Str(more) => {
                    text.push('\n');
                    text.push_str(&more);
                }
                _ => unreachable!(),
            }
        }
        let mut outputs = Vec::new();
        let mut inputs = Vec::new();
        if self.eat(":") {
            outputs = self.asm_operands()?;
            if self.eat(":") {
                inputs = self.asm_operands()?;
            }
        }
        self.expect(")")?;
        self.expect(";")?;
        Ok(Stmt {
            pos,
            kind: StmtKind::InlineAsm(InlineAsm {
                pos,
                text,
                outputs,
                inputs,
                volatile,
            }),
            preproc: None,
        })
    }

    /* ============== Expressions ============= */

    fn expression(&mut self) -> ParseResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> ParseResult<Expr> {
        let lhs = self.logic_or()?;
        let op = match self.peek_punct() {
            Some("=") => None,
            Some("+=") => Some(Oper::Add),
            Some("-=") => Some(Oper::Sub),
            Some("*=") => Some(Oper::Mul),
            Some("/=") => Some(Oper::Div),
            Some("%=") => Some(Oper::Mod),
            Some("<<=") => Some(Oper::Shl),
            Some(">>=") => Some(Oper::Shr),
            Some("&=") => Some(Oper::BitAnd),
            Some("|=") => Some(Oper::BitOr),
            Some("^=") => Some(Oper::BitXor),
            _ => return Ok(lhs),
        };
        let pos = self.lexer.next_token().pos;
        let rhs = self.assignment()?;
        // Compound assignment generalises to assignment plus the binary
        // operation on the same left-hand side.
        let rhs = match op {
            Some(op) => Expr {
                pos: lhs.pos.merge(rhs.pos),
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs.clone()),
                    rhs: Box::new(rhs),
                },
                ty: None,
            },
            None => rhs,
        };
        Ok(Expr {
            pos: pos.merge(rhs.pos),
            kind: ExprKind::Binary {
                op: Oper::Assign,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty: None,
        })
    }

    fn binary_level(
        &mut self,
        ops: &[(&'static str, Oper)],
        next: fn(&mut Self) -> ParseResult<Expr>,
    ) -> ParseResult<Expr> {
        let mut lhs = next(self)?;
        loop {
            let op = match self.peek_punct() {
                Some(p) => match ops.iter().find(|(spelling, _)| *spelling == p) {
                    Some((_, op)) => *op,
                    None => return Ok(lhs),
                },
                None => return Ok(lhs),
            };
            self.lexer.next_token();
            let rhs = next(self)?;
            let node = Expr {
                pos: lhs.pos.merge(rhs.pos),
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty: None,
            };
            // Fold constant subexpressions as they are built.
            lhs = match fold_const(&node) {
                Some(value) => Expr {
                    pos: node.pos,
                    kind: ExprKind::Const(value),
                    ty: None,
                },
                None => node,
            };
        }
    }

    fn logic_or(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("||", Oper::LogicOr)], Self::logic_and)
    }

    fn logic_and(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("&&", Oper::LogicAnd)], Self::bit_or)
    }

    fn bit_or(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("|", Oper::BitOr)], Self::bit_xor)
    }

    fn bit_xor(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("^", Oper::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("&", Oper::BitAnd)], Self::equality)
    }

    fn equality(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("==", Oper::Eq), ("!=", Oper::Ne)], Self::relational)
    }

    fn relational(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[
                ("<=", Oper::Le),
                (">=", Oper::Ge),
                ("<", Oper::Lt),
                (">", Oper::Gt),
            ],
            Self::shift,
        )
    }

    fn shift(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("<<", Oper::Shl), (">>", Oper::Shr)], Self::additive)
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("+", Oper::Add), ("-", Oper::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[("*", Oper::Mul), ("/", Oper::Div), ("%", Oper::Mod)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let pos = self.lexer.peek().pos;
        let op = match self.peek_punct() {
            Some("!") => Some(Oper::LogicNot),
            Some("~") => Some(Oper::BitNot),
            Some("-") => Some(Oper::Neg),
            Some("*") => Some(Oper::Deref),
            Some("&") => Some(Oper::AddrOf),
            _ => None,
        };
        if let Some(op) = op {
            self.lexer.next_token();
            let expr = self.unary()?;
            let node = Expr {
                pos: pos.merge(expr.pos),
                kind: ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                },
                ty: None,
            };
            return Ok(match fold_const(&node) {
                Some(value) => Expr {
                    pos: node.pos,
                    kind: ExprKind::Const(value),
                    ty: None,
                },
                None => node,
            });
        }
        // Prefix increment/decrement desugars to compound assignment.
        if matches!(self.peek_punct(), Some("++" | "--")) {
            let op = if self.peek_punct() == Some("++") {
                Oper::Add
            } else {
                Oper::Sub
            };
            self.lexer.next_token();
            let expr = self.unary()?;
            let one = Expr {
                pos,
                kind: ExprKind::Const(1),
                ty: None,
            };
            let sum = Expr {
                pos: expr.pos,
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(expr.clone()),
                    rhs: Box::new(one),
                },
                ty: None,
            };
            return Ok(Expr {
                pos: pos.merge(expr.pos),
                kind: ExprKind::Binary {
                    op: Oper::Assign,
                    lhs: Box::new(expr),
                    rhs: Box::new(sum),
                },
                ty: None,
            });
        }
        // A parenthesised type name is a cast.
        if self.peek_punct() == Some("(") {
            let save = self.lexer.peek().pos;
            // Cheap lookahead: "(" followed by a type keyword.
            let mut probe = self.clone_probe();
            probe.next_token();
            if matches!(
                probe.peek().kind,
                TokenKind::Punct(
                    "void" | "bool" | "char" | "short" | "int" | "long" | "signed" | "unsigned"
                        | "float" | "double" | "const" | "volatile"
                )
            ) {
                self.lexer.next_token();
                let base = self.type_specifier()?;
                let ty = self.pointers(base);
                self.expect(")")?;
                let expr = self.unary()?;
                return Ok(Expr {
                    pos: save.merge(expr.pos),
                    kind: ExprKind::Cast {
                        ty,
                        expr: Box::new(expr),
                    },
                    ty: None,
                });
            }
        }
        self.postfix()
    }

    /// A throwaway lexer for one-token lookahead past the current peek.
    fn clone_probe(&mut self) -> Lexer<'a> {
        // Force the peek so the clone starts at the same place.
        self.lexer.peek();
        self.lexer.clone()
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek_punct() {
                Some("(") => {
                    self.lexer.next_token();
                    let mut args = Vec::new();
                    if !self.eat(")") {
                        loop {
                            args.push(self.assignment()?);
                            if !self.eat(",") {
                                break;
                            }
                        }
                        self.expect(")")?;
                    }
                    expr = Expr {
                        pos: expr.pos,
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        ty: None,
                    };
                }
                Some("[") => {
                    self.lexer.next_token();
                    let index = self.expression()?;
                    self.expect("]")?;
                    expr = Expr {
                        pos: expr.pos.merge(index.pos),
                        kind: ExprKind::Binary {
                            op: Oper::Index,
                            lhs: Box::new(expr),
                            rhs: Box::new(index),
                        },
                        ty: None,
                    };
                }
                Some(p @ ("++" | "--")) => {
                    let op = if p == "++" {
                        Oper::PostInc
                    } else {
                        Oper::PostDec
                    };
                    let pos = self.lexer.next_token().pos;
                    expr = Expr {
                        pos: expr.pos.merge(pos),
                        kind: ExprKind::Unary {
                            op,
                            expr: Box::new(expr),
                        },
                        ty: None,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let token = self.lexer.next_token();
        match token.kind {
            TokenKind::Int(value) => Ok(Expr {
                pos: token.pos,
                kind: ExprKind::Const(value),
                ty: None,
            }),
            TokenKind::Ident(name) => Ok(Expr {
                pos: token.pos,
                kind: ExprKind::Ident(name),
                ty: None,
            }),
            TokenKind::Punct("(") => {
                let expr = self.expression()?;
                self.expect(")")?;
                Ok(expr)
            }
            other => Err(ParseError {
                pos: token.pos,
                msg: format!("expected an expression, found {other}"),
            }),
        }
    }
}

/// Fold a constant expression at parse time (global initialisers).
fn fold_const(expr: &Expr) -> Option<u64> {
    match &expr.kind {
        ExprKind::Const(value) => Some(*value),
        ExprKind::Unary {
            op: Oper::Neg,
            expr,
        } => fold_const(expr).map(u64::wrapping_neg),
        ExprKind::Unary {
            op: Oper::BitNot,
            expr,
        } => fold_const(expr).map(|v| !v),
        ExprKind::Unary {
            op: Oper::LogicNot,
            expr,
        } => fold_const(expr).map(|v| (v == 0) as u64),
        ExprKind::Binary { op, lhs, rhs } => {
            let (a, b) = (fold_const(lhs)?, fold_const(rhs)?);
            match op {
                Oper::Add => Some(a.wrapping_add(b)),
                Oper::Sub => Some(a.wrapping_sub(b)),
                Oper::Mul => Some(a.wrapping_mul(b)),
                Oper::Div if b != 0 => Some(a / b),
                Oper::Mod if b != 0 => Some(a % b),
                Oper::Shl => Some(a << (b & 63)),
                Oper::Shr => Some(a >> (b & 63)),
                Oper::BitAnd => Some(a & b),
                Oper::BitOr => Some(a | b),
                Oper::BitXor => Some(a ^ b),
                _ => None,
            }
        }
        ExprKind::Cast { expr, .. } => fold_const(expr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lilycc_codegen::isa::{lookup, Flags};

    fn parse(src: &str) -> Vec<Item> {
        let isa = lookup("px16").unwrap().finish(Flags::default()).unwrap();
        let mut types = TypePool::new(isa.config());
        parse_unit(src, &mut types).unwrap()
    }

    #[test]
    fn function_definition() {
        let items = parse("long fib(long n) { if (n == 0) return 0; return 1; }");
        assert_eq!(items.len(), 1);
        match &items[0] {
            Item::Func(func) => {
                assert_eq!(func.name, "fib");
                assert_eq!(func.params.len(), 1);
                assert!(func.body.is_some());
            }
            other => panic!("expected a function, got {other:?}"),
        }
    }

    #[test]
    fn precedence() {
        let items = parse("int f(void) { return 1 + 2 * 3 == 7 && 1; }");
        let func = match &items[0] {
            Item::Func(func) => func,
            _ => panic!(),
        };
        let body = func.body.as_ref().unwrap();
        let ret = match &body.kind {
            StmtKind::Multi(stmts) => &stmts[0],
            _ => panic!(),
        };
        let expr = match &ret.kind {
            StmtKind::Ret(Some(expr)) => expr,
            _ => panic!(),
        };
        // Root must be &&.
        assert_eq!(expr.oper(), Some(Oper::LogicAnd));
    }

    #[test]
    fn asm_statement_with_operands() {
        let items = parse(
            "int f(int x) { asm(\"MOV %0, %[src]\" : [dst] \"=r\" (x) : [src] \"m\" (x)); return x; }",
        );
        let func = match &items[0] {
            Item::Func(func) => func,
            _ => panic!(),
        };
        let body = match &func.body.as_ref().unwrap().kind {
            StmtKind::Multi(stmts) => stmts,
            _ => panic!(),
        };
        match &body[0].kind {
            StmtKind::InlineAsm(asm) => {
                assert_eq!(asm.outputs.len(), 1);
                assert_eq!(asm.inputs.len(), 1);
                assert_eq!(asm.outputs[0].constraint, "=r");
                assert_eq!(asm.inputs[0].symbol.as_deref(), Some("src"));
            }
            other => panic!("expected inline asm, got {other:?}"),
        }
    }

    #[test]
    fn globals_fold_constants() {
        let items = parse("unsigned int table_size = 4 * 8 + 1;");
        match &items[0] {
            Item::Global(global) => {
                assert_eq!(global.name, "table_size");
                assert_eq!(global.init, Some(33));
            }
            other => panic!("expected a global, got {other:?}"),
        }
    }

    #[test]
    fn compound_assignment_desugars() {
        let items = parse("int f(int x) { x += 2; return x; }");
        let func = match &items[0] {
            Item::Func(func) => func,
            _ => panic!(),
        };
        let body = match &func.body.as_ref().unwrap().kind {
            StmtKind::Multi(stmts) => stmts,
            _ => panic!(),
        };
        let expr = match &body[0].kind {
            StmtKind::Expr(expr) => expr,
            _ => panic!(),
        };
        assert_eq!(expr.oper(), Some(Oper::Assign));
        match &expr.kind {
            ExprKind::Binary { rhs, .. } => assert_eq!(rhs.oper(), Some(Oper::Add)),
            _ => panic!(),
        }
    }
}
