//! The Pixie 16 mini-assembler.
//!
//! Parses one instruction per line, as produced by inline-assembly
//! statements (after template substitution) or read from an assembly source
//! file. The tokeniser is stateless over one line; the mnemonic table
//! carries the full instruction set, and operands accept every addressing
//! mode the machine has: plain registers, immediates, `[label]`,
//! `[reg+imm]`, `[reg+reg]`, `[ST+n]` and `[PC~label]`.

use super::inst::*;
use super::Px16Backend;
use crate::ast::Pos;
use crate::context::CompileCtx;
use crate::diag::CodegenResult;

/// One lexical token of assembly text.
#[derive(Clone, Debug, PartialEq)]
enum Token {
    Mnemonic(u8),
    Reg(u8),
    Ident(String),
    Ival(i64),
    Comma,
    LBrack,
    RBrack,
    Plus,
    Tilde,
    End,
}

/// Mnemonics whose opcode takes a single operand.
fn is_math1(opcode: u8) -> bool {
    (0o20..0o40).contains(&opcode)
}

/// The mnemonic table. Conditional MOV/LEA spellings are matched with
/// their condition suffix.
fn lookup_mnemonic(word: &str) -> Option<u8> {
    const MATH2: [&str; 6] = ["ADD", "SUB", "CMP", "AND", "OR", "XOR"];
    const MATH1: [(&str, u8); 5] = [
        ("INC", OP_INC),
        ("DEC", OP_DEC),
        ("CMP1", OP_CMP1),
        ("SHL", OP_SHL),
        ("SHR", OP_SHR),
    ];
    const CONDS: [(&str, u8); 15] = [
        ("ULT", COND_ULT),
        ("UGT", COND_UGT),
        ("SLT", COND_SLT),
        ("SGT", COND_SGT),
        ("EQ", COND_EQ),
        ("CS", COND_CS),
        ("UGE", COND_UGE),
        ("ULE", COND_ULE),
        ("SGE", COND_SGE),
        ("SLE", COND_SLE),
        ("NE", COND_NE),
        ("CC", COND_CC),
        ("JSR", COND_JSR),
        ("CX", COND_CX),
        ("", COND_TRUE),
    ];

    let upper = word.to_ascii_uppercase();
    for (i, name) in MATH2.iter().enumerate() {
        if upper == *name {
            return Some(i as u8);
        }
        if upper.len() == name.len() + 1 && upper.starts_with(name) && upper.ends_with('C') {
            return Some(i as u8 | OFFS_CC);
        }
    }
    for (name, opcode) in MATH1 {
        if upper == name {
            return Some(opcode);
        }
        let carry = format!("{name}C");
        if upper == carry {
            return Some(opcode | OFFS_CC);
        }
    }
    for (base, offs) in [("MOV", OFFS_MOV), ("LEA", OFFS_LEA)] {
        let rest = match upper.strip_prefix(base) {
            Some(rest) => rest,
            None => continue,
        };
        let suffix = rest.strip_prefix('.').unwrap_or(rest);
        if !rest.is_empty() && !rest.starts_with('.') {
            continue;
        }
        for (name, cond) in CONDS {
            if suffix == name {
                if offs == OFFS_LEA && cond == COND_CX {
                    return None;
                }
                return Some(offs | cond);
            }
        }
    }
    None
}

fn lookup_reg(word: &str) -> Option<u8> {
    let upper = word.to_ascii_uppercase();
    ["R0", "R1", "R2", "R3", "ST", "PF", "PC"]
        .iter()
        .position(|name| upper == *name)
        .map(|i| i as u8)
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

struct Lexer<'a> {
    rest: &'a str,
}

impl<'a> Lexer<'a> {
    fn next(&mut self) -> Result<Token, String> {
        self.rest = self.rest.trim_start();
        // Line comments end the instruction.
        if self.rest.is_empty() || self.rest.starts_with("//") || self.rest.starts_with(';') {
            return Ok(Token::End);
        }
        let mut chars = self.rest.chars();
        let c = chars.next().expect("nonempty");
        match c {
            ',' => {
                self.rest = &self.rest[1..];
                Ok(Token::Comma)
            }
            '[' => {
                self.rest = &self.rest[1..];
                Ok(Token::LBrack)
            }
            ']' => {
                self.rest = &self.rest[1..];
                Ok(Token::RBrack)
            }
            '+' => {
                self.rest = &self.rest[1..];
                Ok(Token::Plus)
            }
            '~' => {
                self.rest = &self.rest[1..];
                Ok(Token::Tilde)
            }
            '0'..='9' => {
                let end = self
                    .rest
                    .find(|c: char| !c.is_ascii_alphanumeric())
                    .unwrap_or(self.rest.len());
                let text = &self.rest[..end];
                self.rest = &self.rest[end..];
                let value = if let Some(hex) = text.strip_prefix("0x").or(text.strip_prefix("0X"))
                {
                    i64::from_str_radix(hex, 16)
                } else if text.starts_with('0') && text.len() > 1 {
                    i64::from_str_radix(&text[1..], 8)
                } else {
                    text.parse()
                };
                value
                    .map(Token::Ival)
                    .map_err(|_| format!("bad number '{text}'"))
            }
            c if is_label_char(c) => {
                let end = self
                    .rest
                    .find(|c: char| !is_label_char(c))
                    .unwrap_or(self.rest.len());
                let text = &self.rest[..end];
                self.rest = &self.rest[end..];
                if let Some(opcode) = lookup_mnemonic(text) {
                    Ok(Token::Mnemonic(opcode))
                } else if let Some(reg) = lookup_reg(text) {
                    Ok(Token::Reg(reg))
                } else {
                    Ok(Token::Ident(text.to_string()))
                }
            }
            _ => Err(format!("unexpected character '{c}'")),
        }
    }
}

/// A parsed operand, ready to drop into an instruction's fields.
#[derive(Clone, Debug, Default)]
struct AsmOperand {
    /// Register field value.
    regno: u8,
    /// Addressing mode; `ADDR_IMM` for plain register/immediate operands.
    mode: u8,
    ident: Option<String>,
    ival: i64,
}

/// Parse one operand. Returns the operand and whether a comma followed.
fn parse_operand(lex: &mut Lexer) -> Result<Option<(AsmOperand, bool)>, String> {
    let tkn = lex.next()?;
    let mut op = AsmOperand::default();
    match tkn {
        Token::End => return Ok(None),
        Token::Ival(v) => {
            op.regno = REG_IMM;
            op.mode = ADDR_IMM;
            op.ival = v;
        }
        Token::Ident(name) => {
            op.regno = REG_IMM;
            op.mode = ADDR_IMM;
            op.ident = Some(name);
        }
        Token::Reg(reg) => {
            op.regno = reg;
            op.mode = ADDR_IMM;
        }
        Token::LBrack => {
            // [ term (+|~ term)* ]
            let mut has_reg = false;
            let mut has_any = false;
            loop {
                match lex.next()? {
                    Token::Reg(REG_PF) => {
                        return Err("register 'PF' is not allowed in a memory operand".into())
                    }
                    Token::Reg(reg) => {
                        if has_reg {
                            if op.mode != ADDR_MEM {
                                return Err(
                                    "argument too complex, consider removing a register".into()
                                );
                            }
                            // Second register becomes the index mode.
                            op.mode = reg;
                        } else {
                            op.regno = reg;
                            op.mode = ADDR_MEM;
                            has_reg = true;
                        }
                    }
                    Token::Ident(name) => {
                        if op.ident.is_some() {
                            return Err("cannot handle more than one label".into());
                        }
                        if has_reg && op.mode == ADDR_MEM {
                            // [reg + label]: register becomes the mode.
                            op.mode = op.regno;
                            op.regno = REG_IMM;
                        } else if !has_any {
                            op.regno = REG_IMM;
                            op.mode = ADDR_MEM;
                        }
                        op.ident = Some(name);
                    }
                    Token::Ival(v) => {
                        if has_reg && op.regno != REG_IMM {
                            op.mode = op.regno;
                            op.regno = REG_IMM;
                        } else if !has_any {
                            op.regno = REG_IMM;
                            op.mode = ADDR_MEM;
                        }
                        op.ival += v;
                    }
                    _ => return Err("expected register, label or number".into()),
                }
                has_any = true;
                match lex.next()? {
                    Token::Plus | Token::Tilde => continue,
                    Token::RBrack => break,
                    _ => return Err("expected '+', '~' or ']'".into()),
                }
            }
            if !has_any {
                return Err("empty memory operand".into());
            }
            // A bare register in brackets addresses through it: mode MEM
            // with the register in the field is [reg].
        }
        _ => return Err("expected an operand".into()),
    }
    match lex.next()? {
        Token::Comma => Ok(Some((op, true))),
        Token::End => Ok(Some((op, false))),
        _ => Err("expected ',' or end of line".into()),
    }
}

/// Assemble one line of px16 assembly and emit it.
pub(super) fn asm_line(
    backend: &Px16Backend,
    ctx: &mut CompileCtx,
    line: &str,
    pos: Pos,
) -> CodegenResult<()> {
    let trimmed = line.trim();
    // Label definitions.
    if let Some(name) = trimmed.strip_suffix(':') {
        if !name.is_empty() && name.chars().all(is_label_char) {
            ctx.asm.write_label(name);
            return Ok(());
        }
    }

    let mut lex = Lexer { rest: trimmed };
    let opcode = match lex.next() {
        Ok(Token::Mnemonic(opcode)) => opcode,
        Ok(Token::End) => return Ok(()),
        Ok(Token::Ident(name)) => {
            ctx.diag
                .error(pos, format!("no instruction with name '{name}'"));
            return Ok(());
        }
        Ok(_) | Err(_) => {
            ctx.diag.error(pos, format!("cannot parse '{trimmed}'"));
            return Ok(());
        }
    };

    // Operand list.
    let mut operands = Vec::new();
    loop {
        match parse_operand(&mut lex) {
            Ok(Some((op, more))) => {
                operands.push(op);
                if !more {
                    break;
                }
            }
            Ok(None) => break,
            Err(msg) => {
                ctx.diag.error(pos, msg);
                return Ok(());
            }
        }
    }

    let expect = if is_math1(opcode) { 1 } else { 2 };
    if operands.len() != expect {
        ctx.diag.error(
            pos,
            format!(
                "instruction has {expect} argument{} ({} given)",
                if expect == 1 { "" } else { "s" },
                operands.len()
            ),
        );
        return Ok(());
    }

    // Pick the encoding row matching the operands' addressing classes.
    let mut insn = Insn {
        o: opcode,
        ..Insn::default()
    };
    let (label0, offs0, label1, offs1);
    let op0 = &operands[0];
    if expect == 1 {
        insn.y = false;
        insn.x = op0.mode;
        insn.a = op0.regno;
        insn.b = 0;
        label0 = op0.ident.clone();
        offs0 = op0.ival;
        label1 = None;
        offs1 = 0;
    } else {
        let op1 = &operands[1];
        if op0.mode != ADDR_IMM {
            // Addressing mode on the destination.
            if op1.mode != ADDR_IMM {
                ctx.diag
                    .error(pos, "only one operand may address memory");
                return Ok(());
            }
            insn.y = false;
            insn.x = op0.mode;
            insn.a = op0.regno;
            insn.b = op1.regno;
            label0 = op0.ident.clone();
            offs0 = op0.ival;
            label1 = op1.ident.clone();
            offs1 = op1.ival;
        } else {
            // Plain destination register; mode (if any) on the source.
            if op0.regno == REG_IMM {
                ctx.diag
                    .error(pos, "destination operand cannot be an immediate");
                return Ok(());
            }
            insn.y = true;
            insn.x = op1.mode;
            insn.a = op0.regno;
            insn.b = op1.regno;
            label0 = None;
            offs0 = 0;
            label1 = op1.ident.clone();
            offs1 = op1.ival;
        }
    }

    backend.write_insn_raw(
        ctx,
        insn,
        label0.as_deref(),
        offs0,
        label1.as_deref(),
        offs1,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_table() {
        assert_eq!(lookup_mnemonic("ADD"), Some(OP_ADD));
        assert_eq!(lookup_mnemonic("SUBC"), Some(OP_SUB | OFFS_CC));
        assert_eq!(lookup_mnemonic("CMP1"), Some(OP_CMP1));
        assert_eq!(lookup_mnemonic("CMP1C"), Some(OP_CMP1 | OFFS_CC));
        assert_eq!(lookup_mnemonic("MOV"), Some(OP_MOV));
        assert_eq!(lookup_mnemonic("mov.ne"), Some(OFFS_MOV | COND_NE));
        assert_eq!(lookup_mnemonic("LEA.JSR"), Some(OFFS_LEA | COND_JSR));
        assert_eq!(lookup_mnemonic("MOV.CX"), Some(OFFS_MOV | COND_CX));
        assert_eq!(lookup_mnemonic("LEA.CX"), None);
        assert_eq!(lookup_mnemonic("BOGUS"), None);
    }

    #[test]
    fn operand_classes() {
        let mut lex = Lexer { rest: "R2, [ST+4]" };
        let (op, more) = parse_operand(&mut lex).unwrap().unwrap();
        assert!(more);
        assert_eq!((op.regno, op.mode), (2, ADDR_IMM));
        let (op, more) = parse_operand(&mut lex).unwrap().unwrap();
        assert!(!more);
        assert_eq!((op.regno, op.mode, op.ival), (REG_IMM, ADDR_ST, 4));

        let mut lex = Lexer { rest: "[R1+myvar]" };
        let (op, _) = parse_operand(&mut lex).unwrap().unwrap();
        assert_eq!((op.regno, op.mode), (REG_IMM, 1));
        assert_eq!(op.ident.as_deref(), Some("myvar"));

        let mut lex = Lexer { rest: "[PC~loop]" };
        let (op, _) = parse_operand(&mut lex).unwrap().unwrap();
        assert_eq!((op.regno, op.mode), (REG_IMM, ADDR_PC));
    }
}
