//! The GR8CPU Rev3 mini-assembler.
//!
//! One instruction per line. The operand grammar is small: registers,
//! immediates, `[label]`, `[label+n]` and `[n]`; branch and jump targets
//! are bare labels or absolute addresses.

use super::*;
use crate::ast::Pos;
use crate::context::CompileCtx;
use crate::diag::CodegenResult;

#[derive(Clone, Debug, PartialEq)]
enum Operand {
    Reg(u8),
    Imm(i64),
    /// `[label+offs]` or `[addr]`.
    Mem {
        label: Option<String>,
        offs: i64,
    },
    /// Bare label (branch targets).
    Ident(String),
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn parse_number(text: &str) -> Option<i64> {
    if let Some(hex) = text.strip_prefix("0x").or(text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else if text.starts_with('0') && text.len() > 1 {
        i64::from_str_radix(&text[1..], 8).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_operand(text: &str) -> Result<Operand, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty operand".into());
    }
    if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        let inner = inner.trim();
        let (name, offs) = match inner.split_once('+') {
            Some((name, offs)) => {
                let offs =
                    parse_number(offs.trim()).ok_or_else(|| format!("bad offset '{offs}'"))?;
                (name.trim(), offs)
            }
            None => (inner, 0),
        };
        if let Some(addr) = parse_number(name) {
            return Ok(Operand::Mem {
                label: None,
                offs: addr + offs,
            });
        }
        if name.chars().all(is_label_char) && !name.is_empty() {
            return Ok(Operand::Mem {
                label: Some(name.to_string()),
                offs,
            });
        }
        return Err(format!("bad memory operand '[{inner}]'"));
    }
    match text.to_ascii_uppercase().as_str() {
        "A" => return Ok(Operand::Reg(REG_A)),
        "X" => return Ok(Operand::Reg(REG_X)),
        "Y" => return Ok(Operand::Reg(REG_Y)),
        _ => {}
    }
    if let Some(value) = parse_number(text) {
        return Ok(Operand::Imm(value));
    }
    if text.chars().all(is_label_char) {
        return Ok(Operand::Ident(text.to_string()));
    }
    Err(format!("bad operand '{text}'"))
}

struct Line<'a> {
    backend: &'a Gr8Backend,
}

impl<'a> Line<'a> {
    fn mem_ref(&self, ctx: &mut CompileCtx, label: &Option<String>, offs: i64, pie: bool) {
        match label {
            Some(label) => {
                let mode = if pie {
                    self.backend.ref_mode()
                } else {
                    crate::asm::LabelRefMode::AbsPtr
                };
                ctx.asm.write_label_ref(label, offs, mode);
            }
            None => ctx.asm.write_address(offs as Word),
        }
    }

    fn mov(
        &self,
        ctx: &mut CompileCtx,
        dst: &Operand,
        src: &Operand,
    ) -> Result<(), String> {
        let backend = self.backend;
        match (dst, src) {
            (Operand::Reg(d), Operand::Reg(s)) => {
                backend.reg_to_reg(ctx, *d, *s);
                Ok(())
            }
            (Operand::Reg(d), Operand::Imm(v)) => {
                ctx.asm.write_memword((OFFS_MOV_RI + d) as Word);
                ctx.asm.write_memword(*v as Word);
                Ok(())
            }
            (Operand::Reg(d), Operand::Mem { label, offs }) => {
                ctx.asm.write_memword(
                    (OFFS_MOVLD + OFFS_MOVM_RM + d + backend.pie_bit()) as Word,
                );
                self.mem_ref(ctx, label, *offs, true);
                Ok(())
            }
            (Operand::Mem { label, offs }, Operand::Reg(s)) => {
                ctx.asm.write_memword(
                    (OFFS_MOVST + OFFS_MOVM_RM + s + backend.pie_bit()) as Word,
                );
                self.mem_ref(ctx, label, *offs, true);
                Ok(())
            }
            _ => Err("unsupported MOV operand combination".into()),
        }
    }

    fn math(
        &self,
        ctx: &mut CompileCtx,
        base: u8,
        is_bitwise: bool,
        carry: bool,
        dst: &Operand,
        src: &Operand,
    ) -> Result<(), String> {
        let backend = self.backend;
        if !matches!(dst, Operand::Reg(REG_A)) {
            return Err("math instructions operate on A".into());
        }
        let cc = if carry {
            if is_bitwise {
                return Err("bitwise instructions have no carry variant".into());
            }
            OFFS_CALC_CC
        } else {
            0
        };
        match src {
            Operand::Imm(v) => {
                let offs = if is_bitwise { OFFS_BIT_AV } else { OFFS_CALC_AV };
                ctx.asm.write_memword((base + offs + cc) as Word);
                ctx.asm.write_memword(*v as Word);
                Ok(())
            }
            Operand::Mem { label, offs } => {
                let pat = if is_bitwise { OFFS_BIT_AM } else { OFFS_CALC_AM };
                ctx.asm
                    .write_memword((base + pat + cc + backend.pie_bit()) as Word);
                self.mem_ref(ctx, label, *offs, true);
                Ok(())
            }
            _ => Err("expected an immediate or memory source".into()),
        }
    }

    fn count(
        &self,
        ctx: &mut CompileCtx,
        reg_insn: u8,
        mem_insn: u8,
        op: &Operand,
    ) -> Result<(), String> {
        match op {
            Operand::Reg(REG_A) => {
                ctx.asm.write_memword(reg_insn as Word);
                Ok(())
            }
            Operand::Mem { label, offs } => {
                ctx.asm
                    .write_memword((mem_insn + self.backend.pie_bit()) as Word);
                self.mem_ref(ctx, label, *offs, true);
                Ok(())
            }
            _ => Err("expected A or a memory operand".into()),
        }
    }

    fn branch(&self, ctx: &mut CompileCtx, opcode: u8, target: &Operand) -> Result<(), String> {
        match target {
            Operand::Ident(label) => {
                self.backend.branch_insn(ctx, opcode, label);
                Ok(())
            }
            Operand::Imm(addr) => {
                ctx.asm.write_memword(opcode as Word);
                ctx.asm.write_address(*addr as Word);
                Ok(())
            }
            _ => Err("expected a label or address".into()),
        }
    }
}

/// Assemble one line of gr8 assembly and emit its bytes.
pub(super) fn asm_line(
    backend: &Gr8Backend,
    ctx: &mut CompileCtx,
    line: &str,
    pos: Pos,
) -> CodegenResult<()> {
    let text = match line.split("//").next() {
        Some(text) => text.trim(),
        None => return Ok(()),
    };
    if text.is_empty() {
        return Ok(());
    }
    if let Some(name) = text.strip_suffix(':') {
        if !name.is_empty() && name.chars().all(is_label_char) {
            ctx.asm.write_label(name);
            return Ok(());
        }
    }

    let (mnemonic, rest) = match text.split_once(char::is_whitespace) {
        Some((m, rest)) => (m, rest.trim()),
        None => (text, ""),
    };
    let operands: Vec<Operand> = if rest.is_empty() {
        Vec::new()
    } else {
        match rest.split(',').map(parse_operand).collect() {
            Ok(ops) => ops,
            Err(msg) => {
                ctx.diag.error(pos, msg);
                return Ok(());
            }
        }
    };

    let helper = Line { backend };
    let expect = |n: usize| -> Result<(), String> {
        if operands.len() == n {
            Ok(())
        } else {
            Err(format!("expected {n} operand(s), got {}", operands.len()))
        }
    };
    let result: Result<(), String> = (|| {
        let upper = mnemonic.to_ascii_uppercase();
        match upper.as_str() {
            "MOV" => {
                expect(2)?;
                helper.mov(ctx, &operands[0], &operands[1])
            }
            "ADD" | "ADDC" | "SUB" | "SUBC" | "CMP" | "CMPC" => {
                expect(2)?;
                let base = match &upper[..3] {
                    "ADD" => OFFS_ADD,
                    "SUB" => OFFS_SUB,
                    _ => OFFS_CMP,
                };
                helper.math(ctx, base, false, upper.ends_with('C') && upper.len() == 4, &operands[0], &operands[1])
            }
            "AND" | "OR" | "XOR" => {
                expect(2)?;
                let base = match upper.as_str() {
                    "AND" => OFFS_AND,
                    "OR" => OFFS_OR,
                    _ => OFFS_XOR,
                };
                helper.math(ctx, base, true, false, &operands[0], &operands[1])
            }
            "INC" | "INCC" | "DEC" | "DECC" => {
                expect(1)?;
                let (reg, mem) = match upper.as_str() {
                    "INC" => (INSN_INC_A, INSN_INC_M),
                    "INCC" => (INSN_INCC_A, INSN_INCC_M),
                    "DEC" => (INSN_DEC_A, INSN_DEC_M),
                    _ => (INSN_DECC_A, INSN_DECC_M),
                };
                helper.count(ctx, reg, mem, &operands[0])
            }
            "SHL" | "SHLC" | "SHR" | "SHRC" => {
                expect(1)?;
                let dir = if upper.starts_with("SHL") {
                    OFFS_SHM_L
                } else {
                    OFFS_SHM_R
                };
                let cc = if upper.ends_with('C') && upper.len() == 4 {
                    OFFS_SHM_CC
                } else {
                    0
                };
                match &operands[0] {
                    Operand::Mem { label, offs } => {
                        ctx.asm.write_memword(
                            (OFFS_SHM + dir + cc + backend.pie_bit()) as Word,
                        );
                        helper.mem_ref(ctx, label, *offs, true);
                        Ok(())
                    }
                    _ => Err("shifts operate on memory".into()),
                }
            }
            "JMP" => {
                expect(1)?;
                helper.branch(ctx, INSN_JMP | backend.pie_bit(), &operands[0])
            }
            "BEQ" | "BNE" | "BGT" | "BLE" | "BLT" | "BGE" | "BCS" | "BCC" => {
                expect(1)?;
                let opcode = match upper.as_str() {
                    "BEQ" => INSN_BEQ,
                    "BNE" => INSN_BNE,
                    "BGT" => INSN_BGT,
                    "BLE" => INSN_BLE,
                    "BLT" => INSN_BLT,
                    "BGE" => INSN_BGE,
                    "BCS" => INSN_BCS,
                    _ => INSN_BCC,
                };
                helper.branch(ctx, opcode | backend.pie_bit(), &operands[0])
            }
            "CALL" => {
                expect(1)?;
                helper.branch(ctx, INSN_CALL | backend.pie_bit(), &operands[0])
            }
            "RET" => {
                expect(0)?;
                ctx.asm.write_memword(INSN_RET as Word);
                Ok(())
            }
            "RTI" => {
                expect(0)?;
                ctx.asm.write_memword(INSN_RTI as Word);
                Ok(())
            }
            _ => Err(format!("no instruction with name '{mnemonic}'")),
        }
    })();
    if let Err(msg) = result {
        ctx.diag.error(pos, msg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operands() {
        assert_eq!(parse_operand("A").unwrap(), Operand::Reg(REG_A));
        assert_eq!(parse_operand("0x42").unwrap(), Operand::Imm(0x42));
        assert_eq!(
            parse_operand("[buf+2]").unwrap(),
            Operand::Mem {
                label: Some("buf".into()),
                offs: 2
            }
        );
        assert_eq!(
            parse_operand("[0xfff6]").unwrap(),
            Operand::Mem {
                label: None,
                offs: 0xfff6
            }
        );
        assert_eq!(
            parse_operand("loop").unwrap(),
            Operand::Ident("loop".into())
        );
    }
}
