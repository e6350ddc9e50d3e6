//! Inline assembly: the machine-independent half.
//!
//! Constraint strings are parsed into capability flags, operand expressions
//! are evaluated to locations (and relocated if the location class is not
//! allowed by the constraint), `%`-references in the template are replaced
//! by the rendered operands, and the finished text is handed line by line to
//! the target's own mini-assembler.

use crate::ast::InlineAsm;
use crate::context::CompileCtx;
use crate::diag::CodegenResult;
use crate::isa::TargetIsa;
use crate::loc::Loc;
use crate::lower;

/// A parsed operand constraint.
#[derive(Clone, Debug, Default)]
pub struct Constraint {
    /// The raw constraint string, for diagnostics.
    pub raw: String,

    /* ==== simple constraints ==== */
    /// The operand may be a general register.
    pub register: bool,
    /// The operand may be any memory address the machine can use on all
    /// normal instructions that touch memory.
    pub memory: bool,
    /// A constant whose value is known at this point is allowed.
    pub known_const: bool,
    /// A constant whose value is not necessarily known yet is allowed.
    pub unknown_const: bool,

    /* ========= modifiers ======== */
    /// The operand is read.
    pub read: bool,
    /// The operand is written.
    pub write: bool,
    /// Written before the instruction finishes; may not overlap an input.
    pub early_clobber: bool,
    /// Commutative with its immediate successor.
    pub commutative_next: bool,
    /// Commutative with its immediate predecessor.
    pub commutative_prev: bool,
}

/// Decode a constraint string. Returns `Err` with a message when the
/// constraint is malformed or impossible to satisfy.
pub fn parse_constraint(raw: &str, last_operand: bool) -> Result<Constraint, String> {
    let mut c = Constraint {
        raw: raw.to_string(),
        read: true,
        ..Constraint::default()
    };
    for ch in raw.chars() {
        match ch {
            ' ' | '\t' | '\r' | '\n' => {}
            '&' => c.early_clobber = true,
            '%' => {
                if last_operand {
                    return Err("'%' constraint used with last operand".to_string());
                }
                c.commutative_next = true;
            }
            '=' => {
                // Write-only.
                c.read = false;
                c.write = true;
            }
            '+' => c.write = true,
            'r' => c.register = true,
            'm' => c.memory = true,
            'i' => {
                c.unknown_const = true;
                c.known_const = true;
            }
            's' | 'n' => c.known_const = true,
            'g' | 'X' => {
                c.register = true;
                c.memory = true;
                c.known_const = true;
                c.unknown_const = true;
            }
            _ => return Err(format!("unrecognised constraint character '{ch}'")),
        }
    }
    if !c.register && !c.memory && !c.known_const {
        return Err(format!("impossible constraint '{raw}'"));
    }
    Ok(c)
}

/// One evaluated operand: its constraint and resulting location.
struct Operand {
    symbol: Option<String>,
    constraint: Constraint,
    loc: Loc,
}

/// Expand `%`-references in the template using the evaluated operands.
///
/// `%%`, `%{`, `%|` and `%}` produce the literal character; `%0`..`%9`
/// select an operand by index (outputs first, then inputs); `%[name]`
/// selects an operand by symbolic name.
fn expand_template(
    isa: &dyn TargetIsa,
    ctx: &mut CompileCtx,
    text: &str,
    operands: &[Operand],
) -> CodegenResult<Option<String>> {
    let mut out = String::with_capacity(text.len() + 16 * operands.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            None => {
                out.push('%');
                break;
            }
            Some(next @ ('%' | '{' | '|' | '}')) => out.push(next),
            Some(digit @ '0'..='9') => {
                let index = digit as usize - '0' as usize;
                match operands.get(index) {
                    Some(op) => {
                        let rendered = isa.iasm_operand(ctx, op.loc, &op.constraint)?;
                        out.push_str(&rendered);
                    }
                    None => return Ok(None),
                }
            }
            Some('[') => {
                let name: String = chars.by_ref().take_while(|c| *c != ']').collect();
                match operands
                    .iter()
                    .find(|op| op.symbol.as_deref() == Some(name.as_str()))
                {
                    Some(op) => {
                        let rendered = isa.iasm_operand(ctx, op.loc, &op.constraint)?;
                        out.push_str(&rendered);
                    }
                    None => return Ok(None),
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
        }
    }
    Ok(Some(out))
}

/// Lower an inline-assembly statement.
///
/// Source-level constraint problems are reported as diagnostics and the
/// statement is skipped; only the target's assembler can produce hard
/// errors.
pub fn inline_asm(isa: &dyn TargetIsa, ctx: &mut CompileCtx, iasm: &InlineAsm) -> CodegenResult<()> {
    let total = iasm.outputs.len() + iasm.inputs.len();
    let mut constraints: Vec<Constraint> = Vec::with_capacity(total);

    // Process constraints: outputs first, then inputs.
    for (i, op) in iasm.outputs.iter().enumerate() {
        let last = i + 1 == total;
        let constraint = match parse_constraint(&op.constraint, last) {
            Ok(c) => c,
            Err(msg) => {
                ctx.diag.error(op.pos, msg);
                return Ok(());
            }
        };
        // Output operands must be marked as written to (even if they
        // aren't).
        if !constraint.write {
            ctx.diag.error(
                op.pos,
                format!("output operand constraint '{}' lacks '='", op.constraint),
            );
            return Ok(());
        }
        constraints.push(constraint);
    }
    for (i, op) in iasm.inputs.iter().enumerate() {
        let constraint = match parse_constraint(&op.constraint, iasm.outputs.len() + i + 1 == total)
        {
            Ok(c) => c,
            Err(msg) => {
                ctx.diag.error(op.pos, msg);
                return Ok(());
            }
        };
        // Input operands may not be written to.
        if constraint.write {
            ctx.diag.error(
                op.pos,
                format!(
                    "input operand constraint '{}' contains '{}'",
                    op.constraint,
                    if constraint.read { '+' } else { '=' }
                ),
            );
            return Ok(());
        }
        constraints.push(constraint);
    }
    // Propagate commutativity to the following operand.
    for i in 1..constraints.len() {
        if constraints[i - 1].commutative_next {
            constraints[i].commutative_prev = true;
        }
    }

    // Now evaluate the operand expressions: outputs, then inputs.
    let mut operands: Vec<Operand> = Vec::with_capacity(total);
    for (src, constraint) in iasm
        .outputs
        .iter()
        .chain(iasm.inputs.iter())
        .zip(constraints)
    {
        let loc = lower::expression(isa, ctx, &src.expr, None)?;
        operands.push(Operand {
            symbol: src.symbol.clone(),
            constraint,
            loc,
        });
    }

    ctx.mark_pos(iasm.pos);
    let text = match expand_template(isa, ctx, &iasm.text, &operands)? {
        Some(text) => text,
        None => {
            ctx.diag
                .error(iasm.pos, "reference to undefined assembly operand");
            return Ok(());
        }
    };
    log::debug!("inline asm after substitution: {text}");

    // The mini-assembler parses one instruction at a time.
    for line in text.split(['\n', ';']) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        isa.asm_line(ctx, line, iasm.pos)?;
    }
    Ok(())
}
