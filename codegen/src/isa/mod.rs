//! Instruction set architectures.
//!
//! The `isa` module provides the [`TargetIsa`] trait: the capability set the
//! ISA-independent lowering code depends on. The sub-modules provide the
//! supported instruction sets; each has its own implementation of
//! `TargetIsa` plus its own inline-assembly tokeniser and mnemonic table.
//!
//! A target is selected by name through [`lookup`], which returns a
//! [`Builder`]. Machine-specific options (the `-m...` command-line options)
//! are applied to the builder with string keys before [`Builder::finish`]
//! produces the configured trait object:
//!
//! ```ignore
//! let mut builder = isa::lookup("px16")?;
//! builder.set_machine_opt("entrypoint=main")?;
//! let isa = builder.finish(Flags::default())?;
//! ```

use crate::ast::{Expr, FuncDef, FuncSig, Pos};
use crate::context::CompileCtx;
use crate::diag::CodegenResult;
use crate::iasm::Constraint;
use crate::loc::Loc;
use crate::types::Type;
use crate::CodeOffset;
use smallvec::SmallVec;

#[cfg(feature = "gr8")]
pub mod gr8;
#[cfg(feature = "px16")]
pub mod px16;

/// Static configuration of a target machine.
#[derive(Clone, Copy, Debug)]
pub struct TargetConfig {
    /// Architecture identifier, e.g. `"px16"`.
    pub name: &'static str,
    /// CPU word size in bits; usually the size of `int`.
    pub word_bits: u32,
    /// Size of the smallest addressable memory word in bits. All type
    /// sizes and addresses are counted in these.
    pub mem_bits: u32,
    /// Size of a memory address in bits.
    pub addr_bits: u32,
    /// Integer type sizes in bits.
    pub char_bits: u32,
    pub short_bits: u32,
    pub int_bits: u32,
    pub long_bits: u32,
    pub long_long_bits: u32,
    /// Floating-point type sizes in bits (storage only; no target currently
    /// has native floats).
    pub float_bits: u32,
    pub double_bits: u32,
    pub long_double_bits: u32,
    /// Byte order of multi-word values in memory.
    pub big_endian: bool,
    /// Whether plain `char` is signed.
    pub char_signed: bool,
    /// Number of general-purpose register units.
    pub reg_count: u8,
    /// Names of all registers, indexed by register number.
    pub reg_names: &'static [&'static str],
    /// Whether anonymous temporaries live in the stack frame (machines
    /// with SP-relative addressing) or in static memory.
    pub stack_temps: bool,
}

impl TargetConfig {
    /// Bytes per memory word in the output file.
    pub fn memw_bytes(&self) -> u32 {
        (self.mem_bits + 7) / 8
    }

    /// Memory words per address.
    pub fn addr_words(&self) -> CodeOffset {
        (self.addr_bits + self.mem_bits - 1) / self.mem_bits
    }

    /// Memory words per CPU word.
    pub fn word_words(&self) -> CodeOffset {
        (self.word_bits + self.mem_bits - 1) / self.mem_bits
    }

    /// Encode the low memory word of `value` as output bytes, respecting
    /// the target byte order.
    pub fn memword_bytes(&self, value: u64) -> SmallVec<[u8; 2]> {
        let n = self.memw_bytes();
        let mut out = SmallVec::new();
        for i in 0..n {
            let shift = if self.big_endian { (n - 1 - i) * 8 } else { i * 8 };
            out.push((value >> shift) as u8);
        }
        out
    }

    /// Mask for one memory word.
    pub fn memw_mask(&self) -> u64 {
        if self.mem_bits >= 64 {
            u64::MAX
        } else {
            (1 << self.mem_bits) - 1
        }
    }

    /// The name of a register.
    pub fn reg_name(&self, reg: u8) -> &'static str {
        self.reg_names.get(reg as usize).copied().unwrap_or("?")
    }
}

/// Shared, machine-independent code generation flags (the `-f` options).
#[derive(Clone, Copy, Debug)]
pub struct Flags {
    /// Produce a position-independent executable: PC-relative label
    /// references and addressing modes.
    pub pie: bool,
    /// Produce position-independent code for a shared object.
    pub pic: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            pie: true,
            pic: false,
        }
    }
}

impl Flags {
    /// Apply one `-f` flag by name. Returns false for unrecognised names.
    pub fn set(&mut self, flag: &str) -> bool {
        match flag {
            "pie" | "PIE" => self.pie = true,
            "no-pie" | "no-PIE" => self.pie = false,
            "pic" | "PIC" => self.pic = true,
            "no-pic" | "no-PIC" => self.pic = false,
            _ => return false,
        }
        true
    }
}

/// Error produced when setting a machine option on a [`Builder`].
#[derive(Debug, thiserror::Error)]
pub enum SetError {
    #[error("unknown option '-m{0}'")]
    UnknownOption(String),
    #[error("option '-m{0}' requires '={1}'")]
    MissingValue(String, &'static str),
}

/// Error produced by [`lookup`] for an unknown architecture.
#[derive(Debug, thiserror::Error)]
#[error("unsupported target architecture '{0}'")]
pub struct LookupError(pub String);

/// Target-specific half of the builder.
pub trait TargetBuilder {
    /// Apply one `-m` machine option, e.g. `entrypoint=start`.
    fn set_machine_opt(&mut self, opt: &str) -> Result<(), SetError>;
    /// Consume the builder and produce the configured backend.
    fn finish(self: Box<Self>, flags: Flags) -> CodegenResult<Box<dyn TargetIsa>>;
}

/// Builder for a target backend.
pub struct Builder(Box<dyn TargetBuilder>);

impl Builder {
    /// Apply one `-m` machine option.
    pub fn set_machine_opt(&mut self, opt: &str) -> Result<(), SetError> {
        self.0.set_machine_opt(opt)
    }

    /// Produce the configured backend.
    pub fn finish(self, flags: Flags) -> CodegenResult<Box<dyn TargetIsa>> {
        self.0.finish(flags)
    }
}

/// Look up a target by architecture name.
pub fn lookup(name: &str) -> Result<Builder, LookupError> {
    match name {
        #[cfg(feature = "px16")]
        "px16" | "pixie-16" => Ok(Builder(Box::new(px16::Px16Builder::default()))),
        #[cfg(feature = "gr8")]
        "gr8" | "gr8cpu-r3" => Ok(Builder(Box::new(gr8::Gr8Builder::default()))),
        _ => Err(LookupError(name.to_string())),
    }
}

/// The capability set each target provides to the lowering walker.
///
/// The walker in [`crate::lower`] depends only on these operations and on
/// the label/section API of [`crate::asm`]; everything
/// architecture-specific (addressing-mode selection, instruction encoding,
/// calling conventions, branch emission, the inline-assembly mini-
/// assembler) lives behind this trait.
pub trait TargetIsa {
    /// The architecture name.
    fn name(&self) -> &'static str;

    /// The static machine configuration.
    fn config(&self) -> &TargetConfig;

    /// The shared code generation flags.
    fn flags(&self) -> &Flags;

    /// Emit the function label and entry sequence: select the calling
    /// convention, bind every parameter's location, push callee-saved
    /// registers and establish the base stack size.
    fn emit_function_entry(&self, ctx: &mut CompileCtx, func: &FuncDef) -> CodegenResult<()>;

    /// Emit a return: coerce and move `retval` into the ABI-mandated
    /// register(s), unwind the stack, restore saved registers, and issue
    /// the (interrupt-) return.
    fn emit_return(&self, ctx: &mut CompileCtx, retval: Option<Loc>) -> CodegenResult<()>;

    /// Emit a call to `sig`. The callee expression is evaluated first so
    /// it doesn't contend with argument registers; arguments are evaluated
    /// with per-argument output hints.
    fn emit_call(
        &self,
        ctx: &mut CompileCtx,
        sig: &FuncSig,
        callee: &Expr,
        args: &[Expr],
    ) -> CodegenResult<Loc>;

    /// Emit a unary operation.
    fn emit_math1(
        &self,
        ctx: &mut CompileCtx,
        op: crate::ast::Oper,
        hint: Option<Loc>,
        a: Loc,
        pos: Pos,
    ) -> CodegenResult<Loc>;

    /// Emit a binary operation.
    fn emit_math2(
        &self,
        ctx: &mut CompileCtx,
        op: crate::ast::Oper,
        hint: Option<Loc>,
        a: Loc,
        b: Loc,
        pos: Pos,
    ) -> CodegenResult<Loc>;

    /// Move a value between locations, word by word. Elided entirely when
    /// the locations are structurally equivalent.
    fn emit_mov(&self, ctx: &mut CompileCtx, dst: Loc, src: Loc) -> CodegenResult<()>;

    /// Convert a value to another type, in place when possible.
    fn emit_cast(&self, ctx: &mut CompileCtx, a: Loc, ty: Type) -> CodegenResult<Loc>;

    /// Emit a conditional branch on `cond`. Either label may be `None` for
    /// fallthrough.
    fn emit_branch(
        &self,
        ctx: &mut CompileCtx,
        cond: Loc,
        l_true: Option<&str>,
        l_false: Option<&str>,
    ) -> CodegenResult<()>;

    /// Emit an unconditional jump.
    fn emit_jump(&self, ctx: &mut CompileCtx, label: &str) -> CodegenResult<()>;

    /// Reconcile the hardware stack pointer with the compiler's logical
    /// stack size. Must be called before any instruction whose semantics
    /// depend on the stack pointer, before calls, and before returns.
    fn memclobber(&self, ctx: &mut CompileCtx, stack_dirty: bool) -> CodegenResult<()>;

    /// Render an inline-assembly operand for template substitution, first
    /// moving it into a location class the constraint allows.
    fn iasm_operand(
        &self,
        ctx: &mut CompileCtx,
        loc: Loc,
        constraint: &Constraint,
    ) -> CodegenResult<String>;

    /// Assemble one line of target assembly and emit its chunks.
    fn asm_line(&self, ctx: &mut CompileCtx, line: &str, pos: Pos) -> CodegenResult<()>;

    /// Called once before layout, after all functions are generated; emits
    /// target-specific sections such as the entrypoint vector table.
    fn begin_output(&self, _ctx: &mut CompileCtx) -> CodegenResult<()> {
        Ok(())
    }

    /// Called after layout; verifies target-specific address constraints.
    fn check_output(&self, _ctx: &CompileCtx, _layout: &crate::asm::output::Layout) {}
}

/// A plain 16-bit little-endian configuration for unit tests.
#[cfg(test)]
pub fn test_config() -> TargetConfig {
    TargetConfig {
        name: "test",
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
        reg_count: 4,
        reg_names: &["R0", "R1", "R2", "R3", "ST", "PF", "PC", "imm"],
        stack_temps: true,
    }
}
