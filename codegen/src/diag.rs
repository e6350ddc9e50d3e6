//! Diagnostics and hard error types.
//!
//! Source-level problems (undeclared identifiers, type mismatches, use of
//! uninitialised variables, ...) are *diagnostics*: they are printed
//! immediately with a coloured severity tag and compilation continues so
//! further problems can be collected. Code emission is suppressed for a
//! function once an error fired, and the driver exits non-zero if any error
//! was seen.
//!
//! Problems that indicate the back-end itself painted itself into a corner
//! (no addressing mode for an operand combination, a label emitted twice)
//! are hard [`CodegenError`]s and abort the current compilation; "should
//! never happen" conditions are debug assertions.

use crate::ast::Pos;
use std::cell::Cell;
use std::io::Write;
use thiserror::Error;

/// How bad is it?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

const ANSI_RED_FG: &str = "\x1b[91m";
const ANSI_YELLOW_FG: &str = "\x1b[93m";
const ANSI_CYAN_FG: &str = "\x1b[96m";
const ANSI_BOLD: &str = "\x1b[1m";
const ANSI_DEFAULT: &str = "\x1b[0m";

impl Severity {
    fn tag(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Severity::Error => ANSI_RED_FG,
            Severity::Warning => ANSI_YELLOW_FG,
            Severity::Note => ANSI_CYAN_FG,
        }
    }
}

/// The diagnostics sink for one translation unit.
///
/// Diagnostics are printed as they are reported; the sink only keeps
/// counters. Interior mutability lets read-only compilation passes report
/// warnings without threading `&mut` everywhere.
pub struct Diagnostics {
    /// Name of the file being compiled, for the `file:line:col` prefix.
    pub filename: String,
    /// Whether to use ANSI colour on output.
    pub color: bool,
    errors: Cell<usize>,
    warnings: Cell<usize>,
}

impl Diagnostics {
    /// Create a sink for the given input file.
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            color: true,
            errors: Cell::new(0),
            warnings: Cell::new(0),
        }
    }

    /// Report a diagnostic at a source position.
    pub fn report(&self, severity: Severity, pos: Pos, msg: &str) {
        match severity {
            Severity::Error => self.errors.set(self.errors.get() + 1),
            Severity::Warning => self.warnings.set(self.warnings.get() + 1),
            Severity::Note => {}
        }
        let mut out = std::io::stderr().lock();
        let (color, reset, bold) = if self.color {
            (severity.color(), ANSI_DEFAULT, ANSI_BOLD)
        } else {
            ("", "", "")
        };
        let _ = if pos.y0 != 0 {
            writeln!(
                out,
                "{bold}{}:{}:{}:{reset} {color}{}:{reset} {}",
                self.filename,
                pos.y0,
                pos.x0,
                severity.tag(),
                msg
            )
        } else {
            writeln!(out, "{color}{}:{reset} {}", severity.tag(), msg)
        };
    }

    /// Report an error.
    pub fn error(&self, pos: Pos, msg: impl AsRef<str>) {
        self.report(Severity::Error, pos, msg.as_ref());
    }

    /// Report a warning.
    pub fn warning(&self, pos: Pos, msg: impl AsRef<str>) {
        self.report(Severity::Warning, pos, msg.as_ref());
    }

    /// Report a note, usually following up on an error.
    pub fn note(&self, pos: Pos, msg: impl AsRef<str>) {
        self.report(Severity::Note, pos, msg.as_ref());
    }

    /// Whether any error has been reported so far.
    pub fn has_errors(&self) -> bool {
        self.errors.get() != 0
    }

    /// Number of errors reported so far.
    pub fn error_count(&self) -> usize {
        self.errors.get()
    }

    /// Number of warnings reported so far.
    pub fn warning_count(&self) -> usize {
        self.warnings.get()
    }
}

/// A hard back-end failure.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// A label was defined more than once.
    #[error("label '{0}' defined twice")]
    DuplicateLabel(String),

    /// A chunk references a label that was never defined.
    #[error("undefined label '{0}'")]
    UndefinedLabel(String),

    /// The selector found no addressing mode for an operand combination.
    #[error("no addressing mode for {0}")]
    NoAddressingMode(&'static str),

    /// Every register is locked for the current instruction.
    #[error("all registers locked while placing operands")]
    RegistersExhausted,

    /// An inline-assembly constraint cannot be satisfied at all.
    #[error("impossible inline-assembly constraint '{0}'")]
    ImpossibleConstraint(String),

    /// Inline assembly did not parse as an instruction of this target.
    #[error("cannot assemble '{0}': {1}")]
    BadAssembly(String, String),

    /// Section layout produced overlapping or misaligned sections.
    #[error("section '{0}' collides with previously laid out code")]
    SectionCollision(String),

    /// A construct the current target cannot express.
    #[error("unsupported on this target: {0}")]
    Unsupported(&'static str),

    /// The unit had source-level errors; emission was abandoned.
    #[error("compilation failed with {0} error(s)")]
    SourceErrors(usize),
}

/// A convenient alias for a `Result` with `CodegenError`.
pub type CodegenResult<T> = Result<T, CodegenError>;
