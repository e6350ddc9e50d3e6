//! The compile mode: C (and assembly) sources in, flat binary out.

use anyhow::{bail, Context, Result};
use clap::Parser;
use lilycc_codegen::asm::output;
use lilycc_codegen::ast::{FuncSig, Pos};
use lilycc_codegen::isa::{self, Flags, TargetIsa};
use lilycc_codegen::{lower, CompileCtx};
use lilycc_reader::{parse_unit, Item};
use std::fs;
use std::path::{Path, PathBuf};

/// lily-cc compile mode.
#[derive(Parser)]
#[command(name = "lily-cc", disable_version_flag = true)]
pub struct CompileOptions {
    /// Show the version.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Specify the output file path.
    #[arg(short = 'o', value_name = "file")]
    output: Option<PathBuf>,

    /// Write linenumber information to this file.
    #[arg(long = "linenumbers", value_name = "file")]
    linenumbers: Option<PathBuf>,

    /// Add a directory to the include directories.
    #[arg(short = 'I', long = "include", value_name = "dir")]
    include: Vec<PathBuf>,

    /// Machine-independent flags (pic, no-pic, pie, no-pie).
    #[arg(short = 'f', value_name = "flag")]
    flags: Vec<String>,

    /// Machine-specific options, e.g. -mentrypoint=<label>.
    #[arg(short = 'm', value_name = "option")]
    machine: Vec<String>,

    /// Target architecture.
    #[arg(long = "arch", value_name = "name", default_value = "px16")]
    arch: String,

    /// Source files; .c is compiled, .s/.asm is assembled.
    sources: Vec<PathBuf>,
}

/// Run the compile mode; returns the process exit code.
pub fn run(args: &[String]) -> Result<i32> {
    let options = CompileOptions::parse_from(args);
    if options.version {
        println!("lily-cc {} {}", options.arch, lilycc_codegen::VERSION);
        if options.sources.is_empty() {
            return Ok(0);
        }
    }
    for dir in &options.include {
        if !dir.is_dir() {
            eprintln!("Error: '{}' is not a directory", dir.display());
            return Ok(1);
        }
    }
    if options.sources.is_empty() {
        println!("No input files.");
        return Ok(1);
    }

    // Configure the target.
    let mut flags = Flags::default();
    for flag in &options.flags {
        if !flags.set(flag) {
            eprintln!("Error: Unknown option '-f{flag}'!");
            return Ok(1);
        }
    }
    let mut builder = match isa::lookup(&options.arch) {
        Ok(builder) => builder,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(1);
        }
    };
    for opt in &options.machine {
        if let Err(err) = builder.set_machine_opt(opt) {
            eprintln!("Error: {err}");
            return Ok(1);
        }
    }
    let isa = builder.finish(flags)?;

    // Compile the first of the inputs.
    let source = &options.sources[0];
    let mut ctx = compile(&*isa, source)?;

    isa.begin_output(&mut ctx)?;
    if ctx.diag.has_errors() {
        return Ok(1);
    }

    // Two passes over the chunks, then the optional sidecar dump.
    let layout = output::layout(&mut ctx.asm)?;
    isa.check_output(&ctx, &layout);
    let bytes = output::emit(&ctx.asm, &layout)?;

    let output_path = options
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("a.out"));
    fs::write(&output_path, &bytes)
        .with_context(|| format!("cannot write {}", output_path.display()))?;
    log::info!(
        "wrote {} bytes to {}",
        bytes.len(),
        output_path.display()
    );

    if let Some(path) = &options.linenumbers {
        let abs = fs::canonicalize(source).unwrap_or_else(|_| source.clone());
        let mut sidecar = Vec::new();
        output::write_sidecar(
            &ctx.asm,
            &layout,
            &mut sidecar,
            &abs.display().to_string(),
            &source.display().to_string(),
        )?;
        fs::write(path, sidecar).with_context(|| format!("cannot write {}", path.display()))?;
    }

    Ok(if ctx.diag.has_errors() { 1 } else { 0 })
}

/// Compile or assemble one source file into a fresh context.
pub fn compile(isa: &dyn TargetIsa, path: &Path) -> Result<CompileCtx> {
    let filename = path.display().to_string();
    let text = fs::read_to_string(path).with_context(|| format!("cannot open {filename}"))?;
    let mut ctx = CompileCtx::new(isa, &filename);

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("c") => compile_c(isa, &mut ctx, &text)?,
        Some("s") | Some("asm") => assemble_s(isa, &mut ctx, &text)?,
        _ => bail!("{filename}: Filetype not recognised."),
    }
    Ok(ctx)
}

/// Compile a parsed C translation unit into the context.
fn compile_c(isa: &dyn TargetIsa, ctx: &mut CompileCtx, text: &str) -> Result<()> {
    let items = match parse_unit(text, &mut ctx.types) {
        Ok(items) => items,
        Err(err) => {
            ctx.diag.error(err.pos, err.to_string());
            return Ok(());
        }
    };
    for item in items {
        match item {
            Item::Global(global) => {
                if ctx.globals.contains_key(&global.name) {
                    ctx.diag.error(
                        global.pos,
                        format!("conflicting definitions of '{}'", global.name),
                    );
                    continue;
                }
                ctx.define_global(&global);
            }
            Item::Func(mut func) => {
                if !function_added(ctx, &func) {
                    continue;
                }
                if func.body.is_some() {
                    lower::compile_function(isa, ctx, &mut func)?;
                }
            }
        }
    }
    Ok(())
}

/// Register a function's signature, checking against earlier definitions.
/// Returns false if the function conflicts and must not be generated.
fn function_added(ctx: &mut CompileCtx, func: &lilycc_codegen::ast::FuncDef) -> bool {
    let sig = FuncSig::of(func);
    if let Some(old) = ctx.functions.get(&func.name) {
        let incompatible = (old.defined && sig.defined)
            || old.params.len() != sig.params.len()
            || !ctx.types.equals(old.ret, sig.ret)
            || old
                .params
                .iter()
                .zip(&sig.params)
                .any(|(a, b)| !ctx.types.equals(a.ty, b.ty));
        if incompatible {
            let old_pos = old.pos;
            ctx.diag.error(
                func.pos,
                format!("conflicting definitions of '{}'", func.name),
            );
            ctx.diag
                .note(old_pos, format!("'{}' first defined here", func.name));
            return false;
        }
    }
    ctx.functions.insert(func.name.clone(), sig);
    true
}

/// Assemble a whole assembly source file.
fn assemble_s(isa: &dyn TargetIsa, ctx: &mut CompileCtx, text: &str) -> Result<()> {
    for (lineno, line) in text.lines().enumerate() {
        let pos = Pos {
            x0: 1,
            y0: lineno as u32 + 1,
            x1: line.len() as u32 + 1,
            y1: lineno as u32 + 1,
        };
        ctx.mark_pos(pos);
        isa.asm_line(ctx, line, pos)?;
    }
    Ok(())
}
