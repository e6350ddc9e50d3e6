//! The lily-cc command-line driver.
//!
//! Two application modes share one binary: `compile` (the default) and
//! `addr2line`. The mode is chosen with `--mode=...` as the first argument,
//! or inferred from the program name so an `addr2line` symlink does the
//! expected thing.

pub mod commands;

use anyhow::Result;

/// Dispatch on the application mode and run it.
pub fn run() -> Result<i32> {
    env_logger::init();
    let mut args: Vec<String> = std::env::args().collect();

    // Check for explicit mode switches.
    let mut mode = None;
    if args.len() >= 2 {
        if let Some(name) = args[1].strip_prefix("--mode=") {
            mode = Some(name.to_string());
            args.remove(1);
        }
    }
    // Check for mode by program name.
    let mode = match mode {
        Some(mode) => mode,
        None if args
            .first()
            .is_some_and(|arg0| arg0.ends_with("addr2line")) =>
        {
            "addr2line".to_string()
        }
        None => "compile".to_string(),
    };

    match mode.as_str() {
        "compile" => commands::compile::run(&args),
        "addr2line" => commands::addr2line::run(&args),
        other => {
            eprintln!("Error: Unknown mode '{other}'!");
            Ok(1)
        }
    }
}
