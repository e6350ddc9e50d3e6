//! The addr2line mode: translate addresses back to source lines using the
//! sidecar written by `--linenumbers`.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;

/// lily-cc addr2line mode.
#[derive(Parser)]
#[command(name = "lily-addr2line", disable_version_flag = true)]
pub struct Addr2lineOptions {
    /// Show the version.
    #[arg(short = 'V', long = "version")]
    version: bool,

    /// The file to use for linenumber information.
    #[arg(short = 'e', long = "exe", value_name = "file", default_value = "a.out")]
    exe: PathBuf,

    /// Hexadecimal addresses to interpret.
    addresses: Vec<String>,
}

/// One `pos` record of the sidecar.
#[derive(Debug, Clone)]
struct PosRecord {
    rel_path: String,
    addr: u64,
    line: u32,
}

/// One `sect` record of the sidecar.
#[derive(Debug, Clone)]
struct SectRecord {
    addr: u64,
    size: u64,
}

/// Linenumber information parsed back from a sidecar file.
#[derive(Debug, Default)]
pub struct LineInfo {
    sections: Vec<SectRecord>,
    positions: Vec<PosRecord>,
}

/// Split a sidecar line into fields, honouring backslash escapes in paths.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    cur.push(next);
                }
            }
            ' ' | '\t' => {
                if !cur.is_empty() {
                    fields.push(core::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        fields.push(cur);
    }
    fields
}

impl LineInfo {
    /// Parse the sidecar text. Unknown record types are skipped.
    pub fn parse(text: &str) -> Self {
        let mut info = LineInfo::default();
        for line in text.lines() {
            let fields = split_fields(line);
            match fields.first().map(String::as_str) {
                Some("sect") if fields.len() >= 4 => {
                    let addr = u64::from_str_radix(&fields[2], 16);
                    let size = u64::from_str_radix(&fields[3], 16);
                    if let (Ok(addr), Ok(size)) = (addr, size) {
                        info.sections.push(SectRecord { addr, size });
                    }
                }
                Some("pos") if fields.len() >= 6 => {
                    // pos abs-path rel-path address x0,y0 x1,y1
                    let addr = u64::from_str_radix(&fields[3], 16);
                    let line = fields[4]
                        .split_once(',')
                        .and_then(|(_, y)| y.parse::<u32>().ok());
                    if let (Ok(addr), Some(line)) = (addr, line) {
                        info.positions.push(PosRecord {
                            rel_path: fields[2].clone(),
                            addr,
                            line,
                        });
                    }
                }
                _ => {}
            }
        }
        info.positions.sort_by_key(|pos| pos.addr);
        info
    }

    /// Whether parsing found anything usable at all.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty() && self.positions.is_empty()
    }

    /// Report the source line for an address: `rel_path:line` or `??:0`.
    pub fn lookup(&self, addr: u64) -> String {
        // Outside every known section, assume an unknown address.
        let in_section = self
            .sections
            .iter()
            .any(|sect| addr >= sect.addr && addr < sect.addr + sect.size);
        if !in_section {
            return "??:0".to_string();
        }
        // The first recorded position at or after the address.
        let index = self.positions.partition_point(|pos| pos.addr < addr);
        match self.positions.get(index) {
            Some(pos) => format!("{}:{}", pos.rel_path, pos.line),
            None => "??:0".to_string(),
        }
    }
}

/// Run the addr2line mode; returns the process exit code.
pub fn run(args: &[String]) -> Result<i32> {
    let options = Addr2lineOptions::parse_from(args);
    if options.version {
        println!("lily-addr2line {}", lilycc_codegen::VERSION);
    }

    let text = fs::read_to_string(&options.exe)
        .with_context(|| format!("cannot open {}", options.exe.display()))?;
    let info = LineInfo::parse(&text);
    if info.is_empty() {
        println!("{}: Cannot read linenumber information", options.exe.display());
        return Ok(1);
    }

    for raw in &options.addresses {
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        match u64::from_str_radix(digits, 16) {
            Ok(addr) => println!("{}", info.lookup(addr)),
            Err(_) => {
                eprintln!("Error: Not a hexadecimal number: '{raw}'.");
                return Ok(1);
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIDECAR: &str = "\
sect .text 0 10 1
label main 0
pos /src/t.c t.c 0 1,1 9,1
pos /src/t.c t.c 4 1,2 9,2
pos /src/t.c t.c 8 1,3 9,3
";

    #[test]
    fn lookup_finds_following_position() {
        let info = LineInfo::parse(SIDECAR);
        assert_eq!(info.lookup(0), "t.c:1");
        assert_eq!(info.lookup(3), "t.c:2");
        assert_eq!(info.lookup(4), "t.c:2");
        assert_eq!(info.lookup(7), "t.c:3");
    }

    #[test]
    fn outside_sections_is_unknown() {
        let info = LineInfo::parse(SIDECAR);
        assert_eq!(info.lookup(0x100), "??:0");
    }

    #[test]
    fn escaped_paths() {
        let fields = split_fields(r"pos /tmp/my\ dir/t.c t.c 0 1,1 2,1");
        assert_eq!(fields[1], "/tmp/my dir/t.c");
    }
}
