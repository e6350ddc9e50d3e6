//! The two-pass linker half of the assembler.
//!
//! Pass 1 ([`layout`]) walks the sections in output order, aligns each,
//! records its start address and fills the label table. Pass 2 ([`emit`])
//! walks them again and produces the flat binary, resolving every label
//! reference. The optional third pass ([`write_sidecar`]) dumps section,
//! label and source-position records to the line-number sidecar consumed by
//! the addr2line mode.

use super::{Assembler, Chunk, LabelRefMode};
use crate::ast::Pos;
use crate::diag::{CodegenError, CodegenResult};
use crate::CodeOffset;
use rustc_hash::FxHashMap;
use std::io::{self, Write};

/// A resolved label: its address and the section that defined it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelDef {
    pub address: CodeOffset,
    pub section: String,
}

/// The result of the layout pass.
#[derive(Debug, Default)]
pub struct Layout {
    /// Every label defined anywhere in the unit.
    pub labels: FxHashMap<String, LabelDef>,
    /// `(name, start, size)` for every section, in output order.
    pub sections: Vec<(String, CodeOffset, CodeOffset)>,
}

impl Layout {
    /// Address of a label, if defined.
    pub fn address_of(&self, label: &str) -> Option<CodeOffset> {
        self.labels.get(label).map(|def| def.address)
    }
}

/// The fixed output order: entrypoint table first, then code, then data,
/// then anything target-specific in creation order.
pub fn section_order(asm: &Assembler) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    for name in [".entrypoints", ".text", ".rodata", ".data", ".bss"] {
        if asm.section(name).is_some() {
            order.push(name.to_string());
        }
    }
    for name in asm.section_names() {
        if !order.iter().any(|n| n == name) {
            order.push(name.clone());
        }
    }
    order
}

/// Pass 1: assign section start addresses and resolve label addresses.
///
/// Duplicate labels are a hard error.
pub fn layout(asm: &mut Assembler) -> CodegenResult<Layout> {
    let order = section_order(asm);
    let cfg = *asm.config();
    let mut out = Layout::default();
    let mut pc: CodeOffset = 0;

    for name in &order {
        // Fix alignment.
        let align = asm.section(name).expect("section exists").align;
        if align > 1 {
            let error = pc % align;
            if error != 0 {
                pc += align - error;
            }
        }
        asm.section_mut(name).offset = pc;
        log::debug!("section {name} at {pc:#06x} (align {align})");

        let sect = asm.section(name).expect("section exists");
        for chunk in sect.chunks() {
            match chunk {
                Chunk::Data(bytes) => pc += (bytes.len() / cfg.memw_bytes() as usize) as CodeOffset,
                Chunk::Zero(n) => pc += n,
                Chunk::LabelRef { mode, .. } => pc += mode.width_words(&cfg),
                Chunk::Label(label) => {
                    let def = LabelDef {
                        address: pc,
                        section: name.clone(),
                    };
                    if out.labels.insert(label.to_string(), def).is_some() {
                        return Err(CodegenError::DuplicateLabel(label.to_string()));
                    }
                    log::trace!("{label} = {pc:#06x}");
                }
                Chunk::SrcPos(_) => {}
            }
        }

        let start = asm.section(name).expect("section exists").offset;
        out.sections.push((name.clone(), start, pc - start));
    }
    Ok(out)
}

/// Resolve one label reference to the value to encode at address `pc`.
///
/// A PC-relative reference is relative to the address immediately *after*
/// the reference slot.
fn resolve(
    asm: &Assembler,
    layout: &Layout,
    name: &str,
    addend: i64,
    mode: LabelRefMode,
    pc: CodeOffset,
) -> CodegenResult<u64> {
    let def = layout
        .labels
        .get(name)
        .ok_or_else(|| CodegenError::UndefinedLabel(name.to_string()))?;
    let cfg = asm.config();
    let mut value = def.address as i64 + addend;
    if mode.is_relative() {
        value -= (pc + mode.width_words(cfg)) as i64;
    }
    let value = value as u64;
    Ok(match mode {
        LabelRefMode::AbsWordHigh => value >> cfg.mem_bits,
        _ => value,
    })
}

/// Pass 2: produce the flat binary.
///
/// The output stream is padded with zero bytes up to each section's start
/// address; an undefined label is a hard error, as is a section whose
/// recorded start lies below the bytes already emitted.
pub fn emit(asm: &Assembler, layout: &Layout) -> CodegenResult<Vec<u8>> {
    let cfg = asm.config();
    let memw = cfg.memw_bytes() as usize;
    let mut out: Vec<u8> = Vec::new();
    let mut pc: CodeOffset;

    for (name, start, _) in &layout.sections {
        if out.len() > *start as usize * memw {
            return Err(CodegenError::SectionCollision(name.clone()));
        }
        out.resize(*start as usize * memw, 0);
        pc = *start;

        for chunk in asm.section(name).expect("section exists").chunks() {
            match chunk {
                Chunk::Data(bytes) => {
                    out.extend_from_slice(bytes);
                    pc += (bytes.len() / memw) as CodeOffset;
                }
                Chunk::Zero(n) => {
                    out.resize(out.len() + n as usize * memw, 0);
                    pc += n;
                }
                Chunk::LabelRef { mode, addend, name } => {
                    let value = resolve(asm, layout, name, addend, mode, pc)?;
                    let words = mode.width_words(cfg);
                    for i in 0..words {
                        let idx = if cfg.big_endian { words - 1 - i } else { i };
                        out.extend_from_slice(&cfg.memword_bytes(value >> (idx * cfg.mem_bits)));
                    }
                    pc += words;
                }
                Chunk::Label(_) | Chunk::SrcPos(_) => {}
            }
        }
    }
    Ok(out)
}

/// Escape whitespace and backslashes in a sidecar path field.
fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == ' ' || c == '\t' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Pass 3: dump `sect`, `label` and `pos` records for the addr2line mode.
pub fn write_sidecar<W: Write>(
    asm: &Assembler,
    layout: &Layout,
    w: &mut W,
    abs_path: &str,
    rel_path: &str,
) -> io::Result<()> {
    let cfg = asm.config();
    for (name, start, size) in &layout.sections {
        let align = asm.section(name).expect("section exists").align;
        writeln!(w, "sect {} {:x} {:x} {:x}", escape_path(name), start, size, align)?;
    }
    let mut labels: Vec<(&String, &LabelDef)> = layout.labels.iter().collect();
    labels.sort_by_key(|(_, def)| def.address);
    for (name, def) in labels {
        writeln!(w, "label {} {:x}", escape_path(name), def.address)?;
    }
    for (name, start, _) in &layout.sections {
        let mut pc = *start;
        let mut pending: Option<Pos> = None;
        for chunk in asm.section(name).expect("section exists").chunks() {
            match chunk {
                Chunk::SrcPos(pos) => pending = Some(pos),
                Chunk::Data(bytes) => {
                    if let Some(pos) = pending.take() {
                        writeln!(
                            w,
                            "pos {} {} {:x} {},{} {},{}",
                            escape_path(abs_path),
                            escape_path(rel_path),
                            pc,
                            pos.x0,
                            pos.y0,
                            pos.x1,
                            pos.y1
                        )?;
                    }
                    pc += (bytes.len() / cfg.memw_bytes() as usize) as CodeOffset;
                }
                Chunk::Zero(n) => pc += n,
                Chunk::LabelRef { mode, .. } => pc += mode.width_words(cfg),
                Chunk::Label(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Assembler;
    use crate::isa::test_config;

    #[test]
    fn two_pass_resolution() {
        let mut asm = Assembler::new(test_config());
        asm.write_label("a");
        asm.write_memword(0x1111);
        asm.write_label("b");
        asm.write_label_ref("a", 0, LabelRefMode::AbsPtr);

        let layout = layout(&mut asm).unwrap();
        assert_eq!(layout.address_of("a"), Some(0));
        assert_eq!(layout.address_of("b"), Some(1));

        let bytes = emit(&asm, &layout).unwrap();
        // Word 0: 0x1111, word 1: absolute address of "a" = 0.
        assert_eq!(bytes, [0x11, 0x11, 0x00, 0x00]);
    }

    #[test]
    fn pc_relative_is_after_slot() {
        let mut asm = Assembler::new(test_config());
        asm.write_label("top");
        asm.write_memword(0xaaaa);
        asm.write_label_ref("top", 0, LabelRefMode::OffsPtr);
        asm.write_memword(0xbbbb);

        let layout = layout(&mut asm).unwrap();
        let bytes = emit(&asm, &layout).unwrap();
        // The reference sits at word 1; the address after the slot is 2, so
        // the encoded offset to "top" (word 0) is -2.
        let offs = i16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(offs, -2);
    }

    #[test]
    fn duplicate_label_is_hard_error() {
        let mut asm = Assembler::new(test_config());
        asm.write_label("x");
        asm.write_label("x");
        assert!(matches!(
            layout(&mut asm),
            Err(CodegenError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn undefined_label_is_hard_error() {
        let mut asm = Assembler::new(test_config());
        asm.write_label_ref("ghost", 0, LabelRefMode::AbsPtr);
        let layout = layout(&mut asm).unwrap();
        assert!(matches!(
            emit(&asm, &layout),
            Err(CodegenError::UndefinedLabel(_))
        ));
    }

    #[test]
    fn section_order_and_alignment() {
        let mut asm = Assembler::new(test_config());
        asm.write_memword(1);
        asm.write_memword(2);
        asm.write_memword(3);
        asm.use_sect(".data", 4);
        asm.write_label("d");
        asm.write_memword(9);
        asm.use_sect(".text", 1);

        let layout = layout(&mut asm).unwrap();
        // .text has 3 words; .data must be aligned up to 4.
        assert_eq!(layout.address_of("d"), Some(4));
        let bytes = emit(&asm, &layout).unwrap();
        // One word of zero padding between the sections.
        assert_eq!(bytes.len(), 5 * 2);
        assert_eq!(&bytes[6..8], &[0, 0]);
    }

    #[test]
    fn bss_occupies_no_bytes_until_needed() {
        let mut asm = Assembler::new(test_config());
        asm.write_memword(0x4242);
        asm.bss_label("buf", 16);
        asm.write_label("after");

        let layout = layout(&mut asm).unwrap();
        assert_eq!(layout.address_of("buf"), Some(1));
        assert_eq!(layout.address_of("after"), Some(1));
        let bytes = emit(&asm, &layout).unwrap();
        // .bss zeros are materialised in the flat binary.
        assert_eq!(bytes.len(), (1 + 16) * 2);
    }

    #[test]
    fn sidecar_records() {
        let mut asm = Assembler::new(test_config());
        asm.write_label("main");
        asm.write_srcpos(Pos {
            x0: 1,
            y0: 10,
            x1: 5,
            y1: 10,
        });
        asm.write_memword(7);
        let layout = layout(&mut asm).unwrap();
        let mut buf = Vec::new();
        write_sidecar(&asm, &layout, &mut buf, "/src/t.c", "t.c").unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("sect .text 0 1 1"));
        assert!(text.contains("label main 0"));
        assert!(text.contains("pos /src/t.c t.c 0 1,10 5,10"));
    }
}
