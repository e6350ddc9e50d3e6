//! The assembly buffer: named sections holding streams of tagged chunks.
//!
//! The code generator never patches bytes after the fact. Instead every
//! section accumulates an opaque byte buffer encoding a stream of tagged
//! records: raw machine words, zero-fill reservations, label definitions and
//! unresolved label references. When the translation unit is complete the
//! linker half (see [`crate::asm::output`]) walks the chunks twice: once to
//! lay out sections and learn every label's address, once to emit bytes.
//! This keeps section contents addressable as a stream rather than as a
//! collection of patches.
//!
//! Chunk encoding (host byte order is irrelevant; the stream is private to
//! the assembler and little-endian by definition):
//!
//! | tag | payload |
//! |---|---|
//! | `DATA` | `u16` byte count, then that many raw bytes |
//! | `ZERO` | `u32` count of zero words to reserve |
//! | `LABEL` | NUL-terminated name |
//! | `LABEL_REF` | mode byte, `i64` addend, NUL-terminated name |
//! | `SRC_POS` | four `u32`s: x0, y0, x1, y1 |

pub mod output;

use crate::ast::Pos;
use crate::isa::TargetConfig;
use crate::{CodeOffset, Word};
use rustc_hash::FxHashMap;

/// Chunk tags. Arbitrary distinctive bytes, useful when eyeballing hexdumps
/// of a miscompiled buffer.
const CHUNK_DATA: u8 = 0x13;
const CHUNK_ZERO: u8 = 0x51;
const CHUNK_LABEL: u8 = 0xc4;
const CHUNK_LABEL_REF: u8 = 0x2f;
const CHUNK_SRC_POS: u8 = 0x9a;

/// How an unresolved label reference is to be encoded once resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LabelRefMode {
    /// Absolute address, pointer-sized.
    AbsPtr = 0,
    /// Offset relative to the address immediately after the reference slot,
    /// pointer-sized.
    OffsPtr = 1,
    /// Absolute address, one machine word (low word if the address is
    /// wider).
    AbsWord = 2,
    /// Absolute address, one machine word, high word.
    AbsWordHigh = 3,
    /// Offset relative to the address after the reference slot, one word.
    OffsWord = 4,
}

impl LabelRefMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LabelRefMode::AbsPtr,
            1 => LabelRefMode::OffsPtr,
            2 => LabelRefMode::AbsWord,
            3 => LabelRefMode::AbsWordHigh,
            4 => LabelRefMode::OffsWord,
            _ => panic!("corrupt chunk stream: bad label-ref mode {v}"),
        }
    }

    /// Whether the encoded value is relative to the program counter.
    pub fn is_relative(self) -> bool {
        matches!(self, LabelRefMode::OffsPtr | LabelRefMode::OffsWord)
    }

    /// Width of the reference slot in memory words.
    pub fn width_words(self, cfg: &TargetConfig) -> CodeOffset {
        match self {
            LabelRefMode::AbsPtr | LabelRefMode::OffsPtr => cfg.addr_words(),
            LabelRefMode::AbsWord | LabelRefMode::AbsWordHigh | LabelRefMode::OffsWord => 1,
        }
    }
}

/// One named section.
#[derive(Debug, Default)]
pub struct Section {
    /// The tagged chunk stream.
    chunks: Vec<u8>,
    /// Start address, assigned by layout (pass 1).
    pub offset: CodeOffset,
    /// Alignment requirement in memory words; 0 or 1 means unaligned.
    pub align: CodeOffset,
    /// Index of the byte-count field of the currently open `DATA` chunk.
    open_data: Option<usize>,
}

impl Section {
    /// Iterate over the chunks of this section.
    pub fn chunks(&self) -> ChunkIter {
        ChunkIter {
            buf: &self.chunks,
            pos: 0,
        }
    }

    fn close_data(&mut self) {
        self.open_data = None;
    }

    fn push_raw(&mut self, bytes: &[u8]) {
        // Extend the open DATA chunk, or open a fresh one.
        let at = match self.open_data {
            Some(at) if (self.chunks.len() - at - 2) + bytes.len() <= u16::MAX as usize => at,
            _ => {
                self.chunks.push(CHUNK_DATA);
                let at = self.chunks.len();
                self.chunks.extend_from_slice(&[0, 0]);
                self.open_data = Some(at);
                at
            }
        };
        self.chunks.extend_from_slice(bytes);
        let len = (self.chunks.len() - at - 2) as u16;
        self.chunks[at..at + 2].copy_from_slice(&len.to_le_bytes());
    }

    fn push_name(&mut self, name: &str) {
        debug_assert!(!name.as_bytes().contains(&0));
        self.chunks.extend_from_slice(name.as_bytes());
        self.chunks.push(0);
    }
}

/// A decoded chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Chunk<'a> {
    /// Immediately-known machine words, raw.
    Data(&'a [u8]),
    /// Reserve this many zero words.
    Zero(CodeOffset),
    /// Define a label at the current position.
    Label(&'a str),
    /// An unresolved reference.
    LabelRef {
        mode: LabelRefMode,
        addend: i64,
        name: &'a str,
    },
    /// Source-position marker for the line-number sidecar.
    SrcPos(Pos),
}

/// Iterator decoding a section's chunk stream.
pub struct ChunkIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ChunkIter<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    fn take_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take(2).try_into().unwrap())
    }

    fn take_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take(4).try_into().unwrap())
    }

    fn take_i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take(8).try_into().unwrap())
    }

    fn take_name(&mut self) -> &'a str {
        let start = self.pos;
        let end = self.buf[start..]
            .iter()
            .position(|b| *b == 0)
            .expect("corrupt chunk stream: unterminated name");
        self.pos = start + end + 1;
        core::str::from_utf8(&self.buf[start..start + end])
            .expect("corrupt chunk stream: non-UTF-8 name")
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let tag = self.buf[self.pos];
        self.pos += 1;
        Some(match tag {
            CHUNK_DATA => {
                let len = self.take_u16() as usize;
                Chunk::Data(self.take(len))
            }
            CHUNK_ZERO => Chunk::Zero(self.take_u32()),
            CHUNK_LABEL => Chunk::Label(self.take_name()),
            CHUNK_LABEL_REF => {
                let mode = LabelRefMode::from_u8(self.buf[self.pos]);
                self.pos += 1;
                let addend = self.take_i64();
                Chunk::LabelRef {
                    mode,
                    addend,
                    name: self.take_name(),
                }
            }
            CHUNK_SRC_POS => Chunk::SrcPos(Pos {
                x0: self.take_u32(),
                y0: self.take_u32(),
                x1: self.take_u32(),
                y1: self.take_u32(),
            }),
            _ => panic!("corrupt chunk stream: bad tag {tag:#04x}"),
        })
    }
}

/// The assembly buffer for one translation unit.
pub struct Assembler {
    cfg: TargetConfig,
    sections: FxHashMap<String, Section>,
    /// Section names in creation order.
    created: Vec<String>,
    current: String,
    /// Number of the next `.L<n>` label.
    labelno: u32,
}

impl Assembler {
    /// Create an empty buffer writing to `.text`.
    pub fn new(cfg: TargetConfig) -> Self {
        let mut asm = Self {
            cfg,
            sections: FxHashMap::default(),
            created: Vec::new(),
            current: String::new(),
            labelno: 0,
        };
        asm.use_sect(".text", 1);
        asm
    }

    /// The target configuration this buffer was created for.
    pub fn config(&self) -> &TargetConfig {
        &self.cfg
    }

    /// Switch to (creating if necessary) the named section.
    pub fn use_sect(&mut self, name: &str, align: CodeOffset) {
        if !self.sections.contains_key(name) {
            self.sections.insert(
                name.to_string(),
                Section {
                    align,
                    ..Section::default()
                },
            );
            self.created.push(name.to_string());
        }
        self.current = name.to_string();
    }

    /// Name of the section currently written to.
    pub fn current_sect(&self) -> &str {
        &self.current
    }

    /// Get a section by name.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    /// Section names in creation order.
    pub fn section_names(&self) -> &[String] {
        &self.created
    }

    pub(crate) fn section_mut(&mut self, name: &str) -> &mut Section {
        self.sections.get_mut(name).expect("section exists")
    }

    fn cur(&mut self) -> &mut Section {
        self.sections.get_mut(&self.current).expect("current section exists")
    }

    /// Append one machine word to the current section.
    pub fn write_memword(&mut self, word: Word) {
        let bytes = self.cfg.memword_bytes(word);
        self.cur().push_raw(&bytes);
    }

    /// Append several machine words.
    pub fn write_memwords(&mut self, words: &[Word]) {
        for w in words {
            self.write_memword(*w);
        }
    }

    /// Append an address-sized constant, low word first on little-endian
    /// targets.
    pub fn write_address(&mut self, value: Word) {
        let words = self.cfg.addr_words();
        for i in 0..words {
            let idx = if self.cfg.big_endian { words - 1 - i } else { i };
            self.write_memword(value >> (idx * self.cfg.mem_bits));
        }
    }

    /// Reserve `count` zero words.
    pub fn write_zero(&mut self, count: CodeOffset) {
        let s = self.cur();
        s.close_data();
        s.chunks.push(CHUNK_ZERO);
        s.chunks.extend_from_slice(&count.to_le_bytes());
    }

    /// Define a label at the current position.
    pub fn write_label(&mut self, name: &str) {
        log::trace!("label {name}:");
        let s = self.cur();
        s.close_data();
        s.chunks.push(CHUNK_LABEL);
        s.push_name(name);
    }

    /// Reference a label; the reference slot is `mode.width_words()` wide
    /// and is resolved on the second pass.
    pub fn write_label_ref(&mut self, name: &str, addend: i64, mode: LabelRefMode) {
        log::trace!("ref {name}{addend:+} ({mode:?})");
        let s = self.cur();
        s.close_data();
        s.chunks.push(CHUNK_LABEL_REF);
        s.chunks.push(mode as u8);
        s.chunks.extend_from_slice(&addend.to_le_bytes());
        s.push_name(name);
    }

    /// Record that the words following correspond to the given source span.
    pub fn write_srcpos(&mut self, pos: Pos) {
        let s = self.cur();
        s.close_data();
        s.chunks.push(CHUNK_SRC_POS);
        for v in [pos.x0, pos.y0, pos.x1, pos.y1] {
            s.chunks.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Create a label that will reside in `.bss`, `size` words long.
    pub fn bss_label(&mut self, name: &str, size: CodeOffset) {
        let prev = self.current.clone();
        self.use_sect(".bss", 1);
        self.write_label(name);
        self.write_zero(size);
        self.current = prev;
    }

    /// Create a label that will reside in `.data` with the given contents.
    pub fn data_label(&mut self, name: &str, words: &[Word]) {
        let prev = self.current.clone();
        self.use_sect(".data", 1);
        self.write_label(name);
        self.write_memwords(words);
        self.current = prev;
    }

    /// Create a label that will reside in `.rodata` with the given contents.
    pub fn rodata_label(&mut self, name: &str, words: &[Word]) {
        let prev = self.current.clone();
        self.use_sect(".rodata", 1);
        self.write_label(name);
        self.write_memwords(words);
        self.current = prev;
    }

    /// Hand out the next numbered local label.
    pub fn numbered_label(&mut self) -> String {
        let label = format!(".L{}", self.labelno);
        self.labelno += 1;
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::test_config;

    #[test]
    fn chunk_roundtrip() {
        let mut asm = Assembler::new(test_config());
        asm.write_label("start");
        asm.write_memword(0x1234);
        asm.write_memword(0xbeef);
        asm.write_label_ref("start", 2, LabelRefMode::AbsPtr);
        asm.write_zero(3);
        asm.write_srcpos(Pos {
            x0: 1,
            y0: 2,
            x1: 3,
            y1: 4,
        });

        let sect = asm.section(".text").unwrap();
        let chunks: Vec<Chunk> = sect.chunks().collect();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0], Chunk::Label("start"));
        // Two 16-bit little-endian words coalesced into one DATA chunk.
        assert_eq!(chunks[1], Chunk::Data(&[0x34, 0x12, 0xef, 0xbe]));
        assert_eq!(
            chunks[2],
            Chunk::LabelRef {
                mode: LabelRefMode::AbsPtr,
                addend: 2,
                name: "start"
            }
        );
        assert_eq!(chunks[3], Chunk::Zero(3));
        assert_eq!(
            chunks[4],
            Chunk::SrcPos(Pos {
                x0: 1,
                y0: 2,
                x1: 3,
                y1: 4
            })
        );
    }

    #[test]
    fn data_chunk_reopens_after_label() {
        let mut asm = Assembler::new(test_config());
        asm.write_memword(1);
        asm.write_label("mid");
        asm.write_memword(2);
        let sect = asm.section(".text").unwrap();
        let chunks: Vec<Chunk> = sect.chunks().collect();
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks[0], Chunk::Data(_)));
        assert!(matches!(chunks[1], Chunk::Label("mid")));
        assert!(matches!(chunks[2], Chunk::Data(_)));
    }

    #[test]
    fn numbered_labels_are_unique() {
        let mut asm = Assembler::new(test_config());
        let a = asm.numbered_label();
        let b = asm.numbered_label();
        assert_ne!(a, b);
        assert!(a.starts_with(".L"));
    }
}
