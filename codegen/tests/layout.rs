//! Randomised invariants for the chunked section buffer and its two-pass
//! label resolution.

use lilycc_codegen::asm::{output, Assembler, LabelRefMode};
use lilycc_codegen::isa::{lookup, Flags};
use proptest::prelude::*;
use std::collections::HashSet;

/// One randomly chosen append operation.
#[derive(Debug, Clone)]
enum Op {
    Data(u16),
    Zero(u8),
    Label(u8),
    RefAbs(u8, i8),
    RefRel(u8, i8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u16>().prop_map(Op::Data),
        (1u8..8).prop_map(Op::Zero),
        (0u8..10).prop_map(Op::Label),
        ((0u8..10), any::<i8>()).prop_map(|(l, a)| Op::RefAbs(l, a)),
        ((0u8..10), any::<i8>()).prop_map(|(l, a)| Op::RefRel(l, a)),
    ]
}

fn label_name(index: u8) -> String {
    format!("L{index}")
}

proptest! {
    /// Whatever stream of appends is made, layout resolves every label
    /// exactly once, emission succeeds, and the output length matches the
    /// layout's own size accounting.
    #[test]
    fn two_passes_agree(ops in proptest::collection::vec(op_strategy(), 0..64)) {
        let isa = lookup("px16").unwrap().finish(Flags::default()).unwrap();
        let mut asm = Assembler::new(*isa.config());

        let mut defined: HashSet<u8> = HashSet::new();
        let mut referenced: HashSet<u8> = HashSet::new();
        let mut words: u64 = 0;
        for op in &ops {
            match op {
                Op::Data(value) => {
                    asm.write_memword(*value as u64);
                    words += 1;
                }
                Op::Zero(n) => {
                    asm.write_zero(*n as u32);
                    words += *n as u64;
                }
                Op::Label(index) => {
                    // Duplicate definitions are a hard error; don't make
                    // them here.
                    if defined.insert(*index) {
                        asm.write_label(&label_name(*index));
                    }
                }
                Op::RefAbs(index, addend) => {
                    referenced.insert(*index);
                    asm.write_label_ref(&label_name(*index), *addend as i64, LabelRefMode::AbsPtr);
                    words += 1;
                }
                Op::RefRel(index, addend) => {
                    referenced.insert(*index);
                    asm.write_label_ref(&label_name(*index), *addend as i64, LabelRefMode::OffsPtr);
                    words += 1;
                }
            }
        }
        // Define whatever was referenced but never defined.
        for index in &referenced {
            if defined.insert(*index) {
                asm.write_label(&label_name(*index));
            }
        }

        let layout = output::layout(&mut asm).expect("layout succeeds");
        // Every referenced label resolved.
        for index in &referenced {
            prop_assert!(layout.address_of(&label_name(*index)).is_some());
        }
        // Every label lies within the laid-out address space.
        for def in layout.labels.values() {
            prop_assert!(u64::from(def.address) <= words);
        }
        // Emission agrees with the layout's sizes: two bytes per word, no
        // alignment padding in a single unaligned section.
        let bytes = output::emit(&asm, &layout).expect("emit succeeds");
        prop_assert_eq!(bytes.len() as u64, words * 2);
    }

    /// A PC-relative reference always encodes `target - (slot + 1)` for the
    /// one-word pointers of this configuration.
    #[test]
    fn relative_references_encode_deltas(
        pre in 0u8..16,
        post in 0u8..16,
    ) {
        let isa = lookup("px16").unwrap().finish(Flags::default()).unwrap();
        let mut asm = Assembler::new(*isa.config());
        asm.write_label("target");
        for _ in 0..pre {
            asm.write_memword(0);
        }
        asm.write_label_ref("target", 0, LabelRefMode::OffsPtr);
        for _ in 0..post {
            asm.write_memword(0);
        }
        let layout = output::layout(&mut asm).unwrap();
        let bytes = output::emit(&asm, &layout).unwrap();
        let slot = pre as usize;
        let value = i16::from_le_bytes([bytes[slot * 2], bytes[slot * 2 + 1]]);
        prop_assert_eq!(value as i64, -(pre as i64) - 1);
    }
}
