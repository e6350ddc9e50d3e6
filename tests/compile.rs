//! End-to-end tests: C source through the reader, the code generator and
//! the two-pass assembler, with structural assertions on the emitted
//! instruction stream.

use lilycc_codegen::asm::output;
use lilycc_codegen::asm::Chunk;
use lilycc_codegen::ast::FuncSig;
use lilycc_codegen::isa::{lookup, Flags, TargetIsa};
use lilycc_codegen::{lower, CompileCtx};
use lilycc_reader::{parse_unit, Item};

/* ====== Pixie 16 stream decoding ====== */

/// One element of a section's word stream.
#[derive(Debug, Clone, PartialEq)]
enum W {
    Word(u16),
    Ref(String),
    Label(String),
}

/// A decoded px16 instruction with its immediates.
#[derive(Debug, Clone)]
struct Decoded {
    y: bool,
    x: u8,
    b: u8,
    a: u8,
    o: u8,
    imm0: Option<W>,
    imm1: Option<W>,
}

fn words_of(ctx: &CompileCtx, section: &str) -> Vec<W> {
    let sect = ctx.asm.section(section).expect("section exists");
    let mut out = Vec::new();
    for chunk in sect.chunks() {
        match chunk {
            Chunk::Data(bytes) => {
                for pair in bytes.chunks(2) {
                    out.push(W::Word(u16::from_le_bytes([pair[0], pair[1]])));
                }
            }
            Chunk::LabelRef { name, .. } => out.push(W::Ref(name.to_string())),
            Chunk::Label(name) => out.push(W::Label(name.to_string())),
            Chunk::Zero(n) => {
                for _ in 0..n {
                    out.push(W::Word(0));
                }
            }
            Chunk::SrcPos(_) => {}
        }
    }
    out
}

/// Walk the `.text` stream, decoding instructions and swallowing their
/// immediate slots, exactly as the hardware fetch would.
fn disassemble(words: &[W]) -> Vec<Decoded> {
    let mut out = Vec::new();
    let mut iter = words.iter().peekable();
    while let Some(w) = iter.next() {
        let word = match w {
            W::Word(word) => *word,
            W::Label(_) => continue,
            W::Ref(_) => panic!("label reference in instruction position"),
        };
        let mut insn = Decoded {
            y: word & 0x8000 != 0,
            x: ((word >> 12) & 7) as u8,
            b: ((word >> 9) & 7) as u8,
            a: ((word >> 6) & 7) as u8,
            o: (word & 0o77) as u8,
            imm0: None,
            imm1: None,
        };
        if insn.a == 7 {
            insn.imm0 = iter.next().cloned();
        }
        if insn.b == 7 {
            insn.imm1 = iter.next().cloned();
        }
        out.push(insn);
    }
    out
}

fn compile_px16(src: &str) -> (Box<dyn TargetIsa>, CompileCtx) {
    compile_with(src, &[])
}

fn compile_with(src: &str, machine: &[&str]) -> (Box<dyn TargetIsa>, CompileCtx) {
    let mut builder = lookup("px16").unwrap();
    for opt in machine {
        builder.set_machine_opt(opt).unwrap();
    }
    let isa = builder.finish(Flags::default()).unwrap();
    let mut ctx = CompileCtx::new(&*isa, "test.c");
    let items = parse_unit(src, &mut ctx.types).expect("source parses");
    // Register every signature first so forward calls resolve.
    for item in &items {
        if let Item::Func(func) = item {
            ctx.functions.insert(func.name.clone(), FuncSig::of(func));
        }
    }
    for item in items {
        match item {
            Item::Global(global) => ctx.define_global(&global),
            Item::Func(mut func) => {
                lower::compile_function(&*isa, &mut ctx, &mut func).expect("lowering succeeds")
            }
        }
    }
    (isa, ctx)
}

/* ====== Scenarios ====== */

const FIB: &str = "
long fib(long n) {
    if (n == 0) return 0;
    if (n == 1) return 1;
    return fib(n - 2) + fib(n - 1);
}
";

#[test]
fn fib_entry_saves_and_restores_registers() {
    let (_isa, ctx) = compile_px16(FIB);
    assert_eq!(ctx.diag.error_count(), 0);

    let words = words_of(&ctx, ".text");
    // The function label is defined.
    let at = words
        .iter()
        .position(|w| *w == W::Label("fib".to_string()))
        .expect("fib label defined");
    // Two words of long argument and a two-word return leave two
    // callee-saved registers; they are pushed R3 first.
    assert_eq!(words[at + 1], W::Word(0x5726), "push R3");
    assert_eq!(words[at + 2], W::Word(0x5526), "push R2");

    let insns = disassemble(&words);
    // Two recursive calls: LEA.JSR PC, [PC~fib] in the default PIE mode.
    let jsrs: Vec<&Decoded> = insns
        .iter()
        .filter(|insn| insn.o == 0o76 && insn.a == 6)
        .collect();
    assert_eq!(jsrs.len(), 2);
    for jsr in jsrs {
        assert_eq!(jsr.imm1, Some(W::Ref("fib".to_string())));
    }

    // Three returns, each popping the two saved registers, then PC.
    let rets = insns
        .iter()
        .filter(|insn| insn.y && insn.x == 5 && insn.b == 4 && insn.a == 6 && insn.o == 0o46)
        .count();
    assert_eq!(rets, 3);
    let pops = insns
        .iter()
        .filter(|insn| insn.y && insn.x == 5 && insn.b == 4 && insn.a < 4 && insn.o == 0o46)
        .count();
    assert_eq!(pops, 6);
}

#[test]
fn compare_zero_uses_cmp1() {
    let (_isa, ctx) = compile_px16("int f(int x) { if (x == 0) return 1; return 2; }");
    assert_eq!(ctx.diag.error_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    // A single CMP1, not CMP x, 0.
    assert_eq!(insns.iter().filter(|insn| insn.o == 0o22).count(), 1);
    assert!(
        !insns
            .iter()
            .any(|insn| insn.o == 0o02 && matches!(insn.imm1, Some(W::Word(0)))),
        "found a CMP against constant zero"
    );
}

#[test]
fn add_zero_folds_to_nothing() {
    let (_isa, ctx) = compile_px16("int f(int x) { return x + 0; }");
    assert_eq!(ctx.diag.error_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    assert!(
        !insns.iter().any(|insn| insn.o == 0o00),
        "x + 0 still emitted an ADD"
    );
}

#[test]
fn add_one_becomes_inc() {
    let (_isa, ctx) = compile_px16("int f(int x) { return x + 1; }");
    assert_eq!(ctx.diag.error_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    assert!(insns.iter().any(|insn| insn.o == 0o20), "no INC emitted");
    assert!(!insns.iter().any(|insn| insn.o == 0o00), "ADD emitted");
}

#[test]
fn zero_loads_use_xor() {
    let (_isa, ctx) = compile_px16("int f(void) { return 0; }");
    let insns = disassemble(&words_of(&ctx, ".text"));
    // XOR R0, R0.
    assert!(insns
        .iter()
        .any(|insn| insn.o == 0o05 && insn.a == 0 && insn.b == 0 && insn.x == 7));
}

#[test]
fn zero_arg_void_function_pushes_all_four() {
    let (_isa, ctx) = compile_px16("void f(void) { }");
    let words = words_of(&ctx, ".text");
    let at = words
        .iter()
        .position(|w| *w == W::Label("f".to_string()))
        .unwrap();
    // Pushes R3, R2, R1, R0.
    assert_eq!(words[at + 1], W::Word(0x5726));
    assert_eq!(words[at + 2], W::Word(0x5526));
    assert_eq!(words[at + 3], W::Word(0x5326));
    assert_eq!(words[at + 4], W::Word(0x5126));
}

#[test]
fn inline_asm_survives_verbatim() {
    let (_isa, ctx) = compile_px16(
        "void f(void) { asm(\"MOV ST, 0xffff\"); asm(\"SUB ST, [0xffff]\"); }",
    );
    assert_eq!(ctx.diag.error_count(), 0);
    let words = words_of(&ctx, ".text");
    let flat: Vec<W> = words.clone();
    // MOV ST, 0xffff = y=1 x=imm b=imm a=ST o=MOV, then the constant.
    let mov = flat
        .windows(2)
        .position(|w| w == [W::Word(0xff26), W::Word(0xffff)]);
    assert!(mov.is_some(), "MOV ST, 0xffff not found verbatim");
    // SUB ST, [0xffff] = y=1 x=mem b=imm a=ST o=SUB, then the address.
    let sub = flat
        .windows(2)
        .position(|w| w == [W::Word(0xdf01), W::Word(0xffff)]);
    assert!(sub.is_some(), "SUB ST, [0xffff] not found verbatim");
}

#[test]
fn inline_asm_operand_substitution() {
    let (_isa, ctx) = compile_px16(
        "int f(int x) { asm(\"ADD %0, 1\" : [v] \"+r\" (x)); return x; }",
    );
    assert_eq!(ctx.diag.error_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    // The template's ADD must target a real register with immediate 1.
    assert!(insns
        .iter()
        .any(|insn| insn.o == 0o00 && insn.a < 4 && matches!(insn.imm1, Some(W::Word(1)))));
}

#[test]
fn pointer_aliasing_forces_memory() {
    let (_isa, ctx) = compile_px16(
        "int f(void) { int a = 2; int *b = &a; *b = 4; return a; }",
    );
    assert_eq!(ctx.diag.error_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    // The address is taken with LEA from the stack.
    assert!(
        insns
            .iter()
            .any(|insn| insn.o == 0o66 && insn.x == 4 && insn.a < 4),
        "no LEA reg, [ST+n] for &a"
    );
    // The final read of `a` comes back from memory, not a register.
    assert!(
        insns
            .iter()
            .any(|insn| insn.y && insn.o == 0o46 && insn.x == 4 && insn.a == 0),
        "return value not loaded from the frame"
    );
}

#[test]
fn mmio_loop_keeps_store_and_recheck() {
    let (_isa, ctx) = compile_px16(
        "void f(short *p) { while (*p) { *(volatile short *)0xfff6 = *p++; } }",
    );
    assert_eq!(ctx.diag.error_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    // The MMIO store is an absolute-addressed MOV destination.
    assert!(
        insns
            .iter()
            .any(|insn| !insn.y
                && insn.x == 5
                && insn.o == 0o46
                && matches!(insn.imm0, Some(W::Word(0xfff6)))),
        "no store to [0xfff6]"
    );
    // The pointer increment stays in the loop.
    assert!(insns.iter().any(|insn| insn.o == 0o20), "no INC for p++");
    // The condition is re-checked with CMP1 and a conditional branch back.
    assert!(insns.iter().any(|insn| insn.o == 0o22), "no CMP1 recheck");
    assert!(
        insns
            .iter()
            .any(|insn| insn.a == 6 && insn.o >= 0o60 && insn.o != 0o66 && insn.o != 0o76),
        "no conditional branch"
    );
}

#[test]
fn division_routine_compiles_clean() {
    let src = "
unsigned int divide(unsigned int num, unsigned int den) {
    unsigned int quot = 0;
    unsigned int mask = 1;
    while (den < 0x8000 && den < num) {
        den = den << 1;
        mask = mask << 1;
    }
    while (mask != 0) {
        if (num >= den) {
            num = num - den;
            quot = quot | mask;
        }
        den = den >> 1;
        mask = mask >> 1;
    }
    return quot;
}
";
    let (_isa, ctx) = compile_px16(src);
    assert_eq!(ctx.diag.error_count(), 0);
    assert_eq!(ctx.diag.warning_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    // Shift-and-subtract: shifts both ways, a subtract, an OR.
    assert!(insns.iter().any(|insn| insn.o == 0o26), "no SHL");
    assert!(insns.iter().any(|insn| insn.o == 0o27), "no SHR");
    assert!(insns.iter().any(|insn| insn.o == 0o01), "no SUB");
    assert!(insns.iter().any(|insn| insn.o == 0o04), "no OR");
}

#[test]
fn multiword_math_uses_carry_continue() {
    let (_isa, ctx) = compile_px16("long f(long a, long b) { return a + b; }");
    assert_eq!(ctx.diag.error_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    let adds = insns.iter().filter(|insn| insn.o == 0o00).count();
    let addcs = insns.iter().filter(|insn| insn.o == 0o10).count();
    assert_eq!(adds, 1, "exactly one plain ADD for word 1");
    assert_eq!(addcs, 1, "exactly one ADDC for word 2");
}

#[test]
fn uninitialised_read_warns() {
    let (_isa, ctx) = compile_px16("int f(void) { int x; return x + 1; }");
    assert_eq!(ctx.diag.error_count(), 0);
    assert!(ctx.diag.warning_count() >= 1, "no uninitialised warning");
}

#[test]
fn unsupported_operation_is_diagnosed() {
    let (_isa, ctx) = compile_px16("int f(int a, int b) { return a * b; }");
    assert!(ctx.diag.has_errors(), "multiply should be rejected");
}

#[test]
fn conflicting_definitions_detected() {
    // Via the driver-level registry helper: two bodies for one name.
    let (_isa, mut ctx) = compile_px16("int f(void) { return 1; }");
    let items = parse_unit("long f(void) { return 2; }", &mut ctx.types).unwrap();
    match &items[0] {
        Item::Func(func) => {
            let old = ctx.functions.get(&func.name).unwrap();
            let incompatible =
                (old.defined && func.body.is_some()) || !ctx.types.equals(old.ret, func.ret);
            assert!(incompatible);
        }
        _ => panic!(),
    }
}

#[test]
fn entrypoint_vector_table() {
    let src = "
void entry(void) { }
void irq(void) { }
void nmi(void) { }
";
    let (isa, mut ctx) = compile_with(
        src,
        &["entrypoint=entry", "irqhandler=irq", "nmihandler=nmi"],
    );
    assert_eq!(ctx.diag.error_count(), 0);
    isa.begin_output(&mut ctx).unwrap();
    let layout = output::layout(&mut ctx.asm).unwrap();
    isa.check_output(&ctx, &layout);

    // Vectors at fixed addresses 0, 1, 2.
    assert_eq!(layout.address_of("__px16_vectors.irq"), Some(0));
    assert_eq!(layout.address_of("__px16_vectors.nmi"), Some(1));
    assert_eq!(layout.address_of("__px16_vectors.entry"), Some(2));
    // No mismatched-option warnings when all three are given.
    assert_eq!(ctx.diag.warning_count(), 0);

    // Each vector resolves to its handler's address.
    let bytes = output::emit(&ctx.asm, &layout).unwrap();
    let irq = layout.address_of("irq").unwrap() as u16;
    let nmi = layout.address_of("nmi").unwrap() as u16;
    let entry = layout.address_of("entry").unwrap() as u16;
    assert_eq!(&bytes[0..2], irq.to_le_bytes());
    assert_eq!(&bytes[2..4], nmi.to_le_bytes());
    assert_eq!(&bytes[4..6], entry.to_le_bytes());
}

#[test]
fn entrypoint_without_handlers_warns() {
    let (isa, mut ctx) = compile_with("void entry(void) { }", &["entrypoint=entry"]);
    isa.begin_output(&mut ctx).unwrap();
    // IRQs and NMIs unhandled.
    assert_eq!(ctx.diag.warning_count(), 2);
    // Vectors still fall back to the entry label.
    let layout = output::layout(&mut ctx.asm).unwrap();
    let bytes = output::emit(&ctx.asm, &layout).unwrap();
    let entry = layout.address_of("entry").unwrap() as u16;
    assert_eq!(&bytes[0..2], entry.to_le_bytes());
    assert_eq!(&bytes[2..4], entry.to_le_bytes());
    assert_eq!(&bytes[4..6], entry.to_le_bytes());
}

#[test]
fn stack_convention_for_many_arguments() {
    // Six words of arguments exceed the four registers.
    let src = "
int sum(int a, int b, int c, int d, int e, int f) {
    return a;
}
int caller(void) { return sum(1, 2, 3, 4, 5, 6); }
";
    let (_isa, ctx) = compile_px16(src);
    assert_eq!(ctx.diag.error_count(), 0);
    let insns = disassemble(&words_of(&ctx, ".text"));
    // The caller pushes all six arguments through the stack port.
    let pushes = insns
        .iter()
        .filter(|insn| !insn.y && insn.x == 5 && insn.a == 4 && insn.o == 0o46)
        .count();
    assert!(pushes >= 6, "expected six argument pushes, saw {pushes}");
    // The callee reads its first parameter from the caller's frame:
    // `return a` loads from [ST+n].
    assert!(insns
        .iter()
        .any(|insn| insn.y && insn.x == 4 && insn.a == 0 && insn.o == 0o46));
}

#[test]
fn globals_land_in_data_and_bss() {
    let (_isa, ctx) = compile_px16(
        "int counter; unsigned int magic = 0xbeef; int get(void) { return magic; }",
    );
    assert_eq!(ctx.diag.error_count(), 0);
    let data = words_of(&ctx, ".data");
    assert!(data.contains(&W::Label("magic".to_string())));
    assert!(data.contains(&W::Word(0xbeef)));
    let bss = words_of(&ctx, ".bss");
    assert!(bss.contains(&W::Label("counter".to_string())));
}

/* ====== gr8 smoke tests ====== */

fn compile_gr8(src: &str) -> CompileCtx {
    let isa = lookup("gr8").unwrap().finish(Flags::default()).unwrap();
    let mut ctx = CompileCtx::new(&*isa, "test.c");
    let items = parse_unit(src, &mut ctx.types).expect("source parses");
    for item in &items {
        if let Item::Func(func) = item {
            ctx.functions.insert(func.name.clone(), FuncSig::of(func));
        }
    }
    for item in items {
        match item {
            Item::Global(global) => ctx.define_global(&global),
            Item::Func(mut func) => {
                lower::compile_function(&*isa, &mut ctx, &mut func).expect("lowering succeeds")
            }
        }
    }
    ctx
}

fn gr8_text_bytes(ctx: &CompileCtx) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in ctx.asm.section(".text").unwrap().chunks() {
        match chunk {
            Chunk::Data(bytes) => out.extend_from_slice(bytes),
            // Address references are two placeholder bytes.
            Chunk::LabelRef { .. } => out.extend_from_slice(&[0xaa, 0xaa]),
            _ => {}
        }
    }
    out
}

#[test]
fn gr8_increment_and_return() {
    let ctx = compile_gr8("int f(int x) { return x + 1; }");
    assert_eq!(ctx.diag.error_count(), 0);
    let bytes = gr8_text_bytes(&ctx);
    // INC [mem] with the PIE bit, chained with INCC [mem].
    assert!(bytes.contains(&(0x3f | 0x80)), "no INC [mem]");
    assert!(bytes.contains(&(0x3b | 0x80)), "no INCC [mem]");
    // RET terminates the function.
    assert_eq!(*bytes.last().unwrap(), 0x03);
    // The parameter labels exist in .bss.
    let bss = ctx.asm.section(".bss").unwrap();
    assert!(bss
        .chunks()
        .any(|chunk| matches!(chunk, Chunk::Label(name) if name == "f.LA0000")));
}

#[test]
fn gr8_byte_convention_and_call() {
    let src = "
char add(char a, char b) { return a + b; }
char caller(void) { return add(1, 2); }
";
    let ctx = compile_gr8(src);
    assert_eq!(ctx.diag.error_count(), 0);
    let bytes = gr8_text_bytes(&ctx);
    // A CALL with the PIE bit set.
    assert!(bytes.contains(&(0x02 | 0x80)), "no CALL");
    // The byte convention loads arguments into A and X:
    // MOV X, 2 is 0x1d+1, 0x02.
    assert!(
        bytes.windows(2).any(|w| w == [0x1e, 0x02]),
        "no MOV X, imm for the second argument"
    );
}

#[test]
fn gr8_carry_chain_on_add() {
    let ctx = compile_gr8("int f(int a, int b) { return a + b; }");
    assert_eq!(ctx.diag.error_count(), 0);
    let bytes = gr8_text_bytes(&ctx);
    // ADD A, [mem] then ADDC A, [mem]: 0x32+0x07+0x80 and +0x0c.
    assert!(bytes.contains(&0xb9), "no ADD A, [mem]");
    assert!(bytes.contains(&0xc5), "no ADDC A, [mem]");
}
