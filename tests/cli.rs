//! Driver-level tests: real files in, flat binary and sidecar out.

use lily_cc::commands::addr2line::LineInfo;
use lily_cc::commands::compile;
use std::fs;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn compile_to_binary_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("t.c");
    fs::write(&src, "int main(void) {\n    return 0;\n}\n").unwrap();
    let out = dir.path().join("t.bin");
    let side = dir.path().join("t.lines");

    let code = compile::run(&args(&[
        "lily-cc",
        "-o",
        out.to_str().unwrap(),
        "--linenumbers",
        side.to_str().unwrap(),
        src.to_str().unwrap(),
    ]))
    .unwrap();
    assert_eq!(code, 0);

    let bytes = fs::read(&out).unwrap();
    assert!(!bytes.is_empty());
    // Two bytes per 16-bit word.
    assert_eq!(bytes.len() % 2, 0);

    // The sidecar resolves the entry of main to its first statement.
    let sidecar = fs::read_to_string(&side).unwrap();
    assert!(sidecar.contains("label main 0"));
    let info = LineInfo::parse(&sidecar);
    let line = info.lookup(0);
    assert!(line.ends_with("t.c:2"), "resolved to {line}");
    assert_eq!(info.lookup(0xffff), "??:0");
}

#[test]
fn assembly_source_is_assembled_directly() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("t.s");
    fs::write(&src, "start:\nMOV R0, 5\nMOV PC, [ST]\n").unwrap();
    let out = dir.path().join("t.bin");

    let code = compile::run(&args(&[
        "lily-cc",
        "-o",
        out.to_str().unwrap(),
        src.to_str().unwrap(),
    ]))
    .unwrap();
    assert_eq!(code, 0);

    // MOV R0, 5 assembles to y=1 x=imm b=imm a=R0 o=MOV plus the constant;
    // MOV PC, [ST] is the return idiom.
    let bytes = fs::read(&out).unwrap();
    assert_eq!(bytes, [0x26, 0xfe, 0x05, 0x00, 0xa6, 0xd9]);
}

#[test]
fn errors_give_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("t.c");
    fs::write(&src, "int f(void) { return undeclared_thing; }\n").unwrap();
    let out = dir.path().join("t.bin");

    let code = compile::run(&args(&[
        "lily-cc",
        "-o",
        out.to_str().unwrap(),
        src.to_str().unwrap(),
    ]))
    .unwrap();
    assert_eq!(code, 1);
    assert!(!out.exists(), "output written despite errors");
}

#[test]
fn unknown_machine_option_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("t.c");
    fs::write(&src, "int main(void) { return 0; }\n").unwrap();

    let code = compile::run(&args(&[
        "lily-cc",
        "-mbogus=thing",
        src.to_str().unwrap(),
    ]))
    .unwrap();
    assert_eq!(code, 1);
}
