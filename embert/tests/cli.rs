//! CLI end-to-end tests: write a script to disk, run the binary, and pin
//! exact stdout plus exit status.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

fn script(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp script");
    file.write_all(source.as_bytes()).expect("write temp script");
    file
}

fn embert() -> Command {
    Command::cargo_bin("embert").expect("embert binary builds")
}

#[test]
fn arithmetic_scenario() {
    let file = script("print 1 + 2 * 3;");
    embert().arg(file.path()).assert().success().stdout("7\n");
}

#[test]
fn string_concatenation_scenario() {
    let file = script("var a = \"Hello, \"; var b = \"world!\"; print a + b;");
    embert()
        .arg(file.path())
        .assert()
        .success()
        .stdout("Hello, world!\n");
}

#[test]
fn closure_scenario() {
    let file = script(
        "fun make() { var x = 10; fun inner() { return x; } return inner; } print make()();",
    );
    embert().arg(file.path()).assert().success().stdout("10\n");
}

#[test]
fn class_scenario() {
    let file = script(
        "class G { init(n){ this.n = n; } hi(){ return \"Hi, \" + this.n + \"!\"; } } print G(\"p\").hi();",
    );
    embert()
        .arg(file.path())
        .assert()
        .success()
        .stdout("Hi, p!\n");
}

#[test]
fn inheritance_scenario() {
    let file = script(
        "class A { m(){ return \"A\"; } } class B : A { m(){ return super.m() + \"B\"; } } print B().m();",
    );
    embert().arg(file.path()).assert().success().stdout("AB\n");
}

#[test]
fn runtime_error_scenario() {
    let file = script("\"x\" + 1;");
    embert()
        .arg(file.path())
        .assert()
        .code(70)
        .stdout("")
        .stderr(predicate::str::contains(
            "Operands must be two numbers or two strings.",
        ))
        .stderr(predicate::str::contains("in script"));
}

#[test]
fn compile_error_exits_65_with_diagnostic() {
    let file = script("var = 1;");
    embert()
        .arg(file.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("[line 1] Error at '='"));
}

#[test]
fn uninitialized_variable_prints_nil() {
    let file = script("var x; print x;");
    embert().arg(file.path()).assert().success().stdout("nil\n");
}

#[test]
fn missing_file_exits_74() {
    embert()
        .arg("definitely/not/a/script.mbr")
        .assert()
        .code(74)
        .stderr(predicate::str::contains("could not read script"));
}

#[test]
fn dump_tokens_lists_the_stream() {
    let file = script("print 1;");
    embert()
        .arg(file.path())
        .arg("--dump-tokens")
        .assert()
        .success()
        .stdout(predicate::str::contains("Print"))
        .stdout(predicate::str::contains("Number"))
        .stdout(predicate::str::contains("Semicolon"));
}

#[test]
fn dump_bytecode_disassembles_the_script() {
    let file = script("print 1 + 2;");
    embert()
        .arg(file.path())
        .arg("--dump-bytecode")
        .assert()
        .success()
        .stdout(predicate::str::contains("==[<script>]=="))
        .stdout(predicate::str::contains("Add"));
}

#[test]
fn stack_trace_names_the_failing_function() {
    let file = script("fun boom() { return 1 + nil; } boom();");
    embert()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("in boom()"))
        .stderr(predicate::str::contains("in script"));
}
