//! End-to-end scenarios run through the real `qatam` binary: write a script
//! to a temp file, run it, assert on captured stdout/stderr and the exit
//! code. No snapshot-testing crate; plain `assert_eq!` on captured output.

use std::io::Write;
use std::process::{Command, Output};

fn run(source: &str) -> Output {
    let mut path = std::env::temp_dir();
    path.push(format!("qatam-golden-{}.qtm", std::process::id()));
    let mut file = std::fs::File::create(&path).expect("create temp script");
    file.write_all(source.as_bytes()).expect("write temp script");
    drop(file);

    let output = Command::new(env!("CARGO_BIN_EXE_qatam"))
        .arg(&path)
        .output()
        .expect("run qatam binary");
    std::fs::remove_file(&path).ok();
    output
}

fn stdout(source: &str) -> String {
    let output = run(source);
    assert!(output.status.success(), "expected success, stderr: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout).expect("utf8 stdout")
}

#[test]
fn arithmetic_with_precedence() {
    assert_eq!(stdout("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(stdout(r#"var a = "foo"; var b = "bar"; print a + b;"#), "foobar\n");
}

#[test]
fn closures_share_no_state_across_separate_calls() {
    assert_eq!(
        stdout(
            "fun make(n) { fun add(x) { return x + n; } return add; } \
             var f = make(10); print f(5); print f(7);"
        ),
        "15\n17\n"
    );
}

#[test]
fn inheritance_and_super_calls() {
    assert_eq!(
        stdout(
            "class A { greet() { print \"A\"; } } \
             class B < A { greet() { super.greet(); print \"B\"; } } \
             B().greet();"
        ),
        "A\nB\n"
    );
}

#[test]
fn initializer_sets_fields() {
    assert_eq!(stdout("class C { init(x) { this.x = x; } } print C(42).x;"), "42\n");
}

#[test]
fn numeric_for_loop() {
    assert_eq!(stdout("var i = 0; for (; i < 3; i = i + 1) print i;"), "0\n1\n2\n");
}

#[test]
fn runtime_error_exits_70_and_reports_on_stderr() {
    let output = run(r#""a" - 1;"#);
    assert_eq!(output.status.code(), Some(70));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Operands must be numbers."));
}

#[test]
fn compile_error_exits_65_and_reports_on_stderr() {
    let output = run("return 1;");
    assert_eq!(output.status.code(), Some(65));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Can't return from top-level code."));
}
