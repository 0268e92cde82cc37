use std::{
    env, fs,
    io::Write,
    path::PathBuf,
    process::{Command, Output, Stdio},
};

/// Write `code` to a fresh file in the temporary directory.
fn source_file(name: &str, code: &str) -> PathBuf {
    let path = env::temp_dir().join(format!("tapejit-cli-{}-{name}.b", std::process::id()));
    fs::write(&path, code).unwrap();
    path
}

/// Run the binary with the given arguments and input.
fn tapejit(args: &[&str], input: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_tapejit"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(input).unwrap();
    child.wait_with_output().unwrap()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn hello_world() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/hello.b");
    for args in [vec![path], vec!["-d", path], vec!["-u", path], vec!["-u", "-d", path]] {
        let output = tapejit(&args, b"");
        assert!(output.status.success(), "{args:?}: {}", stderr(&output));
        assert_eq!(output.stdout, b"Hello World!\n");
    }
}

#[test]
fn copies_input() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/cat.b");
    let output = tapejit(&[path], b"some input\n");
    assert!(output.status.success());
    assert_eq!(output.stdout, b"some input\n");
}

#[test]
fn end_of_input_values() {
    let path = source_file("eof", ",.");
    let path = path.to_str().unwrap();
    for (eof, value) in [("0", 0), ("-1", 255), ("nochange", 0)] {
        let output = tapejit(&["--eof", eof, path], b"");
        assert!(output.status.success(), "{eof}: {}", stderr(&output));
        assert_eq!(output.stdout, [value]);
    }
    let output = tapejit(&["--eof", "-1", path], b"x");
    assert_eq!(output.stdout, b"x");
}

#[test]
fn out_of_bounds_traps() {
    let left = source_file("left", "+.<+");
    let output = tapejit(&[left.to_str().unwrap()], b"");
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(output.stdout, [1]);
    assert!(stderr(&output).contains("error: out of bounds memory access"));

    let right = source_file("right", "+[>+]");
    let output = tapejit(&["--tape-size", "3", right.to_str().unwrap()], b"");
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error: out of bounds memory access"));

    let scan = source_file("scan", "+>+>+<<[>]");
    let output = tapejit(&["--tape-size", "3", scan.to_str().unwrap()], b"");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn scan_stays_inside_small_tape() {
    let path = source_file("small-scan", "+[>]+.");
    let output = tapejit(&["--tape-size", "3", path.to_str().unwrap()], b"");
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(output.stdout, [1]);
}

#[test]
fn unbalanced_brackets_produce_no_dump() {
    let path = source_file("unbalanced", "+[>+");
    let dump = env::temp_dir().join(format!("tapejit-cli-{}-unbalanced.bin", std::process::id()));
    let _ = fs::remove_file(&dump);
    let output = tapejit(&["--dump", dump.to_str().unwrap(), path.to_str().unwrap()], b"");
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error: unbalanced brackets"));
    assert!(!dump.exists());
}

#[test]
fn dump_writes_code_instead_of_running() {
    let path = source_file("dump", "+++.");
    let dump = env::temp_dir().join(format!("tapejit-cli-{}-dump.bin", std::process::id()));
    let output = tapejit(&["--dump", dump.to_str().unwrap(), path.to_str().unwrap()], b"");
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(output.stdout.is_empty());
    let code = fs::read(&dump).unwrap();
    let _ = fs::remove_file(&dump);
    assert_eq!(code.last(), Some(&0xc3));
}

#[test]
fn missing_source_file() {
    let output = tapejit(&["/nonexistent/program.b"], b"");
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).starts_with("error: failed to read file `/nonexistent/program.b`"));
}

#[test]
fn timing_report() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/hello.b");
    let output = tapejit(&["-t", path], b"");
    assert!(output.status.success());
    let stderr = stderr(&output);
    assert!(stderr.contains("Compile time:"));
    assert!(stderr.contains("Execution time:"));
    assert!(stderr.contains("Total:"));
}
