//! Cross-process append atomicity: concurrent appenders interleave at
//! record boundaries, never inside a record.

use std::process::Command;

const RECORD: usize = 4096;
const COUNT: usize = 64;

#[test]
fn concurrent_appenders_never_splice_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal");

    let spawn = |byte: u8| {
        Command::new(env!("CARGO_BIN_EXE_lofio-tests"))
            .arg("append-worker")
            .arg(&path)
            .args(["--byte", &byte.to_string()])
            .args(["--count", &COUNT.to_string()])
            .args(["--size", &RECORD.to_string()])
            .spawn()
            .unwrap()
    };
    let mut a = spawn(0xaa);
    let mut b = spawn(0xbb);
    assert!(a.wait().unwrap().success());
    assert!(b.wait().unwrap().success());

    let contents = std::fs::read(&path).unwrap();
    assert_eq!(contents.len(), RECORD * COUNT * 2);

    let mut seen_a = 0;
    let mut seen_b = 0;
    for record in contents.chunks(RECORD) {
        let first = record[0];
        assert!(
            record.iter().all(|&b| b == first),
            "record spliced: starts with {first:#x}"
        );
        match first {
            0xaa => seen_a += 1,
            0xbb => seen_b += 1,
            other => panic!("unexpected fill byte {other:#x}"),
        }
    }
    assert_eq!(seen_a, COUNT);
    assert_eq!(seen_b, COUNT);
}
