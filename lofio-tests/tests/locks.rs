//! Byte-range lock semantics, in-process (open-file-description locks)
//! and across processes (via the worker binary).

use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;
use std::process::Command;
use std::process::Stdio;

use lofio::Caching;
use lofio::Creation;
use lofio::Deadline;
use lofio::ErrorKind;
use lofio::FileHandle;
use lofio::HandleFlags;
use lofio::IoHandle;
use lofio::Mode;

fn open_rw(path: &Path) -> FileHandle {
    FileHandle::open(
        path,
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap()
}

// Two descriptors in one process only contend where the platform has
// file-description-scoped record locks.
#[cfg(target_os = "linux")]
#[test]
fn exclusive_locks_exclude_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked");
    let a = open_rw(&path);
    let b = open_rw(&path);

    let guard = a.lock(0, 1024, true, None).unwrap();
    assert!(guard.is_exclusive());
    // Modern kernels grant fd-scoped locks; the process-wide fallback
    // would have flagged the handle.
    assert!(!a.flags().contains(HandleFlags::BYTE_LOCK_INSANITY));

    let err = b.lock(0, 1024, true, Some(Deadline::zero())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);

    drop(guard);
    let reacquired = b.lock(0, 1024, true, Some(Deadline::zero())).unwrap();
    drop(reacquired);
}

#[cfg(target_os = "linux")]
#[test]
fn shared_locks_admit_readers_but_not_writers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared");
    let a = open_rw(&path);
    let b = open_rw(&path);

    let ga = a.lock(0, 4096, false, None).unwrap();
    let gb = b.lock(0, 4096, false, Some(Deadline::zero())).unwrap();
    drop(gb);

    let err = b.lock(0, 4096, true, Some(Deadline::zero())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    drop(ga);
}

#[cfg(target_os = "linux")]
#[test]
fn disjoint_ranges_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ranges");
    let a = open_rw(&path);
    let b = open_rw(&path);

    let _ga = a.lock(0, 1024, true, None).unwrap();
    let _gb = b.lock(1024, 1024, true, Some(Deadline::zero())).unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn high_bit_offsets_lock_outside_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("advisory");
    let a = open_rw(&path);
    let b = open_rw(&path);

    // The top bit is masked, so this coordinates without ever colliding
    // with real file contents.
    let offset = (1u64 << 63) | (1u64 << 62);
    let _g = a.lock(offset, 1, true, None).unwrap();
    let err = b.lock(offset, 1, true, Some(Deadline::zero())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
}

#[test]
fn locks_contend_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contended");
    drop(open_rw(&path));

    let mut child = Command::new(env!("CARGO_BIN_EXE_lofio-tests"))
        .arg("lock-worker")
        .arg(&path)
        .args(["--offset", "0", "--length", "1024", "--hold-ms", "1500"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    // Wait until the child reports it holds the lock.
    let mut line = String::new();
    BufReader::new(child.stdout.as_mut().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line.trim(), "locked");

    let h = open_rw(&path);
    let err = h.lock(0, 1024, true, Some(Deadline::zero())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);

    assert!(child.wait().unwrap().success());
    // The child released on exit; now it must be ours for the taking.
    let guard = h.lock(0, 1024, true, None).unwrap();
    drop(guard);
}

#[test]
fn whole_file_locks_use_zero_length() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("whole");
    let a = open_rw(&path);
    let guard = a.lock(0, 0, true, None).unwrap();
    assert_eq!(guard.length(), 0);
    drop(guard);
}
