//! File handle behaviour: anonymous inodes, truncation identity,
//! scatter/gather, and race-free relink/unlink.

use std::path::Path;

use lofio::Buffer;
use lofio::Caching;
use lofio::ConstBuffer;
use lofio::Creation;
use lofio::Deadline;
use lofio::ErrorKind;
use lofio::FileHandle;
use lofio::HandleFlags;
use lofio::IoHandle;
use lofio::IoRequest;
use lofio::Mode;
use lofio::bytes_transferred;

fn open_rw(path: &Path, creation: Creation) -> FileHandle {
    FileHandle::open(path, Mode::Write, creation, Caching::All, HandleFlags::empty())
        .unwrap()
}

#[test]
fn temp_inode_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let h = FileHandle::temp_inode(dir.path(), Mode::Write, HandleFlags::empty())
        .unwrap();

    // An anonymous inode has no name anywhere.
    assert_eq!(h.current_path().unwrap(), Path::new(""));

    let payload = b"Hello, world!\n";
    let mut wbufs = [ConstBuffer::new(payload)];
    let written = h.write(IoRequest::new(&mut wbufs, 0), None).unwrap();
    assert_eq!(bytes_transferred(written), payload.len() as u64);

    let mut back = [0u8; 14];
    let mut rbufs = [Buffer::new(&mut back)];
    let got = h.read(IoRequest::new(&mut rbufs, 0), None).unwrap();
    assert_eq!(bytes_transferred(got), 14);
    assert_eq!(&back, payload);

    drop(h);
    // Nothing may have appeared in the directory.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn truncate_preserves_inode_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data");

    let first = open_rw(&path, Creation::IfNeeded);
    let payload = vec![0x61u8; 1024];
    let mut bufs = [ConstBuffer::new(&payload)];
    first.write(IoRequest::new(&mut bufs, 0), None).unwrap();
    let identity = first.unique_id().unwrap();
    drop(first);

    let reopened = open_rw(&path, Creation::Truncate);
    assert_eq!(reopened.length().unwrap(), 0);
    assert_eq!(reopened.unique_id().unwrap(), identity);
}

#[test]
fn only_if_not_exist_detects_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exists");
    drop(open_rw(&path, Creation::IfNeeded));
    let err = FileHandle::open(
        &path,
        Mode::Write,
        Creation::OnlyIfNotExist,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileExists);
}

#[test]
fn scatter_read_splits_across_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scatter");
    std::fs::write(&path, b"ABCDEFGHIJKL").unwrap();

    let h = FileHandle::open(
        &path,
        Mode::Read,
        Creation::OpenExisting,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    let mut a = [0u8; 4];
    let mut b = [0u8; 4];
    let mut c = [0u8; 4];
    let mut bufs = [
        Buffer::new(&mut a),
        Buffer::new(&mut b),
        Buffer::new(&mut c),
    ];
    let got = h.read(IoRequest::new(&mut bufs, 0), None).unwrap();
    assert_eq!(got.len(), 3);
    assert_eq!(bytes_transferred(got), 12);
    assert_eq!(&a, b"ABCD");
    assert_eq!(&b, b"EFGH");
    assert_eq!(&c, b"IJKL");
}

#[test]
fn deadline_on_plain_read_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodeadline");
    let h = open_rw(&path, Creation::IfNeeded);
    let mut buf = [0u8; 4];
    let mut bufs = [Buffer::new(&mut buf)];
    let err = h
        .read(IoRequest::new(&mut bufs, 0), Some(Deadline::zero()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationNotSupported);
}

#[test]
fn unlink_refuses_when_a_third_party_replaced_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("victim");
    let h = open_rw(&path, Creation::IfNeeded);

    // Third party deletes our file and drops an unrelated one at the same
    // path.
    std::fs::remove_file(&path).unwrap();
    std::fs::write(&path, b"innocent bystander").unwrap();

    let err = h.unlink(Some(Deadline::zero())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    // The bystander survived.
    assert_eq!(std::fs::read(&path).unwrap(), b"innocent bystander");
}

#[test]
fn unlink_follows_the_inode_through_renames() {
    let dir = tempfile::tempdir().unwrap();
    let old = dir.path().join("old-name");
    let new = dir.path().join("new-name");
    let h = open_rw(&old, Creation::IfNeeded);

    std::fs::rename(&old, &new).unwrap();
    std::fs::write(&old, b"unrelated").unwrap();

    // unlink removes the inode we opened, wherever it now lives.
    h.unlink(None).unwrap();
    assert!(!new.exists());
    assert_eq!(std::fs::read(&old).unwrap(), b"unrelated");
}

#[test]
fn relink_renames_the_open_inode() {
    let dir = tempfile::tempdir().unwrap();
    let old = dir.path().join("before");
    let new = dir.path().join("after");
    let h = open_rw(&old, Creation::IfNeeded);
    let mut bufs = [ConstBuffer::new(b"contents".as_slice())];
    h.write(IoRequest::new(&mut bufs, 0), None).unwrap();

    h.relink(None, &new, None).unwrap();
    assert!(!old.exists());
    assert_eq!(std::fs::read(&new).unwrap(), b"contents");
    assert_eq!(h.current_path().unwrap(), new.canonicalize().unwrap());
}

#[test]
fn random_files_get_distinct_names() {
    let dir = tempfile::tempdir().unwrap();
    let base = lofio::PathHandle::open(dir.path()).unwrap();
    let a = FileHandle::random_file(&base, Mode::Write, Caching::All, HandleFlags::empty())
        .unwrap();
    let b = FileHandle::random_file(&base, Mode::Write, Caching::All, HandleFlags::empty())
        .unwrap();
    let pa = a.current_path().unwrap();
    let pb = b.current_path().unwrap();
    assert_ne!(pa, pb);
    assert!(pa.to_string_lossy().ends_with(".random"));
}

#[test]
fn temp_file_disappears_on_close() {
    let h = FileHandle::temp_file(Mode::Write, Caching::All, HandleFlags::empty())
        .unwrap();
    let path = h.current_path().unwrap();
    assert!(path.exists());
    h.close().unwrap();
    assert!(!path.exists());
}

#[test]
fn append_only_can_be_toggled_after_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("toggled");
    let mut h = open_rw(&path, Creation::IfNeeded);
    assert!(!h.is_append_only());

    h.set_append_only(true).unwrap();
    assert!(h.is_append_only());
    for chunk in [b"aa".as_slice(), b"bb".as_slice()] {
        let mut bufs = [ConstBuffer::new(chunk)];
        h.write(IoRequest::new(&mut bufs, 0), None).unwrap();
    }
    assert_eq!(std::fs::read(&path).unwrap(), b"aabb");

    h.set_append_only(false).unwrap();
    assert!(!h.is_append_only());
    let mut bufs = [ConstBuffer::new(b"XX".as_slice())];
    h.write(IoRequest::new(&mut bufs, 0), None).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"XXbb");
}

#[test]
fn append_handles_ignore_the_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log");
    let h = FileHandle::open(
        &path,
        Mode::Append,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    for chunk in [b"one".as_slice(), b"two".as_slice()] {
        let mut bufs = [ConstBuffer::new(chunk)];
        // The offset is a lie append handles must not believe.
        h.write(IoRequest::new(&mut bufs, 0), None).unwrap();
    }
    assert_eq!(std::fs::read(&path).unwrap(), b"onetwo");
}
