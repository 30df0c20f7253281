//! Sections, views and mapped files.

use lofio::Buffer;
use lofio::Caching;
use lofio::ConstBuffer;
use lofio::Creation;
use lofio::ErrorKind;
use lofio::FileHandle;
use lofio::HandleFlags;
use lofio::IoHandle;
use lofio::IoRequest;
use lofio::MapHandle;
use lofio::MappedFileHandle;
use lofio::Mode;
use lofio::SectionFlags;
use lofio::SectionHandle;
use lofio::bytes_transferred;
use lofio::utils::page_size;

#[test]
fn anonymous_section_round_trip() {
    let section = SectionHandle::anonymous(
        (page_size() * 4) as u64,
        None,
        SectionFlags::READ | SectionFlags::WRITE,
    )
    .unwrap();
    assert_eq!(section.length(), (page_size() * 4) as u64);

    let map = MapHandle::map(&section, 0, 0, SectionFlags::empty()).unwrap();
    assert_eq!(map.len(), page_size() * 4);
    unsafe {
        map.as_ptr().write_bytes(0x42, map.len());
        assert_eq!(*map.as_ptr().add(map.len() - 1), 0x42);
    }
}

#[test]
fn two_views_of_one_section_share_memory() {
    let section = SectionHandle::anonymous(
        page_size() as u64,
        None,
        SectionFlags::READ | SectionFlags::WRITE,
    )
    .unwrap();
    let a = MapHandle::map(&section, 0, 0, SectionFlags::empty()).unwrap();
    let b = MapHandle::map(&section, 0, 0, SectionFlags::empty()).unwrap();
    unsafe {
        a.as_ptr().write(0x7e);
        assert_eq!(*b.as_ptr(), 0x7e);
    }
}

#[test]
fn section_over_short_file_rejects_oversize_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short");
    std::fs::write(&path, vec![0u8; 100]).unwrap();
    let fh = FileHandle::open(
        &path,
        Mode::Read,
        Creation::OpenExisting,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    let err = SectionHandle::backed(&fh, 1 << 20, SectionFlags::READ).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueTooLarge);
}

#[test]
fn writable_section_extends_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("growme");
    let fh = FileHandle::open(
        &path,
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    let want = (page_size() * 2) as u64;
    let section =
        SectionHandle::backed(&fh, want, SectionFlags::READ | SectionFlags::WRITE)
            .unwrap();
    assert_eq!(section.length(), want);
    assert_eq!(fh.length().unwrap(), want);
}

#[test]
fn mapped_file_write_is_visible_to_plain_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mapped");
    let mut mf = MappedFileHandle::open(
        65536,
        &path,
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();

    let mut bufs = [ConstBuffer::new(b"XYZ".as_slice())];
    let written = mf.write(IoRequest::new(&mut bufs, 0), None).unwrap();
    assert_eq!(bytes_transferred(written), 3);

    let addr = mf.address();
    assert!(!addr.is_null());
    unsafe {
        assert_eq!(*addr, b'X');
        assert_eq!(*addr.add(1), b'Y');
        assert_eq!(*addr.add(2), b'Z');
        // Mutate through the map, then flush to the device.
        *addr = b'Q';
    }
    mf.barrier(None, true, false, None).unwrap();

    let other = FileHandle::open(
        &path,
        Mode::Read,
        Creation::OpenExisting,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    let mut back = [0u8; 3];
    let mut rbufs = [Buffer::new(&mut back)];
    other.read(IoRequest::new(&mut rbufs, 0), None).unwrap();
    assert_eq!(&back, b"QYZ");
}

#[test]
fn mapped_file_reads_come_from_the_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zerocopy");
    std::fs::write(&path, b"ABCDEFGH").unwrap();
    let mf = MappedFileHandle::open(
        0,
        &path,
        Mode::Read,
        Creation::OpenExisting,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    let mut scratch = [0u8; 8];
    let mut bufs = [Buffer::new(&mut scratch)];
    let got = mf.read(IoRequest::new(&mut bufs, 0), None).unwrap();
    assert_eq!(bytes_transferred(got), 8);
    assert_eq!(got[0].as_slice(), b"ABCDEFGH");
    // Zero copy: the returned buffer aliases the map, not the scratch.
    assert_eq!(got[0].as_slice().as_ptr(), mf.address().cast_const());
}

#[test]
fn truncation_keeps_the_address_within_the_reservation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resize");
    let reservation = (page_size() * 16) as u64;
    let mut mf = MappedFileHandle::open(
        reservation,
        &path,
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();

    mf.truncate(reservation).unwrap();
    let addr = mf.address();
    assert_eq!(mf.mapped_length(), reservation);

    // Shrinking within the reservation leaves the mapping alone.
    mf.truncate(reservation / 2).unwrap();
    assert_eq!(mf.address(), addr);
    assert_eq!(mf.mapped_length(), reservation / 2);
    assert_eq!(mf.as_file().length().unwrap(), reservation / 2);

    // Growing past it re-reserves; the address is allowed to move.
    mf.truncate(reservation * 2).unwrap();
    assert_eq!(mf.mapped_length(), reservation * 2);
    assert_eq!(mf.as_file().length().unwrap(), reservation * 2);
}

#[test]
fn reserve_on_an_empty_file_is_an_invalid_seek() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty");
    let mut mf = MappedFileHandle::open(
        0,
        &path,
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    assert!(mf.address().is_null());
    let err = mf.reserve(page_size() as u64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSeek);
}

#[test]
fn truncate_to_zero_drops_the_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropme");
    let mut mf = MappedFileHandle::open(
        0,
        &path,
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    mf.truncate(page_size() as u64).unwrap();
    assert!(!mf.address().is_null());
    mf.truncate(0).unwrap();
    assert!(mf.address().is_null());
    assert_eq!(mf.as_file().length().unwrap(), 0);
}

#[test]
fn update_map_sees_third_party_growth() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grown-elsewhere");
    let reservation = (page_size() * 8) as u64;
    let mut mf = MappedFileHandle::open(
        reservation,
        &path,
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    mf.truncate(page_size() as u64).unwrap();

    // Someone else extends the file and writes past our view.
    let other = FileHandle::open(
        &path,
        Mode::Write,
        Creation::OpenExisting,
        Caching::All,
        HandleFlags::empty(),
    )
    .unwrap();
    other.truncate((page_size() * 2) as u64).unwrap();
    let marker = [0x5au8; 8];
    let mut bufs = [ConstBuffer::new(&marker)];
    other
        .write(IoRequest::new(&mut bufs, page_size() as u64), None)
        .unwrap();

    assert_eq!(mf.update_map().unwrap(), (page_size() * 2) as u64);
    unsafe {
        assert_eq!(*mf.address().add(page_size()), 0x5a);
    }
}

#[test]
fn do_not_store_discards_contents_safely() {
    let m = MapHandle::anonymous(
        page_size() * 4,
        SectionFlags::READ | SectionFlags::WRITE,
    )
    .unwrap();
    unsafe {
        m.as_ptr().write_bytes(0xff, m.len());
    }
    m.do_not_store(lofio::Extent::new(0, m.len() as u64)).unwrap();
    // The contents are unpredictable now, but the memory must still be
    // readable and writable.
    unsafe {
        let _ = m.as_ptr().read();
        m.as_ptr().write(1);
    }
}

#[test]
fn prefetch_is_a_harmless_hint() {
    let m = MapHandle::anonymous(page_size() * 2, SectionFlags::READ).unwrap();
    m.prefetch(&[lofio::Extent::new(0, m.len() as u64)]).unwrap();
}
