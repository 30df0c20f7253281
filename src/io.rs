//! Scatter/gather I/O, durability barriers and byte-range locks.

use std::marker::PhantomData;
use std::sync::OnceLock;
use std::time::Duration;

use smallvec::SmallVec;

use crate::deadline::Deadline;
use crate::deadline::DeadlineTracker;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::error::fatal;
use crate::error::track_fd;
use crate::handle::Handle;
use crate::handle::HandleFlags;

/// A byte region within a file's address space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// Byte offset of the region's start.
    pub offset: u64,
    /// Length of the region in bytes.
    pub length: u64,
}

impl Extent {
    /// A new extent.
    pub fn new(offset: u64, length: u64) -> Extent {
        Extent { offset, length }
    }
}

/// A mutable (pointer, length) pair describing one scatter destination.
///
/// Trivially copyable; the lifetime ties it to the memory it points into.
/// After a read the implementation shrinks lengths to what was filled, and
/// a memory-map implementation may replace the pointer with one into the
/// map.
#[derive(Clone, Copy, Debug)]
pub struct Buffer<'a> {
    ptr: *mut u8,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> Buffer<'a> {
    /// Describes `data` as a scatter destination.
    pub fn new(data: &'a mut [u8]) -> Buffer<'a> {
        Buffer {
            ptr: data.as_mut_ptr(),
            len: data.len(),
            _marker: PhantomData,
        }
    }

    /// Builds a buffer from raw parts.
    ///
    /// # Safety
    /// `ptr` must point to `len` bytes valid for reads and writes for `'a`.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Buffer<'a> {
        Buffer {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// The described memory.
    pub fn as_slice(&self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The described memory, mutably.
    pub fn as_mut_slice(&mut self) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub(crate) fn set_ptr(&mut self, ptr: *mut u8) {
        self.ptr = ptr;
    }
}

/// An immutable (pointer, length) pair describing one gather source.
#[derive(Clone, Copy, Debug)]
pub struct ConstBuffer<'a> {
    ptr: *const u8,
    len: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> ConstBuffer<'a> {
    /// Describes `data` as a gather source.
    pub fn new(data: &'a [u8]) -> ConstBuffer<'a> {
        ConstBuffer {
            ptr: data.as_ptr(),
            len: data.len(),
            _marker: PhantomData,
        }
    }

    /// Builds a buffer from raw parts.
    ///
    /// # Safety
    /// `ptr` must point to `len` bytes valid for reads for `'a`.
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> ConstBuffer<'a> {
        ConstBuffer {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// The described memory.
    pub fn as_slice(&self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<'a> From<&'a [u8]> for ConstBuffer<'a> {
    fn from(data: &'a [u8]) -> ConstBuffer<'a> {
        ConstBuffer::new(data)
    }
}

impl<'a> From<&'a mut [u8]> for Buffer<'a> {
    fn from(data: &'a mut [u8]) -> Buffer<'a> {
        Buffer::new(data)
    }
}

/// Common accessors over [`Buffer`] and [`ConstBuffer`].
pub trait IoBuffer {
    /// Length in bytes.
    fn len(&self) -> usize;
    /// True if the length is zero.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Start of the described memory.
    fn as_byte_ptr(&self) -> *const u8;
    /// Shrinks or grows the described length without touching the memory.
    fn set_len(&mut self, len: usize);
}

impl IoBuffer for Buffer<'_> {
    fn len(&self) -> usize {
        self.len
    }
    fn as_byte_ptr(&self) -> *const u8 {
        self.ptr
    }
    fn set_len(&mut self, len: usize) {
        self.len = len;
    }
}

impl IoBuffer for ConstBuffer<'_> {
    fn len(&self) -> usize {
        self.len
    }
    fn as_byte_ptr(&self) -> *const u8 {
        self.ptr
    }
    fn set_len(&mut self, len: usize) {
        self.len = len;
    }
}

/// Sums the byte lengths of a set of buffers, e.g. to learn how many bytes
/// an I/O actually transferred.
pub fn bytes_transferred<B: IoBuffer>(buffers: &[B]) -> u64 {
    buffers.iter().map(|b| b.len() as u64).sum()
}

/// A scatter or gather request: a set of buffers and the file offset the
/// transfer starts at.
#[derive(Debug)]
pub struct IoRequest<'r, B> {
    /// The scatter destinations or gather sources, in order.
    pub buffers: &'r mut [B],
    /// Absolute file offset of the transfer. Ignored by append-only
    /// handles, which always write at the end of the file.
    pub offset: u64,
}

impl<'r, B> IoRequest<'r, B> {
    /// A new request.
    pub fn new(buffers: &'r mut [B], offset: u64) -> IoRequest<'r, B> {
        IoRequest { buffers, offset }
    }
}

/// Largest number of buffers one scatter/gather call accepts.
pub(crate) fn iov_max() -> usize {
    static IOV_MAX: OnceLock<usize> = OnceLock::new();
    *IOV_MAX.get_or_init(|| {
        let n = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
        if n <= 0 { 1024 } else { n as usize }
    })
}

/// Granularity required of offsets, addresses and lengths on handles
/// opened for direct I/O.
const ALIGNED_IO_GRANULARITY: usize = 512;

fn check_aligned_io<B: IoBuffer>(offset: u64, buffers: &[B]) {
    assert_eq!(
        offset % ALIGNED_IO_GRANULARITY as u64,
        0,
        "direct i/o offset must be 512-byte aligned"
    );
    for b in buffers {
        assert_eq!(
            (b.as_byte_ptr() as usize) % ALIGNED_IO_GRANULARITY,
            0,
            "direct i/o buffer address must be 512-byte aligned"
        );
        assert_eq!(
            b.len() % ALIGNED_IO_GRANULARITY,
            0,
            "direct i/o buffer length must be a multiple of 512"
        );
    }
}

/// Applies `transferred` bytes across `buffers` in order, shrinking the
/// lengths of partially filled buffers, and returns how many buffers
/// received at least one byte.
fn apply_transfer<B: IoBuffer>(buffers: &mut [B], transferred: usize) -> usize {
    let mut remaining = transferred;
    let mut used = 0;
    for b in buffers.iter_mut() {
        if remaining == 0 {
            b.set_len(0);
            continue;
        }
        let take = b.len().min(remaining);
        b.set_len(take);
        remaining -= take;
        used += 1;
    }
    used
}

/// Handles supporting scatter/gather I/O, barriers and extent locks.
///
/// The default method bodies implement the file-descriptor path; memory
/// maps override `read` and `write` to serve from the mapped view.
pub trait IoHandle {
    /// The owning handle beneath this I/O surface.
    fn handle(&self) -> &Handle;

    /// Most buffers a single `read`/`write` accepts.
    fn max_buffers(&self) -> usize {
        iov_max()
    }

    /// Reads data into the request's buffers from the given offset.
    ///
    /// Returns the prefix of the buffers that received data, lengths
    /// shrunk to what was filled. The returned buffer pointers may differ
    /// from the inputs when the implementation is a memory map. A short
    /// transfer (e.g. at end of file) is not an error.
    fn read<'r, 'a>(
        &self,
        req: IoRequest<'r, Buffer<'a>>,
        deadline: Option<Deadline>,
    ) -> Result<&'r mut [Buffer<'a>]> {
        fd_read(self.handle(), req, deadline)
    }

    /// Writes the request's buffers at the given offset.
    ///
    /// Returns the prefix of the buffers written, lengths shrunk to what
    /// the kernel accepted.
    fn write<'r, 'a>(
        &self,
        req: IoRequest<'r, ConstBuffer<'a>>,
        deadline: Option<Deadline>,
    ) -> Result<&'r [ConstBuffer<'a>]> {
        fd_write(self.handle(), req, deadline)
    }

    /// Requests that data written before this call reach storage before
    /// data written after it.
    ///
    /// This is a hint with deliberately weak semantics: ordering is
    /// guaranteed only with respect to this handle, and `None` for `range`
    /// barriers the whole file. `wait_for_device` asks for the barrier to
    /// reach non-volatile storage before returning; `and_metadata` flushes
    /// the inode's metadata as well as its data.
    fn barrier(
        &self,
        range: Option<Extent>,
        wait_for_device: bool,
        and_metadata: bool,
        deadline: Option<Deadline>,
    ) -> Result<()> {
        fd_barrier(self.handle(), range, wait_for_device, and_metadata, deadline)
    }

    /// Acquires an advisory lock over `[offset, offset + length)`.
    ///
    /// A `length` of zero locks the entire file. The top bit of `offset`
    /// is masked out, so callers may lock ranges beyond any real file
    /// extent to coordinate without colliding with actual I/O. A zero
    /// deadline returns `TimedOut` immediately on contention. The returned
    /// guard releases the lock on drop.
    ///
    /// If lock acquisition had to fall back to process-wide POSIX locks,
    /// [`HandleFlags::BYTE_LOCK_INSANITY`] is set on the handle: closing
    /// any descriptor to the inode then drops every lock this process
    /// holds on it.
    fn lock(
        &self,
        offset: u64,
        length: u64,
        exclusive: bool,
        deadline: Option<Deadline>,
    ) -> Result<ExtentGuard<'_>> {
        fd_lock(self.handle(), offset, length, exclusive, deadline)
    }

    /// Releases a lock previously acquired over exactly `(offset, length)`.
    ///
    /// Infallible by contract: an unlock the OS refuses implies corrupt
    /// lock state, and the process aborts.
    fn unlock(&self, offset: u64, length: u64) {
        fd_unlock(self.handle(), offset, length, false);
    }
}

impl IoHandle for Handle {
    fn handle(&self) -> &Handle {
        self
    }
}

/// Releases a byte-range lock when dropped.
#[derive(Debug)]
pub struct ExtentGuard<'a> {
    handle: &'a Handle,
    offset: u64,
    length: u64,
    exclusive: bool,
    via_flock: bool,
    armed: bool,
}

impl ExtentGuard<'_> {
    /// Start of the locked region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the locked region; zero means the entire file.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// True if this is an exclusive lock.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Disarms the guard without releasing the lock, leaving release to
    /// some other party (e.g. close of the file description).
    pub fn detach(mut self) {
        self.armed = false;
    }
}

impl Drop for ExtentGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            fd_unlock(self.handle, self.offset, self.length, self.via_flock);
        }
    }
}

pub(crate) fn fd_read<'r, 'a>(
    h: &Handle,
    req: IoRequest<'r, Buffer<'a>>,
    deadline: Option<Deadline>,
) -> Result<&'r mut [Buffer<'a>]> {
    let _ctx = track_fd(h.fd());
    let IoRequest { buffers, offset } = req;
    if deadline.is_some() {
        // Deadlines on synchronous scatter reads need a multiplexable
        // handle, which no POSIX file descriptor is.
        return Err(Error::new(ErrorKind::OperationNotSupported));
    }
    if buffers.len() > iov_max() {
        return Err(Error::new(ErrorKind::ArgumentListTooLong));
    }
    if h.requires_aligned_io() {
        check_aligned_io(offset, buffers);
    }
    let iov: SmallVec<[libc::iovec; 8]> = buffers
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_byte_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let n = loop {
        let rc = unsafe {
            libc::preadv(
                h.fd(),
                iov.as_ptr(),
                iov.len() as libc::c_int,
                offset as libc::off_t,
            )
        };
        if rc >= 0 {
            break rc as usize;
        }
        let err = Error::last_os_error();
        if err.os_error() != libc::EINTR {
            return Err(err);
        }
    };
    let used = apply_transfer(buffers, n);
    Ok(&mut buffers[..used])
}

pub(crate) fn fd_write<'r, 'a>(
    h: &Handle,
    req: IoRequest<'r, ConstBuffer<'a>>,
    deadline: Option<Deadline>,
) -> Result<&'r [ConstBuffer<'a>]> {
    let _ctx = track_fd(h.fd());
    let IoRequest { buffers, offset } = req;
    if deadline.is_some() {
        return Err(Error::new(ErrorKind::OperationNotSupported));
    }
    if buffers.len() > iov_max() {
        return Err(Error::new(ErrorKind::ArgumentListTooLong));
    }
    if h.requires_aligned_io() {
        check_aligned_io(offset, buffers);
    }
    let iov: SmallVec<[libc::iovec; 8]> = buffers
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_byte_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    // Append handles must go through the current-position write path:
    // only there does O_APPEND guarantee the atomic write-at-end, and
    // POSIX says positional writes ignore O_APPEND entirely.
    let n = loop {
        let rc = if h.is_append_only() {
            unsafe { libc::writev(h.fd(), iov.as_ptr(), iov.len() as libc::c_int) }
        } else {
            unsafe {
                libc::pwritev(
                    h.fd(),
                    iov.as_ptr(),
                    iov.len() as libc::c_int,
                    offset as libc::off_t,
                )
            }
        };
        if rc >= 0 {
            break rc as usize;
        }
        let err = Error::last_os_error();
        if err.os_error() != libc::EINTR {
            return Err(err);
        }
    };
    let used = apply_transfer(buffers, n);
    Ok(&buffers[..used])
}

pub(crate) fn fd_barrier(
    h: &Handle,
    range: Option<Extent>,
    wait_for_device: bool,
    and_metadata: bool,
    _deadline: Option<Deadline>,
) -> Result<()> {
    let _ctx = track_fd(h.fd());
    #[cfg(target_os = "linux")]
    {
        if !wait_for_device && !and_metadata {
            if let Some(r) = range {
                let rc = unsafe {
                    libc::sync_file_range(
                        h.fd(),
                        r.offset as libc::off64_t,
                        r.length as libc::off64_t,
                        libc::SYNC_FILE_RANGE_WRITE,
                    )
                };
                if rc == 0 {
                    return Ok(());
                }
                // Some filesystems lack it; fall through to fdatasync.
            }
        }
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        let _ = range;
        if wait_for_device {
            // The only call Darwin promises reaches non-volatile storage.
            if unsafe { libc::fcntl(h.fd(), libc::F_FULLFSYNC) } != -1 {
                return Ok(());
            }
            // Not every filesystem implements it; fsync is the best left.
        }
        if unsafe { libc::fsync(h.fd()) } == -1 {
            return Err(Error::last_os_error());
        }
        return Ok(());
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    {
        let _ = range;
        let rc = if and_metadata {
            unsafe { libc::fsync(h.fd()) }
        } else {
            unsafe { libc::fdatasync(h.fd()) }
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

const LOCK_RETRY_SLICE: Duration = Duration::from_millis(10);

fn flock_record(offset: u64, length: u64, typ: libc::c_short) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = typ;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = length as libc::off_t;
    fl
}

/// One lock attempt: `Ok(true)` locked, `Ok(false)` contended.
fn setlk(
    fd: libc::c_int,
    cmd: libc::c_int,
    fl: &mut libc::flock,
) -> Result<bool> {
    loop {
        if unsafe { libc::fcntl(fd, cmd, fl as *mut libc::flock) } == 0 {
            return Ok(true);
        }
        let err = Error::last_os_error();
        match err.os_error() {
            libc::EINTR => continue,
            libc::EAGAIN | libc::EACCES => return Ok(false),
            _ => return Err(err),
        }
    }
}

pub(crate) fn fd_lock<'a>(
    h: &'a Handle,
    offset: u64,
    length: u64,
    exclusive: bool,
    deadline: Option<Deadline>,
) -> Result<ExtentGuard<'a>> {
    let _ctx = track_fd(h.fd());
    // POSIX offsets are signed; masking the top bit lets callers lock
    // ranges that can never collide with real file contents.
    let offset = offset & !(1u64 << 63);
    let tracker = DeadlineTracker::new(deadline);
    let typ = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK } as libc::c_short;

    let guard = |via_flock: bool| ExtentGuard {
        handle: h,
        offset,
        length,
        exclusive,
        via_flock,
        armed: true,
    };

    // Whole-file locks on systems without fd-scoped record locks go
    // through flock(), whose locks are scoped to the open file
    // description rather than the process.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    if length == 0 {
        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        loop {
            let try_op = if deadline.is_none() { op } else { op | libc::LOCK_NB };
            if unsafe { libc::flock(h.fd(), try_op) } == 0 {
                return Ok(guard(true));
            }
            let err = Error::last_os_error();
            match err.os_error() {
                libc::EINTR => continue,
                libc::EWOULDBLOCK => {
                    tracker.check()?;
                    std::thread::sleep(
                        tracker
                            .remaining()
                            .unwrap_or(LOCK_RETRY_SLICE)
                            .min(LOCK_RETRY_SLICE),
                    );
                }
                _ => return Err(err),
            }
        }
    }

    // Linux: open-file-description locks first. They are scoped to the
    // file description, so two handles in one process genuinely contend.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut fl = flock_record(offset, length, typ);
        let cmd = if deadline.is_none() {
            libc::F_OFD_SETLKW
        } else {
            libc::F_OFD_SETLK
        };
        loop {
            match setlk(h.fd(), cmd, &mut fl) {
                Ok(true) => return Ok(guard(false)),
                Ok(false) => {
                    tracker.check()?;
                    std::thread::sleep(
                        tracker
                            .remaining()
                            .unwrap_or(LOCK_RETRY_SLICE)
                            .min(LOCK_RETRY_SLICE),
                    );
                }
                Err(e) if e.os_error() == libc::EINVAL => {
                    // Pre-3.15 kernel. Fall back below.
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Process-wide POSIX record locks. Mark the handle so callers can see
    // that close-by-any-descriptor-unlocks-everything semantics apply.
    h.insert_flags(HandleFlags::BYTE_LOCK_INSANITY);
    let mut fl = flock_record(offset, length, typ);
    let cmd = if deadline.is_none() { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        match setlk(h.fd(), cmd, &mut fl) {
            Ok(true) => return Ok(guard(false)),
            Ok(false) => {
                tracker.check()?;
                std::thread::sleep(
                    tracker
                        .remaining()
                        .unwrap_or(LOCK_RETRY_SLICE)
                        .min(LOCK_RETRY_SLICE),
                );
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn fd_unlock(h: &Handle, offset: u64, length: u64, via_flock: bool) {
    let offset = offset & !(1u64 << 63);
    if via_flock {
        if unsafe { libc::flock(h.fd(), libc::LOCK_UN) } == -1 {
            fatal("flock unlock failed", &Error::last_os_error());
        }
        return;
    }
    let mut fl = flock_record(offset, length, libc::F_UNLCK as libc::c_short);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let cmd = if h.flags().contains(HandleFlags::BYTE_LOCK_INSANITY) {
        libc::F_SETLK
    } else {
        libc::F_OFD_SETLK
    };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let cmd = libc::F_SETLK;
    if unsafe { libc::fcntl(h.fd(), cmd, &mut fl as *mut libc::flock) } == -1 {
        fatal("byte-range unlock failed", &Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_accounting_shrinks_partial_buffers() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut c = [0u8; 4];
        let mut bufs = [
            Buffer::new(&mut a),
            Buffer::new(&mut b),
            Buffer::new(&mut c),
        ];
        // Six bytes: the first buffer full, the second half-filled.
        let used = apply_transfer(&mut bufs, 6);
        assert_eq!(used, 2);
        assert_eq!(bufs[0].len(), 4);
        assert_eq!(bufs[1].len(), 2);
        assert_eq!(bufs[2].len(), 0);
        assert_eq!(bytes_transferred(&bufs[..used]), 6);
    }

    #[test]
    fn transfer_accounting_handles_zero_bytes() {
        let mut a = [0u8; 4];
        let mut bufs = [Buffer::new(&mut a)];
        assert_eq!(apply_transfer(&mut bufs, 0), 0);
        assert_eq!(bufs[0].len(), 0);
    }

    #[test]
    fn iov_max_is_sane() {
        assert!(iov_max() >= 16);
    }

    #[test]
    fn const_buffers_describe_their_source() {
        let data = b"hello".as_slice();
        let b = ConstBuffer::new(data);
        assert_eq!(b.as_slice(), b"hello");
        assert_eq!(b.len(), 5);
    }
}
