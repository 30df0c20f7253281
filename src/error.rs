//! Error type and the per-thread path-capture ring.
//!
//! Every fallible operation returns [`Result<T>`]. Errors are cheap trivial
//! values: a kind, the originating errno, and an index into a per-thread
//! ring of recently captured handle paths. Capturing the path at
//! construction time keeps diagnostics readable ("open of /x/y failed")
//! without making the error itself own an allocation on every hot path.

use std::cell::Cell;
use std::cell::RefCell;
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::thread::ThreadId;

use libc::c_int;

/// Result of every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Portable classification of an OS failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The file or directory already exists (`EEXIST`).
    FileExists,
    /// No such file or directory (`ENOENT`).
    NotFound,
    /// Permission denied (`EACCES`, `EPERM`).
    PermissionDenied,
    /// The subject is a directory (`EISDIR`).
    IsADirectory,
    /// The subject is not a directory (`ENOTDIR`).
    NotADirectory,
    /// A deadline expired before the operation could complete.
    TimedOut,
    /// The operation was cancelled in flight (`ECANCELED`).
    OperationCanceled,
    /// An argument was invalid (`EINVAL`).
    InvalidArgument,
    /// Too many scatter/gather buffers for one call (`E2BIG`).
    ArgumentListTooLong,
    /// A value did not fit the requested representation (`EOVERFLOW`).
    ValueTooLarge,
    /// Out of memory or address space (`ENOMEM`).
    OutOfMemory,
    /// The filesystem cannot do this (`ENOTSUP`).
    NotSupported,
    /// This handle or platform cannot do this (`EOPNOTSUPP`).
    OperationNotSupported,
    /// Transient contention, retry later (`EAGAIN`).
    TryAgain,
    /// A seek or mapping on an object with no length (`ESPIPE`).
    InvalidSeek,
    /// Any errno the taxonomy above does not cover.
    Other,
}

impl ErrorKind {
    fn from_errno(errno: c_int) -> ErrorKind {
        match errno {
            libc::EEXIST => ErrorKind::FileExists,
            libc::ENOENT => ErrorKind::NotFound,
            libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
            libc::EISDIR => ErrorKind::IsADirectory,
            libc::ENOTDIR => ErrorKind::NotADirectory,
            libc::ETIMEDOUT => ErrorKind::TimedOut,
            libc::ECANCELED => ErrorKind::OperationCanceled,
            libc::EINVAL => ErrorKind::InvalidArgument,
            libc::E2BIG => ErrorKind::ArgumentListTooLong,
            libc::EOVERFLOW => ErrorKind::ValueTooLarge,
            libc::ENOMEM => ErrorKind::OutOfMemory,
            libc::ENOTSUP => ErrorKind::NotSupported,
            libc::ENOSYS => ErrorKind::OperationNotSupported,
            libc::EAGAIN => ErrorKind::TryAgain,
            libc::ESPIPE => ErrorKind::InvalidSeek,
            _ => ErrorKind::Other,
        }
    }

    fn default_errno(self) -> c_int {
        match self {
            ErrorKind::FileExists => libc::EEXIST,
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::PermissionDenied => libc::EACCES,
            ErrorKind::IsADirectory => libc::EISDIR,
            ErrorKind::NotADirectory => libc::ENOTDIR,
            ErrorKind::TimedOut => libc::ETIMEDOUT,
            ErrorKind::OperationCanceled => libc::ECANCELED,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::ArgumentListTooLong => libc::E2BIG,
            ErrorKind::ValueTooLarge => libc::EOVERFLOW,
            ErrorKind::OutOfMemory => libc::ENOMEM,
            ErrorKind::NotSupported => libc::ENOTSUP,
            ErrorKind::OperationNotSupported => libc::ENOSYS,
            ErrorKind::TryAgain => libc::EAGAIN,
            ErrorKind::InvalidSeek => libc::ESPIPE,
            ErrorKind::Other => libc::EIO,
        }
    }
}

/// Reference into the thread-local path ring, valid only on the thread that
/// constructed the error and only until the ring wraps.
#[derive(Clone, Copy, Debug)]
struct PathCapture {
    thread: ThreadId,
    seq: u32,
}

/// An OS failure with portable classification and captured path context.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    errno: c_int,
    capture: Option<PathCapture>,
}

impl Error {
    /// Synthesizes an error of the given kind.
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            errno: kind.default_errno(),
            capture: capture_active_path(),
        }
    }

    /// Builds an error from a raw `errno` value.
    pub fn from_errno(errno: c_int) -> Error {
        Error {
            kind: ErrorKind::from_errno(errno),
            errno,
            capture: capture_active_path(),
        }
    }

    /// Builds an error from the calling thread's current `errno`.
    pub fn last_os_error() -> Error {
        Error::from_errno(
            std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
        )
    }

    /// The portable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The raw errno this error was built from.
    pub fn os_error(&self) -> c_int {
        self.errno
    }

    /// Human-readable description of the failure.
    pub fn message(&self) -> String {
        std::io::Error::from_raw_os_error(self.errno).to_string()
    }

    /// The path of the handle that was active when this error was
    /// constructed.
    ///
    /// Returns `None` when queried from a different thread, or once the
    /// capture ring has wrapped past the slot, or when no handle was active.
    pub fn path(&self) -> Option<PathBuf> {
        let capture = self.capture?;
        if capture.thread != std::thread::current().id() {
            return None;
        }
        PATH_RING.with(|ring| ring.borrow().lookup(capture.seq))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(p) if !p.as_os_str().is_empty() => {
                write!(f, "{} [{}]", self.message(), p.display())
            }
            _ => write!(f, "{}", self.message()),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> std::io::Error {
        std::io::Error::from_raw_os_error(e.errno)
    }
}

const RING_SLOTS: usize = 16;
const SLOT_BYTES: usize = 190;

struct PathSlot {
    buf: [u8; SLOT_BYTES],
    len: u8,
}

impl PathSlot {
    const fn empty() -> PathSlot {
        PathSlot {
            buf: [0; SLOT_BYTES],
            len: 0,
        }
    }
}

struct PathRing {
    slots: [PathSlot; RING_SLOTS],
    seq: u32,
}

impl PathRing {
    fn store(&mut self, path: &OsStr) -> u32 {
        let seq = self.seq;
        let slot = &mut self.slots[(seq as usize) % RING_SLOTS];
        let bytes = path.as_bytes();
        // Keep the tail of overlong paths; the leaf is the useful part.
        let keep = bytes.len().min(SLOT_BYTES);
        let tail = &bytes[bytes.len() - keep..];
        slot.buf[..keep].copy_from_slice(tail);
        slot.len = keep as u8;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn lookup(&self, seq: u32) -> Option<PathBuf> {
        if self.seq.wrapping_sub(seq) > RING_SLOTS as u32 {
            // Overwritten since capture.
            return None;
        }
        let slot = &self.slots[(seq as usize) % RING_SLOTS];
        let bytes = &slot.buf[..slot.len as usize];
        Some(PathBuf::from(OsStr::from_bytes(bytes)))
    }
}

thread_local! {
    static PATH_RING: RefCell<PathRing> = RefCell::new(PathRing {
        slots: [const { PathSlot::empty() }; RING_SLOTS],
        seq: 0,
    });
    static ACTIVE_FD: Cell<RawFd> = const { Cell::new(-1) };
    static REENTERED: Cell<bool> = const { Cell::new(false) };
}

/// Captures the active handle's current path into the ring, if a handle is
/// active and we are not already inside a capture.
fn capture_active_path() -> Option<PathCapture> {
    let fd = ACTIVE_FD.with(|a| a.get());
    if fd < 0 {
        return None;
    }
    if REENTERED.with(|r| r.replace(true)) {
        // current_path() itself failed; do not recurse.
        return None;
    }
    let path = crate::handle::fd_current_path(fd).unwrap_or_default();
    REENTERED.with(|r| r.set(false));
    let seq = PATH_RING.with(|ring| ring.borrow_mut().store(path.as_os_str()));
    Some(PathCapture {
        thread: std::thread::current().id(),
        seq,
    })
}

/// Marks a handle's fd as the active error context for the enclosing scope.
pub(crate) struct ActiveFdGuard {
    prev: RawFd,
}

impl Drop for ActiveFdGuard {
    fn drop(&mut self) {
        ACTIVE_FD.with(|a| a.set(self.prev));
    }
}

pub(crate) fn track_fd(fd: RawFd) -> ActiveFdGuard {
    let prev = ACTIVE_FD.with(|a| a.replace(fd));
    ActiveFdGuard { prev }
}

/// Logs and aborts. Used where continuing would corrupt handle or lock
/// state: close-time I/O failures, failed unlocks, and cancellation drains.
pub(crate) fn fatal(context: &str, err: &dyn fmt::Display) -> ! {
    log::error!("lofio fatal: {context}: {err}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_through_kind() {
        let e = Error::from_errno(libc::EEXIST);
        assert_eq!(e.kind(), ErrorKind::FileExists);
        assert_eq!(e.os_error(), libc::EEXIST);

        let e = Error::new(ErrorKind::TimedOut);
        assert_eq!(e.os_error(), libc::ETIMEDOUT);
    }

    #[test]
    fn unknown_errnos_classify_as_other() {
        let e = Error::from_errno(libc::EXDEV);
        assert_eq!(e.kind(), ErrorKind::Other);
        assert_eq!(e.os_error(), libc::EXDEV);
    }

    #[test]
    fn path_absent_without_active_handle() {
        let e = Error::new(ErrorKind::NotFound);
        assert_eq!(e.path(), None);
    }

    #[test]
    fn ring_wraps_after_sixteen_captures() {
        PATH_RING.with(|ring| {
            let seq = ring.borrow_mut().store(OsStr::new("/tmp/seen"));
            for _ in 0..RING_SLOTS {
                ring.borrow_mut().store(OsStr::new("/tmp/overwriter"));
            }
            assert_eq!(ring.borrow().lookup(seq), None);
        });
    }

    #[test]
    fn overlong_paths_keep_the_tail() {
        PATH_RING.with(|ring| {
            let long = format!("/{}/leaf", "x".repeat(300));
            let seq = ring.borrow_mut().store(OsStr::new(&long));
            let got = ring.borrow().lookup(seq).unwrap();
            let s = got.to_string_lossy().into_owned();
            assert_eq!(s.len(), SLOT_BYTES);
            assert!(s.ends_with("/leaf"));
        });
    }
}
