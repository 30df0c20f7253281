//! The owning handle: lifetime, caching policy, cloning and path lookup.

use std::cell::Cell;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use bitflags::bitflags;

use crate::error::Error;
use crate::error::Result;
use crate::error::fatal;
use crate::error::track_fd;
use crate::native_handle::Disposition;
use crate::native_handle::NativeHandle;

/// Kernel caching policy for a handle.
///
/// The low bit of the discriminant encodes "issue safety fsyncs around
/// close and truncation", which is what
/// [`Handle::are_safety_fsyncs_issued`] consults.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Caching {
    /// Keep whatever the handle already has (only meaningful for reopens).
    Unchanged = 0,
    /// No caching whatsoever: data and metadata reach storage on every
    /// write (`O_DIRECT | O_SYNC`).
    None = 1,
    /// Only metadata is cached; data bypasses the page cache (`O_DIRECT`).
    OnlyMetadata = 2,
    /// Reads are cached, writes are written through (`O_SYNC`).
    Reads = 3,
    /// Reads and writes are cached; durability only via explicit barriers.
    All = 4,
    /// Reads and metadata cached, write data written through (`O_DSYNC`).
    ReadsAndMetadata = 5,
    /// Fully cached and the filesystem may aggressively delay allocation;
    /// intended for files that rarely survive the process.
    Temporary = 6,
    /// Fully cached, plus an fsync on close and truncation.
    SafetyFsyncs = 7,
}

impl Caching {
    /// True if this policy implies fsyncs around close and truncation.
    pub fn implies_safety_fsyncs(self) -> bool {
        (self as u8) & 1 != 0
    }
}

bitflags! {
    /// Per-handle behaviour switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HandleFlags: u32 {
        /// Unlink the file on last handle close.
        const UNLINK_ON_CLOSE = 1 << 0;
        /// Suppress the fsyncs otherwise implied by the caching policy.
        const DISABLE_SAFETY_FSYNCS = 1 << 1;
        /// Skip the inode identity capture at open, and with it the
        /// third-party-rename checks in relink and unlink.
        const DISABLE_SAFETY_UNLINKS = 1 << 2;
        /// Ask the kernel not to read ahead on this handle.
        const DISABLE_PREFETCHING = 1 << 3;
        /// Ask the kernel to read ahead aggressively on this handle.
        const MAXIMUM_PREFETCHING = 1 << 4;
        /// Set when byte-range locking fell back to process-wide POSIX
        /// locks, where closing any descriptor to the inode drops every
        /// lock this process holds on it.
        const BYTE_LOCK_INSANITY = 1 << 5;
        /// The inode has no path and ceases to exist on last close.
        const ANONYMOUS_INODE = 1 << 6;
    }
}

/// Owns a [`NativeHandle`] and closes it on drop.
///
/// Closing issues a preceding fsync when the caching policy requires
/// durability barriers. A close-time I/O failure is treated as fatal:
/// silently losing buffered data is worse than terminating.
#[derive(Debug)]
pub struct Handle {
    native: NativeHandle,
    caching: Caching,
    flags: Cell<HandleFlags>,
}

impl Handle {
    pub(crate) fn new(
        native: NativeHandle,
        caching: Caching,
        flags: HandleFlags,
    ) -> Handle {
        Handle {
            native,
            caching,
            flags: Cell::new(flags),
        }
    }

    /// The tagged descriptor.
    pub fn native_handle(&self) -> NativeHandle {
        self.native
    }

    /// The raw file descriptor.
    pub fn fd(&self) -> RawFd {
        self.native.fd
    }

    /// The caching policy this handle was opened with.
    pub fn caching(&self) -> Caching {
        self.caching
    }

    /// The behaviour switches on this handle.
    pub fn flags(&self) -> HandleFlags {
        self.flags.get()
    }

    pub(crate) fn insert_flags(&self, extra: HandleFlags) {
        self.flags.set(self.flags.get() | extra);
    }

    /// True if the handle is open.
    pub fn is_valid(&self) -> bool {
        self.native.is_valid()
    }

    /// True if reads are permitted.
    pub fn is_readable(&self) -> bool {
        self.native.is_readable()
    }

    /// True if writes are permitted.
    pub fn is_writable(&self) -> bool {
        self.native.is_writable()
    }

    /// True if all writes go to the end of the file.
    pub fn is_append_only(&self) -> bool {
        self.native.is_append_only()
    }

    /// True if I/O must be sector-aligned.
    pub fn requires_aligned_io(&self) -> bool {
        self.native.requires_aligned_io()
    }

    /// True if close and truncation are preceded by an fsync.
    pub fn are_safety_fsyncs_issued(&self) -> bool {
        !self.flags.get().contains(HandleFlags::DISABLE_SAFETY_FSYNCS)
            && self.caching.implies_safety_fsyncs()
    }

    /// Closes the handle.
    ///
    /// Close-time I/O failures abort the process, so the returned result is
    /// only an interface convention.
    pub fn close(mut self) -> Result<()> {
        self.close_impl();
        Ok(())
    }

    fn close_impl(&mut self) {
        if !self.native.is_valid() {
            return;
        }
        let fd = self.native.fd;
        if self.are_safety_fsyncs_issued() && self.native.is_writable() {
            if unsafe { libc::fsync(fd) } == -1 {
                fatal("fsync before close failed", &Error::last_os_error());
            }
        }
        if unsafe { libc::close(fd) } == -1 {
            fatal("close failed", &Error::last_os_error());
        }
        self.native = NativeHandle::invalid();
    }

    /// Duplicates the handle. The clone refers to the same open file
    /// description, so it shares the file position and byte-range locks.
    pub fn try_clone(&self) -> Result<Handle> {
        let _ctx = track_fd(self.fd());
        let fd = unsafe { libc::fcntl(self.fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if fd == -1 {
            return Err(Error::last_os_error());
        }
        Ok(Handle {
            native: NativeHandle::new(fd, self.native.disposition),
            caching: self.caching,
            flags: Cell::new(self.flags.get()),
        })
    }

    /// Asks the kernel for its current name for the open inode.
    ///
    /// Returns the empty path when the inode is no longer linked anywhere in
    /// the filesystem. This call is expensive and inherently racy: the name
    /// may be stale by the time it is returned. Callers needing a stable
    /// anchor should hold a [`PathHandle`](crate::PathHandle) instead.
    pub fn current_path(&self) -> Result<PathBuf> {
        let _ctx = track_fd(self.fd());
        fd_current_path(self.fd())
    }

    /// Toggles append-only on the open file description.
    pub fn set_append_only(&mut self, enable: bool) -> Result<()> {
        let _ctx = track_fd(self.fd());
        let fl = unsafe { libc::fcntl(self.fd(), libc::F_GETFL) };
        if fl == -1 {
            return Err(Error::last_os_error());
        }
        let new = if enable {
            fl | libc::O_APPEND
        } else {
            fl & !libc::O_APPEND
        };
        if unsafe { libc::fcntl(self.fd(), libc::F_SETFL, new) } == -1 {
            return Err(Error::last_os_error());
        }
        if enable {
            self.native.disposition |= Disposition::APPEND_ONLY;
        } else {
            self.native.disposition -= Disposition::APPEND_ONLY;
        }
        Ok(())
    }

    /// Gives up ownership of the descriptor without closing it.
    pub(crate) fn release(&mut self) -> NativeHandle {
        self.native.take()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close_impl();
    }
}

/// `current_path()` for a raw descriptor. Also used by error construction,
/// so it must never itself capture paths (the caller holds the re-entry
/// guard).
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn fd_current_path(fd: RawFd) -> Result<PathBuf> {
    let link = format!("/proc/self/fd/{fd}");
    let path = std::fs::read_link(&link)
        .map_err(|e| Error::from_errno(e.raw_os_error().unwrap_or(libc::EIO)))?;
    // The kernel appends this marker once the inode has no remaining links.
    // A live file whose real name ends the same way is indistinguishable;
    // that ambiguity is inherent to the /proc interface.
    if path.as_os_str().as_bytes().ends_with(b" (deleted)") {
        return Ok(PathBuf::new());
    }
    Ok(path)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn fd_current_path(fd: RawFd) -> Result<PathBuf> {
    use std::ffi::OsStr;
    use std::mem::MaybeUninit;

    let mut stat = MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == -1 {
        return Err(Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };

    let mut buf = [0u8; libc::PATH_MAX as usize];
    if unsafe { libc::fcntl(fd, libc::F_GETPATH, buf.as_mut_ptr()) } == -1 {
        return Err(Error::last_os_error());
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let path = PathBuf::from(OsStr::from_bytes(&buf[..len]));

    // F_GETPATH can return the name the inode had before it was unlinked,
    // or a name since reused by a different inode. lstat and compare.
    let mut verify = MaybeUninit::<libc::stat>::uninit();
    let cpath = match std::ffi::CString::new(path.as_os_str().as_bytes()) {
        Ok(c) => c,
        Err(_) => return Ok(PathBuf::new()),
    };
    if unsafe { libc::lstat(cpath.as_ptr(), verify.as_mut_ptr()) } == -1 {
        return Ok(PathBuf::new());
    }
    let verify = unsafe { verify.assume_init() };
    if verify.st_dev != stat.st_dev || verify.st_ino != stat.st_ino {
        return Ok(PathBuf::new());
    }
    Ok(path)
}

#[cfg(target_os = "freebsd")]
pub(crate) fn fd_current_path(fd: RawFd) -> Result<PathBuf> {
    use std::ffi::OsStr;
    use std::mem::MaybeUninit;

    let mut kif = MaybeUninit::<libc::kinfo_file>::zeroed();
    unsafe {
        (*kif.as_mut_ptr()).kf_structsize = libc::KINFO_FILE_SIZE;
    }
    if unsafe { libc::fcntl(fd, libc::F_KINFO, kif.as_mut_ptr()) } == -1 {
        return Err(Error::last_os_error());
    }
    let kif = unsafe { kif.assume_init() };
    let bytes: &[u8] = unsafe {
        std::slice::from_raw_parts(kif.kf_path.as_ptr().cast(), kif.kf_path.len())
    };
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    // An empty name means the kernel name cache has no entry, which is
    // indistinguishable from the inode having been deleted.
    Ok(PathBuf::from(OsStr::from_bytes(&bytes[..len])))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
)))]
pub(crate) fn fd_current_path(_fd: RawFd) -> Result<PathBuf> {
    Err(Error::new(crate::error::ErrorKind::OperationNotSupported))
}
