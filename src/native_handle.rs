//! The tagged native descriptor underneath every handle.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

bitflags! {
    /// What a native handle is and what it can do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Disposition: u32 {
        /// Reads are permitted.
        const READABLE = 1 << 0;
        /// Writes are permitted.
        const WRITABLE = 1 << 1;
        /// All writes go to the end of the file, atomically per write.
        const APPEND_ONLY = 1 << 2;
        /// I/O on this handle is multiplexable by a reactor.
        const OVERLAPPED = 1 << 3;
        /// The handle has a seek pointer and positional I/O.
        const SEEKABLE = 1 << 4;
        /// I/O must be sector-aligned (buffer address, length and offset).
        const ALIGNED_IO = 1 << 5;

        /// Refers to a regular file.
        const FILE = 1 << 8;
        /// Refers to a directory.
        const DIRECTORY = 1 << 9;
        /// Refers to a symbolic link.
        const SYMLINK = 1 << 10;
        /// Refers to an i/o multiplexer.
        const MULTIPLEXER = 1 << 11;
        /// Refers to a process.
        const PROCESS = 1 << 12;
        /// Refers to a memory section.
        const SECTION = 1 << 13;
    }
}

/// A plain value pairing an OS file descriptor with its [`Disposition`].
///
/// This is a non-owning value type: dropping it does not close anything.
/// Lifetime is the business of the owning [`Handle`](crate::Handle).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NativeHandle {
    /// What this descriptor is and can do.
    pub disposition: Disposition,
    /// The OS file descriptor, or [`NativeHandle::INVALID_FD`].
    pub fd: RawFd,
}

impl NativeHandle {
    /// The sentinel descriptor value.
    pub const INVALID_FD: RawFd = -1;

    /// A new tagged descriptor.
    pub fn new(fd: RawFd, disposition: Disposition) -> NativeHandle {
        NativeHandle { fd, disposition }
    }

    /// The invalid descriptor.
    pub const fn invalid() -> NativeHandle {
        NativeHandle {
            disposition: Disposition::empty(),
            fd: NativeHandle::INVALID_FD,
        }
    }

    /// True iff the descriptor is not the sentinel and the disposition is
    /// nonzero.
    pub fn is_valid(&self) -> bool {
        self.fd != NativeHandle::INVALID_FD && !self.disposition.is_empty()
    }

    /// True if reads are permitted.
    pub fn is_readable(&self) -> bool {
        self.disposition.contains(Disposition::READABLE)
    }

    /// True if writes are permitted.
    pub fn is_writable(&self) -> bool {
        self.disposition.contains(Disposition::WRITABLE)
    }

    /// True if all writes go to the end of the file.
    pub fn is_append_only(&self) -> bool {
        self.disposition.contains(Disposition::APPEND_ONLY)
    }

    /// True if a reactor can multiplex this handle.
    pub fn is_overlapped(&self) -> bool {
        self.disposition.contains(Disposition::OVERLAPPED)
    }

    /// True if the handle has positional I/O.
    pub fn is_seekable(&self) -> bool {
        self.disposition.contains(Disposition::SEEKABLE)
    }

    /// True if I/O must be sector-aligned.
    pub fn requires_aligned_io(&self) -> bool {
        self.disposition.contains(Disposition::ALIGNED_IO)
    }

    /// True if this refers to a regular file.
    pub fn is_regular(&self) -> bool {
        self.disposition.contains(Disposition::FILE)
    }

    /// True if this refers to a directory.
    pub fn is_directory(&self) -> bool {
        self.disposition.contains(Disposition::DIRECTORY)
    }

    /// True if this refers to a memory section.
    pub fn is_section(&self) -> bool {
        self.disposition.contains(Disposition::SECTION)
    }

    /// Resets to the invalid value, returning the old contents.
    pub fn take(&mut self) -> NativeHandle {
        std::mem::replace(self, NativeHandle::invalid())
    }
}

impl Default for NativeHandle {
    fn default() -> NativeHandle {
        NativeHandle::invalid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_needs_fd_and_disposition() {
        assert!(!NativeHandle::invalid().is_valid());
        // A real-looking fd with no disposition is still invalid.
        assert!(!NativeHandle::new(3, Disposition::empty()).is_valid());
        // A disposition with the sentinel fd is still invalid.
        assert!(
            !NativeHandle::new(NativeHandle::INVALID_FD, Disposition::READABLE)
                .is_valid()
        );
        assert!(NativeHandle::new(3, Disposition::READABLE).is_valid());
    }

    #[test]
    fn take_invalidates_the_source() {
        let mut h = NativeHandle::new(3, Disposition::READABLE | Disposition::FILE);
        let taken = h.take();
        assert!(taken.is_valid());
        assert!(!h.is_valid());
    }
}
