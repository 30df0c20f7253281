//! Memory section objects.
//!
//! POSIX has no kernel section object: a file-backed section is a
//! duplicated descriptor of its backing file plus the flags to apply at
//! map time, and an anonymous section is backed by an unnamed temporary
//! inode. The type exists so maps have one thing to be views of.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::path::Path;

use bitflags::bitflags;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::error::track_fd;
use crate::file::FileHandle;
use crate::file::Mode;
use crate::handle::Handle;
use crate::handle::HandleFlags;
use crate::native_handle::Disposition;
use crate::utils::round_up_to_page_size;
use crate::utils::temp_directory_path;

bitflags! {
    /// How a section, and views of it, may be accessed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionFlags: u32 {
        /// Views may be read.
        const READ = 1 << 0;
        /// Views may be written, writes reaching the backing.
        const WRITE = 1 << 1;
        /// Views may be written copy-on-write; the backing never changes.
        const COW = 1 << 2;
        /// Views may be executed.
        const EXECUTE = 1 << 3;
        /// Views start as address-space reservations only; physical
        /// backing is armed later with `commit`.
        const NOCOMMIT = 1 << 4;
        /// Fault every page in at map time.
        const PREFAULT = 1 << 5;
    }
}

/// A memory-mappable object, either file-backed or swap-backed.
#[derive(Debug)]
pub struct SectionHandle {
    h: Handle,
    length: Cell<u64>,
    flags: SectionFlags,
    /// True when this section owns an anonymous backing inode, in which
    /// case resizing the section resizes the backing.
    anon: bool,
}

impl SectionHandle {
    /// A section over an open file.
    ///
    /// `max_size` of zero means the file's current length. Asking for a
    /// section larger than the file is only allowed for writable sections,
    /// and extends the file.
    pub fn backed(
        file: &FileHandle,
        max_size: u64,
        flags: SectionFlags,
    ) -> Result<SectionHandle> {
        let _ctx = track_fd(file.fd());
        let file_length = file.length()?;
        let max = if max_size == 0 { file_length } else { max_size };
        if max > file_length {
            if flags.contains(SectionFlags::WRITE) {
                file.truncate(max)?;
            } else {
                return Err(Error::new(ErrorKind::ValueTooLarge));
            }
        }
        let mut cloned = file.as_handle().try_clone()?;
        let caching = cloned.caching();
        let mut native = cloned.release();
        native.disposition |= Disposition::SECTION;
        Ok(SectionHandle {
            h: Handle::new(native, caching, HandleFlags::empty()),
            length: Cell::new(max),
            flags,
            anon: false,
        })
    }

    /// An anonymous swap-backed section of `bytes` bytes, built over an
    /// unnamed temporary inode in `dir` (or the discovered temporary
    /// directory).
    pub fn anonymous(
        bytes: u64,
        dir: Option<&Path>,
        flags: SectionFlags,
    ) -> Result<SectionHandle> {
        let dir = dir.unwrap_or_else(|| temp_directory_path());
        let backing = FileHandle::temp_inode(dir, Mode::Write, HandleFlags::empty())?;
        let length = round_up_to_page_size(bytes);
        backing.truncate(length)?;
        let mut native = backing.into_handle().release();
        native.disposition |= Disposition::SECTION;
        Ok(SectionHandle {
            h: Handle::new(native, crate::handle::Caching::Temporary, HandleFlags::empty()),
            length: Cell::new(length),
            flags,
            anon: true,
        })
    }

    /// The section's current length in bytes.
    pub fn length(&self) -> u64 {
        self.length.get()
    }

    /// The access flags views of this section inherit by default.
    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    /// The backing descriptor.
    pub fn fd(&self) -> RawFd {
        self.h.fd()
    }

    /// The owning handle.
    pub fn as_handle(&self) -> &Handle {
        &self.h
    }

    /// Resizes the section, rounding up to the page size. Resizes the
    /// backing inode too when this section owns it; a section over a
    /// caller's file only changes its own bound, the file is the caller's
    /// business.
    pub fn truncate(&self, new_size: u64) -> Result<u64> {
        let _ctx = track_fd(self.h.fd());
        let rounded = round_up_to_page_size(new_size);
        if self.anon {
            if unsafe { libc::ftruncate(self.h.fd(), rounded as libc::off_t) } == -1 {
                return Err(Error::last_os_error());
            }
        }
        self.length.set(rounded);
        Ok(rounded)
    }
}
