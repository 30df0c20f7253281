//! Directory handles used as race-free anchors for relative opens.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::Error;
use crate::error::Result;
use crate::error::track_fd;
use crate::handle::Caching;
use crate::handle::Handle;
use crate::handle::HandleFlags;
use crate::native_handle::Disposition;
use crate::native_handle::NativeHandle;

pub(crate) fn to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::from_errno(libc::EINVAL))
}

/// A cheap handle to a directory, usable as the base for relative opens.
///
/// Holding one pins the directory identity: operations relative to it are
/// immune to the directory being renamed, which `current_path()`-based
/// lookups are not.
#[derive(Debug)]
pub struct PathHandle {
    h: Handle,
}

impl PathHandle {
    /// Opens a directory as an anchor.
    pub fn open(dir: &Path) -> Result<PathHandle> {
        let c = to_cstring(dir)?;
        Self::open_raw(libc::AT_FDCWD, &c)
    }

    /// Opens a directory beneath an existing anchor.
    pub fn open_at(base: &PathHandle, leaf: &Path) -> Result<PathHandle> {
        let c = to_cstring(leaf)?;
        Self::open_raw(base.fd(), &c)
    }

    fn open_raw(dirfd: RawFd, path: &std::ffi::CStr) -> Result<PathHandle> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let oflags = libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let oflags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;

        let fd = loop {
            let rc = unsafe { libc::openat(dirfd, path.as_ptr(), oflags) };
            if rc >= 0 {
                break rc;
            }
            let err = Error::last_os_error();
            if err.os_error() != libc::EINTR {
                return Err(err);
            }
        };
        Ok(PathHandle {
            h: Handle::new(
                NativeHandle::new(fd, Disposition::DIRECTORY),
                Caching::All,
                HandleFlags::empty(),
            ),
        })
    }

    /// The owning handle.
    pub fn handle(&self) -> &Handle {
        &self.h
    }

    /// The raw descriptor, for use as an `openat` base.
    pub fn fd(&self) -> RawFd {
        self.h.fd()
    }

    /// The kernel's current name for this directory.
    pub fn current_path(&self) -> Result<std::path::PathBuf> {
        self.h.current_path()
    }

    /// Duplicates the anchor.
    pub fn try_clone(&self) -> Result<PathHandle> {
        let _ctx = track_fd(self.fd());
        Ok(PathHandle {
            h: self.h.try_clone()?,
        })
    }
}
