//! Regular file handles: open, create, truncate, and race-free relink and
//! unlink.
//!
//! Unless [`HandleFlags::DISABLE_SAFETY_UNLINKS`] is set, opening a file
//! captures its `(device, inode)` identity, and `relink`/`unlink` verify
//! that identity against the containing directory before acting. A third
//! party renaming the file between open and unlink therefore cannot trick
//! us into deleting their file.

use std::mem::MaybeUninit;
use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;

use crate::deadline::Deadline;
use crate::deadline::DeadlineTracker;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::error::track_fd;
use crate::handle::Caching;
use crate::handle::Handle;
use crate::handle::HandleFlags;
use crate::io::IoHandle;
use crate::native_handle::Disposition;
use crate::native_handle::NativeHandle;
use crate::path_handle::PathHandle;
use crate::path_handle::to_cstring;
use crate::stat::Stat;
use crate::stat::StatWants;
use crate::utils::random_string;
use crate::utils::temp_directory_path;

/// Requested access to the opened file.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Mode {
    /// Keep whatever access the handle already has (reopens only).
    Unchanged,
    /// No data access.
    None,
    /// Attributes may be read.
    AttrRead,
    /// Attributes may be read and written.
    AttrWrite,
    /// Data may be read.
    Read,
    /// Data may be read and written.
    Write,
    /// Data may be appended; every write goes to the end of the file
    /// atomically with respect to all other writers of the inode.
    Append,
}

/// How opening interacts with whether the file already exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Creation {
    /// Fail with `NotFound` unless the file exists.
    OpenExisting,
    /// Fail with `FileExists` if the file exists, else create it.
    OnlyIfNotExist,
    /// Open the file, creating it first if needed.
    IfNeeded,
    /// Open the existing file and atomically truncate it to zero length,
    /// preserving its inode identity.
    Truncate,
}

fn mode_to_oflags(mode: Mode) -> Result<(libc::c_int, Disposition)> {
    Ok(match mode {
        Mode::Unchanged => return Err(Error::new(ErrorKind::InvalidArgument)),
        Mode::None => (libc::O_RDONLY, Disposition::empty()),
        Mode::AttrRead => (libc::O_RDONLY, Disposition::READABLE),
        Mode::AttrWrite => (
            libc::O_RDWR,
            Disposition::READABLE | Disposition::WRITABLE,
        ),
        Mode::Read => (libc::O_RDONLY, Disposition::READABLE),
        Mode::Write => (
            libc::O_RDWR,
            Disposition::READABLE | Disposition::WRITABLE,
        ),
        Mode::Append => (
            libc::O_WRONLY | libc::O_APPEND,
            Disposition::WRITABLE | Disposition::APPEND_ONLY,
        ),
    })
}

fn creation_to_oflags(creation: Creation) -> libc::c_int {
    match creation {
        Creation::OpenExisting => 0,
        Creation::OnlyIfNotExist => libc::O_CREAT | libc::O_EXCL,
        Creation::IfNeeded => libc::O_CREAT,
        Creation::Truncate => libc::O_TRUNC,
    }
}

/// Maps the caching policy to open bits, plus whether the page cache is to
/// be bypassed for data.
fn caching_to_oflags(caching: Caching) -> Result<(libc::c_int, bool)> {
    Ok(match caching {
        Caching::Unchanged => return Err(Error::new(ErrorKind::InvalidArgument)),
        Caching::None => (libc::O_SYNC, true),
        Caching::OnlyMetadata => (0, true),
        Caching::Reads => (libc::O_SYNC, false),
        Caching::ReadsAndMetadata => (libc::O_DSYNC, false),
        Caching::All | Caching::SafetyFsyncs | Caching::Temporary => (0, false),
    })
}

fn openat_retrying(
    dirfd: libc::c_int,
    path: &std::ffi::CStr,
    oflags: libc::c_int,
    perms: libc::c_uint,
) -> Result<libc::c_int> {
    loop {
        let fd = unsafe { libc::openat(dirfd, path.as_ptr(), oflags, perms) };
        if fd >= 0 {
            return Ok(fd);
        }
        let err = Error::last_os_error();
        if err.os_error() != libc::EINTR {
            return Err(err);
        }
    }
}

/// An open regular file.
#[derive(Debug)]
pub struct FileHandle {
    h: Handle,
    devino: Option<(u64, u64)>,
}

impl FileHandle {
    /// Opens a file relative to a directory anchor, or to the current
    /// working directory when `base` is `None`.
    pub fn open_at(
        base: Option<&PathHandle>,
        path: &Path,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<FileHandle> {
        let c = to_cstring(path)?;
        let (mode_bits, mut disposition) = mode_to_oflags(mode)?;
        let (cache_bits, direct) = caching_to_oflags(caching)?;
        #[allow(unused_mut)]
        let mut oflags =
            mode_bits | creation_to_oflags(creation) | cache_bits | libc::O_CLOEXEC;
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        if direct {
            oflags |= libc::O_DIRECT;
        }
        let dirfd = base.map_or(libc::AT_FDCWD, |b| b.fd());
        let fd = openat_retrying(dirfd, &c, oflags, 0o666)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        if direct {
            // Darwin has no O_DIRECT; uncached I/O is a post-open toggle.
            if unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) } == -1 {
                let err = Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }
        disposition |= Disposition::SEEKABLE | Disposition::FILE;
        if direct {
            disposition |= Disposition::ALIGNED_IO;
        }
        let h = Handle::new(NativeHandle::new(fd, disposition), caching, flags);
        Self::finish_open(h, creation)
    }

    /// Opens a file by path.
    pub fn open(
        path: &Path,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<FileHandle> {
        Self::open_at(None, path, mode, creation, caching, flags)
    }

    fn finish_open(h: Handle, creation: Creation) -> Result<FileHandle> {
        let _ctx = track_fd(h.fd());
        let devino = if !h.flags().contains(HandleFlags::DISABLE_SAFETY_UNLINKS) {
            let st = Stat::fill(&h, StatWants::DEV | StatWants::INO)?;
            Some((st.dev, st.ino))
        } else {
            None
        };
        if creation == Creation::Truncate && h.are_safety_fsyncs_issued() {
            if unsafe { libc::fsync(h.fd()) } == -1 {
                return Err(Error::last_os_error());
            }
        }
        Ok(FileHandle { h, devino })
    }

    /// Creates a file with a cryptographically random name beneath `base`.
    pub fn random_file(
        base: &PathHandle,
        mode: Mode,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<FileHandle> {
        loop {
            let name = format!("{}.random", random_string(32));
            match Self::open_at(
                Some(base),
                Path::new(&name),
                mode,
                Creation::OnlyIfNotExist,
                caching,
                flags,
            ) {
                Err(e) if e.kind() == ErrorKind::FileExists => continue,
                other => return other,
            }
        }
    }

    /// Creates a random-named file in the discovered temporary directory,
    /// deleted on last close.
    pub fn temp_file(
        mode: Mode,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<FileHandle> {
        let base = PathHandle::open(temp_directory_path())?;
        Self::random_file(&base, mode, caching, flags | HandleFlags::UNLINK_ON_CLOSE)
    }

    /// Creates an anonymous inode in `dir`: a file with no name anywhere in
    /// the filesystem, which ceases to exist on last close.
    ///
    /// On Linux this uses `O_TMPFILE` where the filesystem supports it,
    /// falling back to create-then-unlink of a random name elsewhere.
    pub fn temp_inode(dir: &Path, mode: Mode, flags: HandleFlags) -> Result<FileHandle> {
        let caching = Caching::Temporary;
        let flags = flags | HandleFlags::ANONYMOUS_INODE;
        let (mode_bits, mut disposition) = mode_to_oflags(mode)?;
        disposition |= Disposition::SEEKABLE | Disposition::FILE;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let c = to_cstring(dir)?;
            // O_EXCL here means "may never gain a name", the strongest
            // anonymity the kernel offers.
            let oflags = mode_bits | libc::O_TMPFILE | libc::O_EXCL | libc::O_CLOEXEC;
            match openat_retrying(libc::AT_FDCWD, &c, oflags, 0o600) {
                Ok(fd) => {
                    let h = Handle::new(
                        NativeHandle::new(fd, disposition),
                        caching,
                        flags,
                    );
                    return Self::finish_open(h, Creation::OnlyIfNotExist);
                }
                Err(e) => match e.os_error() {
                    // Filesystem or kernel without O_TMPFILE.
                    libc::EOPNOTSUPP | libc::EISDIR | libc::EINVAL => {}
                    _ => return Err(e),
                },
            }
        }

        // Portable fallback: create a random name, then immediately remove
        // it while keeping the descriptor.
        loop {
            let name = format!("{}.random", random_string(32));
            let full = dir.join(&name);
            let c = to_cstring(&full)?;
            let oflags = mode_bits | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC;
            let fd = match openat_retrying(libc::AT_FDCWD, &c, oflags, 0o600) {
                Ok(fd) => fd,
                Err(e) if e.kind() == ErrorKind::FileExists => continue,
                Err(e) => return Err(e),
            };
            if unsafe { libc::unlink(c.as_ptr()) } == -1 {
                let err = Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            let h = Handle::new(NativeHandle::new(fd, disposition), caching, flags);
            return Self::finish_open(h, Creation::OnlyIfNotExist);
        }
    }

    /// The owning handle.
    pub fn as_handle(&self) -> &Handle {
        &self.h
    }

    /// The `(device, inode)` identity captured at open, absent when
    /// [`HandleFlags::DISABLE_SAFETY_UNLINKS`] was set.
    pub fn unique_id(&self) -> Option<(u64, u64)> {
        self.devino
    }

    /// Current length of the file in bytes.
    pub fn length(&self) -> Result<u64> {
        Stat::fill(&self.h, StatWants::SIZE).map(|s| s.size)
    }

    /// Sets the length of the file, zero-filling any extension.
    pub fn truncate(&self, new_size: u64) -> Result<u64> {
        let _ctx = track_fd(self.h.fd());
        if unsafe { libc::ftruncate(self.h.fd(), new_size as libc::off_t) } == -1 {
            return Err(Error::last_os_error());
        }
        if self.h.are_safety_fsyncs_issued() {
            if unsafe { libc::fsync(self.h.fd()) } == -1 {
                return Err(Error::last_os_error());
            }
        }
        Ok(new_size)
    }

    /// Opens the directory currently containing this file, verifying that
    /// the file really lives there, and returns it with the leaf name.
    ///
    /// Retries for as long as the deadline allows when a concurrent rename
    /// makes the check fail, because the kernel's answer to "where is this
    /// inode" is inherently racy.
    pub fn containing_directory(
        &self,
        deadline: Option<Deadline>,
    ) -> Result<(PathHandle, PathBuf)> {
        let _ctx = track_fd(self.h.fd());
        let tracker = DeadlineTracker::new(deadline);
        loop {
            let path = self.h.current_path()?;
            if path.as_os_str().is_empty() {
                return Err(Error::new(ErrorKind::NotFound));
            }
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => return Err(Error::new(ErrorKind::InvalidArgument)),
            };
            let leaf = match path.file_name() {
                Some(l) => PathBuf::from(l),
                None => return Err(Error::new(ErrorKind::InvalidArgument)),
            };
            let parent_handle = PathHandle::open(parent)?;
            let Some((dev, ino)) = self.devino else {
                return Ok((parent_handle, leaf));
            };
            let c = to_cstring(&leaf)?;
            let mut st = MaybeUninit::<libc::stat>::uninit();
            let rc = unsafe {
                libc::fstatat(
                    parent_handle.fd(),
                    c.as_ptr(),
                    st.as_mut_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            };
            if rc == 0 {
                let st = unsafe { st.assume_init() };
                if st.st_dev as u64 == dev && st.st_ino as u64 == ino {
                    return Ok((parent_handle, leaf));
                }
            }
            // Raced with a rename; look again.
            tracker.check()?;
            std::thread::yield_now();
        }
    }

    /// Atomically renames the open inode to `newpath` relative to `base`
    /// (or the current working directory), replacing any existing entry.
    pub fn relink(
        &self,
        base: Option<&PathHandle>,
        newpath: &Path,
        deadline: Option<Deadline>,
    ) -> Result<()> {
        let _ctx = track_fd(self.h.fd());
        let newc = to_cstring(newpath)?;
        let newdirfd = base.map_or(libc::AT_FDCWD, |b| b.fd());

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if self.h.flags().contains(HandleFlags::ANONYMOUS_INODE) {
            // An anonymous inode has no source directory entry to rename;
            // give it its first name directly from the descriptor. Inodes
            // created with the strongest anonymity can never be named and
            // the kernel will refuse here.
            let proc_path =
                std::ffi::CString::new(format!("/proc/self/fd/{}", self.h.fd()))
                    .expect("no interior NUL");
            let rc = unsafe {
                libc::linkat(
                    libc::AT_FDCWD,
                    proc_path.as_ptr(),
                    newdirfd,
                    newc.as_ptr(),
                    libc::AT_SYMLINK_FOLLOW,
                )
            };
            if rc == -1 {
                return Err(Error::last_os_error());
            }
            return Ok(());
        }

        let (parent, leaf) = self.containing_directory(deadline)?;
        let leafc = to_cstring(&leaf)?;
        let rc = unsafe {
            libc::renameat(parent.fd(), leafc.as_ptr(), newdirfd, newc.as_ptr())
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Removes the file's directory entry. The inode lives on until the
    /// last handle to it closes.
    pub fn unlink(&self, deadline: Option<Deadline>) -> Result<()> {
        let _ctx = track_fd(self.h.fd());
        let (parent, leaf) = self.containing_directory(deadline)?;
        let leafc = to_cstring(&leaf)?;
        if unsafe { libc::unlinkat(parent.fd(), leafc.as_ptr(), 0) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Duplicates the handle. The clone shares the open file description.
    pub fn try_clone(&self) -> Result<FileHandle> {
        Ok(FileHandle {
            h: self.h.try_clone()?,
            devino: self.devino,
        })
    }

    /// Closes the handle, unlinking the file first when
    /// [`HandleFlags::UNLINK_ON_CLOSE`] is set.
    pub fn close(mut self) -> Result<()> {
        if self.unlink_on_close_pending() {
            match self.unlink(Some(Deadline::Relative(Duration::from_secs(30)))) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        let caching = self.h.caching();
        let h = std::mem::replace(
            &mut self.h,
            Handle::new(NativeHandle::invalid(), caching, HandleFlags::empty()),
        );
        h.close()
    }

    /// Surrenders the inner handle, bypassing unlink-on-close.
    pub(crate) fn into_handle(mut self) -> Handle {
        std::mem::replace(
            &mut self.h,
            Handle::new(NativeHandle::invalid(), Caching::All, HandleFlags::empty()),
        )
    }

    fn unlink_on_close_pending(&self) -> bool {
        self.h.is_valid()
            && self.h.flags().contains(HandleFlags::UNLINK_ON_CLOSE)
            && !self.h.flags().contains(HandleFlags::ANONYMOUS_INODE)
    }
}

impl Deref for FileHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.h
    }
}

impl DerefMut for FileHandle {
    fn deref_mut(&mut self) -> &mut Handle {
        &mut self.h
    }
}

impl IoHandle for FileHandle {
    fn handle(&self) -> &Handle {
        &self.h
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.unlink_on_close_pending() {
            if let Err(e) = self.unlink(Some(Deadline::Relative(Duration::from_secs(30))))
            {
                if e.kind() != ErrorKind::NotFound {
                    warn!("unlink on close failed: {e}");
                }
            }
        }
        // The inner handle closes itself.
    }
}
