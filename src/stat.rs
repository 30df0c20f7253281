//! Typed metadata snapshots.

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitflags::bitflags;

use crate::error::Error;
use crate::error::Result;
use crate::error::track_fd;
use crate::handle::Handle;

bitflags! {
    /// Which fields of a [`Stat`] to fill.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatWants: u32 {
        /// Device id.
        const DEV = 1 << 0;
        /// Inode number.
        const INO = 1 << 1;
        /// Permission bits and file type.
        const PERMS = 1 << 2;
        /// Hard link count.
        const NLINK = 1 << 3;
        /// Owning user id.
        const UID = 1 << 4;
        /// Owning group id.
        const GID = 1 << 5;
        /// Device id of special files.
        const RDEV = 1 << 6;
        /// Last access time.
        const ATIM = 1 << 7;
        /// Last modification time.
        const MTIM = 1 << 8;
        /// Last status change time.
        const CTIM = 1 << 9;
        /// Length in bytes.
        const SIZE = 1 << 10;
        /// Bytes actually allocated on the storage device.
        const ALLOCATED = 1 << 11;
        /// Preferred I/O block size.
        const BLKSIZE = 1 << 12;

        /// Everything.
        const ALL = Self::DEV.bits() | Self::INO.bits() | Self::PERMS.bits()
            | Self::NLINK.bits() | Self::UID.bits() | Self::GID.bits()
            | Self::RDEV.bits() | Self::ATIM.bits() | Self::MTIM.bits()
            | Self::CTIM.bits() | Self::SIZE.bits() | Self::ALLOCATED.bits()
            | Self::BLKSIZE.bits();
    }
}

fn system_time_from_timespec(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
            + Duration::new(0, nsecs as u32)
    }
}

/// A snapshot of an inode's metadata.
///
/// Unfilled fields are zero; consult the `StatWants` you passed.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stat {
    /// Device id.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// File type and permission bits (`st_mode`).
    pub perms: u32,
    /// Hard link count.
    pub nlink: u64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Device id of special files.
    pub rdev: u64,
    /// Last access time.
    pub atim: Option<SystemTime>,
    /// Last modification time.
    pub mtim: Option<SystemTime>,
    /// Last status change time.
    pub ctim: Option<SystemTime>,
    /// Length in bytes.
    pub size: u64,
    /// Bytes actually allocated, which can be less than `size` for sparse
    /// files and more for preallocated ones.
    pub allocated: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
}

impl Stat {
    /// Fills a snapshot from the handle's inode.
    pub fn fill(h: &Handle, wants: StatWants) -> Result<Stat> {
        let _ctx = track_fd(h.fd());
        let mut raw = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(h.fd(), raw.as_mut_ptr()) } == -1 {
            return Err(Error::last_os_error());
        }
        let raw = unsafe { raw.assume_init() };
        let mut out = Stat::default();
        if wants.contains(StatWants::DEV) {
            out.dev = raw.st_dev as u64;
        }
        if wants.contains(StatWants::INO) {
            out.ino = raw.st_ino as u64;
        }
        if wants.contains(StatWants::PERMS) {
            out.perms = raw.st_mode as u32;
        }
        if wants.contains(StatWants::NLINK) {
            out.nlink = raw.st_nlink as u64;
        }
        if wants.contains(StatWants::UID) {
            out.uid = raw.st_uid;
        }
        if wants.contains(StatWants::GID) {
            out.gid = raw.st_gid;
        }
        if wants.contains(StatWants::RDEV) {
            out.rdev = raw.st_rdev as u64;
        }
        if wants.contains(StatWants::ATIM) {
            out.atim = Some(system_time_from_timespec(
                raw.st_atime as i64,
                raw.st_atime_nsec as i64,
            ));
        }
        if wants.contains(StatWants::MTIM) {
            out.mtim = Some(system_time_from_timespec(
                raw.st_mtime as i64,
                raw.st_mtime_nsec as i64,
            ));
        }
        if wants.contains(StatWants::CTIM) {
            out.ctim = Some(system_time_from_timespec(
                raw.st_ctime as i64,
                raw.st_ctime_nsec as i64,
            ));
        }
        if wants.contains(StatWants::SIZE) {
            out.size = raw.st_size as u64;
        }
        if wants.contains(StatWants::ALLOCATED) {
            out.allocated = raw.st_blocks as u64 * 512;
        }
        if wants.contains(StatWants::BLKSIZE) {
            out.blksize = raw.st_blksize as u32;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::IntoRawFd;

    use super::*;
    use crate::handle::Caching;
    use crate::handle::HandleFlags;
    use crate::native_handle::Disposition;
    use crate::native_handle::NativeHandle;

    #[test]
    fn fill_reports_real_metadata() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&[0u8; 1234]).unwrap();
        let fd = f.into_raw_fd();
        let h = Handle::new(
            NativeHandle::new(fd, Disposition::READABLE | Disposition::FILE),
            Caching::All,
            HandleFlags::empty(),
        );
        let st = Stat::fill(&h, StatWants::ALL).unwrap();
        assert_eq!(st.size, 1234);
        assert!(st.ino != 0);
        assert!(st.nlink == 0); // unlinked by tempfile()
        assert!(st.blksize > 0);
        assert!(st.mtim.is_some());
    }

    #[test]
    fn unrequested_fields_stay_zero() {
        let f = tempfile::tempfile().unwrap();
        let h = Handle::new(
            NativeHandle::new(f.into_raw_fd(), Disposition::READABLE),
            Caching::All,
            HandleFlags::empty(),
        );
        let st = Stat::fill(&h, StatWants::INO).unwrap();
        assert!(st.ino != 0);
        assert_eq!(st.size, 0);
        assert_eq!(st.mtim, None);
    }

    #[test]
    fn timespec_conversion_handles_pre_epoch() {
        let t = system_time_from_timespec(-2, 800_000_000);
        assert_eq!(
            UNIX_EPOCH.duration_since(t).unwrap(),
            Duration::new(1, 200_000_000)
        );
        let t = system_time_from_timespec(5, 1);
        assert_eq!(
            t.duration_since(UNIX_EPOCH).unwrap(),
            Duration::new(5, 1)
        );
    }
}
