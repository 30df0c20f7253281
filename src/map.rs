//! Views of sections mapped into the process address space.

use std::os::unix::io::RawFd;

use log::warn;

use crate::deadline::Deadline;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::error::fatal;
use crate::io::Buffer;
use crate::io::ConstBuffer;
use crate::io::Extent;
use crate::io::IoBuffer;
use crate::io::IoRequest;
use crate::section::SectionFlags;
use crate::section::SectionHandle;
use crate::utils::allocation_granularity;
use crate::utils::page_size;

// Not every BSD still accepts MAP_NORESERVE; it is strictly an
// optimization, so it degrades to nothing where absent.
#[cfg(not(target_os = "freebsd"))]
const MAP_NORESERVE_FLAG: libc::c_int = libc::MAP_NORESERVE;
#[cfg(target_os = "freebsd")]
const MAP_NORESERVE_FLAG: libc::c_int = 0;

fn prot_from_flags(flags: SectionFlags) -> libc::c_int {
    let mut prot = 0;
    if flags.contains(SectionFlags::READ) {
        prot |= libc::PROT_READ;
    }
    if flags.contains(SectionFlags::WRITE) || flags.contains(SectionFlags::COW) {
        prot |= libc::PROT_READ | libc::PROT_WRITE;
    }
    if flags.contains(SectionFlags::EXECUTE) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Rounds a region outward to page boundaries.
fn round_outward(region: Extent, len: usize) -> Option<(usize, usize)> {
    let ps = page_size() as u64;
    let start = region.offset / ps * ps;
    let end = (region.offset + region.length).div_ceil(ps) * ps;
    let end = end.min(len as u64);
    if start >= end {
        return None;
    }
    Some((start as usize, (end - start) as usize))
}

/// Rounds a region inward to page boundaries; `None` if no whole page is
/// covered.
fn round_inward(region: Extent, len: usize) -> Option<(usize, usize)> {
    let ps = page_size() as u64;
    let start = region.offset.div_ceil(ps) * ps;
    let end = (region.offset + region.length) / ps * ps;
    let end = end.min(len as u64);
    if start >= end {
        return None;
    }
    Some((start as usize, (end - start) as usize))
}

/// Serves a scatter read directly out of mapped memory: the returned
/// buffers point into the map.
pub(crate) fn serve_read_from_memory<'r, 'a>(
    base: *mut u8,
    limit: usize,
    req: IoRequest<'r, Buffer<'a>>,
) -> Result<&'r mut [Buffer<'a>]> {
    let IoRequest { buffers, offset } = req;
    let mut pos = (offset as usize).min(limit);
    let mut used = 0;
    for b in buffers.iter_mut() {
        let take = b.len().min(limit - pos);
        b.set_ptr(unsafe { base.add(pos) });
        b.set_len(take);
        pos += take;
        if take > 0 {
            used += 1;
        }
    }
    Ok(&mut buffers[..used])
}

/// Serves a gather write by copying into mapped memory.
pub(crate) fn serve_write_to_memory<'r, 'a>(
    base: *mut u8,
    limit: usize,
    req: IoRequest<'r, ConstBuffer<'a>>,
) -> Result<&'r [ConstBuffer<'a>]> {
    let IoRequest { buffers, offset } = req;
    let mut pos = (offset as usize).min(limit);
    let mut used = 0;
    for b in buffers.iter_mut() {
        let take = b.len().min(limit - pos);
        unsafe {
            std::ptr::copy_nonoverlapping(b.as_byte_ptr(), base.add(pos), take);
        }
        b.set_len(take);
        pos += take;
        if take > 0 {
            used += 1;
        }
    }
    Ok(&buffers[..used])
}

/// A mapping of (part of) a section into the address space.
///
/// The map copies the section's backing descriptor but does not own it:
/// the section must outlive the map, exactly as the address range must not
/// be used after the map is dropped.
#[derive(Debug)]
pub struct MapHandle {
    addr: *mut u8,
    length: usize,
    offset: u64,
    flags: SectionFlags,
    fd: RawFd,
}

impl MapHandle {
    /// Maps anonymous memory backed by swap.
    ///
    /// With [`SectionFlags::NOCOMMIT`] the range is an address-space
    /// reservation only; arm parts of it with [`commit`](Self::commit).
    pub fn anonymous(bytes: usize, flags: SectionFlags) -> Result<MapHandle> {
        if bytes == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let prot = if flags.contains(SectionFlags::NOCOMMIT) {
            libc::PROT_NONE
        } else {
            prot_from_flags(flags)
        };
        #[allow(unused_mut)]
        let mut mapflags = libc::MAP_PRIVATE | libc::MAP_ANON;
        if flags.contains(SectionFlags::NOCOMMIT) {
            mapflags |= MAP_NORESERVE_FLAG;
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if flags.contains(SectionFlags::PREFAULT) {
            mapflags |= libc::MAP_POPULATE;
        }
        let addr = unsafe {
            libc::mmap(std::ptr::null_mut(), bytes, prot, mapflags, -1, 0)
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(MapHandle {
            addr: addr.cast(),
            length: bytes,
            offset: 0,
            flags,
            fd: -1,
        })
    }

    /// Maps a view of `section`.
    ///
    /// `bytes` of zero means "to the end of the section". `offset` must be
    /// a multiple of the allocation granularity. Pass empty `flags` to
    /// inherit the section's.
    pub fn map(
        section: &SectionHandle,
        bytes: u64,
        offset: u64,
        flags: SectionFlags,
    ) -> Result<MapHandle> {
        let flags = if flags.is_empty() { section.flags() } else { flags };
        if offset % allocation_granularity() as u64 != 0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let bytes = if bytes == 0 {
            section.length().saturating_sub(offset)
        } else {
            bytes
        };
        if bytes == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let prot = if flags.contains(SectionFlags::NOCOMMIT) {
            libc::PROT_NONE
        } else {
            prot_from_flags(flags)
        };
        #[allow(unused_mut)]
        let mut mapflags = if flags.contains(SectionFlags::COW) {
            libc::MAP_PRIVATE
        } else {
            libc::MAP_SHARED
        };
        if flags.contains(SectionFlags::NOCOMMIT) {
            mapflags |= MAP_NORESERVE_FLAG;
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if flags.contains(SectionFlags::PREFAULT) {
            mapflags |= libc::MAP_POPULATE;
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes as usize,
                prot,
                mapflags,
                section.fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(MapHandle {
            addr: addr.cast(),
            length: bytes as usize,
            offset,
            flags,
            fd: section.fd(),
        })
    }

    /// Base address of the view. Page-aligned.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Offset of the view within its section.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The mapped memory.
    ///
    /// # Safety
    /// The memory may be concurrently modified through the section by
    /// other maps or processes, which would make holding a `&[u8]` over it
    /// undefined behaviour. Only call this when no such writer exists.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.length) }
    }

    /// The mapped memory, mutably.
    ///
    /// # Safety
    /// As [`as_slice`](Self::as_slice), plus the map must be writable.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.length) }
    }

    /// Arms physical backing for a previously reserved region, rounded
    /// outward to whole pages.
    pub fn commit(&self, region: Extent) -> Result<()> {
        let Some((start, len)) = round_outward(region, self.length) else {
            return Err(Error::new(ErrorKind::InvalidArgument));
        };
        let prot = prot_from_flags(self.flags);
        let addr = unsafe { self.addr.add(start) };
        let rc = if self.fd >= 0 && !self.flags.contains(SectionFlags::COW) {
            unsafe {
                libc::mmap(
                    addr.cast(),
                    len,
                    prot,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    self.fd,
                    (self.offset + start as u64) as libc::off_t,
                )
            }
        } else {
            unsafe {
                libc::mmap(
                    addr.cast(),
                    len,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                    -1,
                    0,
                )
            }
        };
        if rc == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Releases physical backing for a region while keeping the address
    /// reservation. Accessing the region faults until recommitted.
    pub fn decommit(&self, region: Extent) -> Result<()> {
        let Some((start, len)) = round_outward(region, self.length) else {
            return Err(Error::new(ErrorKind::InvalidArgument));
        };
        let addr = unsafe { self.addr.add(start) };
        let rc = unsafe {
            libc::mmap(
                addr.cast(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED
                    | MAP_NORESERVE_FLAG,
                -1,
                0,
            )
        };
        if rc == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Zeroes a region, punching holes in the backing where the platform
    /// can so the zeroed pages stop occupying memory or disk.
    pub fn zero_memory(&self, region: Extent) -> Result<()> {
        let end = (region.offset + region.length).min(self.length as u64);
        if region.offset >= end {
            return Ok(());
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some((start, len)) = round_inward(region, self.length) {
            let rc = unsafe {
                libc::madvise(
                    self.addr.add(start).cast(),
                    len,
                    libc::MADV_REMOVE,
                )
            };
            if rc == 0 {
                // Zero the ragged edges the hole punch could not cover.
                unsafe {
                    let lead = start as u64 - region.offset;
                    std::ptr::write_bytes(
                        self.addr.add(region.offset as usize),
                        0,
                        lead as usize,
                    );
                    let tail_start = start + len;
                    std::ptr::write_bytes(
                        self.addr.add(tail_start),
                        0,
                        (end as usize).saturating_sub(tail_start),
                    );
                }
                return Ok(());
            }
            // Not every filesystem supports hole punching; fall through.
        }
        unsafe {
            std::ptr::write_bytes(
                self.addr.add(region.offset as usize),
                0,
                (end - region.offset) as usize,
            );
        }
        Ok(())
    }

    /// Tells the kernel the region's contents are disposable. The contents
    /// are unpredictable afterwards: the kernel may or may not have thrown
    /// them away by the time they are next read.
    pub fn do_not_store(&self, region: Extent) -> Result<()> {
        let Some((start, len)) = round_inward(region, self.length) else {
            return Ok(());
        };
        let addr = unsafe { self.addr.add(start) };
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
        ))]
        {
            if unsafe { libc::madvise(addr.cast(), len, libc::MADV_FREE) } == 0 {
                return Ok(());
            }
        }
        if unsafe { libc::madvise(addr.cast(), len, libc::MADV_DONTNEED) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Hints the kernel to fault the given regions in ahead of use.
    pub fn prefetch(&self, regions: &[Extent]) -> Result<()> {
        for region in regions {
            let Some((start, len)) = round_outward(*region, self.length) else {
                continue;
            };
            let addr = unsafe { self.addr.add(start) };
            if unsafe { libc::madvise(addr.cast(), len, libc::MADV_WILLNEED) } == -1 {
                // Strictly a hint; note it and move on.
                warn!("prefetch hint failed: {}", Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Flushes dirty pages in the region to the backing, waiting for the
    /// write-back when `wait_for_device` is set, and chaining to the
    /// backing file's metadata when `and_metadata` is set.
    pub fn barrier(
        &self,
        region: Option<Extent>,
        wait_for_device: bool,
        and_metadata: bool,
        _deadline: Option<Deadline>,
    ) -> Result<()> {
        let region = region.unwrap_or(Extent::new(0, self.length as u64));
        let Some((start, len)) = round_outward(region, self.length) else {
            return Ok(());
        };
        let addr = unsafe { self.addr.add(start) };
        let ms = if wait_for_device { libc::MS_SYNC } else { libc::MS_ASYNC };
        if unsafe { libc::msync(addr.cast(), len, ms) } == -1 {
            return Err(Error::last_os_error());
        }
        if self.fd >= 0 && (wait_for_device || and_metadata) {
            if unsafe { libc::fsync(self.fd) } == -1 {
                return Err(Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Reads by handing out pointers into the map: zero copies happen.
    pub fn read<'r, 'a>(
        &self,
        req: IoRequest<'r, Buffer<'a>>,
        _deadline: Option<Deadline>,
    ) -> Result<&'r mut [Buffer<'a>]> {
        serve_read_from_memory(self.addr, self.length, req)
    }

    /// Writes by copying into the map.
    pub fn write<'r, 'a>(
        &self,
        req: IoRequest<'r, ConstBuffer<'a>>,
        _deadline: Option<Deadline>,
    ) -> Result<&'r [ConstBuffer<'a>]> {
        serve_write_to_memory(self.addr, self.length, req)
    }
}

impl Drop for MapHandle {
    fn drop(&mut self) {
        if self.addr.is_null() {
            return;
        }
        if unsafe { libc::munmap(self.addr.cast(), self.length) } == -1 {
            fatal("munmap failed", &Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_rounding() {
        let ps = page_size();
        let limit = 4 * ps;
        // A region straddling the middle of pages rounds outward to cover
        // them and inward to nothing unless it spans a whole page.
        let r = Extent::new(10, 20);
        assert_eq!(round_outward(r, limit), Some((0, ps)));
        assert_eq!(round_inward(r, limit), None);

        let r = Extent::new(0, (2 * ps + 1) as u64);
        assert_eq!(round_outward(r, limit), Some((0, 3 * ps)));
        assert_eq!(round_inward(r, limit), Some((0, 2 * ps)));

        let r = Extent::new(1, (2 * ps) as u64);
        assert_eq!(round_inward(r, limit), Some((ps, ps)));
    }

    #[test]
    fn anonymous_map_round_trip() {
        let m = MapHandle::anonymous(
            page_size() * 2,
            SectionFlags::READ | SectionFlags::WRITE,
        )
        .unwrap();
        assert!(!m.as_ptr().is_null());
        assert_eq!(m.as_ptr() as usize % page_size(), 0);
        unsafe {
            m.as_ptr().write_bytes(0xab, m.len());
            assert_eq!(*m.as_ptr().add(m.len() - 1), 0xab);
        }
        m.zero_memory(Extent::new(0, m.len() as u64)).unwrap();
        unsafe {
            assert_eq!(*m.as_ptr(), 0);
            assert_eq!(*m.as_ptr().add(m.len() - 1), 0);
        }
    }

    #[test]
    fn reserved_map_commits_and_decommits() {
        let flags =
            SectionFlags::READ | SectionFlags::WRITE | SectionFlags::NOCOMMIT;
        let m = MapHandle::anonymous(page_size() * 4, flags).unwrap();
        let region = Extent::new(0, page_size() as u64);
        m.commit(region).unwrap();
        unsafe {
            m.as_ptr().write_bytes(0x5a, page_size());
            assert_eq!(*m.as_ptr(), 0x5a);
        }
        m.decommit(region).unwrap();
        m.commit(region).unwrap();
        // Recommitted pages read as zero.
        unsafe {
            assert_eq!(*m.as_ptr(), 0);
        }
    }

    #[test]
    fn memory_backed_scatter_read() {
        let m = MapHandle::anonymous(
            page_size(),
            SectionFlags::READ | SectionFlags::WRITE,
        )
        .unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(b"ABCDEFGH".as_ptr(), m.as_ptr(), 8);
        }
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut bufs = [Buffer::new(&mut a), Buffer::new(&mut b)];
        let out = m.read(IoRequest::new(&mut bufs, 0), None).unwrap();
        assert_eq!(out.len(), 2);
        // The returned buffers alias the map, not the inputs.
        assert_eq!(out[0].as_slice(), b"ABCD");
        assert_eq!(out[1].as_slice(), b"EFGH");
        assert_eq!(out[0].as_slice().as_ptr(), m.as_ptr().cast_const());
    }
}
