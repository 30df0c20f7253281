//! A file handle that keeps the file mapped into memory.
//!
//! The handle reserves a window of address space and keeps the map alive
//! across truncations up to that reservation, so growing and shrinking the
//! file does not invalidate pointers into it until the reservation itself
//! must move.

use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;

use crate::deadline::Deadline;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::file::Creation;
use crate::file::FileHandle;
use crate::file::Mode;
use crate::handle::Caching;
use crate::handle::Handle;
use crate::handle::HandleFlags;
use crate::io::Buffer;
use crate::io::ConstBuffer;
use crate::io::Extent;
use crate::io::IoBuffer;
use crate::io::IoHandle;
use crate::io::IoRequest;
use crate::map::MapHandle;
use crate::map::serve_read_from_memory;
use crate::map::serve_write_to_memory;
use crate::path_handle::PathHandle;
use crate::section::SectionFlags;
use crate::section::SectionHandle;
use crate::utils::round_up_to_page_size;

/// A [`FileHandle`] plus a section and map over its contents.
///
/// While the file is non-empty the map covers
/// `min(file length, reservation)` bytes of it from offset zero. A
/// zero-length file carries no section or map at all, because POSIX cannot
/// map one.
#[derive(Debug)]
pub struct MappedFileHandle {
    fh: FileHandle,
    section: Option<SectionHandle>,
    map: Option<MapHandle>,
    reservation: u64,
    /// Bytes of real file content visible through the map.
    length: u64,
}

impl MappedFileHandle {
    /// Opens a file and maps it with the given address-space reservation.
    /// A zero reservation means the file's current length.
    pub fn open_at(
        reservation: u64,
        base: Option<&PathHandle>,
        path: &Path,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<MappedFileHandle> {
        let fh = FileHandle::open_at(base, path, mode, creation, caching, flags)?;
        Self::from_file(reservation, fh)
    }

    /// Opens a file by path and maps it.
    pub fn open(
        reservation: u64,
        path: &Path,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<MappedFileHandle> {
        Self::open_at(reservation, None, path, mode, creation, caching, flags)
    }

    /// Maps an already open file.
    pub fn from_file(reservation: u64, fh: FileHandle) -> Result<MappedFileHandle> {
        let mut out = MappedFileHandle {
            fh,
            section: None,
            map: None,
            reservation: round_up_to_page_size(reservation),
            length: 0,
        };
        if out.fh.length()? > 0 {
            out.reserve(reservation)?;
        }
        Ok(out)
    }

    fn section_flags(&self) -> SectionFlags {
        if self.fh.is_writable() {
            SectionFlags::READ | SectionFlags::WRITE
        } else {
            SectionFlags::READ
        }
    }

    /// Resizes the address-space reservation. `n` of zero means the file's
    /// current length. A no-op when the map already spans `n` bytes;
    /// otherwise the map is replaced, and pointers into it go stale.
    ///
    /// Fails with `InvalidSeek` on a zero-length file, which cannot be
    /// mapped.
    pub fn reserve(&mut self, n: u64) -> Result<u64> {
        let file_length = self.fh.length()?;
        if file_length == 0 {
            return Err(Error::new(ErrorKind::InvalidSeek));
        }
        let n = round_up_to_page_size(if n == 0 { file_length } else { n });
        if let Some(map) = &self.map {
            if map.len() as u64 == n {
                self.reservation = n;
                self.length = file_length.min(n);
                return Ok(n);
            }
        }
        self.map = None;
        if self.section.is_none() {
            self.section = Some(SectionHandle::backed(
                &self.fh,
                0,
                self.section_flags(),
            )?);
        }
        let section = self.section.as_ref().unwrap();
        section.truncate(n)?;
        self.map = Some(MapHandle::map(section, n, 0, self.section_flags())?);
        self.reservation = n;
        self.length = file_length.min(n);
        Ok(n)
    }

    /// Base address of the mapped contents. Null while the file is empty.
    pub fn address(&self) -> *mut u8 {
        self.map
            .as_ref()
            .map_or(std::ptr::null_mut(), |m| m.as_ptr())
    }

    /// Bytes of file content visible through the map.
    pub fn mapped_length(&self) -> u64 {
        self.length
    }

    /// The current address-space reservation.
    pub fn reservation(&self) -> u64 {
        self.reservation
    }

    /// The map itself, while one exists.
    pub fn map(&self) -> Option<&MapHandle> {
        self.map.as_ref()
    }

    /// Sets the length of the file, keeping the map in place whenever the
    /// new length fits the reservation.
    ///
    /// Growing past the reservation re-reserves, after which
    /// [`address`](Self::address) may change. Shrinking first tells the
    /// kernel not to bother writing back the pages being cut off.
    pub fn truncate(&mut self, new_size: u64) -> Result<u64> {
        if new_size == 0 {
            // Some platforms refuse to shrink a file with live maps, and a
            // zero-length mapping is meaningless anyway.
            self.map = None;
            self.section = None;
            self.fh.truncate(0)?;
            self.length = 0;
            return Ok(0);
        }
        if self.section.is_none() {
            self.fh.truncate(new_size)?;
            let want = self.reservation.max(round_up_to_page_size(new_size));
            self.reserve(want)?;
            return Ok(new_size);
        }
        let current = self.fh.length()?;
        if new_size < current {
            if let Some(map) = &self.map {
                let keep = round_up_to_page_size(new_size);
                if keep < map.len() as u64 {
                    // Dirty pages past the new end would otherwise be
                    // written back moments before being discarded.
                    let _ = map.do_not_store(Extent::new(
                        keep,
                        map.len() as u64 - keep,
                    ));
                }
            }
        }
        self.fh.truncate(new_size)?;
        if round_up_to_page_size(new_size) > self.reservation {
            self.reserve(new_size)?;
        } else {
            self.length = new_size.min(self.reservation);
        }
        Ok(new_size)
    }

    /// Refreshes the mapped length after a third party changed the file's
    /// length, returning the bytes now visible.
    pub fn update_map(&mut self) -> Result<u64> {
        let file_length = self.fh.length()?;
        if file_length == 0 {
            self.map = None;
            self.section = None;
            self.length = 0;
            return Ok(0);
        }
        if self.map.is_none() {
            self.reserve(self.reservation)?;
        }
        self.length = file_length.min(self.reservation);
        Ok(self.length)
    }

    /// The underlying file handle.
    pub fn as_file(&self) -> &FileHandle {
        &self.fh
    }

    /// Writes through the map, extending the file first when the write
    /// reaches past the currently visible bytes.
    pub fn write<'r, 'a>(
        &mut self,
        req: IoRequest<'r, ConstBuffer<'a>>,
        _deadline: Option<Deadline>,
    ) -> Result<&'r [ConstBuffer<'a>]> {
        let end = req.offset + crate::io::bytes_transferred(req.buffers);
        if end > self.length {
            self.truncate(end)?;
        }
        let base = match &self.map {
            Some(map) => map.as_ptr(),
            None => {
                let IoRequest { buffers, .. } = req;
                return Ok(&buffers[..0]);
            }
        };
        serve_write_to_memory(base, self.length as usize, req)
    }
}

impl Deref for MappedFileHandle {
    type Target = FileHandle;

    fn deref(&self) -> &FileHandle {
        &self.fh
    }
}

impl DerefMut for MappedFileHandle {
    fn deref_mut(&mut self) -> &mut FileHandle {
        &mut self.fh
    }
}

impl IoHandle for MappedFileHandle {
    fn handle(&self) -> &Handle {
        self.fh.as_handle()
    }

    /// Serves reads from the map: the returned buffers point straight into
    /// the mapped file contents.
    fn read<'r, 'a>(
        &self,
        req: IoRequest<'r, Buffer<'a>>,
        _deadline: Option<Deadline>,
    ) -> Result<&'r mut [Buffer<'a>]> {
        match &self.map {
            Some(map) => {
                serve_read_from_memory(map.as_ptr(), self.length as usize, req)
            }
            None => {
                let IoRequest { buffers, .. } = req;
                for b in buffers.iter_mut() {
                    b.set_len(0);
                }
                Ok(&mut buffers[..0])
            }
        }
    }

    /// Writes through the map without extending the file; writes past the
    /// visible bytes are clipped. Use the inherent
    /// [`write`](MappedFileHandle::write) to extend.
    fn write<'r, 'a>(
        &self,
        req: IoRequest<'r, ConstBuffer<'a>>,
        _deadline: Option<Deadline>,
    ) -> Result<&'r [ConstBuffer<'a>]> {
        match &self.map {
            Some(map) => {
                serve_write_to_memory(map.as_ptr(), self.length as usize, req)
            }
            None => {
                let IoRequest { buffers, .. } = req;
                Ok(&buffers[..0])
            }
        }
    }

    fn barrier(
        &self,
        range: Option<Extent>,
        wait_for_device: bool,
        and_metadata: bool,
        deadline: Option<Deadline>,
    ) -> Result<()> {
        match &self.map {
            Some(map) => map.barrier(range, wait_for_device, and_metadata, deadline),
            None => Ok(()),
        }
    }
}
