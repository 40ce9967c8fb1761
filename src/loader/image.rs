//! Checked access to a mapped image.
//!
//! Every byte a loader reads back out of the mapped image, and every
//! relocation it writes, goes through [`ImageMemory`]. The view tracks the
//! host address ranges that are actually backed and their current
//! protection, so a corrupt table pointer or a relocation aimed at a
//! read-only page becomes an error instead of a fault.

use crate::mmap::MappedFile;
use crate::reader::ByteReader;
use crate::sys::{
    AddressSpace, PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE, Prot, Region, flush_icache_range,
    round_up,
};
use crate::{ObjectFormatError, Result};
use std::sync::Arc;
use tracing::{debug, trace};

/// A backed range of the image and its current protection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub size: u64,
    pub prot: Prot,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }

    pub fn is_readable(&self) -> bool {
        self.prot & (PROT_READ | PROT_WRITE) != 0
    }

    pub fn is_writable(&self) -> bool {
        self.prot & PROT_WRITE != 0
    }

    pub fn is_executable(&self) -> bool {
        self.prot & PROT_EXEC != 0
    }
}

/// How one file-backed segment is placed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SegmentLoad {
    /// Page-aligned host address.
    pub addr: u64,
    /// Offset of the first file byte within the first page.
    pub page_offset: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub prot: Prot,
}

pub(crate) struct ImageMemory {
    region: Region,
    bias: u64,
    segments: Vec<Segment>,
}

impl ImageMemory {
    /// Wrap a reservation. `bias` is the host address of link address zero.
    pub(crate) fn new(region: Region, bias: u64) -> Self {
        Self {
            region,
            bias,
            segments: Vec::new(),
        }
    }

    pub(crate) fn space(&self) -> &Arc<dyn AddressSpace> {
        self.region.space()
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.region.space().page_size()
    }

    /// Host address of the start of the reservation.
    pub(crate) fn base(&self) -> u64 {
        self.region.addr()
    }

    pub(crate) fn size(&self) -> u64 {
        self.region.size()
    }

    pub(crate) fn bias(&self) -> u64 {
        self.bias
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Map a file-backed segment. Page-aligned segments whose file and
    /// memory sizes match are mapped straight from the file; everything else
    /// is copied into fresh pages and then protected.
    pub(crate) fn load_segment(&mut self, file: &MappedFile, load: &SegmentLoad) -> Result<()> {
        let page = self.page_size();
        let length = round_up(load.page_offset + load.mem_size, page);
        self.check_reserved(load.addr, length)?;
        debug!(
            "Loading segment at 0x{:016x} ({} bytes) prot={:x}",
            load.addr, length, load.prot
        );

        let direct = load.page_offset == 0
            && load.file_size == load.mem_size
            && load.file_size != 0
            && load.file_offset % page == 0;
        if direct {
            file.data()
                .get(load.file_offset as usize..(load.file_offset + load.file_size) as usize)
                .ok_or(ObjectFormatError::Truncated {
                    offset: load.file_offset,
                    len: load.file_size,
                })?;
            self.space()
                .map_file(load.addr, length, load.prot, file, load.file_offset)?;
            self.record(load.addr, length, load.prot);
            return Ok(());
        }

        self.commit(load.addr, length)?;
        let copy = load.file_size.min(load.mem_size);
        let bytes = ByteReader::new(file.data()).bytes(load.file_offset, copy)?;
        self.copy_in(load.addr + load.page_offset, bytes)?;
        if load.prot & PROT_EXEC != 0 {
            flush_icache_range(load.addr as *const u8, length as usize);
        }
        self.protect(load.addr, length, load.prot)
    }

    /// Back `[addr, addr + size)` with zeroed read/write pages.
    pub(crate) fn commit(&mut self, addr: u64, size: u64) -> Result<()> {
        self.check_reserved(addr, size)?;
        self.space().commit(addr, size)?;
        self.record(addr, size, PROT_READ | PROT_WRITE);
        Ok(())
    }

    pub(crate) fn protect(&mut self, addr: u64, size: u64, prot: Prot) -> Result<()> {
        self.check_reserved(addr, size)?;
        self.space().protect(addr, size, prot)?;
        self.record(addr, size, prot);
        Ok(())
    }

    pub(crate) fn decommit(&mut self, addr: u64, size: u64) -> Result<()> {
        self.check_reserved(addr, size)?;
        self.space().decommit(addr, size)?;
        self.record(addr, size, PROT_NONE);
        Ok(())
    }

    /// Copy `bytes` into writable image memory at `addr`.
    pub(crate) fn copy_in(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.check_writable(addr, bytes.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// A reader over the rest of the readable segment containing `addr`.
    pub(crate) fn reader(&self, addr: u64) -> Result<ByteReader<'_>> {
        let seg = self
            .segment_at(addr)
            .filter(|s| s.is_readable())
            .ok_or(ObjectFormatError::OutsideImage { addr })?;
        let len = (seg.end() - addr) as usize;
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
        Ok(ByteReader::new(bytes))
    }

    /// Borrow `len` readable bytes at `addr`.
    pub(crate) fn bytes(&self, addr: u64, len: u64) -> Result<&[u8]> {
        Ok(self.reader(addr)?.bytes(0, len)?)
    }

    pub(crate) fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(self.reader(addr)?.u32(0)?)
    }

    pub(crate) fn read_u64(&self, addr: u64) -> Result<u64> {
        Ok(self.reader(addr)?.u64(0)?)
    }

    pub(crate) fn cstr(&self, addr: u64) -> Result<&str> {
        Ok(self.reader(addr)?.cstr(0)?)
    }

    pub(crate) fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        trace!("*0x{:016x} = 0x{:08x}", addr, value);
        self.copy_in(addr, &value.to_le_bytes())
    }

    pub(crate) fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        trace!("*0x{:016x} = 0x{:016x}", addr, value);
        self.copy_in(addr, &value.to_le_bytes())
    }

    /// Whether `addr` is inside an executable segment.
    pub(crate) fn is_code(&self, addr: u64) -> bool {
        self.segment_at(addr).is_some_and(|s| s.is_executable())
    }

    fn segment_at(&self, addr: u64) -> Option<&Segment> {
        self.segments.iter().rev().find(|s| s.contains(addr))
    }

    fn check_reserved(&self, addr: u64, size: u64) -> Result<()> {
        match addr.checked_add(size) {
            Some(end) if addr >= self.region.addr() && end <= self.region.end() => Ok(()),
            _ => Err(ObjectFormatError::OutsideImage { addr }.into()),
        }
    }

    fn check_writable(&self, addr: u64, len: u64) -> Result<()> {
        let seg = self
            .segment_at(addr)
            .ok_or(ObjectFormatError::OutsideImage { addr })?;
        if !seg.is_writable() {
            return Err(ObjectFormatError::NotWritable { addr }.into());
        }
        if addr + len > seg.end() {
            return Err(ObjectFormatError::Truncated { offset: addr, len }.into());
        }
        Ok(())
    }

    /// Record `[addr, addr + size)` as backed with `prot`, splitting any
    /// overlapping records.
    fn record(&mut self, addr: u64, size: u64, prot: Prot) {
        let end = addr + size;
        let mut out = Vec::with_capacity(self.segments.len() + 2);
        for seg in self.segments.drain(..) {
            if seg.end() <= addr || seg.addr >= end {
                out.push(seg);
                continue;
            }
            if seg.addr < addr {
                out.push(Segment {
                    addr: seg.addr,
                    size: addr - seg.addr,
                    prot: seg.prot,
                });
            }
            if seg.end() > end {
                out.push(Segment {
                    addr: end,
                    size: seg.end() - end,
                    prot: seg.prot,
                });
            }
        }
        out.push(Segment { addr, size, prot });
        out.sort_by_key(|s| s.addr);
        self.segments = out;
    }
}
