//! Linux free-region discovery.
//!
//! The kernel exposes the current memory map through `/proc/self/maps`; the
//! window search walks it in address order. On x86-64 the `MAP_32BIT` hint is
//! tried first since it usually succeeds without any search at all.

mod maps;

use crate::Result;
use std::ops::Range;

pub(crate) use maps::parse_maps;

/// Flags for a placement attempt at a candidate address.
pub(crate) const FIXED_FLAGS: libc::c_int = libc::MAP_FIXED_NOREPLACE;

/// Flags for an exact reservation that must not clobber existing mappings.
pub(crate) const EXCLUSIVE_FLAGS: libc::c_int = libc::MAP_FIXED_NOREPLACE;

/// Used regions overlapping `[lo, hi)`, in ascending order.
pub(crate) fn used_regions(lo: u64, hi: u64) -> Result<Vec<Range<u64>>> {
    let text = match std::fs::read_to_string("/proc/self/maps") {
        Ok(text) => text,
        Err(_) => std::fs::read_to_string(format!("/proc/{}/map", std::process::id()))?,
    };
    let mut regions: Vec<_> = parse_maps(&text)
        .into_iter()
        .filter(|r| r.end > lo && r.start < hi)
        .collect();
    regions.sort_by_key(|r| r.start);
    Ok(regions)
}

/// Lowest address the window search starts from.
pub(crate) fn search_floor(base: u64, _used: &[Range<u64>], page: u64) -> u64 {
    super::round_up(base + super::WINDOW_FLOOR, page)
}

/// Let the kernel pick an address below 2GB.
#[cfg(target_arch = "x86_64")]
pub(crate) fn map_32bit(size: u64, prot: libc::c_int, flags: libc::c_int) -> Option<u64> {
    let mem = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size as usize,
            prot,
            flags | libc::MAP_32BIT,
            -1,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return None;
    }
    let addr = mem as u64;
    if addr >= super::WINDOW_FLOOR && addr + size <= super::WINDOW_SIZE {
        return Some(addr);
    }
    tracing::trace!("MAP_32BIT returned 0x{:016x}, falling back to search", addr);
    unsafe {
        libc::munmap(mem, size as usize);
    }
    None
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn map_32bit(_size: u64, _prot: libc::c_int, _flags: libc::c_int) -> Option<u64> {
    None
}
