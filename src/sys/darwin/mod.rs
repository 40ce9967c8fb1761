//! macOS free-region discovery.
//!
//! There is no `/proc` and no 32-bit mapping hint, so the window search walks
//! the task's VM regions with `mach_vm_region`. The first region of a 64-bit
//! process is `__PAGEZERO`, which covers the whole low 4GB by default; hosts
//! that want plain 32-bit mode must be linked with a small page zero.

use crate::{Error, Result};
use std::ops::Range;

/// Flags for a placement attempt at a candidate address.
pub(crate) const FIXED_FLAGS: libc::c_int = libc::MAP_FIXED;

/// Darwin has no no-replace flag; exact reservations rely on the hint.
pub(crate) const EXCLUSIVE_FLAGS: libc::c_int = 0;

const VM_REGION_BASIC_INFO_64: libc::c_int = 9;
const VM_REGION_BASIC_INFO_COUNT_64: u32 = 9;
const KERN_SUCCESS: libc::c_int = 0;

unsafe extern "C" {
    static mach_task_self_: libc::c_uint;

    fn mach_vm_region(
        target_task: libc::c_uint,
        address: *mut u64,
        size: *mut u64,
        flavor: libc::c_int,
        info: *mut libc::c_int,
        info_count: *mut u32,
        object_name: *mut libc::c_uint,
    ) -> libc::c_int;
}

/// Used regions overlapping `[lo, hi)`, in ascending order.
pub(crate) fn used_regions(lo: u64, hi: u64) -> Result<Vec<Range<u64>>> {
    let mut regions = Vec::new();
    let mut address = 0u64;
    loop {
        let mut size = 0u64;
        let mut info = [0 as libc::c_int; 9];
        let mut count = VM_REGION_BASIC_INFO_COUNT_64;
        let mut object_name: libc::c_uint = 0;
        let kr = unsafe {
            mach_vm_region(
                mach_task_self_,
                &mut address,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                info.as_mut_ptr(),
                &mut count,
                &mut object_name,
            )
        };
        if kr != KERN_SUCCESS {
            break;
        }
        let end = address.saturating_add(size);
        if address >= hi {
            break;
        }
        if end > lo {
            regions.push(address..end);
        }
        if end == u64::MAX || size == 0 {
            break;
        }
        address = end;
    }
    if regions.is_empty() && lo == 0 {
        return Err(Error::MemoryMapping(
            "cannot enumerate VM regions".to_string(),
        ));
    }
    Ok(regions)
}

/// Lowest address the window search starts from: past the first region.
pub(crate) fn search_floor(base: u64, used: &[Range<u64>], page: u64) -> u64 {
    let floor = super::round_up(base + super::WINDOW_FLOOR, page);
    match used.first() {
        Some(first) if base == 0 => floor.max(first.end),
        _ => floor,
    }
}

pub(crate) fn map_32bit(_size: u64, _prot: libc::c_int, _flags: libc::c_int) -> Option<u64> {
    None
}
