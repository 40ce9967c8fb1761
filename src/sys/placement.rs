//! Free-gap search over a snapshot of the process memory map.
//!
//! Both platform strategies reduce to the same walk: given the used regions
//! in ascending order, every gap that can hold the request is tried at its
//! start and then at its (page-aligned) end, followed by the space after the
//! last used region.

use std::ops::Range;

/// Addresses to try, in order, for a `size`-byte mapping within `[lo, hi)`.
pub(crate) fn candidates(used: &[Range<u64>], lo: u64, hi: u64, size: u64, page: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut free_start = lo;
    for region in used {
        if free_start >= hi {
            return out;
        }
        let free_end = region.start.min(hi);
        push_gap(&mut out, free_start, free_end, size, page);
        if region.end > free_start {
            free_start = region.end;
        }
    }
    push_gap(&mut out, free_start, hi, size, page);
    out
}

fn push_gap(out: &mut Vec<u64>, start: u64, end: u64, size: u64, page: u64) {
    if start >= end || end - start < size {
        return;
    }
    out.push(start);
    let tail = (end - size) & !(page - 1);
    if tail != start {
        out.push(tail);
    }
}

/// Window base for pointer-offset mode.
///
/// Scans up to the region containing `module_base` and returns the start of
/// the last `min_length`-sized slot that ends where a used region begins.
/// Modules mapped very low use a base of zero.
pub(crate) fn pointer_offset(used: &[Range<u64>], module_base: u64, min_length: u64) -> Option<u64> {
    if module_base <= 2 * min_length {
        return Some(0);
    }
    let mut free_start = 0u64;
    let mut free_offset = 0u64;
    for region in used {
        if region.start >= free_start && region.start - free_start >= min_length {
            free_offset = region.start - min_length;
        }
        if region.end > free_start {
            free_start = region.end;
        }
        if module_base < region.end {
            return (free_offset != 0).then_some(free_offset);
        }
    }
    None
}
