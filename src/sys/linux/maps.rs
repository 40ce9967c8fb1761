use std::ops::Range;

/// Parse the address ranges out of `/proc/<pid>/maps` text.
///
/// Lines look like `7f1c2e000000-7f1c2e021000 rw-p 00000000 00:00 0`; only
/// the leading range is used and malformed lines are skipped.
pub(crate) fn parse_maps(text: &str) -> Vec<Range<u64>> {
    text.lines()
        .filter_map(|line| {
            let range = line.split_whitespace().next()?;
            let (start, end) = range.split_once('-')?;
            let start = u64::from_str_radix(start, 16).ok()?;
            let end = u64::from_str_radix(end, 16).ok()?;
            (start < end).then_some(start..end)
        })
        .collect()
}
