pub(crate) mod intervals;

pub(crate) use intervals::Intervals;

/// Rounds `value` down to a multiple of `align` (non-zero).
pub(crate) fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}

/// Rounds `value` up to a multiple of `align` (non-zero), saturating at `u64::MAX`.
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    match value % align {
        0 => value,
        rem => value.saturating_add(align - rem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(8192, 4096), 8192);
        assert_eq!(align_down(0, 4096), 0);
    }
}
