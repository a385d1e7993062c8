//! System page and allocation-granularity arithmetic shared across the
//! registry and the engine.

/// Size of a system page. Cygwin's mmap.cc hardcodes 4 KiB via `getpagesize`;
/// we do the same rather than querying the host on every call.
pub const PAGE_SIZE: usize = 4096;

/// Host view-placement granularity (e.g. Windows's 64 KiB allocation
/// granularity), coarser than and distinct from [`PAGE_SIZE`].
pub const ALLOC_GRANULARITY: usize = 64 * 1024;

/// Rounds `len` up to the next multiple of `align`, which must be a power
/// of two. `len == 0` rounds up to `align`.
#[inline]
pub const fn round_up(len: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (len + align - 1) & !(align - 1)
}

/// Rounds `addr` down to the previous multiple of `align`.
#[inline]
pub const fn round_down(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

#[inline]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

/// Number of system pages needed to cover `len` bytes.
#[inline]
pub const fn page_count(len: usize) -> usize {
    round_up(len, PAGE_SIZE) / PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up(PAGE_SIZE + 1, PAGE_SIZE), 2 * PAGE_SIZE);
        assert_eq!(round_down(PAGE_SIZE + 1, PAGE_SIZE), PAGE_SIZE);
        assert!(is_aligned(2 * PAGE_SIZE, PAGE_SIZE));
        assert!(!is_aligned(PAGE_SIZE + 1, PAGE_SIZE));
    }

    #[test]
    fn page_counting() {
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(PAGE_SIZE), 1);
        assert_eq!(page_count(PAGE_SIZE + 1), 2);
        assert_eq!(page_count(0), 0);
    }
}
