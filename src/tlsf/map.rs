//! Size-to-class mapping. The core implementation of the two-level
//! segregated-fit index arithmetic.
use super::{
    ALIGN, ALIGN_LOG2, FL_INDEX_COUNT, FL_INDEX_SHIFT, MIN_BLOCK_SIZE, SL_INDEX_COUNT,
    SL_INDEX_COUNT_LOG2, SMALL_BLOCK_SIZE, USIZE_BITS,
};

/// Find the free list cell `(fl, sl)` to store a free block of the
/// specified size. Returns `None` if the size is too large to be indexed.
#[inline]
pub(super) fn map_floor(size: usize) -> Option<(usize, usize)> {
    debug_assert!(size >= MIN_BLOCK_SIZE);
    debug_assert!(size % ALIGN == 0);

    if size < SMALL_BLOCK_SIZE {
        // Small sizes all live in the first row, sliced linearly.
        return Some((0, size >> ALIGN_LOG2));
    }

    // find-last-set of `size`
    let fls = USIZE_BITS - 1 - size.leading_zeros();

    let fl = fls - FL_INDEX_SHIFT + 1;
    if fl as usize >= FL_INDEX_COUNT {
        return None;
    }

    // The `SL_INDEX_COUNT_LOG2` bits just below the leading one
    let sl = (size >> (fls - SL_INDEX_COUNT_LOG2)) ^ (1 << SL_INDEX_COUNT_LOG2);
    debug_assert!(sl < SL_INDEX_COUNT);

    Some((fl as usize, sl & (SL_INDEX_COUNT - 1)))
}

/// Find the first free list cell whose every member is at least as large as
/// the specified size.
///
/// The size is bumped to the next second-level boundary first; without this
/// a cell could be chosen whose smaller members do not fit the request,
/// which would force a linear walk within the list.
#[inline]
pub(super) fn map_ceil(size: usize) -> Option<(usize, usize)> {
    debug_assert!(size >= MIN_BLOCK_SIZE);
    debug_assert!(size % ALIGN == 0);

    if size < SMALL_BLOCK_SIZE {
        return Some((0, size >> ALIGN_LOG2));
    }

    let fls = USIZE_BITS - 1 - size.leading_zeros();
    let round = (1 << (fls - SL_INDEX_COUNT_LOG2)) - 1;
    let size = size.checked_add(round)?;
    map_floor(size & !round)
}
