extern crate std;

use std::{collections::BTreeMap, ops::Range, ptr::NonNull, vec::Vec};

/// Mirrors what the allocator under test is supposed to be doing: which
/// memory spans it manages and which payload ranges are currently handed
/// out. Every step panics on overlap, misalignment, an allocation escaping
/// its pool, or a bogus deallocation.
pub struct ShadowAllocator {
    /// The memory spans registered as pools.
    pools: Vec<Range<usize>>,
    /// Payload start → requested size of every live allocation.
    live: BTreeMap<usize, usize>,
}

impl ShadowAllocator {
    pub fn new() -> Self {
        Self {
            pools: Vec::new(),
            live: BTreeMap::new(),
        }
    }

    pub fn insert_free_block<T>(&mut self, range: *const [T]) {
        let start = range as *const T as usize;
        let len = unsafe { &*range }.len();
        let range = start..start + len;
        log::trace!("sa: new pool {:?}", range);

        assert!(
            self.pools
                .iter()
                .all(|pool| pool.end <= range.start || range.end <= pool.start),
            "pool {:?} overlaps an already registered pool",
            range
        );
        self.pools.push(range);
    }

    pub fn allocate(&mut self, size: usize, align: usize, start: NonNull<u8>) {
        let start = start.as_ptr() as usize;
        let end = start + size;
        log::trace!("sa: allocate {:?}", start..end);

        assert!(
            start % align == 0,
            "0x{:x} is not aligned to 0x{:x} bytes",
            start,
            align
        );
        assert!(
            self.pools
                .iter()
                .any(|pool| pool.start <= start && end <= pool.end),
            "allocation {:?} does not lie inside any pool",
            start..end
        );

        // Only the nearest live allocation on each side can overlap the
        // new one.
        if let Some((&below, &below_size)) = self.live.range(..=start).next_back() {
            assert!(
                below + below_size <= start,
                "allocation at 0x{:x} overlaps the live one at 0x{:x}",
                start,
                below
            );
        }
        if let Some((&above, _)) = self.live.range(start..).next() {
            assert!(
                end <= above,
                "allocation {:?} overlaps the live one at 0x{:x}",
                start..end,
                above
            );
        }

        let previous = self.live.insert(start, size);
        assert!(
            previous.is_none(),
            "two live allocations share the start 0x{:x}",
            start
        );
    }

    pub fn deallocate(&mut self, size: usize, start: NonNull<u8>) {
        let start = start.as_ptr() as usize;
        log::trace!("sa: deallocate {:?}", start..start + size);

        match self.live.remove(&start) {
            Some(live_size) => assert_eq!(
                live_size, size,
                "allocation at 0x{:x} is {} bytes long, but {} were deallocated",
                start, live_size, size
            ),
            None => panic!("there is no live allocation at 0x{:x}", start),
        }
    }
}
