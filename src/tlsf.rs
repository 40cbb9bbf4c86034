//! The TLSF allocator core
use core::{
    hint::unreachable_unchecked,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr::NonNull,
};

use crate::int::BinInteger;

/// The alignment of block payloads and the granularity of block sizes.
///
/// It is `size_of::<usize>() * 2` bytes.
pub const ALIGN: usize = mem::size_of::<usize>() * 2;

const ALIGN_LOG2: u32 = ALIGN.trailing_zeros();

const USIZE_BITS: u32 = usize::BITS;

/// Each first-level class is sliced into this many linear sub-classes.
const SL_INDEX_COUNT_LOG2: u32 = 5;
const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// `log2` of the upper bound of indexable block sizes.
        const FL_INDEX_MAX: u32 = 32;
    } else {
        /// `log2` of the upper bound of indexable block sizes.
        const FL_INDEX_MAX: u32 = 30;
    }
}

/// Sizes below `1 << FL_INDEX_SHIFT` take the small-block fast path: they
/// all map to first-level class 0, sliced linearly by `ALIGN`.
const FL_INDEX_SHIFT: u32 = SL_INDEX_COUNT_LOG2 + ALIGN_LOG2;
const FL_INDEX_COUNT: usize = (FL_INDEX_MAX - FL_INDEX_SHIFT + 1) as usize;
const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

/// The minimum whole-block size: a free block must be able to host the two
/// free list links in its payload area.
const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeBlockHdr>();
const MAX_BLOCK_SIZE: usize = (1 << FL_INDEX_MAX) - ALIGN;

/// The control block structure signature, used for cheap validity checking
/// of handles.
const SIGNATURE: usize = 0x2A59_FA59;

type FlBitmap = u32;
type SlBitmap = u32;

const _: () = {
    assert!(mem::size_of::<BlockHdr>() == ALIGN);
    assert!(mem::size_of::<FreeBlockHdr>() == MIN_BLOCK_SIZE);
    assert!(MIN_BLOCK_SIZE == ALIGN * 2);
    assert!(FL_INDEX_COUNT <= FlBitmap::BITS as usize);
    assert!(SL_INDEX_COUNT <= SlBitmap::BITS as usize);
};

#[cfg_attr(doc, doc = svgbobdoc::transform!(
/// The TLSF control block: the per-instance allocator state.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   First level
///                                                          FL_INDEX_COUNT
///                               ,---+---------+-----+-----+-----+-----+-----,
///          fl_bitmap: FlBitmap= | 0 |   ...   |  1  |  0  |  0  |  0  |  0  |
///                               +---+---------+-----+-----+-----+-----+-----+
///                      min size |         2¹² | 2¹¹ | 2¹⁰ |  2⁹ |   small   |
///                               '---+---------+--+--+-----+-----+-----+-----'
///                                                |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second Level                                 |
///                                                v           SL_INDEX_COUNT
///                                  ,-----+-----+-----+---------------+-----,
///        "sl_bitmap[i]: SlBitmap"= |  0  |  0  |  1  |      ...      |  0  |
///                                  +-----+-----+-----+---------------+-----+
///            "min size 2¹¹(1+n/32)"|  31 |  30 |  29 |               |  0  |
///                                  +-----+-----+-----+---------------+-----+
///                       first_free |     |     |  O  |               |     |
///                                  '-----+-----+--|--+---------------+-----'
///                                                 |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Free blocks                                   |
///                                                 |
///             ,-----------------------------------'
///             | ,---+---+-------,    ,---+---+-------,    ,---+---+-------,
///             '-+>O | O-+-------+----+>O | O-+-------+----+>O |   |       |
///               +---+---'       |    +---+---'       |    +---+---'       |
///               |               |    |               |    |               |
///               '---------------'    '---------------'    '---------------'
/// ```
/// </center>
///
/// # Properties
///
/// The allocation granularity ([`ALIGN`]) is `size_of::<usize>() * 2`
/// bytes. Block sizes are multiples of it, and the minimum block is
/// [`ALIGN`]` * 2` bytes: a header plus room for the two free list links.
///
/// An instance can be constructed by value ([`Self::new`], [`Self::INIT`],
/// [`Default`]) or inside caller-supplied storage ([`Self::create`],
/// [`Self::create_with_pool`]). Instances are fully independent; there is
/// no process-global state.
))]
#[derive(Debug)]
pub struct Tlsf<'pool> {
    /// Structure signature. [`SIGNATURE`] while the control block is live,
    /// cleared by [`Self::destroy`].
    signature: usize,
    fl_bitmap: FlBitmap,
    sl_bitmap: [SlBitmap; FL_INDEX_COUNT],
    first_free: [[Option<NonNull<FreeBlockHdr>>; SL_INDEX_COUNT]; FL_INDEX_COUNT],
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: All memory block headers directly or indirectly referenced by a
//         particular instance of `Tlsf` are logically owned by that `Tlsf` and
//         have no interior mutability, so these are safe.
unsafe impl Send for Tlsf<'_> {}
unsafe impl Sync for Tlsf<'_> {}

/// The header of a memory block.
#[repr(C)]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[derive(Debug)]
struct BlockHdr {
    /// The whole size of the memory block, including the header.
    ///
    ///  - `bit[0]` ([`SIZE_FREE`]) indicates whether the block is a free
    ///    memory block or not.
    ///
    ///  - `bit[1]` ([`SIZE_PREV_FREE`]) indicates whether the physically
    ///    previous block is free or not.
    ///
    ///  - `bit[ALIGN_LOG2..]` ([`SIZE_SIZE_MASK`]) represents the size.
    ///
    /// A stored size of zero marks a pool's trailing sentinel block, which
    /// is never free.
    size: usize,
    /// The physically previous block. Meaningful only while
    /// [`SIZE_PREV_FREE`] is set; the bits are stale otherwise.
    prev_phys_block: Option<NonNull<BlockHdr>>,
}

/// The bit of [`BlockHdr::size`] indicating whether the block is free.
const SIZE_FREE: usize = 1;
/// The bit of [`BlockHdr::size`] indicating whether the physically previous
/// block is free. Backward coalescing is possible exactly when it is set.
const SIZE_PREV_FREE: usize = 2;
/// The bits of [`BlockHdr::size`] indicating the block's size.
const SIZE_SIZE_MASK: usize = !(SIZE_FREE | SIZE_PREV_FREE);

impl BlockHdr {
    #[inline]
    fn size(&self) -> usize {
        self.size & SIZE_SIZE_MASK
    }

    #[inline]
    fn is_free(&self) -> bool {
        (self.size & SIZE_FREE) != 0
    }

    #[inline]
    fn is_prev_free(&self) -> bool {
        (self.size & SIZE_PREV_FREE) != 0
    }

    #[inline]
    fn is_sentinel(&self) -> bool {
        self.size() == 0
    }

    /// Replace the stored size, preserving the flag bits.
    #[inline]
    fn set_size(&mut self, size: usize) {
        debug_assert!(size % ALIGN == 0);
        self.size = size | (self.size & !SIZE_SIZE_MASK);
    }

    /// Get the next physical block.
    ///
    /// # Safety
    ///
    /// `self` must not be a pool's trailing sentinel block.
    #[inline]
    unsafe fn next_phys_block(&self) -> NonNull<BlockHdr> {
        debug_assert!(!self.is_sentinel());
        // Safety: Every non-sentinel block is followed by another block
        //         within the same pool.
        NonNull::new_unchecked((self as *const _ as *mut u8).add(self.size())).cast()
    }

    /// Get the previous physical block.
    ///
    /// # Safety
    ///
    /// [`SIZE_PREV_FREE`] must be set.
    #[inline]
    unsafe fn prev_phys_block(&self) -> NonNull<BlockHdr> {
        debug_assert!(self.is_prev_free());
        self.prev_phys_block.unwrap_or_else(|| unreachable_unchecked())
    }
}

/// The header of a used memory block. The payload immediately follows it.
#[repr(C)]
#[derive(Debug)]
struct UsedBlockHdr {
    common: BlockHdr,
}

/// The header of a free memory block. The free list links live where a
/// used block's payload would start.
#[repr(C)]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[derive(Debug)]
struct FreeBlockHdr {
    common: BlockHdr,
    next_free: Option<NonNull<FreeBlockHdr>>,
    prev_free: Option<NonNull<FreeBlockHdr>>,
}

/// Get the payload address of a used block.
#[inline]
unsafe fn payload_of(block: NonNull<UsedBlockHdr>) -> NonNull<u8> {
    NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(mem::size_of::<UsedBlockHdr>()))
}

/// Find the `UsedBlockHdr` for an allocation (any `NonNull<u8>` returned
/// by our allocation functions). The header always immediately precedes
/// the payload, including for [`Tlsf::allocate_aligned`] allocations.
///
/// # Safety
///
/// `ptr` must point to a live allocated memory block.
#[inline]
unsafe fn used_block_hdr_for_allocation(ptr: NonNull<u8>) -> NonNull<UsedBlockHdr> {
    NonNull::new_unchecked(ptr.as_ptr().sub(mem::size_of::<UsedBlockHdr>())).cast()
}

/// Compute the whole-block size needed to serve a payload request of
/// `size` bytes. Returns `None` on arithmetic overflow.
#[inline]
fn adjust_request_size(size: usize) -> Option<usize> {
    let whole = size.checked_add(mem::size_of::<UsedBlockHdr>() + ALIGN - 1)? & !(ALIGN - 1);
    Some(if whole < MIN_BLOCK_SIZE {
        MIN_BLOCK_SIZE
    } else {
        whole
    })
}

/// The smallest payload size an allocation can occupy. Requests for less
/// (including zero) are padded to this size.
pub const fn min_block_size() -> usize {
    MIN_BLOCK_SIZE - mem::size_of::<UsedBlockHdr>()
}

/// The largest payload size [`Tlsf::allocate`] can ever serve. Larger
/// requests fail with `None` without touching the allocator state.
pub const fn max_block_size() -> usize {
    MAX_BLOCK_SIZE - mem::size_of::<UsedBlockHdr>()
}

/// The bookkeeping overhead of one pool: the part of an [`ALIGN`]-aligned
/// region that can never become payload (the first block's header and the
/// trailing sentinel).
pub const fn pool_overhead() -> usize {
    2 * mem::size_of::<UsedBlockHdr>()
}

/// The per-allocation bookkeeping overhead.
pub const fn alloc_overhead() -> usize {
    mem::size_of::<UsedBlockHdr>()
}

impl Default for Tlsf<'_> {
    #[inline]
    fn default() -> Self {
        Self::INIT
    }
}

impl const_default1::ConstDefault for Tlsf<'_> {
    const DEFAULT: Self = Self::INIT;
}

impl<'pool> Tlsf<'pool> {
    /// An empty allocator with no pools.
    pub const INIT: Self = Self {
        signature: SIGNATURE,
        fl_bitmap: 0,
        sl_bitmap: [0; FL_INDEX_COUNT],
        first_free: [[None; SL_INDEX_COUNT]; FL_INDEX_COUNT],
        _phantom: PhantomData,
    };

    /// Construct an empty allocator with no pools.
    #[inline]
    pub const fn new() -> Self {
        Self::INIT
    }

    /// The storage size [`Self::create`] requires.
    pub const CONTROL_BLOCK_SIZE: usize = mem::size_of::<Self>();

    /// The storage alignment [`Self::create`] requires.
    pub const CONTROL_BLOCK_ALIGN: usize = ALIGN;

    /// Construct a control block inside caller-supplied storage and return
    /// a handle to it.
    ///
    /// Returns `None` if `storage` is not aligned to
    /// [`Self::CONTROL_BLOCK_ALIGN`] bytes or is shorter than
    /// [`Self::CONTROL_BLOCK_SIZE`] bytes.
    ///
    /// # Safety
    ///
    /// `storage` must be valid for reads and writes, must outlive the
    /// returned handle, and must not be accessed by other means while the
    /// handle is in use.
    pub unsafe fn create(storage: NonNull<[u8]>) -> Option<NonNull<Self>> {
        let start = storage.cast::<u8>();
        if start.as_ptr() as usize % Self::CONTROL_BLOCK_ALIGN != 0 {
            return None;
        }
        if storage.len() < Self::CONTROL_BLOCK_SIZE {
            return None;
        }
        let this = start.cast::<Self>();
        this.as_ptr().write(Self::INIT);
        Some(this)
    }

    /// Construct a control block in the leading portion of `mem` and
    /// register the rest of `mem` as its first pool.
    ///
    /// Returns `None` if `mem` cannot hold the control block plus a
    /// minimal pool.
    ///
    /// # Safety
    ///
    /// Same as [`Self::create`].
    pub unsafe fn create_with_pool(mem: NonNull<[u8]>) -> Option<NonNull<Self>> {
        let len = mem.len();
        let mut this = Self::create(mem)?;
        let pool_mem = NonNull::slice_from_raw_parts(
            NonNull::new_unchecked(mem.cast::<u8>().as_ptr().add(Self::CONTROL_BLOCK_SIZE)),
            len - Self::CONTROL_BLOCK_SIZE,
        );
        if this.as_mut().add_pool_ptr(pool_mem).is_none() {
            Self::destroy(this);
            return None;
        }
        Some(this)
    }

    /// Invalidate a control block previously returned by [`Self::create`]
    /// or [`Self::create_with_pool`]. The backing storage (and that of any
    /// remaining pools) is the caller's to reclaim afterwards.
    ///
    /// # Safety
    ///
    /// `this` must originate from `create`/`create_with_pool` and must not
    /// be used again afterwards.
    pub unsafe fn destroy(mut this: NonNull<Self>) {
        this.as_ref().assert_valid();
        this.as_mut().signature = 0;
    }

    #[inline]
    fn assert_valid(&self) {
        debug_assert_eq!(
            self.signature, SIGNATURE,
            "invalid or destroyed control block"
        );
    }

    /// Hand a memory region over to the allocator for servicing
    /// allocations.
    ///
    /// Returns a handle identifying the new pool, or `None` if the region
    /// is too small to hold a single block after alignment (or too large
    /// to be covered by one).
    ///
    /// # Examples
    ///
    /// ```
    /// use segfit::Tlsf;
    /// use core::mem::MaybeUninit;
    /// let mut arena = [MaybeUninit::uninit(); 1024];
    /// let mut tlsf: Tlsf = Tlsf::new();
    /// tlsf.add_pool(&mut arena).unwrap();
    /// ```
    ///
    /// The added memory region must outlive `self`:
    ///
    /// ```rust,compile_fail
    /// use segfit::Tlsf;
    /// use core::mem::MaybeUninit;
    /// let mut tlsf: Tlsf = Tlsf::new();
    /// let mut arena = [MaybeUninit::uninit(); 1024];
    /// tlsf.add_pool(&mut arena);
    /// drop(arena); // dropping the arena first is not allowed
    /// drop(tlsf);
    /// ```
    ///
    /// # Panics
    ///
    /// This method never panics.
    #[inline]
    pub fn add_pool(&mut self, mem: &'pool mut [MaybeUninit<u8>]) -> Option<Pool> {
        // Safety: `mem` is a mutable reference, which guarantees the absence
        // of aliasing references. Being `'pool` means it outlives `self`.
        unsafe { self.add_pool_ptr(NonNull::new(mem as *mut [_] as *mut [u8]).unwrap()) }
    }

    /// [`Self::add_pool`] taking a raw slice pointer.
    ///
    /// # Safety
    ///
    /// The memory region will be considered owned by `self`. It must
    /// outlive `self` and must not be accessed by other means until it is
    /// detached with [`Self::remove_pool`].
    pub unsafe fn add_pool_ptr(&mut self, mem: NonNull<[u8]>) -> Option<Pool> {
        self.assert_valid();
        let len = mem.len();

        // Round the starting address up...
        let unaligned_start = mem.as_ptr() as *mut u8 as usize;
        let start = unaligned_start.checked_add(ALIGN - 1)? & !(ALIGN - 1);

        // ...and the usable length down
        let len = len
            .checked_sub(start.wrapping_sub(unaligned_start))
            .map(|x| x & !(ALIGN - 1))?;

        // One free block plus the trailing sentinel header must fit
        let block_size = len.checked_sub(mem::size_of::<UsedBlockHdr>())?;
        if block_size < MIN_BLOCK_SIZE {
            return None;
        }
        map::map_floor(block_size)?;

        // The one free block covering the whole usable region. Its
        // `prev_phys_block` is never examined because `SIZE_PREV_FREE` is
        // never set on a pool's first block.
        let mut block = NonNull::new_unchecked(start as *mut FreeBlockHdr);
        block.as_mut().common = BlockHdr {
            size: block_size | SIZE_FREE,
            prev_phys_block: None,
        };

        // The pool is capped by a zero-size, permanently used sentinel
        // block so that nothing ever coalesces past its end.
        let mut sentinel = block.as_ref().common.next_phys_block();
        sentinel.as_mut().size = SIZE_PREV_FREE;
        sentinel.as_mut().prev_phys_block = Some(block.cast());

        self.link_free_block(block, block_size);

        Some(Pool(block.cast()))
    }

    /// Detach a pool, returning the backing region (trimmed to the
    /// [`ALIGN`] boundaries actually managed).
    ///
    /// Fails and returns `None` while any allocation in the pool is still
    /// live.
    ///
    /// # Safety
    ///
    /// `pool` must have been returned by [`Self::add_pool`] or
    /// [`Self::add_pool_ptr`] of this very allocator and not removed
    /// since.
    pub unsafe fn remove_pool(&mut self, pool: Pool) -> Option<NonNull<[u8]>> {
        self.assert_valid();
        let block = pool.0;

        // An empty pool is exactly one free block followed by the sentinel
        if !block.as_ref().is_free() {
            return None;
        }
        if !block.as_ref().next_phys_block().as_ref().is_sentinel() {
            return None;
        }

        let size = block.as_ref().size();
        self.unlink_free_block(block.cast(), size);

        Some(NonNull::slice_from_raw_parts(
            block.cast::<u8>(),
            size + mem::size_of::<UsedBlockHdr>(),
        ))
    }

    /// Insert the specified free block into the matching free list.
    ///
    /// Updates `FreeBlockHdr::{next_free, prev_free}` and the bitmaps.
    ///
    /// # Safety
    ///
    ///  - `*block.as_ptr()` must be owned by `self`, with `common`
    ///    initialized. (The free list links do not have to be.)
    ///  - `size` must be `block`'s size and must have a free list cell,
    ///    which does not currently contain `block`.
    unsafe fn link_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let (fl, sl) = map::map_floor(size).unwrap_or_else(|| unreachable_unchecked());
        let first_free = &mut self.first_free[fl][sl];
        let next_free = mem::replace(first_free, Some(block));
        block.as_mut().next_free = next_free;
        block.as_mut().prev_free = None;
        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = Some(block);
        }

        self.fl_bitmap.set_bit(fl as u32);
        self.sl_bitmap[fl].set_bit(sl as u32);
    }

    /// Remove the specified free block from its free list.
    ///
    /// # Safety
    ///
    ///  - `size` must represent the specified free block's size.
    ///  - The free block must be currently included in a free list.
    unsafe fn unlink_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let next_free = block.as_mut().next_free;
        let prev_free = block.as_mut().prev_free;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = prev_free;
        }

        if let Some(mut prev_free) = prev_free {
            prev_free.as_mut().next_free = next_free;
        } else {
            let (fl, sl) = map::map_floor(size).unwrap_or_else(|| unreachable_unchecked());
            let first_free = &mut self.first_free[fl][sl];

            debug_assert_eq!(*first_free, Some(block));
            *first_free = next_free;

            if next_free.is_none() {
                // The free list is now empty - update the bitmaps
                self.sl_bitmap[fl].clear_bit(sl as u32);
                if self.sl_bitmap[fl] == 0 {
                    self.fl_bitmap.clear_bit(fl as u32);
                }
            }
        }
    }

    /// Search for a non-empty free list whose every member is at least
    /// `min_size` bytes long.
    #[inline]
    fn search_suitable_block(&self, min_size: usize) -> Option<(usize, usize)> {
        let (mut fl, mut sl) = map::map_ceil(min_size)?;

        // Search in range `(fl, sl..SL_INDEX_COUNT)`
        sl = self.sl_bitmap[fl].bit_scan_forward(sl as u32) as usize;
        if sl < SL_INDEX_COUNT {
            debug_assert!(self.sl_bitmap[fl].get_bit(sl as u32));

            return Some((fl, sl));
        }

        // Search in range `(fl + 1.., ..)`
        fl = self.fl_bitmap.bit_scan_forward(fl as u32 + 1) as usize;
        if fl < FL_INDEX_COUNT {
            debug_assert!(self.fl_bitmap.get_bit(fl as u32));

            sl = self.sl_bitmap[fl].trailing_zeros() as usize;
            if sl >= SL_INDEX_COUNT {
                debug_assert!(false, "bitmap contradicts the free lists");
                unsafe { unreachable_unchecked() };
            }

            debug_assert!(self.sl_bitmap[fl].get_bit(sl as u32));
            Some((fl, sl))
        } else {
            None
        }
    }

    /// Unlink and return the head of the `(fl, sl)` free list.
    ///
    /// # Safety
    ///
    /// The list must be non-empty.
    unsafe fn unlink_head(&mut self, fl: usize, sl: usize) -> NonNull<FreeBlockHdr> {
        let first_free = &mut self.first_free[fl][sl];
        let block = first_free.unwrap_or_else(|| unreachable_unchecked());

        // The general `unlink_free_block` is overkill here: the head's
        // `prev_free` is known to be `None`.
        if let Some(mut next_free) = block.as_ref().next_free {
            next_free.as_mut().prev_free = None;
            *first_free = Some(next_free);
        } else {
            *first_free = None;
            self.sl_bitmap[fl].clear_bit(sl as u32);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap.clear_bit(fl as u32);
            }
        }

        block
    }

    /// Attempt to allocate `size` bytes.
    ///
    /// A `size` of zero is served with a minimum-size block
    /// ([`min_block_size`]).
    ///
    /// Returns the starting address of the allocated memory block on
    /// success; `None` if no free block can satisfy the request or `size`
    /// exceeds [`max_block_size`].
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.assert_valid();
        let size = adjust_request_size(size)?;
        let (fl, sl) = self.search_suitable_block(size)?;

        unsafe {
            let block = self.unlink_head(fl, sl);
            debug_assert!(block.as_ref().common.is_free());
            debug_assert!(block.as_ref().common.size() >= size);

            Some(self.prepare_used(block, size))
        }
    }

    /// Attempt to allocate `size` bytes at an address that is a multiple
    /// of `align`.
    ///
    /// Returns `None` if `align` is not a power of two or no free block
    /// can satisfy the request. An `align` of [`ALIGN`] or less is
    /// satisfied by every allocation, so such requests are equivalent to
    /// [`Self::allocate`].
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.assert_valid();
        if !align.is_power_of_two() {
            return None;
        }
        if align <= ALIGN {
            return self.allocate(size);
        }

        let size = adjust_request_size(size)?;

        // Oversize the search so that any found block is guaranteed to
        // contain an `align`ed payload position preceded by either no gap
        // at all or a gap wide enough to stand as a block of its own
        let search_size = size.checked_add(align.checked_add(MIN_BLOCK_SIZE)?)?;
        let (fl, sl) = self.search_suitable_block(search_size)?;

        unsafe {
            let block = self.unlink_head(fl, sl);
            debug_assert!(block.as_ref().common.size() >= search_size);

            // The gap between the natural payload position and the next
            // `align` boundary
            let payload_addr = block.as_ptr() as usize + mem::size_of::<UsedBlockHdr>();
            let mut gap = payload_addr.wrapping_neg() & (align - 1);
            if gap != 0 && gap < MIN_BLOCK_SIZE {
                // Too narrow to host an intervening free block; move on to
                // the next boundary
                gap += align;
            }

            let block = if gap == 0 {
                block
            } else {
                self.trim_free_leading(block, gap)
            };
            debug_assert_eq!(
                (block.as_ptr() as usize + mem::size_of::<UsedBlockHdr>()) % align,
                0
            );

            Some(self.prepare_used(block, size))
        }
    }

    /// Trim the trailing slack off a free, unlinked block, mark it used,
    /// and return its payload.
    ///
    /// # Safety
    ///
    /// `block` must be a free block owned by `self` and on no free list;
    /// `size` must be a valid block size not exceeding the block's.
    unsafe fn prepare_used(
        &mut self,
        mut block: NonNull<FreeBlockHdr>,
        size: usize,
    ) -> NonNull<u8> {
        self.trim_free(block, size);

        block.as_mut().common.size &= !SIZE_FREE;
        let mut next = block.as_ref().common.next_phys_block();
        next.as_mut().size &= !SIZE_PREV_FREE;

        payload_of(block.cast())
    }

    /// Split the remainder off an oversized free block and return it to
    /// the matrix. Does nothing if the remainder is too small to stand as
    /// a block of its own; the slack then rides along inside the block.
    ///
    /// # Safety
    ///
    /// `block` must be a free block owned by `self` and on no free list;
    /// `size` must be a valid block size not exceeding the block's.
    unsafe fn trim_free(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        debug_assert!(block.as_ref().common.is_free());
        let whole = block.as_ref().common.size();
        debug_assert!(whole >= size);
        if whole - size < MIN_BLOCK_SIZE {
            return;
        }

        let rest_size = whole - size;
        let mut rest =
            NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(size)).cast::<FreeBlockHdr>();
        rest.as_mut().common = BlockHdr {
            // `block` is still flagged free at this point. If the front
            // part is being handed out, `prepare_used` clears this
            // `SIZE_PREV_FREE` again right afterwards.
            size: rest_size | SIZE_FREE | SIZE_PREV_FREE,
            prev_phys_block: Some(block.cast()),
        };
        block.as_mut().common.set_size(size);

        let mut next = rest.as_ref().common.next_phys_block();
        debug_assert!(next.as_ref().is_prev_free());
        next.as_mut().prev_phys_block = Some(rest.cast());

        self.link_free_block(rest, rest_size);
    }

    /// Carve `gap` bytes off the front of a free, unlinked block, donate
    /// the gap back to the matrix, and return the trailing rest.
    ///
    /// # Safety
    ///
    /// `block` must be a free block owned by `self` and on no free list.
    /// Both `gap` and the remaining size must be valid block sizes.
    unsafe fn trim_free_leading(
        &mut self,
        mut block: NonNull<FreeBlockHdr>,
        gap: usize,
    ) -> NonNull<FreeBlockHdr> {
        debug_assert!(block.as_ref().common.is_free());
        let whole = block.as_ref().common.size();
        debug_assert!(gap >= MIN_BLOCK_SIZE && gap % ALIGN == 0);
        debug_assert!(whole - gap >= MIN_BLOCK_SIZE);

        let rest_size = whole - gap;
        let mut rest =
            NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(gap)).cast::<FreeBlockHdr>();
        rest.as_mut().common = BlockHdr {
            size: rest_size | SIZE_FREE | SIZE_PREV_FREE,
            prev_phys_block: Some(block.cast()),
        };
        block.as_mut().common.set_size(gap);

        let mut next = rest.as_ref().common.next_phys_block();
        debug_assert!(next.as_ref().is_prev_free());
        next.as_mut().prev_phys_block = Some(rest.cast());

        // The gap's own physical predecessor is used (free neighbors would
        // have coalesced), so it goes straight back to the matrix
        self.link_free_block(block, gap);

        rest
    }

    /// Split the tail off an oversized used block and hand the remainder
    /// back to the matrix, merged with the following block if that one is
    /// free.
    ///
    /// # Safety
    ///
    /// `block` must be a used block owned by `self`; `size` must be a
    /// valid block size not exceeding the block's.
    unsafe fn trim_used(&mut self, mut block: NonNull<UsedBlockHdr>, size: usize) {
        debug_assert!(!block.as_ref().common.is_free());
        let whole = block.as_ref().common.size();
        debug_assert!(whole >= size);
        if whole - size < MIN_BLOCK_SIZE {
            return;
        }

        let rest_size = whole - size;
        let mut rest =
            NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(size)).cast::<FreeBlockHdr>();
        rest.as_mut().common = BlockHdr {
            // The front part stays used
            size: rest_size | SIZE_FREE,
            prev_phys_block: None,
        };
        block.as_mut().common.set_size(size);

        self.merge_next(rest);
        self.link_free_block(rest, rest.as_ref().common.size());
    }

    /// Absorb the next physical block into the free block `block` if that
    /// neighbor is itself free, then point the following block's back-link
    /// at `block`.
    ///
    /// # Safety
    ///
    /// `block` must be a free (flagged) block owned by `self` and on no
    /// free list.
    unsafe fn merge_next(&mut self, mut block: NonNull<FreeBlockHdr>) {
        debug_assert!(block.as_ref().common.is_free());

        let next = block.as_ref().common.next_phys_block();
        if next.as_ref().is_free() {
            let next_size = next.as_ref().size();
            self.unlink_free_block(next.cast(), next_size);
            // Adding the masked size leaves `block`'s flag bits untouched
            block.as_mut().common.size += next_size;
        }

        let mut next = block.as_ref().common.next_phys_block();
        next.as_mut().size |= SIZE_PREV_FREE;
        next.as_mut().prev_phys_block = Some(block.cast());
    }

    /// If the physically previous block is free, absorb `block` into it.
    /// Returns the block holding the merged result.
    ///
    /// # Safety
    ///
    /// `block` must be a free (flagged) block owned by `self` and on no
    /// free list.
    unsafe fn merge_prev(&mut self, block: NonNull<FreeBlockHdr>) -> NonNull<FreeBlockHdr> {
        if block.as_ref().common.is_prev_free() {
            let mut prev = block.as_ref().common.prev_phys_block().cast::<FreeBlockHdr>();
            debug_assert!(prev.as_ref().common.is_free());

            let prev_size = prev.as_ref().common.size();
            self.unlink_free_block(prev, prev_size);
            prev.as_mut().common.size += block.as_ref().common.size();
            prev
        } else {
            block
        }
    }

    /// Deallocate a previously allocated memory block, coalescing it with
    /// its free physical neighbors.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via
    /// `self`.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.assert_valid();
        let block = used_block_hdr_for_allocation(ptr);
        debug_assert!(!block.as_ref().common.is_free(), "double free");

        let mut block = block.cast::<FreeBlockHdr>();
        block.as_mut().common.size |= SIZE_FREE;

        let block = self.merge_prev(block);
        self.merge_next(block);
        self.link_free_block(block, block.as_ref().common.size());
    }

    /// Shrink or grow a previously allocated memory block, in place when
    /// possible.
    ///
    /// Returns the new starting address on success. Returns `None` and
    /// leaves the original allocation intact if no free block can satisfy
    /// the request. A `new_size` of zero deallocates `ptr` and returns
    /// `None`.
    ///
    /// # Time Complexity
    ///
    /// Unlike other methods, this method may complete in linear time
    /// (`O(old_size)`) because of the fallback copy.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via
    /// `self`.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        self.assert_valid();
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let mut block = used_block_hdr_for_allocation(ptr);
        debug_assert!(!block.as_ref().common.is_free());
        let old_whole = block.as_ref().common.size();
        let new_whole = adjust_request_size(new_size)?;

        if new_whole <= old_whole {
            // Shrink toward the end, keeping the starting address
            self.trim_used(block, new_whole);
            return Some(ptr);
        }

        // Grow into the next physical block if it is free and large enough
        let next = block.as_ref().common.next_phys_block();
        if next.as_ref().is_free() && old_whole + next.as_ref().size() >= new_whole {
            let next_size = next.as_ref().size();
            self.unlink_free_block(next.cast(), next_size);
            block.as_mut().common.size += next_size;

            // The combined block is used all the way to its new end
            let mut after = block.as_ref().common.next_phys_block();
            after.as_mut().size &= !SIZE_PREV_FREE;

            self.trim_used(block, new_whole);
            return Some(ptr);
        }

        // Relocate. The new block is acquired first so that failure leaves
        // the original allocation untouched.
        let new_ptr = self.allocate(new_size)?;
        let old_payload = old_whole - mem::size_of::<UsedBlockHdr>();
        core::ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_ptr.as_ptr(),
            if old_payload < new_size {
                old_payload
            } else {
                new_size
            },
        );
        self.deallocate(ptr);
        Some(new_ptr)
    }

    /// Get the payload size of the allocation at `ptr`. The returned size
    /// can be slightly larger than the originally requested one.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via a
    /// [`Tlsf`] instance.
    pub unsafe fn size_of_allocation(ptr: NonNull<u8>) -> usize {
        let block = used_block_hdr_for_allocation(ptr);
        debug_assert!(!block.as_ref().common.is_free());
        block.as_ref().common.size() - mem::size_of::<UsedBlockHdr>()
    }

    /// Verify the control-block invariants: bitmap/free-list coherence,
    /// the size class and flags of every listed block, and its physical
    /// neighbors' bookkeeping. Returns the number of violations found
    /// (zero for a healthy allocator).
    pub fn check(&self) -> usize {
        self.assert_valid();
        let mut violations = 0;

        for fl in 0..FL_INDEX_COUNT {
            if self.fl_bitmap.get_bit(fl as u32) != (self.sl_bitmap[fl] != 0) {
                violations += 1;
            }

            for sl in 0..SL_INDEX_COUNT {
                let head = self.first_free[fl][sl];
                if self.sl_bitmap[fl].get_bit(sl as u32) != head.is_some() {
                    violations += 1;
                }

                let mut expected_prev: Option<NonNull<FreeBlockHdr>> = None;
                let mut cur = head;
                while let Some(cur_block) = cur {
                    // Safety: the matrix only references blocks owned by
                    //         `self`
                    let b = unsafe { cur_block.as_ref() };
                    let size = b.common.size();

                    if !b.common.is_free() {
                        violations += 1;
                    }
                    if b.common.is_prev_free() {
                        // Adjacent free blocks must have coalesced
                        violations += 1;
                    }
                    if b.prev_free != expected_prev {
                        violations += 1;
                    }

                    if size < MIN_BLOCK_SIZE || size % ALIGN != 0 {
                        violations += 1;
                    } else {
                        if map::map_floor(size) != Some((fl, sl)) {
                            violations += 1;
                        }

                        // Safety: a listed block has a nonzero size, so it
                        //         cannot be a sentinel
                        let next = unsafe { b.common.next_phys_block() };
                        let next = unsafe { next.as_ref() };
                        if next.is_free() {
                            violations += 1;
                        }
                        if !next.is_prev_free()
                            || next.prev_phys_block != Some(cur_block.cast())
                        {
                            violations += 1;
                        }
                    }

                    expected_prev = cur;
                    cur = b.next_free;
                }
            }
        }

        violations
    }
}

/// A handle identifying one memory pool registered with a [`Tlsf`]
/// instance.
#[derive(Debug, Copy, Clone)]
pub struct Pool(NonNull<BlockHdr>);

impl Pool {
    /// Call `visitor` for every block of this pool in physical (address)
    /// order, passing the block's payload address, its payload size, and
    /// whether it is currently allocated.
    ///
    /// # Safety
    ///
    /// The pool must still be registered with its allocator, no allocator
    /// method may run concurrently, and `visitor` must not call back into
    /// the owning allocator.
    pub unsafe fn walk(self, mut visitor: impl FnMut(NonNull<u8>, usize, bool)) {
        let mut block = self.0;
        while !block.as_ref().is_sentinel() {
            visitor(
                payload_of(block.cast()),
                block.as_ref().size() - mem::size_of::<UsedBlockHdr>(),
                !block.as_ref().is_free(),
            );
            block = block.as_ref().next_phys_block();
        }
    }

    /// Verify the physical-chain invariants of this pool: the coherence of
    /// every block's `SIZE_PREV_FREE` flag and back-link with its actual
    /// neighbor, size alignment, the absence of adjacent free blocks, and
    /// the trailing sentinel. Returns the number of violations found.
    ///
    /// # Safety
    ///
    /// Same as [`Self::walk`].
    pub unsafe fn check(self) -> usize {
        let mut violations = 0;
        let mut block = self.0;
        let mut prev: Option<NonNull<BlockHdr>> = None;
        let mut prev_free = false;

        loop {
            let b = block.as_ref();

            if b.is_prev_free() != prev_free {
                violations += 1;
            }
            if b.is_prev_free() && b.prev_phys_block != prev {
                violations += 1;
            }
            if b.is_free() && prev_free {
                // Adjacent free blocks must have coalesced
                violations += 1;
            }

            if b.is_sentinel() {
                if b.is_free() {
                    violations += 1;
                }
                break;
            }

            if b.size() % ALIGN != 0 || b.size() < MIN_BLOCK_SIZE {
                // The chain cannot be followed any further
                violations += 1;
                break;
            }

            prev = Some(block);
            prev_free = b.is_free();
            block = b.next_phys_block();
        }

        violations
    }
}

mod map;
