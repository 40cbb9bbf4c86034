//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic
//! storage allocation algorithm¹ over caller-supplied memory pools.
//!
//!  - **Allocation, deallocation and aligned allocation are guaranteed to
//!    complete in constant time.** TLSF is suitable for real-time
//!    applications where latency jitter is unacceptable.
//!
//!  - **The memory pools are provided by the application².** Examples of
//!    potential pool sources include: a `static` array for global memory
//!    allocation, a memory block allocated by another memory allocator for
//!    arena allocation. Several pools can be registered with one allocator
//!    and detached again once they are empty.
//!
//!  - **The allocator state itself can live in caller-supplied storage**
//!    ([`Tlsf::create`]), so an instance can be placed inside the very
//!    arena it manages ([`Tlsf::create_with_pool`]).
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal
//!    and RTOS-based applications.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new
//! dynamic memory allocator for real-time systems," *Proceedings. 16th
//! Euromicro Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania,
//! Italy, 2004, pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! <sub>² The allocator can't return free memory blocks to the underlying
//! memory system, except for whole pools via [`Tlsf::remove_pool`].</sub>
//!
//! # Examples
//!
//! ```rust
//! use segfit::Tlsf;
//! use core::mem::MaybeUninit;
//!
//! let mut arena = [MaybeUninit::<u8>::uninit(); 65536];
//!
//! let mut tlsf: Tlsf = Tlsf::new();
//! tlsf.add_pool(&mut arena).unwrap();
//!
//! let p = tlsf.allocate(42).unwrap();
//! assert_eq!(p.as_ptr() as usize % segfit::ALIGN, 0);
//! unsafe {
//!     assert!(Tlsf::size_of_allocation(p) >= 42);
//!     tlsf.deallocate(p);
//! }
//! assert_eq!(tlsf.check(), 0);
//! ```
//!
//! # Details
//!
//! ## Changes from the Original Algorithm
//!
//!  - The end of each memory pool is capped by a sentinel block (a
//!    permanently occupied zero-size block) instead of a last-block-in-pool
//!    flag. This simplifies the coalescing paths a bit and improves their
//!    worst-case performance.
//!
//!  - The aligned allocation path always leaves the block header directly
//!    in front of the returned payload, so [`Tlsf::deallocate`] does not
//!    have to be told the original alignment.
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

pub mod int;
mod tlsf;
pub use self::tlsf::{
    alloc_overhead, max_block_size, min_block_size, pool_overhead, Pool, Tlsf, ALIGN,
};

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests;
