//! Provides [`BinInteger`], a trait for types that can be used as the
//! first- and second-level bitmaps of a TLSF control block.
use core::{fmt, ops};

/// An unsigned binary integer with bit-addressed accessors.
pub trait BinInteger:
    Clone
    + Copy
    + PartialEq
    + Eq
    + PartialOrd
    + Ord
    + fmt::Debug
    + Send
    + Sync
    + 'static
    + ops::BitAnd<Output = Self>
    + ops::BitOr<Output = Self>
    + ops::BitXor<Output = Self>
    + ops::Not<Output = Self>
{
    const ZERO: Self;
    const ONE: Self;
    const MAX: Self;
    const BITS: u32;

    /// An integer with a one at each position in `range` and zeros
    /// elsewhere. Positions past `Self::BITS` are silently dropped.
    fn ones(range: ops::Range<u32>) -> Self;

    fn trailing_zeros(&self) -> u32;

    fn leading_zeros(&self) -> u32;

    fn get_bit(&self, i: u32) -> bool;

    fn set_bit(&mut self, i: u32);

    fn clear_bit(&mut self, i: u32);

    /// The position of the first set bit at position `start` or higher, or
    /// `Self::BITS` if there is no such bit.
    ///
    /// `start` may be greater than or equal to `Self::BITS`, in which case
    /// `Self::BITS` is returned. This is the "graceful zero" contract the
    /// free-list search relies on.
    fn bit_scan_forward(&self, start: u32) -> u32;
}

macro_rules! impl_bin_integer {
    ($ty:ty) => {
        impl BinInteger for $ty {
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const MAX: Self = <$ty>::MAX;
            const BITS: u32 = <$ty>::BITS;

            #[inline]
            fn ones(range: ops::Range<u32>) -> Self {
                debug_assert!(range.start <= range.end);
                if range.start >= Self::BITS {
                    return 0;
                }
                let hi = if range.end >= Self::BITS {
                    Self::MAX
                } else {
                    (1 << range.end) - 1
                };
                hi & !((1 << range.start) - 1)
            }

            #[inline]
            fn trailing_zeros(&self) -> u32 {
                <$ty>::trailing_zeros(*self)
            }

            #[inline]
            fn leading_zeros(&self) -> u32 {
                <$ty>::leading_zeros(*self)
            }

            #[inline]
            fn get_bit(&self, i: u32) -> bool {
                i < Self::BITS && (*self >> i) & 1 != 0
            }

            #[inline]
            fn set_bit(&mut self, i: u32) {
                debug_assert!(i < Self::BITS);
                *self |= 1 << i;
            }

            #[inline]
            fn clear_bit(&mut self, i: u32) {
                debug_assert!(i < Self::BITS);
                *self &= !(1 << i);
            }

            #[inline]
            fn bit_scan_forward(&self, start: u32) -> u32 {
                if start >= Self::BITS {
                    Self::BITS
                } else {
                    (*self & !Self::ones(0..start)).trailing_zeros()
                }
            }
        }
    };
}

impl_bin_integer!(u8);
impl_bin_integer!(u16);
impl_bin_integer!(u32);
impl_bin_integer!(u64);
impl_bin_integer!(u128);
impl_bin_integer!(usize);
