//! Alignment arithmetic shared by the allocators.
//!
//! [`align_up`] covers the common `usize` case. The [`Align`] trait rounds a
//! size of one unsigned width up to an alignment of another width, producing
//! the wider of the two types.

/// Rounds `size` up to the next multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two.
#[inline]
pub const fn align_up(size: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    let mask = alignment - 1;
    (size + mask) & !mask
}

/// Rounds `size` down to the previous multiple of `alignment`.
#[inline]
pub const fn align_down(size: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    size & !(alignment - 1)
}

/// Returns true if `value` is a multiple of `alignment`.
#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Number of `unit`-sized chunks needed to hold `size` bytes.
#[inline]
pub const fn div_ceil(size: usize, unit: usize) -> usize {
    size / unit + (size % unit != 0) as usize
}

/// Round-up between unsigned integers of possibly different widths.
///
/// ```
/// use vmem::align::Align;
///
/// let aligned: u64 = 13u32.align(8u64);
/// assert_eq!(aligned, 16);
/// let aligned: u32 = 4097u32.align(4096u16);
/// assert_eq!(aligned, 8192);
/// ```
pub trait Align<A> {
    /// The wider of `Self` and `A`.
    type Output;

    /// Smallest multiple of `alignment` that is `>= self`.
    fn align(self, alignment: A) -> Self::Output;
}

macro_rules! impl_align {
    ($($size:ty, $alignment:ty => $out:ty;)*) => {
        $(
            impl Align<$alignment> for $size {
                type Output = $out;

                #[inline]
                fn align(self, alignment: $alignment) -> $out {
                    let alignment = alignment as $out;
                    debug_assert!(alignment.is_power_of_two());
                    let mask = alignment - 1;
                    (self as $out + mask) & !mask
                }
            }
        )*
    };
}

impl_align! {
    u8, u8 => u8;
    u8, u16 => u16;
    u8, u32 => u32;
    u8, u64 => u64;
    u8, usize => usize;
    u16, u8 => u16;
    u16, u16 => u16;
    u16, u32 => u32;
    u16, u64 => u64;
    u16, usize => usize;
    u32, u8 => u32;
    u32, u16 => u32;
    u32, u32 => u32;
    u32, u64 => u64;
    u32, usize => usize;
    u64, u8 => u64;
    u64, u16 => u64;
    u64, u32 => u64;
    u64, u64 => u64;
    u64, usize => u64;
    usize, u8 => usize;
    usize, u16 => usize;
    usize, u32 => usize;
    usize, u64 => u64;
    usize, usize => usize;
}
