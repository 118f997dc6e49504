use core::fmt;
use std::ops::BitAnd;

/// Byte-lane mask over a 64bit big-endian doubleword.
///
/// `width` bytes starting `alignment` bytes from the most significant end.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ByteMask8 {
    mask: u64,
}

impl ByteMask8 {
    #[inline(always)]
    pub fn new<W, A>(width: W, alignment: A) -> Self
    where u32: From<W>, u32: From<A> {
        let mask = (!0u64).wrapping_shl(64 - u32::from(width) * 8) >> u32::from(alignment) * 8;
        ByteMask8 { mask }
    }

    #[inline(always)]
    pub fn from_value(mask: u64) -> Self {
        ByteMask8 { mask }
    }

    #[inline(always)]
    pub fn apply(&self, data: u64) -> u64 {
        data & self.mask
    }

    #[inline(always)]
    pub fn masked_insert(&self, dest: &mut u64, value: u64) {
        *dest = (*dest & !self.mask) | (value & self.mask);
    }

    #[inline(always)]
    pub fn value(&self) -> u64 {
        self.mask
    }

    /// Splits into the masks for the high and low words
    #[inline(always)]
    pub fn split(&self) -> (ByteMask4, ByteMask4) {
        (ByteMask4 { mask: (self.mask >> 32) as u32 }, ByteMask4 { mask: self.mask as u32 })
    }

    pub fn size(&self) -> u32 {
        self.mask.count_ones() / 8
    }
}

/// Byte-lane mask over a 32bit big-endian word.
///
/// This is what the memory dispatch table's masked write takes.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ByteMask4 {
    mask: u32,
}

impl ByteMask4 {
    #[inline(always)]
    pub fn new<W, A>(width: W, alignment: A) -> Self
    where u32: From<W>, u32: From<A> {
        let mask = (!0u32).wrapping_shl(32 - u32::from(width) * 8) >> u32::from(alignment) * 8;
        ByteMask4 { mask }
    }

    #[inline(always)]
    pub fn from_value(mask: u32) -> Self {
        ByteMask4 { mask }
    }

    #[inline(always)]
    pub fn apply(&self, data: u32) -> u32 {
        data & self.mask
    }

    #[inline(always)]
    pub fn masked_insert(&self, dest: &mut u32, value: u32) {
        *dest = (*dest & !self.mask) | (value & self.mask);
    }

    #[inline(always)]
    pub fn value(&self) -> u32 {
        self.mask
    }

    pub fn size(&self) -> u32 {
        self.mask.count_ones() / 8
    }
}

impl BitAnd for ByteMask8 {
    type Output = Self;

    #[inline(always)]
    fn bitand(self, rhs: Self) -> Self::Output {
        ByteMask8 {
            mask: self.mask & rhs.mask,
        }
    }
}

impl BitAnd for ByteMask4 {
    type Output = Self;

    #[inline(always)]
    fn bitand(self, rhs: Self) -> Self::Output {
        ByteMask4 {
            mask: self.mask & rhs.mask,
        }
    }
}

impl Default for ByteMask8 {
    #[inline(always)]
    fn default() -> Self {
        ByteMask8 { mask: !0 }
    }
}

impl Default for ByteMask4 {
    #[inline(always)]
    fn default() -> Self {
        ByteMask4 { mask: !0 }
    }
}

impl fmt::Debug for ByteMask8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteMask8({:016x})", self.mask)
    }
}

impl fmt::Debug for ByteMask4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteMask4({:08x})", self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 0, 0xff00_0000)]
    #[case(1, 3, 0x0000_00ff)]
    #[case(2, 2, 0x0000_ffff)]
    #[case(4, 0, 0xffff_ffff)]
    fn byte_lanes_are_big_endian(#[case] width: u8, #[case] align: u8, #[case] expected: u32) {
        assert_eq!(ByteMask4::new(width, align).value(), expected);
    }

    #[test]
    fn masked_insert_keeps_other_lanes() {
        let mut dest = 0x1122_3344u32;
        ByteMask4::new(1u8, 1u8).masked_insert(&mut dest, 0xaabb_ccdd);
        assert_eq!(dest, 0x11bb_3344);
    }

    #[test]
    fn doubleword_mask_splits_into_words() {
        let mask = ByteMask8::new(2u8, 3u8);
        let (hi, lo) = mask.split();
        assert_eq!(hi.value(), 0x0000_00ff);
        assert_eq!(lo.value(), 0xff00_0000);
        assert_eq!(mask.size(), 2);
    }
}
