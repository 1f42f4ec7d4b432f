// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

macro_rules! impl_address {
    ($address_ty:ident) => {
        impl $address_ty {
            pub const MIN: Self = Self(usize::MIN);
            pub const MAX: Self = Self(usize::MAX);

            #[must_use]
            pub const fn new(n: usize) -> Self {
                Self(n)
            }

            #[inline]
            pub const fn get(&self) -> usize {
                self.0
            }

            /// Adds an unsigned offset to this address, panicking if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn add(self, offset: usize) -> Self {
                Self(self.0 + offset)
            }

            /// Subtracts an unsigned offset from this address, panicking if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn sub(self, offset: usize) -> Self {
                Self(self.0 - offset)
            }

            /// Adds an unsigned offset to this address, wrapping around at the boundary of the type.
            #[must_use]
            #[inline]
            pub const fn wrapping_add(self, offset: usize) -> Self {
                Self(self.0.wrapping_add(offset))
            }

            /// Calculates the distance between two addresses in bytes, _where it’s known that `self`
            /// is equal to or greater than `origin`_.
            ///
            /// # Panics
            ///
            /// Panics if `self` is less than `origin`.
            #[must_use]
            #[inline]
            pub const fn offset_from_unsigned(self, origin: Self) -> usize {
                let (a, b) = self.0.overflowing_sub(origin.0);
                if b {
                    panic!("attempt to subtract with overflow")
                } else {
                    a
                }
            }

            #[must_use]
            #[inline]
            pub const fn is_aligned_to(&self, align: usize) -> bool {
                assert!(
                    align.is_power_of_two(),
                    "is_aligned_to: align is not a power-of-two"
                );

                self.0 & (align - 1) == 0
            }

            #[must_use]
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(
                    align.is_power_of_two(),
                    "align_down: align is not a power-of-two"
                );

                Self(self.0 & 0usize.wrapping_sub(align))
            }

            #[must_use]
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(
                    align.is_power_of_two(),
                    "align_up: align is not a power-of-two"
                );

                Self(self.0.wrapping_add(align - 1) & 0usize.wrapping_sub(align))
            }

            /// Returns the byte offset of this address into an `align` sized block.
            #[must_use]
            #[inline]
            pub const fn offset_in(self, align: usize) -> usize {
                self.0 & (align - 1)
            }
        }

        impl From<usize> for $address_ty {
            fn from(value: usize) -> Self {
                $address_ty(value)
            }
        }

        impl ::core::fmt::Display for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_fmt(format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
            }
        }

        impl ::core::fmt::Debug for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.debug_tuple(stringify!($address_ty))
                    .field(&format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
                    .finish()
            }
        }
    };
}

#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(usize);
impl_address!(VirtualAddress);

impl VirtualAddress {
    /// Returns `true` if `self` and `other` select different lines in a virtually indexed cache
    /// whose aliasing bits are `alias_mask`.
    #[must_use]
    #[inline]
    pub const fn aliases(self, other: Self, alias_mask: usize) -> bool {
        (self.0 ^ other.0) & alias_mask != 0
    }
}

#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(usize);
impl_address!(PhysicalAddress);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        let va = VirtualAddress::new(0x1234);
        assert_eq!(va.align_down(0x1000), VirtualAddress::new(0x1000));
        assert_eq!(va.align_up(0x1000), VirtualAddress::new(0x2000));
        assert_eq!(va.offset_in(0x1000), 0x234);
        assert!(!va.is_aligned_to(0x1000));
        assert!(VirtualAddress::new(0x2000).is_aligned_to(0x1000));
    }

    #[test]
    fn cache_colors() {
        let mask = 0x3000;
        assert!(!VirtualAddress::new(0x1000).aliases(VirtualAddress::new(0x5000), mask));
        assert!(VirtualAddress::new(0x1000).aliases(VirtualAddress::new(0x2000), mask));
        assert!(!VirtualAddress::new(0x1000).aliases(VirtualAddress::new(0x2000), 0));
    }
}
