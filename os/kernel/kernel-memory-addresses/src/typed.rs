//! Physical and virtual flavors of [`MemoryAddress`] and [`MemoryPage`].

use crate::{MemoryAddress, MemoryAddressOffset, MemoryPage, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign};

macro_rules! typed_address {
    (
        $(#[$addr_meta:meta])* $addr:ident,
        $(#[$page_meta:meta])* $page:ident,
        $short:literal
    ) => {
        $(#[$addr_meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $addr(MemoryAddress);

        impl $addr {
            #[inline]
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(MemoryAddress::new(v))
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0.as_u64()
            }

            #[inline]
            #[must_use]
            pub const fn page<S: PageSize>(self) -> $page<S> {
                $page(self.0.page::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
                self.0.offset::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn split<S: PageSize>(self) -> ($page<S>, MemoryAddressOffset<S>) {
                (self.page::<S>(), self.offset::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.0.is_aligned::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn align_up<S: PageSize>(self) -> Option<Self> {
                match self.0.align_up::<S>() {
                    Some(a) => Some(Self(a)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(a) => Some(Self(a)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn wrapping_add(self, rhs: u64) -> Self {
                Self(self.0.wrapping_add(rhs))
            }

            #[inline]
            #[must_use]
            pub const fn wrapping_sub(self, rhs: u64) -> Self {
                Self(self.0.wrapping_sub(rhs))
            }
        }

        impl fmt::Debug for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($short, "(0x{:016X})"), self.as_u64())
            }
        }

        impl fmt::Display for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.as_u64())
            }
        }

        impl Add<u64> for $addr {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self::new(self.as_u64() + rhs)
            }
        }

        impl AddAssign<u64> for $addr {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                *self = *self + rhs;
            }
        }

        impl From<u64> for $addr {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        $(#[$page_meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $page<S: PageSize>(MemoryPage<S>);

        impl<S: PageSize> $page<S> {
            /// The page containing `addr` (aligns down).
            #[inline]
            #[must_use]
            pub const fn containing(addr: $addr) -> Self {
                Self(MemoryPage::containing(addr.0))
            }

            /// Page with the given page number (`base >> S::SHIFT`).
            #[inline]
            #[must_use]
            pub const fn from_number(number: u64) -> Self {
                Self(MemoryPage::from_number(number))
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                $addr(self.0.base())
            }

            #[inline]
            #[must_use]
            pub const fn number(self) -> u64 {
                self.0.number()
            }

            #[inline]
            #[must_use]
            pub const fn join(self, off: MemoryAddressOffset<S>) -> $addr {
                $addr(self.0.join(off))
            }

            #[inline]
            #[must_use]
            pub const fn next(self) -> Option<Self> {
                match self.0.next() {
                    Some(p) => Some(Self(p)),
                    None => None,
                }
            }
        }

        impl<S: PageSize> fmt::Debug for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    concat!(stringify!($page), "<{}>(0x{:016X})"),
                    S::LABEL,
                    self.0.base().as_u64()
                )
            }
        }

        impl<S: PageSize> fmt::Display for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl<S: PageSize> From<$page<S>> for $addr {
            #[inline]
            fn from(page: $page<S>) -> Self {
                page.base()
            }
        }
    };
}

typed_address!(
    /// Physical memory address (RAM or MMIO), as stored in page-table
    /// entries and handed out by the frame allocator.
    ///
    /// ```rust
    /// # use kernel_memory_addresses::*;
    /// let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
    /// let (frame, off) = pa.split::<Size4K>();
    /// assert_eq!(frame.base().as_u64(), 0x0000_0010_2000_0000);
    /// assert_eq!(frame.join(off), pa);
    /// ```
    PhysicalAddress,
    /// Base of a physical page of size `S`.
    PhysicalPage,
    "PA"
);

typed_address!(
    /// Virtual memory address. Canonicality is not checked; the type only
    /// keeps virtual and physical values apart.
    ///
    /// ```rust
    /// # use kernel_memory_addresses::*;
    /// let va = VirtualAddress::new(0xFFFF_FFFF_8020_1234);
    /// assert_eq!(va.page::<Size2M>().base().as_u64(), 0xFFFF_FFFF_8020_0000);
    /// assert_eq!(va.offset::<Size2M>().as_u64(), 0x1234);
    /// ```
    VirtualAddress,
    /// Base of a virtual page of size `S`.
    VirtualPage,
    "VA"
);

impl VirtualAddress {
    /// Address of a pointer in the current address space.
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr.expose_provenance() as u64)
    }

    /// Reinterpret this address as a raw pointer.
    ///
    /// Creating the pointer is safe; dereferencing it requires the address
    /// to be mapped and to hold a valid `T`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        core::ptr::with_exposed_provenance_mut(self.as_u64() as usize)
    }
}
