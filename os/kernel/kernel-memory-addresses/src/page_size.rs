use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Page sizes the paging code can install as a leaf.
///
/// Only the 4 KiB base size and the 2 MiB PML2 leaf exist; 1 GiB pages
/// are never produced by the kernel mapper.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + Ord + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// `log2(SIZE)`, the number of low offset bits.
    const SHIFT: u32;
    /// Short label used in formatting, e.g. `4K`.
    const LABEL: &'static str;

    /// Mask selecting the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $size:expr, $shift:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = $size;
            const SHIFT: u32 = $shift;
            const LABEL: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::LABEL)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::LABEL)
            }
        }

        const _: () = assert!(1u64 << $shift == $size);
    };
}

page_size!(
    /// 4 KiB page, the frame granularity of the physical allocator.
    Size4K,
    4096,
    12,
    "4K"
);

page_size!(
    /// 2 MiB page, installed as a PML2 leaf with the page-size bit set.
    Size2M,
    2 * 1024 * 1024,
    21,
    "2M"
);
