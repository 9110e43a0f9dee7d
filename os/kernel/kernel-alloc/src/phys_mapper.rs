//! # HHDM-based `PhysMapper`
//!
//! Every physical address is visible at `hhdm_offset + pa` once the higher
//! half direct map is installed. Both directions are plain wrapping
//! arithmetic, so they are total and inverse to each other.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a kernel with a higher-half direct map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// `virtual = physical + offset`
    ///
    /// ```rust
    /// # use kernel_alloc::phys_mapper::HhdmPhysMapper;
    /// # use kernel_memory_addresses::PhysicalAddress;
    /// let hhdm = HhdmPhysMapper::new(0xFFFF_8000_0000_0000);
    /// let pa = PhysicalAddress::new(0x1234_5000);
    /// let va = hhdm.phys_to_virt(pa);
    /// assert_eq!(va.as_u64(), 0xFFFF_8000_1234_5000);
    /// assert_eq!(hhdm.virt_to_phys(va), pa);
    /// ```
    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64()).wrapping_add(self.offset)
    }

    /// `physical = virtual - offset`
    #[inline]
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(va.as_u64()).wrapping_sub(self.offset)
    }

    /// Raw pointer to the HHDM alias of `pa`.
    #[inline]
    #[must_use]
    pub fn ptr<T>(&self, pa: PhysicalAddress) -> *mut T {
        self.phys_to_virt(pa).as_mut_ptr()
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *self.ptr::<T>(pa) }
    }
}
