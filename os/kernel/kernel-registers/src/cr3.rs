use crate::StoreRegisterUnsafe;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical frame of the active PML4 table plus the cache-control
/// flags used when the CPU reads it.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0–2: reserved (must be 0).
    #[bits(3)]
    __: u8,

    /// Bit 3: PWT, page-level write-through for PML4 reads.
    pub pwt: bool,

    /// Bit 4: PCD, page-level cache disable for PML4 reads.
    pub pcd: bool,

    /// Bits 5–11: reserved (must be 0 when written).
    #[bits(7)]
    __: u8,

    /// Bits 12–51: PML4 frame number.
    #[bits(40)]
    pml4_frame: u64,

    /// Bits 52–63: reserved.
    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// CR3 value that activates the PML4 stored in `root`, write-back cached.
    #[must_use]
    pub const fn for_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_pml4_frame(root.number())
    }

    /// The PML4 frame this value points at.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.pml4_frame())
    }

    #[must_use]
    pub const fn root_address(&self) -> PhysicalAddress {
        self.root().base()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    /// Switches the active address space and flushes non-global TLB entries.
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
