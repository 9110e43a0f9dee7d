//! # Kernel Boot Interface and Memory Configuration
//!
//! Shared definitions between the bootloader hand-off and the kernel memory
//! core.
//!
//! ### Boot Information ([`boot`])
//! * **Memory Map**: ordered [`MemoryRegion`](boot::MemoryRegion) entries
//!   with a [`MemoryRegionKind`](boot::MemoryRegionKind)
//! * **Kernel Location**: physical and virtual base of the loaded image
//! * **HHDM Offset**: the fixed offset of the higher-half direct map
//!
//! ### Memory Configuration ([`memory`])
//! Compile-time constants for frame size, page-table geometry and the heap's
//! growth policy, checked by `const` assertions.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         (unused)                │
//! hhdm_offset           ├─────────────────────────────────┤
//!                       │   Higher Half Direct Mapping    │
//!                       │   phys + hhdm_offset            │
//! virtual_base          ├─────────────────────────────────┤ typically 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//!                       │  phys + (virtual - physical)    │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
