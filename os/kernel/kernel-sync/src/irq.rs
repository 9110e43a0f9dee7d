//! Interrupt masking for critical sections that interrupt handlers share.
//!
//! A [`SpinLock`] held by interrupted code cannot be released while a
//! handler on the same core spins on it. [`SpinLock::lock_irq`] therefore
//! clears `IF` before acquiring and restores it after releasing.
//!
//! Only bare-metal `x86_64` builds touch `RFLAGS`; on a hosted target
//! (`cli` faults outside ring 0) the guard does nothing.

use crate::spin_lock::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        rflags & RFLAGS_IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn interrupts_enabled() -> bool {
        false
    }

    #[inline]
    pub const fn disable() {}

    #[inline]
    pub const fn enable() {}
}

/// Disables interrupts on creation and re-enables them on drop, but only if
/// they were enabled to begin with.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct IrqGuard {
    were_enabled: bool,
}

impl IrqGuard {
    #[inline]
    pub fn new() -> Self {
        let were_enabled = arch::interrupts_enabled();
        if were_enabled {
            arch::disable();
        }
        Self { were_enabled }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}

/// A [`SpinLockGuard`] taken with interrupts masked.
///
/// The lock is released before interrupts are restored.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> SpinLock<T> {
    /// Mask interrupts, then spin until acquired.
    ///
    /// Use this for state that interrupt handlers may also lock.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        IrqSpinLockGuard {
            guard: self.lock(),
            _irq: irq,
        }
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
