//! # Kernel synchronization primitives
//!
//! Busy-wait locking for code that runs without a scheduler: a
//! [`SpinLock`] for mutable shared state and a [`SyncOnceCell`] for
//! subsystems that are created once during boot. [`SpinLock::lock_irq`]
//! additionally masks interrupts for state that handlers share.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
