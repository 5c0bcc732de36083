//! # Kernel synchronization primitives
//!
//! Spin-based locks used by the memory manager. Every [`SpinLock`] suppresses
//! preemption for its holder through the [`PreemptionHook`] installed by the
//! scheduler; [`SpinLock::lock_irq`] additionally masks hardware interrupts.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
pub mod preempt;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use preempt::{PreemptGuard, PreemptionHook, install_preemption_hook};
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
