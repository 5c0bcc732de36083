//! # Interrupt masking
//!
//! On bare-metal x86 targets [`IrqGuard`] issues `cli`/`sti` around a critical
//! section. Hosted builds (unit tests, tooling) cannot execute privileged
//! instructions, so there the guard only tracks nesting and never touches the
//! CPU.

/// Bit 9 of `EFLAGS`/`RFLAGS`.
const INTERRUPT_FLAG: usize = 1 << 9;

#[cfg(all(target_os = "none", target_arch = "x86"))]
mod arch {
    #[inline]
    pub fn flags() -> usize {
        let r: usize;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(preserves_flags)) }
        r
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

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod arch {
    #[inline]
    pub fn flags() -> usize {
        let r: usize;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags)) }
        r
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

#[cfg(not(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64"))))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Emulated interrupt flag; starts out enabled like a running kernel.
    static ENABLED: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn flags() -> usize {
        if ENABLED.load(Ordering::Relaxed) {
            super::INTERRUPT_FLAG
        } else {
            0
        }
    }

    #[inline]
    pub fn disable() {
        ENABLED.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn enable() {
        ENABLED.store(true, Ordering::Relaxed);
    }
}

/// Whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::flags() & INTERRUPT_FLAG != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// The guard snapshots the interrupt flag. If interrupts were enabled it
/// disables them, and re-enables them on drop **only** in that case, so
/// nested guards preserve the outer state.
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            arch::disable();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}
