//! # Preemption control
//!
//! The scheduler lives outside of this workspace. It registers a
//! [`PreemptionHook`] once during boot; until then, preemption control is a
//! no-op, which matches the single-threaded early boot environment.

use crate::SyncOnceCell;

/// Per-CPU preemption counter owned by the scheduler.
///
/// Calls nest: every [`disable`](Self::disable) is paired with exactly one
/// [`enable`](Self::enable) on the same CPU.
pub trait PreemptionHook: Sync {
    fn disable(&self);
    fn enable(&self);
}

static HOOK: SyncOnceCell<&'static dyn PreemptionHook> = SyncOnceCell::new();

/// Install the scheduler's preemption hook.
///
/// # Errors
/// Returns the rejected hook if one is already installed.
pub fn install_preemption_hook(
    hook: &'static dyn PreemptionHook,
) -> Result<(), &'static dyn PreemptionHook> {
    HOOK.set(hook)
}

/// RAII guard that keeps preemption disabled while alive.
pub struct PreemptGuard {
    hook: Option<&'static dyn PreemptionHook>,
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl PreemptGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let hook = HOOK.get().copied();
        if let Some(hook) = hook {
            hook.disable();
        }
        Self { hook }
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.hook {
            hook.enable();
        }
    }
}
