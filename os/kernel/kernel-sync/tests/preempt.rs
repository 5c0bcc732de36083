//! Runs in its own test binary: the preemption hook is process-global.

use kernel_sync::{PreemptionHook, SpinLock, install_preemption_hook};
use std::sync::atomic::{AtomicIsize, Ordering};

struct CountingHook {
    depth: AtomicIsize,
}

impl PreemptionHook for CountingHook {
    fn disable(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

static HOOK: CountingHook = CountingHook {
    depth: AtomicIsize::new(0),
};

#[test]
fn locks_disable_preemption_while_held() {
    assert!(install_preemption_hook(&HOOK).is_ok());
    assert!(install_preemption_hook(&HOOK).is_err());

    let a = SpinLock::new(());
    let b = SpinLock::new(());

    let ga = a.lock();
    assert_eq!(HOOK.depth.load(Ordering::SeqCst), 1);
    {
        let _gb = b.lock();
        assert_eq!(HOOK.depth.load(Ordering::SeqCst), 2);
    }
    assert_eq!(HOOK.depth.load(Ordering::SeqCst), 1);

    // A failed attempt must not leak a disable.
    assert!(a.try_lock().is_none());
    assert_eq!(HOOK.depth.load(Ordering::SeqCst), 1);

    drop(ga);
    assert_eq!(HOOK.depth.load(Ordering::SeqCst), 0);

    {
        let _g = a.lock_irq();
        assert_eq!(HOOK.depth.load(Ordering::SeqCst), 1);
    }
    assert_eq!(HOOK.depth.load(Ordering::SeqCst), 0);
}
