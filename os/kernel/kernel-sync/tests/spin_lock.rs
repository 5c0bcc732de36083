use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let held = l.try_lock();
    assert!(held.is_some());
    assert!(l.try_lock().is_none());

    drop(held);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_result() {
    let l = SpinLock::new(vec![1, 2]);
    let len = l.with_lock(|v| {
        v.push(3);
        v.len()
    });
    assert_eq!(len, 3);
    assert_eq!(l.into_inner(), vec![1, 2, 3]);
}

#[test]
fn get_mut_bypasses_the_lock() {
    let mut l = SpinLock::new(String::from("frame"));
    l.get_mut().push('s');
    assert_eq!(l.lock().as_str(), "frames");
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
