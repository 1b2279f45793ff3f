//! A test-and-test-and-set spinlock over a region-resident atomic (spec
//! §4.8: "All operations take a spinlock held over the allocator
//! header"). The shared region is writable by unrelated processes, so a
//! `std::sync::Mutex` is out — its poisoning state and (on some
//! platforms) its futex word assume a single address space.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

pub struct SpinlockGuard<'a> {
    flag: &'a AtomicU32,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(UNLOCKED, Ordering::Release);
    }
}

/// Acquire `flag`, spinning with a test-before-test-and-set to avoid
/// hammering the cache line while contended.
pub fn lock(flag: &AtomicU32) -> SpinlockGuard<'_> {
    loop {
        if flag
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return SpinlockGuard { flag };
        }
        while flag.load(Ordering::Relaxed) == LOCKED {
            std::hint::spin_loop();
        }
    }
}
