// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A guard-less blocking lock

use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use super::RawSyncPrimitivesProvider;
use crate::platform::{RawMutex as _, RawMutexProvider as _};

const UNLOCKED: u32 = 0;
/// Locked, no other threads waiting.
const LOCKED: u32 = 1;
/// Locked, and other threads may be blocked on it.
const CONTENDED: u32 = 2;

/// Number of spins before a contended `lock` falls back to blocking on the platform.
const SPIN_LIMIT: u32 = 100;

/// A blocking mutual-exclusion lock with explicit [`lock`](Self::lock) and
/// [`unlock`](Self::unlock).
///
/// Unlike Rust's `std::sync::Mutex`, this does not guard any data and hands out no guard: a
/// monitor acquires it in `enter` and releases it in a later, unrelated `exit` call. Keeping
/// lock/unlock balanced is the caller's job.
pub struct Mutex<Platform: RawSyncPrimitivesProvider> {
    raw: Platform::RawMutex,
}

impl<Platform: RawSyncPrimitivesProvider> Mutex<Platform> {
    #[inline]
    pub(crate) fn new_from_platform(platform: &Platform) -> Self {
        Self {
            raw: platform.new_raw_mutex(),
        }
    }

    /// Attempt to take the lock without blocking.
    ///
    /// Returns whether the lock was taken.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.raw
            .underlying_atomic()
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_ok()
    }

    /// Take the lock, blocking until it is available.
    #[inline]
    pub fn lock(&self) {
        if !self.try_lock() {
            self.lock_contended();
        }
    }

    #[cold]
    fn lock_contended(&self) {
        let atomic = self.raw.underlying_atomic();
        let mut state = self.spin();

        // If it's unlocked now, attempt to take the lock without marking it as contended.
        if state == UNLOCKED {
            match atomic.compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed) {
                Ok(_) => return,
                Err(s) => state = s,
            }
        }

        loop {
            // Put the lock in contended state. We avoid an unnecessary write if it is already set
            // to CONTENDED, to be friendlier for the caches.
            if state != CONTENDED && atomic.swap(CONTENDED, Acquire) == UNLOCKED {
                // We changed it from UNLOCKED to CONTENDED, so we just successfully locked it.
                return;
            }

            // Wait for the futex to change state, assuming it is still CONTENDED. An immediate
            // wake-up just means the value already moved on.
            let _ = self.raw.block(CONTENDED);

            state = self.spin();
        }
    }

    fn spin(&self) -> u32 {
        let atomic = self.raw.underlying_atomic();
        let mut spin = SPIN_LIMIT;
        loop {
            // We only use `load` (and not `swap` or `compare_exchange`) while spinning, to be
            // easier on the caches.
            let state = atomic.load(Relaxed);

            // We stop spinning when the mutex is UNLOCKED, but also when it's CONTENDED.
            if state != LOCKED || spin == 0 {
                return state;
            }

            core::hint::spin_loop();
            spin -= 1;
        }
    }

    /// Release the lock, waking one blocked locker if there may be any.
    ///
    /// Must only be called by the thread that currently holds the lock.
    #[inline]
    pub fn unlock(&self) {
        if self.raw.underlying_atomic().swap(UNLOCKED, Release) == CONTENDED {
            // We only wake up one thread. When that thread locks the mutex, it will mark the
            // mutex as CONTENDED (see `lock_contended` above), which makes sure that any other
            // waiting threads will also be woken up eventually.
            self.raw.wake_one();
        }
    }

    /// Whether the lock is currently held by anyone. Only meaningful for diagnostics.
    pub fn is_locked(&self) -> bool {
        self.raw.underlying_atomic().load(Relaxed) != UNLOCKED
    }

    /// The address of the lock word, for diagnostics.
    pub fn address(&self) -> usize {
        core::ptr::from_ref(self.raw.underlying_atomic()) as usize
    }

    /// Put the lock back into its freshly-allocated, unlocked state.
    ///
    /// Taking `&mut self` guarantees nobody holds or is blocked on the lock.
    pub(crate) fn reset(&mut self) {
        self.raw.underlying_atomic().store(UNLOCKED, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::vec::Vec;

    use super::Mutex;
    use crate::platform::mock::MockPlatform;

    #[test]
    fn try_lock_fails_while_held() {
        let platform = MockPlatform::new();
        let mutex = Mutex::new_from_platform(&platform);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock());
        assert!(mutex.is_locked());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn contended_lock_provides_mutual_exclusion() {
        const THREADS: usize = 4;
        const ITERATIONS: usize = 500;

        let platform = MockPlatform::new_leaked();
        let mutex = Arc::new(Mutex::new_from_platform(platform));
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let inside = Arc::clone(&inside);
                let total = Arc::clone(&total);
                std::thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        mutex.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        mutex.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(total.load(Ordering::Relaxed), THREADS * ITERATIONS);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn reset_unlocks() {
        let platform = MockPlatform::new();
        let mut mutex = Mutex::new_from_platform(&platform);
        mutex.lock();
        mutex.reset();
        assert!(mutex.try_lock());
    }
}
