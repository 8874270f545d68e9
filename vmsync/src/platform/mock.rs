// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Crate-local test-only mock platform for easily running tests in the various modules.

// Pull in `std` for the test-only world, so that we have a nicer/easier time writing tests
extern crate std;

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;
use std::boxed::Box;
use std::string::String;
use std::sync::{Condvar, Mutex};
use std::vec::Vec;

use super::*;

/// A mock platform that is a [`platform::Provider`](Provider), useful purely for testing within
/// this crate.
///
/// - Raw mutexes emulate futex semantics with a std mutex and condvar per raw mutex, so real
///   threads genuinely block and wake
/// - Debug-log output goes to stderr and is also captured for assertions
/// - Debug breaks are counted rather than trapping
pub(crate) struct MockPlatform {
    debug_breaks: AtomicUsize,
    debug_log: Mutex<Vec<String>>,
}

impl MockPlatform {
    pub(crate) fn new() -> Self {
        MockPlatform {
            debug_breaks: AtomicUsize::new(0),
            debug_log: Mutex::new(Vec::new()),
        }
    }

    /// A fresh platform with the `'static` lifetime a [`Runtime`](crate::Runtime) requires.
    pub(crate) fn new_leaked() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    pub(crate) fn debug_break_count(&self) -> usize {
        self.debug_breaks.load(Ordering::SeqCst)
    }

    pub(crate) fn debug_log(&self) -> Vec<String> {
        self.debug_log.lock().unwrap().clone()
    }
}

impl Provider for MockPlatform {}

/// Futex emulation: the `state` mutex serializes value checks against wakes, so a wake that
/// follows a value change can never slip between a blocker's check and its sleep.
pub(crate) struct MockRawMutex {
    atomic: AtomicU32,
    state: Mutex<MockFutexState>,
    condvar: Condvar,
}

#[derive(Default)]
struct MockFutexState {
    waiters: usize,
    /// Number of wake-ups handed out but not yet consumed by a waiter.
    pending_wakes: usize,
}

impl MockRawMutex {
    fn block_or_maybe_timeout(
        &self,
        val: u32,
        timeout: Option<Duration>,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        let mut state = self.state.lock().unwrap();
        if self.atomic.load(Ordering::SeqCst) != val {
            return Err(ImmediatelyWokenUp);
        }
        state.waiters += 1;
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let result = loop {
            if state.pending_wakes > 0 {
                state.pending_wakes -= 1;
                break UnblockedOrTimedOut::Unblocked;
            }
            match deadline {
                None => state = self.condvar.wait(state).unwrap(),
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        break UnblockedOrTimedOut::TimedOut;
                    }
                    state = self.condvar.wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        };
        state.waiters -= 1;
        // A wake aimed at a waiter that timed out instead is dropped, like a futex would.
        state.pending_wakes = state.pending_wakes.min(state.waiters);
        Ok(result)
    }
}

impl RawMutex for MockRawMutex {
    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.atomic
    }

    fn wake_many(&self, n: usize) -> usize {
        let mut state = self.state.lock().unwrap();
        let sleeping = state.waiters.saturating_sub(state.pending_wakes);
        let woken = sleeping.min(n);
        state.pending_wakes += woken;
        if woken > 0 {
            self.condvar.notify_all();
        }
        woken
    }

    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp> {
        match self.block_or_maybe_timeout(val, None)? {
            UnblockedOrTimedOut::Unblocked => Ok(()),
            UnblockedOrTimedOut::TimedOut => unreachable!(),
        }
    }

    fn block_or_timeout(
        &self,
        val: u32,
        time: Duration,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        self.block_or_maybe_timeout(val, Some(time))
    }
}

impl RawMutexProvider for MockPlatform {
    type RawMutex = MockRawMutex;

    fn new_raw_mutex(&self) -> Self::RawMutex {
        MockRawMutex {
            atomic: AtomicU32::new(0),
            state: Mutex::new(MockFutexState::default()),
            condvar: Condvar::new(),
        }
    }
}

impl DebugLogProvider for MockPlatform {
    fn debug_log_print(&self, msg: &str) {
        std::eprint!("{msg}");
        self.debug_log.lock().unwrap().push(msg.into());
    }
}

impl DebugBreakProvider for MockPlatform {
    fn debug_break(&self) {
        self.debug_breaks.fetch_add(1, Ordering::SeqCst);
    }
}
