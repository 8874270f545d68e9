// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A [`vmsync::platform::Provider`] for userland Linux, on top of futexes.

#![cfg(target_os = "linux")]

use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicU32, AtomicUsize};
use std::time::Duration;

use vmsync::platform::{ImmediatelyWokenUp, UnblockedOrTimedOut};

/// The userland Linux platform.
///
/// This implements the main [`vmsync::platform::Provider`] trait, i.e., implements all platform
/// traits.
pub struct LinuxUserland {
    /// Whether [`debug_break`](vmsync::platform::DebugBreakProvider::debug_break) raises
    /// `SIGTRAP`. Without a debugger attached that terminates the process, so it is opt-in.
    debug_break_traps: bool,
    debug_breaks: AtomicUsize,
}

impl core::fmt::Debug for LinuxUserland {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinuxUserland")
            .field("debug_break_traps", &self.debug_break_traps)
            .finish_non_exhaustive()
    }
}

impl LinuxUserland {
    /// Create a new userland-Linux platform for use in `vmsync`.
    ///
    /// With `debug_break_traps`, debug breaks raise `SIGTRAP` so that an attached debugger stops;
    /// otherwise they are only logged.
    pub fn new(debug_break_traps: bool) -> &'static Self {
        Box::leak(Box::new(Self {
            debug_break_traps,
            debug_breaks: AtomicUsize::new(0),
        }))
    }

    /// Number of debug breaks requested so far.
    pub fn debug_break_count(&self) -> usize {
        self.debug_breaks.load(SeqCst)
    }
}

impl vmsync::platform::Provider for LinuxUserland {}

impl vmsync::platform::RawMutexProvider for LinuxUserland {
    type RawMutex = RawMutex;

    fn new_raw_mutex(&self) -> Self::RawMutex {
        RawMutex {
            inner: AtomicU32::new(0),
        }
    }
}

pub struct RawMutex {
    // The `inner` is the value shown to the outside world as an underlying atomic.
    inner: AtomicU32,
}

impl RawMutex {
    fn block_or_maybe_timeout(
        &self,
        val: u32,
        timeout: Option<Duration>,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        // We immediately wake up (without even hitting syscalls) if we can clearly see that the
        // value is different.
        if self.inner.load(SeqCst) != val {
            return Err(ImmediatelyWokenUp);
        }

        // We wait on the futex, with a timeout if needed
        match futex_wait(&self.inner, val, timeout) {
            // A signal interrupting the wait counts as a spurious wake-up
            Ok(_) | Err(syscalls::Errno::EINTR) => Ok(UnblockedOrTimedOut::Unblocked),
            Err(syscalls::Errno::EAGAIN) => Err(ImmediatelyWokenUp),
            Err(syscalls::Errno::ETIMEDOUT) => Ok(UnblockedOrTimedOut::TimedOut),
            Err(e) => {
                panic!("Unexpected errno={e} for FUTEX_WAIT")
            }
        }
    }
}

impl vmsync::platform::RawMutex for RawMutex {
    fn underlying_atomic(&self) -> &AtomicU32 {
        &self.inner
    }

    fn wake_many(&self, n: usize) -> usize {
        assert!(n > 0);
        // FUTEX_WAKE takes an `int`; anything beyond that means "everyone".
        let n = u32::try_from(n).unwrap_or(u32::MAX).min(0x7fff_ffff);
        futex_wake(&self.inner, n).expect("failed to wake up waiters")
    }

    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp> {
        match self.block_or_maybe_timeout(val, None) {
            Ok(UnblockedOrTimedOut::Unblocked) => Ok(()),
            Ok(UnblockedOrTimedOut::TimedOut) => unreachable!(),
            Err(ImmediatelyWokenUp) => Err(ImmediatelyWokenUp),
        }
    }

    fn block_or_timeout(
        &self,
        val: u32,
        timeout: Duration,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp> {
        self.block_or_maybe_timeout(val, Some(timeout))
    }
}

impl vmsync::platform::DebugLogProvider for LinuxUserland {
    fn debug_log_print(&self, msg: &str) {
        let _ = unsafe {
            syscalls::syscall3(
                syscalls::Sysno::write,
                libc::STDERR_FILENO as usize,
                msg.as_ptr() as usize,
                msg.len(),
            )
        };
    }
}

impl vmsync::platform::DebugBreakProvider for LinuxUserland {
    fn debug_break(&self) {
        let n = self.debug_breaks.fetch_add(1, SeqCst) + 1;
        log::warn!("debug break #{n} requested");
        if self.debug_break_traps {
            // SAFETY: raising a signal has no memory-safety preconditions.
            unsafe { libc::raise(libc::SIGTRAP) };
        }
    }
}

/// Private (process-local) futex operations used by [`RawMutex`].
#[repr(i32)]
enum FutexOperation {
    Wait = libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
    Wake = libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
}

/// Safer invocation of `FUTEX_WAIT`, with an optional relative timeout.
#[expect(clippy::similar_names, reason = "sec/nsec are as needed by libc")]
fn futex_wait(
    uaddr: &AtomicU32,
    val: u32,
    timeout: Option<Duration>,
) -> Result<usize, syscalls::Errno> {
    let uaddr: *const AtomicU32 = uaddr;
    let timeout = timeout.map(|t| {
        let tv_sec = libc::time_t::try_from(t.as_secs()).unwrap_or(libc::time_t::MAX);
        let tv_nsec = libc::c_long::try_from(t.subsec_nanos()).unwrap();
        libc::timespec { tv_sec, tv_nsec }
    });
    unsafe {
        syscalls::syscall6(
            syscalls::Sysno::futex,
            uaddr as usize,
            usize::try_from(FutexOperation::Wait as i32).unwrap(),
            val as usize,
            timeout
                .as_ref()
                .map_or(0, |t| core::ptr::from_ref(t) as usize),
            // `uaddr2` and `val3` are ignored for this futex operation
            0,
            0,
        )
    }
}

/// Safer invocation of `FUTEX_WAKE`, waking up at most `n` waiters.
fn futex_wake(uaddr: &AtomicU32, n: u32) -> Result<usize, syscalls::Errno> {
    let uaddr: *const AtomicU32 = uaddr;
    unsafe {
        syscalls::syscall6(
            syscalls::Sysno::futex,
            uaddr as usize,
            usize::try_from(FutexOperation::Wake as i32).unwrap(),
            n as usize,
            // `timeout`, `uaddr2` and `val3` are ignored for this futex operation
            0,
            0,
            0,
        )
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicU32;
    use core::time::Duration;
    use std::thread::sleep;

    use vmsync::platform::{
        DebugBreakProvider as _, RawMutex as _, RawMutexProvider as _, UnblockedOrTimedOut,
    };

    use crate::LinuxUserland;

    #[test]
    fn test_raw_mutex() {
        let mutex = std::sync::Arc::new(super::RawMutex {
            inner: AtomicU32::new(0),
        });

        let copied_mutex = mutex.clone();
        std::thread::spawn(move || {
            sleep(Duration::from_millis(500));
            copied_mutex
                .inner
                .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            copied_mutex.wake_many(10);
        });

        assert!(mutex.block(0).is_ok());
    }

    #[test]
    fn test_raw_mutex_value_mismatch_and_timeout() {
        let platform = LinuxUserland::new(false);
        let mutex = platform.new_raw_mutex();
        assert!(mutex.block(1).is_err());
        assert_eq!(
            mutex.block_or_timeout(0, Duration::from_millis(20)).unwrap(),
            UnblockedOrTimedOut::TimedOut
        );
        assert_eq!(mutex.wake_all(), 0);
    }

    #[test]
    fn test_debug_break_without_traps() {
        let platform = LinuxUserland::new(false);
        platform.debug_break();
        platform.debug_break();
        assert_eq!(platform.debug_break_count(), 2);
    }
}
