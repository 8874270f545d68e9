// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The underlying platform upon which vmsync resides.
//!
//! The top-level trait that denotes something is a valid vmsync platform is [`Provider`]. This
//! trait is merely a collection of subtraits that could be composed independently from various
//! other crates that implement them upon various types.
//!
//! vmsync never blocks a thread itself; every suspension goes through a [`RawMutex`] handed out by
//! the platform.

#[cfg(test)]
pub(crate) mod mock;

/// A provider of a platform upon which vmsync can execute.
///
/// Ideally, a [`Provider`] is zero-sized, and only exists to provide access to functionality
/// provided by it. _However_, the provided APIs act upon an `&self` to allow storage of any
/// useful "globals" within it necessary.
pub trait Provider: RawMutexProvider + DebugLogProvider + DebugBreakProvider {}

/// A provider of raw mutexes
pub trait RawMutexProvider {
    type RawMutex: RawMutex;
    /// Allocate a new [`RawMutex`].
    ///
    /// The underlying atomic of a freshly allocated raw mutex is zero.
    fn new_raw_mutex(&self) -> Self::RawMutex;
}

/// A raw mutex/lock API; expected to roughly match (or even be implemented using) a Linux futex.
pub trait RawMutex: Send + Sync {
    /// Returns a reference to the underlying atomic value
    fn underlying_atomic(&self) -> &core::sync::atomic::AtomicU32;

    /// Wake up `n` threads blocked on on this raw mutex.
    ///
    /// Returns the number of waiters that were woken up.
    fn wake_many(&self, n: usize) -> usize;

    /// Wake up one thread blocked on this raw mutex.
    ///
    /// Returns true if this actually woke up such a thread, or false if no thread was waiting on
    /// this raw mutex.
    fn wake_one(&self) -> bool {
        self.wake_many(1) > 0
    }

    /// Wake up all threads that are blocked on this raw mutex.
    ///
    /// Returns the number of waiters that were woken up.
    fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }

    /// If the underlying value is `val`, block until a wake operation wakes us up.
    ///
    /// Spurious returns are permitted; callers re-check their condition.
    fn block(&self, val: u32) -> Result<(), ImmediatelyWokenUp>;

    /// If the underlying value is `val`, block until a wake operation wakes us up, or some `time`
    /// has passed without a wake operation having occured.
    fn block_or_timeout(
        &self,
        val: u32,
        time: core::time::Duration,
    ) -> Result<UnblockedOrTimedOut, ImmediatelyWokenUp>;
}

/// A zero-sized struct indicating that the block was immediately unblocked (due to non-matching
/// value).
#[derive(Debug)]
pub struct ImmediatelyWokenUp;

/// Named-boolean to indicate whether [`RawMutex::block_or_timeout`] was woken up or timed out.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockedOrTimedOut {
    /// Unblocked by a wake call
    Unblocked,
    /// Sufficient time elapsed without a wake call
    TimedOut,
}

/// An interface to dumping debug output for tracing purposes.
pub trait DebugLogProvider {
    /// Print `msg` to the debug log
    ///
    /// Newlines are *not* automatically appended to `msg`, thus the caller must make sure to
    /// include newlines if necessary.
    ///
    /// This is the fault-reporting channel: it must work without any logger being installed, and
    /// must not take any lock that a monitor operation could be holding.
    fn debug_log_print(&self, msg: &str);
}

/// A hook into an attached debugger.
pub trait DebugBreakProvider {
    /// Stop in the debugger, if one is attached; otherwise return immediately.
    ///
    /// Invoked right before vmsync raises a fatal error on a suspected deadlock, so that a
    /// debugger gets to inspect the still-intact state.
    fn debug_break(&self);
}
