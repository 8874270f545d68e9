// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Blocking primitives underneath a monitor
//!
//! [`Mutex`] and [`ConditionVariable`] here are deliberately "raw": the mutex has no guard and
//! protects no data, since a monitor's ownership outlives any single call frame, and the
//! condition variable is the per-thread wait primitive rather than a shared one. Both are built
//! on one platform [`RawMutex`](crate::platform::RawMutex) each; the locking protocol follows the
//! futex-based mutex and condition variable in Rust's `std`.

use crate::platform;

mod condvar;
mod mutex;

pub use condvar::ConditionVariable;
pub use mutex::Mutex;

/// A convenience name for specific requirements from the platform
pub trait RawSyncPrimitivesProvider:
    platform::RawMutexProvider + platform::DebugLogProvider + platform::DebugBreakProvider + Sync + 'static
{
}
impl<Platform> RawSyncPrimitivesProvider for Platform where
    Platform: platform::RawMutexProvider
        + platform::DebugLogProvider
        + platform::DebugBreakProvider
        + Sync
        + 'static
{
}
