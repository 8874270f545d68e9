// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-thread condition variables

use core::sync::atomic::Ordering::SeqCst;
use core::time::Duration;

use super::{Mutex, RawSyncPrimitivesProvider};
use crate::platform::{
    ImmediatelyWokenUp, RawMutex as _, RawMutexProvider as _, UnblockedOrTimedOut,
};

/// A condition variable that a single thread waits on, and any thread may signal.
///
/// The underlying futex word is a notification counter: a waiter samples it while still holding
/// the associated [`Mutex`], and then sleeps only while it is unchanged. A signal that lands
/// after the sample but before the sleep is therefore never lost.
pub struct ConditionVariable<Platform: RawSyncPrimitivesProvider> {
    futex: Platform::RawMutex,
}

impl<Platform: RawSyncPrimitivesProvider> ConditionVariable<Platform> {
    #[inline]
    pub(crate) fn new_from_platform(platform: &Platform) -> Self {
        Self {
            futex: platform.new_raw_mutex(),
        }
    }

    /// Atomically release `mutex` and block until signalled, or until `timeout` passes (`None`
    /// blocks indefinitely); `mutex` is held again when this returns.
    ///
    /// `may_block` is evaluated after the notification counter has been sampled; if it returns
    /// false the wait is skipped and `mutex` is never released. A signaller that changes the state
    /// `may_block` inspects, and then calls [`notify_one`](Self::notify_one), is thus guaranteed
    /// to be observed.
    ///
    /// Spurious wake-ups are possible and reported as [`UnblockedOrTimedOut::Unblocked`].
    pub fn wait(
        &self,
        mutex: &Mutex<Platform>,
        timeout: Option<Duration>,
        may_block: impl FnOnce() -> bool,
    ) -> UnblockedOrTimedOut {
        let counter = self.futex.underlying_atomic().load(SeqCst);
        if !may_block() {
            return UnblockedOrTimedOut::Unblocked;
        }

        mutex.unlock();
        let woken = match timeout {
            None => {
                let _ = self.futex.block(counter);
                UnblockedOrTimedOut::Unblocked
            }
            Some(timeout) => match self.futex.block_or_timeout(counter, timeout) {
                Ok(woken) => woken,
                Err(ImmediatelyWokenUp) => UnblockedOrTimedOut::Unblocked,
            },
        };
        mutex.lock();

        woken
    }

    /// Wake the thread waiting on this condition variable, if any.
    pub fn notify_one(&self) {
        self.futex.underlying_atomic().fetch_add(1, SeqCst);
        self.futex.wake_one();
    }
}
