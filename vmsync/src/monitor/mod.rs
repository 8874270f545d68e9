// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Object monitors
//!
//! A [`Monitor`] provides `synchronized` and `wait`/`notify` services on behalf of one bound
//! object. Enter and exit are implemented via a per-monitor [`Mutex`]; wait and notify via a
//! per-monitor wait list and a per-thread [`ConditionVariable`](crate::sync::ConditionVariable) on
//! which a waiting thread suspends itself. A per-thread condition variable is what makes
//! single-thread notification possible.
//!
//! Notification order is LIFO: [`Monitor::notify`] wakes the thread that most recently started
//! waiting.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::num::{NonZeroU64, NonZeroUsize};
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering::Relaxed};
use core::time::Duration;

use log::{trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::platform::{DebugBreakProvider as _, DebugLogProvider as _};
use crate::runtime::Context;
use crate::sync::{Mutex, RawSyncPrimitivesProvider};
use crate::thread::{ThreadId, ThreadState, VmThread};

mod wait_list;


use wait_list::WaitList;

/// Which flavour of `enter`/`exit` a monitor implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    /// Plain `synchronized` semantics.
    Standard,
    /// For the heap's own lock. The GC thread entering it is deadlock prone (it means the GC is
    /// trying to allocate), so that is turned into a fatal error with a stack trace instead of a
    /// hang. See [`Monitor::enter`].
    GcGuard,
    /// For the registry of live threads. A thread that is already
    /// [`Terminated`](ThreadState::Terminated) bypasses the normal entry path, which would
    /// otherwise recurse into the thread-termination sequence that locks the registry.
    ThreadRegistry,
}

/// How far the bound object's use of a monitor has progressed, as seen by whoever decides when a
/// monitor can be unbound and recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BindingProtection {
    /// Bound, but not acquired since.
    PreAcquire,
    /// Owned, or with threads waiting for it.
    Protected,
    /// Fully released after an acquisition.
    Unprotected,
}

/// Errors that can be returned by [`Monitor`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MonitorError {
    #[error("monitor owned by thread \"{name}\" [id={id}]")]
    OwnedByOther { name: String, id: ThreadId },
    #[error("monitor is not owned by any thread")]
    Unowned,
    #[error("thread interrupted while waiting on monitor")]
    Interrupted,
    #[error("monitor is already bound to object {0:#x}")]
    AlreadyBound(usize),
}

impl MonitorError {
    /// Whether this is an illegal-monitor-state error: the caller tried to exit, wait on, or
    /// notify a monitor it does not own.
    pub fn is_ownership_violation(&self) -> bool {
        matches!(self, Self::OwnedByOther { .. } | Self::Unowned)
    }
}

/// A monitor for one bound object.
pub struct Monitor<Platform: RawSyncPrimitivesProvider> {
    kind: MonitorKind,
    context: Arc<Context<Platform>>,
    mutex: Mutex<Platform>,
    /// Raw [`ThreadId`] of the owner, zero when unowned. Written only with `mutex` held; read
    /// without it only to answer "do I own this?", which no other thread can make true.
    owner: AtomicU64,
    /// The owner's handle, kept for error messages and dumps only.
    owner_thread: spin::RwLock<Option<Weak<VmThread<Platform>>>>,
    recursion_count: AtomicU32,
    waiters: UnsafeCell<WaitList<Platform>>,
    bound_object: AtomicUsize,
    binding_protection: AtomicU8,
}

// SAFETY: `waiters` is only ever accessed with `mutex` held (see `waiters_mut`); all other fields
// are atomics or locks.
unsafe impl<Platform: RawSyncPrimitivesProvider> Sync for Monitor<Platform> {}

impl<Platform: RawSyncPrimitivesProvider> Monitor<Platform> {
    pub(crate) fn new(context: Arc<Context<Platform>>, kind: MonitorKind) -> Self {
        let mutex = Mutex::new_from_platform(context.platform());
        Self {
            kind,
            context,
            mutex,
            owner: AtomicU64::new(0),
            owner_thread: spin::RwLock::new(None),
            recursion_count: AtomicU32::new(0),
            waiters: UnsafeCell::new(WaitList::new()),
            bound_object: AtomicUsize::new(0),
            binding_protection: AtomicU8::new(BindingProtection::Unprotected.into()),
        }
    }

    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    /// Prepare the underlying mutex for (re)use, e.g. when an unbound monitor is recycled.
    ///
    /// The monitor must be unowned and have no waiters, which `&mut self` makes observable.
    pub fn allocate(&mut self) {
        debug_assert!(self.owner_id().is_none());
        debug_assert!(self.waiters.get_mut().is_empty());
        self.mutex.reset();
        self.recursion_count.store(0, Relaxed);
    }

    /// The current owner, if any. Racy unless called by the owner.
    pub fn owner_id(&self) -> Option<ThreadId> {
        ThreadId::from_u64(self.owner.load(Relaxed))
    }

    pub fn is_owned_by(&self, thread: &VmThread<Platform>) -> bool {
        self.owner.load(Relaxed) == thread.id().as_u64()
    }

    /// Number of unmatched [`enter`](Self::enter)s by the current owner. Racy unless called by the
    /// owner.
    pub fn recursion_count(&self) -> u32 {
        self.recursion_count.load(Relaxed)
    }

    fn address(&self) -> usize {
        core::ptr::from_ref(self) as usize
    }

    /// Acquire the monitor on behalf of `current`, which must be the calling thread.
    ///
    /// Reentrant: an owner entering again only bumps the recursion count. Otherwise the thread is
    /// [`Blocked`](ThreadState::Blocked) until the monitor is free. Acquisition is not
    /// interruptible.
    ///
    /// # Panics
    ///
    /// On a [`MonitorKind::GcGuard`] monitor, the GC thread entering (after it has allocated its
    /// waiting condition, and while not eliding) raises a fatal error: it would deadlock against
    /// the collection it is running.
    pub fn enter(&self, current: &Arc<VmThread<Platform>>) {
        match self.kind {
            MonitorKind::GcGuard if current.is_gc_thread() => {
                if current.waiting_condition().is_none() {
                    // This is the GC thread creating its private waiting condition, which happens
                    // at boot, so there is no deadlock risk.
                } else if self.context.is_eliding_gc_guard() {
                    // Pretend the GC thread has acquired the lock so that it can allocate, if
                    // necessary, while its stack is being dumped.
                    trace!("{current} elided entry of GC-guard monitor {:#x}", self.address());
                    return;
                } else {
                    self.gc_guard_deadlock(current);
                }
            }
            MonitorKind::ThreadRegistry if current.state() == ThreadState::Terminated => {
                debug_assert!(!self.is_owned_by(current));
                self.mutex.lock();
                self.acquired(current, 1);
                trace!("terminated {current} entered thread registry monitor");
                return;
            }
            _ => {}
        }

        trace!("{current} entering monitor {:#x}", self.address());
        if self.is_owned_by(current) {
            let recursion_count = self.recursion_count.load(Relaxed) + 1;
            self.recursion_count.store(recursion_count, Relaxed);
            trace!(
                "{current} re-entered monitor {:#x} (recursion={recursion_count})",
                self.address()
            );
            return;
        }
        current.set_state(ThreadState::Blocked);
        self.mutex.lock();
        current.set_state(ThreadState::Runnable);
        self.acquired(current, 1);
        trace!("{current} entered monitor {:#x}", self.address());
    }

    /// Release one level of ownership held by `current`; the monitor is only actually released
    /// when the recursion count drops to zero.
    ///
    /// While GC-guard elision is in effect, exiting a [`MonitorKind::GcGuard`] monitor that the
    /// caller does not own is a no-op, mirroring the elided `enter`.
    pub fn exit(&self, current: &Arc<VmThread<Platform>>) -> Result<(), MonitorError> {
        if self.kind == MonitorKind::GcGuard
            && self.context.is_eliding_gc_guard()
            && !self.is_owned_by(current)
        {
            trace!("{current} elided exit of GC-guard monitor {:#x}", self.address());
            return Ok(());
        }

        trace!("{current} exiting monitor {:#x}", self.address());
        self.check_owner(current)?;
        let recursion_count = self.recursion_count.load(Relaxed) - 1;
        if recursion_count == 0 {
            self.set_binding_protection(BindingProtection::Unprotected);
            self.released();
            trace!("{current} released monitor {:#x}", self.address());
            self.mutex.unlock();
        } else {
            self.recursion_count.store(recursion_count, Relaxed);
        }
        Ok(())
    }

    /// Release the monitor and suspend `current` until it is notified, `timeout_millis` elapse
    /// (zero waits indefinitely), or it is interrupted; ownership, with the same recursion count,
    /// is reacquired before returning.
    ///
    /// Waking up by notification and by timeout are indistinguishable to the caller. Spurious
    /// wake-ups are possible, so callers should re-check their condition in a loop.
    ///
    /// # Errors
    ///
    /// An ownership violation if `current` does not own the monitor. [`MonitorError::Interrupted`]
    /// if `current` was interrupted before or during the wait; the monitor is owned again when it
    /// is returned, and the interrupt flag has been cleared.
    ///
    /// # Panics
    ///
    /// If the wait list turns out to be corrupted, which is a fatal error.
    pub fn wait(
        &self,
        current: &Arc<VmThread<Platform>>,
        timeout_millis: u64,
    ) -> Result<(), MonitorError> {
        trace!(
            "{current} waiting on monitor {:#x} (timeout={timeout_millis}ms)",
            self.address()
        );
        self.check_owner(current)?;
        if current.is_interrupted(true) {
            return Err(MonitorError::Interrupted);
        }

        let recursion_count = self.recursion_count.load(Relaxed);
        current.set_state(if timeout_millis == 0 {
            ThreadState::Waiting
        } else {
            ThreadState::TimedWaiting
        });
        let condition = current.allocate_waiting_condition();
        // SAFETY: `current` owns the monitor, so the mutex is held.
        let key = unsafe { self.waiters_mut() }.push_front(current);
        self.released();

        let timeout = NonZeroU64::new(timeout_millis).map(|ms| Duration::from_millis(ms.get()));
        let woken = condition.wait(&self.mutex, timeout, || !current.is_interrupted(false));

        self.acquired(current, recursion_count);
        current.set_state(ThreadState::Runnable);

        // SAFETY: the condition variable reacquired the mutex on our behalf.
        let waiters = unsafe { self.waiters_mut() };
        let still_linked = waiters.is_linked(key);
        if still_linked {
            // Nobody notified us: remove ourselves from the list.
            if let Err(corrupted) = waiters.unlink(key) {
                self.context.fatal(format_args!(
                    "{current} woken from wait by timeout is not in the waiting threads list: \
                     {corrupted}"
                ));
            }
        } else {
            waiters.release(key);
        }

        let interrupted = current.is_interrupted(true);
        trace!(
            "{current} resumed on monitor {:#x} (interrupted={interrupted}, timed_out={}, \
             wake={woken:?})",
            self.address(),
            still_linked && !interrupted,
        );
        if interrupted {
            return Err(MonitorError::Interrupted);
        }
        Ok(())
    }

    /// Wake the most recent waiter, or with `all` every waiter.
    ///
    /// Woken threads become [`Blocked`](ThreadState::Blocked) and only proceed once they
    /// reacquire the monitor, i.e. after `current` exits it.
    ///
    /// # Errors
    ///
    /// An ownership violation if `current` does not own the monitor.
    pub fn notify(&self, current: &Arc<VmThread<Platform>>, all: bool) -> Result<(), MonitorError> {
        trace!(
            "{current} notifying monitor {:#x} (all={all})",
            self.address()
        );
        self.check_owner(current)?;

        // SAFETY: `current` owns the monitor, so the mutex is held.
        let waiters = unsafe { self.waiters_mut() };
        let mut woken = 0usize;
        while let Some(waiter) = waiters.pop_front() {
            // A waiter keeps its own handle alive for as long as it is waiting.
            if let Some(waiter) = waiter.upgrade() {
                waiter.set_state(ThreadState::Blocked);
                let Some(condition) = waiter.waiting_condition() else {
                    unreachable!("{waiter} is waiting without a waiting condition")
                };
                condition.notify_one();
                woken += 1;
            }
            if !all {
                break;
            }
        }

        trace!(
            "{current} notified monitor {:#x} (woken={woken}, still waiting={})",
            self.address(),
            waiters.len()
        );
        Ok(())
    }

    /// Bind the monitor to `object`.
    ///
    /// # Errors
    ///
    /// [`MonitorError::AlreadyBound`] if the monitor is bound to some object already.
    pub fn bind_to(&self, object: NonZeroUsize) -> Result<(), MonitorError> {
        self.bound_object
            .compare_exchange(0, object.get(), Relaxed, Relaxed)
            .map_err(MonitorError::AlreadyBound)?;
        self.set_binding_protection(BindingProtection::PreAcquire);
        Ok(())
    }

    /// Unbind the monitor, returning the object it was bound to.
    pub fn unbind(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.bound_object.swap(0, Relaxed))
    }

    pub fn bound_object(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.bound_object.load(Relaxed))
    }

    #[expect(
        clippy::missing_panics_doc,
        reason = "the protection word only ever holds values written by `set_binding_protection`"
    )]
    pub fn binding_protection(&self) -> BindingProtection {
        BindingProtection::try_from(self.binding_protection.load(Relaxed)).unwrap()
    }

    fn set_binding_protection(&self, protection: BindingProtection) {
        self.binding_protection.store(protection.into(), Relaxed);
    }

    /// Capture the monitor's state for diagnostics.
    ///
    /// The wait list is only included if it can be read safely: when `current` owns the monitor,
    /// or when the monitor's mutex happens to be free.
    pub fn snapshot(&self, current: Option<&VmThread<Platform>>) -> MonitorSnapshot {
        let mutex_locked = self.mutex.is_locked();
        let collect = |waiters: &WaitList<Platform>| {
            waiters
                .iter()
                .filter_map(|waiter| waiter.upgrade())
                .map(|waiter| ThreadSummary::of(&waiter))
                .collect::<Vec<_>>()
        };
        let waiters = if current.is_some_and(|current| self.is_owned_by(current)) {
            // SAFETY: `current` owns the monitor, so the mutex is held.
            Some(collect(unsafe { self.waiters_mut() }))
        } else if self.mutex.try_lock() {
            // SAFETY: we just took the mutex.
            let waiters = collect(unsafe { self.waiters_mut() });
            self.mutex.unlock();
            Some(waiters)
        } else {
            None
        };

        MonitorSnapshot {
            kind: self.kind,
            owner: self.owner_summary(),
            recursion_count: self.recursion_count.load(Relaxed),
            mutex_address: self.mutex.address(),
            mutex_locked,
            bound_object: self.bound_object(),
            binding_protection: self.binding_protection(),
            waiters,
        }
    }

    /// Print a [`snapshot`](Self::snapshot) to the platform's debug log.
    pub fn dump(&self, current: Option<&VmThread<Platform>>) {
        let msg = alloc::format!("{}\n", self.snapshot(current));
        self.context.platform().debug_log_print(&msg);
    }

    fn acquired(&self, current: &Arc<VmThread<Platform>>, recursion_count: u32) {
        *self.owner_thread.write() = Some(Arc::downgrade(current));
        self.owner.store(current.id().as_u64(), Relaxed);
        self.recursion_count.store(recursion_count, Relaxed);
        self.set_binding_protection(BindingProtection::Protected);
    }

    fn released(&self) {
        self.owner.store(0, Relaxed);
        self.recursion_count.store(0, Relaxed);
        *self.owner_thread.write() = None;
    }

    fn check_owner(&self, current: &VmThread<Platform>) -> Result<(), MonitorError> {
        if self.is_owned_by(current) {
            return Ok(());
        }
        Err(match self.owner_summary() {
            Some(ThreadSummary { id, name }) => MonitorError::OwnedByOther { name, id },
            None => MonitorError::Unowned,
        })
    }

    fn owner_summary(&self) -> Option<ThreadSummary> {
        let id = self.owner_id()?;
        let name = self
            .owner_thread
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|owner| owner.id() == id)
            .map_or_else(|| "<unknown>".into(), |owner| owner.name().into());
        Some(ThreadSummary { id, name })
    }

    /// # Safety
    ///
    /// The monitor's mutex must be held by the calling thread, and the returned reference must not
    /// outlive that, nor coexist with another one returned by this method.
    #[allow(clippy::mut_from_ref)]
    unsafe fn waiters_mut(&self) -> &mut WaitList<Platform> {
        // SAFETY: per the function's contract, the mutex serializes every access.
        unsafe { &mut *self.waiters.get() }
    }

    #[cold]
    fn gc_guard_deadlock(&self, current: &VmThread<Platform>) -> ! {
        warn!("GC thread {current} is going for a GC-guard monitor lock. Trying to allocate?");
        warn!("Eliding GC-guard monitor locks for {current} and attempting stack trace...");
        self.context.platform().debug_break();
        self.context.start_eliding_gc_guard();
        self.context.fatal(format_args!(
            "GC thread {current} is attempting to allocate. Attempting stack trace."
        ))
    }
}

/// Identity of a thread in a [`MonitorSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub name: String,
}

impl ThreadSummary {
    fn of<Platform: RawSyncPrimitivesProvider>(thread: &VmThread<Platform>) -> Self {
        Self {
            id: thread.id(),
            name: thread.name().into(),
        }
    }
}

/// A human-readable rendering of a monitor's state, for fault reporting.
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub kind: MonitorKind,
    pub owner: Option<ThreadSummary>,
    pub recursion_count: u32,
    pub mutex_address: usize,
    pub mutex_locked: bool,
    pub bound_object: Option<NonZeroUsize>,
    pub binding_protection: BindingProtection,
    /// Waiting threads, most recent first; `None` if the wait list could not be read safely.
    pub waiters: Option<Vec<ThreadSummary>>,
}

impl core::fmt::Display for MonitorSnapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} monitor owner=", self.kind)?;
        match &self.owner {
            Some(ThreadSummary { id, name }) => write!(f, "\"{name}\" [id={id}]")?,
            None => f.write_str("none")?,
        }
        write!(
            f,
            " recursion={} mutex={:#x} ({})",
            self.recursion_count,
            self.mutex_address,
            if self.mutex_locked { "locked" } else { "unlocked" },
        )?;
        if let Some(object) = self.bound_object {
            write!(f, " bound={object:#x} ({:?})", self.binding_protection)?;
        }
        f.write_str(" waiters={")?;
        match &self.waiters {
            Some(waiters) => {
                for waiter in waiters {
                    write!(f, "{} ", waiter.name)?;
                }
            }
            None => f.write_str("<locked> ")?,
        }
        f.write_str("}")
    }
}
