// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runtime thread handles
//!
//! A [`VmThread`] is the slice of a runtime thread that monitors care about: identity, lifecycle
//! state, the interrupt flag, and the thread's private waiting condition. Handles are created by
//! [`Runtime::new_thread`](crate::Runtime::new_thread) and shared as `Arc<VmThread<_>>`; monitors
//! only ever keep non-owning references to them.

use alloc::string::String;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering, fence};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::sync::{ConditionVariable, RawSyncPrimitivesProvider};

/// A runtime-unique thread identifier. Never reused within one [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub(crate) const fn new(id: NonZeroU64) -> Self {
        Self(id)
    }

    /// Decode a raw value produced by [`as_u64`](Self::as_u64); zero means "no thread".
    pub(crate) fn from_u64(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a thread, as observable by the runtime's thread-inspection APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ThreadState {
    /// Created, not yet started.
    New,
    Runnable,
    /// Blocked acquiring a monitor, or notified and about to reacquire one.
    Blocked,
    /// Waiting on a monitor without a timeout.
    Waiting,
    /// Waiting on a monitor with a timeout.
    TimedWaiting,
    Terminated,
}

/// What role a thread plays in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// An ordinary thread running application code.
    Mutator,
    /// The thread that performs garbage collection. Guarded against re-entering the heap's
    /// monitors by [`MonitorKind::GcGuard`](crate::MonitorKind::GcGuard).
    Gc,
}

/// A runtime thread, as seen by monitors.
pub struct VmThread<Platform: RawSyncPrimitivesProvider> {
    id: ThreadId,
    name: String,
    kind: ThreadKind,
    state: AtomicU8,
    interrupted: AtomicBool,
    /// Allocated the first time the thread waits on any monitor, then reused for every wait.
    waiting_condition: spin::Once<ConditionVariable<Platform>>,
    platform: &'static Platform,
}

impl<Platform: RawSyncPrimitivesProvider> VmThread<Platform> {
    pub(crate) fn new(
        platform: &'static Platform,
        id: ThreadId,
        name: String,
        kind: ThreadKind,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            state: AtomicU8::new(ThreadState::New.into()),
            interrupted: AtomicBool::new(false),
            waiting_condition: spin::Once::new(),
            platform,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The display name of this thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn is_gc_thread(&self) -> bool {
        self.kind == ThreadKind::Gc
    }

    /// The current lifecycle state.
    #[expect(
        clippy::missing_panics_doc,
        reason = "the state word only ever holds values written by `set_state`"
    )]
    pub fn state(&self) -> ThreadState {
        ThreadState::try_from(self.state.load(Ordering::Acquire)).unwrap()
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state.into(), Ordering::Release);
    }

    /// Interrupt this thread.
    ///
    /// Sets the interrupt flag, and wakes the thread if it is blocked in a monitor wait. A thread
    /// blocked acquiring a monitor is not affected until it next waits.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        // Pairs with the fence in `allocate_waiting_condition`: either we see the waiting
        // condition here and signal it, or the waiter sees the flag before it blocks.
        fence(Ordering::SeqCst);
        if let Some(condition) = self.waiting_condition.get() {
            condition.notify_one();
        }
    }

    /// Whether this thread has been interrupted; if `clear` is set the flag is also reset.
    pub fn is_interrupted(&self, clear: bool) -> bool {
        if clear {
            self.interrupted.swap(false, Ordering::SeqCst)
        } else {
            self.interrupted.load(Ordering::SeqCst)
        }
    }

    /// The waiting condition, if this thread has ever needed one.
    pub fn waiting_condition(&self) -> Option<&ConditionVariable<Platform>> {
        self.waiting_condition.get()
    }

    /// The waiting condition, allocating it on first use.
    pub fn allocate_waiting_condition(&self) -> &ConditionVariable<Platform> {
        let condition = self
            .waiting_condition
            .call_once(|| ConditionVariable::new_from_platform(self.platform));
        fence(Ordering::SeqCst);
        condition
    }
}

impl<Platform: RawSyncPrimitivesProvider> core::fmt::Debug for VmThread<Platform> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<Platform: RawSyncPrimitivesProvider> core::fmt::Display for VmThread<Platform> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "\"{}\" [id={}]", self.name, self.id)
    }
}
