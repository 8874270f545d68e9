// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A module to house all the code for the top-level [`Runtime`] object.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::debug;

use crate::monitor::{Monitor, MonitorKind};
use crate::platform::DebugLogProvider as _;
use crate::sync::RawSyncPrimitivesProvider;
use crate::thread::{ThreadId, ThreadKind, ThreadState, VmThread};

mod registry;

pub use registry::ThreadRegistry;

/// The state of a [`Runtime`] that its monitors share.
pub(crate) struct Context<Platform: RawSyncPrimitivesProvider> {
    platform: &'static Platform,
    /// Set once the GC thread has been caught entering a GC-guard monitor; from then on its
    /// entries and exits of such monitors are no-ops, so that the fault report can allocate.
    eliding_gc_guard: AtomicBool,
}

impl<Platform: RawSyncPrimitivesProvider> Context<Platform> {
    pub(crate) fn platform(&self) -> &'static Platform {
        self.platform
    }

    pub(crate) fn is_eliding_gc_guard(&self) -> bool {
        self.eliding_gc_guard.load(Ordering::SeqCst)
    }

    pub(crate) fn start_eliding_gc_guard(&self) {
        self.eliding_gc_guard.store(true, Ordering::SeqCst);
    }

    /// Report an unrecoverable error, then panic.
    ///
    /// The message goes to the platform's debug log first, since that works even without a
    /// logger and regardless of which locks are held.
    pub(crate) fn fatal(&self, args: core::fmt::Arguments<'_>) -> ! {
        self.platform
            .debug_log_print(&alloc::format!("FATAL ERROR: {args}\n"));
        panic!("{args}")
    }
}

/// A runtime instance.
///
/// This manages the state that monitors would otherwise keep in globals: the GC-guard elision
/// flag and the registry of live threads. Monitors and thread handles are created from it, and
/// only work together with monitors and threads of the same runtime.
pub struct Runtime<Platform: RawSyncPrimitivesProvider> {
    context: Arc<Context<Platform>>,
    registry: ThreadRegistry<Platform>,
    next_thread_id: AtomicU64,
}

impl<Platform: RawSyncPrimitivesProvider> Runtime<Platform> {
    /// Create a new runtime for the given `platform`.
    pub fn new(platform: &'static Platform) -> Self {
        let context = Arc::new(Context {
            platform,
            eliding_gc_guard: AtomicBool::new(false),
        });
        let registry = ThreadRegistry::new(Monitor::new(
            Arc::clone(&context),
            MonitorKind::ThreadRegistry,
        ));
        Self {
            context,
            registry,
            next_thread_id: AtomicU64::new(0),
        }
    }

    pub fn platform(&self) -> &'static Platform {
        self.context.platform()
    }

    /// Create a monitor. It starts out unowned and unbound.
    pub fn new_monitor(&self, kind: MonitorKind) -> Monitor<Platform> {
        Monitor::new(Arc::clone(&self.context), kind)
    }

    /// Create the handle for a new thread, in state [`New`](ThreadState::New).
    pub fn new_thread(&self, name: impl Into<String>, kind: ThreadKind) -> Arc<VmThread<Platform>> {
        let id = ThreadId::new(
            NonZeroU64::MIN.saturating_add(self.next_thread_id.fetch_add(1, Ordering::Relaxed)),
        );
        Arc::new(VmThread::new(self.platform(), id, name.into(), kind))
    }

    /// Mark `thread` as running and add it to the registry of live threads.
    ///
    /// Must be called on the OS thread that `thread` represents.
    pub fn start_thread(&self, thread: &Arc<VmThread<Platform>>) {
        thread.set_state(ThreadState::Runnable);
        self.registry.insert(thread);
        debug!("started thread {thread}");
    }

    /// Mark `thread` as terminated and remove it from the registry of live threads.
    ///
    /// Must be called on the OS thread that `thread` represents, as the last thing it does. The
    /// registry is locked through its monitor's termination path.
    pub fn terminate_thread(&self, thread: &Arc<VmThread<Platform>>) {
        thread.set_state(ThreadState::Terminated);
        let was_registered = self.registry.remove(thread);
        debug!("terminated thread {thread} (was registered: {was_registered})");
    }

    /// A snapshot of the live threads, ordered by id.
    pub fn active_threads(&self, current: &Arc<VmThread<Platform>>) -> Vec<Arc<VmThread<Platform>>> {
        self.registry.snapshot(current)
    }

    pub fn thread_registry(&self) -> &ThreadRegistry<Platform> {
        &self.registry
    }

    /// Whether the GC thread's entries into GC-guard monitors are currently being elided.
    pub fn is_eliding_gc_guard(&self) -> bool {
        self.context.is_eliding_gc_guard()
    }

    /// Return GC-guard monitors to their normal behavior.
    pub fn clear_gc_guard_elision(&self) {
        self.context.eliding_gc_guard.store(false, Ordering::SeqCst);
    }
}
