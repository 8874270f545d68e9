// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The registry of live threads

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use hashbrown::HashMap;

use crate::monitor::Monitor;
use crate::sync::RawSyncPrimitivesProvider;
use crate::thread::{ThreadId, VmThread};

/// The set of live threads of a [`Runtime`](super::Runtime), guarded by a
/// [`MonitorKind::ThreadRegistry`](crate::MonitorKind::ThreadRegistry) monitor.
///
/// The monitor is exposed so that runtime code can hold the registry stable across several
/// operations (e.g. while suspending every thread); the map itself is only reachable through the
/// methods here.
pub struct ThreadRegistry<Platform: RawSyncPrimitivesProvider> {
    monitor: Monitor<Platform>,
    threads: UnsafeCell<HashMap<ThreadId, Arc<VmThread<Platform>>>>,
}

// SAFETY: `threads` is only accessed inside `with_threads`, by the owner of `monitor`.
unsafe impl<Platform: RawSyncPrimitivesProvider> Sync for ThreadRegistry<Platform> {}

impl<Platform: RawSyncPrimitivesProvider> ThreadRegistry<Platform> {
    pub(super) fn new(monitor: Monitor<Platform>) -> Self {
        Self {
            monitor,
            threads: UnsafeCell::new(HashMap::new()),
        }
    }

    pub fn monitor(&self) -> &Monitor<Platform> {
        &self.monitor
    }

    /// Run `f` on the map with the registry monitor held by `current`.
    fn with_threads<R>(
        &self,
        current: &Arc<VmThread<Platform>>,
        f: impl FnOnce(&mut HashMap<ThreadId, Arc<VmThread<Platform>>>) -> R,
    ) -> R {
        self.monitor.enter(current);
        // SAFETY: `current` owns the monitor. The map is never handed out beyond `f`, and none of
        // the closures passed in here call back into the registry, so this is the only reference.
        let result = f(unsafe { &mut *self.threads.get() });
        if let Err(e) = self.monitor.exit(current) {
            unreachable!("thread registry monitor not owned after entering it: {e}")
        }
        result
    }

    pub(super) fn insert(&self, thread: &Arc<VmThread<Platform>>) {
        self.with_threads(thread, |threads| {
            threads.insert(thread.id(), Arc::clone(thread));
        });
    }

    /// Remove `thread`; returns whether it was registered.
    pub(super) fn remove(&self, thread: &Arc<VmThread<Platform>>) -> bool {
        self.with_threads(thread, |threads| threads.remove(&thread.id()).is_some())
    }

    pub(super) fn snapshot(&self, current: &Arc<VmThread<Platform>>) -> Vec<Arc<VmThread<Platform>>> {
        let mut threads: Vec<_> = self.with_threads(current, |threads| threads.values().cloned().collect());
        threads.sort_by_key(|thread| thread.id());
        threads
    }

    pub fn len(&self, current: &Arc<VmThread<Platform>>) -> usize {
        self.with_threads(current, |threads| threads.len())
    }

    pub fn contains(&self, current: &Arc<VmThread<Platform>>, id: ThreadId) -> bool {
        self.with_threads(current, |threads| threads.contains_key(&id))
    }
}
