// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The wait list of a monitor.
//!
//! Waiters live in slots of an arena owned by the list, chained through slot indices with the
//! most recent waiter at the head. A waiting thread holds on to its [`WaiterKey`] for the duration
//! of its wait; after it wakes up, the state of its slot tells it why:
//!
//! - [`Slot::Linked`]: still in the list, so the wake-up was a timeout, a spurious wake-up or an
//!   interrupt, and the waiter must [`unlink`](WaitList::unlink) itself.
//! - [`Slot::Notified`]: a notifier already took it off the list; the waiter just
//!   [`release`](WaitList::release)s the slot.
//!
//! All methods require the monitor's mutex to be held.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use thiserror::Error;

use crate::sync::RawSyncPrimitivesProvider;
use crate::thread::VmThread;

/// Identifies a waiter's slot for the duration of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterKey(usize);

enum Slot<Platform: RawSyncPrimitivesProvider> {
    Vacant {
        next_free: Option<usize>,
    },
    Linked {
        thread: Weak<VmThread<Platform>>,
        next: Option<usize>,
    },
    Notified,
}

/// Raised when a waiter that should still be linked cannot be found.
#[derive(Debug, Error)]
#[error("waiter slot {slot} not found in the wait list (head: {head:?})")]
pub(crate) struct WaitListCorrupted {
    slot: usize,
    head: Option<usize>,
}

pub(crate) struct WaitList<Platform: RawSyncPrimitivesProvider> {
    slots: Vec<Slot<Platform>>,
    head: Option<usize>,
    free: Option<usize>,
    len: usize,
}

impl<Platform: RawSyncPrimitivesProvider> WaitList<Platform> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            free: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Link `thread` in at the head of the list.
    pub(crate) fn push_front(&mut self, thread: &Arc<VmThread<Platform>>) -> WaiterKey {
        let linked = Slot::Linked {
            thread: Arc::downgrade(thread),
            next: self.head,
        };
        let index = if let Some(index) = self.free {
            let Slot::Vacant { next_free } = self.slots[index] else {
                unreachable!("free list points at an occupied slot")
            };
            self.free = next_free;
            self.slots[index] = linked;
            index
        } else {
            self.slots.push(linked);
            self.slots.len() - 1
        };
        self.head = Some(index);
        self.len += 1;
        WaiterKey(index)
    }

    /// Take the head waiter off the list, marking its slot as notified.
    pub(crate) fn pop_front(&mut self) -> Option<Weak<VmThread<Platform>>> {
        let index = self.head?;
        let Slot::Linked { thread, next } =
            core::mem::replace(&mut self.slots[index], Slot::Notified)
        else {
            unreachable!("wait list head is not linked")
        };
        self.head = next;
        self.len -= 1;
        Some(thread)
    }

    /// Whether the waiter identified by `key` is still on the list.
    pub(crate) fn is_linked(&self, key: WaiterKey) -> bool {
        matches!(self.slots.get(key.0), Some(Slot::Linked { .. }))
    }

    /// Remove a still-linked waiter from the list and free its slot.
    pub(crate) fn unlink(&mut self, key: WaiterKey) -> Result<(), WaitListCorrupted> {
        let corrupted = WaitListCorrupted {
            slot: key.0,
            head: self.head,
        };
        let Some(Slot::Linked { next: successor, .. }) = self.slots.get(key.0) else {
            return Err(corrupted);
        };
        let successor = *successor;

        match self.head {
            None => return Err(corrupted),
            // Common case: the waiter is at the head of the list
            Some(head) if head == key.0 => self.head = successor,
            Some(head) => {
                let mut previous = head;
                loop {
                    let Slot::Linked { next, .. } = &mut self.slots[previous] else {
                        unreachable!("linked slot chains to a non-linked slot")
                    };
                    match *next {
                        Some(waiter) if waiter == key.0 => {
                            *next = successor;
                            break;
                        }
                        Some(waiter) => previous = waiter,
                        None => return Err(corrupted),
                    }
                }
            }
        }

        self.len -= 1;
        self.vacate(key.0);
        Ok(())
    }

    /// Free the slot of a waiter that a notifier already took off the list.
    pub(crate) fn release(&mut self, key: WaiterKey) {
        debug_assert!(matches!(self.slots[key.0], Slot::Notified));
        self.vacate(key.0);
    }

    fn vacate(&mut self, index: usize) {
        self.slots[index] = Slot::Vacant {
            next_free: self.free,
        };
        self.free = Some(index);
    }

    /// Iterate over the waiting threads, head (most recent) first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Weak<VmThread<Platform>>> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let index = cursor?;
            let Slot::Linked { thread, next } = &self.slots[index] else {
                unreachable!("linked slot chains to a non-linked slot")
            };
            cursor = *next;
            Some(Weak::clone(thread))
        })
    }
}
