// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # vmsync
//!
//! > Object monitors for a managed-language runtime.
//!
//! vmsync provides the per-object synchronization primitive (the "monitor") behind
//! `synchronized` blocks and `wait`/`notify`, when it is provided a `Platform` interface "below".
//!
//! To use vmsync, you must provide a type that implements the [`platform::Provider`] trait, create
//! a [`Runtime`] over it, and then obtain thread handles and monitors from that runtime. Every
//! monitor operation takes the calling thread's [`VmThread`] handle explicitly; there is no
//! ambient "current thread".

#![no_std]

extern crate alloc;

pub mod monitor;
pub mod platform;
pub mod runtime;
pub mod sync;
pub mod thread;

pub use monitor::{
    BindingProtection, Monitor, MonitorError, MonitorKind, MonitorSnapshot, ThreadSummary,
};
pub use runtime::Runtime;
pub use thread::{ThreadId, ThreadKind, ThreadState, VmThread};
