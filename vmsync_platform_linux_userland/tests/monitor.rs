// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Monitors over real futexes.

#![cfg(target_os = "linux")]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use vmsync::{MonitorError, MonitorKind, Runtime, ThreadKind, ThreadState};
use vmsync_platform_linux_userland::LinuxUserland;

fn runtime() -> Arc<Runtime<LinuxUserland>> {
    Arc::new(Runtime::new(LinuxUserland::new(false)))
}

#[test]
fn monitor_provides_mutual_exclusion() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 2_000;

    let runtime = runtime();
    let monitor = Arc::new(runtime.new_monitor(MonitorKind::Standard));
    let inside = Arc::new(AtomicUsize::new(0));
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let runtime = Arc::clone(&runtime);
            let monitor = Arc::clone(&monitor);
            let inside = Arc::clone(&inside);
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                let thread = runtime.new_thread(format!("worker-{i}"), ThreadKind::Mutator);
                runtime.start_thread(&thread);
                for _ in 0..ITERATIONS {
                    monitor.enter(&thread);
                    // Reentrancy must not release the monitor early.
                    monitor.enter(&thread);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    // Non-atomic increment, split on purpose.
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    monitor.exit(&thread).unwrap();
                    monitor.exit(&thread).unwrap();
                }
                runtime.terminate_thread(&thread);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), THREADS * ITERATIONS);
    assert_eq!(monitor.owner_id(), None);
    let observer = runtime.new_thread("observer", ThreadKind::Mutator);
    assert_eq!(runtime.active_threads(&observer).len(), 0);
}

#[test]
fn producers_and_consumers_hand_off_through_wait_and_notify() {
    const ITEMS: usize = 500;
    const CAPACITY: usize = 4;

    let runtime = runtime();
    let monitor = Arc::new(runtime.new_monitor(MonitorKind::Standard));
    let queue = Arc::new(std::sync::Mutex::new(VecDeque::new()));

    let producer = {
        let runtime = Arc::clone(&runtime);
        let monitor = Arc::clone(&monitor);
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
            let thread = runtime.new_thread("producer", ThreadKind::Mutator);
            for item in 0..ITEMS {
                monitor.enter(&thread);
                while queue.lock().unwrap().len() == CAPACITY {
                    monitor.wait(&thread, 0).unwrap();
                }
                queue.lock().unwrap().push_back(item);
                monitor.notify(&thread, true).unwrap();
                monitor.exit(&thread).unwrap();
            }
        })
    };
    let consumer = {
        let runtime = Arc::clone(&runtime);
        let monitor = Arc::clone(&monitor);
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
            let thread = runtime.new_thread("consumer", ThreadKind::Mutator);
            let mut received = Vec::with_capacity(ITEMS);
            while received.len() < ITEMS {
                monitor.enter(&thread);
                loop {
                    let next = queue.lock().unwrap().pop_front();
                    if let Some(item) = next {
                        received.push(item);
                        break;
                    }
                    monitor.wait(&thread, 0).unwrap();
                }
                monitor.notify(&thread, true).unwrap();
                monitor.exit(&thread).unwrap();
            }
            received
        })
    };

    producer.join().unwrap();
    let received = consumer.join().unwrap();
    assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
}

#[test]
fn timed_wait_returns_after_its_timeout() {
    let runtime = runtime();
    let monitor = runtime.new_monitor(MonitorKind::Standard);
    let thread = runtime.new_thread("main", ThreadKind::Mutator);

    monitor.enter(&thread);
    let start = Instant::now();
    monitor.wait(&thread, 100).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "woke after {elapsed:?}");
    assert_eq!(monitor.recursion_count(), 1);
    assert_eq!(monitor.snapshot(Some(&thread)).waiters.map(|w| w.len()), Some(0));
    monitor.exit(&thread).unwrap();
}

#[test]
fn interrupt_wakes_an_untimed_waiter() {
    let runtime = runtime();
    let monitor = Arc::new(runtime.new_monitor(MonitorKind::Standard));
    let thread = runtime.new_thread("sleeper", ThreadKind::Mutator);

    let handle = {
        let monitor = Arc::clone(&monitor);
        let thread = Arc::clone(&thread);
        std::thread::spawn(move || {
            monitor.enter(&thread);
            let result = monitor.wait(&thread, 0);
            assert_eq!(monitor.owner_id(), Some(thread.id()));
            monitor.exit(&thread).unwrap();
            result
        })
    };

    let start = Instant::now();
    while thread.state() != ThreadState::Waiting {
        assert!(start.elapsed() < Duration::from_secs(10));
        std::thread::sleep(Duration::from_millis(1));
    }
    thread.interrupt();
    assert_eq!(handle.join().unwrap(), Err(MonitorError::Interrupted));
}
