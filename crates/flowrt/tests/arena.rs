//! Integration tests for the device arena on the simulated driver.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowrt::prelude::*;
use parking_lot::Mutex;

fn slow_context(latency: Duration) -> CurrentContext {
    let driver = CpuDriver::new(CpuDriverConfig::with_latency(latency))
        .expect("Failed to create driver");
    CurrentContext::new(Arc::new(driver))
}

/// Test a second caller waiting on the same pending markers is not refused.
#[test]
fn test_concurrent_exhaustion_waits_for_pending_capacity() {
    let ctx = slow_context(Duration::from_millis(300));
    let arena = SubAllocator::new(
        ctx.clone(),
        ArenaConfigBuilder::new()
            .with_capacity(8192)
            .with_alignment(256)
            .build(),
    )
    .expect("Failed to create arena");
    let s1 = ctx.create_stream().expect("Failed to create stream");
    let s2 = ctx.create_stream().expect("Failed to create stream");
    let s3 = ctx.create_stream().expect("Failed to create stream");

    let source = vec![7u8; 4096];
    let first = arena.allocate(4096, s1.get()).expect("Failed to allocate");
    let second = arena.allocate(4096, s1.get()).expect("Failed to allocate");
    // SAFETY: `source` outlives the copy; `s1` is synchronized before it drops.
    unsafe {
        ctx.memcpy_async(
            Pointer::Device(first.pointer()),
            Pointer::host(source.as_ptr()),
            4096,
            s1.get(),
        )
    }
    .expect("Failed to enqueue copy");
    drop(first);
    drop(second);
    assert_eq!(arena.stats().pending, 8192);

    let start = Instant::now();
    let waiter = {
        let arena = Arc::clone(&arena);
        let stream = s2.get();
        std::thread::spawn(move || arena.allocate(4096, stream))
    };
    std::thread::sleep(Duration::from_millis(50));
    let b = arena.allocate(4096, s3.get());
    let waited = start.elapsed();

    let a = waiter
        .join()
        .expect("Failed to join allocating thread")
        .expect("Failed to allocate on the first waiter");
    let b = b.expect("Failed to allocate while capacity was pending");
    assert_ne!(a.pointer(), b.pointer());
    assert!(waited >= Duration::from_millis(200), "returned before the copy finished");

    s1.synchronize().expect("Failed to synchronize stream");
    let stats = arena.stats();
    assert_eq!(stats.in_use, 8192);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.quarantined, 0);
}

/// Test threads sharing one arena across streams never see overlapping buffers.
#[test]
fn test_concurrent_streams_never_overlap() {
    const THREADS: usize = 4;
    const MAX_LIVE: usize = 4;
    const BLOCK: usize = 4096;

    let ctx = slow_context(Duration::from_micros(200));
    let arena = SubAllocator::new(
        ctx.clone(),
        ArenaConfigBuilder::new()
            .with_capacity(THREADS * (MAX_LIVE + 1) * BLOCK)
            .with_alignment(BLOCK)
            .build(),
    )
    .expect("Failed to create arena");
    let ranges = Arc::new(LiveRanges::default());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let arena = Arc::clone(&arena);
            let ranges = Arc::clone(&ranges);
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let stream = ctx.create_stream().expect("Failed to create stream");
                let source = vec![t as u8; BLOCK];
                let mut live: Vec<GpuBuffer> = Vec::new();
                for round in 0..100 {
                    if live.len() == MAX_LIVE || (round % 3 == 2 && !live.is_empty()) {
                        let buffer = live.remove(0);
                        ranges.remove(buffer.pointer().addr());
                        drop(buffer);
                        continue;
                    }

                    let buffer = arena
                        .allocate(1 + (round * 37) % BLOCK, stream.get())
                        .expect("Failed to allocate while capacity was pending");
                    ranges.insert(buffer.pointer().addr(), BLOCK);
                    // SAFETY: `source` lives until the stream is synchronized below.
                    unsafe {
                        ctx.memcpy_async(
                            Pointer::Device(buffer.pointer()),
                            Pointer::host(source.as_ptr()),
                            buffer.size(),
                            stream.get(),
                        )
                    }
                    .expect("Failed to enqueue copy");
                    live.push(buffer);
                }
                for buffer in live.drain(..) {
                    ranges.remove(buffer.pointer().addr());
                }
                stream.synchronize().expect("Failed to synchronize stream");
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Failed to join churn thread");
    }
    let stats = arena.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.quarantined, 0);
}

/// Live ranges shared between churn threads, checked for overlap on insert.
#[derive(Default)]
struct LiveRanges(Mutex<BTreeMap<usize, usize>>);

impl LiveRanges {
    fn insert(&self, start: usize, len: usize) {
        let mut ranges = self.0.lock();
        let end = start + len;
        if let Some((_, &prev_end)) = ranges.range(..=start).next_back() {
            assert!(prev_end <= start, "overlapping live buffers at {start:#x}");
        }
        if let Some((&next_start, _)) = ranges.range(start..).next() {
            assert!(end <= next_start, "overlapping live buffers at {start:#x}");
        }
        ranges.insert(start, end);
    }

    fn remove(&self, start: usize) {
        self.0.lock().remove(&start);
    }
}
