//! Integration tests for host/device tensor transfers.

use std::sync::Arc;
use std::time::Duration;

use flowrt::device::conversion::H2D_FAULT_SOURCE;
use flowrt::prelude::*;
use rand::{Rng, SeedableRng};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime() -> Runtime {
    init_tracing();
    Runtime::builder()
        .executor_config(ExecutorConfig::minimal())
        .arena_config(ArenaConfig::minimal())
        .build()
        .expect("Failed to build runtime")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Test upload then download returns the original bytes for several sizes.
#[test]
fn test_round_trip_sizes() {
    init_tracing();
    let runtime = Runtime::builder()
        .executor_config(ExecutorConfig::minimal())
        .arena_config(ArenaConfig::default())
        .build()
        .expect("Failed to build runtime");

    for len in [0usize, 1, 4096, 1 << 20] {
        let data = pattern(len);
        let src = DenseHostTensor::from_slice(TensorMetadata::bytes(len), &data, runtime.host())
            .expect("Failed to create host tensor");

        let on_device = runtime.upload(&src).expect("Failed to upload tensor");
        assert_eq!(on_device.size_in_bytes(), len);

        let back = runtime.download(&on_device);
        let back = back.wait().as_ref().expect("Failed to download tensor");
        assert_eq!(back.data(), data.as_slice(), "mismatch for {len} bytes");
        assert_eq!(back.metadata(), src.metadata());
    }

    runtime.host().quiesce();
    assert!(runtime.host().faults().is_empty());
    assert_eq!(runtime.host().pending_work(), 0);
}

/// Test typed metadata survives a round trip.
#[test]
fn test_round_trip_typed_tensor() {
    let runtime = runtime();
    let values: Vec<f32> = (0..64).map(|i| i as f32 * 0.5).collect();
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

    let metadata = TensorMetadata::new(DType::F32, vec![8, 8]);
    assert_eq!(metadata.host_size_in_bytes(), bytes.len());

    let src = DenseHostTensor::from_slice(metadata.clone(), &bytes, runtime.host())
        .expect("Failed to create host tensor");
    let on_device = runtime.upload(&src).expect("Failed to upload tensor");
    let back = runtime.download(&on_device);
    let back = back.wait().as_ref().expect("Failed to download tensor");

    assert_eq!(back.metadata(), &metadata);
    assert_eq!(back.data(), bytes.as_slice());
}

/// Test a failed marker creation on download surfaces an enqueue error.
#[test]
fn test_download_marker_failure() {
    let runtime = runtime();
    let data = pattern(1024);
    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(1024), &data, runtime.host())
        .expect("Failed to create host tensor");
    let on_device = runtime.upload(&src).expect("Failed to upload tensor");

    runtime.driver().inject_fault(DriverOp::EventCreate, 1);
    let back = runtime.download(&on_device);

    let err = back.get_error().expect("download should have failed");
    assert_eq!(err.kind(), ErrorKind::Enqueue);
    assert_eq!(runtime.driver().fault_count(DriverOp::EventCreate), 0);

    runtime.host().quiesce();
    assert_eq!(runtime.host().pending_work(), 0);

    // The device tensor is untouched and can still be read back.
    let retry = runtime.download(&on_device);
    let retry = retry.wait().as_ref().expect("Failed to download tensor");
    assert_eq!(retry.data(), data.as_slice());
}

/// Test a failed marker creation on upload returns an enqueue error.
#[test]
fn test_upload_marker_failure() {
    let runtime = runtime();
    let data = pattern(512);
    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(512), &data, runtime.host())
        .expect("Failed to create host tensor");

    runtime.driver().inject_fault(DriverOp::EventCreate, 1);
    let err = runtime.upload(&src).expect_err("upload should have failed");
    assert_eq!(err.kind(), ErrorKind::Enqueue);

    runtime.host().quiesce();
    assert_eq!(runtime.host().pending_work(), 0);
    assert_eq!(runtime.device().memory_stats().live_buffers, 0);
    // Only the caller still holds the source.
    assert_eq!(src.ref_count(), 1);
}

/// Test a rejected copy enqueue fails the download without blocking.
#[test]
fn test_download_copy_rejected() {
    let runtime = runtime();
    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(64), &pattern(64), runtime.host())
        .expect("Failed to create host tensor");
    let on_device = runtime.upload(&src).expect("Failed to upload tensor");

    runtime.driver().inject_fault(DriverOp::MemcpyAsync, 1);
    let back = runtime.download(&on_device);
    assert_eq!(
        back.get_error().map(FlowError::kind),
        Some(ErrorKind::Enqueue)
    );
}

/// Test a rejected completion task releases the freshly allocated buffer.
#[test]
fn test_rejected_upload_frees_buffer() {
    init_tracing();
    let size = 4096;
    let runtime = Runtime::builder()
        .executor_config(ExecutorConfig::minimal())
        .arena_config(ArenaConfig {
            capacity: size,
            ..ArenaConfig::default()
        })
        .build()
        .expect("Failed to build runtime");

    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(size), &pattern(size), runtime.host())
        .expect("Failed to create host tensor");

    runtime.host().shutdown();
    let err = runtime.upload(&src).expect_err("upload should have been rejected");
    assert_eq!(err.kind(), ErrorKind::Submission);

    // The whole arena is available again.
    let stats = runtime.device().memory_stats();
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.in_use, 0);

    let buffer = runtime
        .device()
        .allocator()
        .allocate(size, runtime.device().stream())
        .expect("Failed to reuse the released buffer");
    assert_eq!(buffer.size(), size);
}

/// Test a failed wait behind an upload is reported on the fault channel.
#[test]
fn test_upload_sync_failure_reported() {
    let runtime = runtime();
    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(128), &pattern(128), runtime.host())
        .expect("Failed to create host tensor");

    runtime.driver().inject_fault(DriverOp::EventSynchronize, 1);
    let on_device = runtime.upload(&src).expect("Failed to upload tensor");
    runtime.host().quiesce();

    let faults = runtime.host().take_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].source, H2D_FAULT_SOURCE);
    assert_eq!(faults[0].error.kind(), ErrorKind::Synchronization);

    // The copy itself completed.
    let back = runtime.download(&on_device);
    let back = back.wait().as_ref().expect("Failed to download tensor");
    assert_eq!(back.data(), pattern(128).as_slice());
}

/// Test a copy failing on the stream resolves the download with an error.
#[test]
fn test_download_copy_execution_failure() {
    let runtime = runtime();
    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(256), &pattern(256), runtime.host())
        .expect("Failed to create host tensor");
    let on_device = runtime.upload(&src).expect("Failed to upload tensor");
    runtime.device().synchronize().expect("Failed to synchronize device");

    runtime.driver().inject_fault(DriverOp::CopyExecution, 1);
    let back = runtime.download(&on_device);
    assert!(back.wait().is_err());
}

/// Test transfers that started before a cancel still complete.
#[test]
fn test_cancel_does_not_stop_in_flight_transfer() {
    init_tracing();
    let runtime = Runtime::builder()
        .executor_config(ExecutorConfig::minimal())
        .arena_config(ArenaConfig::minimal())
        .driver_config(CpuDriverConfig::with_latency(Duration::from_millis(20)))
        .build()
        .expect("Failed to build runtime");

    let ctx = runtime.execution_context().expect("Failed to create request");
    let data = pattern(2048);
    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(2048), &data, ctx.host())
        .expect("Failed to create host tensor");

    let on_device = runtime.upload(&src).expect("Failed to upload tensor");
    let back = runtime.download(&on_device);
    assert!(ctx.request_ctx().cancel());
    assert!(ctx.is_cancelled());

    let back = back.wait().as_ref().expect("Failed to download tensor");
    assert_eq!(back.data(), data.as_slice());
}

/// Test many concurrent transfers through a shared runtime.
#[test]
fn test_concurrent_round_trips() {
    let runtime = Arc::new(runtime());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let runtime = Arc::clone(&runtime);
            std::thread::spawn(move || {
                for i in 0..16 {
                    let len = 64 * (t + 1) + i;
                    let data: Vec<u8> = (0..len).map(|b| (b + t) as u8).collect();
                    let src = DenseHostTensor::from_slice(
                        TensorMetadata::bytes(len),
                        &data,
                        runtime.host(),
                    )
                    .expect("Failed to create host tensor");
                    let on_device = runtime.upload(&src).expect("Failed to upload tensor");
                    let back = runtime.download(&on_device);
                    let back = back.wait().as_ref().expect("Failed to download tensor");
                    assert_eq!(back.data(), data.as_slice());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Failed to join transfer thread");
    }

    runtime.host().quiesce();
    assert!(runtime.host().faults().is_empty());
}

/// Test live device tensors never share memory under random churn.
#[test]
fn test_random_churn_no_overlap() {
    let runtime = runtime();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut live: Vec<(DenseGpuTensor, u8)> = Vec::new();

    for round in 0..200u32 {
        if !live.is_empty() && rng.gen_bool(0.4) {
            let idx = rng.gen_range(0..live.len());
            let (tensor, fill) = live.swap_remove(idx);
            let back = runtime.download(&tensor);
            let back = back.wait().as_ref().expect("Failed to download tensor");
            assert!(back.data().iter().all(|&b| b == fill));
            continue;
        }

        let len = rng.gen_range(1..8192);
        let fill = (round % 251) as u8;
        let src = DenseHostTensor::from_slice(TensorMetadata::bytes(len), &vec![fill; len], runtime.host())
            .expect("Failed to create host tensor");
        match runtime.upload(&src) {
            Ok(tensor) => live.push((tensor, fill)),
            Err(e) => assert_eq!(e.kind(), ErrorKind::Allocation),
        }

        let mut ranges: Vec<(usize, usize)> = live
            .iter()
            .map(|(t, _)| {
                let start = t.buffer().pointer().addr();
                (start, start + t.size_in_bytes())
            })
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping buffers: {pair:?}");
        }
    }

    for (tensor, fill) in live {
        let back = runtime.download(&tensor);
        let back = back.wait().as_ref().expect("Failed to download tensor");
        assert!(back.data().iter().all(|&b| b == fill));
    }
}

/// Test host allocation limits fail downloads with an allocation error.
#[test]
fn test_host_allocation_limit() {
    init_tracing();
    let runtime = Runtime::builder()
        .executor_config(
            ExecutorConfigBuilder::minimal()
                .with_max_host_allocation(1024)
                .build(),
        )
        .arena_config(ArenaConfig::minimal())
        .build()
        .expect("Failed to build runtime");

    let buffer = runtime
        .device()
        .allocator()
        .allocate(4096, runtime.device().stream())
        .expect("Failed to allocate device buffer");
    let on_device = DenseGpuTensor::new(TensorMetadata::bytes(4096), Arc::new(buffer));

    let back = runtime.download(&on_device);
    assert_eq!(
        back.get_error().map(FlowError::kind),
        Some(ErrorKind::Allocation)
    );
}

/// Test shutdown waits for outstanding transfers.
#[test]
fn test_runtime_shutdown() {
    let runtime = runtime();
    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(4096), &pattern(4096), runtime.host())
        .expect("Failed to create host tensor");
    let on_device = runtime.upload(&src).expect("Failed to upload tensor");
    let back = runtime.download(&on_device);

    let host = runtime.host().clone();
    runtime.shutdown().expect("Failed to shut down runtime");

    assert!(host.is_shutdown());
    assert!(back.is_ready());
    assert!(host.stats().completed >= 2);
}

/// Test awaiting a download from async code.
#[tokio::test]
async fn test_download_ready_async() {
    let runtime = runtime();
    let data = pattern(300);
    let src = DenseHostTensor::from_slice(TensorMetadata::bytes(300), &data, runtime.host())
        .expect("Failed to create host tensor");
    let on_device = runtime.upload(&src).expect("Failed to upload tensor");

    let back = runtime.download(&on_device);
    let back = tokio::time::timeout(Duration::from_secs(5), back.ready())
        .await
        .expect("Failed to complete download in time")
        .as_ref()
        .expect("Failed to download tensor");
    assert_eq!(back.data(), data.as_slice());
}

/// Test a request scope keeps the executor running after the runtime drops.
#[test]
fn test_request_outlives_runtime() {
    let runtime = runtime();
    let request = runtime.new_request().expect("Failed to create request");
    drop(runtime);

    let host = request.host();
    assert!(!host.is_shutdown());
    let value = host.run_blocking_work(|| Ok(9u32));
    assert_eq!(value.wait(), &Ok(9));
}
