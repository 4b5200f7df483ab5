// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for buffer pools, the coordinator and full runs

use remapvid::backends::synthetic::{RawEncoder, SyntheticCapture, Yuyv, fill_yuyv};
use remapvid::errors::PipelineResult;
use remapvid::gpu::{ComputeDevice, ComputeProgram, Dispatcher, HostCompute, IdentityKernel};
use remapvid::map::{MapHeader, open_map};
use remapvid::memory::{HostMemory, SharedMemory};
use remapvid::pipeline::{
    BufferPool, CaptureContext, CaptureStage, CompletionQueue, Coordinator, CoordinatorSettings,
    EncodeContext, EncodeStage, FrameBuffer, HardwareEvent, PoolCounts, RemapStage, SubmitError,
};
use remapvid::runner::{build_pipeline, run_pipeline};
use remapvid::{BackendKind, PipelineError, RemapConfig, RunFlag, Stage};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Bytes in one 128x12 I420 frame (buffer height padded to 16)
const FRAME_BYTES: usize = 3072;

fn write_map() -> tempfile::NamedTempFile {
    let header = MapHeader {
        video_width: 128,
        video_height: 12,
        camera_width: 128,
        camera_height: 12,
    };
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&header.to_bytes()).unwrap();
    file.write_all(&[0u8; 128 * 12 * 4]).unwrap();
    file.flush().unwrap();
    file
}

fn settings(encoder_input_buffers: usize) -> CoordinatorSettings {
    CoordinatorSettings {
        capture_buffers: 3,
        encoder_input_buffers,
        encoder_output_buffers: 8,
        encoder_output_buffer_size: 4096,
        semaphore_timeout: Duration::from_secs(2),
    }
}

fn remap_stage(
    domain: &Arc<dyn SharedMemory>,
    device: Arc<dyn ComputeDevice>,
) -> RemapStage {
    let map = write_map();
    let (geometry, table) = open_map(map.path(), domain).unwrap();
    let program = ComputeProgram::create(domain, 12).unwrap();
    let dispatcher = Dispatcher::new(program, device, Duration::from_secs(2));
    RemapStage::new(dispatcher, table, geometry)
}

fn emulator(host: &Arc<HostMemory>) -> Arc<dyn ComputeDevice> {
    Arc::new(HostCompute::new(Arc::clone(host), Box::new(IdentityKernel)))
}

/// Capture stage driven by the test thread
#[derive(Clone, Default)]
struct ManualCapture {
    ctx: Arc<Mutex<Option<CaptureContext>>>,
}

impl ManualCapture {
    fn push_frame(&self) {
        let guard = self.ctx.lock().unwrap();
        let ctx = guard.as_ref().unwrap();
        let mut frame = ctx.pool.acquire().unwrap();
        frame
            .fill(|buf| {
                fill_yuyv(buf, Yuyv::default());
                buf.len()
            })
            .unwrap();
        ctx.pool.mark_ready(&frame).unwrap();
        ctx.ready.push(frame).unwrap();
    }

    fn push_event(&self, code: u32, message: &str) {
        let guard = self.ctx.lock().unwrap();
        let ctx = guard.as_ref().unwrap();
        ctx.events.push(HardwareEvent::new("camera", code, message)).unwrap();
    }
}

impl CaptureStage for ManualCapture {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn start(&mut self, ctx: CaptureContext) -> PipelineResult<()> {
        *self.ctx.lock().unwrap() = Some(ctx);
        Ok(())
    }

    fn stop(&mut self) -> PipelineResult<()> {
        self.ctx.lock().unwrap().take();
        Ok(())
    }
}

/// Encoder that keeps every submitted frame until it is flushed
#[derive(Clone, Default)]
struct HoldingEncoder {
    held: Arc<Mutex<Vec<FrameBuffer>>>,
    returns: Arc<Mutex<Option<CompletionQueue<FrameBuffer>>>>,
}

impl EncodeStage for HoldingEncoder {
    fn name(&self) -> &'static str {
        "holding"
    }

    fn start(&mut self, ctx: EncodeContext) -> PipelineResult<()> {
        *self.returns.lock().unwrap() = Some(ctx.input_returns);
        Ok(())
    }

    fn submit(&mut self, frame: FrameBuffer) -> Result<(), SubmitError> {
        self.held.lock().unwrap().push(frame);
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        if let Some(returns) = self.returns.lock().unwrap().take() {
            for frame in self.held.lock().unwrap().drain(..) {
                returns.push(frame).unwrap();
            }
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.returns.lock().unwrap().is_none()
    }

    fn stop(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Encoder that refuses every frame
struct RejectingEncoder;

impl EncodeStage for RejectingEncoder {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    fn start(&mut self, _ctx: EncodeContext) -> PipelineResult<()> {
        Ok(())
    }

    fn submit(&mut self, frame: FrameBuffer) -> Result<(), SubmitError> {
        Err(SubmitError::new(
            frame,
            PipelineError::setup(Stage::Encode, "encoder queue full"),
        ))
    }

    fn finish(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    fn is_finished(&self) -> bool {
        true
    }

    fn stop(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Emulated device that clears the run flag while a dispatch is in progress
struct StoppingDevice {
    inner: HostCompute,
    run: RunFlag,
}

impl ComputeDevice for StoppingDevice {
    fn name(&self) -> &'static str {
        "stopping"
    }

    fn set_enabled(&self, enabled: bool) -> PipelineResult<()> {
        self.inner.set_enabled(enabled)
    }

    fn execute(&self, units: usize, mailbox_address: u32, timeout: Duration) -> PipelineResult<()> {
        self.run.stop();
        self.inner.execute(units, mailbox_address, timeout)
    }
}

/// Sink that clears the run flag once `limit` bytes have arrived
struct StopAfter {
    data: Arc<Mutex<Vec<u8>>>,
    limit: usize,
    run: RunFlag,
}

impl Write for StopAfter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut data = self.data.lock().unwrap();
        data.extend_from_slice(buf);
        if data.len() >= self.limit {
            self.run.stop();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_pool_counts_always_sum_to_size() {
    let domain: Arc<dyn SharedMemory> = Arc::new(HostMemory::new());
    let pool = BufferPool::new("test", &domain, 3, 128).unwrap();
    let total = |counts: PoolCounts| counts.total();

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_eq!(total(pool.counts()), 3);
    pool.mark_ready(&a).unwrap();
    assert_eq!(pool.counts(), PoolCounts { free: 1, in_flight: 1, ready: 1 });

    // In-flight buffers may be released without being marked ready
    pool.release(b).unwrap();
    pool.release(a).unwrap();
    assert_eq!(pool.counts(), PoolCounts { free: 3, in_flight: 0, ready: 0 });

    let other = BufferPool::new("other", &domain, 1, 128).unwrap();
    let foreign = other.acquire().unwrap();
    assert!(matches!(pool.release(foreign), Err(PipelineError::Pool(_))));
    assert_eq!(total(pool.counts()), 3);
    assert_eq!(other.counts().in_flight, 1);
}

#[test]
fn test_frames_dropped_when_encoder_input_exhausted() {
    let host = Arc::new(HostMemory::new());
    let domain: Arc<dyn SharedMemory> = host.clone();
    let capture = ManualCapture::default();
    let encoder = HoldingEncoder::default();

    let mut coordinator = Coordinator::new(
        &domain,
        remap_stage(&domain, emulator(&host)),
        Box::new(capture.clone()),
        Box::new(encoder.clone()),
        Box::new(std::io::sink()),
        settings(1),
        RunFlag::new(),
    )
    .unwrap();
    coordinator.start().unwrap();

    for _ in 0..5 {
        capture.push_frame();
        coordinator.drain().unwrap();
        // Every captured buffer comes straight back, remapped or not
        assert_eq!(coordinator.capture_pool().counts().free, 3);
    }

    let stats = coordinator.stats();
    assert_eq!(stats.captured, 5);
    assert_eq!(stats.remapped, 1);
    assert_eq!(stats.dropped, 4);
    assert_eq!(encoder.held.lock().unwrap().len(), 1);
    assert_eq!(
        coordinator.encoder_input_pool().counts(),
        PoolCounts { free: 0, in_flight: 0, ready: 1 }
    );

    let stats = coordinator.shutdown().unwrap();
    assert_eq!(stats.dropped, 4);
    assert_eq!(host.outstanding_locks(), 0);
    assert_eq!(host.allocation_count(), 0);
}

#[test]
fn test_stop_during_dispatch_shuts_down_cleanly() {
    let host = Arc::new(HostMemory::new());
    let domain: Arc<dyn SharedMemory> = host.clone();
    let run = RunFlag::new();
    let device: Arc<dyn ComputeDevice> = Arc::new(StoppingDevice {
        inner: HostCompute::new(Arc::clone(&host), Box::new(IdentityKernel)),
        run: run.clone(),
    });

    let capture =
        SyntheticCapture::new(Yuyv::default(), 30).with_interval(Duration::from_millis(5));
    let coordinator = Coordinator::new(
        &domain,
        remap_stage(&domain, device),
        Box::new(capture),
        Box::new(RawEncoder::new()),
        Box::new(std::io::sink()),
        settings(3),
        run.clone(),
    )
    .unwrap();

    let stats = run_pipeline(coordinator).unwrap();
    assert!(!run.is_running());
    assert_eq!(stats.remapped, 1);
    assert_eq!(stats.encoded_bytes, FRAME_BYTES as u64);
    assert_eq!(host.outstanding_locks(), 0);
    assert_eq!(host.allocation_count(), 0);
}

#[test]
fn test_synthetic_run_writes_remapped_frames() {
    let host = Arc::new(HostMemory::new());
    let domain: Arc<dyn SharedMemory> = host.clone();
    let run = RunFlag::new();
    let data = Arc::new(Mutex::new(Vec::new()));
    let sink = StopAfter {
        data: Arc::clone(&data),
        limit: FRAME_BYTES * 2,
        run: run.clone(),
    };

    let capture = SyntheticCapture::new(Yuyv::new(0x40, 0x60, 0xA0), 30)
        .with_interval(Duration::from_millis(5))
        .with_frame_limit(100);
    let coordinator = Coordinator::new(
        &domain,
        remap_stage(&domain, emulator(&host)),
        Box::new(capture),
        Box::new(RawEncoder::new()),
        Box::new(sink),
        settings(3),
        run,
    )
    .unwrap();

    let stats = run_pipeline(coordinator).unwrap();
    let data = data.lock().unwrap();
    assert!(stats.remapped >= 2);
    assert_eq!(stats.encoded_bytes, data.len() as u64);
    assert_eq!(data.len() % FRAME_BYTES, 0);

    let frame = &data[..FRAME_BYTES];
    assert!(frame[..128 * 12].iter().all(|&y| y == 0x40));
    assert!(frame[128 * 12..2048].iter().all(|&y| y == 0));
    assert!(frame[2048..2048 + 64 * 6].iter().all(|&u| u == 0x60));
    assert!(frame[2560..2560 + 64 * 6].iter().all(|&v| v == 0xA0));
    assert_eq!(host.outstanding_locks(), 0);
}

#[test]
fn test_silent_capture_stalls() {
    let host = Arc::new(HostMemory::new());
    let domain: Arc<dyn SharedMemory> = host.clone();
    let mut settings = settings(3);
    settings.semaphore_timeout = Duration::from_millis(50);

    let coordinator = Coordinator::new(
        &domain,
        remap_stage(&domain, emulator(&host)),
        Box::new(ManualCapture::default()),
        Box::new(HoldingEncoder::default()),
        Box::new(std::io::sink()),
        settings,
        RunFlag::new(),
    )
    .unwrap();

    let err = run_pipeline(coordinator).unwrap_err();
    assert!(matches!(err, PipelineError::Stalled { .. }));
    assert_eq!(err.stage(), remapvid::Stage::Coordinator);
    assert_eq!(host.allocation_count(), 0);
}

#[test]
fn test_build_pipeline_requires_map() {
    let config = RemapConfig {
        emulate: true,
        backend: BackendKind::Synthetic,
        ..Default::default()
    };
    let err = build_pipeline(&config, RunFlag::new()).err().unwrap();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[test]
fn test_configured_run_to_file() {
    let map = write_map();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.yuv");
    let config = RemapConfig {
        map_path: Some(map.path().to_path_buf()),
        output_path: Some(output.clone()),
        backend: BackendKind::Synthetic,
        emulate: true,
        ..Default::default()
    };

    let run = RunFlag::new();
    let coordinator = build_pipeline(&config, run.clone()).unwrap();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        run.stop();
    });

    let stats = run_pipeline(coordinator).unwrap();
    stopper.join().unwrap();

    let written = std::fs::read(&output).unwrap();
    assert_eq!(written.len() as u64, stats.encoded_bytes);
    assert_eq!(written.len() % FRAME_BYTES, 0);
    assert!(stats.remapped > 0);
}

#[test]
fn test_shutdown_writes_encoder_tail() {
    let host = Arc::new(HostMemory::new());
    let domain: Arc<dyn SharedMemory> = host.clone();
    let run = RunFlag::new();
    let device: Arc<dyn ComputeDevice> = Arc::new(StoppingDevice {
        inner: HostCompute::new(Arc::clone(&host), Box::new(IdentityKernel)),
        run: run.clone(),
    });
    let data = Arc::new(Mutex::new(Vec::new()));
    let sink = StopAfter {
        data: Arc::clone(&data),
        limit: usize::MAX,
        run: run.clone(),
    };

    // One frame spans three output buffers, one more than the pool holds
    let mut settings = settings(3);
    settings.encoder_output_buffers = 2;
    settings.encoder_output_buffer_size = 1024;

    let capture =
        SyntheticCapture::new(Yuyv::default(), 30).with_interval(Duration::from_millis(5));
    let coordinator = Coordinator::new(
        &domain,
        remap_stage(&domain, device),
        Box::new(capture),
        Box::new(RawEncoder::new()),
        Box::new(sink),
        settings,
        run,
    )
    .unwrap();

    let stats = run_pipeline(coordinator).unwrap();
    assert_eq!(stats.remapped, 1);
    assert_eq!(stats.encoded_buffers, 3);
    assert_eq!(stats.encoded_bytes, FRAME_BYTES as u64);
    assert_eq!(data.lock().unwrap().len(), FRAME_BYTES);
    assert_eq!(host.outstanding_locks(), 0);
    assert_eq!(host.allocation_count(), 0);
}

#[test]
fn test_hardware_event_between_frames() {
    let host = Arc::new(HostMemory::new());
    let domain: Arc<dyn SharedMemory> = host.clone();
    let capture = ManualCapture::default();
    let encoder = HoldingEncoder::default();

    let mut coordinator = Coordinator::new(
        &domain,
        remap_stage(&domain, emulator(&host)),
        Box::new(capture.clone()),
        Box::new(encoder.clone()),
        Box::new(std::io::sink()),
        settings(3),
        RunFlag::new(),
    )
    .unwrap();
    coordinator.start().unwrap();

    capture.push_frame();
    coordinator.drain().unwrap();
    capture.push_event(7, "sensor overrun");
    coordinator.drain().unwrap();
    capture.push_frame();
    coordinator.drain().unwrap();

    // The event is counted but does not interrupt the frame flow
    let stats = coordinator.stats();
    assert_eq!(stats.hardware_events, 1);
    assert_eq!(stats.captured, 2);
    assert_eq!(stats.remapped, 2);
    assert_eq!(stats.dropped, 0);
    assert_eq!(coordinator.capture_pool().counts().free, 3);
    assert_eq!(
        coordinator.encoder_input_pool().counts(),
        PoolCounts { free: 1, in_flight: 0, ready: 2 }
    );

    let stats = coordinator.shutdown().unwrap();
    assert_eq!(stats.hardware_events, 1);
    assert_eq!(host.outstanding_locks(), 0);
    assert_eq!(host.allocation_count(), 0);
}

#[test]
fn test_rejected_submit_returns_encoder_input() {
    let host = Arc::new(HostMemory::new());
    let domain: Arc<dyn SharedMemory> = host.clone();
    let capture = ManualCapture::default();

    let mut coordinator = Coordinator::new(
        &domain,
        remap_stage(&domain, emulator(&host)),
        Box::new(capture.clone()),
        Box::new(RejectingEncoder),
        Box::new(std::io::sink()),
        settings(3),
        RunFlag::new(),
    )
    .unwrap();
    coordinator.start().unwrap();

    capture.push_frame();
    let err = coordinator.drain().unwrap_err();
    assert_eq!(err.stage(), Stage::Encode);
    assert_eq!(coordinator.stats().remapped, 0);
    assert_eq!(coordinator.capture_pool().counts().free, 3);
    assert_eq!(
        coordinator.encoder_input_pool().counts(),
        PoolCounts { free: 3, in_flight: 0, ready: 0 }
    );

    coordinator.shutdown().unwrap();
    assert_eq!(host.outstanding_locks(), 0);
    assert_eq!(host.allocation_count(), 0);
}

#[test]
fn test_stop_before_start_skips_run() {
    let map = write_map();
    let dir = tempfile::tempdir().unwrap();
    let config = RemapConfig {
        map_path: Some(map.path().to_path_buf()),
        output_path: Some(dir.path().join("out.yuv")),
        backend: BackendKind::Synthetic,
        emulate: true,
        ..Default::default()
    };

    // A signal that lands while the map is still loading
    let run = RunFlag::new();
    run.stop();
    let coordinator = build_pipeline(&config, run).unwrap();

    let stats = run_pipeline(coordinator).unwrap();
    assert_eq!(stats.captured, 0);
    assert_eq!(stats.remapped, 0);
    assert_eq!(stats.encoded_bytes, 0);
}
