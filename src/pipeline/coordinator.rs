// SPDX-License-Identifier: GPL-3.0-only

//! Stage coordinator
//!
//! A single thread sleeps on the completion semaphore, then drains every
//! queue in a fixed order until it is empty:
//!
//! 1. captured frames: remap into a free encoder input buffer and submit,
//!    or drop when none is free; the captured buffer is always released
//! 2. encoder input buffers the encoder is done with
//! 3. encoded bitstream buffers: written to the sink and released
//! 4. hardware events: logged
//!
//! A semaphore timeout means the hardware stopped producing completions and
//! ends the run with [`PipelineError::Stalled`].
//!
//! Shutdown asks the encoder to flush and keeps draining until it reports
//! the flush complete, so the tail of the bitstream reaches the sink.

use super::frame::FrameBuffer;
use super::pool::BufferPool;
use super::semaphore::{CompletionReceiver, CompletionSemaphore, completion_queue};
use super::stage::{CaptureContext, CaptureStage, EncodeContext, EncodeStage, HardwareEvent};
use crate::constants::timing::{FRAME_LOG_INTERVAL, STOP_TIMEOUT_SECS, WORKER_POLL_INTERVAL};
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::geometry::FrameGeometry;
use crate::gpu::Dispatcher;
use crate::map::RemapTable;
use crate::memory::SharedMemory;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Cancellation flag shared with signal handlers and stages.
///
/// It carries the coordinator's semaphore, so a stop wakes a coordinator
/// that is asleep waiting for completions.
#[derive(Debug, Clone)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
    waker: CompletionSemaphore,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            waker: CompletionSemaphore::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clear the flag and wake the coordinator
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.waker.post();
    }

    pub fn waker(&self) -> &CompletionSemaphore {
        &self.waker
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub captured: u64,
    pub remapped: u64,
    /// Captured frames released because no encoder input buffer was free
    pub dropped: u64,
    pub encoded_buffers: u64,
    pub encoded_bytes: u64,
    pub hardware_events: u64,
}

/// GPU remap of one captured frame into one encoder input frame
pub struct RemapStage {
    // Field order is teardown order: program before map
    dispatcher: Dispatcher,
    map: RemapTable,
    geometry: FrameGeometry,
}

impl RemapStage {
    pub fn new(dispatcher: Dispatcher, map: RemapTable, geometry: FrameGeometry) -> Self {
        Self {
            dispatcher,
            map,
            geometry,
        }
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Remap `input` into `output`. Returns `Ok(false)` without touching the
    /// GPU once the pipeline is stopping.
    pub fn remap(
        &self,
        run: &RunFlag,
        input: &FrameBuffer,
        output: &mut FrameBuffer,
    ) -> PipelineResult<bool> {
        if !run.is_running() {
            return Ok(false);
        }
        output.length = self.geometry.video_frame_size();
        output.copy_metadata(input);
        self.dispatcher
            .dispatch(input.storage(), output.storage(), self.map.buffer(), &self.geometry)?;
        Ok(true)
    }

    /// Release the compute program, then the map
    fn release(self) {
        let Self { dispatcher, map, .. } = self;
        drop(dispatcher);
        debug!("Released compute program");
        drop(map);
        debug!("Released remap table");
    }
}

/// Pool sizes and timing for [`Coordinator::new`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub capture_buffers: usize,
    pub encoder_input_buffers: usize,
    pub encoder_output_buffers: usize,
    pub encoder_output_buffer_size: usize,
    pub semaphore_timeout: Duration,
}

pub struct Coordinator {
    capture: Box<dyn CaptureStage>,
    encoder: Box<dyn EncodeStage>,
    remap: RemapStage,
    sink: Box<dyn Write + Send>,
    run: RunFlag,
    semaphore: CompletionSemaphore,
    timeout: Duration,
    capture_pool: Arc<BufferPool>,
    encoder_input_pool: Arc<BufferPool>,
    encoder_output_pool: Arc<BufferPool>,
    capture_ready: CompletionReceiver<FrameBuffer>,
    input_returns: CompletionReceiver<FrameBuffer>,
    output_ready: CompletionReceiver<FrameBuffer>,
    events: CompletionReceiver<HardwareEvent>,
    contexts: Option<(CaptureContext, EncodeContext)>,
    stats: PipelineStats,
}

impl Coordinator {
    /// Allocate the pools and wire up the completion queues
    pub fn new(
        domain: &Arc<dyn SharedMemory>,
        remap: RemapStage,
        capture: Box<dyn CaptureStage>,
        encoder: Box<dyn EncodeStage>,
        sink: Box<dyn Write + Send>,
        settings: CoordinatorSettings,
        run: RunFlag,
    ) -> PipelineResult<Self> {
        let geometry = remap.geometry;
        let capture_pool = Arc::new(BufferPool::new(
            "capture",
            domain,
            settings.capture_buffers,
            geometry.camera_frame_size(),
        )?);
        let encoder_input_pool = Arc::new(BufferPool::new(
            "encoder-input",
            domain,
            settings.encoder_input_buffers,
            geometry.video_frame_size(),
        )?);
        let encoder_output_pool = Arc::new(BufferPool::new(
            "encoder-output",
            domain,
            settings.encoder_output_buffers,
            settings.encoder_output_buffer_size,
        )?);

        let semaphore = run.waker().clone();
        let (ready_tx, capture_ready) = completion_queue(&semaphore);
        let (returns_tx, input_returns) = completion_queue(&semaphore);
        let (output_tx, output_ready) = completion_queue(&semaphore);
        let (events_tx, events) = completion_queue(&semaphore);

        let contexts = (
            CaptureContext {
                pool: Arc::clone(&capture_pool),
                ready: ready_tx,
                events: events_tx.clone(),
            },
            EncodeContext {
                input_returns: returns_tx,
                output_pool: Arc::clone(&encoder_output_pool),
                output_ready: output_tx,
                events: events_tx,
            },
        );

        Ok(Self {
            capture,
            encoder,
            remap,
            sink,
            run,
            semaphore,
            timeout: settings.semaphore_timeout,
            capture_pool,
            encoder_input_pool,
            encoder_output_pool,
            capture_ready,
            input_returns,
            output_ready,
            events,
            contexts: Some(contexts),
            stats: PipelineStats::default(),
        })
    }

    /// Semaphore every completion queue posts
    pub fn waker(&self) -> CompletionSemaphore {
        self.semaphore.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn capture_pool(&self) -> &Arc<BufferPool> {
        &self.capture_pool
    }

    pub fn encoder_input_pool(&self) -> &Arc<BufferPool> {
        &self.encoder_input_pool
    }

    pub fn encoder_output_pool(&self) -> &Arc<BufferPool> {
        &self.encoder_output_pool
    }

    /// Start the encoder, then the camera. Nothing starts once the run
    /// flag is cleared.
    pub fn start(&mut self) -> PipelineResult<()> {
        let (capture_ctx, encode_ctx) = self.contexts.take().ok_or_else(|| {
            PipelineError::setup(Stage::Coordinator, "pipeline already started")
        })?;
        if !self.run.is_running() {
            info!("Stopped during setup, not starting stages");
            return Ok(());
        }
        self.encoder.start(encode_ctx)?;
        self.capture.start(capture_ctx)?;
        info!(
            capture = self.capture.name(),
            encoder = self.encoder.name(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Service completions until the run flag clears or an error occurs
    pub fn run(&mut self) -> PipelineResult<()> {
        while self.run.is_running() {
            if !self.semaphore.wait_timeout(self.timeout) {
                if !self.run.is_running() {
                    break;
                }
                return Err(PipelineError::Stalled {
                    timeout: self.timeout,
                });
            }
            self.drain()?;
        }
        info!("Run flag cleared, leaving coordinator loop");
        Ok(())
    }

    /// Drain every queue until empty, in fixed order
    pub fn drain(&mut self) -> PipelineResult<()> {
        while let Some(frame) = self.capture_ready.try_pop() {
            self.stats.captured += 1;
            let remapped = self.forward(&frame);
            self.capture_pool.release(frame)?;
            remapped?;
        }

        while let Some(frame) = self.input_returns.try_pop() {
            self.encoder_input_pool.release(frame)?;
        }

        while let Some(frame) = self.output_ready.try_pop() {
            let written = frame.with_data(|data| {
                self.sink.write_all(data).map(|_| data.len())
            });
            self.encoder_output_pool.release(frame)?;
            match written? {
                Ok(len) => {
                    self.stats.encoded_buffers += 1;
                    self.stats.encoded_bytes += len as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    info!("Output closed, stopping");
                    self.run.stop();
                }
                Err(e) => return Err(PipelineError::io(Stage::Encode, e)),
            }
        }
        if let Err(e) = self.sink.flush()
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(PipelineError::io(Stage::Encode, e));
        }

        while let Some(event) = self.events.try_pop() {
            self.stats.hardware_events += 1;
            warn!(
                source = event.source,
                code = event.code,
                message = %event.message,
                "Hardware event"
            );
        }
        Ok(())
    }

    /// Remap a captured frame into a free encoder input buffer and submit it
    fn forward(&mut self, captured: &FrameBuffer) -> PipelineResult<()> {
        if !self.run.is_running() {
            return Ok(());
        }
        let Some(mut output) = self.encoder_input_pool.acquire() else {
            self.stats.dropped += 1;
            debug!(dropped = self.stats.dropped, "No free encoder input buffer, dropping frame");
            return Ok(());
        };

        match self.remap.remap(&self.run, captured, &mut output) {
            Ok(true) => {}
            Ok(false) => return self.encoder_input_pool.release(output),
            Err(e) => {
                self.encoder_input_pool.release(output)?;
                return Err(e);
            }
        }

        self.encoder_input_pool.mark_ready(&output)?;
        if let Err(rejected) = self.encoder.submit(output) {
            self.encoder_input_pool.release(rejected.frame)?;
            return Err(rejected.error);
        }
        self.stats.remapped += 1;
        if self.stats.remapped % FRAME_LOG_INTERVAL == 0 {
            debug!(
                remapped = self.stats.remapped,
                dropped = self.stats.dropped,
                encoded_bytes = self.stats.encoded_bytes,
                "Pipeline progress"
            );
        }
        Ok(())
    }

    /// Keep writing encoder output until the encoder has flushed
    fn flush_encoder(&mut self) -> PipelineResult<()> {
        let deadline = Instant::now() + Duration::from_secs(STOP_TIMEOUT_SECS);
        loop {
            self.drain()?;
            if self.encoder.is_finished() {
                debug!("Encoder flushed");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("Timed out waiting for encoder to flush");
                return Ok(());
            }
            self.semaphore.wait_timeout(WORKER_POLL_INTERVAL);
        }
    }

    /// Stop the stages and release everything in reverse acquisition order
    pub fn shutdown(mut self) -> PipelineResult<PipelineStats> {
        self.run.stop();
        let mut first_error = None;

        if let Err(e) = self.capture.stop() {
            error!(error = %e, "Failed to stop capture");
            first_error.get_or_insert(e);
        }
        match self.encoder.finish() {
            Ok(()) => {
                if let Err(e) = self.flush_encoder() {
                    warn!(error = %e, "Error while flushing encoder at shutdown");
                    first_error.get_or_insert(e);
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to flush encoder");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.encoder.stop() {
            error!(error = %e, "Failed to stop encoder");
            first_error.get_or_insert(e);
        }

        // Return whatever the stopped stages left queued
        if let Err(e) = self.drain() {
            warn!(error = %e, "Error while draining queues at shutdown");
            first_error.get_or_insert(e);
        }

        let Self {
            remap,
            stats,
            capture_pool,
            encoder_input_pool,
            encoder_output_pool,
            ..
        } = self;
        remap.release();

        for pool in [&capture_pool, &encoder_input_pool, &encoder_output_pool] {
            let counts = pool.counts();
            if counts.free != counts.total() {
                warn!(pool = pool.name(), ?counts, "Buffers still held at shutdown");
            }
        }

        info!(
            captured = stats.captured,
            remapped = stats.remapped,
            dropped = stats.dropped,
            encoded_bytes = stats.encoded_bytes,
            hardware_events = stats.hardware_events,
            "Pipeline stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flag_stop_wakes_coordinator() {
        let run = RunFlag::new();
        let handler_run = run.clone();
        assert!(run.is_running());
        assert_eq!(run.waker().pending(), 0);

        handler_run.stop();
        assert!(!run.is_running());
        assert!(run.waker().wait_timeout(Duration::from_millis(10)));
    }
}
