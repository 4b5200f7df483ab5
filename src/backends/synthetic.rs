// SPDX-License-Identifier: GPL-3.0-only

//! Camera-free stage backends
//!
//! [`SyntheticCapture`] produces solid-colour YUYV frames on a worker thread.
//! [`RawEncoder`] "encodes" by copying each I420 input frame into bitstream
//! buffers unchanged, padding rows included.

use crate::constants::timing::{FRAME_LOG_INTERVAL, OUTPUT_ACQUIRE_TIMEOUT, WORKER_POLL_INTERVAL};
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::pipeline::{
    CaptureContext, CaptureStage, EncodeContext, EncodeStage, FrameBuffer, FrameFlags,
    HardwareEvent, LoopAction, StageLoop, SubmitError,
};
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One YUYV pixel pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Yuyv {
    pub y: u8,
    pub u: u8,
    pub v: u8,
}

impl Yuyv {
    pub const fn new(y: u8, u: u8, v: u8) -> Self {
        Self { y, u, v }
    }
}

impl Default for Yuyv {
    /// Mid grey
    fn default() -> Self {
        Self::new(0x80, 0x80, 0x80)
    }
}

/// Fill `buf` with a solid YUYV colour
pub fn fill_yuyv(buf: &mut [u8], colour: Yuyv) {
    for pair in buf.chunks_exact_mut(4) {
        pair.copy_from_slice(&[colour.y, colour.u, colour.y, colour.v]);
    }
}

pub struct SyntheticCapture {
    colour: Yuyv,
    interval: Duration,
    frame_limit: Option<u64>,
    worker: Option<StageLoop>,
}

impl SyntheticCapture {
    pub fn new(colour: Yuyv, framerate: u32) -> Self {
        Self {
            colour,
            interval: Duration::from_secs(1) / framerate.max(1),
            frame_limit: None,
            worker: None,
        }
    }

    /// Stop producing after `limit` frames
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl CaptureStage for SyntheticCapture {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn start(&mut self, ctx: CaptureContext) -> PipelineResult<()> {
        let CaptureContext { pool, ready, .. } = ctx;
        let colour = self.colour;
        let interval = self.interval;
        let limit = self.frame_limit;
        let started = Instant::now();
        let mut produced = 0u64;

        let worker = StageLoop::start("synthetic-capture", Stage::Capture, move || {
            if let Some(limit) = limit
                && produced >= limit
            {
                return LoopAction::Stop;
            }
            let Some(mut frame) = pool.acquire_timeout(WORKER_POLL_INTERVAL) else {
                return LoopAction::Continue;
            };

            let filled = frame.fill(|buf| {
                fill_yuyv(buf, colour);
                buf.len()
            });
            if let Err(e) = filled {
                warn!(error = %e, "Failed to fill synthetic frame");
                let _ = pool.release(frame);
                return LoopAction::Continue;
            }
            frame.timestamp = Some(started.elapsed().as_micros() as u64);
            frame.flags = FrameFlags::FRAME_END;

            if let Err(e) = pool.mark_ready(&frame) {
                warn!(error = %e, "Failed to mark synthetic frame ready");
                let _ = pool.release(frame);
                return LoopAction::Stop;
            }
            if let Err(frame) = ready.push(frame) {
                let _ = pool.release(frame);
                return LoopAction::Stop;
            }
            produced += 1;

            if !interval.is_zero() {
                std::thread::sleep(interval);
            }
            LoopAction::Continue
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> PipelineResult<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        Ok(())
    }
}

/// Copy `frame`'s bytes into bitstream buffers; returns bytes emitted
fn emit_raw(frame: &FrameBuffer, ctx: &EncodeContext) -> PipelineResult<usize> {
    frame.with_data(|data| {
        let mut emitted = 0;
        let chunk_size = ctx.output_pool.buffer_size();
        for chunk in data.chunks(chunk_size) {
            let Some(mut output) = ctx.output_pool.acquire_timeout(OUTPUT_ACQUIRE_TIMEOUT) else {
                let _ = ctx.events.push(HardwareEvent::new(
                    "raw-encoder",
                    1,
                    format!("no output buffer, {} bytes lost", data.len() - emitted),
                ));
                break;
            };
            output.copy_metadata(frame);
            if output
                .fill(|buf| {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    chunk.len()
                })
                .is_err()
                || ctx.output_pool.mark_ready(&output).is_err()
            {
                let _ = ctx.output_pool.release(output);
                break;
            }
            if let Err(output) = ctx.output_ready.push(output) {
                let _ = ctx.output_pool.release(output);
                break;
            }
            emitted += chunk.len();
        }
        emitted
    })
}

/// Passthrough encoder emitting raw I420
#[derive(Default)]
pub struct RawEncoder {
    input: Option<Sender<FrameBuffer>>,
    worker: Option<StageLoop>,
}

impl RawEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EncodeStage for RawEncoder {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn start(&mut self, ctx: EncodeContext) -> PipelineResult<()> {
        let (tx, rx) = crossbeam_channel::unbounded::<FrameBuffer>();
        let mut frames = 0u64;

        // Runs until the input channel closes so queued frames are returned
        let worker = StageLoop::start("raw-encoder", Stage::Encode, move || {
            let frame = match rx.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => return LoopAction::Continue,
                Err(RecvTimeoutError::Disconnected) => return LoopAction::Stop,
            };
            match emit_raw(&frame, &ctx) {
                Ok(bytes) => {
                    frames += 1;
                    if frames % FRAME_LOG_INTERVAL == 0 {
                        debug!(frame = frames, bytes, "Raw frames emitted");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to read encoder input"),
            }
            let _ = ctx.input_returns.push(frame);
            LoopAction::Continue
        })?;
        self.worker = Some(worker);
        self.input = Some(tx);
        Ok(())
    }

    fn submit(&mut self, frame: FrameBuffer) -> Result<(), SubmitError> {
        let Some(input) = self.input.as_ref() else {
            return Err(SubmitError::new(
                frame,
                PipelineError::setup(Stage::Encode, "encoder is not accepting input"),
            ));
        };
        input.send(frame).map_err(|e| {
            SubmitError::new(
                e.into_inner(),
                PipelineError::setup(Stage::Encode, "encoder worker has exited"),
            )
        })
    }

    fn finish(&mut self) -> PipelineResult<()> {
        // The worker drains what is queued, then sees the channel close
        self.input = None;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.input.is_none()
            && self
                .worker
                .as_ref()
                .map(|worker| !worker.is_running())
                .unwrap_or(true)
    }

    fn stop(&mut self) -> PipelineResult<()> {
        self.input = None;
        if let Some(mut worker) = self.worker.take() {
            worker.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_yuyv() {
        let mut buf = [0u8; 8];
        fill_yuyv(&mut buf, Yuyv::new(0x10, 0x20, 0x30));
        assert_eq!(buf, [0x10, 0x20, 0x10, 0x30, 0x10, 0x20, 0x10, 0x30]);
    }

    #[test]
    fn test_submit_before_start_returns_frame() {
        use crate::memory::{HostMemory, SharedMemory};
        use crate::pipeline::BufferPool;
        use std::sync::Arc;

        let domain: Arc<dyn SharedMemory> = Arc::new(HostMemory::new());
        let pool = BufferPool::new("encoder-input", &domain, 1, 64).unwrap();
        let frame = pool.acquire().unwrap();
        pool.mark_ready(&frame).unwrap();

        let mut encoder = RawEncoder::new();
        let rejected = encoder.submit(frame).unwrap_err();
        assert_eq!(rejected.error.stage(), Stage::Encode);
        pool.release(rejected.frame).unwrap();
        assert_eq!(pool.counts().free, 1);
        assert!(encoder.is_finished());
    }

    #[test]
    fn test_frame_interval() {
        let capture = SyntheticCapture::new(Yuyv::default(), 25);
        assert_eq!(capture.interval, Duration::from_millis(40));
    }
}
