// SPDX-License-Identifier: GPL-3.0-only

//! Interfaces of the capture and encode collaborators

use super::frame::FrameBuffer;
use super::pool::BufferPool;
use super::semaphore::CompletionQueue;
use crate::errors::{PipelineError, PipelineResult};
use std::sync::Arc;

/// Non-fatal hardware notification (e.g. a control-port event)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareEvent {
    pub source: &'static str,
    pub code: u32,
    pub message: String,
}

impl HardwareEvent {
    pub fn new(source: &'static str, code: u32, message: impl Into<String>) -> Self {
        Self {
            source,
            code,
            message: message.into(),
        }
    }
}

/// What a capture stage is given when it starts
pub struct CaptureContext {
    /// Raw frame buffers; released buffers come back here for refilling
    pub pool: Arc<BufferPool>,
    /// Filled frames, marked ready
    pub ready: CompletionQueue<FrameBuffer>,
    pub events: CompletionQueue<HardwareEvent>,
}

/// Produces raw YUYV frames asynchronously
pub trait CaptureStage: Send {
    fn name(&self) -> &'static str;

    /// Begin delivering frames into `ctx.ready`
    fn start(&mut self, ctx: CaptureContext) -> PipelineResult<()>;

    /// Stop delivering frames. Must not return while a callback can still push.
    fn stop(&mut self) -> PipelineResult<()>;
}

/// What an encode stage is given when it starts
pub struct EncodeContext {
    /// Submitted input buffers go back through here once consumed
    pub input_returns: CompletionQueue<FrameBuffer>,
    /// Bitstream buffers
    pub output_pool: Arc<BufferPool>,
    /// Filled bitstream buffers, marked ready
    pub output_ready: CompletionQueue<FrameBuffer>,
    pub events: CompletionQueue<HardwareEvent>,
}

/// A submission the encoder refused. The frame comes back with the error.
#[derive(Debug)]
pub struct SubmitError {
    pub frame: FrameBuffer,
    pub error: PipelineError,
}

impl SubmitError {
    pub fn new(frame: FrameBuffer, error: PipelineError) -> Self {
        Self { frame, error }
    }
}

/// Consumes I420 frames and emits an encoded bitstream asynchronously
pub trait EncodeStage: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self, ctx: EncodeContext) -> PipelineResult<()>;

    /// Hand over a remapped frame; ownership returns via `input_returns`
    fn submit(&mut self, frame: FrameBuffer) -> Result<(), SubmitError>;

    /// Stop accepting input and start flushing what was submitted.
    ///
    /// Must not block: the flush needs the coordinator to keep returning
    /// bitstream buffers.
    fn finish(&mut self) -> PipelineResult<()>;

    /// Whether every submitted frame has been emitted and returned
    fn is_finished(&self) -> bool;

    /// Release the encoder. Must not return while a callback can still push.
    fn stop(&mut self) -> PipelineResult<()>;
}
