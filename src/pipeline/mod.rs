// SPDX-License-Identifier: GPL-3.0-only

//! Capture → remap → encode buffer exchange

pub mod coordinator;
pub mod frame;
pub mod frame_loop;
pub mod pool;
pub mod semaphore;
pub mod stage;

pub use coordinator::{Coordinator, CoordinatorSettings, PipelineStats, RemapStage, RunFlag};
pub use frame::{FrameBuffer, FrameFlags, PoolId};
pub use frame_loop::{LoopAction, StageLoop};
pub use pool::{BufferPool, PoolCounts, SlotState};
pub use semaphore::{CompletionQueue, CompletionReceiver, CompletionSemaphore, completion_queue};
pub use stage::{
    CaptureContext, CaptureStage, EncodeContext, EncodeStage, HardwareEvent, SubmitError,
};
