// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

/// Output tiling imposed by the remap kernel
pub mod tiling {
    /// Tile width in pixels (16 SIMD lanes x 8 pixels)
    pub const TILE_WIDTH: u32 = 128;
    /// Tile height in pixels, one row per compute unit
    pub const TILE_HEIGHT: u32 = 12;
    /// Largest output width the encoder accepts
    pub const MAX_VIDEO_WIDTH: u32 = 1920;
    /// Largest output height the encoder accepts
    pub const MAX_VIDEO_HEIGHT: u32 = 1080;
    /// Encoder input buffers are padded to a multiple of this height
    pub const VIDEO_BUFFER_HEIGHT_ALIGN: u32 = 16;
    /// Largest source buffer width the texture sampler can address
    pub const MAX_SAMPLER_SIZE: u32 = 2048;
}

/// GPU compute program layout and dispatch
pub mod gpu {
    use std::time::Duration;

    /// Hardware compute unit count
    pub const MAX_UNITS: usize = 12;
    /// Words in each unit's uniform block
    pub const UNIFORMS_PER_UNIT: usize = 16;
    /// Capacity of the kernel code area in 32-bit words
    pub const MAX_CODE_WORDS: usize = 8192 * 16;
    /// Raster YUYV 4:2:2 texture type
    pub const TEXTURE_TYPE_YUYV422R: u32 = 17;
    /// Deadline for one synchronous dispatch
    pub const DISPATCH_TIMEOUT: Duration = Duration::from_millis(2000);
    /// Alignment of shared allocations (sampler base addresses drop the low 12 bits)
    pub const PAGE_SIZE: usize = 4096;
}

/// Timing constants
pub mod timing {
    use std::time::Duration;

    /// Coordinator wait on the completion semaphore before declaring a stall
    pub const SEMAPHORE_TIMEOUT: Duration = Duration::from_millis(2000);
    /// Log frame statistics every N frames
    pub const FRAME_LOG_INTERVAL: u64 = 300;
    /// Pipeline start timeout in seconds
    pub const START_TIMEOUT_SECS: u64 = 5;
    /// Pipeline stop timeout in seconds
    pub const STOP_TIMEOUT_SECS: u64 = 5;
    /// How long an encoder waits for a free output buffer
    pub const OUTPUT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);
    /// Poll interval for stage worker threads waiting on input
    pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);
}

/// Encoder defaults
pub mod encoder {
    /// Default H.264 bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 10_000_000;
    /// Default capture framerate
    pub const DEFAULT_FRAMERATE: u32 = 30;
    /// Default keyframe interval in frames
    pub const DEFAULT_KEYFRAME: u32 = 60;
}

/// Buffer pool sizing
pub mod pool {
    pub const CAPTURE_BUFFERS: usize = 3;
    pub const ENCODER_INPUT_BUFFERS: usize = 3;
    pub const ENCODER_OUTPUT_BUFFERS: usize = 4;
    /// Size of each encoded-bitstream buffer
    pub const ENCODER_OUTPUT_BUFFER_SIZE: usize = 512 * 1024;
}

/// Map file layout
pub mod map {
    /// Four little-endian i32 values
    pub const HEADER_LEN: usize = 16;
    /// Bytes per coordinate entry
    pub const ENTRY_SIZE: usize = 4;
}
