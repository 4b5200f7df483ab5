// SPDX-License-Identifier: GPL-3.0-only

//! Runtime configuration
//!
//! Values come from an optional JSON file and are then overridden by
//! command-line flags in the binary.

use crate::constants::{encoder, gpu, pool, timing};
use crate::errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which collaborators drive the capture and encode stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Camera and hardware encoder through GStreamer
    #[default]
    Gstreamer,
    /// Generated frames and raw I420 output, for dry runs without a camera
    Synthetic,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Gstreamer => write!(f, "gstreamer"),
            BackendKind::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// Camera settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub camera_id: u32,
    pub sensor_mode: u32,
    pub framerate: u32,
    /// Side-by-side stereoscopic capture
    pub stereo: bool,
    pub hflip: bool,
    pub vflip: bool,
    pub pool_size: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            camera_id: 0,
            sensor_mode: 0,
            framerate: encoder::DEFAULT_FRAMERATE,
            stereo: false,
            hflip: false,
            vflip: false,
            pool_size: pool::CAPTURE_BUFFERS,
        }
    }
}

/// Encoder knobs. The core treats these as opaque and only forwards them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Bits per second
    pub bitrate: u32,
    /// Frames between keyframes
    pub keyframe_interval: u32,
    /// Repeat SPS/PPS before every keyframe
    pub inline_header: bool,
    /// Emit VUI timing information in the SPS
    pub sps_timing: bool,
    pub input_pool_size: usize,
    pub output_pool_size: usize,
    pub output_buffer_size: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bitrate: encoder::DEFAULT_BITRATE,
            keyframe_interval: encoder::DEFAULT_KEYFRAME,
            inline_header: false,
            sps_timing: false,
            input_pool_size: pool::ENCODER_INPUT_BUFFERS,
            output_pool_size: pool::ENCODER_OUTPUT_BUFFERS,
            output_buffer_size: pool::ENCODER_OUTPUT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemapConfig {
    /// Remap map file (header plus coordinate table)
    pub map_path: Option<PathBuf>,
    /// Precompiled compute kernel image
    pub kernel_path: Option<PathBuf>,
    /// Bitstream destination; stdout when unset
    pub output_path: Option<PathBuf>,
    pub backend: BackendKind,
    /// Run the compute stage on the host emulator instead of the GPU
    pub emulate: bool,
    pub unit_count: usize,
    pub semaphore_timeout_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub capture: CaptureSettings,
    pub encoder: EncoderSettings,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            map_path: None,
            kernel_path: None,
            output_path: None,
            backend: BackendKind::default(),
            emulate: false,
            unit_count: gpu::MAX_UNITS,
            semaphore_timeout_ms: timing::SEMAPHORE_TIMEOUT.as_millis() as u64,
            dispatch_timeout_ms: gpu::DISPATCH_TIMEOUT.as_millis() as u64,
            capture: CaptureSettings::default(),
            encoder: EncoderSettings::default(),
        }
    }
}

impl RemapConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> PipelineResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn semaphore_timeout(&self) -> Duration {
        Duration::from_millis(self.semaphore_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Reject settings no backend can run with
    pub fn validate(&self) -> PipelineResult<()> {
        if self.map_path.is_none() {
            return Err(PipelineError::Config("map filename is not specified".into()));
        }
        if !self.emulate && self.kernel_path.is_none() {
            return Err(PipelineError::Config(
                "kernel filename is not specified".into(),
            ));
        }
        if self.unit_count == 0 || self.unit_count > gpu::MAX_UNITS {
            return Err(PipelineError::Config(format!(
                "unit count {} must be between 1 and {}",
                self.unit_count,
                gpu::MAX_UNITS
            )));
        }
        if self.capture.framerate == 0 {
            return Err(PipelineError::Config("framerate must be positive".into()));
        }
        if self.capture.pool_size == 0
            || self.encoder.input_pool_size == 0
            || self.encoder.output_pool_size == 0
        {
            return Err(PipelineError::Config("buffer pools must not be empty".into()));
        }
        if self.encoder.output_buffer_size == 0 {
            return Err(PipelineError::Config(
                "encoder output buffer size must be positive".into(),
            ));
        }
        if self.semaphore_timeout_ms == 0 || self.dispatch_timeout_ms == 0 {
            return Err(PipelineError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}
