// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the remap pipeline
//!
//! Every failure the pipeline can report is fatal: it unwinds to the single
//! shutdown path in [`crate::pipeline::Coordinator::shutdown`]. Transient
//! hardware notifications are not errors and travel as
//! [`crate::pipeline::HardwareEvent`] instead.

use std::fmt;
use std::time::Duration;

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline area an error originated from, printed as a stable prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Capture,
    Remap,
    Encode,
    Memory,
    Map,
    Config,
    Coordinator,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Capture => "capture",
            Stage::Remap => "remap",
            Stage::Encode => "encode",
            Stage::Memory => "memory",
            Stage::Map => "map",
            Stage::Config => "config",
            Stage::Coordinator => "coordinator",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main pipeline error type
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Hardware component creation or configuration failed
    Setup { stage: Stage, message: String },
    /// Shared-memory allocator exhausted
    Allocation { size: usize, message: String },
    /// Input stream ended before the expected number of bytes
    ShortRead { expected: usize, actual: usize },
    /// GPU compute did not complete within its deadline
    DispatchTimeout { timeout: Duration },
    /// No stage produced a completion within the coordinator's wait timeout
    Stalled { timeout: Duration },
    /// Frame dimensions unsupported by the kernel tiling
    InvalidGeometry(String),
    /// A buffer was returned to a pool that does not own it
    Pool(String),
    /// Configuration file or argument errors
    Config(String),
    /// I/O failure attributed to a stage
    Io { stage: Stage, message: String },
}

impl PipelineError {
    /// Setup error for the given stage
    pub fn setup(stage: Stage, message: impl Into<String>) -> Self {
        PipelineError::Setup {
            stage,
            message: message.into(),
        }
    }

    /// I/O error for the given stage
    pub fn io(stage: Stage, err: std::io::Error) -> Self {
        PipelineError::Io {
            stage,
            message: err.to_string(),
        }
    }

    /// The stage this error is reported against
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Setup { stage, .. } => *stage,
            PipelineError::Allocation { .. } => Stage::Memory,
            PipelineError::ShortRead { .. } => Stage::Map,
            PipelineError::DispatchTimeout { .. } => Stage::Remap,
            PipelineError::Stalled { .. } => Stage::Coordinator,
            PipelineError::InvalidGeometry(_) => Stage::Map,
            PipelineError::Pool(_) => Stage::Coordinator,
            PipelineError::Config(_) => Stage::Config,
            PipelineError::Io { stage, .. } => *stage,
        }
    }

    /// Whether the error must stop the pipeline.
    ///
    /// There is no partial-pipeline recovery: GPU compute state is not
    /// resumable mid-dispatch, so everything here ends in a full shutdown.
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Process exit code reported for this error
    pub fn exit_code(&self) -> u8 {
        1
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Setup { message, .. } => write!(f, "Setup failed: {}", message),
            PipelineError::Allocation { size, message } => {
                write!(f, "Failed to allocate {} bytes of shared memory: {}", size, message)
            }
            PipelineError::ShortRead { expected, actual } => {
                write!(f, "Short read: expected {} bytes, got {}", expected, actual)
            }
            PipelineError::DispatchTimeout { timeout } => {
                write!(f, "GPU dispatch did not complete within {} ms", timeout.as_millis())
            }
            PipelineError::Stalled { timeout } => write!(
                f,
                "No stage completion within {} ms, hardware stopped producing frames",
                timeout.as_millis()
            ),
            PipelineError::InvalidGeometry(msg) => write!(f, "Invalid geometry: {}", msg),
            PipelineError::Pool(msg) => write!(f, "Buffer pool error: {}", msg),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::Io { message, .. } => write!(f, "I/O error: {}", message),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_prefixes_are_stable() {
        assert_eq!(Stage::Capture.to_string(), "capture");
        assert_eq!(Stage::Remap.to_string(), "remap");
        assert_eq!(Stage::Encode.to_string(), "encode");
    }

    #[test]
    fn test_error_stage_attribution() {
        let timeout = PipelineError::DispatchTimeout {
            timeout: Duration::from_millis(2000),
        };
        assert_eq!(timeout.stage(), Stage::Remap);
        assert!(timeout.to_string().contains("2000 ms"));

        let short = PipelineError::ShortRead {
            expected: 64,
            actual: 10,
        };
        assert_eq!(short.stage(), Stage::Map);

        let alloc = PipelineError::Allocation {
            size: 4096,
            message: "exhausted".into(),
        };
        assert_eq!(alloc.stage(), Stage::Memory);
        assert!(alloc.is_fatal());
        assert_eq!(alloc.exit_code(), 1);
    }
}
