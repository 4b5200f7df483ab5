// SPDX-License-Identifier: GPL-3.0-only

//! Real-time camera remapping on the VideoCore GPU
//!
//! Camera frames are remapped pixel by pixel through a coordinate table by a
//! precompiled GPU kernel and fed to a hardware H.264 encoder.
//!
//! # Architecture
//!
//! ```text
//! capture ──► [capture pool] ──► remap (GPU, synchronous) ──► [encoder input pool] ──► encoder
//!                   ▲                                                  ▲                   │
//!                   └──────────── coordinator (one thread) ────────────┴── [bitstream pool]◄┘
//! ```
//!
//! - [`memory`]: CPU/GPU shared buffers and their allocators
//! - [`gpu`]: uniform tables, the compute program and dispatch
//! - [`map`]: remap map file loading
//! - [`pipeline`]: buffer pools, completion queues and the coordinator
//! - [`backends`]: capture and encode stage implementations
//! - [`runner`]: assembly from a [`config::RemapConfig`]

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod geometry;
pub mod gpu;
pub mod map;
pub mod memory;
pub mod pipeline;
pub mod runner;

pub use config::{BackendKind, RemapConfig};
pub use errors::{PipelineError, PipelineResult, Stage};
pub use geometry::FrameGeometry;
pub use pipeline::{PipelineStats, RunFlag};
