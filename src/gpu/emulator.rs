// SPDX-License-Identifier: GPL-3.0-only

//! Host-side compute device
//!
//! Walks the completion mailbox the same way the firmware does and hands
//! each unit's uniform block to a [`HostKernel`]. Everything is resolved
//! through device addresses in [`HostMemory`], so a wrong address in a
//! uniform block shows up here as an error or as wrong output bytes.

use super::uniforms::UniformBlock;
use super::ComputeDevice;
use crate::constants::gpu::UNIFORMS_PER_UNIT;
use crate::constants::tiling::{MAX_SAMPLER_SIZE, TILE_HEIGHT, TILE_WIDTH};
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::memory::HostMemory;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Work one compute unit performs for a dispatch
pub trait HostKernel: Send + Sync {
    fn run_unit(&self, unit: usize, uniforms: &UniformBlock, memory: &HostMemory) -> PipelineResult<()>;
}

/// [`ComputeDevice`] that runs a [`HostKernel`] on the calling thread
pub struct HostCompute {
    memory: Arc<HostMemory>,
    kernel: Box<dyn HostKernel>,
    enabled: AtomicBool,
}

impl HostCompute {
    pub fn new(memory: Arc<HostMemory>, kernel: Box<dyn HostKernel>) -> Self {
        Self {
            memory,
            kernel,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl ComputeDevice for HostCompute {
    fn name(&self) -> &'static str {
        "host"
    }

    fn set_enabled(&self, enabled: bool) -> PipelineResult<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&self, units: usize, mailbox_address: u32, timeout: Duration) -> PipelineResult<()> {
        if !self.is_enabled() {
            return Err(PipelineError::setup(Stage::Remap, "compute mode is not enabled"));
        }

        let started = Instant::now();
        let table = self.memory.read_words(mailbox_address, units * 2)?;
        for (unit, entry) in table.chunks_exact(2).enumerate() {
            let uniform_address = entry[0];
            let words = self.memory.read_words(uniform_address, UNIFORMS_PER_UNIT)?;
            let mut block = UniformBlock([0; UNIFORMS_PER_UNIT]);
            block.0.copy_from_slice(&words);

            if block.0[0] != uniform_address {
                return Err(PipelineError::setup(
                    Stage::Remap,
                    format!(
                        "unit {} uniform block at {:#010x} points at {:#010x}",
                        unit, uniform_address, block.0[0]
                    ),
                ));
            }

            trace!(unit, uniform_address, code_address = entry[1], "Running unit");
            self.kernel.run_unit(unit, &block, &self.memory)?;
        }

        if started.elapsed() > timeout {
            return Err(PipelineError::DispatchTimeout { timeout });
        }
        Ok(())
    }
}

/// Copies the source frame into the output at the same coordinates.
///
/// The remap table is not consulted. Each unit handles output rows
/// `band * 12 + unit`; luma comes from the YUYV source directly and chroma is
/// written by even units, one I420 chroma row per unit pair.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityKernel;

/// Sampler size fields store 2048 as 0
fn decode_texture_size(field: u32) -> u32 {
    match field & 0x7FF {
        0 => MAX_SAMPLER_SIZE,
        n => n,
    }
}

impl HostKernel for IdentityKernel {
    fn run_unit(&self, unit: usize, uniforms: &UniformBlock, memory: &HostMemory) -> PipelineResult<()> {
        let u = &uniforms.0;
        let source_base = u[1] & 0xFFFF_F000;
        let source_width = decode_texture_size(u[2] >> 8) as usize;
        let source_height = decode_texture_size(u[2] >> 20) as usize;
        let output_base = u[7];
        let video_width = (u[10] * TILE_WIDTH) as usize;
        let y_tiles = u[11] as usize;
        let buffer_width = u[12] as usize;
        let buffer_height = u[13] as usize;

        let luma_size = buffer_width * buffer_height;
        let u_plane = output_base as usize + luma_size;
        let v_plane = u_plane + luma_size / 4;

        let mut source_row = vec![0u8; source_width * 2];
        let mut luma = vec![0u8; video_width];
        let mut chroma_u = vec![0u8; video_width / 2];
        let mut chroma_v = vec![0u8; video_width / 2];

        for band in 0..y_tiles {
            let y = band * TILE_HEIGHT as usize + unit;
            let sy = y.min(source_height - 1);
            memory.read(source_base + (sy * source_width * 2) as u32, &mut source_row)?;

            for (x, dst) in luma.iter_mut().enumerate() {
                *dst = source_row[x.min(source_width - 1) * 2];
            }
            memory.write(output_base + (y * buffer_width) as u32, &luma)?;

            if y % 2 == 0 {
                for cx in 0..video_width / 2 {
                    let pair = (cx * 2).min(source_width - 1) / 2 * 4;
                    chroma_u[cx] = source_row[pair + 1];
                    chroma_v[cx] = source_row[pair + 3];
                }
                let offset = y / 2 * buffer_width / 2;
                memory.write((u_plane + offset) as u32, &chroma_u)?;
                memory.write((v_plane + offset) as u32, &chroma_v)?;
            }
        }
        Ok(())
    }
}
