// SPDX-License-Identifier: GPL-3.0-only

//! Per-unit uniform blocks for the remap kernel
//!
//! Every word here is consumed by kernel instructions with a fixed bit
//! layout. A wrong bit does not crash anything, it produces a misaddressed
//! or corrupted frame, so the packing functions are tested against fixed
//! values rather than against each other.
//!
//! Block layout (16 words):
//!
//! | word | contents |
//! |------|----------|
//! | 0 | device address of this block |
//! | 1-2 | texture sampler config 0/1 for the source frame |
//! | 3-4 | unused sampler parameters (zero) |
//! | 5 | unit index |
//! | 6 | device address of the remap table |
//! | 7 | device address of the output frame |
//! | 8 | VPM write setup for the luma rows |
//! | 9 | VPM write setup for the chroma rows |
//! | 10-11 | horizontal and vertical tile counts |
//! | 12-13 | padded output buffer width and height |
//! | 14-15 | reserved (zero) |

use crate::constants::gpu::{MAX_UNITS, TEXTURE_TYPE_YUYV422R, UNIFORMS_PER_UNIT};
use crate::constants::tiling::{TILE_HEIGHT, TILE_WIDTH};
use crate::errors::{PipelineError, PipelineResult};
use crate::geometry::FrameGeometry;
use bytemuck::{Pod, Zeroable};

/// Sampler size fields are 11 bits wide; 0 encodes 2048
const TEXTURE_SIZE_MASK: u32 = 0x7FF;

/// VPM rows holding the chroma of even/odd units
const VPM_CHROMA_BASE_ROW: u32 = 24;
const VPM_CHROMA_ODD_ROW: u32 = 36;
const VPM_CHROMA_EVEN_STRIDE: u32 = 24;
const VPM_CHROMA_ODD_STRIDE: u32 = 1;

/// Index of a compute unit, checked against the program's unit count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitIndex(usize);

impl UnitIndex {
    pub fn new(index: usize, unit_count: usize) -> PipelineResult<Self> {
        if index >= unit_count || unit_count > MAX_UNITS {
            return Err(PipelineError::setup(
                crate::errors::Stage::Remap,
                format!("unit {} out of range for {} units", index, unit_count),
            ));
        }
        Ok(Self(index))
    }

    /// All units of a program with `unit_count` units
    pub fn all(unit_count: usize) -> impl Iterator<Item = UnitIndex> {
        (0..unit_count.min(MAX_UNITS)).map(UnitIndex)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

/// One unit's 16-word uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct UniformBlock(pub [u32; UNIFORMS_PER_UNIT]);

impl UniformBlock {
    pub const SIZE: usize = UNIFORMS_PER_UNIT * 4;
}

/// Per-frame inputs to [`build_uniforms`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformParams {
    /// Device address of uniform block 0; block `i` is at `+ i * 64`
    pub uniform_base: u32,
    pub input_address: u32,
    pub output_address: u32,
    pub map_address: u32,
    pub texture_type: u32,
    pub geometry: FrameGeometry,
}

impl UniformParams {
    pub fn new(
        uniform_base: u32,
        input_address: u32,
        output_address: u32,
        map_address: u32,
        geometry: FrameGeometry,
    ) -> Self {
        Self {
            uniform_base,
            input_address,
            output_address,
            map_address,
            texture_type: TEXTURE_TYPE_YUYV422R,
            geometry,
        }
    }
}

/// Build the uniform block for `unit`
pub fn build_uniforms(params: &UniformParams, unit: UnitIndex) -> UniformBlock {
    let i = unit.get() as u32;
    let g = &params.geometry;
    let mut words = [0u32; UNIFORMS_PER_UNIT];

    words[0] = params.uniform_base + i * UniformBlock::SIZE as u32;
    words[1] = texture_config_0(params.input_address, false, params.texture_type);
    // Nearest filtering, clamp on both axes
    words[2] = texture_config_1(
        g.camera_buffer_height,
        g.camera_buffer_width,
        0,
        0,
        1,
        1,
        params.texture_type,
    );
    words[5] = i;
    words[6] = params.map_address;
    words[7] = params.output_address;
    words[8] = vpm_write_luma(i);
    words[9] = vpm_write_chroma(i);
    words[10] = g.video_width / TILE_WIDTH;
    words[11] = g.video_height / TILE_HEIGHT;
    words[12] = g.video_buffer_width;
    words[13] = g.video_buffer_height;

    UniformBlock(words)
}

/// First sampler word: base address (upper 20 bits), flip, low type bits.
/// Cube map, swizzle and mip level fields are always zero.
pub fn texture_config_0(base: u32, flip_y: bool, texture_type: u32) -> u32 {
    (((base >> 12) & 0xF_FFFF) << 12) | ((flip_y as u32) << 8) | ((texture_type & 0xF) << 4)
}

/// Second sampler word: type bit 4, size, filters and wrap modes
pub fn texture_config_1(
    height: u32,
    width: u32,
    mag_filter: u32,
    min_filter: u32,
    wrap_t: u32,
    wrap_s: u32,
    texture_type: u32,
) -> u32 {
    (((texture_type & 0x10) >> 4) << 31)
        | ((height & TEXTURE_SIZE_MASK) << 20)
        | ((width & TEXTURE_SIZE_MASK) << 8)
        | ((mag_filter & 0x1) << 7)
        | ((min_filter & 0x7) << 4)
        | ((wrap_t & 0x3) << 2)
        | (wrap_s & 0x3)
}

/// Horizontal, packed, stride-1 VPM write of 32-bit rows starting at `row`
fn vpm_write_setup(stride: u32, row: u32) -> u32 {
    (stride << 12) | (1 << 11) | ((row & 0x3F) << 2)
}

/// VPM write setup for the luma rows of `unit`
pub fn vpm_write_luma(unit: u32) -> u32 {
    vpm_write_setup(1, unit)
}

/// VPM write setup for the chroma rows of `unit`.
///
/// Chroma is subsampled 2:1 vertically, so unit pairs share rows: even units
/// write their own row with a stride spanning both planes, odd units write a
/// single terminal row.
pub fn vpm_write_chroma(unit: u32) -> u32 {
    if unit % 2 == 0 {
        vpm_write_setup(VPM_CHROMA_EVEN_STRIDE, VPM_CHROMA_BASE_ROW + unit / 2)
    } else {
        vpm_write_setup(VPM_CHROMA_ODD_STRIDE, VPM_CHROMA_ODD_ROW)
    }
}
