// SPDX-License-Identifier: GPL-3.0-only

//! Frame geometry shared by the capture, remap and encode stages

use crate::constants::tiling::{
    MAX_SAMPLER_SIZE, MAX_VIDEO_HEIGHT, MAX_VIDEO_WIDTH, TILE_HEIGHT, TILE_WIDTH,
    VIDEO_BUFFER_HEIGHT_ALIGN,
};
use crate::errors::{PipelineError, PipelineResult};

/// Source and output frame dimensions, including padded buffer sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Output (remapped) frame width
    pub video_width: u32,
    /// Output (remapped) frame height
    pub video_height: u32,
    /// Cropped camera frame width
    pub camera_width: u32,
    /// Cropped camera frame height
    pub camera_height: u32,
    /// Camera buffer width, rounded up to a power of two for the sampler
    pub camera_buffer_width: u32,
    pub camera_buffer_height: u32,
    pub video_buffer_width: u32,
    /// Output buffer height, padded for the encoder's macroblock rows
    pub video_buffer_height: u32,
}

impl FrameGeometry {
    /// Validate dimensions and derive the padded buffer sizes
    pub fn new(
        video_width: u32,
        video_height: u32,
        camera_width: u32,
        camera_height: u32,
    ) -> PipelineResult<Self> {
        validate_video_size(video_width, video_height)?;

        if camera_width == 0 || camera_height == 0 {
            return Err(PipelineError::InvalidGeometry(format!(
                "capture size {}x{} is empty",
                camera_width, camera_height
            )));
        }

        let camera_buffer_width = camera_width
            .checked_next_power_of_two()
            .filter(|w| *w <= MAX_SAMPLER_SIZE)
            .ok_or_else(|| {
                PipelineError::InvalidGeometry(format!(
                    "capture width {} exceeds the sampler limit of {}",
                    camera_width, MAX_SAMPLER_SIZE
                ))
            })?;

        if camera_height > MAX_SAMPLER_SIZE {
            return Err(PipelineError::InvalidGeometry(format!(
                "capture height {} exceeds the sampler limit of {}",
                camera_height, MAX_SAMPLER_SIZE
            )));
        }

        Ok(Self {
            video_width,
            video_height,
            camera_width,
            camera_height,
            camera_buffer_width,
            camera_buffer_height: camera_height,
            video_buffer_width: video_width,
            video_buffer_height: video_height.next_multiple_of(VIDEO_BUFFER_HEIGHT_ALIGN),
        })
    }

    /// Horizontal tile count of the output frame
    pub fn x_tiles(&self) -> u32 {
        self.video_width / TILE_WIDTH
    }

    /// Vertical tile count of the output frame
    pub fn y_tiles(&self) -> u32 {
        self.video_height / TILE_HEIGHT
    }

    /// Bytes in one YUYV camera buffer
    pub fn camera_frame_size(&self) -> usize {
        self.camera_buffer_width as usize * self.camera_buffer_height as usize * 2
    }

    /// Bytes in one I420 encoder input buffer
    pub fn video_frame_size(&self) -> usize {
        self.video_buffer_width as usize * self.video_buffer_height as usize * 3 / 2
    }

    /// Coordinate entries in the remap table (one per output pixel)
    pub fn map_entries(&self) -> usize {
        self.video_width as usize * self.video_height as usize
    }
}

/// Check output dimensions against the kernel's 128x12 tiling and encoder limits
pub fn validate_video_size(width: u32, height: u32) -> PipelineResult<()> {
    if width == 0 || width % TILE_WIDTH != 0 || width > MAX_VIDEO_WIDTH {
        return Err(PipelineError::InvalidGeometry(format!(
            "map width {} must be a non-zero multiple of {} and at most {}",
            width, TILE_WIDTH, MAX_VIDEO_WIDTH
        )));
    }

    if height == 0 || height % TILE_HEIGHT != 0 || height > MAX_VIDEO_HEIGHT {
        return Err(PipelineError::InvalidGeometry(format!(
            "map height {} must be a non-zero multiple of {} and at most {}",
            height, TILE_HEIGHT, MAX_VIDEO_HEIGHT
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_hd_accepted() {
        assert!(validate_video_size(1920, 1080).is_ok());
    }

    #[test]
    fn test_misaligned_sizes_rejected() {
        assert!(validate_video_size(1919, 1080).is_err());
        assert!(validate_video_size(1920, 1079).is_err());
        assert!(validate_video_size(0, 1080).is_err());
        assert!(validate_video_size(1920, 0).is_err());
        assert!(validate_video_size(2048, 1080).is_err());
        assert!(validate_video_size(1920, 1092).is_err());
    }

    #[test]
    fn test_buffer_padding() {
        let geometry = FrameGeometry::new(1280, 720, 1296, 972).unwrap();
        assert_eq!(geometry.camera_buffer_width, 2048);
        assert_eq!(geometry.camera_buffer_height, 972);
        assert_eq!(geometry.video_buffer_width, 1280);
        assert_eq!(geometry.video_buffer_height, 720);
        assert_eq!(geometry.x_tiles(), 10);
        assert_eq!(geometry.y_tiles(), 60);

        let geometry = FrameGeometry::new(1920, 1080, 960, 720).unwrap();
        assert_eq!(geometry.camera_buffer_width, 1024);
        assert_eq!(geometry.video_buffer_height, 1088);
        assert_eq!(geometry.video_frame_size(), 1920 * 1088 * 3 / 2);
    }

    #[test]
    fn test_capture_size_limits() {
        assert!(FrameGeometry::new(128, 12, 0, 480).is_err());
        assert!(FrameGeometry::new(128, 12, 2049, 480).is_err());
        assert!(FrameGeometry::new(128, 12, 2048, 2049).is_err());
        assert!(FrameGeometry::new(128, 12, 2048, 1440).is_ok());
    }
}
