// SPDX-License-Identifier: GPL-3.0-only

//! Capture and encode stage implementations
//!
//! - [`gstreamer`]: V4L2 camera and V4L2 H.264 encoder through GStreamer
//! - [`synthetic`]: generated frames and raw I420 output for dry runs

pub mod gstreamer;
pub mod synthetic;

use crate::config::{BackendKind, RemapConfig};
use crate::geometry::FrameGeometry;
use crate::pipeline::{CaptureStage, EncodeStage};
use tracing::info;

/// Build the capture and encode stages selected by `config`
pub fn create_stages(
    config: &RemapConfig,
    geometry: &FrameGeometry,
) -> (Box<dyn CaptureStage>, Box<dyn EncodeStage>) {
    info!(backend = %config.backend, "Creating pipeline stages");
    let capture: Box<dyn CaptureStage>;
    let encoder: Box<dyn EncodeStage>;
    match config.backend {
        BackendKind::Gstreamer => {
            capture = Box::new(gstreamer::GstCapture::new(config.capture.clone(), *geometry));
            encoder = Box::new(gstreamer::GstEncoder::new(
                config.encoder.clone(),
                *geometry,
                config.capture.framerate,
            ));
        }
        BackendKind::Synthetic => {
            capture = Box::new(synthetic::SyntheticCapture::new(
                synthetic::Yuyv::default(),
                config.capture.framerate,
            ));
            encoder = Box::new(synthetic::RawEncoder::new());
        }
    }
    (capture, encoder)
}
