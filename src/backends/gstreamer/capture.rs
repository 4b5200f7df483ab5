// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 camera capture into the raw frame pool

use super::BusWatch;
use crate::config::CaptureSettings;
use crate::constants::timing::{FRAME_LOG_INTERVAL, STOP_TIMEOUT_SECS};
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::geometry::FrameGeometry;
use crate::pipeline::{BufferPool, CaptureContext, CaptureStage, CompletionQueue, FrameBuffer, FrameFlags};
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// `videoflip` method for the flip settings
fn flip_method(settings: &CaptureSettings) -> &'static str {
    match (settings.hflip, settings.vflip) {
        (false, false) => "none",
        (true, false) => "horizontal-flip",
        (false, true) => "vertical-flip",
        (true, true) => "rotate-180",
    }
}

/// Launch description for the camera pipeline
pub fn capture_pipeline_description(settings: &CaptureSettings, geometry: &FrameGeometry) -> String {
    format!(
        "v4l2src device=/dev/video{} ! \
         video/x-raw,format=YUY2,width={},height={},framerate={}/1 ! \
         videoflip method={} ! \
         appsink name=sink max-buffers={} drop=true sync=false enable-last-sample=false",
        settings.camera_id,
        geometry.camera_width,
        geometry.camera_height,
        settings.framerate,
        flip_method(settings),
        settings.pool_size,
    )
}

/// Copy a YUYV frame with `src_stride` into a buffer `dst_stride` bytes wide
fn copy_rows(src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize, row_bytes: usize) -> usize {
    let row_bytes = row_bytes.min(src_stride).min(dst_stride);
    let mut rows = 0;
    for (src_row, dst_row) in src.chunks(src_stride).zip(dst.chunks_mut(dst_stride)) {
        if src_row.len() < row_bytes || dst_row.len() < row_bytes {
            break;
        }
        dst_row[..row_bytes].copy_from_slice(&src_row[..row_bytes]);
        rows += 1;
    }
    rows * dst_stride
}

struct SampleTarget {
    pool: Arc<BufferPool>,
    ready: CompletionQueue<FrameBuffer>,
    buffer_stride: usize,
    row_bytes: usize,
    frames: AtomicU64,
    skipped: AtomicU64,
}

impl SampleTarget {
    fn deliver(&self, appsink: &AppSink) -> Result<gstreamer::FlowSuccess, gstreamer::FlowError> {
        let sample = appsink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
        let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;
        let info = sample
            .caps()
            .and_then(|caps| VideoInfo::from_caps(caps).ok())
            .ok_or(gstreamer::FlowError::NotNegotiated)?;
        let src_stride = info.stride()[0] as usize;

        // Camera waits for a free buffer only as long as its own queue allows
        let Some(mut frame) = self.pool.acquire() else {
            let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(skipped, "No free capture buffer, skipping sample");
            return Ok(gstreamer::FlowSuccess::Ok);
        };

        let map = buffer.map_readable().map_err(|_| gstreamer::FlowError::Error)?;
        let filled = frame.fill(|dst| {
            copy_rows(map.as_slice(), src_stride, dst, self.buffer_stride, self.row_bytes)
        });
        drop(map);
        if let Err(e) = filled {
            warn!(error = %e, "Failed to copy camera frame");
            let _ = self.pool.release(frame);
            return Err(gstreamer::FlowError::Error);
        }

        frame.timestamp = buffer.pts().map(|t| t.useconds());
        frame.flags = FrameFlags::FRAME_END;
        if self.pool.mark_ready(&frame).is_err() {
            let _ = self.pool.release(frame);
            return Err(gstreamer::FlowError::Error);
        }
        if let Err(frame) = self.ready.push(frame) {
            let _ = self.pool.release(frame);
            return Err(gstreamer::FlowError::Flushing);
        }

        let count = self.frames.fetch_add(1, Ordering::Relaxed);
        if count % FRAME_LOG_INTERVAL == 0 {
            debug!(frame = count, src_stride, "Camera frames captured");
        }
        Ok(gstreamer::FlowSuccess::Ok)
    }
}

pub struct GstCapture {
    settings: CaptureSettings,
    geometry: FrameGeometry,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<AppSink>,
    bus: Option<BusWatch>,
}

impl GstCapture {
    pub fn new(settings: CaptureSettings, geometry: FrameGeometry) -> Self {
        Self {
            settings,
            geometry,
            pipeline: None,
            appsink: None,
            bus: None,
        }
    }
}

impl CaptureStage for GstCapture {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn start(&mut self, ctx: CaptureContext) -> PipelineResult<()> {
        super::init(Stage::Capture)?;

        if self.settings.stereo {
            warn!("Side-by-side stereo capture is not available through v4l2src, capturing mono");
        }
        if self.settings.sensor_mode != 0 {
            info!(
                sensor_mode = self.settings.sensor_mode,
                "Sensor mode is chosen by the driver from the requested size"
            );
        }

        let description = capture_pipeline_description(&self.settings, &self.geometry);
        let pipeline = super::launch(&description, Stage::Capture)?;
        let appsink: AppSink = super::element(&pipeline, "sink", Stage::Capture)?;

        let bus = BusWatch::start(&pipeline, "camera", ctx.events.clone(), Stage::Capture)?;

        let target = Arc::new(SampleTarget {
            pool: Arc::clone(&ctx.pool),
            ready: ctx.ready,
            buffer_stride: self.geometry.camera_buffer_width as usize * 2,
            row_bytes: self.geometry.camera_width as usize * 2,
            frames: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        });
        appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| target.deliver(appsink))
                .build(),
        );

        if let Err(e) = super::set_playing(&pipeline, Stage::Capture) {
            appsink.set_callbacks(gstreamer_app::AppSinkCallbacks::builder().build());
            super::set_null(&pipeline);
            bus.stop();
            return Err(e);
        }

        info!(
            camera = self.settings.camera_id,
            width = self.geometry.camera_width,
            height = self.geometry.camera_height,
            framerate = self.settings.framerate,
            "Camera capture started"
        );
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.bus = Some(bus);
        Ok(())
    }

    fn stop(&mut self) -> PipelineResult<()> {
        if let Some(appsink) = self.appsink.take() {
            appsink.set_callbacks(gstreamer_app::AppSinkCallbacks::builder().build());
        }
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };

        let result = pipeline
            .set_state(gstreamer::State::Null)
            .map(|_| ())
            .map_err(|e| PipelineError::setup(Stage::Capture, format!("Failed to stop pipeline: {}", e)));
        let (state_result, state, _) =
            pipeline.state(gstreamer::ClockTime::from_seconds(STOP_TIMEOUT_SECS));
        debug!(result = ?state_result, state = ?state, "Camera pipeline stopped");

        if let Some(bus) = self.bus.take() {
            bus.stop();
        }
        result
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        if let Some(appsink) = self.appsink.take() {
            appsink.set_callbacks(gstreamer_app::AppSinkCallbacks::builder().build());
        }
        if let Some(pipeline) = self.pipeline.take() {
            super::set_null(&pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_description() {
        let settings = CaptureSettings {
            camera_id: 1,
            hflip: true,
            vflip: true,
            ..Default::default()
        };
        let geometry = FrameGeometry::new(1280, 720, 1296, 972).unwrap();
        let description = capture_pipeline_description(&settings, &geometry);
        assert!(description.starts_with("v4l2src device=/dev/video1 ! "));
        assert!(description.contains("format=YUY2,width=1296,height=972,framerate=30/1"));
        assert!(description.contains("videoflip method=rotate-180"));
        assert!(description.contains("appsink name=sink max-buffers=3"));
    }

    #[test]
    fn test_copy_rows_pads_to_buffer_stride() {
        // Two rows of 3 pixels (6 bytes) with a 8-byte source stride
        let src = [1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12, 0, 0];
        let mut dst = [0xFFu8; 16];
        let len = copy_rows(&src, 8, &mut dst, 8, 6);
        assert_eq!(len, 16);
        assert_eq!(&dst[..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&dst[8..14], &[7, 8, 9, 10, 11, 12]);
    }
}
