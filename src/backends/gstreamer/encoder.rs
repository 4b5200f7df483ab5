// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 H.264 hardware encoder

use super::BusWatch;
use crate::config::EncoderSettings;
use crate::constants::timing::{FRAME_LOG_INTERVAL, OUTPUT_ACQUIRE_TIMEOUT};
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::geometry::FrameGeometry;
use crate::pipeline::{
    BufferPool, CompletionQueue, EncodeContext, EncodeStage, FrameBuffer, FrameFlags,
    HardwareEvent, SubmitError,
};
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Launch description for the encoder pipeline.
///
/// The input is the padded I420 buffer; `videocrop` trims the padding rows
/// before encoding.
pub fn encoder_pipeline_description(settings: &EncoderSettings, geometry: &FrameGeometry) -> String {
    let padding = geometry.video_buffer_height - geometry.video_height;
    format!(
        "appsrc name=src ! \
         videocrop bottom={} ! \
         v4l2h264enc extra-controls=\"controls,video_bitrate={},h264_i_frame_period={},repeat_sequence_header={}\" ! \
         video/x-h264,profile=high ! \
         h264parse config-interval={} ! \
         video/x-h264,stream-format=byte-stream,alignment=au ! \
         appsink name=sink sync=false",
        padding,
        settings.bitrate,
        settings.keyframe_interval,
        settings.inline_header as u8,
        if settings.inline_header { -1 } else { 0 },
    )
}

struct BitstreamTarget {
    pool: Arc<BufferPool>,
    ready: CompletionQueue<FrameBuffer>,
    events: CompletionQueue<HardwareEvent>,
    buffers: AtomicU64,
}

impl BitstreamTarget {
    fn deliver(&self, appsink: &AppSink) -> Result<gstreamer::FlowSuccess, gstreamer::FlowError> {
        let sample = appsink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
        let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;

        let mut flags = FrameFlags::FRAME_END;
        if !buffer.flags().contains(gstreamer::BufferFlags::DELTA_UNIT) {
            flags.insert(FrameFlags::KEYFRAME);
        }
        if buffer.flags().contains(gstreamer::BufferFlags::HEADER) {
            flags.insert(FrameFlags::CODEC_CONFIG);
        }
        let timestamp = buffer.pts().map(|t| t.useconds());

        let map = buffer.map_readable().map_err(|_| gstreamer::FlowError::Error)?;
        let data = map.as_slice();
        for (index, chunk) in data.chunks(self.pool.buffer_size()).enumerate() {
            let Some(mut output) = self.pool.acquire_timeout(OUTPUT_ACQUIRE_TIMEOUT) else {
                let _ = self.events.push(HardwareEvent::new(
                    "encoder",
                    super::event_code::WARNING,
                    format!(
                        "no free bitstream buffer, {} bytes lost",
                        data.len() - index * self.pool.buffer_size()
                    ),
                ));
                break;
            };
            output.timestamp = timestamp;
            output.flags = flags;
            let filled = output.fill(|dst| {
                dst[..chunk.len()].copy_from_slice(chunk);
                chunk.len()
            });
            if filled.is_err() || self.pool.mark_ready(&output).is_err() {
                let _ = self.pool.release(output);
                return Err(gstreamer::FlowError::Error);
            }
            if let Err(output) = self.ready.push(output) {
                let _ = self.pool.release(output);
                return Err(gstreamer::FlowError::Flushing);
            }
        }

        let count = self.buffers.fetch_add(1, Ordering::Relaxed);
        if count % FRAME_LOG_INTERVAL == 0 {
            debug!(buffer = count, bytes = data.len(), "Encoded buffers");
        }
        Ok(gstreamer::FlowSuccess::Ok)
    }
}

struct Running {
    pipeline: gstreamer::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    bus: BusWatch,
    input_returns: CompletionQueue<FrameBuffer>,
    /// EOS sent; no more input is accepted
    finishing: bool,
    /// EOS could not be sent, so none will arrive
    flush_failed: bool,
}

pub struct GstEncoder {
    settings: EncoderSettings,
    geometry: FrameGeometry,
    framerate: u32,
    running: Option<Running>,
}

impl GstEncoder {
    pub fn new(settings: EncoderSettings, geometry: FrameGeometry, framerate: u32) -> Self {
        Self {
            settings,
            geometry,
            framerate,
            running: None,
        }
    }
}

impl EncodeStage for GstEncoder {
    fn name(&self) -> &'static str {
        "v4l2h264enc"
    }

    fn start(&mut self, ctx: EncodeContext) -> PipelineResult<()> {
        super::init(Stage::Encode)?;

        if self.settings.sps_timing {
            info!("SPS timing information follows the input framerate caps");
        }

        let description = encoder_pipeline_description(&self.settings, &self.geometry);
        let pipeline = super::launch(&description, Stage::Encode)?;
        let appsrc: AppSrc = super::element(&pipeline, "src", Stage::Encode)?;
        let appsink: AppSink = super::element(&pipeline, "sink", Stage::Encode)?;

        let caps = gstreamer_video::VideoCapsBuilder::new()
            .format(gstreamer_video::VideoFormat::I420)
            .width(self.geometry.video_buffer_width as i32)
            .height(self.geometry.video_buffer_height as i32)
            .framerate(gstreamer::Fraction::new(self.framerate as i32, 1))
            .build();
        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gstreamer::Format::Time);
        appsrc.set_is_live(true);

        let bus = BusWatch::start(&pipeline, "encoder", ctx.events.clone(), Stage::Encode)?;

        let target = Arc::new(BitstreamTarget {
            pool: Arc::clone(&ctx.output_pool),
            ready: ctx.output_ready,
            events: ctx.events,
            buffers: AtomicU64::new(0),
        });
        appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| target.deliver(appsink))
                .build(),
        );

        if let Err(e) = super::set_playing(&pipeline, Stage::Encode) {
            appsink.set_callbacks(gstreamer_app::AppSinkCallbacks::builder().build());
            super::set_null(&pipeline);
            bus.stop();
            return Err(e);
        }

        info!(
            bitrate = self.settings.bitrate,
            keyframe_interval = self.settings.keyframe_interval,
            inline_header = self.settings.inline_header,
            "Encoder started"
        );
        self.running = Some(Running {
            pipeline,
            appsrc,
            appsink,
            bus,
            input_returns: ctx.input_returns,
            finishing: false,
            flush_failed: false,
        });
        Ok(())
    }

    fn submit(&mut self, frame: FrameBuffer) -> Result<(), SubmitError> {
        let Some(running) = self.running.as_ref().filter(|running| !running.finishing) else {
            return Err(SubmitError::new(
                frame,
                PipelineError::setup(Stage::Encode, "encoder is not accepting input"),
            ));
        };

        let buffer = frame
            .with_data(|data| -> PipelineResult<gstreamer::Buffer> {
                let mut buffer = gstreamer::Buffer::with_size(data.len()).map_err(|e| {
                    PipelineError::setup(Stage::Encode, format!("Failed to create buffer: {}", e))
                })?;
                {
                    let buffer_ref = buffer.get_mut().ok_or_else(|| {
                        PipelineError::setup(Stage::Encode, "Failed to get mutable buffer reference")
                    })?;
                    if let Some(us) = frame.timestamp {
                        buffer_ref.set_pts(gstreamer::ClockTime::from_useconds(us));
                    }
                    let mut map = buffer_ref.map_writable().map_err(|e| {
                        PipelineError::setup(Stage::Encode, format!("Failed to map buffer: {}", e))
                    })?;
                    map.copy_from_slice(data);
                }
                Ok(buffer)
            })
            .and_then(|result| result);
        let buffer = match buffer {
            Ok(buffer) => buffer,
            Err(error) => return Err(SubmitError::new(frame, error)),
        };

        if let Err(e) = running.appsrc.push_buffer(buffer) {
            return Err(SubmitError::new(
                frame,
                PipelineError::setup(Stage::Encode, format!("Failed to push frame: {:?}", e)),
            ));
        }

        // The pool buffer is free again once its bytes are copied
        if running.input_returns.push(frame).is_err() {
            debug!("Coordinator gone, dropping returned input buffer");
        }
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        if running.finishing {
            return Ok(());
        }
        running.finishing = true;

        // Frames already inside the encoder come out ahead of EOS
        if let Err(e) = running.appsrc.end_of_stream() {
            warn!(?e, "Failed to send EOS to encoder");
            running.flush_failed = true;
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        match &self.running {
            Some(running) => running.flush_failed || running.bus.is_eos(),
            None => true,
        }
    }

    fn stop(&mut self) -> PipelineResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running
            .appsink
            .set_callbacks(gstreamer_app::AppSinkCallbacks::builder().build());
        let result = running
            .pipeline
            .set_state(gstreamer::State::Null)
            .map(|_| ())
            .map_err(|e| PipelineError::setup(Stage::Encode, format!("Failed to stop pipeline: {}", e)));
        running.bus.stop();
        info!("Encoder stopped");
        result
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running
                .appsink
                .set_callbacks(gstreamer_app::AppSinkCallbacks::builder().build());
            super::set_null(&running.pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_description_carries_encoder_knobs() {
        let settings = EncoderSettings {
            bitrate: 4_000_000,
            keyframe_interval: 30,
            inline_header: true,
            ..Default::default()
        };
        let geometry = FrameGeometry::new(1920, 1080, 1920, 1080).unwrap();
        let description = encoder_pipeline_description(&settings, &geometry);
        assert!(description.contains("videocrop bottom=8"));
        assert!(description.contains("video_bitrate=4000000"));
        assert!(description.contains("h264_i_frame_period=30"));
        assert!(description.contains("repeat_sequence_header=1"));
        assert!(description.contains("h264parse config-interval=-1"));
    }
}
