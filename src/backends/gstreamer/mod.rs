// SPDX-License-Identifier: GPL-3.0-only

//! GStreamer camera and hardware encoder stages
//!
//! Frames are copied between GStreamer buffers and pool buffers at the
//! appsink/appsrc boundary; the pools stay in shared memory so the remap
//! stage can address them.

pub mod capture;
pub mod encoder;

pub use capture::GstCapture;
pub use encoder::GstEncoder;

use crate::constants::timing::{START_TIMEOUT_SECS, WORKER_POLL_INTERVAL};
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::pipeline::{CompletionQueue, HardwareEvent, LoopAction, StageLoop};
use gstreamer::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Event codes for bus messages forwarded as [`HardwareEvent`]s
pub mod event_code {
    pub const WARNING: u32 = 1;
    pub const ERROR: u32 = 2;
}

pub(crate) fn init(stage: Stage) -> PipelineResult<()> {
    gstreamer::init()
        .map_err(|e| PipelineError::setup(stage, format!("GStreamer init failed: {}", e)))
}

/// Build a pipeline from a launch description
pub(crate) fn launch(description: &str, stage: Stage) -> PipelineResult<gstreamer::Pipeline> {
    debug!(pipeline = description, "Creating GStreamer pipeline");
    gstreamer::parse::launch(description)
        .map_err(|e| PipelineError::setup(stage, format!("Failed to create pipeline: {}", e)))?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| PipelineError::setup(stage, "Failed to downcast to Pipeline"))
}

/// Look up a named element and cast it
pub(crate) fn element<T: IsA<gstreamer::Element>>(
    pipeline: &gstreamer::Pipeline,
    name: &str,
    stage: Stage,
) -> PipelineResult<T> {
    pipeline
        .by_name(name)
        .ok_or_else(|| PipelineError::setup(stage, format!("Failed to get {}", name)))?
        .dynamic_cast::<T>()
        .map_err(|_| PipelineError::setup(stage, format!("Failed to cast {}", name)))
}

pub(crate) fn set_playing(pipeline: &gstreamer::Pipeline, stage: Stage) -> PipelineResult<()> {
    pipeline
        .set_state(gstreamer::State::Playing)
        .map_err(|e| PipelineError::setup(stage, format!("Failed to start pipeline: {}", e)))?;

    let (result, state, pending) =
        pipeline.state(gstreamer::ClockTime::from_seconds(START_TIMEOUT_SECS));
    debug!(result = ?result, state = ?state, pending = ?pending, "Pipeline state");
    if result.is_err() {
        return Err(PipelineError::setup(
            stage,
            "Pipeline failed to reach Playing state",
        ));
    }
    Ok(())
}

pub(crate) fn set_null(pipeline: &gstreamer::Pipeline) {
    if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
        error!(?e, "Failed to set pipeline to Null");
    }
}

/// Forwards bus warnings and errors as hardware events and records EOS
pub(crate) struct BusWatch {
    worker: StageLoop,
    eos: Arc<AtomicBool>,
}

impl BusWatch {
    pub(crate) fn start(
        pipeline: &gstreamer::Pipeline,
        source: &'static str,
        events: CompletionQueue<HardwareEvent>,
        stage: Stage,
    ) -> PipelineResult<Self> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| PipelineError::setup(stage, "No bus available"))?;
        let eos = Arc::new(AtomicBool::new(false));
        let eos_flag = Arc::clone(&eos);

        let worker = StageLoop::start(source, stage, move || {
            let Some(msg) = bus.timed_pop_filtered(
                gstreamer::ClockTime::from_mseconds(WORKER_POLL_INTERVAL.as_millis() as u64),
                &[
                    gstreamer::MessageType::Error,
                    gstreamer::MessageType::Warning,
                    gstreamer::MessageType::Eos,
                ],
            ) else {
                return LoopAction::Continue;
            };

            let element = msg
                .src()
                .map(|s| s.name().to_string())
                .unwrap_or_default();
            let event = match msg.view() {
                gstreamer::MessageView::Error(err) => {
                    error!(
                        source,
                        element = %element,
                        error = %err.error(),
                        debug = ?err.debug(),
                        "GStreamer error"
                    );
                    HardwareEvent::new(source, event_code::ERROR, format!("{}: {}", element, err.error()))
                }
                gstreamer::MessageView::Warning(warning) => HardwareEvent::new(
                    source,
                    event_code::WARNING,
                    format!("{}: {}", element, warning.error()),
                ),
                gstreamer::MessageView::Eos(_) => {
                    debug!(source, "End of stream");
                    eos_flag.store(true, Ordering::SeqCst);
                    return LoopAction::Continue;
                }
                _ => return LoopAction::Continue,
            };
            if events.push(event).is_err() {
                return LoopAction::Stop;
            }
            LoopAction::Continue
        })?;

        Ok(Self { worker, eos })
    }

    /// Whether the pipeline has posted EOS
    pub(crate) fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(mut self) {
        self.worker.stop();
        info!("Bus watch stopped");
    }
}
