// SPDX-License-Identifier: GPL-3.0-only

//! Command-line entry: configuration merge, signal handling and the run

use super::Cli;
use remapvid::errors::{PipelineError, PipelineResult};
use remapvid::pipeline::PipelineStats;
use remapvid::runner::{build_pipeline, run_pipeline};
use remapvid::{RemapConfig, RunFlag};
use tracing::info;

/// Config file values, overridden by any flag given on the command line
fn merge_config(args: Cli) -> PipelineResult<RemapConfig> {
    let mut config = match &args.config {
        Some(path) => RemapConfig::from_json_file(path)?,
        None => RemapConfig::default(),
    };

    if args.map.is_some() {
        config.map_path = args.map;
    }
    if args.kernel.is_some() {
        config.kernel_path = args.kernel;
    }
    if args.output.is_some() {
        config.output_path = args.output;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    config.emulate |= args.emulate;

    let capture = &mut config.capture;
    if let Some(camera) = args.camera {
        capture.camera_id = camera;
    }
    if let Some(sensor) = args.sensor {
        capture.sensor_mode = sensor;
    }
    if let Some(framerate) = args.framerate {
        capture.framerate = framerate;
    }
    capture.stereo |= args.stereo;
    capture.hflip |= args.hflip;
    capture.vflip |= args.vflip;

    let encoder = &mut config.encoder;
    if let Some(bitrate) = args.bitrate {
        encoder.bitrate = bitrate;
    }
    if let Some(keyframe) = args.keyframe {
        encoder.keyframe_interval = keyframe;
    }
    encoder.inline_header |= args.inline_header;
    encoder.sps_timing |= args.sps_timing;

    Ok(config)
}

/// Build the pipeline, run it until a signal or error, and shut it down
pub(crate) fn run(args: Cli) -> PipelineResult<PipelineStats> {
    let config = merge_config(args)?;
    info!(
        version = env!("GIT_VERSION"),
        backend = %config.backend,
        emulate = config.emulate,
        "Starting remapvid"
    );

    // Installed before setup so a signal during map or pipeline setup is honoured
    let run = RunFlag::new();
    let handler_run = run.clone();
    ctrlc::set_handler(move || handler_run.stop())
        .map_err(|e| PipelineError::Config(format!("failed to install signal handler: {}", e)))?;

    let coordinator = build_pipeline(&config, run)?;
    run_pipeline(coordinator)
}
