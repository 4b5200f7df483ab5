// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline assembly and the run-to-shutdown sequence

use crate::backends;
use crate::config::RemapConfig;
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::gpu::{ComputeDevice, ComputeProgram, Dispatcher, HostCompute, IdentityKernel, Mailbox};
use crate::map::open_map;
use crate::memory::{HostMemory, MailboxMemory, SharedMemory};
use crate::pipeline::{Coordinator, CoordinatorSettings, PipelineStats, RemapStage, RunFlag};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tracing::{info, warn};

/// Memory domain and compute device for the remap stage
fn compute_backend(
    config: &RemapConfig,
) -> PipelineResult<(Arc<dyn SharedMemory>, Arc<dyn ComputeDevice>)> {
    if config.emulate {
        info!("Running compute on the host emulator");
        let host = Arc::new(HostMemory::new());
        let device: Arc<dyn ComputeDevice> =
            Arc::new(HostCompute::new(Arc::clone(&host), Box::new(IdentityKernel)));
        let memory: Arc<dyn SharedMemory> = host;
        return Ok((memory, device));
    }

    let mailbox = Arc::new(Mailbox::open()?);
    let memory: Arc<dyn SharedMemory> = Arc::new(MailboxMemory::open(Arc::clone(&mailbox))?);
    let device: Arc<dyn ComputeDevice> = mailbox;
    Ok((memory, device))
}

fn open_sink(config: &RemapConfig) -> PipelineResult<Box<dyn Write + Send>> {
    match &config.output_path {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                PipelineError::setup(
                    Stage::Encode,
                    format!("failed to create {}: {}", path.display(), e),
                )
            })?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(std::io::stdout())),
    }
}

/// Validate `config` and set up every stage; nothing runs yet
pub fn build_pipeline(config: &RemapConfig, run: RunFlag) -> PipelineResult<Coordinator> {
    config.validate()?;
    let map_path = config
        .map_path
        .as_deref()
        .ok_or_else(|| PipelineError::Config("map filename is not specified".into()))?;

    let (domain, device) = compute_backend(config)?;
    let (geometry, table) = open_map(map_path, &domain)?;

    let mut program = ComputeProgram::create(&domain, config.unit_count)?;
    if let Some(kernel_path) = &config.kernel_path {
        let code = std::fs::read(kernel_path).map_err(|e| {
            PipelineError::setup(
                Stage::Remap,
                format!("failed to read {}: {}", kernel_path.display(), e),
            )
        })?;
        program.load_kernel(&code)?;
    }
    let dispatcher = Dispatcher::new(program, device, config.dispatch_timeout());
    let remap = RemapStage::new(dispatcher, table, geometry);

    let (capture, encoder) = backends::create_stages(config, &geometry);
    let sink = open_sink(config)?;

    let settings = CoordinatorSettings {
        capture_buffers: config.capture.pool_size,
        encoder_input_buffers: config.encoder.input_pool_size,
        encoder_output_buffers: config.encoder.output_pool_size,
        encoder_output_buffer_size: config.encoder.output_buffer_size,
        semaphore_timeout: config.semaphore_timeout(),
    };
    Coordinator::new(&domain, remap, capture, encoder, sink, settings, run)
}

/// Start, run until stopped, and always shut down.
///
/// The first error wins; a shutdown error after a run error is only logged.
pub fn run_pipeline(mut coordinator: Coordinator) -> PipelineResult<PipelineStats> {
    let outcome = coordinator.start().and_then(|_| coordinator.run());
    let shutdown = coordinator.shutdown();
    match (outcome, shutdown) {
        (Ok(()), shutdown) => shutdown,
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(shutdown_error)) => {
            warn!(error = %shutdown_error, "Shutdown also failed");
            Err(e)
        }
    }
}
