// SPDX-License-Identifier: GPL-3.0-only
//! Worker thread lifecycle for stage backends
//!
//! Backends that produce or consume frames on their own thread run a
//! closure repeatedly under a [`StageLoop`], which owns the thread and its
//! stop signal.

use crate::errors::{PipelineError, PipelineResult, Stage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Returned by each iteration to keep going or finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Stop,
}

/// A stage worker thread
///
/// ```ignore
/// let mut worker = StageLoop::start("synthetic-capture", Stage::Capture, move || {
///     match pool.acquire_timeout(WORKER_POLL_INTERVAL) {
///         Some(frame) => { /* fill and queue */ LoopAction::Continue }
///         None => LoopAction::Continue,
///     }
/// })?;
/// worker.stop();
/// ```
pub struct StageLoop {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl StageLoop {
    /// Spawn a thread calling `loop_fn` until it returns [`LoopAction::Stop`]
    /// or [`StageLoop::stop`] is called.
    ///
    /// A thread that cannot be spawned is a setup error of `stage`.
    pub fn start<F>(name: &str, stage: Stage, mut loop_fn: F) -> PipelineResult<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        info!(name = %name, "Starting stage worker");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Stage worker started");

                loop {
                    if stop_signal_clone.load(Ordering::SeqCst) {
                        debug!(name = %name_clone, "Stop signal received");
                        break;
                    }

                    if loop_fn() == LoopAction::Stop {
                        debug!(name = %name_clone, "Worker finished");
                        break;
                    }
                }

                info!(name = %name_clone, "Stage worker exiting");
            });

        let thread_handle = thread_handle.map_err(|e| spawn_error(name, stage, e))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to stop without waiting
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting stage worker stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Signal the loop to stop and wait for the thread
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Wait for the loop to finish on its own
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            debug!(name = %self.name, "Waiting for stage worker");
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Stage worker panicked: {:?}", e);
            }
        }
    }
}

fn spawn_error(name: &str, stage: Stage, err: std::io::Error) -> PipelineError {
    error!(name = %name, error = %err, "Failed to spawn stage worker");
    PipelineError::setup(stage, format!("failed to spawn {} worker: {}", name, err))
}

impl Drop for StageLoop {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "StageLoop dropped, stopping worker");
            self.stop();
        }
    }
}
