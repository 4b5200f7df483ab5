// SPDX-License-Identifier: GPL-3.0-only

//! GPU compute for the remap stage
//!
//! The kernel is an opaque precompiled image. This module loads it into a
//! [`program::ComputeProgram`], fills per-unit uniform blocks every frame and
//! runs it through a [`ComputeDevice`]:
//!
//! - [`mailbox::Mailbox`]: the VideoCore firmware
//! - [`emulator::HostCompute`]: a host-side stand-in over [`crate::memory::HostMemory`]

pub mod dispatcher;
pub mod emulator;
pub mod mailbox;
pub mod program;
pub mod uniforms;

use crate::errors::PipelineResult;
use std::time::Duration;

pub use dispatcher::Dispatcher;
pub use emulator::{HostCompute, HostKernel, IdentityKernel};
pub use mailbox::Mailbox;
pub use program::ComputeProgram;
pub use uniforms::{UniformBlock, UniformParams, UnitIndex, build_uniforms};

/// Hardware that runs compute programs described by a completion mailbox table
pub trait ComputeDevice: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Power compute mode on or off
    fn set_enabled(&self, enabled: bool) -> PipelineResult<()>;

    /// Run `units` programs and block until all complete or `timeout` passes.
    ///
    /// `mailbox_address` is the device address of `units` consecutive
    /// `(uniform_address, code_address)` word pairs.
    fn execute(&self, units: usize, mailbox_address: u32, timeout: Duration) -> PipelineResult<()>;
}
