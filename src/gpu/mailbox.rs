// SPDX-License-Identifier: GPL-3.0-only

//! VideoCore firmware mailbox property channel
//!
//! Talks to the firmware through `/dev/vcio`. Each request is a property
//! message holding a single tag; the firmware answers in place.

use super::ComputeDevice;
use crate::errors::{PipelineError, PipelineResult, Stage};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, info};

const DEVICE_PATH: &str = "/dev/vcio";

/// Request code in a property buffer
const PROCESS_REQUEST: u32 = 0x0000_0000;
/// Firmware sets this code when the request succeeded
const RESPONSE_SUCCESS: u32 = 0x8000_0000;

const TAG_MEM_ALLOC: u32 = 0x0003_000c;
const TAG_MEM_LOCK: u32 = 0x0003_000d;
const TAG_MEM_UNLOCK: u32 = 0x0003_000e;
const TAG_MEM_RELEASE: u32 = 0x0003_000f;
const TAG_EXECUTE_QPU: u32 = 0x0003_0011;
const TAG_ENABLE_QPU: u32 = 0x0003_0012;

/// Allocation flags for `mem_alloc`
pub mod mem_flags {
    /// Uncached alias (0xC), coherent with CPU writes through /dev/mem
    pub const DIRECT: u32 = 1 << 2;
    /// Zero the allocation
    pub const ZERO: u32 = 1 << 4;
}

/// `_IOWR(100, 0, char *)`
fn ioctl_mbox_property() -> libc::c_ulong {
    const IOC_READ_WRITE: libc::c_ulong = 3;
    let size = std::mem::size_of::<*mut libc::c_char>() as libc::c_ulong;
    (IOC_READ_WRITE << 30) | (size << 16) | (100 << 8)
}

/// Open handle to the firmware mailbox
#[derive(Debug)]
pub struct Mailbox {
    file: File,
}

impl Mailbox {
    pub fn open() -> PipelineResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEVICE_PATH)
            .map_err(|e| {
                PipelineError::setup(
                    Stage::Remap,
                    format!("failed to open {}: {}", DEVICE_PATH, e),
                )
            })?;
        info!(device = DEVICE_PATH, "Opened VideoCore mailbox");
        Ok(Self { file })
    }

    /// Send one tag and return its first response word
    fn property(&self, tag: u32, args: &[u32]) -> PipelineResult<u32> {
        // Value buffer must hold the request and the (single word) response
        let value_words = args.len().max(1);
        let mut message = Vec::with_capacity(value_words + 6);
        message.push(0); // total size, patched below
        message.push(PROCESS_REQUEST);
        message.push(tag);
        message.push((value_words * 4) as u32);
        message.push((args.len() * 4) as u32);
        message.extend_from_slice(args);
        message.resize(5 + value_words, 0);
        message.push(0); // end tag
        message[0] = (message.len() * 4) as u32;

        // SAFETY: the firmware reads and writes at most message[0] bytes,
        // which is exactly the length of `message`.
        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                ioctl_mbox_property() as _,
                message.as_mut_ptr(),
            )
        };
        if result < 0 {
            return Err(PipelineError::setup(
                Stage::Remap,
                format!(
                    "mailbox tag {:#x} failed: {}",
                    tag,
                    std::io::Error::last_os_error()
                ),
            ));
        }
        if message[1] != RESPONSE_SUCCESS {
            return Err(PipelineError::setup(
                Stage::Remap,
                format!("mailbox tag {:#x} rejected: {:#x}", tag, message[1]),
            ));
        }
        Ok(message[5])
    }

    /// Allocate GPU memory; returns a firmware handle (0 on failure)
    pub fn mem_alloc(&self, size: u32, align: u32, flags: u32) -> PipelineResult<u32> {
        self.property(TAG_MEM_ALLOC, &[size, align, flags])
    }

    /// Pin an allocation and return its bus address
    pub fn mem_lock(&self, handle: u32) -> PipelineResult<u32> {
        self.property(TAG_MEM_LOCK, &[handle])
    }

    pub fn mem_unlock(&self, handle: u32) -> PipelineResult<u32> {
        self.property(TAG_MEM_UNLOCK, &[handle])
    }

    pub fn mem_release(&self, handle: u32) -> PipelineResult<u32> {
        self.property(TAG_MEM_RELEASE, &[handle])
    }

    /// Power the compute units on or off; returns the firmware status (0 = ok)
    pub fn qpu_enable(&self, enable: bool) -> PipelineResult<u32> {
        self.property(TAG_ENABLE_QPU, &[enable as u32])
    }

    /// Run `num_qpus` programs described by the message table at `control`
    /// and wait up to `timeout_ms` for them to signal completion.
    pub fn execute_qpu(
        &self,
        num_qpus: u32,
        control: u32,
        noflush: bool,
        timeout_ms: u32,
    ) -> PipelineResult<u32> {
        self.property(
            TAG_EXECUTE_QPU,
            &[num_qpus, control, noflush as u32, timeout_ms],
        )
    }
}

impl ComputeDevice for Mailbox {
    fn name(&self) -> &'static str {
        "videocore"
    }

    fn set_enabled(&self, enabled: bool) -> PipelineResult<()> {
        match self.qpu_enable(enabled)? {
            0 => Ok(()),
            status => Err(PipelineError::setup(
                Stage::Remap,
                format!(
                    "failed to {} compute units (status {})",
                    if enabled { "enable" } else { "disable" },
                    status
                ),
            )),
        }
    }

    fn execute(&self, units: usize, mailbox_address: u32, timeout: Duration) -> PipelineResult<()> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let status = self.execute_qpu(units as u32, mailbox_address, true, timeout_ms)?;
        if status != 0 {
            debug!(status, "execute_qpu returned non-zero status");
            return Err(PipelineError::DispatchTimeout { timeout });
        }
        Ok(())
    }
}
