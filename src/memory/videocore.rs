// SPDX-License-Identifier: GPL-3.0-only

//! VideoCore GPU memory allocated through the firmware mailbox
//!
//! Memory is allocated and pinned by the firmware, then mapped into this
//! process through `/dev/mem` at its ARM physical address. The mapping is
//! created at allocation time; `lock`/`unlock` bracket CPU access windows and
//! are counted so a free with outstanding locks can be reported.

use super::{MemHandle, SharedMemory};
use crate::constants::gpu::PAGE_SIZE;
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::gpu::mailbox::{Mailbox, mem_flags};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const MEM_DEVICE_PATH: &str = "/dev/mem";

/// Strip the bus alias bits to get the ARM physical address
fn bus_to_phys(bus_address: u32) -> u32 {
    bus_address & !0xC000_0000
}

struct VcAllocation {
    bus_address: u32,
    mapping: NonNull<u8>,
    mapped_len: usize,
    lock_count: usize,
}

// SAFETY: the mapping is process-wide and only touched under the state mutex
unsafe impl Send for VcAllocation {}

/// Shared memory domain backed by the VideoCore firmware allocator
pub struct MailboxMemory {
    mailbox: Arc<Mailbox>,
    mem: File,
    allocations: Mutex<BTreeMap<MemHandle, VcAllocation>>,
}

impl MailboxMemory {
    pub fn open(mailbox: Arc<Mailbox>) -> PipelineResult<Self> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(MEM_DEVICE_PATH)
            .map_err(|e| {
                PipelineError::setup(
                    Stage::Memory,
                    format!("failed to open {}: {}", MEM_DEVICE_PATH, e),
                )
            })?;
        Ok(Self {
            mailbox,
            mem,
            allocations: Mutex::new(BTreeMap::new()),
        })
    }

    fn allocations(&self) -> std::sync::MutexGuard<'_, BTreeMap<MemHandle, VcAllocation>> {
        self.allocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn map(&self, bus_address: u32, len: usize) -> PipelineResult<NonNull<u8>> {
        // SAFETY: mapping a firmware-pinned physical range we own
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.mem.as_raw_fd(),
                bus_to_phys(bus_address) as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PipelineError::Allocation {
                size: len,
                message: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| PipelineError::Allocation {
            size: len,
            message: "mmap returned null".into(),
        })
    }

    fn release(&self, handle: MemHandle) {
        if let Err(e) = self.mailbox.mem_unlock(handle.0) {
            warn!(handle = handle.0, error = %e, "Failed to unlock GPU memory");
        }
        if let Err(e) = self.mailbox.mem_release(handle.0) {
            warn!(handle = handle.0, error = %e, "Failed to release GPU memory");
        }
    }
}

impl std::fmt::Debug for MailboxMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxMemory")
            .field("allocations", &self.allocations().len())
            .finish()
    }
}

impl SharedMemory for MailboxMemory {
    fn name(&self) -> &'static str {
        "videocore"
    }

    fn alloc(&self, size: usize) -> PipelineResult<MemHandle> {
        let mapped_len = size.next_multiple_of(PAGE_SIZE);
        let request = u32::try_from(mapped_len).map_err(|_| PipelineError::Allocation {
            size,
            message: "allocation exceeds the 32-bit GPU address space".into(),
        })?;

        let raw = self.mailbox.mem_alloc(
            request,
            PAGE_SIZE as u32,
            mem_flags::DIRECT | mem_flags::ZERO,
        )?;
        if raw == 0 {
            return Err(PipelineError::Allocation {
                size,
                message: "firmware allocator exhausted".into(),
            });
        }
        let handle = MemHandle(raw);

        let bus_address = match self.mailbox.mem_lock(raw) {
            Ok(address) if address != 0 => address,
            Ok(_) | Err(_) => {
                let _ = self.mailbox.mem_release(raw);
                return Err(PipelineError::Allocation {
                    size,
                    message: "failed to pin GPU memory".into(),
                });
            }
        };

        let mapping = match self.map(bus_address, mapped_len) {
            Ok(mapping) => mapping,
            Err(e) => {
                self.release(handle);
                return Err(e);
            }
        };

        debug!(
            handle = raw,
            size,
            bus_address = format_args!("{:#010x}", bus_address),
            "Allocated VideoCore memory"
        );

        self.allocations().insert(
            handle,
            VcAllocation {
                bus_address,
                mapping,
                mapped_len,
                lock_count: 0,
            },
        );
        Ok(handle)
    }

    fn lock(&self, handle: MemHandle) -> PipelineResult<NonNull<u8>> {
        let mut allocations = self.allocations();
        let alloc = allocations.get_mut(&handle).ok_or_else(|| {
            PipelineError::setup(Stage::Memory, format!("unknown handle {}", handle.0))
        })?;
        alloc.lock_count += 1;
        Ok(alloc.mapping)
    }

    fn unlock(&self, handle: MemHandle) {
        let mut allocations = self.allocations();
        match allocations.get_mut(&handle) {
            Some(alloc) if alloc.lock_count > 0 => alloc.lock_count -= 1,
            _ => warn!(handle = handle.0, "Unlock without matching lock"),
        }
    }

    fn device_address(&self, handle: MemHandle) -> PipelineResult<u32> {
        self.allocations()
            .get(&handle)
            .map(|a| a.bus_address)
            .ok_or_else(|| {
                PipelineError::setup(Stage::Memory, format!("unknown handle {}", handle.0))
            })
    }

    fn free(&self, handle: MemHandle) {
        let Some(alloc) = self.allocations().remove(&handle) else {
            warn!(handle = handle.0, "Free of unknown handle");
            return;
        };
        if alloc.lock_count > 0 {
            warn!(
                handle = handle.0,
                locks = alloc.lock_count,
                "Freeing GPU memory with outstanding locks"
            );
        }
        // SAFETY: the mapping was created by `map` with this length
        unsafe { libc::munmap(alloc.mapping.as_ptr().cast(), alloc.mapped_len) };
        self.release(handle);
    }
}
