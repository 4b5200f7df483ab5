// SPDX-License-Identifier: GPL-3.0-only

//! Process-local shared memory domain
//!
//! Allocations live in ordinary heap memory but receive 32-bit device
//! addresses in a bus-like window, so code that embeds device addresses into
//! GPU tables behaves the same as on hardware. The host compute emulator
//! resolves those addresses back to memory with [`HostMemory::read`] and
//! [`HostMemory::write`].

use super::{MemHandle, SharedMemory};
use crate::constants::gpu::PAGE_SIZE;
use crate::errors::{PipelineError, PipelineResult, Stage};
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use tracing::warn;

/// First device address handed out (the VideoCore uncached alias)
const DEVICE_WINDOW_BASE: u32 = 0xC000_0000;

struct HostAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
    size: usize,
    address: u32,
    lock_count: usize,
}

struct HostState {
    next_handle: u32,
    next_address: u32,
    used: usize,
    allocations: BTreeMap<MemHandle, HostAllocation>,
}

// SAFETY: allocations are owned by the state and only touched under its mutex.
unsafe impl Send for HostState {}

impl HostState {
    fn resolve(&self, address: u32, len: usize) -> PipelineResult<NonNull<u8>> {
        for alloc in self.allocations.values() {
            let start = alloc.address as u64;
            let end = start + alloc.size as u64;
            let addr = address as u64;
            if addr >= start && addr + len as u64 <= end {
                let offset = (addr - start) as usize;
                // SAFETY: offset + len lies inside the allocation
                let ptr = unsafe { alloc.ptr.as_ptr().add(offset) };
                return NonNull::new(ptr).ok_or_else(|| {
                    PipelineError::setup(Stage::Memory, "null host allocation")
                });
            }
        }
        Err(PipelineError::setup(
            Stage::Memory,
            format!(
                "device address {:#010x}+{} is not mapped in host memory",
                address, len
            ),
        ))
    }
}

/// Shared memory domain backed by the process heap
pub struct HostMemory {
    state: Mutex<HostState>,
    /// Upper bound on live bytes, to model allocator exhaustion
    capacity: Option<usize>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Domain that fails allocations once `capacity` live bytes are in use
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(HostState {
                next_handle: 1,
                next_address: DEVICE_WINDOW_BASE,
                used: 0,
                allocations: BTreeMap::new(),
            }),
            capacity,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HostState> {
        // A panic while holding the lock cannot leave the map half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sum of lock counts over all live allocations
    pub fn outstanding_locks(&self) -> usize {
        self.state().allocations.values().map(|a| a.lock_count).sum()
    }

    pub fn allocation_count(&self) -> usize {
        self.state().allocations.len()
    }

    /// Copy bytes out of memory at a device address
    pub fn read(&self, address: u32, dst: &mut [u8]) -> PipelineResult<()> {
        let state = self.state();
        let src = state.resolve(address, dst.len())?;
        // SAFETY: resolve checked the range; the emulator never overlaps dst
        // with shared memory.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copy bytes into memory at a device address
    pub fn write(&self, address: u32, src: &[u8]) -> PipelineResult<()> {
        let state = self.state();
        let dst = state.resolve(address, src.len())?;
        // SAFETY: resolve checked the range
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len()) };
        Ok(())
    }

    /// Read `count` little-endian words starting at a device address
    pub fn read_words(&self, address: u32, count: usize) -> PipelineResult<Vec<u32>> {
        let mut bytes = vec![0u8; count * 4];
        self.read(address, &mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("HostMemory")
            .field("allocations", &state.allocations.len())
            .field("used", &state.used)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl SharedMemory for HostMemory {
    fn name(&self) -> &'static str {
        "host"
    }

    fn alloc(&self, size: usize) -> PipelineResult<MemHandle> {
        if size == 0 {
            return Err(PipelineError::Allocation {
                size,
                message: "zero-sized allocation".into(),
            });
        }

        let mut state = self.state();
        if let Some(capacity) = self.capacity
            && state.used + size > capacity
        {
            return Err(PipelineError::Allocation {
                size,
                message: format!("{} of {} bytes already in use", state.used, capacity),
            });
        }

        let span = size.next_multiple_of(PAGE_SIZE);
        // One unmapped guard page between allocations
        let next_address = u32::try_from(span + PAGE_SIZE)
            .ok()
            .and_then(|step| state.next_address.checked_add(step))
            .ok_or_else(|| PipelineError::Allocation {
                size,
                message: "device address window exhausted".into(),
            })?;

        let layout = Layout::from_size_align(span, PAGE_SIZE).map_err(|e| {
            PipelineError::Allocation {
                size,
                message: e.to_string(),
            }
        })?;
        // SAFETY: layout has a non-zero size
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).ok_or_else(|| {
            PipelineError::Allocation {
                size,
                message: "out of memory".into(),
            }
        })?;

        let handle = MemHandle(state.next_handle);
        state.next_handle += 1;
        let address = state.next_address;
        state.next_address = next_address;
        state.used += size;
        state.allocations.insert(
            handle,
            HostAllocation {
                ptr,
                layout,
                size,
                address,
                lock_count: 0,
            },
        );
        Ok(handle)
    }

    fn lock(&self, handle: MemHandle) -> PipelineResult<NonNull<u8>> {
        let mut state = self.state();
        let alloc = state.allocations.get_mut(&handle).ok_or_else(|| {
            PipelineError::setup(Stage::Memory, format!("unknown handle {}", handle.0))
        })?;
        alloc.lock_count += 1;
        Ok(alloc.ptr)
    }

    fn unlock(&self, handle: MemHandle) {
        let mut state = self.state();
        match state.allocations.get_mut(&handle) {
            Some(alloc) if alloc.lock_count > 0 => alloc.lock_count -= 1,
            Some(_) => warn!(handle = handle.0, "Unlock without matching lock"),
            None => warn!(handle = handle.0, "Unlock of unknown handle"),
        }
    }

    fn device_address(&self, handle: MemHandle) -> PipelineResult<u32> {
        self.state()
            .allocations
            .get(&handle)
            .map(|a| a.address)
            .ok_or_else(|| {
                PipelineError::setup(Stage::Memory, format!("unknown handle {}", handle.0))
            })
    }

    fn free(&self, handle: MemHandle) {
        let mut state = self.state();
        let Some(alloc) = state.allocations.remove(&handle) else {
            warn!(handle = handle.0, "Free of unknown handle");
            return;
        };
        if alloc.lock_count > 0 {
            warn!(
                handle = handle.0,
                locks = alloc.lock_count,
                "Freeing shared buffer with outstanding locks"
            );
        }
        state.used -= alloc.size;
        // SAFETY: ptr was allocated with this layout and is no longer referenced
        unsafe { std::alloc::dealloc(alloc.ptr.as_ptr(), alloc.layout) };
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, alloc) in std::mem::take(&mut state.allocations) {
            // SAFETY: every remaining allocation is exclusively owned here
            unsafe { std::alloc::dealloc(alloc.ptr.as_ptr(), alloc.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_are_page_aligned_and_disjoint() {
        let memory = HostMemory::new();
        let a = memory.alloc(100).unwrap();
        let b = memory.alloc(5000).unwrap();
        let addr_a = memory.device_address(a).unwrap();
        let addr_b = memory.device_address(b).unwrap();
        assert_eq!(addr_a % PAGE_SIZE as u32, 0);
        assert_eq!(addr_b % PAGE_SIZE as u32, 0);
        assert!(addr_b >= addr_a + PAGE_SIZE as u32);
    }

    #[test]
    fn test_read_write_by_device_address() {
        let memory = HostMemory::new();
        let handle = memory.alloc(64).unwrap();
        let address = memory.device_address(handle).unwrap();
        memory.write(address + 8, &[1, 2, 3, 4]).unwrap();
        let words = memory.read_words(address + 8, 1).unwrap();
        assert_eq!(words, vec![0x0403_0201]);

        // Past the end of the allocation
        assert!(memory.write(address + 62, &[0; 4]).is_err());
    }

    #[test]
    fn test_capacity_exhaustion() {
        let memory = HostMemory::with_capacity(8192);
        let first = memory.alloc(6000).unwrap();
        let err = memory.alloc(4000).unwrap_err();
        assert!(matches!(err, PipelineError::Allocation { size: 4000, .. }));
        memory.free(first);
        assert!(memory.alloc(4000).is_ok());
    }
}
