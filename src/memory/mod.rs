// SPDX-License-Identifier: GPL-3.0-only

//! Memory shared between the CPU and the GPU
//!
//! A [`SharedBuffer`] pairs a CPU mapping with the address the GPU uses for the
//! same physical memory. The CPU side is only reachable through a lock guard,
//! so a mapping can never outlive its access window and a buffer cannot be
//! destroyed while it is locked.
//!
//! Two domains implement [`SharedMemory`]:
//! - [`host::HostMemory`]: process-local memory with synthetic device addresses
//! - [`videocore::MailboxMemory`]: VideoCore memory from the firmware allocator

pub mod host;
pub mod videocore;

use crate::errors::{PipelineError, PipelineResult, Stage};
use std::fmt;
use std::io::Read;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

pub use host::HostMemory;
pub use videocore::MailboxMemory;

/// Allocation handle issued by a [`SharedMemory`] domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemHandle(pub u32);

/// An allocator for memory visible to both the CPU and the GPU.
///
/// `lock` nests: every successful call must be paired with one `unlock`.
/// Callers should go through [`SharedBuffer`], which does the pairing.
pub trait SharedMemory: Send + Sync + fmt::Debug {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Allocate `size` bytes, zero-filled
    fn alloc(&self, size: usize) -> PipelineResult<MemHandle>;

    /// Map the allocation for CPU access and return its base pointer
    fn lock(&self, handle: MemHandle) -> PipelineResult<NonNull<u8>>;

    /// End one CPU access window
    fn unlock(&self, handle: MemHandle);

    /// Address of the allocation in the GPU's address space
    fn device_address(&self, handle: MemHandle) -> PipelineResult<u32>;

    /// Release the allocation. No lock may be outstanding.
    fn free(&self, handle: MemHandle);
}

/// A region shared between the CPU and GPU domains, freed on drop
pub struct SharedBuffer {
    domain: Arc<dyn SharedMemory>,
    handle: MemHandle,
    size: usize,
    device_address: u32,
}

impl SharedBuffer {
    /// Allocate a new shared region of `size` bytes
    pub fn create(domain: &Arc<dyn SharedMemory>, size: usize) -> PipelineResult<Self> {
        let handle = domain.alloc(size)?;
        let device_address = match domain.device_address(handle) {
            Ok(address) => address,
            Err(e) => {
                domain.free(handle);
                return Err(e);
            }
        };

        debug!(
            domain = domain.name(),
            handle = handle.0,
            size,
            device_address = format_args!("{:#010x}", device_address),
            "Allocated shared buffer"
        );

        Ok(Self {
            domain: Arc::clone(domain),
            handle,
            size,
            device_address,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    /// Address to embed in GPU-side pointers (resolved once at creation)
    pub fn device_address(&self) -> u32 {
        self.device_address
    }

    pub fn domain(&self) -> &Arc<dyn SharedMemory> {
        &self.domain
    }

    /// Open a read-only CPU access window
    pub fn lock(&self) -> PipelineResult<BufferLock<'_>> {
        let ptr = self.domain.lock(self.handle)?;
        Ok(BufferLock { buffer: self, ptr })
    }

    /// Open a writable CPU access window
    pub fn lock_mut(&mut self) -> PipelineResult<BufferLockMut<'_>> {
        let ptr = self.domain.lock(self.handle)?;
        Ok(BufferLockMut { buffer: self, ptr })
    }

    /// Fill the first `size` bytes from `reader` under a lock.
    ///
    /// Fails with [`PipelineError::ShortRead`] if the stream ends early.
    pub fn load<R: Read>(&mut self, reader: &mut R, size: usize) -> PipelineResult<()> {
        if size > self.size {
            return Err(PipelineError::Allocation {
                size,
                message: format!("load exceeds buffer of {} bytes", self.size),
            });
        }

        let mut guard = self.lock_mut()?;
        let filled = read_fully(reader, &mut guard.as_mut_slice()[..size])
            .map_err(|e| PipelineError::io(Stage::Map, e))?;
        drop(guard);

        if filled != size {
            return Err(PipelineError::ShortRead {
                expected: size,
                actual: filled,
            });
        }
        Ok(())
    }

    /// Release the allocation now instead of at drop
    pub fn destroy(self) {
        drop(self);
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("domain", &self.domain.name())
            .field("handle", &self.handle.0)
            .field("size", &self.size)
            .field("device_address", &format_args!("{:#010x}", self.device_address))
            .finish()
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        self.domain.free(self.handle);
    }
}

/// Read-only CPU access window. Unlocks on drop.
pub struct BufferLock<'a> {
    buffer: &'a SharedBuffer,
    ptr: NonNull<u8>,
}

impl BufferLock<'_> {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the domain keeps `size` bytes mapped at `ptr` while locked,
        // and only shared borrows of the buffer exist for this guard's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.buffer.size) }
    }

    pub fn device_address(&self) -> u32 {
        self.buffer.device_address
    }
}

impl Drop for BufferLock<'_> {
    fn drop(&mut self) {
        self.buffer.domain.unlock(self.buffer.handle);
    }
}

/// Writable CPU access window. Unlocks on drop.
pub struct BufferLockMut<'a> {
    buffer: &'a mut SharedBuffer,
    ptr: NonNull<u8>,
}

impl BufferLockMut<'_> {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: see `BufferLock::as_slice`; the guard holds the only borrow.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.buffer.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the guard borrows the buffer mutably, so this is the only
        // CPU view of the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.buffer.size) }
    }

    pub fn device_address(&self) -> u32 {
        self.buffer.device_address
    }
}

impl Drop for BufferLockMut<'_> {
    fn drop(&mut self) {
        self.buffer.domain.unlock(self.buffer.handle);
    }
}

/// Read until `buf` is full or the stream ends; returns bytes read
pub(crate) fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_domain() -> (Arc<HostMemory>, Arc<dyn SharedMemory>) {
        let host = Arc::new(HostMemory::new());
        let domain: Arc<dyn SharedMemory> = host.clone();
        (host, domain)
    }

    #[test]
    fn test_lock_scope_unlocks_on_drop() {
        let (host, domain) = host_domain();
        let mut buffer = SharedBuffer::create(&domain, 64).unwrap();
        {
            let mut guard = buffer.lock_mut().unwrap();
            guard.as_mut_slice()[0] = 0xAB;
            assert_eq!(host.outstanding_locks(), 1);
        }
        assert_eq!(host.outstanding_locks(), 0);

        let first = buffer.lock().unwrap();
        let nested = buffer.lock().unwrap();
        assert_eq!(first.as_slice()[0], 0xAB);
        assert_eq!(host.outstanding_locks(), 2);
        drop(nested);
        drop(first);
        assert_eq!(host.outstanding_locks(), 0);
    }

    #[test]
    fn test_load_short_read() {
        let (_host, domain) = host_domain();
        let mut buffer = SharedBuffer::create(&domain, 16).unwrap();
        let mut source: &[u8] = &[1, 2, 3, 4];
        let err = buffer.load(&mut source, 8).unwrap_err();
        assert_eq!(
            err,
            PipelineError::ShortRead {
                expected: 8,
                actual: 4
            }
        );
    }

    #[test]
    fn test_load_copies_bytes() {
        let (_host, domain) = host_domain();
        let mut buffer = SharedBuffer::create(&domain, 8).unwrap();
        let mut source: &[u8] = &[9, 8, 7, 6, 5, 4, 3, 2, 1];
        buffer.load(&mut source, 8).unwrap();
        let guard = buffer.lock().unwrap();
        assert_eq!(guard.as_slice(), &[9, 8, 7, 6, 5, 4, 3, 2]);
    }

    #[test]
    fn test_destroy_frees_allocation() {
        let (host, domain) = host_domain();
        let buffer = SharedBuffer::create(&domain, 4096).unwrap();
        assert_eq!(host.allocation_count(), 1);
        buffer.destroy();
        assert_eq!(host.allocation_count(), 0);
    }
}
