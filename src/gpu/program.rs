// SPDX-License-Identifier: GPL-3.0-only

//! Compute program image in shared memory
//!
//! One allocation holds the kernel code, one uniform block per unit and the
//! completion mailbox the firmware reads to start each unit.

use super::uniforms::{UniformBlock, UnitIndex};
use crate::constants::gpu::{MAX_CODE_WORDS, MAX_UNITS};
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::memory::{BufferLock, SharedBuffer, SharedMemory};
use bytemuck::{Pod, Zeroable};
use std::mem::offset_of;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-unit start record: where its uniforms and code live
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MailboxEntry {
    pub uniform_address: u32,
    pub code_address: u32,
}

/// Memory layout of the program allocation
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct ProgramImage {
    pub code: [u32; MAX_CODE_WORDS],
    pub uniforms: [UniformBlock; MAX_UNITS],
    pub mailbox: [MailboxEntry; MAX_UNITS],
}

pub struct ComputeProgram {
    buffer: SharedBuffer,
    unit_count: usize,
    code_words: usize,
}

impl ComputeProgram {
    /// Allocate a program for `unit_count` compute units (at most 12)
    pub fn create(domain: &Arc<dyn SharedMemory>, unit_count: usize) -> PipelineResult<Self> {
        if unit_count == 0 || unit_count > MAX_UNITS {
            return Err(PipelineError::setup(
                Stage::Remap,
                format!("unit count {} must be between 1 and {}", unit_count, MAX_UNITS),
            ));
        }

        let buffer = SharedBuffer::create(domain, std::mem::size_of::<ProgramImage>())?;
        debug!(
            unit_count,
            base = format_args!("{:#010x}", buffer.device_address()),
            "Created compute program"
        );
        Ok(Self {
            buffer,
            unit_count,
            code_words: 0,
        })
    }

    /// Copy a little-endian kernel image into the code area
    pub fn load_kernel(&mut self, code: &[u8]) -> PipelineResult<()> {
        if code.is_empty() || code.len() % 4 != 0 {
            return Err(PipelineError::setup(
                Stage::Remap,
                format!("kernel image of {} bytes is not whole instructions", code.len()),
            ));
        }
        let words = code.len() / 4;
        if words > MAX_CODE_WORDS {
            return Err(PipelineError::setup(
                Stage::Remap,
                format!("kernel of {} words exceeds {} word capacity", words, MAX_CODE_WORDS),
            ));
        }

        self.with_image(|image| {
            for (dst, src) in image.code.iter_mut().zip(code.chunks_exact(4)) {
                *dst = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            }
        })?;
        self.code_words = words;
        info!(words, "Loaded compute kernel");
        Ok(())
    }

    /// Run `f` on the CPU view of the image under a write lock
    pub fn with_image<R>(&mut self, f: impl FnOnce(&mut ProgramImage) -> R) -> PipelineResult<R> {
        let mut guard = self.buffer.lock_mut()?;
        let image = bytemuck::try_from_bytes_mut::<ProgramImage>(guard.as_mut_slice())
            .map_err(|e| PipelineError::setup(Stage::Remap, format!("program layout: {}", e)))?;
        Ok(f(image))
    }

    /// Keep the image mapped while the device runs it
    pub fn pin(&self) -> PipelineResult<BufferLock<'_>> {
        self.buffer.lock()
    }

    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    /// Loaded kernel length in words (0 before `load_kernel`)
    pub fn code_words(&self) -> usize {
        self.code_words
    }

    pub fn code_address(&self) -> u32 {
        self.buffer.device_address() + offset_of!(ProgramImage, code) as u32
    }

    pub fn uniform_address(&self, unit: UnitIndex) -> u32 {
        self.buffer.device_address()
            + offset_of!(ProgramImage, uniforms) as u32
            + (unit.get() * UniformBlock::SIZE) as u32
    }

    pub fn mailbox_address(&self) -> u32 {
        self.buffer.device_address() + offset_of!(ProgramImage, mailbox) as u32
    }
}

impl std::fmt::Debug for ComputeProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeProgram")
            .field("buffer", &self.buffer)
            .field("unit_count", &self.unit_count)
            .field("code_words", &self.code_words)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostMemory;

    fn program(units: usize) -> (Arc<HostMemory>, ComputeProgram) {
        let host = Arc::new(HostMemory::new());
        let domain: Arc<dyn SharedMemory> = host.clone();
        let program = ComputeProgram::create(&domain, units).unwrap();
        (host, program)
    }

    #[test]
    fn test_image_layout() {
        assert_eq!(offset_of!(ProgramImage, code), 0);
        assert_eq!(offset_of!(ProgramImage, uniforms), 0x80000);
        assert_eq!(offset_of!(ProgramImage, mailbox), 0x80300);
        assert_eq!(std::mem::size_of::<ProgramImage>(), 0x80360);
    }

    #[test]
    fn test_addresses_follow_layout() {
        let (_host, program) = program(12);
        let base = program.code_address();
        assert_eq!(program.uniform_address(UnitIndex::new(0, 12).unwrap()), base + 0x80000);
        assert_eq!(program.uniform_address(UnitIndex::new(11, 12).unwrap()), base + 0x802C0);
        assert_eq!(program.mailbox_address(), base + 0x80300);
    }

    #[test]
    fn test_load_kernel_writes_words() {
        let (host, mut program) = program(4);
        program
            .load_kernel(&[0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB, 0xCC, 0xDD])
            .unwrap();
        assert_eq!(program.code_words(), 2);
        let words = host.read_words(program.code_address(), 2).unwrap();
        assert_eq!(words, vec![0x0403_0201, 0xDDCC_BBAA]);
        assert_eq!(host.outstanding_locks(), 0);
    }

    #[test]
    fn test_load_kernel_rejects_partial_words() {
        let (_host, mut program) = program(4);
        assert!(program.load_kernel(&[1, 2, 3]).is_err());
        assert!(program.load_kernel(&[]).is_err());
        let oversized = vec![0u8; (MAX_CODE_WORDS + 1) * 4];
        assert!(program.load_kernel(&oversized).is_err());
    }

    #[test]
    fn test_unit_count_limits() {
        let domain: Arc<dyn SharedMemory> = Arc::new(HostMemory::new());
        assert!(ComputeProgram::create(&domain, 0).is_err());
        assert!(ComputeProgram::create(&domain, 13).is_err());
    }
}
