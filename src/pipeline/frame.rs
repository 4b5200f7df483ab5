// SPDX-License-Identifier: GPL-3.0-only

//! Frame buffers exchanged between stages

use crate::errors::PipelineResult;
use crate::memory::SharedBuffer;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of the pool a buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

impl PoolId {
    pub(crate) fn next() -> Self {
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Buffer flags carried from capture through to the encoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const NONE: Self = Self(0);
    /// Buffer holds a complete frame
    pub const FRAME_END: Self = Self(1 << 0);
    /// Encoded buffer starts a keyframe
    pub const KEYFRAME: Self = Self(1 << 1);
    /// Encoded buffer holds stream headers only
    pub const CODEC_CONFIG: Self = Self(1 << 2);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A pool-owned buffer plus the metadata of the frame it currently holds.
///
/// Whoever holds the value owns the buffer; handing it to another stage
/// moves it. It goes back to its pool through [`super::BufferPool::release`].
pub struct FrameBuffer {
    pool: PoolId,
    slot: usize,
    storage: SharedBuffer,
    /// Valid bytes at the start of the buffer
    pub length: usize,
    /// Presentation timestamp in microseconds
    pub timestamp: Option<u64>,
    pub flags: FrameFlags,
}

impl FrameBuffer {
    pub(crate) fn new(pool: PoolId, slot: usize, storage: SharedBuffer) -> Self {
        Self {
            pool,
            slot,
            storage,
            length: 0,
            timestamp: None,
            flags: FrameFlags::NONE,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.storage.size()
    }

    pub fn storage(&self) -> &SharedBuffer {
        &self.storage
    }

    /// Clear metadata before the buffer is reused
    pub(crate) fn reset(&mut self) {
        self.length = 0;
        self.timestamp = None;
        self.flags = FrameFlags::NONE;
    }

    /// Copy frame metadata from `other`
    pub fn copy_metadata(&mut self, other: &FrameBuffer) {
        self.timestamp = other.timestamp;
        self.flags = other.flags;
    }

    /// Run `f` over the valid bytes
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> PipelineResult<R> {
        let guard = self.storage.lock()?;
        let len = self.length.min(self.storage.size());
        Ok(f(&guard.as_slice()[..len]))
    }

    /// Run `f` over the whole buffer; it returns the new valid length
    pub fn fill(&mut self, f: impl FnOnce(&mut [u8]) -> usize) -> PipelineResult<()> {
        let mut guard = self.storage.lock_mut()?;
        let written = f(guard.as_mut_slice());
        drop(guard);
        self.length = written.min(self.storage.size());
        Ok(())
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("pool", &self.pool)
            .field("slot", &self.slot)
            .field("length", &self.length)
            .field("timestamp", &self.timestamp)
            .field("flags", &self.flags)
            .finish()
    }
}
