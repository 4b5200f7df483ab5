// SPDX-License-Identifier: GPL-3.0-only

//! Fixed-size buffer pools
//!
//! Every slot is in exactly one state:
//!
//! ```text
//! Free --acquire--> InFlight --mark_ready--> Ready --release--> Free
//!                      |                                  ^
//!                      +------------release---------------+
//! ```
//!
//! Buffers are allocated once when the pool is created and recycled for the
//! life of the pipeline.

use super::frame::{FrameBuffer, PoolId};
use crate::errors::{PipelineError, PipelineResult};
use crate::memory::{SharedBuffer, SharedMemory};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// In the pool, available to a producer
    Free,
    /// Held by a producer
    InFlight,
    /// Filled and queued for (or held by) a consumer
    Ready,
}

/// Slot counts by state; always sums to the pool size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub free: usize,
    pub in_flight: usize,
    pub ready: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.free + self.in_flight + self.ready
    }
}

struct PoolState {
    states: Vec<SlotState>,
    free: VecDeque<FrameBuffer>,
}

pub struct BufferPool {
    id: PoolId,
    name: &'static str,
    buffer_size: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_size` bytes from `domain`
    pub fn new(
        name: &'static str,
        domain: &Arc<dyn SharedMemory>,
        count: usize,
        buffer_size: usize,
    ) -> PipelineResult<Self> {
        if count == 0 {
            return Err(PipelineError::Pool(format!("{} pool must not be empty", name)));
        }

        let id = PoolId::next();
        let mut free = VecDeque::with_capacity(count);
        for slot in 0..count {
            let storage = SharedBuffer::create(domain, buffer_size)?;
            free.push_back(FrameBuffer::new(id, slot, storage));
        }

        debug!(pool = name, count, buffer_size, "Created buffer pool");
        Ok(Self {
            id,
            name,
            buffer_size,
            state: Mutex::new(PoolState {
                states: vec![SlotState::Free; count],
                free,
            }),
            available: Condvar::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.state().states.len()
    }

    fn take_free(&self, state: &mut PoolState) -> Option<FrameBuffer> {
        let mut frame = state.free.pop_front()?;
        state.states[frame.slot()] = SlotState::InFlight;
        frame.reset();
        Some(frame)
    }

    /// Take a free buffer without waiting
    pub fn acquire(&self) -> Option<FrameBuffer> {
        let mut state = self.state();
        self.take_free(&mut state)
    }

    /// Take a free buffer, waiting up to `timeout` for one to be released
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<FrameBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(frame) = self.take_free(&mut state) {
                return Some(frame);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            state = self
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
    }

    fn check_owner(&self, frame: &FrameBuffer) -> PipelineResult<()> {
        if frame.pool_id() != self.id {
            error!(pool = self.name, slot = frame.slot(), "Buffer belongs to another pool");
            return Err(PipelineError::Pool(format!(
                "buffer {:?} returned to {} pool",
                frame.pool_id(),
                self.name
            )));
        }
        Ok(())
    }

    /// Record that a producer filled `frame`
    pub fn mark_ready(&self, frame: &FrameBuffer) -> PipelineResult<()> {
        self.check_owner(frame)?;
        let mut state = self.state();
        match state.states[frame.slot()] {
            SlotState::InFlight => {
                state.states[frame.slot()] = SlotState::Ready;
                Ok(())
            }
            other => Err(PipelineError::Pool(format!(
                "{} slot {} marked ready from {:?}",
                self.name,
                frame.slot(),
                other
            ))),
        }
    }

    /// Return `frame` to the pool.
    ///
    /// A buffer from another pool is rejected; it is dropped and its memory
    /// released, so the error is fatal for the pipeline.
    pub fn release(&self, frame: FrameBuffer) -> PipelineResult<()> {
        self.check_owner(&frame)?;
        let mut state = self.state();
        let slot = frame.slot();
        if state.states[slot] == SlotState::Free {
            error!(pool = self.name, slot, "Double release");
            return Err(PipelineError::Pool(format!(
                "{} slot {} released twice",
                self.name, slot
            )));
        }
        state.states[slot] = SlotState::Free;
        state.free.push_back(frame);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    pub fn counts(&self) -> PoolCounts {
        let state = self.state();
        let mut counts = PoolCounts::default();
        for slot in &state.states {
            match slot {
                SlotState::Free => counts.free += 1,
                SlotState::InFlight => counts.in_flight += 1,
                SlotState::Ready => counts.ready += 1,
            }
        }
        counts
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("buffer_size", &self.buffer_size)
            .field("counts", &self.counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostMemory;
    use std::thread;

    fn domain() -> Arc<dyn SharedMemory> {
        Arc::new(HostMemory::new())
    }

    #[test]
    fn test_state_transitions() {
        let pool = BufferPool::new("test", &domain(), 2, 64).unwrap();
        let frame = pool.acquire().unwrap();
        assert_eq!(pool.counts(), PoolCounts { free: 1, in_flight: 1, ready: 0 });

        pool.mark_ready(&frame).unwrap();
        assert_eq!(pool.counts(), PoolCounts { free: 1, in_flight: 0, ready: 1 });
        assert!(pool.mark_ready(&frame).is_err(), "ready twice");

        pool.release(frame).unwrap();
        assert_eq!(pool.counts(), PoolCounts { free: 2, in_flight: 0, ready: 0 });
    }

    #[test]
    fn test_exhaustion_and_metadata_reset() {
        let pool = BufferPool::new("test", &domain(), 1, 64).unwrap();
        let mut frame = pool.acquire().unwrap();
        frame.length = 10;
        frame.timestamp = Some(5);
        assert!(pool.acquire().is_none());
        assert!(pool.acquire_timeout(Duration::from_millis(10)).is_none());

        pool.release(frame).unwrap();
        let frame = pool.acquire().unwrap();
        assert_eq!(frame.length, 0);
        assert_eq!(frame.timestamp, None);
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let domain = domain();
        let a = BufferPool::new("a", &domain, 1, 64).unwrap();
        let b = BufferPool::new("b", &domain, 1, 64).unwrap();
        let frame = a.acquire().unwrap();
        assert!(matches!(b.release(frame), Err(PipelineError::Pool(_))));
        assert_eq!(b.counts().free, 1);
    }

    #[test]
    fn test_acquire_timeout_wakes_on_release() {
        let pool = Arc::new(BufferPool::new("test", &domain(), 1, 64).unwrap());
        let frame = pool.acquire().unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)).is_some())
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(frame).unwrap();
        assert!(waiter.join().unwrap());
    }
}
