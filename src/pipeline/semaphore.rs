// SPDX-License-Identifier: GPL-3.0-only

//! Completion signalling between stage callbacks and the coordinator
//!
//! Every queue shares one counting semaphore. A push posts it, so the
//! coordinator can sleep on a single primitive and then drain all queues.

use crossbeam_channel::{Receiver, Sender, TryIter, unbounded};
use std::time::Duration;

/// Counting semaphore; each `post` satisfies one `wait_timeout`
#[derive(Debug, Clone)]
pub struct CompletionSemaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl CompletionSemaphore {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn post(&self) {
        // Cannot disconnect: self holds both ends
        let _ = self.tx.send(());
    }

    /// Take one count, waiting up to `timeout`; false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Counts currently available
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for CompletionSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of a hand-off queue
#[derive(Debug)]
pub struct CompletionQueue<T> {
    tx: Sender<T>,
    semaphore: CompletionSemaphore,
}

impl<T> Clone for CompletionQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            semaphore: self.semaphore.clone(),
        }
    }
}

impl<T> CompletionQueue<T> {
    /// Queue `item` and wake the coordinator.
    ///
    /// Gives the item back if the coordinator is gone.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.tx.send(item).map_err(|e| e.into_inner())?;
        self.semaphore.post();
        Ok(())
    }
}

/// Consumer side of a hand-off queue
#[derive(Debug)]
pub struct CompletionReceiver<T> {
    rx: Receiver<T>,
}

impl<T> CompletionReceiver<T> {
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now
    pub fn drain(&self) -> TryIter<'_, T> {
        self.rx.try_iter()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a hand-off queue that posts `semaphore` on every push
pub fn completion_queue<T>(
    semaphore: &CompletionSemaphore,
) -> (CompletionQueue<T>, CompletionReceiver<T>) {
    let (tx, rx) = unbounded();
    (
        CompletionQueue {
            tx,
            semaphore: semaphore.clone(),
        },
        CompletionReceiver { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out_without_post() {
        let semaphore = CompletionSemaphore::new();
        assert!(!semaphore.wait_timeout(Duration::from_millis(10)));
        semaphore.post();
        semaphore.post();
        assert_eq!(semaphore.pending(), 2);
        assert!(semaphore.wait_timeout(Duration::from_millis(10)));
        assert!(semaphore.wait_timeout(Duration::from_millis(10)));
        assert!(!semaphore.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_push_from_another_thread_wakes_waiter() {
        let semaphore = CompletionSemaphore::new();
        let (queue, receiver) = completion_queue::<u32>(&semaphore);
        let producer = thread::spawn(move || {
            for i in 0..3 {
                queue.push(i).unwrap();
            }
        });
        assert!(semaphore.wait_timeout(Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(receiver.drain().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_push_after_receiver_dropped_returns_item() {
        let semaphore = CompletionSemaphore::new();
        let (queue, receiver) = completion_queue::<&str>(&semaphore);
        drop(receiver);
        assert_eq!(queue.push("frame"), Err("frame"));
        assert_eq!(semaphore.pending(), 0);
    }
}
