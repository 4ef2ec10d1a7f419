//! Write flow control for a single stream
//!
//! A transport accepts only one outstanding write per stream. [`BufferedWriter`]
//! turns an arbitrary burst of writes into that discipline: it executes a write
//! right away when none is active, queues it otherwise, and starts the next
//! queued write each time the owner reports that the active one completed.
//!
//! The writer has no notion of failure or retry. Whether a completed write
//! succeeded is for the owner to decide, before or after advancing the queue.
use std::collections::VecDeque;

/// FIFO of pending writes with at most one write active at a time.
///
/// Writes become active in exactly the order they were enqueued. The writer
/// owns a queued write until it becomes active, then hands it by value to the
/// `execute` function given by the caller.
#[derive(Debug)]
pub struct BufferedWriter<W> {
    queue: VecDeque<W>,
    has_active_write: bool,
}

impl<W> Default for BufferedWriter<W> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            has_active_write: false,
        }
    }
}

impl<W> BufferedWriter<W> {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a write.
    ///
    /// If no write is active, `write` becomes active and is passed to
    /// `execute` before this returns. Otherwise it waits in the queue.
    pub fn enqueue_write(&mut self, write: W, execute: impl FnOnce(W)) {
        self.queue.push_back(write);
        self.try_start_write(execute);
    }

    /// Advance after the active write completed, successfully or not.
    ///
    /// Starts the next queued write, if any. With nothing active and nothing
    /// queued this is a no-op, so extra calls are harmless.
    pub fn dequeue_next_write(&mut self, execute: impl FnOnce(W)) {
        self.has_active_write = false;
        self.try_start_write(execute);
    }

    /// Drop every queued write and forget the active one.
    ///
    /// Returns the number of writes that were still queued.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        self.has_active_write = false;
        n
    }

    /// True if no write is waiting in the queue
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of writes waiting in the queue
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if a write is currently active
    pub fn has_active_write(&self) -> bool {
        self.has_active_write
    }

    fn try_start_write(&mut self, execute: impl FnOnce(W)) {
        if self.has_active_write {
            return;
        }
        if let Some(write) = self.queue.pop_front() {
            self.has_active_write = true;
            execute(write);
        }
    }
}
