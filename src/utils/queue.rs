//! FIFO queue of pending acquisitions
use alloc::collections::VecDeque;

/// An ordered sequence of pending acquisition requests.
///
/// Entries leave in exactly the order they arrived. There is no removal from
/// the middle: an abandoned entry stays in place and is discarded by whoever
/// dequeues it.
#[derive(Debug)]
pub struct WaiterQueue<T> {
    entries: VecDeque<T>,
}

impl<T> WaiterQueue<T> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append an entry at the tail.
    #[inline]
    pub fn enqueue(&mut self, entry: T) {
        self.entries.push_back(entry);
    }

    /// Remove the entry at the head.
    #[inline]
    pub fn dequeue(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for WaiterQueue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
