use std::collections::VecDeque;

/// A rolling window that keeps at most `capacity` elements, dropping the
/// oldest one when a new element would exceed it.
#[derive(Debug, Clone)]
pub struct Window<T> {
    data: VecDeque<T>,
    capacity: usize,
}

impl<T> Window<T> {
    /// Create a new window with the given capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an element to the window, removing the oldest if at capacity
    pub fn push(&mut self, item: T) {
        if self.data.len() >= self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(item);
    }

    /// Drop elements from the front while `expired` holds for them
    pub fn drain_while(&mut self, mut expired: impl FnMut(&T) -> bool) {
        while self.data.front().is_some_and(&mut expired) {
            self.data.pop_front();
        }
    }

    /// The oldest element
    #[must_use]
    pub fn oldest(&self) -> Option<&T> {
        self.data.front()
    }

    /// Check whether another push would evict an element
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    /// Get the number of elements currently in the window
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the window is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get an iterator over the elements in the window, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }
}
