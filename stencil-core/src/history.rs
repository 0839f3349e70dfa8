//! Bounded undo/redo buffer.

use std::collections::VecDeque;

/// Number of snapshots kept by default.
pub const DEFAULT_CAPACITY: usize = 50;

/// Flat snapshot history with a current-position pointer.
///
/// Pushing after an undo discards the forward branch. When the buffer is
/// full the oldest snapshot is evicted.
#[derive(Debug, Clone)]
pub struct History<T: Clone> {
    entries: VecDeque<T>,
    index: usize,
    capacity: usize,
}

impl<T: Clone> History<T> {
    /// Seed the history with one initial snapshot.
    pub fn new(initial: T, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries = VecDeque::with_capacity(capacity);
        entries.push_back(initial);
        Self {
            entries,
            index: 0,
            capacity,
        }
    }

    pub fn with_default_capacity(initial: T) -> Self {
        Self::new(initial, DEFAULT_CAPACITY)
    }

    pub fn push(&mut self, snapshot: T) {
        self.entries.truncate(self.index + 1);
        self.entries.push_back(snapshot);
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.index = self.entries.len() - 1;
    }

    /// Step back one snapshot. `None` at the oldest entry.
    pub fn undo(&mut self) -> Option<&T> {
        if !self.can_undo() {
            return None;
        }
        self.index -= 1;
        self.entries.get(self.index)
    }

    /// Step forward one snapshot. `None` at the newest entry.
    pub fn redo(&mut self) -> Option<&T> {
        if !self.can_redo() {
            return None;
        }
        self.index += 1;
        self.entries.get(self.index)
    }

    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.index + 1 < self.entries.len()
    }

    pub fn current(&self) -> Option<&T> {
        self.entries.get(self.index)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything and reseed.
    pub fn reset(&mut self, initial: T) {
        self.entries.clear();
        self.entries.push_back(initial);
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_keeps_most_recent() {
        let mut history = History::new(0, DEFAULT_CAPACITY);
        for i in 1..=60 {
            history.push(i);
        }

        assert_eq!(history.len(), 50);
        assert_eq!(history.index(), 49);
        assert_eq!(history.current(), Some(&60));

        // Oldest surviving snapshot is 11.
        while history.undo().is_some() {}
        assert_eq!(history.current(), Some(&11));
        assert_eq!(history.index(), 0);
    }

    #[test]
    fn test_undo_redo_bounds() {
        let mut history = History::new("a", 10);
        assert!(history.undo().is_none());
        assert!(history.redo().is_none());

        history.push("b");
        assert_eq!(history.undo(), Some(&"a"));
        assert!(history.undo().is_none());
        assert_eq!(history.index(), 0);

        assert_eq!(history.redo(), Some(&"b"));
        assert!(history.redo().is_none());
        assert_eq!(history.index(), 1);
    }

    #[test]
    fn test_push_discards_forward_branch() {
        let mut history = History::new(1, 10);
        history.push(2);
        history.push(3);
        history.undo();
        history.undo();
        history.push(4);

        assert_eq!(history.len(), 2);
        assert!(!history.can_redo());
        assert_eq!(history.undo(), Some(&1));
        assert_eq!(history.redo(), Some(&4));
    }

    #[test]
    fn test_reset() {
        let mut history = History::new(1, 10);
        history.push(2);
        history.reset(7);
        assert_eq!(history.len(), 1);
        assert_eq!(history.current(), Some(&7));
        assert!(!history.can_undo());
    }
}
