//! Snapshot history with an undo/redo cursor.
//!
//! Entries are whole machine states. Pushing and rewinding stay O(1) in
//! practice because states structurally share memory pages, the access log
//! tail, and input tokens behind `Arc`; a history slot costs a handful of
//! pointer bumps, not a deep copy.

/// A linear past with a movable cursor. New pushes truncate any redo tail.
#[derive(Debug, Clone)]
pub struct History<T> {
    entries: Vec<T>,
    /// Index of the current entry; meaningful only while non-empty.
    cursor: usize,
    limit: Option<usize>,
}

impl<T> History<T> {
    /// `limit` caps retained entries; `None` keeps everything. A cap of
    /// zero is treated as one, since the current entry must survive.
    pub fn new(limit: Option<usize>) -> Self {
        History {
            entries: Vec::new(),
            cursor: 0,
            limit,
        }
    }

    /// Makes `entry` the new present, discarding anything ahead of the
    /// cursor and evicting the oldest entries past the cap.
    pub fn push(&mut self, entry: T) {
        if !self.entries.is_empty() {
            self.entries.truncate(self.cursor + 1);
        }
        self.entries.push(entry);
        self.cursor = self.entries.len() - 1;

        if let Some(limit) = self.limit {
            let limit = limit.max(1);
            if self.entries.len() > limit {
                let excess = self.entries.len() - limit;
                self.entries.drain(..excess);
                self.cursor -= excess;
            }
        }
    }

    /// Moves the cursor one entry back. At the oldest entry this is a
    /// no-op returning `None`.
    pub fn undo(&mut self) -> Option<&T> {
        if self.entries.is_empty() || self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor)
    }

    /// Moves the cursor one entry forward. At the newest entry this is a
    /// no-op returning `None`.
    pub fn redo(&mut self) -> Option<&T> {
        if self.entries.is_empty() || self.cursor + 1 >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        self.entries.get(self.cursor)
    }

    pub fn current(&self) -> Option<&T> {
        self.entries.get(self.cursor)
    }

    pub fn can_undo(&self) -> bool {
        !self.entries.is_empty() && self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        !self.entries.is_empty() && self.cursor + 1 < self.entries.len()
    }

    /// Cursor position from the oldest retained entry.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
