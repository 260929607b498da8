//! Append-only, rank-ordered record of load/store operations.
//!
//! The log is a persistent cons list: appending is O(1) and every machine
//! state shares the tail of its predecessor, so keeping a log per state
//! costs one node per access. Queries scan the whole log; it stays small
//! at interactive scale and an index would complicate the structural
//! sharing.

use std::sync::Arc;

use super::{refs_overlap, Reference};

/// Whether a log entry records a read or a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load,
    Store,
}

/// One logged access. Ranks are positions in a strictly increasing global
/// sequence, reset only at program start and never reused. Store entries
/// keep the bytes they overwrote so the pre-store image of any overlapping
/// range can be reconstructed.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub kind: AccessKind,
    pub reference: Reference,
    pub rank: u64,
    pub overwritten: Option<Arc<[u8]>>,
}

#[derive(Debug)]
struct Node {
    entry: LogEntry,
    prev: Option<Arc<Node>>,
}

/// Ranks a queried reference was touched at: the smallest overlapping load
/// rank and the largest overlapping store rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessSummary {
    pub load_rank: Option<u64>,
    pub store_rank: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    head: Option<Arc<Node>>,
    next_rank: u64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all entries and restart the rank sequence.
    pub fn clear(&mut self) {
        unwind(self.head.take());
        self.next_rank = 0;
    }

    /// Append one entry, returning its rank.
    pub fn append(
        &mut self,
        kind: AccessKind,
        reference: Reference,
        overwritten: Option<Vec<u8>>,
    ) -> u64 {
        let rank = self.next_rank;
        self.next_rank += 1;
        self.head = Some(Arc::new(Node {
            entry: LogEntry {
                kind,
                reference,
                rank,
                overwritten: overwritten.map(Arc::from),
            },
            prev: self.head.take(),
        }));
        rank
    }

    /// Number of entries appended since the last clear.
    pub fn len(&self) -> u64 {
        self.next_rank
    }

    pub fn is_empty(&self) -> bool {
        self.next_rank == 0
    }

    /// Entries newest-first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            node: self.head.as_deref(),
        }
    }

    /// Scan the full log for accesses overlapping `reference`.
    pub fn query(&self, reference: &Reference) -> AccessSummary {
        let mut summary = AccessSummary::default();
        for entry in self.iter() {
            if !refs_overlap(&entry.reference, reference) {
                continue;
            }
            match entry.kind {
                AccessKind::Load => {
                    // Walking newest-first, the final match is the smallest.
                    summary.load_rank = Some(entry.rank);
                }
                AccessKind::Store => {
                    if summary.store_rank.is_none() {
                        summary.store_rank = Some(entry.rank);
                    }
                }
            }
        }
        summary
    }

    /// The most recent store entry overlapping `reference`, if any.
    pub fn newest_store_over(&self, reference: &Reference) -> Option<&LogEntry> {
        self.iter().find(|entry| {
            entry.kind == AccessKind::Store && refs_overlap(&entry.reference, reference)
        })
    }
}

impl Drop for MemoryLog {
    fn drop(&mut self) {
        unwind(self.head.take());
    }
}

// Releasing a chain node by node recurses once per entry and overflows
// the stack on long runs. Unwind iteratively instead, stopping at the
// first node some other clone still holds.
fn unwind(mut head: Option<Arc<Node>>) {
    while let Some(node) = head {
        match Arc::try_unwrap(node) {
            Ok(mut node) => head = node.prev.take(),
            Err(_) => break,
        }
    }
}

pub struct Iter<'a> {
    node: Option<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a LogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node?;
        self.node = node.prev.as_deref();
        Some(&node.entry)
    }
}
