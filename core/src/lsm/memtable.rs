//! In-memory sorted table for fast writes.
//!
//! The MemTable stores entries sorted by (key, seq_num desc) using a BTreeMap.
//! Sequence numbers are assigned by the tree's write path, so a memtable only
//! records them. Reads take an upper bound so that a view never observes
//! entries committed after it was captured.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::{Entry, Key, Op, SeqNum};

/// Entries fetched per lock acquisition by a [`MemTableCursor`].
const CURSOR_BATCH: usize = 64;

pub struct MemTable {
    entries: BTreeMap<(Key, Reverse<SeqNum>), Op>,
    /// Current size in bytes (approximate).
    size_bytes: usize,
    /// Highest sequence number inserted.
    max_seq: SeqNum,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            size_bytes: 0,
            max_seq: 0,
        }
    }

    pub fn insert(&mut self, key: Key, seq_num: SeqNum, op: Op) {
        self.size_bytes += key.len() + op.size() + 8 + 16; // approximate overhead
        self.max_seq = self.max_seq.max(seq_num);
        self.entries.insert((key, Reverse(seq_num)), op);
    }

    /// All entries for a key visible at `snapshot`, newest first.
    pub fn get_all(&self, key: &Key, snapshot: SeqNum) -> Vec<Entry> {
        let start = (key.clone(), Reverse(snapshot));
        let end = (key.clone(), Reverse(0));

        self.entries
            .range(start..=end)
            .map(|((key, Reverse(seq)), op)| Entry {
                key: key.clone(),
                seq_num: *seq,
                op: op.clone(),
            })
            .collect()
    }

    /// Iterate over entries visible at `snapshot` in sorted order.
    pub fn iter_at(&self, snapshot: SeqNum) -> impl Iterator<Item = Entry> + '_ {
        self.entries
            .iter()
            .filter(move |((_, Reverse(seq)), _)| *seq <= snapshot)
            .map(|((key, Reverse(seq)), op)| Entry {
                key: key.clone(),
                seq_num: *seq,
                op: op.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_seq(&self) -> SeqNum {
        self.max_seq
    }
}

/// Lazy iterator over a shared memtable as of `snapshot`.
///
/// The read lock is taken only to refill a small batch, resuming after the
/// last position seen. Entries are never removed from a memtable and later
/// inserts carry higher sequence numbers, so resuming by position yields
/// the same sequence a single pass would.
pub struct MemTableCursor {
    mem: Arc<RwLock<MemTable>>,
    snapshot: SeqNum,
    resume: Option<(Key, Reverse<SeqNum>)>,
    buffer: VecDeque<Entry>,
    done: bool,
}

impl MemTableCursor {
    pub fn new(mem: Arc<RwLock<MemTable>>, snapshot: SeqNum) -> Self {
        Self {
            mem,
            snapshot,
            resume: None,
            buffer: VecDeque::with_capacity(CURSOR_BATCH),
            done: false,
        }
    }

    fn refill(&mut self) {
        let mem = self.mem.read();
        let lower = match self.resume.take() {
            Some(pos) => Bound::Excluded(pos),
            None => Bound::Unbounded,
        };

        let mut last = None;
        for (pos, op) in mem.entries.range((lower, Bound::Unbounded)) {
            last = Some(pos);
            let (key, Reverse(seq)) = pos;
            if *seq > self.snapshot {
                continue;
            }
            self.buffer.push_back(Entry {
                key: key.clone(),
                seq_num: *seq,
                op: op.clone(),
            });
            if self.buffer.len() >= CURSOR_BATCH {
                break;
            }
        }

        match last {
            Some(pos) => self.resume = Some(pos.clone()),
            None => self.done = true,
        }
    }
}

impl Iterator for MemTableCursor {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        while self.buffer.is_empty() && !self.done {
            self.refill();
        }
        self.buffer.pop_front()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}
