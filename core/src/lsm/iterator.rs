//! Merge iterator for combining multiple sorted sources.
//!
//! Used for range scans and compaction that need to merge results from
//! memtables and SSTables.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;

use super::merge::{resolve, MergeFn};
use super::types::{Entry, Key};

/// A wrapper for entries that implements reverse ordering for the min-heap.
struct HeapEntry {
    entry: Entry,
    source_idx: usize,
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior
        // First compare by key (ascending), then by seq_num (descending)
        match other.entry.key.cmp(&self.entry.key) {
            Ordering::Equal => self.entry.seq_num.cmp(&other.entry.seq_num),
            ord => ord,
        }
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merge iterator that combines multiple sorted iterators.
///
/// For duplicate keys, entries are returned in seq_num descending order
/// (newest first). A source error is yielded once and ends that source.
pub struct MergeIterator<I> {
    sources: Vec<I>,
    heap: BinaryHeap<HeapEntry>,
    pending_error: Option<crate::error::Error>,
    initialized: bool,
}

impl<I> MergeIterator<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    pub fn new(sources: Vec<I>) -> Self {
        Self {
            sources,
            heap: BinaryHeap::new(),
            pending_error: None,
            initialized: false,
        }
    }

    fn pull(&mut self, idx: usize) {
        match self.sources[idx].next() {
            Some(Ok(entry)) => self.heap.push(HeapEntry { entry, source_idx: idx }),
            Some(Err(e)) => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(e);
                }
            }
            None => {}
        }
    }

    fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        // Prime the heap with one entry from each source
        for idx in 0..self.sources.len() {
            self.pull(idx);
        }
    }
}

impl<I> Iterator for MergeIterator<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.initialize();

        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }

        let heap_entry = self.heap.pop()?;
        // Replenish from the same source
        self.pull(heap_entry.source_idx);
        Some(Ok(heap_entry.entry))
    }
}

/// Groups a merged stream by key, yielding each key with its chain of
/// entries (newest first).
pub struct KeyChainIterator<I> {
    inner: I,
    peeked: Option<Entry>,
}

impl<I> KeyChainIterator<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    pub fn new(inner: I) -> Self {
        Self { inner, peeked: None }
    }
}

impl<I> Iterator for KeyChainIterator<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    type Item = Result<(Key, Vec<Entry>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.peeked.take() {
            Some(entry) => entry,
            None => match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            },
        };

        let key = first.key.clone();
        let mut chain = vec![first];
        loop {
            match self.inner.next() {
                Some(Ok(entry)) if entry.key == key => chain.push(entry),
                Some(Ok(entry)) => {
                    self.peeked = Some(entry);
                    break;
                }
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        Some(Ok((key, chain)))
    }
}

/// Iterator adapter that resolves each key to its current value, skipping
/// deleted keys.
pub struct LiveEntriesIterator<I> {
    chains: KeyChainIterator<I>,
    merge: Option<MergeFn>,
}

impl<I> LiveEntriesIterator<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    pub fn new(inner: I, merge: Option<MergeFn>) -> Self {
        Self {
            chains: KeyChainIterator::new(inner),
            merge,
        }
    }
}

impl<I> Iterator for LiveEntriesIterator<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, chain) = match self.chains.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };
            match resolve(key.as_bytes(), &chain, self.merge.as_ref()) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
