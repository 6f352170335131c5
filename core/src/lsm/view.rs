//! Point-in-time read views.
//!
//! A view pins a sequence number together with the memtables and SSTables
//! that were current when it was captured. Memtables only ever gain entries
//! with higher sequence numbers and SSTables are immutable, so reads through
//! a view stay consistent while writes, flushes and compactions carry on.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

use super::iterator::{LiveEntriesIterator, MergeIterator};
use super::memtable::{MemTable, MemTableCursor};
use super::merge::{resolve, MergeFn};
use super::sstable::SSTableReader;
use super::types::{Entry, Key, Op, SeqNum};

pub type EntrySource = Box<dyn Iterator<Item = Result<Entry>> + Send>;

#[derive(Clone)]
pub struct ReadView {
    pub(crate) seq: SeqNum,
    /// Active memtable first, then the one being flushed.
    pub(crate) mems: Vec<Arc<RwLock<MemTable>>>,
    /// Newest first.
    pub(crate) tables: Vec<Arc<SSTableReader>>,
    pub(crate) merge: Option<MergeFn>,
}

fn chain_complete(chain: &[Entry]) -> bool {
    chain.last().is_some_and(|e| !matches!(e.op, Op::Merge(_)))
}

impl ReadView {
    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    /// Current value of `key` as of this view.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = Key::from_slice(key);
        let mut chain = Vec::new();

        for mem in &self.mems {
            chain.extend(mem.read().get_all(&key, self.seq));
            if chain_complete(&chain) {
                return resolve(key.as_bytes(), &chain, self.merge.as_ref());
            }
        }

        for table in &self.tables {
            chain.extend(table.get(&key, self.seq)?);
            if chain_complete(&chain) {
                break;
            }
        }

        resolve(key.as_bytes(), &chain, self.merge.as_ref())
    }

    /// All raw entries visible in this view, merged in `Entry` order.
    pub fn scan_raw(&self) -> MergeIterator<EntrySource> {
        let seq = self.seq;
        let mut sources: Vec<EntrySource> = Vec::new();

        for mem in &self.mems {
            sources.push(Box::new(MemTableCursor::new(Arc::clone(mem), seq).map(Ok)));
        }

        for table in &self.tables {
            let iter = table
                .iter()
                .filter(move |r| r.as_ref().map_or(true, |e| e.seq_num <= seq));
            sources.push(Box::new(iter));
        }

        MergeIterator::new(sources)
    }

    /// Live keys with their current values, in key order.
    pub fn scan(&self) -> LiveEntriesIterator<MergeIterator<EntrySource>> {
        LiveEntriesIterator::new(self.scan_raw(), self.merge.clone())
    }
}
