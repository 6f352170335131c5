//! LSM Tree key-value store with merge operands and compaction filters.
//!
//! Architecture:
//! - MemTable: In-memory sorted structure for fast writes
//! - SSTable: Immutable on-disk sorted files
//! - WAL: Write-ahead log for durability, one atomic record per batch
//! - MANIFEST: The set of live SSTables
//! - Compaction: Full merges, run on demand or in the background

mod types;
mod memtable;
mod sstable;
mod wal;
mod iterator;
mod merge;
mod manifest;
mod compaction;
mod view;
mod lsm;

pub use types::{BatchOp, Entry, FilterDecision, Key, Op, SeqNum};
pub use memtable::MemTable;
pub use sstable::{SSTableMeta, SSTableReader, SSTableWriter};
pub use iterator::{KeyChainIterator, LiveEntriesIterator, MergeIterator};
pub use merge::{resolve, MergeFn};
pub use manifest::{sync_dir, table_file_name, wal_file_name, Manifest, MANIFEST_FILE};
pub use compaction::{CompactionContext, CompactionFilter, CompactionFilterFactory, CompactionStats};
pub use view::{EntrySource, ReadView};
pub use lsm::{LiveFile, LiveFiles, LsmConfig, LsmStats, LsmTree};
