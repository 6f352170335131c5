//! SSTable (Sorted String Table) - immutable on-disk sorted files.
//!
//! Each SSTable is one file:
//! - Data blocks: sorted entries, cut at roughly `BLOCK_SIZE` bytes
//! - Index: first key, offset and length of every block
//! - Footer: index offset/length, entry count, seq range, magic

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::varint::{decode_varint, encode_varint};

use super::types::{Entry, Key, SeqNum};

const BLOCK_SIZE: usize = 4096;
const FOOTER_SIZE: usize = 48;
const SSTABLE_MAGIC: u64 = 0x4e45_4d4f_5353_5401;

/// Metadata for an SSTable, read from its index and footer.
#[derive(Clone, Debug)]
pub struct SSTableMeta {
    pub id: u64,
    pub entry_count: u64,
    pub min_key: Key,
    pub max_key: Key,
    pub min_seq: SeqNum,
    pub max_seq: SeqNum,
    pub file_size: u64,
}

#[derive(Clone, Debug)]
struct BlockHandle {
    first_key: Key,
    offset: u64,
    len: u64,
}

/// Writer for creating an SSTable. Entries must arrive in `Entry` order.
pub struct SSTableWriter {
    id: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    block: Vec<u8>,
    block_first_key: Option<Key>,
    index: Vec<BlockHandle>,
    offset: u64,
    entry_count: u64,
    min_key: Option<Key>,
    max_key: Option<Key>,
    min_seq: SeqNum,
    max_seq: SeqNum,
}

impl SSTableWriter {
    pub fn create(path: impl AsRef<Path>, id: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;

        Ok(Self {
            id,
            path: path.as_ref().to_path_buf(),
            writer: BufWriter::new(file),
            block: Vec::with_capacity(BLOCK_SIZE),
            block_first_key: None,
            index: Vec::new(),
            offset: 0,
            entry_count: 0,
            min_key: None,
            max_key: None,
            min_seq: SeqNum::MAX,
            max_seq: 0,
        })
    }

    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        if self.block_first_key.is_none() {
            self.block_first_key = Some(entry.key.clone());
        }
        entry.write_to(&mut self.block)?;

        self.entry_count += 1;
        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.max_key = Some(entry.key.clone());
        self.min_seq = self.min_seq.min(entry.seq_num);
        self.max_seq = self.max_seq.max(entry.seq_num);

        if self.block.len() >= BLOCK_SIZE {
            self.finish_block()?;
        }
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn finish_block(&mut self) -> Result<()> {
        let Some(first_key) = self.block_first_key.take() else {
            return Ok(());
        };
        self.writer.write_all(&self.block)?;
        self.index.push(BlockHandle {
            first_key,
            offset: self.offset,
            len: self.block.len() as u64,
        });
        self.offset += self.block.len() as u64;
        self.block.clear();
        Ok(())
    }

    /// Write index and footer, fsync, and return the path of the table.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.finish_block()?;

        let min_key = self.min_key.take().unwrap_or_else(|| Key(Vec::new()));
        let max_key = self.max_key.take().unwrap_or_else(|| Key(Vec::new()));

        let mut index = Vec::new();
        write_bytes(&mut index, min_key.as_bytes())?;
        write_bytes(&mut index, max_key.as_bytes())?;
        encode_varint(self.index.len() as u64, &mut index)?;
        for handle in &self.index {
            write_bytes(&mut index, handle.first_key.as_bytes())?;
            encode_varint(handle.offset, &mut index)?;
            encode_varint(handle.len, &mut index)?;
        }
        self.writer.write_all(&index)?;

        let min_seq = if self.min_seq == SeqNum::MAX { 0 } else { self.min_seq };
        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        footer.extend_from_slice(&self.offset.to_le_bytes());
        footer.extend_from_slice(&(index.len() as u64).to_le_bytes());
        footer.extend_from_slice(&self.entry_count.to_le_bytes());
        footer.extend_from_slice(&min_seq.to_le_bytes());
        footer.extend_from_slice(&self.max_seq.to_le_bytes());
        footer.extend_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        self.writer.write_all(&footer)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        tracing::debug!(id = self.id, entries = self.entry_count, "sstable written");
        Ok(self.path)
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    encode_varint(bytes.len() as u64, out)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_bytes<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    let (len, used) = decode_varint(&data[*offset..])?;
    *offset += used;
    let end = offset
        .checked_add(len as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::corruption("sstable index truncated"))?;
    let bytes = &data[*offset..end];
    *offset = end;
    Ok(bytes)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Reader for an SSTable. Keeps its file open, so a reader stays usable
/// after the file is unlinked by compaction.
pub struct SSTableReader {
    file: File,
    path: PathBuf,
    index: Vec<BlockHandle>,
    pub meta: SSTableMeta,
}

impl SSTableReader {
    pub fn open(path: impl AsRef<Path>, id: u64) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::corruption(format!("sstable {} too small", id)));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, file_size - FOOTER_SIZE as u64)?;
        if read_u64(&footer, 40) != SSTABLE_MAGIC {
            return Err(Error::corruption(format!("sstable {} has a bad magic number", id)));
        }
        let index_offset = read_u64(&footer, 0);
        let index_len = read_u64(&footer, 8);
        let expected_size = index_offset
            .checked_add(index_len)
            .and_then(|n| n.checked_add(FOOTER_SIZE as u64));
        if expected_size != Some(file_size) {
            return Err(Error::corruption(format!("sstable {} footer is inconsistent", id)));
        }

        let mut raw = vec![0u8; index_len as usize];
        file.read_exact_at(&mut raw, index_offset)?;

        let mut pos = 0;
        let min_key = Key::from_slice(read_bytes(&raw, &mut pos)?);
        let max_key = Key::from_slice(read_bytes(&raw, &mut pos)?);
        let (block_count, used) = decode_varint(&raw[pos..])?;
        pos += used;

        let mut index = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            let first_key = Key::from_slice(read_bytes(&raw, &mut pos)?);
            let (offset, used) = decode_varint(&raw[pos..])?;
            pos += used;
            let (len, used) = decode_varint(&raw[pos..])?;
            pos += used;
            index.push(BlockHandle { first_key, offset, len });
        }

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            index,
            meta: SSTableMeta {
                id,
                entry_count: read_u64(&footer, 16),
                min_key,
                max_key,
                min_seq: read_u64(&footer, 24),
                max_seq: read_u64(&footer, 32),
                file_size,
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a key might be in this SSTable (based on key range).
    pub fn might_contain(&self, key: &Key) -> bool {
        self.meta.entry_count > 0 && key >= &self.meta.min_key && key <= &self.meta.max_key
    }

    fn read_block(&self, handle: &BlockHandle) -> Result<Vec<Entry>> {
        let mut data = vec![0u8; handle.len as usize];
        self.file.read_exact_at(&mut data, handle.offset)?;

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (entry, used) = Entry::read_from(&data[offset..])?;
            offset += used;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Get all entries for a key visible at `snapshot`, newest first.
    pub fn get(&self, key: &Key, snapshot: SeqNum) -> Result<Vec<Entry>> {
        if !self.might_contain(key) {
            return Ok(vec![]);
        }

        // Entries for one key may straddle blocks, so start at the last
        // block whose first key is strictly smaller than the target.
        let start = self
            .index
            .partition_point(|h| &h.first_key < key)
            .saturating_sub(1);

        let mut results = Vec::new();
        for handle in &self.index[start..] {
            if &handle.first_key > key {
                break;
            }
            for entry in self.read_block(handle)? {
                match entry.key.cmp(key) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => {
                        if entry.seq_num <= snapshot {
                            results.push(entry);
                        }
                    }
                    std::cmp::Ordering::Greater => return Ok(results),
                }
            }
        }

        Ok(results)
    }

    /// Iterate over all entries, loading one block at a time.
    pub fn iter(self: &Arc<Self>) -> SSTableIterator {
        SSTableIterator {
            table: Arc::clone(self),
            next_block: 0,
            buffered: Vec::new().into_iter(),
        }
    }
}

/// Iterator over SSTable entries.
pub struct SSTableIterator {
    table: Arc<SSTableReader>,
    next_block: usize,
    buffered: std::vec::IntoIter<Entry>,
}

impl Iterator for SSTableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.next() {
                return Some(Ok(entry));
            }
            let handle = self.table.index.get(self.next_block)?;
            self.next_block += 1;
            match self.table.read_block(handle) {
                Ok(entries) => self.buffered = entries.into_iter(),
                Err(e) => {
                    self.next_block = self.table.index.len();
                    return Some(Err(e));
                }
            }
        }
    }
}
