//! Write-Ahead Log (WAL) for durability.
//!
//! The log is split into numbered segments. Every write batch is appended as
//! one record and applied to the memtable only after the append succeeds. On
//! recovery the segments are replayed in order; a record cut short by a crash
//! is discarded whole, which keeps batches atomic.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::error::{Error, Result};

use super::types::{BatchOp, Entry, SeqNum};

const WAL_BATCH: u8 = 1;
const HEADER_LEN: usize = 17;

/// Active WAL segment.
///
/// A record is assembled in memory and appended with a single write, so no
/// bytes of a failed batch stay buffered for a later append to carry out.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Bytes of whole records on disk, i.e. the size a copy may truncate to.
    len: u64,
    /// Set when a failed append could not be cut back off the file.
    poisoned: bool,
    #[cfg(test)]
    fail_next_after: Option<usize>,
}

impl Wal {
    /// Create or open a WAL segment for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            len,
            poisoned: false,
            #[cfg(test)]
            fail_next_after: None,
        })
    }

    /// Append a batch whose entries take sequence numbers from `first_seq`.
    ///
    /// On failure the segment is truncated back to its last whole record.
    pub fn log_batch(&mut self, first_seq: SeqNum, ops: &[BatchOp]) -> Result<()> {
        if self.poisoned {
            return Err(Error::Io(std::io::Error::other(format!(
                "WAL segment {:?} holds a partial record",
                self.path
            ))));
        }

        let mut body = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            let entry = Entry {
                key: op.key.clone(),
                seq_num: first_seq + i as u64,
                op: op.op.clone(),
            };
            entry.write_to(&mut body)?;
        }

        // Format: type (1) + first_seq (8) + count (4) + body_len (4) + body
        let mut record = Vec::with_capacity(HEADER_LEN + body.len());
        record.push(WAL_BATCH);
        record.extend_from_slice(&first_seq.to_le_bytes());
        record.extend_from_slice(&(ops.len() as u32).to_le_bytes());
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&body);

        if let Err(e) = self.append(&record) {
            self.rollback();
            return Err(e.into());
        }
        self.len += record.len() as u64;
        Ok(())
    }

    fn append(&mut self, record: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        {
            if let Some(limit) = self.fail_next_after.take() {
                self.file.write_all(&record[..limit.min(record.len())])?;
                return Err(std::io::Error::other("injected write failure"));
            }
        }
        self.file.write_all(record)
    }

    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.len) {
            error!(path = ?self.path, error = %e, "cannot truncate WAL after failed append");
            self.poisoned = true;
        }
    }

    /// Make the next append write `limit` bytes and then fail.
    #[cfg(test)]
    pub(crate) fn fail_next_append_after(&mut self, limit: usize) {
        self.fail_next_after = Some(limit);
    }

    /// Sync the WAL to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }
}

/// WAL reader for recovery.
pub struct WalReader {
    reader: BufReader<File>,
}

impl WalReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    /// Read all complete batches, flattened into entries.
    pub fn read_all(&mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(batch) = self.read_batch()? {
            entries.extend(batch);
        }
        Ok(entries)
    }

    fn read_batch(&mut self) -> Result<Option<Vec<Entry>>> {
        let mut header = [0u8; HEADER_LEN];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if header[0] != WAL_BATCH {
            return Err(Error::corruption(format!("invalid WAL record type {}", header[0])));
        }

        let first_seq = u64::from_le_bytes(header[1..9].try_into().unwrap_or_default());
        let count = u32::from_le_bytes(header[9..13].try_into().unwrap_or_default()) as usize;
        let body_len = u32::from_le_bytes(header[13..17].try_into().unwrap_or_default()) as usize;

        let mut body = vec![0u8; body_len];
        match self.reader.read_exact(&mut body) {
            Ok(()) => {}
            // Torn tail: the batch never committed.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut batch = Vec::with_capacity(count);
        let mut offset = 0;
        while offset < body.len() {
            let (entry, used) = Entry::read_from(&body[offset..])?;
            offset += used;
            batch.push(entry);
        }
        if batch.len() != count || batch.first().is_some_and(|e| e.seq_num != first_seq) {
            return Err(Error::corruption("WAL batch header does not match body"));
        }

        Ok(Some(batch))
    }
}
