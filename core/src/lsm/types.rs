//! Core types for the LSM tree.

use std::cmp::Ordering;
use std::io::Write;

use crate::error::{Error, Result};
use crate::varint::{decode_varint, encode_varint, varint_len};

/// Sequence number for ordering entries with the same key.
/// Higher sequence numbers are newer.
pub type SeqNum = u64;

/// Key type - variable length bytes.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub fn from_slice(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Key {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

/// What an entry does to its key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Put(Vec<u8>),
    /// Operand combined with older state by the merge operator.
    Merge(Vec<u8>),
    Delete,
}

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_MERGE: u8 = 2;

impl Op {
    fn tag(&self) -> u8 {
        match self {
            Op::Put(_) => OP_PUT,
            Op::Delete => OP_DELETE,
            Op::Merge(_) => OP_MERGE,
        }
    }

    fn payload(&self) -> Option<&[u8]> {
        match self {
            Op::Put(v) | Op::Merge(v) => Some(v),
            Op::Delete => None,
        }
    }

    pub fn size(&self) -> usize {
        self.payload().map_or(0, <[u8]>::len)
    }
}

/// An entry in the LSM tree.
#[derive(Clone, Debug)]
pub struct Entry {
    pub key: Key,
    pub seq_num: SeqNum,
    pub op: Op,
}

impl Entry {
    pub fn put(key: Key, seq_num: SeqNum, value: Vec<u8>) -> Self {
        Self { key, seq_num, op: Op::Put(value) }
    }

    pub fn merge(key: Key, seq_num: SeqNum, operand: Vec<u8>) -> Self {
        Self { key, seq_num, op: Op::Merge(operand) }
    }

    pub fn delete(key: Key, seq_num: SeqNum) -> Self {
        Self { key, seq_num, op: Op::Delete }
    }

    pub fn is_tombstone(&self) -> bool {
        self.op == Op::Delete
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        // key_len (varint) + key + seq_num (8) + op tag (1) + [value_len (varint) + value]
        let mut size = varint_len(self.key.len() as u64) + self.key.len() + 8 + 1;
        if let Some(value) = self.op.payload() {
            size += varint_len(value.len() as u64) + value.len();
        }
        size
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let mut written = encode_varint(self.key.len() as u64, writer)?;
        writer.write_all(self.key.as_bytes())?;
        written += self.key.len();

        writer.write_all(&self.seq_num.to_le_bytes())?;
        writer.write_all(&[self.op.tag()])?;
        written += 9;

        if let Some(value) = self.op.payload() {
            written += encode_varint(value.len() as u64, writer)?;
            writer.write_all(value)?;
            written += value.len();
        }

        Ok(written)
    }

    /// Deserialize an entry, returning it with the number of bytes consumed.
    pub fn read_from(data: &[u8]) -> Result<(Self, usize)> {
        let mut offset = 0;

        let (key_len, key_len_size) = decode_varint(data)?;
        offset += key_len_size;
        let key = Key::from_slice(take(data, offset, key_len as usize)?);
        offset += key_len as usize;

        let seq_bytes = take(data, offset, 8)?;
        let seq_num = u64::from_le_bytes(seq_bytes.try_into().map_err(|_| Error::corruption("bad seq_num"))?);
        offset += 8;

        let tag = take(data, offset, 1)?[0];
        offset += 1;

        let op = match tag {
            OP_DELETE => Op::Delete,
            OP_PUT | OP_MERGE => {
                let (value_len, value_len_size) = decode_varint(&data[offset..])?;
                offset += value_len_size;
                let value = take(data, offset, value_len as usize)?.to_vec();
                offset += value_len as usize;
                if tag == OP_PUT { Op::Put(value) } else { Op::Merge(value) }
            }
            other => return Err(Error::corruption(format!("unknown entry op {}", other))),
        };

        Ok((Self { key, seq_num, op }, offset))
    }
}

fn take(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| Error::corruption("entry truncated"))
}

/// Ordering for entries: first by key ascending, then by seq_num descending.
/// This ensures that for the same key, newer entries come first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.seq_num.cmp(&self.seq_num),
            ord => ord,
        }
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Entry {}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq_num == other.seq_num
    }
}

/// A single mutation inside an atomic write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchOp {
    pub key: Key,
    pub op: Op,
}

impl BatchOp {
    pub fn put(key: impl Into<Key>, value: Vec<u8>) -> Self {
        Self { key: key.into(), op: Op::Put(value) }
    }

    pub fn merge(key: impl Into<Key>, operand: Vec<u8>) -> Self {
        Self { key: key.into(), op: Op::Merge(operand) }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self { key: key.into(), op: Op::Delete }
    }
}

/// Outcome of a compaction filter for one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Drop,
    /// Keep the record with a replacement value.
    Rewrite(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization() {
        let entry = Entry::put(Key::from("hello"), 42, b"world".to_vec());

        let mut buffer = Vec::new();
        let written = entry.write_to(&mut buffer).unwrap();
        assert_eq!(written, buffer.len());
        assert_eq!(written, entry.serialized_size());

        let (decoded, read) = Entry::read_from(&buffer).unwrap();
        assert_eq!(read, buffer.len());
        assert_eq!(decoded.key, entry.key);
        assert_eq!(decoded.seq_num, entry.seq_num);
        assert_eq!(decoded.op, entry.op);
    }

    #[test]
    fn test_tombstone_and_merge_serialization() {
        let mut buffer = Vec::new();
        Entry::delete(Key::from("deleted"), 100).write_to(&mut buffer).unwrap();
        Entry::merge(Key::from("m"), 101, b"op".to_vec()).write_to(&mut buffer).unwrap();

        let (first, used) = Entry::read_from(&buffer).unwrap();
        assert!(first.is_tombstone());
        let (second, _) = Entry::read_from(&buffer[used..]).unwrap();
        assert_eq!(second.op, Op::Merge(b"op".to_vec()));
        assert_eq!(second.seq_num, 101);
    }

    #[test]
    fn test_truncated_entry_is_corruption() {
        let mut buffer = Vec::new();
        Entry::put(Key::from("key"), 7, b"value".to_vec()).write_to(&mut buffer).unwrap();
        buffer.truncate(buffer.len() - 2);
        assert!(Entry::read_from(&buffer).unwrap_err().is_corruption());
    }

    #[test]
    fn test_entry_ordering() {
        let e1 = Entry::put(Key::from("a"), 1, b"v1".to_vec());
        let e2 = Entry::put(Key::from("a"), 2, b"v2".to_vec());
        let e3 = Entry::put(Key::from("b"), 1, b"v3".to_vec());

        // Same key: higher seq_num comes first
        assert!(e2 < e1);
        assert!(e1 < e3);
    }
}
