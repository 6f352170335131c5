//! The MANIFEST records which SSTables make up the tree and how far the WAL
//! has been flushed. It is a small text file rewritten through a temporary
//! file and an atomic rename.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

use super::types::SeqNum;

pub const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP: &str = "MANIFEST.tmp";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub next_file_id: u64,
    /// Every WAL entry at or below this sequence number lives in a table.
    pub flushed_seq: SeqNum,
    pub last_seq: SeqNum,
    /// Table ids, newest first.
    pub tables: Vec<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Table,
    Wal,
}

pub fn table_file_name(id: u64) -> String {
    format!("{:06}.sst", id)
}

pub fn wal_file_name(id: u64) -> String {
    format!("{:06}.wal", id)
}

pub fn parse_file_name(name: &str) -> Option<(u64, FileKind)> {
    let (stem, ext) = name.split_once('.')?;
    let kind = match ext {
        "sst" => FileKind::Table,
        "wal" => FileKind::Wal,
        _ => return None,
    };
    stem.parse().ok().map(|id| (id, kind))
}

impl Manifest {
    pub fn encode(&self) -> String {
        let mut out = format!(
            "next_file_id {}\nflushed_seq {}\nlast_seq {}\n",
            self.next_file_id, self.flushed_seq, self.last_seq
        );
        for id in &self.tables {
            out.push_str(&format!("table {}\n", id));
        }
        out
    }

    pub fn decode(content: &str) -> Result<Self> {
        let mut manifest = Manifest::default();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let (field, value) = line
                .split_once(' ')
                .ok_or_else(|| Error::corruption(format!("malformed manifest line {:?}", line)))?;
            let value: u64 = value
                .trim()
                .parse()
                .map_err(|_| Error::corruption(format!("malformed manifest value {:?}", line)))?;
            match field {
                "next_file_id" => manifest.next_file_id = value,
                "flushed_seq" => manifest.flushed_seq = value,
                "last_seq" => manifest.last_seq = value,
                "table" => manifest.tables.push(value),
                other => return Err(Error::corruption(format!("unknown manifest field {}", other))),
            }
        }
        Ok(manifest)
    }

    pub fn load(dir: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(dir.join(MANIFEST_FILE)) {
            Ok(content) => Self::decode(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the manifest in `dir`. Returns its size in bytes.
    pub fn save(&self, dir: &Path) -> Result<u64> {
        let content = self.encode();
        let tmp = dir.join(MANIFEST_TMP);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        sync_dir(dir)?;
        Ok(content.len() as u64)
    }
}

/// Persist directory entries (creates, renames) on platforms that need it.
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
