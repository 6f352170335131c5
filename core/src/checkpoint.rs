//! Consistent point-in-time copies of a database directory.
//!
//! Creating a checkpoint is split in two so that the caller decides when the
//! copying happens:
//!
//! 1. [`Checkpoint::get_checkpoint_files`] briefly holds the write lock to
//!    capture the live tables, the WAL segments with their current sizes and
//!    the last sequence number. While the returned [`CheckpointFiles`] is
//!    alive no captured file is deleted.
//! 2. [`Checkpoint::create_checkpoint_with_files`] materializes that capture
//!    in a staging directory and renames it into place.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::db::NemoDB;
use crate::error::{Error, Result};
use crate::lsm::{sync_dir, LiveFile, LiveFiles, MANIFEST_FILE};
use crate::options::OPTIONS_FILE;

const STAGING_PREFIX: &str = ".nemo-checkpoint";

/// A captured live file set. Holds off file deletion until dropped.
pub struct CheckpointFiles {
    /// Tables, the MANIFEST and the OPTIONS file.
    pub live_files: Vec<LiveFile>,
    /// WAL segments, oldest first, with the size to copy.
    pub live_wal_files: Vec<LiveFile>,
    pub manifest_file_size: u64,
    pub sequence_number: u64,
    source: LiveFiles,
}

pub struct Checkpoint<'a> {
    db: &'a NemoDB,
}

impl<'a> Checkpoint<'a> {
    pub fn new(db: &'a NemoDB) -> Self {
        Self { db }
    }

    /// Capture the live file set. Fails with `Busy` if writers hold the
    /// write lock past `checkpoint_lock_timeout`.
    pub fn get_checkpoint_files(&self) -> Result<CheckpointFiles> {
        let timeout = self.db.options().checkpoint_lock_timeout;
        let source = self.db.tree().live_files(timeout)?;

        let manifest_file_size = source.manifest.encode().len() as u64;
        let options_size = fs::metadata(source.dir.join(OPTIONS_FILE))?.len();

        let mut live_files = source.tables.clone();
        live_files.push(LiveFile {
            name: MANIFEST_FILE.to_string(),
            size: manifest_file_size,
        });
        live_files.push(LiveFile {
            name: OPTIONS_FILE.to_string(),
            size: options_size,
        });

        Ok(CheckpointFiles {
            live_files,
            live_wal_files: source.wals.clone(),
            manifest_file_size,
            sequence_number: source.sequence_number,
            source,
        })
    }

    /// Materialize `files` at `dir`, which must not exist yet. The copy is
    /// staged in a fresh hidden directory next to `dir`.
    pub fn create_checkpoint_with_files(&self, dir: impl AsRef<Path>, files: &CheckpointFiles) -> Result<()> {
        let dir = dir.as_ref();
        if dir.exists() {
            return Err(Error::invalid(format!("checkpoint target {:?} already exists", dir)));
        }

        let parent = match dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        // Removed unless it is renamed into place.
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&parent)?;

        match materialize(staging.path(), dir, &parent, files) {
            Ok(()) => {
                let _ = staging.keep();
                info!(
                    ?dir,
                    sequence_number = files.sequence_number,
                    tables = files.source.tables.len(),
                    wals = files.live_wal_files.len(),
                    "created checkpoint"
                );
                Ok(())
            }
            Err(e) => {
                let staging_path = staging.path().to_path_buf();
                if let Err(cleanup) = staging.close() {
                    warn!(staging = ?staging_path, error = %cleanup, "failed to remove checkpoint staging directory");
                }
                Err(Error::Checkpoint {
                    path: dir.to_path_buf(),
                    source: Box::new(e),
                })
            }
        }
    }

    pub fn create_checkpoint(&self, dir: impl AsRef<Path>) -> Result<()> {
        let files = self.get_checkpoint_files()?;
        self.create_checkpoint_with_files(dir, &files)
    }
}

fn materialize(staging: &Path, dir: &Path, parent: &Path, files: &CheckpointFiles) -> Result<()> {
    let source = &files.source;

    for table in &source.tables {
        let from = source.dir.join(&table.name);
        let to = staging.join(&table.name);
        if fs::hard_link(&from, &to).is_err() {
            fs::copy(&from, &to)?;
        }
    }

    for wal in &files.live_wal_files {
        copy_prefix(&source.dir.join(&wal.name), &staging.join(&wal.name), wal.size)?;
    }

    copy_prefix(
        &source.dir.join(OPTIONS_FILE),
        &staging.join(OPTIONS_FILE),
        u64::MAX,
    )?;
    source.manifest.save(staging)?;
    sync_dir(staging)?;

    fs::rename(staging, dir)?;
    sync_dir(parent)?;
    Ok(())
}

/// Copy at most `len` bytes of `from` into a new file and fsync it.
fn copy_prefix(from: &Path, to: &Path, len: u64) -> Result<()> {
    let mut reader = File::open(from)?.take(len);
    let mut writer = File::create(to)?;
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    writer.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{MergeOperator, Options};
    use crate::ttl::{KeyTtl, ManualClock};
    use std::sync::Arc;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn options(clock: &Arc<ManualClock>) -> Options {
        Options {
            compaction_trigger: 0,
            ..Options::default()
        }
        .with_clock(clock.clone())
        .with_merge_operator(MergeOperator::string_append())
    }

    #[test]
    fn test_checkpoint_is_a_consistent_copy() {
        let root = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(100));
        let db = NemoDB::open(root.path().join("db"), options(&clock)).unwrap();

        db.put(b"flushed", b"1").unwrap();
        db.flush().unwrap();
        db.put_with_ttl(b"in_wal", b"2", 50).unwrap();
        db.merge(b"in_wal", b"3").unwrap();

        let checkpoint = Checkpoint::new(&db);
        let files = checkpoint.get_checkpoint_files().unwrap();
        assert_eq!(files.sequence_number, 3);
        assert!(files.live_files.iter().any(|f| f.name == MANIFEST_FILE));
        assert_eq!(files.live_wal_files.len(), 1);

        // Writes and compactions after the capture stay out of the copy.
        db.put(b"after", b"x").unwrap();
        db.compact_range(None, None).unwrap();

        let target = root.path().join("cp");
        checkpoint.create_checkpoint_with_files(&target, &files).unwrap();
        drop(files);
        assert_eq!(entries(root.path()), vec!["cp".to_string(), "db".to_string()]);

        let copy = NemoDB::open(&target, options(&clock)).unwrap();
        assert_eq!(copy.get(b"flushed").unwrap(), Some(b"1".to_vec()));
        assert_eq!(copy.get(b"in_wal").unwrap(), Some(b"23".to_vec()));
        assert_eq!(copy.get_key_ttl(b"in_wal").unwrap(), Some(KeyTtl::Remaining(50)));
        assert_eq!(copy.get(b"after").unwrap(), None);

        // The copy is independent of the source.
        copy.put(b"only_copy", b"y").unwrap();
        assert_eq!(db.get(b"only_copy").unwrap(), None);
        assert_eq!(db.get(b"after").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_existing_target_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(100));
        let db = NemoDB::open(root.path().join("db"), options(&clock)).unwrap();

        let target = root.path().join("cp");
        fs::create_dir(&target).unwrap();
        let err = Checkpoint::new(&db).create_checkpoint(&target).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_failed_checkpoint_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(100));
        let db = NemoDB::open(root.path().join("db"), options(&clock)).unwrap();
        db.put(b"k", b"v").unwrap();
        db.flush().unwrap();

        let checkpoint = Checkpoint::new(&db);
        let files = checkpoint.get_checkpoint_files().unwrap();
        for table in &files.source.tables {
            fs::remove_file(root.path().join("db").join(&table.name)).unwrap();
        }

        let target = root.path().join("cp");
        let err = checkpoint.create_checkpoint_with_files(&target, &files).unwrap_err();
        assert!(matches!(err, Error::Checkpoint { .. }));
        assert!(!target.exists());
        assert_eq!(entries(root.path()), vec!["db".to_string()]);
    }

    #[test]
    fn test_neighbouring_directories_are_left_alone() {
        let root = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(100));
        let db = NemoDB::open(root.path().join("db"), options(&clock)).unwrap();
        db.put(b"k", b"v").unwrap();

        let mine = root.path().join("backup.tmp");
        fs::create_dir(&mine).unwrap();
        fs::write(mine.join("notes.txt"), b"keep me").unwrap();

        Checkpoint::new(&db).create_checkpoint(root.path().join("backup")).unwrap();
        assert_eq!(fs::read(mine.join("notes.txt")).unwrap(), b"keep me");
        assert_eq!(
            entries(root.path()),
            vec!["backup".to_string(), "backup.tmp".to_string(), "db".to_string()]
        );
    }

    #[test]
    fn test_busy_when_writer_lock_is_held() {
        let root = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(100));
        let mut opts = options(&clock);
        opts.checkpoint_lock_timeout = std::time::Duration::from_millis(10);
        let db = NemoDB::open(root.path().join("db"), opts).unwrap();

        let _held = db.tree().hold_write_lock_for_test();
        let err = Checkpoint::new(&db).get_checkpoint_files().err().unwrap();
        assert!(err.is_busy());
    }
}
