//! LSM Tree - Main coordinator for the key-value store.
//!
//! Manages memtable lifecycle, WAL segments, SSTable creation, compaction,
//! the read path and the file-level view used by checkpoints.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::compaction::{CompactionContext, CompactionFilterFactory, CompactionStats, Compactor};
use super::iterator::{KeyChainIterator, MergeIterator};
use super::manifest::{parse_file_name, table_file_name, wal_file_name, FileKind, Manifest};
use super::memtable::MemTable;
use super::merge::{resolve, MergeFn};
use super::sstable::{SSTableReader, SSTableWriter};
use super::types::{BatchOp, Entry, FilterDecision, Key, Op, SeqNum};
use super::view::{EntrySource, ReadView};
use super::wal::{Wal, WalReader};

/// Configuration for the LSM tree.
#[derive(Clone)]
pub struct LsmConfig {
    /// Directory for data files.
    pub data_dir: PathBuf,
    /// Maximum memtable size before flushing to SSTable.
    pub memtable_size_threshold: usize,
    pub create_if_missing: bool,
    /// fsync the WAL after every write batch.
    pub sync_wal: bool,
    /// Table count that triggers a background compaction; 0 disables it.
    pub compaction_trigger: usize,
    pub merge_operator: Option<MergeFn>,
    pub compaction_filter: Option<Arc<dyn CompactionFilterFactory>>,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memtable_size_threshold: 4 * 1024 * 1024, // 4MB
            create_if_missing: true,
            sync_wal: false,
            compaction_trigger: 4,
            merge_operator: None,
            compaction_filter: None,
        }
    }
}

struct WriterState {
    wal: Wal,
    wal_id: u64,
    last_seq: SeqNum,
}

struct TreeState {
    mem: Arc<RwLock<MemTable>>,
    /// WAL segments holding the active memtable's entries.
    mem_wals: Vec<u64>,
    imm: Option<Arc<RwLock<MemTable>>>,
    imm_wals: Vec<u64>,
    /// Newest first.
    tables: Vec<Arc<SSTableReader>>,
    flushed_seq: SeqNum,
}

#[derive(Default)]
struct DeletionState {
    disabled: usize,
    pending: Vec<PathBuf>,
}

pub(crate) struct LsmInner {
    config: LsmConfig,
    writer: Mutex<WriterState>,
    visible_seq: AtomicU64,
    state: RwLock<TreeState>,
    next_file_id: AtomicU64,
    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    deletions: Mutex<DeletionState>,
    table_count: AtomicUsize,
}

/// A file of the live set, with the size a copy must cover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveFile {
    pub name: String,
    pub size: u64,
}

/// Consistent file-level view of the tree. Obsolete files are not deleted
/// while any `LiveFiles` is alive.
pub struct LiveFiles {
    pub dir: PathBuf,
    pub tables: Vec<LiveFile>,
    /// Oldest first.
    pub wals: Vec<LiveFile>,
    pub manifest: Manifest,
    pub sequence_number: SeqNum,
    _pin: DeletionPin,
}

struct DeletionPin {
    inner: Arc<LsmInner>,
}

impl Drop for DeletionPin {
    fn drop(&mut self) {
        let pending = {
            let mut deletions = self.inner.deletions.lock();
            deletions.disabled -= 1;
            if deletions.disabled > 0 {
                return;
            }
            std::mem::take(&mut deletions.pending)
        };
        remove_files(&pending);
    }
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(?path, "removed obsolete file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(?path, error = %e, "failed to remove obsolete file"),
        }
    }
}

/// LSM Tree key-value store.
pub struct LsmTree {
    inner: Arc<LsmInner>,
    compactor: Option<Compactor>,
}

/// Statistics about the LSM tree.
#[derive(Debug, Clone)]
pub struct LsmStats {
    pub memtable_entries: usize,
    pub memtable_size_bytes: usize,
    pub sstable_count: usize,
    pub total_entries: usize,
    pub last_seq: SeqNum,
}

impl LsmTree {
    /// Create a new LSM tree or open an existing one.
    pub fn open(config: LsmConfig) -> Result<Self> {
        let inner = Arc::new(LsmInner::open(config)?);
        let compactor = if inner.config.compaction_trigger > 0 {
            Some(Compactor::spawn(Arc::clone(&inner))?)
        } else {
            None
        };
        Ok(Self { inner, compactor })
    }

    pub fn config(&self) -> &LsmConfig {
        &self.inner.config
    }

    /// Apply a batch atomically. Returns the sequence number of its last entry.
    pub fn write(&self, ops: Vec<BatchOp>) -> Result<SeqNum> {
        let seq = self.inner.write(ops)?;
        if self.inner.maybe_flush()? && self.inner.needs_compaction() {
            if let Some(compactor) = &self.compactor {
                compactor.signal();
            }
        }
        Ok(seq)
    }

    pub fn put(&self, key: impl Into<Key>, value: Vec<u8>) -> Result<SeqNum> {
        self.write(vec![BatchOp::put(key, value)])
    }

    pub fn merge(&self, key: impl Into<Key>, operand: Vec<u8>) -> Result<SeqNum> {
        self.write(vec![BatchOp::merge(key, operand)])
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<SeqNum> {
        self.write(vec![BatchOp::delete(key)])
    }

    /// Get the current value for a key.
    /// Returns None if not found or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.view().get(key)
    }

    /// Capture a point-in-time view.
    pub fn view(&self) -> ReadView {
        self.inner.view()
    }

    /// Force flush the memtable to an SSTable.
    pub fn flush(&self) -> Result<()> {
        let _flush = self.inner.flush_lock.lock();
        self.inner.flush_locked()
    }

    /// Flush, then merge every SSTable into one, running the compaction
    /// filter over keys in `[begin, end)`.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<CompactionStats> {
        self.inner.compact_range(begin, end)
    }

    /// Capture the live file set without stalling writers for longer than
    /// it takes to list it. Fails with `Busy` if the write lock cannot be
    /// taken within `timeout`.
    pub fn live_files(&self, timeout: Duration) -> Result<LiveFiles> {
        LsmInner::live_files(&self.inner, timeout)
    }

    #[cfg(test)]
    pub(crate) fn hold_write_lock_for_test(&self) -> impl Sized + '_ {
        self.inner.writer.lock()
    }

    pub fn stats(&self) -> LsmStats {
        let state = self.inner.state.read();
        let mut memtable_entries = state.mem.read().len();
        let memtable_size_bytes = state.mem.read().size_bytes();
        if let Some(imm) = &state.imm {
            memtable_entries += imm.read().len();
        }

        LsmStats {
            memtable_entries,
            memtable_size_bytes,
            sstable_count: state.tables.len(),
            total_entries: state.tables.iter().map(|t| t.meta.entry_count).sum::<u64>() as usize
                + memtable_entries,
            last_seq: self.inner.visible_seq.load(Ordering::Acquire),
        }
    }
}

impl LsmInner {
    fn open(config: LsmConfig) -> Result<Self> {
        let dir = config.data_dir.clone();
        let manifest = match Manifest::load(&dir)? {
            Some(manifest) => manifest,
            None if config.create_if_missing => {
                std::fs::create_dir_all(&dir)?;
                let manifest = Manifest { next_file_id: 1, ..Default::default() };
                manifest.save(&dir)?;
                info!(?dir, "created new database");
                manifest
            }
            None => {
                return Err(Error::invalid(format!("{:?} does not exist (create_if_missing is false)", dir)));
            }
        };

        let mut tables = Vec::with_capacity(manifest.tables.len());
        let mut last_seq = manifest.last_seq.max(manifest.flushed_seq);
        for &id in &manifest.tables {
            let reader = SSTableReader::open(dir.join(table_file_name(id)), id)?;
            last_seq = last_seq.max(reader.meta.max_seq);
            tables.push(Arc::new(reader));
        }

        // Scan the directory for WAL segments and stray tables.
        let mut wal_ids = Vec::new();
        let mut max_file_id = 0;
        let mut strays = Vec::new();
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let Some((id, kind)) = parse_file_name(&name) else { continue };
            max_file_id = max_file_id.max(id);
            match kind {
                FileKind::Wal => wal_ids.push(id),
                FileKind::Table if !manifest.tables.contains(&id) => strays.push(dirent.path()),
                FileKind::Table => {}
            }
        }
        wal_ids.sort_unstable();

        let mut memtable = MemTable::new();
        let mut mem_wals = Vec::new();
        let mut replayed = 0usize;
        for &id in &wal_ids {
            let path = dir.join(wal_file_name(id));
            let entries = WalReader::open(&path)?.read_all()?;
            let mut live = false;
            for entry in entries {
                if entry.seq_num <= manifest.flushed_seq {
                    continue;
                }
                last_seq = last_seq.max(entry.seq_num);
                memtable.insert(entry.key, entry.seq_num, entry.op);
                replayed += 1;
                live = true;
            }
            if live {
                mem_wals.push(id);
            } else {
                strays.push(path);
            }
        }
        remove_files(&strays);

        let next_file_id = AtomicU64::new(manifest.next_file_id.max(max_file_id + 1));
        let wal_id = next_file_id.fetch_add(1, Ordering::SeqCst);
        let wal = Wal::open(dir.join(wal_file_name(wal_id)))?;
        mem_wals.push(wal_id);

        info!(
            ?dir,
            tables = tables.len(),
            replayed,
            last_seq,
            "opened lsm tree"
        );

        let table_count = AtomicUsize::new(tables.len());
        Ok(Self {
            writer: Mutex::new(WriterState { wal, wal_id, last_seq }),
            visible_seq: AtomicU64::new(last_seq),
            state: RwLock::new(TreeState {
                mem: Arc::new(RwLock::new(memtable)),
                mem_wals,
                imm: None,
                imm_wals: Vec::new(),
                tables,
                flushed_seq: manifest.flushed_seq,
            }),
            next_file_id,
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            deletions: Mutex::new(DeletionState::default()),
            table_count,
            config,
        })
    }

    fn dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn alloc_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    fn write(&self, ops: Vec<BatchOp>) -> Result<SeqNum> {
        if ops.iter().any(|op| matches!(op.op, Op::Merge(_))) && self.config.merge_operator.is_none() {
            return Err(Error::invalid("merge requires a merge operator"));
        }

        let mut writer = self.writer.lock();
        if ops.is_empty() {
            return Ok(writer.last_seq);
        }

        let first_seq = writer.last_seq + 1;
        writer.wal.log_batch(first_seq, &ops)?;
        if self.config.sync_wal {
            writer.wal.sync()?;
        }

        let last_seq = first_seq + ops.len() as u64 - 1;
        {
            let state = self.state.read();
            let mut mem = state.mem.write();
            for (i, op) in ops.into_iter().enumerate() {
                mem.insert(op.key, first_seq + i as u64, op.op);
            }
        }

        writer.last_seq = last_seq;
        self.visible_seq.store(last_seq, Ordering::Release);
        Ok(last_seq)
    }

    fn view(&self) -> ReadView {
        let state = self.state.read();
        let seq = self.visible_seq.load(Ordering::Acquire);
        let mut mems = vec![Arc::clone(&state.mem)];
        if let Some(imm) = &state.imm {
            mems.push(Arc::clone(imm));
        }
        ReadView {
            seq,
            mems,
            tables: state.tables.clone(),
            merge: self.config.merge_operator.clone(),
        }
    }

    pub(crate) fn needs_compaction(&self) -> bool {
        let trigger = self.config.compaction_trigger;
        trigger > 0 && self.table_count.load(Ordering::Acquire) >= trigger
    }

    /// Flush if the memtable is over its threshold. Returns whether a flush
    /// ran. Never waits for a flush or compaction already in progress.
    fn maybe_flush(&self) -> Result<bool> {
        let should_flush = {
            let state = self.state.read();
            let size = state.mem.read().size_bytes();
            size >= self.config.memtable_size_threshold
        };
        if !should_flush {
            return Ok(false);
        }

        match self.flush_lock.try_lock() {
            Some(_flush) => {
                self.flush_locked()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Caller holds `flush_lock`.
    fn flush_locked(&self) -> Result<()> {
        let has_imm = self.state.read().imm.is_some();
        if !has_imm && !self.freeze()? {
            return Ok(());
        }
        self.flush_imm()
    }

    /// Swap in a fresh memtable and WAL segment. Returns false if there was
    /// nothing to freeze.
    fn freeze(&self) -> Result<bool> {
        let mut writer = self.writer.lock();
        let mut state = self.state.write();
        if state.mem.read().is_empty() {
            return Ok(false);
        }

        let wal_id = self.alloc_file_id();
        let wal = Wal::open(self.dir().join(wal_file_name(wal_id)))?;
        writer.wal = wal;
        writer.wal_id = wal_id;

        let frozen = std::mem::replace(&mut state.mem, Arc::new(RwLock::new(MemTable::new())));
        state.imm = Some(frozen);
        state.imm_wals = std::mem::replace(&mut state.mem_wals, vec![wal_id]);
        Ok(true)
    }

    fn flush_imm(&self) -> Result<()> {
        let Some(imm) = self.state.read().imm.clone() else {
            return Ok(());
        };

        let id = self.alloc_file_id();
        let path = self.dir().join(table_file_name(id));
        let (entries, flushed_seq) = {
            let mem = imm.read();
            (mem.iter_at(SeqNum::MAX).collect::<Vec<_>>(), mem.max_seq())
        };

        let written = (|| -> Result<SSTableReader> {
            let mut writer = SSTableWriter::create(&path, id)?;
            for entry in &entries {
                writer.write_entry(entry)?;
            }
            writer.finish()?;
            SSTableReader::open(&path, id)
        })();
        let reader = match written {
            Ok(reader) => Arc::new(reader),
            Err(e) => {
                remove_files(&[path]);
                return Err(e);
            }
        };

        let obsolete = {
            let mut state = self.state.write();
            let mut tables = Vec::with_capacity(state.tables.len() + 1);
            tables.push(reader);
            tables.extend(state.tables.iter().cloned());
            let flushed_seq = state.flushed_seq.max(flushed_seq);
            self.manifest_for(&tables, flushed_seq).save(self.dir())?;

            state.tables = tables;
            state.imm = None;
            state.flushed_seq = flushed_seq;
            self.table_count.store(state.tables.len(), Ordering::Release);
            std::mem::take(&mut state.imm_wals)
        };

        info!(id, entries = entries.len(), flushed_seq, "flushed memtable");
        let paths: Vec<_> = obsolete.iter().map(|id| self.dir().join(wal_file_name(*id))).collect();
        self.delete_obsolete(paths);
        Ok(())
    }

    fn manifest_for(&self, tables: &[Arc<SSTableReader>], flushed_seq: SeqNum) -> Manifest {
        Manifest {
            next_file_id: self.next_file_id.load(Ordering::SeqCst),
            flushed_seq,
            last_seq: self.visible_seq.load(Ordering::Acquire),
            tables: tables.iter().map(|t| t.meta.id).collect(),
        }
    }

    fn delete_obsolete(&self, paths: Vec<PathBuf>) {
        {
            let mut deletions = self.deletions.lock();
            if deletions.disabled > 0 {
                debug!(count = paths.len(), "deferring obsolete file deletion");
                deletions.pending.extend(paths);
                return;
            }
        }
        remove_files(&paths);
    }

    pub(crate) fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<CompactionStats> {
        let _compaction = self.compaction_lock.lock();
        let _flush = self.flush_lock.lock();

        // The filter is created before the flush so that anything left out
        // of this compaction is also newer than the filter's clock.
        let mut filter = self.config.compaction_filter.as_ref().map(|f| f.create());
        self.flush_locked()?;

        let ctx = CompactionContext {
            view: self.view(),
            begin: begin.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
        };
        let inputs = ctx.view.tables.clone();

        let mut stats = CompactionStats {
            input_tables: inputs.len(),
            ..Default::default()
        };
        if inputs.is_empty() {
            return Ok(stats);
        }

        let id = self.alloc_file_id();
        let path = self.dir().join(table_file_name(id));
        let output = (|| -> Result<Option<Arc<SSTableReader>>> {
            let sources: Vec<EntrySource> = inputs
                .iter()
                .map(|t| Box::new(t.iter()) as EntrySource)
                .collect();
            let mut writer = SSTableWriter::create(&path, id)?;

            for item in KeyChainIterator::new(MergeIterator::new(sources)) {
                let (key, chain) = item?;
                stats.input_entries += chain.len() as u64;
                let seq_num = chain[0].seq_num;

                // Every table takes part, so a bottommost tombstone can go.
                let Some(value) = resolve(key.as_bytes(), &chain, self.config.merge_operator.as_ref())? else {
                    continue;
                };

                let decision = match filter.as_mut() {
                    Some(f) => f.filter(&ctx, key.as_bytes(), &value),
                    None => FilterDecision::Keep,
                };
                let value = match decision {
                    FilterDecision::Keep => value,
                    FilterDecision::Drop => {
                        stats.dropped += 1;
                        continue;
                    }
                    FilterDecision::Rewrite(new_value) => {
                        stats.rewritten += 1;
                        new_value
                    }
                };
                writer.write_entry(&Entry::put(key, seq_num, value))?;
                stats.output_entries += 1;
            }

            if writer.entry_count() == 0 {
                drop(writer);
                remove_files(&[path.clone()]);
                return Ok(None);
            }
            writer.finish()?;
            SSTableReader::open(&path, id).map(|r| Some(Arc::new(r)))
        })();

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                remove_files(&[path]);
                return Err(e);
            }
        };

        {
            let mut state = self.state.write();
            let tables: Vec<_> = output.into_iter().collect();
            self.manifest_for(&tables, state.flushed_seq).save(self.dir())?;
            state.tables = tables;
            self.table_count.store(state.tables.len(), Ordering::Release);
        }

        info!(
            input_tables = stats.input_tables,
            input_entries = stats.input_entries,
            output_entries = stats.output_entries,
            dropped = stats.dropped,
            rewritten = stats.rewritten,
            "compaction finished"
        );
        let paths = inputs.iter().map(|t| t.path().to_path_buf()).collect();
        self.delete_obsolete(paths);
        Ok(stats)
    }

    fn live_files(inner: &Arc<Self>, timeout: Duration) -> Result<LiveFiles> {
        let writer = inner
            .writer
            .try_lock_for(timeout)
            .ok_or_else(|| Error::Busy(format!("write lock not acquired within {:?}", timeout)))?;
        let state = inner.state.read();

        inner.deletions.lock().disabled += 1;
        let pin = DeletionPin { inner: Arc::clone(inner) };

        let tables = state
            .tables
            .iter()
            .map(|t| LiveFile {
                name: table_file_name(t.meta.id),
                size: t.meta.file_size,
            })
            .collect();

        let mut wals = Vec::new();
        for &id in state.imm_wals.iter().chain(state.mem_wals.iter()) {
            let name = wal_file_name(id);
            let size = if id == writer.wal_id {
                writer.wal.len()
            } else {
                std::fs::metadata(inner.dir().join(&name))?.len()
            };
            wals.push(LiveFile { name, size });
        }

        let manifest = Manifest {
            next_file_id: inner.next_file_id.load(Ordering::SeqCst),
            flushed_seq: state.flushed_seq,
            last_seq: writer.last_seq,
            tables: state.tables.iter().map(|t| t.meta.id).collect(),
        };

        Ok(LiveFiles {
            dir: inner.dir().to_path_buf(),
            tables,
            wals,
            sequence_number: writer.last_seq,
            manifest,
            _pin: pin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsm::compaction::CompactionFilter;

    fn config(dir: &Path) -> LsmConfig {
        LsmConfig {
            data_dir: dir.to_path_buf(),
            compaction_trigger: 0,
            ..Default::default()
        }
    }

    fn concat() -> MergeFn {
        Arc::new(|_key, existing, operands| {
            let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
            for op in operands {
                out.extend_from_slice(op);
            }
            Ok(out)
        })
    }

    #[test]
    fn test_basic_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(config(dir.path())).unwrap();

        lsm.put("key1", b"value1".to_vec()).unwrap();
        lsm.put("key2", b"value2".to_vec()).unwrap();

        assert_eq!(lsm.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(lsm.get(b"key2").unwrap(), Some(b"value2".to_vec()));
        assert!(lsm.get(b"key3").unwrap().is_none());
    }

    #[test]
    fn test_delete_shadows_flushed_value() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(config(dir.path())).unwrap();

        lsm.put("key", b"value".to_vec()).unwrap();
        lsm.flush().unwrap();
        lsm.delete("key").unwrap();

        assert!(lsm.get(b"key").unwrap().is_none());
    }

    #[test]
    fn test_flush_and_recover() {
        let dir = tempfile::tempdir().unwrap();

        {
            let lsm = LsmTree::open(config(dir.path())).unwrap();
            lsm.put("key1", b"value1".to_vec()).unwrap();
            lsm.flush().unwrap();
            lsm.put("key2", b"value2".to_vec()).unwrap();
        }

        let lsm = LsmTree::open(config(dir.path())).unwrap();
        assert_eq!(lsm.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(lsm.get(b"key2").unwrap(), Some(b"value2".to_vec()));
        assert_eq!(lsm.stats().last_seq, 2);

        // New writes continue the sequence instead of reusing it.
        assert_eq!(lsm.put("key3", b"value3".to_vec()).unwrap(), 3);
    }

    #[test]
    fn test_batch_is_atomic_in_views() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(config(dir.path())).unwrap();

        let before = lsm.view();
        let seq = lsm
            .write(vec![
                BatchOp::put("a", b"1".to_vec()),
                BatchOp::put("b", b"2".to_vec()),
            ])
            .unwrap();
        assert_eq!(seq, 2);

        assert!(before.get(b"a").unwrap().is_none());
        assert!(before.get(b"b").unwrap().is_none());
        let after = lsm.view();
        assert_eq!(after.scan().count(), 2);
    }

    #[test]
    fn test_merge_across_flush() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(LsmConfig {
            merge_operator: Some(concat()),
            ..config(dir.path())
        })
        .unwrap();

        lsm.put("m", b"a".to_vec()).unwrap();
        lsm.merge("m", b"b".to_vec()).unwrap();
        lsm.flush().unwrap();
        lsm.merge("m", b"c".to_vec()).unwrap();

        assert_eq!(lsm.get(b"m").unwrap(), Some(b"abc".to_vec()));
        lsm.compact_range(None, None).unwrap();
        assert_eq!(lsm.get(b"m").unwrap(), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_merge_without_operator_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(config(dir.path())).unwrap();
        assert!(lsm.merge("m", b"x".to_vec()).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_scan() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(config(dir.path())).unwrap();

        lsm.put("c", b"3".to_vec()).unwrap();
        lsm.put("a", b"1".to_vec()).unwrap();
        lsm.flush().unwrap();
        lsm.put("b", b"2".to_vec()).unwrap();
        lsm.delete("c").unwrap();

        let keys: Vec<_> = lsm
            .view()
            .scan()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![Key::from("a"), Key::from("b")]);
    }

    struct DropPrefix;

    impl CompactionFilter for DropPrefix {
        fn filter(&mut self, ctx: &CompactionContext, key: &[u8], _value: &[u8]) -> FilterDecision {
            if ctx.in_range(key) && key.starts_with(b"tmp_") {
                FilterDecision::Drop
            } else {
                FilterDecision::Keep
            }
        }
    }

    struct DropPrefixFactory;

    impl CompactionFilterFactory for DropPrefixFactory {
        fn name(&self) -> &str {
            "DropPrefix"
        }

        fn create(&self) -> Box<dyn CompactionFilter> {
            Box::new(DropPrefix)
        }
    }

    #[test]
    fn test_compaction_applies_filter_and_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(LsmConfig {
            compaction_filter: Some(Arc::new(DropPrefixFactory)),
            ..config(dir.path())
        })
        .unwrap();

        lsm.put("keep", b"1".to_vec()).unwrap();
        lsm.put("tmp_a", b"2".to_vec()).unwrap();
        lsm.flush().unwrap();
        lsm.put("gone", b"3".to_vec()).unwrap();
        lsm.flush().unwrap();
        lsm.delete("gone").unwrap();

        let stats = lsm.compact_range(None, None).unwrap();
        assert_eq!(stats.input_tables, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.output_entries, 1);
        assert_eq!(lsm.stats().sstable_count, 1);
        assert_eq!(lsm.get(b"keep").unwrap(), Some(b"1".to_vec()));
        assert!(lsm.get(b"tmp_a").unwrap().is_none());

        // Survives reopen and the old table files are gone.
        drop(lsm);
        let tables = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".sst"))
            .count();
        assert_eq!(tables, 1);
        let lsm = LsmTree::open(config(dir.path())).unwrap();
        assert_eq!(lsm.get(b"keep").unwrap(), Some(b"1".to_vec()));
    }

    /// Records how many tables were on disk whenever a filter was created.
    struct CountTablesAtCreate {
        dir: PathBuf,
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl CompactionFilterFactory for CountTablesAtCreate {
        fn name(&self) -> &str {
            "CountTablesAtCreate"
        }

        fn create(&self) -> Box<dyn CompactionFilter> {
            let tables = std::fs::read_dir(&self.dir)
                .unwrap()
                .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".sst"))
                .count();
            self.seen.lock().push(tables);
            Box::new(DropPrefix)
        }
    }

    #[test]
    fn test_filter_created_before_compaction_flush() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let lsm = LsmTree::open(LsmConfig {
            compaction_filter: Some(Arc::new(CountTablesAtCreate {
                dir: dir.path().to_path_buf(),
                seen: Arc::clone(&seen),
            })),
            ..config(dir.path())
        })
        .unwrap();

        lsm.put("a", b"1".to_vec()).unwrap();
        lsm.flush().unwrap();
        lsm.put("b", b"2".to_vec()).unwrap();

        let stats = lsm.compact_range(None, None).unwrap();
        assert_eq!(stats.input_tables, 2);
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn test_failed_wal_append_is_not_replayed() {
        let dir = tempfile::tempdir().unwrap();

        {
            let lsm = LsmTree::open(config(dir.path())).unwrap();
            lsm.put("a", b"1".to_vec()).unwrap();

            lsm.inner.writer.lock().wal.fail_next_append_after(5);
            assert!(lsm.put("lost", b"x".to_vec()).is_err());
            assert!(lsm.get(b"lost").unwrap().is_none());

            assert_eq!(lsm.put("b", b"2".to_vec()).unwrap(), 2);
        }

        let lsm = LsmTree::open(config(dir.path())).unwrap();
        assert!(lsm.get(b"lost").unwrap().is_none());
        assert_eq!(lsm.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(lsm.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(lsm.stats().last_seq, 2);
    }

    #[test]
    fn test_view_survives_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(config(dir.path())).unwrap();

        lsm.put("a", b"old".to_vec()).unwrap();
        lsm.flush().unwrap();
        let view = lsm.view();

        lsm.put("a", b"new".to_vec()).unwrap();
        lsm.compact_range(None, None).unwrap();

        assert_eq!(view.get(b"a").unwrap(), Some(b"old".to_vec()));
        assert_eq!(lsm.get(b"a").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_live_files_defer_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = LsmTree::open(config(dir.path())).unwrap();

        lsm.put("a", b"1".to_vec()).unwrap();
        lsm.flush().unwrap();
        lsm.put("b", b"2".to_vec()).unwrap();

        let live = lsm.live_files(Duration::from_secs(1)).unwrap();
        assert_eq!(live.sequence_number, 2);
        assert_eq!(live.tables.len(), 1);
        assert_eq!(live.wals.len(), 1);
        assert!(live.wals[0].size > 0);

        lsm.compact_range(None, None).unwrap();
        let pinned = dir.path().join(&live.tables[0].name);
        assert!(pinned.exists());

        drop(live);
        assert!(!pinned.exists());
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let err = LsmTree::open(LsmConfig {
            create_if_missing: false,
            ..config(&dir.path().join("absent"))
        })
        .err()
        .unwrap();
        assert!(err.is_invalid_argument());
    }
}
