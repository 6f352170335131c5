//! The `NemoDB` facade: TTL-qualified reads and writes, meta key versioning
//! and snapshot iteration over the LSM tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::filter::ExpirationFilterFactory;
use crate::keys::{KeyKind, KeyLayout};
use crate::lsm::{
    BatchOp, CompactionStats, EntrySource, LiveEntriesIterator, LsmConfig, LsmStats, LsmTree,
    MergeFn, MergeIterator, ReadView,
};
use crate::options::{MergeOperator, Options, OptionsStamp};
use crate::ttl::{earliest, is_expired, Clock, KeyTtl, ValueCodec};
use crate::version::{bump, KeyLocks, MetaState};

/// One mutation of a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        /// Seconds to live; `None` takes the batch default.
        ttl: Option<u32>,
    },
    Merge {
        key: Vec<u8>,
        operand: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
}

impl WriteOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Merge { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Ordered set of mutations applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value: value.into(),
            ttl: None,
        });
        self
    }

    pub fn put_with_ttl(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, ttl: u32) -> &mut Self {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        });
        self
    }

    pub fn merge(&mut self, key: impl Into<Vec<u8>>, operand: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Merge {
            key: key.into(),
            operand: operand.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }
}

/// A visible record yielded by [`DbIterator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Epoch seconds at which the record disappears. For data keys this is
    /// the earlier of the record's and its meta key's expiration.
    pub expire_at: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
enum TtlMode {
    /// Puts without their own TTL use this one.
    Default(u32),
    /// Live keys keep their current expiration.
    KeepOld,
}

struct Visible {
    payload: Vec<u8>,
    /// The record's own expiration.
    expire_at: u64,
    /// Including the meta key's expiration for data keys.
    effective: u64,
}

pub struct NemoDB {
    tree: LsmTree,
    options: Options,
    layout: KeyLayout,
    codec: ValueCodec,
    locks: KeyLocks,
    path: PathBuf,
}

impl NemoDB {
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (layout, width) = options.validate()?;
        let codec = ValueCodec::new(width);

        let stamp = OptionsStamp::of(&options);
        stamp.check(&path)?;

        let merge_operator = options
            .merge_operator
            .clone()
            .map(|op| physical_merge(layout, codec, op));
        let filter = ExpirationFilterFactory::new(
            layout,
            codec,
            Arc::clone(&options.clock),
            options.compaction_filter.clone(),
        );
        let tree = LsmTree::open(LsmConfig {
            data_dir: path.clone(),
            memtable_size_threshold: options.memtable_size_threshold,
            create_if_missing: options.create_if_missing,
            sync_wal: options.sync_writes,
            compaction_trigger: options.compaction_trigger,
            merge_operator,
            compaction_filter: Some(Arc::new(filter)),
        })?;
        stamp.save(&path)?;

        info!(
            ?path,
            ttl_bytes = options.ttl_bytes,
            meta_prefix = %(options.meta_prefix as char),
            merge_operator = options.merge_operator.as_ref().map(|m| m.name.as_str()),
            "opened nemodb"
        );

        Ok(Self {
            tree,
            options,
            layout,
            codec,
            locks: KeyLocks::new(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub(crate) fn tree(&self) -> &LsmTree {
        &self.tree
    }

    fn now(&self) -> u64 {
        self.options.clock.now()
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_ttl(key, value, 0)
    }

    /// Store `value` for `ttl` seconds; 0 never expires.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: u32) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_with_ttl(key, value, ttl);
        self.apply(batch, TtlMode::Default(0))
    }

    pub fn merge(&self, key: &[u8], operand: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.merge(key, operand);
        self.apply(batch, TtlMode::Default(0))
    }

    /// Deleting a meta key expires it in place so its data keys stay orphaned.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.apply(batch, TtlMode::Default(0))
    }

    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.apply(batch, TtlMode::Default(0))
    }

    /// Apply `batch`, giving `default_ttl` to puts without their own TTL.
    pub fn write_with_ttl(&self, batch: WriteBatch, default_ttl: u32) -> Result<()> {
        self.apply(batch, TtlMode::Default(default_ttl))
    }

    /// Apply `batch`, letting puts on live keys keep their current expiration.
    /// Puts on absent or expired keys use their own TTL, if any.
    pub fn write_with_old_key_ttl(&self, batch: WriteBatch) -> Result<()> {
        self.apply(batch, TtlMode::KeepOld)
    }

    /// Start a new incarnation of a meta key. Returns the new version.
    pub fn put_with_key_version(&self, meta_key: &[u8], value: &[u8]) -> Result<u64> {
        if !matches!(self.layout.classify(meta_key), KeyKind::Meta { .. }) {
            return Err(Error::invalid(format!(
                "{:?} is not a meta key",
                String::from_utf8_lossy(meta_key)
            )));
        }

        let _guard = self.locks.lock(meta_key);
        let now = self.now();
        let view = self.tree.view();
        let state = MetaState::lookup(&view, &self.codec, meta_key, now)?;
        let version = state.version_for_new_incarnation()?;
        let stored = self.codec.stamp_meta(value, version, 0)?;
        self.tree.put(meta_key, stored)?;
        Ok(version)
    }

    /// Version of a live meta key.
    pub fn current_version(&self, meta_key: &[u8]) -> Result<Option<u64>> {
        let state = MetaState::lookup(&self.tree.view(), &self.codec, meta_key, self.now())?;
        Ok(state.live_version())
    }

    /// Physical key of `subkey` under the current version of `name`.
    pub fn data_key(&self, name: &[u8], subkey: &[u8]) -> Result<Option<Vec<u8>>> {
        let meta_key = self.layout.encode_meta_key(name);
        match self.current_version(&meta_key)? {
            Some(version) => self.layout.encode_data_key(name, version, subkey).map(Some),
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let now = self.now();
        let view = self.tree.view();
        Ok(self.read_visible(&view, key, now)?.map(|v| v.payload))
    }

    /// Remaining lifetime of a visible key; `None` if it is not visible.
    pub fn get_key_ttl(&self, key: &[u8]) -> Result<Option<KeyTtl>> {
        let now = self.now();
        let view = self.tree.view();
        Ok(self
            .read_visible(&view, key, now)?
            .map(|v| KeyTtl::from_expire_at(v.effective, now)))
    }

    /// Iterator over visible records in key order. The snapshot is taken on
    /// first use or by [`DbIterator::seek_to_first`].
    pub fn iter(&self) -> DbIterator<'_> {
        DbIterator { db: self, state: None }
    }

    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<CompactionStats> {
        self.tree.compact_range(begin, end)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()
    }

    pub fn stats(&self) -> LsmStats {
        self.tree.stats()
    }

    fn read_visible(&self, view: &ReadView, key: &[u8], now: u64) -> Result<Option<Visible>> {
        let Some(raw) = view.get(key)? else {
            return Ok(None);
        };
        self.decode_visible(key, &raw, now, &mut |meta_key| {
            MetaState::lookup(view, &self.codec, meta_key, now)
        })
    }

    fn decode_visible(
        &self,
        key: &[u8],
        raw: &[u8],
        now: u64,
        meta_lookup: &mut dyn FnMut(&[u8]) -> Result<MetaState>,
    ) -> Result<Option<Visible>> {
        let (payload, expire_at) = match self.layout.classify(key) {
            KeyKind::Meta { .. } => {
                let meta = self.codec.decode_meta(raw)?;
                (meta.payload, meta.expire_at)
            }
            _ => self.codec.decode(raw)?,
        };
        if is_expired(expire_at, now) {
            return Ok(None);
        }

        let effective = match self.layout.classify(key) {
            KeyKind::Data(data) => match meta_lookup(&self.layout.meta_key_of(&data))? {
                MetaState::Live { version, expire_at: meta_expire } if version == data.version => {
                    earliest(expire_at, meta_expire)
                }
                _ => return Ok(None),
            },
            _ => expire_at,
        };

        Ok(Some(Visible {
            payload: payload.to_vec(),
            expire_at,
            effective,
        }))
    }

    fn apply(&self, batch: WriteBatch, mode: TtlMode) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let lock_keys = batch
            .iter()
            .filter(|op| match op {
                WriteOp::Put { key, .. } => matches!(mode, TtlMode::KeepOld) || self.is_meta(key),
                WriteOp::Delete { key } => self.is_meta(key),
                WriteOp::Merge { .. } => false,
            })
            .map(|op| op.key().to_vec())
            .collect::<Vec<_>>();
        let _guards = self.locks.lock_all(lock_keys);

        let mut pending = PendingBatch {
            db: self,
            now: self.now(),
            view: self.tree.view(),
            metas: HashMap::new(),
            expiries: HashMap::new(),
        };
        let mut ops = Vec::with_capacity(batch.len());
        for op in batch.ops {
            ops.push(pending.encode(op, mode)?);
        }
        self.tree.write(ops)?;
        Ok(())
    }

    fn is_meta(&self, key: &[u8]) -> bool {
        matches!(self.layout.classify(key), KeyKind::Meta { .. })
    }
}

/// Read-modify-write state of one batch: what each key looks like after
/// the ops encoded so far.
struct PendingBatch<'a> {
    db: &'a NemoDB,
    now: u64,
    view: ReadView,
    metas: HashMap<Vec<u8>, MetaState>,
    /// Expiration of live non-meta keys; `None` when absent or expired.
    expiries: HashMap<Vec<u8>, Option<u64>>,
}

fn cached_meta(
    db: &NemoDB,
    view: &ReadView,
    metas: &mut HashMap<Vec<u8>, MetaState>,
    meta_key: &[u8],
    now: u64,
) -> Result<MetaState> {
    if let Some(state) = metas.get(meta_key) {
        return Ok(*state);
    }
    let state = MetaState::lookup(view, &db.codec, meta_key, now)?;
    metas.insert(meta_key.to_vec(), state);
    Ok(state)
}

impl PendingBatch<'_> {
    fn meta(&mut self, key: &[u8]) -> Result<MetaState> {
        cached_meta(self.db, &self.view, &mut self.metas, key, self.now)
    }

    fn live_expiry(&mut self, key: &[u8]) -> Result<Option<u64>> {
        if let Some(expiry) = self.expiries.get(key) {
            return Ok(*expiry);
        }
        let (db, now) = (self.db, self.now);
        let visible = match self.view.get(key)? {
            Some(raw) => {
                let (view, metas) = (&self.view, &mut self.metas);
                db.decode_visible(key, &raw, now, &mut |meta_key| {
                    cached_meta(db, view, metas, meta_key, now)
                })?
            }
            None => None,
        };
        let expiry = visible.map(|v| v.expire_at);
        self.expiries.insert(key.to_vec(), expiry);
        Ok(expiry)
    }

    fn encode(&mut self, op: WriteOp, mode: TtlMode) -> Result<BatchOp> {
        let codec = self.db.codec;
        let now = self.now;
        let is_meta = self.db.is_meta(op.key());

        match op {
            WriteOp::Put { key, value, ttl } if is_meta => {
                let state = self.meta(&key)?;
                let version = state.version_for_put()?;
                let expire_at = match (mode, state) {
                    (TtlMode::KeepOld, MetaState::Live { expire_at, .. }) => expire_at,
                    (TtlMode::KeepOld, _) => codec.expire_at_for(ttl.unwrap_or(0), now)?,
                    (TtlMode::Default(default), _) => codec.expire_at_for(ttl.unwrap_or(default), now)?,
                };
                let stored = codec.stamp_meta(&value, version, expire_at)?;
                self.metas.insert(key.clone(), MetaState::Live { version, expire_at });
                Ok(BatchOp::put(key, stored))
            }
            WriteOp::Put { key, value, ttl } => {
                let expire_at = match mode {
                    TtlMode::KeepOld => match self.live_expiry(&key)? {
                        Some(expire_at) => expire_at,
                        None => codec.expire_at_for(ttl.unwrap_or(0), now)?,
                    },
                    TtlMode::Default(default) => codec.expire_at_for(ttl.unwrap_or(default), now)?,
                };
                let stored = codec.stamp(&value, expire_at)?;
                self.expiries.insert(key.clone(), Some(expire_at));
                Ok(BatchOp::put(key, stored))
            }
            WriteOp::Merge { key, operand } => {
                if is_meta {
                    let next = match self.meta(&key)? {
                        live @ MetaState::Live { .. } => live,
                        MetaState::Expired { version } => MetaState::Live { version: bump(version)?, expire_at: 0 },
                        MetaState::Absent => MetaState::Live { version: 0, expire_at: 0 },
                    };
                    self.metas.insert(key.clone(), next);
                } else if matches!(mode, TtlMode::KeepOld) {
                    let expiry = self.live_expiry(&key)?.unwrap_or(0);
                    self.expiries.insert(key.clone(), Some(expiry));
                }
                Ok(BatchOp::merge(key, codec.stamp_operand(&operand, now)?))
            }
            WriteOp::Delete { key } if is_meta => match self.meta(&key)? {
                MetaState::Absent => Ok(BatchOp::delete(key)),
                state => {
                    let version = state.version_for_delete();
                    let stored = codec.stamp_meta(&[], version, now.max(1))?;
                    self.metas.insert(key.clone(), MetaState::Expired { version });
                    Ok(BatchOp::put(key, stored))
                }
            },
            WriteOp::Delete { key } => {
                self.expiries.insert(key.clone(), None);
                Ok(BatchOp::delete(key))
            }
        }
    }
}

/// Engine-level merge over stamped values.
///
/// Operands are applied in write order. An operand written at or after the
/// base's expiration starts over from an empty base with no expiration, and
/// for meta keys a new version. The result keeps the base's expiration.
fn physical_merge(layout: KeyLayout, codec: ValueCodec, user: MergeOperator) -> MergeFn {
    Arc::new(
        move |key: &[u8], existing: Option<&[u8]>, operands: &[&[u8]]| -> Result<Vec<u8>> {
            let is_meta = matches!(layout.classify(key), KeyKind::Meta { .. });
            let (mut base, mut version, mut expire_at) = match existing {
                None => (None, 0, 0),
                Some(raw) if is_meta => {
                    let meta = codec.decode_meta(raw)?;
                    (Some(meta.payload), meta.version, meta.expire_at)
                }
                Some(raw) => {
                    let (payload, expire_at) = codec.decode(raw)?;
                    (Some(payload), 0, expire_at)
                }
            };

            let mut segment: Vec<&[u8]> = Vec::with_capacity(operands.len());
            for raw in operands {
                let (operand, written_at) = codec.decode_operand(raw)?;
                if is_expired(expire_at, written_at) {
                    segment.clear();
                    base = None;
                    expire_at = 0;
                    if is_meta {
                        version = bump(version)?;
                    }
                }
                segment.push(operand);
            }

            let payload = (user.func)(base, &segment);
            if is_meta {
                codec.stamp_meta(&payload, version, expire_at)
            } else {
                codec.stamp(&payload, expire_at)
            }
        },
    )
}

struct IterState {
    view: ReadView,
    now: u64,
    entries: LiveEntriesIterator<MergeIterator<EntrySource>>,
    last_meta: Option<(Vec<u8>, MetaState)>,
}

/// Snapshot iterator over visible records.
pub struct DbIterator<'a> {
    db: &'a NemoDB,
    state: Option<IterState>,
}

impl DbIterator<'_> {
    /// Restart from the first key on a fresh snapshot.
    pub fn seek_to_first(&mut self) {
        let now = self.db.now();
        let view = self.db.tree.view();
        let entries = view.scan();
        self.state = Some(IterState {
            view,
            now,
            entries,
            last_meta: None,
        });
    }
}

impl Iterator for DbIterator<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state.is_none() {
            self.seek_to_first();
        }
        let db = self.db;
        let IterState {
            view,
            now,
            entries,
            last_meta,
        } = self.state.as_mut()?;

        loop {
            let (key, raw) = match entries.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            let mut lookup = |meta_key: &[u8]| -> Result<MetaState> {
                if let Some((cached, state)) = last_meta.as_ref() {
                    if cached.as_slice() == meta_key {
                        return Ok(*state);
                    }
                }
                let state = MetaState::lookup(view, &db.codec, meta_key, *now)?;
                *last_meta = Some((meta_key.to_vec(), state));
                Ok(state)
            };

            match db.decode_visible(key.as_bytes(), &raw, *now, &mut lookup) {
                Ok(Some(visible)) => {
                    return Some(Ok(Record {
                        key: key.0,
                        value: visible.payload,
                        expire_at: (visible.effective != 0).then_some(visible.effective),
                    }));
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
