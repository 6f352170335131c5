//! Meta key versions and per-key write locks.
//!
//! A meta key carries the version its data keys are written under. Each new
//! incarnation of a compound object bumps the version, which orphans every
//! data key of the previous incarnation without touching them.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::error::{Error, Result};
use crate::lsm::ReadView;
use crate::ttl::{is_expired, ValueCodec};

/// State of a meta key as seen by one read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaState {
    Absent,
    Live { version: u64, expire_at: u64 },
    Expired { version: u64 },
}

impl MetaState {
    pub fn from_raw(codec: &ValueCodec, raw: Option<&[u8]>, now: u64) -> Result<Self> {
        let Some(raw) = raw else {
            return Ok(MetaState::Absent);
        };
        let meta = codec.decode_meta(raw)?;
        if is_expired(meta.expire_at, now) {
            Ok(MetaState::Expired { version: meta.version })
        } else {
            Ok(MetaState::Live {
                version: meta.version,
                expire_at: meta.expire_at,
            })
        }
    }

    pub fn lookup(view: &ReadView, codec: &ValueCodec, meta_key: &[u8], now: u64) -> Result<Self> {
        let raw = view.get(meta_key)?;
        Self::from_raw(codec, raw.as_deref(), now)
    }

    /// Version readers should use, if the meta is live.
    pub fn live_version(&self) -> Option<u64> {
        match self {
            MetaState::Live { version, .. } => Some(*version),
            _ => None,
        }
    }

    /// Version a plain put on this meta writes: the live version is kept,
    /// an expired meta starts a new incarnation.
    pub fn version_for_put(&self) -> Result<u64> {
        match *self {
            MetaState::Absent => Ok(0),
            MetaState::Live { version, .. } => Ok(version),
            MetaState::Expired { version } => bump(version),
        }
    }

    /// Version a versioned put writes: any existing meta is bumped.
    pub fn version_for_new_incarnation(&self) -> Result<u64> {
        match *self {
            MetaState::Absent => Ok(0),
            MetaState::Live { version, .. } | MetaState::Expired { version } => bump(version),
        }
    }

    /// Version a delete writes into its tombstone meta.
    pub fn version_for_delete(&self) -> u64 {
        match *self {
            MetaState::Absent => 0,
            MetaState::Live { version, .. } | MetaState::Expired { version } => version,
        }
    }
}

pub fn bump(version: u64) -> Result<u64> {
    version
        .checked_add(1)
        .ok_or_else(|| Error::invalid("key version overflow"))
}

/// Table of per-key mutexes. Entries exist only while someone holds or
/// waits on them.
#[derive(Default)]
pub struct KeyLocks {
    table: DashMap<Vec<u8>, Arc<Mutex<()>>>,
}

pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: Vec<u8>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, key: &[u8]) -> KeyGuard<'_> {
        let mutex = Arc::clone(self.table.entry(key.to_vec()).or_default().value());
        KeyGuard {
            locks: self,
            key: key.to_vec(),
            guard: Some(mutex.lock_arc()),
        }
    }

    /// Lock several keys in sorted order. Duplicates are locked once.
    pub fn lock_all<I>(&self, keys: I) -> Vec<KeyGuard<'_>>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        keys.iter().map(|k| self.lock(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
