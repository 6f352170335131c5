use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::keys::KeyLayout;
use crate::lsm::FilterDecision;
use crate::ttl::{Clock, SystemClock, TtlWidth};

pub const OPTIONS_FILE: &str = "OPTIONS";

type MergeFunc = dyn Fn(Option<&[u8]>, &[&[u8]]) -> Vec<u8> + Send + Sync;
type FilterFunc = dyn Fn(&[u8], &[u8]) -> FilterDecision + Send + Sync;

/// User merge operator over payloads: `(existing, operands oldest-first)`.
#[derive(Clone)]
pub struct MergeOperator {
    pub name: String,
    pub func: Arc<MergeFunc>,
}

impl MergeOperator {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Option<&[u8]>, &[&[u8]]) -> Vec<u8> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Concatenates operands onto the existing value.
    pub fn string_append() -> Self {
        Self::new("StringAppend", |existing, operands| {
            let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
            for operand in operands {
                out.extend_from_slice(operand);
            }
            out
        })
    }
}

impl fmt::Debug for MergeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeOperator").field("name", &self.name).finish()
    }
}

/// User compaction filter over `(key, payload)`, consulted for records the
/// expiration filter keeps. A rewrite replaces the payload only.
#[derive(Clone)]
pub struct KeyValueFilter {
    pub name: String,
    pub func: Arc<FilterFunc>,
}

impl KeyValueFilter {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> FilterDecision + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for KeyValueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueFilter").field("name", &self.name).finish()
    }
}

/// Configuration for [`NemoDB::open`](crate::NemoDB::open).
#[derive(Clone, Debug)]
pub struct Options {
    pub create_if_missing: bool,
    pub merge_operator: Option<MergeOperator>,
    pub compaction_filter: Option<KeyValueFilter>,
    /// Width of the expiration envelope, 4 or 8 bytes.
    pub ttl_bytes: usize,
    /// ASCII uppercase letter prefixing meta keys.
    pub meta_prefix: u8,
    pub memtable_size_threshold: usize,
    /// Table count that triggers a background compaction; 0 disables it.
    pub compaction_trigger: usize,
    pub sync_writes: bool,
    pub clock: Arc<dyn Clock>,
    /// How long a checkpoint waits for the write lock.
    pub checkpoint_lock_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            merge_operator: None,
            compaction_filter: None,
            ttl_bytes: 4,
            meta_prefix: b'H',
            memtable_size_threshold: 4 * 1024 * 1024, // 4MB
            compaction_trigger: 4,
            sync_writes: false,
            clock: Arc::new(SystemClock),
            checkpoint_lock_timeout: Duration::from_secs(5),
        }
    }
}

impl Options {
    pub fn with_merge_operator(mut self, merge_operator: MergeOperator) -> Self {
        self.merge_operator = Some(merge_operator);
        self
    }

    pub fn with_compaction_filter(mut self, filter: KeyValueFilter) -> Self {
        self.compaction_filter = Some(filter);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttl_bytes(mut self, ttl_bytes: usize) -> Self {
        self.ttl_bytes = ttl_bytes;
        self
    }

    pub fn with_meta_prefix(mut self, meta_prefix: u8) -> Self {
        self.meta_prefix = meta_prefix;
        self
    }

    pub(crate) fn validate(&self) -> Result<(KeyLayout, TtlWidth)> {
        let layout = KeyLayout::new(self.meta_prefix)?;
        let width = TtlWidth::from_bytes(self.ttl_bytes)?;
        if self.memtable_size_threshold == 0 {
            return Err(Error::invalid("memtable_size_threshold must be positive"));
        }
        Ok((layout, width))
    }
}

/// The persisted part of the options: changing either field would make
/// existing data unreadable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OptionsStamp {
    pub ttl_bytes: usize,
    pub meta_prefix: u8,
}

impl OptionsStamp {
    pub fn of(options: &Options) -> Self {
        Self {
            ttl_bytes: options.ttl_bytes,
            meta_prefix: options.meta_prefix,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "ttl_bytes {}\nmeta_prefix {}\n",
            self.ttl_bytes, self.meta_prefix as char
        )
    }

    pub fn decode(content: &str) -> Result<Self> {
        let mut ttl_bytes = None;
        let mut meta_prefix = None;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let malformed = || Error::corruption(format!("malformed OPTIONS line {:?}", line));
            let (field, value) = line.split_once(' ').ok_or_else(malformed)?;
            match field {
                "ttl_bytes" => ttl_bytes = Some(value.trim().parse().map_err(|_| malformed())?),
                "meta_prefix" => match value.trim().as_bytes() {
                    [b] => meta_prefix = Some(*b),
                    _ => return Err(malformed()),
                },
                _ => return Err(malformed()),
            }
        }
        match (ttl_bytes, meta_prefix) {
            (Some(ttl_bytes), Some(meta_prefix)) => Ok(Self { ttl_bytes, meta_prefix }),
            _ => Err(Error::corruption("OPTIONS is missing a field")),
        }
    }

    pub fn load(dir: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(dir.join(OPTIONS_FILE)) {
            Ok(content) => Self::decode(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(OPTIONS_FILE), self.encode())?;
        Ok(())
    }

    /// Fail if `dir` was created with a different stamp.
    pub fn check(&self, dir: &Path) -> Result<()> {
        match Self::load(dir)? {
            Some(stored) if stored != *self => Err(Error::invalid(format!(
                "database was created with {:?}, opened with {:?}",
                stored, self
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_append() {
        let op = MergeOperator::string_append();
        assert_eq!((op.func)(Some(&b"a"[..]), &[&b"b"[..], &b"c"[..]]), b"abc".to_vec());
        assert_eq!((op.func)(None, &[&b"x"[..]]), b"x".to_vec());
    }

    #[test]
    fn test_validate() {
        assert!(Options::default().validate().is_ok());
        assert!(Options::default().with_ttl_bytes(3).validate().unwrap_err().is_invalid_argument());
        assert!(Options::default().with_meta_prefix(b'x').validate().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_stamp_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = OptionsStamp { ttl_bytes: 4, meta_prefix: b'H' };
        stamp.check(dir.path()).unwrap();
        stamp.save(dir.path()).unwrap();
        stamp.check(dir.path()).unwrap();

        let other = OptionsStamp { ttl_bytes: 8, meta_prefix: b'H' };
        assert!(other.check(dir.path()).unwrap_err().is_invalid_argument());
        assert_eq!(OptionsStamp::decode(&stamp.encode()).unwrap(), stamp);
    }
}
