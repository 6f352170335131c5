// Public API
pub mod checkpoint;
pub mod db;
pub mod error;
pub mod filter;
pub mod keys;
pub mod lsm;
pub mod options;
pub mod ttl;
pub mod version;

// Internal modules
pub(crate) mod varint;

pub use checkpoint::{Checkpoint, CheckpointFiles};
pub use db::{DbIterator, NemoDB, Record, WriteBatch, WriteOp};
pub use error::{Error, Result};
pub use keys::{DataKey, KeyKind, KeyLayout};
pub use lsm::FilterDecision;
pub use options::{KeyValueFilter, MergeOperator, Options};
pub use ttl::{Clock, KeyTtl, ManualClock, SystemClock};
