//! Compaction hooks and the background compaction worker.
//!
//! A compaction merges every SSTable into one, collapsing each key to its
//! current value. A registered [`CompactionFilterFactory`] creates one
//! [`CompactionFilter`] per run; the filter sees every surviving record and
//! may keep, drop or rewrite it.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::lsm::LsmInner;
use super::types::FilterDecision;
use super::view::ReadView;

/// Read-only state handed to a filter during one compaction.
pub struct CompactionContext {
    /// Point-in-time view captured when the compaction started.
    pub view: ReadView,
    pub begin: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
}

impl CompactionContext {
    /// Whether `key` lies in the requested `[begin, end)` range.
    pub fn in_range(&self, key: &[u8]) -> bool {
        self.begin.as_deref().is_none_or(|b| key >= b) && self.end.as_deref().is_none_or(|e| key < e)
    }
}

pub trait CompactionFilter {
    fn filter(&mut self, ctx: &CompactionContext, key: &[u8], value: &[u8]) -> FilterDecision;
}

pub trait CompactionFilterFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per compaction, before the compaction's view is captured.
    fn create(&self) -> Box<dyn CompactionFilter>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub input_tables: usize,
    pub input_entries: u64,
    pub output_entries: u64,
    pub dropped: u64,
    pub rewritten: u64,
}

/// Background thread running full compactions when signalled.
pub(crate) struct Compactor {
    tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Compactor {
    pub(crate) fn spawn(inner: Arc<LsmInner>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("nemodb-compaction".into())
            .spawn(move || run(inner, rx))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn signal(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(());
        }
    }
}

fn run(inner: Arc<LsmInner>, rx: Receiver<()>) {
    while rx.recv().is_ok() {
        // Coalesce signals that piled up while the last run was busy.
        while rx.try_recv().is_ok() {}

        if !inner.needs_compaction() {
            continue;
        }
        match inner.compact_range(None, None) {
            Ok(stats) => tracing::debug!(?stats, "background compaction finished"),
            Err(e) => tracing::warn!(error = %e, "background compaction failed"),
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        // Closing the channel stops the worker after its current run.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
