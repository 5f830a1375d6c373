use super::{Change, RecordSink, RecordStore, StoreRepository};
use crate::error::Result;

/// Sink that keeps nothing beyond the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn persist(&self, _store: &RecordStore, _changes: &[Change]) -> Result<()> {
        Ok(())
    }
}

/// Reference repository kept entirely in memory.
pub type InMemoryRepository = StoreRepository<NullSink>;

impl StoreRepository<NullSink> {
    pub fn new() -> Self {
        Self::with_sink(RecordStore::new(), NullSink)
    }
}

impl Default for StoreRepository<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}
