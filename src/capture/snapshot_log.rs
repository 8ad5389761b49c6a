// ABOUTME: SnapshotLogWriter - records the in-flight transaction set once per transaction
// ABOUTME: The TransactionScope token, not hidden process state, tracks whether it ran

use crate::error::Result;
use crate::session::TransactionScope;
use crate::snapshot::SnapshotRecord;

use super::{LogStore, SnapshotSource};

/// Writes a [`SnapshotRecord`] the first time it is called for a transaction.
///
/// Replay uses these records to order transactions the way the source saw
/// them: for each replicated transaction, which others were still
/// uncommitted when it started.
pub struct SnapshotLogWriter<'a, S, P> {
    store: &'a S,
    source: &'a P,
}

impl<'a, S: LogStore, P: SnapshotSource> SnapshotLogWriter<'a, S, P> {
    pub fn new(store: &'a S, source: &'a P) -> Self {
        Self { store, source }
    }

    /// Record the snapshot for `scope` unless already recorded.
    ///
    /// Returns the record written, or `None` when this call was a no-op.
    pub async fn record(&self, scope: &mut TransactionScope) -> Result<Option<SnapshotRecord>> {
        if scope.snapshot_recorded() {
            return Ok(None);
        }

        let descriptor = self.source.current_snapshot().await?;
        let record = SnapshotRecord::new(scope.id(), descriptor);
        let generation = self.store.current_generation().await?;
        self.store.append_snapshot(generation, &record).await?;
        scope.mark_snapshot_recorded();

        tracing::debug!(
            "Recorded snapshot for transaction {} (xmin {}, xmax {}, {} in flight)",
            record.current,
            record.min,
            record.max,
            record.outstanding.len()
        );
        Ok(Some(record))
    }
}
