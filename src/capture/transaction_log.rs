// ABOUTME: TransactionLogWriter - persists one serialized row change per call
// ABOUTME: Records are keyed by the log generation active at write time

use crate::change::ChangeLogEntry;
use crate::error::Result;

use super::LogStore;

pub struct TransactionLogWriter<'a, S> {
    store: &'a S,
}

impl<'a, S: LogStore> TransactionLogWriter<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Append `entry` to the current log generation.
    pub async fn write(&self, entry: &ChangeLogEntry) -> Result<()> {
        let generation = self.store.current_generation().await?;
        let record = entry.to_record()?;
        tracing::trace!(
            "Logging {} on {} for transaction {} in generation {}",
            record.command,
            record.table,
            record.transaction_id,
            generation
        );
        self.store.append_transaction(generation, &record).await
    }
}
