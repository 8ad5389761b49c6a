// ABOUTME: Capture side - turns row mutations into persisted log entries
// ABOUTME: Host integration points (row images, log store, snapshot source) are traits

pub mod serializer;
pub mod snapshot_log;
pub mod transaction_log;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::change::{ChangeLogEntry, CommandType, TransactionLogRecord};
use crate::error::{ReplicationError, Result};
use crate::session::TransactionScope;
use crate::snapshot::{SnapshotDescriptor, SnapshotRecord};

pub use serializer::{ColumnDescriptor, RowChangeSerializer, TableDescriptor};
pub use snapshot_log::SnapshotLogWriter;
pub use transaction_log::TransactionLogWriter;

/// Host capability to read one column of a row image as text.
pub trait RowImage {
    /// Text of the column at descriptor position `index`, or `None` for NULL.
    fn column_text(&self, index: usize) -> Option<String>;
}

impl RowImage for [Option<String>] {
    fn column_text(&self, index: usize) -> Option<String> {
        self.get(index).cloned().flatten()
    }
}

impl RowImage for Vec<Option<String>> {
    fn column_text(&self, index: usize) -> Option<String> {
        self.as_slice().column_text(index)
    }
}

/// Row images handed to a row-level trigger.
#[derive(Debug)]
pub enum RowEvent<'a, R: ?Sized> {
    Insert { new: &'a R },
    Update { old: &'a R, new: &'a R },
    Delete { old: &'a R },
}

impl<R: ?Sized> RowEvent<'_, R> {
    pub fn command(&self) -> CommandType {
        match self {
            RowEvent::Insert { .. } => CommandType::Insert,
            RowEvent::Update { .. } => CommandType::Update,
            RowEvent::Delete { .. } => CommandType::Delete,
        }
    }
}

/// Identifier of the active log segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogGeneration(pub i64);

impl fmt::Display for LogGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where captured records are persisted.
pub trait LogStore {
    fn current_generation(&self) -> impl Future<Output = Result<LogGeneration>>;

    fn append_transaction(
        &self,
        generation: LogGeneration,
        record: &TransactionLogRecord,
    ) -> impl Future<Output = Result<()>>;

    fn append_snapshot(
        &self,
        generation: LogGeneration,
        record: &SnapshotRecord,
    ) -> impl Future<Output = Result<()>>;
}

/// Host capability to describe the running transaction's snapshot.
pub trait SnapshotSource {
    fn current_snapshot(&self) -> impl Future<Output = Result<SnapshotDescriptor>>;
}

/// In-process log store. Records are kept per generation in arrival order.
#[derive(Debug)]
pub struct MemoryLogStore {
    generation: LogGeneration,
    available: AtomicBool,
    transactions: Mutex<Vec<(LogGeneration, TransactionLogRecord)>>,
    snapshots: Mutex<Vec<(LogGeneration, SnapshotRecord)>>,
}

impl MemoryLogStore {
    pub fn new(generation: LogGeneration) -> Self {
        Self {
            generation,
            available: AtomicBool::new(true),
            transactions: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    /// Simulate the store going away; later calls fail with a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn transactions(&self) -> Vec<TransactionLogRecord> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReplicationError::connection("log store is unavailable"))
        }
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new(LogGeneration(1))
    }
}

impl LogStore for MemoryLogStore {
    async fn current_generation(&self) -> Result<LogGeneration> {
        self.check_available()?;
        Ok(self.generation)
    }

    async fn append_transaction(
        &self,
        generation: LogGeneration,
        record: &TransactionLogRecord,
    ) -> Result<()> {
        self.check_available()?;
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((generation, record.clone()));
        Ok(())
    }

    async fn append_snapshot(&self, generation: LogGeneration, record: &SnapshotRecord) -> Result<()> {
        self.check_available()?;
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((generation, record.clone()));
        Ok(())
    }
}

/// Row-level AFTER trigger body: snapshot once per transaction, then
/// serialize and persist the row change.
pub struct CaptureTrigger<'a, S, P> {
    store: &'a S,
    snapshots: &'a P,
    serializer: RowChangeSerializer,
}

impl<'a, S: LogStore, P: SnapshotSource> CaptureTrigger<'a, S, P> {
    pub fn new(store: &'a S, snapshots: &'a P) -> Self {
        Self {
            store,
            snapshots,
            serializer: RowChangeSerializer,
        }
    }

    /// Capture one affected row. Returns the entry that was persisted.
    pub async fn on_row_change<R: RowImage + ?Sized>(
        &self,
        scope: &mut TransactionScope,
        table: &TableDescriptor,
        event: &RowEvent<'_, R>,
    ) -> Result<ChangeLogEntry> {
        self.capture_snapshot(scope).await?;

        let entry = self.serializer.serialize(scope.id(), table, event);
        TransactionLogWriter::new(self.store).write(&entry).await?;
        Ok(entry)
    }

    /// Record the transaction's snapshot if this scope has not done so yet.
    pub async fn capture_snapshot(
        &self,
        scope: &mut TransactionScope,
    ) -> Result<Option<SnapshotRecord>> {
        SnapshotLogWriter::new(self.store, self.snapshots)
            .record(scope)
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::change::QualifiedName;
    use crate::snapshot::TransactionId;

    /// Snapshot source returning a fixed descriptor.
    pub(crate) struct FixedSnapshot(pub SnapshotDescriptor);

    impl SnapshotSource for FixedSnapshot {
        async fn current_snapshot(&self) -> Result<SnapshotDescriptor> {
            Ok(self.0.clone())
        }
    }

    pub(crate) fn fixed_snapshot() -> FixedSnapshot {
        FixedSnapshot("100:110:101,105".parse().unwrap())
    }

    fn accounts() -> TableDescriptor {
        TableDescriptor {
            name: QualifiedName::new("public", "accounts"),
            columns: vec![
                ColumnDescriptor::new("id", "int4"),
                ColumnDescriptor::new("balance", "int4"),
            ],
        }
    }

    fn row(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn row_image_reads_by_position() {
        let image = row(&[Some("7"), None]);
        assert_eq!(image.column_text(0).as_deref(), Some("7"));
        assert_eq!(image.column_text(1), None);
        assert_eq!(image.column_text(5), None);
    }

    #[tokio::test]
    async fn trigger_persists_entry_and_one_snapshot() {
        let store = MemoryLogStore::default();
        let snapshots = fixed_snapshot();
        let trigger = CaptureTrigger::new(&store, &snapshots);
        let mut scope = TransactionScope::begin(TransactionId(107));
        let table = accounts();

        let first = row(&[Some("7"), Some("100")]);
        let second = row(&[Some("8"), Some("5")]);
        trigger
            .on_row_change(&mut scope, &table, &RowEvent::Insert { new: &first })
            .await
            .unwrap();
        let entry = trigger
            .on_row_change(&mut scope, &table, &RowEvent::Delete { old: &second })
            .await
            .unwrap();

        assert_eq!(entry.command, CommandType::Delete);
        let records = store.transactions();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].column_info, "id:int4:Nw==:!|balance:int4:MTAw:!");
        assert_eq!(records[1].command, CommandType::Delete);
        assert!(records.iter().all(|r| r.transaction_id == TransactionId(107)));

        let snaps = store.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].current, TransactionId(107));
        assert_eq!(snaps[0].outstanding_list(), "101,105");
    }

    #[tokio::test]
    async fn unavailable_store_is_connection_error() {
        let store = MemoryLogStore::default();
        store.set_available(false);
        let snapshots = fixed_snapshot();
        let trigger = CaptureTrigger::new(&store, &snapshots);
        let mut scope = TransactionScope::begin(TransactionId(1));
        let image = row(&[Some("1"), Some("2")]);

        let err = trigger
            .on_row_change(&mut scope, &accounts(), &RowEvent::Insert { new: &image })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Connection(_)));
        assert!(!scope.snapshot_recorded());
    }
}
