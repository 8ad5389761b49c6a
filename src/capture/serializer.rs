// ABOUTME: RowChangeSerializer - row image pairs to ordered column changes
// ABOUTME: Skips dropped columns and keeps descriptor order, which both ends rely on

use crate::change::{ChangeLogEntry, ColumnChange, QualifiedName};
use crate::snapshot::TransactionId;

use super::{RowEvent, RowImage};

/// One column of the source table as the trigger sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Host type identifier, e.g. `int4` or a type oid such as `23`.
    pub type_name: String,
    pub dropped: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            dropped: false,
        }
    }

    /// A dropped column still occupies its position in row images.
    pub fn dropped(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            dropped: true,
            ..Self::new(name, type_name)
        }
    }
}

/// Source table shape handed to the trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: QualifiedName,
    pub columns: Vec<ColumnDescriptor>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RowChangeSerializer;

impl RowChangeSerializer {
    /// Serialize a trigger event.
    ///
    /// Inserts and deletes carry their single row in the previous slot; only
    /// updates fill the current slot.
    pub fn serialize<R: RowImage + ?Sized>(
        &self,
        transaction_id: TransactionId,
        table: &TableDescriptor,
        event: &RowEvent<'_, R>,
    ) -> ChangeLogEntry {
        let (previous, current) = match event {
            RowEvent::Insert { new } => (Some(*new), None),
            RowEvent::Update { old, new } => (Some(*old), Some(*new)),
            RowEvent::Delete { old } => (Some(*old), None),
        };

        ChangeLogEntry {
            transaction_id,
            command: event.command(),
            table: table.name.clone(),
            columns: self.serialize_columns(&table.columns, previous, current),
        }
    }

    /// Pair up two optional row images column by column.
    pub fn serialize_columns<R: RowImage + ?Sized>(
        &self,
        columns: &[ColumnDescriptor],
        previous: Option<&R>,
        current: Option<&R>,
    ) -> Vec<ColumnChange> {
        columns
            .iter()
            .enumerate()
            .filter(|(_, col)| !col.dropped)
            .map(|(idx, col)| ColumnChange {
                name: col.name.clone(),
                type_name: col.type_name.clone(),
                previous: previous.and_then(|row| row.column_text(idx)),
                current: current.and_then(|row| row.column_text(idx)),
            })
            .collect()
    }
}
