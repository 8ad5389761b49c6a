// ABOUTME: LogApplyEngine - replays one log entry as an insert, update, or delete
// ABOUTME: Exactly one row must be affected or the change is rolled back and reported

pub mod statement;

use std::collections::HashMap;
use std::future::Future;

use crate::catalog::{Catalog, ResolvedType, UniqueKeyResolver, UniqueKeySpec};
use crate::change::{ColumnChange, CommandType, QualifiedName, TransactionLogRecord};
use crate::codec;
use crate::error::{ReplicationError, Result};
use crate::session::SessionContext;

pub use statement::{PreparedChange, Placeholder, ResolvedColumn, StatementBuilder};

/// How a group of changes run in one replica transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Every change affected exactly one row and the transaction committed.
    Committed,
    /// The change at `index` affected `affected` rows; nothing was kept.
    RolledBack { index: usize, affected: u64 },
}

/// Where replayed statements run.
pub trait ReplicaTarget {
    /// Execute `changes` in order inside one transaction.
    ///
    /// Implementations stop at the first change that does not affect exactly
    /// one row, roll the whole transaction back, and must not retry.
    fn execute_group(
        &mut self,
        session: &SessionContext,
        changes: &[PreparedChange],
    ) -> impl Future<Output = Result<GroupOutcome>>;

    /// Execute `change` atomically and return the number of rows it affected.
    fn execute_single_row(
        &mut self,
        session: &SessionContext,
        change: &PreparedChange,
    ) -> impl Future<Output = Result<u64>> {
        async move {
            match self.execute_group(session, std::slice::from_ref(change)).await? {
                GroupOutcome::Committed => Ok(1),
                GroupOutcome::RolledBack { affected, .. } => Ok(affected),
            }
        }
    }
}

/// Applies serialized row changes to a replica.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogApplyEngine;

impl LogApplyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Wire-level entry point: `apply(commandType, qualifiedTableName, columnInfo)`.
    pub async fn apply<H: Catalog + ReplicaTarget>(
        &self,
        session: &SessionContext,
        host: &mut H,
        command_code: &str,
        table: &str,
        column_info: &str,
    ) -> Result<()> {
        let columns = codec::parse_column_info(column_info)?;
        let command = CommandType::from_code(command_code)?;
        let table = QualifiedName::parse(table)?;
        self.apply_entry(session, host, command, &table, columns).await
    }

    /// Apply a stored log record.
    pub async fn apply_record<H: Catalog + ReplicaTarget>(
        &self,
        session: &SessionContext,
        host: &mut H,
        record: &TransactionLogRecord,
    ) -> Result<()> {
        let entry = record.to_entry()?;
        self.apply_entry(session, host, entry.command, &entry.table, entry.columns)
            .await
    }

    pub async fn apply_entry<H: Catalog + ReplicaTarget>(
        &self,
        session: &SessionContext,
        host: &mut H,
        command: CommandType,
        table: &QualifiedName,
        columns: Vec<ColumnChange>,
    ) -> Result<()> {
        let change = self.prepare(&*host, command, table, columns).await?;
        tracing::debug!(
            "Applying {} to {}: {}",
            command,
            table,
            change.sql(Placeholder::Dollar)
        );

        let affected = host.execute_single_row(session, &change).await?;
        if affected != 1 {
            tracing::warn!(
                "{} on {} affected {} rows; refusing to accept the entry",
                command,
                table,
                affected
            );
            return Err(ReplicationError::Cardinality {
                table: table.to_string(),
                affected,
            });
        }
        Ok(())
    }

    /// Apply the records of one source transaction as a single replica
    /// transaction. Either every record lands or none does.
    pub async fn apply_transaction<H: Catalog + ReplicaTarget>(
        &self,
        session: &SessionContext,
        host: &mut H,
        records: &[TransactionLogRecord],
    ) -> Result<()> {
        let mut changes = Vec::with_capacity(records.len());
        for record in records {
            let entry = record.to_entry()?;
            let change = self
                .prepare(&*host, entry.command, &entry.table, entry.columns)
                .await?;
            tracing::debug!(
                "Applying {} to {} in transaction {}: {}",
                entry.command,
                entry.table,
                entry.transaction_id,
                change.sql(Placeholder::Dollar)
            );
            changes.push(change);
        }

        match host.execute_group(session, &changes).await? {
            GroupOutcome::Committed => Ok(()),
            GroupOutcome::RolledBack { index, affected } => {
                let table = changes
                    .get(index)
                    .map(|change| change.table().to_string())
                    .unwrap_or_default();
                tracing::warn!(
                    "Change {} of {} on {} affected {} rows; rolled back the transaction",
                    index + 1,
                    changes.len(),
                    table,
                    affected
                );
                Err(ReplicationError::Cardinality { table, affected })
            }
        }
    }

    /// Resolve types and keys against the catalog and build the statement,
    /// without executing it.
    pub async fn prepare<C: Catalog>(
        &self,
        catalog: &C,
        command: CommandType,
        table: &QualifiedName,
        columns: Vec<ColumnChange>,
    ) -> Result<PreparedChange> {
        let columns = resolve_column_types(catalog, columns).await?;

        let key = match command {
            CommandType::Insert => UniqueKeySpec::full_row(),
            CommandType::Update | CommandType::Delete => {
                UniqueKeyResolver::new(catalog).resolve(table).await?
            }
        };

        StatementBuilder::build(table.clone(), command, &columns, &key)
    }
}

/// Resolve each distinct type identifier once per call.
async fn resolve_column_types<C: Catalog>(
    catalog: &C,
    columns: Vec<ColumnChange>,
) -> Result<Vec<ResolvedColumn>> {
    let mut resolved: HashMap<String, ResolvedType> = HashMap::new();
    let mut out = Vec::with_capacity(columns.len());
    for change in columns {
        let ty = match resolved.get(&change.type_name) {
            Some(ty) => ty.clone(),
            None => {
                let ty = catalog.resolve_type(&change.type_name).await?;
                resolved.insert(change.type_name.clone(), ty.clone());
                ty
            }
        };
        out.push(ResolvedColumn { change, ty });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Catalog and target double that records what it was asked to run.
    struct RecordingHost {
        key: UniqueKeySpec,
        affected: u64,
        executed: Vec<PreparedChange>,
        key_lookups: Cell<usize>,
    }

    impl RecordingHost {
        fn new(key: &[&str], affected: u64) -> Self {
            Self {
                key: UniqueKeySpec::new(key.iter().map(|s| s.to_string()).collect()),
                affected,
                executed: Vec::new(),
                key_lookups: Cell::new(0),
            }
        }
    }

    impl Catalog for RecordingHost {
        async fn unique_key(&self, _table: &QualifiedName) -> Result<UniqueKeySpec> {
            self.key_lookups.set(self.key_lookups.get() + 1);
            Ok(self.key.clone())
        }

        async fn resolve_type(&self, identifier: &str) -> Result<ResolvedType> {
            match identifier {
                "23" | "int4" => Ok(ResolvedType {
                    identifier: identifier.to_string(),
                    name: "integer".to_string(),
                    oid: Some(23),
                }),
                "text" => Ok(ResolvedType {
                    identifier: identifier.to_string(),
                    name: "text".to_string(),
                    oid: Some(25),
                }),
                other => Err(ReplicationError::TypeResolution(other.to_string())),
            }
        }
    }

    impl ReplicaTarget for RecordingHost {
        async fn execute_group(
            &mut self,
            _session: &SessionContext,
            changes: &[PreparedChange],
        ) -> Result<GroupOutcome> {
            for (index, change) in changes.iter().enumerate() {
                self.executed.push(change.clone());
                if self.affected != 1 {
                    return Ok(GroupOutcome::RolledBack {
                        index,
                        affected: self.affected,
                    });
                }
            }
            Ok(GroupOutcome::Committed)
        }
    }

    fn record(xid: u64, command: CommandType, info: &str) -> TransactionLogRecord {
        TransactionLogRecord {
            transaction_id: crate::snapshot::TransactionId(xid),
            command,
            table: "public.accounts".to_string(),
            column_info: info.to_string(),
        }
    }

    #[tokio::test]
    async fn applies_accounts_update_example() {
        let mut host = RecordingHost::new(&["id"], 1);
        let session = SessionContext::daemon();
        LogApplyEngine
            .apply(
                &session,
                &mut host,
                "U",
                "public.accounts",
                "id:23:Nw==:Nw==|balance:23:MTAw:MTUw",
            )
            .await
            .unwrap();

        assert_eq!(host.executed.len(), 1);
        let change = &host.executed[0];
        assert_eq!(
            change.sql(Placeholder::Dollar),
            "UPDATE \"public\".\"accounts\" SET \"id\" = $1, \"balance\" = $2 WHERE \"id\" = $3"
        );
        let bound: Vec<&str> = change.params.iter().map(|p| p.value.as_str()).collect();
        assert_eq!(bound, vec!["7", "150", "7"]);
        assert!(change.params.iter().all(|p| p.ty.oid == Some(23)));
    }

    #[tokio::test]
    async fn zero_or_many_rows_is_cardinality_error() {
        for affected in [0, 2] {
            let mut host = RecordingHost::new(&["id"], affected);
            let err = LogApplyEngine
                .apply(&SessionContext::daemon(), &mut host, "D", "public.accounts", "id:int4:Nw==:!")
                .await
                .unwrap_err();
            assert!(
                matches!(err, ReplicationError::Cardinality { affected: a, .. } if a == affected)
            );
        }
    }

    #[tokio::test]
    async fn unknown_command_is_format_error() {
        let mut host = RecordingHost::new(&[], 1);
        let err = LogApplyEngine
            .apply(&SessionContext::daemon(), &mut host, "X", "public.accounts", "id:int4:Nw==:!")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Format(_)));
        assert!(host.executed.is_empty());
    }

    #[tokio::test]
    async fn unknown_type_is_resolution_error() {
        let mut host = RecordingHost::new(&[], 1);
        let err = LogApplyEngine
            .apply(&SessionContext::daemon(), &mut host, "I", "public.accounts", "id:geometry:Nw==:!")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::TypeResolution(ref t) if t == "geometry"));
        assert!(host.executed.is_empty());
    }

    #[tokio::test]
    async fn insert_skips_key_lookup_and_update_repeats_it() {
        let mut host = RecordingHost::new(&["id"], 1);
        let session = SessionContext::daemon();
        LogApplyEngine
            .apply(&session, &mut host, "I", "public.accounts", "id:int4:Nw==:!")
            .await
            .unwrap();
        assert_eq!(host.key_lookups.get(), 0);

        for _ in 0..2 {
            LogApplyEngine
                .apply(&session, &mut host, "U", "public.accounts", "id:int4:Nw==:OA==")
                .await
                .unwrap();
        }
        assert_eq!(host.key_lookups.get(), 2);
    }

    #[tokio::test]
    async fn transaction_runs_as_one_group() {
        let mut host = RecordingHost::new(&["id"], 1);
        let records = vec![
            record(10, CommandType::Insert, "id:int4:Nw==:!"),
            record(10, CommandType::Update, "id:int4:Nw==:OA=="),
        ];
        LogApplyEngine
            .apply_transaction(&SessionContext::daemon(), &mut host, &records)
            .await
            .unwrap();
        assert_eq!(host.executed.len(), 2);
        assert!(host.executed[0].sql(Placeholder::Dollar).starts_with("INSERT"));
        assert!(host.executed[1].sql(Placeholder::Dollar).starts_with("UPDATE"));
    }

    #[tokio::test]
    async fn rolled_back_group_reports_cardinality() {
        let mut host = RecordingHost::new(&["id"], 0);
        let records = vec![record(10, CommandType::Delete, "id:int4:Nw==:!")];
        let err = LogApplyEngine
            .apply_transaction(&SessionContext::daemon(), &mut host, &records)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Cardinality { ref table, affected: 0 } if table == "public.accounts"));
    }

    #[tokio::test]
    async fn malformed_record_fails_before_anything_runs() {
        let mut host = RecordingHost::new(&["id"], 1);
        let records = vec![
            record(10, CommandType::Insert, "id:int4:Nw==:!"),
            record(10, CommandType::Update, "id:int4:Nw=="),
        ];
        let err = LogApplyEngine
            .apply_transaction(&SessionContext::daemon(), &mut host, &records)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Format(_)));
        assert!(host.executed.is_empty());
    }

    #[tokio::test]
    async fn unqualified_table_is_format_error() {
        let mut host = RecordingHost::new(&[], 1);
        let err = LogApplyEngine
            .apply(&SessionContext::daemon(), &mut host, "I", "accounts", "id:int4:Nw==:!")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Format(_)));
    }
}
