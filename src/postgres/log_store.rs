// ABOUTME: PostgreSQL-backed log store and snapshot source for the capture path
// ABOUTME: Log tables are split by generation: transactionlog_<n> and snapshotlog_<n>

use tokio_postgres::types::ToSql;
use tokio_postgres::GenericClient;

use crate::capture::{LogGeneration, LogStore, SnapshotSource};
use crate::change::{CommandType, TransactionLogRecord};
use crate::error::{ReplicationError, Result};
use crate::session::TransactionScope;
use crate::snapshot::{SnapshotDescriptor, SnapshotRecord, TransactionId};
use crate::utils::quote_ident;

fn to_bigint(id: TransactionId) -> Result<i64> {
    i64::try_from(id.0)
        .map_err(|_| ReplicationError::format(format!("transaction id {} exceeds bigint", id)))
}

fn from_bigint(value: i64) -> Result<TransactionId> {
    u64::try_from(value)
        .map(TransactionId)
        .map_err(|_| ReplicationError::format(format!("negative transaction id {}", value)))
}

/// Log store living in a schema of the source database.
///
/// `<schema>.currentlog` holds one row per generation; the highest id is the
/// one being written.
pub struct PgLogStore<'a, C> {
    client: &'a C,
    schema: String,
}

impl<'a, C: GenericClient> PgLogStore<'a, C> {
    pub fn new(client: &'a C, schema: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
        }
    }

    fn relation(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(name))
    }

    fn transaction_table(&self, generation: LogGeneration) -> String {
        self.relation(&format!("transactionlog_{}", generation))
    }

    fn snapshot_table(&self, generation: LogGeneration) -> String {
        self.relation(&format!("snapshotlog_{}", generation))
    }

    /// Create the schema and generation table if missing.
    pub async fn install(&self) -> Result<()> {
        let sql = format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {current} (
                 id bigint PRIMARY KEY,
                 created_at timestamptz NOT NULL DEFAULT now()
             );",
            schema = quote_ident(&self.schema),
            current = self.relation("currentlog"),
        );
        self.client.batch_execute(&sql).await?;
        tracing::info!("Log store installed in schema {}", self.schema);
        Ok(())
    }

    /// Start a new generation, creating its tables. Subsequent writes go there.
    pub async fn start_generation(&self) -> Result<LogGeneration> {
        let next = match self.latest_generation().await? {
            Some(LogGeneration(id)) => LogGeneration(id + 1),
            None => LogGeneration(1),
        };

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {tx} (
                 rowid bigserial PRIMARY KEY,
                 xaction bigint NOT NULL,
                 cmdtype char(1) NOT NULL,
                 tabname text NOT NULL,
                 info text NOT NULL
             );
             CREATE TABLE IF NOT EXISTS {snap} (
                 current_xaction bigint PRIMARY KEY,
                 min_xaction bigint NOT NULL,
                 max_xaction bigint NOT NULL,
                 outstanding_xactions text NOT NULL
             );",
            tx = self.transaction_table(next),
            snap = self.snapshot_table(next),
        );
        self.client.batch_execute(&sql).await?;
        self.client
            .execute(
                &format!("INSERT INTO {} (id) VALUES ($1)", self.relation("currentlog")),
                &[&next.0],
            )
            .await?;

        tracing::info!("Started log generation {}", next);
        Ok(next)
    }

    async fn latest_generation(&self) -> Result<Option<LogGeneration>> {
        let row = self
            .client
            .query_one(
                &format!("SELECT max(id) FROM {}", self.relation("currentlog")),
                &[],
            )
            .await?;
        Ok(row.get::<_, Option<i64>>(0).map(LogGeneration))
    }

    /// Records of one generation in write order.
    pub async fn read_transactions(&self, generation: LogGeneration) -> Result<Vec<TransactionLogRecord>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT xaction, cmdtype::text, tabname, info FROM {} ORDER BY rowid",
                    self.transaction_table(generation)
                ),
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let code: String = row.get(1);
                Ok(TransactionLogRecord {
                    transaction_id: from_bigint(row.get(0))?,
                    command: CommandType::from_code(&code)?,
                    table: row.get(2),
                    column_info: row.get(3),
                })
            })
            .collect()
    }

    /// Snapshot records of one generation, ordered by transaction id.
    pub async fn read_snapshots(&self, generation: LogGeneration) -> Result<Vec<SnapshotRecord>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT current_xaction, min_xaction, max_xaction, outstanding_xactions
                     FROM {} ORDER BY current_xaction",
                    self.snapshot_table(generation)
                ),
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let outstanding: Option<String> = row.get(3);
                Ok(SnapshotRecord::from_columns(
                    from_bigint(row.get(0))?,
                    from_bigint(row.get(1))?,
                    from_bigint(row.get(2))?,
                    outstanding.as_deref(),
                ))
            })
            .collect()
    }
}

impl<C: GenericClient> LogStore for PgLogStore<'_, C> {
    async fn current_generation(&self) -> Result<LogGeneration> {
        self.latest_generation().await?.ok_or_else(|| {
            ReplicationError::connection(format!(
                "no log generation in {}; start one first",
                self.relation("currentlog")
            ))
        })
    }

    async fn append_transaction(
        &self,
        generation: LogGeneration,
        record: &TransactionLogRecord,
    ) -> Result<()> {
        let xaction = to_bigint(record.transaction_id)?;
        let code = record.command.code().to_string();
        let params: [&(dyn ToSql + Sync); 4] = [&xaction, &code, &record.table, &record.column_info];
        self.client
            .execute(
                &format!(
                    "INSERT INTO {} (xaction, cmdtype, tabname, info) VALUES ($1, $2, $3, $4)",
                    self.transaction_table(generation)
                ),
                &params,
            )
            .await?;
        Ok(())
    }

    async fn append_snapshot(&self, generation: LogGeneration, record: &SnapshotRecord) -> Result<()> {
        let current = to_bigint(record.current)?;
        let min = to_bigint(record.min)?;
        let max = to_bigint(record.max)?;
        let outstanding = record.outstanding_list();
        let params: [&(dyn ToSql + Sync); 4] = [&current, &min, &max, &outstanding];
        self.client
            .execute(
                &format!(
                    "INSERT INTO {} (current_xaction, min_xaction, max_xaction, outstanding_xactions)
                     VALUES ($1, $2, $3, $4)",
                    self.snapshot_table(generation)
                ),
                &params,
            )
            .await?;
        Ok(())
    }
}

/// Snapshot of the transaction running on `client`.
pub struct PgSnapshotSource<'a, C> {
    client: &'a C,
}

impl<'a, C: GenericClient> PgSnapshotSource<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Open a capture scope for the transaction running on this client.
    pub async fn begin_scope(&self) -> Result<TransactionScope> {
        let row = self.client.query_one("SELECT txid_current()", &[]).await?;
        Ok(TransactionScope::begin(from_bigint(row.get(0))?))
    }
}

impl<C: GenericClient> SnapshotSource for PgSnapshotSource<'_, C> {
    async fn current_snapshot(&self) -> Result<SnapshotDescriptor> {
        let row = self
            .client
            .query_one("SELECT txid_current_snapshot()::text", &[])
            .await?;
        let text: String = row.get(0);
        text.parse()
    }
}
