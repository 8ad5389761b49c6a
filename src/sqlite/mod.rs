// ABOUTME: SQLite replica target - catalog lookups via pragmas and transactional apply
// ABOUTME: The schema part of a table name is the SQLite database name (main, temp, attached)

pub mod types;

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params_from_iter, Connection, OpenFlags};

use crate::apply::{GroupOutcome, PreparedChange, Placeholder, ReplicaTarget};
use crate::catalog::{Catalog, ResolvedType, UniqueKeySpec};
use crate::change::QualifiedName;
use crate::error::{ReplicationError, Result};
use crate::guard::AccessGuard;
use crate::session::SessionContext;

pub use types::StorageClass;

fn catalog_error(err: rusqlite::Error) -> ReplicationError {
    ReplicationError::connection(format!("SQLite catalog query failed: {}", err))
}

fn statement_error(table: &QualifiedName, err: rusqlite::Error) -> ReplicationError {
    ReplicationError::Statement {
        table: table.to_string(),
        message: err.to_string(),
    }
}

/// Replica backed by a SQLite database.
///
/// Tables registered with [`SqliteReplica::guard_table`] only accept
/// writes from daemon-mode sessions.
pub struct SqliteReplica {
    conn: Connection,
    guard: AccessGuard,
    guarded: HashSet<QualifiedName>,
}

impl SqliteReplica {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            guard: AccessGuard,
            guarded: HashSet::new(),
        }
    }

    /// Open (or create) a database file for read-write use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| {
            ReplicationError::connection(format!("failed to open SQLite database {}: {}", path.display(), e))
        })?;
        tracing::debug!("Opened SQLite replica {}", path.display());
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ReplicationError::connection(format!("failed to open in-memory SQLite: {}", e)))?;
        Ok(Self::new(conn))
    }

    /// Reject writes to `table` from sessions not in daemon mode.
    pub fn guard_table(&mut self, table: QualifiedName) {
        self.guarded.insert(table);
    }

    pub fn is_guarded(&self, table: &QualifiedName) -> bool {
        self.guarded.contains(table)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn primary_key(&self, table: &QualifiedName) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1, ?2) WHERE pk > 0 ORDER BY pk")
            .map_err(catalog_error)?;
        let columns = stmt
            .query_map([&table.table, &table.schema], |row| row.get::<_, String>(0))
            .map_err(catalog_error)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(catalog_error)?;
        Ok(columns)
    }

    /// Unique, non-partial indexes ordered by name, with their key columns.
    /// Indexes over expressions or the rowid are left out.
    fn unique_indexes(&self, table: &QualifiedName) -> Result<Vec<Vec<String>>> {
        let mut list = self
            .conn
            .prepare(
                "SELECT name FROM pragma_index_list(?1, ?2)
                 WHERE \"unique\" = 1 AND partial = 0
                 ORDER BY name",
            )
            .map_err(catalog_error)?;
        let names = list
            .query_map([&table.table, &table.schema], |row| row.get::<_, String>(0))
            .map_err(catalog_error)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(catalog_error)?;

        let mut info = self
            .conn
            .prepare("SELECT cid, name FROM pragma_index_info(?1, ?2) ORDER BY seqno")
            .map_err(catalog_error)?;

        let mut indexes = Vec::new();
        for name in names {
            let columns = info
                .query_map([&name, &table.schema], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
                })
                .map_err(catalog_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(catalog_error)?;

            let plain: Option<Vec<String>> = columns
                .into_iter()
                .map(|(cid, column)| if cid < 0 { None } else { column })
                .collect();
            match plain {
                Some(columns) if !columns.is_empty() => indexes.push(columns),
                _ => tracing::trace!("Skipping index {} on {}: not over plain columns", name, table),
            }
        }
        Ok(indexes)
    }
}

impl Catalog for SqliteReplica {
    async fn unique_key(&self, table: &QualifiedName) -> Result<UniqueKeySpec> {
        let primary = self.primary_key(table)?;
        if !primary.is_empty() {
            return Ok(UniqueKeySpec::new(primary));
        }

        // min_by_key keeps the first of equal-width indexes
        let narrowest = self
            .unique_indexes(table)?
            .into_iter()
            .min_by_key(|columns| columns.len());
        Ok(narrowest.map(UniqueKeySpec::new).unwrap_or_default())
    }

    async fn resolve_type(&self, identifier: &str) -> Result<ResolvedType> {
        let class = StorageClass::from_identifier(identifier)
            .ok_or_else(|| ReplicationError::TypeResolution(identifier.to_string()))?;
        Ok(ResolvedType {
            identifier: identifier.to_string(),
            name: class.name().to_string(),
            oid: None,
        })
    }
}

/// Parse each bound value with its column's storage class.
fn bind_values(change: &PreparedChange) -> Result<Vec<rusqlite::types::Value>> {
    change
        .params
        .iter()
        .map(|p| {
            StorageClass::from_name(&p.ty.name)
                .ok_or_else(|| ReplicationError::TypeResolution(p.ty.identifier.clone()))?
                .parse(&p.value)
        })
        .collect()
}

impl ReplicaTarget for SqliteReplica {
    async fn execute_group(&mut self, session: &SessionContext, changes: &[PreparedChange]) -> Result<GroupOutcome> {
        let mut bound = Vec::with_capacity(changes.len());
        for change in changes {
            let table = change.table();
            if self.is_guarded(table) {
                self.guard.authorize(session, table)?;
            }
            bound.push(bind_values(change)?);
        }
        let Some(first) = changes.first() else {
            return Ok(GroupOutcome::Committed);
        };

        let tx = self
            .conn
            .transaction()
            .map_err(|e| statement_error(first.table(), e))?;
        for (index, (change, values)) in changes.iter().zip(&bound).enumerate() {
            let table = change.table();
            let affected = tx
                .execute(&change.sql(Placeholder::Question), params_from_iter(values.iter()))
                .map_err(|e| statement_error(table, e))?;
            if affected != 1 {
                tx.rollback().map_err(|e| statement_error(table, e))?;
                return Ok(GroupOutcome::RolledBack {
                    index,
                    affected: affected as u64,
                });
            }
        }
        tx.commit().map_err(|e| statement_error(first.table(), e))?;
        Ok(GroupOutcome::Committed)
    }
}
