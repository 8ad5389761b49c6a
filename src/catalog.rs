// ABOUTME: Catalog access for the apply engine - unique keys and type resolution
// ABOUTME: Answers come from the live catalog on every call so schema changes are seen

use std::future::Future;

use crate::change::QualifiedName;
use crate::error::Result;

/// Ordered columns of the index used to identify a row.
///
/// Empty means the table has no usable unique index and every column takes
/// part in row identification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqueKeySpec {
    columns: Vec<String>,
}

impl UniqueKeySpec {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn full_row() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_full_row(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether `column` belongs in a row-identifying predicate.
    pub fn identifies(&self, column: &str) -> bool {
        self.is_full_row() || self.columns.iter().any(|c| c == column)
    }
}

/// A type identifier resolved against the target's type system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedType {
    /// Identifier as carried in the log (`int4`, `23`, ...).
    pub identifier: String,
    /// Target-side type name used to parse values.
    pub name: String,
    /// Type oid, when the target has them.
    pub oid: Option<u32>,
}

/// Target-side catalog lookups.
pub trait Catalog {
    /// The primary key, or failing that the narrowest unique index built
    /// only on plain columns. Expression and partial indexes never qualify.
    fn unique_key(&self, table: &QualifiedName) -> impl Future<Output = Result<UniqueKeySpec>>;

    /// Fails with `TypeResolution` if the identifier names no known type.
    fn resolve_type(&self, identifier: &str) -> impl Future<Output = Result<ResolvedType>>;
}

/// Discovers the row-identifying columns of a target table.
pub struct UniqueKeyResolver<'a, C> {
    catalog: &'a C,
}

impl<'a, C: Catalog> UniqueKeyResolver<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    /// Looks the key up fresh; results are not cached across calls.
    pub async fn resolve(&self, table: &QualifiedName) -> Result<UniqueKeySpec> {
        let key = self.catalog.unique_key(table).await?;
        if key.is_full_row() {
            tracing::debug!("{} has no unique index; matching on every column", table);
        } else {
            tracing::debug!("{} identified by ({})", table, key.columns().join(", "));
        }
        Ok(key)
    }
}
