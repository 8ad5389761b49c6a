// ABOUTME: PostgreSQL catalog queries - row-identifying index and type lookup
// ABOUTME: Uses pg_index/pg_attribute joins instead of parsing index definitions

use tokio_postgres::GenericClient;

use crate::catalog::{ResolvedType, UniqueKeySpec};
use crate::change::QualifiedName;
use crate::error::{ReplicationError, Result};

/// Key columns of the index that identifies rows of `table`.
///
/// The primary key wins; otherwise the unique index with the fewest key
/// columns, ties broken by index oid. Expression and partial indexes are
/// skipped, as are indexes still being built. No qualifying index yields a
/// full-row key.
pub async fn unique_key<C: GenericClient>(client: &C, table: &QualifiedName) -> Result<UniqueKeySpec> {
    let rows = client
        .query(
            "SELECT i.indexrelid::regclass::text, a.attname
             FROM pg_index i
             JOIN pg_class c ON c.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
             WHERE n.nspname = $1
               AND c.relname = $2
               AND i.indisunique
               AND i.indisvalid
               AND i.indexprs IS NULL
               AND i.indpred IS NULL
               AND k.ord <= i.indnkeyatts
             ORDER BY i.indisprimary DESC, i.indnkeyatts, i.indexrelid, k.ord",
            &[&table.schema, &table.table],
        )
        .await?;

    let Some(first) = rows.first() else {
        return Ok(UniqueKeySpec::full_row());
    };
    let chosen: String = first.get(0);

    let columns = rows
        .iter()
        .take_while(|row| row.get::<_, String>(0) == chosen)
        .map(|row| row.get::<_, String>(1))
        .collect();
    tracing::trace!("Using index {} for {}", chosen, table);
    Ok(UniqueKeySpec::new(columns))
}

/// Resolve a type identifier: a numeric oid, or any name `to_regtype`
/// understands (`int4`, `integer`, `numeric(10,2)`, `myschema.mytype`).
pub async fn resolve_type<C: GenericClient>(client: &C, identifier: &str) -> Result<ResolvedType> {
    let row = match identifier.parse::<u32>() {
        Ok(oid) => {
            client
                .query_opt(
                    "SELECT t.oid, format_type(t.oid, NULL) FROM pg_type t WHERE t.oid = $1",
                    &[&oid],
                )
                .await?
        }
        Err(_) => {
            client
                .query_opt(
                    "SELECT t.oid, format_type(t.oid, NULL)
                     FROM pg_type t
                     WHERE t.oid = to_regtype($1)",
                    &[&identifier],
                )
                .await
                // to_regtype still raises on syntactically invalid names
                .map_err(|e| match e.as_db_error() {
                    Some(_) => ReplicationError::TypeResolution(identifier.to_string()),
                    None => ReplicationError::from(e),
                })?
        }
    };

    let row = row.ok_or_else(|| ReplicationError::TypeResolution(identifier.to_string()))?;
    Ok(ResolvedType {
        identifier: identifier.to_string(),
        oid: Some(row.get(0)),
        name: row.get(1),
    })
}
