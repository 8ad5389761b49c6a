// ABOUTME: PostgreSQL replica target - runs each group of replayed statements in one transaction
// ABOUTME: Values travel in text format so the server parses them with the resolved type

use std::error::Error;

use bytes::BytesMut;
use tokio_postgres::types::{to_sql_checked, Format, IsNull, ToSql, Type};
use tokio_postgres::GenericClient;

use crate::apply::{GroupOutcome, PreparedChange, Placeholder, ReplicaTarget};
use crate::catalog::{Catalog, ResolvedType, UniqueKeySpec};
use crate::change::QualifiedName;
use crate::error::Result;
use crate::session::SessionContext;
use crate::utils::quote_ident;

use super::{catalog, statement_error};

/// Session setting the access guard trigger consults.
pub const MODE_SETTING: &str = "trigger_replicator.mode";

/// SQLSTATE the access guard trigger raises. Reported as `AccessViolation`.
pub const GUARD_SQLSTATE: &str = "TR001";

/// A text-format parameter. The server parses it as the parameter's type,
/// which is how a value of any type is bound from its log text.
#[derive(Debug)]
struct TextParam<'a>(&'a str);

impl ToSql for TextParam<'_> {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        out.extend_from_slice(self.0.as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// Catalog and replica target over a PostgreSQL client or transaction.
pub struct PgReplica<'a, C> {
    client: &'a mut C,
}

impl<'a, C: GenericClient> PgReplica<'a, C> {
    pub fn new(client: &'a mut C) -> Self {
        Self { client }
    }

    /// Install a trigger on `table` that rejects writes unless the session is
    /// in daemon mode.
    pub async fn install_access_guard(&self, table: &QualifiedName) -> Result<()> {
        self.client.batch_execute(&guard_trigger_sql(table)).await?;
        tracing::info!("Access guard installed on {}", table);
        Ok(())
    }
}

fn guard_trigger_sql(table: &QualifiedName) -> String {
    let function = format!(
        "{}.{}",
        quote_ident(&table.schema),
        quote_ident(&format!("{}_replication_guard", table.table))
    );
    format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS $guard$
         BEGIN
             IF coalesce(current_setting('{setting}', true), '') <> 'daemon' THEN
                 RAISE EXCEPTION 'table %.% is replicated and must not be modified outside daemon mode',
                     TG_TABLE_SCHEMA, TG_TABLE_NAME USING ERRCODE = '{sqlstate}';
             END IF;
             IF TG_OP = 'DELETE' THEN
                 RETURN OLD;
             END IF;
             RETURN NEW;
         END
         $guard$;
         DROP TRIGGER IF EXISTS replication_guard ON {table};
         CREATE TRIGGER replication_guard BEFORE INSERT OR UPDATE OR DELETE ON {table}
             FOR EACH ROW EXECUTE FUNCTION {function}();",
        function = function,
        setting = MODE_SETTING,
        sqlstate = GUARD_SQLSTATE,
        table = table.quoted(),
    )
}

/// Parameter types when every one is a built-in; otherwise the server infers
/// them from the statement.
fn builtin_types(change: &PreparedChange) -> Option<Vec<Type>> {
    change
        .params
        .iter()
        .map(|p| p.ty.oid.and_then(Type::from_oid))
        .collect()
}

impl<C: GenericClient> Catalog for PgReplica<'_, C> {
    async fn unique_key(&self, table: &QualifiedName) -> Result<UniqueKeySpec> {
        catalog::unique_key(&*self.client, table).await
    }

    async fn resolve_type(&self, identifier: &str) -> Result<ResolvedType> {
        catalog::resolve_type(&*self.client, identifier).await
    }
}

impl<C: GenericClient> ReplicaTarget for PgReplica<'_, C> {
    async fn execute_group(&mut self, session: &SessionContext, changes: &[PreparedChange]) -> Result<GroupOutcome> {
        // Dropping the transaction on an error rolls it back
        let tx = self.client.transaction().await?;
        tx.query_one(
            "SELECT set_config($1, $2, true)",
            &[&MODE_SETTING, &session.mode().as_str()],
        )
        .await?;

        for (index, change) in changes.iter().enumerate() {
            let table = change.table();
            let sql = change.sql(Placeholder::Dollar);
            let statement = match builtin_types(change) {
                Some(types) => tx.prepare_typed(&sql, &types).await,
                None => tx.prepare(&sql).await,
            }
            .map_err(|e| statement_error(table, e))?;

            let params: Vec<TextParam<'_>> = change.params.iter().map(|p| TextParam(&p.value)).collect();
            let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let affected = tx
                .execute(&statement, &refs)
                .await
                .map_err(|e| statement_error(table, e))?;

            if affected != 1 {
                tx.rollback().await?;
                return Ok(GroupOutcome::RolledBack { index, affected });
            }
        }
        tx.commit().await?;
        Ok(GroupOutcome::Committed)
    }
}
