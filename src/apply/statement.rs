// ABOUTME: Parameterized statement builder for replayed row changes
// ABOUTME: Identifiers are always quoted; values only ever travel as bound parameters

use std::fmt::Write as _;

use crate::catalog::{ResolvedType, UniqueKeySpec};
use crate::change::{ColumnChange, CommandType, QualifiedName};
use crate::error::{ReplicationError, Result};
use crate::utils::quote_ident;

/// A column change paired with its resolved target type.
#[derive(Debug, Clone)]
pub struct ResolvedColumn {
    pub change: ColumnChange,
    pub ty: ResolvedType,
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// 1-based parameter number.
    Param(usize),
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub column: String,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Equals { column: String, param: usize },
    IsNull { column: String },
}

impl Predicate {
    pub fn column(&self) -> &str {
        match self {
            Predicate::Equals { column, .. } | Predicate::IsNull { column } => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Insert {
        table: QualifiedName,
        values: Vec<Assignment>,
    },
    Update {
        table: QualifiedName,
        set: Vec<Assignment>,
        filter: Vec<Predicate>,
    },
    Delete {
        table: QualifiedName,
        filter: Vec<Predicate>,
    },
}

/// Text value bound to a parameter, parsed by the target using `ty`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundParam {
    pub value: String,
    pub ty: ResolvedType,
}

/// Parameter marker syntax of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// PostgreSQL: `$1`
    Dollar,
    /// SQLite: `?1`
    Question,
}

impl Placeholder {
    fn render(&self, n: usize) -> String {
        match self {
            Placeholder::Dollar => format!("${}", n),
            Placeholder::Question => format!("?{}", n),
        }
    }
}

/// A statement ready to execute, with its parameters in number order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChange {
    pub statement: Statement,
    pub params: Vec<BoundParam>,
}

impl PreparedChange {
    pub fn table(&self) -> &QualifiedName {
        match &self.statement {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    /// Parameter `n` (1-based).
    pub fn param(&self, n: usize) -> Option<&BoundParam> {
        n.checked_sub(1).and_then(|idx| self.params.get(idx))
    }

    /// Render SQL text for the target's placeholder style.
    pub fn sql(&self, style: Placeholder) -> String {
        let operand = |op: &Operand| match op {
            Operand::Param(n) => style.render(*n),
            Operand::Null => "NULL".to_string(),
        };
        let where_clause = |filter: &[Predicate]| {
            filter
                .iter()
                .map(|p| match p {
                    Predicate::Equals { column, param } => {
                        format!("{} = {}", quote_ident(column), style.render(*param))
                    }
                    Predicate::IsNull { column } => format!("{} IS NULL", quote_ident(column)),
                })
                .collect::<Vec<_>>()
                .join(" AND ")
        };

        let mut sql = String::new();
        match &self.statement {
            Statement::Insert { table, values } => {
                let columns: Vec<String> = values.iter().map(|a| quote_ident(&a.column)).collect();
                let operands: Vec<String> = values.iter().map(|a| operand(&a.value)).collect();
                let _ = write!(
                    sql,
                    "INSERT INTO {} ({}) VALUES ({})",
                    table.quoted(),
                    columns.join(", "),
                    operands.join(", ")
                );
            }
            Statement::Update { table, set, filter } => {
                let assignments: Vec<String> = set
                    .iter()
                    .map(|a| format!("{} = {}", quote_ident(&a.column), operand(&a.value)))
                    .collect();
                let _ = write!(
                    sql,
                    "UPDATE {} SET {} WHERE {}",
                    table.quoted(),
                    assignments.join(", "),
                    where_clause(filter)
                );
            }
            Statement::Delete { table, filter } => {
                let _ = write!(
                    sql,
                    "DELETE FROM {} WHERE {}",
                    table.quoted(),
                    where_clause(filter)
                );
            }
        }
        sql
    }
}

/// Builds one [`PreparedChange`], numbering parameters in the order they are
/// bound.
pub struct StatementBuilder {
    table: QualifiedName,
    params: Vec<BoundParam>,
}

impl StatementBuilder {
    pub fn new(table: QualifiedName) -> Self {
        Self {
            table,
            params: Vec::new(),
        }
    }

    /// Build the statement for `command`. `key` only matters for updates and
    /// deletes.
    pub fn build(
        table: QualifiedName,
        command: CommandType,
        columns: &[ResolvedColumn],
        key: &UniqueKeySpec,
    ) -> Result<PreparedChange> {
        let builder = StatementBuilder::new(table);
        match command {
            CommandType::Insert => Ok(builder.insert(columns)),
            CommandType::Update => builder.update(columns, key),
            CommandType::Delete => builder.delete(columns, key),
        }
    }

    pub fn insert(mut self, columns: &[ResolvedColumn]) -> PreparedChange {
        let values = columns
            .iter()
            .map(|col| Assignment {
                column: col.change.name.clone(),
                value: self.bind(col.change.inserted_value(), &col.ty),
            })
            .collect();
        PreparedChange {
            statement: Statement::Insert {
                table: self.table,
                values,
            },
            params: self.params,
        }
    }

    /// SET covers every column from the new values; WHERE covers the key
    /// columns from the prior values. SET parameters are numbered first.
    pub fn update(mut self, columns: &[ResolvedColumn], key: &UniqueKeySpec) -> Result<PreparedChange> {
        let set = columns
            .iter()
            .map(|col| Assignment {
                column: col.change.name.clone(),
                value: self.bind(col.change.new_value(), &col.ty),
            })
            .collect();
        let filter = self.filter(columns, key)?;
        Ok(PreparedChange {
            statement: Statement::Update {
                table: self.table,
                set,
                filter,
            },
            params: self.params,
        })
    }

    pub fn delete(mut self, columns: &[ResolvedColumn], key: &UniqueKeySpec) -> Result<PreparedChange> {
        let filter = self.filter(columns, key)?;
        Ok(PreparedChange {
            statement: Statement::Delete {
                table: self.table,
                filter,
            },
            params: self.params,
        })
    }

    fn bind(&mut self, value: Option<&str>, ty: &ResolvedType) -> Operand {
        match value {
            None => Operand::Null,
            Some(text) => {
                self.params.push(BoundParam {
                    value: text.to_string(),
                    ty: ty.clone(),
                });
                Operand::Param(self.params.len())
            }
        }
    }

    /// Predicates over the row-identifying columns, joined with AND when
    /// rendered. An empty filter is refused so a statement can never touch
    /// the whole table.
    fn filter(&mut self, columns: &[ResolvedColumn], key: &UniqueKeySpec) -> Result<Vec<Predicate>> {
        let filter: Vec<Predicate> = columns
            .iter()
            .filter(|col| key.identifies(&col.change.name))
            .map(|col| match self.bind(col.change.prior_value(), &col.ty) {
                Operand::Param(param) => Predicate::Equals {
                    column: col.change.name.clone(),
                    param,
                },
                Operand::Null => Predicate::IsNull {
                    column: col.change.name.clone(),
                },
            })
            .collect();

        if filter.is_empty() {
            return Err(ReplicationError::format(format!(
                "no key column of {} ({}) is present in the log entry",
                self.table,
                key.columns().join(", ")
            )));
        }
        Ok(filter)
    }
}
