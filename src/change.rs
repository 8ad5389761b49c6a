// ABOUTME: Row change data model - command types, column changes, and log entries
// ABOUTME: Shared by the capture side (producer) and the apply engine (consumer)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec;
use crate::error::{ReplicationError, Result};
use crate::snapshot::TransactionId;
use crate::utils::quote_ident;

/// The kind of row mutation a log entry replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
}

impl CommandType {
    /// Single-character code stored in the log.
    pub fn code(&self) -> char {
        match self {
            CommandType::Insert => 'I',
            CommandType::Update => 'U',
            CommandType::Delete => 'D',
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "I" => Ok(CommandType::Insert),
            "U" => Ok(CommandType::Update),
            "D" => Ok(CommandType::Delete),
            other => Err(ReplicationError::format(format!(
                "unknown command type '{}', expected 'I', 'U', or 'D'",
                other
            ))),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for CommandType {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        CommandType::from_code(s)
    }
}

/// A `schema.table` name as carried in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub schema: String,
    pub table: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `schema.table`, splitting at the first dot.
    pub fn parse(name: &str) -> Result<Self> {
        let (schema, table) = name.split_once('.').ok_or_else(|| {
            ReplicationError::format(format!("table name '{}' is not schema-qualified", name))
        })?;
        if schema.is_empty() || table.is_empty() {
            return Err(ReplicationError::format(format!(
                "table name '{}' has an empty schema or table part",
                name
            )));
        }
        if name.chars().any(|c| c.is_control()) {
            return Err(ReplicationError::format(
                "table name contains control characters",
            ));
        }
        Ok(Self::new(schema, table))
    }

    /// Quoted form for SQL text, e.g. `"public"."accounts"`.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// One column of a serialized row change.
///
/// The two slots are stored the way they travel on the wire; their meaning
/// depends on the command. Prefer the named accessors below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnChange {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub previous: Option<String>,
    pub current: Option<String>,
}

impl ColumnChange {
    /// Value written by an Insert.
    pub fn inserted_value(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    /// Value before an Update, or the value removed by a Delete.
    pub fn prior_value(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    /// Value after an Update.
    pub fn new_value(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

/// A captured row change, created inside the triggering transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub transaction_id: TransactionId,
    pub command: CommandType,
    pub table: QualifiedName,
    pub columns: Vec<ColumnChange>,
}

impl ChangeLogEntry {
    pub fn column_info(&self) -> Result<String> {
        codec::format_column_info(&self.columns)
    }

    pub fn to_record(&self) -> Result<TransactionLogRecord> {
        Ok(TransactionLogRecord {
            transaction_id: self.transaction_id,
            command: self.command,
            table: self.table.to_string(),
            column_info: self.column_info()?,
        })
    }
}

/// Persisted shape of a log entry: `(xaction, cmdtype, tabname, info)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogRecord {
    pub transaction_id: TransactionId,
    pub command: CommandType,
    pub table: String,
    pub column_info: String,
}

impl TransactionLogRecord {
    /// Decode back into a structured entry.
    pub fn to_entry(&self) -> Result<ChangeLogEntry> {
        Ok(ChangeLogEntry {
            transaction_id: self.transaction_id,
            command: self.command,
            table: QualifiedName::parse(&self.table)?,
            columns: codec::parse_column_info(&self.column_info)?,
        })
    }
}
