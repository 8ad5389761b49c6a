// ABOUTME: Maps logged type identifiers onto SQLite storage classes
// ABOUTME: Parses log text into rusqlite values for binding

use rusqlite::types::Value;

use crate::error::{ReplicationError, Result};

/// How a logged value is stored in SQLite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Integer,
    Real,
    Text,
    Boolean,
    Numeric,
    Blob,
}

impl StorageClass {
    /// Resolve a PostgreSQL type name or oid, or a SQLite declared type.
    ///
    /// Length and precision modifiers are ignored: `varchar(20)` is `text`.
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        let base = identifier
            .split('(')
            .next()
            .unwrap_or(identifier)
            .trim()
            .to_ascii_lowercase();

        let class = match base.as_str() {
            "20" | "21" | "23" | "int" | "int2" | "int4" | "int8" | "integer" | "smallint"
            | "bigint" | "serial" | "bigserial" | "smallserial" => StorageClass::Integer,
            "700" | "701" | "real" | "float" | "float4" | "float8" | "double"
            | "double precision" => StorageClass::Real,
            "16" | "bool" | "boolean" => StorageClass::Boolean,
            "1700" | "numeric" | "decimal" => StorageClass::Numeric,
            "17" | "bytea" | "blob" => StorageClass::Blob,
            "25" | "1043" | "1042" | "19" | "1082" | "1114" | "1184" | "2950" | "114" | "3802"
            | "text" | "varchar" | "character varying" | "char" | "character" | "bpchar"
            | "name" | "date" | "timestamp" | "timestamptz" | "timestamp without time zone"
            | "timestamp with time zone" | "uuid" | "json" | "jsonb" | "clob" => StorageClass::Text,
            _ => return None,
        };
        Some(class)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageClass::Integer => "INTEGER",
            StorageClass::Real => "REAL",
            StorageClass::Text => "TEXT",
            StorageClass::Boolean => "BOOLEAN",
            StorageClass::Numeric => "NUMERIC",
            StorageClass::Blob => "BLOB",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            StorageClass::Integer,
            StorageClass::Real,
            StorageClass::Text,
            StorageClass::Boolean,
            StorageClass::Numeric,
            StorageClass::Blob,
        ]
        .into_iter()
        .find(|class| class.name() == name)
    }

    /// Parse the log text of a value.
    pub fn parse(&self, text: &str) -> Result<Value> {
        let invalid = || {
            ReplicationError::format(format!(
                "'{}' is not a valid {} value",
                text,
                self.name()
            ))
        };

        match self {
            StorageClass::Integer => text.trim().parse::<i64>().map(Value::Integer).map_err(|_| invalid()),
            StorageClass::Real => text.trim().parse::<f64>().map(Value::Real).map_err(|_| invalid()),
            StorageClass::Text => Ok(Value::Text(text.to_string())),
            StorageClass::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "y" | "yes" | "on" => Ok(Value::Integer(1)),
                "f" | "false" | "0" | "n" | "no" | "off" => Ok(Value::Integer(0)),
                _ => Err(invalid()),
            },
            StorageClass::Numeric => {
                let trimmed = text.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Ok(Value::Integer(i))
                } else if trimmed.parse::<f64>().is_ok() {
                    // Keep the exact decimal text; SQLite applies NUMERIC affinity
                    Ok(Value::Text(trimmed.to_string()))
                } else {
                    Err(invalid())
                }
            }
            StorageClass::Blob => match text.strip_prefix("\\x") {
                Some(hex) => decode_hex(hex).map(Value::Blob).ok_or_else(invalid),
                None => Ok(Value::Blob(text.as_bytes().to_vec())),
            },
        }
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}
