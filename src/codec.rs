// ABOUTME: Column codec for the log wire format - null sentinel plus base64 slots
// ABOUTME: Formats and parses the `name:type:previous:current|...` column-info string

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::change::ColumnChange;
use crate::error::{ReplicationError, Result};

/// Separates columns in a column-info string.
pub const COLUMN_SEPARATOR: char = '|';
/// Separates the four fields of one column.
pub const FIELD_SEPARATOR: char = ':';
/// Slot token meaning SQL NULL.
pub const NULL_SENTINEL: &str = "!";

/// Encode one slot. The base64 alphabet (`A-Z a-z 0-9 + / =`) never contains
/// a separator or the null sentinel, so any text survives unescaped.
pub fn encode_slot(value: Option<&str>) -> String {
    match value {
        None => NULL_SENTINEL.to_string(),
        Some(text) => STANDARD.encode(text.as_bytes()),
    }
}

/// Decode one slot.
///
/// An empty token decodes to an empty, non-null string; the sentinel decodes
/// to `None`.
pub fn decode_slot(token: &str) -> Result<Option<String>> {
    if token.is_empty() {
        return Ok(Some(String::new()));
    }
    if token == NULL_SENTINEL {
        return Ok(None);
    }
    let bytes = STANDARD
        .decode(token)
        .map_err(|e| ReplicationError::format(format!("invalid base64 slot '{}': {}", token, e)))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| ReplicationError::format(format!("slot '{}' is not valid UTF-8 text", token)))
}

/// Render an ordered list of column changes as a column-info string.
///
/// Names and type identifiers travel unencoded, so one containing a separator
/// is rejected here instead of producing an entry that cannot be parsed.
pub fn format_column_info(columns: &[ColumnChange]) -> Result<String> {
    let mut fields = Vec::with_capacity(columns.len());
    for col in columns {
        check_bare_field("column name", &col.name)?;
        check_bare_field("type identifier", &col.type_name)?;
        fields.push(format!(
            "{}{sep}{}{sep}{}{sep}{}",
            col.name,
            col.type_name,
            encode_slot(col.previous.as_deref()),
            encode_slot(col.current.as_deref()),
            sep = FIELD_SEPARATOR
        ));
    }
    Ok(fields.join(&COLUMN_SEPARATOR.to_string()))
}

fn check_bare_field(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ReplicationError::format(format!("{} is empty", what)));
    }
    if value.contains(COLUMN_SEPARATOR) || value.contains(FIELD_SEPARATOR) {
        return Err(ReplicationError::format(format!(
            "{} '{}' contains '{}' or '{}' and cannot be logged",
            what, value, COLUMN_SEPARATOR, FIELD_SEPARATOR
        )));
    }
    Ok(())
}

/// Parse a column-info string back into column changes, preserving order.
pub fn parse_column_info(info: &str) -> Result<Vec<ColumnChange>> {
    if info.is_empty() {
        return Err(ReplicationError::format("column info is empty"));
    }

    info.split(COLUMN_SEPARATOR)
        .enumerate()
        .map(|(idx, raw)| {
            let fields: Vec<&str> = raw.split(FIELD_SEPARATOR).collect();
            if fields.len() != 4 {
                return Err(ReplicationError::format(format!(
                    "column {} has {} fields, expected name:type:previous:current",
                    idx,
                    fields.len()
                )));
            }
            if fields[0].is_empty() || fields[1].is_empty() {
                return Err(ReplicationError::format(format!(
                    "column {} is missing its name or type",
                    idx
                )));
            }
            Ok(ColumnChange {
                name: fields[0].to_string(),
                type_name: fields[1].to_string(),
                previous: decode_slot(fields[2])?,
                current: decode_slot(fields[3])?,
            })
        })
        .collect()
}
