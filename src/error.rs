// ABOUTME: Error taxonomy shared by the capture and apply paths
// ABOUTME: Every variant is fatal for the call that raised it; nothing retries internally

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The query interface or log store could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// A log entry, command code, or table name could not be parsed.
    #[error("malformed log entry: {0}")]
    Format(String),

    /// A column's type identifier is unknown to the target's type system.
    #[error("unknown type '{0}'")]
    TypeResolution(String),

    /// The statement matched a number of rows other than exactly one.
    #[error("{affected} rows affected in {table}, expected exactly one; replica has drifted from source")]
    Cardinality { table: String, affected: u64 },

    /// A write hit a replicated table outside of an authorized apply.
    #[error("table {table} is replicated and must not be modified outside daemon mode")]
    AccessViolation { table: String },

    /// The target rejected a well-formed statement.
    #[error("statement against {table} failed: {message}")]
    Statement { table: String, message: String },
}

impl ReplicationError {
    pub fn format(message: impl Into<String>) -> Self {
        ReplicationError::Format(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        ReplicationError::Connection(message.into())
    }

    /// True when the failure means source and replica disagree about row contents.
    pub fn is_drift(&self) -> bool {
        matches!(self, ReplicationError::Cardinality { .. })
    }
}

impl From<tokio_postgres::Error> for ReplicationError {
    fn from(err: tokio_postgres::Error) -> Self {
        ReplicationError::Connection(err.to_string())
    }
}
