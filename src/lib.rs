// ABOUTME: Library root for trigger-replicator
// ABOUTME: Row-change capture into a compact log and single-row replay onto replicas

pub mod apply;
pub mod capture;
pub mod catalog;
pub mod change;
pub mod codec;
pub mod config;
pub mod error;
pub mod guard;
pub mod postgres;
pub mod replay;
pub mod session;
pub mod snapshot;
pub mod sqlite;
pub mod utils;

pub use apply::{LogApplyEngine, ReplicaTarget};
pub use capture::{CaptureTrigger, LogStore, RowEvent, SnapshotSource};
pub use catalog::{Catalog, UniqueKeyResolver, UniqueKeySpec};
pub use change::{ChangeLogEntry, ColumnChange, CommandType, QualifiedName, TransactionLogRecord};
pub use error::{ReplicationError, Result};
pub use guard::AccessGuard;
pub use session::{ReplicationMode, SessionContext, TransactionScope};
pub use snapshot::{SnapshotDescriptor, SnapshotRecord, TransactionId};
