// ABOUTME: Per-session replication mode and per-transaction scope tokens
// ABOUTME: Replaces process-wide flags so each connection carries its own state

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::snapshot::TransactionId;

/// Whether a session may write to replicated tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Ordinary client session; guarded tables are read-only.
    #[default]
    Normal,
    /// Authorized replay in progress.
    Daemon,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::Normal => "normal",
            ReplicationMode::Daemon => "daemon",
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State owned by exactly one connection or session.
///
/// Not shared between sessions; hand each apply worker its own context.
#[derive(Debug, Default)]
pub struct SessionContext {
    mode: ReplicationMode,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session that starts in daemon mode, for replay workers.
    pub fn daemon() -> Self {
        Self {
            mode: ReplicationMode::Daemon,
        }
    }

    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    pub fn set_daemon_mode(&mut self) {
        tracing::debug!("Session switched to daemon mode");
        self.mode = ReplicationMode::Daemon;
    }

    pub fn set_normal_mode(&mut self) {
        tracing::debug!("Session switched to normal mode");
        self.mode = ReplicationMode::Normal;
    }

    pub fn is_daemon(&self) -> bool {
        self.mode == ReplicationMode::Daemon
    }
}

/// Token for one source transaction, created when the transaction starts and
/// passed to every capture call made inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionScope {
    id: TransactionId,
    snapshot_recorded: bool,
}

impl TransactionScope {
    pub fn begin(id: TransactionId) -> Self {
        Self {
            id,
            snapshot_recorded: false,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn snapshot_recorded(&self) -> bool {
        self.snapshot_recorded
    }

    pub(crate) fn mark_snapshot_recorded(&mut self) {
        self.snapshot_recorded = true;
    }
}
