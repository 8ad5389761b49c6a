// ABOUTME: AccessGuard - rejects writes to replicated tables outside daemon mode
// ABOUTME: Gates writes only; authorized row images pass through untouched

use crate::capture::RowEvent;
use crate::change::QualifiedName;
use crate::error::{ReplicationError, Result};
use crate::session::SessionContext;

/// Pre-write check for replicated tables on a replica node.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessGuard;

impl AccessGuard {
    /// Fail with `AccessViolation` unless the session is in daemon mode.
    pub fn authorize(&self, session: &SessionContext, table: &QualifiedName) -> Result<()> {
        if session.is_daemon() {
            return Ok(());
        }
        tracing::warn!(
            "Blocked write to replicated table {} from a {} session",
            table,
            session.mode()
        );
        Err(ReplicationError::AccessViolation {
            table: table.to_string(),
        })
    }

    /// Row-level hook fired before a write. Returns the image the write should
    /// proceed with: the new image for updates, the row itself otherwise.
    pub fn before_write<'a, R: ?Sized>(
        &self,
        session: &SessionContext,
        table: &QualifiedName,
        event: &RowEvent<'a, R>,
    ) -> Result<&'a R> {
        self.authorize(session, table)?;
        Ok(match event {
            RowEvent::Insert { new } => *new,
            RowEvent::Update { new, .. } => *new,
            RowEvent::Delete { old } => *old,
        })
    }
}
