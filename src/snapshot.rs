// ABOUTME: Transaction ids and per-transaction snapshot records
// ABOUTME: Answers which transactions were in flight when a replicated transaction began

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{ReplicationError, Result};

/// A 64-bit transaction id as reported by `txid_current()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(TransactionId)
            .map_err(|_| ReplicationError::format(format!("'{}' is not a transaction id", s)))
    }
}

/// The host's snapshot at transaction start: `xmin:xmax:xip,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub xmin: TransactionId,
    pub xmax: TransactionId,
    pub in_flight: Vec<TransactionId>,
}

impl FromStr for SnapshotDescriptor {
    type Err = ReplicationError;

    /// Parse the text form of PostgreSQL's `txid_snapshot`, e.g. `10:20:10,14,15`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, ':');
        let (Some(xmin), Some(xmax), Some(xip)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ReplicationError::format(format!(
                "snapshot '{}' is not of the form xmin:xmax:xip",
                s
            )));
        };
        let in_flight = if xip.is_empty() {
            Vec::new()
        } else {
            xip.split(',')
                .map(TransactionId::from_str)
                .collect::<Result<Vec<_>>>()?
        };
        Ok(Self {
            xmin: xmin.parse()?,
            xmax: xmax.parse()?,
            in_flight,
        })
    }
}

/// Snapshot log row, written at most once per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub current: TransactionId,
    pub min: TransactionId,
    pub max: TransactionId,
    pub outstanding: BTreeSet<TransactionId>,
}

impl SnapshotRecord {
    pub fn new(current: TransactionId, descriptor: SnapshotDescriptor) -> Self {
        Self {
            current,
            min: descriptor.xmin,
            max: descriptor.xmax,
            outstanding: descriptor.in_flight.into_iter().collect(),
        }
    }

    /// Build from stored columns. Empty or non-numeric items in the
    /// outstanding list are skipped.
    pub fn from_columns(
        current: TransactionId,
        min: TransactionId,
        max: TransactionId,
        outstanding: Option<&str>,
    ) -> Self {
        let outstanding = outstanding
            .unwrap_or_default()
            .split(',')
            .filter_map(|item| match item.parse::<TransactionId>() {
                Ok(id) => Some(id),
                Err(_) => {
                    if !item.is_empty() {
                        tracing::debug!("Ignoring non-numeric outstanding transaction '{}'", item);
                    }
                    None
                }
            })
            .collect();
        Self {
            current,
            min,
            max,
            outstanding,
        }
    }

    /// Comma-separated outstanding ids, as stored in the snapshot log.
    pub fn outstanding_list(&self) -> String {
        self.outstanding
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// True if `xid` had committed (or aborted) before this snapshot was taken.
    pub fn committed_before(&self, xid: TransactionId) -> bool {
        xid < self.min || (xid < self.max && !self.outstanding.contains(&xid))
    }

    /// True if `xid` was still running, or had not started, when this
    /// snapshot was taken.
    pub fn in_progress_or_later(&self, xid: TransactionId) -> bool {
        xid >= self.max || (xid >= self.min && self.outstanding.contains(&xid))
    }

    /// True if `xid` had not finished when `self` was taken but had by the
    /// time `later` was.
    pub fn finished_before(&self, later: &SnapshotRecord, xid: TransactionId) -> bool {
        self.in_progress_or_later(xid) && later.committed_before(xid)
    }

    /// Transactions that finished after the earlier of the two snapshots and
    /// before the later one, in id order.
    pub fn transactions_between(&self, other: &SnapshotRecord) -> BTreeSet<TransactionId> {
        let (earlier, later) = if self.max <= other.max {
            (self, other)
        } else {
            (other, self)
        };
        // Below earlier.max only the outstanding ids were still running
        earlier
            .outstanding
            .iter()
            .copied()
            .chain((earlier.max.0..later.max.0).map(TransactionId))
            .filter(|xid| earlier.finished_before(later, *xid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u64]) -> BTreeSet<TransactionId> {
        values.iter().copied().map(TransactionId).collect()
    }

    fn record(current: u64, min: u64, max: u64, outstanding: &[u64]) -> SnapshotRecord {
        SnapshotRecord {
            current: TransactionId(current),
            min: TransactionId(min),
            max: TransactionId(max),
            outstanding: ids(outstanding),
        }
    }

    #[test]
    fn parses_txid_snapshot_text() {
        let snap: SnapshotDescriptor = "10:20:10,14,15".parse().unwrap();
        assert_eq!(snap.xmin, TransactionId(10));
        assert_eq!(snap.xmax, TransactionId(20));
        assert_eq!(
            snap.in_flight,
            vec![TransactionId(10), TransactionId(14), TransactionId(15)]
        );

        let idle: SnapshotDescriptor = "33:33:".parse().unwrap();
        assert!(idle.in_flight.is_empty());
    }

    #[test]
    fn rejects_malformed_snapshot_text() {
        assert!("10:20".parse::<SnapshotDescriptor>().is_err());
        assert!("a:20:".parse::<SnapshotDescriptor>().is_err());
        assert!("10:20:1,x".parse::<SnapshotDescriptor>().is_err());
    }

    #[test]
    fn outstanding_list_is_comma_joined() {
        let rec = record(21, 10, 20, &[15, 10, 14]);
        assert_eq!(rec.outstanding_list(), "10,14,15");
        assert_eq!(record(5, 5, 5, &[]).outstanding_list(), "");
    }

    #[test]
    fn from_columns_skips_garbage() {
        let rec = SnapshotRecord::from_columns(
            TransactionId(21),
            TransactionId(10),
            TransactionId(20),
            Some("10,,x,14"),
        );
        assert_eq!(rec.outstanding, ids(&[10, 14]));
        let empty = SnapshotRecord::from_columns(
            TransactionId(1),
            TransactionId(1),
            TransactionId(2),
            None,
        );
        assert!(empty.outstanding.is_empty());
    }

    #[test]
    fn visibility_is_complementary() {
        let rec = record(21, 10, 20, &[12, 15]);
        for xid in 0..30 {
            let xid = TransactionId(xid);
            assert_ne!(rec.committed_before(xid), rec.in_progress_or_later(xid));
        }
        assert!(rec.committed_before(TransactionId(9)));
        assert!(rec.committed_before(TransactionId(13)));
        assert!(!rec.committed_before(TransactionId(15)));
        assert!(rec.in_progress_or_later(TransactionId(20)));
    }

    #[test]
    fn transactions_between_snapshots() {
        let first = record(21, 10, 20, &[12, 15]);
        let second = record(30, 15, 25, &[15, 22]);
        let between = first.transactions_between(&second);
        // 12 finished between the two, 15 is still running, 20..25 minus 22 finished
        assert_eq!(between, ids(&[12, 20, 21, 23, 24]));
        assert_eq!(second.transactions_between(&first), between);
    }

    #[test]
    fn long_running_transaction_does_not_widen_the_scan() {
        // xid 1 stayed open across three billion later transactions
        let first = record(3_000_000_001, 1, 3_000_000_000, &[1]);
        let second = record(3_000_000_006, 3_000_000_000, 3_000_000_005, &[3_000_000_002]);
        let between = first.transactions_between(&second);
        assert_eq!(
            between,
            ids(&[1, 3_000_000_000, 3_000_000_001, 3_000_000_003, 3_000_000_004])
        );
        assert!(first.finished_before(&second, TransactionId(1)));
        assert!(!first.finished_before(&second, TransactionId(2)));
    }
}
