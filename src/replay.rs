// ABOUTME: Replay driver - applies each source transaction from a log file as one replica transaction
// ABOUTME: Transactions run in the order the snapshot log implies; a checkpoint resumes after the last one

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::apply::{LogApplyEngine, ReplicaTarget};
use crate::catalog::Catalog;
use crate::change::TransactionLogRecord;
use crate::session::SessionContext;
use crate::snapshot::{SnapshotRecord, TransactionId};
use crate::utils::sanitize_url;

/// Progress through one log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayCheckpoint {
    /// Log file being replayed
    pub log_file: PathBuf,
    /// Replica the records are applied to (sanitized - no password)
    pub target: String,
    /// Source transactions applied so far; replay resumes after this many
    pub applied: u64,
    /// Last source transaction applied
    pub last_transaction: Option<TransactionId>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ReplayCheckpoint {
    pub fn new(log_file: &Path, target: &str) -> Self {
        Self {
            log_file: log_file.to_path_buf(),
            target: sanitize_url(target),
            applied: 0,
            last_transaction: None,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Whether this checkpoint was written for the same file and target.
    pub fn matches(&self, log_file: &Path, target: &str) -> bool {
        self.log_file == log_file && self.target == sanitize_url(target)
    }

    pub fn record_applied(&mut self, transaction: TransactionId) {
        self.applied += 1;
        self.last_transaction = Some(transaction);
        self.updated_at = chrono::Utc::now();
    }

    /// Load a checkpoint from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read replay checkpoint from {:?}", path))?;
        let checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse replay checkpoint from {:?}", path))?;
        Ok(checkpoint)
    }

    /// Resume from `path` if it holds a checkpoint for this file and target,
    /// otherwise start from the beginning.
    pub async fn load_or_new(path: &Path, log_file: &Path, target: &str) -> Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("Failed to check for replay checkpoint {:?}", path))?
        {
            return Ok(Self::new(log_file, target));
        }

        let checkpoint = Self::load(path).await?;
        if checkpoint.matches(log_file, target) {
            tracing::info!(
                "Resuming replay of {:?} after {} applied transactions",
                log_file,
                checkpoint.applied
            );
            Ok(checkpoint)
        } else {
            tracing::warn!(
                "Checkpoint {:?} belongs to {:?} -> {}; starting over",
                path,
                checkpoint.log_file,
                checkpoint.target
            );
            Ok(Self::new(log_file, target))
        }
    }

    /// Save the checkpoint to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize replay checkpoint")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write replay checkpoint to {:?}", path))?;
        Ok(())
    }

    /// Default checkpoint location in the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".trigger-replicator/replay-checkpoint.json")
    }
}

async fn read_json_lines<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Vec<T>> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {} from {:?}", what, path))?;

    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid {} on line {} of {:?}", what, idx + 1, path))
        })
        .collect()
}

/// Read a JSON-lines file of log records. Blank lines are ignored.
pub async fn read_records(path: &Path) -> Result<Vec<TransactionLogRecord>> {
    read_json_lines(path, "log record").await
}

/// Read a JSON-lines file of snapshot records, as written by `export-log`.
pub async fn read_snapshots(path: &Path) -> Result<Vec<SnapshotRecord>> {
    read_json_lines(path, "snapshot record").await
}

/// The log records of one source transaction, in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionBatch {
    pub transaction_id: TransactionId,
    pub records: Vec<TransactionLogRecord>,
}

/// Group records by transaction. Transactions keep the order of their first
/// record in the log.
pub fn group_by_transaction(records: &[TransactionLogRecord]) -> Vec<TransactionBatch> {
    let mut batches: Vec<TransactionBatch> = Vec::new();
    let mut positions: HashMap<TransactionId, usize> = HashMap::new();
    for record in records {
        let idx = *positions.entry(record.transaction_id).or_insert_with(|| {
            batches.push(TransactionBatch {
                transaction_id: record.transaction_id,
                records: Vec::new(),
            });
            batches.len() - 1
        });
        batches[idx].records.push(record.clone());
    }
    batches
}

/// Order source transactions for replay.
///
/// Snapshots are taken in `max` order. A transaction goes into the window of
/// the first snapshot that saw it committed; transactions no snapshot saw
/// committed go last. Within a window, log order is kept.
pub fn plan_replay(
    records: &[TransactionLogRecord],
    snapshots: &[SnapshotRecord],
) -> Vec<TransactionBatch> {
    let mut batches = group_by_transaction(records);
    if snapshots.is_empty() {
        return batches;
    }

    let mut ordered: Vec<&SnapshotRecord> = snapshots.iter().collect();
    ordered.sort_by_key(|snap| (snap.max, snap.current));

    let window = |xid: TransactionId| {
        ordered
            .iter()
            .position(|snap| snap.committed_before(xid))
            .unwrap_or(ordered.len())
    };
    // sort_by_key is stable
    batches.sort_by_key(|batch| window(batch.transaction_id));
    batches
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    /// Transactions applied by this run
    pub applied: u64,
    /// Transactions skipped because an earlier run applied them
    pub skipped: u64,
}

/// Apply `records` one source transaction at a time, starting after
/// `checkpoint.applied` transactions.
///
/// Each transaction commits on the replica as a unit, so a failing record
/// leaves none of its transaction behind. The session runs in daemon mode so
/// guarded tables accept the writes. When `checkpoint_path` is given the
/// checkpoint is saved after every committed transaction.
pub async fn replay_records<H: Catalog + ReplicaTarget>(
    host: &mut H,
    records: &[TransactionLogRecord],
    snapshots: &[SnapshotRecord],
    checkpoint: &mut ReplayCheckpoint,
    checkpoint_path: Option<&Path>,
) -> Result<ReplaySummary> {
    let engine = LogApplyEngine::new();
    let mut session = SessionContext::new();
    session.set_daemon_mode();

    let plan = plan_replay(records, snapshots);
    let skip = usize::try_from(checkpoint.applied)
        .unwrap_or(usize::MAX)
        .min(plan.len());
    if skip > 0 {
        let resumed_after = plan[skip - 1].transaction_id;
        if checkpoint.last_transaction != Some(resumed_after) {
            bail!(
                "Checkpoint says transaction {} was applied last, but the replay order has {} there; rerun with --no-resume",
                checkpoint
                    .last_transaction
                    .map(|xid| xid.to_string())
                    .unwrap_or_else(|| "(none)".to_string()),
                resumed_after
            );
        }
    }

    let mut summary = ReplaySummary {
        applied: 0,
        skipped: skip as u64,
    };

    for (idx, batch) in plan.iter().enumerate().skip(skip) {
        engine
            .apply_transaction(&session, host, &batch.records)
            .await
            .with_context(|| {
                format!(
                    "Failed to apply transaction {} ({} of {}, {} records)",
                    batch.transaction_id,
                    idx + 1,
                    plan.len(),
                    batch.records.len()
                )
            })?;

        checkpoint.record_applied(batch.transaction_id);
        summary.applied += 1;
        if let Some(path) = checkpoint_path {
            checkpoint.save(path).await?;
        }

        if summary.applied % 1000 == 0 {
            tracing::info!("Applied {} of {} transactions", idx + 1, plan.len());
        }
    }

    tracing::info!(
        "Replay complete: {} transactions applied, {} already applied",
        summary.applied,
        summary.skipped
    );
    Ok(summary)
}
