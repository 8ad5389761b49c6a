// ABOUTME: End-to-end tests - capture row changes, then replay them onto a SQLite replica
// ABOUTME: Covers single-row safety, full-row matching, guarding, and error classification

use trigger_replicator::capture::{
    CaptureTrigger, ColumnDescriptor, MemoryLogStore, RowEvent, SnapshotSource, TableDescriptor,
};
use trigger_replicator::change::{CommandType, QualifiedName, TransactionLogRecord};
use trigger_replicator::error::{ReplicationError, Result};
use trigger_replicator::session::{SessionContext, TransactionScope};
use trigger_replicator::snapshot::{SnapshotDescriptor, TransactionId};
use trigger_replicator::sqlite::SqliteReplica;
use trigger_replicator::LogApplyEngine;

struct StaticSnapshot(&'static str);

impl SnapshotSource for StaticSnapshot {
    async fn current_snapshot(&self) -> Result<SnapshotDescriptor> {
        self.0.parse()
    }
}

fn row(values: &[Option<&str>]) -> Vec<Option<String>> {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

fn accounts() -> TableDescriptor {
    TableDescriptor {
        name: QualifiedName::new("main", "accounts"),
        columns: vec![
            ColumnDescriptor::new("id", "int4"),
            ColumnDescriptor::dropped("legacy", "text"),
            ColumnDescriptor::new("balance", "int4"),
            ColumnDescriptor::new("note", "text"),
        ],
    }
}

fn replica_with(ddl: &str) -> SqliteReplica {
    let replica = SqliteReplica::open_in_memory().unwrap();
    replica.connection().execute_batch(ddl).unwrap();
    replica
}

fn accounts_replica() -> SqliteReplica {
    replica_with("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER, note TEXT);")
}

fn balances(replica: &SqliteReplica) -> Vec<(i64, i64, Option<String>)> {
    let mut stmt = replica
        .connection()
        .prepare("SELECT id, balance, note FROM accounts ORDER BY id")
        .unwrap();
    stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap()
}

async fn replay_all(store: &MemoryLogStore, replica: &mut SqliteReplica) {
    let session = SessionContext::daemon();
    for record in store.transactions() {
        LogApplyEngine::new()
            .apply_record(&session, replica, &record)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn captured_changes_replay_onto_replica() {
    let store = MemoryLogStore::default();
    let snapshots = StaticSnapshot("90:95:91");
    let trigger = CaptureTrigger::new(&store, &snapshots);
    let table = accounts();

    let mut first = TransactionScope::begin(TransactionId(93));
    let seven = row(&[Some("7"), Some("gone"), Some("100"), Some("a|b:c!")]);
    let eight = row(&[Some("8"), None, Some("5"), None]);
    trigger
        .on_row_change(&mut first, &table, &RowEvent::Insert { new: &seven })
        .await
        .unwrap();
    trigger
        .on_row_change(&mut first, &table, &RowEvent::Insert { new: &eight })
        .await
        .unwrap();

    let mut second = TransactionScope::begin(TransactionId(96));
    let seven_after = row(&[Some("7"), Some("gone"), Some("150"), Some("")]);
    trigger
        .on_row_change(
            &mut second,
            &table,
            &RowEvent::Update {
                old: &seven,
                new: &seven_after,
            },
        )
        .await
        .unwrap();
    trigger
        .on_row_change(&mut second, &table, &RowEvent::Delete { old: &eight })
        .await
        .unwrap();

    let records = store.transactions();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| !r.column_info.contains("legacy")));
    assert_eq!(store.snapshots().len(), 2);

    let mut replica = accounts_replica();
    replay_all(&store, &mut replica).await;
    assert_eq!(balances(&replica), vec![(7, 150, Some(String::new()))]);
}

#[tokio::test]
async fn accounts_update_example_applies() {
    let mut replica = accounts_replica();
    replica
        .connection()
        .execute("INSERT INTO accounts (id, balance) VALUES (7, 100)", [])
        .unwrap();

    LogApplyEngine::new()
        .apply(
            &SessionContext::daemon(),
            &mut replica,
            "U",
            "main.accounts",
            "id:23:Nw==:Nw==|balance:23:MTAw:MTUw",
        )
        .await
        .unwrap();
    assert_eq!(balances(&replica), vec![(7, 150, None)]);
}

#[tokio::test]
async fn update_of_missing_row_leaves_replica_unchanged() {
    let mut replica = accounts_replica();
    replica
        .connection()
        .execute("INSERT INTO accounts (id, balance) VALUES (1, 10)", [])
        .unwrap();

    let err = LogApplyEngine::new()
        .apply(
            &SessionContext::daemon(),
            &mut replica,
            "U",
            "main.accounts",
            "id:int4:Nw==:Nw==|balance:int4:MTAw:MTUw",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Cardinality { affected: 0, .. }));
    assert!(err.is_drift());
    assert_eq!(balances(&replica), vec![(1, 10, None)]);
}

#[tokio::test]
async fn drift_inside_a_transaction_discards_the_whole_transaction() {
    let store = MemoryLogStore::default();
    let snapshots = StaticSnapshot("40:41:");
    let trigger = CaptureTrigger::new(&store, &snapshots);
    let table = accounts();

    let mut scope = TransactionScope::begin(TransactionId(41));
    let seven = row(&[Some("7"), None, Some("100"), None]);
    let eight = row(&[Some("8"), None, Some("5"), None]);
    let eight_after = row(&[Some("8"), None, Some("6"), None]);
    trigger
        .on_row_change(&mut scope, &table, &RowEvent::Insert { new: &seven })
        .await
        .unwrap();
    trigger
        .on_row_change(
            &mut scope,
            &table,
            &RowEvent::Update {
                old: &eight,
                new: &eight_after,
            },
        )
        .await
        .unwrap();

    // The replica never received id 8
    let mut replica = accounts_replica();
    let err = LogApplyEngine::new()
        .apply_transaction(&SessionContext::daemon(), &mut replica, &store.transactions())
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Cardinality { affected: 0, .. }));
    assert!(balances(&replica).is_empty());
}

#[tokio::test]
async fn guarded_transaction_is_rejected_before_any_write() {
    let mut replica = replica_with(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER, note TEXT);
         CREATE TABLE audit (id INTEGER PRIMARY KEY);",
    );
    replica.guard_table(QualifiedName::new("main", "audit"));

    let records = vec![
        TransactionLogRecord {
            transaction_id: TransactionId(50),
            command: CommandType::Insert,
            table: "main.accounts".to_string(),
            column_info: "id:int4:MQ==:!".to_string(),
        },
        TransactionLogRecord {
            transaction_id: TransactionId(50),
            command: CommandType::Insert,
            table: "main.audit".to_string(),
            column_info: "id:int4:MQ==:!".to_string(),
        },
    ];
    let err = LogApplyEngine::new()
        .apply_transaction(&SessionContext::new(), &mut replica, &records)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::AccessViolation { ref table } if table == "main.audit"));
    assert!(balances(&replica).is_empty());
}

#[tokio::test]
async fn full_row_delete_touching_duplicates_is_rolled_back() {
    // No unique index: rows are identified by every column
    let mut replica = replica_with(
        "CREATE TABLE events (kind TEXT, amount INTEGER);
         INSERT INTO events VALUES ('x', 1), ('x', 1), ('y', 2);",
    );

    let err = LogApplyEngine::new()
        .apply(
            &SessionContext::daemon(),
            &mut replica,
            "D",
            "main.events",
            "kind:text:eA==:!|amount:int4:MQ==:!",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Cardinality { affected: 2, .. }));

    let remaining: i64 = replica
        .connection()
        .query_row("SELECT count(*) FROM events", [], |r| r.get(0))
        .unwrap();
    assert_eq!(remaining, 3);

    LogApplyEngine::new()
        .apply(
            &SessionContext::daemon(),
            &mut replica,
            "D",
            "main.events",
            "kind:text:eQ==:!|amount:int4:Mg==:!",
        )
        .await
        .unwrap();
    let remaining: i64 = replica
        .connection()
        .query_row("SELECT count(*) FROM events", [], |r| r.get(0))
        .unwrap();
    assert_eq!(remaining, 2);
}

#[tokio::test]
async fn null_previous_value_matches_with_is_null() {
    let mut replica = replica_with(
        "CREATE TABLE notes (owner INTEGER, body TEXT);
         INSERT INTO notes VALUES (NULL, 'hi');",
    );
    LogApplyEngine::new()
        .apply(
            &SessionContext::daemon(),
            &mut replica,
            "U",
            "main.notes",
            "owner:int4:!:Mw==|body:text:aGk=:aGk=",
        )
        .await
        .unwrap();
    let owner: i64 = replica
        .connection()
        .query_row("SELECT owner FROM notes", [], |r| r.get(0))
        .unwrap();
    assert_eq!(owner, 3);
}

#[tokio::test]
async fn guarded_table_rejects_normal_session() {
    let mut replica = accounts_replica();
    replica.guard_table(QualifiedName::new("main", "accounts"));

    let mut session = SessionContext::new();
    let err = LogApplyEngine::new()
        .apply(&session, &mut replica, "I", "main.accounts", "id:int4:OQ==:!")
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::AccessViolation { .. }));
    assert!(balances(&replica).is_empty());

    session.set_daemon_mode();
    LogApplyEngine::new()
        .apply(&session, &mut replica, "I", "main.accounts", "id:int4:OQ==:!|balance:int4:MA==:!")
        .await
        .unwrap();
    assert_eq!(balances(&replica), vec![(9, 0, None)]);
}

#[tokio::test]
async fn unknown_type_and_command_are_classified() {
    let mut replica = accounts_replica();
    let session = SessionContext::daemon();

    let err = LogApplyEngine::new()
        .apply(&session, &mut replica, "I", "main.accounts", "id:geometry:Nw==:!")
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::TypeResolution(_)));

    let err = LogApplyEngine::new()
        .apply(&session, &mut replica, "Z", "main.accounts", "id:int4:Nw==:!")
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Format(_)));

    let err = LogApplyEngine::new()
        .apply(&session, &mut replica, "I", "main.accounts", "id:int4:bm90IGEgbnVtYmVy:!")
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Format(_)));
    assert!(balances(&replica).is_empty());
}

#[tokio::test]
async fn constraint_violation_is_statement_error() {
    let mut replica = accounts_replica();
    replica
        .connection()
        .execute("INSERT INTO accounts (id, balance) VALUES (7, 1)", [])
        .unwrap();

    let err = LogApplyEngine::new()
        .apply(
            &SessionContext::daemon(),
            &mut replica,
            "I",
            "main.accounts",
            "id:int4:Nw==:!|balance:int4:Mg==:!",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Statement { .. }));
    assert_eq!(balances(&replica), vec![(7, 1, None)]);
}
