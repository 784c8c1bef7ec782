//! Scenario and invariant tests for the transactional session manager and
//! layered MVCC storage engine, driven directly against
//! `quereus_core::{storage, txn, catalog}`. The SQL front end (parser,
//! planner, optimizer, emitter, scheduler) is out of scope for this crate —
//! see `quereus_core::testkit`'s doc comment — so these tests exercise the
//! layers this crate actually owns rather than going through SQL text.

use std::collections::HashMap;
use std::sync::Arc;

use quereus_core::assertion::{AssertionAnalysis, AssertionAnalyzer, AssertionEvaluator, AssertionRunner, RelationKey};
use quereus_core::catalog::{AssertionDef, Catalog};
use quereus_core::codec::{encode_key, EncodedKey, PrimaryKey};
use quereus_core::error::{ErrorKind, Result};
use quereus_core::metrics::Metrics;
use quereus_core::schema::{ColumnSchema, ModuleRef, PrimaryKeyDef, ScalarType, SortDirection, TableSchema, TableSchemaRef};
use quereus_core::storage::{unbounded, ConflictMode, Direction, MutationOp, MutationOutcome, TableManager};
use quereus_core::txn::TransactionManager;
use quereus_core::value::{Collation, Value};
use quereus_core::vtab::Instruction;

fn kv_schema(name: &str) -> TableSchemaRef {
    Arc::new(TableSchema {
        schema_namespace: "main".into(),
        name: name.into(),
        columns: vec![
            ColumnSchema {
                name: "k".into(),
                ty: ScalarType::Integer,
                nullable: false,
                default: None,
                collation: Collation::Default,
                generated: false,
            },
            ColumnSchema {
                name: "v".into(),
                ty: ScalarType::Text,
                nullable: false,
                default: None,
                collation: Collation::Default,
                generated: false,
            },
        ],
        primary_key: PrimaryKeyDef {
            columns: vec![(0, SortDirection::Asc)],
        },
        secondary_indexes: vec![],
        checks: vec![],
        module: ModuleRef("memory".into()),
        generation: 0,
    })
}

fn pk(i: i64) -> EncodedKey {
    encode_key(&PrimaryKey::single(Value::Integer(i)))
}

fn row(k: i64, v: &str) -> Vec<Value> {
    vec![Value::Integer(k), Value::Text(v.to_string())]
}

fn row_key(row: &[Value]) -> i64 {
    match &row[0] {
        Value::Integer(i) => *i,
        other => panic!("expected integer key column, got {other:?}"),
    }
}

fn new_mgr(schema: TableSchemaRef) -> TableManager {
    TableManager::new(schema, Arc::new(Metrics::new()))
}

fn new_catalog() -> Arc<Catalog> {
    Arc::new(Catalog::new(Arc::new(Metrics::new())))
}

/// An `AssertionAnalyzer`/`AssertionRunner` pair that never classifies any
/// assertion against any table, so `AssertionEvaluator::evaluate_at_commit`
/// is always a no-op. Used by scenarios that only care about storage/txn
/// behavior and don't exercise assertions.
struct NoAssertions;

impl AssertionAnalyzer for NoAssertions {
    fn analyze(&self, _def: &AssertionDef) -> Result<AssertionAnalysis> {
        Ok(AssertionAnalysis {
            relation_keys: vec![],
            full_query: Instruction { programs: 0 },
            row_specific_queries: HashMap::new(),
        })
    }
}

impl AssertionRunner for NoAssertions {
    fn run_full(&self, _instruction: &Instruction) -> Result<Vec<Vec<Value>>> {
        Ok(vec![])
    }
    fn run_row_specific(&self, _instruction: &Instruction, _pk_values: &[Value]) -> Result<Vec<Vec<Value>>> {
        Ok(vec![])
    }
}

fn new_txn(catalog: &Arc<Catalog>) -> TransactionManager {
    let evaluator = Arc::new(AssertionEvaluator::new(
        Box::new(NoAssertions),
        Box::new(NoAssertions),
        Arc::new(Metrics::new()),
    ));
    TransactionManager::new(Arc::clone(catalog), evaluator, Arc::new(Metrics::new()))
}

// S1: single-row commit and read-back.
#[test]
fn s1_single_row_commit_and_read_back() {
    let mgr = new_mgr(kv_schema("t"));
    let c1 = mgr.connect();
    mgr.perform_mutation(
        c1,
        MutationOp::Insert {
            key: pk(1),
            row: row(1, "a"),
        },
        ConflictMode::Abort,
    )
    .unwrap();
    mgr.commit(c1, false).unwrap();

    let c2 = mgr.connect();
    let rows = mgr.scan(c2, unbounded(), Direction::Ascending).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, row(1, "a"));
}

// S2: pending layer isolation, then visibility after commit.
#[test]
fn s2_pending_layer_isolation_until_commit() {
    let mgr = new_mgr(kv_schema("t"));
    let seed = mgr.connect();
    mgr.perform_mutation(
        seed,
        MutationOp::Insert {
            key: pk(1),
            row: row(1, "a"),
        },
        ConflictMode::Abort,
    )
    .unwrap();
    mgr.commit(seed, false).unwrap();

    let conn_a = mgr.connect();
    mgr.perform_mutation(
        conn_a,
        MutationOp::Insert {
            key: pk(2),
            row: row(2, "b"),
        },
        ConflictMode::Abort,
    )
    .unwrap();

    // B's snapshot is taken before A commits.
    let conn_b = mgr.connect();
    let seen_before_commit = mgr.scan(conn_b, unbounded(), Direction::Ascending).unwrap();
    assert_eq!(seen_before_commit, vec![(pk(1), row(1, "a"))]);

    mgr.commit(conn_a, false).unwrap();

    let conn_b2 = mgr.connect();
    let seen_after_commit = mgr.scan(conn_b2, unbounded(), Direction::Ascending).unwrap();
    assert_eq!(seen_after_commit.len(), 2);
}

// S3: INSERT OR IGNORE against an existing primary key is a no-op.
#[test]
fn s3_unique_violation_with_ignore_is_a_no_op() {
    let mgr = new_mgr(kv_schema("t"));
    let c1 = mgr.connect();
    mgr.perform_mutation(
        c1,
        MutationOp::Insert {
            key: pk(1),
            row: row(1, "a"),
        },
        ConflictMode::Abort,
    )
    .unwrap();
    mgr.commit(c1, false).unwrap();

    let c2 = mgr.connect();
    let outcome = mgr
        .perform_mutation(
            c2,
            MutationOp::Insert {
                key: pk(1),
                row: row(1, "x"),
            },
            ConflictMode::Ignore,
        )
        .unwrap();
    assert_eq!(outcome, MutationOutcome::NoRow);
    mgr.commit(c2, false).unwrap();

    let c3 = mgr.connect();
    let rows = mgr.scan(c3, unbounded(), Direction::Ascending).unwrap();
    assert_eq!(rows, vec![(pk(1), row(1, "a"))]);
}

// S4: a savepoint rollback inside an explicit transaction leaves no trace,
// including in the change log at commit time.
#[test]
fn s4_savepoint_rollback_leaves_change_log_empty_at_commit() {
    let catalog = new_catalog();
    let t = catalog.create_table(kv_schema("t")).unwrap();
    let txn = new_txn(&catalog);
    let c1 = txn.register_connection("main.t", &t).unwrap();

    t.perform_mutation(c1, MutationOp::Insert { key: pk(1), row: row(1, "a") }, ConflictMode::Abort)
        .unwrap();
    t.perform_mutation(c1, MutationOp::Insert { key: pk(2), row: row(2, "b") }, ConflictMode::Abort)
        .unwrap();
    t.commit(c1, false).unwrap();

    txn.begin_explicit().unwrap();
    txn.create_savepoint("s1").unwrap();
    t.perform_mutation(c1, MutationOp::Insert { key: pk(3), row: row(3, "c") }, ConflictMode::Abort)
        .unwrap();
    txn.record_insert("main.t", PrimaryKey::single(Value::Integer(3)));
    txn.rollback_to_savepoint("s1").unwrap();
    assert!(txn.change_log().changed_base_tables().is_empty());
    txn.commit().unwrap();

    let c2 = t.connect();
    let rows = t.scan(c2, unbounded(), Direction::Ascending).unwrap();
    let keys: Vec<i64> = rows.iter().map(|(_, r)| row_key(r)).collect();
    assert_eq!(keys, vec![1, 2]);
}

// S5: a row-specific assertion only probes the primary keys the change log
// says moved, and reports the witness row on a real violation.
struct RowSpecificAnalyzer {
    table: String,
}

impl AssertionAnalyzer for RowSpecificAnalyzer {
    fn analyze(&self, def: &AssertionDef) -> Result<AssertionAnalysis> {
        let label = format!("{}#0", def.name);
        let mut row_specific_queries = HashMap::new();
        row_specific_queries.insert(label.clone(), Instruction { programs: 1 });
        Ok(AssertionAnalysis {
            relation_keys: vec![RelationKey {
                label,
                base_table: self.table.clone(),
                row_specific: true,
            }],
            full_query: Instruction { programs: 0 },
            row_specific_queries,
        })
    }
}

/// Reports a violation only for the probed primary key `5`, mimicking
/// "no row with v='x'" where row `(5,'x')` is the only offender.
struct NoVRunner;

impl AssertionRunner for NoVRunner {
    fn run_full(&self, _instruction: &Instruction) -> Result<Vec<Vec<Value>>> {
        Ok(vec![])
    }
    fn run_row_specific(&self, _instruction: &Instruction, pk_values: &[Value]) -> Result<Vec<Vec<Value>>> {
        if pk_values == [Value::Integer(5)] {
            Ok(vec![vec![Value::Integer(5), Value::Text("x".into())]])
        } else {
            Ok(vec![])
        }
    }
}

#[test]
fn s5_row_specific_assertion_probes_only_changed_pks() {
    let catalog = new_catalog();
    let t = catalog.create_table(kv_schema("t")).unwrap();
    catalog
        .create_assertion(AssertionDef {
            name: "no_v_eq_x".into(),
            query_handle: 1,
        })
        .unwrap();

    let evaluator = Arc::new(AssertionEvaluator::new(
        Box::new(RowSpecificAnalyzer { table: "main.t".into() }),
        Box::new(NoVRunner),
        Arc::new(Metrics::new()),
    ));
    let txn = TransactionManager::new(Arc::clone(&catalog), evaluator, Arc::new(Metrics::new()));
    let c1 = txn.register_connection("main.t", &t).unwrap();

    txn.begin_explicit().unwrap();
    t.perform_mutation(c1, MutationOp::Insert { key: pk(4), row: row(4, "c") }, ConflictMode::Abort)
        .unwrap();
    txn.record_insert("main.t", PrimaryKey::single(Value::Integer(4)));
    txn.commit().unwrap();

    txn.begin_explicit().unwrap();
    t.perform_mutation(c1, MutationOp::Insert { key: pk(5), row: row(5, "x") }, ConflictMode::Abort)
        .unwrap();
    txn.record_insert("main.t", PrimaryKey::single(Value::Integer(5)));
    let err = txn.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Constraint);
}

// S6: a stale commit fails busy and discards its pending layer; the
// connection can retry against the new tip.
#[test]
fn s6_stale_commit_busy_then_retry_succeeds() {
    let mgr = new_mgr(kv_schema("t"));
    let c1 = mgr.connect();
    let c2 = mgr.connect();

    mgr.perform_mutation(c1, MutationOp::Insert { key: pk(1), row: row(1, "a") }, ConflictMode::Abort)
        .unwrap();
    mgr.perform_mutation(c2, MutationOp::Insert { key: pk(2), row: row(2, "b") }, ConflictMode::Abort)
        .unwrap();

    mgr.commit(c1, false).unwrap();

    let err = mgr.commit(c2, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(err.is_retryable());
    assert!(!mgr.in_transaction(c2).unwrap());

    mgr.perform_mutation(c2, MutationOp::Insert { key: pk(2), row: row(2, "b") }, ConflictMode::Abort)
        .unwrap();
    mgr.commit(c2, false).unwrap();

    let c3 = mgr.connect();
    let rows = mgr.scan(c3, unbounded(), Direction::Ascending).unwrap();
    assert_eq!(rows.len(), 2);
}

// Round-trip law: insert then delete of the same PK within one transaction
// leaves the base table unchanged at commit, but the change log still names
// the PK as changed while the transaction is open.
#[test]
fn insert_then_delete_same_pk_is_logged_but_commits_to_a_no_op() {
    let catalog = new_catalog();
    let t = catalog.create_table(kv_schema("t")).unwrap();
    let txn = new_txn(&catalog);
    let c1 = txn.register_connection("main.t", &t).unwrap();

    txn.begin_explicit().unwrap();
    t.perform_mutation(c1, MutationOp::Insert { key: pk(9), row: row(9, "z") }, ConflictMode::Abort)
        .unwrap();
    txn.record_insert("main.t", PrimaryKey::single(Value::Integer(9)));
    t.perform_mutation(c1, MutationOp::Delete { key: pk(9) }, ConflictMode::Abort)
        .unwrap();
    txn.record_delete("main.t", PrimaryKey::single(Value::Integer(9)));

    assert!(txn.change_log().changed_base_tables().contains("main.t"));

    txn.commit().unwrap();

    let c2 = t.connect();
    let rows = t.scan(c2, unbounded(), Direction::Ascending).unwrap();
    assert!(rows.is_empty());
}

// Round-trip law: release a nested savepoint, then roll back to the
// enclosing one — indistinguishable from the nested savepoint never having
// existed.
#[test]
fn release_then_rollback_to_enclosing_savepoint_is_a_no_op() {
    let catalog = new_catalog();
    let t = catalog.create_table(kv_schema("t")).unwrap();
    let txn = new_txn(&catalog);
    let c1 = txn.register_connection("main.t", &t).unwrap();

    txn.begin_explicit().unwrap();
    t.perform_mutation(c1, MutationOp::Insert { key: pk(1), row: row(1, "a") }, ConflictMode::Abort)
        .unwrap();
    txn.record_insert("main.t", PrimaryKey::single(Value::Integer(1)));

    txn.create_savepoint("outer").unwrap();
    txn.create_savepoint("inner").unwrap();
    t.perform_mutation(c1, MutationOp::Insert { key: pk(2), row: row(2, "b") }, ConflictMode::Abort)
        .unwrap();
    txn.record_insert("main.t", PrimaryKey::single(Value::Integer(2)));
    txn.release_savepoint("inner").unwrap();
    txn.rollback_to_savepoint("outer").unwrap();

    let rows = t.scan(c1, unbounded(), Direction::Ascending).unwrap();
    assert_eq!(rows, vec![(pk(1), row(1, "a"))]);
    txn.commit().unwrap();
}

// Boundary behavior: a schema change must busy-fail while any non-base
// layer exists for the table, and succeed once the table is quiescent.
#[test]
fn schema_change_busy_fails_during_open_transaction_then_succeeds() {
    let mgr = new_mgr(kv_schema("t"));
    let c1 = mgr.connect();
    mgr.perform_mutation(c1, MutationOp::Insert { key: pk(1), row: row(1, "a") }, ConflictMode::Abort)
        .unwrap();

    let err = mgr.alter_schema(|s| s.generation += 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    mgr.commit(c1, false).unwrap();
    mgr.disconnect(c1);
    mgr.alter_schema(|s| s.generation += 1).unwrap();
    assert_eq!(mgr.schema().generation, 1);
}

// Boundary behavior: opening a second top-level statement while the first
// is mid-execution must wait on the session's execution mutex, so the two
// runs never interleave.
#[test]
fn session_exec_mutex_serializes_concurrent_statements() {
    use quereus_core::options::Options;
    use quereus_core::session::{Collaborators, Session};
    use quereus_core::testkit::{FakeEmitter, FakeOptimizer, FakeParser, FakePlanner};
    use quereus_core::vtab::{RunResult, Scheduler};
    use std::sync::Mutex;
    use std::time::Duration;

    struct SlowScheduler(Arc<Mutex<Vec<&'static str>>>);
    impl Scheduler for SlowScheduler {
        fn run(&self, _instruction: Instruction) -> Result<RunResult> {
            self.0.lock().unwrap().push("start");
            std::thread::sleep(Duration::from_millis(30));
            self.0.lock().unwrap().push("end");
            Ok(RunResult::Done)
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let session = Arc::new(Session::new(
        Options::new(),
        Collaborators {
            parser: Box::new(FakeParser),
            planner: Box::new(FakePlanner),
            optimizer: Box::new(FakeOptimizer),
            emitter: Box::new(FakeEmitter),
            scheduler: Box::new(SlowScheduler(Arc::clone(&log))),
        },
    ));

    let s1 = Arc::clone(&session);
    let t1 = std::thread::spawn(move || s1.exec("SELECT 1").unwrap());
    std::thread::sleep(Duration::from_millis(5));
    let s2 = Arc::clone(&session);
    let t2 = std::thread::spawn(move || s2.exec("SELECT 1").unwrap());
    t1.join().unwrap();
    t2.join().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(*log, vec!["start", "end", "start", "end"]);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Invariant 7: point-lookup and range-scan agree on every key.
        #[test]
        fn point_lookup_and_scan_agree(keys in prop::collection::hash_set(-64i64..64, 0..30)) {
            let mgr = new_mgr(kv_schema("t"));
            let c1 = mgr.connect();
            for k in &keys {
                mgr.perform_mutation(c1, MutationOp::Insert { key: pk(*k), row: row(*k, "v") }, ConflictMode::Abort).unwrap();
            }
            mgr.commit(c1, false).unwrap();

            let tip = mgr.tip();
            let c2 = mgr.connect();
            let scanned = mgr.scan(c2, unbounded(), Direction::Ascending).unwrap();
            let scanned_keys: std::collections::HashSet<i64> = scanned.iter().map(|(_, r)| row_key(r)).collect();
            prop_assert_eq!(&scanned_keys, &keys);

            for k in -64i64..64 {
                let found = mgr.lookup_effective_row(&tip, &pk(k));
                prop_assert_eq!(found.is_some(), keys.contains(&k));
            }
        }

        // Invariant 1: an uncommitted connection's writes are invisible to a
        // scan from any other connection until it commits.
        #[test]
        fn pending_writes_are_invisible_until_commit(keys in prop::collection::vec(-32i64..32, 0..10)) {
            let mgr = new_mgr(kv_schema("t"));
            let observer = mgr.connect();
            let writer = mgr.connect();
            for k in &keys {
                mgr.perform_mutation(writer, MutationOp::Insert { key: pk(*k), row: row(*k, "v") }, ConflictMode::Ignore).unwrap();
            }
            let seen = mgr.scan(observer, unbounded(), Direction::Ascending).unwrap();
            prop_assert!(seen.is_empty());
        }
    }
}
