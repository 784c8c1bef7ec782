//! Transaction manager (spec.md §4.9).
//!
//! Coordinates the per-table `TableManager` connections a session touches
//! into one logical transaction: tracks autocommit/implicit/explicit state,
//! runs global assertions and deferred constraints once at commit, then
//! commits every registered table connection under the "coordinated commit"
//! flag (`TableManager::commit`'s `relaxed` parameter) so sibling tables in
//! the same multi-table transaction don't spuriously fail each other's
//! staleness check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::instrument;

use crate::assertion::AssertionEvaluator;
use crate::catalog::Catalog;
use crate::changelog::ChangeLog;
use crate::codec::PrimaryKey;
use crate::deferred::{DeferredQueue, DeferredTicket};
use crate::error::{EngineError, MisuseError, Result};
use crate::metrics::Metrics;
use crate::storage::{ConnectionId, TableManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Autocommit,
    Implicit,
    Explicit,
}

/// Snapshot of every stack's depth at the moment a named savepoint was
/// created, so release/rollback can restore the exact region spanned by it.
/// `table_depths` only covers tables registered *before* the savepoint;
/// tables that join the transaction afterward are collapsed down to their
/// own base pending layer on release (spec.md §4.6 doesn't address
/// mid-transaction table registration, and the session/emitter layer common
/// case registers every touched table before issuing DML).
struct SavepointMark {
    name: String,
    change_log_depth: usize,
    deferred_depth: usize,
    table_depths: HashMap<String, usize>,
}

pub struct TransactionManager {
    state: RwLock<TxnState>,
    connections: RwLock<HashMap<String, (Arc<TableManager>, ConnectionId)>>,
    savepoints: RwLock<Vec<SavepointMark>>,
    change_log: Arc<ChangeLog>,
    deferred: Arc<DeferredQueue>,
    assertion_evaluator: Arc<AssertionEvaluator>,
    catalog: Arc<Catalog>,
    metrics: Arc<Metrics>,
    /// Set while draining deferred-constraint tickets, so any table
    /// connection an evaluator incidentally registers doesn't get dragged
    /// into `begin` (spec.md §4.9: "skipping begin on connections
    /// registered while evaluating deferred constraints").
    evaluating_deferred: AtomicBool,
}

impl TransactionManager {
    pub fn new(catalog: Arc<Catalog>, assertion_evaluator: Arc<AssertionEvaluator>, metrics: Arc<Metrics>) -> Self {
        TransactionManager {
            state: RwLock::new(TxnState::Autocommit),
            connections: RwLock::new(HashMap::new()),
            savepoints: RwLock::new(Vec::new()),
            change_log: Arc::new(ChangeLog::new()),
            deferred: Arc::new(DeferredQueue::new()),
            assertion_evaluator,
            catalog,
            metrics,
            evaluating_deferred: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TxnState {
        *self.state.read()
    }

    pub fn in_transaction(&self) -> bool {
        self.state() != TxnState::Autocommit
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn record_insert(&self, table: &str, new_key: PrimaryKey) {
        self.change_log.record_insert(table, new_key);
    }

    pub fn record_delete(&self, table: &str, old_key: PrimaryKey) {
        self.change_log.record_delete(table, old_key);
    }

    pub fn record_update(&self, table: &str, old_key: PrimaryKey, new_key: PrimaryKey) {
        self.change_log.record_update(table, old_key, new_key);
    }

    pub fn enqueue_deferred(&self, ticket: DeferredTicket) {
        self.deferred.enqueue(ticket);
    }

    /// Registers `table` for this transaction, connecting to its table
    /// manager on first touch. If a transaction is already open, the new
    /// connection immediately joins it (unless we're mid deferred-constraint
    /// evaluation).
    pub fn register_connection(&self, table: &str, table_manager: &Arc<TableManager>) -> Result<ConnectionId> {
        {
            let conns = self.connections.read();
            if let Some((_, id)) = conns.get(table) {
                return Ok(*id);
            }
        }
        let id = table_manager.connect();
        if self.in_transaction() && !self.evaluating_deferred.load(AtomicOrdering::Relaxed) {
            table_manager.begin(id)?;
        }
        self.connections
            .write()
            .insert(table.to_string(), (Arc::clone(table_manager), id));
        Ok(id)
    }

    /// Upgrades autocommit to an implicit transaction by beginning every
    /// currently-registered connection. A no-op if already in a transaction.
    pub fn ensure_transaction(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state != TxnState::Autocommit {
            return Ok(());
        }
        for (tm, id) in self.connections.read().values() {
            tm.begin(*id)?;
        }
        *state = TxnState::Implicit;
        Ok(())
    }

    /// Explicit `BEGIN`. Errors if already inside a transaction.
    pub fn begin_explicit(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state != TxnState::Autocommit {
            return Err(EngineError::from(MisuseError::Other(
                "a transaction is already open".into(),
            )));
        }
        for (tm, id) in self.connections.read().values() {
            tm.begin(*id)?;
        }
        *state = TxnState::Explicit;
        Ok(())
    }

    /// Called by the session after a top-level statement batch completes
    /// successfully while autocommit is implicit (spec.md §4.9).
    pub fn autocommit_if_needed(&self) -> Result<()> {
        if self.state() == TxnState::Implicit {
            self.commit()
        } else {
            Ok(())
        }
    }

    /// Called by the session after a top-level statement batch fails while
    /// autocommit is implicit.
    pub fn autorollback_if_needed(&self) -> Result<()> {
        if self.state() == TxnState::Implicit {
            self.rollback()
        } else {
            Ok(())
        }
    }

    fn drain_and_evaluate_deferred(&self) -> Result<()> {
        let tickets = self.deferred.drain();
        self.evaluating_deferred.store(true, AtomicOrdering::Relaxed);
        let result = (|| {
            for ticket in &tickets {
                ticket.evaluate()?;
            }
            Ok(())
        })();
        self.evaluating_deferred.store(false, AtomicOrdering::Relaxed);
        result
    }

    fn rollback_all_best_effort(&self) {
        for (tm, id) in self.connections.read().values() {
            let _ = tm.rollback(*id);
        }
    }

    /// Coordinated commit (spec.md §4.9): run global assertions, drain
    /// deferred constraints, commit every registered connection under the
    /// relaxed/coordinated flag, then clear the change log. Any failing step
    /// rolls every connection back best-effort and propagates the error.
    #[instrument(skip(self))]
    pub fn commit(&self) -> Result<()> {
        if self.state() == TxnState::Autocommit {
            return Ok(());
        }
        let outcome = self.try_commit_coordinated();
        match outcome {
            Ok(()) => {
                self.change_log.clear();
                *self.state.write() = TxnState::Autocommit;
                self.savepoints.write().clear();
                self.metrics.record_commit();
                Ok(())
            }
            Err(e) => {
                self.rollback_all_best_effort();
                self.change_log.clear();
                self.deferred.clear();
                self.savepoints.write().clear();
                *self.state.write() = TxnState::Autocommit;
                Err(e)
            }
        }
    }

    fn try_commit_coordinated(&self) -> Result<()> {
        self.assertion_evaluator
            .evaluate_at_commit(&self.catalog, &self.change_log)?;
        self.drain_and_evaluate_deferred()?;
        for (tm, id) in self.connections.read().values() {
            tm.commit(*id, true)?;
        }
        Ok(())
    }

    /// Coordinated rollback (spec.md §4.9): rolls back every registered
    /// connection and clears the change log and deferred queue.
    #[instrument(skip(self))]
    pub fn rollback(&self) -> Result<()> {
        if self.state() == TxnState::Autocommit {
            return Ok(());
        }
        self.rollback_all_best_effort();
        self.change_log.clear();
        self.deferred.clear();
        self.savepoints.write().clear();
        *self.state.write() = TxnState::Autocommit;
        self.metrics.record_rollback();
        Ok(())
    }

    /// `createSavepoint(name)` (spec.md §4.6/§4.9): pushes a frame in the
    /// change log and deferred queue, and a savepoint layer on every
    /// currently-registered table connection. Returns the new depth.
    pub fn create_savepoint(&self, name: &str) -> Result<usize> {
        if !self.in_transaction() {
            return Err(EngineError::from(MisuseError::Other(
                "no transaction is open".into(),
            )));
        }
        let change_log_depth = self.change_log.create_savepoint();
        let deferred_depth = self.deferred.create_savepoint();
        let mut table_depths = HashMap::new();
        for (table, (tm, id)) in self.connections.read().iter() {
            let depth = tm.create_savepoint(*id)?;
            table_depths.insert(table.clone(), depth);
        }
        let mut savepoints = self.savepoints.write();
        savepoints.push(SavepointMark {
            name: name.to_string(),
            change_log_depth,
            deferred_depth,
            table_depths,
        });
        Ok(savepoints.len())
    }

    fn find_mark_index(&self, savepoints: &[SavepointMark], name: &str) -> Result<usize> {
        savepoints
            .iter()
            .rposition(|m| m.name == name)
            .ok_or_else(|| EngineError::from(MisuseError::Other(format!("no such savepoint `{name}`"))))
    }

    /// `releaseSavepoint(name)` (spec.md §4.6): merges every frame back to
    /// (and including) the named savepoint into the frame below it, keeping
    /// the changes made since.
    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        let mut savepoints = self.savepoints.write();
        let idx = self.find_mark_index(&savepoints, name)?;
        let mark = &savepoints[idx];

        self.change_log.release_savepoint(mark.change_log_depth - 1)?;
        self.deferred.release_savepoint(mark.deferred_depth - 1)?;

        let conns = self.connections.read();
        for (table, (tm, id)) in conns.iter() {
            match mark.table_depths.get(table) {
                Some(depth) if *depth >= 2 => tm.release_savepoint(*id, depth - 1)?,
                Some(_) => {}
                None => {
                    // Table joined the transaction after this savepoint was
                    // created: its entire savepoint history falls inside the
                    // region being released, so collapse it down to its base
                    // pending layer.
                    if tm.in_transaction(*id)? {
                        tm.release_savepoint(*id, 1)?;
                    }
                }
            }
        }
        drop(conns);
        savepoints.truncate(idx);
        Ok(())
    }

    /// `rollbackToSavepoint(name)` (spec.md §4.6): discards every frame
    /// created since (and including) the named savepoint.
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let mut savepoints = self.savepoints.write();
        let idx = self.find_mark_index(&savepoints, name)?;
        let mark = &savepoints[idx];

        self.change_log.rollback_to_savepoint(mark.change_log_depth - 1)?;
        self.deferred.rollback_to_savepoint(mark.deferred_depth - 1)?;

        let conns = self.connections.read();
        for (table, (tm, id)) in conns.iter() {
            if let Some(depth) = mark.table_depths.get(table) {
                if *depth >= 2 {
                    tm.rollback_to_savepoint(*id, depth - 1)?;
                }
            }
        }
        drop(conns);
        // Unlike `release_savepoint`, the named mark itself stays open: SQL's
        // ROLLBACK TO SAVEPOINT discards everything after it but leaves it
        // available for another ROLLBACK TO or a later RELEASE.
        savepoints.truncate(idx + 1);
        Ok(())
    }

    /// Drops every registered connection (used by the session on close).
    pub fn disconnect_all(&self) {
        for (tm, id) in self.connections.write().drain().map(|(_, v)| v) {
            tm.disconnect(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::{AssertionAnalysis, AssertionAnalyzer, AssertionRunner};
    use crate::catalog::AssertionDef;
    use crate::schema::{ColumnSchema, ModuleRef, PrimaryKeyDef, ScalarType, SortDirection, TableSchema};
    use crate::storage::{ConflictMode, MutationOp};
    use crate::value::{Collation, Value};
    use std::collections::HashMap as StdHashMap;

    struct NoopAnalyzer;
    impl AssertionAnalyzer for NoopAnalyzer {
        fn analyze(&self, _def: &AssertionDef) -> Result<AssertionAnalysis> {
            Ok(AssertionAnalysis {
                relation_keys: vec![],
                full_query: crate::vtab::Instruction { programs: 0 },
                row_specific_queries: StdHashMap::new(),
            })
        }
    }
    struct NoopRunner;
    impl AssertionRunner for NoopRunner {
        fn run_full(&self, _i: &crate::vtab::Instruction) -> Result<Vec<Vec<Value>>> {
            Ok(vec![])
        }
        fn run_row_specific(&self, _i: &crate::vtab::Instruction, _pk: &[Value]) -> Result<Vec<Vec<Value>>> {
            Ok(vec![])
        }
    }

    fn test_schema(name: &str) -> crate::schema::TableSchemaRef {
        Arc::new(TableSchema {
            schema_namespace: "main".into(),
            name: name.into(),
            columns: vec![ColumnSchema {
                name: "id".into(),
                ty: ScalarType::Integer,
                nullable: false,
                default: None,
                collation: Collation::Default,
                generated: false,
            }],
            primary_key: PrimaryKeyDef {
                columns: vec![(0, SortDirection::Asc)],
            },
            secondary_indexes: vec![],
            checks: vec![],
            module: ModuleRef("memory".into()),
            generation: 0,
        })
    }

    fn new_txn_manager() -> (TransactionManager, Arc<Catalog>) {
        let metrics = Arc::new(Metrics::new());
        let catalog = Arc::new(Catalog::new(Arc::clone(&metrics)));
        let evaluator = Arc::new(AssertionEvaluator::new(
            Box::new(NoopAnalyzer),
            Box::new(NoopRunner),
            Arc::clone(&metrics),
        ));
        (TransactionManager::new(Arc::clone(&catalog), evaluator, metrics), catalog)
    }

    #[test]
    fn commit_on_autocommit_is_a_noop() {
        let (txn, _catalog) = new_txn_manager();
        assert!(txn.commit().is_ok());
        assert_eq!(txn.state(), TxnState::Autocommit);
    }

    #[test]
    fn explicit_transaction_commits_across_tables() {
        let (txn, catalog) = new_txn_manager();
        let t1 = catalog.create_table(test_schema("t1")).unwrap();
        let t2 = catalog.create_table(test_schema("t2")).unwrap();
        let c1 = txn.register_connection("main.t1", &t1).unwrap();
        let c2 = txn.register_connection("main.t2", &t2).unwrap();

        txn.begin_explicit().unwrap();
        assert!(t1.in_transaction(c1).unwrap());
        assert!(t2.in_transaction(c2).unwrap());

        t1.perform_mutation(
            c1,
            MutationOp::Insert {
                key: crate::codec::encode_key(&PrimaryKey::single(Value::Integer(1))),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();

        txn.commit().unwrap();
        assert_eq!(txn.state(), TxnState::Autocommit);
        assert!(!t1.in_transaction(c1).unwrap());
    }

    #[test]
    fn rollback_discards_uncommitted_changes() {
        let (txn, catalog) = new_txn_manager();
        let t1 = catalog.create_table(test_schema("t1")).unwrap();
        let c1 = txn.register_connection("main.t1", &t1).unwrap();
        txn.begin_explicit().unwrap();
        t1.perform_mutation(
            c1,
            MutationOp::Insert {
                key: crate::codec::encode_key(&PrimaryKey::single(Value::Integer(1))),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        txn.rollback().unwrap();

        let rows = t1
            .scan(c1, crate::storage::unbounded(), crate::storage::Direction::Ascending)
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn savepoint_rollback_keeps_earlier_writes() {
        let (txn, catalog) = new_txn_manager();
        let t1 = catalog.create_table(test_schema("t1")).unwrap();
        let c1 = txn.register_connection("main.t1", &t1).unwrap();
        txn.begin_explicit().unwrap();
        t1.perform_mutation(
            c1,
            MutationOp::Insert {
                key: crate::codec::encode_key(&PrimaryKey::single(Value::Integer(1))),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        txn.create_savepoint("sp1").unwrap();
        t1.perform_mutation(
            c1,
            MutationOp::Insert {
                key: crate::codec::encode_key(&PrimaryKey::single(Value::Integer(2))),
                row: vec![Value::Integer(2)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        txn.rollback_to_savepoint("sp1").unwrap();

        let rows = t1
            .scan(c1, crate::storage::unbounded(), crate::storage::Direction::Ascending)
            .unwrap();
        assert_eq!(rows.len(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn rollback_to_savepoint_keeps_the_name_open_for_reuse() {
        let (txn, catalog) = new_txn_manager();
        let t1 = catalog.create_table(test_schema("t1")).unwrap();
        let c1 = txn.register_connection("main.t1", &t1).unwrap();
        txn.begin_explicit().unwrap();
        txn.create_savepoint("sp1").unwrap();
        t1.perform_mutation(
            c1,
            MutationOp::Insert {
                key: crate::codec::encode_key(&PrimaryKey::single(Value::Integer(1))),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        txn.rollback_to_savepoint("sp1").unwrap();

        // `sp1` must still be usable after a rollback-to, both for another
        // rollback-to and for a release.
        t1.perform_mutation(
            c1,
            MutationOp::Insert {
                key: crate::codec::encode_key(&PrimaryKey::single(Value::Integer(2))),
                row: vec![Value::Integer(2)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        txn.rollback_to_savepoint("sp1").unwrap();

        let rows = t1
            .scan(c1, crate::storage::unbounded(), crate::storage::Direction::Ascending)
            .unwrap();
        assert!(rows.is_empty());

        txn.release_savepoint("sp1").unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn release_savepoint_keeps_nested_writes() {
        let (txn, catalog) = new_txn_manager();
        let t1 = catalog.create_table(test_schema("t1")).unwrap();
        let c1 = txn.register_connection("main.t1", &t1).unwrap();
        txn.begin_explicit().unwrap();
        txn.create_savepoint("sp1").unwrap();
        t1.perform_mutation(
            c1,
            MutationOp::Insert {
                key: crate::codec::encode_key(&PrimaryKey::single(Value::Integer(1))),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        txn.release_savepoint("sp1").unwrap();
        txn.commit().unwrap();

        let rows = t1
            .scan(c1, crate::storage::unbounded(), crate::storage::Direction::Ascending)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
