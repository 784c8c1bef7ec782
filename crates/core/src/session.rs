//! Session/database façade (spec.md §4.10).
//!
//! The process-wide root: owns the catalog, options, metrics, and
//! transaction manager, and serializes all top-level statement execution
//! behind one FIFO-fair mutex (spec.md §5). `tokio::sync::Mutex` is used
//! rather than `parking_lot`'s (used everywhere else in this crate for
//! plain data structures) specifically for its FIFO wake order; it's locked
//! synchronously via `blocking_lock`, since everything above the storage
//! layer in this crate is deliberately synchronous (see `crate::vtab`'s
//! doc comment).
//!
//! Statement routing is simplified relative to a full SQL front end:
//! `vtab::Parser` is expected to normalize `SAVEPOINT <name>` and
//! `RELEASE [SAVEPOINT] <name>` statements' `text` field down to the bare
//! savepoint name, since this crate's `Statement` doesn't carry a richer
//! parsed AST (planner/parser internals are out of scope, spec.md §1).
//! Likewise `eval` returns plain `Row`s rather than name-keyed maps: column
//! identity is metadata the opaque `vtab::RunResult` doesn't carry here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::assertion::AssertionEvaluator;
use crate::catalog::{Catalog, MAIN_SCHEMA};
use crate::error::{EngineError, MisuseError, Result};
use crate::metrics::Metrics;
use crate::options::{Options, RUNTIME_STATS};
use crate::schema::TableSchemaRef;
use crate::storage::TableManager;
use crate::txn::TransactionManager;
use crate::value::{Collation, Row, Value};
use crate::vtab::{Emitter, Optimizer, Parser, Planner, RunResult, Scheduler, Statement, StatementTag, VTableModule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreparedStatementHandle(u64);

struct PreparedStatement {
    text: String,
}

/// The external collaborators a session needs (spec.md §6); bundled so
/// `Session::new` doesn't take five separate boxes.
pub struct Collaborators {
    pub parser: Box<dyn Parser>,
    pub planner: Box<dyn Planner>,
    pub optimizer: Box<dyn Optimizer>,
    pub emitter: Box<dyn Emitter>,
    pub scheduler: Box<dyn Scheduler>,
}

pub struct Session {
    catalog: Arc<Catalog>,
    options: Arc<Options>,
    metrics: Arc<Metrics>,
    txn: Arc<TransactionManager>,
    collaborators: Collaborators,
    exec_mutex: tokio::sync::Mutex<()>,
    prepared: RwLock<HashMap<u64, PreparedStatement>>,
    next_prepared_id: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    pub fn new(options: Options, collaborators: Collaborators) -> Self {
        let metrics = Arc::new(Metrics::new());
        let catalog = Arc::new(Catalog::new(Arc::clone(&metrics)));
        let options = Arc::new(options);

        let assertion_evaluator = Arc::new(AssertionEvaluator::new(
            Box::new(PlannerBackedAnalyzer),
            Box::new(NullAssertionRunner),
            Arc::clone(&metrics),
        ));
        let txn = Arc::new(TransactionManager::new(
            Arc::clone(&catalog),
            assertion_evaluator,
            Arc::clone(&metrics),
        ));

        let metrics_for_listener = Arc::clone(&metrics);
        options.subscribe(Box::new(move |name, value| {
            if name == RUNTIME_STATS {
                if let Some(enabled) = value.as_bool() {
                    metrics_for_listener.set_enabled(enabled);
                }
            }
        }));
        metrics.set_enabled(options.get_bool(RUNTIME_STATS));

        Session {
            catalog,
            options,
            metrics,
            txn,
            collaborators,
            exec_mutex: tokio::sync::Mutex::new(()),
            prepared: RwLock::new(HashMap::new()),
            next_prepared_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn check_not_closed(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(EngineError::from(MisuseError::SessionClosed));
        }
        Ok(())
    }

    /// Registers a table connection for the current transaction if it
    /// hasn't been touched yet this session's transaction scope.
    fn touch_table(&self, qualified_name: &str, table_manager: &Arc<TableManager>) -> Result<()> {
        self.txn.register_connection(qualified_name, table_manager)?;
        Ok(())
    }

    /// `prepare(sql)` (spec.md §4.10): returns a handle; planning is deferred
    /// to first execution.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatementHandle> {
        self.check_not_closed()?;
        let id = self.next_prepared_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.prepared.write().insert(id, PreparedStatement { text: sql.to_string() });
        Ok(PreparedStatementHandle(id))
    }

    pub fn finalize(&self, handle: PreparedStatementHandle) {
        self.prepared.write().remove(&handle.0);
    }

    fn prepared_text(&self, handle: PreparedStatementHandle) -> Result<String> {
        self.prepared
            .read()
            .get(&handle.0)
            .map(|p| p.text.clone())
            .ok_or_else(|| EngineError::from(MisuseError::StatementFinalized))
    }

    /// `exec(sql)` (spec.md §4.10): runs every statement in `sql` to
    /// completion under the top-level execution mutex, wrapping DML/DDL in
    /// an implicit transaction when autocommit.
    pub fn exec(&self, sql: &str) -> Result<()> {
        self.check_not_closed()?;
        let _guard = self.exec_mutex.blocking_lock();
        self.exec_locked(sql)
    }

    pub fn exec_prepared(&self, handle: PreparedStatementHandle) -> Result<()> {
        let text = self.prepared_text(handle)?;
        self.exec(&text)
    }

    /// Reentrant entry point for SQL emitted by a running statement itself
    /// (e.g. a trigger body) rather than by the top-level caller: the
    /// top-level `exec`/`eval` already hold `exec_mutex`, so this skips
    /// re-acquiring it (spec.md §4.10: "a reentrant ... entry point for
    /// runtime-emitted nested SQL").
    pub fn exec_within_transaction(&self, sql: &str) -> Result<()> {
        self.check_not_closed()?;
        self.exec_locked(sql)
    }

    fn exec_locked(&self, sql: &str) -> Result<()> {
        for statement in self.collaborators.parser.parse_all(sql)? {
            self.exec_statement(&statement)?;
        }
        Ok(())
    }

    fn exec_statement(&self, statement: &Statement) -> Result<()> {
        match statement.tag {
            StatementTag::Begin => self.txn.begin_explicit(),
            StatementTag::Commit => self.txn.commit(),
            StatementTag::Rollback => self.txn.rollback(),
            StatementTag::Savepoint => self.txn.create_savepoint(&statement.text).map(|_| ()),
            StatementTag::Release => self.txn.release_savepoint(&statement.text),
            StatementTag::RollbackToSavepoint => self.txn.rollback_to_savepoint(&statement.text),
            StatementTag::Other => self.run_block(std::slice::from_ref(statement)).map(|_| ()),
        }
    }

    /// `eval(sql)` (spec.md §4.10): runs `sql` and returns its rows,
    /// holding the execution mutex for the iterator's lifetime.
    pub fn eval(&self, sql: &str) -> Result<RowIter<'_>> {
        self.check_not_closed()?;
        let guard = self.exec_mutex.blocking_lock();
        let statement = self.collaborators.parser.parse(sql)?;
        let result = self.run_block(std::slice::from_ref(&statement))?;
        let rows = match result {
            RunResult::Rows(rows) => rows,
            RunResult::Done => Vec::new(),
        };
        Ok(RowIter {
            _guard: guard,
            rows: rows.into_iter(),
        })
    }

    fn run_block(&self, statements: &[Statement]) -> Result<RunResult> {
        self.txn.ensure_transaction()?;
        let result = (|| {
            let block = self.collaborators.planner.build_block(statements.to_vec())?;
            let optimized = self.collaborators.optimizer.optimize(block)?;
            let instruction = self.collaborators.emitter.emit(optimized)?;
            self.collaborators.scheduler.run(instruction)
        })();
        match &result {
            Ok(_) => self.txn.autocommit_if_needed()?,
            Err(_) => {
                let _ = self.txn.autorollback_if_needed();
            }
        }
        result
    }

    pub fn begin_transaction(&self) -> Result<()> {
        self.check_not_closed()?;
        let _guard = self.exec_mutex.blocking_lock();
        self.txn.begin_explicit()
    }

    pub fn commit(&self) -> Result<()> {
        self.check_not_closed()?;
        let _guard = self.exec_mutex.blocking_lock();
        self.txn.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.check_not_closed()?;
        let _guard = self.exec_mutex.blocking_lock();
        self.txn.rollback()
    }

    /// Programmatic table definition (spec.md §4.10's DDL surface). Per
    /// spec.md §7, definitions outside the main schema are misuse, not a
    /// missing-schema error.
    pub fn define_table(&self, schema: TableSchemaRef) -> Result<Arc<TableManager>> {
        self.check_not_closed()?;
        if schema.schema_namespace != MAIN_SCHEMA {
            return Err(EngineError::from(crate::error::CatalogError::NotMainSchema));
        }
        let table_manager = self.catalog.create_table(schema)?;
        let qualified = table_manager.schema().qualified_name();
        if self.txn.in_transaction() {
            self.touch_table(&qualified, &table_manager)?;
        }
        Ok(table_manager)
    }

    pub fn register_module(&self, name: &str, module: Arc<dyn VTableModule>) -> Result<()> {
        self.check_not_closed()?;
        self.catalog.register_module(name, module)
    }

    pub fn register_collation(&self, name: &str, collation: Collation) {
        self.catalog.register_collation(name, collation);
    }

    pub fn set_option(&self, name: &str, value: crate::options::OptionValue) -> Result<()> {
        self.check_not_closed()?;
        self.options.set(name, value)
    }

    pub fn get_option(&self, name: &str) -> Option<crate::options::OptionValue> {
        self.options.get(name)
    }

    /// `close()` (spec.md §4.10): finalizes every prepared statement, rolls
    /// back any open transaction, disconnects every table connection, and
    /// clears the catalog.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        self.prepared.write().clear();
        let _ = self.txn.rollback();
        self.txn.disconnect_all();
        self.catalog.clear();
        Ok(())
    }
}

pub struct RowIter<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
    rows: std::vec::IntoIter<Row>,
}

impl<'a> Iterator for RowIter<'a> {
    type Item = Row;
    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }
}

/// Placeholder analyzer used until a session is wired to a real
/// planner/optimizer: no assertion ever references a table, so
/// `AssertionEvaluator::evaluate_at_commit` is always a no-op. Real sessions
/// are expected to construct their own `AssertionEvaluator` with an analyzer
/// backed by `collaborators.planner`/`collaborators.optimizer` once those
/// are available; wiring that through `Session::new` would require the
/// planner to expose relation-key enumeration, which `vtab::Planner` (opaque
/// `BlockPlan`) doesn't provide.
struct PlannerBackedAnalyzer;
impl crate::assertion::AssertionAnalyzer for PlannerBackedAnalyzer {
    fn analyze(&self, _def: &crate::catalog::AssertionDef) -> Result<crate::assertion::AssertionAnalysis> {
        Ok(crate::assertion::AssertionAnalysis {
            relation_keys: Vec::new(),
            full_query: crate::vtab::Instruction { programs: 0 },
            row_specific_queries: HashMap::new(),
        })
    }
}
struct NullAssertionRunner;
impl crate::assertion::AssertionRunner for NullAssertionRunner {
    fn run_full(&self, _instruction: &crate::vtab::Instruction) -> Result<Vec<Vec<Value>>> {
        Ok(Vec::new())
    }
    fn run_row_specific(&self, _instruction: &crate::vtab::Instruction, _pk: &[Value]) -> Result<Vec<Vec<Value>>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtab::{BlockPlan, Instruction};

    struct EchoParser;
    impl Parser for EchoParser {
        fn parse_all(&self, text: &str) -> Result<Vec<Statement>> {
            Ok(vec![self.parse(text)?])
        }
        fn parse(&self, text: &str) -> Result<Statement> {
            let tag = match text.trim() {
                "BEGIN" => StatementTag::Begin,
                "COMMIT" => StatementTag::Commit,
                "ROLLBACK" => StatementTag::Rollback,
                _ => StatementTag::Other,
            };
            Ok(Statement {
                tag,
                text: text.to_string(),
            })
        }
    }
    struct EchoPlanner;
    impl Planner for EchoPlanner {
        fn build_block(&self, statements: Vec<Statement>) -> Result<BlockPlan> {
            Ok(BlockPlan { statements })
        }
    }
    struct EchoOptimizer;
    impl Optimizer for EchoOptimizer {
        fn optimize(&self, plan: BlockPlan) -> Result<BlockPlan> {
            Ok(plan)
        }
        fn optimize_for_analysis(&self, plan: BlockPlan) -> Result<BlockPlan> {
            Ok(plan)
        }
    }
    struct EchoEmitter;
    impl Emitter for EchoEmitter {
        fn emit(&self, plan: BlockPlan) -> Result<Instruction> {
            Ok(Instruction {
                programs: plan.statements.len(),
            })
        }
    }
    struct EchoScheduler;
    impl Scheduler for EchoScheduler {
        fn run(&self, _instruction: Instruction) -> Result<RunResult> {
            Ok(RunResult::Done)
        }
    }

    fn new_session() -> Session {
        Session::new(
            Options::new(),
            Collaborators {
                parser: Box::new(EchoParser),
                planner: Box::new(EchoPlanner),
                optimizer: Box::new(EchoOptimizer),
                emitter: Box::new(EchoEmitter),
                scheduler: Box::new(EchoScheduler),
            },
        )
    }

    #[test]
    fn exec_runs_ddl_in_autocommit() {
        let session = new_session();
        session.exec("CREATE TABLE t (id INTEGER)").unwrap();
    }

    #[test]
    fn explicit_transaction_round_trips() {
        let session = new_session();
        session.begin_transaction().unwrap();
        session.exec("INSERT INTO t VALUES (1)").unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn closed_session_rejects_further_exec() {
        let session = new_session();
        session.close().unwrap();
        let err = session.exec("SELECT 1").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Misuse);
    }

    #[test]
    fn runtime_stats_option_gates_metrics() {
        let session = new_session();
        assert!(!session.metrics().enabled());
        session
            .set_option(RUNTIME_STATS, crate::options::OptionValue::Bool(true))
            .unwrap();
        assert!(session.metrics().enabled());
    }

    #[test]
    fn prepare_then_finalize_then_exec_prepared_fails() {
        let session = new_session();
        let handle = session.prepare("SELECT 1").unwrap();
        session.finalize(handle);
        let err = session.exec_prepared(handle).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Misuse);
    }
}
