//! External collaborator contracts (spec.md §6).
//!
//! The SQL lexer/parser, relational planner/optimizer, expression evaluator,
//! instruction emitter, and built-in function library are explicitly out of
//! scope (spec.md §1). The core only depends on the narrow interfaces named
//! here; production implementations live in sibling crates this crate never
//! references. `crate::testkit` supplies fakes for end-to-end tests.

use std::sync::Arc;

use crate::error::Result;
use crate::value::{Row, Value};

/// A parsed statement handed back by the [`Parser`]. The core only inspects
/// `tag` (to route transaction-control statements, spec.md §6); `payload` is
/// opaque and passed through to the planner untouched.
#[derive(Debug, Clone)]
pub struct Statement {
    pub tag: StatementTag,
    pub text: String,
}

/// Transaction-control tags the core must recognize to route execution;
/// every other statement is opaque DML/DDL routed to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementTag {
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Release,
    /// `ROLLBACK TO [SAVEPOINT] <name>`; `Statement.text` carries the bare
    /// savepoint name, same convention as `Savepoint`/`Release`.
    RollbackToSavepoint,
    Other,
}

pub trait Parser: Send + Sync {
    fn parse_all(&self, text: &str) -> Result<Vec<Statement>>;
    fn parse(&self, text: &str) -> Result<Statement>;
}

/// Opaque logical plan produced by the planner and rewritten by the
/// optimizer. The core never inspects its contents; it only threads it
/// through to the emitter.
pub struct BlockPlan {
    pub statements: Vec<Statement>,
}

pub trait Planner: Send + Sync {
    fn build_block(&self, statements: Vec<Statement>) -> Result<BlockPlan>;
}

#[derive(Default)]
pub struct OptimizerDiagnostics {
    pub quickpick: Option<String>,
}

pub trait Optimizer: Send + Sync {
    fn optimize(&self, plan: BlockPlan) -> Result<BlockPlan>;
    fn optimize_for_analysis(&self, plan: BlockPlan) -> Result<BlockPlan>;
    fn last_diagnostics(&self) -> Option<OptimizerDiagnostics> {
        None
    }
}

/// A ready-to-run instruction tree. `programs` enumerates sub-programs
/// (spec.md §6); the core only needs the count to size scheduler bookkeeping.
pub struct Instruction {
    pub programs: usize,
}

pub trait Emitter: Send + Sync {
    fn emit(&self, plan: BlockPlan) -> Result<Instruction>;
}

/// Outcome of running an instruction to completion: either a row set or a
/// scalar/DDL acknowledgement.
pub enum RunResult {
    Rows(Vec<Row>),
    Done,
}

pub trait Scheduler: Send + Sync {
    fn run(&self, instruction: Instruction) -> Result<RunResult>;
}

/// A scan request as planned by the optimizer: either an equality probe or a
/// bounded range, with a direction.
pub enum ScanPlan {
    Equality(Vec<Value>),
    Range {
        lower: Option<(Vec<Value>, bool)>,
        upper: Option<(Vec<Value>, bool)>,
        ascending: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    Abort,
    Ignore,
    Replace,
    Rollback,
    Fail,
}

pub enum VTableOp {
    Insert,
    Update { old_key: Vec<Value> },
    Delete { key: Vec<Value> },
}

/// Data-change or schema-change notification a vtab module may emit after a
/// successful commit (spec.md §5's "events are emitted only after a
/// successful commit").
#[derive(Debug, Clone)]
pub enum VTableEvent {
    DataChanged { table: String },
    SchemaChanged { table: String },
}

pub trait VTableModule: Send + Sync {
    fn connect(&self, table: &str) -> Result<()>;
    fn disconnect(&self, table: &str) -> Result<()>;
    fn begin(&self, table: &str) -> Result<()>;
    fn commit(&self, table: &str) -> Result<()>;
    fn rollback(&self, table: &str) -> Result<()>;
    fn x_query(&self, table: &str, plan: ScanPlan) -> Result<Vec<Row>>;
    fn x_update(&self, table: &str, op: VTableOp, new_row: Option<Row>) -> Result<Option<Row>>;
    fn subscribe_events(&self, _listener: Arc<dyn Fn(VTableEvent) + Send + Sync>) {}
}
