//! Error taxonomy for the engine core.
//!
//! Mirrors the teacher's layering: small per-subsystem error enums that funnel
//! into one top-level error via `#[from]`, plus an `anyhow`-wrapped variant for
//! opaque errors raised by the external collaborators (parser, planner,
//! optimizer, emitter, scheduler) described in spec.md §6.

use thiserror::Error;

use crate::value::Value;

/// Uniquely names a constraint or assertion for error reporting.
pub type ConstraintName = String;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("table `{0}` not found")]
    NotFound(String),
    #[error("table `{0}` already exists")]
    AlreadyExists(String),
    #[error("column `{0}` not found")]
    ColumnNotFound(String),
    #[error("primary key column `{0}` cannot be dropped")]
    PrimaryKeyColumnDrop(String),
    #[error("index `{0}` not found")]
    IndexNotFound(String),
    #[error("index `{0}` already exists")]
    IndexAlreadyExists(String),
    #[error("table is marked read-only")]
    ReadOnly,
}

#[derive(Error, Debug)]
pub enum ConstraintError {
    #[error("UNIQUE constraint `{name}` violated by key {key:?}")]
    Unique { name: ConstraintName, key: Vec<Value> },
    #[error("NOT NULL constraint violated on column `{column}`")]
    NotNull { column: String },
    #[error("CHECK constraint `{name}` violated")]
    Check { name: ConstraintName },
    #[error("row constraint `{name}` violated for key {key:?}")]
    Row { name: ConstraintName, key: Vec<Value> },
    #[error("assertion `{name}` violated ({sample_len} witness row(s) sampled)")]
    Assertion {
        name: ConstraintName,
        sample_len: usize,
        witnesses: Vec<Vec<Value>>,
    },
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("schema `{0}` not found")]
    SchemaNotFound(String),
    #[error("function `{0}` not found")]
    FunctionNotFound(String),
    #[error("module `{0}` not found")]
    ModuleNotFound(String),
    #[error("collation `{0}` not found")]
    CollationNotFound(String),
    #[error("assertion `{0}` not found")]
    AssertionNotFound(String),
    #[error("duplicate definition of `{0}` in schema `{1}`")]
    Duplicate(String, String),
    #[error("programmatic definitions are only allowed in the main schema")]
    NotMainSchema,
}

#[derive(Error, Debug)]
pub enum MisuseError {
    #[error("session is closed")]
    SessionClosed,
    #[error("statement is already finalized")]
    StatementFinalized,
    #[error("parameter shape is not allowed here: {0}")]
    BadParameterShape(String),
    #[error("{0}")]
    Other(String),
}

/// The abstract error kinds from spec.md §7, collapsed into one enum so
/// callers can match on `kind()` without caring which subsystem raised it.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("misuse: {0}")]
    Misuse(#[from] MisuseError),
    #[error("constraint violation: {0}")]
    Constraint(#[from] ConstraintError),
    #[error("busy: {0}")]
    Busy(String),
    #[error("internal invariant broken: {0}")]
    Internal(String),
    #[error("table error: {0}")]
    Table(#[from] TableError),
    #[error("not found: {0}")]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// A coarse classification used by callers that need to decide whether an
/// error is retryable, e.g. "busy" commit staleness (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Misuse,
    Constraint,
    Busy,
    Internal,
    ReadOnly,
    NotFound,
    Other,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Syntax(_) => ErrorKind::Syntax,
            EngineError::Misuse(_) => ErrorKind::Misuse,
            EngineError::Constraint(_) => ErrorKind::Constraint,
            EngineError::Busy(_) => ErrorKind::Busy,
            EngineError::Internal(_) => ErrorKind::Internal,
            // Lookup misses classify as `NotFound`; shape violations on an
            // existing table/index as `Misuse`; the one true read-only case
            // keeps `ReadOnly`.
            EngineError::Table(
                TableError::NotFound(_) | TableError::ColumnNotFound(_) | TableError::IndexNotFound(_),
            ) => ErrorKind::NotFound,
            EngineError::Table(
                TableError::AlreadyExists(_) | TableError::IndexAlreadyExists(_) | TableError::PrimaryKeyColumnDrop(_),
            ) => ErrorKind::Misuse,
            EngineError::Table(TableError::ReadOnly) => ErrorKind::ReadOnly,
            // Duplicate schema entries and off-main-schema definitions are a
            // misuse per spec.md §7, not a lookup miss; other catalog
            // variants are genuine not-found misses.
            EngineError::Catalog(CatalogError::Duplicate(_, _)) | EngineError::Catalog(CatalogError::NotMainSchema) => {
                ErrorKind::Misuse
            }
            EngineError::Catalog(_) => ErrorKind::NotFound,
            EngineError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        EngineError::Busy(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }
}
