//! Table and column schema definitions (spec.md §3's `TableSchema`).
//!
//! Grounded in the teacher's `spacetimedb_schema::schema::TableSchema`/
//! `ColumnSchema` split (referenced throughout `db/relational_db.rs`), but
//! narrowed to the fields spec.md §3 actually names.

use std::sync::Arc;

use crate::value::{Collation, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Integer,
    Real,
    Text,
    Bytes,
    Boolean,
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub ty: ScalarType,
    pub nullable: bool,
    pub default: Option<Value>,
    pub collation: Collation,
    /// `true` if this column's value is computed from others rather than
    /// stored directly (GENERATED ALWAYS AS).
    pub generated: bool,
}

/// Ordered list of column indices (with per-column direction) that make up a
/// table's primary key. Invariant: non-empty (spec.md §3: PK column count ≥ 1).
#[derive(Debug, Clone)]
pub struct PrimaryKeyDef {
    pub columns: Vec<(usize, SortDirection)>,
}

impl PrimaryKeyDef {
    pub fn column_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.columns.iter().map(|(i, _)| *i)
    }
}

#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<(usize, SortDirection)>,
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub enum CheckConstraint {
    /// Opaque to the core: the predicate expression is owned by the
    /// planner/evaluator (out of scope per spec.md §1); the core only needs
    /// the name for error reporting and a handle the evaluator understands.
    Expression { name: String, handle: u64 },
}

/// Identifies the virtual-table backend module responsible for a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef(pub String);

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub schema_namespace: String,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: PrimaryKeyDef,
    pub secondary_indexes: Vec<IndexSchema>,
    pub checks: Vec<CheckConstraint>,
    pub module: ModuleRef,
    /// Monotonic generation stamp, bumped on every schema mutation; used by
    /// the assertion evaluator's plan cache invalidation (spec.md §3, §4.8).
    pub generation: u64,
}

impl TableSchema {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_namespace, self.name)
    }

    pub fn primary_key_collations(&self) -> Vec<Collation> {
        self.primary_key
            .column_indices()
            .map(|i| self.columns[i].collation)
            .collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

pub type TableSchemaRef = Arc<TableSchema>;
