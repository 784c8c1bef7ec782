//! Table manager (spec.md §4.5): one per table, the sole owner of a table's
//! layer chain, connection registry, and schema.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::instrument;

use crate::codec::EncodedKey;
use crate::error::{ConstraintError, EngineError, MisuseError, Result};
use crate::metrics::Metrics;
use crate::schema::{TableSchema, TableSchemaRef};
use crate::value::Row;

use super::connection::{ConnectionId, TableConnection};
use super::layer::{Layer, LayerHandle};
use super::ordered_map::{unbounded, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    Abort,
    Ignore,
    Replace,
    Rollback,
    Fail,
}

#[derive(Debug, Clone)]
pub enum MutationOp {
    Insert { key: EncodedKey, row: Row },
    Update {
        old_key: EncodedKey,
        new_key: EncodedKey,
        new_row: Row,
    },
    Delete { key: EncodedKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// IGNORE suppressed a unique violation, or a DELETE found no row.
    NoRow,
}

pub struct TableManager {
    schema: RwLock<TableSchemaRef>,
    /// The current effective base layer. Reseated (never mutated in place)
    /// whenever collapse promotes a detached transaction layer to take its
    /// place (spec.md §4.5).
    base: RwLock<LayerHandle>,
    /// Committed transaction layers, oldest first. Invariant: `chain[0]`'s
    /// parent is always `*base`; collapse always pops from the front.
    committed_chain: RwLock<VecDeque<LayerHandle>>,
    connections: RwLock<HashMap<ConnectionId, TableConnection>>,
    next_connection_id: AtomicU64,
    collapse_lock: Mutex<()>,
    schema_lock: Mutex<()>,
    metrics: Arc<Metrics>,
}

impl TableManager {
    pub fn new(schema: TableSchemaRef, metrics: Arc<Metrics>) -> Self {
        TableManager {
            schema: RwLock::new(schema),
            base: RwLock::new(Layer::new_base()),
            committed_chain: RwLock::new(VecDeque::new()),
            connections: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            collapse_lock: Mutex::new(()),
            schema_lock: Mutex::new(()),
            metrics,
        }
    }

    pub fn schema(&self) -> TableSchemaRef {
        self.schema.read().clone()
    }

    /// The current committed tip: the newest committed transaction layer, or
    /// the base layer if none has committed yet.
    pub fn tip(&self) -> LayerHandle {
        self.committed_chain
            .read()
            .back()
            .cloned()
            .unwrap_or_else(|| self.base.read().clone())
    }

    /// `connect()` (spec.md §4.5): hands out a connection pointing at the
    /// current committed tip.
    pub fn connect(&self) -> ConnectionId {
        let id = self.next_connection_id.fetch_add(1, AtomicOrdering::Relaxed);
        let snapshot = self.tip();
        self.connections
            .write()
            .insert(id, TableConnection::new(id, snapshot));
        id
    }

    pub fn disconnect(&self, id: ConnectionId) {
        self.connections.write().remove(&id);
        self.try_collapse();
    }

    fn with_connection_mut<T>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut TableConnection) -> Result<T>,
    ) -> Result<T> {
        let mut conns = self.connections.write();
        let conn = conns
            .get_mut(&id)
            .ok_or_else(|| EngineError::from(MisuseError::Other("unknown connection".into())))?;
        f(conn)
    }

    pub fn begin(&self, id: ConnectionId) -> Result<()> {
        let tip = self.tip();
        self.with_connection_mut(id, |conn| conn.begin(&tip))
    }

    pub fn in_transaction(&self, id: ConnectionId) -> Result<bool> {
        self.with_connection_mut(id, |conn| Ok(conn.in_transaction()))
    }

    pub fn create_savepoint(&self, id: ConnectionId) -> Result<usize> {
        self.with_connection_mut(id, |conn| conn.create_savepoint())
    }

    pub fn release_savepoint(&self, id: ConnectionId, depth: usize) -> Result<()> {
        self.with_connection_mut(id, |conn| conn.release_savepoint(depth))
    }

    pub fn rollback_to_savepoint(&self, id: ConnectionId, depth: usize) -> Result<()> {
        self.with_connection_mut(id, |conn| conn.rollback_to_savepoint(depth))
    }

    pub fn rollback(&self, id: ConnectionId) -> Result<()> {
        self.with_connection_mut(id, |conn| {
            conn.discard_transaction();
            Ok(())
        })
    }

    /// `commit(connection)` (spec.md §4.5): validates the pending layer's
    /// parent is still the current committed tip; on staleness, fails with a
    /// retryable "busy" and discards the pending layer. Otherwise the layer
    /// is marked committed, becomes the new tip, and the connection's
    /// read-snapshot advances.
    ///
    /// `relaxed` corresponds to the transaction manager's "coordinated
    /// commit" flag (spec.md §4.9): when set, the parent-staleness check is
    /// skipped, since sibling tables' connections in the same multi-table
    /// transaction are expected to commit in sequence against tips that may
    /// have moved relative to each other but not relative to themselves.
    #[instrument(skip(self))]
    pub fn commit(&self, id: ConnectionId, relaxed: bool) -> Result<()> {
        let tip = self.tip();
        let mut conns = self.connections.write();
        let conn = conns
            .get_mut(&id)
            .ok_or_else(|| EngineError::from(MisuseError::Other("unknown connection".into())))?;

        let Some(pending) = conn.flatten()? else {
            return Ok(());
        };

        let stale = !relaxed
            && conn
                .pending_parent
                .as_ref()
                .map(|p| !Arc::ptr_eq(p, &tip))
                .unwrap_or(true);

        if stale {
            conn.discard_transaction();
            self.metrics.record_busy_retry();
            return Err(EngineError::busy(
                "commit validation failed: committed tip advanced since begin",
            ));
        }

        pending.write().mark_committed();
        self.committed_chain.write().push_back(Arc::clone(&pending));
        conn.read_snapshot = pending;
        conn.pending_parent = None;
        drop(conns);

        self.try_collapse();
        Ok(())
    }

    /// `tryCollapse()` (spec.md §4.5): non-blocking; walks the chain from the
    /// bottom, folding the oldest committed layer into the (reseated)
    /// effective base once nothing references the base as a read-snapshot or
    /// pending-parent. Always collapses in commit order.
    #[instrument(skip(self))]
    pub fn try_collapse(&self) {
        let Some(_guard) = self.collapse_lock.try_lock() else {
            return;
        };
        loop {
            let mut chain = self.committed_chain.write();
            let Some(oldest) = chain.front().cloned() else {
                break;
            };
            let base_handle = self.base.read().clone();
            let referenced = self.connections.read().values().any(|c| {
                Arc::ptr_eq(&c.read_snapshot, &base_handle)
                    || c.pending_parent
                        .as_ref()
                        .map(|p| Arc::ptr_eq(p, &base_handle))
                        .unwrap_or(false)
            });
            if referenced {
                break;
            }
            {
                let mut layer = oldest.write();
                layer.clear_base();
                layer.promote_to_base();
            }
            *self.base.write() = Arc::clone(&oldest);
            chain.pop_front();
            self.metrics.record_collapse();
        }
    }

    /// Returns `None` for either a miss or a tombstone, otherwise the row
    /// from the nearest layer (spec.md §4.5's `lookupEffectiveRow`).
    pub fn lookup_effective_row(&self, from: &LayerHandle, key: &EncodedKey) -> Option<Row> {
        from.read().get(key).and_then(|e| e.into_row())
    }

    /// Schema-change boundary (spec.md §8's testable property): succeeds
    /// only when no committed transaction layer is awaiting collapse and no
    /// connection has an open pending transaction; otherwise busy-fails so
    /// the caller can wait for in-flight transactions to finish and retry.
    #[instrument(skip(self, mutate))]
    pub fn alter_schema(&self, mutate: impl FnOnce(&mut TableSchema)) -> Result<()> {
        let _guard = self.schema_lock.lock();
        if !self.committed_chain.read().is_empty() {
            return Err(EngineError::busy(
                "schema change blocked: committed transaction layers are still pending collapse",
            ));
        }
        if self.connections.read().values().any(|c| c.pending_parent.is_some()) {
            return Err(EngineError::busy(
                "schema change blocked: a connection has an open transaction",
            ));
        }
        let mut schema = self.schema.write();
        let mut next = (**schema).clone();
        mutate(&mut next);
        *schema = Arc::new(next);
        Ok(())
    }

    fn active_layer(&self, conn: &TableConnection) -> LayerHandle {
        conn.top().cloned().unwrap_or_else(|| conn.read_snapshot.clone())
    }

    /// Scans the effective merged view through whichever layer the
    /// connection currently reads through, filtering out tombstones. The
    /// N-way ordered merge across pending/committed/base layers is handled
    /// recursively inside `InheritableMap::scan` (spec.md §4.1); this is just
    /// the per-table entry point spec.md §4.5 calls out as "a single
    /// per-table operator".
    pub fn scan(
        &self,
        id: ConnectionId,
        range: impl std::ops::RangeBounds<EncodedKey> + Clone,
        dir: Direction,
    ) -> Result<Vec<(EncodedKey, Row)>> {
        let conns = self.connections.read();
        let conn = conns
            .get(&id)
            .ok_or_else(|| EngineError::from(MisuseError::Other("unknown connection".into())))?;
        let layer = self.active_layer(conn);
        let entries = layer.read().scan(range, dir);
        Ok(entries
            .into_iter()
            .filter_map(|(k, e)| e.into_row().map(|r| (k, r)))
            .collect())
    }

    /// `performMutation` (spec.md §4.5): the sole DML entry point. Ensures a
    /// pending layer exists, resolves PK conflicts per `conflict`, and
    /// applies the operation.
    #[instrument(skip(self, op))]
    pub fn perform_mutation(
        &self,
        id: ConnectionId,
        op: MutationOp,
        conflict: ConflictMode,
    ) -> Result<MutationOutcome> {
        if !self.in_transaction(id)? {
            self.begin(id)?;
        }

        let mut conns = self.connections.write();
        let conn = conns
            .get_mut(&id)
            .ok_or_else(|| EngineError::from(MisuseError::Other("unknown connection".into())))?;
        let layer = conn
            .top()
            .cloned()
            .ok_or_else(|| EngineError::internal("auto-begin did not produce a pending layer"))?;

        match op {
            MutationOp::Insert { key, row } => {
                let existing = layer.read().get(&key).and_then(|e| e.into_row());
                if existing.is_some() {
                    return Self::resolve_conflict(conn, conflict, "primary key", key);
                }
                layer.write().record_upsert(key, row)?;
                self.metrics.record_row_inserted();
                Ok(MutationOutcome::Applied)
            }
            MutationOp::Update {
                old_key,
                new_key,
                new_row,
            } => {
                if old_key != new_key {
                    let existing = layer.read().get(&new_key).and_then(|e| e.into_row());
                    if existing.is_some() {
                        return Self::resolve_conflict(conn, conflict, "primary key", new_key);
                    }
                    layer.write().record_delete(old_key)?;
                }
                layer.write().record_upsert(new_key, new_row)?;
                self.metrics.record_row_updated();
                Ok(MutationOutcome::Applied)
            }
            MutationOp::Delete { key } => {
                let existing = layer.read().get(&key).and_then(|e| e.into_row());
                if existing.is_none() {
                    return Ok(MutationOutcome::NoRow);
                }
                layer.write().record_delete(key)?;
                self.metrics.record_row_deleted();
                Ok(MutationOutcome::Applied)
            }
        }
    }

    fn resolve_conflict(
        conn: &mut TableConnection,
        conflict: ConflictMode,
        what: &str,
        _key: EncodedKey,
    ) -> Result<MutationOutcome> {
        match conflict {
            ConflictMode::Ignore => Ok(MutationOutcome::NoRow),
            ConflictMode::Abort | ConflictMode::Fail => Err(ConstraintError::Unique {
                name: what.to_string(),
                key: vec![],
            }
            .into()),
            ConflictMode::Replace => {
                // The emitter (out of scope here) is expected to have already
                // issued a delete of the conflicting row before retrying as a
                // plain insert; surfacing a violation here is the
                // conservative fallback when it hasn't.
                Err(ConstraintError::Unique {
                    name: format!("{what} (replace not pre-resolved)"),
                    key: vec![],
                }
                .into())
            }
            ConflictMode::Rollback => {
                conn.discard_transaction();
                Err(ConstraintError::Unique {
                    name: what.to_string(),
                    key: vec![],
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_key, PrimaryKey};
    use crate::schema::{ColumnSchema, ModuleRef, PrimaryKeyDef, ScalarType, SortDirection, TableSchema};
    use crate::value::{Collation, Value};

    fn test_schema() -> TableSchemaRef {
        Arc::new(TableSchema {
            schema_namespace: "main".into(),
            name: "t".into(),
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

    fn k(i: i64) -> EncodedKey {
        encode_key(&PrimaryKey::single(Value::Integer(i)))
    }

    fn new_mgr(schema: TableSchemaRef) -> TableManager {
        TableManager::new(schema, Arc::new(Metrics::new()))
    }

    #[test]
    fn insert_then_read_own_write_before_commit() {
        let mgr = new_mgr(test_schema());
        let c1 = mgr.connect();
        mgr.perform_mutation(
            c1,
            MutationOp::Insert {
                key: k(1),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();

        let rows = mgr.scan(c1, unbounded(), Direction::Ascending).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn other_connection_does_not_see_uncommitted_write() {
        let mgr = new_mgr(test_schema());
        let c1 = mgr.connect();
        let c2 = mgr.connect();
        mgr.perform_mutation(
            c1,
            MutationOp::Insert {
                key: k(1),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();

        let rows = mgr.scan(c2, unbounded(), Direction::Ascending).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn commit_then_new_connection_sees_row() {
        let mgr = new_mgr(test_schema());
        let c1 = mgr.connect();
        mgr.perform_mutation(
            c1,
            MutationOp::Insert {
                key: k(1),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        mgr.commit(c1, false).unwrap();

        let c2 = mgr.connect();
        let rows = mgr.scan(c2, unbounded(), Direction::Ascending).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn stale_commit_fails_busy_and_discards_pending() {
        let mgr = new_mgr(test_schema());
        let c1 = mgr.connect();
        let c2 = mgr.connect();

        mgr.perform_mutation(
            c1,
            MutationOp::Insert {
                key: k(1),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        mgr.commit(c1, false).unwrap();

        mgr.perform_mutation(
            c2,
            MutationOp::Insert {
                key: k(2),
                row: vec![Value::Integer(2)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        let err = mgr.commit(c2, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
        assert!(err.is_retryable());
    }

    #[test]
    fn insert_conflict_abort_raises_constraint_violation() {
        let mgr = new_mgr(test_schema());
        let c1 = mgr.connect();
        mgr.perform_mutation(
            c1,
            MutationOp::Insert {
                key: k(1),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        let outcome = mgr.perform_mutation(
            c1,
            MutationOp::Insert {
                key: k(1),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Ignore,
        )
        .unwrap();
        assert_eq!(outcome, MutationOutcome::NoRow);
    }

    #[test]
    fn collapse_runs_after_commit_once_unreferenced() {
        let mgr = new_mgr(test_schema());
        let c1 = mgr.connect();
        mgr.perform_mutation(
            c1,
            MutationOp::Insert {
                key: k(1),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();
        mgr.commit(c1, false).unwrap();
        mgr.disconnect(c1);

        assert!(mgr.committed_chain.read().is_empty());
        assert!(Arc::ptr_eq(&mgr.base.read(), &mgr.tip()));
    }

    #[test]
    fn alter_schema_succeeds_when_no_layer_above_base() {
        let mgr = new_mgr(test_schema());
        mgr.alter_schema(|s| s.generation += 1).unwrap();
        assert_eq!(mgr.schema().generation, 1);
    }

    #[test]
    fn alter_schema_fails_busy_while_a_connection_has_an_open_transaction() {
        let mgr = new_mgr(test_schema());
        let c1 = mgr.connect();
        mgr.perform_mutation(
            c1,
            MutationOp::Insert {
                key: k(1),
                row: vec![Value::Integer(1)],
            },
            ConflictMode::Abort,
        )
        .unwrap();

        let err = mgr.alter_schema(|s| s.generation += 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);

        mgr.commit(c1, false).unwrap();
        mgr.disconnect(c1);
        mgr.alter_schema(|s| s.generation += 1).unwrap();
        assert_eq!(mgr.schema().generation, 1);
    }

    #[test]
    fn delete_missing_row_is_no_row_not_error() {
        let mgr = new_mgr(test_schema());
        let c1 = mgr.connect();
        let outcome = mgr
            .perform_mutation(c1, MutationOp::Delete { key: k(99) }, ConflictMode::Abort)
            .unwrap();
        assert_eq!(outcome, MutationOutcome::NoRow);
    }
}
