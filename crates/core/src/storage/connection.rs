//! Table connection (spec.md §4.4).
//!
//! Owns a read-snapshot layer pointer and, while mid-transaction, a stack of
//! pending transaction layers (the bottom one parented at the committed tip
//! seen at `begin`, each subsequent one a savepoint nested on the last). The
//! table manager (storage/table_manager.rs) is the only thing that mutates a
//! `TableConnection`; this type is otherwise just the data it carries.

use crate::error::{EngineError, MisuseError, Result};

use super::layer::{Layer, LayerHandle};

pub type ConnectionId = u64;

pub struct TableConnection {
    pub id: ConnectionId,
    pub read_snapshot: LayerHandle,
    /// The committed tip this connection's pending layer stack was parented
    /// on at `begin` time — what optimistic commit validation compares
    /// against (spec.md §4.5).
    pub pending_parent: Option<LayerHandle>,
    savepoints: Vec<LayerHandle>,
}

impl TableConnection {
    pub fn new(id: ConnectionId, read_snapshot: LayerHandle) -> Self {
        TableConnection {
            id,
            read_snapshot,
            pending_parent: None,
            savepoints: Vec::new(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        !self.savepoints.is_empty()
    }

    /// Allocates a pending layer parented at `tip`.
    pub fn begin(&mut self, tip: &LayerHandle) -> Result<()> {
        if self.in_transaction() {
            return Err(MisuseError::Other("connection already has a pending transaction".into()).into());
        }
        self.pending_parent = Some(tip.clone());
        self.savepoints.push(Layer::new_transaction(tip));
        Ok(())
    }

    /// The layer DML should currently write into: the top of the savepoint
    /// stack if mid-transaction, otherwise `None`.
    pub fn top(&self) -> Option<&LayerHandle> {
        self.savepoints.last()
    }

    /// Pushes a new savepoint layer child of the current top. Returns the new
    /// stack depth (1-based).
    pub fn create_savepoint(&mut self) -> Result<usize> {
        let top = self
            .top()
            .ok_or_else(|| EngineError::from(MisuseError::Other("no active transaction".into())))?
            .clone();
        self.savepoints.push(Layer::new_transaction(&top));
        Ok(self.savepoints.len())
    }

    /// Merges all frames down to `depth` into that depth's frame (spec.md
    /// §4.6's connection-side counterpart): repeatedly folds the top layer's
    /// local entries into the layer below, discarding the top.
    pub fn release_savepoint(&mut self, depth: usize) -> Result<()> {
        if depth == 0 || depth > self.savepoints.len() {
            return Err(MisuseError::Other("invalid savepoint depth".into()).into());
        }
        while self.savepoints.len() > depth {
            let child = self.savepoints.pop().unwrap();
            let parent = self.savepoints.last().unwrap();
            let entries = child.read().local_entries();
            let mut parent_guard = parent.write();
            for (key, entry) in entries {
                parent_guard.apply_entry(key, entry)?;
            }
        }
        Ok(())
    }

    /// Discards all frames above `depth`.
    pub fn rollback_to_savepoint(&mut self, depth: usize) -> Result<()> {
        if depth == 0 || depth > self.savepoints.len() {
            return Err(MisuseError::Other("invalid savepoint depth".into()).into());
        }
        self.savepoints.truncate(depth);
        Ok(())
    }

    /// Flattens the whole savepoint stack into a single layer ready to hand
    /// to the table manager's `commit`, or `None` if there is no pending
    /// transaction.
    pub fn flatten(&mut self) -> Result<Option<LayerHandle>> {
        if self.savepoints.is_empty() {
            return Ok(None);
        }
        self.release_savepoint(1)?;
        Ok(self.savepoints.pop())
    }

    /// Discards any pending transaction outright (rollback, or a failed
    /// commit's cleanup).
    pub fn discard_transaction(&mut self) {
        self.savepoints.clear();
        self.pending_parent = None;
    }
}
