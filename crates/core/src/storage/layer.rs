//! Base and transaction layers (spec.md §4.2, §4.3).
//!
//! Both kinds of layer are the same underlying structure — an
//! [`InheritableMap`] keyed by [`EncodedKey`] — tagged with a [`LayerKind`] so
//! shared operations (`get`, `scan`, `record_upsert`, `record_delete`) don't
//! branch on an instance check (spec.md §9's redesign note). Every layer is
//! held behind the same `Arc<RwLock<Layer>>` handle regardless of whether it
//! is mutable right now; see storage/table_manager.rs for the invariant that
//! makes sharing a possibly-mutable parent across readers safe.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::EncodedKey;
use crate::error::Result;
use crate::value::Row;

use super::ordered_map::{Direction, InheritableMap, Parent};

/// A map entry: either a live row or an explicit tombstone recording that a
/// key present in some ancestor layer has been deleted here.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Row(Row),
    Tombstone,
}

impl Entry {
    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Entry::Row(r) => Some(r),
            Entry::Tombstone => None,
        }
    }

    pub fn into_row(self) -> Option<Row> {
        match self {
            Entry::Row(r) => Some(r),
            Entry::Tombstone => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Base,
    Transaction,
}

pub struct Layer {
    pub kind: LayerKind,
    map: InheritableMap<EncodedKey, Entry>,
    committed: bool,
}

pub type LayerHandle = Arc<RwLock<Layer>>;

impl Layer {
    /// Creates a fresh, parentless base layer (spec.md §4.2: "created with the
    /// table").
    pub fn new_base() -> LayerHandle {
        Arc::new(RwLock::new(Layer {
            kind: LayerKind::Base,
            map: InheritableMap::new(),
            committed: true,
        }))
    }

    /// Creates a new pending transaction layer parented on the current
    /// committed tip, which may be the base layer itself or an earlier
    /// committed transaction layer (spec.md §4.3, §4.4).
    pub fn new_transaction(parent: &LayerHandle) -> LayerHandle {
        Arc::new(RwLock::new(Layer {
            kind: LayerKind::Transaction,
            map: InheritableMap::with_parent(Parent::new(Arc::clone(parent))),
            committed: false,
        }))
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn has_changes(&self) -> bool {
        self.map.len_local() > 0
    }

    pub fn get(&self, key: &EncodedKey) -> Option<Entry> {
        self.map.get(key)
    }

    pub fn local_contains(&self, key: &EncodedKey) -> bool {
        self.map.local_contains(key)
    }

    pub fn local_entries(&self) -> Vec<(EncodedKey, Entry)> {
        self.map.local_entries()
    }

    /// Writes a raw entry (row or tombstone) directly into this layer's local
    /// map, bypassing the upsert/delete distinction. Used when folding a
    /// savepoint child's changes into its parent (storage/connection.rs).
    pub fn apply_entry(&mut self, key: EncodedKey, entry: Entry) -> Result<()> {
        self.map.insert(key, entry)
    }

    pub fn scan(
        &self,
        range: impl std::ops::RangeBounds<EncodedKey> + Clone,
        dir: Direction,
    ) -> Vec<(EncodedKey, Entry)> {
        self.map.scan(range, dir)
    }

    /// `recordUpsert(key, newRow, oldRowOrNull)` (spec.md §4.3). The old-row
    /// parameter is informational for callers (e.g. change-log bookkeeping);
    /// the layer itself only needs the new state.
    pub fn record_upsert(&mut self, key: EncodedKey, row: Row) -> Result<()> {
        self.map.insert(key, Entry::Row(row))
    }

    /// `recordDelete(key, oldRow)` (spec.md §4.3).
    pub fn record_delete(&mut self, key: EncodedKey) -> Result<()> {
        match self.kind {
            // The base layer has no parent to shadow, so a delete simply
            // removes the key rather than leaving a tombstone behind.
            LayerKind::Base => {
                self.map.remove_local(&key)?;
                Ok(())
            }
            LayerKind::Transaction => self.map.insert(key, Entry::Tombstone),
        }
    }

    /// Freezes this transaction layer's content against further mutation
    /// (spec.md §4.3's `markCommitted`).
    pub fn mark_committed(&mut self) {
        self.map.freeze();
        self.committed = true;
    }

    /// `clearBase()` (spec.md §4.3): detaches this layer from its (now
    /// garbage) parent by folding the parent's effective content into this
    /// layer's own map, then dropping the parent link. Content-preserving:
    /// any layer that was parented on `self` sees identical lookups before
    /// and after (spec.md §4.5).
    pub fn clear_base(&mut self) {
        self.map = self.map.detach();
    }

    /// Re-tags a just-detached transaction layer as the new effective base
    /// (storage/table_manager.rs's collapse). After this, a delete on this
    /// layer removes the key outright rather than leaving a tombstone, which
    /// is correct now that it has no parent to shadow.
    pub fn promote_to_base(&mut self) {
        self.kind = LayerKind::Base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_key, PrimaryKey};
    use crate::value::Value;

    fn key(i: i64) -> EncodedKey {
        encode_key(&PrimaryKey::single(Value::Integer(i)))
    }

    #[test]
    fn base_delete_removes_key_outright() {
        let base = Layer::new_base();
        {
            let mut b = base.write();
            b.record_upsert(key(1), vec![Value::Integer(1)]).unwrap();
            b.record_delete(key(1)).unwrap();
        }
        assert!(base.read().get(&key(1)).is_none());
    }

    #[test]
    fn transaction_layer_tombstone_shadows_base_row() {
        let base = Layer::new_base();
        base.write()
            .record_upsert(key(1), vec![Value::Integer(1)])
            .unwrap();

        let tx = Layer::new_transaction(&base);
        tx.write().record_delete(key(1)).unwrap();

        assert!(matches!(tx.read().get(&key(1)), Some(Entry::Tombstone)));
    }

    #[test]
    fn committed_layer_is_frozen() {
        let base = Layer::new_base();
        let tx = Layer::new_transaction(&base);
        tx.write()
            .record_upsert(key(1), vec![Value::Integer(1)])
            .unwrap();
        tx.write().mark_committed();
        assert!(tx
            .write()
            .record_upsert(key(2), vec![Value::Integer(2)])
            .is_err());
    }

    #[test]
    fn detach_preserves_lookups_from_descendants() {
        let base = Layer::new_base();
        base.write()
            .record_upsert(key(1), vec![Value::Integer(1)])
            .unwrap();
        base.write()
            .record_upsert(key(2), vec![Value::Integer(2)])
            .unwrap();

        let tx1 = Layer::new_transaction(&base);
        tx1.write()
            .record_upsert(key(2), vec![Value::Integer(22)])
            .unwrap();
        tx1.write().mark_committed();

        let tx2 = Layer::new_transaction(&tx1);
        let before_1 = tx2.read().get(&key(1));
        let before_2 = tx2.read().get(&key(2));

        tx1.write().clear_base();

        assert!(matches!(before_1, Some(Entry::Row(ref r)) if r == &vec![Value::Integer(1)]));
        assert!(matches!(
            tx2.read().get(&key(1)),
            Some(Entry::Row(ref r)) if r == &vec![Value::Integer(1)]
        ));
        assert!(matches!(before_2, Some(Entry::Row(ref r)) if r == &vec![Value::Integer(22)]));
        assert!(matches!(
            tx2.read().get(&key(2)),
            Some(Entry::Row(ref r)) if r == &vec![Value::Integer(22)]
        ));
    }
}
