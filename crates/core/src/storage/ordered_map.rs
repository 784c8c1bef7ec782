//! Ordered map with inheritance (spec.md §4.1).
//!
//! A point-get/range-scan/insert/tombstone structure over an in-memory
//! `BTreeMap`, with a child map transparently falling through to a parent on
//! miss. Centralizes the parent-chasing logic so that neither the base layer
//! nor the transaction layer (storage/layer.rs) needs its own chain-walking
//! code — per spec.md §9's redesign note against instance-of branching.
//!
//! The parent link is always reached through a lock rather than a plain
//! recursive `Arc<Self>`: every layer (base, in-flight transaction, or
//! already-committed transaction) is held behind the same `Arc<RwLock<_>>`
//! handle (storage/layer.rs's `LayerHandle`), so a child never needs to know
//! whether its parent might still be mutated in place — it just takes a read
//! lock. Committed layers are frozen (§4.3's `markCommitted`), so in practice
//! that lock is never contended; keeping one representation avoids a second
//! code path for "parent that happens to be frozen".

use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Link to whatever this map falls through to on a local miss.
pub struct Parent<K: Ord + Clone, V: Clone>(pub Arc<RwLock<InheritableMap<K, V>>>);

impl<K: Ord + Clone, V: Clone> Clone for Parent<K, V> {
    fn clone(&self) -> Self {
        Parent(Arc::clone(&self.0))
    }
}

impl<K: Ord + Clone, V: Clone> Parent<K, V> {
    pub fn new(handle: Arc<RwLock<InheritableMap<K, V>>>) -> Self {
        Parent(handle)
    }
}

pub struct InheritableMap<K: Ord + Clone, V: Clone> {
    local: BTreeMap<K, V>,
    parent: Option<Parent<K, V>>,
    immutable: bool,
}

impl<K: Ord + Clone, V: Clone> InheritableMap<K, V> {
    pub fn new() -> Self {
        InheritableMap {
            local: BTreeMap::new(),
            parent: None,
            immutable: false,
        }
    }

    pub fn with_parent(parent: Parent<K, V>) -> Self {
        InheritableMap {
            local: BTreeMap::new(),
            parent: Some(parent),
            immutable: false,
        }
    }

    pub fn len_local(&self) -> usize {
        self.local.len()
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Freezes this map so further mutation fails. Mirrors
    /// `TransactionLayer::markCommitted` (spec.md §4.3).
    pub fn freeze(&mut self) {
        self.immutable = true;
    }

    fn check_mutable(&self) -> Result<()> {
        if self.immutable {
            Err(EngineError::internal(
                "attempted to mutate an immutable ordered map",
            ))
        } else {
            Ok(())
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.check_mutable()?;
        self.local.insert(key, value);
        Ok(())
    }

    pub fn remove_local(&mut self, key: &K) -> Result<Option<V>> {
        self.check_mutable()?;
        Ok(self.local.remove(key))
    }

    /// `get(key) → value | tombstone | miss` per spec.md §4.1: checks local
    /// entries; on miss, recursively consults the parent. Returns `None` only
    /// when neither the local map nor any ancestor has an entry for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(v) = self.local.get(key) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.0.read().get(key))
    }

    pub fn local_get(&self, key: &K) -> Option<&V> {
        self.local.get(key)
    }

    pub fn local_contains(&self, key: &K) -> bool {
        self.local.contains_key(key)
    }

    /// Entries recorded directly in this map, excluding anything only visible
    /// by falling through to a parent. Used by savepoint release to migrate
    /// just the delta, not the whole inherited view.
    pub fn local_entries(&self) -> Vec<(K, V)> {
        self.local.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Yields key/value pairs from the union of this map and its ancestors in
    /// key order, with this map's entries shadowing an ancestor's for the
    /// same key (a tombstone here suppresses a parent row, an upsert here
    /// overrides a parent row). The parent's matching slice is read out from
    /// behind its lock and merged in; correctness relies on nobody mutating a
    /// layer's row content while a descendant holds it as a live parent (see
    /// storage/table_manager.rs), so the snapshot taken here is stable.
    pub fn scan(
        &self,
        range: impl RangeBounds<K> + Clone,
        dir: Direction,
    ) -> Vec<(K, V)> {
        let local_entries = self.local_range_entries(range.clone(), dir);
        match &self.parent {
            None => local_entries,
            Some(parent) => {
                let parent_entries = parent.0.read().scan(range, dir);
                merge_shadow(local_entries, parent_entries, dir)
            }
        }
    }

    fn local_range_entries(&self, range: impl RangeBounds<K>, dir: Direction) -> Vec<(K, V)> {
        let lower = range.start_bound().cloned();
        let upper = range.end_bound().cloned();
        let mut entries: Vec<(K, V)> = self
            .local
            .range((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if dir == Direction::Descending {
            entries.reverse();
        }
        entries
    }

    /// Materializes the effective contents (this map's entries shadowing its
    /// ancestors') into a standalone, parentless map. Used by layer collapse
    /// (storage/table_manager.rs) so that detaching a committed layer from
    /// its garbage-collected parent is content-preserving.
    pub fn detach(&self) -> InheritableMap<K, V> {
        let entries = self.scan(unbounded::<K>(), Direction::Ascending);
        InheritableMap {
            local: BTreeMap::from_iter(entries),
            parent: None,
            immutable: false,
        }
    }
}

impl<K: Ord + Clone, V: Clone> Default for InheritableMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unbounded<K>() -> (Bound<K>, Bound<K>) {
    (Bound::Unbounded, Bound::Unbounded)
}

/// Merges two already-sorted (per `dir`) entry lists, letting `local` shadow
/// `parent` on key ties.
fn merge_shadow<K: Ord, V>(local: Vec<(K, V)>, parent: Vec<(K, V)>, dir: Direction) -> Vec<(K, V)> {
    let mut out = Vec::with_capacity(local.len() + parent.len());
    let mut li = local.into_iter().peekable();
    let mut pi = parent.into_iter().peekable();
    loop {
        match (li.peek(), pi.peek()) {
            (None, None) => break,
            (Some(_), None) => out.push(li.next().unwrap()),
            (None, Some(_)) => out.push(pi.next().unwrap()),
            (Some((lk, _)), Some((pk, _))) => {
                let cmp = match dir {
                    Direction::Ascending => lk.cmp(pk),
                    Direction::Descending => lk.cmp(pk).reverse(),
                };
                match cmp {
                    std::cmp::Ordering::Less => out.push(li.next().unwrap()),
                    std::cmp::Ordering::Greater => out.push(pi.next().unwrap()),
                    std::cmp::Ordering::Equal => {
                        pi.next();
                        out.push(li.next().unwrap());
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> InheritableMap<i32, &'static str> {
        InheritableMap::new()
    }

    fn handle(m: InheritableMap<i32, &'static str>) -> Parent<i32, &'static str> {
        Parent::new(Arc::new(RwLock::new(m)))
    }

    #[test]
    fn child_shadows_parent_value() {
        let mut base = map();
        base.insert(1, "base-1").unwrap();
        base.insert(2, "base-2").unwrap();

        let mut child = InheritableMap::with_parent(handle(base));
        child.insert(1, "child-1").unwrap();

        assert_eq!(child.get(&1), Some("child-1"));
        assert_eq!(child.get(&2), Some("base-2"));
        assert_eq!(child.get(&3), None);
    }

    #[test]
    fn tombstone_in_child_shadows_parent() {
        let mut base: InheritableMap<i32, Option<&'static str>> = InheritableMap::new();
        base.insert(1, Some("base-1")).unwrap();

        let mut child = InheritableMap::with_parent(Parent::new(Arc::new(RwLock::new(base))));
        child.insert(1, None).unwrap();
        assert_eq!(child.get(&1), Some(None));
    }

    #[test]
    fn scan_merges_and_shadows_in_order() {
        let mut base = map();
        base.insert(1, "base-1").unwrap();
        base.insert(3, "base-3").unwrap();
        base.insert(5, "base-5").unwrap();

        let mut child = InheritableMap::with_parent(handle(base));
        child.insert(3, "child-3").unwrap();
        child.insert(4, "child-4").unwrap();

        let out = child.scan(unbounded(), Direction::Ascending);
        assert_eq!(
            out,
            vec![(1, "base-1"), (3, "child-3"), (4, "child-4"), (5, "base-5")]
        );
    }

    #[test]
    fn scan_descending() {
        let mut m = map();
        m.insert(1, "a").unwrap();
        m.insert(2, "b").unwrap();
        m.insert(3, "c").unwrap();
        let out = m.scan(unbounded(), Direction::Descending);
        assert_eq!(out, vec![(3, "c"), (2, "b"), (1, "a")]);
    }

    #[test]
    fn detach_materializes_and_drops_parent() {
        let mut base = map();
        base.insert(1, "base-1").unwrap();
        base.insert(2, "base-2").unwrap();

        let mut child = InheritableMap::with_parent(handle(base));
        child.insert(2, "child-2").unwrap();

        let detached = child.detach();
        assert!(detached.parent.is_none());
        assert_eq!(detached.get(&1), Some("base-1"));
        assert_eq!(detached.get(&2), Some("child-2"));
    }

    #[test]
    fn frozen_map_rejects_mutation() {
        let mut m = map();
        m.freeze();
        assert!(m.insert(1, "x").is_err());
    }
}
