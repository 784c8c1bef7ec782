//! Change log and savepoints (spec.md §4.6).
//!
//! A session-owned stack of frames, each mapping a qualified table name to
//! the set of primary keys touched since the frame was pushed. Used by the
//! transaction manager (crate::txn) to know which tables' assertions need
//! re-checking at commit, and by assertion evaluation (crate::assertion) to
//! know which PKs changed.
//!
//! Frames dedup by canonical PK encoding (crate::codec::encode_key) but keep
//! the decoded `PrimaryKey` alongside so `changed_key_tuples` doesn't need a
//! byte decoder — only the comparator & key codec's encode direction is
//! needed anywhere in this crate (spec.md §4.6: "PK encoding is a canonical
//! byte string... so that two equal PKs always encode identically").

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::codec::{encode_key, EncodedKey, PrimaryKey};
use crate::error::{EngineError, MisuseError, Result};

type Frame = HashMap<String, HashMap<EncodedKey, PrimaryKey>>;

pub struct ChangeLog {
    frames: RwLock<Vec<Frame>>,
}

impl ChangeLog {
    pub fn new() -> Self {
        ChangeLog {
            frames: RwLock::new(vec![HashMap::new()]),
        }
    }

    fn record(&self, table: &str, key: PrimaryKey) {
        let enc = encode_key(&key);
        let mut frames = self.frames.write();
        let top = frames.last_mut().expect("at least one frame always present");
        top.entry(table.to_string()).or_default().insert(enc, key);
    }

    pub fn record_insert(&self, table: &str, new_key: PrimaryKey) {
        self.record(table, new_key);
    }

    pub fn record_delete(&self, table: &str, old_key: PrimaryKey) {
        self.record(table, old_key);
    }

    /// Records both keys of an update; if they encode identically, only one
    /// entry results (spec.md §4.6).
    pub fn record_update(&self, table: &str, old_key: PrimaryKey, new_key: PrimaryKey) {
        if encode_key(&old_key) == encode_key(&new_key) {
            self.record(table, new_key);
        } else {
            self.record(table, old_key);
            self.record(table, new_key);
        }
    }

    /// Pushes a new empty frame. Returns the new depth (frame count).
    pub fn create_savepoint(&self) -> usize {
        let mut frames = self.frames.write();
        frames.push(HashMap::new());
        frames.len()
    }

    /// Merges all frames above `depth` down into frame `depth`, then
    /// truncates the stack to `depth` frames.
    pub fn release_savepoint(&self, depth: usize) -> Result<()> {
        let mut frames = self.frames.write();
        if depth == 0 || depth > frames.len() {
            return Err(EngineError::from(MisuseError::Other("invalid savepoint depth".into())));
        }
        for i in (depth..frames.len()).rev() {
            let frame = frames.remove(i);
            let below = frames
                .get_mut(depth - 1)
                .expect("depth - 1 is always in range here");
            for (table, keys) in frame {
                below.entry(table).or_default().extend(keys);
            }
        }
        Ok(())
    }

    /// Discards all frames above `depth`.
    pub fn rollback_to_savepoint(&self, depth: usize) -> Result<()> {
        let mut frames = self.frames.write();
        if depth == 0 || depth > frames.len() {
            return Err(EngineError::from(MisuseError::Other("invalid savepoint depth".into())));
        }
        frames.truncate(depth);
        Ok(())
    }

    /// Resets to a single empty frame; called on top-level commit or
    /// rollback.
    pub fn clear(&self) {
        *self.frames.write() = vec![HashMap::new()];
    }

    pub fn changed_base_tables(&self) -> HashSet<String> {
        self.frames
            .read()
            .iter()
            .flat_map(|f| f.keys().cloned())
            .collect()
    }

    pub fn changed_key_tuples(&self, table: &str) -> Vec<PrimaryKey> {
        let mut merged: HashMap<EncodedKey, PrimaryKey> = HashMap::new();
        for frame in self.frames.read().iter() {
            if let Some(keys) = frame.get(table) {
                for (enc, key) in keys {
                    merged.insert(enc.clone(), key.clone());
                }
            }
        }
        merged.into_values().collect()
    }

    pub fn depth(&self) -> usize {
        self.frames.read().len()
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn pk(i: i64) -> PrimaryKey {
        PrimaryKey::single(Value::Integer(i))
    }

    #[test]
    fn insert_then_delete_same_pk_still_names_it_changed() {
        let log = ChangeLog::new();
        log.record_insert("main.t", pk(1));
        log.record_delete("main.t", pk(1));
        let tuples = log.changed_key_tuples("main.t");
        assert_eq!(tuples.len(), 1);
    }

    #[test]
    fn savepoint_release_then_rollback_to_enclosing_is_noop() {
        let log = ChangeLog::new();
        log.record_insert("main.t", pk(1));
        let depth = log.create_savepoint();
        log.record_insert("main.t", pk(2));
        log.release_savepoint(depth).unwrap();
        // Releasing then immediately rolling back to the now-current depth
        // (the enclosing savepoint) must be indistinguishable from never
        // having created the inner savepoint (spec.md §8 property 6).
        log.rollback_to_savepoint(1).unwrap();
        assert!(log.changed_base_tables().is_empty());
    }

    #[test]
    fn rollback_to_savepoint_discards_inner_changes() {
        let log = ChangeLog::new();
        log.record_insert("main.t", pk(1));
        let depth = log.create_savepoint();
        log.record_insert("main.t", pk(2));
        assert_eq!(depth, 2);
        log.rollback_to_savepoint(1).unwrap();
        let tuples = log.changed_key_tuples("main.t");
        assert_eq!(tuples.len(), 1);
    }

    #[test]
    fn update_with_different_keys_records_both() {
        let log = ChangeLog::new();
        log.record_update("main.t", pk(1), pk(2));
        assert_eq!(log.changed_key_tuples("main.t").len(), 2);
    }

    #[test]
    fn clear_resets_to_single_empty_frame() {
        let log = ChangeLog::new();
        log.record_insert("main.t", pk(1));
        log.clear();
        assert_eq!(log.depth(), 1);
        assert!(log.changed_base_tables().is_empty());
    }
}
