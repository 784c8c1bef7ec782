//! Deferred constraint queue (spec.md §4.7).
//!
//! Row-level constraints that can't be checked at statement time (e.g. a
//! FOREIGN KEY into a row inserted later in the same transaction) are
//! captured as tickets here and evaluated once, in order, at commit — after
//! global assertion evaluation (crate::assertion) and before any connection
//! actually commits (crate::txn). The ticket carries everything the
//! evaluator needs: a snapshot of the row as it looked when the constraint
//! was deferred, and which connection's read-snapshot to evaluate against
//! (a later statement on another connection must not see this ticket's
//! writes early).
//!
//! The frame stack mirrors crate::changelog's savepoint structure exactly,
//! since both are rolled back together.

use parking_lot::RwLock;

use crate::error::{ConstraintError, EngineError, Result};
use crate::storage::ConnectionId;
use crate::value::{Row, Value};

/// Maps a row's column ordinal to its identity for witness reporting.
#[derive(Debug, Clone)]
pub struct ColumnIdentity {
    pub ordinal: usize,
    pub name: String,
    pub is_primary_key: bool,
}

/// Runtime context an evaluator is invoked with: the deferred row itself,
/// plus an optional larger context row (e.g. the row that referenced it)
/// for constraints that need cross-row context.
pub struct DeferredContext<'a> {
    pub row: &'a Row,
    pub context_row: Option<&'a Row>,
}

pub type DeferredEvaluator = Box<dyn Fn(&DeferredContext) -> Result<()> + Send + Sync>;

pub struct DeferredTicket {
    pub table: String,
    pub constraint_name: String,
    pub row: Row,
    pub descriptor: Vec<ColumnIdentity>,
    pub evaluator: DeferredEvaluator,
    pub source_connection: Option<ConnectionId>,
    pub context_row: Option<Row>,
}

impl DeferredTicket {
    fn witness_key(&self) -> Vec<Value> {
        self.descriptor
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| self.row.get(c.ordinal).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Runs this ticket's evaluator, translating any failure into a
    /// `ConstraintError::Row` naming this ticket's constraint and witness key
    /// (spec.md §4.7: "evaluator failures translate to constraint-violation
    /// kinds").
    pub fn evaluate(&self) -> Result<()> {
        let ctx = DeferredContext {
            row: &self.row,
            context_row: self.context_row.as_ref(),
        };
        (self.evaluator)(&ctx).map_err(|_| {
            EngineError::from(ConstraintError::Row {
                name: self.constraint_name.clone(),
                key: self.witness_key(),
            })
        })
    }
}

pub struct DeferredQueue {
    frames: RwLock<Vec<Vec<DeferredTicket>>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        DeferredQueue {
            frames: RwLock::new(vec![Vec::new()]),
        }
    }

    pub fn enqueue(&self, ticket: DeferredTicket) {
        let mut frames = self.frames.write();
        frames.last_mut().expect("at least one frame always present").push(ticket);
    }

    pub fn create_savepoint(&self) -> usize {
        let mut frames = self.frames.write();
        frames.push(Vec::new());
        frames.len()
    }

    pub fn release_savepoint(&self, depth: usize) -> Result<()> {
        let mut frames = self.frames.write();
        if depth == 0 || depth > frames.len() {
            return Err(EngineError::internal("invalid deferred-queue savepoint depth"));
        }
        while frames.len() > depth {
            let mut tickets = frames.pop().expect("loop guard keeps at least `depth` frames");
            frames
                .get_mut(depth - 1)
                .expect("depth - 1 is always in range here")
                .append(&mut tickets);
        }
        Ok(())
    }

    pub fn rollback_to_savepoint(&self, depth: usize) -> Result<()> {
        let mut frames = self.frames.write();
        if depth == 0 || depth > frames.len() {
            return Err(EngineError::internal("invalid deferred-queue savepoint depth"));
        }
        frames.truncate(depth);
        Ok(())
    }

    pub fn clear(&self) {
        *self.frames.write() = vec![Vec::new()];
    }

    pub fn is_empty(&self) -> bool {
        self.frames.read().iter().all(|f| f.is_empty())
    }

    /// Removes and returns every pending ticket, in enqueue order, resetting
    /// the stack to a single empty frame. The transaction manager calls this
    /// at commit time and evaluates each ticket in turn.
    pub fn drain(&self) -> Vec<DeferredTicket> {
        let mut frames = self.frames.write();
        let drained = frames.drain(..).flatten().collect();
        *frames = vec![Vec::new()];
        drained
    }

    pub fn depth(&self) -> usize {
        self.frames.read().len()
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(name: &str, pass: bool) -> DeferredTicket {
        DeferredTicket {
            table: "main.t".into(),
            constraint_name: name.into(),
            row: vec![Value::Integer(1)],
            descriptor: vec![ColumnIdentity {
                ordinal: 0,
                name: "id".into(),
                is_primary_key: true,
            }],
            evaluator: Box::new(move |_ctx| {
                if pass {
                    Ok(())
                } else {
                    Err(EngineError::internal("fails on purpose"))
                }
            }),
            source_connection: None,
            context_row: None,
        }
    }

    #[test]
    fn passing_evaluator_succeeds() {
        let t = ticket("fk_ok", true);
        assert!(t.evaluate().is_ok());
    }

    #[test]
    fn failing_evaluator_becomes_row_constraint_violation() {
        let t = ticket("fk_bad", false);
        let err = t.evaluate().unwrap_err();
        match err {
            EngineError::Constraint(ConstraintError::Row { name, key }) => {
                assert_eq!(name, "fk_bad");
                assert_eq!(key, vec![Value::Integer(1)]);
            }
            other => panic!("expected Row constraint violation, got {other:?}"),
        }
    }

    #[test]
    fn drain_returns_tickets_in_order_and_empties_queue() {
        let q = DeferredQueue::new();
        q.enqueue(ticket("a", true));
        q.enqueue(ticket("b", true));
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].constraint_name, "a");
        assert_eq!(drained[1].constraint_name, "b");
        assert!(q.is_empty());
    }

    #[test]
    fn rollback_to_savepoint_discards_inner_tickets() {
        let q = DeferredQueue::new();
        q.enqueue(ticket("a", true));
        let depth = q.create_savepoint();
        q.enqueue(ticket("b", true));
        q.rollback_to_savepoint(depth - 1).unwrap();
        let drained = q.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].constraint_name, "a");
    }

    #[test]
    fn release_savepoint_keeps_both_tickets_in_order() {
        let q = DeferredQueue::new();
        q.enqueue(ticket("a", true));
        let depth = q.create_savepoint();
        q.enqueue(ticket("b", true));
        q.release_savepoint(depth).unwrap();
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
    }
}
