//! Fake external collaborators for end-to-end session tests, without a real
//! SQL front end (parser/planner/optimizer/emitter/scheduler are out of
//! scope per spec.md §1; see `crate::vtab`'s doc comment).
//!
//! These fakes only exercise the session's control flow — statement routing,
//! the execution mutex, and autocommit wrapping. They don't interpret SQL
//! text into real table mutations; tests that need actual row visibility
//! and MVCC behavior drive `crate::storage`/`crate::txn` directly instead
//! (see `crates/core/tests/`), since that's the layer this crate actually
//! owns.

use crate::error::Result;
use crate::vtab::{
    BlockPlan, Emitter, Instruction, Optimizer, Parser, Planner, RunResult, Scheduler, Statement, StatementTag,
};

/// Recognizes only the transaction-control keywords; everything else is an
/// opaque `Other` statement carrying the original text verbatim.
pub struct FakeParser;

impl Parser for FakeParser {
    fn parse_all(&self, text: &str) -> Result<Vec<Statement>> {
        text.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| self.parse(s))
            .collect()
    }

    fn parse(&self, text: &str) -> Result<Statement> {
        let trimmed = text.trim();
        let upper = trimmed.to_ascii_uppercase();
        let tag = if upper == "BEGIN" {
            StatementTag::Begin
        } else if upper == "COMMIT" {
            StatementTag::Commit
        } else if upper == "ROLLBACK" {
            StatementTag::Rollback
        } else if let Some(rest) = upper.strip_prefix("ROLLBACK TO ") {
            let name = rest.strip_prefix("SAVEPOINT ").unwrap_or(rest);
            return Ok(Statement {
                tag: StatementTag::RollbackToSavepoint,
                text: name.trim().to_string(),
            });
        } else if let Some(name) = upper.strip_prefix("SAVEPOINT ") {
            return Ok(Statement {
                tag: StatementTag::Savepoint,
                text: name.trim().to_string(),
            });
        } else if let Some(rest) = upper.strip_prefix("RELEASE ") {
            let name = rest.strip_prefix("SAVEPOINT ").unwrap_or(rest);
            return Ok(Statement {
                tag: StatementTag::Release,
                text: name.trim().to_string(),
            });
        } else {
            StatementTag::Other
        };
        Ok(Statement {
            tag,
            text: trimmed.to_string(),
        })
    }
}

/// Wraps statements into a block unchanged.
pub struct FakePlanner;

impl Planner for FakePlanner {
    fn build_block(&self, statements: Vec<Statement>) -> Result<BlockPlan> {
        Ok(BlockPlan { statements })
    }
}

/// Passes the block through unchanged.
pub struct FakeOptimizer;

impl Optimizer for FakeOptimizer {
    fn optimize(&self, plan: BlockPlan) -> Result<BlockPlan> {
        Ok(plan)
    }

    fn optimize_for_analysis(&self, plan: BlockPlan) -> Result<BlockPlan> {
        Ok(plan)
    }
}

/// Counts statements into `programs`; carries no executable payload.
pub struct FakeEmitter;

impl Emitter for FakeEmitter {
    fn emit(&self, plan: BlockPlan) -> Result<Instruction> {
        Ok(Instruction {
            programs: plan.statements.len(),
        })
    }
}

/// Acknowledges every instruction without touching storage.
pub struct FakeScheduler;

impl Scheduler for FakeScheduler {
    fn run(&self, _instruction: Instruction) -> Result<RunResult> {
        Ok(RunResult::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_splits_on_semicolons_and_trims() {
        let parser = FakeParser;
        let statements = parser.parse_all(" BEGIN ; INSERT INTO t VALUES (1) ; COMMIT ").unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].tag, StatementTag::Begin);
        assert_eq!(statements[1].tag, StatementTag::Other);
        assert_eq!(statements[2].tag, StatementTag::Commit);
    }

    #[test]
    fn parser_extracts_savepoint_name() {
        let parser = FakeParser;
        let stmt = parser.parse("SAVEPOINT my_savepoint").unwrap();
        assert_eq!(stmt.tag, StatementTag::Savepoint);
        assert_eq!(stmt.text, "MY_SAVEPOINT");
    }

    #[test]
    fn parser_extracts_rollback_to_savepoint_name() {
        let parser = FakeParser;
        let stmt = parser.parse("ROLLBACK TO SAVEPOINT my_savepoint").unwrap();
        assert_eq!(stmt.tag, StatementTag::RollbackToSavepoint);
        assert_eq!(stmt.text, "MY_SAVEPOINT");

        let stmt = parser.parse("ROLLBACK TO my_savepoint").unwrap();
        assert_eq!(stmt.tag, StatementTag::RollbackToSavepoint);
        assert_eq!(stmt.text, "MY_SAVEPOINT");
    }

    #[test]
    fn parser_still_recognizes_plain_rollback() {
        let parser = FakeParser;
        let stmt = parser.parse("ROLLBACK").unwrap();
        assert_eq!(stmt.tag, StatementTag::Rollback);
    }
}
