//! Global assertion evaluator (spec.md §4.8).
//!
//! `CREATE ASSERTION` checks a query over arbitrary base tables and fails the
//! transaction if it returns any row. Running the full query on every commit
//! regardless of what changed would be correct but wasteful, so each
//! assertion is classified once (and re-classified whenever the schema
//! changes) into the base tables it references and, per reference, whether
//! that reference is *row-specific* — its predicate functionally determines
//! the referenced row by the full primary key, letting the evaluator recheck
//! only the PKs that the change log says actually moved — or *global*,
//! requiring the whole query to be rerun.
//!
//! Classification and query execution are the planner/optimizer/scheduler's
//! job (out of scope, spec.md §1); this module only orchestrates the two
//! narrow contracts it needs from them ([`AssertionAnalyzer`],
//! [`AssertionRunner`]) and the commit-time decision of which to invoke. The
//! `vtab` module's `BlockPlan`/`Instruction` are deliberately opaque, so
//! those contracts are defined here rather than bolted onto `vtab::Planner`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::{AssertionDef, Catalog};
use crate::changelog::ChangeLog;
use crate::error::{ConstraintError, EngineError, Result};
use crate::metrics::Metrics;
use crate::value::Value;
use crate::vtab::Instruction;

/// Bounds how many violating rows are collected as witnesses before an
/// assertion failure is reported (spec.md §4.8: "bounded sample").
const WITNESS_SAMPLE_LIMIT: usize = 16;

/// One base-table reference inside an assertion's violation query.
#[derive(Debug, Clone)]
pub struct RelationKey {
    /// `"schema.table#node-id"`, unique within one assertion's plan.
    pub label: String,
    pub base_table: String,
    pub row_specific: bool,
}

/// The result of analyzing one assertion's violation query: every base-table
/// reference it makes, the full (unfiltered) instruction, and — for each
/// row-specific reference — a pre-compiled instruction that takes the
/// referenced row's primary key as positional parameters.
pub struct AssertionAnalysis {
    pub relation_keys: Vec<RelationKey>,
    pub full_query: Instruction,
    pub row_specific_queries: HashMap<String, Instruction>,
}

/// Parses, plans, and classifies an assertion's violation query. Implemented
/// outside this crate by whatever owns the planner/optimizer; a test double
/// lives in `crate::testkit`.
pub trait AssertionAnalyzer: Send + Sync {
    fn analyze(&self, def: &AssertionDef) -> Result<AssertionAnalysis>;
}

/// Executes a pre-compiled assertion instruction, either unfiltered or with a
/// primary key bound positionally as `pk0..pkn-1`.
pub trait AssertionRunner: Send + Sync {
    fn run_full(&self, instruction: &Instruction) -> Result<Vec<Vec<Value>>>;
    fn run_row_specific(&self, instruction: &Instruction, pk_values: &[Value]) -> Result<Vec<Vec<Value>>>;
}

struct CachedAnalysis {
    generation: u64,
    analysis: AssertionAnalysis,
}

pub struct AssertionEvaluator {
    analyzer: Box<dyn AssertionAnalyzer>,
    runner: Box<dyn AssertionRunner>,
    cache: RwLock<HashMap<String, CachedAnalysis>>,
    metrics: Arc<Metrics>,
}

impl AssertionEvaluator {
    pub fn new(analyzer: Box<dyn AssertionAnalyzer>, runner: Box<dyn AssertionRunner>, metrics: Arc<Metrics>) -> Self {
        AssertionEvaluator {
            analyzer,
            runner,
            cache: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Returns the cached analysis for `def`, rebuilding it if `def` is new
    /// or the catalog's generation has advanced since it was cached (schema
    /// changes can change classification or the query's base tables).
    fn analysis_for(&self, def: &AssertionDef, catalog_generation: u64) -> Result<()> {
        let needs_rebuild = {
            let cache = self.cache.read();
            match cache.get(&def.name) {
                Some(cached) => cached.generation != catalog_generation,
                None => true,
            }
        };
        if needs_rebuild {
            let analysis = self.analyzer.analyze(def)?;
            self.cache.write().insert(
                def.name.clone(),
                CachedAnalysis {
                    generation: catalog_generation,
                    analysis,
                },
            );
        }
        Ok(())
    }

    /// Runs every registered assertion whose violation query references a
    /// base table named in `change_log`. Per spec.md §4.8 and the project's
    /// classification-tie-break decision (SPEC_FULL.md §12): if any
    /// reference is global and its base table changed, the full query runs
    /// once; otherwise only the row-specific references whose base table
    /// changed are rechecked, one invocation per changed primary key.
    pub fn evaluate_at_commit(&self, catalog: &Catalog, change_log: &ChangeLog) -> Result<()> {
        let changed = change_log.changed_base_tables();
        if changed.is_empty() {
            return Ok(());
        }
        let generation = catalog.generation();
        for def in catalog.list_assertions() {
            self.analysis_for(&def, generation)?;
            let cache = self.cache.read();
            let cached = cache.get(&def.name).expect("just inserted above");
            let analysis = &cached.analysis;

            let touches_changed_table = analysis
                .relation_keys
                .iter()
                .any(|rk| changed.contains(&rk.base_table));
            if !touches_changed_table {
                continue;
            }
            self.metrics.record_assertion_evaluated();

            let any_global_changed = analysis
                .relation_keys
                .iter()
                .any(|rk| !rk.row_specific && changed.contains(&rk.base_table));

            if any_global_changed {
                let rows = self.runner.run_full(&analysis.full_query)?;
                if !rows.is_empty() {
                    let witnesses: Vec<Vec<Value>> = rows.into_iter().take(WITNESS_SAMPLE_LIMIT).collect();
                    let sample_len = witnesses.len();
                    return Err(EngineError::from(ConstraintError::Assertion {
                        name: def.name.clone(),
                        sample_len,
                        witnesses,
                    }));
                }
                continue;
            }

            for rk in analysis.relation_keys.iter().filter(|rk| rk.row_specific) {
                if !changed.contains(&rk.base_table) {
                    continue;
                }
                let Some(instruction) = analysis.row_specific_queries.get(&rk.label) else {
                    continue;
                };
                for pk in change_log.changed_key_tuples(&rk.base_table) {
                    let rows = self.runner.run_row_specific(instruction, pk.values())?;
                    if !rows.is_empty() {
                        return Err(EngineError::from(ConstraintError::Assertion {
                            name: def.name.clone(),
                            sample_len: 1,
                            witnesses: vec![pk.values().to_vec()],
                        }));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::codec::PrimaryKey;

    struct FixedAnalyzer {
        row_specific_table: Option<String>,
        global_table: Option<String>,
    }

    impl AssertionAnalyzer for FixedAnalyzer {
        fn analyze(&self, def: &AssertionDef) -> Result<AssertionAnalysis> {
            let mut relation_keys = Vec::new();
            let mut row_specific_queries = HashMap::new();
            if let Some(t) = &self.row_specific_table {
                relation_keys.push(RelationKey {
                    label: format!("{}#0", def.name),
                    base_table: t.clone(),
                    row_specific: true,
                });
                row_specific_queries.insert(format!("{}#0", def.name), Instruction { programs: 1 });
            }
            if let Some(t) = &self.global_table {
                relation_keys.push(RelationKey {
                    label: format!("{}#1", def.name),
                    base_table: t.clone(),
                    row_specific: false,
                });
            }
            Ok(AssertionAnalysis {
                relation_keys,
                full_query: Instruction { programs: 1 },
                row_specific_queries,
            })
        }
    }

    struct ScriptedRunner {
        full_rows: Vec<Vec<Value>>,
        row_specific_rows: Vec<Vec<Value>>,
    }

    impl AssertionRunner for ScriptedRunner {
        fn run_full(&self, _instruction: &Instruction) -> Result<Vec<Vec<Value>>> {
            Ok(self.full_rows.clone())
        }
        fn run_row_specific(&self, _instruction: &Instruction, _pk: &[Value]) -> Result<Vec<Vec<Value>>> {
            Ok(self.row_specific_rows.clone())
        }
    }

    #[test]
    fn skips_assertions_whose_tables_did_not_change() {
        let catalog = Catalog::default();
        catalog
            .create_assertion(AssertionDef {
                name: "a1".into(),
                query_handle: 1,
            })
            .unwrap();
        let analyzer = FixedAnalyzer {
            row_specific_table: Some("main.t1".into()),
            global_table: None,
        };
        let runner = ScriptedRunner {
            full_rows: vec![],
            row_specific_rows: vec![vec![Value::Integer(1)]],
        };
        let evaluator = AssertionEvaluator::new(Box::new(analyzer), Box::new(runner), Arc::new(Metrics::new()));
        let change_log = ChangeLog::new();
        change_log.record_insert("main.other", PrimaryKey::single(Value::Integer(1)));
        assert!(evaluator.evaluate_at_commit(&catalog, &change_log).is_ok());
    }

    #[test]
    fn global_reference_failing_reports_assertion_violation() {
        let catalog = Catalog::default();
        catalog
            .create_assertion(AssertionDef {
                name: "a1".into(),
                query_handle: 1,
            })
            .unwrap();
        let analyzer = FixedAnalyzer {
            row_specific_table: None,
            global_table: Some("main.t1".into()),
        };
        let runner = ScriptedRunner {
            full_rows: vec![vec![Value::Integer(42)]],
            row_specific_rows: vec![],
        };
        let evaluator = AssertionEvaluator::new(Box::new(analyzer), Box::new(runner), Arc::new(Metrics::new()));
        let change_log = ChangeLog::new();
        change_log.record_insert("main.t1", PrimaryKey::single(Value::Integer(1)));
        let err = evaluator.evaluate_at_commit(&catalog, &change_log).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Constraint);
    }

    #[test]
    fn row_specific_reference_only_rechecks_changed_pks() {
        let catalog = Catalog::default();
        catalog
            .create_assertion(AssertionDef {
                name: "a1".into(),
                query_handle: 1,
            })
            .unwrap();
        let analyzer = FixedAnalyzer {
            row_specific_table: Some("main.t1".into()),
            global_table: None,
        };
        let runner = ScriptedRunner {
            full_rows: vec![],
            row_specific_rows: vec![vec![Value::Integer(7)]],
        };
        let evaluator = AssertionEvaluator::new(Box::new(analyzer), Box::new(runner), Arc::new(Metrics::new()));
        let change_log = ChangeLog::new();
        change_log.record_insert("main.t1", PrimaryKey::single(Value::Integer(7)));
        let err = evaluator.evaluate_at_commit(&catalog, &change_log).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Constraint);
    }

    #[test]
    fn cache_rebuilds_after_schema_generation_changes() {
        let catalog = Catalog::default();
        catalog
            .create_assertion(AssertionDef {
                name: "a1".into(),
                query_handle: 1,
            })
            .unwrap();
        let analyzer = FixedAnalyzer {
            row_specific_table: Some("main.t1".into()),
            global_table: None,
        };
        let runner = ScriptedRunner {
            full_rows: vec![],
            row_specific_rows: vec![],
        };
        let evaluator = AssertionEvaluator::new(Box::new(analyzer), Box::new(runner), Arc::new(Metrics::new()));
        let change_log = ChangeLog::new();
        change_log.record_insert("main.t1", PrimaryKey::single(Value::Integer(1)));
        evaluator.evaluate_at_commit(&catalog, &change_log).unwrap();
        assert_eq!(evaluator.cache.read().len(), 1);
        let gen_before = evaluator.cache.read().get("a1").unwrap().generation;
        catalog.create_assertion(AssertionDef {
            name: "a2".into(),
            query_handle: 2,
        }).unwrap();
        change_log.record_insert("main.t1", PrimaryKey::single(Value::Integer(2)));
        evaluator.evaluate_at_commit(&catalog, &change_log).unwrap();
        let gen_after = evaluator.cache.read().get("a1").unwrap().generation;
        assert!(gen_after > gen_before);
    }
}
