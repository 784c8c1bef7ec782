//! Runtime metrics (spec.md §11's supplemented feature, gated on the
//! `runtime_stats` option, spec.md §6).
//!
//! Grounded in the teacher's `db_metrics` module, which registers a fixed set
//! of named Prometheus counters/gauges up front and increments them on the
//! hot paths. Narrowed here to plain `prometheus` crate counters (the
//! teacher's `metrics_group!` macro lives in an internal crate this repo
//! doesn't depend on) registered into a private `Registry` rather than the
//! process-global default, so multiple `Metrics` instances (e.g. one per test)
//! don't collide on registration.

use std::sync::atomic::{AtomicBool, Ordering};

use prometheus::{IntCounter, Registry};

pub struct Metrics {
    enabled: AtomicBool,
    registry: Registry,
    pub commits: IntCounter,
    pub rollbacks: IntCounter,
    pub busy_retries: IntCounter,
    pub collapses: IntCounter,
    pub assertions_evaluated: IntCounter,
    pub rows_inserted: IntCounter,
    pub rows_updated: IntCounter,
    pub rows_deleted: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let commits = IntCounter::new("quereus_commits_total", "Total successful transaction commits").unwrap();
        let rollbacks = IntCounter::new("quereus_rollbacks_total", "Total transaction rollbacks").unwrap();
        let busy_retries =
            IntCounter::new("quereus_busy_retries_total", "Total commits rejected as busy/stale").unwrap();
        let collapses = IntCounter::new("quereus_layer_collapses_total", "Total layer-collapse folds").unwrap();
        let assertions_evaluated = IntCounter::new(
            "quereus_assertions_evaluated_total",
            "Total CREATE ASSERTION checks run at commit",
        )
        .unwrap();
        let rows_inserted = IntCounter::new("quereus_rows_inserted_total", "Total rows inserted").unwrap();
        let rows_updated = IntCounter::new("quereus_rows_updated_total", "Total rows updated").unwrap();
        let rows_deleted = IntCounter::new("quereus_rows_deleted_total", "Total rows deleted").unwrap();

        for counter in [
            &commits,
            &rollbacks,
            &busy_retries,
            &collapses,
            &assertions_evaluated,
            &rows_inserted,
            &rows_updated,
            &rows_deleted,
        ] {
            registry.register(Box::new(counter.clone())).unwrap();
        }

        Metrics {
            enabled: AtomicBool::new(false),
            registry,
            commits,
            rollbacks,
            busy_retries,
            collapses,
            assertions_evaluated,
            rows_inserted,
            rows_updated,
            rows_deleted,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_commit(&self) {
        if self.enabled() {
            self.commits.inc();
        }
    }

    pub fn record_rollback(&self) {
        if self.enabled() {
            self.rollbacks.inc();
        }
    }

    pub fn record_busy_retry(&self) {
        if self.enabled() {
            self.busy_retries.inc();
        }
    }

    pub fn record_collapse(&self) {
        if self.enabled() {
            self.collapses.inc();
        }
    }

    pub fn record_assertion_evaluated(&self) {
        if self.enabled() {
            self.assertions_evaluated.inc();
        }
    }

    pub fn record_row_inserted(&self) {
        if self.enabled() {
            self.rows_inserted.inc();
        }
    }

    pub fn record_row_updated(&self) {
        if self.enabled() {
            self.rows_updated.inc();
        }
    }

    pub fn record_row_deleted(&self) {
        if self.enabled() {
            self.rows_deleted.inc();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default_and_no_op() {
        let m = Metrics::new();
        m.record_commit();
        assert_eq!(m.commits.get(), 0);
    }

    #[test]
    fn counts_when_enabled() {
        let m = Metrics::new();
        m.set_enabled(true);
        m.record_commit();
        m.record_commit();
        assert_eq!(m.commits.get(), 2);
    }
}
