//! Typed option bus (spec.md §4.10, §6's configuration table).
//!
//! A small typed key/value store keyed by the stable string identifiers §6
//! lists, with change listeners so other subsystems (e.g. the optimizer's
//! tuning, or `runtime_stats` gating crate::metrics) can reconfigure
//! themselves reactively instead of polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::RwLock;

use crate::error::{EngineError, MisuseError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    String(String),
    Object(HashMap<String, OptionValue>),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptionSubscriptionToken(u64);

type OptionListener = Box<dyn Fn(&str, &OptionValue) + Send + Sync>;

pub struct Options {
    values: RwLock<HashMap<String, OptionValue>>,
    listeners: RwLock<HashMap<u64, OptionListener>>,
    next_token: AtomicU64,
}

/// Names from spec.md §6's configuration table.
pub const RUNTIME_STATS: &str = "runtime_stats";
pub const VALIDATE_PLAN: &str = "validate_plan";
pub const DEFAULT_VTAB_MODULE: &str = "default_vtab_module";
pub const DEFAULT_VTAB_ARGS: &str = "default_vtab_args";
pub const DEFAULT_COLUMN_NULLABILITY: &str = "default_column_nullability";
pub const SCHEMA_PATH: &str = "schema_path";
pub const TRACE_PLAN_STACK: &str = "trace_plan_stack";

impl Options {
    pub fn new() -> Self {
        let mut values = HashMap::new();
        values.insert(RUNTIME_STATS.to_string(), OptionValue::Bool(false));
        values.insert(VALIDATE_PLAN.to_string(), OptionValue::Bool(false));
        values.insert(
            DEFAULT_VTAB_MODULE.to_string(),
            OptionValue::String("memory".to_string()),
        );
        values.insert(DEFAULT_VTAB_ARGS.to_string(), OptionValue::Object(HashMap::new()));
        values.insert(
            DEFAULT_COLUMN_NULLABILITY.to_string(),
            OptionValue::String("not_null".to_string()),
        );
        values.insert(SCHEMA_PATH.to_string(), OptionValue::String("main".to_string()));
        values.insert(TRACE_PLAN_STACK.to_string(), OptionValue::Bool(false));

        Options {
            values: RwLock::new(values),
            listeners: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn get(&self, name: &str) -> Option<OptionValue> {
        self.values.read().get(name).cloned()
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Sets an option, validating known-name constraints (spec.md §6):
    /// `default_column_nullability` only accepts `nullable`/`not_null`.
    /// Unknown option names are rejected as misuse rather than silently
    /// accepted, since a typo would otherwise configure nothing.
    pub fn set(&self, name: &str, value: OptionValue) -> Result<()> {
        if !self.values.read().contains_key(name) {
            return Err(EngineError::from(MisuseError::Other(format!(
                "unknown option `{name}`"
            ))));
        }
        if name == DEFAULT_COLUMN_NULLABILITY {
            match value.as_str() {
                Some("nullable") | Some("not_null") => {}
                _ => {
                    return Err(EngineError::from(MisuseError::Other(format!(
                        "option `{DEFAULT_COLUMN_NULLABILITY}` must be `nullable` or `not_null`"
                    ))))
                }
            }
        }
        self.values.write().insert(name.to_string(), value.clone());
        for listener in self.listeners.read().values() {
            listener(name, &value);
        }
        Ok(())
    }

    pub fn subscribe(&self, listener: OptionListener) -> OptionSubscriptionToken {
        let id = self.next_token.fetch_add(1, AtomicOrdering::Relaxed);
        self.listeners.write().insert(id, listener);
        OptionSubscriptionToken(id)
    }

    pub fn unsubscribe(&self, token: OptionSubscriptionToken) {
        self.listeners.write().remove(&token.0);
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let opts = Options::new();
        assert_eq!(opts.get(RUNTIME_STATS), Some(OptionValue::Bool(false)));
        assert_eq!(
            opts.get(DEFAULT_VTAB_MODULE),
            Some(OptionValue::String("memory".into()))
        );
    }

    #[test]
    fn rejects_unknown_option() {
        let opts = Options::new();
        assert!(opts.set("not_a_real_option", OptionValue::Bool(true)).is_err());
    }

    #[test]
    fn rejects_invalid_nullability_value() {
        let opts = Options::new();
        assert!(opts
            .set(DEFAULT_COLUMN_NULLABILITY, OptionValue::String("maybe".into()))
            .is_err());
        assert!(opts
            .set(DEFAULT_COLUMN_NULLABILITY, OptionValue::String("nullable".into()))
            .is_ok());
    }

    #[test]
    fn listener_fires_on_change() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let opts = Options::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        opts.subscribe(Box::new(move |name, _v| {
            if name == RUNTIME_STATS {
                fired2.store(true, Ordering::Relaxed);
            }
        }));
        opts.set(RUNTIME_STATS, OptionValue::Bool(true)).unwrap();
        assert!(fired.load(Ordering::Relaxed));
    }
}
