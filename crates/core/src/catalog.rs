//! System catalog (spec.md §2, §3): schemas, tables, functions, assertions,
//! and modules, plus the change-notification bus caches subscribe to for
//! invalidation.
//!
//! Grounded in the teacher's `db::catalog::Catalog` (a thin aggregate of
//! per-kind sub-catalogs), generalized from SpacetimeDB's
//! sequence/table/index triad to the kinds spec.md §2 names. Event
//! subscriptions follow spec.md §9's redesign note: "represent as explicit
//! registries returning a subscription token; never capture the session
//! directly."

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CatalogError, EngineError, Result};
use crate::metrics::Metrics;
use crate::schema::TableSchemaRef;
use crate::storage::TableManager;
use crate::value::Collation;
use crate::vtab::VTableModule;

pub const MAIN_SCHEMA: &str = "main";

/// Registered scalar or table-valued function. The function body/evaluator
/// is owned by the built-in function library (out of scope, spec.md §1); the
/// catalog only tracks identity, arity, and the read-only flag §7's
/// "read-only" error kind checks against.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub arity: Option<usize>,
    pub read_only: bool,
}

/// A registered `CREATE ASSERTION`. The violation query itself is owned by
/// the planner (out of scope); `query_handle` is an opaque identifier the
/// assertion evaluator (crate::assertion) hands to the planner/optimizer
/// collaborators to resolve it.
#[derive(Debug, Clone)]
pub struct AssertionDef {
    pub name: String,
    pub query_handle: u64,
}

#[derive(Debug, Clone)]
pub enum CatalogEvent {
    TableCreated(String),
    TableDropped(String),
    SchemaChanged(String),
    FunctionRegistered(String),
    ModuleRegistered(String),
    AssertionRegistered(String),
    AssertionDropped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Listener = Box<dyn Fn(&CatalogEvent) + Send + Sync>;

pub struct Catalog {
    /// schema namespace -> table name -> table manager.
    schemas: RwLock<HashMap<String, HashMap<String, Arc<TableManager>>>>,
    functions: RwLock<HashMap<String, FunctionDef>>,
    modules: RwLock<HashMap<String, Arc<dyn VTableModule>>>,
    assertions: RwLock<HashMap<String, AssertionDef>>,
    collations: RwLock<HashMap<String, Collation>>,
    /// Bumped on every schema mutation; consulted by the assertion
    /// evaluator's plan cache (spec.md §3's `PlanCacheEntry`).
    generation: AtomicU64,
    listeners: RwLock<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Catalog {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let mut collations = HashMap::new();
        collations.insert("default".to_string(), Collation::Default);
        collations.insert("nocase".to_string(), Collation::NoCase);
        collations.insert("rtrim".to_string(), Collation::RTrim);

        let mut schemas = HashMap::new();
        schemas.insert(MAIN_SCHEMA.to_string(), HashMap::new());

        Catalog {
            schemas: RwLock::new(schemas),
            functions: RwLock::new(HashMap::new()),
            modules: RwLock::new(HashMap::new()),
            assertions: RwLock::new(HashMap::new()),
            collations: RwLock::new(collations),
            generation: AtomicU64::new(0),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::Acquire)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, AtomicOrdering::AcqRel) + 1
    }

    pub fn subscribe(&self, listener: Listener) -> SubscriptionToken {
        let id = self.next_listener_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.listeners.write().insert(id, listener);
        SubscriptionToken(id)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.listeners.write().remove(&token.0);
    }

    fn emit(&self, event: CatalogEvent) {
        for listener in self.listeners.read().values() {
            listener(&event);
        }
    }

    pub fn ensure_schema(&self, namespace: &str) {
        self.schemas
            .write()
            .entry(namespace.to_string())
            .or_default();
    }

    pub fn create_table(&self, schema: TableSchemaRef) -> Result<Arc<TableManager>> {
        let namespace = schema.schema_namespace.clone();
        let name = schema.name.clone();
        let mut schemas = self.schemas.write();
        let tables = schemas.entry(namespace.clone()).or_default();
        if tables.contains_key(&name) {
            return Err(CatalogError::Duplicate(name, namespace).into());
        }
        let mgr = Arc::new(TableManager::new(schema, Arc::clone(&self.metrics)));
        tables.insert(name.clone(), Arc::clone(&mgr));
        drop(schemas);
        self.bump_generation();
        self.emit(CatalogEvent::TableCreated(format!("{namespace}.{name}")));
        Ok(mgr)
    }

    pub fn drop_table(&self, namespace: &str, name: &str) -> Result<()> {
        let mut schemas = self.schemas.write();
        let tables = schemas
            .get_mut(namespace)
            .ok_or_else(|| CatalogError::SchemaNotFound(namespace.to_string()))?;
        if tables.remove(name).is_none() {
            return Err(EngineError::from(crate::error::TableError::NotFound(name.to_string())));
        }
        drop(schemas);
        self.bump_generation();
        self.emit(CatalogEvent::TableDropped(format!("{namespace}.{name}")));
        Ok(())
    }

    pub fn get_table(&self, namespace: &str, name: &str) -> Option<Arc<TableManager>> {
        self.schemas.read().get(namespace)?.get(name).cloned()
    }

    /// Called after a schema-evolving mutation (add-column, create-index,
    /// …) on an existing table's base layer.
    pub fn notify_schema_changed(&self, namespace: &str, name: &str) {
        self.bump_generation();
        self.emit(CatalogEvent::SchemaChanged(format!("{namespace}.{name}")));
    }

    pub fn list_tables(&self, namespace: &str) -> Vec<String> {
        self.schemas
            .read()
            .get(namespace)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn register_function(&self, def: FunctionDef) -> Result<()> {
        let name = def.name.clone();
        let mut functions = self.functions.write();
        if functions.contains_key(&name) {
            return Err(CatalogError::Duplicate(name, "functions".into()).into());
        }
        functions.insert(name.clone(), def);
        drop(functions);
        self.emit(CatalogEvent::FunctionRegistered(name));
        Ok(())
    }

    pub fn get_function(&self, name: &str) -> Result<FunctionDef> {
        self.functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::FunctionNotFound(name.to_string()).into())
    }

    pub fn register_module(&self, name: &str, module: Arc<dyn VTableModule>) -> Result<()> {
        let mut modules = self.modules.write();
        if modules.contains_key(name) {
            return Err(CatalogError::Duplicate(name.to_string(), "modules".into()).into());
        }
        modules.insert(name.to_string(), module);
        drop(modules);
        self.emit(CatalogEvent::ModuleRegistered(name.to_string()));
        Ok(())
    }

    pub fn get_module(&self, name: &str) -> Result<Arc<dyn VTableModule>> {
        self.modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::ModuleNotFound(name.to_string()).into())
    }

    pub fn register_collation(&self, name: &str, collation: Collation) {
        self.collations.write().insert(name.to_string(), collation);
    }

    pub fn get_collation(&self, name: &str) -> Result<Collation> {
        self.collations
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| CatalogError::CollationNotFound(name.to_string()).into())
    }

    pub fn create_assertion(&self, def: AssertionDef) -> Result<()> {
        let name = def.name.clone();
        let mut assertions = self.assertions.write();
        if assertions.contains_key(&name) {
            return Err(CatalogError::Duplicate(name, "assertions".into()).into());
        }
        assertions.insert(name.clone(), def);
        drop(assertions);
        self.bump_generation();
        self.emit(CatalogEvent::AssertionRegistered(name));
        Ok(())
    }

    pub fn drop_assertion(&self, name: &str) -> Result<()> {
        if self.assertions.write().remove(name).is_none() {
            return Err(CatalogError::AssertionNotFound(name.to_string()).into());
        }
        self.bump_generation();
        self.emit(CatalogEvent::AssertionDropped(name.to_string()));
        Ok(())
    }

    pub fn get_assertion(&self, name: &str) -> Result<AssertionDef> {
        self.assertions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::AssertionNotFound(name.to_string()).into())
    }

    pub fn list_assertions(&self) -> Vec<AssertionDef> {
        self.assertions.read().values().cloned().collect()
    }

    /// Disconnects nothing by itself (connections are owned by table
    /// managers); clears all catalog state. Used by the session façade's
    /// `close()` (spec.md §4.10).
    pub fn clear(&self) {
        self.schemas.write().clear();
        self.schemas.write().insert(MAIN_SCHEMA.to_string(), HashMap::new());
        self.functions.write().clear();
        self.modules.write().clear();
        self.assertions.write().clear();
        self.listeners.write().clear();
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(Arc::new(Metrics::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ModuleRef, PrimaryKeyDef, ScalarType, SortDirection, TableSchema};
    use std::sync::atomic::AtomicUsize;

    fn schema(name: &str) -> TableSchemaRef {
        Arc::new(TableSchema {
            schema_namespace: MAIN_SCHEMA.into(),
            name: name.into(),
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

    #[test]
    fn create_table_bumps_generation_and_emits() {
        let catalog = Catalog::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        catalog.subscribe(Box::new(move |_e| {
            seen2.fetch_add(1, AtomicOrdering::Relaxed);
        }));

        let before = catalog.generation();
        catalog.create_table(schema("t")).unwrap();
        assert_eq!(catalog.generation(), before + 1);
        assert_eq!(seen.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn duplicate_table_rejected() {
        let catalog = Catalog::default();
        catalog.create_table(schema("t")).unwrap();
        let err = catalog.create_table(schema("t")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Misuse);
    }

    #[test]
    fn drop_table_removes_it() {
        let catalog = Catalog::default();
        catalog.create_table(schema("t")).unwrap();
        catalog.drop_table(MAIN_SCHEMA, "t").unwrap();
        assert!(catalog.get_table(MAIN_SCHEMA, "t").is_none());
    }

    #[test]
    fn drop_table_missing_is_not_found() {
        let catalog = Catalog::default();
        catalog.ensure_schema(MAIN_SCHEMA);
        let err = catalog.drop_table(MAIN_SCHEMA, "missing").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let catalog = Catalog::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let token = catalog.subscribe(Box::new(move |_e| {
            seen2.fetch_add(1, AtomicOrdering::Relaxed);
        }));
        catalog.unsubscribe(token);
        catalog.create_table(schema("t")).unwrap();
        assert_eq!(seen.load(AtomicOrdering::Relaxed), 0);
    }
}
