pub mod commit_log;
pub mod cursor;
pub mod datastore;
pub mod db_metrics;
pub mod message_log;
pub mod messages;
pub mod ostorage;
pub mod relational_db;
mod relational_operators;

pub use spacetimedb_lib::{AlgebraicType, AlgebraicValue, ProductType, ProductValue};
