//! Layered, in-memory MVCC storage engine (spec.md §2, §4.1–§4.5).

pub mod connection;
pub mod layer;
pub mod ordered_map;
pub mod table_manager;

pub use connection::{ConnectionId, TableConnection};
pub use layer::{Entry, Layer, LayerHandle, LayerKind};
pub use ordered_map::{unbounded, Direction};
pub use table_manager::{ConflictMode, MutationOp, MutationOutcome, TableManager};
