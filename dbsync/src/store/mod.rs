//! The relational store surface: schema description, typed values, the
//! [`engine::SqlStore`] interface the sync core programs against, the
//! in-memory reference implementation, and the tracked session.

pub mod engine;
pub mod memory;
pub mod schema;
pub mod session;
pub mod value;

pub use engine::SqlStore;
pub use memory::MemoryStore;
pub use schema::{ColumnDef, ColumnType, ForeignKeyDef, Schema, TableDef};
pub use session::Session;
pub use value::{Row, RowKey, Value};
