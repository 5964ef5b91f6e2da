//! `dbsync-rs` implements centralized synchronization for occasionally
//! connected databases: a single authoritative server and many client
//! nodes each hold a copy of the tracked tables, clients mutate their
//! copies offline, and periodic push/pull rounds reconcile state until
//! every client converges to a suffix of the server's version log.
//!
//! The moving parts: a change tracker turning session mutations into an
//! ordered operation log, a compressor collapsing redundant operations, a
//! conflict detector and merge engine resolving disconnected edits, and a
//! signed push/pull protocol over framed JSON with per-field payload
//! streaming.
//!
//! ## Getting started
//!
//! ```no_run
//! use dbsync_rs::db::{SyncDb, SyncMode};
//! use dbsync_rs::net::client::SyncClient;
//! use dbsync_rs::store::schema::{ColumnType, Schema, TableDef};
//! use dbsync_rs::store::session::Session;
//! use dbsync_rs::store::value::{Row, Value};
//! use uuid::Uuid;
//!
//! # async fn demo() -> dbsync_rs::error::SyncResult<()> {
//! let schema = Schema::new(vec![TableDef::new("todos", "id")
//!     .column_not_null("id", ColumnType::Guid)
//!     .column("title", ColumnType::Text)]);
//! let db = SyncDb::open(schema, SyncMode::Client);
//! db.track("Todo", "todos");
//! db.generate_content_types()?;
//!
//! let mut session = Session::begin(&db)?;
//! let mut row = Row::new();
//! row.insert("id".into(), Value::Guid(Uuid::new_v4()));
//! row.insert("title".into(), Value::Text("buy milk".into()));
//! session.insert("todos", row)?;
//! session.commit()?;
//!
//! let client = SyncClient::new(db, "localhost", 7000);
//! client.register(None).await?;
//! client.synchronize().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod compression;
pub mod db;
pub mod error;
pub mod extensions;
pub mod messages;
pub mod net;
pub mod oplog;
pub mod perform;
pub mod registry;
pub mod server;
pub mod store;
pub mod tracking;

pub use db::{SyncDb, SyncMode};
pub use error::{Error, SyncResult};
