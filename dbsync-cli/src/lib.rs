//! `dbsync-rs` CLI tools: run a sync server over a demo schema, or drive
//! a demo client against one.
//!
//! ```doc
//! ❯ dbsynccli server
//! sync server listening on 127.0.0.1:7000
//!
//! ❯ dbsynccli demo --rows 3
//! registered node 1
//! pushed 3 rows, server version is now Some(1)
//! ```

pub mod config;
pub mod demo;
pub mod trace;
