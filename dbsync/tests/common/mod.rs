//! Shared fixtures for the end-to-end scenarios: the A/B demo schema, a
//! server bound to an ephemeral port, and row builders.

#![allow(dead_code)]

use std::sync::Arc;

use uuid::Uuid;

use dbsync_rs::db::{SyncDb, SyncMode};
use dbsync_rs::error::SyncResult;
use dbsync_rs::net::client::SyncClient;
use dbsync_rs::net::server::SyncServer;
use dbsync_rs::server::ServerState;
use dbsync_rs::store::engine::SqlStore;
use dbsync_rs::store::schema::{ColumnType, Schema, TableDef};
use dbsync_rs::store::session::Session;
use dbsync_rs::store::value::{Row, RowKey, Value};

/// Two tracked models with one foreign key, GUID primary keys.
pub fn schema_ab() -> Schema {
    Schema::new(vec![
        TableDef::new("test_a", "id")
            .column_not_null("id", ColumnType::Guid)
            .column("name", ColumnType::Text),
        TableDef::new("test_b", "id")
            .column_not_null("id", ColumnType::Guid)
            .column("name", ColumnType::Text)
            .column("a_id", ColumnType::Guid)
            .foreign_key("a_id", "test_a", "id"),
    ])
}

/// The same shape with integer primary keys, for the id-collision path.
pub fn schema_ab_int() -> Schema {
    Schema::new(vec![
        TableDef::new("test_a", "id")
            .column_not_null("id", ColumnType::Integer)
            .column("name", ColumnType::Text),
        TableDef::new("test_b", "id")
            .column_not_null("id", ColumnType::Integer)
            .column("name", ColumnType::Text)
            .column("a_id", ColumnType::Integer)
            .foreign_key("a_id", "test_a", "id"),
    ])
}

pub fn open_db(schema: Schema, mode: SyncMode) -> SyncResult<SyncDb> {
    let db = SyncDb::open(schema, mode);
    db.track("A", "test_a");
    db.track("B", "test_b");
    db.generate_content_types()?;
    Ok(db)
}

/// Starts a server over the given database on an ephemeral port and
/// returns a client factory target.
pub async fn start_server(db: SyncDb) -> SyncResult<(Arc<ServerState>, u16)> {
    let server = SyncServer::new(db, "127.0.0.1", 0);
    let state = server.state();
    let listener = server.bind().await?;
    let port = listener.local_addr()?.port();
    let run_state = state.clone();
    tokio::spawn(async move {
        let _ = SyncServer::run(run_state, listener).await;
    });
    Ok((state, port))
}

pub fn client_for(db: SyncDb, port: u16) -> SyncClient {
    SyncClient::new(db, "127.0.0.1", port)
}

pub fn a_row(id: Uuid, name: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), Value::Guid(id));
    row.insert("name".into(), Value::Text(name.into()));
    row
}

pub fn b_row(id: Uuid, name: &str, a_id: Uuid) -> Row {
    let mut row = a_row(id, name);
    row.insert("a_id".into(), Value::Guid(a_id));
    row
}

pub fn a_row_int(id: i64, name: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), Value::Int(id));
    row.insert("name".into(), Value::Text(name.into()));
    row
}

pub fn b_row_int(id: i64, name: &str, a_id: i64) -> Row {
    let mut row = a_row_int(id, name);
    row.insert("a_id".into(), Value::Int(a_id));
    row
}

pub fn insert(db: &SyncDb, table: &str, row: Row) -> SyncResult<()> {
    let mut session = Session::begin(db)?;
    session.insert(table, row)?;
    session.commit()
}

pub fn update(db: &SyncDb, table: &str, row: Row) -> SyncResult<()> {
    let mut session = Session::begin(db)?;
    session.update(table, row)?;
    session.commit()
}

pub fn delete(db: &SyncDb, table: &str, key: &RowKey) -> SyncResult<()> {
    let mut session = Session::begin(db)?;
    session.delete(table, key)?;
    session.commit()
}

pub fn count(db: &SyncDb, table: &str) -> usize {
    db.with_store(|store| store.count(table)).unwrap()
}

pub fn scan(db: &SyncDb, table: &str) -> Vec<(RowKey, Row)> {
    db.with_store(|store| store.scan(table)).unwrap()
}

/// Asserts that every foreign key in every user table resolves.
pub fn assert_fks_resolve(db: &SyncDb) {
    let schema = db.schema().clone();
    for def in schema.tables() {
        for fk in &def.foreign_keys {
            for (pk, row) in scan(db, &def.name) {
                if let Some(value) = row.get(&fk.column) {
                    if value.is_null() {
                        continue;
                    }
                    let parent = RowKey::from_value(value).unwrap();
                    assert!(
                        db.with_store(|s| s.get(&fk.ref_table, &parent)).unwrap().is_some(),
                        "fk {}.{} of row {} dangles",
                        def.name,
                        fk.column,
                        pk
                    );
                }
            }
        }
    }
}

/// Asserts the tracked tables hold identical rows on both databases.
pub fn assert_converged(left: &SyncDb, right: &SyncDb, tables: &[&str]) {
    for table in tables {
        assert_eq!(scan(left, table), scan(right, table), "table {} diverged", table);
    }
}
