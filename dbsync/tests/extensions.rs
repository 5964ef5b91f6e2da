//! Extension pipeline end-to-end: apply vetoes, pull authorization, and
//! the streamed field payload dance over a live connection.

mod common;

use pretty_assertions::assert_eq;
use serde_json::Value as Json;
use serial_test::serial;
use uuid::Uuid;

use dbsync_rs::db::SyncMode;
use dbsync_rs::error::{Error, SyncResult};
use dbsync_rs::extensions::{Extension, ExtensionField, ANY_MODEL};
use dbsync_rs::oplog::VERSIONS_TABLE;
use dbsync_rs::store::schema::{ColumnType, Schema, TableDef};
use dbsync_rs::store::value::Value;

use common::*;

#[tokio::test]
#[serial]
async fn server_side_skip_excludes_the_operation_from_the_version() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let mut ext = Extension::new();
    ext.before_insert = Some(Box::new(|_, row, _| {
        if row.get("name") == Some(&Value::Text("skipme".into())) {
            return Err(Error::SkipOperation);
        }
        Ok(())
    }));
    server_db.extend("A", ext);

    let (_state, port) = start_server(server_db.clone()).await?;
    let client = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    client.register(None).await?;

    insert(client.db(), "test_a", a_row(Uuid::new_v4(), "skipme"))?;
    insert(client.db(), "test_a", a_row(Uuid::new_v4(), "keepme"))?;
    assert_eq!(client.push().await?, Some(1));

    assert_eq!(count(&server_db, "test_a"), 1);
    let server_ops = server_db.with_store(|s| dbsync_rs::oplog::all_operations(s))?;
    assert_eq!(server_ops.len(), 1);

    // a push whose operations are all vetoed produces no version
    insert(client.db(), "test_a", a_row(Uuid::new_v4(), "skipme"))?;
    assert_eq!(client.push().await?, None);
    assert_eq!(count(&server_db, VERSIONS_TABLE), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn filter_operations_narrows_the_pull() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let mut ext = Extension::new();
    ext.filter_operations = Some(Box::new(|ctx, ops| {
        if ctx.extra_data.get("all").and_then(|v| v.as_bool()).unwrap_or(false) {
            Ok(ops)
        } else {
            Ok(Vec::new())
        }
    }));
    server_db.extend(ANY_MODEL, ext);

    let (_state, port) = start_server(server_db.clone()).await?;
    let writer = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    let reader = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    writer.register(None).await?;
    reader.register(None).await?;

    insert(writer.db(), "test_a", a_row(Uuid::new_v4(), "guarded"))?;
    writer.push().await?;

    // denied: no operations, but the version watermark still advances
    assert_eq!(reader.pull(Json::Null).await?, 0);
    assert_eq!(count(reader.db(), "test_a"), 0);
    assert_eq!(reader.db().latest_version_id()?, Some(1));
    Ok(())
}

fn blob_schema() -> Schema {
    Schema::new(vec![TableDef::new("test_a", "id")
        .column_not_null("id", ColumnType::Guid)
        .column("name", ColumnType::Text)
        .column("blob", ColumnType::Binary)])
}

#[tokio::test]
#[serial]
async fn field_payloads_stream_during_push_apply() -> SyncResult<()> {
    // client side: produce the payload bytes out of band
    let client_db = {
        let db = dbsync_rs::db::SyncDb::open(blob_schema(), SyncMode::Client);
        db.track("A", "test_a");
        db.extend(
            "A",
            Extension::new().field(
                "blob",
                ExtensionField {
                    send_payload: Some(Box::new(|row| match row.get("name") {
                        Some(Value::Text(name)) => Ok(format!("payload of {}", name).into_bytes()),
                        _ => Ok(Vec::new()),
                    })),
                    ..Default::default()
                },
            ),
        );
        db
    };
    // server side: consume the stream into the binary column
    let server_db = {
        let db = dbsync_rs::db::SyncDb::open(blob_schema(), SyncMode::Server);
        db.track("A", "test_a");
        db.extend(
            "A",
            Extension::new().field(
                "blob",
                ExtensionField {
                    receive_payload: Some(Box::new(|_, row, bytes| {
                        row.insert("blob".into(), Value::Bytes(bytes));
                        Ok(())
                    })),
                    ..Default::default()
                },
            ),
        );
        db
    };

    let (_state, port) = start_server(server_db.clone()).await?;
    let client = client_for(client_db, port);
    client.register(None).await?;

    let id = Uuid::new_v4();
    insert(client.db(), "test_a", a_row(id, "alpha"))?;
    assert_eq!(client.push().await?, Some(1));

    let (_, row) = scan(&server_db, "test_a").pop().unwrap();
    assert_eq!(row.get("blob"), Some(&Value::Bytes(b"payload of alpha".to_vec())));
    Ok(())
}

#[tokio::test]
#[serial]
async fn loadfn_projects_extended_columns_into_the_payload() -> SyncResult<()> {
    let server_db = {
        let db = dbsync_rs::db::SyncDb::open(blob_schema(), SyncMode::Server);
        db.track("A", "test_a");
        db
    };
    let client_db = {
        let db = dbsync_rs::db::SyncDb::open(blob_schema(), SyncMode::Client);
        db.track("A", "test_a");
        db.extend(
            "A",
            Extension::new().field(
                "blob",
                ExtensionField {
                    loadfn: Some(Box::new(|row| match row.get("name") {
                        Some(Value::Text(name)) => Ok(Value::Bytes(name.clone().into_bytes())),
                        _ => Ok(Value::Null),
                    })),
                    ..Default::default()
                },
            ),
        );
        db
    };

    let (_state, port) = start_server(server_db.clone()).await?;
    let client = client_for(client_db, port);
    client.register(None).await?;

    insert(client.db(), "test_a", a_row(Uuid::new_v4(), "beta"))?;
    assert_eq!(client.push().await?, Some(1));

    let (_, row) = scan(&server_db, "test_a").pop().unwrap();
    assert_eq!(row.get("blob"), Some(&Value::Bytes(b"beta".to_vec())));
    Ok(())
}
