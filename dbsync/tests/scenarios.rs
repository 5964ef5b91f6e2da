//! End-to-end synchronization scenarios over the TCP transport: one
//! server task, real push/pull rounds, in-memory stores on both ends.

mod common;

use pretty_assertions::assert_eq;
use serde_json::Value as Json;
use serial_test::serial;
use uuid::Uuid;

use dbsync_rs::db::SyncMode;
use dbsync_rs::error::SyncResult;
use dbsync_rs::oplog::{self, Command, VERSIONS_TABLE};
use dbsync_rs::store::engine::SqlStore;
use dbsync_rs::store::value::{RowKey, Value};

use common::*;

#[tokio::test]
#[serial]
async fn empty_sync_creates_no_version() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let (_state, port) = start_server(server_db.clone()).await?;
    let client = client_for(open_db(schema_ab(), SyncMode::Client)?, port);

    client.register(None).await?;
    assert_eq!(client.push().await?, None);
    assert_eq!(count(&server_db, VERSIONS_TABLE), 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn fresh_insert_becomes_one_version() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let (_state, port) = start_server(server_db.clone()).await?;
    let client = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    client.register(None).await?;

    let a1 = Uuid::new_v4();
    let b1 = Uuid::new_v4();
    insert(client.db(), "test_a", a_row(a1, "a1"))?;
    insert(client.db(), "test_b", b_row(b1, "b1", a1))?;

    let new_version = client.push().await?;
    assert_eq!(new_version, Some(1));
    assert_eq!(server_db.latest_version_id()?, Some(1));
    assert_eq!(count(&server_db, "test_a"), 1);
    assert_eq!(count(&server_db, "test_b"), 1);
    let server_ops = server_db.with_store(|s| oplog::all_operations(s))?;
    assert_eq!(server_ops.len(), 2);
    assert!(server_ops.iter().all(|op| op.command == Command::Insert && op.version_id == Some(1)));

    // convergence: after push + pull against a quiescent server, the
    // client state equals the server state
    client.pull(Json::Null).await?;
    assert_converged(client.db(), &server_db, &["test_a", "test_b"]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn update_then_delete_compresses_to_nothing() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let (_state, port) = start_server(server_db.clone()).await?;
    let client = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    client.register(None).await?;

    let id = Uuid::new_v4();
    insert(client.db(), "test_a", a_row(id, "x"))?;
    update(client.db(), "test_a", a_row(id, "y"))?;
    delete(client.db(), "test_a", &RowKey::Guid(id))?;

    assert_eq!(client.push().await?, None);
    assert_eq!(count(&server_db, VERSIONS_TABLE), 0);
    assert_eq!(count(&server_db, "test_a"), 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn two_clients_share_an_fk_target_sequentially() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let (_state, port) = start_server(server_db.clone()).await?;
    let client1 = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    let client2 = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    client1.register(None).await?;
    client2.register(None).await?;

    let a1 = Uuid::new_v4();
    insert(client1.db(), "test_a", a_row(a1, "shared"))?;
    assert_eq!(client1.push().await?, Some(1));

    client2.pull(Json::Null).await?;
    assert_eq!(count(client2.db(), "test_a"), 1);
    let b1 = Uuid::new_v4();
    insert(client2.db(), "test_b", b_row(b1, "child", a1))?;
    assert_eq!(client2.push().await?, Some(2));

    client1.pull(Json::Null).await?;
    client2.pull(Json::Null).await?;
    assert_converged(client1.db(), &server_db, &["test_a", "test_b"]);
    assert_converged(client2.db(), &server_db, &["test_a", "test_b"]);
    assert_fks_resolve(client1.db());
    assert_fks_resolve(client2.db());
    Ok(())
}

#[tokio::test]
#[serial]
async fn integer_pk_collision_is_renumbered() -> SyncResult<()> {
    let server_db = open_db(schema_ab_int(), SyncMode::Server)?;
    let (_state, port) = start_server(server_db.clone()).await?;
    let client1 = client_for(open_db(schema_ab_int(), SyncMode::Client)?, port);
    let client2 = client_for(open_db(schema_ab_int(), SyncMode::Client)?, port);
    client1.register(None).await?;
    client2.register(None).await?;

    // both clients allocate id 7 for different rows while offline
    insert(client1.db(), "test_a", a_row_int(7, "from client1"))?;
    insert(client2.db(), "test_a", a_row_int(7, "from client2"))?;
    insert(client2.db(), "test_b", b_row_int(70, "child of 7", 7))?;

    assert_eq!(client1.push().await?, Some(1));

    // the second push is behind, pulls the conflict, renumbers 7 -> 8
    // with its dependent fk, and retries
    let new_version = client2.synchronize().await?;
    assert_eq!(new_version, Some(2));

    let mut server_ids: Vec<RowKey> = scan(&server_db, "test_a").into_iter().map(|(pk, _)| pk).collect();
    server_ids.sort();
    assert_eq!(server_ids, vec![RowKey::Int(7), RowKey::Int(8)]);
    let (_, child) = scan(&server_db, "test_b").pop().unwrap();
    assert_eq!(child.get("a_id"), Some(&Value::Int(8)));
    assert_fks_resolve(&server_db);
    assert_fks_resolve(client2.db());

    client1.pull(Json::Null).await?;
    assert_converged(client1.db(), &server_db, &["test_a", "test_b"]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn delete_versus_update_resurrects_the_row() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let (_state, port) = start_server(server_db.clone()).await?;
    let client1 = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    let client2 = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    client1.register(None).await?;
    client2.register(None).await?;

    let alpha = Uuid::new_v4();
    insert(client1.db(), "test_a", a_row(alpha, "alpha"))?;
    assert_eq!(client1.push().await?, Some(1));
    client2.pull(Json::Null).await?;

    // client1 deletes the row server-side; client2 updates it offline
    delete(client1.db(), "test_a", &RowKey::Guid(alpha))?;
    assert_eq!(client1.push().await?, Some(2));
    update(client2.db(), "test_a", a_row(alpha, "kept alive"))?;

    // merge skips the remote delete and turns the local update into an
    // insert of the resurrected state
    client2.pull(Json::Null).await?;
    assert_eq!(count(client2.db(), "test_a"), 1);
    let local = client2.db().with_store(|s| oplog::unversioned_operations(s))?;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].command, Command::Insert);
    assert_eq!(local[0].row_id, RowKey::Guid(alpha));

    // the retry-push stores the resurrection as a new version
    assert_eq!(client2.push().await?, Some(3));
    assert_eq!(count(&server_db, "test_a"), 1);
    let (_, row) = scan(&server_db, "test_a").pop().unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("kept alive".into())));
    Ok(())
}

#[tokio::test]
#[serial]
async fn version_ids_observed_by_a_client_increase_strictly() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let (_state, port) = start_server(server_db.clone()).await?;
    let client = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    client.register(None).await?;

    let mut observed = Vec::new();
    for n in 0..4 {
        insert(client.db(), "test_a", a_row(Uuid::new_v4(), &format!("a{}", n)))?;
        if let Some(vid) = client.push().await? {
            observed.push(vid);
        }
    }
    assert_eq!(observed.len(), 4);
    assert!(observed.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[tokio::test]
#[serial]
async fn status_reports_the_server_id() -> SyncResult<()> {
    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let (state, port) = start_server(server_db).await?;
    let client = client_for(open_db(schema_ab(), SyncMode::Client)?, port);

    let status = client.status().await?;
    assert_eq!(status.get("id").and_then(|v| v.as_str()), Some(state.id.as_str()));
    assert!(status.get("connections").and_then(|v| v.as_array()).is_some());
    Ok(())
}

#[tokio::test]
#[serial]
async fn stale_push_is_told_to_pull_and_a_bad_key_is_rejected() -> SyncResult<()> {
    use dbsync_rs::error::Error;

    let server_db = open_db(schema_ab(), SyncMode::Server)?;
    let (_state, port) = start_server(server_db.clone()).await?;
    let client1 = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    let client2 = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    client1.register(None).await?;
    client2.register(None).await?;

    insert(client1.db(), "test_a", a_row(Uuid::new_v4(), "first"))?;
    assert_eq!(client1.push().await?, Some(1));

    // client2 never pulled: its push is behind and must be retried after
    // a pull
    insert(client2.db(), "test_a", a_row(Uuid::new_v4(), "second"))?;
    match client2.push().await {
        Err(Error::PullSuggested(_)) => {}
        other => panic!("expected PullSuggested, got {:?}", other.map(|_| ())),
    }

    // a client whose secret doesn't match the registry is turned away
    let rogue = client_for(open_db(schema_ab(), SyncMode::Client)?, port);
    rogue.register(None).await?;
    rogue.db().with_store(|store| {
        let node = oplog::get_node(store)?.unwrap();
        let forged = dbsync_rs::oplog::Node { secret: "not the secret".into(), ..node };
        store.update(oplog::NODES_TABLE, &RowKey::Int(forged.node_id as i64), forged.to_row())
    })?;
    insert(rogue.db(), "test_a", a_row(Uuid::new_v4(), "rogue"))?;
    rogue.pull(Json::Null).await?;
    match rogue.push().await {
        Err(Error::PushRejected(reason)) => assert!(reason.contains("signed")),
        other => panic!("expected PushRejected, got {:?}", other.map(|_| ())),
    }
    Ok(())
}
