//! Local node registry helpers. The network half of registration lives on
//! [`crate::net::client::SyncClient::register`].

use chrono::NaiveDateTime;

use crate::db::SyncDb;
use crate::error::SyncResult;
use crate::oplog::{self, Node};

/// Whether this client application has at least one node registry.
pub fn is_registered(db: &SyncDb) -> SyncResult<bool> {
    Ok(get_node(db)?.is_some())
}

/// The node register info for the actual client.
pub fn get_node(db: &SyncDb) -> SyncResult<Option<Node>> {
    db.with_store(|store| oplog::get_node(store))
}

/// Save node info into the database without a server request.
pub fn save_node(
    db: &SyncDb,
    node_id: u32,
    registered_at: NaiveDateTime,
    registry_user_id: Option<u32>,
    secret: &str,
) -> SyncResult<()> {
    db.with_store(|store| {
        oplog::save_node(
            store,
            &Node { node_id, registered_at, registry_user_id, secret: secret.to_owned() },
        )
    })
}
