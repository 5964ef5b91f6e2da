//! Server-side handlers for the sync endpoints: registration, pull
//! assembly, and the push critical section.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value as Json};
use uuid::Uuid;

use crate::client::conflicts::find_unique_conflicts;
use crate::client::merge::apply_unique_fixups;
use crate::db::SyncDb;
use crate::error::{Error, SyncResult};
use crate::extensions::PullContext;
use crate::messages::pull::{PullMessage, PullRequestMessage};
use crate::messages::push::{encode_operation, PushMessage};
use crate::messages::register::RegisterMessage;
use crate::net::wire::{Frame, JsonTransport};
use crate::oplog::{self, Command, Node, Operation, Version};
use crate::perform::{apply_operation, respond_field_payload};
use crate::store::engine::SqlStore;
use crate::store::session::Session;
use crate::store::value::Row;

pub type PushListener = Box<dyn Fn(&PushMessage) -> SyncResult<()> + Send + Sync>;

#[derive(Default)]
struct Listeners {
    before_push: Vec<PushListener>,
    after_push: Vec<PushListener>,
}

pub(crate) struct ConnInfo {
    pub path: String,
    pub peer: String,
}

/// Shared state of a running sync server.
pub struct ServerState {
    pub db: SyncDb,
    pub id: String,
    listeners: RwLock<Listeners>,
    connections: Mutex<BTreeMap<u64, ConnInfo>>,
    next_connection: AtomicU64,
}

impl ServerState {
    pub fn new(db: SyncDb) -> Arc<ServerState> {
        Arc::new(ServerState {
            db,
            id: Uuid::new_v4().to_string(),
            listeners: RwLock::new(Listeners::default()),
            connections: Mutex::new(BTreeMap::new()),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Registers a listener invoked before a push is applied. May be used
    /// for admission checks; an error aborts the push.
    pub fn on_before_push(&self, listener: PushListener) {
        self.listeners.write().unwrap_or_else(|e| e.into_inner()).before_push.push(listener);
    }

    /// Registers a listener invoked after a push committed.
    pub fn on_after_push(&self, listener: PushListener) {
        self.listeners.write().unwrap_or_else(|e| e.into_inner()).after_push.push(listener);
    }

    fn run_before_push(&self, message: &PushMessage) -> SyncResult<()> {
        let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in &guard.before_push {
            listener(message)?;
        }
        Ok(())
    }

    fn run_after_push(&self, message: &PushMessage) -> SyncResult<()> {
        let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in &guard.after_push {
            listener(message)?;
        }
        Ok(())
    }

    pub(crate) fn add_connection(&self, path: &str, peer: &str) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, ConnInfo { path: path.to_owned(), peer: peer.to_owned() });
        id
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.connections.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    fn connection_summary(&self, except: u64) -> Vec<Json> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(id, _)| **id != except)
            .map(|(_, info)| json!({"path": info.path, "peer": info.peer}))
            .collect()
    }
}

/// Handles a registration request: mints a node with a fresh secret.
pub async fn handle_register(state: &ServerState, transport: &mut JsonTransport) -> SyncResult<()> {
    let params = transport.expect().await?;
    log::info!("register: {}", params);
    let registry_user_id = params
        .get("extra_data")
        .and_then(|d| d.get("registry_user_id"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    let node = state.db.with_store(|store| {
        let node = Node {
            node_id: oplog::next_node_id(store)?,
            registered_at: oplog::now(),
            registry_user_id,
            secret: Node::generate_secret(128),
        };
        oplog::save_node(store, &node)?;
        Ok(node)
    })?;
    transport.send(RegisterMessage { node }.encode()).await
}

/// Handles a status request.
pub async fn handle_status(state: &ServerState, transport: &mut JsonTransport, conn_id: u64) -> SyncResult<()> {
    let _ = transport.expect().await?;
    transport
        .send(json!({
            "id": state.id,
            "connections": state.connection_summary(conn_id),
        }))
        .await
}

/// Assembles and sends a pull message, then serves the field payload dance
/// until the client is done merging.
pub async fn handle_pull(state: &ServerState, transport: &mut JsonTransport) -> SyncResult<()> {
    let db = &state.db;
    let raw = transport.expect().await?;
    let request = PullRequestMessage::decode(&raw)?;

    let message = {
        let _guard = db.lock_sync().await;
        let ctx = PullContext { node_id: None, extra_data: request.extra_data.clone() };
        let mut operations = db.with_store(|store| oplog::operations_after(store, request.latest_version_id))?;
        operations.retain(|op| {
            db.with_registry(|reg| {
                reg.by_id(op.content_type_id).map(|m| reg.is_pulled(&m.model_name)).unwrap_or(false)
            })
        });
        let operations = db.with_extensions(|ext| ext.filter_operations(&ctx, operations))?;

        let mut message = PullMessage::new();
        message.versions = db.with_store(|store| oplog::versions_after(store, request.latest_version_id))?;
        for op in &operations {
            if op.command == Command::Delete {
                continue;
            }
            let model = db.with_registry(|reg| reg.require_by_id(op.content_type_id))?;
            let row = db.with_store(|store| store.get(&model.table_name, &op.row_id))?;
            // rows deleted since the operation was logged are carried by
            // their later delete operation instead
            if let Some(mut row) = row {
                db.with_extensions(|ext| {
                    ext.call_before_server_add_operation(&model.model_name, op, &row)?;
                    ext.load_fields(&model.model_name, &mut row)
                })?;
                message.payload.add_object(&model.model_name, op.row_id, row);
            }
        }
        message.operations = operations;
        message
    };

    transport.send(message.encode(db)?).await?;

    // the client merge may now request extension field payloads
    loop {
        match transport.recv().await? {
            None => return Ok(()),
            Some(value) => match Frame::from_value(&value)? {
                Frame::RequestFieldPayload { class_name, id, field_name, .. } => {
                    respond_field_payload(db, transport, &class_name, &id, &field_name).await?;
                }
                Frame::Done => return Ok(()),
                other => return Err(Error::BadResponse(format!("unexpected frame during pull: {:?}", other))),
            },
        }
    }
}

/// Validates and applies a push message under the push critical section,
/// creating a new version when any operation took effect.
pub async fn handle_push(state: &ServerState, transport: &mut JsonTransport) -> SyncResult<()> {
    let db = &state.db;
    let raw = transport.expect().await?;
    let message = PushMessage::decode(db, &raw)?;
    log::info!("push message with {} operations, key={:?}", message.operations.len(), message.key);

    let unknown = message
        .operations
        .iter()
        .find(|op| db.with_registry(|reg| reg.by_id(op.content_type_id).is_none()));
    if let Some(op) = unknown {
        return Err(Error::PushRejected(format!(
            "message includes operation on unknown content type {}",
            op.content_type_id
        )));
    }

    let _guard = db.lock_sync().await;

    let latest = db.latest_version_id()?;
    if message.latest_version_id != latest {
        let exc = format!("version identifier isn't the latest one; given: {:?}", message.latest_version_id);
        if latest.is_none() {
            return Err(Error::PushRejected(exc));
        }
        if message.latest_version_id.is_none() {
            return Err(Error::PullSuggested(exc));
        }
        if message.latest_version_id < latest {
            return Err(Error::PullSuggested(exc));
        }
        return Err(Error::PushRejected(exc));
    }

    if !message.islegit(db)? {
        return Err(Error::PushRejected("message isn't properly signed".into()));
    }

    state.run_before_push(&message)?;

    let mut session = Session::begin_internal(db)?;
    let outcome = apply_push(state, &mut session, &message, transport).await;
    let (new_version_id, applied) = match outcome {
        Ok(result) => {
            if let Err(err) = session.commit() {
                return Err(Error::PushRejected(format!(
                    "at least one operation couldn't be performed: {}",
                    err
                )));
            }
            result
        }
        Err(err) => {
            let _ = session.rollback();
            return Err(err);
        }
    };

    state.run_after_push(&message)?;
    for (op, row, _) in &applied {
        let model = db.with_registry(|reg| reg.require_by_id(op.content_type_id))?;
        db.with_extensions(|ext| ext.call_after_operation(&model.model_name, op, row))?;
    }

    transport.send_frame(&Frame::Result { new_version_id }).await
}

async fn apply_push(
    state: &ServerState,
    session: &mut Session,
    message: &PushMessage,
    transport: &mut JsonTransport,
) -> SyncResult<(Option<u32>, Vec<(Operation, Row, Option<Row>)>)> {
    let db = &state.db;

    // unique fixups, same shape as the client merge phase I; the server
    // log is fully versioned, so its L is empty
    let (unique_conflicts, unique_errors) = find_unique_conflicts(db, &message.operations, &[], message)?;
    if !unique_errors.is_empty() {
        return Err(Error::UniqueConstraint(unique_errors));
    }
    apply_unique_fixups(db, &unique_conflicts)?;

    let mut applied: Vec<(Operation, Row, Option<Row>)> = Vec::new();
    for op in &message.operations {
        match apply_operation(db, session, op, message, Some(transport)).await {
            Ok(Some(result)) => {
                transport.send_frame(&Frame::Info { op: encode_operation(op) }).await?;
                applied.push((op.clone(), result.0, result.1));
            }
            Ok(None) => {
                // skipped: excluded from the new version
            }
            Err(err @ Error::UniqueConstraint(_)) => return Err(err),
            Err(err) => {
                return Err(Error::PushRejected(format!(
                    "at least one operation couldn't be performed: {}",
                    err
                )))
            }
        }
    }

    if applied.is_empty() {
        return Ok((None, applied));
    }

    let version_id = db.with_store(|store| {
        let version = Version {
            version_id: oplog::next_version_id(store)?,
            node_id: message.node_id,
            created_at: oplog::now(),
        };
        oplog::insert_version(store, &version)?;
        // copy the applied operations into the server log, re-ordered
        for (op, _, _) in &applied {
            let copied = Operation {
                row_id: op.row_id,
                version_id: Some(version.version_id),
                content_type_id: op.content_type_id,
                command: op.command,
                order: oplog::next_order(store)?,
            };
            oplog::append_operation(store, &copied)?;
        }
        Ok(version.version_id)
    })?;

    Ok((Some(version_id), applied))
}
