//! Push message and related.

use chrono::NaiveDateTime;
use serde_json::{json, Map, Value as Json};
use sha2::{Digest, Sha512};

use crate::codec::{decode_optional_u32, decode_value, encode_optional_u32, encode_value};
use crate::db::SyncDb;
use crate::error::{Error, SyncResult};
use crate::messages::{ObjectContainer, Payload};
use crate::oplog::{self, Command, Node, Operation};
use crate::store::engine::SqlStore;
use crate::store::schema::ColumnType;
use crate::store::value::{Row, RowKey, Value};

/// A push message: the latest version information, the node information,
/// the list of unversioned operations, and the required objects for those
/// operations to be performed.
///
/// An empty message is built with [`PushMessage::new`] and filled with
/// [`PushMessage::add_unversioned_operations`]; `set_node` must be used for
/// proper key generation. To verify correctness, use `islegit` against a
/// database that knows the node's secret.
pub struct PushMessage {
    pub created: NaiveDateTime,
    pub node_id: Option<u32>,
    /// Key to this message.
    pub key: Option<String>,
    pub latest_version_id: Option<u32>,
    /// Unversioned operations, in log order.
    pub operations: Vec<Operation>,
    pub payload: Payload,
    /// Secret used internally to sign; never serialized.
    secret: Option<String>,
}

pub(crate) fn encode_operation(op: &Operation) -> Json {
    json!({
        "row_id": op.row_id.portion(),
        "version_id": encode_optional_u32(op.version_id),
        "content_type_id": op.content_type_id,
        "command": op.command.as_str(),
        "order": op.order,
    })
}

pub(crate) fn decode_operation(value: &Json) -> SyncResult<Operation> {
    let map = value
        .as_object()
        .ok_or_else(|| Error::BadResponse(format!("operation isn't an object: {}", value)))?;
    let field = |name: &str| -> SyncResult<&Json> {
        map.get(name).ok_or_else(|| Error::BadResponse(format!("operation misses {}", name)))
    };
    let row_id = match field("row_id")? {
        Json::String(s) => RowKey::parse(s)?,
        other => crate::codec::decode_key(other)?,
    };
    Ok(Operation {
        row_id,
        version_id: decode_optional_u32(field("version_id")?)?,
        content_type_id: decode_optional_u32(field("content_type_id")?)?
            .ok_or_else(|| Error::BadResponse("operation misses content_type_id".into()))?,
        command: Command::from_str(
            field("command")?.as_str().ok_or_else(|| Error::BadResponse("bad command".into()))?,
        )?,
        order: decode_optional_u32(field("order")?)?.unwrap_or(0),
    })
}

fn encode_created(created: &NaiveDateTime) -> Json {
    encode_value(&Value::DateTime(*created))
}

fn decode_created(value: &Json) -> SyncResult<NaiveDateTime> {
    match decode_value(ColumnType::DateTime, value)? {
        Value::DateTime(dt) => Ok(dt),
        _ => Err(Error::BadResponse("message misses its creation time".into())),
    }
}

/// Compares two hex digests without short-circuiting on the first
/// difference.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl Default for PushMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl PushMessage {
    pub fn new() -> Self {
        PushMessage {
            created: oplog::now(),
            node_id: None,
            key: None,
            latest_version_id: None,
            operations: Vec::new(),
            payload: Payload::new(),
            secret: None,
        }
    }

    /// Adds all unversioned operations to this message, including the
    /// required objects for them to be performed. Operations of models not
    /// tracked for push are left out; an operation pointing at a model
    /// that isn't tracked at all is an error.
    pub fn add_unversioned_operations(&mut self, db: &SyncDb) -> SyncResult<&mut Self> {
        let operations = db.with_store(|store| oplog::unversioned_operations(store))?;
        let untracked = operations
            .iter()
            .find(|op| db.with_registry(|reg| reg.by_id(op.content_type_id).is_none()));
        if let Some(op) = untracked {
            return Err(Error::Registry(format!(
                "operation linked to model not currently being tracked: content type {}",
                op.content_type_id
            )));
        }
        for op in operations {
            let model = db.with_registry(|reg| reg.require_by_id(op.content_type_id))?;
            if !db.with_registry(|reg| reg.is_pushed(&model.model_name)) {
                continue;
            }
            if op.command != Command::Delete {
                let row = db.with_store(|store| store.get(&model.table_name, &op.row_id))?;
                if let Some(mut row) = row {
                    db.with_extensions(|ext| {
                        ext.call_before_client_add_object(&model.model_name, &op, &row)?;
                        ext.load_fields(&model.model_name, &mut row)
                    })?;
                    self.payload.add_object(&model.model_name, op.row_id, row);
                }
            }
            self.operations.push(op);
        }
        if self.key.is_some() {
            // overwrite since it's probably an incorrect key
            self.sign();
        }
        Ok(self)
    }

    /// Sets the node and key for this message.
    pub fn set_node(&mut self, node: &Node) {
        self.node_id = Some(node.node_id);
        self.secret = Some(node.secret.clone());
        self.sign();
    }

    /// Part of this message covered by the signature, in operation order.
    fn portion(&self) -> String {
        self.operations
            .iter()
            .map(|op| format!("&{}#{}#{}", op.row_id.portion(), op.content_type_id, op.command))
            .collect()
    }

    fn sign(&mut self) {
        if let Some(secret) = &self.secret {
            let text = format!("{}{}", secret, self.portion());
            self.key = Some(hex::encode(Sha512::digest(text.as_bytes())));
        }
    }

    /// Checks whether the key for this message is proper, against the
    /// node's stored secret.
    pub fn islegit(&self, db: &SyncDb) -> SyncResult<bool> {
        let (key, node_id) = match (&self.key, self.node_id) {
            (Some(key), Some(node_id)) => (key, node_id),
            _ => return Ok(false),
        };
        let node = db
            .with_store(|store| oplog::node_by_id(store, node_id))?
            .ok_or_else(|| Error::PushRejected(format!("node with id {} not found", node_id)))?;
        let text = format!("{}{}", node.secret, self.portion());
        let digest = hex::encode(Sha512::digest(text.as_bytes()));
        Ok(constant_time_eq(key, &digest))
    }

    /// JSON-friendly structure:
    ///
    /// ```text
    /// created: [y,m,d,h,mi,s,us],
    /// node_id: node primary key or null,
    /// key: a string generated from the secret and part of the message,
    /// latest_version_id: number or null,
    /// operations: list of operations,
    /// payload: dictionary with lists of objects mapped to model names
    /// ```
    pub fn encode(&self, db: &SyncDb) -> SyncResult<Json> {
        let mut map = Map::new();
        map.insert("created".into(), encode_created(&self.created));
        map.insert("node_id".into(), encode_optional_u32(self.node_id));
        map.insert("key".into(), self.key.clone().map(Json::String).unwrap_or(Json::Null));
        map.insert("latest_version_id".into(), encode_optional_u32(self.latest_version_id));
        map.insert("operations".into(), Json::Array(self.operations.iter().map(encode_operation).collect()));
        map.insert("payload".into(), self.payload.encode(db)?);
        Ok(Json::Object(map))
    }

    pub fn decode(db: &SyncDb, value: &Json) -> SyncResult<PushMessage> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::BadResponse("push message isn't an object".into()))?;
        let operations = map
            .get("operations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::BadResponse("push message misses operations".into()))?
            .iter()
            .map(decode_operation)
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(PushMessage {
            created: decode_created(
                map.get("created").ok_or_else(|| Error::BadResponse("push message misses created".into()))?,
            )?,
            node_id: decode_optional_u32(map.get("node_id").unwrap_or(&Json::Null))?,
            key: map.get("key").and_then(|v| v.as_str()).map(|s| s.to_owned()),
            latest_version_id: decode_optional_u32(map.get("latest_version_id").unwrap_or(&Json::Null))?,
            operations,
            payload: Payload::decode(db, map.get("payload").unwrap_or(&Json::Null))?,
            secret: None,
        })
    }
}

impl ObjectContainer for PushMessage {
    fn lookup(&self, model_name: &str, pk: &RowKey) -> Option<&Row> {
        self.payload.get(model_name, pk)
    }

    fn container_max_pk(&self, model_name: &str) -> Option<i64> {
        self.payload.max_pk(model_name)
    }
}
