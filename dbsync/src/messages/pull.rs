//! Pull message and the request that asks for one.

use serde_json::{json, Map, Value as Json};

use crate::codec::{decode_optional_u32, decode_value, encode_optional_u32, encode_value};
use crate::db::SyncDb;
use crate::error::{Error, SyncResult};
use crate::messages::push::{decode_operation, encode_operation};
use crate::messages::{ObjectContainer, Payload};
use crate::oplog::{Operation, Version};
use crate::store::schema::ColumnType;
use crate::store::value::{Row, RowKey, Value};

/// Server response to a pull request: the versions the client is missing,
/// their member operations, and a payload with every row any non-delete
/// operation needs, at its current state.
#[derive(Default)]
pub struct PullMessage {
    pub versions: Vec<Version>,
    pub operations: Vec<Operation>,
    pub payload: Payload,
}

fn encode_version(version: &Version) -> Json {
    json!({
        "version_id": version.version_id,
        "node_id": encode_optional_u32(version.node_id),
        "created_at": encode_value(&Value::DateTime(version.created_at)),
    })
}

fn decode_version(value: &Json) -> SyncResult<Version> {
    let map = value
        .as_object()
        .ok_or_else(|| Error::BadResponse(format!("version isn't an object: {}", value)))?;
    let created_at = match decode_value(
        ColumnType::DateTime,
        map.get("created_at").unwrap_or(&Json::Null),
    )? {
        Value::DateTime(dt) => dt,
        _ => return Err(Error::BadResponse("version misses created_at".into())),
    };
    Ok(Version {
        version_id: decode_optional_u32(map.get("version_id").unwrap_or(&Json::Null))?
            .ok_or_else(|| Error::BadResponse("version misses version_id".into()))?,
        node_id: decode_optional_u32(map.get("node_id").unwrap_or(&Json::Null))?,
        created_at,
    })
}

impl PullMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&self, db: &SyncDb) -> SyncResult<Json> {
        let mut map = Map::new();
        map.insert("versions".into(), Json::Array(self.versions.iter().map(encode_version).collect()));
        map.insert("operations".into(), Json::Array(self.operations.iter().map(encode_operation).collect()));
        map.insert("payload".into(), self.payload.encode(db)?);
        Ok(Json::Object(map))
    }

    pub fn decode(db: &SyncDb, value: &Json) -> SyncResult<PullMessage> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::BadResponse("pull message isn't an object".into()))?;
        let versions = map
            .get("versions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::BadResponse("pull message misses versions".into()))?
            .iter()
            .map(decode_version)
            .collect::<SyncResult<Vec<_>>>()?;
        let operations = map
            .get("operations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::BadResponse("pull message misses operations".into()))?
            .iter()
            .map(decode_operation)
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(PullMessage {
            versions,
            operations,
            payload: Payload::decode(db, map.get("payload").unwrap_or(&Json::Null))?,
        })
    }
}

impl ObjectContainer for PullMessage {
    fn lookup(&self, model_name: &str, pk: &RowKey) -> Option<&Row> {
        self.payload.get(model_name, pk)
    }

    fn container_max_pk(&self, model_name: &str) -> Option<i64> {
        self.payload.max_pk(model_name)
    }
}

/// The inverse request: the client's compressed operation list, used by
/// the server for conflict awareness only (it is never applied there),
/// plus free-form extra data.
#[derive(Default)]
pub struct PullRequestMessage {
    pub latest_version_id: Option<u32>,
    pub operations: Vec<Operation>,
    pub extra_data: Json,
}

impl PullRequestMessage {
    pub fn new(latest_version_id: Option<u32>, operations: Vec<Operation>, extra_data: Json) -> Self {
        PullRequestMessage { latest_version_id, operations, extra_data }
    }

    pub fn encode(&self) -> Json {
        json!({
            "latest_version_id": encode_optional_u32(self.latest_version_id),
            "operations": self.operations.iter().map(encode_operation).collect::<Vec<_>>(),
            "extra_data": self.extra_data,
        })
    }

    pub fn decode(value: &Json) -> SyncResult<PullRequestMessage> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::BadResponse("pull request isn't an object".into()))?;
        let operations = map
            .get("operations")
            .and_then(|v| v.as_array())
            .map(|ops| ops.iter().map(decode_operation).collect::<SyncResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(PullRequestMessage {
            latest_version_id: decode_optional_u32(map.get("latest_version_id").unwrap_or(&Json::Null))?,
            operations,
            extra_data: map.get("extra_data").cloned().unwrap_or(Json::Null),
        })
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::db::SyncMode;
    use crate::oplog::{self, Command};
    use crate::store::schema::{ColumnType, Schema, TableDef};

    fn db() -> SyncDb {
        let schema = Schema::new(vec![TableDef::new("test_a", "id")
            .column_not_null("id", ColumnType::Guid)
            .column("name", ColumnType::Text)]);
        let db = SyncDb::open(schema, SyncMode::Server);
        db.track("A", "test_a");
        db
    }

    #[test]
    fn pull_message_round_trips() -> SyncResult<()> {
        let db = db();
        let id = Uuid::new_v4();
        let mut message = PullMessage::new();
        message.versions.push(Version { version_id: 1, node_id: Some(3), created_at: oplog::now() });
        message.operations.push(Operation {
            row_id: RowKey::Guid(id),
            version_id: Some(1),
            content_type_id: db.with_registry(|r| r.by_model("A").unwrap().content_type_id),
            command: Command::Insert,
            order: 1,
        });
        let mut row = Row::new();
        row.insert("id".into(), Value::Guid(id));
        row.insert("name".into(), Value::Text("first a".into()));
        message.payload.add_object("A", RowKey::Guid(id), row);

        let encoded = message.encode(&db)?;
        let decoded = PullMessage::decode(&db, &encoded)?;
        assert_eq!(decoded.encode(&db)?, encoded);
        assert_eq!(decoded.versions, message.versions);
        assert_eq!(decoded.operations, message.operations);
        Ok(())
    }

    #[test]
    fn pull_request_round_trips() -> SyncResult<()> {
        let request = PullRequestMessage::new(
            Some(4),
            vec![Operation {
                row_id: RowKey::Int(7),
                version_id: None,
                content_type_id: 9,
                command: Command::Update,
                order: 2,
            }],
            json!({"user": "demo"}),
        );
        let decoded = PullRequestMessage::decode(&request.encode())?;
        assert_eq!(decoded.latest_version_id, Some(4));
        assert_eq!(decoded.operations, request.operations);
        assert_eq!(decoded.extra_data, request.extra_data);
        Ok(())
    }
}
