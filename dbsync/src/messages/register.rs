//! Node registry message.
//!
//! Registration alone is vulnerable to many things; it should at least run
//! over an authenticated transport in production.

use serde_json::{json, Map, Value as Json};

use crate::codec::{decode_optional_u32, decode_value, encode_optional_u32, encode_value};
use crate::error::{Error, SyncResult};
use crate::oplog::Node;
use crate::store::schema::ColumnType;
use crate::store::value::Value;

/// Server response to a registration request.
pub struct RegisterMessage {
    pub node: Node,
}

impl RegisterMessage {
    pub fn encode(&self) -> Json {
        let mut node = Map::new();
        node.insert("node_id".into(), json!(self.node.node_id));
        node.insert("registered".into(), encode_value(&Value::DateTime(self.node.registered_at)));
        node.insert("registry_user_id".into(), encode_optional_u32(self.node.registry_user_id));
        node.insert("secret".into(), json!(self.node.secret));
        json!({ "node": node })
    }

    pub fn decode(value: &Json) -> SyncResult<RegisterMessage> {
        let node = value
            .get("node")
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::BadResponse("register message misses node".into()))?;
        let registered_at = match decode_value(
            ColumnType::DateTime,
            node.get("registered").unwrap_or(&Json::Null),
        )? {
            Value::DateTime(dt) => dt,
            _ => return Err(Error::BadResponse("node misses its registration time".into())),
        };
        Ok(RegisterMessage {
            node: Node {
                node_id: decode_optional_u32(node.get("node_id").unwrap_or(&Json::Null))?
                    .ok_or_else(|| Error::BadResponse("node misses node_id".into()))?,
                registered_at,
                registry_user_id: decode_optional_u32(node.get("registry_user_id").unwrap_or(&Json::Null))?,
                secret: node
                    .get("secret")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::BadResponse("node misses secret".into()))?
                    .to_owned(),
            },
        })
    }
}
