//! Synchronization messages and their payload container.

pub mod pull;
pub mod push;
pub mod register;

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use crate::codec::{decode_row, encode_key, encode_row};
use crate::db::SyncDb;
use crate::error::{Error, SyncResult};
use crate::store::value::{row_key, Row, RowKey};

/// Dictionary of (model name, set of rows keyed by pk) carried by a
/// message: every row the receiver needs to perform the member operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    objects: BTreeMap<String, BTreeMap<RowKey, Row>>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.values().all(|set| set.is_empty())
    }

    /// Adds an object to the payload, if it's not already in.
    pub fn add_object(&mut self, model_name: &str, pk: RowKey, row: Row) {
        self.objects.entry(model_name.to_owned()).or_default().entry(pk).or_insert(row);
    }

    pub fn get(&self, model_name: &str, pk: &RowKey) -> Option<&Row> {
        self.objects.get(model_name).and_then(|set| set.get(pk))
    }

    pub fn rows<'a>(&'a self, model_name: &str) -> impl Iterator<Item = (&'a RowKey, &'a Row)> + 'a {
        self.objects.get(model_name).into_iter().flatten()
    }

    pub fn object_count(&self) -> usize {
        self.objects.values().map(|set| set.len()).sum()
    }

    /// Maximum integer pk carried for the model, if any.
    pub fn max_pk(&self, model_name: &str) -> Option<i64> {
        self.objects
            .get(model_name)?
            .keys()
            .filter_map(|k| match k {
                RowKey::Int(i) => Some(*i),
                RowKey::Guid(_) => None,
            })
            .max()
    }

    /// `{ modelName: [ objectRecord ] }`; each record carries
    /// `__model_name__`, `__pk__` and the column map.
    pub fn encode(&self, db: &SyncDb) -> SyncResult<Json> {
        let mut out = Map::new();
        for (model_name, set) in &self.objects {
            let table_name = db
                .with_registry(|reg| reg.by_model(model_name).map(|m| m.table_name.clone()))
                .ok_or_else(|| Error::Registry(format!("model {} isn't being tracked", model_name)))?;
            let def = db.schema().table(&table_name)?;
            let mut records = Vec::with_capacity(set.len());
            for (pk, row) in set {
                let mut record = encode_row(def, row);
                record.insert("__model_name__".into(), Json::String(model_name.clone()));
                record.insert("__pk__".into(), encode_key(pk));
                records.push(Json::Object(record));
            }
            out.insert(model_name.clone(), Json::Array(records));
        }
        Ok(Json::Object(out))
    }

    /// Unknown model names are dropped at parse.
    pub fn decode(db: &SyncDb, value: &Json) -> SyncResult<Payload> {
        let mut payload = Payload::new();
        let map = match value.as_object() {
            Some(map) => map,
            None => return Ok(payload),
        };
        for (model_name, records) in map {
            let table_name = match db.with_registry(|reg| reg.by_model(model_name).map(|m| m.table_name.clone())) {
                Some(t) => t,
                None => continue,
            };
            let def = db.schema().table(&table_name)?;
            let records = records
                .as_array()
                .ok_or_else(|| Error::BadResponse(format!("payload of {} isn't a list", model_name)))?;
            for record in records {
                let record = record
                    .as_object()
                    .ok_or_else(|| Error::BadResponse(format!("payload row of {} isn't an object", model_name)))?;
                let row = decode_row(def, record)?;
                let pk = row_key(&row, &def.primary_key)?;
                payload.add_object(model_name, pk, row);
            }
        }
        Ok(payload)
    }
}

/// Read access to the rows a message carries, used by operation apply to
/// look up the required data.
pub trait ObjectContainer: Sync {
    fn lookup(&self, model_name: &str, pk: &RowKey) -> Option<&Row>;

    /// Maximum integer pk the container carries for the model.
    fn container_max_pk(&self, model_name: &str) -> Option<i64>;
}
