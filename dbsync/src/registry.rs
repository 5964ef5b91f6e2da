use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{Error, SyncResult};

/// Which sync procedures a tracked model takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

/// A model registered for synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedModel {
    pub model_name: String,
    pub table_name: String,
    pub content_type_id: u32,
}

/// Returns the content type id for the given model: the unsigned CRC-32 of
/// `"<ModelName>/<TableName>"`. Stable across every node that installs the
/// same model, which makes it the sole cross-process identity for a table.
pub fn make_content_type_id(model_name: &str, table_name: &str) -> u32 {
    crc32fast::hash(format!("{}/{}", model_name, table_name).as_bytes())
}

/// The set of models participating in synchronization, indexed by model
/// name, table name and content type id. Anything not registered here is
/// invisible to tracking and to message parsing.
#[derive(Default)]
pub struct ModelRegistry {
    by_model: BTreeMap<String, Arc<TrackedModel>>,
    by_table: BTreeMap<String, Arc<TrackedModel>>,
    by_id: BTreeMap<u32, Arc<TrackedModel>>,
    pushed: BTreeSet<String>,
    pulled: BTreeSet<String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a model under all lookup keys. Installing the same model
    /// twice is a no-op, so `track` may be called repeatedly.
    pub fn install(&mut self, model_name: &str, table_name: &str, directions: &[Direction]) {
        if directions.contains(&Direction::Pull) {
            self.pulled.insert(model_name.to_owned());
        }
        if directions.contains(&Direction::Push) {
            self.pushed.insert(model_name.to_owned());
        }
        if self.by_model.contains_key(model_name) {
            return;
        }
        let record = Arc::new(TrackedModel {
            model_name: model_name.to_owned(),
            table_name: table_name.to_owned(),
            content_type_id: make_content_type_id(model_name, table_name),
        });
        self.by_model.insert(model_name.to_owned(), record.clone());
        self.by_table.insert(table_name.to_owned(), record.clone());
        self.by_id.insert(record.content_type_id, record);
    }

    pub fn by_model(&self, model_name: &str) -> Option<Arc<TrackedModel>> {
        self.by_model.get(model_name).cloned()
    }

    pub fn by_table(&self, table_name: &str) -> Option<Arc<TrackedModel>> {
        self.by_table.get(table_name).cloned()
    }

    pub fn by_id(&self, content_type_id: u32) -> Option<Arc<TrackedModel>> {
        self.by_id.get(&content_type_id).cloned()
    }

    pub fn require_by_id(&self, content_type_id: u32) -> SyncResult<Arc<TrackedModel>> {
        self.by_id(content_type_id)
            .ok_or_else(|| Error::Registry(format!("no tracked model for content type {}", content_type_id)))
    }

    /// The content type id of a table, if it is tracked.
    pub fn table_id(&self, table_name: &str) -> Option<u32> {
        self.by_table.get(table_name).map(|r| r.content_type_id)
    }

    pub fn is_pushed(&self, model_name: &str) -> bool {
        self.pushed.contains(model_name)
    }

    pub fn is_pulled(&self, model_name: &str) -> bool {
        self.pulled.contains(model_name)
    }

    pub fn content_type_ids(&self) -> BTreeSet<u32> {
        self.by_id.keys().copied().collect()
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<TrackedModel>> {
        self.by_model.values()
    }
}
