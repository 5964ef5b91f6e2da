//! Internal records used to keep track of versions and operations, and the
//! ordered log access over the four `sync_*` tables.

use chrono::{NaiveDateTime, Timelike, Utc};
use rand::Rng;

use crate::error::{Error, SyncResult};
use crate::registry::ModelRegistry;
use crate::store::engine::SqlStore;
use crate::store::schema::{ColumnType, TableDef};
use crate::store::value::{Row, RowKey, Value};

/// Prefix of every internal table.
pub const TABLE_PREFIX: &str = "sync_";

pub const CONTENT_TYPES_TABLE: &str = "sync_content_types";
pub const NODES_TABLE: &str = "sync_nodes";
pub const VERSIONS_TABLE: &str = "sync_versions";
pub const OPERATIONS_TABLE: &str = "sync_operations";

/// Table definitions of the persisted sync state. Merged into the user
/// schema when a database handle is opened.
pub fn internal_tables() -> Vec<TableDef> {
    vec![
        TableDef::new(CONTENT_TYPES_TABLE, "content_type_id")
            .column_not_null("content_type_id", ColumnType::BigInt)
            .column("table_name", ColumnType::Text)
            .column("model_name", ColumnType::Text),
        TableDef::new(NODES_TABLE, "node_id")
            .column_not_null("node_id", ColumnType::Integer)
            .column("registered_at", ColumnType::DateTime)
            .column("registry_user_id", ColumnType::Integer)
            .column("secret", ColumnType::Text),
        TableDef::new(VERSIONS_TABLE, "version_id")
            .column_not_null("version_id", ColumnType::Integer)
            .column("node_id", ColumnType::Integer)
            .column("created_at", ColumnType::DateTime),
        TableDef::new(OPERATIONS_TABLE, "order")
            .column_not_null("order", ColumnType::Integer)
            .column_not_null("row_id", ColumnType::Text)
            .column("version_id", ColumnType::Integer)
            .column_not_null("content_type_id", ColumnType::BigInt)
            .column_not_null("command", ColumnType::Text),
    ]
}

/// A database operation: insert, update or delete of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Insert,
    Update,
    Delete,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Insert => "i",
            Command::Update => "u",
            Command::Delete => "d",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Command> {
        match s {
            "i" => Ok(Command::Insert),
            "u" => Ok(Command::Update),
            "d" => Ok(Command::Delete),
            other => Err(Error::Operation(format!(
                "the operation doesn't specify a valid command ('i', 'u', 'd'): {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A weak abstraction over a database table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub content_type_id: u32,
    pub table_name: String,
    pub model_name: String,
}

/// A node registry entry. A node is a client application installed
/// somewhere else; the client keeps only its latest registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub node_id: u32,
    pub registered_at: NaiveDateTime,
    pub registry_user_id: Option<u32>,
    pub secret: String,
}

impl Node {
    /// Server-issued shared secret used to sign push messages.
    pub fn generate_secret(length: usize) -> String {
        const CHARS: &[u8] = b"0123456789\
            abcdefghijklmnopqrstuvwxyz\
            ABCDEFGHIJKLMNOPQRSTUVWXYZ\
            .,_-+*@:;[](){}~!?|<>=/\\&$#";
        let mut rng = rand::thread_rng();
        (0..length).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
    }
}

/// A database version, added for each push accepted and executed without
/// problems. Born only on the server; mirrored to clients during pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub version_id: u32,
    pub node_id: Option<u32>,
    pub created_at: NaiveDateTime,
}

/// One row-level change. Immutable once recorded, except for the
/// `version_id` assignment when a push succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub row_id: RowKey,
    pub version_id: Option<u32>,
    pub content_type_id: u32,
    pub command: Command,
    pub order: u32,
}

impl Operation {
    /// Whether this operation references the given row of the given table.
    pub fn references(&self, registry: &ModelRegistry, table: &str, key: &RowKey) -> bool {
        self.row_id == *key
            && registry.by_id(self.content_type_id).map(|m| m.table_name == table).unwrap_or(false)
    }
}

fn get_u32(row: &Row, column: &str) -> SyncResult<Option<u32>> {
    match row.get(column) {
        Some(Value::Int(i)) => Ok(Some(*i as u32)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(Error::Store(format!("column {} holds {:?}, expected integer", column, other))),
    }
}

fn require_u32(row: &Row, column: &str) -> SyncResult<u32> {
    get_u32(row, column)?.ok_or_else(|| Error::Store(format!("column {} is null", column)))
}

fn get_text(row: &Row, column: &str) -> SyncResult<String> {
    match row.get(column) {
        Some(Value::Text(s)) => Ok(s.clone()),
        other => Err(Error::Store(format!("column {} holds {:?}, expected text", column, other))),
    }
}

fn get_datetime(row: &Row, column: &str) -> SyncResult<NaiveDateTime> {
    match row.get(column) {
        Some(Value::DateTime(dt)) => Ok(*dt),
        other => Err(Error::Store(format!("column {} holds {:?}, expected datetime", column, other))),
    }
}

fn opt_int(v: Option<u32>) -> Value {
    v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null)
}

impl Operation {
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("order".into(), Value::Int(self.order as i64));
        row.insert("row_id".into(), Value::Text(self.row_id.portion()));
        row.insert("version_id".into(), opt_int(self.version_id));
        row.insert("content_type_id".into(), Value::Int(self.content_type_id as i64));
        row.insert("command".into(), Value::Text(self.command.as_str().into()));
        row
    }

    pub fn from_row(row: &Row) -> SyncResult<Operation> {
        Ok(Operation {
            row_id: RowKey::parse(&get_text(row, "row_id")?)?,
            version_id: get_u32(row, "version_id")?,
            content_type_id: require_u32(row, "content_type_id")?,
            command: Command::from_str(&get_text(row, "command")?)?,
            order: require_u32(row, "order")?,
        })
    }
}

impl Version {
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("version_id".into(), Value::Int(self.version_id as i64));
        row.insert("node_id".into(), opt_int(self.node_id));
        row.insert("created_at".into(), Value::DateTime(self.created_at));
        row
    }

    pub fn from_row(row: &Row) -> SyncResult<Version> {
        Ok(Version {
            version_id: require_u32(row, "version_id")?,
            node_id: get_u32(row, "node_id")?,
            created_at: get_datetime(row, "created_at")?,
        })
    }
}

impl Node {
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("node_id".into(), Value::Int(self.node_id as i64));
        row.insert("registered_at".into(), Value::DateTime(self.registered_at));
        row.insert("registry_user_id".into(), opt_int(self.registry_user_id));
        row.insert("secret".into(), Value::Text(self.secret.clone()));
        row
    }

    pub fn from_row(row: &Row) -> SyncResult<Node> {
        Ok(Node {
            node_id: require_u32(row, "node_id")?,
            registered_at: get_datetime(row, "registered_at")?,
            registry_user_id: get_u32(row, "registry_user_id")?,
            secret: get_text(row, "secret")?,
        })
    }
}

impl ContentType {
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("content_type_id".into(), Value::Int(self.content_type_id as i64));
        row.insert("table_name".into(), Value::Text(self.table_name.clone()));
        row.insert("model_name".into(), Value::Text(self.model_name.clone()));
        row
    }
}

/// Current timestamp, truncated to the microsecond precision the wire
/// format carries.
pub fn now() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000).unwrap_or(now)
}

// Log access. All functions take the raw store; callers hold the lock.

/// All operations in ascending `order`.
pub fn all_operations(store: &dyn SqlStore) -> SyncResult<Vec<Operation>> {
    let mut ops = store
        .scan(OPERATIONS_TABLE)?
        .iter()
        .map(|(_, row)| Operation::from_row(row))
        .collect::<SyncResult<Vec<_>>>()?;
    ops.sort_by_key(|op| op.order);
    Ok(ops)
}

/// The unversioned tail of the local log, in ascending `order`.
pub fn unversioned_operations(store: &dyn SqlStore) -> SyncResult<Vec<Operation>> {
    Ok(all_operations(store)?.into_iter().filter(|op| op.version_id.is_none()).collect())
}

/// Operations with `version_id` greater than the given watermark.
pub fn operations_after(store: &dyn SqlStore, version_id: Option<u32>) -> SyncResult<Vec<Operation>> {
    Ok(all_operations(store)?
        .into_iter()
        .filter(|op| match (op.version_id, version_id) {
            (Some(v), Some(after)) => v > after,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .collect())
}

pub fn next_order(store: &dyn SqlStore) -> SyncResult<u32> {
    Ok(store.max_pk(OPERATIONS_TABLE)?.map(|m| m as u32 + 1).unwrap_or(1))
}

pub fn append_operation(store: &mut dyn SqlStore, op: &Operation) -> SyncResult<()> {
    store.insert(OPERATIONS_TABLE, op.to_row())
}

/// Rewrites the operation stored under `op.order`.
pub fn update_operation(store: &mut dyn SqlStore, op: &Operation) -> SyncResult<()> {
    store.update(OPERATIONS_TABLE, &RowKey::Int(op.order as i64), op.to_row())
}

pub fn delete_operation(store: &mut dyn SqlStore, order: u32) -> SyncResult<()> {
    store.delete(OPERATIONS_TABLE, &RowKey::Int(order as i64))?;
    Ok(())
}

/// Moves an operation from `old_order` to `op.order`. The order column is
/// the log's primary key, so this is a keyed move, not an update.
pub fn move_operation(store: &mut dyn SqlStore, old_order: u32, op: &Operation) -> SyncResult<()> {
    store.delete(OPERATIONS_TABLE, &RowKey::Int(old_order as i64))?;
    store.insert(OPERATIONS_TABLE, op.to_row())
}

/// Returns the latest version identifier, or `None` if no version exists.
pub fn latest_version_id(store: &dyn SqlStore) -> SyncResult<Option<u32>> {
    // version identifiers grow monotonically, so the max pk is the latest
    Ok(store.max_pk(VERSIONS_TABLE)?.map(|v| v as u32))
}

pub fn next_version_id(store: &dyn SqlStore) -> SyncResult<u32> {
    Ok(latest_version_id(store)?.map(|v| v + 1).unwrap_or(1))
}

pub fn insert_version(store: &mut dyn SqlStore, version: &Version) -> SyncResult<()> {
    let key = RowKey::Int(version.version_id as i64);
    if store.get(VERSIONS_TABLE, &key)?.is_some() {
        // already mirrored by an earlier pull
        return Ok(());
    }
    store.insert(VERSIONS_TABLE, version.to_row())
}

pub fn versions_after(store: &dyn SqlStore, version_id: Option<u32>) -> SyncResult<Vec<Version>> {
    let mut versions = store
        .scan(VERSIONS_TABLE)?
        .iter()
        .map(|(_, row)| Version::from_row(row))
        .collect::<SyncResult<Vec<_>>>()?;
    versions.sort_by_key(|v| v.version_id);
    Ok(versions
        .into_iter()
        .filter(|v| version_id.map(|after| v.version_id > after).unwrap_or(true))
        .collect())
}

/// The node register info for the actual client: its latest registration.
pub fn get_node(store: &dyn SqlStore) -> SyncResult<Option<Node>> {
    let rows = store.scan(NODES_TABLE)?;
    rows.iter().map(|(_, row)| Node::from_row(row)).collect::<SyncResult<Vec<_>>>().map(|mut nodes| {
        nodes.sort_by_key(|n| n.node_id);
        nodes.pop()
    })
}

pub fn node_by_id(store: &dyn SqlStore, node_id: u32) -> SyncResult<Option<Node>> {
    match store.get(NODES_TABLE, &RowKey::Int(node_id as i64))? {
        Some(row) => Ok(Some(Node::from_row(&row)?)),
        None => Ok(None),
    }
}

/// Save node info into the database without a server request.
pub fn save_node(store: &mut dyn SqlStore, node: &Node) -> SyncResult<()> {
    store.insert(NODES_TABLE, node.to_row())
}

pub fn next_node_id(store: &dyn SqlStore) -> SyncResult<u32> {
    Ok(store.max_pk(NODES_TABLE)?.map(|m| m as u32 + 1).unwrap_or(1))
}

/// Fills the content type table from the registry, idempotently.
pub fn generate_content_types(store: &mut dyn SqlStore, registry: &ModelRegistry) -> SyncResult<()> {
    for model in registry.models() {
        let key = RowKey::Int(model.content_type_id as i64);
        if store.get(CONTENT_TYPES_TABLE, &key)?.is_none() {
            let ct = ContentType {
                content_type_id: model.content_type_id,
                table_name: model.table_name.clone(),
                model_name: model.model_name.clone(),
            };
            store.insert(CONTENT_TYPES_TABLE, ct.to_row())?;
        }
    }
    Ok(())
}

/// Whether the given tracked row is synched: its last operation, if any,
/// has been versioned.
pub fn is_synched(store: &dyn SqlStore, content_type_id: u32, key: &RowKey) -> SyncResult<bool> {
    let last = all_operations(store)?
        .into_iter()
        .filter(|op| op.content_type_id == content_type_id && op.row_id == *key)
        .last();
    Ok(last.map(|op| op.version_id.is_some()).unwrap_or(true))
}
