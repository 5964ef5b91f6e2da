use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Error, SyncResult};
use crate::store::schema::ColumnType;

/// A typed column value. One variant per [`ColumnType`], plus `Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    Bytes(Vec<u8>),
    Guid(Uuid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may be stored in a column of the given type.
    pub fn matches(&self, ty: ColumnType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Bool(_), ColumnType::Bool) => true,
            (Value::Int(_), ColumnType::Integer | ColumnType::BigInt) => true,
            (Value::Float(_), ColumnType::Float) => true,
            (Value::Decimal(_), ColumnType::Decimal) => true,
            (Value::Text(_), ColumnType::Text) => true,
            (Value::Date(_), ColumnType::Date) => true,
            (Value::DateTime(_), ColumnType::DateTime) => true,
            (Value::Time(_), ColumnType::Time) => true,
            (Value::Bytes(_), ColumnType::Binary) => true,
            (Value::Guid(_), ColumnType::Guid) => true,
            _ => false,
        }
    }
}

/// A materialized row: column name to value, deterministically ordered.
pub type Row = BTreeMap<String, Value>;

/// Primary key of a tracked row. GUIDs are preferred; integers are kept for
/// stores whose server allocates numeric ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKey {
    Int(i64),
    Guid(Uuid),
}

impl RowKey {
    pub fn from_value(value: &Value) -> SyncResult<RowKey> {
        match value {
            Value::Int(i) => Ok(RowKey::Int(*i)),
            Value::Guid(g) => Ok(RowKey::Guid(*g)),
            other => Err(Error::Store(format!("value {:?} can't be used as a row key", other))),
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            RowKey::Int(i) => Value::Int(i),
            RowKey::Guid(g) => Value::Guid(g),
        }
    }

    /// The signing form: integers as decimal, GUIDs as 32 lowercase hex chars.
    pub fn portion(&self) -> String {
        match self {
            RowKey::Int(i) => i.to_string(),
            RowKey::Guid(g) => format!("{:032x}", g.as_u128()),
        }
    }

    /// Parses the portable string form produced by [`RowKey::portion`]:
    /// 32 hex chars are a GUID, anything else an integer.
    pub fn parse(s: &str) -> SyncResult<RowKey> {
        if s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let raw = u128::from_str_radix(s, 16)
                .map_err(|e| Error::Store(format!("bad guid row key {}: {}", s, e)))?;
            return Ok(RowKey::Guid(Uuid::from_u128(raw)));
        }
        s.parse::<i64>()
            .map(RowKey::Int)
            .map_err(|e| Error::Store(format!("bad row key {}: {}", s, e)))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (RowKey::Int(a), RowKey::Int(b)) => a.cmp(b),
            (RowKey::Guid(a), RowKey::Guid(b)) => a.cmp(b),
            (RowKey::Int(_), RowKey::Guid(_)) => Ordering::Less,
            (RowKey::Guid(_), RowKey::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowKey::Int(i) => write!(f, "{}", i),
            RowKey::Guid(g) => write!(f, "{:032x}", g.as_u128()),
        }
    }
}

/// Extracts the primary key of `row` under the table's pk column.
pub fn row_key(row: &Row, pk_column: &str) -> SyncResult<RowKey> {
    let value = row
        .get(pk_column)
        .ok_or_else(|| Error::Store(format!("row is missing pk column {}", pk_column)))?;
    RowKey::from_value(value)
}
