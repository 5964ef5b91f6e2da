//! Encoding and decoding of column values to a transport-neutral JSON
//! value tree. Conversion is driven by the column type on the decode side;
//! the round-trip law `decode(encode(x)) == x` holds for every tracked
//! column type.
//!
//! Wire forms: dates `[y,m,d]`; datetimes `[y,m,d,h,mi,s,us]`; times
//! `[h,mi,s,us]`; binary as standard base64; decimals as decimal strings;
//! GUIDs as 32 lowercase hex chars; everything else as-is.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value as Json};
use uuid::Uuid;

use crate::error::{Error, SyncResult};
use crate::store::schema::{ColumnType, TableDef};
use crate::store::value::{Row, RowKey, Value};

pub fn encode_value(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Decimal(d) => json!(d.to_string()),
        Value::Text(s) => json!(s),
        Value::Date(d) => json!([d.year(), d.month(), d.day()]),
        Value::DateTime(dt) => json!([
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
            dt.nanosecond() / 1_000,
        ]),
        Value::Time(t) => json!([t.hour(), t.minute(), t.second(), t.nanosecond() / 1_000]),
        Value::Bytes(b) => json!(BASE64.encode(b)),
        Value::Guid(g) => json!(format!("{:032x}", g.as_u128())),
    }
}

fn parts(value: &Json, n: usize, what: &str) -> SyncResult<Vec<i64>> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::BadResponse(format!("expected a {}-element array for {}", n, what)))?;
    if arr.len() != n {
        return Err(Error::BadResponse(format!("expected a {}-element array for {}", n, what)));
    }
    arr.iter()
        .map(|v| v.as_i64().ok_or_else(|| Error::BadResponse(format!("non-integer member in {}", what))))
        .collect()
}

fn bad(ty: ColumnType, value: &Json) -> Error {
    Error::BadResponse(format!("can't decode {} as {:?}", value, ty))
}

pub fn decode_value(ty: ColumnType, value: &Json) -> SyncResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match ty {
        ColumnType::Integer | ColumnType::BigInt => {
            value.as_i64().map(Value::Int).ok_or_else(|| bad(ty, value))
        }
        ColumnType::Float => value.as_f64().map(Value::Float).ok_or_else(|| bad(ty, value)),
        ColumnType::Bool => value.as_bool().map(Value::Bool).ok_or_else(|| bad(ty, value)),
        ColumnType::Text => value.as_str().map(|s| Value::Text(s.to_owned())).ok_or_else(|| bad(ty, value)),
        ColumnType::Decimal => {
            let s = value.as_str().ok_or_else(|| bad(ty, value))?;
            s.parse::<Decimal>().map(Value::Decimal).map_err(|_| bad(ty, value))
        }
        ColumnType::Date => {
            let p = parts(value, 3, "date")?;
            NaiveDate::from_ymd_opt(p[0] as i32, p[1] as u32, p[2] as u32)
                .map(Value::Date)
                .ok_or_else(|| bad(ty, value))
        }
        ColumnType::DateTime => {
            let p = parts(value, 7, "datetime")?;
            let date = NaiveDate::from_ymd_opt(p[0] as i32, p[1] as u32, p[2] as u32);
            let time = NaiveTime::from_hms_micro_opt(p[3] as u32, p[4] as u32, p[5] as u32, p[6] as u32);
            match (date, time) {
                (Some(d), Some(t)) => Ok(Value::DateTime(NaiveDateTime::new(d, t))),
                _ => Err(bad(ty, value)),
            }
        }
        ColumnType::Time => {
            let p = parts(value, 4, "time")?;
            NaiveTime::from_hms_micro_opt(p[0] as u32, p[1] as u32, p[2] as u32, p[3] as u32)
                .map(Value::Time)
                .ok_or_else(|| bad(ty, value))
        }
        ColumnType::Binary => {
            let s = value.as_str().ok_or_else(|| bad(ty, value))?;
            BASE64.decode(s).map(Value::Bytes).map_err(|_| bad(ty, value))
        }
        ColumnType::Guid => {
            let s = value.as_str().ok_or_else(|| bad(ty, value))?;
            match RowKey::parse(s)? {
                RowKey::Guid(g) => Ok(Value::Guid(g)),
                RowKey::Int(_) => Err(bad(ty, value)),
            }
        }
    }
}

/// Encodes a row under the table's column map.
pub fn encode_row(def: &TableDef, row: &Row) -> Map<String, Json> {
    let mut map = Map::new();
    for col in &def.columns {
        let value = row.get(&col.name).unwrap_or(&Value::Null);
        map.insert(col.name.clone(), encode_value(value));
    }
    map
}

/// Decodes a row under the table's column map; keys the table doesn't know
/// are dropped.
pub fn decode_row(def: &TableDef, map: &Map<String, Json>) -> SyncResult<Row> {
    let mut row = Row::new();
    for col in &def.columns {
        if let Some(raw) = map.get(&col.name) {
            row.insert(col.name.clone(), decode_value(col.ty, raw)?);
        }
    }
    Ok(row)
}

/// Row keys travel as their portable string form.
pub fn encode_key(key: &RowKey) -> Json {
    json!(key.portion())
}

pub fn decode_key(value: &Json) -> SyncResult<RowKey> {
    match value {
        Json::String(s) => RowKey::parse(s),
        Json::Number(n) => n
            .as_i64()
            .map(RowKey::Int)
            .ok_or_else(|| Error::BadResponse(format!("bad row key {}", value))),
        other => Err(Error::BadResponse(format!("bad row key {}", other))),
    }
}

pub fn encode_optional_u32(v: Option<u32>) -> Json {
    v.map(|i| json!(i)).unwrap_or(Json::Null)
}

pub fn decode_optional_u32(value: &Json) -> SyncResult<Option<u32>> {
    match value {
        Json::Null => Ok(None),
        Json::Number(n) => n
            .as_u64()
            .map(|v| Some(v as u32))
            .ok_or_else(|| Error::BadResponse(format!("bad integer {}", value))),
        other => Err(Error::BadResponse(format!("bad integer {}", other))),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::schema::TableDef;

    fn round_trip(ty: ColumnType, value: Value) {
        let encoded = encode_value(&value);
        // the tree must survive JSON text serialization as well
        let text = serde_json::to_string(&encoded).unwrap();
        let reparsed: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(decode_value(ty, &reparsed).unwrap(), value);
    }

    #[test]
    fn round_trip_every_column_type() {
        round_trip(ColumnType::Integer, Value::Int(-42));
        round_trip(ColumnType::BigInt, Value::Int(1 << 40));
        round_trip(ColumnType::Float, Value::Float(1.5));
        round_trip(ColumnType::Bool, Value::Bool(true));
        round_trip(ColumnType::Text, Value::Text("héllo".into()));
        round_trip(ColumnType::Decimal, Value::Decimal("123.450".parse().unwrap()));
        round_trip(ColumnType::Date, Value::Date(NaiveDate::from_ymd_opt(2014, 7, 3).unwrap()));
        round_trip(
            ColumnType::DateTime,
            Value::DateTime(
                NaiveDate::from_ymd_opt(2014, 7, 3)
                    .unwrap()
                    .and_time(NaiveTime::from_hms_micro_opt(23, 59, 58, 123456).unwrap()),
            ),
        );
        round_trip(ColumnType::Time, Value::Time(NaiveTime::from_hms_micro_opt(1, 2, 3, 4).unwrap()));
        round_trip(ColumnType::Binary, Value::Bytes(vec![0, 1, 2, 254, 255]));
        round_trip(ColumnType::Guid, Value::Guid(Uuid::new_v4()));
        round_trip(ColumnType::Guid, Value::Null);
    }

    #[test]
    fn date_forms() {
        let date = Value::Date(NaiveDate::from_ymd_opt(2014, 7, 3).unwrap());
        assert_eq!(encode_value(&date), json!([2014, 7, 3]));
        let time = Value::Time(NaiveTime::from_hms_micro_opt(10, 20, 30, 400).unwrap());
        assert_eq!(encode_value(&time), json!([10, 20, 30, 400]));
    }

    #[test]
    fn guids_are_32_hex_lowercase() {
        let guid = Uuid::from_u128(0xABCDEF);
        let encoded = encode_value(&Value::Guid(guid));
        let s = encoded.as_str().unwrap();
        assert_eq!(s.len(), 32);
        assert_eq!(s, s.to_lowercase());
    }

    #[test]
    fn unknown_columns_are_dropped_on_decode() -> SyncResult<()> {
        let def = TableDef::new("t", "id")
            .column_not_null("id", ColumnType::Integer)
            .column("name", ColumnType::Text);
        let mut map = Map::new();
        map.insert("id".into(), json!(1));
        map.insert("name".into(), json!("a"));
        map.insert("stranger".into(), json!("dropped"));
        let row = decode_row(&def, &map)?;
        assert_eq!(row.len(), 2);
        assert!(!row.contains_key("stranger"));
        Ok(())
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(decode_value(ColumnType::Date, &json!([2014, 7])).is_err());
        assert!(decode_value(ColumnType::Integer, &json!("seven")).is_err());
        assert!(decode_value(ColumnType::Binary, &json!("###not-base64###")).is_err());
    }
}
