//! The demo schema shared by the `server` and `demo` subcommands: two
//! tracked models, one foreign key between them.

use dbsync_rs::db::{SyncDb, SyncMode};
use dbsync_rs::error::SyncResult;
use dbsync_rs::store::engine::SqlStore;
use dbsync_rs::store::schema::{ColumnType, Schema, TableDef};
use dbsync_rs::store::session::Session;
use dbsync_rs::store::value::{Row, Value};
use uuid::Uuid;

pub fn demo_schema() -> Schema {
    Schema::new(vec![
        TableDef::new("cities", "id")
            .column_not_null("id", ColumnType::Guid)
            .column("name", ColumnType::Text)
            .unique(&["name"]),
        TableDef::new("houses", "id")
            .column_not_null("id", ColumnType::Guid)
            .column("address", ColumnType::Text)
            .column("city_id", ColumnType::Guid)
            .foreign_key("city_id", "cities", "id"),
    ])
}

/// Opens a demo database and installs the tracked models.
pub fn open_demo_db(mode: SyncMode) -> SyncResult<SyncDb> {
    let db = SyncDb::open(demo_schema(), mode);
    db.track("City", "cities");
    db.track("House", "houses");
    db.generate_content_types()?;
    Ok(db)
}

/// Inserts `rows` houses in a fresh city and returns the city name.
pub fn add_demo_rows(db: &SyncDb, rows: usize) -> SyncResult<String> {
    let city_id = Uuid::new_v4();
    let city_name = format!("city-{}", &city_id.to_string()[..8]);
    let mut session = Session::begin(db)?;

    let mut city = Row::new();
    city.insert("id".into(), Value::Guid(city_id));
    city.insert("name".into(), Value::Text(city_name.clone()));
    session.insert("cities", city)?;

    for n in 0..rows {
        let mut house = Row::new();
        house.insert("id".into(), Value::Guid(Uuid::new_v4()));
        house.insert("address".into(), Value::Text(format!("{} main st", n + 1)));
        house.insert("city_id".into(), Value::Guid(city_id));
        session.insert("houses", house)?;
    }
    session.commit()?;
    Ok(city_name)
}

/// Row counts of the demo tables, for printing.
pub fn demo_counts(db: &SyncDb) -> SyncResult<(usize, usize)> {
    db.with_store(|store| Ok((store.count("cities")?, store.count("houses")?)))
}
