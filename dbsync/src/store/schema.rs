use std::collections::BTreeMap;

use crate::error::{Error, SyncResult};

/// Column types the codec and the store understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    Float,
    Decimal,
    Text,
    Bool,
    Date,
    DateTime,
    Time,
    Binary,
    Guid,
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// A single-column foreign key: `column` points at `ref_table.ref_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

/// Table description: the slice of DDL the sync core needs to see.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: String,
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Unique constraints as column sets, primary key excluded.
    pub uniques: Vec<Vec<String>>,
}

impl TableDef {
    pub fn new(name: &str, primary_key: &str) -> Self {
        Self {
            name: name.to_owned(),
            columns: Vec::new(),
            primary_key: primary_key.to_owned(),
            foreign_keys: Vec::new(),
            uniques: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef { name: name.to_owned(), ty, nullable: true });
        self
    }

    pub fn column_not_null(mut self, name: &str, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef { name: name.to_owned(), ty, nullable: false });
        self
    }

    pub fn foreign_key(mut self, column: &str, ref_table: &str, ref_column: &str) -> Self {
        self.foreign_keys.push(ForeignKeyDef {
            column: column.to_owned(),
            ref_table: ref_table.to_owned(),
            ref_column: ref_column.to_owned(),
        });
        self
    }

    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.uniques.push(columns.iter().map(|c| (*c).to_owned()).collect());
        self
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn pk_column(&self) -> SyncResult<&ColumnDef> {
        self.column_def(&self.primary_key)
            .ok_or_else(|| Error::Registry(format!("table {} has no pk column {}", self.name, self.primary_key)))
    }
}

/// The set of tables visible to the engine, user tables and the internal
/// `sync_*` tables alike.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: BTreeMap<String, TableDef>,
}

impl Schema {
    pub fn new(tables: Vec<TableDef>) -> Self {
        let mut map = BTreeMap::new();
        for t in tables {
            map.insert(t.name.clone(), t);
        }
        Self { tables: map }
    }

    pub fn add_table(&mut self, table: TableDef) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn table(&self, name: &str) -> SyncResult<&TableDef> {
        self.tables.get(name).ok_or_else(|| Error::Registry(format!("unknown table {}", name)))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    /// All (table, fk) pairs whose foreign key points at `target`.
    pub fn referencing(&self, target: &str) -> Vec<(&TableDef, &ForeignKeyDef)> {
        self.tables
            .values()
            .flat_map(|t| t.foreign_keys.iter().map(move |fk| (t, fk)))
            .filter(|(_, fk)| fk.ref_table == target)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Schema {
        Schema::new(vec![
            TableDef::new("test_a", "id").column_not_null("id", ColumnType::Guid).column("name", ColumnType::Text),
            TableDef::new("test_b", "id")
                .column_not_null("id", ColumnType::Guid)
                .column("name", ColumnType::Text)
                .column("a_id", ColumnType::Guid)
                .foreign_key("a_id", "test_a", "id"),
        ])
    }

    #[test]
    fn referencing_walks_fks() {
        let schema = sample();
        let refs = schema.referencing("test_a");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0.name, "test_b");
        assert_eq!(refs[0].1.column, "a_id");
        assert!(schema.referencing("test_b").is_empty());
    }

    #[test]
    fn unknown_table_is_an_error() {
        assert!(sample().table("nope").is_err());
    }
}
