use std::collections::BTreeMap;

use crate::error::{Error, SyncResult};
use crate::store::engine::SqlStore;
use crate::store::schema::{Schema, TableDef};
use crate::store::value::{row_key, Row, RowKey, Value};

type Tables = BTreeMap<String, BTreeMap<RowKey, Row>>;

/// In-memory reference store: BTreeMap tables with NOT NULL, unique and
/// foreign-key enforcement, a deferred-FK mode, and snapshot-based atomic
/// transactions. Nothing is persisted; durability belongs to the real SQL
/// engine this stands in for.
pub struct MemoryStore {
    schema: Schema,
    tables: Tables,
    txn: Option<Txn>,
}

struct Txn {
    snapshot: Tables,
    defer_fk: bool,
}

impl MemoryStore {
    pub fn new(schema: Schema) -> Self {
        let mut tables = BTreeMap::new();
        for t in schema.tables() {
            tables.insert(t.name.clone(), BTreeMap::new());
        }
        Self { schema, tables, txn: None }
    }

    fn table_def(&self, table: &str) -> SyncResult<&TableDef> {
        self.schema.table(table)
    }

    fn rows(&self, table: &str) -> SyncResult<&BTreeMap<RowKey, Row>> {
        self.tables.get(table).ok_or_else(|| Error::Store(format!("unknown table {}", table)))
    }

    fn rows_mut(&mut self, table: &str) -> SyncResult<&mut BTreeMap<RowKey, Row>> {
        self.tables.get_mut(table).ok_or_else(|| Error::Store(format!("unknown table {}", table)))
    }

    fn defer_fk(&self) -> bool {
        self.txn.as_ref().map(|t| t.defer_fk).unwrap_or(false)
    }

    /// Fills absent nullable columns with Null and checks types and NOT NULL.
    fn normalize(&self, def: &TableDef, mut row: Row) -> SyncResult<Row> {
        for name in row.keys() {
            if def.column_def(name).is_none() {
                return Err(Error::Store(format!("unknown column {} in table {}", name, def.name)));
            }
        }
        for col in &def.columns {
            let value = row.entry(col.name.clone()).or_insert(Value::Null);
            if value.is_null() {
                if !col.nullable {
                    return Err(Error::Store(format!(
                        "column {}.{} may not be null",
                        def.name, col.name
                    )));
                }
            } else if !value.matches(col.ty) {
                return Err(Error::Store(format!(
                    "column {}.{} expects {:?}, got {:?}",
                    def.name, col.name, col.ty, value
                )));
            }
        }
        Ok(row)
    }

    fn check_row_fks(&self, def: &TableDef, row: &Row) -> SyncResult<()> {
        for fk in &def.foreign_keys {
            let value = match row.get(&fk.column) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };
            let parent_key = RowKey::from_value(value)?;
            if !self.rows(&fk.ref_table)?.contains_key(&parent_key) {
                return Err(Error::Store(format!(
                    "foreign key {}.{} -> {}.{} has no parent {}",
                    def.name, fk.column, fk.ref_table, fk.ref_column, parent_key
                )));
            }
        }
        Ok(())
    }

    /// Rows in other tables that still point at (table, key).
    fn referencing_rows(&self, table: &str, key: &RowKey) -> SyncResult<Vec<(String, RowKey)>> {
        let target = key.to_value();
        let mut found = Vec::new();
        for (child, fk) in self.schema.referencing(table) {
            for (ck, crow) in self.rows(&child.name)? {
                if crow.get(&fk.column) == Some(&target) {
                    found.push((child.name.clone(), *ck));
                }
            }
        }
        Ok(found)
    }

    fn check_all_fks(&self) -> SyncResult<()> {
        for def in self.schema.tables() {
            for row in self.rows(&def.name)?.values() {
                self.check_row_fks(def, row)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl SqlStore for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn begin(&mut self, defer_fk: bool) -> SyncResult<()> {
        if self.txn.is_some() {
            return Err(Error::Serialization("transaction already open".into()));
        }
        self.txn = Some(Txn { snapshot: self.tables.clone(), defer_fk });
        Ok(())
    }

    fn commit(&mut self) -> SyncResult<()> {
        match &self.txn {
            Some(txn) => {
                if txn.defer_fk {
                    self.check_all_fks()?;
                }
                self.txn = None;
                Ok(())
            }
            None => Err(Error::Store("commit without open transaction".into())),
        }
    }

    fn rollback(&mut self) -> SyncResult<()> {
        match self.txn.take() {
            Some(txn) => {
                self.tables = txn.snapshot;
                Ok(())
            }
            None => Err(Error::Store("rollback without open transaction".into())),
        }
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn insert(&mut self, table: &str, row: Row) -> SyncResult<()> {
        let def = self.table_def(table)?.clone();
        let row = self.normalize(&def, row)?;
        let key = row_key(&row, &def.primary_key)?;
        if self.rows(table)?.contains_key(&key) {
            return Err(Error::Store(format!("duplicate primary key {} in {}", key, table)));
        }
        if let Some((other, columns)) = self.unique_collision(table, &row, None)? {
            return Err(Error::Store(format!(
                "unique constraint ({}) of {} violated by row {}",
                columns.join(", "),
                table,
                other
            )));
        }
        if !self.defer_fk() {
            self.check_row_fks(&def, &row)?;
        }
        self.rows_mut(table)?.insert(key, row);
        Ok(())
    }

    fn update(&mut self, table: &str, key: &RowKey, row: Row) -> SyncResult<()> {
        let def = self.table_def(table)?.clone();
        let row = self.normalize(&def, row)?;
        if row_key(&row, &def.primary_key)? != *key {
            return Err(Error::Store(format!("update may not change the pk of {} {}", table, key)));
        }
        if !self.rows(table)?.contains_key(key) {
            return Err(Error::Store(format!("no row {} in {} to update", key, table)));
        }
        if let Some((other, columns)) = self.unique_collision(table, &row, Some(key))? {
            return Err(Error::Store(format!(
                "unique constraint ({}) of {} violated by row {}",
                columns.join(", "),
                table,
                other
            )));
        }
        if !self.defer_fk() {
            self.check_row_fks(&def, &row)?;
        }
        self.rows_mut(table)?.insert(*key, row);
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &RowKey) -> SyncResult<bool> {
        self.table_def(table)?;
        if !self.rows(table)?.contains_key(key) {
            return Ok(false);
        }
        if !self.defer_fk() {
            let children = self.referencing_rows(table, key)?;
            if let Some((child, ck)) = children.first() {
                return Err(Error::Store(format!(
                    "row {} in {} is still referenced by {} {}",
                    key, table, child, ck
                )));
            }
        }
        Ok(self.rows_mut(table)?.remove(key).is_some())
    }

    fn get(&self, table: &str, key: &RowKey) -> SyncResult<Option<Row>> {
        Ok(self.rows(table)?.get(key).cloned())
    }

    fn scan(&self, table: &str) -> SyncResult<Vec<(RowKey, Row)>> {
        Ok(self.rows(table)?.iter().map(|(k, r)| (*k, r.clone())).collect())
    }

    fn count(&self, table: &str) -> SyncResult<usize> {
        Ok(self.rows(table)?.len())
    }

    fn max_pk(&self, table: &str) -> SyncResult<Option<i64>> {
        Ok(self
            .rows(table)?
            .keys()
            .filter_map(|k| match k {
                RowKey::Int(i) => Some(*i),
                RowKey::Guid(_) => None,
            })
            .max())
    }

    fn unique_collision(
        &self,
        table: &str,
        row: &Row,
        exclude: Option<&RowKey>,
    ) -> SyncResult<Option<(RowKey, Vec<String>)>> {
        let def = self.table_def(table)?;
        for unique in &def.uniques {
            // a constraint with any null member can't collide
            let values: Vec<_> = unique.iter().map(|c| row.get(c)).collect();
            if values.iter().any(|v| v.map(|v| v.is_null()).unwrap_or(true)) {
                continue;
            }
            for (key, stored) in self.rows(table)? {
                if Some(key) == exclude {
                    continue;
                }
                if unique.iter().zip(&values).all(|(c, v)| stored.get(c) == *v) {
                    return Ok(Some((*key, unique.clone())));
                }
            }
        }
        Ok(None)
    }
}
