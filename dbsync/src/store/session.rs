//! Unit of work over the shared store. A session owns one store
//! transaction, buffers the operations captured by the change tracker, and
//! fires the tracking hooks on entity mutations. The internal flag marks
//! the sync engine's own replay sessions, whose writes are never re-tracked.

use crate::db::SyncDb;
use crate::error::{Error, SyncResult};
use crate::oplog::{self, Command, Operation};
use crate::store::engine::SqlStore;
use crate::store::value::{row_key, Row, RowKey, Value};
use crate::tracking;

pub struct Session {
    db: SyncDb,
    internal: bool,
    open: bool,
    /// Operations to be flushed to the log after commit (client mode).
    queue: Vec<Operation>,
    /// Objects with extension save procedures pending after commit.
    added: Vec<(String, Row)>,
    /// Objects with extension delete procedures pending after commit:
    /// (model, previous state, current state or None).
    deleted: Vec<(String, Row, Option<Row>)>,
}

impl Session {
    /// Begins a regular user session with immediate FK enforcement.
    pub fn begin(db: &SyncDb) -> SyncResult<Session> {
        Self::start(db, false, false)
    }

    /// Begins the engine's own replay session: FK checks deferred to
    /// commit, and nothing done here is picked up by the tracker.
    pub fn begin_internal(db: &SyncDb) -> SyncResult<Session> {
        Self::start(db, true, true)
    }

    fn start(db: &SyncDb, internal: bool, defer_fk: bool) -> SyncResult<Session> {
        db.with_store(|store| store.begin(defer_fk))?;
        Ok(Session {
            db: db.clone(),
            internal,
            open: true,
            queue: Vec::new(),
            added: Vec::new(),
            deleted: Vec::new(),
        })
    }

    pub fn db(&self) -> &SyncDb {
        &self.db
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn get(&self, table: &str, key: &RowKey) -> SyncResult<Option<Row>> {
        self.db.with_store(|store| store.get(table, key))
    }

    pub fn scan(&self, table: &str) -> SyncResult<Vec<(RowKey, Row)>> {
        self.db.with_store(|store| store.scan(table))
    }

    pub fn insert(&mut self, table: &str, row: Row) -> SyncResult<()> {
        self.db.with_store(|store| store.insert(table, row.clone()))?;
        self.note_added(table, &row);
        self.record(Command::Insert, table, &row, true, false)
    }

    pub fn update(&mut self, table: &str, row: Row) -> SyncResult<()> {
        self.update_with(table, row, false)
    }

    /// Like [`Session::update`] but records an operation even when the ORM
    /// reports no modified column.
    pub fn update_forced(&mut self, table: &str, row: Row) -> SyncResult<()> {
        self.update_with(table, row, true)
    }

    fn update_with(&mut self, table: &str, row: Row, force: bool) -> SyncResult<()> {
        let pk_column = self.db.schema().table(table)?.primary_key.clone();
        let key = row_key(&row, &pk_column)?;
        let old = self
            .get(table, &key)?
            .ok_or_else(|| Error::Store(format!("no row {} in {} to update", key, table)))?;
        let modified = old
            .iter()
            .any(|(column, value)| row.get(column).unwrap_or(&Value::Null) != value);
        self.db.with_store(|store| store.update(table, &key, row.clone()))?;
        self.note_added(table, &row);
        self.note_deleted(table, old, Some(row.clone()));
        self.record(Command::Update, table, &row, modified, force)
    }

    /// Deletes by pk. Absent rows are a no-op and leave no trace.
    pub fn delete(&mut self, table: &str, key: &RowKey) -> SyncResult<bool> {
        let old = match self.get(table, key)? {
            Some(row) => row,
            None => return Ok(false),
        };
        self.db.with_store(|store| store.delete(table, key))?;
        self.note_deleted(table, old.clone(), None);
        self.record(Command::Delete, table, &old, true, false)?;
        Ok(true)
    }

    /// Escape hatch for code that mutates rows behind the session's back:
    /// records an operation as if the tracker had seen the change.
    pub fn add_operation(&mut self, command: Command, table: &str, row: &Row, force: bool) -> SyncResult<()> {
        self.record(command, table, row, true, force)
    }

    fn record(&mut self, command: Command, table: &str, row: &Row, modified: bool, force: bool) -> SyncResult<()> {
        if self.internal {
            return Ok(());
        }
        tracking::track_change(&self.db, &mut self.queue, command, table, row, modified, force)
    }

    fn note_added(&mut self, table: &str, row: &Row) {
        if self.internal {
            return;
        }
        let model = self.model_for(table);
        if let Some(model) = model {
            if self.db.with_extensions(|ext| ext.has_save_fields(&model)) {
                self.added.push((model, row.clone()));
            }
        }
    }

    fn note_deleted(&mut self, table: &str, old: Row, new: Option<Row>) {
        if self.internal {
            return;
        }
        let model = self.model_for(table);
        if let Some(model) = model {
            if self.db.with_extensions(|ext| ext.has_delete_fields(&model)) {
                self.deleted.push((model, old, new));
            }
        }
    }

    fn model_for(&self, table: &str) -> Option<String> {
        self.db.with_registry(|reg| reg.by_table(table).map(|m| m.model_name.clone()))
    }

    /// Commits the transaction, flushes the tracked operations to the log,
    /// and runs the extension save/delete side effects.
    pub fn commit(mut self) -> SyncResult<()> {
        self.db.with_store(|store| store.commit())?;
        self.open = false;
        self.flush_operations()?;
        let added = std::mem::take(&mut self.added);
        let deleted = std::mem::take(&mut self.deleted);
        self.db.with_extensions(|ext| {
            for (model, old, new) in &deleted {
                ext.delete_fields(model, old, new.as_ref());
            }
            for (model, row) in &added {
                ext.save_fields(model, row);
            }
        });
        Ok(())
    }

    /// Flush operations after a commit has been issued.
    fn flush_operations(&mut self) -> SyncResult<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        if !self.db.listening() {
            log::warn!("sync tracking is disabled; aborting operation flush");
            self.queue.clear();
            return Ok(());
        }
        let queue = std::mem::take(&mut self.queue);
        self.db.with_store(|store| {
            for mut op in queue {
                op.order = oplog::next_order(store)?;
                oplog::append_operation(store, &op)?;
            }
            Ok(())
        })
    }

    /// Rolls the transaction back and empties the operations queue.
    pub fn rollback(mut self) -> SyncResult<()> {
        self.open = false;
        self.queue.clear();
        self.added.clear();
        self.deleted.clear();
        self.db.with_store(|store| store.rollback())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.open {
            let _ = self.db.with_store(|store| {
                if store.in_transaction() {
                    store.rollback()
                } else {
                    Ok(())
                }
            });
        }
    }
}
