//! Change capture: turns entity mutations reported by the session into
//! operation records. Client sessions buffer unversioned operations and
//! flush them on commit; the server variant in [`crate::server::tracking`]
//! versions every operation at tracking time.

use crate::db::{SyncDb, SyncMode};
use crate::error::{Error, SyncResult};
use crate::oplog::{Command, Operation};
use crate::server;
use crate::store::value::{row_key, Row};

/// Called by the session listeners on insert/update/delete. Appends an
/// operation to the session queue (client) or versions it immediately
/// (server). Skipped when the engine is disabled, the table is untracked,
/// an update modified no column, or an extension raised `SkipOperation`.
pub(crate) fn track_change(
    db: &SyncDb,
    queue: &mut Vec<Operation>,
    command: Command,
    table: &str,
    row: &Row,
    modified: bool,
    force: bool,
) -> SyncResult<()> {
    if !db.listening() {
        log::warn!("sync tracking is disabled; aborting listener to '{}' command", command);
        return Ok(());
    }
    if command == Command::Update && !modified && !force {
        return Ok(());
    }
    let model = match db.with_registry(|reg| reg.by_table(table)) {
        Some(model) => model,
        None => {
            log::error!("you must track a mapped class to table {} to log operations", table);
            return Ok(());
        }
    };

    match db.with_extensions(|ext| ext.call_before_tracking(&model.model_name, command, row)) {
        Ok(()) => {}
        Err(Error::SkipOperation) => {
            log::info!("operation {} skipped for {}", command, table);
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let pk_column = db.schema().table(table)?.primary_key.clone();
    let key = row_key(row, &pk_column)?;
    let op = Operation {
        row_id: key,
        version_id: None, // operation not yet versioned
        content_type_id: model.content_type_id,
        command,
        order: 0, // assigned when the queue is flushed
    };

    match db.mode() {
        SyncMode::Client => {
            queue.push(op.clone());
            db.with_extensions(|ext| ext.call_after_tracking(&model.model_name, &op, row))
        }
        SyncMode::Server => server::tracking::track_versioned(db, &model.model_name, op, row),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use crate::db::{SyncDb, SyncMode};
    use crate::error::{Error, SyncResult};
    use crate::store::engine::SqlStore;
    use crate::extensions::Extension;
    use crate::oplog::{self, Command};
    use crate::store::schema::{ColumnType, Schema, TableDef};
    use crate::store::session::Session;
    use crate::store::value::{Row, RowKey, Value};

    fn schema() -> Schema {
        Schema::new(vec![TableDef::new("test_a", "id")
            .column_not_null("id", ColumnType::Guid)
            .column("name", ColumnType::Text)])
    }

    fn row(id: Uuid, name: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), Value::Guid(id));
        r.insert("name".into(), Value::Text(name.into()));
        r
    }

    fn ops(db: &SyncDb) -> Vec<oplog::Operation> {
        db.with_store(|store| oplog::all_operations(store)).unwrap()
    }

    #[test]
    fn client_queues_and_flushes_on_commit() -> SyncResult<()> {
        let db = SyncDb::open(schema(), SyncMode::Client);
        db.track("A", "test_a");

        let id = Uuid::new_v4();
        let mut session = Session::begin(&db)?;
        session.insert("test_a", row(id, "first"))?;
        session.update("test_a", row(id, "second"))?;
        assert_eq!(ops(&db).len(), 0); // nothing before commit
        session.commit()?;

        let ops = ops(&db);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].command, Command::Insert);
        assert_eq!(ops[1].command, Command::Update);
        assert!(ops.iter().all(|op| op.version_id.is_none()));
        assert_eq!(ops[0].row_id, RowKey::Guid(id));
        Ok(())
    }

    #[test]
    fn rollback_discards_queue() -> SyncResult<()> {
        let db = SyncDb::open(schema(), SyncMode::Client);
        db.track("A", "test_a");

        let mut session = Session::begin(&db)?;
        session.insert("test_a", row(Uuid::new_v4(), "gone"))?;
        session.rollback()?;
        assert!(ops(&db).is_empty());
        assert_eq!(db.with_store(|s| s.count("test_a"))?, 0);
        Ok(())
    }

    #[test]
    fn unmodified_update_is_not_tracked() -> SyncResult<()> {
        let db = SyncDb::open(schema(), SyncMode::Client);
        db.track("A", "test_a");

        let id = Uuid::new_v4();
        let mut session = Session::begin(&db)?;
        session.insert("test_a", row(id, "same"))?;
        session.update("test_a", row(id, "same"))?;
        session.update_forced("test_a", row(id, "same"))?;
        session.commit()?;

        // insert + forced update; the no-op update left no record
        assert_eq!(ops(&db).len(), 2);
        Ok(())
    }

    #[test]
    fn internal_session_is_invisible() -> SyncResult<()> {
        let db = SyncDb::open(schema(), SyncMode::Client);
        db.track("A", "test_a");

        let mut session = Session::begin_internal(&db)?;
        session.insert("test_a", row(Uuid::new_v4(), "replayed"))?;
        session.commit()?;
        assert!(ops(&db).is_empty());
        Ok(())
    }

    #[test]
    fn listening_off_suppresses_tracking() -> SyncResult<()> {
        let db = SyncDb::open(schema(), SyncMode::Client);
        db.track("A", "test_a");

        db.with_listening(false, || -> SyncResult<()> {
            let mut session = Session::begin(&db)?;
            session.insert("test_a", row(Uuid::new_v4(), "untracked"))?;
            session.commit()
        })?;
        assert!(ops(&db).is_empty());
        assert_eq!(db.with_store(|s| s.count("test_a"))?, 1);
        Ok(())
    }

    #[test]
    fn skip_operation_suppresses_the_record_only() -> SyncResult<()> {
        let db = SyncDb::open(schema(), SyncMode::Client);
        db.track("A", "test_a");
        let mut ext = Extension::new();
        ext.before_tracking = Some(Box::new(|_, row| {
            if row.get("name") == Some(&Value::Text("donttrack".into())) {
                return Err(Error::SkipOperation);
            }
            Ok(())
        }));
        db.extend("A", ext);

        let mut session = Session::begin(&db)?;
        session.insert("test_a", row(Uuid::new_v4(), "donttrack"))?;
        session.insert("test_a", row(Uuid::new_v4(), "tracked"))?;
        session.commit()?;

        // the data change stands, only its operation is suppressed
        assert_eq!(db.with_store(|s| s.count("test_a"))?, 2);
        assert_eq!(ops(&db).len(), 1);
        Ok(())
    }

    #[test]
    fn server_versions_each_operation() -> SyncResult<()> {
        let db = SyncDb::open(schema(), SyncMode::Server);
        db.track("A", "test_a");

        let id = Uuid::new_v4();
        let mut session = Session::begin(&db)?;
        session.insert("test_a", row(id, "first"))?;
        session.update("test_a", row(id, "second"))?;
        session.commit()?;

        let ops = ops(&db);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].version_id, Some(1));
        assert_eq!(ops[1].version_id, Some(2));
        assert_eq!(db.latest_version_id()?, Some(2));
        Ok(())
    }

    #[test]
    fn server_listening_off_suppresses_versions_too() -> SyncResult<()> {
        let db = SyncDb::open(schema(), SyncMode::Server);
        db.track("A", "test_a");

        db.with_listening(false, || -> SyncResult<()> {
            let mut session = Session::begin(&db)?;
            session.insert("test_a", row(Uuid::new_v4(), "quiet"))?;
            session.commit()
        })?;
        assert!(ops(&db).is_empty());
        assert_eq!(db.latest_version_id()?, None);
        Ok(())
    }
}
