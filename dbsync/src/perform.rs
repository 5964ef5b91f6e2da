//! Performs one operation against the local store, looking for required
//! data in the carrying message, and streaming extension field payloads
//! over the transport when one is attached.

use crate::db::SyncDb;
use crate::error::{Error, SyncResult, UniqueConstraintEntry};
use crate::messages::ObjectContainer;
use crate::net::wire::JsonTransport;
use crate::oplog::{Command, Operation};
use crate::store::engine::SqlStore;
use crate::store::session::Session;
use crate::store::value::{Row, RowKey, Value};

/// What an apply did, for the after-hooks: the new object state and the
/// old one, when there was one.
pub type Applied = (Row, Option<Row>);

/// Requests payload data for every extension field of the object that
/// expects some, via the attached transport.
async fn request_payloads(
    db: &SyncDb,
    op: &Operation,
    model_name: &str,
    id_field: &str,
    row: &mut Row,
    channel: &mut Option<&mut JsonTransport>,
) -> SyncResult<()> {
    let fields = db.with_extensions(|ext| ext.receive_payload_fields(model_name));
    if fields.is_empty() {
        return Ok(());
    }
    let channel = match channel.as_deref_mut() {
        Some(channel) => channel,
        None => return Ok(()),
    };
    for field_name in fields {
        let bytes = channel
            .request_field_payload(model_name, id_field, &op.row_id.portion(), &field_name)
            .await?;
        db.with_extensions(|ext| ext.receive_payload(model_name, &field_name, op, row, bytes))?;
    }
    Ok(())
}

/// The data-holder side of the dance: looks the row up and streams the
/// requested field's bytes back over the same channel.
pub async fn respond_field_payload(
    db: &SyncDb,
    transport: &mut JsonTransport,
    class_name: &str,
    id: &str,
    field_name: &str,
) -> SyncResult<()> {
    let model = db
        .with_registry(|reg| reg.by_model(class_name))
        .ok_or_else(|| Error::Registry(format!("model {} isn't being tracked", class_name)))?;
    let key = RowKey::parse(id)?;
    let row = db
        .with_store(|store| store.get(&model.table_name, &key))?
        .ok_or_else(|| Error::Operation(format!("no row {} in {} to load a payload from", id, model.table_name)))?;
    let bytes = db.with_extensions(|ext| ext.send_payload(class_name, field_name, &row))?;
    transport.stream_payload(&bytes).await
}

/// Rows coming out of a message may omit columns; comparison and storage
/// use the full column map.
fn normalized(db: &SyncDb, table: &str, row: &Row) -> SyncResult<Row> {
    let def = db.schema().table(table)?;
    let mut out = Row::new();
    for col in &def.columns {
        out.insert(col.name.clone(), row.get(&col.name).cloned().unwrap_or(Value::Null));
    }
    Ok(out)
}

/// Performs `op` inside `session`, reading object state from `container`.
///
/// Returns `None` when the apply was skipped (extension veto, redundant
/// insert, missing delete target), `Some((new, old))` when it took effect.
/// Predictable failures surface as [`Error::Operation`]; a unique collision
/// with an unrelated local row is surfaced as [`Error::UniqueConstraint`].
pub async fn apply_operation(
    db: &SyncDb,
    session: &mut Session,
    op: &Operation,
    container: &dyn ObjectContainer,
    mut channel: Option<&mut JsonTransport>,
) -> SyncResult<Option<Applied>> {
    let model = db
        .with_registry(|reg| reg.by_id(op.content_type_id))
        .ok_or_else(|| Error::Operation(format!("no content type for operation {}", op.content_type_id)))?;
    let table = model.table_name.as_str();
    let id_field = db.schema().table(table)?.primary_key.clone();

    match op.command {
        Command::Insert => {
            let pull_row = container
                .lookup(&model.model_name, &op.row_id)
                .ok_or_else(|| Error::Operation("no object backing the operation in container".into()))?;
            let mut row = normalized(db, table, pull_row)?;
            match session.get(table, &op.row_id)? {
                None => {
                    match db.with_extensions(|ext| {
                        ext.call_before_operation(&model.model_name, op, &mut row, None)
                    }) {
                        Ok(()) => {}
                        Err(Error::SkipOperation) => {
                            log::info!("operation {} on {} skipped", op.command, table);
                            return Ok(None);
                        }
                        Err(err) => return Err(err),
                    }
                    request_payloads(db, op, &model.model_name, &id_field, &mut row, &mut channel).await?;
                    if let Some((pk, columns)) =
                        session.db().with_store(|store| store.unique_collision(table, &row, None))?
                    {
                        return Err(Error::UniqueConstraint(vec![UniqueConstraintEntry {
                            model: model.model_name.clone(),
                            pk: pk.to_string(),
                            columns,
                        }]));
                    }
                    session.insert(table, row.clone())?;
                    Ok(Some((row, None)))
                }
                Some(existing) => {
                    // Don't fail when the incoming object is exactly the
                    // same as the local one.
                    if existing == row {
                        log::warn!(
                            "insert attempted when an identical object already existed: model {} pk {}",
                            model.model_name,
                            op.row_id
                        );
                        Ok(None)
                    } else {
                        Err(Error::Operation(format!(
                            "insert attempted when the object already existed: model {} pk {}",
                            model.model_name, op.row_id
                        )))
                    }
                }
            }
        }

        Command::Update => {
            let pull_row = container
                .lookup(&model.model_name, &op.row_id)
                .ok_or_else(|| Error::Operation("no object backing the operation in container".into()))?;
            let mut row = normalized(db, table, pull_row)?;
            let old = session.get(table, &op.row_id)?;
            if old.is_none() {
                // The record is created again. Nothing should be deleted
                // outside the engine, but tracking may have been suppressed
                // when the row appeared, so this path stays.
                log::warn!(
                    "the referenced object doesn't exist in database: model {} pk {}",
                    model.model_name,
                    op.row_id
                );
            }
            match db.with_extensions(|ext| {
                ext.call_before_operation(&model.model_name, op, &mut row, old.as_ref())
            }) {
                Ok(()) => {}
                Err(Error::SkipOperation) => {
                    log::info!("operation {} on {} skipped", op.command, table);
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
            request_payloads(db, op, &model.model_name, &id_field, &mut row, &mut channel).await?;
            match &old {
                Some(_) => session.update(table, row.clone())?,
                None => session.insert(table, row.clone())?,
            }
            Ok(Some((row, old)))
        }

        Command::Delete => {
            let old = match session.get(table, &op.row_id)? {
                Some(old) => old,
                None => {
                    // Already deleted here; the final states agree, and a
                    // missing target mustn't fail the whole transaction.
                    log::warn!(
                        "the referenced object doesn't exist in database: model {} pk {}",
                        model.model_name,
                        op.row_id
                    );
                    return Ok(None);
                }
            };
            let mut doomed = old.clone();
            match db.with_extensions(|ext| {
                ext.call_before_operation(&model.model_name, op, &mut doomed, None)
            }) {
                Ok(()) => {}
                Err(Error::SkipOperation) => {
                    log::info!("operation {} on {} skipped", op.command, table);
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
            session.delete(table, &op.row_id)?;
            Ok(Some((old, None)))
        }
    }
}
