//! Merge-time conflict detection: the five conflict kinds computed over
//! the pulled operations (P) and the local unversioned ones (L). All
//! finders return index pairs `(p, l)` into the two slices, so the merge
//! can keep mutating both sets while iterating.

use crate::db::SyncDb;
use crate::error::{SyncResult, UniqueConstraintEntry};
use crate::messages::ObjectContainer;
use crate::oplog::{Command, Operation};
use crate::store::engine::SqlStore;
use crate::store::value::{Row, RowKey, Value};

/// A repairable unique collision: the conflicting local object and the
/// values the server moved it to.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueConflict {
    pub model_name: String,
    pub table_name: String,
    pub pk: RowKey,
    pub columns: Vec<String>,
    pub new_values: Vec<Value>,
}

fn table_of(db: &SyncDb, op: &Operation) -> Option<(String, String)> {
    db.with_registry(|reg| {
        reg.by_id(op.content_type_id).map(|m| (m.model_name.clone(), m.table_name.clone()))
    })
}

/// Both operations touch the same object.
pub fn find_direct_conflicts(pull_ops: &[Operation], local_ops: &[Operation]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (p, pull_op) in pull_ops.iter().enumerate() {
        for (l, local_op) in local_ops.iter().enumerate() {
            if pull_op.row_id == local_op.row_id && pull_op.content_type_id == local_op.content_type_id {
                pairs.push((p, l));
            }
        }
    }
    pairs
}

/// The pull deletes a row some local insert/update still points at through
/// a foreign key, as observed in the current local state.
pub fn find_dependency_conflicts(
    db: &SyncDb,
    pull_ops: &[Operation],
    local_ops: &[Operation],
) -> SyncResult<Vec<(usize, usize)>> {
    let mut pairs = Vec::new();
    for (p, pull_op) in pull_ops.iter().enumerate() {
        if pull_op.command != Command::Delete {
            continue;
        }
        let (_, parent_table) = match table_of(db, pull_op) {
            Some(found) => found,
            None => continue,
        };
        for (l, local_op) in local_ops.iter().enumerate() {
            if local_op.command == Command::Delete {
                continue;
            }
            let (_, child_table) = match table_of(db, local_op) {
                Some(found) => found,
                None => continue,
            };
            let child_row = db.with_store(|store| store.get(&child_table, &local_op.row_id))?;
            let child_row = match child_row {
                Some(row) => row,
                None => continue,
            };
            if references_row(db, &child_table, &child_row, &parent_table, &pull_op.row_id)? {
                pairs.push((p, l));
            }
        }
    }
    Ok(pairs)
}

/// A local delete collides with a pulled insert/update whose snapshot in
/// the pull message still points at the deleted row.
pub fn find_reversed_dependency_conflicts(
    db: &SyncDb,
    pull_ops: &[Operation],
    local_ops: &[Operation],
    message: &dyn ObjectContainer,
) -> SyncResult<Vec<(usize, usize)>> {
    let mut pairs = Vec::new();
    for (l, local_op) in local_ops.iter().enumerate() {
        if local_op.command != Command::Delete {
            continue;
        }
        let (_, parent_table) = match table_of(db, local_op) {
            Some(found) => found,
            None => continue,
        };
        for (p, pull_op) in pull_ops.iter().enumerate() {
            if pull_op.command == Command::Delete {
                continue;
            }
            let (child_model, child_table) = match table_of(db, pull_op) {
                Some(found) => found,
                None => continue,
            };
            let child_row = match message.lookup(&child_model, &pull_op.row_id) {
                Some(row) => row,
                None => continue,
            };
            if references_row(db, &child_table, child_row, &parent_table, &local_op.row_id)? {
                pairs.push((p, l));
            }
        }
    }
    Ok(pairs)
}

/// Both sides insert the same primary key on the same model: a pk
/// collision between logically different rows.
pub fn find_insert_conflicts(pull_ops: &[Operation], local_ops: &[Operation]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (p, pull_op) in pull_ops.iter().enumerate() {
        if pull_op.command != Command::Insert {
            continue;
        }
        for (l, local_op) in local_ops.iter().enumerate() {
            if local_op.command == Command::Insert
                && pull_op.row_id == local_op.row_id
                && pull_op.content_type_id == local_op.content_type_id
            {
                pairs.push((p, l));
            }
        }
    }
    pairs
}

/// Whether `row` of `child_table` holds a foreign key into `parent_table`
/// pointing at `parent_key`.
fn references_row(
    db: &SyncDb,
    child_table: &str,
    row: &Row,
    parent_table: &str,
    parent_key: &RowKey,
) -> SyncResult<bool> {
    let def = db.schema().table(child_table)?;
    let target = parent_key.to_value();
    Ok(def
        .foreign_keys
        .iter()
        .any(|fk| fk.ref_table == parent_table && row.get(&fk.column) == Some(&target)))
}

/// Unique-constraint collisions between pulled rows and local rows that
/// are not themselves in L.
///
/// When the message also carries the new state of the colliding local row,
/// the collision is repairable: the local object is moved to those values
/// during merge phase I. When it doesn't, the collision is a human error
/// and aborts the merge. A colliding row that still has a pending
/// operation in `local_ops` is neither: the direct and insert rules own
/// it, and its own eventual push discovers the clash.
pub fn find_unique_conflicts(
    db: &SyncDb,
    pull_ops: &[Operation],
    local_ops: &[Operation],
    message: &dyn ObjectContainer,
) -> SyncResult<(Vec<UniqueConflict>, Vec<UniqueConstraintEntry>)> {
    let mut conflicts = Vec::new();
    let mut errors = Vec::new();
    for pull_op in pull_ops {
        if pull_op.command == Command::Delete {
            continue;
        }
        let (model_name, table_name) = match table_of(db, pull_op) {
            Some(found) => found,
            None => continue,
        };
        let remote_row = match message.lookup(&model_name, &pull_op.row_id) {
            Some(row) => row,
            None => continue,
        };
        let def = db.schema().table(&table_name)?.clone();
        for unique in &def.uniques {
            let remote_values: Vec<Option<&Value>> = unique.iter().map(|c| remote_row.get(c)).collect();
            if remote_values.iter().any(|v| v.map(|v| v.is_null()).unwrap_or(true)) {
                continue;
            }
            let local = db.with_store(|store| {
                Ok(store.scan(&table_name)?.into_iter().find(|(pk, row)| {
                    *pk != pull_op.row_id
                        && unique.iter().zip(&remote_values).all(|(c, v)| row.get(c) == *v)
                }))
            })?;
            let (local_pk, _) = match local {
                Some(found) => found,
                None => continue,
            };
            let pending = local_ops
                .iter()
                .any(|l| l.content_type_id == pull_op.content_type_id && l.row_id == local_pk);
            if pending {
                continue;
            }
            match message.lookup(&model_name, &local_pk) {
                Some(new_state) => conflicts.push(UniqueConflict {
                    model_name: model_name.clone(),
                    table_name: table_name.clone(),
                    pk: local_pk,
                    columns: unique.clone(),
                    new_values: unique.iter().map(|c| new_state.get(c).cloned().unwrap_or(Value::Null)).collect(),
                }),
                None => errors.push(UniqueConstraintEntry {
                    model: model_name.clone(),
                    pk: local_pk.to_string(),
                    columns: unique.clone(),
                }),
            }
        }
    }
    Ok((conflicts, errors))
}
