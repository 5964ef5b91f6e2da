//! Pull merge: applies a pull message to the local database, resolving
//! conflicts between the pulled operations and the local unversioned ones.
//!
//! The whole merge runs inside a single atomic transaction with foreign
//! key enforcement deferred. Decision table for a direct conflict pair
//! `(pull command, local command)`:
//!
//! | pair   | action                                               |
//! |--------|------------------------------------------------------|
//! | (d, *) | skip applying the pull operation                     |
//! | (u, u) | keep local, skip the pull operation                  |
//! | (u, d) | recreate: pull op becomes an insert, local purged    |
//! | (d, u) | resurrect: local op becomes an insert, pull pending  |
//! | (d, d) | purge local (no-op on the wire)                      |

use std::collections::BTreeSet;

use crate::client::conflicts::{
    find_dependency_conflicts, find_direct_conflicts, find_insert_conflicts,
    find_reversed_dependency_conflicts, find_unique_conflicts, UniqueConflict,
};
use crate::compression::{self, compressed_operations};
use crate::db::SyncDb;
use crate::error::{Error, SyncResult};
use crate::messages::pull::PullMessage;
use crate::messages::ObjectContainer;
use crate::net::wire::JsonTransport;
use crate::oplog::{self, Command, Operation};
use crate::perform::apply_operation;
use crate::store::engine::SqlStore;
use crate::store::session::Session;
use crate::store::value::RowKey;

struct LocalOp {
    op: Operation,
    purged: bool,
}

/// Local counterparts of a pull operation inside one conflict set,
/// skipping operations purged meanwhile.
fn extract(pairs: &[(usize, usize)], p: usize, local: &[LocalOp]) -> Vec<usize> {
    pairs.iter().filter(|(pi, li)| *pi == p && !local[*li].purged).map(|(_, li)| *li).collect()
}

/// Removes the local operation from the log; the purged flag drops it from
/// every conflict set still being iterated.
fn purge_local(db: &SyncDb, local: &mut [LocalOp], li: usize) -> SyncResult<()> {
    local[li].purged = true;
    db.with_store(|store| oplog::delete_operation(store, local[li].op.order))
}

/// Updates the row matching `old` to `new`, and updates all dependent rows
/// in other tables as well. Runs under deferred FK enforcement, so the
/// order of the moves doesn't matter.
fn update_local_id(db: &SyncDb, table: &str, old: &RowKey, new: &RowKey) -> SyncResult<()> {
    let pk_column = db.schema().table(table)?.primary_key.clone();
    db.with_store(|store| {
        let mut row = store
            .get(table, old)?
            .ok_or_else(|| Error::Store(format!("no row {} in {} to renumber", old, table)))?;
        // drop first so the copy doesn't trip the table's own uniques
        store.delete(table, old)?;
        row.insert(pk_column.clone(), new.to_value());
        store.insert(table, row)?;
        let references: Vec<(String, String)> = store
            .schema()
            .referencing(table)
            .iter()
            .map(|(child, fk)| (child.name.clone(), fk.column.clone()))
            .collect();
        for (child_table, fk_column) in references {
            for (child_key, mut child_row) in store.scan(&child_table)? {
                if child_row.get(&fk_column) == Some(&old.to_value()) {
                    child_row.insert(fk_column.clone(), new.to_value());
                    store.update(&child_table, &child_key, child_row)?;
                }
            }
        }
        Ok(())
    })
}

/// Phase I of a merge (and of a server push): moves each conflicting
/// local object to the unique-column values the message carries for it.
/// Cycles are broken by dropping every conflicting row first and
/// reinserting the repaired states afterwards.
pub(crate) fn apply_unique_fixups(db: &SyncDb, conflicts: &[UniqueConflict]) -> SyncResult<()> {
    if conflicts.is_empty() {
        return Ok(());
    }
    log::info!("{} unique conflicts found", conflicts.len());
    db.with_store(|store| {
        let mut fixed = Vec::new();
        for uc in conflicts {
            if let Some(mut row) = store.get(&uc.table_name, &uc.pk)? {
                for (column, value) in uc.columns.iter().zip(&uc.new_values) {
                    row.insert(column.clone(), value.clone());
                }
                fixed.push((uc.table_name.clone(), uc.pk, row));
            }
        }
        for (table, pk, _) in &fixed {
            store.delete(table, pk)?;
        }
        for (table, _, row) in &fixed {
            store.insert(table, row.clone())?;
        }
        Ok(())
    })
}

/// Merges a message from the server with the local database.
pub async fn merge(
    db: &SyncDb,
    message: &PullMessage,
    mut channel: Option<&mut JsonTransport>,
) -> SyncResult<()> {
    log::info!("begin merge");
    let mut session = Session::begin_internal(db)?;
    match merge_in_session(db, &mut session, message, channel.as_deref_mut()).await {
        Ok(()) => session.commit(),
        Err(err) => {
            let _ = session.rollback();
            Err(err)
        }
    }
}

async fn merge_in_session(
    db: &SyncDb,
    session: &mut Session,
    message: &PullMessage,
    mut channel: Option<&mut JsonTransport>,
) -> SyncResult<()> {
    let unversioned = compression::compress(db)?;
    let mut local: Vec<LocalOp> = unversioned.into_iter().map(|op| LocalOp { op, purged: false }).collect();

    let valid: BTreeSet<u32> = db.with_registry(|reg| reg.content_type_ids());
    let mut pull_ops: Vec<Operation> =
        message.operations.iter().filter(|op| valid.contains(&op.content_type_id)).cloned().collect();
    pull_ops.sort_by_key(|op| op.order);
    let mut pull_ops = compressed_operations(pull_ops);
    log::info!("merging {} pulled operations against {} local ones", pull_ops.len(), local.len());

    let locals: Vec<Operation> = local.iter().map(|l| l.op.clone()).collect();

    // I) resolve unique constraint conflicts if possible; abort early if a
    // human error is detected
    let (unique_conflicts, unique_errors) = find_unique_conflicts(db, &pull_ops, &locals, message)?;
    if !unique_errors.is_empty() {
        return Err(Error::UniqueConstraint(unique_errors));
    }
    apply_unique_fixups(db, &unique_conflicts)?;

    // II) detect conflicts between pulled and unversioned operations
    let direct = find_direct_conflicts(&pull_ops, &locals);
    // the delete registered on the pull message
    let dependency = find_dependency_conflicts(db, &pull_ops, &locals)?;
    // the delete performed locally
    let reversed = find_reversed_dependency_conflicts(db, &pull_ops, &locals, message)?;
    let insert = find_insert_conflicts(&pull_ops, &locals);

    // III) perform pull operations, when allowed and while resolving
    for p in 0..pull_ops.len() {
        // whether the remote operation is free of obstacles
        let mut can_perform = true;
        // early exclusion of the remote operation
        let mut reverted = false;

        let direct_locals = extract(&direct, p, &local);
        if !direct_locals.is_empty() {
            if pull_ops[p].command == Command::Delete {
                can_perform = false;
            }
            for li in direct_locals {
                let pair = (pull_ops[p].command, local[li].op.command);
                match pair {
                    (Command::Update, Command::Update) => {
                        // favor local changes over remote ones
                        can_perform = false;
                    }
                    (Command::Update, Command::Delete) => {
                        // negate the local delete
                        pull_ops[p].command = Command::Insert;
                        purge_local(db, &mut local, li)?;
                    }
                    (Command::Delete, Command::Update) => {
                        // negate the remote delete
                        local[li].op.command = Command::Insert;
                        db.with_store(|store| oplog::update_operation(store, &local[li].op))?;
                        reverted = true;
                    }
                    (Command::Delete, Command::Delete) => {
                        purge_local(db, &mut local, li)?;
                    }
                    // insert pairs are handled as insert conflicts below
                    _ => {}
                }
            }
        }

        let dependency_locals = extract(&dependency, p, &local);
        if !dependency_locals.is_empty() && !reverted {
            can_perform = false;
            let order = local
                .iter()
                .filter(|l| !l.purged)
                .map(|l| l.op.order)
                .min()
                .unwrap_or(pull_ops[p].order);
            // move the pending operations further in order to make way,
            // then record the reinsertion to keep the history correct
            db.with_store(|store| {
                let mut shifted: Vec<usize> = (0..local.len()).filter(|i| !local[*i].purged).collect();
                shifted.sort_by_key(|i| std::cmp::Reverse(local[*i].op.order));
                for i in shifted {
                    let old_order = local[i].op.order;
                    local[i].op.order += 1;
                    oplog::move_operation(store, old_order, &local[i].op)?;
                }
                oplog::append_operation(
                    store,
                    &Operation {
                        row_id: pull_ops[p].row_id,
                        version_id: None,
                        content_type_id: pull_ops[p].content_type_id,
                        command: Command::Insert,
                        order,
                    },
                )
            })?;
        }

        for li in extract(&reversed, p, &local) {
            // reinsert the locally deleted parent from the pull snapshot,
            // then delete the trace of the deletion
            local[li].op.command = Command::Insert;
            let resurrect = local[li].op.clone();
            apply_operation(db, session, &resurrect, message, channel.as_deref_mut()).await?;
            purge_local(db, &mut local, li)?;
        }

        for li in extract(&insert, p, &local) {
            let model = db.with_registry(|reg| reg.require_by_id(local[li].op.content_type_id))?;
            let local_max = db.with_store(|store| store.max_pk(&model.table_name))?.unwrap_or(0);
            let remote_max = message.container_max_pk(&model.model_name).unwrap_or(0);
            let next_id = RowKey::Int(local_max.max(remote_max) + 1);
            let old_id = local[li].op.row_id;
            update_local_id(db, &model.table_name, &old_id, &next_id)?;
            local[li].op.row_id = next_id;
            db.with_store(|store| oplog::update_operation(store, &local[li].op))?;
        }

        if can_perform {
            let pull_op = pull_ops[p].clone();
            apply_operation(db, session, &pull_op, message, channel.as_deref_mut()).await?;
        }
    }

    // IV) insert versions from the pull message
    db.with_store(|store| {
        for version in &message.versions {
            oplog::insert_version(store, version)?;
        }
        Ok(())
    })?;
    log::info!("latest version after merge: {:?}", db.latest_version_id()?);
    Ok(())
}
