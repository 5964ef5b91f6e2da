//! Collapses sequences of operations on the same row to at most one
//! equivalent operation, preserving the relative order of distinct rows.
//!
//! Fold table for consecutive commands on one object:
//!
//! | prior -> next | result      |
//! |---------------|-------------|
//! | i -> u        | i           |
//! | i -> d        | remove both |
//! | u -> u        | u           |
//! | u -> d        | d           |
//! | d -> i        | u           |

use std::collections::BTreeMap;

use crate::db::SyncDb;
use crate::error::SyncResult;
use crate::oplog::{self, Command, Operation};
use crate::store::value::RowKey;

/// Folds `next` into the running command for an object. `None` means the
/// pair annihilates (an insert that was deleted again).
fn fold(prior: Command, next: Command) -> Option<Command> {
    match (prior, next) {
        (Command::Insert, Command::Delete) => None,
        (Command::Insert, _) => Some(Command::Insert),
        (_, Command::Delete) => Some(Command::Delete),
        (Command::Update, _) => Some(Command::Update),
        (Command::Delete, _) => Some(Command::Update),
    }
}

/// Pure compression of an operation sequence: at most one operation per
/// `(content_type_id, row_id)` afterwards, each keeping the order slot of
/// the object's first appearance.
pub fn compressed_operations(operations: Vec<Operation>) -> Vec<Operation> {
    let mut result: Vec<Option<Operation>> = Vec::new();
    let mut index: BTreeMap<(u32, RowKey), usize> = BTreeMap::new();
    for op in operations {
        let key = (op.content_type_id, op.row_id);
        match index.get(&key) {
            None => {
                index.insert(key, result.len());
                result.push(Some(op));
            }
            Some(&slot) => match &result[slot] {
                Some(prior) => match fold(prior.command, op.command) {
                    Some(command) => {
                        let mut merged = prior.clone();
                        merged.command = command;
                        result[slot] = Some(merged);
                    }
                    None => result[slot] = None,
                },
                // the object annihilated earlier; a later op starts fresh
                None => result[slot] = Some(op),
            },
        }
    }
    result.into_iter().flatten().collect()
}

/// Compresses the unversioned tail of the local operation log in place and
/// returns the surviving operations in ascending order.
pub fn compress(db: &SyncDb) -> SyncResult<Vec<Operation>> {
    db.with_store(|store| {
        let unversioned = oplog::unversioned_operations(store)?;
        let compressed = compressed_operations(unversioned.clone());
        let keep: BTreeMap<u32, &Operation> = compressed.iter().map(|op| (op.order, op)).collect();
        for op in &unversioned {
            match keep.get(&op.order) {
                Some(kept) => {
                    if kept.command != op.command {
                        oplog::update_operation(store, kept)?;
                    }
                }
                None => oplog::delete_operation(store, op.order)?,
            }
        }
        Ok(compressed)
    })
}
