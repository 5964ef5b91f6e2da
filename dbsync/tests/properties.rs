//! Cross-cutting properties: compression equivalence against a model
//! interpreter, and content-type id stability.

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;

use dbsync_rs::compression::compressed_operations;
use dbsync_rs::oplog::{Command, Operation};
use dbsync_rs::registry::make_content_type_id;
use dbsync_rs::store::value::RowKey;

/// Minimal interpreter: applies an operation sequence to a set of live
/// object ids, where the payload of an insert/update is the (object,
/// generation) pair itself.
fn interpret(ops: &[(u128, Command)], start: &[u128]) -> BTreeMap<u128, Command> {
    let mut state: BTreeMap<u128, Command> = start.iter().map(|id| (*id, Command::Insert)).collect();
    for (object, command) in ops {
        match command {
            Command::Insert | Command::Update => {
                state.insert(*object, *command);
            }
            Command::Delete => {
                state.remove(object);
            }
        }
    }
    // only liveness matters: an object is present or not
    state.keys().map(|k| (*k, Command::Insert)).collect()
}

fn as_operations(ops: &[(u128, Command)]) -> Vec<Operation> {
    ops.iter()
        .enumerate()
        .map(|(order, (object, command))| Operation {
            row_id: RowKey::Guid(uuid::Uuid::from_u128(*object)),
            version_id: None,
            content_type_id: 1,
            command: *command,
            order: order as u32 + 1,
        })
        .collect()
}

fn back(ops: Vec<Operation>) -> Vec<(u128, Command)> {
    ops.into_iter()
        .map(|op| match op.row_id {
            RowKey::Guid(g) => (g.as_u128(), op.command),
            RowKey::Int(i) => (i as u128, op.command),
        })
        .collect()
}

/// `apply(compress(ops)) == apply(ops)` for op sequences over a small
/// object universe, exhaustively up to length 4.
#[test]
fn compression_preserves_final_liveness() {
    use Command::*;
    let commands = [Insert, Update, Delete];
    let objects: [u128; 2] = [1, 2];

    let mut sequences: Vec<Vec<(u128, Command)>> = vec![vec![]];
    for _ in 0..4 {
        let mut next = Vec::new();
        for seq in &sequences {
            for object in objects {
                for command in commands {
                    let mut extended = seq.clone();
                    extended.push((object, command));
                    next.push(extended);
                }
            }
        }
        sequences.extend(next);
    }

    let starts: [&[u128]; 4] = [&[], &[1], &[2], &[1, 2]];
    for start in starts {
        for seq in &sequences {
            // legal histories only: an insert follows absence,
            // update/delete follow presence
            let mut live = [start.contains(&1), start.contains(&2)];
            let legal = seq.iter().all(|(object, command)| {
                let slot = (*object - 1) as usize;
                let ok = match command {
                    Insert => !live[slot],
                    Update | Delete => live[slot],
                };
                match command {
                    Insert => live[slot] = true,
                    Delete => live[slot] = false,
                    Update => {}
                }
                ok
            });
            if !legal {
                continue;
            }

            let compressed = back(compressed_operations(as_operations(seq)));
            assert_eq!(
                interpret(&compressed, start),
                interpret(seq, start),
                "sequence {:?} from {:?} compressed to {:?}",
                seq,
                start,
                compressed
            );
            // at most one surviving operation per object
            for object in objects {
                assert!(compressed.iter().filter(|(o, _)| *o == object).count() <= 1);
            }
        }
    }
}

/// The id is the unsigned CRC-32 of `"<ModelName>/<TableName>"`, stable
/// across nodes. Reference values computed with zlib's crc32.
#[test]
fn content_type_ids_match_the_crc32_reference() {
    assert_eq!(make_content_type_id("A", "test_a"), 1432697902);
    assert_eq!(make_content_type_id("B", "test_b"), 1122200183);
    assert_eq!(make_content_type_id("City", "cities"), 1189453927);
    assert_eq!(make_content_type_id("House", "houses"), 3526584209);
}
