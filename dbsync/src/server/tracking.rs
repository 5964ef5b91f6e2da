//! Server-side change capture. Each tracked operation also triggers a new
//! version, so direct use of the server database stays visible to
//! occasionally connected nodes.

use crate::db::SyncDb;
use crate::error::SyncResult;
use crate::oplog::{self, Operation, Version};
use crate::store::value::Row;

/// Records `op` with a fresh version of its own. One version per operation:
/// a direct server-side edit is its own checkpoint.
pub(crate) fn track_versioned(db: &SyncDb, model_name: &str, mut op: Operation, row: &Row) -> SyncResult<()> {
    db.with_store(|store| {
        let version = Version {
            version_id: oplog::next_version_id(store)?,
            node_id: None,
            created_at: oplog::now(),
        };
        log::info!("new version: {}", version.version_id);
        oplog::insert_version(store, &version)?;
        op.version_id = Some(version.version_id);
        op.order = oplog::next_order(store)?;
        oplog::append_operation(store, &op)?;
        Ok(())
    })?;
    db.with_extensions(|ext| ext.call_after_tracking(model_name, &op, row))
}
