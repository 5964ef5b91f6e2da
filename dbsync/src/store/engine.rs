use crate::error::SyncResult;
use crate::store::schema::Schema;
use crate::store::value::{Row, RowKey};

/// The relational surface the sync engine needs from its host database.
///
/// The real SQL engine is an external collaborator; this trait captures the
/// handful of operations the reconciliation core performs against it: keyed
/// reads and writes, table scans, unique lookups, and an atomic transaction
/// with foreign-key enforcement that can be deferred until commit.
///
/// Only supports single-threaded use since all methods take a mutable
/// reference -- callers serialize access behind a lock, which doubles as the
/// EXCLUSIVE/SERIALIZABLE isolation the push critical section requires.
pub trait SqlStore: Send {
    /// The full schema, internal `sync_*` tables included.
    fn schema(&self) -> &Schema;

    /// Begins an atomic transaction. With `defer_fk`, foreign keys are only
    /// checked at commit; unique constraints and NOT NULL stay immediate.
    fn begin(&mut self, defer_fk: bool) -> SyncResult<()>;

    /// Commits the open transaction, running any deferred checks first.
    /// A deferred-check failure leaves the transaction open for rollback.
    fn commit(&mut self) -> SyncResult<()>;

    /// Rolls the open transaction back, restoring the pre-`begin` state.
    fn rollback(&mut self) -> SyncResult<()>;

    fn in_transaction(&self) -> bool;

    /// Inserts a row. Errors on pk collision or constraint violation.
    fn insert(&mut self, table: &str, row: Row) -> SyncResult<()>;

    /// Replaces the row stored under `key`. The pk column may not change.
    fn update(&mut self, table: &str, key: &RowKey, row: Row) -> SyncResult<()>;

    /// Deletes by pk. Returns whether a row was actually removed.
    fn delete(&mut self, table: &str, key: &RowKey) -> SyncResult<bool>;

    fn get(&self, table: &str, key: &RowKey) -> SyncResult<Option<Row>>;

    /// All rows of a table in pk order.
    fn scan(&self, table: &str) -> SyncResult<Vec<(RowKey, Row)>>;

    fn count(&self, table: &str) -> SyncResult<usize>;

    /// Maximum integer pk in the table, if any row has one.
    fn max_pk(&self, table: &str) -> SyncResult<Option<i64>>;

    /// First row colliding with `row` on any unique constraint of `table`,
    /// together with the constraint's columns. `exclude` skips the row that
    /// is being replaced.
    fn unique_collision(
        &self,
        table: &str,
        row: &Row,
        exclude: Option<&RowKey>,
    ) -> SyncResult<Option<(RowKey, Vec<String>)>>;
}
