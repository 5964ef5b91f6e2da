//! The shared database handle: store, model registry, extensions and the
//! engine-wide toggles, behind one cheaply clonable value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::SyncResult;
use crate::extensions::{Extension, ExtensionRegistry};
use crate::oplog;
use crate::registry::{Direction, ModelRegistry};
use crate::store::memory::MemoryStore;
use crate::store::schema::Schema;

/// The internal use mode, used to prevent client-server collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Client,
    Server,
}

/// Handle to a synchronized database. Clones share state.
#[derive(Clone)]
pub struct SyncDb {
    inner: Arc<DbInner>,
}

struct DbInner {
    schema: Schema,
    store: Mutex<MemoryStore>,
    /// Critical section of merge and push transactions. The store mutex
    /// serializes individual statements; this one serializes whole sync
    /// rounds, which span transport suspension points.
    sync_lock: tokio::sync::Mutex<()>,
    registry: RwLock<ModelRegistry>,
    extensions: RwLock<ExtensionRegistry>,
    mode: SyncMode,
    listening: AtomicBool,
}

impl SyncDb {
    /// Opens a database over the given user schema. The internal `sync_*`
    /// tables are appended to the schema automatically.
    pub fn open(user_schema: Schema, mode: SyncMode) -> SyncDb {
        let mut schema = user_schema;
        for table in oplog::internal_tables() {
            schema.add_table(table);
        }
        SyncDb {
            inner: Arc::new(DbInner {
                store: Mutex::new(MemoryStore::new(schema.clone())),
                schema,
                sync_lock: tokio::sync::Mutex::new(()),
                registry: RwLock::new(ModelRegistry::new()),
                extensions: RwLock::new(ExtensionRegistry::new()),
                mode,
                listening: AtomicBool::new(true),
            }),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.inner.mode
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Adds a model to the list of synchronized classes, installing the
    /// tracking listeners for it.
    pub fn track(&self, model_name: &str, table_name: &str) {
        self.track_directed(model_name, table_name, &[Direction::Push, Direction::Pull]);
    }

    /// `directions` restricts how the engine handles the model during push
    /// and pull; a model tracked for one direction only is ignored by the
    /// other procedure.
    pub fn track_directed(&self, model_name: &str, table_name: &str, directions: &[Direction]) {
        self.write_registry(|reg| reg.install(model_name, table_name, directions));
    }

    pub fn extend(&self, model_name: &str, extension: Extension) {
        let mut guard = self.inner.extensions.write().unwrap_or_else(|e| e.into_inner());
        guard.add(model_name, extension);
    }

    pub fn with_store<R>(&self, f: impl FnOnce(&mut MemoryStore) -> SyncResult<R>) -> SyncResult<R> {
        let mut guard = self.inner.store.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn with_registry<R>(&self, f: impl FnOnce(&ModelRegistry) -> R) -> R {
        let guard = self.inner.registry.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write_registry<R>(&self, f: impl FnOnce(&mut ModelRegistry) -> R) -> R {
        let mut guard = self.inner.registry.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn with_extensions<R>(&self, f: impl FnOnce(&ExtensionRegistry) -> R) -> R {
        let guard = self.inner.extensions.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Acquires the merge/push critical section.
    pub async fn lock_sync(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.sync_lock.lock().await
    }

    pub fn listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Change the listening state. With `None` the state is flipped. While
    /// not listening, no operations (nor server-side versions) are
    /// registered; useful to disable the engine in maintenance scripts.
    pub fn toggle_listening(&self, enabled: Option<bool>) {
        let next = enabled.unwrap_or(!self.listening());
        self.inner.listening.store(next, Ordering::SeqCst);
    }

    /// Runs `f` with the given listening state, restoring the previous one.
    pub fn with_listening<R>(&self, enabled: bool, f: impl FnOnce() -> R) -> R {
        let prev = self.listening();
        self.toggle_listening(Some(enabled));
        let result = f();
        self.toggle_listening(Some(prev));
        result
    }

    /// Fills the content type table from the registry.
    pub fn generate_content_types(&self) -> SyncResult<()> {
        self.with_registry(|reg| self.with_store(|store| oplog::generate_content_types(store, reg)))
    }

    pub fn latest_version_id(&self) -> SyncResult<Option<u32>> {
        self.with_store(|store| oplog::latest_version_id(store))
    }
}
