//! Interface for the synchronization server. The server listens to push
//! and pull requests and provides a registry service for new nodes.

pub mod handlers;
pub(crate) mod tracking;

pub use crate::net::server::SyncServer;
pub use handlers::{PushListener, ServerState};
