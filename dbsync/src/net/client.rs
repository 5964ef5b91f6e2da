//! The sync client: connects per round, runs the push/pull conversations
//! and the bounded synchronize loop.

use std::time::Duration;

use serde_json::{json, Value as Json};
use tokio::net::TcpStream;

use crate::client::merge::merge;
use crate::compression;
use crate::db::SyncDb;
use crate::error::{Error, SyncResult};
use crate::messages::pull::{PullMessage, PullRequestMessage};
use crate::messages::push::PushMessage;
use crate::messages::register::RegisterMessage;
use crate::net::wire::{open_frame, Frame, JsonTransport};
use crate::oplog::{self, Node, Version};
use crate::perform::respond_field_payload;

/// Maximum pull-then-retry rounds of one synchronize call.
pub const MAX_PUSH_ROUNDS: usize = 15;

/// Client endpoint for one sync server.
pub struct SyncClient {
    pub host: String,
    pub port: u16,
    db: SyncDb,
}

impl SyncClient {
    pub fn new(db: SyncDb, host: &str, port: u16) -> SyncClient {
        SyncClient { host: host.to_owned(), port, db }
    }

    pub fn db(&self) -> &SyncDb {
        &self.db
    }

    async fn connect(&self, path: &str) -> SyncResult<JsonTransport> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let mut transport = JsonTransport::new(stream);
        transport.send(open_frame(path)).await?;
        Ok(transport)
    }

    /// Requests a node registry from the server and stores it locally.
    /// An earlier registration stays in the database but is no longer
    /// used.
    pub async fn register(&self, extra_data: Option<Json>) -> SyncResult<Node> {
        let mut transport = self.connect("/register").await?;
        transport.send(json!({ "extra_data": extra_data })).await?;
        let raw = transport.expect().await?;
        let message = RegisterMessage::decode(&raw)?;
        self.db.with_store(|store| oplog::save_node(store, &message.node))?;
        Ok(message.node)
    }

    pub fn is_registered(&self) -> SyncResult<bool> {
        Ok(self.db.with_store(|store| oplog::get_node(store))?.is_some())
    }

    /// One push round. On success the server's new version id is assigned
    /// to the pushed operations; `None` means the push carried no
    /// effective operation.
    pub async fn push(&self) -> SyncResult<Option<u32>> {
        compression::compress(&self.db)?;
        let mut message = PushMessage::new();
        message.latest_version_id = self.db.latest_version_id()?;
        message.add_unversioned_operations(&self.db)?;
        let node = self
            .db
            .with_store(|store| oplog::get_node(store))?
            .ok_or_else(|| Error::Registry("no node registered; call register first".into()))?;
        message.set_node(&node);

        let mut transport = self.connect("/push").await?;
        transport.send(message.encode(&self.db)?).await?;

        loop {
            match transport.expect_frame().await? {
                Frame::RequestFieldPayload { class_name, id, field_name, .. } => {
                    respond_field_payload(&self.db, &mut transport, &class_name, &id, &field_name).await?;
                }
                Frame::Info { op } => {
                    log::debug!("server applied {}", op);
                }
                Frame::Result { new_version_id } => {
                    if let Some(version_id) = new_version_id {
                        self.assign_version(&message, version_id)?;
                    }
                    return Ok(new_version_id);
                }
                other => {
                    return Err(Error::BadResponse(format!("unexpected frame during push: {:?}", other)))
                }
            }
        }
    }

    /// Replays the pushed selection of operation rows with the version id
    /// the server answered, and mirrors the new version locally.
    fn assign_version(&self, message: &PushMessage, version_id: u32) -> SyncResult<()> {
        self.db.with_store(|store| {
            for op in &message.operations {
                let mut versioned = op.clone();
                versioned.version_id = Some(version_id);
                oplog::update_operation(store, &versioned)?;
            }
            oplog::insert_version(
                store,
                &Version { version_id, node_id: message.node_id, created_at: oplog::now() },
            )
        })
    }

    /// One pull round: fetch what the server has past our latest version
    /// and merge it. Returns the number of pulled operations.
    pub async fn pull(&self, extra_data: Json) -> SyncResult<usize> {
        let operations = compression::compress(&self.db)?;
        let request = PullRequestMessage::new(self.db.latest_version_id()?, operations, extra_data);

        let mut transport = self.connect("/pull").await?;
        transport.send(request.encode()).await?;
        let raw = transport.expect().await?;
        let message = PullMessage::decode(&self.db, &raw)
            .map_err(|_| Error::BadResponse("response object isn't a valid pull message".into()))?;
        let pulled = message.operations.len();

        merge(&self.db, &message, Some(&mut transport)).await?;
        transport.send_frame(&Frame::Done).await?;
        Ok(pulled)
    }

    /// Push until the server takes it: on `PullSuggested` and transient
    /// faults, pull, merge, and retry, up to a bounded number of rounds.
    /// A `UniqueConstraintError` raised by the merge is not retriable and
    /// surfaces to the caller.
    pub async fn synchronize(&self) -> SyncResult<Option<u32>> {
        let mut backoff = Duration::from_millis(50);
        for round in 0..MAX_PUSH_ROUNDS {
            match self.push().await {
                Ok(new_version_id) => return Ok(new_version_id),
                Err(Error::PullSuggested(reason)) => {
                    log::info!("round {}: pull suggested: {}", round, reason);
                    self.pull(Json::Null).await?;
                }
                Err(err) if err.is_transient() => {
                    log::warn!("round {}: transient fault: {}; retrying", round, err);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    self.pull(Json::Null).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::PushRejected(format!(
            "synchronization didn't converge after {} rounds",
            MAX_PUSH_ROUNDS
        )))
    }

    pub async fn status(&self) -> SyncResult<Json> {
        let mut transport = self.connect("/status").await?;
        transport.send(json!({})).await?;
        transport.expect().await
    }
}
