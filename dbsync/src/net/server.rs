//! The sync server: one tokio task per accepted connection, a path
//! preamble dispatching to the endpoint handlers, and an exception
//! envelope on every fault path.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;

use crate::db::SyncDb;
use crate::error::{Error, SyncResult};
use crate::net::wire::{Frame, JsonTransport};
use crate::server::handlers::{self, ServerState};

pub struct SyncServer {
    pub host: String,
    pub port: u16,
    state: Arc<ServerState>,
}

impl SyncServer {
    pub fn new(db: SyncDb, host: &str, port: u16) -> SyncServer {
        SyncServer { host: host.to_owned(), port, state: ServerState::new(db) }
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Binds the configured address. With port 0 the OS picks one; read it
    /// back from the returned listener.
    pub async fn bind(&self) -> SyncResult<TcpListener> {
        Ok(TcpListener::bind((self.host.as_str(), self.port)).await?)
    }

    /// Accept loop. Runs until the listener stream ends or fails.
    pub async fn run(state: Arc<ServerState>, listener: TcpListener) -> SyncResult<()> {
        log::info!("sync server listening on {:?}", listener.local_addr()?);
        let mut incoming = TcpListenerStream::new(listener);
        while let Some(stream) = incoming.next().await {
            let stream = stream?;
            let peer = stream.peer_addr()?.to_string();
            let state = state.clone();
            tokio::spawn(async move {
                let display = peer.clone();
                if let Err(err) = service(state, stream, peer).await {
                    log::warn!("connection from {} failed: {}", display, err);
                }
            });
        }
        Ok(())
    }

    /// Binds and serves forever.
    pub async fn serve(&self) -> SyncResult<()> {
        let listener = self.bind().await?;
        Self::run(self.state.clone(), listener).await
    }
}

/// Waits for the path preamble and calls the corresponding handler; a
/// handler fault is reported to the peer before the connection closes.
async fn service(state: Arc<ServerState>, stream: TcpStream, peer: String) -> SyncResult<()> {
    let mut transport = JsonTransport::new(stream);
    let preamble = match transport.recv().await? {
        Some(value) => value,
        None => return Ok(()), // peer connected and went away
    };
    let path = match Frame::from_value(&preamble) {
        Ok(Frame::Open { path }) => path,
        _ => {
            let err = Error::BadResponse("expected an open frame naming the path".into());
            let _ = transport.send_error(&err).await;
            return Err(err);
        }
    };
    log::info!("incoming connection from {} at path {}", peer, path);
    let conn_id = state.add_connection(&path, &peer);

    let result = match path.as_str() {
        "/register" => handlers::handle_register(&state, &mut transport).await,
        "/push" => handlers::handle_push(&state, &mut transport).await,
        "/pull" => handlers::handle_pull(&state, &mut transport).await,
        "/status" => handlers::handle_status(&state, &mut transport, conn_id).await,
        "/nop" => Ok(()),
        other => Err(Error::BadResponse(format!("no handler at path {}", other))),
    };

    state.remove_connection(conn_id);
    if let Err(err) = &result {
        log::warn!("handler for {} failed: {}", path, err);
        let _ = transport.send_error(err).await;
    }
    result
}
