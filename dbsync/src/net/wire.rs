//! Framed JSON transport and the typed control frames exchanged during
//! apply. Every frame is one JSON value inside a length-delimited frame;
//! the stream is reliable, ordered and bidirectional, which is all the
//! payload dance needs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, TryStreamExt};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tokio::net::TcpStream;
use tokio_serde::formats::SymmetricalJson;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{Error, SyncResult};

/// Close reasons may not exceed 123 bytes, so the capped exception form
/// has to fit there; longer detail travels in a prior frame.
pub const MAX_CLOSE_REASON: usize = 123;

/// Bytes per payload chunk frame; base64 expands them by a third.
const PAYLOAD_CHUNK_SIZE: usize = 48 * 1024;

type FramedJson =
    SymmetricallyFramed<Framed<TcpStream, LengthDelimitedCodec>, Json, SymmetricalJson<Json>>;

/// Control frames interleaved with messages on the same channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Connection preamble: which handler the peer wants.
    Open { path: String },
    /// Applier asks the data holder to stream one field's bytes.
    RequestFieldPayload { class_name: String, id_field: String, id: String, field_name: String },
    PayloadChunk { data: String },
    PayloadEnd,
    /// Progress note for one applied operation.
    Info { op: Json },
    /// Terminates a push conversation.
    Result { new_version_id: Option<u32> },
    /// Terminates the pull payload dance.
    Done,
    /// Server fault envelope.
    Exception { extype: String, args: Vec<String> },
}

impl Frame {
    pub fn to_value(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }

    pub fn from_value(value: &Json) -> SyncResult<Frame> {
        serde_json::from_value(value.clone())
            .map_err(|_| Error::BadResponse(format!("not a control frame: {}", value)))
    }
}

/// The full exception envelope, and the truncated form that fits a close
/// reason.
pub fn exception_frames(err: &Error) -> (Frame, Frame) {
    let full = Frame::Exception { extype: err.extype().to_owned(), args: err.wire_args() };
    let serialized = serde_json::to_string(&full.to_value()).unwrap_or_default();
    if serialized.len() <= MAX_CLOSE_REASON {
        return (full.clone(), full);
    }
    let empty = Frame::Exception { extype: err.extype().to_owned(), args: vec![String::new()] };
    let overhead = serde_json::to_string(&empty.to_value()).unwrap_or_default().len();
    let budget = MAX_CLOSE_REASON.saturating_sub(overhead);
    let args: String = err
        .wire_args()
        .join(",")
        .chars()
        .filter(|c| c.is_ascii() && *c != '"' && *c != '\\')
        .take(budget)
        .collect();
    let capped = Frame::Exception { extype: err.extype().to_owned(), args: vec![args] };
    (full, capped)
}

/// One endpoint of the sync conversation.
pub struct JsonTransport {
    framed: FramedJson,
}

impl JsonTransport {
    pub fn new(stream: TcpStream) -> Self {
        let length_delimited = Framed::new(stream, LengthDelimitedCodec::new());
        JsonTransport { framed: SymmetricallyFramed::new(length_delimited, SymmetricalJson::default()) }
    }

    pub async fn send(&mut self, value: Json) -> SyncResult<()> {
        self.framed.send(value).await.map_err(Error::from)
    }

    /// Next frame, or `None` when the peer closed the stream.
    pub async fn recv(&mut self) -> SyncResult<Option<Json>> {
        self.framed.try_next().await.map_err(Error::from)
    }

    /// Next frame; a closed stream is an error here. An exception envelope
    /// is rehydrated and returned as the error it carries.
    pub async fn expect(&mut self) -> SyncResult<Json> {
        let value = self
            .recv()
            .await?
            .ok_or_else(|| Error::BadResponse("connection closed mid-conversation".into()))?;
        if let Ok(Frame::Exception { extype, args }) = Frame::from_value(&value) {
            return Err(Error::from_wire(&extype, args));
        }
        Ok(value)
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> SyncResult<()> {
        self.send(frame.to_value()).await
    }

    pub async fn expect_frame(&mut self) -> SyncResult<Frame> {
        Frame::from_value(&self.expect().await?)
    }

    /// Sends the error envelope: the detailed frame first when it wouldn't
    /// fit a close reason, then the capped one the peer may surface.
    pub async fn send_error(&mut self, err: &Error) -> SyncResult<()> {
        let (full, capped) = exception_frames(err);
        if full != capped {
            self.send_frame(&full).await?;
        }
        self.send_frame(&capped).await
    }

    /// Streams a byte buffer as chunk frames terminated by `PayloadEnd`.
    pub async fn stream_payload(&mut self, bytes: &[u8]) -> SyncResult<()> {
        for chunk in bytes.chunks(PAYLOAD_CHUNK_SIZE) {
            self.send_frame(&Frame::PayloadChunk { data: BASE64.encode(chunk) }).await?;
        }
        self.send_frame(&Frame::PayloadEnd).await
    }

    /// Consumes chunk frames until the end marker.
    pub async fn recv_payload(&mut self) -> SyncResult<Vec<u8>> {
        let mut bytes = Vec::new();
        loop {
            match self.expect_frame().await? {
                Frame::PayloadChunk { data } => {
                    let chunk = BASE64
                        .decode(&data)
                        .map_err(|e| Error::BadResponse(format!("bad payload chunk: {}", e)))?;
                    bytes.extend_from_slice(&chunk);
                }
                Frame::PayloadEnd => return Ok(bytes),
                other => {
                    return Err(Error::BadResponse(format!("expected payload frames, got {:?}", other)))
                }
            }
        }
    }

    /// The applier side of the field payload dance: request, then receive.
    pub async fn request_field_payload(
        &mut self,
        class_name: &str,
        id_field: &str,
        id: &str,
        field_name: &str,
    ) -> SyncResult<Vec<u8>> {
        self.send_frame(&Frame::RequestFieldPayload {
            class_name: class_name.to_owned(),
            id_field: id_field.to_owned(),
            id: id.to_owned(),
            field_name: field_name.to_owned(),
        })
        .await?;
        self.recv_payload().await
    }
}

/// Builds the `{"path": ...}` preamble value.
pub fn open_frame(path: &str) -> Json {
    json!({"type": "open", "path": path})
}
