//! Storage RPC protocol.
//!
//! One call per TCP connection.  Every message is a length-delimited frame
//! holding a `postcard`-encoded value:
//!
//! - client -> server: one [`Request`]; for the pack calls it is followed by
//!   any number of [`PackRequest`] frames carrying stdin, and the client
//!   half-closes its write side to signal EOF.
//! - server -> client: a single `Result<Reply, Status>` for unary calls, or a
//!   sequence of `Result<PackResponse, Status>` ending with
//!   [`PackResponse::ExitCode`] or an error.

pub mod client;
pub mod server;

use std::fmt;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::storage::{Branch, Commit, StorageError, TreeEntry};

pub use client::StorageClient;

/// Largest frame either side will accept.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
/// Largest stdout/stderr/stdin chunk placed in a single frame.
pub const CHUNK_SIZE: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Create { id: String },
    SetDescription { id: String, description: String },
    Branches { id: String },
    Commit { id: String, rev: String },
    Tree { id: String, rev: String, path: String },
    UploadPack(PackRequest),
    ReceivePack(PackRequest),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::SetDescription { .. } => "set_description",
            Self::Branches { .. } => "branches",
            Self::Commit { .. } => "commit",
            Self::Tree { .. } => "tree",
            Self::UploadPack(_) => "upload_pack",
            Self::ReceivePack(_) => "receive_pack",
        }
    }
}

/// Opening frame of a pack call (names the repository) and every stdin
/// frame after it (carries bytes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRequest {
    pub id: String,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Created,
    DescriptionSet,
    Branches(Vec<Branch>),
    Commit(Commit),
    Tree(Vec<TreeEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackResponse {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitCode(u32),
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    FailedPrecondition,
    InvalidArgument,
    Internal,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailedPrecondition => "failed_precondition",
            Self::InvalidArgument => "invalid_argument",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error status returned to RPC callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
}

impl From<StorageError> for Status {
    fn from(err: StorageError) -> Self {
        let code = if err.is_precondition() {
            Code::FailedPrecondition
        } else {
            Code::Internal
        };
        Self::new(code, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Codec(#[from] postcard::Error),
}

pub type Transport = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> Transport {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_framed(stream)
}

pub async fn send_frame<S, T>(sink: &mut S, message: &T) -> Result<(), FrameError>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    T: Serialize,
{
    let bytes = postcard::to_stdvec(message)?;
    sink.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Next frame decoded as `T`, or `None` once the peer closed its side.
pub async fn recv_frame<S, T>(stream: &mut S) -> Result<Option<T>, FrameError>
where
    S: Stream<Item = std::io::Result<bytes::BytesMut>> + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        Some(frame) => Ok(Some(postcard::from_bytes(&frame?)?)),
        None => Ok(None),
    }
}
