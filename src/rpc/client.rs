//! Client side of the storage RPC protocol, used by the SSH front end.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{
    framed, recv_frame, send_frame, FrameError, PackRequest, PackResponse, Reply, Request, Status,
    Transport, CHUNK_SIZE,
};
use crate::storage::{Branch, Commit, TreeEntry};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to storage at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("storage returned {0}")]
    Status(#[from] Status),

    #[error("storage closed the connection before replying")]
    Closed,

    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    #[error("local i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connects to the storage RPC service, one TCP connection per call.
#[derive(Debug, Clone)]
pub struct StorageClient {
    addr: String,
}

impl StorageClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn create(&self, id: &str) -> Result<(), ClientError> {
        match self.call(Request::Create { id: id.to_string() }).await? {
            Reply::Created => Ok(()),
            _ => Err(ClientError::UnexpectedReply("create")),
        }
    }

    pub async fn set_description(&self, id: &str, description: &str) -> Result<(), ClientError> {
        let request = Request::SetDescription {
            id: id.to_string(),
            description: description.to_string(),
        };
        match self.call(request).await? {
            Reply::DescriptionSet => Ok(()),
            _ => Err(ClientError::UnexpectedReply("set_description")),
        }
    }

    pub async fn branches(&self, id: &str) -> Result<Vec<Branch>, ClientError> {
        match self.call(Request::Branches { id: id.to_string() }).await? {
            Reply::Branches(branches) => Ok(branches),
            _ => Err(ClientError::UnexpectedReply("branches")),
        }
    }

    pub async fn commit(&self, id: &str, rev: &str) -> Result<Commit, ClientError> {
        let request = Request::Commit {
            id: id.to_string(),
            rev: rev.to_string(),
        };
        match self.call(request).await? {
            Reply::Commit(commit) => Ok(commit),
            _ => Err(ClientError::UnexpectedReply("commit")),
        }
    }

    pub async fn tree(&self, id: &str, rev: &str, path: &str) -> Result<Vec<TreeEntry>, ClientError> {
        let request = Request::Tree {
            id: id.to_string(),
            rev: rev.to_string(),
            path: path.to_string(),
        };
        match self.call(request).await? {
            Reply::Tree(entries) => Ok(entries),
            _ => Err(ClientError::UnexpectedReply("tree")),
        }
    }

    /// Run `git upload-pack` remotely, pumping the given streams, and return
    /// its exit code.
    pub async fn upload_pack<R, W, E>(
        &self,
        id: &str,
        stdin: R,
        stdout: W,
        stderr: E,
    ) -> Result<u32, ClientError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        self.pack(Request::UploadPack, id, stdin, stdout, stderr).await
    }

    /// Run `git receive-pack` remotely, pumping the given streams, and return
    /// its exit code.
    pub async fn receive_pack<R, W, E>(
        &self,
        id: &str,
        stdin: R,
        stdout: W,
        stderr: E,
    ) -> Result<u32, ClientError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        self.pack(Request::ReceivePack, id, stdin, stdout, stderr).await
    }

    async fn connect(&self) -> Result<Transport, ClientError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        Ok(framed(stream))
    }

    async fn call(&self, request: Request) -> Result<Reply, ClientError> {
        let mut transport = self.connect().await?;
        send_frame(&mut transport, &request).await?;
        let reply: Result<Reply, Status> = recv_frame(&mut transport)
            .await?
            .ok_or(ClientError::Closed)?;
        Ok(reply?)
    }

    async fn pack<R, W, E>(
        &self,
        open: fn(PackRequest) -> Request,
        id: &str,
        mut stdin: R,
        mut stdout: W,
        mut stderr: E,
    ) -> Result<u32, ClientError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let (mut sink, mut frames) = self.connect().await?.split();
        send_frame(
            &mut sink,
            &open(PackRequest {
                id: id.to_string(),
                stdin: None,
            }),
        )
        .await?;

        let upload = async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = stdin.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let chunk = PackRequest {
                    id: String::new(),
                    stdin: Some(buf[..n].to_vec()),
                };
                send_frame(&mut sink, &chunk).await?;
            }
            // Half-close so the remote process sees EOF on stdin.
            sink.close().await?;
            Ok::<_, ClientError>(())
        };

        let download = async move {
            loop {
                match recv_frame::<_, Result<PackResponse, Status>>(&mut frames).await? {
                    Some(Ok(PackResponse::Stdout(chunk))) => stdout.write_all(&chunk).await?,
                    Some(Ok(PackResponse::Stderr(chunk))) => stderr.write_all(&chunk).await?,
                    Some(Ok(PackResponse::ExitCode(code))) => {
                        stdout.flush().await?;
                        stderr.flush().await?;
                        return Ok(code);
                    }
                    Some(Err(status)) => return Err(ClientError::Status(status)),
                    None => return Err(ClientError::Closed),
                }
            }
        };

        tokio::pin!(upload);
        tokio::pin!(download);
        let mut uploading = true;
        loop {
            tokio::select! {
                result = &mut upload, if uploading => {
                    uploading = false;
                    if let Err(e) = result {
                        // The process may already be done with its input;
                        // its exit code is still worth waiting for.
                        debug!(error = %e, "stopped sending stdin");
                    }
                }
                result = &mut download => return result,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
