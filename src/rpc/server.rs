//! Storage RPC server.
//!
//! Unary calls resolve the repository, run one storage operation and reply
//! with a single frame.  `UploadPack`/`ReceivePack` spawn the matching git
//! service and bridge its three standard streams onto the connection until
//! the process exits, then report its exit code.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    framed, recv_frame, send_frame, Code, FrameError, PackRequest, PackResponse, Reply, Request,
    Status, Transport, CHUNK_SIZE,
};
use crate::metrics::{self, MetricsRegistry};
use crate::storage::{PackService, Storage};

type FrameSink = SplitSink<Transport, Bytes>;
type FrameStream = SplitStream<Transport>;

/// Output frames buffered between the pipe readers and the socket writer.
const OUTPUT_QUEUE: usize = 16;

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

pub struct StorageService {
    storage: Storage,
    metrics: MetricsRegistry,
}

impl StorageService {
    pub fn new(storage: Storage, metrics: MetricsRegistry) -> Self {
        Self { storage, metrics }
    }
}

/// Accept connections until `cancel` fires.  Each connection gets a child
/// token, so shutdown also kills every subprocess spawned for a call.
pub async fn serve(
    listener: TcpListener,
    service: Arc<StorageService>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "storage RPC server listening");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("storage RPC server received shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept RPC connection");
                        continue;
                    }
                };

                let service = Arc::clone(&service);
                let cancel = cancel.child_token();
                tokio::spawn(
                    async move {
                        if let Err(err) = service.handle_connection(stream, cancel).await {
                            warn!(error = %err, "RPC connection failed");
                        }
                    }
                    .instrument(info_span!("rpc", %peer)),
                );
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

enum PackFailure {
    Rejected(Status),
    Transport(FrameError),
}

impl From<Status> for PackFailure {
    fn from(status: Status) -> Self {
        Self::Rejected(status)
    }
}

impl From<FrameError> for PackFailure {
    fn from(err: FrameError) -> Self {
        Self::Transport(err)
    }
}

impl StorageService {
    async fn handle_connection(
        &self,
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> Result<(), FrameError> {
        let _conn = self.metrics.connection(metrics::Transport::Rpc);
        // Whatever this call spawned dies with the connection.
        let _kill = cancel.clone().drop_guard();

        let (mut sink, mut frames) = framed(stream).split();
        let Some(request) = recv_frame::<_, Request>(&mut frames).await? else {
            debug!("connection closed before a request was sent");
            return Ok(());
        };

        let method = request.method();
        let started = Instant::now();
        debug!(method, "handling call");

        let code = match request {
            Request::UploadPack(first) => {
                self.pack(PackService::UploadPack, first, &mut sink, frames, &cancel)
                    .await?
            }
            Request::ReceivePack(first) => {
                self.pack(PackService::ReceivePack, first, &mut sink, frames, &cancel)
                    .await?
            }
            request => {
                let reply = tokio::select! {
                    reply = self.unary(request, &cancel) => reply,
                    () = peer_gone(&mut frames) => {
                        debug!(method, "caller went away, abandoning call");
                        cancel.cancel();
                        self.metrics.record_rpc(method, "abandoned", started.elapsed());
                        return Ok(());
                    }
                };
                let code = match &reply {
                    Ok(_) => "ok",
                    Err(status) => {
                        debug!(method, %status, "call failed");
                        status.code.as_str()
                    }
                };
                send_frame(&mut sink, &reply).await?;
                code
            }
        };

        self.metrics.record_rpc(method, code, started.elapsed());
        sink.close().await?;
        Ok(())
    }

    async fn unary(&self, request: Request, cancel: &CancellationToken) -> Result<Reply, Status> {
        match request {
            Request::Create { id } => {
                self.storage.create(&id, cancel).await?;
                Ok(Reply::Created)
            }
            Request::SetDescription { id, description } => {
                let repo = self.storage.repository(&id, cancel).await?;
                repo.set_description(&description).await?;
                Ok(Reply::DescriptionSet)
            }
            Request::Branches { id } => {
                let repo = self.storage.repository(&id, cancel).await?;
                Ok(Reply::Branches(repo.branches(cancel).await?))
            }
            Request::Commit { id, rev } => {
                if rev.is_empty() {
                    return Err(Status::new(Code::InvalidArgument, "no revision given"));
                }
                let repo = self.storage.repository(&id, cancel).await?;
                Ok(Reply::Commit(repo.commit(&rev, cancel).await?))
            }
            Request::Tree { id, rev, path } => {
                if rev.is_empty() {
                    return Err(Status::new(Code::InvalidArgument, "no revision given"));
                }
                let repo = self.storage.repository(&id, cancel).await?;
                Ok(Reply::Tree(repo.tree(&rev, &path, cancel).await?))
            }
            Request::UploadPack(_) | Request::ReceivePack(_) => Err(Status::new(
                Code::InvalidArgument,
                "pack calls must be opened as a stream",
            )),
        }
    }

    /// Run a pack call and write its final frame.  Returns the status label
    /// for metrics.
    async fn pack(
        &self,
        service: PackService,
        first: PackRequest,
        sink: &mut FrameSink,
        frames: FrameStream,
        cancel: &CancellationToken,
    ) -> Result<&'static str, FrameError> {
        match self.bridge(service, first, sink, frames, cancel).await {
            Ok(code) => {
                debug!(%service, exit_code = code, "pack call finished");
                send_frame(sink, &Ok::<_, Status>(PackResponse::ExitCode(code))).await?;
                Ok("ok")
            }
            Err(PackFailure::Rejected(status)) => {
                warn!(%service, %status, "pack call failed");
                send_frame(sink, &Err::<PackResponse, _>(status.clone())).await?;
                Ok(status.code.as_str())
            }
            Err(PackFailure::Transport(err)) => Err(err),
        }
    }

    async fn bridge(
        &self,
        service: PackService,
        first: PackRequest,
        sink: &mut FrameSink,
        frames: FrameStream,
        cancel: &CancellationToken,
    ) -> Result<u32, PackFailure> {
        if first.id.is_empty() {
            return Err(Status::failed_precondition("no repo id given").into());
        }
        if first.stdin.as_ref().is_some_and(|b| !b.is_empty()) {
            return Err(Status::failed_precondition("stdin given on first message").into());
        }
        let repo = self.storage.repository(&first.id, cancel).await.map_err(Status::from)?;

        let mut process = match service {
            PackService::UploadPack => repo.upload_pack(cancel),
            PackService::ReceivePack => repo.receive_pack(cancel),
        }
        .map_err(Status::from)?;
        let span = process.span().clone();

        let stdin_pump = tokio::spawn(pump_stdin(frames, process.stdin.take()).instrument(span));
        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        let stdout = process.stdout.take();
        let stderr = process.stderr.take();

        let stdout_pump = {
            let tx = tx.clone();
            async move { abort_on_error(pump_output(stdout, tx, PackResponse::Stdout).await, cancel) }
        };
        let stderr_pump =
            async move { abort_on_error(pump_output(stderr, tx, PackResponse::Stderr).await, cancel) };
        let writer = async move { abort_on_error(forward(sink, rx).await, cancel) };

        let (status, stdout_res, stderr_res, write_res) =
            tokio::join!(process.wait(), stdout_pump, stderr_pump, writer);
        stdin_pump.abort();

        write_res?;
        stdout_res
            .and(stderr_res)
            .map_err(|e| Status::internal(format!("reading git output: {e}")))?;
        let status = status.map_err(|e| Status::internal(e.to_string()))?;
        Ok(exit_code(status))
    }
}

/// Resolves once the caller closes its side of a unary call.  Unary callers
/// keep the connection open until the reply arrives.
async fn peer_gone(frames: &mut FrameStream) {
    while let Some(Ok(_)) = frames.next().await {}
}

/// Cancel the call if one of its flows broke so the process is killed
/// instead of waited on.
fn abort_on_error<T, E>(result: Result<T, E>, cancel: &CancellationToken) -> Result<T, E> {
    if result.is_err() {
        cancel.cancel();
    }
    result
}

pub(crate) fn exit_code(status: std::process::ExitStatus) -> u32 {
    status
        .code()
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

async fn pump_stdin(mut frames: FrameStream, stdin: Option<ChildStdin>) {
    let Some(mut stdin) = stdin else {
        return;
    };
    loop {
        match recv_frame::<_, PackRequest>(&mut frames).await {
            Ok(Some(PackRequest {
                stdin: Some(chunk), ..
            })) => {
                if let Err(e) = stdin.write_all(&chunk).await {
                    debug!(error = %e, "process stopped reading stdin");
                    return;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("caller closed stdin");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read stdin frame");
                return;
            }
        }
    }
}

async fn pump_output<R: AsyncRead + Unpin>(
    reader: Option<R>,
    tx: mpsc::Sender<PackResponse>,
    wrap: fn(Vec<u8>) -> PackResponse,
) -> std::io::Result<()> {
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
            return Ok(());
        }
    }
}

async fn forward(
    sink: &mut FrameSink,
    mut rx: mpsc::Receiver<PackResponse>,
) -> Result<(), FrameError> {
    while let Some(message) = rx.recv().await {
        send_frame(sink, &Ok::<_, Status>(message)).await?;
    }
    Ok(())
}
