//! `git-upload-pack` / `git-receive-pack` over SSH, forwarded to the storage
//! service through the RPC client.

use async_trait::async_trait;
use tracing::debug;

use super::middleware::{Logging, Recover, Tracing};
use super::mux::{Handler, HandlerError, HandlerResult, MuxError, Muxer, Request, SessionIo};
use crate::rpc::StorageClient;
use crate::storage::PackService;

pub const UPLOAD_PACK_PATTERN: &str = r"^git[ -]upload-pack '?/?([0-9a-f/-]+)'?$";
pub const RECEIVE_PACK_PATTERN: &str = r"^git[ -]receive-pack '?/?([0-9a-f/-]+)'?$";

pub struct PackHandler {
    service: PackService,
    client: StorageClient,
}

impl PackHandler {
    pub fn new(service: PackService, client: StorageClient) -> Self {
        Self { service, client }
    }
}

#[async_trait]
impl Handler for PackHandler {
    async fn handle(&self, request: &Request, io: &mut SessionIo) -> HandlerResult {
        let id = request
            .arguments
            .first()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow::anyhow!("no repository given to {}", self.service))?;

        debug!(service = %self.service, %id, storage = self.client.addr(), "forwarding pack session");
        let stdin = &mut io.stdin;
        let stdout = &mut io.stdout;
        let stderr = &mut io.stderr;
        let code = match self.service {
            PackService::UploadPack => self.client.upload_pack(id, stdin, stdout, stderr).await,
            PackService::ReceivePack => self.client.receive_pack(id, stdin, stdout, stderr).await,
        }
        .map_err(anyhow::Error::from)?;

        match code {
            0 => Ok(()),
            code => Err(HandlerError::Exit(code)),
        }
    }
}

/// The muxer served by the SSH front end.
pub fn build_muxer(client: StorageClient) -> Result<Muxer, MuxError> {
    let mut mux = Muxer::new();
    mux.use_middleware(Recover);
    mux.use_middleware(Tracing);
    mux.use_middleware(Logging);
    mux.add_handler(
        UPLOAD_PACK_PATTERN,
        "git.upload-pack",
        PackHandler::new(PackService::UploadPack, client.clone()),
    )?;
    mux.add_handler(
        RECEIVE_PACK_PATTERN,
        "git.receive-pack",
        PackHandler::new(PackService::ReceivePack, client),
    )?;
    Ok(mux)
}
