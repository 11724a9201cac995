//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{SshContext, SshSession};
use crate::config::SshConfig;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Hands each incoming connection to an [`SshSession`].
pub struct SshServer {
    context: Arc<SshContext>,
}

impl SshServer {
    pub fn new(context: Arc<SshContext>) -> Self {
        Self { context }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        debug!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.context), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Host keys
// ---------------------------------------------------------------------------

/// Load host keys from `path`, which is either a single private key or a
/// directory of them (`*.pub` files are skipped).  Without a path an
/// ephemeral Ed25519 key is generated.
pub fn load_host_keys(path: Option<&Path>) -> Result<Vec<KeyPair>> {
    let Some(path) = path else {
        warn!("no SSH host key configured; generating ephemeral Ed25519 key");
        return Ok(vec![KeyPair::generate_ed25519()]);
    };

    if !path.is_dir() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key {}", path.display()))?;
        return Ok(vec![key]);
    }

    let mut files = std::fs::read_dir(path)
        .with_context(|| format!("failed to read SSH host key directory {}", path.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", path.display()))?;
    files.retain(|p| p.is_file() && p.extension().map_or(true, |ext| ext != "pub"));
    files.sort();

    let mut keys = Vec::with_capacity(files.len());
    for file in files {
        let key = russh_keys::load_secret_key(&file, None)
            .with_context(|| format!("failed to load SSH host key {}", file.display()))?;
        info!(path = %file.display(), "loaded SSH host key");
        keys.push(key);
    }
    anyhow::ensure!(!keys.is_empty(), "no SSH host keys found in {}", path.display());
    Ok(keys)
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Serve SSH until `cancel` fires.
pub async fn run(config: &SshConfig, context: Arc<SshContext>, cancel: CancellationToken) -> Result<()> {
    let listen_addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid SSH listen address: {:?}", config.listen))?;

    let server_config = Arc::new(server::Config {
        keys: load_host_keys(config.host_key_path.as_deref())?,
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    });

    info!(address = %listen_addr, storage = %config.storage_addr, "starting SSH server");

    let mut ssh_server = SshServer::new(context);
    tokio::select! {
        result = ssh_server.run_on_address(server_config, listen_addr) => {
            result.context("SSH server exited with error")?;
        }
        () = cancel.cancelled() => {
            info!("SSH server received shutdown signal");
        }
    }
    Ok(())
}
