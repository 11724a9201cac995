//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound connection is served by a dedicated [`SshSession`].  Every
//! `exec` (or `shell`) request on a channel is dispatched through the
//! [`Muxer`] on a background task; channel data becomes the handler's stdin,
//! and its stdout/stderr are relayed back as channel data and extended data.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine as _;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use super::mux::{Muxer, SessionIo};
use crate::metrics::{self, ConnectionGuard, MetricsRegistry};
use crate::rpc::CHUNK_SIZE;

/// SSH extended data type for stderr (RFC 4254 section 5.2).
const EXTENDED_STDERR: u32 = 1;

/// State shared by every connection of one SSH server.
pub struct SshContext {
    pub muxer: Muxer,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    context: Arc<SshContext>,
    peer_addr: Option<SocketAddr>,
    session_id: String,
    user: String,
    /// Stdin feeds of channels whose command is running.
    inputs: HashMap<ChannelId, mpsc::UnboundedSender<Bytes>>,
    _connection: ConnectionGuard,
}

impl SshSession {
    pub fn new(context: Arc<SshContext>, peer_addr: Option<SocketAddr>) -> Self {
        let connection = context.metrics.connection(metrics::Transport::Ssh);
        Self {
            context,
            peer_addr,
            session_id: Uuid::new_v4().to_string(),
            user: String::new(),
            inputs: HashMap::new(),
            _connection: connection,
        }
    }

    /// Run `command` on `channel` in the background.  The channel is closed
    /// with the command's exit status once the handler returns and its output
    /// has been flushed.
    fn start(&mut self, channel: ChannelId, command: String, session: &mut Session) {
        let (input, input_rx) = mpsc::unbounded_channel();
        self.inputs.insert(channel, input);

        let stdin = StreamReader::new(
            UnboundedReceiverStream::new(input_rx).map(Ok::<_, std::io::Error>),
        );
        let (stdout, stdout_rx) = tokio::io::duplex(CHUNK_SIZE);
        let (stderr, stderr_rx) = tokio::io::duplex(CHUNK_SIZE);
        let mut io = SessionIo {
            user: self.user.clone(),
            remote_addr: self.peer_addr,
            session_id: self.session_id.clone(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        };

        let handle = session.handle();
        let context = Arc::clone(&self.context);
        let span = info_span!("ssh_channel", session_id = %self.session_id, channel = ?channel);
        tokio::spawn(
            async move {
                let out = tokio::spawn(relay(handle.clone(), channel, stdout_rx, None));
                let err = tokio::spawn(relay(handle.clone(), channel, stderr_rx, Some(EXTENDED_STDERR)));

                let outcome = context.muxer.dispatch(&command, &mut io).await;
                // Closes the write halves so the relays drain and stop.
                drop(io);
                let _ = out.await;
                let _ = err.await;

                context
                    .metrics
                    .record_ssh_session(&outcome.handler_name, outcome.exit_code);
                debug!(handler = %outcome.handler_name, exit_code = outcome.exit_code, "closing channel");
                finish_channel(&handle, channel, outcome.exit_code).await;
            }
            .instrument(span),
        );
    }
}

// ---------------------------------------------------------------------------
// Channel helpers
// ---------------------------------------------------------------------------

/// Copy one handler output stream onto the channel, as extended data when
/// `extended` is set.
async fn relay(handle: Handle, channel: ChannelId, reader: DuplexStream, extended: Option<u32>) {
    let mut chunks = ReaderStream::with_capacity(reader, CHUNK_SIZE);
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "handler output closed with error");
                return;
            }
        };
        let data = CryptoVec::from_slice(&chunk);
        let sent = match extended {
            Some(code) => handle.extended_data(channel, code, data).await,
            None => handle.data(channel, data).await,
        };
        if sent.is_err() {
            debug!("channel closed while relaying output");
            return;
        }
    }
}

/// Send exit-status, EOF, and close on a channel in the order git's SSH
/// transport expects (RFC 4254).
async fn finish_channel(handle: &Handle, channel: ChannelId, exit_status: u32) {
    let _ = handle.exit_status_request(channel, exit_status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

// ---------------------------------------------------------------------------
// Fingerprint helper
// ---------------------------------------------------------------------------

/// SHA-256 fingerprint of an SSH public key in the `SHA256:<base64>` form
/// printed by `ssh-keygen -l`.
pub(crate) fn fingerprint_of(key: &PublicKey) -> String {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64().as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Every key is accepted; the fingerprint is only logged.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fingerprint_of(key),
            session_id = %self.session_id,
            "SSH public-key auth"
        );
        self.user = user.to_string();
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel.id(), "session channel opened");
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(input) = self.inputs.get(&channel) {
            if input.send(Bytes::copy_from_slice(data)).is_err() {
                debug!(channel = ?channel, "handler stopped reading stdin");
                self.inputs.remove(&channel);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender ends the handler's stdin.
        self.inputs.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.inputs.remove(&channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).trim().to_string();
        debug!(
            peer = ?self.peer_addr,
            user = %self.user,
            command = %command,
            "SSH exec request"
        );
        self.start(channel, command, session);
        Ok(())
    }

    /// An interactive shell runs the empty command, which prints the banner.
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start(channel, String::new(), session);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use russh_keys::key::KeyPair;

    use super::*;

    #[test]
    fn fingerprint_has_openssh_form() {
        let key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let fp = fingerprint_of(&key);

        assert!(fp.starts_with("SHA256:"), "{fp}");
        // 32-byte digest, unpadded base64.
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert_eq!(fp, fingerprint_of(&key));
    }

    #[test]
    fn distinct_keys_have_distinct_fingerprints() {
        let a = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let b = KeyPair::generate_ed25519().clone_public_key().unwrap();
        assert_ne!(fingerprint_of(&a), fingerprint_of(&b));
    }
}
