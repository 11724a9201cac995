//! Middlewares registered on the SSH muxer: panic containment, a tracing span
//! per session, and start/end log lines.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, field, info, info_span, Instrument};

use super::mux::{HandlerError, HandlerResult, Middleware, Next, Request, SessionIo};

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

/// Turns a panicking handler into an ordinary failure (exit status 1).
/// Nothing is written to the session.
pub struct Recover;

#[async_trait]
impl Middleware for Recover {
    async fn call(&self, request: &Request, io: &mut SessionIo, next: Next<'_>) -> HandlerResult {
        match AssertUnwindSafe(next.run(request, io)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    handler = %request.handler_name,
                    correlation_id = %request.correlation_id,
                    panic = %message,
                    "handler panicked"
                );
                Err(HandlerError::Failed(anyhow::anyhow!("handler panicked: {message}")))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Runs the rest of the chain inside an `ssh_session` span.
pub struct Tracing;

#[async_trait]
impl Middleware for Tracing {
    async fn call(&self, request: &Request, io: &mut SessionIo, next: Next<'_>) -> HandlerResult {
        let remote_addr = io.remote_addr.map(|a| a.to_string()).unwrap_or_default();
        let span = info_span!(
            "ssh_session",
            handler = %request.handler_name,
            remote_addr = %remote_addr,
            user = %io.user,
            session_id = %io.session_id,
            correlation_id = %request.correlation_id,
            args = field::Empty,
            exit_code = field::Empty,
            error = field::Empty,
        );
        if !request.arguments.is_empty() {
            span.record("args", field::debug(&request.arguments));
        }

        let result = next.run(request, io).instrument(span.clone()).await;

        if let Err(err) = &result {
            span.record("exit_code", err.exit_code());
            span.record("error", true);
            debug!(parent: &span, error = %err, "handler failed");
        } else {
            span.record("exit_code", 0);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logs the start and end of every session with its duration.
pub struct Logging;

#[async_trait]
impl Middleware for Logging {
    async fn call(&self, request: &Request, io: &mut SessionIo, next: Next<'_>) -> HandlerResult {
        let started = Instant::now();
        info!(
            user = %io.user,
            session_id = %io.session_id,
            remote_addr = ?io.remote_addr,
            command = %request.command,
            pattern = request.pattern.as_deref(),
            "new session"
        );

        let result = next.run(request, io).await;

        let exit_code = result.as_ref().err().map_or(0, HandlerError::exit_code);
        info!(
            user = %io.user,
            session_id = %io.session_id,
            exit_code,
            error = result.as_ref().err().map(tracing::field::display),
            session_length_ms = started.elapsed().as_millis() as u64,
            "session closed"
        );
        result
    }
}
