//! Subprocess execution shared by the storage engine, the RPC bridge and the
//! smart-HTTP handlers.
//!
//! Every invocation goes through [`Command::start`], which opens a `process`
//! tracing span tagged with the program, its arguments and the working
//! directory, and registers the child with a [`ProcessTracker`].  The tracker
//! entry is released when the [`Process`] handle is waited on (or dropped),
//! which lets `main` drain all outstanding git processes before exiting.
//!
//! Standard streams that are not supplied by the caller are piped and exposed
//! on the handle.  Children are tied to a [`CancellationToken`]: cancelling
//! the token kills the child and unblocks [`Process::wait`].

use std::path::PathBuf;
use std::process::{ExitStatus, Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use tracing::{debug, field, info_span, warn, Span};

use crate::metrics::ProgramLabels;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },

    #[error("i/o error talking to {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Counts spawned processes that have not been waited on yet.
///
/// Cloning is cheap; all clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ProcessTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    outstanding: AtomicUsize,
    idle: Notify,
    spawned: Option<Family<ProgramLabels, Counter>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker that also counts every successful spawn in `spawned`.
    pub fn with_spawn_counter(spawned: Family<ProgramLabels, Counter>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                spawned: Some(spawned),
                ..TrackerInner::default()
            }),
        }
    }

    /// Number of processes started but not yet waited on.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Block until every started process has been waited on.
    pub async fn wait_all(&self) {
        loop {
            // Register interest before checking so a concurrent release
            // cannot slip between the check and the await.
            let idle = self.inner.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            idle.await;
        }
    }

    fn register(&self, program: &str) -> TrackerGuard {
        if let Some(spawned) = &self.inner.spawned {
            spawned
                .get_or_create(&ProgramLabels {
                    program: program.to_string(),
                })
                .inc();
        }
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        TrackerGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Releases one tracker slot when dropped.
struct TrackerGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Command builder
// ---------------------------------------------------------------------------

/// Description of a subprocess to start.
pub struct Command {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    stdin: Option<Stdio>,
    stdout: Option<Stdio>,
    stderr: Option<Stdio>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            envs: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Wire the child's stdin to `stdio` instead of a pipe.
    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = Some(stdio);
        self
    }

    /// Have the child write its stdout to `stdio` directly.
    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = Some(stdio);
        self
    }

    /// Have the child write its stderr to `stdio` directly.
    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = Some(stdio);
        self
    }

    /// Spawn the process.
    ///
    /// The returned handle must be waited on to release its slot in
    /// `tracker`; dropping it without waiting kills the child.
    pub fn start(
        self,
        tracker: &ProcessTracker,
        cancel: &CancellationToken,
    ) -> Result<Process, ProcessError> {
        let dir = self
            .dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        let span = info_span!(
            "process",
            program = %self.program,
            args = ?self.args,
            dir = %dir,
            pid = field::Empty,
            exit_code = field::Empty,
            error = field::Empty,
        );

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd.stdin(self.stdin.unwrap_or_else(Stdio::piped));
        cmd.stdout(self.stdout.unwrap_or_else(Stdio::piped));
        cmd.stderr(self.stderr.unwrap_or_else(Stdio::piped));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                span.record("error", true);
                warn!(parent: &span, error = %source, "failed to start process");
                return Err(ProcessError::Spawn {
                    program: self.program,
                    source,
                });
            }
        };

        if let Some(pid) = child.id() {
            span.record("pid", pid);
        }
        debug!(parent: &span, "process started");

        let guard = tracker.register(&self.program);
        Ok(Process {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            span,
            cancel: cancel.clone(),
            program: self.program,
            _guard: guard,
        })
    }
}

// ---------------------------------------------------------------------------
// Process handle
// ---------------------------------------------------------------------------

/// A running subprocess plus whichever of its standard streams were piped.
pub struct Process {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    child: Child,
    span: Span,
    cancel: CancellationToken,
    program: String,
    _guard: TrackerGuard,
}

impl Process {
    /// The `process` span opened for this invocation.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Wait for the child to exit, killing it if the cancellation token
    /// fires first.  Consumes the handle, closing the span and releasing the
    /// tracker slot.
    pub async fn wait(mut self) -> Result<ExitStatus, ProcessError> {
        // The child never sees EOF while we hold its stdin.
        drop(self.stdin.take());

        let result = tokio::select! {
            status = self.child.wait() => status.map_err(|source| ProcessError::Wait {
                program: self.program.clone(),
                source,
            }),
            () = self.cancel.cancelled() => {
                debug!(parent: &self.span, "cancelled, killing process");
                if let Err(e) = self.child.kill().await {
                    warn!(parent: &self.span, error = %e, "failed to kill process");
                }
                Err(ProcessError::Cancelled {
                    program: self.program.clone(),
                })
            }
        };

        match &result {
            Ok(status) => {
                if let Some(code) = status.code() {
                    self.span.record("exit_code", code);
                }
                if !status.success() {
                    self.span.record("error", true);
                }
            }
            Err(_) => {
                self.span.record("error", true);
            }
        }
        debug!(parent: &self.span, "process finished");
        result
    }

    /// Collect piped stdout and stderr, then wait for the child.
    pub async fn output(mut self) -> Result<Output, ProcessError> {
        let stdout = self.stdout.take();
        let stderr = self.stderr.take();
        let cancel = self.cancel.clone();

        let reads = async { tokio::join!(read_all(stdout), read_all(stderr)) };
        let (stdout, stderr) = tokio::select! {
            r = reads => r,
            () = cancel.cancelled() => {
                let program = self.program.clone();
                let _ = self.wait().await;
                return Err(ProcessError::Cancelled { program });
            }
        };

        let program = self.program.clone();
        let stdout = stdout.map_err(|source| ProcessError::Io {
            program: program.clone(),
            source,
        })?;
        let stderr = stderr.map_err(|source| ProcessError::Io { program, source })?;
        let status = self.wait().await?;

        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
