//! Command multiplexer for SSH sessions.
//!
//! A session's command line is matched against registered regular
//! expressions in registration order; the first match wins and its capture
//! groups become the request's positional arguments.  The empty command goes
//! to a welcome handler and anything unmatched to an "unknown command"
//! handler.  Every invocation runs through the middleware chain, outermost
//! first, and its outcome is turned into an exit status.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

pub const WELCOME_HANDLER: &str = "ssh.welcome";
pub const UNKNOWN_HANDLER: &str = "ssh.unknown";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("a handler is already registered for {0:?}")]
    AlreadyRegistered(String),

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Why a handler did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler ran to completion but wants the session to exit with this
    /// code, typically a subprocess exit code.
    #[error("exit status {0}")]
    Exit(u32),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn exit_code(&self) -> u32 {
        match self {
            Self::Exit(code) => *code,
            Self::Failed(_) => 1,
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

// ---------------------------------------------------------------------------
// Request and session plumbing
// ---------------------------------------------------------------------------

/// What was asked for, resolved against the routing table.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: String,
    /// Pattern that matched, `None` for the welcome/unknown handlers.
    pub pattern: Option<String>,
    pub handler_name: String,
    pub arguments: Vec<String>,
    pub correlation_id: Uuid,
}

/// The session a handler talks to.
pub struct SessionIo {
    pub user: String,
    pub remote_addr: Option<SocketAddr>,
    pub session_id: String,
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &Request, io: &mut SessionIo) -> HandlerResult;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, request: &Request, io: &mut SessionIo, next: Next<'_>) -> HandlerResult;
}

/// The remainder of the chain below a middleware.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl Next<'_> {
    pub async fn run(self, request: &Request, io: &mut SessionIo) -> HandlerResult {
        match self.middlewares.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    middlewares: rest,
                    handler: self.handler,
                };
                first.call(request, io, next).await
            }
            None => self.handler.handle(request, io).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

struct Welcome;

#[async_trait]
impl Handler for Welcome {
    async fn handle(&self, _request: &Request, io: &mut SessionIo) -> HandlerResult {
        let banner = format!("Welcome {}\n", io.user);
        io.stdout.write_all(banner.as_bytes()).await.map_err(anyhow::Error::from)?;
        Ok(())
    }
}

struct Unknown;

#[async_trait]
impl Handler for Unknown {
    async fn handle(&self, _request: &Request, io: &mut SessionIo) -> HandlerResult {
        let message = format!("Welcome {}\n  Unknown command given\n", io.user);
        io.stdout.write_all(message.as_bytes()).await.map_err(anyhow::Error::from)?;
        Err(HandlerError::Exit(1))
    }
}

// ---------------------------------------------------------------------------
// Muxer
// ---------------------------------------------------------------------------

struct Route {
    pattern: String,
    regex: Regex,
    name: String,
    handler: Arc<dyn Handler>,
}

/// Result of dispatching one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub handler_name: String,
    pub exit_code: u32,
}

pub struct Muxer {
    routes: Vec<Route>,
    middlewares: Vec<Arc<dyn Middleware>>,
    welcome: Arc<dyn Handler>,
    unknown: Arc<dyn Handler>,
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            middlewares: Vec::new(),
            welcome: Arc::new(Welcome),
            unknown: Arc::new(Unknown),
        }
    }

    /// Register `handler` for command lines matching `pattern`.  Patterns are
    /// tried in the order they were added.
    pub fn add_handler(
        &mut self,
        pattern: &str,
        name: &str,
        handler: impl Handler + 'static,
    ) -> Result<(), MuxError> {
        if self.routes.iter().any(|r| r.pattern == pattern) {
            return Err(MuxError::AlreadyRegistered(pattern.to_string()));
        }
        let regex = Regex::new(pattern).map_err(|source| MuxError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.routes.push(Route {
            pattern: pattern.to_string(),
            regex,
            name: name.to_string(),
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Append a middleware.  The first one added is the outermost.
    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.middlewares.push(Arc::new(middleware));
    }

    /// Resolve `command` to a request and the handler that serves it.
    pub fn route(&self, command: &str) -> (Request, Arc<dyn Handler>) {
        let mut request = Request {
            command: command.to_string(),
            pattern: None,
            handler_name: UNKNOWN_HANDLER.to_string(),
            arguments: Vec::new(),
            correlation_id: Uuid::new_v4(),
        };

        if command.is_empty() {
            request.handler_name = WELCOME_HANDLER.to_string();
            return (request, Arc::clone(&self.welcome));
        }

        for route in &self.routes {
            let Some(caps) = route.regex.captures(command) else {
                continue;
            };
            request.pattern = Some(route.pattern.clone());
            request.handler_name = route.name.clone();
            request.arguments = caps
                .iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect();
            return (request, Arc::clone(&route.handler));
        }

        (request, Arc::clone(&self.unknown))
    }

    /// Route and run `command`, returning the exit status for the session.
    pub async fn dispatch(&self, command: &str, io: &mut SessionIo) -> Dispatch {
        let (request, handler) = self.route(command);
        let next = Next {
            middlewares: &self.middlewares,
            handler: handler.as_ref(),
        };
        let exit_code = match next.run(&request, io).await {
            Ok(()) => 0,
            Err(err) => err.exit_code(),
        };
        Dispatch {
            handler_name: request.handler_name,
            exit_code,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;

    /// A session whose output can be read back after the handler ran.
    pub(crate) fn session(user: &str, stdin: &'static [u8]) -> (SessionIo, DuplexStream, DuplexStream) {
        let (stdout, stdout_rx) = tokio::io::duplex(64 * 1024);
        let (stderr, stderr_rx) = tokio::io::duplex(64 * 1024);
        let io = SessionIo {
            user: user.to_string(),
            remote_addr: Some("127.0.0.1:50000".parse().unwrap()),
            session_id: "session-1".to_string(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        };
        (io, stdout_rx, stderr_rx)
    }

    pub(crate) async fn drain(io: SessionIo, mut out: DuplexStream) -> String {
        drop(io);
        let mut text = String::new();
        out.read_to_string(&mut text).await.unwrap();
        text
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, request: &Request, io: &mut SessionIo) -> HandlerResult {
            let line = format!("{}\n", request.arguments.join(","));
            io.stdout.write_all(line.as_bytes()).await.map_err(anyhow::Error::from)?;
            Ok(())
        }
    }

    struct Fixed(HandlerResultKind);

    #[derive(Clone, Copy)]
    enum HandlerResultKind {
        Exit(u32),
        Failed,
    }

    #[async_trait]
    impl Handler for Fixed {
        async fn handle(&self, _request: &Request, _io: &mut SessionIo) -> HandlerResult {
            match self.0 {
                HandlerResultKind::Exit(code) => Err(HandlerError::Exit(code)),
                HandlerResultKind::Failed => Err(anyhow::anyhow!("boom").into()),
            }
        }
    }

    /// Records the order middlewares are entered and left.
    struct Trace {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Trace {
        async fn call(&self, request: &Request, io: &mut SessionIo, next: Next<'_>) -> HandlerResult {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            let result = next.run(request, io).await;
            self.log.lock().unwrap().push(format!("leave {}", self.name));
            result
        }
    }

    #[test]
    fn routes_empty_and_unknown_commands() {
        let mut mux = Muxer::new();
        mux.add_handler("^foo$", "foo", Echo).unwrap();

        assert_eq!(mux.route("").0.handler_name, WELCOME_HANDLER);
        assert_eq!(mux.route("unknown").0.handler_name, UNKNOWN_HANDLER);

        let (request, _) = mux.route("foo");
        assert_eq!(request.handler_name, "foo");
        assert_eq!(request.pattern.as_deref(), Some("^foo$"));
        assert!(request.arguments.is_empty());
    }

    #[test]
    fn capture_groups_become_arguments() {
        let mut mux = Muxer::new();
        mux.add_handler("^git[ -]upload-pack ([0-9a-f/-]+)$", "upload", Echo)
            .unwrap();

        let (request, _) = mux.route("git-upload-pack ab/cd-ef");
        assert_eq!(request.handler_name, "upload");
        assert_eq!(request.arguments, ["ab/cd-ef"]);

        let (request, _) = mux.route("git upload-pack 0123");
        assert_eq!(request.arguments, ["0123"]);
    }

    #[test]
    fn first_registered_pattern_wins() {
        let mut mux = Muxer::new();
        mux.add_handler("^git (.+)$", "generic", Echo).unwrap();
        mux.add_handler("^git upload-pack (.+)$", "specific", Echo).unwrap();
        assert_eq!(mux.route("git upload-pack x").0.handler_name, "generic");
    }

    #[test]
    fn duplicate_and_invalid_patterns_are_rejected() {
        let mut mux = Muxer::new();
        mux.add_handler("^foo$", "foo", Echo).unwrap();
        assert!(matches!(
            mux.add_handler("^foo$", "again", Echo),
            Err(MuxError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            mux.add_handler("^foo($", "broken", Echo),
            Err(MuxError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn welcome_and_unknown_output() {
        let mux = Muxer::new();

        let (mut io, out, _err) = session("alice", b"");
        let outcome = mux.dispatch("", &mut io).await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(drain(io, out).await, "Welcome alice\n");

        let (mut io, out, _err) = session("alice", b"");
        let outcome = mux.dispatch("rm -rf /", &mut io).await;
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.handler_name, UNKNOWN_HANDLER);
        assert_eq!(drain(io, out).await, "Welcome alice\n  Unknown command given\n");
    }

    #[tokio::test]
    async fn handler_outcomes_map_to_exit_codes() {
        let mut mux = Muxer::new();
        mux.add_handler("^ok$", "ok", Echo).unwrap();
        mux.add_handler("^exit$", "exit", Fixed(HandlerResultKind::Exit(7))).unwrap();
        mux.add_handler("^fail$", "fail", Fixed(HandlerResultKind::Failed)).unwrap();

        for (command, code) in [("ok", 0), ("exit", 7), ("fail", 1)] {
            let (mut io, _out, _err) = session("bob", b"");
            assert_eq!(mux.dispatch(command, &mut io).await.exit_code, code, "{command}");
        }
    }

    #[tokio::test]
    async fn middlewares_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mux = Muxer::new();
        mux.add_handler("^ok$", "ok", Echo).unwrap();
        for name in ["outer", "middle", "inner"] {
            mux.use_middleware(Trace {
                name,
                log: Arc::clone(&log),
            });
        }

        let (mut io, _out, _err) = session("bob", b"");
        mux.dispatch("ok", &mut io).await;

        assert_eq!(
            *log.lock().unwrap(),
            [
                "enter outer",
                "enter middle",
                "enter inner",
                "leave inner",
                "leave middle",
                "leave outer",
            ]
        );
    }
}
