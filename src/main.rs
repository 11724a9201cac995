mod config;
mod health;
mod http;
mod metrics;
mod process;
mod rpc;
mod ssh;
mod storage;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogConfig};
use crate::metrics::MetricsRegistry;
use crate::process::ProcessTracker;
use crate::rpc::server::StorageService;
use crate::rpc::StorageClient;
use crate::ssh::SshContext;
use crate::storage::{Branch, Commit, Storage, TreeEntry};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "repostore", about = "Git repository storage over SSH, RPC and smart HTTP")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/repostore/config.yaml")]
    config: String,

    /// Storage RPC address for client commands; defaults to `ssh.storage_addr`.
    #[arg(long, global = true)]
    storage_addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve repositories over the storage RPC protocol and smart HTTP.
    Storage,
    /// Serve the SSH front end, forwarding to a storage node.
    Ssh,
    /// Print the tree of a stored repository at a revision.
    Tree {
        /// Repository id.
        id: String,
        /// Revision to list.
        rev: String,
        /// Directory inside the tree; empty or `/` for the root.
        #[arg(default_value = "")]
        path: String,
        /// Ask a storage node over RPC instead of reading local storage.
        #[arg(long)]
        remote: bool,
    },
    /// Create a bare repository on a storage node.
    Create { id: String },
    /// Set the description of a repository on a storage node.
    Describe { id: String, text: String },
    /// List the branches of a repository on a storage node.
    Branches { id: String },
    /// Show one commit of a repository on a storage node.
    Show { id: String, rev: String },
}

impl Command {
    /// Whether this command talks to a storage node over RPC.
    fn is_client(&self) -> bool {
        match self {
            Self::Tree { remote, .. } => *remote,
            Self::Create { .. } | Self::Describe { .. } | Self::Branches { .. } | Self::Show { .. } => true,
            Self::Storage | Self::Ssh => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

// ---------------------------------------------------------------------------
// Storage node
// ---------------------------------------------------------------------------

async fn run_storage(config: &Config, cancel: CancellationToken) -> Result<()> {
    let metrics = MetricsRegistry::new();
    let tracker =
        ProcessTracker::with_spawn_counter(metrics.metrics.processes_spawned_total.clone());
    let storage = Storage::new(
        &config.storage.root,
        &config.storage.git_binary,
        tracker.clone(),
        config.storage.read_timeout(),
    )
    .context("failed to open storage root")?;
    tracing::info!(root = %config.storage.root.display(), "storage opened");

    let rpc_listener = TcpListener::bind(&config.rpc.listen)
        .await
        .with_context(|| format!("failed to bind RPC listener on {}", config.rpc.listen))?;
    let http_listener = TcpListener::bind(&config.http.listen)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http.listen))?;

    let service = Arc::new(StorageService::new(storage.clone(), metrics.clone()));
    let rpc_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = rpc::server::serve(rpc_listener, service, cancel.clone()).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        }
    });

    let app = http::create_router(http::AppState {
        storage,
        metrics,
        cancel: cancel.clone(),
    });
    tracing::info!(addr = %config.http.listen, "HTTP server listening");
    let http_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let shutdown = cancel.clone();
            let result = axum::serve(http_listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .context("HTTP server error");
            if result.is_err() {
                cancel.cancel();
            }
            result
        }
    });

    let (rpc_result, http_result) = tokio::join!(rpc_handle, http_handle);

    tracing::info!(outstanding = tracker.outstanding(), "waiting for subprocesses");
    tracker.wait_all().await;

    rpc_result.context("RPC server task panicked")??;
    http_result.context("HTTP server task panicked")??;
    Ok(())
}

// ---------------------------------------------------------------------------
// SSH front end
// ---------------------------------------------------------------------------

async fn run_ssh(config: &Config, cancel: CancellationToken) -> Result<()> {
    let metrics = MetricsRegistry::new();
    let client = StorageClient::new(config.ssh.storage_addr.clone());
    let muxer = ssh::git::build_muxer(client).context("failed to register SSH handlers")?;
    let context = Arc::new(SshContext {
        muxer,
        metrics: metrics.clone(),
    });

    if let Some(addr) = &config.ssh.metrics_listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
        tracing::info!(%addr, "metrics server listening");
        let app = http::metrics_router(metrics, None);
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                tracing::error!(error = %e, "metrics server failed");
            }
        });
    }

    ssh::run(&config.ssh, context, cancel).await
}

// ---------------------------------------------------------------------------
// Client commands
// ---------------------------------------------------------------------------

async fn run_tree(config: &Config, id: &str, rev: &str, path: &str) -> Result<()> {
    let storage = Storage::new(
        &config.storage.root,
        &config.storage.git_binary,
        ProcessTracker::new(),
        config.storage.read_timeout(),
    )
    .context("failed to open storage root")?;
    let cancel = CancellationToken::new();
    let repo = storage.repository(id, &cancel).await?;
    let entries = repo.tree(rev, path, &cancel).await?;
    print!("{}", format_tree(&entries));
    Ok(())
}

async fn run_client(client: &StorageClient, command: &Command) -> Result<()> {
    match command {
        Command::Tree { id, rev, path, .. } => {
            print!("{}", format_tree(&client.tree(id, rev, path).await?));
        }
        Command::Create { id } => {
            client.create(id).await?;
            println!("created {id}");
        }
        Command::Describe { id, text } => client.set_description(id, text).await?,
        Command::Branches { id } => print!("{}", format_branches(&client.branches(id).await?)),
        Command::Show { id, rev } => print!("{}", format_commit(&client.commit(id, rev).await?)),
        Command::Storage | Command::Ssh => {}
    }
    Ok(())
}

/// Render rows as a table, padding every column but the last to its widest
/// cell plus three spaces.
fn format_table<const N: usize>(rows: &[[&str; N]]) -> String {
    const PADDING: usize = 3;

    let mut widths = [0usize; N];
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i + 1 == N {
                out.push_str(cell);
            } else {
                out.push_str(&format!("{cell:<w$}", w = widths[i] + PADDING));
            }
        }
        out.push('\n');
    }
    out
}

fn format_tree(entries: &[TreeEntry]) -> String {
    let mut rows = vec![["Mode", "Type", "Object", "Path"]];
    rows.extend(
        entries
            .iter()
            .map(|e| [e.mode.as_str(), e.kind.as_str(), e.object.as_str(), e.path.as_str()]),
    );
    format_table(&rows)
}

fn format_branches(branches: &[Branch]) -> String {
    let mut rows = vec![["Object", "Type", "Branch"]];
    rows.extend(
        branches
            .iter()
            .map(|b| [b.sha1.as_str(), b.kind.as_str(), b.name.as_str()]),
    );
    format_table(&rows)
}

fn format_commit(commit: &Commit) -> String {
    let mut out = format!("commit {}\ntree {}\n", commit.hash, commit.tree);
    if !commit.parent.is_empty() {
        out.push_str(&format!("parent {}\n", commit.parent));
    }
    out.push_str(&format!(
        "author {}\ncommitter {}\n\n{}\n",
        commit.author, commit.committer, commit.message
    ));
    if !commit.body.is_empty() {
        out.push_str(&commit.body);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    init_tracing(&config.log);

    if cli.command.is_client() {
        let addr = cli.storage_addr.clone().unwrap_or_else(|| config.ssh.storage_addr.clone());
        return run_client(&StorageClient::new(addr), &cli.command).await;
    }
    if let Command::Tree { id, rev, path, .. } = &cli.command {
        return run_tree(&config, id, rev, path).await;
    }

    tracing::info!(config_path = %cli.config, command = ?cli.command, "starting repostore");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Storage => run_storage(&config, cancel).await?,
        Command::Ssh => run_ssh(&config, cancel).await?,
        _ => {}
    }

    tracing::info!("repostore shut down cleanly");
    Ok(())
}
