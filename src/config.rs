use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub log: LogConfig,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory under which all repositories are sharded.
    pub root: PathBuf,
    /// Path or name of the git executable.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    /// Deadline for ref, commit and tree reads.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl StorageConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_read_timeout_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_listen")]
    pub listen: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: default_rpc_listen(),
        }
    }
}

fn default_rpc_listen() -> String {
    "0.0.0.0:3033".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:3030".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// Address of the storage RPC service the SSH front end forwards to.
    #[serde(default = "default_storage_addr")]
    pub storage_addr: String,
    /// OpenSSH-format private host key.  An ephemeral Ed25519 key is
    /// generated when unset.
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,
    /// Optional listener serving `/metrics` for the SSH front end.
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen: default_ssh_listen(),
            storage_addr: default_storage_addr(),
            host_key_path: None,
            metrics_listen: None,
        }
    }
}

fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_storage_addr() -> String {
    "127.0.0.1:3033".to_string()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default = "default_log_json")]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_log_json(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.storage.root.as_os_str().is_empty(),
        "storage.root must not be empty"
    );
    anyhow::ensure!(
        !config.storage.git_binary.is_empty(),
        "storage.git_binary must not be empty"
    );
    anyhow::ensure!(
        config.storage.read_timeout_ms > 0,
        "storage.read_timeout_ms must be positive"
    );
    for (name, addr) in [
        ("rpc.listen", &config.rpc.listen),
        ("http.listen", &config.http.listen),
        ("ssh.listen", &config.ssh.listen),
    ] {
        addr.parse::<SocketAddr>()
            .with_context(|| format!("{name} is not a socket address: {addr}"))?;
    }
    if let Some(addr) = &config.ssh.metrics_listen {
        addr.parse::<SocketAddr>()
            .with_context(|| format!("ssh.metrics_listen is not a socket address: {addr}"))?;
    }
    anyhow::ensure!(
        !config.ssh.storage_addr.is_empty(),
        "ssh.storage_addr must not be empty"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("storage:\n  root: /srv/repos\n").unwrap();
        validate_config(&config).unwrap();

        assert_eq!(config.storage.git_binary, "git");
        assert_eq!(config.storage.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.rpc.listen, "0.0.0.0:3033");
        assert_eq!(config.http.listen, "0.0.0.0:3030");
        assert_eq!(config.ssh.listen, "0.0.0.0:2222");
        assert_eq!(config.ssh.storage_addr, "127.0.0.1:3033");
        assert!(config.ssh.host_key_path.is_none());
        assert!(config.ssh.metrics_listen.is_none());
        assert_eq!(config.log.level, "info");
        assert!(config.log.json);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "storage:\n  root: /data\n  git_binary: /usr/bin/git\n  read_timeout_ms: 250\n\
             ssh:\n  storage_addr: storage:3033\n  host_key_path: /etc/ssh/key\n\
             log:\n  json: false\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/data"));
        assert_eq!(config.storage.read_timeout(), Duration::from_millis(250));
        assert_eq!(config.ssh.storage_addr, "storage:3033");
        assert_eq!(config.ssh.host_key_path, Some(PathBuf::from("/etc/ssh/key")));
        assert!(!config.log.json);
    }

    #[test]
    fn rejects_bad_values() {
        let zero_timeout: Config =
            serde_yaml::from_str("storage:\n  root: /srv\n  read_timeout_ms: 0\n").unwrap();
        assert!(validate_config(&zero_timeout).is_err());

        let bad_listen: Config =
            serde_yaml::from_str("storage:\n  root: /srv\nrpc:\n  listen: nowhere\n").unwrap();
        assert!(validate_config(&bad_listen).is_err());

        let bad_metrics: Config = serde_yaml::from_str(
            "storage:\n  root: /srv\nssh:\n  metrics_listen: localhost\n",
        )
        .unwrap();
        assert!(validate_config(&bad_metrics).is_err());

        assert!(serde_yaml::from_str::<Config>("rpc:\n  listen: 0.0.0.0:1\n").is_err());
    }
}
