//! Helpers shared by tests across modules.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsRegistry;
use crate::rpc::server::{serve, StorageService};
use crate::storage::Storage;

/// Write a stand-in git binary into `dir`.
///
/// It reports repository format version 0 for `config`, and for
/// `upload-pack`/`receive-pack` echoes stdin to stdout, prints
/// `remote: <service> done` on stderr and exits with `exit_code`.
pub fn fake_git(dir: &Path, exit_code: i32) -> PathBuf {
    let path = dir.join("fake-git");
    let script = format!(
        "#!/bin/sh\n\
         case \"$1\" in\n\
         \x20 config) echo 0 ;;\n\
         \x20 upload-pack|receive-pack) cat; echo \"remote: $1 done\" >&2; exit {exit_code} ;;\n\
         \x20 *) exit 1 ;;\n\
         esac\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Serve `storage` over RPC on an ephemeral local port.
pub async fn spawn_rpc(storage: Storage) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let service = Arc::new(StorageService::new(storage, MetricsRegistry::new()));
    tokio::spawn(serve(listener, service, cancel.clone()));
    (addr, cancel)
}
