use std::process::Stdio;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::process::Command;
use crate::storage::Storage;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub storage: CheckResult,
    pub git: CheckResult,
    pub processes: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Outstanding subprocess count above which the node reports degraded.
const BUSY_PROCESSES: usize = 256;

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The storage root exists and accepts writes.
async fn check_storage(storage: &Storage) -> CheckResult {
    let root = storage.root();
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return CheckResult::unhealthy(format!("{} is not a directory", root.display())),
        Err(e) => return CheckResult::unhealthy(format!("{}: {e}", root.display())),
    }

    let probe = root.join(format!(".healthz-{}", uuid::Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&probe, b"ok").await {
        return CheckResult::unhealthy(format!("{} is not writable: {e}", root.display()));
    }
    let _ = tokio::fs::remove_file(&probe).await;
    CheckResult::healthy()
}

/// The configured git binary runs.
async fn check_git(storage: &Storage) -> CheckResult {
    let process = match Command::new(storage.git_binary())
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .start(storage.tracker(), &CancellationToken::new())
    {
        Ok(process) => process,
        Err(e) => return CheckResult::unhealthy(e.to_string()),
    };
    match process.output().await {
        Ok(out) if out.status.success() => CheckResult {
            ok: true,
            detail: Some(String::from_utf8_lossy(&out.stdout).trim().to_string()),
        },
        Ok(out) => CheckResult::unhealthy(format!("{} --version exited with {}", storage.git_binary(), out.status)),
        Err(e) => CheckResult::unhealthy(e.to_string()),
    }
}

fn check_processes(storage: &Storage) -> CheckResult {
    let outstanding = storage.tracker().outstanding();
    CheckResult {
        ok: outstanding < BUSY_PROCESSES,
        detail: Some(format!("{outstanding} outstanding")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.storage.ok || !checks.git.ok {
        HealthStatus::Unhealthy
    } else if !checks.processes.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run every check.  200 on Ok/Degraded, 503 on Unhealthy.
pub async fn check(storage: &Storage) -> (StatusCode, Json<HealthResponse>) {
    let (storage_check, git) = tokio::join!(check_storage(storage), check_git(storage));
    let checks = HealthChecks {
        storage: storage_check,
        git,
        processes: check_processes(storage),
    };
    let status = aggregate_status(&checks);

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(HealthResponse { status, checks }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::process::ProcessTracker;

    fn storage(root: &std::path::Path, git: &str) -> Storage {
        Storage::new(root, git, ProcessTracker::new(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn healthy_storage_and_git() {
        let dir = tempfile::tempdir().unwrap();
        let (code, Json(body)) = check(&storage(dir.path(), "git")).await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, HealthStatus::Ok);
        assert!(body.checks.git.detail.unwrap().starts_with("git version"));
        // The write probe is cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_git_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let (code, Json(body)) = check(&storage(dir.path(), "/nonexistent/git")).await;

        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, HealthStatus::Unhealthy);
        assert!(body.checks.storage.ok);
        assert!(!body.checks.git.ok);
    }

    #[tokio::test]
    async fn removed_root_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let storage = storage(&root, "git");
        std::fs::remove_dir(&root).unwrap();

        let (_, Json(body)) = check(&storage).await;
        assert!(!body.checks.storage.ok);
        assert_eq!(body.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn busy_node_is_degraded() {
        let checks = HealthChecks {
            storage: CheckResult::healthy(),
            git: CheckResult::healthy(),
            processes: CheckResult::unhealthy("300 outstanding"),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
    }
}
