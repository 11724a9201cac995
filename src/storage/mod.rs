//! On-disk repository storage.
//!
//! Repositories are bare git repositories laid out under a single root,
//! sharded by their normalised identifier.  All reads shell out to git
//! plumbing commands through the [`crate::process`] runner and parse the
//! output with [`object`].

pub mod error;
pub mod object;

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::process::{Command, Process, ProcessTracker};

pub use error::StorageError;
pub use object::{Branch, Commit, TreeEntry};

/// Characters removed from an identifier before it is sharded.
const ID_SEPARATORS: [char; 2] = ['/', '-'];
/// Length of each of the two directory prefixes.
const SHARD_WIDTH: usize = 2;
const MIN_ID_LEN: usize = 2 * SHARD_WIDTH + 1;
const REPOSITORY_FORMAT_VERSION: &str = "0";
/// Deadline for `git init --bare`.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Strip separators from `id` and check what is left can be sharded.
pub fn normalize_id(id: &str) -> Result<String, StorageError> {
    let normalized: String = id.chars().filter(|c| !ID_SEPARATORS.contains(c)).collect();
    if normalized.len() < MIN_ID_LEN || !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(normalized)
}

/// `root/ab/cd/efgh...` for the normalised identifier `abcdefgh...`.
pub fn shard_path(root: &Path, normalized: &str) -> PathBuf {
    root.join(&normalized[..SHARD_WIDTH])
        .join(&normalized[SHARD_WIDTH..2 * SHARD_WIDTH])
        .join(&normalized[2 * SHARD_WIDTH..])
}

// ---------------------------------------------------------------------------
// Pack services
// ---------------------------------------------------------------------------

/// The two git transfer services that talk the pack protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackService {
    UploadPack,
    ReceivePack,
}

impl PackService {
    /// The git subcommand, e.g. `upload-pack`.
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    /// Parse a `git-upload-pack` style service name.
    pub fn from_service_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }
}

impl std::fmt::Display for PackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "git-{}", self.subcommand())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Handle on the storage root.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    git: String,
    tracker: ProcessTracker,
    read_timeout: Duration,
}

impl Storage {
    /// Open (creating if needed) the storage root.
    pub fn new(
        root: impl Into<PathBuf>,
        git: impl Into<String>,
        tracker: ProcessTracker,
        read_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StorageError::io(format!("failed to create storage root {}", root.display()), e))?;
        Ok(Self {
            root,
            git: git.into(),
            tracker,
            read_timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git_binary(&self) -> &str {
        &self.git
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    /// Directory holding the repository named by `id`.
    pub fn repo_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        Ok(shard_path(&self.root, &normalize_id(id)?))
    }

    /// Create a bare repository for `id`.
    #[instrument(skip(self, cancel))]
    pub async fn create(&self, id: &str, cancel: &CancellationToken) -> Result<Repository, StorageError> {
        let path = self.repo_path(id)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::io(format!("failed to create {}", path.display()), e))?;

        let repo = self.open(id, path);
        let process = Command::new(&self.git)
            .args(["init", "--bare"])
            .current_dir(repo.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .start(&self.tracker, cancel)?;
        let out = match tokio::time::timeout(INIT_TIMEOUT, process.output()).await {
            Ok(out) => out?,
            Err(_) => {
                warn!(%id, timeout = ?INIT_TIMEOUT, "git init timed out");
                return Err(StorageError::Timeout("init".to_string()));
            }
        };
        if !out.status.success() {
            return Err(command_failed("init", &out));
        }

        info!(path = %repo.path().display(), "repository created");
        Ok(repo)
    }

    /// Look up an existing repository, checking that it is a valid git
    /// repository on every call.
    #[instrument(skip(self, cancel))]
    pub async fn repository(&self, id: &str, cancel: &CancellationToken) -> Result<Repository, StorageError> {
        let path = self.repo_path(id)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::RepoNotValid(id.to_string()));
        }

        let repo = self.open(id, path);
        let out = match repo
            .read(&["config", "--get", "core.repositoryformatversion"], cancel)
            .await
        {
            Ok(out) => out,
            Err(StorageError::Command { .. }) => return Err(StorageError::RepoNotValid(id.to_string())),
            Err(e) => return Err(e),
        };
        if String::from_utf8_lossy(&out.stdout).trim() != REPOSITORY_FORMAT_VERSION {
            return Err(StorageError::RepoNotValid(id.to_string()));
        }
        Ok(repo)
    }

    fn open(&self, id: &str, path: PathBuf) -> Repository {
        Repository {
            id: id.to_string(),
            path,
            git: self.git.clone(),
            tracker: self.tracker.clone(),
            read_timeout: self.read_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Repository {
    id: String,
    path: PathBuf,
    git: String,
    tracker: ProcessTracker,
    read_timeout: Duration,
}

impl Repository {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn set_description(&self, description: &str) -> Result<(), StorageError> {
        let file = self.path.join("description");
        tokio::fs::write(&file, format!("{description}\n"))
            .await
            .map_err(|e| StorageError::io(format!("failed to write {}", file.display()), e))
    }

    /// All branches under `refs/heads`.  One malformed line fails the call.
    #[instrument(skip(self, cancel), fields(id = %self.id))]
    pub async fn branches(&self, cancel: &CancellationToken) -> Result<Vec<Branch>, StorageError> {
        let out = self
            .read(
                &[
                    "for-each-ref",
                    "--format=%(objectname) %(objecttype) %(refname)",
                    "refs/heads",
                ],
                cancel,
            )
            .await?;
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(object::parse_branch_line)
            .collect()
    }

    #[instrument(skip(self, cancel), fields(id = %self.id))]
    pub async fn commit(&self, rev: &str, cancel: &CancellationToken) -> Result<Commit, StorageError> {
        let out = match self.read(&["cat-file", "-p", rev], cancel).await {
            Ok(out) => out,
            Err(StorageError::Command { stderr, .. }) if is_unknown_revision(&stderr) => {
                return Err(StorageError::NotFound(format!("revision {rev}")));
            }
            Err(e) => return Err(e),
        };
        object::parse_commit(&String::from_utf8_lossy(&out.stdout), rev)
    }

    /// Entries of the tree at `rev`, restricted to the directory `path`.
    #[instrument(skip(self, cancel), fields(id = %self.id))]
    pub async fn tree(
        &self,
        rev: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TreeEntry>, StorageError> {
        let mut args = vec!["ls-tree".to_string(), rev.to_string()];
        let path = path.trim_start_matches('/');
        if !path.is_empty() {
            if path.ends_with('/') {
                args.push(path.to_string());
            } else {
                args.push(format!("{path}/"));
            }
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = match self.read(&args, cancel).await {
            Ok(out) => out,
            Err(StorageError::Command { stderr, .. }) if is_unknown_revision(&stderr) => {
                return Err(StorageError::NotFound(format!("revision {rev}")));
            }
            Err(e) => return Err(e),
        };
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(object::parse_tree_entry)
            .collect()
    }

    /// Start `git upload-pack .` with all three streams piped.
    pub fn upload_pack(&self, cancel: &CancellationToken) -> Result<Process, StorageError> {
        self.pack(PackService::UploadPack, &[], cancel)
    }

    /// Start `git receive-pack .` with all three streams piped.
    pub fn receive_pack(&self, cancel: &CancellationToken) -> Result<Process, StorageError> {
        self.pack(PackService::ReceivePack, &[], cancel)
    }

    /// Start `git <svc> --stateless-rpc .` for one smart-HTTP exchange.
    pub fn stateless_rpc(&self, service: PackService, cancel: &CancellationToken) -> Result<Process, StorageError> {
        self.pack(service, &["--stateless-rpc"], cancel)
    }

    /// Output of `git <svc> --stateless-rpc --advertise-refs .`.
    pub async fn advertise_refs(
        &self,
        service: PackService,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, StorageError> {
        let out = self
            .read(
                &[service.subcommand(), "--stateless-rpc", "--advertise-refs", "."],
                cancel,
            )
            .await?;
        Ok(out.stdout)
    }

    fn pack(
        &self,
        service: PackService,
        flags: &[&str],
        cancel: &CancellationToken,
    ) -> Result<Process, StorageError> {
        debug!(id = %self.id, %service, "starting pack service");
        Ok(Command::new(&self.git)
            .arg(service.subcommand())
            .args(flags.iter().copied())
            .arg(".")
            .current_dir(&self.path)
            .start(&self.tracker, cancel)?)
    }

    /// Run a short git read under the configured deadline, failing on a
    /// non-zero exit.
    async fn read(&self, args: &[&str], cancel: &CancellationToken) -> Result<Output, StorageError> {
        let subcommand = args.first().copied().unwrap_or_default();
        let process = Command::new(&self.git)
            .args(args.iter().copied())
            .current_dir(&self.path)
            // Never fall back to a repository in a parent directory.
            .env("GIT_DIR", ".")
            .stdin(Stdio::null())
            .start(&self.tracker, cancel)?;

        let out = match tokio::time::timeout(self.read_timeout, process.output()).await {
            Ok(out) => out?,
            Err(_) => {
                warn!(id = %self.id, subcommand, timeout = ?self.read_timeout, "git read timed out");
                return Err(StorageError::Timeout(subcommand.to_string()));
            }
        };
        if !out.status.success() {
            return Err(command_failed(subcommand, &out));
        }
        Ok(out)
    }
}

fn command_failed(command: &str, out: &Output) -> StorageError {
    StorageError::Command {
        command: command.to_string(),
        code: out.status.code(),
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    }
}

fn is_unknown_revision(stderr: &str) -> bool {
    stderr.contains("Not a valid object name")
        || stderr.contains("not a valid object name")
        || stderr.contains("unknown revision")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(root: &Path) -> Storage {
        Storage::new(root, "git", ProcessTracker::new(), Duration::from_secs(10)).unwrap()
    }

    async fn git(dir: &Path, args: &[&str]) {
        let status = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Foo Bar")
            .env("GIT_AUTHOR_EMAIL", "foo@bar.com")
            .env("GIT_AUTHOR_DATE", "1505935797 -0700")
            .env("GIT_COMMITTER_NAME", "Foo Bar")
            .env("GIT_COMMITTER_EMAIL", "foo@bar.com")
            .env("GIT_COMMITTER_DATE", "1505935797 -0700")
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    /// Create a repository with one commit on `main` containing
    /// `README` and `src/lib.rs`, pushed into storage under `id`.
    async fn seeded(root: &Path, id: &str) -> (Storage, Repository) {
        let storage = storage(&root.join("storage"));
        let cancel = CancellationToken::new();
        let repo = storage.create(id, &cancel).await.unwrap();

        let work = root.join("work");
        std::fs::create_dir_all(work.join("src")).unwrap();
        std::fs::write(work.join("README"), "hello\n").unwrap();
        std::fs::write(work.join("src/lib.rs"), "// lib\n").unwrap();
        git(&work, &["init", "-q", "-b", "main"]).await;
        git(&work, &["add", "."]).await;
        git(&work, &["commit", "-q", "-m", "initial import", "-m", "with a body"]).await;
        let remote = repo.path().display().to_string();
        git(&work, &["push", "-q", &remote, "main"]).await;

        (storage, repo)
    }

    #[test]
    fn shards_identifiers() {
        let root = Path::new("/srv/repos");
        assert_eq!(
            shard_path(root, &normalize_id("foo-bar-baz").unwrap()),
            PathBuf::from("/srv/repos/fo/ob/arbaz")
        );
        assert_eq!(
            shard_path(root, &normalize_id("owner/name").unwrap()),
            PathBuf::from("/srv/repos/ow/ne/rname")
        );
    }

    #[test]
    fn sharding_is_deterministic_and_separator_insensitive() {
        let s = Storage::new(tempfile::tempdir().unwrap().path(), "git", ProcessTracker::new(), Duration::from_secs(1))
            .unwrap();
        let a = s.repo_path("3f2a-91bc-77de").unwrap();
        assert_eq!(a, s.repo_path("3f2a-91bc-77de").unwrap());
        assert_eq!(a, s.repo_path("3f2a/91bc/77de").unwrap());
        assert_ne!(a, s.repo_path("3f2a-91bc-77df").unwrap());
    }

    #[test]
    fn rejects_bad_identifiers() {
        for id in ["", "----", "ab/c", "../../etc", "abc d e", "abcd.e"] {
            assert!(
                matches!(normalize_id(id), Err(StorageError::InvalidId(_))),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn pack_service_names() {
        assert_eq!(PackService::from_service_name("git-upload-pack"), Some(PackService::UploadPack));
        assert_eq!(PackService::from_service_name("git-receive-pack"), Some(PackService::ReceivePack));
        assert_eq!(PackService::from_service_name("upload-pack"), None);
        assert_eq!(PackService::ReceivePack.to_string(), "git-receive-pack");
    }

    #[tokio::test]
    async fn create_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let cancel = CancellationToken::new();

        assert!(matches!(
            storage.repository("deadbeef", &cancel).await,
            Err(StorageError::RepoNotValid(_))
        ));

        let repo = storage.create("deadbeef", &cancel).await.unwrap();
        assert_eq!(repo.path(), dir.path().join("de/ad/beef"));
        assert!(repo.path().join("HEAD").exists());

        let found = storage.repository("dead-beef", &cancel).await.unwrap();
        assert_eq!(found.path(), repo.path());
        assert_eq!(storage.tracker().outstanding(), 0);
    }

    #[tokio::test]
    async fn plain_directory_is_not_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        std::fs::create_dir_all(storage.repo_path("cafebabe").unwrap()).unwrap();

        let err = storage
            .repository("cafebabe", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RepoNotValid(_)), "{err}");
    }

    #[tokio::test]
    async fn description_gets_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let repo = storage.create("abcdef", &CancellationToken::new()).await.unwrap();

        repo.set_description("my project").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(repo.path().join("description")).unwrap(),
            "my project\n"
        );
    }

    #[tokio::test]
    async fn reads_branches_commits_and_trees() {
        let dir = tempfile::tempdir().unwrap();
        let (_storage, repo) = seeded(dir.path(), "0123456789").await;
        let cancel = CancellationToken::new();

        let branches = repo.branches(&cancel).await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "main");
        assert_eq!(branches[0].kind, "commit");

        let commit = repo.commit("main", &cancel).await.unwrap();
        assert_eq!(commit.hash, "main");
        assert_eq!(commit.message, "initial import");
        assert_eq!(commit.body, "with a body");
        assert_eq!(commit.author.to_string(), "Foo Bar <foo@bar.com> 1505935797 -0700");

        let root = repo.tree("main", "", &cancel).await.unwrap();
        let paths: Vec<_> = root.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["README", "src"]);
        assert_eq!(root[1].kind, "tree");

        let src = repo.tree("main", "src", &cancel).await.unwrap();
        assert_eq!(src.len(), 1);
        assert_eq!(src[0].path, "src/lib.rs");
        assert_eq!(repo.tree("main", "/src/", &cancel).await.unwrap(), src);
    }

    #[tokio::test]
    async fn unknown_revision_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_storage, repo) = seeded(dir.path(), "0123456789").await;

        let err = repo
            .commit("no-such-branch", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn empty_repository_has_no_branches() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let repo = storage.create("abcdef", &CancellationToken::new()).await.unwrap();
        assert!(repo.branches(&CancellationToken::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn advertises_refs() {
        let dir = tempfile::tempdir().unwrap();
        let (_storage, repo) = seeded(dir.path(), "0123456789").await;

        let adv = repo
            .advertise_refs(PackService::UploadPack, &CancellationToken::new())
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&adv);
        assert!(text.contains("refs/heads/main"), "{text}");
        assert!(adv.ends_with(b"0000"));
    }

    #[tokio::test]
    async fn slow_reads_hit_the_deadline() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join("slow-git");
        std::fs::write(
            &git,
            "#!/bin/sh\ncase \"$1\" in\n  config) echo 0 ;;\n  *) sleep 30 ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tracker = ProcessTracker::new();
        let storage = Storage::new(
            dir.path().join("repos"),
            git.display().to_string(),
            tracker.clone(),
            Duration::from_millis(300),
        )
        .unwrap();
        std::fs::create_dir_all(storage.repo_path("abcdef").unwrap()).unwrap();
        let cancel = CancellationToken::new();
        let repo = storage.repository("abcdef", &cancel).await.unwrap();

        let started = std::time::Instant::now();
        let err = repo.branches(&cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(tracker.outstanding(), 0);
    }
}
