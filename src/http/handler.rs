//! axum router and request handlers for the smart-HTTP surface.
//!
//! Routes (repository id is `{owner}/{name}`):
//! - `GET  /{owner}/{name}/HEAD`                      - no-cache
//! - `GET  /{owner}/{name}/info/refs?service=...`     - no-cache, ref advertisement
//! - `GET  /{owner}/{name}/objects/info/...`          - no-cache (except `packs`)
//! - `GET  /{owner}/{name}/objects/{xx}/{38 hex}`     - cache forever
//! - `GET  /{owner}/{name}/objects/info/packs`        - cache forever
//! - `GET  /{owner}/{name}/objects/pack/pack-*.{idx,pack}` - cache forever
//! - `POST /{owner}/{name}/git-upload-pack`           - stateless RPC
//! - `POST /{owner}/{name}/git-receive-pack`          - stateless RPC
//! - `GET  /healthz`, `GET /metrics`

use std::io::Read;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::SystemTime;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{from_fn_with_state, map_response, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::pktline;
use crate::metrics::{MetricsRegistry, Transport};
use crate::process::{Process, ProcessTracker};
use crate::storage::{PackService, Storage, StorageError};

/// Compressed request bodies are inflated in memory up to this size.
const MAX_COMPRESSED_BODY: usize = 64 * 1024 * 1024;

const ONE_YEAR_SECS: i64 = 31_536_000;
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

static LOOSE_DIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{2}$").expect("static regex"));
static LOOSE_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{38}$").expect("static regex"));
static PACK_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pack-[0-9a-f]{40}\.(idx|pack)$").expect("static regex"));

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub metrics: MetricsRegistry,
    /// Parent of every per-request token; cancelled on shutdown.
    pub cancel: CancellationToken,
}

#[derive(Clone)]
struct MetricsState {
    metrics: MetricsRegistry,
    tracker: Option<ProcessTracker>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the storage node's router: git smart HTTP plus health and metrics.
pub fn create_router(state: AppState) -> Router {
    let no_cache = Router::new()
        .route("/{owner}/{name}/HEAD", get(handle_head))
        .route("/{owner}/{name}/info/refs", get(handle_info_refs))
        .route(
            "/{owner}/{name}/objects/info/alternates",
            get(handle_alternates),
        )
        .route(
            "/{owner}/{name}/objects/info/http-alternates",
            get(handle_http_alternates),
        )
        .route("/{owner}/{name}/objects/info/{file}", get(handle_info_file))
        .layer(map_response(no_caching));

    let cache_forever = Router::new()
        .route(
            "/{owner}/{name}/objects/{dir}/{file}",
            get(handle_loose_object),
        )
        .route("/{owner}/{name}/objects/info/packs", get(handle_info_packs))
        .route("/{owner}/{name}/objects/pack/{file}", get(handle_pack_file))
        .layer(map_response(caching_forever));

    let services = Router::new()
        .route("/{owner}/{name}/git-upload-pack", post(handle_upload_pack))
        .route("/{owner}/{name}/git-receive-pack", post(handle_receive_pack))
        .route("/healthz", get(handle_health));

    let metrics = metrics_router(state.metrics.clone(), Some(state.storage.tracker().clone()));
    let tracked = state.metrics.clone();

    no_cache
        .merge(cache_forever)
        .merge(services)
        .with_state(state)
        .merge(metrics)
        .layer(from_fn_with_state(tracked, track_request))
}

/// Count in-flight HTTP requests on the connections gauge.
async fn track_request(
    State(metrics): State<MetricsRegistry>,
    request: Request,
    next: Next,
) -> Response {
    let _conn = metrics.connection(Transport::Http);
    next.run(request).await
}

/// `GET /metrics` on its own.  With a tracker the outstanding-process gauge
/// is refreshed on every scrape.
pub fn metrics_router(metrics: MetricsRegistry, tracker: Option<ProcessTracker>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(MetricsState { metrics, tracker })
}

// ---------------------------------------------------------------------------
// Cache headers
// ---------------------------------------------------------------------------

async fn no_caching(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
    response
}

async fn caching_forever(mut response: Response) -> Response {
    let now = Utc::now();
    let expires = now + chrono::Duration::seconds(ONE_YEAR_SECS);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&now.format(HTTP_DATE).to_string()) {
        headers.insert(header::DATE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&expires.format(HTTP_DATE).to_string()) {
        headers.insert(header::EXPIRES, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000"),
    );
    response
}

// ---------------------------------------------------------------------------
// Dumb-protocol file handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RepoPath {
    owner: String,
    name: String,
}

impl RepoPath {
    fn id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Deserialize)]
struct RepoFile {
    owner: String,
    name: String,
    file: String,
}

#[derive(Debug, Deserialize)]
struct LooseObject {
    owner: String,
    name: String,
    dir: String,
    file: String,
}

async fn handle_head(
    State(state): State<AppState>,
    Path(repo): Path<RepoPath>,
) -> Result<Response, AppError> {
    serve_repo_file(&state, &repo.id(), "HEAD", "text/plain").await
}

async fn handle_alternates(
    State(state): State<AppState>,
    Path(repo): Path<RepoPath>,
) -> Result<Response, AppError> {
    serve_repo_file(&state, &repo.id(), "objects/info/alternates", "text/plain").await
}

async fn handle_http_alternates(
    State(state): State<AppState>,
    Path(repo): Path<RepoPath>,
) -> Result<Response, AppError> {
    serve_repo_file(&state, &repo.id(), "objects/info/http-alternates", "text/plain").await
}

async fn handle_info_packs(
    State(state): State<AppState>,
    Path(repo): Path<RepoPath>,
) -> Result<Response, AppError> {
    serve_repo_file(
        &state,
        &repo.id(),
        "objects/info/packs",
        "text/plain; charset=utf-8",
    )
    .await
}

async fn handle_info_file(
    State(state): State<AppState>,
    Path(RepoFile { owner, name, file }): Path<RepoFile>,
) -> Result<Response, AppError> {
    if file == "." || file == ".." {
        return Err(AppError::NotFound(format!("objects/info/{file}")));
    }
    let id = format!("{owner}/{name}");
    serve_repo_file(&state, &id, &format!("objects/info/{file}"), "text/plain").await
}

async fn handle_loose_object(
    State(state): State<AppState>,
    Path(object): Path<LooseObject>,
) -> Result<Response, AppError> {
    if !LOOSE_DIR.is_match(&object.dir) || !LOOSE_FILE.is_match(&object.file) {
        return Err(AppError::NotFound(format!("objects/{}/{}", object.dir, object.file)));
    }
    let id = format!("{}/{}", object.owner, object.name);
    let relative = format!("objects/{}/{}", object.dir, object.file);
    serve_repo_file(&state, &id, &relative, "application/x-git-loose-object").await
}

async fn handle_pack_file(
    State(state): State<AppState>,
    Path(RepoFile { owner, name, file }): Path<RepoFile>,
) -> Result<Response, AppError> {
    let Some(caps) = PACK_FILE.captures(&file) else {
        return Err(AppError::NotFound(format!("objects/pack/{file}")));
    };
    let content_type = match &caps[1] {
        "idx" => "application/x-git-packed-objects-toc",
        _ => "application/x-git-packed-objects",
    };
    let id = format!("{owner}/{name}");
    serve_repo_file(&state, &id, &format!("objects/pack/{file}"), content_type).await
}

/// Stream `relative` from the repository directory of `id`.
async fn serve_repo_file(
    state: &AppState,
    id: &str,
    relative: &str,
    content_type: &'static str,
) -> Result<Response, AppError> {
    let path: PathBuf = state.storage.repo_path(id)?.join(relative);
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(AppError::NotFound(relative.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(relative.to_string()));
        }
        Err(e) => return Err(AppError::Internal(anyhow::Error::from(e).context(relative.to_string()))),
    };
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
    if let Some(modified) = meta.modified().ok().and_then(http_date) {
        headers.insert(header::LAST_MODIFIED, modified);
    }
    Ok(response)
}

fn http_date(time: SystemTime) -> Option<HeaderValue> {
    let time: DateTime<Utc> = time.into();
    HeaderValue::from_str(&time.format(HTTP_DATE).to_string()).ok()
}

// ---------------------------------------------------------------------------
// Smart protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

/// `GET /{owner}/{name}/info/refs?service=git-upload-pack`
#[instrument(skip(state), fields(owner = %repo.owner, name = %repo.name))]
async fn handle_info_refs(
    State(state): State<AppState>,
    Path(repo): Path<RepoPath>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, AppError> {
    let service_name = query.service.unwrap_or_default();
    let service = PackService::from_service_name(&service_name)
        .ok_or_else(|| AppError::BadRequest(format!("unsupported service: {service_name:?}")))?;

    let cancel = state.cancel.child_token();
    let repository = state.storage.repository(&repo.id(), &cancel).await?;
    let refs = repository.advertise_refs(service, &cancel).await?;

    let mut body = pktline::service_header(&service.to_string());
    body.extend_from_slice(&refs);
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, format!("application/x-{service}-advertisement"))],
        body,
    )
        .into_response())
}

async fn handle_upload_pack(
    State(state): State<AppState>,
    Path(repo): Path<RepoPath>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    stateless_rpc(state, PackService::UploadPack, repo, &headers, body).await
}

async fn handle_receive_pack(
    State(state): State<AppState>,
    Path(repo): Path<RepoPath>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    stateless_rpc(state, PackService::ReceivePack, repo, &headers, body).await
}

/// Feed the request body to `git <svc> --stateless-rpc .` and stream its
/// stdout back as the response.
#[instrument(skip(state, service, headers, body), fields(owner = %repo.owner, name = %repo.name, %service))]
async fn stateless_rpc(
    state: AppState,
    service: PackService,
    repo: RepoPath,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let input = RequestBody::new(&encoding, body).await?;

    let cancel = state.cancel.child_token();
    let repository = state.storage.repository(&repo.id(), &cancel).await?;
    let mut process = repository.stateless_rpc(service, &cancel)?;

    let stdin = process.stdin.take();
    let stdout = process
        .stdout
        .take()
        .context("git stdout was not piped")?;

    tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            if let Err(e) = input.copy_to(&mut stdin).await {
                debug!(error = %e, "failed to copy request body to git");
            }
        }
    });
    tokio::spawn(reap(process, service));

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, format!("application/x-{service}-result"))],
        Body::from_stream(ReaderStream::new(stdout)),
    )
        .into_response())
}

/// Wait for a stateless-rpc process, logging its stderr if it failed.
async fn reap(mut process: Process, service: PackService) {
    let stderr = process.stderr.take();
    let collect = async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    };
    let (status, stderr) = tokio::join!(process.wait(), collect);
    match status {
        Ok(status) if !status.success() => warn!(
            %service,
            %status,
            stderr = %String::from_utf8_lossy(&stderr).trim(),
            "stateless-rpc exited with non-zero status"
        ),
        Err(e) => warn!(%service, error = %e, "failed to wait for stateless-rpc"),
        _ => {}
    }
}

/// A request body, already inflated when it was sent compressed.
enum RequestBody {
    Plain(Body),
    Inflated(Vec<u8>),
}

impl RequestBody {
    async fn new(encoding: &str, body: Body) -> Result<Self, AppError> {
        if encoding != "gzip" && encoding != "deflate" {
            return Ok(Self::Plain(body));
        }

        let compressed = axum::body::to_bytes(body, MAX_COMPRESSED_BODY)
            .await
            .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))?;
        let mut inflated = Vec::new();
        let result = match encoding {
            "gzip" => flate2::read::GzDecoder::new(&compressed[..]).read_to_end(&mut inflated),
            _ => flate2::read::DeflateDecoder::new(&compressed[..]).read_to_end(&mut inflated),
        };
        result.map_err(|e| AppError::BadRequest(format!("invalid {encoding} body: {e}")))?;
        Ok(Self::Inflated(inflated))
    }

    async fn copy_to<W: tokio::io::AsyncWrite + Unpin>(self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Self::Plain(body) => {
                let stream = body.into_data_stream().map_err(std::io::Error::other);
                let mut reader = StreamReader::new(stream);
                tokio::io::copy(&mut reader, writer).await?;
            }
            Self::Inflated(bytes) => writer.write_all(&bytes).await?,
        }
        writer.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// Health and metrics
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    crate::health::check(&state.storage).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<MetricsState>) -> Result<Response, AppError> {
    if let Some(tracker) = &state.tracker {
        state
            .metrics
            .metrics
            .processes_outstanding
            .set(tracker.outstanding() as i64);
    }
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// No such repository, revision or file.
    NotFound(String),
    /// The request itself is malformed.
    BadRequest(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(what) => {
                debug!(%what, "not found");
                (StatusCode::NOT_FOUND, format!("not found: {what}\n")).into_response()
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, format!("{msg}\n")).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}\n"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        if err.is_precondition() {
            AppError::NotFound(err.to_string())
        } else {
            AppError::Internal(err.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tower::ServiceExt;

    use super::*;

    async fn state(root: &std::path::Path) -> (AppState, PathBuf) {
        let storage = Storage::new(
            root,
            "git",
            ProcessTracker::new(),
            Duration::from_secs(10),
        )
        .unwrap();
        let repo = storage
            .create("alice/12345", &CancellationToken::new())
            .await
            .unwrap();
        let path = repo.path().to_path_buf();
        let state = AppState {
            storage,
            metrics: MetricsRegistry::new(),
            cancel: CancellationToken::new(),
        };
        (state, path)
    }

    async fn get(router: Router, uri: &str) -> Response {
        router
            .oneshot(axum::http::Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn info_refs_advertises_service() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path()).await;
        let router = create_router(state);

        let response = get(router, "/alice/12345/info/refs?service=git-upload-pack").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-git-upload-pack-advertisement"
        );
        assert_eq!(response.headers()[header::PRAGMA], "no-cache");
        assert_eq!(
            response.headers()[header::EXPIRES],
            "Fri, 01 Jan 1980 00:00:00 GMT"
        );

        let body = body_bytes(response).await;
        assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
        assert!(body.ends_with(b"0000"));
    }

    #[tokio::test]
    async fn info_refs_rejects_unknown_service_and_repo() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path()).await;
        let router = create_router(state);

        let response = get(router.clone(), "/alice/12345/info/refs?service=git-upload-archive").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = get(router, "/bob/99999/info/refs?service=git-upload-pack").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn head_is_served_without_caching() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path()).await;

        let response = get(create_router(state), "/alice/12345/HEAD").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, max-age=0, must-revalidate"
        );
        assert!(response.headers().contains_key(header::LAST_MODIFIED));
        assert!(body_bytes(response).await.starts_with(b"ref: refs/heads/"));
    }

    #[tokio::test]
    async fn objects_are_cached_forever() {
        let dir = tempfile::tempdir().unwrap();
        let (state, path) = state(dir.path()).await;
        let object_dir = path.join("objects/ab");
        std::fs::create_dir_all(&object_dir).unwrap();
        let name = "c".repeat(38);
        std::fs::write(object_dir.join(&name), b"loose").unwrap();
        let router = create_router(state);

        let response = get(router.clone(), &format!("/alice/12345/objects/ab/{name}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-git-loose-object"
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "public, max-age=31536000"
        );
        assert!(response.headers().contains_key(header::EXPIRES));
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
        assert_eq!(body_bytes(response).await, b"loose");

        let response = get(router.clone(), "/alice/12345/objects/zz/notanobject").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = get(router, &format!("/alice/12345/objects/pack/pack-{}.idx", "0".repeat(40))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_pack_accepts_gzip_body() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path()).await;

        // An empty negotiation: just a flush packet.
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"0000").unwrap();
        let compressed = encoder.finish().unwrap();

        let request = axum::http::Request::post("/alice/12345/git-upload-pack")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from(compressed))
            .unwrap();
        let response = create_router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-git-upload-pack-result"
        );
        body_bytes(response).await;
    }

    #[tokio::test]
    async fn corrupt_gzip_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path()).await;

        let request = axum::http::Request::post("/alice/12345/git-receive-pack")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from("definitely not gzip"))
            .unwrap();
        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_and_health_are_exposed() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path()).await;
        let router = create_router(state);

        let response = get(router.clone(), "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("repostore_processes_outstanding"), "{text}");

        let response = get(router, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        let health: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(health["status"], "ok");
    }
}
