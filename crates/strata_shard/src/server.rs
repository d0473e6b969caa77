//! The shard's HTTP surface.
//!
//! Status mapping: 200 success; 404 wrong shard or missing file, commit, or
//! branch; 409 commit-id conflict; 400 ill-formed shard filter; 500
//! internal. Control responses are plain text, file reads raw bytes, and
//! listings `multipart/mixed` with the boundary echoed in a `Boundary`
//! header.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use strata_store::{Store, StoreError};

use crate::materialize::{self, walk_names, MULTICAST_PAUSE};
use crate::multipart::{self, Part};
use crate::replica;
use crate::route::ShardFilter;
use crate::Shard;

/// Error wrapper carrying the HTTP status mapping.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, format!("{}\n", self.message)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            StoreError::Cancelled | StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    branch: Option<String>,
    commit: Option<String>,
    shard: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitQuery {
    commit: String,
    branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BranchQuery {
    commit: Option<String>,
    branch: String,
}

#[derive(Debug, Deserialize)]
struct ShuffleQuery {
    commit: String,
    branch: Option<String>,
    dir: String,
    shard: String,
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    from: Option<String>,
}

/// Build the shard's router.
pub fn router(shard: Arc<Shard>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/file/*path", post(write_file).get(read_file))
        .route("/commit", post(post_commit))
        .route("/branch", post(post_branch))
        .route("/pipeline/:name", post(post_pipeline))
        .route("/pipeline/:name/file/*path", get(read_pipeline_file))
        .route("/pipeline/:name/shuffle", get(read_shuffle))
        .route("/pull", get(pull_source).post(pull_ingest))
        .with_state(shard)
}

/// Bind and serve the shard, publishing the bound address to discovery.
pub async fn serve(
    shard: Arc<Shard>,
    addr: SocketAddr,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let app = router(shard.clone());
    let server = axum::Server::try_bind(&addr)?.serve(app.into_make_service());
    let local = server.local_addr();
    shard.set_advertise(&format!("http://{local}"))?;
    info!(addr = %local, shard = %shard.filter(), "shard serving");
    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!(error = ?err, "shard server exited");
        }
    });
    Ok((local, handle))
}

async fn ping() -> &'static str {
    "pong\n"
}

fn parse_filter(raw: &Option<String>) -> Result<Option<ShardFilter>, ApiError> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|err: anyhow::Error| ApiError::bad_request(err.to_string())),
    }
}

async fn write_file(
    State(shard): State<Arc<Shard>>,
    Path(path): Path<String>,
    Query(q): Query<FileQuery>,
    body: Bytes,
) -> Result<String, ApiError> {
    let filter = parse_filter(&q.shard)?;
    if let Some(filter) = filter {
        if !filter.matches(&path) {
            return Err(ApiError::not_found(format!(
                "{path} does not belong to shard {filter}"
            )));
        }
    }
    let branch = q.branch.as_deref().unwrap_or("master");
    let size = shard
        .env
        .store
        .append(&format!("{}/{branch}/{path}", shard.cfg.data), &body)?;
    Ok(format!("Created {path}, size: {size}.\n"))
}

async fn read_file(
    State(shard): State<Arc<Shard>>,
    Path(path): Path<String>,
    Query(q): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let filter = parse_filter(&q.shard)?;
    let refname = q
        .commit
        .as_deref()
        .or(q.branch.as_deref())
        .unwrap_or("master");
    let root = format!("{}/{refname}", shard.cfg.data);
    serve_read(shard.env.store.as_ref(), &root, &path, filter)
}

/// Serve either a raw file or, when the last path segment is `*`, a
/// shard-filtered multipart listing rooted at the namespace `root`.
fn serve_read(
    store: &dyn Store,
    root: &str,
    path: &str,
    filter: Option<ShardFilter>,
) -> Result<Response, ApiError> {
    if let Some(dir) = path.strip_suffix('*') {
        let dir = dir.trim_matches('/');
        let parts = list_parts(store, root, dir, filter)?;
        return Ok(multipart_response(&parts));
    }
    if let Some(filter) = filter {
        if !filter.matches(path) {
            return Err(ApiError::not_found(format!(
                "{path} does not belong to shard {filter}"
            )));
        }
    }
    let data = store.open(&format!("{root}/{path}"))?;
    Ok(data.into_response())
}

fn list_parts(
    store: &dyn Store,
    root: &str,
    dir: &str,
    filter: Option<ShardFilter>,
) -> Result<Vec<Part>, ApiError> {
    if !store.file_exists(root)? {
        return Err(ApiError::not_found(format!("no such ref {root}")));
    }
    let walk_root = if dir.is_empty() {
        root.to_string()
    } else {
        format!("{root}/{dir}")
    };
    let mut parts = Vec::new();
    for rel in walk_names(store, &walk_root)? {
        let name = if dir.is_empty() {
            rel
        } else {
            format!("{dir}/{rel}")
        };
        if filter.map(|f| f.matches(&name)).unwrap_or(true) {
            let data = store.open(&format!("{root}/{name}"))?;
            parts.push(Part {
                filename: name,
                data,
            });
        }
    }
    Ok(parts)
}

fn multipart_response(parts: &[Part]) -> Response {
    let boundary = multipart::boundary();
    let body = multipart::encode(&boundary, parts);
    (
        [
            ("Boundary".to_string(), boundary.clone()),
            (
                CONTENT_TYPE.to_string(),
                format!("multipart/mixed; boundary={boundary}"),
            ),
        ],
        body,
    )
        .into_response()
}

async fn post_commit(
    State(shard): State<Arc<Shard>>,
    Query(q): Query<CommitQuery>,
) -> Result<String, ApiError> {
    let branch = q.branch.as_deref().unwrap_or("master").to_string();
    let commit = q.commit;
    let store = &shard.env.store;

    store.commit(&shard.cfg.data, &commit, &branch)?;
    // Manifests snapshot under the same id so pipelines are addressable at
    // the triggering commit.
    if let Err(err) = store.commit(&shard.cfg.pipelines, &commit, "master") {
        warn!(commit = %commit, error = ?err, "pipelines repo commit failed");
    }

    let materialize_shard = shard.clone();
    let m_branch = branch.clone();
    let m_commit = commit.clone();
    tokio::spawn(async move {
        if let Err(err) =
            materialize::materialize(materialize_shard, &m_branch, &m_commit).await
        {
            warn!(commit = %m_commit, error = ?err, "materialisation failed");
        }
    });

    if !shard.cfg.sync_peers.is_empty() {
        let sync_shard = shard.clone();
        tokio::spawn(async move {
            if let Err(err) = replica::sync_to(
                &sync_shard.env.store,
                &sync_shard.cfg.data,
                &sync_shard.cfg.sync_peers,
                &sync_shard.env.http,
            )
            .await
            {
                warn!(error = ?err, "sync after commit failed");
            }
        });
    }

    Ok(format!("{commit}\n"))
}

async fn post_branch(
    State(shard): State<Arc<Shard>>,
    Query(q): Query<BranchQuery>,
) -> Result<String, ApiError> {
    let from = q.commit.as_deref().unwrap_or("");
    shard.env.store.branch(&shard.cfg.data, from, &q.branch)?;
    Ok(format!("Created branch. ({from}) -> {}.\n", q.branch))
}

async fn post_pipeline(
    State(shard): State<Arc<Shard>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<String, ApiError> {
    shard
        .env
        .store
        .create(&format!("{}/master/{name}", shard.cfg.pipelines), &body)?;
    Ok(format!("Created pipeline {name}.\n"))
}

async fn read_pipeline_file(
    State(shard): State<Arc<Shard>>,
    Path((name, path)): Path<(String, String)>,
    Query(q): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let filter = parse_filter(&q.shard)?;
    let store = shard.env.store.as_ref();
    let comp = &shard.cfg.comp;

    let refname = match (&q.commit, &q.branch) {
        (Some(commit), _) => {
            // The commit response returns before materialisation finishes;
            // block (bounded) on the committed progress marker.
            let marker = format!("{comp}/{commit}/.progress/{commit}/{name}");
            tokio::time::timeout(MULTICAST_PAUSE, store.wait_file(&marker))
                .await
                .map_err(|_| {
                    ApiError::not_found(format!("pipeline {name} not materialised at {commit}"))
                })??;
            commit.clone()
        }
        (None, Some(branch)) => branch.clone(),
        (None, None) => "master".to_string(),
    };

    let root = format!("{comp}/{refname}/{name}");
    serve_read(store, &root, &path, filter)
}

async fn read_shuffle(
    State(shard): State<Arc<Shard>>,
    Path(name): Path<String>,
    Query(q): Query<ShuffleQuery>,
) -> Result<Response, ApiError> {
    let filter: ShardFilter = q
        .shard
        .parse()
        .map_err(|err: anyhow::Error| ApiError::bad_request(err.to_string()))?;
    let branch = q.branch.as_deref().unwrap_or("master");
    let store = shard.env.store.as_ref();
    let comp = &shard.cfg.comp;

    // Block until this shard has published its outbound snapshot for the
    // commit; the peer initiating the shuffle may be ahead of us.
    let marker = format!("{comp}/{branch}/.shuffle/{}/{name}.ready", q.commit);
    tokio::time::timeout(MULTICAST_PAUSE, store.wait_file(&marker))
        .await
        .map_err(|_| {
            ApiError::not_found(format!(
                "pipeline {name} has not published shuffle data for {}",
                q.commit
            ))
        })??;

    let stage_root = format!("{comp}/{branch}/.shuffle/{}/{name}", q.commit);
    let parts = list_parts(store, &stage_root, &q.dir, Some(filter))?;
    Ok(multipart_response(&parts))
}

async fn pull_source_inner(shard: &Shard, from: &str) -> Result<Response, ApiError> {
    let deltas = shard.env.store.pull(&shard.cfg.data, from)?;
    let body = replica::encode_stream(&deltas);
    Ok((
        [(CONTENT_TYPE.to_string(), "application/octet-stream".to_string())],
        body,
    )
        .into_response())
}

async fn pull_source(
    State(shard): State<Arc<Shard>>,
    Query(q): Query<PullQuery>,
) -> Result<Response, ApiError> {
    pull_source_inner(&shard, q.from.as_deref().unwrap_or("")).await
}

/// POST `/pull` serves double duty: with an empty body it streams commits
/// since `from` (the batch pull direction); with a body it ingests a pushed
/// delta stream (the sync direction).
async fn pull_ingest(
    State(shard): State<Arc<Shard>>,
    Query(q): Query<PullQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return pull_source_inner(&shard, q.from.as_deref().unwrap_or("")).await;
    }
    let applied = replica::apply_stream(shard.env.store.as_ref(), &shard.cfg.data, &body)?;
    Ok(format!("Applied {applied} commits.\n").into_response())
}
