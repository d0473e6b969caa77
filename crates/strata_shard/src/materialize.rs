//! The materialiser: runs every job and pipeline against a new data commit
//! and produces the matching comp commit.
//!
//! Two job sources exist for a commit `c` on branch `b`: JSON job documents
//! under `data/c/jobs/`, and pipeline manifests in the pipelines repo at
//! `c`. Each finished job leaves an empty progress marker at
//! `comp/b/.progress/c/<job>`; a deferred commit freezes the comp repo under
//! the same id even when jobs fail, so comp always advances in lockstep
//! with data.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use strata_store::{Store, StoreError, Walk};

use crate::container::TaskWorkspace;
use crate::multipart;
use crate::pipeline::Pipeline;
use crate::route::{self, hash_path};
use crate::source::InputSource;
use crate::{retry, Shard};

pub const RETRIES: usize = 5;
pub const DEFAULT_PARALLEL: usize = 100;
/// Dispatches per mapper container before it is recycled.
pub const USES_PER_MAPPER: usize = 2000;

const MAP_PAUSE: Duration = Duration::from_millis(500);
const REDUCE_PAUSE: Duration = Duration::from_millis(200);
/// Pause between multicast attempts, and the ceiling for waiting reads.
pub const MULTICAST_PAUSE: Duration = Duration::from_secs(60);

/// A map or reduce job document from the jobs directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "type")]
    pub kind: String,
    pub input: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub parallel: usize,
    /// Per-file POST timeout in seconds; zero means none.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default, rename = "cpu-shares")]
    pub cpu_shares: u64,
    #[serde(default)]
    pub memory: u64,
}

/// Materialise data commit `commit` on `branch` into the comp repo.
///
/// Re-running against an already materialised commit is a no-op.
pub async fn materialize(shard: Arc<Shard>, branch: &str, commit: &str) -> anyhow::Result<()> {
    let store = shard.env.store.clone();
    let comp = shard.cfg.comp.clone();

    if store.file_exists(&format!("{comp}/{commit}"))? {
        debug!(commit, "commit already materialised");
        return Ok(());
    }
    if !store.file_exists(&format!("{comp}/{branch}"))? {
        store.branch(&comp, "", branch)?;
    }
    // The dir's existence asserts that materialisation started.
    store.mkdir_all(&format!("{comp}/{branch}/.progress/{commit}"))?;

    let result = run_all(&shard, branch, commit).await;

    // The comp repo advances in lockstep with data even on failure.
    if let Err(err) = store.commit(&comp, commit, branch) {
        warn!(commit, error = ?err, "deferred comp commit failed");
    }
    result
}

/// Block until `job` has completed for `commit` on `branch`.
pub async fn wait_job(
    store: &dyn Store,
    comp: &str,
    branch: &str,
    commit: &str,
    job: &str,
) -> Result<(), StoreError> {
    store
        .wait_file(&format!("{comp}/{branch}/.progress/{commit}/{job}"))
        .await
}

enum JobSource {
    JobDoc,
    Manifest,
}

async fn run_all(shard: &Arc<Shard>, branch: &str, commit: &str) -> anyhow::Result<()> {
    let store = &shard.env.store;
    let mut join = JoinSet::new();

    let jobs_dir = format!("{}/{commit}/jobs", shard.cfg.data);
    if store.file_exists(&jobs_dir)? {
        for name in store.read_dir(&jobs_dir)? {
            join.spawn(run_one(
                shard.clone(),
                branch.to_string(),
                commit.to_string(),
                name,
                JobSource::JobDoc,
            ));
        }
    } else {
        debug!(path = %jobs_dir, "no jobs dir for this commit");
    }

    let pipe_dir = format!("{}/{commit}", shard.cfg.pipelines);
    if store.file_exists(&pipe_dir)? {
        for name in store.read_dir(&pipe_dir)? {
            join.spawn(run_one(
                shard.clone(),
                branch.to_string(),
                commit.to_string(),
                name,
                JobSource::Manifest,
            ));
        }
    }

    while join.join_next().await.is_some() {}
    Ok(())
}

/// Run one job to completion and write its progress marker, success or not.
async fn run_one(
    shard: Arc<Shard>,
    branch: String,
    commit: String,
    name: String,
    source: JobSource,
) {
    let result = match source {
        JobSource::JobDoc => run_job(&shard, &branch, &commit, &name).await,
        JobSource::Manifest => run_pipeline(&shard, &branch, &commit, &name).await,
    };
    if let Err(err) = result {
        warn!(job = %name, commit = %commit, error = ?err, "job failed");
    }
    let marker = format!(
        "{}/{branch}/.progress/{commit}/{name}",
        shard.cfg.comp
    );
    if let Err(err) = shard.env.store.create_all(&marker, b"") {
        warn!(job = %name, error = ?err, "failed to write progress marker");
    }
}

async fn run_job(
    shard: &Arc<Shard>,
    branch: &str,
    commit: &str,
    name: &str,
) -> anyhow::Result<()> {
    let doc = shard
        .env
        .store
        .open(&format!("{}/{commit}/jobs/{name}", shard.cfg.data))?;
    let job: Job = serde_json::from_slice(&doc)
        .with_context(|| format!("job document {name} does not parse"))?;
    match job.kind.as_str() {
        "map" => run_map(shard, &job, name, branch, commit).await,
        "reduce" => run_reduce(shard, &job, name, branch, commit).await,
        other => anyhow::bail!("job {name} has unrecognized type {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// Stream every input file through a mapper container.
///
/// Each input becomes one POST to `http://<mapper>/<name>`; the response body
/// becomes `comp/<branch>/<job>/<name>`. After `USES_PER_MAPPER` dispatches
/// the container is recycled to cap memory drift.
async fn run_map(
    shard: &Arc<Shard>,
    job: &Job,
    name: &str,
    branch: &str,
    commit: &str,
) -> anyhow::Result<()> {
    anyhow::ensure!(job.kind == "map", "run_map called on a {:?} job", job.kind);
    let store = shard.env.store.clone();
    let runtime = shard.env.runtime.clone();
    store.mkdir_all(&format!("{}/{branch}/{name}", shard.cfg.comp))?;
    runtime.pull_image(&job.image).await?;

    let source = Arc::new(InputSource::resolve(
        store.clone(),
        shard.env.buckets.as_ref(),
        &shard.cfg.data,
        commit,
        &job.input,
    )?);

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let pump = tokio::spawn(pump_files(
        source.clone(),
        job.clone(),
        shard.cfg.index,
        shard.cfg.modulus,
        tx,
    ));

    let parallel = if job.parallel > 0 {
        job.parallel
    } else {
        DEFAULT_PARALLEL
    };
    let out_base = format!("{}/{branch}/{name}", shard.cfg.comp);

    loop {
        let container = runtime.start_container(&job.image, &job.command).await?;
        let host = runtime.ip_addr(&container).await?;
        let semaphore = Arc::new(Semaphore::new(parallel));
        let mut workers = JoinSet::new();

        let mut uses = 0usize;
        let exhausted = loop {
            if uses == USES_PER_MAPPER {
                break false;
            }
            let Some(file) = rx.recv().await else {
                break true;
            };
            uses += 1;
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("mapper semaphore closed")?;
            let source = source.clone();
            let store = store.clone();
            let http = shard.env.http.clone();
            let job = job.clone();
            let host = host.clone();
            let out_path = format!("{out_base}/{file}");
            workers.spawn(async move {
                let _permit = permit;
                if let Err(err) =
                    map_file(&http, source.as_ref(), &host, &job, &file, &out_path, &store).await
                {
                    // The file is simply absent from the output commit.
                    warn!(file = %file, error = ?err, "map input failed after retries");
                }
            });
        };

        // Drain the pool before recycling the container.
        while workers.join_next().await.is_some() {}
        runtime.stop_container(&container).await?;
        if exhausted {
            break;
        }
        debug!(job = %name, "mapper used up, starting a fresh container");
    }

    pump.await.context("input pump panicked")?
}

/// Enumerate input file names into the worker channel.
///
/// For `pfs://` inputs this walks the commit; for `s3://` inputs it pages
/// the bucket listing and keeps only keys owned by this shard. Hitting
/// `job.limit` stops emission immediately and closes the channel.
async fn pump_files(
    source: Arc<InputSource>,
    job: Job,
    index: u64,
    modulus: u64,
    tx: mpsc::Sender<String>,
) -> anyhow::Result<()> {
    match source.as_ref() {
        InputSource::Pfs { store, root } => {
            let mut names = Vec::new();
            let mut walk_result = Ok(());
            let walked = store.lazy_walk(root, &mut |name| {
                names.push(name.to_string());
                if job.limit != 0 && names.len() >= job.limit {
                    Walk::Stop
                } else {
                    Walk::Continue
                }
            });
            match walked {
                Ok(()) => {}
                Err(StoreError::NotFound(path)) => {
                    debug!(path, "map input dir is absent, nothing to pump");
                }
                Err(err) => walk_result = Err(err),
            }
            walk_result?;
            for name in names {
                if tx.send(name).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
        InputSource::S3 { bucket, prefix } => {
            let mut marker = String::new();
            let mut count = 0usize;
            loop {
                let page = bucket.list(prefix, &marker).await?;
                for key in &page.keys {
                    if hash_path(key) % modulus == index {
                        if tx.send(key.clone()).await.is_err() {
                            return Ok(());
                        }
                        count += 1;
                        if job.limit != 0 && count >= job.limit {
                            return Ok(());
                        }
                    }
                }
                if !page.truncated {
                    return Ok(());
                }
                marker = page.next_marker;
            }
        }
    }
}

/// Push one input file through the mapper and store its output.
async fn map_file(
    http: &reqwest::Client,
    source: &InputSource,
    host: &str,
    job: &Job,
    file: &str,
    out_path: &str,
    store: &Arc<dyn Store>,
) -> anyhow::Result<()> {
    retry(RETRIES, MAP_PAUSE, || async {
        let input = source.open(file).await?;
        let mut req = http
            .post(format!("http://{host}/{file}"))
            .body(input);
        if job.timeout > 0 {
            req = req.timeout(Duration::from_secs(job.timeout));
        }
        let resp = req.send().await?;
        anyhow::ensure!(
            resp.status().is_success(),
            "mapper returned {} for {file}",
            resp.status()
        );
        let output = resp.bytes().await?;
        store.create_all(out_path, &output)?;
        Ok(())
    })
    .await
}

// ---------------------------------------------------------------------------
// Reduce
// ---------------------------------------------------------------------------

/// Run the reducer container and feed it every shard's slice of the input.
///
/// Only the shard owning `/job/<name>` runs the reducer; the rest no-op and
/// rely on replication or multicast to see the result.
async fn run_reduce(
    shard: &Arc<Shard>,
    job: &Job,
    name: &str,
    branch: &str,
    commit: &str,
) -> anyhow::Result<()> {
    if hash_path(&format!("/job/{name}")) % shard.cfg.modulus != shard.cfg.index {
        debug!(job = %name, "reduce owned by another shard");
        return Ok(());
    }
    anyhow::ensure!(
        job.kind == "reduce",
        "run_reduce called on a {:?} job",
        job.kind
    );

    let runtime = shard.env.runtime.clone();
    runtime.pull_image(&job.image).await?;
    let container = runtime.start_container(&job.image, &job.command).await?;
    let result = async {
        let host = runtime.ip_addr(&container).await?;
        reduce_into_store(shard, job, name, branch, commit, &host).await
    }
    .await;
    if let Err(err) = runtime.stop_container(&container).await {
        warn!(job = %name, error = ?err, "failed to stop reducer container");
    }
    result
}

async fn reduce_into_store(
    shard: &Arc<Shard>,
    job: &Job,
    name: &str,
    branch: &str,
    commit: &str,
    host: &str,
) -> anyhow::Result<()> {
    let http = shard.env.http.clone();
    let input = job.input.trim_matches('/').to_string();
    let list_path = if input.is_empty() {
        "file/*".to_string()
    } else {
        format!("{input}/file/*")
    };

    retry(RETRIES, REDUCE_PAUSE, || {
        let http = http.clone();
        let list_path = list_path.clone();
        let input = input.clone();
        async move {
            let body: reqwest::Body = if shard.cfg.modulus == 1 {
                // Single node: one local request covers the whole input.
                let advertise = shard
                    .advertise()
                    .ok_or_else(|| anyhow::anyhow!("shard has no advertised address"))?;
                let resp = http
                    .get(format!("{advertise}/{list_path}"))
                    .query(&[("commit", commit)])
                    .send()
                    .await?;
                anyhow::ensure!(
                    resp.status().is_success(),
                    "local input read returned {}",
                    resp.status()
                );
                reqwest::Body::wrap_stream(resp.bytes_stream())
            } else {
                let responses = retry(RETRIES, MULTICAST_PAUSE, || {
                    let http = http.clone();
                    let list_path = list_path.clone();
                    async move {
                        shard
                            .router()
                            .multicast(route::MEMBER_PREFIX, None, |addr| {
                                http.get(format!("{addr}/{list_path}"))
                                    .query(&[("commit", commit)])
                            })
                            .await
                    }
                })
                .await?;
                reqwest::Body::wrap_stream(route::multi_body(responses))
            };

            let resp = http
                .post(format!("http://{host}/{input}"))
                .body(body)
                .send()
                .await?;
            anyhow::ensure!(
                resp.status().is_success(),
                "reducer returned {}",
                resp.status()
            );
            let output = resp.bytes().await?;
            shard
                .env
                .store
                .create_all(&format!("{}/{branch}/{name}", shard.cfg.comp), &output)?;
            Ok(())
        }
    })
    .await
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Run one pipeline manifest: stage inputs, run commands, harvest outputs,
/// then shuffle declared directories across the ring.
async fn run_pipeline(
    shard: &Arc<Shard>,
    branch: &str,
    commit: &str,
    name: &str,
) -> anyhow::Result<()> {
    let store = shard.env.store.clone();
    let manifest = store.open(&format!("{}/{commit}/{name}", shard.cfg.pipelines))?;
    let manifest = std::str::from_utf8(&manifest)
        .map_err(|_| anyhow::anyhow!("pipeline {name} manifest is not utf-8"))?;
    let pipeline = Pipeline::parse(manifest).with_context(|| format!("pipeline {name}"))?;

    shard.env.runtime.pull_image(&pipeline.image).await?;
    let workspace = TaskWorkspace::new()?;
    for input in &pipeline.inputs {
        let root = format!("{}/{commit}/{input}", shard.cfg.data);
        for rel in walk_names(store.as_ref(), &root)? {
            let data = store.open(&format!("{root}/{rel}"))?;
            workspace.stage_input(&format!("{input}/{rel}"), &data)?;
        }
    }
    for command in &pipeline.runs {
        shard
            .env
            .runtime
            .run_task(&pipeline.image, command, &workspace)
            .await?;
    }
    for (rel, data) in workspace.collect_outputs()? {
        store.create_all(
            &format!("{}/{branch}/{name}/{rel}", shard.cfg.comp),
            &data,
        )?;
    }

    for dir in &pipeline.shuffles {
        shuffle_exchange(shard, name, dir, branch, commit).await?;
    }
    Ok(())
}

/// Exchange a shuffled directory with peers so every file lands exactly on
/// the shard its hash names.
///
/// Local files are staged under `.shuffle/<commit>/<name>/` before the ready
/// marker is published; peers read that stable snapshot, so reconciliation
/// here cannot race their fetches. Received parts are appended, then local
/// files owned elsewhere are removed.
async fn shuffle_exchange(
    shard: &Arc<Shard>,
    name: &str,
    dir: &str,
    branch: &str,
    commit: &str,
) -> anyhow::Result<()> {
    let store = shard.env.store.clone();
    let comp = &shard.cfg.comp;
    let live_root = format!("{comp}/{branch}/{name}/{dir}");
    let stage_root = format!("{comp}/{branch}/.shuffle/{commit}/{name}/{dir}");

    store.mkdir_all(&stage_root)?;
    for rel in walk_names(store.as_ref(), &live_root)? {
        let data = store.open(&format!("{live_root}/{rel}"))?;
        store.create_all(&format!("{stage_root}/{rel}"), &data)?;
    }
    store.create_all(
        &format!("{comp}/{branch}/.shuffle/{commit}/{name}.ready"),
        b"",
    )?;

    if shard.cfg.modulus <= 1 {
        return Ok(());
    }

    let own = shard.filter().to_string();
    let advertise = shard.advertise();
    let http = shard.env.http.clone();
    let responses = retry(RETRIES, MULTICAST_PAUSE, || {
        let http = http.clone();
        let own = own.clone();
        let advertise = advertise.clone();
        async move {
            shard
                .router()
                .multicast(route::MEMBER_PREFIX, advertise.as_deref(), |addr| {
                    http.get(format!("{addr}/pipeline/{name}/shuffle")).query(&[
                        ("commit", commit),
                        ("branch", branch),
                        ("dir", dir),
                        ("shard", own.as_str()),
                    ])
                })
                .await
        }
    })
    .await?;

    for resp in responses {
        let boundary = resp
            .headers()
            .get("boundary")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow::anyhow!("shuffle response has no boundary header"))?
            .to_string();
        let body = resp.bytes().await?;
        for part in multipart::decode(&body, &boundary)? {
            store.append(
                &format!("{comp}/{branch}/{name}/{}", part.filename),
                &part.data,
            )?;
        }
    }

    let own = shard.filter();
    for rel in walk_names(store.as_ref(), &live_root)? {
        if !own.matches(&format!("{dir}/{rel}")) {
            store.remove(&format!("{live_root}/{rel}"))?;
        }
    }
    Ok(())
}

/// Every file under `root`, relative and sorted; an absent root is empty.
pub(crate) fn walk_names(store: &dyn Store, root: &str) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    match store.lazy_walk(root, &mut |name| {
        names.push(name.to_string());
        Walk::Continue
    }) {
        Ok(()) => Ok(names),
        Err(StoreError::NotFound(_)) => Ok(names),
        Err(err) => Err(err.into()),
    }
}
