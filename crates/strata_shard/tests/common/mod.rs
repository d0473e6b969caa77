//! Shared helpers for integration tests: in-process shards on port 0, HTTP
//! assertion helpers, and a fake container runtime that hosts mapper and
//! reducer behaviour as local HTTP servers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use strata_shard::container::{ContainerRuntime, ShellRuntime, TaskWorkspace};
use strata_shard::discovery::MemDiscovery;
use strata_shard::server;
use strata_shard::source::{BucketProvider, NoBuckets};
use strata_shard::{Shard, ShardConfig, ShardEnv};
use strata_store::MemStore;

/// Upper bound for readiness polling and waiting reads in tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One in-process shard with its server task.
pub struct TestShard {
    pub shard: Arc<Shard>,
    pub url: String,
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Drop for TestShard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn http() -> reqwest::Client {
    reqwest::Client::new()
}

/// Start a single-shard node with default collaborators.
pub async fn start(index: u64, modulus: u64, discovery: Arc<MemDiscovery>) -> TestShard {
    start_with(
        index,
        modulus,
        discovery,
        Arc::new(ShellRuntime),
        Arc::new(NoBuckets),
        Vec::new(),
    )
    .await
}

/// Start a shard with explicit runtime, buckets, and sync peers.
pub async fn start_with(
    index: u64,
    modulus: u64,
    discovery: Arc<MemDiscovery>,
    runtime: Arc<dyn ContainerRuntime>,
    buckets: Arc<dyn BucketProvider>,
    sync_peers: Vec<String>,
) -> TestShard {
    let env = ShardEnv {
        store: Arc::new(MemStore::new()),
        runtime,
        discovery,
        buckets,
        http: http(),
    };
    let mut cfg = ShardConfig::new("data", "comp", "pipelines", index, modulus);
    cfg.sync_peers = sync_peers;
    let shard = Shard::new(env, cfg).expect("shard bootstrap");
    let (addr, handle) = server::serve(shard.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .expect("shard serve");
    let url = format!("http://{addr}");
    wait_for_ping(&url).await;
    TestShard {
        shard,
        url,
        addr,
        handle,
    }
}

/// Poll `/ping` until the shard answers.
pub async fn wait_for_ping(url: &str) {
    let client = http();
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if let Ok(resp) = client.get(format!("{url}/ping")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "shard at {url} did not come up"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn write_file(url: &str, path: &str, branch: &str, data: &str) {
    let resp = http()
        .post(format!("{url}/file/{path}"))
        .query(&[("branch", branch)])
        .body(data.to_string())
        .send()
        .await
        .expect("write request");
    let status = resp.status();
    let body = resp.text().await.unwrap();
    assert!(status.is_success(), "write {path} failed: {status} {body}");
    assert_eq!(body, format!("Created {path}, size: {}.\n", data.len()));
}

pub async fn check_file(url: &str, path: &str, commit: &str, want: &str) {
    let resp = http()
        .get(format!("{url}/file/{path}"))
        .query(&[("commit", commit)])
        .send()
        .await
        .expect("read request");
    let status = resp.status();
    let body = resp.text().await.unwrap();
    assert!(
        status.is_success(),
        "read {path} at {commit} failed: {status} {body}"
    );
    assert_eq!(body, want, "read {path} at {commit}");
}

pub async fn check_no_file(url: &str, path: &str, commit: &str) {
    let resp = http()
        .get(format!("{url}/file/{path}"))
        .query(&[("commit", commit)])
        .send()
        .await
        .expect("read request");
    assert_eq!(
        resp.status().as_u16(),
        404,
        "{path} at {commit} should be absent"
    );
}

pub async fn commit(url: &str, id: &str, branch: &str) {
    let resp = http()
        .post(format!("{url}/commit"))
        .query(&[("commit", id), ("branch", branch)])
        .send()
        .await
        .expect("commit request");
    let status = resp.status();
    let body = resp.text().await.unwrap();
    assert!(status.is_success(), "commit {id} failed: {status} {body}");
    assert_eq!(body, format!("{id}\n"));
}

pub async fn branch(url: &str, commit: &str, name: &str) {
    let resp = http()
        .post(format!("{url}/branch"))
        .query(&[("commit", commit), ("branch", name)])
        .send()
        .await
        .expect("branch request");
    let status = resp.status();
    let body = resp.text().await.unwrap();
    assert!(status.is_success(), "branch {name} failed: {status} {body}");
    assert_eq!(body, format!("Created branch. ({commit}) -> {name}.\n"));
}

pub async fn post_pipeline(url: &str, name: &str, manifest: &str) {
    let resp = http()
        .post(format!("{url}/pipeline/{name}"))
        .body(manifest.to_string())
        .send()
        .await
        .expect("pipeline request");
    let status = resp.status();
    let body = resp.text().await.unwrap();
    assert!(status.is_success(), "pipeline {name} failed: {status} {body}");
    assert_eq!(body, format!("Created pipeline {name}.\n"));
}

/// Read a pipeline (or job) output file, waiting for materialisation.
pub async fn check_pipeline_file(url: &str, pipeline: &str, path: &str, commit: &str, want: &str) {
    let resp = http()
        .get(format!("{url}/pipeline/{pipeline}/file/{path}"))
        .query(&[("commit", commit)])
        .send()
        .await
        .expect("pipeline read");
    let status = resp.status();
    let body = resp.text().await.unwrap();
    assert!(
        status.is_success(),
        "pipeline {pipeline} file {path} at {commit}: {status} {body}"
    );
    assert_eq!(body, want, "pipeline {pipeline} file {path}");
}

pub async fn check_no_pipeline_file(url: &str, pipeline: &str, path: &str, commit: &str) {
    let resp = http()
        .get(format!("{url}/pipeline/{pipeline}/file/{path}"))
        .query(&[("commit", commit)])
        .send()
        .await
        .expect("pipeline read");
    assert_eq!(
        resp.status().as_u16(),
        404,
        "pipeline {pipeline} file {path} at {commit} should be absent"
    );
}

/// How a fake container transforms each POSTed body.
#[derive(Clone, Copy, Debug)]
pub enum FakeBehavior {
    /// Respond with the request body unchanged.
    Echo,
    /// Respond with the body uppercased.
    Upper,
}

impl FakeBehavior {
    fn for_image(image: &str) -> Self {
        if image.contains("upper") {
            Self::Upper
        } else {
            Self::Echo
        }
    }
}

struct FakeContainer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

/// Container runtime whose "containers" are local HTTP servers. Pipeline
/// tasks still run through the shell runtime.
pub struct FakeJobRuntime {
    next: AtomicU64,
    containers: Mutex<HashMap<String, FakeContainer>>,
    shell: ShellRuntime,
}

impl Default for FakeJobRuntime {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(0),
            containers: Mutex::new(HashMap::new()),
            shell: ShellRuntime,
        }
    }
}

impl FakeJobRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn transform(behavior: FakeBehavior, body: Bytes) -> Bytes {
    match behavior {
        FakeBehavior::Echo => body,
        FakeBehavior::Upper => Bytes::from(body.to_ascii_uppercase()),
    }
}

#[async_trait]
impl ContainerRuntime for FakeJobRuntime {
    async fn pull_image(&self, _image: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start_container(&self, image: &str, _cmd: &[String]) -> anyhow::Result<String> {
        let behavior = FakeBehavior::for_image(image);
        let app = axum::Router::new().fallback(move |body: Bytes| transform(behavior, body));
        let server =
            axum::Server::try_bind(&"127.0.0.1:0".parse().unwrap())?.serve(app.into_make_service());
        let addr = server.local_addr();
        let handle = tokio::spawn(async move {
            let _ = server.await;
        });

        let id = format!("fake-{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .expect("containers lock")
            .insert(id.clone(), FakeContainer { addr, handle });
        Ok(id)
    }

    async fn ip_addr(&self, id: &str) -> anyhow::Result<String> {
        let containers = self.containers.lock().expect("containers lock");
        let container = containers
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no container {id}"))?;
        Ok(container.addr.to_string())
    }

    async fn stop_container(&self, id: &str) -> anyhow::Result<()> {
        if let Some(container) = self.containers.lock().expect("containers lock").remove(id) {
            container.handle.abort();
        }
        Ok(())
    }

    async fn run_task(
        &self,
        image: &str,
        command: &str,
        workspace: &TaskWorkspace,
    ) -> anyhow::Result<()> {
        self.shell.run_task(image, command, workspace).await
    }
}
