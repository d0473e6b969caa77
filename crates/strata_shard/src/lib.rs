//! Sharded data+compute fabric node.
//!
//! A shard is one node's slice of the cluster: three repos (data, comp,
//! pipelines) behind an HTTP surface, replication to peers, and a
//! materialiser that runs map/reduce jobs and pipelines on every commit.
//! Cluster membership is data, resolved through the discovery service; a
//! shard holds only its `(index, modulus)` identity and looks peers up on
//! demand.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use strata_store::Store;

pub mod container;
pub mod discovery;
pub mod materialize;
pub mod multipart;
pub mod pipeline;
pub mod replica;
pub mod route;
pub mod server;
pub mod source;

use container::ContainerRuntime;
use discovery::Discovery;
use route::{ShardFilter, ShardRouter};
use source::BucketProvider;

/// Everything a shard needs from the outside world, passed in explicitly so
/// tests can substitute any collaborator.
#[derive(Clone)]
pub struct ShardEnv {
    pub store: Arc<dyn Store>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub discovery: Arc<dyn Discovery>,
    pub buckets: Arc<dyn BucketProvider>,
    pub http: reqwest::Client,
}

/// Static configuration of one shard.
#[derive(Clone, Debug)]
pub struct ShardConfig {
    /// Data repo name (user files).
    pub data: String,
    /// Comp repo name (pipeline outputs).
    pub comp: String,
    /// Pipelines repo name (manifests).
    pub pipelines: String,
    pub index: u64,
    pub modulus: u64,
    /// Peers to push every new commit to.
    pub sync_peers: Vec<String>,
}

impl ShardConfig {
    pub fn new(
        data: impl Into<String>,
        comp: impl Into<String>,
        pipelines: impl Into<String>,
        index: u64,
        modulus: u64,
    ) -> Self {
        Self {
            data: data.into(),
            comp: comp.into(),
            pipelines: pipelines.into(),
            index,
            modulus,
            sync_peers: Vec::new(),
        }
    }
}

/// One shard: repos, identity, and collaborators.
pub struct Shard {
    pub env: ShardEnv,
    pub cfg: ShardConfig,
    router: ShardRouter,
    advertise: RwLock<Option<String>>,
}

impl Shard {
    /// Build a shard and create its repos.
    pub fn new(env: ShardEnv, cfg: ShardConfig) -> anyhow::Result<Arc<Self>> {
        let filter = ShardFilter::new(cfg.index, cfg.modulus)?;
        tracing::info!(
            shard = %filter,
            data = %cfg.data,
            comp = %cfg.comp,
            pipelines = %cfg.pipelines,
            "bootstrapping shard"
        );
        env.store
            .ensure_repos(&[&cfg.data, &cfg.comp, &cfg.pipelines])?;
        let router = ShardRouter::new(env.discovery.clone(), env.http.clone());
        Ok(Arc::new(Self {
            env,
            cfg,
            router,
            advertise: RwLock::new(None),
        }))
    }

    pub fn filter(&self) -> ShardFilter {
        ShardFilter {
            index: self.cfg.index,
            modulus: self.cfg.modulus,
        }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// The address other shards reach this one at, once serving.
    pub fn advertise(&self) -> Option<String> {
        self.advertise.read().ok().and_then(|a| a.clone())
    }

    /// Record the advertised address and publish it to discovery.
    pub fn set_advertise(&self, url: &str) -> anyhow::Result<()> {
        if let Ok(mut slot) = self.advertise.write() {
            *slot = Some(url.to_string());
        }
        self.env
            .discovery
            .set(&format!("{}/{}", route::MEMBER_PREFIX, self.cfg.index), url)?;
        self.env
            .discovery
            .set(&format!("/shards/{}", self.cfg.index), url)?;
        Ok(())
    }
}

/// Run `f` up to `times` times, pausing between attempts. Transient-failure
/// policy for every component that talks to the network or a container.
pub async fn retry<T, F, Fut>(times: usize, pause: Duration, mut f: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last = None;
    for attempt in 0..times.max(1) {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::debug!(attempt, error = ?err, "retrying after error");
                last = Some(err);
                if attempt + 1 < times {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("retry budget exhausted")))
}
