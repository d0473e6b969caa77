//! Single-shard node binary.
//!
//! Runs one shard over the in-memory reference store with the host-local
//! shell runtime for pipeline tasks. Production deployments swap the store,
//! container runtime, and discovery implementations behind the same traits.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use strata_shard::container::ShellRuntime;
use strata_shard::discovery::MemDiscovery;
use strata_shard::route::ShardFilter;
use strata_shard::server;
use strata_shard::source::NoBuckets;
use strata_shard::{Shard, ShardConfig, ShardEnv};
use strata_store::MemStore;

#[derive(Parser, Debug)]
#[command(name = "strata-node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a shard node.
    Node(NodeArgs),
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Address to serve the shard HTTP surface on.
    #[arg(long, default_value = "127.0.0.1:7450")]
    listen: SocketAddr,

    /// This node's slice of the cluster, as `index-modulus`.
    #[arg(long, default_value = "0-1")]
    shard: String,

    /// Data repo name.
    #[arg(long, default_value = "data")]
    data: String,

    /// Comp repo name (pipeline outputs).
    #[arg(long, default_value = "comp")]
    comp: String,

    /// Pipelines repo name.
    #[arg(long, default_value = "pipelines")]
    pipelines: String,

    /// Peer base URL to push every new commit to. Repeatable.
    #[arg(long = "sync-peer")]
    sync_peers: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let Command::Node(node) = args.cmd;

    let filter: ShardFilter = node.shard.parse()?;
    let env = ShardEnv {
        store: Arc::new(MemStore::new()),
        runtime: Arc::new(ShellRuntime),
        discovery: Arc::new(MemDiscovery::new()),
        buckets: Arc::new(NoBuckets),
        http: reqwest::Client::new(),
    };
    let mut cfg = ShardConfig::new(
        node.data,
        node.comp,
        node.pipelines,
        filter.index,
        filter.modulus,
    );
    cfg.sync_peers = node.sync_peers;

    let shard = Shard::new(env.clone(), cfg)?;
    let (addr, handle) = server::serve(shard, node.listen).await?;
    tracing::info!(%addr, "node up; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    env.store.close();
    handle.abort();
    Ok(())
}
