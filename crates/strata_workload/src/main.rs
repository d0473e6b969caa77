//! Workload driver: replay a random workload against a shard node and
//! verify every implied read fact.

use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use strata_workload::Workload;

#[derive(Parser, Debug)]
#[command(name = "strata-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Shard base URL, e.g. `http://127.0.0.1:7450`.
    #[arg(long)]
    node: String,

    /// Number of operations to generate.
    #[arg(long, default_value_t = 100)]
    ops: usize,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Per-request timeout.
    #[arg(long, default_value = "10s")]
    op_timeout: humantime::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let Command::Run(run) = args.cmd;

    let seed = if run.seed == 0 {
        rand::thread_rng().gen()
    } else {
        run.seed
    };
    tracing::info!(seed, ops = run.ops, node = %run.node, "generating workload");

    let mut rng = SmallRng::seed_from_u64(seed);
    let workload = Workload::generate(&mut rng, run.ops);
    let facts = workload.facts();

    let client = reqwest::Client::builder()
        .timeout(run.op_timeout.into())
        .build()?;
    strata_workload::apply(&client, &run.node, &workload).await?;
    strata_workload::verify(&client, &run.node, &facts).await?;

    tracing::info!(facts = facts.len(), "workload verified");
    Ok(())
}
