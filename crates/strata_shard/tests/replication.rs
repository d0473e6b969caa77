//! Replication: batch pull, per-commit sync, and history prefix properties.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use strata_shard::discovery::MemDiscovery;
use strata_shard::replica::{self, ShardReplica};
use strata_workload::{Op, Workload};

fn commit_ids(store: &dyn strata_store::Store, repo: &str) -> Vec<String> {
    store
        .pull(repo, "")
        .unwrap()
        .into_iter()
        .map(|delta| delta.id)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_replicates_every_fact() {
    let client = common::http();
    for seed in [11u64, 12, 13] {
        let src = common::start(0, 1, Arc::new(MemDiscovery::new())).await;
        let dst = common::start(0, 1, Arc::new(MemDiscovery::new())).await;

        let mut rng = SmallRng::seed_from_u64(seed);
        let workload = Workload::generate(&mut rng, 40);
        strata_workload::apply(&client, &src.url, &workload)
            .await
            .unwrap();

        let replica = ShardReplica::new(src.url.clone(), client.clone());
        replica
            .pull_into("", dst.shard.env.store.as_ref(), "data")
            .await
            .unwrap();

        strata_workload::verify(&client, &dst.url, &workload.facts())
            .await
            .unwrap_or_else(|err| panic!("seed {seed}: {err:#}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_resumes_from_a_known_commit() {
    let client = common::http();
    let src = common::start(0, 1, Arc::new(MemDiscovery::new())).await;
    let dst = common::start(0, 1, Arc::new(MemDiscovery::new())).await;

    common::write_file(&src.url, "a", "master", "x").await;
    common::commit(&src.url, "c1", "master").await;
    let replica = ShardReplica::new(src.url.clone(), client.clone());
    replica
        .pull_into("", dst.shard.env.store.as_ref(), "data")
        .await
        .unwrap();

    common::write_file(&src.url, "b", "master", "y").await;
    common::commit(&src.url, "c2", "master").await;
    replica
        .pull_into("c1", dst.shard.env.store.as_ref(), "data")
        .await
        .unwrap();

    common::check_file(&dst.url, "a", "c1", "x").await;
    common::check_file(&dst.url, "a", "c2", "x").await;
    common::check_file(&dst.url, "b", "c2", "y").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_to_pushes_each_commit_and_keeps_prefix_order() {
    let client = common::http();
    for seed in [21u64, 22] {
        let src = common::start(0, 1, Arc::new(MemDiscovery::new())).await;
        let dst = common::start(0, 1, Arc::new(MemDiscovery::new())).await;
        let peers = vec![dst.url.clone()];

        let mut rng = SmallRng::seed_from_u64(seed);
        let workload = Workload::generate(&mut rng, 40);

        for op in &workload.ops {
            let single = Workload {
                ops: vec![op.clone()],
            };
            strata_workload::apply(&client, &src.url, &single)
                .await
                .unwrap();
            if matches!(op, Op::Commit { .. }) {
                replica::sync_to(&src.shard.env.store, "data", &peers, &client)
                    .await
                    .unwrap();
                // Every intermediate destination state is a commit-wise
                // prefix of the source history.
                let src_ids = commit_ids(src.shard.env.store.as_ref(), "data");
                let dst_ids = commit_ids(dst.shard.env.store.as_ref(), "data");
                assert!(
                    src_ids.starts_with(&dst_ids) && !dst_ids.is_empty(),
                    "seed {seed}: {dst_ids:?} is not a prefix of {src_ids:?}"
                );
            }
        }

        strata_workload::verify(&client, &dst.url, &workload.facts())
            .await
            .unwrap_or_else(|err| panic!("seed {seed}: {err:#}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_from_pulls_each_commit() {
    let client = common::http();
    let src = common::start(0, 1, Arc::new(MemDiscovery::new())).await;
    let dst = common::start(0, 1, Arc::new(MemDiscovery::new())).await;
    let sources = vec![src.url.clone()];

    let mut rng = SmallRng::seed_from_u64(31);
    let workload = Workload::generate(&mut rng, 40);
    for op in &workload.ops {
        let single = Workload {
            ops: vec![op.clone()],
        };
        strata_workload::apply(&client, &src.url, &single)
            .await
            .unwrap();
        if matches!(op, Op::Commit { .. }) {
            replica::sync_from(&dst.shard.env.store, "data", &sources, &client)
                .await
                .unwrap();
        }
    }

    strata_workload::verify(&client, &dst.url, &workload.facts())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn configured_sync_peers_receive_commits_automatically() {
    let dst = common::start(0, 1, Arc::new(MemDiscovery::new())).await;
    let src = common::start_with(
        0,
        1,
        Arc::new(MemDiscovery::new()),
        Arc::new(strata_shard::container::ShellRuntime),
        Arc::new(strata_shard::source::NoBuckets),
        vec![dst.url.clone()],
    )
    .await;

    common::write_file(&src.url, "a", "master", "hello").await;
    common::commit(&src.url, "c1", "master").await;

    // The push is kicked off in the background by the commit path.
    let deadline = tokio::time::Instant::now() + common::TEST_TIMEOUT;
    loop {
        let ids = commit_ids(dst.shard.env.store.as_ref(), "data");
        if ids == ["c1"] {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "commit never arrived at the sync peer (have {ids:?})"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    common::check_file(&dst.url, "a", "c1", "hello").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redelivered_commits_are_harmless() {
    let client = common::http();
    let src = common::start(0, 1, Arc::new(MemDiscovery::new())).await;
    let dst = common::start(0, 1, Arc::new(MemDiscovery::new())).await;

    common::write_file(&src.url, "a", "master", "x").await;
    common::commit(&src.url, "c1", "master").await;

    let replica = ShardReplica::new(src.url.clone(), client.clone());
    for _ in 0..3 {
        replica
            .pull_into("", dst.shard.env.store.as_ref(), "data")
            .await
            .unwrap();
    }
    assert_eq!(commit_ids(dst.shard.env.store.as_ref(), "data"), ["c1"]);
    common::check_file(&dst.url, "a", "c1", "x").await;
}
