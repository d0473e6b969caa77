//! Randomised workloads against a shard and the read facts they imply.
//!
//! A workload is a sequence of file writes, commits, and branch creations.
//! Replaying one against a shard and then checking every fact (the content
//! of each `(path, commit)` pair the workload pins down) is the backbone of
//! the property-style integration tests: apply a workload, apply its facts;
//! replicate, apply the facts again on the destination.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// One operation in a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    /// Append `data` to `path` on `branch`.
    Write {
        path: String,
        branch: String,
        data: String,
    },
    /// Freeze `branch` as commit `id`.
    Commit { id: String, branch: String },
    /// Create `name` at commit `from` (empty = master's head).
    Branch { from: String, name: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    pub ops: Vec<Op>,
}

/// An expected read: `path` at `commit` holds exactly `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub path: String,
    pub commit: String,
    pub data: String,
}

const PATHS: &[&str] = &["a", "b", "c", "d", "dir/x", "dir/y", "deep/er/z", "w"];

impl Workload {
    /// Generate `ops` operations from `rng`. Commit ids are globally unique
    /// so replaying a workload never trips the commit-conflict rule.
    pub fn generate(rng: &mut impl Rng, ops: usize) -> Self {
        let mut out = Vec::with_capacity(ops);
        let mut branches = vec!["master".to_string()];
        let mut commits: Vec<String> = Vec::new();

        for _ in 0..ops {
            let roll = rng.gen_range(0..100);
            if roll < 60 {
                let path = PATHS[rng.gen_range(0..PATHS.len())].to_string();
                let branch = branches[rng.gen_range(0..branches.len())].clone();
                let data: String = (0..rng.gen_range(1..8))
                    .map(|_| char::from(b'a' + rng.gen_range(0..26)))
                    .collect();
                out.push(Op::Write { path, branch, data });
            } else if roll < 85 {
                let id = format!("c{}", commits.len());
                let branch = branches[rng.gen_range(0..branches.len())].clone();
                commits.push(id.clone());
                out.push(Op::Commit { id, branch });
            } else {
                let name = format!("b{}", branches.len());
                let from = if commits.is_empty() || rng.gen_bool(0.3) {
                    String::new()
                } else {
                    commits[rng.gen_range(0..commits.len())].clone()
                };
                branches.push(name.clone());
                out.push(Op::Branch { from, name });
            }
        }
        Self { ops: out }
    }

    /// Every `(path, commit)` content fact this workload pins down.
    pub fn facts(&self) -> Vec<Fact> {
        #[derive(Default, Clone)]
        struct BranchSim {
            /// Content as of the branch head commit.
            head: HashMap<String, String>,
            /// Content including open writes.
            live: HashMap<String, String>,
        }

        let mut branches: HashMap<String, BranchSim> = HashMap::new();
        branches.insert("master".to_string(), BranchSim::default());
        let mut commits: Vec<(String, HashMap<String, String>)> = Vec::new();

        for op in &self.ops {
            match op {
                Op::Write { path, branch, data } => {
                    let sim = branches.entry(branch.clone()).or_default();
                    sim.live.entry(path.clone()).or_default().push_str(data);
                }
                Op::Commit { id, branch } => {
                    let sim = branches.entry(branch.clone()).or_default();
                    sim.head = sim.live.clone();
                    commits.push((id.clone(), sim.live.clone()));
                }
                Op::Branch { from, name } => {
                    let content = if from.is_empty() {
                        branches
                            .get("master")
                            .map(|sim| sim.head.clone())
                            .unwrap_or_default()
                    } else {
                        commits
                            .iter()
                            .find(|(id, _)| id == from)
                            .map(|(_, content)| content.clone())
                            .unwrap_or_default()
                    };
                    branches.insert(
                        name.clone(),
                        BranchSim {
                            head: content.clone(),
                            live: content,
                        },
                    );
                }
            }
        }

        let mut facts = Vec::new();
        for (commit, content) in commits {
            for (path, data) in content {
                facts.push(Fact {
                    path,
                    commit: commit.clone(),
                    data,
                });
            }
        }
        facts.sort_by(|a, b| (&a.commit, &a.path).cmp(&(&b.commit, &b.path)));
        facts
    }
}

/// Replay a workload against a shard's HTTP surface.
pub async fn apply(client: &reqwest::Client, base: &str, workload: &Workload) -> anyhow::Result<()> {
    for op in &workload.ops {
        match op {
            Op::Write { path, branch, data } => {
                let resp = client
                    .post(format!("{base}/file/{path}"))
                    .query(&[("branch", branch)])
                    .body(data.clone())
                    .send()
                    .await?;
                let status = resp.status();
                let body = resp.text().await?;
                anyhow::ensure!(status.is_success(), "write {path} failed: {status} {body}");
                anyhow::ensure!(
                    body == format!("Created {path}, size: {}.\n", data.len()),
                    "unexpected write response {body:?}"
                );
            }
            Op::Commit { id, branch } => {
                let resp = client
                    .post(format!("{base}/commit"))
                    .query(&[("commit", id), ("branch", branch)])
                    .send()
                    .await?;
                let status = resp.status();
                let body = resp.text().await?;
                anyhow::ensure!(status.is_success(), "commit {id} failed: {status} {body}");
                anyhow::ensure!(body == format!("{id}\n"), "unexpected commit response {body:?}");
            }
            Op::Branch { from, name } => {
                let resp = client
                    .post(format!("{base}/branch"))
                    .query(&[("commit", from), ("branch", name)])
                    .send()
                    .await?;
                let status = resp.status();
                anyhow::ensure!(status.is_success(), "branch {name} failed: {status}");
            }
        }
    }
    Ok(())
}

/// Check every fact against a shard, returning the first mismatch.
pub async fn verify(client: &reqwest::Client, base: &str, facts: &[Fact]) -> anyhow::Result<()> {
    for fact in facts {
        let resp = client
            .get(format!("{base}/file/{}", fact.path))
            .query(&[("commit", &fact.commit)])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        anyhow::ensure!(
            status.is_success(),
            "read {} at {} failed: {status} {body}",
            fact.path,
            fact.commit
        );
        anyhow::ensure!(
            body == fact.data,
            "read {} at {}: got {body:?}, want {:?}",
            fact.path,
            fact.commit,
            fact.data
        );
    }
    Ok(())
}
