//! In-memory reference engine for the [`Store`] contract.
//!
//! Commits are copy-on-write: each snapshot holds an `Arc<BTreeMap>` built by
//! cloning the parent's map (cheap `Bytes` handle clones) and applying the
//! branch's open overlay. Branches carry the overlay (appends, truncating
//! creates, and remove tombstones) plus explicitly created directories.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::store::{CommitDelta, FileFrame, Store, StoreError, Walk};
use crate::{fnv1a64, fnv1a64_extend, Result};

/// Open write recorded on a branch.
#[derive(Debug, Clone)]
enum OverlayEntry {
    Data(Vec<u8>),
    Removed,
}

#[derive(Debug, Default)]
struct BranchState {
    head: Option<String>,
    overlay: BTreeMap<String, OverlayEntry>,
    dirs: BTreeSet<String>,
}

#[derive(Debug)]
struct CommitSnapshot {
    parent: Option<String>,
    branch: String,
    files: Arc<BTreeMap<String, Bytes>>,
    dirs: Arc<BTreeSet<String>>,
    content_hash: u64,
}

#[derive(Debug, Default)]
struct Repo {
    branches: HashMap<String, BranchState>,
    commits: HashMap<String, CommitSnapshot>,
    /// Commit ids in creation order; `pull` replays suffixes of this.
    order: Vec<String>,
}

#[derive(Default)]
struct Inner {
    repos: HashMap<String, Repo>,
    closed: bool,
}

/// In-memory copy-on-write store.
pub struct MemStore {
    inner: RwLock<Inner>,
    notify: Notify,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Internal("store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Internal("store lock poisoned".into()))
    }

    /// Merged `path -> bytes` view of `refname`, restricted to `prefix`
    /// (empty prefix = whole tree). Keys are relative to the repo root.
    fn merged_files(
        inner: &Inner,
        repo: &str,
        refname: &str,
        prefix: &str,
    ) -> Result<BTreeMap<String, Bytes>> {
        let repo = inner
            .repos
            .get(repo)
            .ok_or_else(|| StoreError::NotFound(format!("repo {repo}")))?;
        let mut out = BTreeMap::new();

        // Commit ids resolve before branch names; reads against an explicit
        // commit must see that snapshot.
        if let Some(snapshot) = repo.commits.get(refname) {
            for (path, data) in snapshot.files.iter() {
                if in_prefix(path, prefix) {
                    out.insert(path.clone(), data.clone());
                }
            }
            return Ok(out);
        }

        let branch = repo
            .branches
            .get(refname)
            .ok_or_else(|| StoreError::NotFound(format!("ref {refname}")))?;
        if let Some(head) = branch.head.as_ref().and_then(|h| repo.commits.get(h)) {
            for (path, data) in head.files.iter() {
                if in_prefix(path, prefix) {
                    out.insert(path.clone(), data.clone());
                }
            }
        }
        for (path, entry) in &branch.overlay {
            if !in_prefix(path, prefix) {
                continue;
            }
            match entry {
                OverlayEntry::Data(data) => {
                    out.insert(path.clone(), Bytes::from(data.clone()));
                }
                OverlayEntry::Removed => {
                    out.remove(path);
                }
            }
        }
        Ok(out)
    }

    /// Explicit directories visible through `refname`.
    fn merged_dirs(inner: &Inner, repo: &str, refname: &str) -> Result<BTreeSet<String>> {
        let repo = inner
            .repos
            .get(repo)
            .ok_or_else(|| StoreError::NotFound(format!("repo {repo}")))?;
        if let Some(snapshot) = repo.commits.get(refname) {
            return Ok(snapshot.dirs.as_ref().clone());
        }
        let branch = repo
            .branches
            .get(refname)
            .ok_or_else(|| StoreError::NotFound(format!("ref {refname}")))?;
        let mut out = branch.dirs.clone();
        if let Some(head) = branch.head.as_ref().and_then(|h| repo.commits.get(h)) {
            out.extend(head.dirs.iter().cloned());
        }
        Ok(out)
    }

    /// Existence check used by `file_exists` and `wait_file`: never errors,
    /// an unresolvable ref simply does not exist yet.
    fn exists_in(inner: &Inner, path: &str) -> bool {
        let Ok((repo_name, refname, rest)) = split_path(path) else {
            return false;
        };
        let Some(repo) = inner.repos.get(repo_name) else {
            return false;
        };
        let Some(refname) = refname else {
            return true;
        };
        if !repo.commits.contains_key(refname) && !repo.branches.contains_key(refname) {
            return false;
        }
        if rest.is_empty() {
            return true;
        }
        let files = match Self::merged_files(inner, repo_name, refname, "") {
            Ok(files) => files,
            Err(_) => return false,
        };
        if files.contains_key(rest) {
            return true;
        }
        let dir_prefix = format!("{rest}/");
        if files.keys().any(|p| p.starts_with(&dir_prefix)) {
            return true;
        }
        Self::merged_dirs(inner, repo_name, refname)
            .map(|dirs| dirs.contains(rest))
            .unwrap_or(false)
    }

    /// Resolve a writable branch, creating it implicitly at first write
    /// (pointed at `master`'s current head, matching explicit `branch("")`).
    fn writable_branch<'a>(repo: &'a mut Repo, refname: &str) -> Result<&'a mut BranchState> {
        if !repo.branches.contains_key(refname) {
            if repo.commits.contains_key(refname) {
                return Err(StoreError::Conflict(format!(
                    "commit {refname} is immutable"
                )));
            }
            let head = repo.branches.get("master").and_then(|b| b.head.clone());
            repo.branches.insert(
                refname.to_string(),
                BranchState {
                    head,
                    ..BranchState::default()
                },
            );
        }
        Ok(repo
            .branches
            .get_mut(refname)
            .expect("branch inserted above"))
    }

    fn write_file(&self, path: &str, data: &[u8], truncate: bool, mkdirs: bool) -> Result<usize> {
        let (repo_name, refname, rest) = split_path(path)?;
        let refname =
            refname.ok_or_else(|| StoreError::InvalidPath(format!("missing ref in {path}")))?;
        if rest.is_empty() {
            return Err(StoreError::InvalidPath(format!("{path} names no file")));
        }
        {
            let mut inner = self.write()?;
            if inner.closed {
                return Err(StoreError::Cancelled);
            }
            let repo = inner
                .repos
                .get_mut(repo_name)
                .ok_or_else(|| StoreError::NotFound(format!("repo {repo_name}")))?;
            Self::writable_branch(repo, refname)?;
            // Appends to a committed file start from the head's copy.
            let base = repo
                .branches
                .get(refname)
                .and_then(|b| b.head.as_ref())
                .and_then(|h| repo.commits.get(h))
                .and_then(|c| c.files.get(rest).cloned());
            let branch = repo
                .branches
                .get_mut(refname)
                .expect("branch ensured above");
            if mkdirs {
                insert_ancestors(&mut branch.dirs, rest);
            }
            let written = data.len();
            match branch.overlay.entry(rest.to_string()) {
                std::collections::btree_map::Entry::Occupied(mut occupied) => {
                    match occupied.get_mut() {
                        OverlayEntry::Data(existing) if !truncate => {
                            existing.extend_from_slice(data);
                        }
                        entry => *entry = OverlayEntry::Data(data.to_vec()),
                    }
                }
                std::collections::btree_map::Entry::Vacant(vacant) => {
                    let mut bytes = if truncate {
                        Vec::new()
                    } else {
                        base.map(|b| b.to_vec()).unwrap_or_default()
                    };
                    bytes.extend_from_slice(data);
                    vacant.insert(OverlayEntry::Data(bytes));
                }
            }
            drop(inner);
            self.notify.notify_waiters();
            Ok(written)
        }
    }
}

#[async_trait]
impl Store for MemStore {
    fn ensure_repos(&self, repos: &[&str]) -> Result<()> {
        let mut inner = self.write()?;
        if inner.closed {
            return Err(StoreError::Cancelled);
        }
        for name in repos {
            let repo = inner.repos.entry((*name).to_string()).or_default();
            repo.branches.entry("master".to_string()).or_default();
        }
        Ok(())
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        let (repo_name, refname, rest) = split_path(path)?;
        let refname =
            refname.ok_or_else(|| StoreError::InvalidPath(format!("missing ref in {path}")))?;
        {
            let mut inner = self.write()?;
            if inner.closed {
                return Err(StoreError::Cancelled);
            }
            let repo = inner
                .repos
                .get_mut(repo_name)
                .ok_or_else(|| StoreError::NotFound(format!("repo {repo_name}")))?;
            let branch = Self::writable_branch(repo, refname)?;
            if !rest.is_empty() {
                insert_ancestors(&mut branch.dirs, rest);
                branch.dirs.insert(rest.to_string());
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn create(&self, path: &str, data: &[u8]) -> Result<usize> {
        self.write_file(path, data, true, false)
    }

    fn create_all(&self, path: &str, data: &[u8]) -> Result<usize> {
        self.write_file(path, data, true, true)
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<usize> {
        self.write_file(path, data, false, false)
    }

    fn open(&self, path: &str) -> Result<Bytes> {
        let (repo_name, refname, rest) = split_path(path)?;
        let refname =
            refname.ok_or_else(|| StoreError::InvalidPath(format!("missing ref in {path}")))?;
        if rest.is_empty() {
            return Err(StoreError::InvalidPath(format!("{path} names no file")));
        }
        let inner = self.read()?;
        let files = Self::merged_files(&inner, repo_name, refname, rest)?;
        files
            .get(rest)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let (repo_name, refname, rest) = split_path(path)?;
        let refname =
            refname.ok_or_else(|| StoreError::InvalidPath(format!("missing ref in {path}")))?;
        let inner = self.read()?;
        let files = Self::merged_files(&inner, repo_name, refname, rest)?;
        let dirs = Self::merged_dirs(&inner, repo_name, refname)?;

        let prefix = if rest.is_empty() {
            String::new()
        } else {
            format!("{rest}/")
        };
        let mut children = BTreeSet::new();
        for path in files.keys() {
            if let Some(tail) = path.strip_prefix(&prefix) {
                let name = tail.split('/').next().unwrap_or(tail);
                if !name.is_empty() {
                    children.insert(name.to_string());
                }
            }
        }
        for dir in &dirs {
            if let Some(tail) = dir.strip_prefix(&prefix) {
                let name = tail.split('/').next().unwrap_or(tail);
                if !name.is_empty() {
                    children.insert(name.to_string());
                }
            }
        }
        if children.is_empty() && !rest.is_empty() && !dirs.contains(rest) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(children.into_iter().collect())
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        let inner = self.read()?;
        Ok(Self::exists_in(&inner, path))
    }

    fn remove(&self, path: &str) -> Result<()> {
        let (repo_name, refname, rest) = split_path(path)?;
        let refname =
            refname.ok_or_else(|| StoreError::InvalidPath(format!("missing ref in {path}")))?;
        if rest.is_empty() {
            return Err(StoreError::InvalidPath(format!("{path} names no file")));
        }
        let mut inner = self.write()?;
        if inner.closed {
            return Err(StoreError::Cancelled);
        }
        let repo = inner
            .repos
            .get_mut(repo_name)
            .ok_or_else(|| StoreError::NotFound(format!("repo {repo_name}")))?;
        let in_head = repo
            .branches
            .get(refname)
            .and_then(|b| b.head.as_ref())
            .and_then(|h| repo.commits.get(h))
            .map(|c| c.files.contains_key(rest))
            .unwrap_or(false);
        let branch = repo
            .branches
            .get_mut(refname)
            .ok_or_else(|| StoreError::NotFound(format!("ref {refname}")))?;
        let in_overlay = matches!(branch.overlay.get(rest), Some(OverlayEntry::Data(_)));
        if !in_head && !in_overlay {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if in_head {
            branch
                .overlay
                .insert(rest.to_string(), OverlayEntry::Removed);
        } else {
            branch.overlay.remove(rest);
        }
        Ok(())
    }

    fn branch(&self, repo: &str, from: &str, name: &str) -> Result<()> {
        {
            let mut inner = self.write()?;
            if inner.closed {
                return Err(StoreError::Cancelled);
            }
            let repo = inner
                .repos
                .get_mut(repo)
                .ok_or_else(|| StoreError::NotFound(format!("repo {repo}")))?;
            let head = if from.is_empty() {
                repo.branches.get("master").and_then(|b| b.head.clone())
            } else {
                if !repo.commits.contains_key(from) {
                    return Err(StoreError::NotFound(format!("commit {from}")));
                }
                Some(from.to_string())
            };
            repo.branches.insert(
                name.to_string(),
                BranchState {
                    head,
                    ..BranchState::default()
                },
            );
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn commit(&self, repo: &str, id: &str, branch: &str) -> Result<()> {
        {
            let mut inner = self.write()?;
            if inner.closed {
                return Err(StoreError::Cancelled);
            }
            let repo = inner
                .repos
                .get_mut(repo)
                .ok_or_else(|| StoreError::NotFound(format!("repo {repo}")))?;
            let state = repo
                .branches
                .get(branch)
                .ok_or_else(|| StoreError::NotFound(format!("branch {branch}")))?;

            let parent = state.head.clone();
            let mut files = parent
                .as_ref()
                .and_then(|h| repo.commits.get(h))
                .map(|c| c.files.as_ref().clone())
                .unwrap_or_default();
            let mut dirs = parent
                .as_ref()
                .and_then(|h| repo.commits.get(h))
                .map(|c| c.dirs.as_ref().clone())
                .unwrap_or_default();
            for (path, entry) in &state.overlay {
                match entry {
                    OverlayEntry::Data(data) => {
                        files.insert(path.clone(), Bytes::from(data.clone()));
                    }
                    OverlayEntry::Removed => {
                        files.remove(path);
                    }
                }
            }
            dirs.extend(state.dirs.iter().cloned());

            let hash = content_hash(&files);
            if let Some(existing) = repo.commits.get(id) {
                if existing.content_hash != hash {
                    return Err(StoreError::Conflict(format!(
                        "commit {id} exists with different content"
                    )));
                }
            } else {
                repo.commits.insert(
                    id.to_string(),
                    CommitSnapshot {
                        parent,
                        branch: branch.to_string(),
                        files: Arc::new(files),
                        dirs: Arc::new(dirs),
                        content_hash: hash,
                    },
                );
                repo.order.push(id.to_string());
            }
            let state = repo.branches.get_mut(branch).expect("branch checked above");
            state.head = Some(id.to_string());
            state.overlay.clear();
            state.dirs.clear();
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn lazy_walk(&self, path: &str, visit: &mut dyn FnMut(&str) -> Walk) -> Result<()> {
        let (repo_name, refname, rest) = split_path(path)?;
        let refname =
            refname.ok_or_else(|| StoreError::InvalidPath(format!("missing ref in {path}")))?;
        let files = {
            let inner = self.read()?;
            let files = Self::merged_files(&inner, repo_name, refname, rest)?;
            if files.is_empty()
                && !rest.is_empty()
                && !Self::merged_dirs(&inner, repo_name, refname)?.contains(rest)
            {
                return Err(StoreError::NotFound(path.to_string()));
            }
            files
        };
        let prefix = if rest.is_empty() {
            String::new()
        } else {
            format!("{rest}/")
        };
        for full in files.keys() {
            let rel = full.strip_prefix(&prefix).unwrap_or(full);
            if let Walk::Stop = visit(rel) {
                break;
            }
        }
        Ok(())
    }

    async fn wait_file(&self, path: &str) -> Result<()> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let inner = self.read()?;
                if Self::exists_in(&inner, path) {
                    return Ok(());
                }
                if inner.closed {
                    return Err(StoreError::Cancelled);
                }
            }
            notified.await;
        }
    }

    fn pull(&self, repo: &str, from_commit: &str) -> Result<Vec<CommitDelta>> {
        let inner = self.read()?;
        let repo = inner
            .repos
            .get(repo)
            .ok_or_else(|| StoreError::NotFound(format!("repo {repo}")))?;
        let start = if from_commit.is_empty() {
            0
        } else {
            repo.order
                .iter()
                .position(|id| id == from_commit)
                .ok_or_else(|| StoreError::NotFound(format!("commit {from_commit}")))?
                + 1
        };

        let mut out = Vec::new();
        for id in &repo.order[start..] {
            let snapshot = repo
                .commits
                .get(id)
                .ok_or_else(|| StoreError::Internal(format!("dangling commit {id}")))?;
            let parent = snapshot
                .parent
                .as_ref()
                .and_then(|p| repo.commits.get(p));
            let parent_files = parent.map(|c| c.files.as_ref());
            let parent_dirs = parent.map(|c| c.dirs.as_ref());

            let mut files = Vec::new();
            for (path, data) in snapshot.files.iter() {
                let unchanged = parent_files
                    .and_then(|f| f.get(path))
                    .map(|old| old == data)
                    .unwrap_or(false);
                if !unchanged {
                    files.push(FileFrame {
                        path: path.clone(),
                        data: data.clone(),
                    });
                }
            }
            let dirs = snapshot
                .dirs
                .iter()
                .filter(|d| parent_dirs.map(|p| !p.contains(*d)).unwrap_or(true))
                .cloned()
                .collect();
            out.push(CommitDelta {
                id: id.clone(),
                parent: snapshot.parent.clone(),
                branch: snapshot.branch.clone(),
                dirs,
                files,
            });
        }
        Ok(out)
    }

    fn close(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }
}

/// Split `<repo>[/<ref>[/<rest...>]]`, rejecting empty paths.
fn split_path(path: &str) -> Result<(&str, Option<&str>, &str)> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let mut parts = trimmed.splitn(3, '/');
    let repo = parts.next().expect("non-empty path");
    let refname = parts.next();
    let rest = parts.next().unwrap_or("");
    Ok((repo, refname, rest))
}

fn in_prefix(path: &str, prefix: &str) -> bool {
    prefix.is_empty() || path == prefix || path.starts_with(&format!("{prefix}/"))
}

fn insert_ancestors(dirs: &mut BTreeSet<String>, rest: &str) {
    let mut acc = String::new();
    for seg in rest.split('/') {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(seg);
        dirs.insert(acc.clone());
    }
    // The final segment is the file itself for write paths; harmless to keep
    // as a dir entry only when mkdir_all inserted it explicitly.
    dirs.remove(rest);
}

/// Order-independent content hash over a snapshot, used for commit
/// idempotence checks.
fn content_hash(files: &BTreeMap<String, Bytes>) -> u64 {
    let mut acc = 0u64;
    for (path, data) in files {
        let h = fnv1a64_extend(fnv1a64_extend(fnv1a64(path.as_bytes()), &[0]), data);
        acc ^= h;
    }
    acc
}
