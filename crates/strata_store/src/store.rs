use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::Result;

/// Categorised store failure.
///
/// The HTTP layer maps these onto status codes (404/409/500); everything the
/// rest of the system needs to distinguish is a variant here.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Repo, branch, commit, or file is absent.
    #[error("not found: {0}")]
    NotFound(String),
    /// Commit id collision with different content, or a write aimed at an
    /// immutable snapshot.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Path does not parse as `<repo>/<ref>/<file-path>`.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// The store was closed while an operation was blocked on it.
    #[error("store closed")]
    Cancelled,
    /// Engine-level failure.
    #[error("internal store error: {0}")]
    Internal(String),
}

/// Visitor verdict for [`Store::lazy_walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    Stop,
}

/// One changed file inside a commit delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFrame {
    /// Path relative to the repo root.
    pub path: String,
    pub data: Bytes,
}

/// A commit described relative to its parent, as emitted by [`Store::pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDelta {
    pub id: String,
    pub parent: Option<String>,
    pub branch: String,
    /// Explicitly created directories new in this commit.
    pub dirs: Vec<String>,
    /// Files added or changed relative to the parent snapshot, full contents.
    pub files: Vec<FileFrame>,
}

/// The copy-on-write store contract.
///
/// Invariants every engine must uphold:
///
/// - commits are immutable once named;
/// - `wait_file` never returns before the file is durably visible to `open`;
/// - `lazy_walk` at a commit sees exactly the files of that commit, in
///   deterministic sorted order;
/// - writes between commits are visible through the branch ref only.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Idempotently create the named repos (each with a `master` branch).
    fn ensure_repos(&self, repos: &[&str]) -> Result<()>;

    /// Record a directory (and its ancestors) in the branch's open overlay.
    fn mkdir_all(&self, path: &str) -> Result<()>;

    /// Create or truncate a file on a branch. Returns the byte count written.
    fn create(&self, path: &str, data: &[u8]) -> Result<usize>;

    /// Like [`Store::create`] but records missing parent directories too.
    fn create_all(&self, path: &str, data: &[u8]) -> Result<usize>;

    /// Atomically append to a file on a branch, creating it if absent.
    fn append(&self, path: &str, data: &[u8]) -> Result<usize>;

    /// Read a file through a branch or commit ref.
    fn open(&self, path: &str) -> Result<Bytes>;

    /// Sorted child names (files and directories) of a directory.
    fn read_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Whether a file or directory exists at `path`.
    fn file_exists(&self, path: &str) -> Result<bool>;

    /// Remove a file from a branch's view. Committed snapshots are untouched.
    fn remove(&self, path: &str) -> Result<()>;

    /// Create (or repoint) branch `name` at commit `from`.
    ///
    /// An empty `from` means the `master` branch's current head. Repointing
    /// discards the branch's open writes.
    fn branch(&self, repo: &str, from: &str, name: &str) -> Result<()>;

    /// Freeze the branch's open writes as commit `id`.
    ///
    /// Re-committing an id with identical content is a no-op; an existing id
    /// with different content is a [`StoreError::Conflict`].
    fn commit(&self, repo: &str, id: &str, branch: &str) -> Result<()>;

    /// Enumerate file paths under `path` (relative, sorted). The visitor may
    /// return [`Walk::Stop`] to end the traversal early.
    fn lazy_walk(&self, path: &str, visit: &mut dyn FnMut(&str) -> Walk) -> Result<()>;

    /// Block until `path` exists or the store closes.
    ///
    /// Wake-up is edge-triggered and idempotent; any number of concurrent
    /// waiters is supported. A ref that does not resolve yet (for example a
    /// commit id that has not landed) counts as "does not exist yet".
    async fn wait_file(&self, path: &str) -> Result<()>;

    /// The strict-successor commits of `from_commit` up to the current head,
    /// in commit order. An empty `from_commit` yields the full history.
    fn pull(&self, repo: &str, from_commit: &str) -> Result<Vec<CommitDelta>>;

    /// Close the store: all blocked `wait_file` calls return
    /// [`StoreError::Cancelled`] and further blocking is refused.
    fn close(&self);
}
