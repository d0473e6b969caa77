//! Job input polymorphism: in-cluster paths and `s3://` buckets.
//!
//! A job's `input` is either a directory inside the data repo or an
//! `s3://bucket/prefix` reference. Each case carries its own open and list
//! behaviour; the materialiser dispatches on the variant and nothing else
//! branches on the protocol again.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use strata_store::Store;

/// One page of a bucket listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Keys in listing order.
    pub keys: Vec<String>,
    /// Marker to resume from when `truncated`.
    pub next_marker: String,
    pub truncated: bool,
}

/// Object bucket contract (the S3 side of job inputs).
#[async_trait]
pub trait Bucket: Send + Sync + 'static {
    /// List keys under `prefix`, resuming after `marker` (empty = start).
    async fn list(&self, prefix: &str, marker: &str) -> anyhow::Result<ListPage>;
    async fn open(&self, key: &str) -> anyhow::Result<Bytes>;
}

/// Resolves bucket names to [`Bucket`] handles.
pub trait BucketProvider: Send + Sync + 'static {
    fn bucket(&self, name: &str) -> anyhow::Result<Arc<dyn Bucket>>;
}

/// Provider for deployments without object storage: every lookup fails.
pub struct NoBuckets;

impl BucketProvider for NoBuckets {
    fn bucket(&self, name: &str) -> anyhow::Result<Arc<dyn Bucket>> {
        anyhow::bail!("no bucket provider configured (requested bucket {name})")
    }
}

/// In-memory buckets with a small page size, for tests and local runs.
#[derive(Default)]
pub struct MemBuckets {
    buckets: Mutex<BTreeMap<String, Arc<MemBucket>>>,
}

impl MemBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or fetch a bucket and insert `objects` into it.
    pub fn put_bucket(&self, name: &str, objects: &[(&str, &[u8])]) {
        let mut buckets = self.buckets.lock().expect("mem buckets lock");
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemBucket::default()))
            .clone();
        drop(buckets);
        let mut data = bucket.objects.lock().expect("mem bucket lock");
        for (key, bytes) in objects {
            data.insert((*key).to_string(), Bytes::copy_from_slice(bytes));
        }
    }
}

impl BucketProvider for MemBuckets {
    fn bucket(&self, name: &str) -> anyhow::Result<Arc<dyn Bucket>> {
        let buckets = self
            .buckets
            .lock()
            .map_err(|_| anyhow::anyhow!("mem buckets lock poisoned"))?;
        let bucket = buckets
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown bucket {name}"))?;
        Ok(bucket.clone() as Arc<dyn Bucket>)
    }
}

const MEM_BUCKET_PAGE: usize = 2;

#[derive(Default)]
pub struct MemBucket {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

#[async_trait]
impl Bucket for MemBucket {
    async fn list(&self, prefix: &str, marker: &str) -> anyhow::Result<ListPage> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow::anyhow!("mem bucket lock poisoned"))?;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix) && k.as_str() > marker)
            .take(MEM_BUCKET_PAGE + 1)
            .cloned()
            .collect();
        let truncated = keys.len() > MEM_BUCKET_PAGE;
        keys.truncate(MEM_BUCKET_PAGE);
        let next_marker = keys.last().cloned().unwrap_or_default();
        Ok(ListPage {
            keys,
            next_marker,
            truncated,
        })
    }

    async fn open(&self, key: &str) -> anyhow::Result<Bytes> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow::anyhow!("mem bucket lock poisoned"))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such object {key}"))
    }
}

/// A job input, resolved to its protocol case.
pub enum InputSource {
    /// Directory inside the data repo at a specific commit.
    Pfs {
        store: Arc<dyn Store>,
        /// `<repo>/<commit>/<input>` root the job reads from.
        root: String,
    },
    /// `s3://bucket/prefix` object listing.
    S3 {
        bucket: Arc<dyn Bucket>,
        prefix: String,
    },
}

impl InputSource {
    /// Resolve a job's `input` string against the data repo at `commit`.
    pub fn resolve(
        store: Arc<dyn Store>,
        buckets: &dyn BucketProvider,
        data_repo: &str,
        commit: &str,
        input: &str,
    ) -> anyhow::Result<Self> {
        if let Some(rest) = input.strip_prefix("s3://") {
            let (bucket_name, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            anyhow::ensure!(!bucket_name.is_empty(), "s3 input {input:?} has no bucket");
            return Ok(Self::S3 {
                bucket: buckets.bucket(bucket_name)?,
                prefix: prefix.to_string(),
            });
        }
        let input = input.trim_matches('/');
        let root = if input.is_empty() {
            format!("{data_repo}/{commit}")
        } else {
            format!("{data_repo}/{commit}/{input}")
        };
        Ok(Self::Pfs { store, root })
    }

    /// Open one enumerated input by name.
    pub async fn open(&self, name: &str) -> anyhow::Result<Bytes> {
        match self {
            Self::Pfs { store, root } => Ok(store.open(&format!("{root}/{name}"))?),
            Self::S3 { bucket, .. } => bucket.open(name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_bucket_paginates() {
        let buckets = MemBuckets::new();
        buckets.put_bucket(
            "logs",
            &[
                ("day/a", b"1" as &[u8]),
                ("day/b", b"2"),
                ("day/c", b"3"),
                ("other/x", b"9"),
            ],
        );
        let bucket = buckets.bucket("logs").unwrap();

        let first = bucket.list("day/", "").await.unwrap();
        assert_eq!(first.keys, vec!["day/a", "day/b"]);
        assert!(first.truncated);

        let second = bucket.list("day/", &first.next_marker).await.unwrap();
        assert_eq!(second.keys, vec!["day/c"]);
        assert!(!second.truncated);

        assert_eq!(bucket.open("day/a").await.unwrap(), Bytes::from("1"));
        assert!(bucket.open("missing").await.is_err());
    }

    #[test]
    fn s3_inputs_resolve_to_the_bucket_case() {
        let buckets = MemBuckets::new();
        buckets.put_bucket("b", &[]);
        let store: Arc<dyn Store> = Arc::new(strata_store::MemStore::new());
        match InputSource::resolve(store.clone(), &buckets, "data", "c1", "s3://b/pre").unwrap() {
            InputSource::S3 { prefix, .. } => assert_eq!(prefix, "pre"),
            InputSource::Pfs { .. } => panic!("expected the s3 case"),
        }
        match InputSource::resolve(store, &buckets, "data", "c1", "dir").unwrap() {
            InputSource::Pfs { root, .. } => assert_eq!(root, "data/c1/dir"),
            InputSource::S3 { .. } => panic!("expected the pfs case"),
        }
    }
}
