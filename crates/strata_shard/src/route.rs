//! Shard routing: stable path hashing, shard filters, and multicast.
//!
//! The hash decides where a path lives; the filter string `i-m` is the sole
//! authority for "does this file belong here"; multicast fans a request out
//! to every shard owning a resource and concatenates the response bodies.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};

use crate::discovery::Discovery;

/// Discovery prefix under which every shard publishes its address.
pub const MEMBER_PREFIX: &str = "/pfs/master";

/// Hash a path for shard placement. FNV-1a 64, part of the wire contract.
pub fn hash_path(path: &str) -> u64 {
    strata_store::fnv1a64(path.as_bytes())
}

/// A `k-of-n` shard filter, parsed from the `i-m` query form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardFilter {
    pub index: u64,
    pub modulus: u64,
}

impl ShardFilter {
    pub fn new(index: u64, modulus: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(modulus >= 1, "shard modulus must be >= 1");
        anyhow::ensure!(
            index < modulus,
            "shard index {index} out of range for modulus {modulus}"
        );
        Ok(Self { index, modulus })
    }

    /// Whether `path` belongs to this shard.
    pub fn matches(&self, path: &str) -> bool {
        hash_path(path) % self.modulus == self.index
    }
}

impl FromStr for ShardFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (index, modulus) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("shard filter {s:?} is not of the form i-m"))?;
        let index: u64 = index
            .parse()
            .with_context(|| format!("shard filter {s:?}: bad index"))?;
        let modulus: u64 = modulus
            .parse()
            .with_context(|| format!("shard filter {s:?}: bad modulus"))?;
        Self::new(index, modulus)
    }
}

impl fmt::Display for ShardFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.index, self.modulus)
    }
}

/// Resolves shard membership through discovery and fans requests out.
#[derive(Clone)]
pub struct ShardRouter {
    discovery: Arc<dyn Discovery>,
    http: reqwest::Client,
}

impl ShardRouter {
    pub fn new(discovery: Arc<dyn Discovery>, http: reqwest::Client) -> Self {
        Self { discovery, http }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Current member addresses for `key`, in key order.
    pub fn members(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut entries = self.discovery.get_all(key)?;
        entries.sort();
        Ok(entries.into_iter().map(|(_, addr)| addr).collect())
    }

    /// Issue one request per member of `key` in parallel and return the
    /// responses in member order. `build` receives each member's base
    /// address and fills in the host the template request left open.
    ///
    /// Any per-peer failure (transport error or non-2xx status) fails the
    /// whole multicast; retrying is the caller's business.
    pub async fn multicast<F>(
        &self,
        key: &str,
        exclude: Option<&str>,
        build: F,
    ) -> anyhow::Result<Vec<reqwest::Response>>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let members: Vec<String> = self
            .members(key)?
            .into_iter()
            .filter(|addr| Some(addr.as_str()) != exclude)
            .collect();
        let pending = members.iter().map(|addr| {
            let req = build(addr);
            async move {
                let resp = req
                    .send()
                    .await
                    .with_context(|| format!("multicast request to {addr}"))?;
                anyhow::ensure!(
                    resp.status().is_success(),
                    "multicast peer {addr} returned {}",
                    resp.status()
                );
                Ok::<_, anyhow::Error>(resp)
            }
        });
        futures_util::future::try_join_all(pending).await
    }
}

/// Concatenate response bodies into one byte stream.
///
/// Bodies are drained strictly in order: the stream reads the first response
/// to EOF before touching the second, and dropping the stream drops every
/// remaining body.
pub fn multi_body(
    responses: Vec<reqwest::Response>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures_util::stream::iter(responses)
        .map(|resp| {
            resp.bytes_stream()
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parses_and_rejects() {
        let f: ShardFilter = "0-2".parse().unwrap();
        assert_eq!((f.index, f.modulus), (0, 2));
        assert!("2-2".parse::<ShardFilter>().is_err());
        assert!("1".parse::<ShardFilter>().is_err());
        assert!("a-b".parse::<ShardFilter>().is_err());
        assert!("1-0".parse::<ShardFilter>().is_err());
        assert_eq!("1-4".parse::<ShardFilter>().unwrap().to_string(), "1-4");
    }

    #[test]
    fn every_path_matches_exactly_one_filter() {
        let paths = [
            "foo", "bar", "buzz", "bizz", "data/foo", "data/bar", "a/b/c", "jobs/wordcount",
        ];
        for m in 1..=8u64 {
            for path in paths {
                let matching = (0..m)
                    .filter(|i| ShardFilter::new(*i, m).unwrap().matches(path))
                    .count();
                assert_eq!(matching, 1, "path {path} under modulus {m}");
            }
        }
    }
}
