//! Discovery contract and in-memory implementation.
//!
//! A tiny key/value service: the addresser writes `/shards/<i>` and
//! `/pfs/master/<i>` mappings, the router reads membership on demand, and
//! `watch` long-polls a prefix, redelivering the current value once on
//! start. Tests seed a [`MemDiscovery`] instead of spoofing global caches.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use tokio::sync::watch;

/// Snapshot of all `(key, value)` pairs under a prefix.
pub type PrefixSnapshot = Vec<(String, String)>;

pub type WatchStream = Pin<Box<dyn Stream<Item = PrefixSnapshot> + Send + 'static>>;

/// Key/value discovery service contract.
pub trait Discovery: Send + Sync + 'static {
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    /// All pairs whose key starts with `prefix`, unsorted.
    fn get_all(&self, prefix: &str) -> anyhow::Result<PrefixSnapshot>;
    /// Stream of prefix snapshots: the current state once immediately, then
    /// one snapshot per change. Dropping the stream cancels the watch.
    fn watch(&self, prefix: &str) -> WatchStream;
}

/// In-memory discovery backed by a version-bumped map.
pub struct MemDiscovery {
    data: Arc<Mutex<BTreeMap<String, String>>>,
    version_tx: watch::Sender<u64>,
}

impl Default for MemDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDiscovery {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            data: Arc::new(Mutex::new(BTreeMap::new())),
            version_tx,
        }
    }

    fn snapshot(data: &BTreeMap<String, String>, prefix: &str) -> PrefixSnapshot {
        data.iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Discovery for MemDiscovery {
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| anyhow::anyhow!("discovery lock poisoned"))?;
        data.insert(key.to_string(), value.to_string());
        drop(data);
        self.version_tx.send_modify(|v| *v += 1);
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let data = self
            .data
            .lock()
            .map_err(|_| anyhow::anyhow!("discovery lock poisoned"))?;
        Ok(data.get(key).cloned())
    }

    fn get_all(&self, prefix: &str) -> anyhow::Result<PrefixSnapshot> {
        let data = self
            .data
            .lock()
            .map_err(|_| anyhow::anyhow!("discovery lock poisoned"))?;
        Ok(Self::snapshot(&data, prefix))
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        let data = self.data.clone();
        let prefix = prefix.to_string();
        let rx = self.version_tx.subscribe();

        Box::pin(futures_util::stream::unfold(
            (data, prefix, rx, true),
            |(data, prefix, mut rx, first)| async move {
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                let snapshot = {
                    let guard = data.lock().ok()?;
                    MemDiscovery::snapshot(&guard, &prefix)
                };
                Some((snapshot, (data, prefix, rx, false)))
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn set_get_and_prefix_listing() {
        let d = MemDiscovery::new();
        d.set("foo", "one").unwrap();
        assert_eq!(d.get("foo").unwrap().as_deref(), Some("one"));

        d.set("a/b/foo", "one").unwrap();
        d.set("a/b/bar", "two").unwrap();
        let mut all = d.get_all("a/b").unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("a/b/bar".to_string(), "two".to_string()),
                ("a/b/foo".to_string(), "one".to_string()),
            ]
        );
        assert!(d.get_all("missing/").unwrap().is_empty());
    }

    #[tokio::test]
    async fn watch_redelivers_current_then_changes() {
        let d = Arc::new(MemDiscovery::new());
        d.set("watch/foo", "bar").unwrap();

        let mut stream = d.watch("watch/");
        // First yield is the current state.
        let first = stream.next().await.unwrap();
        assert_eq!(first, vec![("watch/foo".to_string(), "bar".to_string())]);

        d.set("watch/foo", "quux").unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(second, vec![("watch/foo".to_string(), "quux".to_string())]);
    }
}
