//! The one external collaborator the channel/overlay/transfer stack is built
//! against: a gossip-replicated keyed map. `put`/`subscribe` is the entire
//! contract — best-effort, at-least-once, unordered delivery, tombstone via
//! overwrite with `None`.
//!
//! [`InMemoryGraphStore`] is the only concrete backend this crate ships: a
//! same-process stand-in for tests and examples, not a production
//! distributed store. Wiring a real gossip-replicated backend behind
//! [`GraphStore`] is future work.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// A single observed update: `None` is a tombstone (deletion).
#[derive(Clone, Debug)]
pub struct Entry {
    pub key: String,
    pub value: Option<Value>,
}

/// The graph-store contract: a keyed map with best-effort gossip replication.
///
/// `subscribe` yields every entry already present under `prefix` plus every
/// future `put`/tombstone under that prefix, at least once, in no particular
/// order, and possibly more than once — callers must deduplicate themselves.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn put(&self, key: &str, value: Value);

    async fn tombstone(&self, key: &str) {
        self.put_raw(key, None).await;
    }

    async fn put_raw(&self, key: &str, value: Option<Value>);

    /// Stream every entry under `prefix`, replaying what is already stored
    /// before delivering subsequent live updates.
    fn subscribe(&self, prefix: &str) -> std::pin::Pin<Box<dyn Stream<Item = Entry> + Send>>;

    /// One-shot snapshot of every entry currently stored under `prefix`,
    /// used by the transfer engine's sweep procedures.
    async fn scan(&self, prefix: &str) -> Vec<Entry>;
}

/// `DashMap` + a broadcast channel per store — clones share the same
/// underlying maps, the way two gossip peers share one replicated view.
#[derive(Clone)]
pub struct InMemoryGraphStore {
    entries: Arc<DashMap<String, Value>>,
    updates: Arc<broadcast::Sender<Entry>>,
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(4096);
        Self {
            entries: Arc::new(DashMap::new()),
            updates: Arc::new(tx),
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn put(&self, key: &str, value: Value) {
        self.put_raw(key, Some(value)).await;
    }

    async fn put_raw(&self, key: &str, value: Option<Value>) {
        match &value {
            Some(v) => {
                self.entries.insert(key.to_string(), v.clone());
            }
            None => {
                self.entries.remove(key);
            }
        }
        let _ = self.updates.send(Entry {
            key: key.to_string(),
            value,
        });
    }

    fn subscribe(&self, prefix: &str) -> std::pin::Pin<Box<dyn Stream<Item = Entry> + Send>> {
        let prefix = prefix.to_string();
        let backlog: Vec<Entry> = self
            .entries
            .iter()
            .filter(|kv| kv.key().starts_with(&prefix))
            .map(|kv| Entry {
                key: kv.key().clone(),
                value: Some(kv.value().clone()),
            })
            .collect();

        let live = BroadcastStream::new(self.updates.subscribe())
            .filter_map(|r| futures_util::future::ready(r.ok()));

        let prefix_filter = prefix.clone();
        let live = live.filter(move |entry| {
            let matches = entry.key.starts_with(&prefix_filter);
            futures_util::future::ready(matches)
        });

        Box::pin(futures_util::stream::iter(backlog).chain(live))
    }

    async fn scan(&self, prefix: &str) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|kv| kv.key().starts_with(prefix))
            .map(|kv| Entry {
                key: kv.key().clone(),
                value: Some(kv.value().clone()),
            })
            .collect()
    }
}
