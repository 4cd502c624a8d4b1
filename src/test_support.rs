//! `GraphStore` decorator for simulating deterministic, permanent key loss
//! in tests. `InMemoryGraphStore::put`/`subscribe` never yield, so on the
//! default current-thread test runtime a live receiver drains every chunk
//! in lockstep with the sender's pacing delay — tombstoning a key after
//! `send_file` has already returned is a no-op against a receiver that has
//! already cached it. Wrapping the store so the drop happens at write time,
//! before the value ever reaches the live broadcast or backlog, reproduces
//! the loss scenarios spec.md §8 describes regardless of scheduling.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde_json::Value;

use crate::graph_store::{Entry, GraphStore};

/// Wraps a [`GraphStore`], silently dropping every `put`/`put_raw` whose key
/// matches `drop_if` instead of forwarding it to `inner`. Reads (`scan`,
/// `subscribe`) and writes to any other key pass straight through, so a
/// dropped key never appears in a backlog, a live stream, or a scan.
#[derive(Clone)]
pub struct LossyGraphStore<S> {
    inner: S,
    drop_if: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl<S> LossyGraphStore<S> {
    pub fn new(inner: S, drop_if: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self { inner, drop_if: Arc::new(drop_if) }
    }
}

#[async_trait]
impl<S: GraphStore> GraphStore for LossyGraphStore<S> {
    async fn put(&self, key: &str, value: Value) {
        self.put_raw(key, Some(value)).await;
    }

    async fn put_raw(&self, key: &str, value: Option<Value>) {
        if (self.drop_if)(key) {
            return;
        }
        self.inner.put_raw(key, value).await;
    }

    fn subscribe(&self, prefix: &str) -> Pin<Box<dyn Stream<Item = Entry> + Send>> {
        self.inner.subscribe(prefix)
    }

    async fn scan(&self, prefix: &str) -> Vec<Entry> {
        self.inner.scan(prefix).await
    }
}
