//! The chunked file-transfer engine: publish/subscribe through the graph
//! store, a time-bounded sender cache, multi-pass sweep recovery, and
//! RPC-based retransmission. The largest of the three layered components.

mod words;
pub use words::{generate_code, DICTIONARY};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelEvent};
use crate::graph_store::GraphStore;
use crate::overlay::{EncryptedOverlay, OverlayEvent};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer {0} is not known to this channel")]
    UnknownPeer(String),
    #[error("publishing transfer metadata took too long")]
    SendTimeout,
    #[error("transfer {0} could not be fully reassembled")]
    TransferIncomplete(String),
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub inter_chunk_delay: Duration,
    pub sender_cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub max_sweeps: u32,
    pub inter_sweep_delay: Duration,
    pub final_recheck_delay: Duration,
    pub metadata_publish_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            inter_chunk_delay: Duration::from_millis(5),
            sender_cache_ttl: Duration::from_secs(5 * 60),
            cache_sweep_interval: Duration::from_secs(60),
            max_sweeps: 5,
            inter_sweep_delay: Duration::from_secs(2),
            final_recheck_delay: Duration::from_secs(1),
            metadata_publish_timeout: Duration::from_secs(10),
        }
    }
}

impl TransferConfig {
    pub fn receive_timeout(&self, total_chunks: u32) -> Duration {
        let chunked = self.inter_chunk_delay * 3 * total_chunks;
        chunked.max(Duration::from_secs(15))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size: u64,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
    pub timestamp: i64,
    pub sender: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferChunk {
    pub index: u32,
    pub data: String,
    pub timestamp: i64,
    #[serde(rename = "fileId")]
    pub file_id: String,
}

struct SenderCacheEntry {
    chunks: HashMap<u32, String>,
    created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    TransferComplete(String),
    ReceiveProgress { transfer_id: String, received: u32, total: u32 },
    FileReceived { filename: String, size: u64, data: Vec<u8>, file_id: String },
    TransferIncomplete(String),
    Message { from: String, value: Value },
}

enum Transport<S> {
    Plain(Channel<S>),
    Encrypted(EncryptedOverlay<S>),
}

struct Inner<S> {
    channel: Channel<S>,
    transport: Transport<S>,
    store: S,
    config: TransferConfig,
    sender_cache: RwLock<HashMap<String, SenderCacheEntry>>,
    processing: RwLock<HashSet<String>>,
    events: broadcast::Sender<TransferEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The chunked file-transfer engine. Cheaply `Clone`.
#[derive(Clone)]
pub struct TransferEngine<S> {
    inner: Arc<Inner<S>>,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

impl<S: GraphStore + Clone + 'static> TransferEngine<S> {
    /// Coordination RPCs (`request-chunks`, `transfer-confirmed`) always use
    /// the bare channel regardless of whether the unified messaging surface
    /// is encrypted; only chunk bytes in the graph store are ever
    /// unencrypted by design, so there is no "plain vs encrypted" choice to
    /// make for them.
    pub async fn new_plain(channel: Channel<S>, store: S, config: TransferConfig) -> Self {
        Self::start(channel.clone(), Transport::Plain(channel), store, config).await
    }

    pub async fn new_encrypted(channel: Channel<S>, overlay: EncryptedOverlay<S>, store: S, config: TransferConfig) -> Self {
        Self::start(channel, Transport::Encrypted(overlay), store, config).await
    }

    async fn start(channel: Channel<S>, transport: Transport<S>, store: S, config: TransferConfig) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        let inner = Arc::new(Inner {
            channel,
            transport,
            store,
            config,
            sender_cache: RwLock::new(HashMap::new()),
            processing: RwLock::new(HashSet::new()),
            events,
            tasks: Mutex::new(Vec::new()),
        });
        let engine = TransferEngine { inner };

        engine.register_rpc_handlers().await;

        let file_listener = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.file_listener_loop().await })
        };
        let cache_sweeper = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.cache_sweeper_loop().await })
        };
        let message_forwarder = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.message_forwarder_loop().await })
        };

        {
            let mut tasks = engine.inner.tasks.lock().await;
            tasks.push(file_listener);
            tasks.push(cache_sweeper);
            tasks.push(message_forwarder);
        }

        engine
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub async fn destroy(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.inner.sender_cache.write().await.clear();
        self.inner.processing.write().await.clear();
    }

    // ── Unified messaging surface ──────────────────────────────────────

    pub async fn send(&self, value: Value) {
        match &self.inner.transport {
            Transport::Plain(channel) => channel.send(value).await,
            Transport::Encrypted(overlay) => overlay.broadcast(value).await,
        }
    }

    pub async fn send_to(&self, address: &str, value: Value) -> Result<(), TransferError> {
        match &self.inner.transport {
            Transport::Plain(channel) => channel
                .send_to(address, value)
                .await
                .map_err(|_| TransferError::UnknownPeer(address.to_string())),
            Transport::Encrypted(overlay) => overlay
                .direct(address, value)
                .await
                .map_err(|_| TransferError::UnknownPeer(address.to_string())),
        }
    }

    async fn message_forwarder_loop(&self) {
        match &self.inner.transport {
            Transport::Plain(channel) => {
                let mut events = channel.subscribe_events();
                loop {
                    match events.recv().await {
                        Ok(ChannelEvent::Message { from, value }) => {
                            let _ = self.inner.events.send(TransferEvent::Message { from, value });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            Transport::Encrypted(overlay) => {
                let mut events = overlay.subscribe_events();
                loop {
                    match events.recv().await {
                        Ok(OverlayEvent::Decrypted { from, value, .. }) => {
                            let _ = self.inner.events.send(TransferEvent::Message { from, value });
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    // ── Send path ──────────────────────────────────────────────────────

    pub async fn send_file(&self, name: String, mime_type: Option<String>, bytes: Vec<u8>) -> Result<String, TransferError> {
        let transfer_id = generate_code();
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let total_chunks = b64.len().div_ceil(self.inner.config.chunk_size) as u32;
        let total_chunks = total_chunks.max(1);

        let metadata = TransferMetadata {
            name,
            mime_type,
            size: bytes.len() as u64,
            total_chunks,
            timestamp: now_ms(),
            sender: self.inner.channel.address(),
        };

        let files_key = format!("files/{transfer_id}");
        let publish = self
            .inner
            .store
            .put(&files_key, serde_json::to_value(&metadata).expect("metadata always serializes"));
        if tokio::time::timeout(self.inner.config.metadata_publish_timeout, publish)
            .await
            .is_err()
        {
            log::warn!("publishing metadata for {transfer_id} timed out");
            return Err(TransferError::SendTimeout);
        }

        let mut cached_chunks = HashMap::new();
        for index in 0..total_chunks {
            let start = index as usize * self.inner.config.chunk_size;
            let end = (start + self.inner.config.chunk_size).min(b64.len());
            let data = b64[start..end].to_string();
            let chunk = TransferChunk {
                index,
                data: data.clone(),
                timestamp: now_ms(),
                file_id: transfer_id.clone(),
            };
            self.inner
                .store
                .put(
                    &format!("chunks/{transfer_id}/{index}"),
                    serde_json::to_value(&chunk).expect("chunk always serializes"),
                )
                .await;
            cached_chunks.insert(index, data);
            if index + 1 < total_chunks {
                tokio::time::sleep(self.inner.config.inter_chunk_delay).await;
            }
        }

        self.inner
            .sender_cache
            .write()
            .await
            .insert(transfer_id.clone(), SenderCacheEntry { chunks: cached_chunks, created_at_ms: now_ms() });

        let _ = self.inner.events.send(TransferEvent::TransferComplete(transfer_id.clone()));
        Ok(transfer_id)
    }

    async fn register_rpc_handlers(&self) {
        let inner = self.inner.clone();
        self.inner
            .channel
            .register(
                "request-chunks",
                Arc::new(move |_caller, args| {
                    let inner = inner.clone();
                    Box::pin(async move { handle_request_chunks(inner, args).await })
                }),
            )
            .await;

        let inner = self.inner.clone();
        self.inner
            .channel
            .register(
                "transfer-confirmed",
                Arc::new(move |_caller, args| {
                    let inner = inner.clone();
                    Box::pin(async move { handle_transfer_confirmed(inner, args).await })
                }),
            )
            .await;
    }

    async fn cache_sweeper_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.cache_sweep_interval);
        loop {
            ticker.tick().await;
            let cutoff = now_ms() - self.inner.config.sender_cache_ttl.as_millis() as i64;
            self.inner
                .sender_cache
                .write()
                .await
                .retain(|_, entry| entry.created_at_ms >= cutoff);
        }
    }

    /// Returns `true` if `transfer_id` is still present in the sender
    /// cache — exposed for tests/introspection, not part of the wire
    /// protocol.
    pub async fn sender_cache_contains(&self, transfer_id: &str) -> bool {
        self.inner.sender_cache.read().await.contains_key(transfer_id)
    }

    // ── Receive path ───────────────────────────────────────────────────

    async fn file_listener_loop(&self) {
        use futures_util::StreamExt;
        let local_address = self.inner.channel.address();
        let mut stream = self.inner.store.subscribe("files/");
        while let Some(entry) = stream.next().await {
            let Some(value) = entry.value else { continue };
            let Ok(metadata) = serde_json::from_value::<TransferMetadata>(value) else { continue };
            if metadata.sender == local_address {
                continue;
            }
            let transfer_id = entry.key.trim_start_matches("files/").to_string();

            let is_new = self.inner.processing.write().await.insert(transfer_id.clone());
            if !is_new {
                continue;
            }

            let engine = self.clone();
            tokio::spawn(async move { engine.receive_transfer(transfer_id, metadata).await });
        }
    }

    async fn receive_transfer(&self, transfer_id: String, metadata: TransferMetadata) {
        use futures_util::StreamExt;

        let mut chunks: HashMap<u32, String> = HashMap::new();
        let mut received_count: u32 = 0;
        let mut last_progress_tick = 0u32;
        let mut stream = self.inner.store.subscribe(&format!("chunks/{transfer_id}/"));
        let timeout = tokio::time::sleep(self.inner.config.receive_timeout(metadata.total_chunks));
        tokio::pin!(timeout);

        let mut naturally_complete = false;
        loop {
            tokio::select! {
                maybe_entry = stream.next() => {
                    let Some(entry) = maybe_entry else { break };
                    let Some(value) = entry.value else { continue };
                    let Ok(chunk) = serde_json::from_value::<TransferChunk>(value) else { continue };
                    if chunk.index >= metadata.total_chunks {
                        continue;
                    }
                    if chunks.insert(chunk.index, chunk.data).is_none() {
                        received_count += 1;
                        self.maybe_emit_progress(&transfer_id, received_count, metadata.total_chunks, &mut last_progress_tick);
                    }
                    if received_count >= metadata.total_chunks {
                        naturally_complete = true;
                        break;
                    }
                }
                _ = &mut timeout => {
                    break;
                }
            }
        }

        let mut recovered_via_retransmission = false;
        let completed = if naturally_complete {
            tokio::time::sleep(self.inner.config.final_recheck_delay).await;
            self.sweep_until_complete(&transfer_id, &metadata, &mut chunks).await
        } else {
            let completed = self.sweep_until_complete(&transfer_id, &metadata, &mut chunks).await;
            if !completed {
                let recovered = self.recover_via_retransmission(&transfer_id, &metadata, &mut chunks).await;
                recovered_via_retransmission = recovered;
                recovered
            } else {
                true
            }
        };

        if completed {
            self.finish_receive(&transfer_id, &metadata, &chunks).await;
            if recovered_via_retransmission {
                // Only the timeout-sweep-then-RPC path owes the sender a
                // confirmation; a plain, no-loss receive never sends one.
                let _ = self
                    .inner
                    .channel
                    .rpc(&metadata.sender, "transfer-confirmed", json!({"fileId": transfer_id}))
                    .await;
            }
        } else {
            log::warn!("transfer {transfer_id} could not be fully reassembled");
            let _ = self.inner.events.send(TransferEvent::TransferIncomplete(transfer_id.clone()));
        }

        self.inner.processing.write().await.remove(&transfer_id);
    }

    fn maybe_emit_progress(&self, transfer_id: &str, received: u32, total: u32, last_tick: &mut u32) {
        let decile = (total / 10).max(1);
        if received - *last_tick >= decile || received.is_multiple_of(100) || received == total {
            *last_tick = received;
            let _ = self.inner.events.send(TransferEvent::ReceiveProgress {
                transfer_id: transfer_id.to_string(),
                received,
                total,
            });
        }
    }

    async fn sweep_until_complete(&self, transfer_id: &str, metadata: &TransferMetadata, chunks: &mut HashMap<u32, String>) -> bool {
        for _ in 0..self.inner.config.max_sweeps {
            if chunks.len() as u32 >= metadata.total_chunks {
                return true;
            }
            let scanned = self.inner.store.scan(&format!("chunks/{transfer_id}/")).await;
            for entry in scanned {
                if let Some(value) = entry.value {
                    if let Ok(chunk) = serde_json::from_value::<TransferChunk>(value) {
                        chunks.entry(chunk.index).or_insert(chunk.data);
                    }
                }
            }
            if chunks.len() as u32 >= metadata.total_chunks {
                return true;
            }
            tokio::time::sleep(self.inner.config.inter_sweep_delay).await;
        }
        chunks.len() as u32 >= metadata.total_chunks
    }

    async fn recover_via_retransmission(&self, transfer_id: &str, metadata: &TransferMetadata, chunks: &mut HashMap<u32, String>) -> bool {
        let missing: Vec<u32> = (0..metadata.total_chunks).filter(|i| !chunks.contains_key(i)).collect();
        if missing.is_empty() {
            return true;
        }
        if self.inner.channel.peer(&metadata.sender).await.is_none() {
            return false;
        }

        let reply = self
            .inner
            .channel
            .rpc(
                &metadata.sender,
                "request-chunks",
                json!({"fileId": transfer_id, "missingChunks": missing}),
            )
            .await;

        let Ok(reply) = reply else { return false };
        let Some(true) = reply.get("success").and_then(Value::as_bool) else { return false };
        let Some(returned) = reply.get("chunks").and_then(Value::as_array) else { return false };

        for entry in returned {
            let Some(index) = entry.get("index").and_then(Value::as_u64) else { continue };
            let Some(data) = entry.get("data").and_then(Value::as_str) else { continue };
            chunks.entry(index as u32).or_insert_with(|| data.to_string());
        }

        chunks.len() as u32 >= metadata.total_chunks
    }

    async fn finish_receive(&self, transfer_id: &str, metadata: &TransferMetadata, chunks: &HashMap<u32, String>) {
        let mut b64 = String::new();
        for index in 0..metadata.total_chunks {
            match chunks.get(&index) {
                Some(part) => b64.push_str(part),
                None => {
                    log::warn!("transfer {transfer_id} marked complete but index {index} is missing");
                    return;
                }
            }
        }
        let Ok(data) = base64::engine::general_purpose::STANDARD.decode(&b64) else {
            log::warn!("transfer {transfer_id} base64 payload failed to decode");
            return;
        };
        let _ = self.inner.events.send(TransferEvent::FileReceived {
            filename: metadata.name.clone(),
            size: data.len() as u64,
            data,
            file_id: transfer_id.to_string(),
        });
    }
}

async fn handle_request_chunks<S: GraphStore + Clone + 'static>(inner: Arc<Inner<S>>, args: Value) -> Value {
    let Some(file_id) = args.get("fileId").and_then(Value::as_str) else {
        return json!({"success": false, "error": "missing fileId"});
    };
    let Some(missing) = args.get("missingChunks").and_then(Value::as_array) else {
        return json!({"success": false, "error": "missing missingChunks"});
    };

    let cache = inner.sender_cache.read().await;
    let Some(entry) = cache.get(file_id) else {
        return json!({"success": false, "error": "File not in cache"});
    };

    let chunks: Vec<Value> = missing
        .iter()
        .filter_map(Value::as_u64)
        .filter_map(|index| entry.chunks.get(&(index as u32)).map(|data| json!({"index": index, "data": data})))
        .collect();

    json!({"success": true, "fileId": file_id, "chunks": chunks})
}

async fn handle_transfer_confirmed<S: GraphStore + Clone + 'static>(inner: Arc<Inner<S>>, args: Value) -> Value {
    let Some(file_id) = args.get("fileId").and_then(Value::as_str) else {
        return json!({"success": false, "error": "missing fileId"});
    };
    inner.sender_cache.write().await.remove(file_id);
    json!({"success": true})
}
