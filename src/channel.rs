//! The signed-but-unencrypted broadcast/direct-message transport: identity,
//! presence, packet sign/verify, dedup, and the request/response layer.
//! Every other component in this crate (the encrypted overlay, the transfer
//! engine) is built on top of a `Channel`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use futures_util::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use x25519_dalek::PublicKey as X25519Public;

use crate::envelope::{
    decode_box_public, decode_verifying_key, encode_box_public, encode_verifying_key,
    packet_hash, BoxEnvelope, Payload, SignedEnvelope,
};
use crate::graph_store::GraphStore;
use crate::identity::{self, Identity};
use crate::seen::SeenSet;

const SEEN_TRIM_THRESHOLD: usize = 1000;
const SEEN_TRIM_KEEP: usize = 500;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer {0} is not known to this channel")]
    UnknownPeer(String),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Distinguishes logically separate channels sharing one graph store.
    pub channel_id: String,
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_id: "default".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub signing_pub: ed25519_dalek::VerifyingKey,
    pub box_pub: X25519Public,
    pub last_seen_ms: i64,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Ready,
    Seen(String),
    Left(String),
    Timeout(String),
    Message { from: String, value: Value },
    Request { from: String, name: String, args: Value, nonce: String },
    Response { from: String, nonce: String, result: Value },
    Ping(String),
    Connections(usize),
}

type HandlerFuture = Pin<Box<dyn Future<Output = Value> + Send>>;
pub type Handler = Arc<dyn Fn(String, Value) -> HandlerFuture + Send + Sync>;

struct Inner<S> {
    identity: Identity,
    store: S,
    config: ChannelConfig,
    peers: RwLock<HashMap<String, PeerInfo>>,
    seen: Mutex<SeenSet<[u8; 16]>>,
    handlers: RwLock<HashMap<String, Handler>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    events: broadcast::Sender<ChannelEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A running signed-channel instance. Cheaply `Clone` (an `Arc` handle);
/// all clones share the same peer table, seen set, and handler registry.
#[derive(Clone)]
pub struct Channel<S> {
    inner: Arc<Inner<S>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl<S: GraphStore + Clone + 'static> Channel<S> {
    pub async fn new(identity: Identity, store: S, config: ChannelConfig) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        let inner = Arc::new(Inner {
            identity,
            store,
            config,
            peers: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenSet::new(SEEN_TRIM_THRESHOLD, SEEN_TRIM_KEEP)),
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events,
            tasks: Mutex::new(Vec::new()),
        });
        let channel = Channel { inner };

        channel.write_presence().await;

        let message_task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.message_loop().await })
        };
        let presence_task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.presence_loop().await })
        };
        let heartbeat_task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.heartbeat_loop().await })
        };

        {
            let mut tasks = channel.inner.tasks.lock().await;
            tasks.push(message_task);
            tasks.push(presence_task);
            tasks.push(heartbeat_task);
        }

        let _ = channel.inner.events.send(ChannelEvent::Ready);
        channel
    }

    pub fn address(&self) -> String {
        self.inner.identity.address()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub async fn connections(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    pub async fn peer(&self, address: &str) -> Option<PeerInfo> {
        self.inner.peers.read().await.get(address).cloned()
    }

    /// Addresses already known to this channel, for components layered on
    /// top (like the overlay) that need to catch up on peers discovered
    /// before they started listening for `Seen` events.
    pub async fn peer_addresses(&self) -> Vec<String> {
        self.inner.peers.read().await.keys().cloned().collect()
    }

    pub async fn register(&self, name: impl Into<String>, handler: Handler) {
        self.inner.handlers.write().await.insert(name.into(), handler);
    }

    pub async fn send(&self, value: Value) {
        let payload = self.build_payload("m", Some(value), None, None, None, None);
        self.broadcast_payload(payload).await;
    }

    pub async fn send_to(&self, address: &str, value: Value) -> Result<(), ChannelError> {
        let peer = self
            .inner
            .peers
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownPeer(address.to_string()))?;
        let payload = self.build_payload("m", Some(value), None, None, None, None);
        self.send_directed_payload(&peer.box_pub, payload).await;
        Ok(())
    }

    pub async fn ping(&self) {
        let payload = self.build_payload("p", None, None, None, None, None);
        self.broadcast_payload(payload).await;
    }

    /// Send an RPC request and await its response. Callers that need a
    /// bounded wait should wrap this in `tokio::time::timeout`.
    pub async fn rpc(&self, address: &str, name: &str, args: Value) -> Result<Value, ChannelError> {
        let peer = self
            .inner
            .peers
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownPeer(address.to_string()))?;

        let payload = self.build_payload("r", None, Some(name.to_string()), Some(args), None, None);
        let nonce = payload.n.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(nonce, tx);
        self.send_directed_payload(&peer.box_pub, payload).await;

        rx.await.map_err(|_| ChannelError::UnknownPeer(address.to_string()))
    }

    pub async fn destroy(&self) {
        let payload = self.build_payload("x", None, None, None, None, None);
        self.broadcast_payload(payload).await;
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.inner.pending.lock().await.clear();
        self.inner.peers.write().await.clear();
    }

    fn build_payload(
        &self,
        y: &str,
        v: Option<Value>,
        c: Option<String>,
        a: Option<Value>,
        rn: Option<String>,
        rr: Option<Value>,
    ) -> Payload {
        Payload {
            t: now_ms(),
            i: self.inner.config.channel_id.clone(),
            pk: encode_verifying_key(&self.inner.identity.verifying_key()),
            ek: encode_box_public(&self.inner.identity.box_public()),
            n: Payload::nonce(),
            y: y.to_string(),
            v,
            c,
            a,
            rn,
            rr,
        }
    }

    async fn write_packet(&self, bytes: Vec<u8>) {
        let hash = packet_hash(&bytes);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let key = format!("messages/{}", hex::encode(hash));
        self.inner
            .store
            .put(&key, json!({"m": b64, "t": now_ms(), "k": hex::encode(hash)}))
            .await;
        self.inner.seen.lock().await.insert(hash);
    }

    async fn broadcast_payload(&self, payload: Payload) {
        let envelope = SignedEnvelope::sign(self.inner.identity.signing_key(), &payload);
        let bytes = serde_json::to_vec(&envelope).expect("envelope always serializes");
        self.write_packet(bytes).await;
    }

    async fn send_directed_payload(&self, peer_box_pub: &X25519Public, payload: Payload) {
        let envelope = SignedEnvelope::sign(self.inner.identity.signing_key(), &payload);
        let inner_bytes = serde_json::to_vec(&envelope).expect("envelope always serializes");
        let shared = identity::shared_secret_with(&self.inner.identity, peer_box_pub);
        let box_envelope = match BoxEnvelope::seal(&inner_bytes, &self.inner.identity.box_public(), &shared) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("failed to seal directed envelope: {e}");
                return;
            }
        };
        let bytes = serde_json::to_vec(&box_envelope).expect("box envelope always serializes");
        self.write_packet(bytes).await;
    }

    async fn write_presence(&self) {
        let key = format!("presence/{}", self.address());
        let record = json!({
            "pk": encode_verifying_key(&self.inner.identity.verifying_key()),
            "ek": encode_box_public(&self.inner.identity.box_public()),
            "t": now_ms(),
        });
        self.inner.store.put(&key, record).await;
    }

    async fn upsert_peer(&self, address: String, signing_pub: ed25519_dalek::VerifyingKey, box_pub: X25519Public) {
        let mut peers = self.inner.peers.write().await;
        let is_new = !peers.contains_key(&address);
        peers.insert(
            address.clone(),
            PeerInfo {
                signing_pub,
                box_pub,
                last_seen_ms: now_ms(),
            },
        );
        drop(peers);
        if is_new {
            let _ = self.inner.events.send(ChannelEvent::Seen(address));
        }
    }

    async fn presence_loop(&self) {
        let mut stream = self.inner.store.subscribe("presence/");
        let own_address = self.address();
        while let Some(entry) = stream.next().await {
            let Some(value) = entry.value else { continue };
            let address = entry.key.trim_start_matches("presence/").to_string();
            if address == own_address {
                continue;
            }
            let Some(pk_str) = value.get("pk").and_then(Value::as_str) else { continue };
            let Some(ek_str) = value.get("ek").and_then(Value::as_str) else { continue };
            let Ok(signing_pub) = decode_verifying_key(pk_str) else { continue };
            let Ok(box_pub) = decode_box_public(ek_str) else { continue };
            self.upsert_peer(address, signing_pub, box_pub).await;
        }
    }

    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(self.inner.config.heartbeat_interval);
        loop {
            interval.tick().await;
            self.write_presence().await;
            self.evict_stale_peers().await;
        }
    }

    async fn evict_stale_peers(&self) {
        let cutoff = now_ms() - self.inner.config.peer_timeout.as_millis() as i64;
        let stale: Vec<String> = {
            let peers = self.inner.peers.read().await;
            peers
                .iter()
                .filter(|(_, p)| p.last_seen_ms < cutoff)
                .map(|(addr, _)| addr.clone())
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let mut peers = self.inner.peers.write().await;
        for address in stale {
            peers.remove(&address);
            let _ = self.inner.events.send(ChannelEvent::Timeout(address.clone()));
            let _ = self.inner.events.send(ChannelEvent::Left(address));
        }
    }

    async fn message_loop(&self) {
        let mut stream = self.inner.store.subscribe("messages/");
        while let Some(entry) = stream.next().await {
            let Some(value) = entry.value else { continue };
            let Some(b64) = value.get("m").and_then(Value::as_str) else { continue };
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(b64) else { continue };

            let hash = packet_hash(&bytes);
            let newly_seen = self.inner.seen.lock().await.insert(hash);
            if !newly_seen {
                continue;
            }

            self.handle_packet(&bytes).await;
        }
    }

    async fn handle_packet(&self, bytes: &[u8]) {
        let Ok(outer): Result<Value, _> = serde_json::from_slice(bytes) else {
            log::debug!("dropping packet: not valid JSON");
            return;
        };

        let signed_bytes: Vec<u8> = if outer.get("n").is_some() && outer.get("ek").is_some() && outer.get("e").is_some() {
            let Ok(box_envelope): Result<BoxEnvelope, _> = serde_json::from_value(outer) else {
                return;
            };
            let Ok(sender_box_pub) = decode_box_public(&box_envelope.ek) else {
                return;
            };
            let shared = identity::shared_secret_with(&self.inner.identity, &sender_box_pub);
            match box_envelope.open(&shared) {
                Ok(inner) => inner,
                Err(e) => {
                    log::debug!("dropping packet: box decryption failed: {e}");
                    return;
                }
            }
        } else {
            bytes.to_vec()
        };

        let Ok(signed): Result<SignedEnvelope, _> = serde_json::from_slice(&signed_bytes) else {
            log::debug!("dropping packet: not a signed envelope");
            return;
        };

        let (verifying_key, payload) = match signed.verify_self() {
            Ok(pair) => pair,
            Err(e) => {
                log::debug!("dropping packet: {e}");
                return;
            }
        };

        if payload.i != self.inner.config.channel_id {
            return;
        }
        let deadline = payload.t + self.inner.config.peer_timeout.as_millis() as i64;
        if deadline < now_ms() {
            log::debug!("dropping stale packet from {}", payload.pk);
            return;
        }

        let Ok(box_pub) = decode_box_public(&payload.ek) else { return };
        let address = identity::address_of(&verifying_key);
        self.upsert_peer(address.clone(), verifying_key, box_pub).await;

        match payload.y.as_str() {
            "m" => {
                if let Some(value) = payload.v {
                    let _ = self.inner.events.send(ChannelEvent::Message { from: address, value });
                }
            }
            "r" => self.handle_request(address, payload).await,
            "rr" => self.handle_response(address, payload).await,
            "p" => {
                let _ = self.inner.events.send(ChannelEvent::Ping(address));
            }
            "x" => {
                self.inner.peers.write().await.remove(&address);
                let _ = self.inner.events.send(ChannelEvent::Left(address));
            }
            other => log::debug!("dropping packet with unknown type {other}"),
        }
    }

    async fn handle_request(&self, address: String, payload: Payload) {
        let Some(name) = payload.c.clone() else { return };
        let args = payload.a.clone().unwrap_or(Value::Null);
        let nonce = payload.n.clone();

        let _ = self.inner.events.send(ChannelEvent::Request {
            from: address.clone(),
            name: name.clone(),
            args: args.clone(),
            nonce: nonce.clone(),
        });

        let handler = self.inner.handlers.read().await.get(&name).cloned();
        let result = match handler {
            Some(handler) => handler(address.clone(), args).await,
            None => json!({"error": "No such API call."}),
        };

        if let Some(peer) = self.inner.peers.read().await.get(&address).cloned() {
            let reply_payload = self.build_payload("rr", None, None, None, Some(nonce), Some(result));
            self.send_directed_payload(&peer.box_pub, reply_payload).await;
        }
    }

    async fn handle_response(&self, address: String, payload: Payload) {
        let Some(rn) = payload.rn.clone() else { return };
        let Some(result) = payload.rr.clone() else { return };

        if let Some(tx) = self.inner.pending.lock().await.remove(&rn) {
            let _ = tx.send(result.clone());
        }
        let _ = self.inner.events.send(ChannelEvent::Response { from: address, nonce: rn, result });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_store::InMemoryGraphStore;
    use std::time::Duration as StdDuration;

    async fn settle() {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn two_node_broadcast_delivers_once() {
        let store = InMemoryGraphStore::new();
        let config = ChannelConfig { channel_id: "room".into(), ..Default::default() };

        let a = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        let b = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        settle().await;

        let mut b_events = b.subscribe_events();
        a.send(json!({"hello": "world"})).await;

        let mut got = None;
        for _ in 0..20 {
            if let Ok(event) = tokio::time::timeout(StdDuration::from_millis(200), b_events.recv()).await {
                if let Ok(ChannelEvent::Message { from, value }) = event {
                    got = Some((from, value));
                    break;
                }
            } else {
                break;
            }
        }
        let (from, value) = got.expect("B should observe A's broadcast");
        assert_eq!(from, a.address());
        assert_eq!(value, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn directed_send_is_opaque_to_third_node() {
        let store = InMemoryGraphStore::new();
        let config = ChannelConfig { channel_id: "room".into(), ..Default::default() };

        let a = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        let b = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        let c = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        settle().await;

        let mut b_events = b.subscribe_events();
        let mut c_events = c.subscribe_events();
        a.send_to(&b.address(), json!({"to": "B"})).await.unwrap();

        let delivered = tokio::time::timeout(StdDuration::from_millis(500), async {
            loop {
                if let Ok(ChannelEvent::Message { value, .. }) = b_events.recv().await {
                    return value;
                }
            }
        })
        .await
        .expect("B should receive the directed message");
        assert_eq!(delivered, json!({"to": "B"}));

        let c_saw_message = tokio::time::timeout(StdDuration::from_millis(200), async {
            loop {
                if let Ok(ChannelEvent::Message { .. }) = c_events.recv().await {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(!c_saw_message, "C must not be able to decode a directed packet");
    }

    #[tokio::test]
    async fn send_to_unknown_peer_errors() {
        let store = InMemoryGraphStore::new();
        let a = Channel::new(Identity::generate(), store, ChannelConfig::default()).await;
        let err = a.send_to("nonexistent-address", json!(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let store = InMemoryGraphStore::new();
        let config = ChannelConfig { channel_id: "room".into(), ..Default::default() };
        let a = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        let b = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        settle().await;

        b.register(
            "echo",
            Arc::new(|_caller, args| Box::pin(async move { args })),
        )
        .await;

        let result = tokio::time::timeout(
            StdDuration::from_secs(2),
            a.rpc(&b.address(), "echo", json!({"n": 7})),
        )
        .await
        .expect("rpc should not hang")
        .expect("rpc should succeed");
        assert_eq!(result, json!({"n": 7}));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_peer_is_evicted_by_heartbeat_loop() {
        let store = InMemoryGraphStore::new();
        let config = ChannelConfig {
            channel_id: "room".into(),
            heartbeat_interval: StdDuration::from_millis(50),
            peer_timeout: StdDuration::from_millis(100),
        };
        let a = Channel::new(Identity::generate(), store, config.clone()).await;
        let mut a_events = a.subscribe_events();

        // Insert an already-stale peer directly, bypassing presence, so the
        // test doesn't depend on real wall-clock elapsing to go stale.
        let stale_address = "stale-peer".to_string();
        let stale_identity = Identity::generate();
        a.inner.peers.write().await.insert(
            stale_address.clone(),
            PeerInfo {
                signing_pub: stale_identity.verifying_key(),
                box_pub: stale_identity.box_public(),
                last_seen_ms: now_ms() - config.peer_timeout.as_millis() as i64 - 1,
            },
        );
        assert_eq!(a.connections().await, 1);

        // Advance the virtual clock past one heartbeat tick instead of
        // sleeping the real 50ms — the interval fires deterministically.
        tokio::time::advance(config.heartbeat_interval + StdDuration::from_millis(1)).await;

        let timed_out = tokio::time::timeout(StdDuration::from_secs(1), async {
            loop {
                if let Ok(ChannelEvent::Timeout(addr)) = a_events.recv().await {
                    return addr;
                }
            }
        })
        .await
        .expect("heartbeat loop should evict the stale peer");
        assert_eq!(timed_out, stale_address);
        assert_eq!(a.connections().await, 0);
    }

    #[tokio::test]
    async fn stale_packet_is_dropped() {
        let store = InMemoryGraphStore::new();
        let config = ChannelConfig {
            channel_id: "room".into(),
            peer_timeout: StdDuration::from_millis(100),
            ..Default::default()
        };
        let a = Channel::new(Identity::generate(), store, config.clone()).await;

        let sender = Identity::generate();
        let stale_payload = Payload {
            t: now_ms() - config.peer_timeout.as_millis() as i64 - 1,
            i: "room".into(),
            pk: encode_verifying_key(&sender.verifying_key()),
            ek: encode_box_public(&sender.box_public()),
            n: Payload::nonce(),
            y: "m".into(),
            v: Some(json!({"hello": "world"})),
            c: None,
            a: None,
            rn: None,
            rr: None,
        };
        let envelope = SignedEnvelope::sign(sender.signing_key(), &stale_payload);
        let bytes = serde_json::to_vec(&envelope).unwrap();

        a.handle_packet(&bytes).await;

        assert_eq!(a.connections().await, 0, "a packet older than peer_timeout must be dropped before the sender is registered as a peer");
    }

    #[tokio::test]
    async fn duplicate_packet_delivered_at_most_once() {
        let store = InMemoryGraphStore::new();
        let config = ChannelConfig { channel_id: "room".into(), ..Default::default() };
        let a = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        let b = Channel::new(Identity::generate(), store.clone(), config.clone()).await;
        settle().await;

        let mut b_events = b.subscribe_events();
        a.send(json!({"x": 1})).await;

        let mut message_count = 0;
        let deadline = tokio::time::Instant::now() + StdDuration::from_millis(300);
        while tokio::time::Instant::now() < deadline {
            if let Ok(Ok(ChannelEvent::Message { .. })) =
                tokio::time::timeout(StdDuration::from_millis(50), b_events.recv()).await
            {
                message_count += 1;
            }
        }
        assert_eq!(message_count, 1);
    }
}
