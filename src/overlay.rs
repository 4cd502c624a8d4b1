//! The end-to-end encrypted overlay: automatic ECDH key exchange via a
//! `peer` request handler, per-pair shared secrets, and dedup across the
//! dual (plain + decrypted) delivery paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::channel::{Channel, ChannelEvent};
use crate::crypto;
use crate::envelope::{decode_box_public, encode_box_public};
use crate::graph_store::GraphStore;
use crate::seen::SeenSet;

const TRIM_THRESHOLD: usize = 1000;
const TRIM_KEEP: usize = 500;
const TRIM_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("peer {0} has not completed the overlay key exchange")]
    UnknownPeer(String),
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub trim_interval: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self { trim_interval: TRIM_INTERVAL }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerHandshake {
    #[serde(rename = "pub")]
    sig_pub: String,
    epub: String,
}

#[derive(Debug, Clone)]
pub struct OverlayPeer {
    pub sig_pub: String,
    pub epub: X25519Public,
}

#[derive(Debug, Clone)]
pub enum OverlayEvent {
    Decrypted { from: String, peer: OverlayPeer, value: Value, message_id: String },
}

struct Sea {
    enc_secret: X25519Secret,
    enc_public: X25519Public,
}

struct Inner<S> {
    channel: Channel<S>,
    sea: Sea,
    peers: RwLock<HashMap<String, OverlayPeer>>,
    seen_ids: Mutex<SeenSet<String>>,
    events: broadcast::Sender<OverlayEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ready: Notify,
}

/// Wraps a [`Channel`] with automatic per-peer encryption. Cheaply `Clone`.
#[derive(Clone)]
pub struct EncryptedOverlay<S> {
    inner: Arc<Inner<S>>,
}

impl<S: GraphStore + Clone + 'static> EncryptedOverlay<S> {
    pub async fn new(channel: Channel<S>, config: OverlayConfig) -> Self {
        let enc_secret = X25519Secret::random_from_rng(rand::rngs::OsRng);
        let enc_public = X25519Public::from(&enc_secret);

        let (events, _rx) = broadcast::channel(1024);
        let inner = Arc::new(Inner {
            channel,
            sea: Sea { enc_secret, enc_public },
            peers: RwLock::new(HashMap::new()),
            seen_ids: Mutex::new(SeenSet::new(TRIM_THRESHOLD, TRIM_KEEP)),
            events,
            tasks: Mutex::new(Vec::new()),
            ready: Notify::new(),
        });
        let overlay = EncryptedOverlay { inner };

        overlay.register_peer_handler().await;

        let decrypt_task = {
            let overlay = overlay.clone();
            tokio::spawn(async move { overlay.decrypt_loop().await })
        };
        let handshake_task = {
            let overlay = overlay.clone();
            tokio::spawn(async move { overlay.handshake_loop().await })
        };
        let trim_task = {
            let overlay = overlay.clone();
            let interval = config.trim_interval;
            tokio::spawn(async move { overlay.trim_loop(interval).await })
        };

        {
            let mut tasks = overlay.inner.tasks.lock().await;
            tasks.push(decrypt_task);
            tasks.push(handshake_task);
            tasks.push(trim_task);
        }

        overlay
    }

    async fn register_peer_handler(&self) {
        let inner = self.inner.clone();
        self.inner
            .channel
            .register(
                "peer",
                Arc::new(move |caller: String, args: Value| {
                    let inner = inner.clone();
                    Box::pin(async move {
                        if let Ok(handshake) = serde_json::from_value::<PeerHandshake>(args) {
                            if let Ok(epub) = decode_box_public(&handshake.epub) {
                                inner.peers.write().await.insert(
                                    caller,
                                    OverlayPeer { sig_pub: handshake.sig_pub, epub },
                                );
                                inner.ready.notify_waiters();
                            }
                        }
                        json!({"success": true})
                    })
                }),
            )
            .await;
    }

    async fn handshake_loop(&self) {
        // Subscribe before enumerating current peers so a peer seen between
        // the two steps is still caught by the live event stream, not lost.
        let mut channel_events = self.inner.channel.subscribe_events();
        for address in self.inner.channel.peer_addresses().await {
            self.handshake_with(&address).await;
        }
        loop {
            match channel_events.recv().await {
                Ok(ChannelEvent::Seen(address)) => self.handshake_with(&address).await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handshake_with(&self, address: &str) {
        let args = json!({
            "pub": self.inner.channel.address(),
            "epub": encode_box_public(&self.inner.sea.enc_public),
        });
        let _ = self.inner.channel.rpc(address, "peer", args).await;
    }

    /// `broadcast(value)`: blocks until the first peer handshake completes
    /// if the overlay peer table is empty.
    pub async fn broadcast(&self, value: Value) {
        self.wait_for_first_peer().await;
        let peers: Vec<(String, OverlayPeer)> = self
            .inner
            .peers
            .read()
            .await
            .iter()
            .map(|(addr, peer)| (addr.clone(), peer.clone()))
            .collect();

        for (address, peer) in peers {
            if let Err(e) = self.send_to_peer(&address, &peer, &value).await {
                log::warn!("overlay broadcast to {address} failed: {e}");
            }
        }
    }

    pub async fn direct(&self, address: &str, value: Value) -> Result<(), OverlayError> {
        let peer = self
            .inner
            .peers
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| OverlayError::UnknownPeer(address.to_string()))?;
        self.send_to_peer(address, &peer, &value)
            .await
            .map_err(|_| OverlayError::UnknownPeer(address.to_string()))
    }

    async fn send_to_peer(&self, address: &str, peer: &OverlayPeer, value: &Value) -> Result<(), crate::channel::ChannelError> {
        let shared = self.inner.sea.enc_secret.diffie_hellman(&peer.epub);
        let plaintext = serde_json::to_vec(value).expect("value always serializes");
        let ciphertext = match crypto::seal(shared.as_bytes(), &plaintext) {
            Ok(ct) => ct,
            Err(e) => {
                log::warn!("overlay encryption to {address} failed: {e}");
                return Ok(());
            }
        };
        self.inner
            .channel
            .send_to(address, json!(hex::encode(ciphertext)))
            .await
    }

    async fn wait_for_first_peer(&self) {
        loop {
            // Register interest before checking, not after: `notify_waiters`
            // stores no permit, so a notification between the check and the
            // `notified()` call would otherwise be lost forever.
            let notified = self.inner.ready.notified();
            if !self.inner.peers.read().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    async fn decrypt_loop(&self) {
        let mut channel_events = self.inner.channel.subscribe_events();
        loop {
            let event = match channel_events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let ChannelEvent::Message { from, value } = event else { continue };

            let message_id = synthesize_message_id(&from, &value);
            let newly_seen = self.inner.seen_ids.lock().await.insert(message_id.clone());
            if !newly_seen {
                continue;
            }

            let Some(peer) = self.inner.peers.read().await.get(&from).cloned() else {
                continue;
            };
            let Some(hex_ct) = value.as_str() else { continue };
            let Ok(ciphertext) = hex::decode(hex_ct) else { continue };

            let shared = self.inner.sea.enc_secret.diffie_hellman(&peer.epub);
            let plaintext = match crypto::open(shared.as_bytes(), &ciphertext) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("overlay decryption from {from} failed: {e}");
                    continue;
                }
            };
            let Ok(decoded) = serde_json::from_slice::<Value>(&plaintext) else { continue };

            let _ = self.inner.events.send(OverlayEvent::Decrypted {
                from,
                peer,
                value: decoded,
                message_id,
            });
        }
    }

    async fn trim_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.inner.seen_ids.lock().await.trim();
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OverlayEvent> {
        self.inner.events.subscribe()
    }

    pub async fn destroy(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.inner.seen_ids.lock().await.clear_all();
        self.inner.channel.destroy().await;
    }
}

/// Synthesizes a per-message identifier from `now|address|random`, per the
/// fallback the overlay uses when the channel doesn't hand it one directly.
fn synthesize_message_id(address: &str, _value: &Value) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    let mut nonce = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    format!("{now_ms}|{address}|{}", hex::encode(nonce))
}
