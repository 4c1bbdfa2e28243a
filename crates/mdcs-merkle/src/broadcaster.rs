//! Publish/subscribe collaborator for announcing new nodes.
//!
//! A replica publishes the encoded node of every locally authored delta on
//! its namespace topic; peers subscribed to that topic hand the bytes to
//! their merge engine. [`BroadcastNetwork`] is an in-process hub used by
//! tests and the demo binary.

use crate::cid::Cid;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Errors raised by a broadcaster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Broadcaster closed")]
    Closed,

    #[error("Broadcaster unavailable: {0}")]
    Unavailable(String),
}

/// Topic-based publish/subscribe.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Publish `payload` to every other subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BroadcastError>;

    /// Receive every payload other peers publish on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BroadcastError>;
}

#[async_trait]
impl<T: Broadcaster + ?Sized> Broadcaster for Arc<T> {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BroadcastError> {
        (**self).publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BroadcastError> {
        (**self).subscribe(topic).await
    }
}

/// Configuration for the in-memory broadcast network.
#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Capacity of each subscriber channel.
    pub channel_capacity: usize,

    /// Message ids remembered per peer for deduplication.
    pub buffer_size: usize,

    /// Whether to deduplicate payloads a peer has already received.
    pub deduplicate: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            channel_capacity: 1024,
            buffer_size: 1000,
            deduplicate: true,
        }
    }
}

/// Ids a peer has already received, with FIFO eviction.
#[derive(Default)]
struct SeenBuffer {
    seen: HashSet<Cid>,
    order: VecDeque<Cid>,
}

impl SeenBuffer {
    /// Returns `false` if `id` was already present.
    fn insert(&mut self, id: Cid, capacity: usize) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

struct Subscriber {
    peer: String,
    sender: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Hub {
    topics: HashMap<String, Vec<Subscriber>>,
    seen: HashMap<String, SeenBuffer>,
    published: u64,
    dropped: u64,
}

/// In-process broadcast hub. Join it once per replica.
#[derive(Clone, Default)]
pub struct BroadcastNetwork {
    config: BroadcastConfig,
    hub: Arc<Mutex<Hub>>,
}

impl BroadcastNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BroadcastConfig) -> Self {
        BroadcastNetwork {
            config,
            hub: Arc::new(Mutex::new(Hub::default())),
        }
    }

    /// Create the broadcaster handle for one peer.
    pub fn join(&self, peer: impl Into<String>) -> MemoryBroadcaster {
        MemoryBroadcaster {
            peer: peer.into(),
            network: self.clone(),
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        let hub = self.hub.lock();
        BroadcastStats {
            topics: hub.topics.len(),
            subscribers: hub.topics.values().map(Vec::len).sum(),
            published: hub.published,
            dropped: hub.dropped,
        }
    }
}

/// Counters for the broadcast hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastStats {
    pub topics: usize,
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
}

/// One peer's handle on a [`BroadcastNetwork`].
#[derive(Clone)]
pub struct MemoryBroadcaster {
    peer: String,
    network: BroadcastNetwork,
}

impl MemoryBroadcaster {
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Broadcaster for MemoryBroadcaster {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BroadcastError> {
        let id = Cid::of(&payload);
        let config = &self.network.config;

        // Pick targets under the lock, send after releasing it.
        let targets: Vec<mpsc::Sender<Vec<u8>>> = {
            let mut hub = self.network.hub.lock();
            hub.published += 1;

            let subscribers = match hub.topics.get_mut(topic) {
                Some(subscribers) => subscribers,
                None => return Ok(()),
            };
            subscribers.retain(|s| !s.sender.is_closed());
            let candidates: Vec<(String, mpsc::Sender<Vec<u8>>)> = subscribers
                .iter()
                .filter(|s| s.peer != self.peer)
                .map(|s| (s.peer.clone(), s.sender.clone()))
                .collect();

            let mut targets = Vec::with_capacity(candidates.len());
            for (peer, sender) in candidates {
                let fresh = !config.deduplicate
                    || hub
                        .seen
                        .entry(peer)
                        .or_default()
                        .insert(id, config.buffer_size);
                if fresh {
                    targets.push(sender);
                } else {
                    hub.dropped += 1;
                }
            }
            targets
        };

        trace!(topic, peer = %self.peer, id = %id.short(), targets = targets.len(), "publish");
        for sender in targets {
            // A subscriber that went away is not an error for the publisher.
            let _ = sender.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, BroadcastError> {
        let (sender, receiver) = mpsc::channel(self.network.config.channel_capacity);
        self.network
            .hub
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                peer: self.peer.clone(),
                sender,
            });
        Ok(receiver)
    }
}
