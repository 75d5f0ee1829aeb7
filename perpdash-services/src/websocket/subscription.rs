//! Subscription registry and fan-out
//!
//! Tracks which consumers want which [`SubscriptionKey`], reference-counts the
//! upstream subscriptions and routes every decoded upstream message to the
//! consumers registered for its exact key.
//!
//! The registry never owns a consumer: it holds the sending half of the
//! consumer's channel, and the consumer's lifetime is controlled by whoever
//! holds the [`Subscription`] handle. A consumer whose receiver has gone away
//! is pruned on the next delivery attempt.
//!
//! Every consumer queue is bounded. A consumer that stops draining its queue
//! loses messages while the queue is full; once there is room again it first
//! receives one [`DashboardError::Lagged`] carrying the number it missed.
//!
//! All 0 -> 1 and 1 -> 0 transitions, and the upstream (un)subscribe calls
//! they trigger, happen under a single lock, so two concurrent `open`s for the
//! same key produce exactly one upstream subscribe.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

use perpdash_core::{ChannelPayload, DashboardError, SubscriptionKey, UpstreamMessage};
use perpdash_hyperliquid::HyperliquidWebSocket;

use super::stream::Subscription;

/// Default per-consumer queue capacity
pub const CONSUMER_QUEUE_CAPACITY: usize = 1024;

/// The upstream side the registry drives on 0 -> 1 and 1 -> 0 transitions
pub trait UpstreamControl: Send + Sync {
    fn subscribe(&self, key: SubscriptionKey);
    fn unsubscribe(&self, key: SubscriptionKey);
}

impl UpstreamControl for HyperliquidWebSocket {
    fn subscribe(&self, key: SubscriptionKey) {
        HyperliquidWebSocket::subscribe(self, key)
    }

    fn unsubscribe(&self, key: SubscriptionKey) {
        HyperliquidWebSocket::unsubscribe(self, key)
    }
}

/// Unique identifier for one registered consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// What travels from the registry to a handle
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Message(Arc<UpstreamMessage>),
    Error(DashboardError),
}

struct Consumer {
    id: ConsumerId,
    tx: mpsc::Sender<Delivery>,
    /// Messages dropped since the consumer's queue last had room
    skipped: u64,
}

impl Consumer {
    /// Queue one delivery. `false` once the receiver is gone.
    fn offer(&mut self, key: &SubscriptionKey, delivery: &Delivery) -> bool {
        if self.skipped > 0 {
            let notice = Delivery::Error(DashboardError::lagged(key.clone(), self.skipped));
            match self.tx.try_send(notice) {
                Ok(()) => {
                    debug!("[Multiplexer] {} caught up after {} skipped", self.id, self.skipped);
                    self.skipped = 0;
                }
                Err(TrySendError::Full(_)) => {
                    self.skipped += 1;
                    return true;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }

        match self.tx.try_send(delivery.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if self.skipped == 0 {
                    warn!("[Multiplexer] {} is not keeping up with {}, dropping", self.id, key);
                }
                self.skipped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Key -> consumers, in registration order
    consumers: HashMap<SubscriptionKey, Vec<Consumer>>,
    /// Keys currently subscribed upstream
    upstream: HashSet<SubscriptionKey>,
}

/// Manages consumer registrations and message fan-out
pub struct SubscriptionManager {
    upstream: Arc<dyn UpstreamControl>,
    /// Send an upstream unsubscribe when the last consumer of a key leaves
    release_idle: bool,
    queue_capacity: usize,
    next_consumer_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl SubscriptionManager {
    /// Create a new subscription manager driving `upstream`
    pub fn new(upstream: Arc<dyn UpstreamControl>, release_idle: bool) -> Self {
        Self {
            upstream,
            release_idle,
            queue_capacity: CONSUMER_QUEUE_CAPACITY,
            next_consumer_id: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Override the per-consumer queue capacity (at least 1)
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Register interest in `key` and return the consumer's handle.
    ///
    /// The handle yields only messages whose derived key equals `key`, from
    /// this point forward.
    pub fn open<T: ChannelPayload>(self: &Arc<Self>, key: SubscriptionKey) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.register(key.clone(), tx);
        Subscription::new(key, id, rx, Arc::clone(self))
    }

    fn register(&self, key: SubscriptionKey, tx: mpsc::Sender<Delivery>) -> ConsumerId {
        let id = ConsumerId(self.next_consumer_id.fetch_add(1, Ordering::Relaxed));

        let mut registry = self.registry.lock();
        let count = {
            let consumers = registry.consumers.entry(key.clone()).or_default();
            consumers.push(Consumer { id, tx, skipped: 0 });
            consumers.len()
        };

        if registry.upstream.insert(key.clone()) {
            debug!("[Multiplexer] First consumer for {}, subscribing upstream", key);
            self.upstream.subscribe(key.clone());
        }

        debug!("[Multiplexer] {} registered for {} ({} consumers)", id, key, count);
        id
    }

    /// Remove one consumer. Unknown ids are ignored.
    pub(crate) fn unregister(&self, key: &SubscriptionKey, id: ConsumerId) {
        let mut registry = self.registry.lock();

        let Some(consumers) = registry.consumers.get_mut(key) else {
            return;
        };
        let before = consumers.len();
        consumers.retain(|c| c.id != id);
        if consumers.len() == before {
            return;
        }

        let remaining = consumers.len();
        if remaining == 0 {
            registry.consumers.remove(key);
            self.release_if_idle(&mut registry, key);
        }

        debug!("[Multiplexer] {} unregistered from {} ({} remaining)", id, key, remaining);
    }

    /// Route one upstream message to the consumers of its key.
    ///
    /// Returns the number of consumers whose queue accepted it. Messages with
    /// no matching consumer are discarded.
    pub fn dispatch(&self, message: UpstreamMessage) -> usize {
        let mut registry = self.registry.lock();

        let key = match &message {
            UpstreamMessage::Error(reason) => {
                return match message.rejected_subscription() {
                    Some(key) => {
                        warn!("[Multiplexer] Upstream rejected {}: {}", key, reason);
                        let error = DashboardError::rejected(key.clone(), reason.clone());
                        self.deliver(&mut registry, &key, Delivery::Error(error))
                    }
                    None => {
                        warn!("[Multiplexer] Upstream error: {}", reason);
                        0
                    }
                };
            }
            UpstreamMessage::User(_) => match Self::sole_user_key(&registry) {
                Some(key) => key,
                None => return 0,
            },
            _ => match message.subscription_key() {
                Some(key) => key,
                None => {
                    trace!("[Multiplexer] Unroutable {:?} message dropped", message);
                    return 0;
                }
            },
        };

        self.deliver(&mut registry, &key, Delivery::Message(Arc::new(message)))
    }

    /// Drop every consumer. Open handles end their streams.
    pub fn close_all(&self) {
        let mut registry = self.registry.lock();
        let count: usize = registry.consumers.values().map(Vec::len).sum();
        registry.consumers.clear();
        registry.upstream.clear();
        info!("[Multiplexer] Closed {} consumers", count);
    }

    /// Number of live consumers for a key
    pub fn consumer_count(&self, key: &SubscriptionKey) -> usize {
        self.registry
            .lock()
            .consumers
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total number of live consumers across all keys
    pub fn total_consumers(&self) -> usize {
        self.registry.lock().consumers.values().map(Vec::len).sum()
    }

    /// Number of keys currently subscribed upstream
    pub fn total_subscriptions(&self) -> usize {
        self.registry.lock().upstream.len()
    }

    pub fn is_upstream_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.registry.lock().upstream.contains(key)
    }

    pub fn release_idle(&self) -> bool {
        self.release_idle
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn deliver(&self, registry: &mut Registry, key: &SubscriptionKey, delivery: Delivery) -> usize {
        let Some(consumers) = registry.consumers.get_mut(key) else {
            trace!("[Multiplexer] No consumers for {}, dropping", key);
            return 0;
        };

        let mut delivered = 0;
        consumers.retain_mut(|consumer| {
            if !consumer.offer(key, &delivery) {
                debug!("[Multiplexer] Pruning {} from {}", consumer.id, key);
                return false;
            }
            if consumer.skipped == 0 {
                delivered += 1;
            }
            true
        });

        if consumers.is_empty() {
            registry.consumers.remove(key);
            self.release_if_idle(registry, key);
        }

        delivered
    }

    fn release_if_idle(&self, registry: &mut Registry, key: &SubscriptionKey) {
        if self.release_idle && registry.upstream.remove(key) {
            debug!("[Multiplexer] Last consumer left {}, unsubscribing upstream", key);
            self.upstream.unsubscribe(key.clone());
        }
    }

    /// `user` events carry no address, so they can only be attributed when a
    /// single `user` key is subscribed upstream.
    fn sole_user_key(registry: &Registry) -> Option<SubscriptionKey> {
        let users: Vec<&SubscriptionKey> = registry
            .upstream
            .iter()
            .filter(|key| matches!(key, SubscriptionKey::User { .. }))
            .collect();

        match users.as_slice() {
            [key] => Some((*key).clone()),
            [] => {
                trace!("[Multiplexer] User event with no user subscription dropped");
                None
            }
            _ => {
                warn!(
                    "[Multiplexer] User event dropped: {} user subscriptions, cannot attribute",
                    users.len()
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("total_subscriptions", &self.total_subscriptions())
            .field("total_consumers", &self.total_consumers())
            .field("release_idle", &self.release_idle)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}
