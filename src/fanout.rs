//! C6: Stream Fan-Out.
//!
//! One subscription object per connected client: a bus subscription, a
//! filter predicate, a bounded outbound queue with drop-oldest
//! backpressure, and a periodic liveness tick. The listener (bus → queue)
//! and the writer (queue → client) are single-producer/single-consumer
//! around that one queue, per §5 — they never share mutable state beyond
//! it and the statistics counters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::EventBus;
use crate::error::{EngineError, EngineResult};
use crate::model::{Event, EventFilter, EventId, EventType, Priority, SubscriptionId};

const LIVENESS_TICK: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const COMPRESSION_THRESHOLD_BYTES: usize = 1024;

fn queue_capacity(replay_n: usize) -> usize {
    (2 * replay_n).max(100)
}

#[derive(Default)]
pub struct SubscriptionStats {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub errors: AtomicU64,
}

/// What the fan-out actually writes to the wire: a plain event, a
/// gzip-compressed event (payload ≥ 1 KiB), or a liveness tick.
pub enum OutboundItem {
    Event(Event),
    Compressed { event_type: EventType, id: EventId, gz: Vec<u8> },
    Liveness { timestamp: chrono::DateTime<chrono::Utc>, connection_id: SubscriptionId },
}

/// Bounded FIFO with drop-oldest backpressure (invariant 7 / property I5):
/// once full, a push evicts the oldest undelivered event and bumps the
/// drop counter by exactly one.
struct BoundedDropOldest {
    inner: Mutex<VecDeque<Event>>,
    capacity: usize,
    stats: Arc<SubscriptionStats>,
}

impl BoundedDropOldest {
    fn new(capacity: usize, stats: Arc<SubscriptionStats>) -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(capacity)), capacity, stats }
    }

    async fn push(&self, event: Event) {
        let mut queue = self.inner.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        self.stats.received.fetch_add(1, Ordering::Relaxed);
    }

    async fn pop(&self) -> Option<Event> {
        self.inner.lock().await.pop_front()
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// A single channel's forwarding task: bus receiver → filter → queue. One
/// of these runs per subscribed channel so `subscribe`/`unsubscribe` can
/// add or remove channels without tearing down the whole connection.
struct ChannelListener {
    channel: String,
    handle: JoinHandle<()>,
}

pub struct ClientSubscription {
    pub id: SubscriptionId,
    pub filter: Mutex<EventFilter>,
    pub compression: AtomicBool,
    pub stats: Arc<SubscriptionStats>,
    queue: Arc<BoundedDropOldest>,
    listeners: Mutex<Vec<ChannelListener>>,
}

impl ClientSubscription {
    pub async fn channels(&self) -> Vec<String> {
        self.listeners.lock().await.iter().map(|l| l.channel.clone()).collect()
    }
}

pub struct FanOut {
    bus: Arc<EventBus>,
    subscriptions: Mutex<HashMap<SubscriptionId, Arc<ClientSubscription>>>,
}

impl FanOut {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus, subscriptions: Mutex::new(HashMap::new()) })
    }

    /// Registers a new client connection per §4.6 steps 1-4: rejects an
    /// empty channel set (B3), replays up to `replay_n` recent matching
    /// events, spawns one forwarding task per channel, and starts the
    /// liveness ticker.
    pub async fn connect(
        self: &Arc<Self>,
        channels: Vec<String>,
        filter: EventFilter,
        compression: bool,
        replay_n: usize,
    ) -> EngineResult<FanOutHandle> {
        if channels.is_empty() {
            return Err(EngineError::EmptyChannelSet);
        }
        let id = SubscriptionId::new();
        let stats = Arc::new(SubscriptionStats::default());
        let queue = Arc::new(BoundedDropOldest::new(queue_capacity(replay_n), Arc::clone(&stats)));

        if replay_n > 0 {
            for channel in &channels {
                if let Ok(recent) = self.bus.recent(channel, replay_n).await {
                    for event in recent.into_iter().rev() {
                        if filter.accepts(&event) {
                            queue.push(event).await;
                        }
                    }
                }
            }
        }

        let mut listeners = Vec::with_capacity(channels.len());
        for channel in channels {
            let mut receiver = self.bus.subscribe(std::slice::from_ref(&channel));
            let listener_queue = Arc::clone(&queue);
            let handle = tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    listener_queue.push(event).await;
                }
            });
            listeners.push(ChannelListener { channel, handle });
        }

        let subscription = Arc::new(ClientSubscription {
            id,
            filter: Mutex::new(filter),
            compression: AtomicBool::new(compression),
            stats,
            queue,
            listeners: Mutex::new(listeners),
        });
        self.subscriptions.lock().await.insert(id, Arc::clone(&subscription));

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let liveness_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_TICK);
            loop {
                ticker.tick().await;
                if tick_tx.send(()).await.is_err() {
                    return;
                }
            }
        });

        Ok(FanOutHandle {
            subscription,
            fanout: Arc::clone(self),
            liveness_ticks: Mutex::new(tick_rx),
            liveness_task: Mutex::new(Some(liveness_task)),
        })
    }

    async fn disconnect(&self, id: SubscriptionId) {
        if let Some(subscription) = self.subscriptions.lock().await.remove(&id) {
            for listener in subscription.listeners.lock().await.drain(..) {
                listener.handle.abort();
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Invoked on graceful shutdown: tears down every live subscription.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SubscriptionId> = self.subscriptions.lock().await.keys().copied().collect();
        for id in ids {
            self.disconnect(id).await;
        }
    }
}

/// The per-connection handle a transport layer (SSE/WebSocket — out of
/// scope per §1) drives: `next()` yields the next item to write, honoring
/// the write-timeout/liveness interleaving from §4.6.
pub struct FanOutHandle {
    pub subscription: Arc<ClientSubscription>,
    fanout: Arc<FanOut>,
    liveness_ticks: Mutex<mpsc::Receiver<()>>,
    liveness_task: Mutex<Option<JoinHandle<()>>>,
}

impl FanOutHandle {
    pub fn id(&self) -> SubscriptionId {
        self.subscription.id
    }

    /// Blocks for the next item, interleaving a liveness tick if the
    /// write-timeout granularity elapses first.
    pub async fn next(&self) -> OutboundItem {
        loop {
            tokio::select! {
                biased;
                _ = self.recv_tick() => {
                    return OutboundItem::Liveness { timestamp: chrono::Utc::now(), connection_id: self.subscription.id };
                }
                maybe = tokio::time::timeout(WRITE_TIMEOUT, self.subscription.queue.pop()) => {
                    if let Ok(Some(event)) = maybe {
                        if !self.subscription.filter.lock().await.accepts(&event) {
                            continue;
                        }
                        self.subscription.stats.sent.fetch_add(1, Ordering::Relaxed);
                        return self.maybe_compress(event).await;
                    }
                }
            }
        }
    }

    async fn recv_tick(&self) {
        self.liveness_ticks.lock().await.recv().await;
    }

    async fn maybe_compress(&self, event: Event) -> OutboundItem {
        if !self.subscription.compression.load(Ordering::Relaxed) {
            return OutboundItem::Event(event);
        }
        let Ok(serialized) = serde_json::to_vec(&event) else {
            return OutboundItem::Event(event);
        };
        if serialized.len() < COMPRESSION_THRESHOLD_BYTES {
            return OutboundItem::Event(event);
        }
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        if encoder.write_all(&serialized).is_err() {
            return OutboundItem::Event(event);
        }
        match encoder.finish() {
            Ok(gz) => OutboundItem::Compressed { event_type: event.event_type, id: event.id, gz },
            Err(_) => OutboundItem::Event(event),
        }
    }

    /// WebSocket `subscribe`: adds channels this connection wasn't
    /// listening on, each gets its own forwarding task.
    pub async fn subscribe_channels(&self, new_channels: Vec<String>) {
        let mut listeners = self.subscription.listeners.lock().await;
        let existing: HashSet<String> = listeners.iter().map(|l| l.channel.clone()).collect();
        for channel in new_channels {
            if existing.contains(&channel) {
                continue;
            }
            let mut receiver = self.fanout.bus.subscribe(std::slice::from_ref(&channel));
            let queue = Arc::clone(&self.subscription.queue);
            let handle = tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    queue.push(event).await;
                }
            });
            debug!(subscription_id = %self.subscription.id, %channel, "subscribed");
            listeners.push(ChannelListener { channel, handle });
        }
    }

    /// WebSocket `unsubscribe`: stops and removes listeners for the named
    /// channels; already-queued events from them are still delivered.
    pub async fn unsubscribe_channels(&self, remove: &[String]) {
        let mut listeners = self.subscription.listeners.lock().await;
        listeners.retain(|l| {
            if remove.contains(&l.channel) {
                l.handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub async fn configure(&self, compression: Option<bool>, filter: Option<EventFilter>) {
        if let Some(c) = compression {
            self.subscription.compression.store(c, Ordering::Relaxed);
        }
        if let Some(f) = filter {
            *self.subscription.filter.lock().await = f;
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.subscription.queue.len().await
    }

    pub fn stats(&self) -> &SubscriptionStats {
        &self.subscription.stats
    }
}

impl Drop for FanOutHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.liveness_task.get_mut().take() {
            handle.abort();
        }
        let fanout = Arc::clone(&self.fanout);
        let id = self.subscription.id;
        tokio::spawn(async move { fanout.disconnect(id).await });
    }
}

pub fn filter_from_params(
    event_types: Option<HashSet<EventType>>,
    min_priority: Option<Priority>,
    agent_ids: Option<HashSet<String>>,
) -> EventFilter {
    EventFilter { event_types, min_priority, agent_ids, data_equals: Default::default() }
}
