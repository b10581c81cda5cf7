//! C3: Event Aggregator.
//!
//! A staged pipeline between high-volume producers and the bus (C2): dedup,
//! batch, sliding-window merge, and priority-queue drain, one strategy per
//! event type. A single background flush task scans every open batch on a
//! fixed cadence, the same cooperative single-owner pattern the worker step
//! loop and fan-out listener use (locks only where producers genuinely
//! contend: the batch map and the dedup cache).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::model::{Event, EventId, EventType, Priority};

const FLUSH_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum AggregationStrategy {
    /// Pass through immediately, no buffering.
    None,
    /// Keep only the newest event per dedup key; flush on delay elapse.
    LatestOnly { dedup_fields: Vec<String>, max_delay: Duration },
    /// Accumulate up to `batch_size` then flush a merged event.
    CountBased { batch_size: usize, max_delay: Duration },
    /// Accumulate over `window` and flush aggregated statistics.
    SlidingWindow { window: Duration },
    /// High-priority events emit immediately; the rest accumulate and drain
    /// on `max_delay` or once `batch_size` is reached, whichever comes first.
    PriorityQueue { max_delay: Duration, batch_size: usize },
}

impl AggregationStrategy {
    /// §4.3 defaults table, drawn from the workload's own per-event-type
    /// tuning.
    pub fn default_for(event_type: EventType) -> Self {
        match event_type {
            EventType::AgentStatus => AggregationStrategy::LatestOnly {
                dedup_fields: vec!["agent_id".to_string()],
                max_delay: Duration::from_secs(2),
            },
            EventType::TaskUpdate => AggregationStrategy::CountBased {
                batch_size: 20,
                max_delay: Duration::from_secs(3),
            },
            EventType::Metrics => AggregationStrategy::SlidingWindow {
                window: Duration::from_secs(5),
            },
            EventType::SystemAlert => AggregationStrategy::PriorityQueue {
                max_delay: Duration::from_secs(1),
                batch_size: 5,
            },
            EventType::Heartbeat => AggregationStrategy::LatestOnly {
                dedup_fields: vec!["source".to_string()],
                max_delay: Duration::from_secs(10),
            },
            EventType::Broadcast => AggregationStrategy::None,
            EventType::PerformanceAlert => AggregationStrategy::PriorityQueue {
                max_delay: Duration::from_secs(2),
                batch_size: 3,
            },
            EventType::Collaboration => AggregationStrategy::LatestOnly {
                dedup_fields: vec!["user_id".to_string(), "target".to_string()],
                max_delay: Duration::from_secs(1),
            },
            EventType::LogMessage => AggregationStrategy::CountBased {
                batch_size: 50,
                max_delay: Duration::from_secs(10),
            },
        }
    }
}

struct OpenBatch {
    events: Vec<Event>,
    deadline: DateTime<Utc>,
}

impl OpenBatch {
    fn new(event: Event, delay: Duration) -> Self {
        Self {
            deadline: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
            events: vec![event],
        }
    }
}

/// One entry per composite dedup key: `latest-only` keeps its single
/// surviving event directly in `batches`, so the key's mere presence here
/// *is* the dedup cache; the TTL is the batch's own flush deadline
/// (configured max-delay), not a separate doubled window, since a flushed
/// batch is removed from the map and a fresh event simply reopens it.
struct TypeState {
    strategy: AggregationStrategy,
    batches: DashMap<String, Mutex<OpenBatch>>,
}

pub struct EventAggregator {
    bus: Arc<EventBus>,
    types: HashMap<EventType, TypeState>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    events_in: AtomicI64,
    events_out: AtomicI64,
}

const ALL_EVENT_TYPES: [EventType; 9] = [
    EventType::AgentStatus,
    EventType::TaskUpdate,
    EventType::Metrics,
    EventType::SystemAlert,
    EventType::Broadcast,
    EventType::Heartbeat,
    EventType::PerformanceAlert,
    EventType::LogMessage,
    EventType::Collaboration,
];

impl EventAggregator {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let mut types = HashMap::new();
        for event_type in ALL_EVENT_TYPES {
            types.insert(
                event_type,
                TypeState {
                    strategy: AggregationStrategy::default_for(event_type),
                    batches: DashMap::new(),
                },
            );
        }
        Arc::new(Self {
            bus,
            types,
            flush_handle: Mutex::new(None),
            events_in: AtomicI64::new(0),
            events_out: AtomicI64::new(0),
        })
    }

    /// Overrides the default strategy for one event type, for callers that
    /// need non-default batch sizes or windows (tests mostly).
    pub fn configure(&mut self, event_type: EventType, strategy: AggregationStrategy) {
        if let Some(state) = self.types.get_mut(&event_type) {
            state.strategy = strategy;
        }
    }

    /// Starts the periodic flush loop. Idempotent; a second call is a no-op
    /// as long as the first loop is still running.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.flush_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_TICK);
            loop {
                ticker.tick().await;
                this.flush_due().await;
            }
        }));
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.flush_handle.lock().await.take() {
            handle.abort();
        }
        self.flush_all_now().await;
    }

    /// Entry point: route one event through its type's strategy. Aggregator
    /// exceptions fall back to pass-through of the underlying event per §7.
    pub async fn ingest(&self, event: Event) {
        self.events_in.fetch_add(1, Ordering::Relaxed);
        let Some(state) = self.types.get(&event.event_type) else {
            self.publish(event).await;
            return;
        };
        match &state.strategy {
            AggregationStrategy::None => self.publish(event).await,
            AggregationStrategy::LatestOnly { dedup_fields, max_delay } => {
                self.ingest_latest_only(state, event, dedup_fields, *max_delay).await
            }
            AggregationStrategy::CountBased { batch_size, max_delay } => {
                self.ingest_count_based(state, event, *batch_size, *max_delay).await
            }
            AggregationStrategy::SlidingWindow { window } => self.ingest_sliding_window(state, event, *window).await,
            AggregationStrategy::PriorityQueue { max_delay, batch_size } => {
                self.ingest_priority_queue(state, event, *max_delay, *batch_size).await
            }
        }
    }

    fn dedup_key(event: &Event, fields: &[String]) -> String {
        let mut key = format!("{:?}", event.event_type);
        for field in fields {
            if let Some(v) = event.data.get(field) {
                key.push(':');
                key.push_str(&v.to_string());
            }
        }
        key
    }

    async fn ingest_latest_only(&self, state: &TypeState, event: Event, fields: &[String], max_delay: Duration) {
        let key = Self::dedup_key(&event, fields);
        let entry = state.batches.entry(key).or_insert_with(|| Mutex::new(OpenBatch::new(event.clone(), max_delay)));
        let mut batch = entry.lock().await;
        // Latest-only keeps only the newest event; replace rather than append.
        batch.events = vec![event];
    }

    async fn ingest_count_based(&self, state: &TypeState, event: Event, batch_size: usize, max_delay: Duration) {
        let key = event.event_type.channel().to_string();
        let ready = {
            let mut inserted_fresh = false;
            let entry = state.batches.entry(key.clone()).or_insert_with(|| {
                inserted_fresh = true;
                Mutex::new(OpenBatch::new(event.clone(), max_delay))
            });
            let mut batch = entry.lock().await;
            if !inserted_fresh {
                batch.events.push(event);
            }
            batch.events.len() >= batch_size
        };
        if ready {
            self.flush_key(state, &key).await;
        }
    }

    async fn ingest_sliding_window(&self, state: &TypeState, event: Event, window: Duration) {
        let key = event.event_type.channel().to_string();
        let mut inserted_fresh = false;
        let entry = state.batches.entry(key).or_insert_with(|| {
            inserted_fresh = true;
            Mutex::new(OpenBatch::new(event.clone(), window))
        });
        let mut batch = entry.lock().await;
        if !inserted_fresh {
            batch.events.push(event);
        }
    }

    async fn ingest_priority_queue(&self, state: &TypeState, event: Event, max_delay: Duration, batch_size: usize) {
        if event.priority >= Priority::High {
            self.publish(event).await;
            return;
        }
        let key = "low".to_string();
        let ready = {
            let mut inserted_fresh = false;
            let entry = state.batches.entry(key.clone()).or_insert_with(|| {
                inserted_fresh = true;
                Mutex::new(OpenBatch::new(event.clone(), max_delay))
            });
            let mut batch = entry.lock().await;
            if !inserted_fresh {
                batch.events.push(event);
            }
            batch.events.len() >= batch_size
        };
        if ready {
            self.flush_key(state, &key).await;
        }
    }

    /// Scans every open batch across every type and flushes the ones whose
    /// deadline has passed. Runs once per `FLUSH_TICK`.
    async fn flush_due(&self) {
        let now = Utc::now();
        for (event_type, state) in &self.types {
            let due_keys: Vec<String> = state
                .batches
                .iter()
                .filter_map(|entry| {
                    let key = entry.key().clone();
                    match entry.value().try_lock() {
                        Ok(batch) if now >= batch.deadline && !batch.events.is_empty() => Some(key),
                        _ => None,
                    }
                })
                .collect();
            for key in due_keys {
                self.flush_key(state, &key).await;
            }
            let _ = event_type;
        }
    }

    async fn flush_all_now(&self) {
        for state in self.types.values() {
            let keys: Vec<String> = state.batches.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                self.flush_key(state, &key).await;
            }
        }
    }

    async fn flush_key(&self, state: &TypeState, key: &str) {
        let Some(entry) = state.batches.get(key) else { return };
        let events = {
            let mut batch = entry.lock().await;
            if batch.events.is_empty() {
                return;
            }
            std::mem::take(&mut batch.events)
        };
        drop(entry);
        state.batches.remove(key);
        if events.len() == 1 {
            self.publish(events.into_iter().next().unwrap()).await;
            return;
        }
        self.publish(merge_batch(events)).await;
    }

    async fn publish(&self, event: Event) {
        self.events_out.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.bus.publish(event).await {
            warn!(%err, "aggregator publish failed");
        }
    }

    pub fn stats(&self) -> (i64, i64) {
        (self.events_in.load(Ordering::Relaxed), self.events_out.load(Ordering::Relaxed))
    }
}

/// Names commonly carrying a numeric value worth summarizing across a batch.
const MERGEABLE_NUMERIC_FIELDS: &[&str] =
    &["value", "tokens", "tokens_used", "cost_usd", "cpu_percent", "memory_mb", "progress", "duration_ms"];

/// Produces one aggregated event from N ≥ 2 originals: batch size, time
/// span, original ids, per-numeric-field stats, and the latest values for
/// everything else. Tagged `aggregated: true` and keeps the highest priority
/// seen in the batch, per §4.3.
fn merge_batch(mut events: Vec<Event>) -> Event {
    events.sort_by_key(|e| e.timestamp);
    let event_type = events[0].event_type;
    let source = events[0].source.clone();
    let priority = events.iter().map(|e| e.priority).max().unwrap_or(Priority::Normal);
    let start = events.first().unwrap().timestamp;
    let end = events.last().unwrap().timestamp;
    let event_ids: Vec<EventId> = events.iter().map(|e| e.id).collect();

    let mut stats = serde_json::Map::new();
    for field in MERGEABLE_NUMERIC_FIELDS {
        let values: Vec<f64> = events.iter().filter_map(|e| e.data.get(*field)).filter_map(Value::as_f64).collect();
        if values.is_empty() {
            continue;
        }
        let sum: f64 = values.iter().sum();
        let count = values.len();
        let avg = sum / count as f64;
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        stats.insert(
            field.to_string(),
            serde_json::json!({ "sum": sum, "avg": avg, "min": min, "max": max, "count": count }),
        );
    }

    let latest = events.last().unwrap().data.clone();

    let payload = serde_json::json!({
        "aggregated": true,
        "batch_size": events.len(),
        "time_span": { "start": start, "end": end },
        "event_ids": event_ids,
        "stats": Value::Object(stats),
        "latest": latest,
    });

    debug!(batch_size = events.len(), ?event_type, "flushed aggregated event");
    Event::new(event_type, priority, source, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(value: f64) -> Event {
        Event::new(EventType::Metrics, Priority::Normal, "test", serde_json::json!({ "value": value }))
    }

    #[test]
    fn default_strategies_match_section_4_3() {
        assert!(matches!(AggregationStrategy::default_for(EventType::AgentStatus), AggregationStrategy::LatestOnly { .. }));
        assert!(matches!(AggregationStrategy::default_for(EventType::TaskUpdate), AggregationStrategy::CountBased { .. }));
        assert!(matches!(AggregationStrategy::default_for(EventType::Metrics), AggregationStrategy::SlidingWindow { .. }));
        assert!(matches!(AggregationStrategy::default_for(EventType::SystemAlert), AggregationStrategy::PriorityQueue { .. }));
        assert!(matches!(AggregationStrategy::default_for(EventType::Broadcast), AggregationStrategy::None));
        assert!(matches!(
            AggregationStrategy::default_for(EventType::PerformanceAlert),
            AggregationStrategy::PriorityQueue { max_delay, batch_size: 3 } if max_delay == Duration::from_secs(2)
        ));
        assert!(matches!(
            AggregationStrategy::default_for(EventType::Collaboration),
            AggregationStrategy::LatestOnly { ref dedup_fields, max_delay }
                if dedup_fields == &vec!["user_id".to_string(), "target".to_string()] && max_delay == Duration::from_secs(1)
        ));
        assert!(matches!(
            AggregationStrategy::default_for(EventType::LogMessage),
            AggregationStrategy::CountBased { batch_size: 50, max_delay } if max_delay == Duration::from_secs(10)
        ));
    }

    #[test]
    fn merge_batch_sums_numeric_fields_and_tags_batch_size() {
        let events = vec![metric(1.0), metric(2.0), metric(3.0)];
        let merged = merge_batch(events);
        assert_eq!(merged.data["batch_size"], serde_json::json!(3));
        assert_eq!(merged.data["stats"]["value"]["sum"], serde_json::json!(6.0));
        assert_eq!(merged.data["stats"]["value"]["count"], serde_json::json!(3));
        assert_eq!(merged.data["stats"]["value"]["min"], serde_json::json!(1.0));
        assert_eq!(merged.data["stats"]["value"]["max"], serde_json::json!(3.0));
        let event_ids = merged.data["event_ids"].as_array().unwrap();
        assert_eq!(event_ids.len(), 3);
    }

    #[test]
    fn merge_batch_time_span_end_is_not_before_start() {
        let merged = merge_batch(vec![metric(1.0), metric(2.0)]);
        let start = merged.data["time_span"]["start"].as_str().unwrap();
        let end = merged.data["time_span"]["end"].as_str().unwrap();
        assert!(end >= start);
    }

    #[test]
    fn merge_batch_keeps_highest_priority_seen() {
        let low = Event::new(EventType::SystemAlert, Priority::Low, "s", serde_json::json!({}));
        let high = Event::new(EventType::SystemAlert, Priority::Critical, "s", serde_json::json!({}));
        let merged = merge_batch(vec![low, high]);
        assert_eq!(merged.priority, Priority::Critical);
    }

    #[tokio::test]
    async fn count_based_flushes_exactly_at_batch_size() {
        let bus = EventBus::new(Arc::new(crate::store::SledStateStore::open_temporary().unwrap()));
        let aggregator = EventAggregator::new(Arc::new(bus));
        for i in 0..20 {
            aggregator
                .ingest(Event::new(
                    EventType::TaskUpdate,
                    Priority::Normal,
                    "test",
                    serde_json::json!({ "progress": i }),
                ))
                .await;
        }
        let (_, events_out) = aggregator.stats();
        assert_eq!(events_out, 1, "20 task-update events at batch_size=20 should flush exactly once");
    }

    #[tokio::test]
    async fn priority_queue_passes_high_priority_through_immediately() {
        let bus = EventBus::new(Arc::new(crate::store::SledStateStore::open_temporary().unwrap()));
        let aggregator = EventAggregator::new(Arc::new(bus));
        aggregator
            .ingest(Event::new(EventType::SystemAlert, Priority::Critical, "test", serde_json::json!({})))
            .await;
        let (_, events_out) = aggregator.stats();
        assert_eq!(events_out, 1);
    }
}
