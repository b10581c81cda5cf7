//! C2: Event Bus.
//!
//! `publish`/`subscribe`/`recent` over named channels, each with its own
//! bounded ring buffer for replay and a shared 24h timeline. Gzip
//! compression kicks in on payloads crossing 1 KiB, the same threshold and
//! library (`flate2`) used elsewhere in this codebase's telemetry pipeline.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::EngineResult;
use crate::model::{channel_config, ChannelConfig, Event, EventType};
use crate::store::StateStore;

const COMPRESSION_THRESHOLD_BYTES: usize = 1024;
const TIMELINE_KEY: &str = "event_timeline";
const TIMELINE_RETENTION_SECS: i64 = 24 * 3600;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct EventBus {
    store: Arc<dyn StateStore>,
    channels: HashMap<&'static str, ChannelConfig>,
}

impl EventBus {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let mut channels = HashMap::new();
        for event_type in [
            EventType::AgentStatus,
            EventType::TaskUpdate,
            EventType::Metrics,
            EventType::SystemAlert,
            EventType::Collaboration,
            EventType::Broadcast,
            EventType::Heartbeat,
            EventType::PerformanceAlert,
            EventType::LogMessage,
        ] {
            let cfg = channel_config(event_type);
            channels.insert(cfg.name, cfg);
        }
        Self { store, channels }
    }

    fn config_for(&self, channel: &str) -> ChannelConfig {
        self.channels.get(channel).cloned().unwrap_or(ChannelConfig {
            name: "unknown",
            buffer_size: 200,
            retention_seconds: 3600,
            compression: false,
        })
    }

    /// Broadcasts on the pub/sub channel, pushes to the bounded replay
    /// buffer, and records the event on the global timeline. Never blocks on
    /// subscriber delivery or fails the publish because a recent-buffer
    /// write failed.
    pub async fn publish(&self, event: Event) -> EngineResult<()> {
        let channel = event.event_type.channel();
        let cfg = self.config_for(channel);

        let serialized = serde_json::to_vec(&event)
            .map_err(|e| crate::error::EngineError::Internal(format!("serializing event: {e}")))?;
        let wire = if cfg.compression && serialized.len() >= COMPRESSION_THRESHOLD_BYTES {
            gzip(&serialized)
        } else {
            serialized.clone()
        };

        self.store.publish(channel, wire.clone());

        if let Err(err) = self.write_to_buffer(channel, &cfg, &wire).await {
            debug!(%channel, %err, "recent-buffer write failed; publish still succeeds");
        }
        if let Err(err) = self.record_timeline(&event).await {
            debug!(%err, "timeline write failed; publish still succeeds");
        }
        Ok(())
    }

    async fn write_to_buffer(&self, channel: &str, cfg: &ChannelConfig, wire: &[u8]) -> EngineResult<()> {
        let key = format!("buffer:{channel}");
        let ttl = Duration::from_secs(cfg.retention_seconds.max(0) as u64);
        self.store.list_push_front(&key, wire, Some(ttl)).await?;
        self.store.list_trim(&key, cfg.buffer_size).await?;
        Ok(())
    }

    async fn record_timeline(&self, event: &Event) -> EngineResult<()> {
        let score = event.timestamp.timestamp() as f64;
        self.store.zadd(TIMELINE_KEY, &event.id.to_string(), score).await?;
        let cutoff = (chrono::Utc::now().timestamp() - TIMELINE_RETENTION_SECS) as f64;
        self.store.zremrangebyscore(TIMELINE_KEY, f64::MIN, cutoff).await?;
        Ok(())
    }

    /// Subscribes to a set of channels; messages from any of them arrive
    /// interleaved in the order the bus observed them on their own channel
    /// (no cross-channel total order, per §5). Each channel's receiver is
    /// drained by its own task and fanned into one ordered stream so the
    /// caller can `recv()` without juggling one receiver per channel.
    pub fn subscribe(&self, channels: &[String]) -> BusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(channels.len());
        for channel in channels {
            let mut receiver = self.store.subscribe(channel);
            let tx = tx.clone();
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(raw) => match decode_event(&raw) {
                            Ok(event) => {
                                if tx.send(event).is_err() {
                                    return;
                                }
                            }
                            Err(err) => error!(%channel, %err, "dropping corrupt event"),
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(%channel, skipped, "subscriber lagged, skipping");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }));
        }
        BusSubscription { rx, tasks }
    }

    /// Last `n` buffered events for a channel, newest first, decompressed
    /// transparently.
    pub async fn recent(&self, channel: &str, n: usize) -> EngineResult<Vec<Event>> {
        let key = format!("buffer:{channel}");
        let raw = self.store.list_range(&key, n).await?;
        let mut events = Vec::with_capacity(raw.len());
        for item in raw {
            match decode_event(&item) {
                Ok(event) => events.push(event),
                Err(err) => error!(%channel, %err, "dropping corrupt buffered event"),
            }
        }
        Ok(events)
    }
}

pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<Event>,
    tasks: Vec<JoinHandle<()>>,
}

impl BusSubscription {
    /// Waits for the next event across all subscribed channels. Decoding
    /// happens in the per-channel forwarding task, so this is a plain recv.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn decode_event(raw: &[u8]) -> EngineResult<Event> {
    let plain = if raw.len() >= 2 && raw[0..2] == GZIP_MAGIC {
        let mut decoder = flate2::read::GzDecoder::new(raw);
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut out)
            .map_err(|e| crate::error::EngineError::Internal(format!("decompressing event: {e}")))?;
        out
    } else {
        raw.to_vec()
    };
    serde_json::from_slice(&plain).map_err(|e| crate::error::EngineError::Internal(format!("decoding event: {e}")))
}
