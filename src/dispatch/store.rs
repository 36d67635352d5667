use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

/// Messages published after the subscription was made, on the requested
/// channels only. Delivery is at-most-once; nothing is replayed.
pub type Subscription = BoxStream<'static, PubSubMessage>;

/// List, stream and pub/sub primitives of the shared key-value store.
/// List operations follow Redis semantics: `lpush` adds at the head and
/// `rpop` takes from the tail, so the pair forms a FIFO.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError>;
    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Atomically moves the tail of `source` to the head of `destination`.
    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>, StoreError>;
    async fn llen(&self, key: &str) -> Result<usize, StoreError>;
    /// Inclusive range; negative indexes count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
    /// Appends to a stream, trimming the oldest entries beyond `max_len`.
    async fn xadd(&self, key: &str, fields: BTreeMap<String, String>, max_len: usize) -> Result<String, StoreError>;
    async fn xlen(&self, key: &str) -> Result<usize, StoreError>;
    /// Up to `count` entries, newest first.
    async fn xrevrange(&self, key: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, StoreError>;
}

#[derive(Default)]
struct StreamLog {
    entries: VecDeque<StreamEntry>,
    last_ms: i64,
    seq: u64,
}

/// In-process store. Lists and streams live behind mutexes; pub/sub rides a
/// tokio broadcast channel, so slow subscribers lose messages rather than
/// stall publishers.
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    streams: Mutex<HashMap<String, StreamLog>>,
    bus: broadcast::Sender<PubSubMessage>,
    pubsub_enabled: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            lists: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            bus,
            pubsub_enabled: true,
        }
    }

    /// A store whose pub/sub is down: `subscribe` and `publish` fail while
    /// lists and streams still work.
    pub fn without_pubsub() -> Self {
        Self {
            pubsub_enabled: false,
            ..Self::new()
        }
    }
}

fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut lists = self.lists.lock();
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut lists = self.lists.lock();
        Ok(lists.get_mut(key).and_then(|list| list.pop_back()))
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>, StoreError> {
        let mut lists = self.lists.lock();
        let Some(value) = lists.get_mut(source).and_then(|list| list.pop_back()) else {
            return Ok(None);
        };
        lists
            .entry(destination.to_string())
            .or_default()
            .push_front(value.clone());
        Ok(Some(value))
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lists.lock().get(key).map_or(0, VecDeque::len))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let lists = self.lists.lock();
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn xadd(&self, key: &str, fields: BTreeMap<String, String>, max_len: usize) -> Result<String, StoreError> {
        let mut streams = self.streams.lock();
        let log = streams.entry(key.to_string()).or_default();

        let now_ms = Utc::now().timestamp_millis();
        if now_ms > log.last_ms {
            log.last_ms = now_ms;
            log.seq = 0;
        } else {
            log.seq += 1;
        }
        let id = format!("{}-{}", log.last_ms, log.seq);

        log.entries.push_back(StreamEntry {
            id: id.clone(),
            fields,
        });
        while log.entries.len() > max_len {
            log.entries.pop_front();
        }
        Ok(id)
    }

    async fn xlen(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.streams.lock().get(key).map_or(0, |log| log.entries.len()))
    }

    async fn xrevrange(&self, key: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        let streams = self.streams.lock();
        Ok(streams
            .get(key)
            .map(|log| log.entries.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        if !self.pubsub_enabled {
            return Err(StoreError::Unavailable("pub/sub is disabled on this store".to_string()));
        }
        let message = PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // An error only means nobody is subscribed right now.
        Ok(self.bus.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, StoreError> {
        if !self.pubsub_enabled {
            return Err(StoreError::Subscribe("pub/sub is disabled on this store".to_string()));
        }
        let wanted: HashSet<String> = channels.iter().cloned().collect();
        let stream = BroadcastStream::new(self.bus.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(message) if wanted.contains(&message.channel) => Some(message),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Subscriber fell behind: {}", e);
                    None
                }
            };
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}
