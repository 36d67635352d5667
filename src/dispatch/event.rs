use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub const EVENT_RING_CAPACITY: usize = 1000;

const LIVE_CHANNEL_CAPACITY: usize = 256;

/// Everything the monitor can observe, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    DroneStatus {
        drone: String,
        queued: usize,
        active: usize,
        completed_count: usize,
        failed_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_task: Option<String>,
    },
    NewTaskAvailable {
        drone: String,
        queued: usize,
    },
    TaskQueued {
        drone: String,
        task: String,
    },
    TaskStarted {
        drone: String,
        task: String,
    },
    TaskProgress {
        drone: String,
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskCompleted {
        drone: String,
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskFailed {
        drone: String,
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskCancelled {
        drone: String,
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Broadcast {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        message: String,
    },
    PollError {
        message: String,
    },
    /// A payload that could not be decoded, kept verbatim.
    Raw {
        channel: String,
        payload: String,
        error: String,
    },
}

impl MonitorEvent {
    pub fn drone(&self) -> Option<&str> {
        match self {
            Self::DroneStatus { drone, .. }
            | Self::NewTaskAvailable { drone, .. }
            | Self::TaskQueued { drone, .. }
            | Self::TaskStarted { drone, .. }
            | Self::TaskProgress { drone, .. }
            | Self::TaskCompleted { drone, .. }
            | Self::TaskFailed { drone, .. }
            | Self::TaskCancelled { drone, .. } => Some(drone.as_str()),
            Self::Broadcast { .. } | Self::PollError { .. } | Self::Raw { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DroneStatus { .. } => "drone_status",
            Self::NewTaskAvailable { .. } => "new_task_available",
            Self::TaskQueued { .. } => "task_queued",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::Broadcast { .. } => "broadcast",
            Self::PollError { .. } => "poll_error",
            Self::Raw { .. } => "raw",
        }
    }

    fn raw(channel: &str, payload: &str, error: impl Into<String>) -> Self {
        Self::Raw {
            channel: channel.to_string(),
            payload: payload.to_string(),
            error: error.into(),
        }
    }

    /// Decodes a message received on `channel`.
    ///
    /// Accepts JSON objects with a `type` field (`task_*` names or the bare
    /// task event names `started`, `progress`, ...) and the colon form
    /// `task_completed:<drone>:<task>` used by drone daemons. Plain text on
    /// the broadcast channel is a broadcast message. Anything else becomes
    /// `Raw` with the reason attached.
    pub fn decode(channel: &str, payload: &str, broadcast_channel: &str) -> (Self, Option<DateTime<Utc>>) {
        match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(map)) => decode_object(channel, payload, &map),
            Ok(_) => (Self::raw(channel, payload, "expected a JSON object"), None),
            Err(json_error) => {
                if channel == broadcast_channel {
                    return (
                        Self::Broadcast {
                            from: None,
                            message: payload.to_string(),
                        },
                        None,
                    );
                }
                match decode_colon_form(payload) {
                    Some(event) => (event, None),
                    None => (Self::raw(channel, payload, json_error.to_string()), None),
                }
            }
        }
    }
}

fn str_field<'a>(map: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// `task` may be an id or a whole task object.
fn task_ref(map: &serde_json::Map<String, Value>) -> (Option<String>, Option<String>) {
    match map.get("task") {
        Some(Value::String(id)) => (Some(id.clone()), None),
        Some(Value::Object(task)) => (
            task.get("id").and_then(Value::as_str).map(str::to_string),
            task.get("agent_id").and_then(Value::as_str).map(str::to_string),
        ),
        _ => (str_field(map, &["task_id"]).map(str::to_string), None),
    }
}

fn decode_object(
    channel: &str,
    payload: &str,
    map: &serde_json::Map<String, Value>,
) -> (MonitorEvent, Option<DateTime<Utc>>) {
    let timestamp = map
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));

    let Some(kind) = str_field(map, &["type"]) else {
        return (MonitorEvent::raw(channel, payload, "missing field `type`"), timestamp);
    };
    let message = str_field(map, &["message", "error", "result"]).map(str::to_string);

    if matches!(kind, "broadcast" | "message") {
        return match message {
            Some(message) => (
                MonitorEvent::Broadcast {
                    from: str_field(map, &["from", "drone"]).map(str::to_string),
                    message,
                },
                timestamp,
            ),
            None => (MonitorEvent::raw(channel, payload, "missing field `message`"), timestamp),
        };
    }

    let (task, task_owner) = task_ref(map);
    let drone = str_field(map, &["drone", "agent_id", "agent"])
        .map(str::to_string)
        .or(task_owner);
    let (Some(drone), Some(task)) = (drone, task) else {
        return (
            MonitorEvent::raw(channel, payload, "missing field `drone` or `task`"),
            timestamp,
        );
    };

    let event = match kind {
        "task_queued" | "queued" | "created" => MonitorEvent::TaskQueued { drone, task },
        "task_started" | "started" => MonitorEvent::TaskStarted { drone, task },
        "task_progress" | "progress" => MonitorEvent::TaskProgress {
            drone,
            task,
            step: map.get("step").and_then(step_id),
            progress: map
                .get("progress")
                .and_then(Value::as_u64)
                .map(|p| p.min(100) as u8),
            message,
        },
        "task_completed" | "completed" => MonitorEvent::TaskCompleted { drone, task, message },
        "task_failed" | "failed" => MonitorEvent::TaskFailed { drone, task, message },
        "task_cancelled" | "cancelled" => MonitorEvent::TaskCancelled { drone, task, message },
        other => MonitorEvent::raw(channel, payload, format!("unknown event type `{}`", other)),
    };
    (event, timestamp)
}

/// `step` is either a number or a step object carrying an `id`.
fn step_id(value: &Value) -> Option<usize> {
    value
        .as_u64()
        .or_else(|| value.get("id").and_then(Value::as_u64))
        .map(|id| id as usize)
}

fn decode_colon_form(payload: &str) -> Option<MonitorEvent> {
    let mut parts = payload.trim().splitn(3, ':');
    let kind = parts.next()?;
    let drone = parts.next().filter(|d| !d.is_empty())?.to_string();
    let task = parts.next().map(str::to_string);

    match (kind, task) {
        ("task_completed", Some(task)) => Some(MonitorEvent::TaskCompleted {
            drone,
            task,
            message: None,
        }),
        ("task_failed", Some(task)) => Some(MonitorEvent::TaskFailed {
            drone,
            task,
            message: None,
        }),
        ("task_started", Some(task)) => Some(MonitorEvent::TaskStarted { drone, task }),
        ("task_queued", Some(task)) => Some(MonitorEvent::TaskQueued { drone, task }),
        ("task_queued", None) => Some(MonitorEvent::NewTaskAvailable { drone, queued: 1 }),
        _ => None,
    }
}

/// An event as kept by the monitor: `timestamp` is when it happened (the
/// sender's clock when provided), `received_at` when the monitor saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: MonitorEvent,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Bounded buffer of the most recent events. Pushing past capacity evicts
/// the oldest entry. Every push is also offered to live subscribers.
pub struct EventRing {
    events: Mutex<VecDeque<StoredEvent>>,
    capacity: usize,
    live: broadcast::Sender<StoredEvent>,
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new(EVENT_RING_CAPACITY)
    }
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(EVENT_RING_CAPACITY))),
            capacity: capacity.max(1),
            live,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, event: MonitorEvent, timestamp: Option<DateTime<Utc>>) -> StoredEvent {
        let received_at = Utc::now();
        let stored = StoredEvent {
            event,
            timestamp: timestamp.unwrap_or(received_at),
            received_at,
        };
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(stored.clone());
        }
        let _ = self.live.send(stored.clone());
        stored
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Removes and returns everything buffered, oldest first.
    pub fn drain(&self) -> Vec<StoredEvent> {
        self.events.lock().drain(..).collect()
    }

    /// The newest `limit` events (all when `None`), oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<StoredEvent> {
        let events = self.events.lock();
        let skip = limit.map_or(0, |l| events.len().saturating_sub(l));
        events.iter().skip(skip).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.live.subscribe()
    }
}
