//! Queen-to-drone task dispatch and the monitor that turns store traffic into events.
//!
//! Per drone `d` the store holds a FIFO queue, an active list (at most one
//! task), completed and failed lists, and a capped log stream. Three
//! channels carry notifications: `broadcast` to everyone, `events` to the
//! queen, and `tasks` which each monitor filters down to its own role.

pub mod event;
pub mod monitor;
pub mod queue;
pub mod store;

use thiserror::Error;

pub use event::{EventRing, MonitorEvent, StoredEvent, EVENT_RING_CAPACITY};
pub use monitor::{DispatchMonitor, MonitorConfig};
pub use queue::{DroneStatus, TaskOutcome, TaskQueue};
pub use store::{MemoryStore, PubSubMessage, SharedStore, StoreError, StreamEntry, Subscription};

pub const LOG_STREAM_MAX_LEN: usize = 1000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Drone {drone} already has an active task")]
    Busy { drone: String },
}

/// Key and channel names under one namespace, e.g. `hive:queue:drone-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("hive")
    }
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn queue(&self, drone: &str) -> String {
        format!("{}:queue:{}", self.prefix, drone)
    }

    pub fn active(&self, drone: &str) -> String {
        format!("{}:active:{}", self.prefix, drone)
    }

    pub fn completed(&self, drone: &str) -> String {
        format!("{}:completed:{}", self.prefix, drone)
    }

    pub fn failed(&self, drone: &str) -> String {
        format!("{}:failed:{}", self.prefix, drone)
    }

    pub fn logs(&self, drone: &str) -> String {
        format!("{}:logs:{}", self.prefix, drone)
    }

    pub fn broadcast_channel(&self) -> String {
        format!("{}:broadcast", self.prefix)
    }

    pub fn events_channel(&self) -> String {
        format!("{}:events", self.prefix)
    }

    pub fn tasks_channel(&self) -> String {
        format!("{}:tasks", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_scheme() {
        let keys = StoreKeys::default();
        assert_eq!(keys.queue("drone-1"), "hive:queue:drone-1");
        assert_eq!(keys.active("drone-1"), "hive:active:drone-1");
        assert_eq!(keys.completed("drone-2"), "hive:completed:drone-2");
        assert_eq!(keys.failed("drone-2"), "hive:failed:drone-2");
        assert_eq!(keys.logs("drone-3"), "hive:logs:drone-3");
        assert_eq!(keys.broadcast_channel(), "hive:broadcast");
        assert_eq!(keys.events_channel(), "hive:events");
        assert_eq!(StoreKeys::new("shop").tasks_channel(), "shop:tasks");
    }
}
