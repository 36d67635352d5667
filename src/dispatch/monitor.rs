use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::event::{EventRing, MonitorEvent, StoredEvent};
use super::queue::TaskQueue;
use super::store::{PubSubMessage, Subscription};
use crate::config::{AgentIdentity, HiveConfig};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Drones the queen reports on. Workers only ever look at themselves.
    pub drones: Vec<String>,
}

impl MonitorConfig {
    pub fn for_identity(config: &HiveConfig, identity: &AgentIdentity) -> Self {
        let settings = if identity.is_queen() {
            &config.monitoring.queen
        } else {
            &config.monitoring.worker
        };
        Self {
            poll_interval: Duration::from_secs(settings.interval_seconds),
            drones: config.drone_names(),
        }
    }
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Subscribes to the hive channels and polls the queues on a timer, feeding
/// everything it sees into one bounded [`EventRing`].
pub struct DispatchMonitor {
    queue: Arc<TaskQueue>,
    identity: AgentIdentity,
    config: MonitorConfig,
    ring: Arc<EventRing>,
    running: Mutex<Option<Running>>,
}

impl DispatchMonitor {
    pub fn new(queue: Arc<TaskQueue>, identity: AgentIdentity, config: MonitorConfig) -> Self {
        Self {
            queue,
            identity,
            config,
            ring: Arc::new(EventRing::default()),
            running: Mutex::new(None),
        }
    }

    pub fn ring(&self) -> Arc<EventRing> {
        Arc::clone(&self.ring)
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn channels(&self) -> Vec<String> {
        let keys = self.queue.keys();
        let mut channels = vec![keys.broadcast_channel()];
        if self.identity.is_queen() {
            channels.push(keys.events_channel());
        }
        channels.push(keys.tasks_channel());
        channels
    }

    /// Starts the subscriber and poll loops. Calling it on a running monitor
    /// does nothing. If the subscription cannot be set up the monitor keeps
    /// going on polling alone.
    pub async fn start(&self) {
        if self.is_running() {
            return;
        }

        let subscription = match self.queue.store().subscribe(&self.channels()).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!("Monitor for {} running poll-only: {}", self.identity.name, e);
                None
            }
        };

        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let mut handles = Vec::with_capacity(2);
        if let Some(subscription) = subscription {
            handles.push(tokio::spawn(run_subscriber(
                subscription,
                Arc::clone(&self.ring),
                self.identity.clone(),
                self.queue.keys().tasks_channel(),
                self.queue.keys().broadcast_channel(),
                token.clone(),
            )));
        }
        handles.push(tokio::spawn(run_poller(
            Arc::clone(&self.queue),
            Arc::clone(&self.ring),
            self.identity.clone(),
            self.config.clone(),
            token.clone(),
        )));

        tracing::info!(
            "Dispatch monitor started for {} ({:?} poll interval)",
            self.identity.name,
            self.config.poll_interval
        );
        *running = Some(Running { token, handles });
    }

    /// Cancels both loops and waits for whatever they were doing to finish.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.token.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                tracing::error!("Monitor loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Dispatch monitor stopped for {}", self.identity.name);
    }

    /// Runs one poll pass immediately and records its events.
    pub async fn poll_once(&self) -> Vec<StoredEvent> {
        poll(&self.queue, &self.identity, &self.config.drones)
            .await
            .into_iter()
            .map(|event| self.ring.push(event, None))
            .collect()
    }
}

async fn run_subscriber(
    mut subscription: Subscription,
    ring: Arc<EventRing>,
    identity: AgentIdentity,
    tasks_channel: String,
    broadcast_channel: String,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = subscription.next() => match next {
                Some(message) => handle_message(&message, &ring, &identity, &tasks_channel, &broadcast_channel),
                None => {
                    tracing::warn!("Subscription for {} closed", identity.name);
                    break;
                }
            },
        }
    }
}

fn handle_message(
    message: &PubSubMessage,
    ring: &EventRing,
    identity: &AgentIdentity,
    tasks_channel: &str,
    broadcast_channel: &str,
) {
    let (event, timestamp) = MonitorEvent::decode(&message.channel, &message.payload, broadcast_channel);

    // Workers only care about task traffic addressed to them.
    if !identity.is_queen() && message.channel == tasks_channel {
        if let Some(drone) = event.drone() {
            if drone != identity.name {
                return;
            }
        }
    }

    if let MonitorEvent::Raw { error, .. } = &event {
        tracing::warn!("Undecodable message on {}: {}", message.channel, error);
    } else {
        tracing::debug!("{} received {} on {}", identity.name, event.kind(), message.channel);
    }
    ring.push(event, timestamp);
}

async fn run_poller(
    queue: Arc<TaskQueue>,
    ring: Arc<EventRing>,
    identity: AgentIdentity,
    config: MonitorConfig,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                for event in poll(&queue, &identity, &config.drones).await {
                    ring.push(event, None);
                }
            }
        }
    }
}

async fn poll(queue: &TaskQueue, identity: &AgentIdentity, drones: &[String]) -> Vec<MonitorEvent> {
    if identity.is_queen() {
        let mut events = Vec::with_capacity(drones.len());
        for drone in drones {
            match queue.drone_status(drone).await {
                Ok(status) => events.push(MonitorEvent::DroneStatus {
                    drone: status.drone,
                    queued: status.queued,
                    active: status.active,
                    completed_count: status.completed_count,
                    failed_count: status.failed_count,
                    current_task: status.current_task,
                }),
                Err(e) => events.push(poll_error(drone, e)),
            }
        }
        return events;
    }

    let drone = identity.name.as_str();
    let lengths = async {
        let queued = queue.queue_len(drone).await?;
        let active = queue.active_len(drone).await?;
        Ok::<_, super::DispatchError>((queued, active))
    };
    match lengths.await {
        Ok((queued, 0)) if queued > 0 => vec![MonitorEvent::NewTaskAvailable {
            drone: drone.to_string(),
            queued,
        }],
        Ok(_) => Vec::new(),
        Err(e) => vec![poll_error(drone, e)],
    }
}

fn poll_error(drone: &str, error: impl std::fmt::Display) -> MonitorEvent {
    tracing::warn!("Poll failed for {}: {}", drone, error);
    MonitorEvent::PollError {
        message: format!("{}: {}", drone, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentRole;
    use crate::dispatch::{MemoryStore, SharedStore, StoreKeys, TaskOutcome};
    use crate::task::{CreateStepRequest, CreateTaskRequest, Task, TaskManager};

    fn make_task(manager: &TaskManager, drone: &str) -> Task {
        manager
            .create(CreateTaskRequest {
                agent_id: drone.to_string(),
                title: format!("work for {}", drone),
                steps: vec![CreateStepRequest {
                    action: "build".to_string(),
                    dod: vec!["build passes".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            })
            .unwrap()
    }

    fn monitor(store: Arc<dyn SharedStore>, identity: AgentIdentity, poll_interval: Duration) -> (Arc<TaskQueue>, DispatchMonitor) {
        let queue = Arc::new(TaskQueue::new(store, StoreKeys::default()));
        let config = MonitorConfig {
            poll_interval,
            drones: vec!["drone-1".to_string(), "drone-2".to_string()],
        };
        (queue.clone(), DispatchMonitor::new(queue, identity, config))
    }

    async fn wait_for(ring: &EventRing, predicate: impl Fn(&MonitorEvent) -> bool) -> bool {
        for _ in 0..200 {
            if ring.recent(None).iter().any(|stored| predicate(&stored.event)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_queen_sees_task_lifecycle() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let (queue, monitor) = monitor(
            store,
            AgentIdentity::new(AgentRole::Queen, "queen"),
            Duration::from_millis(20),
        );
        monitor.start().await;

        let manager = TaskManager::new();
        let task = make_task(&manager, "drone-1");
        queue.submit(&task).await.unwrap();

        let ring = monitor.ring();
        assert!(
            wait_for(&ring, |e| matches!(
                e,
                MonitorEvent::DroneStatus { drone, queued: 1, completed_count: 0, .. } if drone == "drone-1"
            ))
            .await
        );

        queue.claim("drone-1").await.unwrap();
        queue
            .finish("drone-1", TaskOutcome::Completed { result: Some("done".to_string()) })
            .await
            .unwrap();
        assert_eq!(queue.completed_len("drone-1").await.unwrap(), 1);

        let task_id = task.id.clone();
        assert!(
            wait_for(&ring, |e| matches!(
                e,
                MonitorEvent::TaskCompleted { drone, task, .. } if drone == "drone-1" && *task == task_id
            ))
            .await
        );

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_worker_ignores_other_drones_tasks() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let (queue, monitor) = monitor(
            store,
            AgentIdentity::new(AgentRole::Worker, "drone-1"),
            Duration::from_secs(3600),
        );
        monitor.start().await;

        let manager = TaskManager::new();
        queue.submit(&make_task(&manager, "drone-2")).await.unwrap();
        let mine = make_task(&manager, "drone-1");
        queue.submit(&mine).await.unwrap();

        let ring = monitor.ring();
        assert!(wait_for(&ring, |e| matches!(e, MonitorEvent::TaskQueued { drone, .. } if drone == "drone-1")).await);
        assert!(!ring
            .recent(None)
            .iter()
            .any(|stored| stored.event.drone() == Some("drone-2")));

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_poll_only_when_subscribe_fails() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::without_pubsub());
        let (queue, monitor) = monitor(
            store,
            AgentIdentity::new(AgentRole::Worker, "drone-1"),
            Duration::from_millis(20),
        );
        monitor.start().await;
        assert!(monitor.is_running());

        let manager = TaskManager::new();
        queue.submit(&make_task(&manager, "drone-1")).await.unwrap();

        let ring = monitor.ring();
        assert!(
            wait_for(&ring, |e| matches!(
                e,
                MonitorEvent::NewTaskAvailable { drone, queued: 1 } if drone == "drone-1"
            ))
            .await
        );
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_worker_poll_is_quiet_while_busy() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let (queue, monitor) = monitor(
            store,
            AgentIdentity::new(AgentRole::Worker, "drone-1"),
            Duration::from_secs(3600),
        );
        let manager = TaskManager::new();
        queue.submit(&make_task(&manager, "drone-1")).await.unwrap();
        queue.submit(&make_task(&manager, "drone-1")).await.unwrap();
        queue.claim("drone-1").await.unwrap();

        assert!(monitor.poll_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let (_, monitor) = monitor(
            store,
            AgentIdentity::new(AgentRole::Queen, "queen"),
            Duration::from_secs(3600),
        );
        monitor.stop().await;
        monitor.start().await;
        monitor.start().await;
        assert!(monitor.is_running());
        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_malformed_payload_becomes_raw() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let (queue, monitor) = monitor(
            store.clone(),
            AgentIdentity::new(AgentRole::Queen, "queen"),
            Duration::from_secs(3600),
        );
        monitor.start().await;
        store
            .publish(&queue.keys().events_channel(), "{not json")
            .await
            .unwrap();

        let ring = monitor.ring();
        assert!(wait_for(&ring, |e| matches!(e, MonitorEvent::Raw { payload, .. } if payload == "{not json")).await);
        monitor.stop().await;
    }
}
