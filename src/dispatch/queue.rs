use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use super::store::{SharedStore, StreamEntry};
use super::{DispatchError, StoreKeys, LOG_STREAM_MAX_LEN};
use crate::task::{Task, TaskEvent};

/// Snapshot of one drone's lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroneStatus {
    pub drone: String,
    pub queued: usize,
    pub active: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { result: Option<String> },
    Failed { error: String },
}

/// Store-level view of the per-drone queues. The queen submits through it;
/// drone runtimes claim and finish through it.
pub struct TaskQueue {
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn SharedStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    pub fn store(&self) -> Arc<dyn SharedStore> {
        Arc::clone(&self.store)
    }

    /// Enqueues `task` for `task.agent_id` and notifies the tasks channel.
    /// Tasks submitted while one is active wait their turn behind it. Once the
    /// push succeeds the task is queued; a lost notification is only logged
    /// since pollers pick the task up anyway.
    pub async fn submit(&self, task: &Task) -> Result<usize, DispatchError> {
        let drone = task.agent_id.as_str();
        let payload = serde_json::to_string(task)?;
        let queued = self.store.lpush(&self.keys.queue(drone), &payload).await?;

        let notification = json!({
            "type": "task_queued",
            "drone": drone,
            "task": task.id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self
            .store
            .publish(&self.keys.tasks_channel(), &notification.to_string())
            .await
        {
            tracing::warn!("Queued task {} but could not notify {}: {}", task.id, drone, e);
        }

        tracing::info!("Queued task {} for {} ({} waiting)", task.id, drone, queued);
        Ok(queued)
    }

    pub async fn queue_len(&self, drone: &str) -> Result<usize, DispatchError> {
        Ok(self.store.llen(&self.keys.queue(drone)).await?)
    }

    pub async fn active_len(&self, drone: &str) -> Result<usize, DispatchError> {
        Ok(self.store.llen(&self.keys.active(drone)).await?)
    }

    pub async fn completed_len(&self, drone: &str) -> Result<usize, DispatchError> {
        Ok(self.store.llen(&self.keys.completed(drone)).await?)
    }

    pub async fn failed_len(&self, drone: &str) -> Result<usize, DispatchError> {
        Ok(self.store.llen(&self.keys.failed(drone)).await?)
    }

    async fn peek(&self, key: &str, index: i64) -> Result<Option<Task>, DispatchError> {
        match self.store.lrange(key, index, index).await?.into_iter().next() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// The task a claim would take next.
    pub async fn peek_next(&self, drone: &str) -> Result<Option<Task>, DispatchError> {
        self.peek(&self.keys.queue(drone), -1).await
    }

    pub async fn peek_active(&self, drone: &str) -> Result<Option<Task>, DispatchError> {
        self.peek(&self.keys.active(drone), 0).await
    }

    /// Moves the queue head into the active list, but only while the active
    /// list is empty.
    pub async fn claim(&self, drone: &str) -> Result<Option<Task>, DispatchError> {
        if self.active_len(drone).await? > 0 {
            return Err(DispatchError::Busy {
                drone: drone.to_string(),
            });
        }
        let moved = self
            .store
            .rpoplpush(&self.keys.queue(drone), &self.keys.active(drone))
            .await?;
        let Some(raw) = moved else {
            return Ok(None);
        };
        let task: Task = serde_json::from_str(&raw)?;
        self.publish_event("task_started", drone, &task.id, None).await;
        tracing::info!("{} claimed task {}", drone, task.id);
        Ok(Some(task))
    }

    /// Closes out the active task into the completed or failed list.
    pub async fn finish(&self, drone: &str, outcome: TaskOutcome) -> Result<Option<Task>, DispatchError> {
        let Some(raw) = self.store.rpop(&self.keys.active(drone)).await? else {
            return Ok(None);
        };
        let task: Task = serde_json::from_str(&raw)?;

        let (list, kind, message) = match &outcome {
            TaskOutcome::Completed { result } => (self.keys.completed(drone), "task_completed", result.clone()),
            TaskOutcome::Failed { error } => (self.keys.failed(drone), "task_failed", Some(error.clone())),
        };
        self.store.lpush(&list, &raw).await?;
        self.publish_event(kind, drone, &task.id, message).await;
        tracing::info!("{} finished task {} ({})", drone, task.id, kind);
        Ok(Some(task))
    }

    /// Announces a list move that already happened; failures are only logged.
    async fn publish_event(&self, kind: &str, drone: &str, task_id: &str, message: Option<String>) {
        let mut event = json!({
            "type": kind,
            "drone": drone,
            "task": task_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(message) = message {
            event["message"] = json!(message);
        }
        if let Err(e) = self
            .store
            .publish(&self.keys.events_channel(), &event.to_string())
            .await
        {
            tracing::warn!("Could not publish {} for {}: {}", kind, drone, e);
        }
    }

    /// Forwards a task lifecycle event to the queen's events channel.
    pub async fn publish_task_event(&self, event: &TaskEvent) -> Result<usize, DispatchError> {
        let payload = serde_json::to_string(event)?;
        Ok(self
            .store
            .publish(&self.keys.events_channel(), &payload)
            .await?)
    }

    pub async fn broadcast(&self, from: &str, message: &str) -> Result<usize, DispatchError> {
        let payload = json!({
            "type": "broadcast",
            "from": from,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });
        Ok(self
            .store
            .publish(&self.keys.broadcast_channel(), &payload.to_string())
            .await?)
    }

    pub async fn append_log(&self, drone: &str, level: &str, message: &str) -> Result<String, DispatchError> {
        let mut fields = BTreeMap::new();
        fields.insert("level".to_string(), level.to_string());
        fields.insert("message".to_string(), message.to_string());
        fields.insert("timestamp".to_string(), Utc::now().to_rfc3339());
        Ok(self
            .store
            .xadd(&self.keys.logs(drone), fields, LOG_STREAM_MAX_LEN)
            .await?)
    }

    pub async fn recent_logs(&self, drone: &str, count: usize) -> Result<Vec<StreamEntry>, DispatchError> {
        Ok(self.store.xrevrange(&self.keys.logs(drone), count).await?)
    }

    pub async fn drone_status(&self, drone: &str) -> Result<DroneStatus, DispatchError> {
        Ok(DroneStatus {
            drone: drone.to_string(),
            queued: self.queue_len(drone).await?,
            active: self.active_len(drone).await?,
            completed_count: self.completed_len(drone).await?,
            failed_count: self.failed_len(drone).await?,
            current_task: self.peek_active(drone).await?.map(|t| t.id),
        })
    }

    pub async fn fleet_status(&self, drones: &[String]) -> Result<Vec<DroneStatus>, DispatchError> {
        let mut statuses = Vec::with_capacity(drones.len());
        for drone in drones {
            statuses.push(self.drone_status(drone).await?);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemoryStore;
    use crate::task::{CreateStepRequest, CreateTaskRequest, TaskManager};
    use futures::StreamExt;

    fn make_task(manager: &TaskManager, drone: &str, title: &str) -> Task {
        manager
            .create(CreateTaskRequest {
                agent_id: drone.to_string(),
                title: title.to_string(),
                steps: vec![CreateStepRequest {
                    action: "implement".to_string(),
                    dod: vec!["tests pass".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            })
            .unwrap()
    }

    fn queue() -> (TaskQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (TaskQueue::new(store.clone(), StoreKeys::default()), store)
    }

    #[tokio::test]
    async fn test_second_task_waits_behind_active() {
        let (queue, _) = queue();
        let manager = TaskManager::new();
        let first = make_task(&manager, "drone-1", "first");
        let second = make_task(&manager, "drone-1", "second");

        queue.submit(&first).await.unwrap();
        assert_eq!(queue.claim("drone-1").await.unwrap().unwrap().id, first.id);

        queue.submit(&second).await.unwrap();
        assert_eq!(queue.queue_len("drone-1").await.unwrap(), 1);
        assert_eq!(queue.active_len("drone-1").await.unwrap(), 1);
        assert_eq!(queue.peek_active("drone-1").await.unwrap().unwrap().id, first.id);
        assert!(matches!(
            queue.claim("drone-1").await,
            Err(DispatchError::Busy { .. })
        ));

        queue
            .finish("drone-1", TaskOutcome::Completed { result: None })
            .await
            .unwrap();
        assert_eq!(queue.claim("drone-1").await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let (queue, _) = queue();
        let manager = TaskManager::new();
        let a = make_task(&manager, "drone-1", "a");
        let b = make_task(&manager, "drone-1", "b");
        queue.submit(&a).await.unwrap();
        queue.submit(&b).await.unwrap();

        assert_eq!(queue.peek_next("drone-1").await.unwrap().unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_finish_failed_and_status() {
        let (queue, _) = queue();
        let manager = TaskManager::new();
        let task = make_task(&manager, "drone-2", "doomed");
        queue.submit(&task).await.unwrap();
        queue.claim("drone-2").await.unwrap();

        let status = queue.drone_status("drone-2").await.unwrap();
        assert_eq!(status.active, 1);
        assert_eq!(status.current_task.as_deref(), Some(task.id.as_str()));

        queue
            .finish(
                "drone-2",
                TaskOutcome::Failed {
                    error: "build broke".to_string(),
                },
            )
            .await
            .unwrap();
        let status = queue.drone_status("drone-2").await.unwrap();
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.active, 0);
        assert_eq!(status.current_task, None);
        assert!(queue
            .finish("drone-2", TaskOutcome::Completed { result: None })
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_submit_notifies_tasks_channel() {
        let (queue, store) = queue();
        let mut sub = store
            .subscribe(&[queue.keys().tasks_channel()])
            .await
            .unwrap();
        let manager = TaskManager::new();
        let task = make_task(&manager, "drone-1", "notify");
        queue.submit(&task).await.unwrap();

        let message = sub.next().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(value["type"], "task_queued");
        assert_eq!(value["drone"], "drone-1");
        assert_eq!(value["task"], task.id.as_str());
    }

    #[tokio::test]
    async fn test_submit_survives_lost_notification() {
        let queue = TaskQueue::new(Arc::new(MemoryStore::without_pubsub()), StoreKeys::default());
        let manager = TaskManager::new();
        let task = make_task(&manager, "drone-1", "unannounced");

        assert_eq!(queue.submit(&task).await.unwrap(), 1);
        assert_eq!(queue.peek_next("drone-1").await.unwrap().unwrap().id, task.id);

        assert_eq!(queue.claim("drone-1").await.unwrap().unwrap().id, task.id);
        queue
            .finish("drone-1", TaskOutcome::Completed { result: None })
            .await
            .unwrap();
        assert_eq!(queue.completed_len("drone-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_task_events_reach_events_channel() {
        let (queue, store) = queue();
        let mut sub = store
            .subscribe(&[queue.keys().events_channel()])
            .await
            .unwrap();
        let manager = TaskManager::new();
        let mut events = manager.subscribe();
        let task = make_task(&manager, "drone-3", "relay");

        let event = events.recv().await.unwrap();
        queue.publish_task_event(&event).await.unwrap();

        let message = sub.next().await.unwrap();
        let (decoded, _) = crate::dispatch::MonitorEvent::decode(
            &message.channel,
            &message.payload,
            &queue.keys().broadcast_channel(),
        );
        assert_eq!(
            decoded,
            crate::dispatch::MonitorEvent::TaskQueued {
                drone: "drone-3".to_string(),
                task: task.id,
            }
        );
    }

    #[tokio::test]
    async fn test_logs_are_capped() {
        let (queue, _) = queue();
        for i in 0..(LOG_STREAM_MAX_LEN + 20) {
            queue.append_log("drone-1", "info", &format!("line {}", i)).await.unwrap();
        }
        let store = queue.store();
        assert_eq!(store.xlen(&queue.keys().logs("drone-1")).await.unwrap(), LOG_STREAM_MAX_LEN);
        let recent = queue.recent_logs("drone-1", 1).await.unwrap();
        assert_eq!(recent[0].fields["message"], format!("line {}", LOG_STREAM_MAX_LEN + 19));
    }
}
