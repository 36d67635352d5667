use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    Artifact, CreateTaskRequest, Plan, Step, StepStatus, Task, TaskError, TaskEvent, TaskEventType,
    TaskStatus, UpdateStepRequest,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Task>,
    by_agent: HashMap<String, Vec<String>>,
}

/// In-memory task registry. Applies the task state machine and fans every
/// change out as a `TaskEvent`.
pub struct TaskManager {
    registry: RwLock<Registry>,
    events: broadcast::Sender<TaskEvent>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: RwLock::new(Registry::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: TaskEventType, task: &Task, step: Option<Step>, message: Option<String>) {
        let event = TaskEvent {
            kind,
            task: Some(task.clone()),
            step,
            progress: Some(task.progress()),
            message,
            timestamp: Utc::now(),
        };
        // No receivers is fine; nobody is watching yet.
        let _ = self.events.send(event);
    }

    pub fn create(&self, req: CreateTaskRequest) -> Result<Task, TaskError> {
        if req.agent_id.trim().is_empty() {
            return Err(TaskError::InvalidRequest("agent_id is required".to_string()));
        }
        if req.title.trim().is_empty() {
            return Err(TaskError::InvalidRequest("title is required".to_string()));
        }
        if req.steps.is_empty() {
            return Err(TaskError::InvalidRequest(
                "at least one step is required".to_string(),
            ));
        }

        let mut steps = Vec::with_capacity(req.steps.len());
        for (idx, s) in req.steps.into_iter().enumerate() {
            let id = idx + 1;
            if s.action.trim().is_empty() {
                return Err(TaskError::InvalidRequest(format!(
                    "step {}: action is required",
                    id
                )));
            }
            if s.dod.is_empty() {
                return Err(TaskError::InvalidRequest(format!(
                    "step {}: at least one DoD item is required",
                    id
                )));
            }
            steps.push(Step {
                id,
                action: s.action,
                description: s.description,
                dod: s.dod,
                autonomy: s.autonomy.unwrap_or_default(),
                status: StepStatus::Pending,
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
            });
        }

        let now = Utc::now();
        let mut task = Task {
            id: Uuid::new_v4().to_string(),
            agent_id: req.agent_id,
            agent_name: req.agent_name,
            plan: Plan {
                id: Uuid::new_v4().to_string(),
                title: req.title,
                description: req.description,
                context: req.context,
                steps,
                required_ports: req.required_ports,
                on_blocker: req.on_blocker,
                on_ambiguity: req.on_ambiguity,
                on_complete: req.on_complete,
                created_at: now,
                created_by: "queen".to_string(),
            },
            status: TaskStatus::Pending,
            current_step: 0,
            result: None,
            error: None,
            artifacts: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        task.assign()?;

        {
            let mut registry = self.registry.write();
            registry
                .by_agent
                .entry(task.agent_id.clone())
                .or_default()
                .push(task.id.clone());
            registry.tasks.insert(task.id.clone(), task.clone());
        }

        tracing::info!(
            "Created task {} for {} ({} steps)",
            task.id,
            task.agent_id,
            task.plan.steps.len()
        );
        self.emit(TaskEventType::Created, &task, None, None);
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Result<Task, TaskError> {
        self.registry
            .read()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    /// All tasks, oldest first, optionally narrowed by agent and status.
    pub fn list(&self, agent_id: Option<&str>, status: Option<TaskStatus>) -> Vec<Task> {
        let registry = self.registry.read();
        let mut tasks: Vec<Task> = registry
            .tasks
            .values()
            .filter(|t| agent_id.map_or(true, |a| t.agent_id == a))
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Most recently created task for the agent that is still open.
    pub fn active_for_agent(&self, agent_id: &str) -> Option<Task> {
        let registry = self.registry.read();
        registry
            .by_agent
            .get(agent_id)?
            .iter()
            .rev()
            .filter_map(|id| registry.tasks.get(id))
            .find(|t| !t.status.is_terminal())
            .cloned()
    }

    pub fn tasks_for_agent(&self, agent_id: &str) -> Vec<Task> {
        let registry = self.registry.read();
        registry
            .by_agent
            .get(agent_id)
            .map(|ids| ids.iter().filter_map(|id| registry.tasks.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    fn with_task<T>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> Result<T, TaskError>,
    ) -> Result<(T, Task), TaskError> {
        let mut registry = self.registry.write();
        let task = registry
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        let out = f(task)?;
        Ok((out, task.clone()))
    }

    pub fn start(&self, task_id: &str) -> Result<Task, TaskError> {
        let ((), task) = self.with_task(task_id, |t| Ok(t.start(Utc::now())?))?;
        tracing::info!("Task {} started by {}", task.id, task.agent_id);
        self.emit(TaskEventType::Started, &task, None, None);
        Ok(task)
    }

    pub fn update_step(
        &self,
        task_id: &str,
        step_id: usize,
        req: UpdateStepRequest,
    ) -> Result<Task, TaskError> {
        let (step, task) = self.with_task(task_id, |t| t.update_step(step_id, &req, Utc::now()))?;
        tracing::debug!(
            "Task {} step {} -> {:?} ({}%)",
            task.id,
            step.id,
            step.status,
            task.progress()
        );
        self.emit(TaskEventType::Progress, &task, Some(step), None);
        Ok(task)
    }

    pub fn complete(
        &self,
        task_id: &str,
        result: Option<String>,
        artifacts: Vec<Artifact>,
    ) -> Result<Task, TaskError> {
        let ((), task) =
            self.with_task(task_id, |t| Ok(t.complete(result, artifacts, Utc::now())?))?;
        tracing::info!("Task {} completed", task.id);
        self.emit(TaskEventType::Completed, &task, None, task.result.clone());
        Ok(task)
    }

    pub fn fail(&self, task_id: &str, error: &str) -> Result<Task, TaskError> {
        let ((), task) = self.with_task(task_id, |t| Ok(t.fail(error, Utc::now())?))?;
        tracing::warn!("Task {} failed: {}", task.id, error);
        self.emit(TaskEventType::Failed, &task, None, Some(error.to_string()));
        Ok(task)
    }

    pub fn cancel(&self, task_id: &str, reason: &str) -> Result<Task, TaskError> {
        let ((), task) = self.with_task(task_id, |t| Ok(t.cancel(reason, Utc::now())?))?;
        tracing::info!("Task {} cancelled: {}", task.id, reason);
        self.emit(TaskEventType::Cancelled, &task, None, Some(reason.to_string()));
        Ok(task)
    }

    /// Cancels every open task for the agent and returns how many were cancelled.
    pub fn cancel_all_for_agent(&self, agent_id: &str, reason: &str) -> usize {
        let open: Vec<String> = self
            .tasks_for_agent(agent_id)
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();

        open.iter()
            .filter(|id| self.cancel(id, reason).is_ok())
            .count()
    }

    pub fn delete(&self, task_id: &str) -> Result<(), TaskError> {
        let mut registry = self.registry.write();
        let task = registry
            .tasks
            .remove(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if let Some(ids) = registry.by_agent.get_mut(&task.agent_id) {
            ids.retain(|id| id != task_id);
            if ids.is_empty() {
                registry.by_agent.remove(&task.agent_id);
            }
        }
        Ok(())
    }

    pub fn current_step(&self, task_id: &str) -> Result<Step, TaskError> {
        let task = self.get(task_id)?;
        task.current_step()
            .cloned()
            .ok_or_else(|| TaskError::NoCurrentStep(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AutonomyLevel, CreateStepRequest};

    fn request(agent: &str, steps: usize) -> CreateTaskRequest {
        CreateTaskRequest {
            agent_id: agent.to_string(),
            title: "Add login page".to_string(),
            steps: (1..=steps)
                .map(|i| CreateStepRequest {
                    action: format!("action {}", i),
                    dod: vec!["tests pass".to_string()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn step_update(status: StepStatus) -> UpdateStepRequest {
        UpdateStepRequest {
            status,
            result: None,
            error: None,
        }
    }

    #[test]
    fn test_create_validates_request() {
        let manager = TaskManager::new();

        let mut req = request("drone-1", 1);
        req.agent_id.clear();
        assert!(matches!(manager.create(req), Err(TaskError::InvalidRequest(_))));

        assert!(matches!(
            manager.create(request("drone-1", 0)),
            Err(TaskError::InvalidRequest(_))
        ));

        let mut req = request("drone-1", 2);
        req.steps[1].dod.clear();
        let err = manager.create(req).unwrap_err();
        assert!(err.to_string().contains("step 2"));
    }

    #[test]
    fn test_create_assigns_and_defaults_autonomy() {
        let manager = TaskManager::new();
        let task = manager.create(request("drone-1", 2)).unwrap();

        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.current_step, 0);
        assert_eq!(task.plan.steps[0].id, 1);
        assert_eq!(task.plan.steps[1].autonomy, AutonomyLevel::AskIfUnclear);
        assert_eq!(task.plan.created_by, "queen");
    }

    #[test]
    fn test_full_lifecycle_emits_events() {
        let manager = TaskManager::new();
        let mut rx = manager.subscribe();

        let task = manager.create(request("drone-1", 2)).unwrap();
        manager.start(&task.id).unwrap();
        manager
            .update_step(&task.id, 1, step_update(StepStatus::Completed))
            .unwrap();
        let done = manager
            .complete(&task.id, Some("merged".to_string()), vec![])
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let kinds: Vec<TaskEventType> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TaskEventType::Created,
                TaskEventType::Started,
                TaskEventType::Progress,
                TaskEventType::Completed,
            ]
        );
    }

    #[test]
    fn test_active_for_agent_skips_terminal() {
        let manager = TaskManager::new();
        let first = manager.create(request("drone-1", 1)).unwrap();
        let second = manager.create(request("drone-1", 1)).unwrap();

        assert_eq!(manager.active_for_agent("drone-1").unwrap().id, second.id);
        manager.fail(&second.id, "crashed").unwrap();
        assert_eq!(manager.active_for_agent("drone-1").unwrap().id, first.id);
        assert!(manager.active_for_agent("drone-2").is_none());
    }

    #[test]
    fn test_cancel_all_for_agent() {
        let manager = TaskManager::new();
        manager.create(request("drone-1", 1)).unwrap();
        let done = manager.create(request("drone-1", 1)).unwrap();
        manager.start(&done.id).unwrap();
        manager.complete(&done.id, None, vec![]).unwrap();
        manager.create(request("drone-2", 1)).unwrap();

        assert_eq!(manager.cancel_all_for_agent("drone-1", "shutdown"), 1);
        assert_eq!(
            manager.list(Some("drone-1"), Some(TaskStatus::Cancelled)).len(),
            1
        );
        assert_eq!(manager.list(Some("drone-2"), None)[0].status, TaskStatus::Assigned);
    }

    #[test]
    fn test_delete_and_current_step() {
        let manager = TaskManager::new();
        let task = manager.create(request("drone-1", 2)).unwrap();
        assert!(matches!(
            manager.current_step(&task.id),
            Err(TaskError::NoCurrentStep(_))
        ));
        manager.start(&task.id).unwrap();
        assert_eq!(manager.current_step(&task.id).unwrap().id, 1);

        manager.delete(&task.id).unwrap();
        assert!(matches!(manager.get(&task.id), Err(TaskError::NotFound(_))));
        assert!(manager.tasks_for_agent("drone-1").is_empty());
    }
}
