use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{Artifact, Step, StepStatus, Task, TaskError, TaskStatus, UpdateStepRequest};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Task {task} cannot move from {from:?} to {to:?}")]
    Task {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("Step {step} cannot move from {from:?} to {to:?}")]
    Step {
        step: usize,
        from: StepStatus,
        to: StepStatus,
    },
    #[error("Task {task} is {status:?} and accepts no further changes")]
    Terminal { task: String, status: TaskStatus },
    #[error("Task {task} has not started")]
    NotStarted { task: String },
    #[error("Task {task} has unfinished steps: {steps:?}")]
    IncompleteSteps { task: String, steps: Vec<usize> },
}

pub fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (_, Failed)
            | (_, Cancelled)
            | (Pending, Assigned)
            | (Assigned, InProgress)
            | (InProgress, Waiting)
            | (InProgress, Completed)
            | (Waiting, InProgress)
    )
}

/// Pending steps may also be skipped outright, before anyone starts them.
pub fn step_transition_allowed(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;

    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Skipped)
            | (InProgress, Waiting)
            | (InProgress, Blocked)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Skipped)
            | (Waiting, InProgress)
            | (Blocked, InProgress)
    )
}

impl Step {
    pub fn transition(&mut self, to: StepStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !step_transition_allowed(self.status, to) {
            return Err(TransitionError::Step {
                step: self.id,
                from: self.status,
                to,
            });
        }
        match to {
            StepStatus::InProgress if self.started_at.is_none() => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = to;
        Ok(())
    }
}

impl Task {
    fn ensure_open(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                task: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Status changes go through the lifecycle operations below, which keep
    /// steps and task in step. Completion is refused while any step other
    /// than an in-progress current one is still open.
    fn transition(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if to == TaskStatus::Completed {
            let unfinished = self.unfinished_steps();
            if !unfinished.is_empty() {
                return Err(TransitionError::IncompleteSteps {
                    task: self.id.clone(),
                    steps: unfinished,
                });
            }
        }
        if !task_transition_allowed(self.status, to) {
            return Err(TransitionError::Task {
                task: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn unfinished_steps(&self) -> Vec<usize> {
        let current = self.current_step;
        self.plan
            .steps
            .iter()
            .filter(|s| !s.status.is_done())
            .filter(|s| !(s.id == current && s.status == StepStatus::InProgress))
            .map(|s| s.id)
            .collect()
    }

    pub fn assign(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Assigned)
    }

    /// Moves an assigned task into progress and opens its first step.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::InProgress)?;
        self.started_at = Some(now);
        if let Some(first) = self.plan.steps.first_mut() {
            first.transition(StepStatus::InProgress, now)?;
            self.current_step = 1;
        }
        Ok(())
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.current_step
            .checked_sub(1)
            .and_then(|idx| self.plan.steps.get(idx))
    }

    fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.current_step
            .checked_sub(1)
            .and_then(|idx| self.plan.steps.get_mut(idx))
    }

    pub fn update_step(
        &mut self,
        step_id: usize,
        req: &UpdateStepRequest,
        now: DateTime<Utc>,
    ) -> Result<Step, TaskError> {
        self.ensure_open()?;
        if self.status != TaskStatus::InProgress && self.status != TaskStatus::Waiting {
            return Err(TransitionError::NotStarted {
                task: self.id.clone(),
            }
            .into());
        }
        if step_id == 0 || step_id > self.plan.steps.len() {
            return Err(TaskError::InvalidStep(step_id));
        }

        let step = &mut self.plan.steps[step_id - 1];
        if step.status != req.status {
            step.transition(req.status, now)?;
        }
        if req.result.is_some() {
            step.result = req.result.clone();
        }
        if req.error.is_some() {
            step.error = req.error.clone();
        }
        let updated = step.clone();

        let is_current = step_id == self.current_step;
        match req.status {
            StepStatus::Waiting | StepStatus::Blocked if is_current => {
                if self.status == TaskStatus::InProgress {
                    self.transition(TaskStatus::Waiting)?;
                }
            }
            StepStatus::InProgress => {
                if self.status == TaskStatus::Waiting {
                    self.transition(TaskStatus::InProgress)?;
                }
            }
            StepStatus::Completed | StepStatus::Skipped if is_current => {
                self.advance(now)?;
            }
            _ => {}
        }

        Ok(updated)
    }

    // current_step never decreases: it only moves to the next step still open.
    fn advance(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let next = self
            .plan
            .steps
            .iter()
            .position(|s| s.id > self.current_step && !s.status.is_done());
        if let Some(idx) = next {
            if self.plan.steps[idx].status == StepStatus::Pending {
                self.plan.steps[idx].transition(StepStatus::InProgress, now)?;
            }
            self.current_step = idx + 1;
            if self.status == TaskStatus::Waiting {
                self.transition(TaskStatus::InProgress)?;
            }
        }
        Ok(())
    }

    /// Completes the task. The current step is closed if still in progress;
    /// every other step must already be completed or skipped.
    pub fn complete(
        &mut self,
        result: Option<String>,
        artifacts: Vec<Artifact>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Completed)?;

        if let Some(step) = self.current_step_mut() {
            if step.status == StepStatus::InProgress {
                step.transition(StepStatus::Completed, now)?;
            }
        }
        self.result = result;
        self.artifacts.extend(artifacts);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let error = error.into();
        self.transition(TaskStatus::Failed)?;
        if let Some(step) = self.current_step_mut() {
            if step.status == StepStatus::InProgress {
                step.transition(StepStatus::Failed, now)?;
                step.error = Some(error.clone());
            }
        }
        self.error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Cancelled)?;
        self.error = Some(reason.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn add_artifact(&mut self, artifact: Artifact) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.artifacts.push(artifact);
        Ok(())
    }

    /// Percentage of steps completed or skipped.
    pub fn progress(&self) -> u8 {
        let total = self.plan.steps.len();
        if total == 0 {
            return 0;
        }
        let done = self.plan.steps.iter().filter(|s| s.status.is_done()).count();
        ((done * 100) / total) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ArtifactType, AutonomyLevel, Plan};

    fn make_step(id: usize) -> Step {
        Step {
            id,
            action: format!("step {}", id),
            description: String::new(),
            dod: vec!["done".to_string()],
            autonomy: AutonomyLevel::Full,
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn make_task(steps: usize) -> Task {
        let now = Utc::now();
        Task {
            id: "task-1".to_string(),
            agent_id: "drone-1".to_string(),
            agent_name: None,
            plan: Plan {
                id: "plan-1".to_string(),
                title: "Test plan".to_string(),
                description: String::new(),
                context: String::new(),
                steps: (1..=steps).map(make_step).collect(),
                required_ports: vec![],
                on_blocker: None,
                on_ambiguity: None,
                on_complete: None,
                created_at: now,
                created_by: "queen".to_string(),
            },
            status: TaskStatus::Pending,
            current_step: 0,
            result: None,
            error: None,
            artifacts: vec![],
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn started_task(steps: usize) -> Task {
        let mut task = make_task(steps);
        task.assign().unwrap();
        task.start(Utc::now()).unwrap();
        task
    }

    fn update(status: StepStatus) -> UpdateStepRequest {
        UpdateStepRequest {
            status,
            result: None,
            error: None,
        }
    }

    #[test]
    fn test_start_opens_first_step() {
        let task = started_task(2);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.current_step, 1);
        assert_eq!(task.plan.steps[0].status, StepStatus::InProgress);
        assert!(task.started_at.is_some());
    }

    #[test]
    fn test_pending_task_cannot_start() {
        let mut task = make_task(1);
        let err = task.start(Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::Task { .. }));
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let now = Utc::now();
        let mut completed = started_task(1);
        completed.complete(None, vec![], now).unwrap();

        let mut failed = started_task(1);
        failed.fail("boom", now).unwrap();

        let mut cancelled = make_task(1);
        cancelled.cancel("no longer needed", now).unwrap();

        for task in [&mut completed, &mut failed, &mut cancelled] {
            let status = task.status;
            for to in [
                TaskStatus::Pending,
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::Waiting,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(task.transition(to).is_err(), "{:?} -> {:?} accepted", status, to);
            }
            assert!(task.fail("again", now).is_err());
            assert!(task.cancel("again", now).is_err());
            assert!(task.complete(None, vec![], now).is_err());
            assert!(task.update_step(1, &update(StepStatus::InProgress), now).is_err());
            assert_eq!(task.status, status);
        }
    }

    #[test]
    fn test_completed_status_needs_finished_steps() {
        let mut task = started_task(3);
        let err = task.transition(TaskStatus::Completed).unwrap_err();
        assert!(matches!(err, TransitionError::IncompleteSteps { ref steps, .. } if *steps == vec![2, 3]));
        assert_eq!(task.status, TaskStatus::InProgress);
        let statuses: Vec<StepStatus> = task.plan.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::InProgress, StepStatus::Pending, StepStatus::Pending]
        );
    }

    #[test]
    fn test_complete_requires_all_steps_done() {
        let now = Utc::now();
        let mut task = started_task(3);
        let err = task.complete(None, vec![], now).unwrap_err();
        assert_eq!(
            err,
            TransitionError::IncompleteSteps {
                task: "task-1".to_string(),
                steps: vec![2, 3],
            }
        );
        assert_eq!(task.status, TaskStatus::InProgress);

        task.update_step(1, &update(StepStatus::Completed), now).unwrap();
        task.update_step(2, &update(StepStatus::Skipped), now).unwrap();
        task.complete(Some("shipped".to_string()), vec![], now).unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.plan.steps[2].status, StepStatus::Completed);
        assert_eq!(task.progress(), 100);
    }

    #[test]
    fn test_completing_step_advances_current_step() {
        let now = Utc::now();
        let mut task = started_task(3);
        task.update_step(1, &update(StepStatus::Completed), now).unwrap();
        assert_eq!(task.current_step, 2);
        assert_eq!(task.plan.steps[1].status, StepStatus::InProgress);
        assert_eq!(task.progress(), 33);
    }

    #[test]
    fn test_current_step_never_moves_backwards() {
        let now = Utc::now();
        let mut task = started_task(3);
        task.update_step(3, &update(StepStatus::Skipped), now).unwrap();
        task.update_step(1, &update(StepStatus::Completed), now).unwrap();
        assert_eq!(task.current_step, 2);

        task.update_step(2, &update(StepStatus::Completed), now).unwrap();
        // Nothing left to open, so the pointer stays on the last step worked.
        assert_eq!(task.current_step, 2);
    }

    #[test]
    fn test_blocked_step_puts_task_waiting() {
        let now = Utc::now();
        let mut task = started_task(2);
        task.update_step(1, &update(StepStatus::Blocked), now).unwrap();
        assert_eq!(task.status, TaskStatus::Waiting);

        task.update_step(1, &update(StepStatus::InProgress), now).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_invalid_step_transition_rejected() {
        let now = Utc::now();
        let mut task = started_task(2);
        let err = task.update_step(2, &update(StepStatus::Completed), now).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Transition(TransitionError::Step {
                step: 2,
                from: StepStatus::Pending,
                to: StepStatus::Completed
            })
        ));
        assert!(matches!(
            task.update_step(7, &update(StepStatus::Completed), now),
            Err(TaskError::InvalidStep(7))
        ));
    }

    #[test]
    fn test_fail_from_any_open_state() {
        let now = Utc::now();
        let mut pending = make_task(1);
        pending.fail("no drone", now).unwrap();
        assert_eq!(pending.status, TaskStatus::Failed);

        let mut running = started_task(2);
        running.fail("tests broke", now).unwrap();
        assert_eq!(running.plan.steps[0].status, StepStatus::Failed);
        assert_eq!(running.plan.steps[0].error.as_deref(), Some("tests broke"));
    }

    #[test]
    fn test_artifacts_are_append_only() {
        let now = Utc::now();
        let mut task = started_task(1);
        task.add_artifact(Artifact {
            kind: ArtifactType::File,
            name: "notes.md".to_string(),
            url: None,
            path: Some("docs/notes.md".to_string()),
        })
        .unwrap();
        task.complete(
            None,
            vec![Artifact {
                kind: ArtifactType::Mr,
                name: "!42".to_string(),
                url: Some("https://git.example.com/mr/42".to_string()),
                path: None,
            }],
            now,
        )
        .unwrap();
        assert_eq!(task.artifacts.len(), 2);
        assert_eq!(task.artifacts[0].name, "notes.md");
    }
}
