use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::SupervisorError;

/// How a supervised process is relaunched after it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Relaunches allowed before giving up. The counter resets once a run
    /// outlives `stable_after`.
    pub max_restarts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub stable_after: Duration,
    /// Treat exit code 0 as a crash too.
    pub restart_on_clean_exit: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stable_after: Duration::from_secs(60),
            restart_on_clean_exit: false,
        }
    }
}

impl RestartPolicy {
    /// Exponential backoff for the given zero-based attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Clean,
    /// Non-zero exit code, or `None` when killed by a signal.
    Crashed(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// The process exited cleanly and the policy does not restart clean exits.
    Stopped,
    Cancelled,
    GaveUp { restarts: u32, last: ExitKind },
}

/// Runs `spawn` until it exits cleanly, the restart budget runs out, or
/// `cancel` fires. On cancellation the running child is killed.
pub async fn supervise<F>(
    name: &str,
    mut spawn: F,
    policy: &RestartPolicy,
    cancel: &CancellationToken,
) -> Result<SupervisionOutcome, SupervisorError>
where
    F: FnMut() -> std::io::Result<Child>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Ok(SupervisionOutcome::Cancelled);
        }

        let mut child = spawn().map_err(|e| SupervisorError::Launch {
            name: name.to_string(),
            source: e,
        })?;
        let started = Instant::now();

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill {}: {}", name, e);
                }
                return Ok(SupervisionOutcome::Cancelled);
            }
            status = child.wait() => status?,
        };

        let exit = if status.success() {
            ExitKind::Clean
        } else {
            ExitKind::Crashed(status.code())
        };
        if exit == ExitKind::Clean && !policy.restart_on_clean_exit {
            tracing::info!("{} exited cleanly", name);
            return Ok(SupervisionOutcome::Stopped);
        }

        if started.elapsed() >= policy.stable_after {
            attempt = 0;
        }
        if attempt >= policy.max_restarts {
            tracing::error!("{} gave up after {} restarts ({:?})", name, attempt, exit);
            return Ok(SupervisionOutcome::GaveUp {
                restarts: attempt,
                last: exit,
            });
        }

        let delay = policy.backoff(attempt);
        attempt += 1;
        tracing::warn!(
            "{} exited ({:?}); restart {}/{} in {:?}",
            name,
            exit,
            attempt,
            policy.max_restarts,
            delay
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SupervisionOutcome::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
