//! Bounded status polling for long-running collaborator jobs.
//!
//! A job is fetched repeatedly until it reports one of the terminal states
//! (`completed`, `failed`, `cancelled`, `expired`, `incomplete`), the poll
//! budget runs out, or the cancellation token fires. Waits between polls grow
//! exponentially up to a cap.

use std::{future::Future, time::Duration};

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
    Other(String),
}

impl JobStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "queued" => JobStatus::Queued,
            "in_progress" => JobStatus::InProgress,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            "expired" => JobStatus::Expired,
            "incomplete" => JobStatus::Incomplete,
            other => JobStatus::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            JobStatus::Queued | JobStatus::InProgress | JobStatus::Other(_)
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Expired => "expired",
            JobStatus::Incomplete => "incomplete",
            JobStatus::Other(value) => value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub max_polls: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_polls: 120,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl PollPolicy {
    fn delay(&self, poll: usize) -> Duration {
        let factor = 1u32 << poll.min(8);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Polls `fetch` until job `job_id` reaches a terminal state.
///
/// Returns the payload of the `completed` poll. Any other terminal state maps
/// to [`PipelineError::JobFailed`]; running out of polls is a transport failure.
pub async fn poll_until_terminal<F, Fut, T>(
    job_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(JobStatus, T)>>,
{
    for poll in 0..policy.max_polls {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let (status, payload) = fetch().await?;
        match status {
            JobStatus::Completed => return Ok(payload),
            terminal if terminal.is_terminal() => {
                return Err(PipelineError::JobFailed {
                    id: job_id.to_string(),
                    status: terminal.as_str().to_string(),
                });
            }
            pending => {
                let delay = policy.delay(poll);
                debug!(
                    "Job {job_id} is {}; polling again in {delay:?}",
                    pending.as_str()
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    Err(PipelineError::Transport(format!(
        "job {job_id} did not finish after {} poll(s)",
        policy.max_polls
    )))
}
