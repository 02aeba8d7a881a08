//! Agent jobs and the per-role queues that run them.
//!
//! Players and characters are collaborators behind async traits. The graph
//! never calls them inline: each call is submitted to the queue for its role
//! and the phase waits only on the handles it submitted.

use crate::consensus::ConsensusResult;
use crate::id::JobId;
use crate::message::Message;
use crate::state::{CharacterAction, ClarificationExchange};
use crate::validation::ValidationStrictness;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors from agent jobs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job {job} timed out after {after:?}")]
    Timeout { job: String, after: Duration },

    #[error("Job {job} failed: {reason}")]
    Failed { job: String, reason: String },

    #[error("Job {0} was cancelled")]
    Cancelled(String),
}

impl JobError {
    pub fn failed(job: impl Into<String>, reason: impl Into<String>) -> Self {
        JobError::Failed {
            job: job.into(),
            reason: reason.into(),
        }
    }

    /// Every job failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Scene context for a clarifying question.
#[derive(Debug, Clone)]
pub struct ClarificationRequest {
    pub agent_id: String,
    pub character_id: String,
    pub narration: String,
    pub memories: Vec<String>,
    pub round: u32,
    pub previous: Vec<ClarificationExchange>,
}

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub agent_id: String,
    pub character_id: String,
    pub narration: String,
    pub memories: Vec<String>,
    pub clarifications: Vec<ClarificationExchange>,
}

/// One round of out-of-character discussion.
#[derive(Debug, Clone)]
pub struct DiscussionRequest {
    pub agent_id: String,
    pub round: u32,
    pub intents: BTreeMap<String, String>,
    pub discussion: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct DirectiveRequest {
    pub agent_id: String,
    pub character_id: String,
    pub intent: String,
    pub consensus: Option<ConsensusResult>,
}

/// Everything a character may see when choosing an action.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub character_id: String,
    pub directive: String,
    /// In-character messages and this character's own directives.
    pub scene: Vec<Message>,
    pub memories: Vec<String>,
    pub strictness: ValidationStrictness,
    pub attempt: u32,
    pub previous_violations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReactionRequest {
    pub character_id: String,
    pub outcome: String,
    /// The DM's answer to this character's LASER FEELINGS question.
    pub insight: Option<String>,
    pub scene: Vec<Message>,
}

/// The strategic layer behind a player.
#[async_trait]
pub trait PlayerAgent: Send + Sync {
    /// A question for the DM, or `None` if the scene is clear enough.
    async fn clarifying_question(
        &self,
        request: &ClarificationRequest,
    ) -> Result<Option<String>, JobError>;

    async fn formulate_intent(&self, request: &IntentRequest) -> Result<String, JobError>;

    /// A discussion contribution, or `None` to stay silent.
    async fn discuss(&self, _request: &DiscussionRequest) -> Result<Option<String>, JobError> {
        Ok(None)
    }

    async fn create_directive(&self, request: &DirectiveRequest) -> Result<String, JobError> {
        Ok(request.intent.clone())
    }
}

/// The in-fiction layer behind a character.
#[async_trait]
pub trait CharacterAgent: Send + Sync {
    async fn perform_action(&self, request: &ActionRequest) -> Result<CharacterAction, JobError>;

    async fn react(&self, request: &ReactionRequest) -> Result<String, JobError>;
}

/// Handle to a submitted job.
pub struct JobHandle<T> {
    pub id: JobId,
    /// Agent the job runs for.
    pub owner: String,
    inner: JoinHandle<Result<T, JobError>>,
}

impl<T> JobHandle<T> {
    pub async fn wait(self) -> Result<T, JobError> {
        match self.inner.await {
            Ok(result) => result,
            Err(e) => {
                warn!(job_id = %self.id, owner = %self.owner, error = %e, "Job did not complete");
                Err(JobError::Cancelled(self.owner))
            }
        }
    }
}

/// Wait on a set of handles, keeping each result next to its owner.
pub async fn wait_all<T>(handles: Vec<JobHandle<T>>) -> Vec<(String, Result<T, JobError>)> {
    join_all(handles.into_iter().map(|h| async move {
        let owner = h.owner.clone();
        (owner, h.wait().await)
    }))
    .await
}

/// Bounded queue for one role.
#[derive(Clone)]
pub struct JobQueue {
    role: &'static str,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl JobQueue {
    pub fn new(role: &'static str, concurrency: usize, timeout: Duration) -> Self {
        Self {
            role,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    /// Run `job` in the background under this queue's limits.
    pub fn submit<T, F>(&self, owner: impl Into<String>, job: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        let id = JobId::new();
        let owner = owner.into();
        let permits = Arc::clone(&self.permits);
        let timeout = self.timeout;
        let role = self.role;
        let job_owner = owner.clone();

        debug!(%id, role, owner = %owner, "Submitting job");
        let inner = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| JobError::Cancelled(job_owner.clone()))?;
            match tokio::time::timeout(timeout, job).await {
                Ok(result) => result,
                Err(_) => Err(JobError::Timeout {
                    job: format!("{role}:{job_owner}"),
                    after: timeout,
                }),
            }
        });

        JobHandle { id, owner, inner }
    }
}

/// The two role queues used during a turn.
#[derive(Clone)]
pub struct WorkQueues {
    pub strategic: JobQueue,
    pub character: JobQueue,
}

impl WorkQueues {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            strategic: JobQueue::new("strategic", concurrency, timeout),
            character: JobQueue::new("character", concurrency, timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_all_keeps_owners() {
        let queue = JobQueue::new("strategic", 2, Duration::from_secs(1));
        let handles = vec![
            queue.submit("agent_a", async { Ok::<_, JobError>(1) }),
            queue.submit("agent_b", async { Err(JobError::failed("agent_b", "no idea")) }),
        ];
        let results = wait_all(handles).await;
        assert_eq!(results[0].0, "agent_a");
        assert_eq!(results[0].1, Ok(1));
        assert!(results[1].1.is_err());
    }

    #[tokio::test]
    async fn test_timeout_is_a_job_failure() {
        let queue = JobQueue::new("character", 1, Duration::from_millis(20));
        let handle = queue.submit("char_zara", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, JobError>(())
        });
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, JobError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let queue = JobQueue::new("character", 2, Duration::from_secs(5));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                queue.submit(format!("char_{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, JobError>(())
                })
            })
            .collect();
        wait_all(handles).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
