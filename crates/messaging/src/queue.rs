use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{MessagingError, Result};

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before a failed job becomes available again.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Retries immediately; used where waiting out the backoff is pointless.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    fn retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.backoff)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_BACKOFF)
    }
}

/// A durable unit of work.
///
/// `attempt` counts deliveries: it is 0 while the job waits for its first
/// run and is incremented each time the job is dequeued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: queue.into(),
            name: name.into(),
            payload,
            attempt: 0,
            retry_policy: RetryPolicy::default(),
            enqueued_at: now,
            available_at: now,
            last_error: None,
        }
    }

    /// Creates a job whose payload is the JSON form of `payload`.
    pub fn with_payload<T: Serialize>(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::new(queue, name, serde_json::to_value(payload)?))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// True when a failure of the current delivery will not be retried.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.retry_policy.max_attempts
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying {
        next_attempt: u32,
        available_at: DateTime<Utc>,
    },
    DeadLettered,
}

/// A job that will not be run again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Named queues of at-least-once jobs.
///
/// A dequeued job stays in flight until it is acknowledged, failed or
/// dead-lettered.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<JobId>;

    /// Takes the oldest job of `queue` that is due, if any.
    async fn dequeue(&self, queue: &str) -> Result<Option<Job>>;

    /// Marks an in-flight job as done.
    async fn ack(&self, job_id: JobId) -> Result<()>;

    /// Records a failed attempt. The job is rescheduled after the policy's
    /// backoff, or dead-lettered once its attempts are used up.
    async fn fail(&self, job_id: JobId, error: &str) -> Result<FailOutcome>;

    /// Moves an in-flight job straight to the dead-letter list.
    async fn dead_letter(&self, job_id: JobId, error: &str) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, VecDeque<Job>>,
    in_flight: HashMap<JobId, Job>,
    dead: Vec<DeadLetter>,
    history: Vec<Job>,
}

/// In-memory job queue.
///
/// Keeps a history of every enqueued job so callers can assert on what a
/// step scheduled.
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job ever enqueued, in order.
    pub async fn enqueued_jobs(&self) -> Vec<Job> {
        self.state.lock().await.history.clone()
    }

    /// Every job ever enqueued under one job name.
    pub async fn enqueued_named(&self, name: &str) -> Vec<Job> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|job| job.name == name)
            .cloned()
            .collect()
    }

    pub async fn pending_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .pending
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let id = job.id;
        metrics::counter!("jobs_enqueued_total", "queue" => job.queue.clone(), "job" => job.name.clone())
            .increment(1);
        tracing::debug!(job_id = %id, queue = %job.queue, job = %job.name, "job enqueued");

        let mut state = self.state.lock().await;
        state.history.push(job.clone());
        state.pending.entry(job.queue.clone()).or_default().push_back(job);
        Ok(id)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let Some(jobs) = state.pending.get_mut(queue) else {
            return Ok(None);
        };
        let Some(position) = jobs.iter().position(|job| job.available_at <= now) else {
            return Ok(None);
        };
        let Some(mut job) = jobs.remove(position) else {
            return Ok(None);
        };

        job.attempt += 1;
        state.in_flight.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn ack(&self, job_id: JobId) -> Result<()> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&job_id)
            .map(|_| ())
            .ok_or(MessagingError::JobNotFound(job_id))
    }

    async fn fail(&self, job_id: JobId, error: &str) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut job = state
            .in_flight
            .remove(&job_id)
            .ok_or(MessagingError::JobNotFound(job_id))?;
        job.last_error = Some(error.to_string());

        if job.is_final_attempt() {
            state.dead.push(DeadLetter {
                job,
                error: error.to_string(),
                failed_at: now,
            });
            return Ok(FailOutcome::DeadLettered);
        }

        job.available_at = job.retry_policy.retry_at(now);
        let outcome = FailOutcome::Retrying {
            next_attempt: job.attempt + 1,
            available_at: job.available_at,
        };
        state.pending.entry(job.queue.clone()).or_default().push_back(job);
        Ok(outcome)
    }

    async fn dead_letter(&self, job_id: JobId, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut job = state
            .in_flight
            .remove(&job_id)
            .ok_or(MessagingError::JobNotFound(job_id))?;
        job.last_error = Some(error.to_string());
        state.dead.push(DeadLetter {
            job,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().await.dead.clone())
    }
}
