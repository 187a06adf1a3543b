use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{FailOutcome, Job, JobQueue, Result};

/// Why a job attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Retrying cannot help (bad input, unknown job). The job is dead-lettered.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The attempt may succeed later. The job's retry policy applies.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl JobError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }
}

/// Runs one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> std::result::Result<(), JobError>;
}

/// Result of processing a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Retrying { next_attempt: u32 },
    DeadLettered,
}

/// Pulls jobs from a set of queues and routes them to handlers by job name.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    queues: Vec<String>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            queues: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Adds a queue to poll. Queues are polled in the order they were added.
    pub fn listen(mut self, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        if !self.queues.contains(&queue) {
            self.queues.push(queue);
        }
        self
    }

    /// Routes jobs named `job_name` to `handler`.
    pub fn register(mut self, job_name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_name.into(), handler);
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Processes at most one due job. Returns `None` when every queue is idle.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        for queue in &self.queues {
            if let Some(job) = self.queue.dequeue(queue).await? {
                return self.process(job).await.map(Some);
            }
        }
        Ok(None)
    }

    /// Runs jobs until every queue is idle and returns how many were processed.
    ///
    /// Jobs waiting out a backoff are not due, so they do not keep this
    /// running.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    #[tracing::instrument(
        skip(self, job),
        fields(job_id = %job.id, job = %job.name, attempt = job.attempt)
    )]
    async fn process(&self, job: Job) -> Result<JobOutcome> {
        let Some(handler) = self.handlers.get(&job.name) else {
            tracing::error!("no handler registered for job");
            self.queue
                .dead_letter(job.id, &format!("no handler registered for {}", job.name))
                .await?;
            metrics::counter!("jobs_dead_total", "job" => job.name.clone()).increment(1);
            return Ok(JobOutcome::DeadLettered);
        };

        let start = Instant::now();
        let result = handler.handle(&job).await;
        metrics::histogram!("step_duration_seconds", "job" => job.name.clone())
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.queue.ack(job.id).await?;
                metrics::counter!("jobs_succeeded_total", "job" => job.name.clone()).increment(1);
                tracing::debug!("job succeeded");
                Ok(JobOutcome::Succeeded)
            }
            Err(JobError::Permanent(reason)) => {
                tracing::warn!(%reason, "job failed permanently");
                self.queue.dead_letter(job.id, &reason).await?;
                metrics::counter!("jobs_dead_total", "job" => job.name.clone()).increment(1);
                Ok(JobOutcome::DeadLettered)
            }
            Err(JobError::Transient(reason)) => match self.queue.fail(job.id, &reason).await? {
                FailOutcome::Retrying {
                    next_attempt,
                    available_at,
                } => {
                    tracing::warn!(%reason, next_attempt, %available_at, "job failed, retry scheduled");
                    metrics::counter!("jobs_retried_total", "job" => job.name.clone()).increment(1);
                    Ok(JobOutcome::Retrying { next_attempt })
                }
                FailOutcome::DeadLettered => {
                    tracing::error!(%reason, "job exhausted its attempts");
                    metrics::counter!("jobs_dead_total", "job" => job.name.clone()).increment(1);
                    Ok(JobOutcome::DeadLettered)
                }
            },
        }
    }
}

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker tasks.
    pub concurrency: usize,

    /// How long an idle task sleeps before polling again.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Runs a [`Worker`] on several tokio tasks until shutdown is signalled.
pub struct WorkerPool {
    worker: Arc<Worker>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>, config: WorkerPoolConfig) -> Self {
        Self { worker, config }
    }

    /// Spawns the worker tasks. Each task finishes its current job and stops
    /// once `true` is sent on `shutdown` or the sender is dropped.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency.max(1))
            .map(|index| {
                let worker = Arc::clone(&self.worker);
                let poll_interval = self.config.poll_interval;
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(index, worker, poll_interval, shutdown))
            })
            .collect()
    }

    /// Spawns the tasks and waits for all of them to stop.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        for handle in self.spawn(shutdown) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}

async fn run_worker(
    index: usize,
    worker: Arc<Worker>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker = index, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match worker.run_once().await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => tracing::error!(worker = index, error = %e, "failed to process job"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    tracing::info!(worker = index, "worker stopped");
}
