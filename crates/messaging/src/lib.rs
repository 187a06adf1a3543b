//! Asynchronous plumbing between persisted events and workflow steps.
//!
//! - [`EventBus`] fans every persisted event out to subscribed [`EventHandler`]s
//! - [`JobQueue`] holds durable, at-least-once jobs with a [`RetryPolicy`]
//! - [`Worker`] and [`WorkerPool`] pull jobs and run the registered [`JobHandler`]s

pub mod bus;
pub mod error;
pub mod queue;
pub mod worker;

pub use bus::{EventBus, EventHandler, InMemoryEventBus};
pub use error::{MessagingError, Result};
pub use queue::{DeadLetter, FailOutcome, InMemoryJobQueue, Job, JobId, JobQueue, RetryPolicy};
pub use worker::{JobError, JobHandler, JobOutcome, Worker, WorkerPool, WorkerPoolConfig};
