//! Wires sagas, handlers and the step worker together.

use std::sync::Arc;

use domain::Repository;
use event_store::EventStore;
use messaging::{EventBus, JobQueue, RetryPolicy, Worker};

use crate::dispatcher::{DunningTrigger, STEP_TRIGGERS, StepDispatcher};
use crate::steps::{Collaborators, QUEUE, Step, StepExecutor};
use crate::subscription_renewal::RENEWAL_FAILED;
use crate::workflows::WorkflowService;

/// The workflow core: command entry points plus the worker that runs steps.
pub struct SagaRuntime<S>
where
    S: EventStore,
{
    workflows: WorkflowService<S>,
    worker: Arc<Worker>,
}

impl<S> SagaRuntime<S>
where
    S: EventStore + Clone + 'static,
{
    /// Subscribes the dispatcher and the dunning trigger on `bus` and builds a
    /// worker that runs every step from `queue`.
    pub async fn install(
        store: S,
        bus: Arc<dyn EventBus>,
        queue: Arc<dyn JobQueue>,
        collaborators: Collaborators,
        retry_policy: RetryPolicy,
    ) -> Self {
        let workflows = WorkflowService::new(store, Arc::clone(&bus));

        let dispatcher = StepDispatcher::new(workflows.orders().clone(), Arc::clone(&queue), retry_policy);
        bus.subscribe_all(&STEP_TRIGGERS, Arc::new(dispatcher)).await;
        bus.subscribe(
            RENEWAL_FAILED,
            Arc::new(DunningTrigger::new(workflows.dunning_sagas().clone())),
        )
        .await;

        let executor = Arc::new(StepExecutor::new(workflows.orders().clone(), collaborators));
        let worker = Step::ALL
            .into_iter()
            .fold(Worker::new(queue).listen(QUEUE), |worker, step| {
                worker.register(step.job_name(), executor.clone())
            });

        tracing::info!(
            queue = QUEUE,
            steps = worker.handler_count(),
            max_attempts = retry_policy.max_attempts,
            "saga runtime installed"
        );

        Self {
            workflows,
            worker: Arc::new(worker),
        }
    }

    pub fn workflows(&self) -> &WorkflowService<S> {
        &self.workflows
    }

    /// The step worker, shared with a [`messaging::WorkerPool`].
    pub fn worker(&self) -> Arc<Worker> {
        Arc::clone(&self.worker)
    }

    pub fn orders(&self) -> &Repository<S, crate::OrderFulfillmentSaga> {
        self.workflows.orders()
    }
}
