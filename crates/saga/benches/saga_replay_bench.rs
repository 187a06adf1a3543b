use std::sync::Arc;

use chrono::Utc;
use common::{AggregateId, Money, PatientId, SubscriptionId};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{AggregateRoot, EventContext, Repository};
use event_store::{EventStore, InMemoryEventStore};
use messaging::{InMemoryEventBus, InMemoryJobQueue, RetryPolicy};
use saga::{
    Collaborators, DunningSaga, InMemoryInventoryService, InMemoryPrescriptionService,
    InMemoryShipmentService, OrderDetails, SagaRuntime,
};

/// Persists a dunning saga that went through every scheduled retry.
async fn seed_dunning(store: &InMemoryEventStore) -> AggregateId {
    let repository: Repository<_, DunningSaga> =
        Repository::new(store.clone(), Arc::new(InMemoryEventBus::new()));
    let id = AggregateId::new();
    let mut saga = AggregateRoot::<DunningSaga>::new(id);
    saga.execute(|s| s.start(SubscriptionId::new(), vec![1, 3, 7, 14, 30], 5))
        .unwrap();
    for attempt in 1..=5u32 {
        saga.execute(|s| s.schedule_retry(attempt, Utc::now())).unwrap();
        saga.execute(|s| s.record_payment_attempt(false, Some("card_declined".into())))
            .unwrap();
        saga.execute(|s| s.trigger_escalation(attempt as u8)).unwrap();
    }
    saga.execute(|s| s.fail("retries exhausted")).unwrap();
    repository
        .save(&mut saga, &EventContext::new("bench"))
        .await
        .unwrap();
    id
}

fn bench_reconstitute_dunning(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let (id, history) = rt.block_on(async {
        let id = seed_dunning(&store).await;
        (id, store.events_for_aggregate(id).await.unwrap())
    });

    c.bench_function("saga/reconstitute_dunning_history", |b| {
        b.iter(|| AggregateRoot::<DunningSaga>::reconstitute_from_history(id, &history).unwrap());
    });
}

fn bench_order_happy_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/order_fulfillment_happy_path", |b| {
        b.iter(|| {
            rt.block_on(async {
                let collaborators = Collaborators {
                    prescriptions: Arc::new(InMemoryPrescriptionService::new()),
                    inventory: Arc::new(InMemoryInventoryService::new()),
                    shipments: Arc::new(InMemoryShipmentService::new()),
                };
                let runtime = SagaRuntime::install(
                    InMemoryEventStore::new(),
                    Arc::new(InMemoryEventBus::new()),
                    Arc::new(InMemoryJobQueue::new()),
                    collaborators,
                    RetryPolicy::immediate(3),
                )
                .await;
                runtime
                    .workflows()
                    .start_order(OrderDetails {
                        patient_id: PatientId::new(),
                        medication: "semaglutide".into(),
                        quantity: 1,
                        shipping_address: "1 Main St".into(),
                        amount: Money::from_cents(29_900),
                    })
                    .await
                    .unwrap();
                runtime.worker().drain().await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_reconstitute_dunning, bench_order_happy_path);
criterion_main!(benches);
