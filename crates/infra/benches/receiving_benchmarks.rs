use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::Value as JsonValue;

use procura_core::TenantId;
use procura_events::{EventEnvelope, InMemoryEventBus};
use procura_infra::command_dispatcher::CommandDispatcher;
use procura_infra::config::ReceivingConfig;
use procura_infra::event_store::InMemoryEventStore;
use procura_infra::receiving_service::ReceivingService;
use procura_purchasing::SupplierId;
use procura_receiving::{Adjustment, LineId, LineLedger, LocationId, NewLine, ProductId, reconcile};

type Service = ReceivingService<InMemoryEventStore, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

fn lines(count: usize, quantity: i64) -> Vec<NewLine> {
    (0..count)
        .map(|_| NewLine {
            product_id: ProductId::generate(),
            quantity,
        })
        .collect()
}

fn accept_all(count: usize, quantity: i64) -> Vec<Adjustment> {
    (1..=count as u32)
        .map(|id| Adjustment::accept(LineId(id), quantity))
        .collect()
}

fn service() -> Service {
    let bus = Arc::new(InMemoryEventBus::new());
    let dispatcher = CommandDispatcher::new(InMemoryEventStore::new(), bus);
    ReceivingService::new(Arc::new(dispatcher), ReceivingConfig::default())
}

/// Pure validation cost of one batch against a ledger (no store, no bus).
fn bench_reconcile_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_batch");

    for batch in [1usize, 10, 100, 1000] {
        let ledger = LineLedger::open(&lines(batch, 10)).expect("ledger");
        let adjustments = accept_all(batch, 4);

        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, _| {
            b.iter(|| {
                let outcome = reconcile("bench", black_box(&ledger), black_box(&adjustments)).expect("valid");
                black_box(outcome);
            });
        });
    }

    group.finish();
}

/// End-to-end receive through the dispatcher: load, rehydrate, reconcile,
/// append, publish. Each iteration receives against an order with `history`
/// prior receipts in its stream.
fn bench_receive_with_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive_with_history");
    group.sample_size(200);

    for history in [0usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(history), &history, |b, &history| {
            let svc = service();
            let tenant_id = TenantId::new();
            let order_id = svc
                .create_purchase_order(
                    tenant_id,
                    SupplierId::generate(),
                    LocationId::generate(),
                    lines(10, i64::MAX / 2),
                )
                .expect("create");
            svc.mark_ordered(tenant_id, order_id).expect("order");
            for _ in 0..history {
                svc.receive_purchase_order(tenant_id, order_id, accept_all(10, 1))
                    .expect("seed receipt");
            }

            b.iter(|| {
                let outcome = svc
                    .receive_purchase_order(tenant_id, order_id, black_box(accept_all(10, 1)))
                    .expect("receive");
                black_box(outcome);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reconcile_batch, bench_receive_with_history);
criterion_main!(benches);
