use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use millwright_events::{EventEnvelope, InMemoryEventBus};
use millwright_infra::event_store::InMemoryEventStore;
use millwright_infra::production::{FinishedGoodsDraft, MaterialDraft, OrderDraft, ProductionService};
use millwright_materials::{MaterialId, MaterialLine};

type Bus = Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>;
type Service = ProductionService<Arc<InMemoryEventStore>, Bus>;

fn setup_service() -> Service {
    let store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    ProductionService::bootstrap(store, bus).expect("bootstrap")
}

fn register_screw(svc: &Service, on_hand: u32) -> MaterialId {
    svc.register_material(MaterialDraft {
        name: "Screw".to_string(),
        category: "raw".to_string(),
        unit_cost_cents: 5,
        initial_on_hand: on_hand,
        min_threshold: None,
    })
    .expect("register material")
    .id
}

fn order_draft(material_id: MaterialId, quantity: u32) -> OrderDraft {
    OrderDraft {
        product_name: "Cabinet".to_string(),
        quantity: 1,
        material_lines: vec![MaterialLine {
            material_id,
            quantity,
        }],
        sale_price_cents: 19_999,
        estimated_days: 7,
        image_ref: None,
    }
}

fn bench_order_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_lifecycle");
    // Every start grows the shared ledger stream, so keep samples modest.
    group.sample_size(20);

    group.bench_function("create_order", |b| {
        let svc = setup_service();
        let screw = register_screw(&svc, u32::MAX);
        b.iter(|| {
            svc.create_order(black_box(order_draft(screw, 1)))
                .expect("create order")
        });
    });

    group.bench_function("create_start_confirm", |b| {
        let svc = setup_service();
        let screw = register_screw(&svc, u32::MAX);
        b.iter(|| {
            let order = svc.create_order(order_draft(screw, 1)).expect("create");
            svc.start_order(order.order_id).expect("start");
            svc.confirm_order(
                order.order_id,
                FinishedGoodsDraft {
                    description: "Cabinet, oak".to_string(),
                    category: "Furniture".to_string(),
                    sale_price_cents: 19_999,
                    image_ref: None,
                },
            )
            .expect("confirm")
        });
    });

    group.finish();
}

/// The ledger is a single stream; rehydration cost grows with its history.
fn bench_ledger_rehydration(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_rehydration");

    for history_len in [10u32, 100, 1_000] {
        let svc = setup_service();
        let screw = register_screw(&svc, 1);
        for _ in 0..history_len {
            svc.receive_stock(screw, 1).expect("receive stock");
        }

        group.throughput(Throughput::Elements(u64::from(history_len)));
        group.bench_with_input(
            BenchmarkId::from_parameter(history_len),
            &history_len,
            |b, _| {
                b.iter(|| svc.get_material(black_box(&screw)).expect("get material"));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_order_lifecycle, bench_ledger_rehydration);
criterion_main!(benches);
