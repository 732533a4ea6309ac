//! Assert/retract churn through a joined two-pattern rule

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use match_model::{EntityId, EntityStore, SlotIndex, TemplateId, Value};
use rete::{Engine, PatternSpec, RuleSpec};
use rustc_hash::FxHashMap;

struct BenchStore {
    slots: FxHashMap<EntityId, (TemplateId, Value)>,
    deleted: FxHashMap<EntityId, bool>,
}

impl BenchStore {
    fn new() -> Self {
        Self {
            slots: FxHashMap::default(),
            deleted: FxHashMap::default(),
        }
    }

    fn put(&mut self, id: u64, template: u32, value: i64) -> EntityId {
        let id = EntityId(id);
        self.slots
            .insert(id, (TemplateId(template), Value::Integer(value)));
        self.deleted.insert(id, false);
        id
    }
}

impl EntityStore for BenchStore {
    fn template(&self, entity: EntityId) -> Option<TemplateId> {
        self.slots.get(&entity).map(|(t, _)| *t)
    }
    fn slot_count(&self, _entity: EntityId) -> u16 {
        1
    }
    fn slot(&self, entity: EntityId, slot: SlotIndex) -> Option<&Value> {
        (slot == SlotIndex(0))
            .then(|| self.slots.get(&entity).map(|(_, v)| v))
            .flatten()
    }
    fn synchronized(&self, _entity: EntityId) -> bool {
        true
    }
    fn is_deleted(&self, entity: EntityId) -> bool {
        self.deleted.get(&entity).copied().unwrap_or(true)
    }
}

fn churn(c: &mut Criterion) {
    c.bench_function("assert_retract_churn_64", |b| {
        let mut store = BenchStore::new();
        let mut engine = Engine::new();
        engine
            .add_rule(
                RuleSpec::new("pair")
                    .pattern(PatternSpec::new(TemplateId(0)).variable(0, "x"))
                    .pattern(PatternSpec::new(TemplateId(1)).variable(0, "x")),
                &store,
            )
            .unwrap();

        b.iter(|| {
            let mut ids = Vec::with_capacity(128);
            for i in 0..64 {
                let a = store.put(i * 2, 0, i as i64);
                let b2 = store.put(i * 2 + 1, 1, i as i64);
                engine.assert_entity(a, &store);
                engine.assert_entity(b2, &store);
                ids.push(a);
                ids.push(b2);
            }
            for id in ids {
                store.deleted.insert(id, true);
                engine.retract_entity(id, &store);
                store.deleted.insert(id, false);
            }
            black_box(engine.agenda().len())
        });
    });
}

criterion_group!(benches, churn);
criterion_main!(benches);
