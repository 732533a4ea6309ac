//! Image round-trip over a realistic network
//!
//! Builds a network with single-pattern, negated, and variable-join
//! rules, images it, loads it into a fresh environment, and checks both
//! structural identity (re-imaging yields identical bytes) and behavior
//! (the restored network produces the same activations).

use binary_image::{load_image, save_image, ImageError};
use match_model::{EntityId, EntityStore, EntityStoreMut, SlotIndex, TemplateId, Value};
use rete::engine::EngineConfig;
use rete::{Engine, PatternSpec, RuleSpec};
use rustc_hash::FxHashMap;

const T_A: u32 = 0;
const T_B: u32 = 1;

#[derive(Default)]
struct Store {
    entities: FxHashMap<EntityId, (TemplateId, Vec<Value>, bool)>,
    next: u64,
}

impl Store {
    fn put(&mut self, template: u32, slots: Vec<Value>) -> EntityId {
        let id = EntityId(self.next);
        self.next += 1;
        self.entities
            .insert(id, (TemplateId(template), slots, false));
        id
    }
}

impl EntityStore for Store {
    fn template(&self, entity: EntityId) -> Option<TemplateId> {
        self.entities.get(&entity).map(|(t, _, _)| *t)
    }
    fn slot_count(&self, entity: EntityId) -> u16 {
        self.entities
            .get(&entity)
            .map(|(_, s, _)| s.len() as u16)
            .unwrap_or(0)
    }
    fn slot(&self, entity: EntityId, slot: SlotIndex) -> Option<&Value> {
        self.entities.get(&entity)?.1.get(slot.index())
    }
    fn synchronized(&self, _entity: EntityId) -> bool {
        true
    }
    fn is_deleted(&self, entity: EntityId) -> bool {
        self.entities
            .get(&entity)
            .map(|(_, _, d)| *d)
            .unwrap_or(true)
    }
}

impl EntityStoreMut for Store {
    fn delete(&mut self, entity: EntityId) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.2 = true;
        }
    }
}

fn build_network(store: &Store) -> Engine {
    let mut engine = Engine::new();
    engine
        .add_rule(RuleSpec::new("single").pattern(PatternSpec::new(TemplateId(T_A))), store)
        .unwrap();
    engine
        .add_rule(
            RuleSpec::new("blocked")
                .pattern(PatternSpec::new(TemplateId(T_A)))
                .negated(PatternSpec::new(TemplateId(T_B))),
            store,
        )
        .unwrap();
    engine
        .add_rule(
            RuleSpec::new("joined")
                .salience(10)
                .pattern(PatternSpec::new(TemplateId(T_A)).variable(0, "x"))
                .pattern(PatternSpec::new(TemplateId(T_B)).variable(0, "x")),
            store,
        )
        .unwrap();
    engine
        .add_rule(
            RuleSpec::new("sought")
                .goal_driven()
                .pattern(PatternSpec::new(TemplateId(T_A)))
                .pattern(PatternSpec::new(TemplateId(T_B))),
            store,
        )
        .unwrap();
    engine
}

fn activations(engine: &Engine) -> Vec<String> {
    let mut names: Vec<_> = engine
        .agenda()
        .iter()
        .filter_map(|(_, act)| engine.rule(act.rule).map(|r| r.name.clone()))
        .collect();
    names.sort();
    names
}

#[test]
fn test_image_bytes_stable_under_round_trip() {
    let store = Store::default();
    let engine = build_network(&store);

    let mut image = Vec::new();
    save_image(&engine, &mut image).unwrap();

    let restored = load_image(EngineConfig::default(), image.as_slice()).unwrap();

    // Re-imaging the restored network reproduces the bytes exactly.
    let mut second = Vec::new();
    save_image(&restored, &mut second).unwrap();
    assert_eq!(image, second);
}

#[test]
fn test_restored_network_enumerates_identical_tuples() {
    let store = Store::default();
    let engine = build_network(&store);

    let mut image = Vec::new();
    save_image(&engine, &mut image).unwrap();
    let restored = load_image(EngineConfig::default(), image.as_slice()).unwrap();

    assert_eq!(engine.joins().len(), restored.joins().len());
    assert_eq!(
        engine.patterns().node_count(),
        restored.patterns().node_count()
    );
    assert_eq!(engine.rules().len(), restored.rules().len());

    assert_eq!(
        engine.joins().goal_prime.as_slice(),
        restored.joins().goal_prime.as_slice()
    );

    for ((_, a), (_, b)) in engine.joins().iter().zip(restored.joins().iter()) {
        assert_eq!(a.flags.first_join, b.flags.first_join);
        assert_eq!(a.flags.pattern_is_negated, b.flags.pattern_is_negated);
        assert_eq!(a.flags.pattern_is_exists, b.flags.pattern_is_exists);
        assert_eq!(a.flags.goal_join, b.flags.goal_join);
        assert_eq!(a.goal_expression, b.goal_expression);
        assert_eq!(a.depth, b.depth);
        assert_eq!(a.network_test, b.network_test);
        assert_eq!(a.left_hash, b.left_hash);
        assert_eq!(a.right_hash, b.right_hash);
        assert_eq!(a.last_level, b.last_level);
        assert_eq!(a.right_match_node, b.right_match_node);
        assert_eq!(a.rule_to_activate, b.rule_to_activate);
        assert_eq!(a.next_links.as_slice(), b.next_links.as_slice());
    }

    for (a, b) in engine.rules().iter().zip(restored.rules().iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.salience, b.salience);
        assert_eq!(a.complexity, b.complexity);
        assert_eq!(a.logical_join, b.logical_join);
        assert_eq!(a.last_join, b.last_join);
        assert_eq!(a.disjunct, b.disjunct);
    }
}

#[test]
fn test_restored_network_behaves_identically() {
    let mut store = Store::default();
    let original = build_network(&store);

    let mut image = Vec::new();
    save_image(&original, &mut image).unwrap();
    let mut restored = load_image(EngineConfig::default(), image.as_slice()).unwrap();
    restored.reprime(&store);

    let mut reference = build_network(&store);

    let a = store.put(T_A, vec![Value::Integer(2)]);
    let b = store.put(T_B, vec![Value::Integer(2)]);
    for engine in [&mut reference, &mut restored] {
        engine.assert_entity(a, &store);
        engine.assert_entity(b, &store);
    }
    assert_eq!(activations(&reference), activations(&restored));

    store.delete(b);
    for engine in [&mut reference, &mut restored] {
        engine.retract_entity(b, &store);
    }
    assert_eq!(activations(&reference), activations(&restored));
    assert_eq!(
        reference.pool().live_partial_matches(),
        restored.pool().live_partial_matches()
    );
}

#[test]
fn test_bad_magic_rejected() {
    let err = load_image(EngineConfig::default(), &b"XXXX\x01\x00\x00\x00"[..]).unwrap_err();
    assert!(matches!(err, ImageError::BadMagic));
}

#[test]
fn test_truncated_image_rejected() {
    let store = Store::default();
    let engine = build_network(&store);
    let mut image = Vec::new();
    save_image(&engine, &mut image).unwrap();
    image.truncate(image.len() / 2);

    let err = load_image(EngineConfig::default(), image.as_slice()).unwrap_err();
    assert!(matches!(err, ImageError::Truncated | ImageError::BadRecord(_)));
}
