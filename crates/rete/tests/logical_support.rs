//! Truth-maintenance behavior
//!
//! Entities asserted under logical support fall when their last
//! supporting match is retracted; support from several firings combines;
//! unconditional assertion strips logical support.

mod common;

use common::{retract, TestStore};
use rete::{Engine, PatternSpec, RuleSpec, TemplateId, Value};

const T_TRIGGER: u32 = 0;
const T_DERIVED: u32 = 1;

/// Fire the first pending activation, asserting `derived` under the
/// firing rule's logical support.
fn fire_asserting(
    engine: &mut Engine,
    store: &mut TestStore,
    derived_slots: Vec<Value>,
) -> match_model::EntityId {
    let (activation, _) = engine.agenda().iter().next().expect("an activation is pending");
    engine.begin_fire(activation).expect("activation is live");
    let derived = store.put(T_DERIVED, derived_slots);
    engine.add_logical_dependencies(derived, false, 0);
    engine.assert_entity(derived, store);
    engine.end_fire();
    derived
}

fn logical_rule() -> RuleSpec {
    RuleSpec::new("derive")
        .logical(1)
        .pattern(PatternSpec::new(TemplateId(T_TRIGGER)))
}

#[test]
fn test_logical_cascade_on_support_loss() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(logical_rule(), &store).unwrap();

    let trigger = store.put(T_TRIGGER, vec![]);
    engine.assert_entity(trigger, &store);
    let derived = fire_asserting(&mut engine, &mut store, vec![]);
    assert!(engine.has_logical_support(derived));

    retract(&mut engine, &mut store, trigger);
    engine.force_logical_retractions(&mut store);

    assert!(store.is_deleted(derived));
    assert!(engine.pattern_matches_of(derived).is_empty());
    assert!(!engine.has_logical_support(derived));
    assert_eq!(engine.pool().live_alpha_matches(), 0);
}

#[test]
fn test_multiple_supports_keep_entity_alive() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(logical_rule(), &store).unwrap();

    let t1 = store.put(T_TRIGGER, vec![]);
    let t2 = store.put(T_TRIGGER, vec![]);
    engine.assert_entity(t1, &store);
    engine.assert_entity(t2, &store);
    assert_eq!(engine.agenda().len(), 2);

    // First firing creates the entity; second adds a supporter.
    let derived = fire_asserting(&mut engine, &mut store, vec![]);
    {
        let (activation, _) = engine.agenda().iter().next().unwrap();
        engine.begin_fire(activation).unwrap();
        engine.add_logical_dependencies(derived, true, 0);
        engine.end_fire();
    }
    assert_eq!(engine.dependencies_of(derived).len(), 2);

    retract(&mut engine, &mut store, t1);
    engine.force_logical_retractions(&mut store);
    assert!(!store.is_deleted(derived), "one supporter remains");

    retract(&mut engine, &mut store, t2);
    engine.force_logical_retractions(&mut store);
    assert!(store.is_deleted(derived), "last supporter gone");
}

#[test]
fn test_certainty_combines_as_maximum() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(logical_rule(), &store).unwrap();

    let t1 = store.put(T_TRIGGER, vec![]);
    let t2 = store.put(T_TRIGGER, vec![]);
    engine.assert_entity(t1, &store);
    engine.assert_entity(t2, &store);

    let (activation, _) = engine.agenda().iter().next().unwrap();
    engine.begin_fire(activation).unwrap();
    let derived = store.put(T_DERIVED, vec![]);
    engine.add_logical_dependencies(derived, false, 4_000);
    engine.assert_entity(derived, &store);
    engine.end_fire();

    let (activation, _) = engine.agenda().iter().next().unwrap();
    engine.begin_fire(activation).unwrap();
    engine.add_logical_dependencies(derived, true, 9_000);
    engine.end_fire();

    assert_eq!(engine.entity_support_cf(derived), Some(9_000));

    // Losing the strongest supporter re-derives the combination.
    retract(&mut engine, &mut store, t2);
    engine.force_logical_retractions(&mut store);
    assert!(!store.is_deleted(derived));
    assert_eq!(engine.entity_support_cf(derived), Some(4_000));
}

#[test]
fn test_certainty_is_clamped() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(logical_rule(), &store).unwrap();

    let trigger = store.put(T_TRIGGER, vec![]);
    engine.assert_entity(trigger, &store);

    let (activation, _) = engine.agenda().iter().next().unwrap();
    engine.begin_fire(activation).unwrap();
    let derived = store.put(T_DERIVED, vec![]);
    engine.add_logical_dependencies(derived, false, i16::MAX);
    engine.end_fire();

    assert_eq!(engine.entity_support_cf(derived), Some(10_000));
}

#[test]
fn test_unconditional_assert_strips_logical_support() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(logical_rule(), &store).unwrap();
    // A rule without a logical group, for the unconditional re-assert.
    engine
        .add_rule(
            RuleSpec::new("plain").pattern(PatternSpec::new(TemplateId(T_TRIGGER))),
            &store,
        )
        .unwrap();

    let trigger = store.put(T_TRIGGER, vec![]);
    engine.assert_entity(trigger, &store);

    // Fire the logical rule first.
    let logical_activation = engine
        .agenda()
        .iter()
        .find(|(_, act)| {
            engine
                .rule(act.rule)
                .map(|r| r.name == "derive")
                .unwrap_or(false)
        })
        .map(|(id, _)| id)
        .unwrap();
    engine.begin_fire(logical_activation).unwrap();
    let derived = store.put(T_DERIVED, vec![]);
    engine.add_logical_dependencies(derived, false, 0);
    engine.assert_entity(derived, &store);
    engine.end_fire();
    assert!(engine.has_logical_support(derived));

    // The plain rule re-asserts the same entity unconditionally.
    let plain_activation = engine.agenda().iter().next().map(|(id, _)| id).unwrap();
    engine.begin_fire(plain_activation).unwrap();
    engine.add_logical_dependencies(derived, true, 0);
    engine.end_fire();
    assert!(!engine.has_logical_support(derived));

    // Retracting the trigger no longer takes the entity with it.
    retract(&mut engine, &mut store, trigger);
    engine.force_logical_retractions(&mut store);
    assert!(!store.is_deleted(derived));
}

#[test]
fn test_chained_logical_cascade_reaches_fixed_point() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    // trigger derives d1; d1 derives d2.
    engine.add_rule(logical_rule(), &store).unwrap();
    engine
        .add_rule(
            RuleSpec::new("derive-more")
                .logical(1)
                .pattern(PatternSpec::new(TemplateId(T_DERIVED)).constant(0, Value::Integer(1))),
            &store,
        )
        .unwrap();

    let trigger = store.put(T_TRIGGER, vec![]);
    engine.assert_entity(trigger, &store);
    let d1 = fire_asserting(&mut engine, &mut store, vec![Value::Integer(1)]);

    let (activation, _) = engine.agenda().iter().next().unwrap();
    engine.begin_fire(activation).unwrap();
    let d2 = store.put(T_DERIVED, vec![Value::Integer(2)]);
    engine.add_logical_dependencies(d2, false, 0);
    engine.assert_entity(d2, &store);
    engine.end_fire();

    // Retracting the root takes down the whole derivation chain.
    retract(&mut engine, &mut store, trigger);
    engine.force_logical_retractions(&mut store);
    assert!(store.is_deleted(d1));
    assert!(store.is_deleted(d2));
    assert_eq!(engine.pool().live_alpha_matches(), 0);
}
