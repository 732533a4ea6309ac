//! Goal attachment behavior on a goal-driven rule
//!
//! The goal of a goal-driven rule rides the deepest match its first join
//! has produced: it starts on the left prime match, migrates onto the
//! join's output when an entity arrives, survives retractions below the
//! carrier, and re-attaches upstream when the carrier itself dies.

mod common;

use common::{retract, TestStore};
use rete::{Engine, JoinId, PatternSpec, RuleSpec, TemplateId};

const T_A: u32 = 0;
const T_B: u32 = 1;

fn goal_rule() -> RuleSpec {
    RuleSpec::new("seek")
        .goal_driven()
        .pattern(PatternSpec::new(TemplateId(T_A)))
        .pattern(PatternSpec::new(TemplateId(T_B)))
}

fn goal_join(engine: &Engine) -> JoinId {
    engine
        .joins()
        .iter()
        .find(|(_, join)| join.flags.goal_join)
        .map(|(id, _)| id)
        .expect("the rule has a goal join")
}

#[test]
fn test_goal_join_carries_expression_and_prime_chain() {
    let store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(goal_rule(), &store).unwrap();

    let join = goal_join(&engine);
    let node = engine.joins().get(join).unwrap();
    assert!(node.flags.first_join);
    assert!(node.goal_expression.is_some());
    assert_eq!(engine.joins().goal_prime.len(), 1);
    assert_eq!(engine.joins().goal_prime[0].join, join);
}

#[test]
fn test_goal_starts_on_left_prime_match() {
    let store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(goal_rule(), &store).unwrap();

    let join = goal_join(&engine);
    let target = engine.goal_attachment(join).expect("goal attached at compile");
    let pm = &engine.pool()[target];
    assert!(pm.goal_marker);
    assert_eq!(pm.bcount(), 0, "attachment point is the left prime match");
}

#[test]
fn test_goal_migrates_down_on_assert_and_back_on_retract() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(goal_rule(), &store).unwrap();
    let join = goal_join(&engine);
    let prime = engine.goal_attachment(join).unwrap();

    // The first join produces a match: the goal rides it.
    let a = store.put(T_A, vec![]);
    engine.assert_entity(a, &store);
    let carrier = engine.goal_attachment(join).expect("goal stays attached");
    assert_ne!(carrier, prime);
    assert_eq!(engine.pool()[carrier].bcount(), 1);
    assert!(engine.pool()[carrier].goal_marker);
    assert!(!engine.pool()[prime].goal_marker, "the prime handed the goal off");

    // Completing and withdrawing the instantiation below the carrier
    // leaves the attachment alone.
    let b = store.put(T_B, vec![]);
    engine.assert_entity(b, &store);
    assert_eq!(engine.agenda().len(), 1);
    assert_eq!(engine.goal_attachment(join), Some(carrier));

    retract(&mut engine, &mut store, b);
    assert!(engine.agenda().is_empty());
    assert_eq!(engine.goal_attachment(join), Some(carrier));

    // The carrier dies: the goal re-attaches to the surviving parent.
    retract(&mut engine, &mut store, a);
    let target = engine.goal_attachment(join).expect("goal re-attached upstream");
    assert_eq!(engine.pool()[target].bcount(), 0);
    assert!(engine.pool()[target].goal_marker);
    assert_eq!(engine.diagnostics().system_errors, 0);
}

#[test]
fn test_goal_reattaches_when_carrier_dies_with_live_subtree() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    engine.add_rule(goal_rule(), &store).unwrap();
    let join = goal_join(&engine);

    let a = store.put(T_A, vec![]);
    let b = store.put(T_B, vec![]);
    engine.assert_entity(a, &store);
    engine.assert_entity(b, &store);
    assert_eq!(engine.agenda().len(), 1);

    // The carrier and its whole instantiation subtree come down in one
    // retraction; the goal still lands back on the prime match.
    retract(&mut engine, &mut store, a);
    assert!(engine.agenda().is_empty());
    let target = engine.goal_attachment(join).expect("goal re-attached");
    assert_eq!(engine.pool()[target].bcount(), 0);
    assert_eq!(engine.diagnostics().system_errors, 0);
}

#[test]
fn test_goal_lands_on_live_match_when_rule_added_late() {
    let mut store = TestStore::new();
    let mut engine = Engine::new();
    // Seed the shared pattern so the entity is in its alpha memory.
    engine
        .add_rule(RuleSpec::new("seed").pattern(PatternSpec::new(TemplateId(T_A))), &store)
        .unwrap();
    let a = store.put(T_A, vec![]);
    engine.assert_entity(a, &store);

    engine.add_rule(goal_rule(), &store).unwrap();
    let join = goal_join(&engine);
    let target = engine.goal_attachment(join).expect("goal attached during priming");
    assert_eq!(
        engine.pool()[target].bcount(),
        1,
        "goal rides the produced match, not the prime"
    );
}
