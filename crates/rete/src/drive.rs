//! Assert pathway
//!
//! New working-memory entities enter the pattern network, land in alpha
//! memories, and propagate through the joins attached to each memory.
//! Positive joins drive one combined match per compatible pair; negated
//! joins record a blocking link instead of driving; exists joins drive
//! exactly once when the first compatible right match appears.
//!
//! Produced matches are linked into the target join's memory and into
//! their parents' child lists before propagation continues, so the
//! retract pathway can always walk the lineage of anything it finds.

use crate::beta::{self, Direction, JoinFlags, JoinLink, RightEntry};
use crate::engine::Engine;
use crate::expr::{self, BindRole, JoinContext};
use match_model::{
    AlphaMatch, EntityId, EntityStore, GenericMatch, JoinId, Owner, PartialMatch, PartialMatchId,
    PatternMatch, RuleId, TestId,
};
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Which network operation is driving the current propagation
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    /// Assert of a working-memory entity
    Assert,
    /// Retract of a working-memory entity
    Retract,
}

/// Immutable snapshot of the join fields the drive and retract pathways
/// consult while the arenas are being mutated.
#[derive(Clone, Debug)]
pub(crate) struct JoinView {
    pub flags: JoinFlags,
    pub network_test: Option<TestId>,
    pub secondary_network_test: Option<TestId>,
    pub goal_expression: Option<TestId>,
    pub left_hash: Option<TestId>,
    pub right_hash: Option<TestId>,
    pub right_side_entry: Option<RightEntry>,
    pub next_links: SmallVec<[JoinLink; 2]>,
    pub rule_to_activate: Option<RuleId>,
}

impl Engine {
    pub(crate) fn join_view(&self, join: JoinId) -> JoinView {
        let j = &self.joins[join];
        JoinView {
            flags: j.flags,
            network_test: j.network_test,
            secondary_network_test: j.secondary_network_test,
            goal_expression: j.goal_expression,
            left_hash: j.left_hash,
            right_hash: j.right_hash,
            right_side_entry: j.right_side_entry,
            next_links: j.next_links.clone(),
            rule_to_activate: j.rule_to_activate,
        }
    }

    /// Push an entity through the pattern network and drive every join
    /// reachable from the alpha memories it lands in.
    pub fn assert_entity<S: EntityStore>(&mut self, entity: EntityId, store: &S) {
        debug!(?entity, "network assert");
        let entries = self.patterns.matching_entries(&self.exprs, entity, store);
        for entry in entries {
            let Some(node) = self.patterns.node(entry.node) else {
                self.system_error("DRIVE", 101);
                continue;
            };
            let Some(memory) = node.alpha_memory else {
                self.system_error("DRIVE", 102);
                continue;
            };
            let right_hash = node.right_hash;
            let entry_join = node.entry_join;

            let bucket = expr::eval_alpha_hash(&self.exprs, right_hash, entity, store);
            let alpha = self.pool.insert_alpha(AlphaMatch {
                entity,
                markers: entry.markers.clone(),
                bucket,
            });
            let mut pm = PartialMatch::with_binds(smallvec::smallvec![GenericMatch::Alpha(alpha)]);
            pm.owner = Some(Owner::AlphaMemory(memory));
            pm.hash_value = bucket;
            let pm = self.pool.insert(pm);
            self.patterns.memory_mut(memory).insert(&mut self.pool, pm, bucket);
            self.entity_matches.entry(entity).or_default().push(PatternMatch {
                the_match: pm,
                matching_pattern: entry.node,
            });

            let mut join = entry_join;
            while let Some(j) = join {
                self.network_assert_right(pm, j, Operation::Assert, store);
                join = self.joins[j].right_match_node;
            }
        }
    }

    /// A partial match enters a join from the left.
    pub(crate) fn network_assert_left<S: EntityStore>(
        &mut self,
        lhs: PartialMatchId,
        join: JoinId,
        op: Operation,
        store: &S,
    ) {
        let view = self.join_view(join);

        // Terminal join: the match is the full instantiation.
        if let Some(rule) = view.rule_to_activate {
            if self.pool[lhs].deleting
                || (op == Operation::Retract && self.partial_match_will_be_deleted(lhs, store))
            {
                return;
            }
            let activation = self.agenda.add(rule, lhs);
            self.pool[lhs].marker = Some(activation);
            trace!(?rule, origin = ?lhs, "activation created");
            return;
        }

        let hash = self.pool[lhs].hash_value;
        let candidates = self.right_candidates(&view, join, hash);

        if view.flags.pattern_is_negated || view.flags.pattern_is_exists {
            for rhs in candidates {
                if !self.right_match_usable(rhs, op, store) {
                    continue;
                }
                if self.evaluate_join_test(view.network_test, join, lhs, Some(rhs), store, false) {
                    beta::add_blocked_link(&mut self.pool, lhs, rhs);
                    if view.flags.pattern_is_exists {
                        if self.secondary_test_passes(&view, join, lhs, store) {
                            self.pp_drive(lhs, None, join, op, store);
                        }
                    }
                    return;
                }
            }
            // No conflicting right match.
            if view.flags.pattern_is_negated || view.flags.join_from_the_right {
                if self.secondary_test_passes(&view, join, lhs, store) {
                    self.pp_drive(lhs, None, join, op, store);
                }
            }
            return;
        }

        for rhs in candidates {
            if !self.right_match_usable(rhs, op, store) {
                continue;
            }
            if self.evaluate_join_test(view.network_test, join, lhs, Some(rhs), store, false) {
                self.pp_drive(lhs, Some(rhs), join, op, store);
            }
        }
    }

    /// A partial match enters a join from the right.
    pub(crate) fn network_assert_right<S: EntityStore>(
        &mut self,
        rhs: PartialMatchId,
        join: JoinId,
        op: Operation,
        store: &S,
    ) {
        let view = self.join_view(join);
        let candidates = if view.flags.first_join {
            self.joins[join]
                .left_memory
                .bucket_head(0)
                .into_iter()
                .collect()
        } else {
            let hash = self.pool[rhs].hash_value;
            self.joins[join].left_memory.bucket_ids(&self.pool, hash)
        };

        for lhs in candidates {
            if self.pool.get(lhs).is_none() || self.pool[lhs].deleting {
                continue;
            }

            if view.flags.pattern_is_negated {
                if self.pool[lhs].is_blocked() {
                    continue;
                }
                if self.evaluate_join_test(view.network_test, join, lhs, Some(rhs), store, false) {
                    beta::add_blocked_link(&mut self.pool, lhs, rhs);
                    let children = self.pool[lhs].children;
                    if let Some(first) = children {
                        self.pos_entry_retract_beta(lhs, first, op, store);
                    }
                }
            } else if view.flags.pattern_is_exists {
                if self.pool[lhs].is_blocked() {
                    continue;
                }
                if self.evaluate_join_test(view.network_test, join, lhs, Some(rhs), store, false) {
                    beta::add_blocked_link(&mut self.pool, lhs, rhs);
                    if self.secondary_test_passes(&view, join, lhs, store) {
                        self.pp_drive(lhs, None, join, op, store);
                    }
                }
            } else if self.evaluate_join_test(view.network_test, join, lhs, Some(rhs), store, false)
            {
                self.pp_drive(lhs, Some(rhs), join, op, store);
            }
        }
    }

    /// Produce the combination of a left and (optional) right match and
    /// send it through the join's downward links.
    pub(crate) fn pp_drive<S: EntityStore>(
        &mut self,
        lhs: PartialMatchId,
        rhs: Option<PartialMatchId>,
        join: JoinId,
        op: Operation,
        store: &S,
    ) {
        let view = self.join_view(join);
        for link in view.next_links.clone() {
            self.drive_into_link(lhs, rhs, link, join, view.flags.goal_join, op, store);
        }
    }

    /// Empty-right drive: propagate a left match whose negated or
    /// right-entry condition is satisfied with no right binding at all.
    pub(crate) fn epm_drive<S: EntityStore>(
        &mut self,
        lhs: PartialMatchId,
        join: JoinId,
        op: Operation,
        store: &S,
    ) {
        trace!(?join, ?lhs, "empty partial match drive");
        self.pp_drive(lhs, None, join, op, store);
    }

    #[allow(clippy::too_many_arguments)]
    fn drive_into_link<S: EntityStore>(
        &mut self,
        lhs: PartialMatchId,
        rhs: Option<PartialMatchId>,
        link: JoinLink,
        source: JoinId,
        source_is_goal: bool,
        op: Operation,
        store: &S,
    ) {
        let target = link.join;
        let target_view = self.join_view(target);

        let mut binds = self.pool[lhs].binds.clone();
        match rhs.and_then(|r| self.pool[r].alpha_at(0)) {
            Some(alpha) => binds.push(GenericMatch::Alpha(alpha)),
            None => binds.push(GenericMatch::Empty),
        }

        let mut merged = PartialMatch::with_binds(binds);
        merged.beta_memory = true;
        merged.owner = Some(Owner::Join(target));
        merged.rhs_memory = link.enter_direction == Direction::Rhs;
        merged.hash_value = match link.enter_direction {
            Direction::Lhs => expr::eval_hash(
                &self.exprs,
                target_view.left_hash,
                &merged,
                BindRole::Left,
                &self.pool,
                store,
            ),
            Direction::Rhs => expr::eval_hash(
                &self.exprs,
                target_view.right_hash,
                &merged,
                BindRole::Right,
                &self.pool,
                store,
            ),
        };

        let merged = self.pool.insert(merged);
        self.joins[target]
            .memory_mut(link.enter_direction)
            .insert(&mut self.pool, merged);
        beta::link_lineage(&mut self.pool, merged, Some(lhs), rhs);

        // The goal of the producing join migrates onto the deepest match
        // it has driven.
        if source_is_goal {
            self.attach_goal(source, merged);
        }

        match link.enter_direction {
            Direction::Lhs => self.network_assert_left(merged, target, op, store),
            Direction::Rhs => self.network_assert_right(merged, target, op, store),
        }
    }

    /// Right-side candidates of a join in the bucket for `hash`: the
    /// pattern's alpha memory for pattern-entry joins, the join's own
    /// right memory for join-from-the-right.
    pub(crate) fn right_candidates(
        &self,
        view: &JoinView,
        join: JoinId,
        hash: u64,
    ) -> Vec<PartialMatchId> {
        match view.right_side_entry {
            Some(RightEntry::Pattern(node)) => {
                let Some(memory) = self.patterns.node(node).and_then(|n| n.alpha_memory) else {
                    return Vec::new();
                };
                let mut ids = Vec::new();
                let mut cursor = self.patterns.memory(memory).bucket_head(hash);
                while let Some(id) = cursor {
                    ids.push(id);
                    cursor = self.pool[id].next_in_memory;
                }
                ids
            }
            Some(RightEntry::Join(_)) | None => {
                self.joins[join].right_memory.bucket_ids(&self.pool, hash)
            }
        }
    }

    fn right_match_usable<S: EntityStore>(
        &mut self,
        rhs: PartialMatchId,
        op: Operation,
        store: &S,
    ) -> bool {
        if self.pool.get(rhs).is_none() {
            return false;
        }
        if self.partial_match_defunct(rhs, store) {
            return false;
        }
        if op == Operation::Retract && self.partial_match_will_be_deleted(rhs, store) {
            return false;
        }
        true
    }

    pub(crate) fn secondary_test_passes<S: EntityStore>(
        &mut self,
        view: &JoinView,
        join: JoinId,
        lhs: PartialMatchId,
        store: &S,
    ) -> bool {
        match view.secondary_network_test {
            Some(test) => self.evaluate_join_test(Some(test), join, lhs, None, store, false),
            None => true,
        }
    }

    /// Evaluate a join test with the evaluation globals installed.
    /// Evaluation errors are coerced to `err_default` and counted; they
    /// never propagate.
    pub(crate) fn evaluate_join_test<S: EntityStore>(
        &mut self,
        test: Option<TestId>,
        join: JoinId,
        lhs: PartialMatchId,
        rhs: Option<PartialMatchId>,
        store: &S,
        err_default: bool,
    ) -> bool {
        let Some(test) = test else { return true };

        self.globals.lhs_binds = Some(lhs);
        self.globals.rhs_binds = rhs;
        self.globals.join = Some(join);

        let result = {
            let ctx = JoinContext {
                lhs: self.pool.get(lhs),
                rhs: rhs.and_then(|r| self.pool.get(r)),
                pool: &self.pool,
                store,
            };
            expr::eval_join_test(&self.exprs, test, &ctx)
        };

        match result {
            Ok(value) => value,
            Err(err) => {
                self.diagnostics.eval_errors += 1;
                debug!(?join, %err, coerced = err_default, "join test evaluation error");
                err_default
            }
        }
    }
}
