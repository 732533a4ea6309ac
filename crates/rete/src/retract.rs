//! Retract pathway and garbage discipline
//!
//! Propagates the removal of an alpha match through the join network
//! while never touching freed matches and while re-evaluating negated and
//! exists constraints that the removal may have satisfied or broken.
//!
//! Every operation here is infallible from the caller's perspective.
//! Internal inconsistencies are reported and the offending entry skipped;
//! the retraction never unwinds.

use crate::beta::{self, Direction, RightEntry};
use crate::drive::Operation;
use crate::engine::Engine;
use match_model::{
    EntityId, EntityStore, GenericMatch, JoinId, Owner, PartialMatchId, PatternMatch,
    PatternNodeId,
};
use tracing::debug;

impl Engine {
    /// Retract an entity: withdraw every alpha match it produced and all
    /// their consequences. Retracting an entity the network does not know
    /// is a no-op.
    pub fn retract_entity<S: EntityStore>(&mut self, entity: EntityId, store: &S) {
        let Some(list) = self.entity_matches.remove(&entity) else {
            return;
        };
        debug!(?entity, patterns = list.len(), "network retract");
        self.network_retract(list, store);
        self.remove_entity_dependencies(entity);
        if self.firing_basis.is_none() {
            self.flush_garbage_partial_matches();
        }
    }

    /// Retract a list of pattern matches head-to-tail.
    pub fn network_retract<S: EntityStore>(&mut self, list: Vec<PatternMatch>, store: &S) {
        for entry in list {
            self.network_retract_match(entry, store);
        }
    }

    /// Retract a single pattern match: positive consequences first, then
    /// matches this alpha entry was blocking, then the alpha memory entry
    /// itself.
    pub fn network_retract_match<S: EntityStore>(&mut self, entry: PatternMatch, store: &S) {
        let the_match = entry.the_match;
        if self.pool.get(the_match).is_none() {
            self.system_error("RETRACT", 110);
            return;
        }
        self.pool[the_match].deleting = true;

        if self.pool[the_match].children.is_some() {
            self.pos_entry_retract_alpha(the_match, Operation::Retract, store);
        }

        if self.pool[the_match].block_list.is_some() {
            self.neg_entry_retract_alpha(the_match, Operation::Retract, store);
        }

        self.remove_alpha_memory_matches(entry.matching_pattern, the_match);
    }

    /// Unlink an alpha-memory entry from its bucket and queue its alpha
    /// match for the next safe-point flush. RHS actions read variable
    /// bindings through alpha matches, so the flush is deferred.
    fn remove_alpha_memory_matches(&mut self, pattern: PatternNodeId, the_match: PartialMatchId) {
        let Some(memory) = self.patterns.node(pattern).and_then(|n| n.alpha_memory) else {
            self.system_error("RETRACT", 114);
            return;
        };
        let bucket = self.pool[the_match].hash_value;
        self.patterns
            .memory_mut(memory)
            .remove(&mut self.pool, the_match, bucket);

        if let Some(alpha) = self.pool[the_match].alpha_at(0) {
            self.garbage_alphas.push(alpha);
            self.pool[the_match].binds[0] = GenericMatch::Empty;
        }
        self.return_partial_match(the_match);
    }

    /// Retract the positive consequences of an alpha-memory entry: every
    /// beta match that included it.
    pub(crate) fn pos_entry_retract_alpha<S: EntityStore>(
        &mut self,
        alpha_match: PartialMatchId,
        op: Operation,
        store: &S,
    ) {
        let mut beta = self.pool[alpha_match].children;
        let last_join: Option<JoinId> = beta
            .and_then(|b| self.pool[b].owner.and_then(Owner::join))
            .and_then(|j| self.joins[j].last_level);

        while let Some(b) = beta {
            let Some(owner) = self.pool[b].owner.and_then(Owner::join) else {
                self.system_error("RETRACT", 111);
                beta = self.pool[b].next_right_child;
                continue;
            };

            if let Some(first) = self.pool[b].children {
                self.pos_entry_retract_beta(b, first, op, store);
            }

            if self.pool[b].rhs_memory {
                self.neg_entry_retract_alpha(b, op, store);
            }

            if self.joins[owner].rule_to_activate.is_some() {
                if let Some(activation) = self.pool[b].marker {
                    self.agenda.remove(activation);
                    self.pool[b].marker = None;
                }
            }

            if self.pool[b].goal_marker {
                self.update_goal_support(b);
            }
            let goal_parent = match last_join {
                Some(lj) if self.joins[lj].flags.goal_join => self.pool[b].left_parent,
                _ => None,
            };

            // The sibling chain self-heals on unlink; read the successor
            // only after the recursive passes above are done.
            let temp = self.pool[b].next_right_child;

            let side = if self.pool[b].rhs_memory {
                Direction::Rhs
            } else {
                Direction::Lhs
            };
            beta::unlink_beta_pm_from_node_and_lineage(
                &mut self.joins,
                &mut self.pool,
                owner,
                b,
                side,
            );

            if let (Some(parent), Some(lj)) = (goal_parent, last_join) {
                if self.pool.get(parent).is_some() && self.pool[parent].children.is_none() {
                    self.attach_goal(lj, parent);
                }
            }

            self.delete_partial_matches(b);
            beta = temp;
        }

        // A goal first-join whose alpha memory just emptied re-attaches
        // its goal to the left prime match.
        if let Some(lj) = last_join {
            let view = self.join_view(lj);
            if view.flags.first_join && view.goal_expression.is_some() {
                if let Some(RightEntry::Pattern(node)) = view.right_side_entry {
                    let head = self
                        .patterns
                        .node(node)
                        .and_then(|n| n.alpha_memory)
                        .and_then(|m| self.patterns.memory(m).bucket_head(0));
                    if head == Some(alpha_match)
                        && self.pool[alpha_match].next_in_memory.is_none()
                    {
                        if let Some(prime) = self.joins[lj].left_memory.bucket_head(0) {
                            self.attach_goal(lj, prime);
                        }
                    }
                }
            }
        }
    }

    /// The blocker `alpha_match` is going away: every left match it was
    /// blocking re-checks for another conflicting right match and, when
    /// none exists, produces the positive consequence of its negation.
    pub(crate) fn neg_entry_retract_alpha<S: EntityStore>(
        &mut self,
        alpha_match: PartialMatchId,
        op: Operation,
        store: &S,
    ) {
        let mut beta = self.pool[alpha_match].block_list;
        while let Some(b) = beta {
            let owner = self.pool[b].owner.and_then(Owner::join);
            let valid = owner
                .map(|j| self.joins[j].flags.uses_block_list())
                .unwrap_or(false);
            if !valid {
                self.system_error("RETRACT", 117);
                beta = self.pool[b].next_blocked;
                continue;
            }
            let join = owner.unwrap_or(JoinId(0));

            self.neg_entry_retract_beta(join, alpha_match, b, op, store);
            beta = self.pool[alpha_match].block_list;
        }
    }

    /// One blocked left match loses its blocker.
    fn neg_entry_retract_beta<S: EntityStore>(
        &mut self,
        join: JoinId,
        alpha_match: PartialMatchId,
        beta_match: PartialMatchId,
        op: Operation,
        store: &S,
    ) {
        beta::remove_blocked_link(&mut self.pool, beta_match);

        let start = self.pool[alpha_match].next_in_memory;
        if self.find_next_conflicting_match(beta_match, start, join, alpha_match, op, store) {
            return;
        }

        let view = self.join_view(join);

        if view.flags.pattern_is_exists {
            // The last right match is gone: the exists condition failed
            // and its consequences come down.
            if let Some(first) = self.pool[beta_match].children {
                self.pos_entry_retract_beta(beta_match, first, op, store);
            }
            return;
        }

        if view.flags.first_join
            && (view.flags.pattern_is_negated || view.flags.join_from_the_right)
            && !view.flags.pattern_is_exists
        {
            if !self.secondary_test_passes(&view, join, beta_match, store) {
                return;
            }
            self.epm_drive(beta_match, join, op, store);
            return;
        }

        if !self.secondary_test_passes(&view, join, beta_match, store) {
            return;
        }

        // The left match now satisfies its negated condition; produce the
        // positive consequence unless the match is itself doomed.
        if op == Operation::Retract && self.partial_match_will_be_deleted(beta_match, store) {
            return;
        }

        self.pp_drive(beta_match, None, join, op, store);
    }

    /// Iterative depth-first retraction of the beta subtree under
    /// `parent_match`, starting at `first_child`.
    pub(crate) fn pos_entry_retract_beta<S: EntityStore>(
        &mut self,
        parent_match: PartialMatchId,
        first_child: PartialMatchId,
        op: Operation,
        store: &S,
    ) {
        let mut beta = first_child;
        loop {
            if let Some(child) = self.pool[beta].children {
                beta = child;
                continue;
            }

            let temp = match self.pool[beta].next_left_child {
                Some(next) => next,
                None => match self.pool[beta].left_parent {
                    Some(parent) => {
                        self.pool[parent].children = None;
                        parent
                    }
                    None => {
                        self.system_error("RETRACT", 112);
                        return;
                    }
                },
            };

            if self.pool[beta].block_list.is_some() {
                self.neg_entry_retract_alpha(beta, op, store);
            } else if let Some(owner) = self.pool[beta].owner.and_then(Owner::join) {
                if self.joins[owner].rule_to_activate.is_some() {
                    if let Some(activation) = self.pool[beta].marker {
                        self.agenda.remove(activation);
                        self.pool[beta].marker = None;
                    }
                }
            }

            let side = if self.pool[beta].rhs_memory {
                Direction::Rhs
            } else {
                Direction::Lhs
            };
            match self.pool[beta].owner.and_then(Owner::join) {
                Some(owner) => beta::unlink_non_left_lineage(
                    &mut self.joins,
                    &mut self.pool,
                    owner,
                    beta,
                    side,
                ),
                None => self.system_error("RETRACT", 113),
            }

            if self.pool[beta].goal_marker {
                self.update_goal_support(beta);
            }
            if !self.pool[beta].dependents.is_empty() {
                self.remove_logical_support(beta);
            }
            self.return_partial_match(beta);

            if temp == parent_match {
                return;
            }
            beta = temp;
        }
    }

    /// Scan right-memory entries after `skip` for another match that
    /// conflicts with `the_bind`; the first one found becomes the new
    /// blocker. Defunct and doomed entries are skipped silently; a test
    /// that errors is treated as conflicting, which keeps the blocker and
    /// preserves invariants at the cost of an extra partial match.
    fn find_next_conflicting_match<S: EntityStore>(
        &mut self,
        the_bind: PartialMatchId,
        possible_conflicts: Option<PartialMatchId>,
        join: JoinId,
        skip: PartialMatchId,
        op: Operation,
        store: &S,
    ) -> bool {
        let saved = self.globals;
        let restore = possible_conflicts.is_some();
        if restore {
            self.globals.lhs_binds = Some(the_bind);
            self.globals.join = Some(join);
        }

        let view = self.join_view(join);
        let mut cursor = possible_conflicts;
        while let Some(candidate) = cursor {
            let next = self.pool[candidate].next_in_memory;

            let mut result = false;
            if candidate == skip {
                // Skip the match being retracted.
            } else if self.partial_match_defunct(candidate, store) {
                // Out of date with respect to lazy evaluation; ignore.
            } else if op == Operation::Retract
                && self.partial_match_will_be_deleted(candidate, store)
            {
                // Scheduled for deletion in this retraction; ignore.
            } else if view.network_test.is_none() {
                result = true;
            } else {
                self.globals.rhs_binds = Some(candidate);
                result = self.evaluate_join_test(
                    view.network_test,
                    join,
                    the_bind,
                    Some(candidate),
                    store,
                    true,
                );
            }

            if result {
                beta::add_blocked_link(&mut self.pool, the_bind, candidate);
                self.globals = saved;
                return true;
            }
            cursor = next;
        }

        if restore {
            self.globals = saved;
        }
        false
    }

    /// Has any entity bound in the match changed since it was pushed
    /// through the network, or is the match already marked deleting?
    pub fn partial_match_defunct<S: EntityStore>(&self, id: PartialMatchId, store: &S) -> bool {
        let Some(pm) = self.pool.get(id) else {
            return true;
        };
        if pm.deleting {
            return true;
        }
        for bind in &pm.binds {
            if let Some(alpha) = bind.alpha() {
                if let Some(am) = self.pool.alpha(alpha) {
                    if !store.synchronized(am.entity) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Is any entity bound in the match deleted or pending deletion as
    /// part of the retraction in progress?
    pub fn partial_match_will_be_deleted<S: EntityStore>(
        &self,
        id: PartialMatchId,
        store: &S,
    ) -> bool {
        let Some(pm) = self.pool.get(id) else {
            return true;
        };
        if pm.deleting {
            return true;
        }
        for bind in &pm.binds {
            if let Some(alpha) = bind.alpha() {
                if let Some(am) = self.pool.alpha(alpha) {
                    if store.is_deleted(am.entity) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Release a detached match: logical support first, then the match
    /// itself.
    pub(crate) fn delete_partial_matches(&mut self, id: PartialMatchId) {
        if !self.pool[id].dependents.is_empty() {
            self.remove_logical_support(id);
        }
        self.return_partial_match(id);
    }

    /// Return a match to the pool, or park it on the garbage list while a
    /// running RHS still holds it.
    pub(crate) fn return_partial_match(&mut self, id: PartialMatchId) {
        if self.pool[id].goal_marker {
            self.update_goal_support(id);
        }

        if self.pool[id].busy {
            self.garbage_partials.push(id);
            return;
        }

        if !self.pool[id].beta_memory {
            if let Some(alpha) = self.pool[id].alpha_at(0) {
                self.pool.remove_alpha(alpha);
            }
        }

        if !self.pool[id].dependents.is_empty() {
            self.remove_pm_dependencies(id);
        }

        self.pool.remove(id);
    }

    /// Teardown variant: frees without honoring `busy` and destroys
    /// dependencies instead of gracefully removing them.
    pub fn destroy_partial_match(&mut self, id: PartialMatchId) {
        if self.pool.get(id).is_none() {
            return;
        }
        if !self.pool[id].beta_memory {
            if let Some(alpha) = self.pool[id].alpha_at(0) {
                self.pool.remove_alpha(alpha);
            }
        }
        if !self.pool[id].dependents.is_empty() {
            self.destroy_pm_dependencies(id);
        }
        self.pool.remove(id);
    }

    /// Environment teardown: forcibly destroy every live match, ignoring
    /// `busy`, and drop the garbage queues. The network topology itself
    /// survives; only runtime match state is swept.
    pub fn destroy_all_matches(&mut self) {
        for alpha in std::mem::take(&mut self.garbage_alphas) {
            self.pool.remove_alpha(alpha);
        }
        let ids: Vec<PartialMatchId> = self.pool.iter_partials().map(|(id, _)| id).collect();
        for id in ids {
            self.destroy_partial_match(id);
        }
        self.garbage_partials.clear();
        self.entity_matches.clear();
        self.entity_supports.clear();
        self.logical_only.clear();
        self.pending_logical_retracts.clear();
    }

    /// Reclaim everything queued by retractions since the last safe
    /// point. Runs after RHS actions complete, so no binding a running
    /// action reads is ever freed under it.
    pub fn flush_garbage_partial_matches(&mut self) {
        for alpha in std::mem::take(&mut self.garbage_alphas) {
            self.pool.remove_alpha(alpha);
        }

        for id in std::mem::take(&mut self.garbage_partials) {
            if self.pool.get(id).is_some() {
                self.pool[id].busy = false;
                self.return_partial_match(id);
            }
        }
    }

    /// Move a join's goal attachment onto `target`. Re-attaching to the
    /// current carrier is a no-op; otherwise the previous carrier loses
    /// its support first.
    pub(crate) fn attach_goal(&mut self, join: JoinId, target: PartialMatchId) {
        if let Some(previous) = self.goals.attachment(join) {
            if previous == target {
                return;
            }
            if self.goals.drop_support(previous) {
                if let Some(pm) = self.pool.get_mut(previous) {
                    pm.goal_marker = false;
                }
            }
        }
        self.pool[target].goal_marker = true;
        self.goals.attach(join, target);
    }

    fn update_goal_support(&mut self, target: PartialMatchId) {
        if self.goals.drop_support(target) {
            if let Some(pm) = self.pool.get_mut(target) {
                pm.goal_marker = false;
            }
        }
    }
}
