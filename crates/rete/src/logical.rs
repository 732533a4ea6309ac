//! Truth maintenance (logical dependencies)
//!
//! An entity asserted by a rule firing under a `logical` conditional is
//! supported by the partial match the rule fired on. Support is threaded
//! both ways: each entity knows the matches supporting it, each match
//! knows the entities it supports. When a supporting match is retracted
//! and the entity loses its last support, the entity is scheduled for
//! retraction; the fixed-point pass at the next safe point carries the
//! cascade until nothing more falls.
//!
//! Certainty factors ride on each dependency; the combined support of an
//! entity is the maximum of its contributors.

use crate::engine::Engine;
use match_model::{
    Dependency, EntityId, EntityStoreMut, JoinId, Owner, PartialMatchId,
};
use tracing::{debug, trace};

/// Certainty factors are clamped to this magnitude.
pub const MAX_CERTAINTY: i16 = 10_000;

impl Engine {
    /// Record logical support for `entity` from the basis of the
    /// currently firing activation. `existing` says whether the entity
    /// was already present in working memory.
    ///
    /// Returns true when support was added. No support is added when the
    /// firing rule has no logical join (the assertion is unconditional),
    /// or when the entity already exists unconditionally. An
    /// unconditional re-assert of a previously logical-only entity strips
    /// its logical support.
    pub fn add_logical_dependencies(&mut self, entity: EntityId, existing: bool, cf: i16) -> bool {
        let logical_join = self
            .firing_rule
            .and_then(|rule| self.rules.get(rule.index()))
            .and_then(|info| info.logical_join);

        let Some(join) = logical_join else {
            if existing && self.logical_only.contains(&entity) {
                self.remove_entity_dependencies(entity);
            }
            return false;
        };

        if existing && !self.logical_only.contains(&entity) {
            return false;
        }

        let Some(basis) = self.firing_basis else {
            self.system_error("LGCLDPND", 120);
            return false;
        };
        let Some(bind) = self.find_logical_bind(join, basis) else {
            self.system_error("LGCLDPND", 121);
            return false;
        };

        let cf = cf.clamp(-MAX_CERTAINTY, MAX_CERTAINTY);
        self.pool[bind].dependents.push(Dependency { entity, cf });
        self.entity_supports.entry(entity).or_default().push((bind, cf));
        if !existing {
            self.logical_only.insert(entity);
        }
        trace!(?entity, ?bind, cf, "logical support added");
        true
    }

    /// Walk from the firing basis up the left lineage to the partial
    /// match owned by the rule's logical join.
    pub(crate) fn find_logical_bind(
        &self,
        join: JoinId,
        basis: PartialMatchId,
    ) -> Option<PartialMatchId> {
        let mut cursor = Some(basis);
        while let Some(id) = cursor {
            let pm = self.pool.get(id)?;
            if pm.owner == Some(Owner::Join(join)) {
                return Some(id);
            }
            cursor = pm.left_parent;
        }
        None
    }

    /// Strip every record tying `entity` to its supporters. Used when the
    /// entity leaves working memory for any reason.
    pub fn remove_entity_dependencies(&mut self, entity: EntityId) {
        if let Some(supports) = self.entity_supports.remove(&entity) {
            for (pm, _) in supports {
                if let Some(pm) = self.pool.get_mut(pm) {
                    pm.dependents.retain(|d| d.entity != entity);
                }
            }
        }
        self.logical_only.remove(&entity);
    }

    /// A supporting match is being retracted: withdraw its support and
    /// schedule entities that lost their last support.
    pub(crate) fn remove_logical_support(&mut self, id: PartialMatchId) {
        let dependents = std::mem::take(&mut self.pool[id].dependents);
        for dep in dependents {
            let Some(supports) = self.entity_supports.get_mut(&dep.entity) else {
                continue;
            };
            supports.retain(|(pm, _)| *pm != id);
            if supports.is_empty() {
                self.entity_supports.remove(&dep.entity);
                if self.logical_only.contains(&dep.entity) {
                    debug!(entity = ?dep.entity, "last logical support lost");
                    self.pending_logical_retracts.push(dep.entity);
                }
            } else {
                trace!(entity = ?dep.entity, "supporter lost, combined certainty re-derived");
            }
        }
    }

    /// Unthread a match's dependency records without scheduling
    /// retractions. Used when the match itself is freed.
    pub(crate) fn remove_pm_dependencies(&mut self, id: PartialMatchId) {
        let dependents = std::mem::take(&mut self.pool[id].dependents);
        for dep in dependents {
            if let Some(supports) = self.entity_supports.get_mut(&dep.entity) {
                supports.retain(|(pm, _)| *pm != id);
                if supports.is_empty() {
                    self.entity_supports.remove(&dep.entity);
                }
            }
        }
    }

    /// Teardown variant: drop the records outright. Entity-side state is
    /// being destroyed with the environment.
    pub(crate) fn destroy_pm_dependencies(&mut self, id: PartialMatchId) {
        self.pool[id].dependents.clear();
    }

    /// Retract every entity scheduled for loss of logical support,
    /// iterating to fixed point: each retraction may strip support from
    /// further entities.
    pub fn force_logical_retractions<S: EntityStoreMut>(&mut self, store: &mut S) {
        let mut iterations = 0usize;
        while let Some(entity) = self.pending_logical_retracts.pop() {
            iterations += 1;
            if iterations > self.config.max_logical_iterations {
                self.system_error("LGCLDPND", 122);
                self.pending_logical_retracts.clear();
                return;
            }
            if store.is_deleted(entity) {
                continue;
            }
            // Support may have been re-established since scheduling.
            if self.entity_supports.contains_key(&entity) {
                continue;
            }
            if !self.logical_only.contains(&entity) {
                continue;
            }
            debug!(?entity, "forced logical retraction");
            store.delete(entity);
            self.retract_entity(entity, &*store);
        }
    }

    /// Matches supporting an entity, with their certainty factors.
    pub fn dependencies_of(&self, entity: EntityId) -> Vec<(PartialMatchId, i16)> {
        self.entity_supports
            .get(&entity)
            .cloned()
            .unwrap_or_default()
    }

    /// Entities supported by a match.
    pub fn dependents_of(&self, id: PartialMatchId) -> &[Dependency] {
        self.pool
            .get(id)
            .map(|pm| pm.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Combined certainty of an entity's logical support: the maximum of
    /// its contributors.
    pub fn entity_support_cf(&self, entity: EntityId) -> Option<i16> {
        self.entity_supports
            .get(&entity)
            .and_then(|supports| supports.iter().map(|(_, cf)| *cf).max())
    }

    /// Is the entity held solely by logical support?
    pub fn has_logical_support(&self, entity: EntityId) -> bool {
        self.logical_only.contains(&entity)
    }
}
