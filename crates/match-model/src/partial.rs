//! Partial matches, alpha matches, and the match pool
//!
//! A partial match is an ordered tuple of bindings covering a prefix of a
//! rule's left-hand side. The same structure serves three roles:
//!
//! - wrapped around a single alpha match inside an alpha memory,
//! - stored in the left/right memories of joins as combinations grow,
//! - carried by a leaf join as the origin of an activation.
//!
//! Lineage (left/right parent and child chains), in-memory bucket chains,
//! and blocked chains are all intrusive id links so the retract pathway can
//! unlink a match from every structure that references it without search.

use crate::entity::EntityId;
use crate::ids::{ActivationId, AlphaMatchId, AlphaMemoryId, JoinId, PartialMatchId, PatternNodeId};
use crate::marker::MultifieldMarker;
use crate::value::Value;
use smallvec::SmallVec;

/// One successful match of a single pattern by a single entity
#[derive(Clone, Debug)]
pub struct AlphaMatch {
    /// The matching entity
    pub entity: EntityId,
    /// Spans bound by multifield restrictions, in pattern order
    pub markers: SmallVec<[MultifieldMarker; 2]>,
    /// Hash bucket within the owning alpha memory
    pub bucket: u64,
}

/// One cell of a partial match's bind tuple
///
/// Leaf slots hold the alpha match contributed at that join depth. A
/// negated or exists join contributes no entity, so its slot stays empty.
/// Intermediate slots may carry an arbitrary value (goal attachments,
/// pseudo-bindings).
#[derive(Clone, Debug, Default)]
pub enum GenericMatch {
    /// No binding at this depth
    #[default]
    Empty,
    /// Alpha match bound at this depth
    Alpha(AlphaMatchId),
    /// Arbitrary value binding
    Value(Value),
}

impl GenericMatch {
    /// Alpha match held by this cell, if any.
    pub fn alpha(&self) -> Option<AlphaMatchId> {
        match self {
            GenericMatch::Alpha(id) => Some(*id),
            _ => None,
        }
    }
}

/// What owns a partial match: a join's memory or an alpha memory bucket
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Owner {
    /// Beta-memory partial match owned by a join
    Join(JoinId),
    /// Alpha-memory partial match owned by a hashed alpha memory
    AlphaMemory(AlphaMemoryId),
}

impl Owner {
    /// The owning join, when the owner is one.
    pub fn join(self) -> Option<JoinId> {
        match self {
            Owner::Join(id) => Some(id),
            Owner::AlphaMemory(_) => None,
        }
    }
}

/// Logical-support record: one entity this partial match supports
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Dependency {
    /// Entity asserted under logical support of the owning partial match
    pub entity: EntityId,
    /// Certainty factor contributed, clamped to `[-10000, 10000]`
    pub cf: i16,
}

/// Per-entity record of one pattern the entity matched
///
/// Threaded per entity so a retraction can find every alpha-memory entry
/// the entity produced without walking the pattern network.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PatternMatch {
    /// The alpha-memory partial match wrapping the alpha match
    pub the_match: PartialMatchId,
    /// Terminal pattern node whose alpha memory holds it
    pub matching_pattern: PatternNodeId,
}

/// The central match structure
#[derive(Clone, Debug, Default)]
pub struct PartialMatch {
    /// Lives in a beta memory (vs. an alpha memory)
    pub beta_memory: bool,
    /// Referenced by a running right-hand side; defer freeing
    pub busy: bool,
    /// Lives in the right memory of its owning join
    pub rhs_memory: bool,
    /// Marked for retraction; traversals must skip it
    pub deleting: bool,
    /// Carries a goal attachment
    pub goal_marker: bool,

    /// Memory bucket hash
    pub hash_value: u64,
    /// Owning join or alpha memory
    pub owner: Option<Owner>,
    /// Activation produced at a leaf join, when one exists
    pub marker: Option<ActivationId>,
    /// Entities this match logically supports
    pub dependents: Vec<Dependency>,

    /// Next in the owning memory bucket
    pub next_in_memory: Option<PartialMatchId>,
    /// Previous in the owning memory bucket
    pub prev_in_memory: Option<PartialMatchId>,

    /// Head of the child list (matches this one drove)
    pub children: Option<PartialMatchId>,

    /// Right-side parent (alpha or beta match combined from the right)
    pub right_parent: Option<PartialMatchId>,
    /// Next sibling under `right_parent`
    pub next_right_child: Option<PartialMatchId>,
    /// Previous sibling under `right_parent`
    pub prev_right_child: Option<PartialMatchId>,

    /// Left-side parent
    pub left_parent: Option<PartialMatchId>,
    /// Next sibling under `left_parent`
    pub next_left_child: Option<PartialMatchId>,
    /// Previous sibling under `left_parent`
    pub prev_left_child: Option<PartialMatchId>,

    /// Head of the list of left matches this match blocks
    pub block_list: Option<PartialMatchId>,
    /// Next match blocked by the same blocker
    pub next_blocked: Option<PartialMatchId>,
    /// Previous match blocked by the same blocker
    pub prev_blocked: Option<PartialMatchId>,
    /// The blocker of this match, when it is blocked
    pub blocker: Option<PartialMatchId>,

    /// Bind tuple; one cell per join depth
    pub binds: SmallVec<[GenericMatch; 4]>,
}

impl PartialMatch {
    /// Fresh match with the given bind tuple.
    pub fn with_binds(binds: SmallVec<[GenericMatch; 4]>) -> Self {
        PartialMatch {
            binds,
            ..PartialMatch::default()
        }
    }

    /// Number of bind cells.
    pub fn bcount(&self) -> usize {
        self.binds.len()
    }

    /// Alpha match in the given bind slot, if that slot holds one.
    pub fn alpha_at(&self, position: usize) -> Option<AlphaMatchId> {
        self.binds.get(position).and_then(GenericMatch::alpha)
    }

    /// Is this match on some blocker's blocked list?
    pub fn is_blocked(&self) -> bool {
        self.blocker.is_some()
    }
}

/// Pool of partial matches and alpha matches
///
/// Freed slots go on free lists and are reused, which keeps ids dense and
/// lets the garbage discipline defer the free of `busy` matches without a
/// separate allocator.
#[derive(Debug, Default)]
pub struct PartialMatchPool {
    partials: Vec<Option<PartialMatch>>,
    free_partials: Vec<u32>,
    alphas: Vec<Option<AlphaMatch>>,
    free_alphas: Vec<u32>,
}

impl PartialMatchPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a partial match, reusing a freed slot when one exists.
    pub fn insert(&mut self, pm: PartialMatch) -> PartialMatchId {
        match self.free_partials.pop() {
            Some(slot) => {
                self.partials[slot as usize] = Some(pm);
                PartialMatchId(slot)
            }
            None => {
                self.partials.push(Some(pm));
                PartialMatchId((self.partials.len() - 1) as u32)
            }
        }
    }

    /// Remove a partial match, releasing its slot for reuse.
    pub fn remove(&mut self, id: PartialMatchId) -> Option<PartialMatch> {
        let slot = self.partials.get_mut(id.index())?;
        let pm = slot.take();
        if pm.is_some() {
            self.free_partials.push(id.0);
        }
        pm
    }

    /// Checked access.
    pub fn get(&self, id: PartialMatchId) -> Option<&PartialMatch> {
        self.partials.get(id.index()).and_then(Option::as_ref)
    }

    /// Checked mutable access.
    pub fn get_mut(&mut self, id: PartialMatchId) -> Option<&mut PartialMatch> {
        self.partials.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Store an alpha match.
    pub fn insert_alpha(&mut self, am: AlphaMatch) -> AlphaMatchId {
        match self.free_alphas.pop() {
            Some(slot) => {
                self.alphas[slot as usize] = Some(am);
                AlphaMatchId(slot)
            }
            None => {
                self.alphas.push(Some(am));
                AlphaMatchId((self.alphas.len() - 1) as u32)
            }
        }
    }

    /// Remove an alpha match, releasing its slot.
    pub fn remove_alpha(&mut self, id: AlphaMatchId) -> Option<AlphaMatch> {
        let slot = self.alphas.get_mut(id.index())?;
        let am = slot.take();
        if am.is_some() {
            self.free_alphas.push(id.0);
        }
        am
    }

    /// Checked alpha access.
    pub fn alpha(&self, id: AlphaMatchId) -> Option<&AlphaMatch> {
        self.alphas.get(id.index()).and_then(Option::as_ref)
    }

    /// Number of live partial matches.
    pub fn live_partial_matches(&self) -> usize {
        self.partials.len() - self.free_partials.len()
    }

    /// Number of live alpha matches.
    pub fn live_alpha_matches(&self) -> usize {
        self.alphas.len() - self.free_alphas.len()
    }

    /// Iterate live partial matches with their ids.
    pub fn iter_partials(&self) -> impl Iterator<Item = (PartialMatchId, &PartialMatch)> {
        self.partials
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|pm| (PartialMatchId(i as u32), pm)))
    }
}

impl std::ops::Index<PartialMatchId> for PartialMatchPool {
    type Output = PartialMatch;

    fn index(&self, id: PartialMatchId) -> &PartialMatch {
        match self.get(id) {
            Some(pm) => pm,
            None => panic!("stale partial match id {id:?}"),
        }
    }
}

impl std::ops::IndexMut<PartialMatchId> for PartialMatchPool {
    fn index_mut(&mut self, id: PartialMatchId) -> &mut PartialMatch {
        match self.partials.get_mut(id.index()).and_then(Option::as_mut) {
            Some(pm) => pm,
            None => panic!("stale partial match id {id:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn alpha_match(entity: u64) -> AlphaMatch {
        AlphaMatch {
            entity: EntityId(entity),
            markers: SmallVec::new(),
            bucket: 0,
        }
    }

    #[test]
    fn test_pool_insert_get() {
        let mut pool = PartialMatchPool::new();
        let am = pool.insert_alpha(alpha_match(1));
        let pm = pool.insert(PartialMatch::with_binds(smallvec![GenericMatch::Alpha(am)]));

        assert_eq!(pool[pm].bcount(), 1);
        assert_eq!(pool[pm].alpha_at(0), Some(am));
        assert_eq!(pool.live_partial_matches(), 1);
        assert_eq!(pool.live_alpha_matches(), 1);
    }

    #[test]
    fn test_pool_slot_reuse() {
        let mut pool = PartialMatchPool::new();
        let a = pool.insert(PartialMatch::default());
        pool.remove(a);
        let b = pool.insert(PartialMatch::default());
        assert_eq!(a, b);
        assert_eq!(pool.live_partial_matches(), 1);
    }

    #[test]
    fn test_remove_twice_is_none() {
        let mut pool = PartialMatchPool::new();
        let a = pool.insert(PartialMatch::default());
        assert!(pool.remove(a).is_some());
        assert!(pool.remove(a).is_none());
        assert_eq!(pool.live_partial_matches(), 0);
    }

    #[test]
    fn test_iter_skips_freed() {
        let mut pool = PartialMatchPool::new();
        let a = pool.insert(PartialMatch::default());
        let b = pool.insert(PartialMatch::default());
        pool.remove(a);
        let live: Vec<_> = pool.iter_partials().map(|(id, _)| id).collect();
        assert_eq!(live, vec![b]);
    }
}
