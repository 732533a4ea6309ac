//! Activation records awaiting conflict resolution
//!
//! The matcher produces and withdraws activations; picking which one
//! fires, and in what order, is the scheduler's business. This structure
//! only guarantees stable insertion order so enumeration is deterministic.

use indexmap::IndexMap;
use match_model::{ActivationId, PartialMatchId, RuleId};

/// A fully matched rule instantiation
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Activation {
    /// Rule to fire
    pub rule: RuleId,
    /// Leaf partial match that produced the activation
    pub origin: PartialMatchId,
}

/// Insertion-ordered activation store
#[derive(Debug, Default)]
pub struct Agenda {
    items: IndexMap<ActivationId, Activation>,
    next: u32,
}

impl Agenda {
    /// Empty agenda.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an activation.
    pub fn add(&mut self, rule: RuleId, origin: PartialMatchId) -> ActivationId {
        let id = ActivationId(self.next);
        self.next += 1;
        self.items.insert(id, Activation { rule, origin });
        id
    }

    /// Withdraw an activation.
    pub fn remove(&mut self, id: ActivationId) -> Option<Activation> {
        self.items.shift_remove(&id)
    }

    /// Look up an activation.
    pub fn get(&self, id: ActivationId) -> Option<&Activation> {
        self.items.get(&id)
    }

    /// Number of pending activations.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Is the agenda empty?
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pending activations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ActivationId, &Activation)> {
        self.items.iter().map(|(id, act)| (*id, act))
    }
}
