//! Goal attachment bookkeeping
//!
//! Data-driven backward chaining attaches a goal to the partial match
//! that currently wants it satisfied. The attachment migrates as the
//! match tree grows and shrinks: when a goal-carrying match gains
//! children the goal moves down, and when the retract pathway deletes
//! the last child the goal re-attaches to the surviving parent. Goal
//! generation itself lives outside the matcher; this table keeps the
//! attachment points and support counts consistent during retraction.

use match_model::{JoinId, PartialMatchId};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Attachment state for goals riding on partial matches
#[derive(Debug, Default)]
pub struct GoalTable {
    /// Current attachment point per goal join
    attached: FxHashMap<JoinId, PartialMatchId>,
    /// Outstanding support per attached match
    support: FxHashMap<PartialMatchId, u32>,
}

impl GoalTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the goal of `join` to `target`.
    pub fn attach(&mut self, join: JoinId, target: PartialMatchId) {
        trace!(?join, ?target, "attach goal");
        self.attached.insert(join, target);
        *self.support.entry(target).or_insert(0) += 1;
    }

    /// Current attachment point of a goal join.
    pub fn attachment(&self, join: JoinId) -> Option<PartialMatchId> {
        self.attached.get(&join).copied()
    }

    /// Drop one unit of support from a match; returns true when the last
    /// support disappeared and the goal must re-attach upward.
    pub fn drop_support(&mut self, target: PartialMatchId) -> bool {
        match self.support.get_mut(&target) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.support.remove(&target);
                self.attached.retain(|_, pm| *pm != target);
                true
            }
            None => false,
        }
    }

    /// Forget every attachment owned by a join (teardown).
    pub fn clear_join(&mut self, join: JoinId) {
        if let Some(pm) = self.attached.remove(&join) {
            self.support.remove(&pm);
        }
    }

    /// Does the match carry any goal support?
    pub fn supports(&self, target: PartialMatchId) -> bool {
        self.support.contains_key(&target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_drop() {
        let mut goals = GoalTable::new();
        goals.attach(JoinId(0), PartialMatchId(5));
        assert_eq!(goals.attachment(JoinId(0)), Some(PartialMatchId(5)));
        assert!(goals.supports(PartialMatchId(5)));

        assert!(goals.drop_support(PartialMatchId(5)));
        assert!(goals.attachment(JoinId(0)).is_none());
        assert!(!goals.supports(PartialMatchId(5)));
    }

    #[test]
    fn test_multiple_support_units() {
        let mut goals = GoalTable::new();
        goals.attach(JoinId(0), PartialMatchId(5));
        goals.attach(JoinId(1), PartialMatchId(5));
        assert!(!goals.drop_support(PartialMatchId(5)));
        assert!(goals.drop_support(PartialMatchId(5)));
    }
}
