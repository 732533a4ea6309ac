//! Stable arena identifiers
//!
//! The match network is graph-structured with back-pointers (parent joins,
//! left parents, blockers). Nodes live in arenas indexed by these ids and
//! every edge is an id, so cycles cost nothing and deletion is an explicit
//! unlink rather than a dance with reference counts.

use std::fmt;

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Raw index into the owning arena.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

arena_id!(
    /// A node in the pattern (discrimination) network.
    PatternNodeId
);
arena_id!(
    /// A node in the join network.
    JoinId
);
arena_id!(
    /// A partial match in the match pool.
    PartialMatchId
);
arena_id!(
    /// An alpha match wrapped by an alpha-memory partial match.
    AlphaMatchId
);
arena_id!(
    /// A hashed alpha memory attached to a terminal pattern node.
    AlphaMemoryId
);
arena_id!(
    /// An activation awaiting conflict resolution.
    ActivationId
);
arena_id!(
    /// A rule (one disjunct) with a leaf join.
    RuleId
);
arena_id!(
    /// An expression in the test table.
    TestId
);
arena_id!(
    /// A template (entity kind) in the pattern network.
    TemplateId
);

/// Position of a slot within a template.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SlotIndex(pub u16);

impl SlotIndex {
    /// Raw slot ordinal.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_debug_format() {
        assert_eq!(format!("{:?}", JoinId(3)), "JoinId(3)");
        assert_eq!(format!("{:?}", PartialMatchId(0)), "PartialMatchId(0)");
    }

    #[test]
    fn test_id_ordering() {
        assert!(PatternNodeId(1) < PatternNodeId(2));
    }
}
