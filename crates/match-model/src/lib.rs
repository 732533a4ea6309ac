//! Match primitives for the production-rule network
//!
//! The building blocks every other crate in the workspace shares:
//! - Partial matches: ordered bind tuples with lineage and block linkage
//! - Alpha matches: one entity matching one terminal pattern
//! - Multifield markers: `$?` span bookkeeping inside a slot
//! - Slot values and interned symbols
//! - The capability surface working memory must provide to the matcher
//!
//! All network nodes are addressed by stable arena ids; the structures in
//! this crate store ids, never references, so a single owner can mutate
//! the whole graph without fighting the borrow checker.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

/// Arena identifiers for network nodes and match structures
pub mod ids;
/// Interned symbol table
pub mod symbol;
/// Slot values
pub mod value;
/// Working-memory capability surface
pub mod entity;
/// Multifield span markers
pub mod marker;
/// Partial matches, alpha matches, and the match pool
pub mod partial;

pub use entity::{EntityId, EntityStore, EntityStoreMut};
pub use ids::{
    ActivationId, AlphaMatchId, AlphaMemoryId, JoinId, PartialMatchId, PatternNodeId, RuleId,
    SlotIndex, TemplateId, TestId,
};
pub use marker::{MultifieldMarker, SlotReference};
pub use partial::{
    AlphaMatch, Dependency, GenericMatch, Owner, PartialMatch, PartialMatchPool, PatternMatch,
};
pub use symbol::SymbolTable;
pub use value::{SelectorKey, Value};
