//! Forward-chaining production-rule match network
//!
//! A Rete network maintaining the set of currently satisfied rule
//! instantiations in response to working-memory changes:
//! - Alpha network: discrimination tree per template, hashed alpha memories
//! - Beta network: join nodes with hashed left/right memories, negated and
//!   exists joins, join-from-the-right subnetworks
//! - Assert pathway: incremental partial-match propagation
//! - Retract pathway: invalidation, lazy re-evaluation of negated joins,
//!   activation withdrawal
//! - Truth maintenance: logical dependencies with certainty factors and
//!   cascading retraction
//!
//! The network is incremental: only the consequences of the entity being
//! asserted or retracted are recomputed, and structure is shared across
//! rules wherever patterns and join prefixes coincide.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

/// Activation records awaiting conflict resolution
pub mod agenda;
/// Pattern (discrimination) network and alpha memories
pub mod alpha;
/// Join nodes, join links, and beta memories
pub mod beta;
/// Rule compilation into the shared network
pub mod compile;
/// Assert pathway
pub mod drive;
/// The engine context owning every arena
pub mod engine;
/// Network test expressions and their evaluation
pub mod expr;
/// Goal attachment bookkeeping
pub mod goal;
/// Truth maintenance (logical dependencies)
pub mod logical;
/// Retract pathway and garbage discipline
pub mod retract;

pub use agenda::{Activation, Agenda};
pub use compile::{CompileError, ConditionSpec, PatternSpec, RuleSpec, SlotConstraint};
pub use engine::{Engine, EngineConfig, RuleInfo};
pub use expr::{EvalError, Expr, Operand, TestOp};

pub use match_model::{
    ActivationId, AlphaMatchId, EntityId, EntityStore, EntityStoreMut, JoinId, PartialMatchId,
    PatternNodeId, RuleId, SlotIndex, TemplateId, TestId, Value,
};
