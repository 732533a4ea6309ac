//! The engine context owning every arena
//!
//! All network mutation happens through one `Engine` value: pattern and
//! join arenas, the match pool, the agenda, evaluation globals, garbage
//! lists, and truth-maintenance tables. Nothing is process-global, so two
//! engines can coexist and every operation is single-threaded by
//! construction.

use crate::agenda::{Activation, Agenda};
use crate::alpha::PatternNetwork;
use crate::beta::JoinNetwork;
use crate::expr::ExpressionTable;
use crate::goal::GoalTable;
use match_model::{
    ActivationId, AlphaMatchId, EntityId, JoinId, PartialMatchId, PartialMatchPool, PatternMatch,
    RuleId, SymbolTable,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::error;

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on truth-maintenance fixed-point iterations
    pub max_logical_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_logical_iterations: 10_000,
        }
    }
}

/// One rule disjunct registered with the network
#[derive(Debug, Clone)]
pub struct RuleInfo {
    /// Rule name
    pub name: String,
    /// Agenda salience
    pub salience: i32,
    /// Certainty factor of the rule's conclusions
    pub certainty: i16,
    /// Focus the rule's module when activated
    pub auto_focus: bool,
    /// Join-chain length, used by specificity-based schedulers
    pub complexity: u16,
    /// Number of local variables in the rule body
    pub local_var_cnt: u16,
    /// Join controlling logical support for RHS assertions
    pub logical_join: Option<JoinId>,
    /// Last pattern join of the chain
    pub last_join: Option<JoinId>,
    /// Next disjunct of the same rule
    pub disjunct: Option<RuleId>,
}

/// Evaluation globals installed around a join-test evaluation
#[derive(Default, Debug, Clone, Copy)]
pub struct EvalGlobals {
    /// Current LHS bindings
    pub lhs_binds: Option<PartialMatchId>,
    /// Current RHS binding
    pub rhs_binds: Option<PartialMatchId>,
    /// Join whose test is being evaluated
    pub join: Option<JoinId>,
}

/// Counters for conditions that are reported but never unwound
#[derive(Default, Debug, Clone, Copy)]
pub struct Diagnostics {
    /// Fatal internal inconsistencies (skipped entries)
    pub system_errors: u64,
    /// Join-test evaluation errors coerced to a conservative result
    pub eval_errors: u64,
}

/// The production-rule match engine
#[derive(Debug)]
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) symbols: SymbolTable,
    pub(crate) exprs: ExpressionTable,
    pub(crate) patterns: PatternNetwork,
    pub(crate) joins: JoinNetwork,
    pub(crate) pool: PartialMatchPool,
    pub(crate) rules: Vec<RuleInfo>,
    pub(crate) agenda: Agenda,
    pub(crate) goals: GoalTable,

    /// Per-entity list of the patterns it matched
    pub(crate) entity_matches: FxHashMap<EntityId, Vec<PatternMatch>>,
    /// Per-entity logical support: (supporting match, certainty factor)
    pub(crate) entity_supports: FxHashMap<EntityId, Vec<(PartialMatchId, i16)>>,
    /// Entities inserted solely under logical support
    pub(crate) logical_only: FxHashSet<EntityId>,
    /// Entities scheduled for forced retraction
    pub(crate) pending_logical_retracts: Vec<EntityId>,

    /// Busy matches awaiting the next safe-point flush
    pub(crate) garbage_partials: Vec<PartialMatchId>,
    /// Alpha matches kept alive for in-flight RHS bindings
    pub(crate) garbage_alphas: Vec<AlphaMatchId>,

    pub(crate) globals: EvalGlobals,
    pub(crate) diagnostics: Diagnostics,
    /// Basis of the currently firing activation
    pub(crate) firing_basis: Option<PartialMatchId>,
    /// Rule of the currently firing activation
    pub(crate) firing_rule: Option<RuleId>,
}

impl Engine {
    /// Engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine with custom configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Engine {
            config,
            symbols: SymbolTable::new(),
            exprs: ExpressionTable::new(),
            patterns: PatternNetwork::new(),
            joins: JoinNetwork::new(),
            pool: PartialMatchPool::new(),
            rules: Vec::new(),
            agenda: Agenda::new(),
            goals: GoalTable::new(),
            entity_matches: FxHashMap::default(),
            entity_supports: FxHashMap::default(),
            logical_only: FxHashSet::default(),
            pending_logical_retracts: Vec::new(),
            garbage_partials: Vec::new(),
            garbage_alphas: Vec::new(),
            globals: EvalGlobals::default(),
            diagnostics: Diagnostics::default(),
            firing_basis: None,
            firing_rule: None,
        }
    }

    /// Rebuild an engine around structures restored from a binary image.
    /// Memories start empty; first joins are re-primed by the caller
    /// through the compile surface.
    pub fn restore(
        config: EngineConfig,
        symbols: SymbolTable,
        exprs: ExpressionTable,
        patterns: PatternNetwork,
        joins: JoinNetwork,
        rules: Vec<RuleInfo>,
    ) -> Self {
        let mut engine = Self::with_config(config);
        engine.symbols = symbols;
        engine.exprs = exprs;
        engine.patterns = patterns;
        engine.joins = joins;
        engine.rules = rules;
        engine
    }

    /// Symbol table shared with callers building values.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Compiled test table.
    pub fn expressions(&self) -> &ExpressionTable {
        &self.exprs
    }

    /// Pattern network (read-only).
    pub fn patterns(&self) -> &PatternNetwork {
        &self.patterns
    }

    /// Join network (read-only).
    pub fn joins(&self) -> &JoinNetwork {
        &self.joins
    }

    /// Match pool (read-only).
    pub fn pool(&self) -> &PartialMatchPool {
        &self.pool
    }

    /// Registered rules in id order.
    pub fn rules(&self) -> &[RuleInfo] {
        &self.rules
    }

    /// Rule by id.
    pub fn rule(&self, id: RuleId) -> Option<&RuleInfo> {
        self.rules.get(id.index())
    }

    /// Pending activations.
    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    /// Error counters.
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    /// Current goal attachment point of a goal join.
    pub fn goal_attachment(&self, join: JoinId) -> Option<PartialMatchId> {
        self.goals.attachment(join)
    }

    /// Matches the entity currently holds in alpha memories.
    pub fn pattern_matches_of(&self, entity: EntityId) -> &[PatternMatch] {
        self.entity_matches
            .get(&entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Begin firing an activation: the activation leaves the agenda and
    /// its basis is pinned so RHS bindings stay readable until
    /// [`Engine::end_fire`].
    pub fn begin_fire(&mut self, id: ActivationId) -> Option<Activation> {
        let activation = self.agenda.remove(id)?;
        if let Some(pm) = self.pool.get_mut(activation.origin) {
            pm.marker = None;
            pm.busy = true;
        }
        self.firing_basis = Some(activation.origin);
        self.firing_rule = Some(activation.rule);
        Some(activation)
    }

    /// Finish firing: unpin the basis and reclaim everything the RHS may
    /// have been reading.
    pub fn end_fire(&mut self) {
        if let Some(basis) = self.firing_basis.take() {
            if let Some(pm) = self.pool.get_mut(basis) {
                pm.busy = false;
            }
        }
        self.firing_rule = None;
        self.flush_garbage_partial_matches();
    }

    /// Report a fatal internal inconsistency. The offending entry is
    /// skipped; the operation in progress continues.
    pub(crate) fn system_error(&mut self, module: &'static str, code: u32) {
        self.diagnostics.system_errors += 1;
        error!(target: "rete", module, code, "internal inconsistency, entry skipped");
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.max_logical_iterations, 10_000);
    }

    #[test]
    fn test_fresh_engine_is_empty() {
        let engine = Engine::new();
        assert!(engine.agenda().is_empty());
        assert_eq!(engine.pool().live_partial_matches(), 0);
        assert_eq!(engine.joins().len(), 0);
    }
}
