//! Rule compilation into the shared network
//!
//! A declarative rule spec — ordered conditions with per-slot constraints
//! — compiles into pattern-network nodes and a chain of join nodes ending
//! in a terminal join that carries the rule. Pattern paths are shared:
//! identical constraint prefixes reuse the same discrimination nodes and
//! alpha memories across rules, and constants dispatch through hashed
//! selector nodes instead of sibling scans.
//!
//! Compilation is incremental: a rule added to a network with live
//! entities is primed against the existing alpha memories and produces
//! its activations immediately.

use crate::alpha::{PatternFlags, PatternNode};
use crate::beta::{Direction, JoinFlags, JoinLink, JoinNode, RightEntry};
use crate::drive::Operation;
use crate::engine::{Engine, RuleInfo};
use crate::expr::{Expr, Operand, TestOp};
use match_model::{
    EntityStore, JoinId, Owner, PartialMatch, PatternNodeId, RuleId, SlotIndex, TemplateId,
    TestId, Value,
};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Rule compilation failure
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// A rule needs at least one condition
    #[error("rule '{0}' has no conditions")]
    EmptyRule(String),

    /// Two constraints name the same slot of one pattern
    #[error("duplicate constraint on slot {slot:?}")]
    DuplicateSlotConstraint {
        /// Offending slot
        slot: SlotIndex,
    },

    /// A variable's only earlier binding is inside a negated or exists
    /// condition, which contributes no binding downstream
    #[error("variable '{0}' is not bound by any earlier positive condition")]
    UnboundVariable(String),

    /// A variable is reused with an incompatible kind: a multifield name
    /// as a scalar, or a scalar name as a multifield span
    #[error("variable '{0}' was bound earlier with an incompatible kind")]
    VariableKindMismatch(String),

    /// The logical prefix must cover a non-empty prefix of the conditions
    #[error("logical prefix {prefix} exceeds condition count {conditions}")]
    LogicalPrefixOutOfRange {
        /// Requested prefix length
        prefix: usize,
        /// Available conditions
        conditions: usize,
    },
}

/// Per-slot constraint of a pattern
#[derive(Clone, Debug)]
pub enum SlotConstraint {
    /// Slot must equal a constant (compiled into the pattern network)
    Constant {
        /// Constrained slot
        slot: SlotIndex,
        /// Required value
        value: Value,
    },
    /// Slot binds a variable (compiled into join tests on reuse)
    Variable {
        /// Bound slot
        slot: SlotIndex,
        /// Variable name
        name: String,
    },
    /// Multifield slot binds a `$?` variable spanning the whole slot
    Multifield {
        /// Bound slot
        slot: SlotIndex,
        /// Variable name
        name: String,
    },
}

impl SlotConstraint {
    fn slot(&self) -> SlotIndex {
        match self {
            SlotConstraint::Constant { slot, .. }
            | SlotConstraint::Variable { slot, .. }
            | SlotConstraint::Multifield { slot, .. } => *slot,
        }
    }
}

/// One pattern of a rule's left-hand side
#[derive(Clone, Debug)]
pub struct PatternSpec {
    /// Template the pattern matches
    pub template: TemplateId,
    /// Slot constraints, in slot order
    pub constraints: Vec<SlotConstraint>,
}

impl PatternSpec {
    /// Unconstrained pattern over a template.
    pub fn new(template: TemplateId) -> Self {
        PatternSpec {
            template,
            constraints: Vec::new(),
        }
    }

    /// Require a slot to equal a constant.
    pub fn constant(mut self, slot: u16, value: Value) -> Self {
        self.constraints.push(SlotConstraint::Constant {
            slot: SlotIndex(slot),
            value,
        });
        self
    }

    /// Bind a slot to a variable.
    pub fn variable(mut self, slot: u16, name: impl Into<String>) -> Self {
        self.constraints.push(SlotConstraint::Variable {
            slot: SlotIndex(slot),
            name: name.into(),
        });
        self
    }

    /// Bind a multifield slot to a `$?` variable.
    pub fn multifield(mut self, slot: u16, name: impl Into<String>) -> Self {
        self.constraints.push(SlotConstraint::Multifield {
            slot: SlotIndex(slot),
            name: name.into(),
        });
        self
    }
}

/// One condition of a rule's left-hand side
#[derive(Clone, Debug)]
pub enum ConditionSpec {
    /// Positive pattern: an entity must match
    Pattern(PatternSpec),
    /// Negated pattern: no entity may match
    Negated(PatternSpec),
    /// Exists pattern: at least one entity must match, binding nothing
    Exists(PatternSpec),
}

impl ConditionSpec {
    fn pattern(&self) -> &PatternSpec {
        match self {
            ConditionSpec::Pattern(p) | ConditionSpec::Negated(p) | ConditionSpec::Exists(p) => p,
        }
    }

    fn is_positive(&self) -> bool {
        matches!(self, ConditionSpec::Pattern(_))
    }
}

/// A declarative rule (one disjunct)
#[derive(Clone, Debug)]
pub struct RuleSpec {
    /// Rule name
    pub name: String,
    /// Agenda salience
    pub salience: i32,
    /// Certainty factor of the rule's conclusions
    pub certainty: i16,
    /// Focus the rule's module when activated
    pub auto_focus: bool,
    /// Number of leading conditions under `logical` (0 = none)
    pub logical_prefix: usize,
    /// First join generates a goal and carries the goal attachment
    pub goal_driven: bool,
    /// Ordered conditions
    pub conditions: Vec<ConditionSpec>,
}

impl RuleSpec {
    /// Rule with no conditions yet.
    pub fn new(name: impl Into<String>) -> Self {
        RuleSpec {
            name: name.into(),
            salience: 0,
            certainty: 0,
            auto_focus: false,
            logical_prefix: 0,
            goal_driven: false,
            conditions: Vec::new(),
        }
    }

    /// Append a positive pattern.
    pub fn pattern(mut self, pattern: PatternSpec) -> Self {
        self.conditions.push(ConditionSpec::Pattern(pattern));
        self
    }

    /// Append a negated pattern.
    pub fn negated(mut self, pattern: PatternSpec) -> Self {
        self.conditions.push(ConditionSpec::Negated(pattern));
        self
    }

    /// Append an exists pattern.
    pub fn exists(mut self, pattern: PatternSpec) -> Self {
        self.conditions.push(ConditionSpec::Exists(pattern));
        self
    }

    /// Set salience.
    pub fn salience(mut self, salience: i32) -> Self {
        self.salience = salience;
        self
    }

    /// Mark the first `n` conditions as the logical group.
    pub fn logical(mut self, n: usize) -> Self {
        self.logical_prefix = n;
        self
    }

    /// Mark the rule goal-driven: its first join generates a goal, and
    /// the goal attachment rides the deepest match produced by that join.
    pub fn goal_driven(mut self) -> Self {
        self.goal_driven = true;
        self
    }

    /// Set the certainty factor of conclusions.
    pub fn certainty(mut self, cf: i16) -> Self {
        self.certainty = cf;
        self
    }
}

/// Where a variable was first bound
#[derive(Clone, Copy, Debug)]
enum Binding {
    Slot { depth: u16, slot: SlotIndex },
    Span { depth: u16, marker: u16 },
}

impl Engine {
    /// Compile a rule into the network and prime it against existing
    /// entities. Activations the rule is already entitled to appear on
    /// the agenda before this returns.
    pub fn add_rule<S: EntityStore>(
        &mut self,
        spec: RuleSpec,
        store: &S,
    ) -> Result<RuleId, CompileError> {
        if spec.conditions.is_empty() {
            return Err(CompileError::EmptyRule(spec.name));
        }
        if spec.logical_prefix > spec.conditions.len() {
            return Err(CompileError::LogicalPrefixOutOfRange {
                prefix: spec.logical_prefix,
                conditions: spec.conditions.len(),
            });
        }

        let rule = RuleId(self.rules.len() as u32);
        self.rules.push(RuleInfo {
            name: spec.name.clone(),
            salience: spec.salience,
            certainty: spec.certainty,
            auto_focus: spec.auto_focus,
            complexity: spec.conditions.len() as u16,
            local_var_cnt: 0,
            logical_join: None,
            last_join: None,
            disjunct: None,
        });

        let mut bindings: FxHashMap<String, Binding> = FxHashMap::default();
        let mut logical_join = None;
        let mut prev_join: Option<JoinId> = None;
        let mut first_join = None;

        for (depth, condition) in spec.conditions.iter().enumerate() {
            let depth = depth as u16;
            let pattern = condition.pattern();
            let tests = self.join_tests_for(pattern, &bindings)?;

            let pattern_node = self.compile_pattern(pattern, tests.right_hash)?;

            let mut flags = JoinFlags::default();
            flags.first_join = prev_join.is_none();
            flags.pattern_is_negated = matches!(condition, ConditionSpec::Negated(_));
            flags.pattern_is_exists = matches!(condition, ConditionSpec::Exists(_));
            flags.goal_join = flags.first_join && spec.goal_driven;
            // The logical join is the one whose left memory holds exactly
            // the logical group's output tuples.
            if spec.logical_prefix > 0 && depth as usize == spec.logical_prefix {
                flags.logical_join = true;
            }

            let goal_expression = flags
                .goal_join
                .then(|| self.exprs.intern(Expr::True));

            let mut join = JoinNode::new(flags, depth);
            join.network_test = tests.network_test;
            join.left_hash = tests.left_hash;
            join.right_hash = tests.right_hash;
            join.goal_expression = goal_expression;
            join.right_side_entry = Some(RightEntry::Pattern(pattern_node));
            join.last_level = prev_join;
            let join = self.joins.add(join);

            self.attach_join_to_pattern(pattern_node, join);

            if let Some(parent) = prev_join {
                self.joins[parent].next_links.push(JoinLink {
                    enter_direction: Direction::Lhs,
                    join,
                });
            } else {
                first_join = Some(join);
                self.joins.right_prime.push(JoinLink {
                    enter_direction: Direction::Rhs,
                    join,
                });
                if flags.pattern_is_negated || flags.pattern_is_exists {
                    self.joins.left_prime.push(JoinLink {
                        enter_direction: Direction::Lhs,
                        join,
                    });
                }
                if flags.goal_join {
                    self.joins.goal_prime.push(JoinLink {
                        enter_direction: Direction::Lhs,
                        join,
                    });
                }
            }

            if flags.logical_join {
                logical_join = Some(join);
            }
            prev_join = Some(join);

            // Only positive conditions contribute bindings downstream.
            if condition.is_positive() {
                let mut marker_ordinal: u16 = 0;
                for constraint in &pattern.constraints {
                    match constraint {
                        SlotConstraint::Variable { slot, name } => {
                            bindings
                                .entry(name.clone())
                                .or_insert(Binding::Slot { depth, slot: *slot });
                        }
                        SlotConstraint::Multifield { name, .. } => {
                            bindings.entry(name.clone()).or_insert(Binding::Span {
                                depth,
                                marker: marker_ordinal,
                            });
                            marker_ordinal += 1;
                        }
                        SlotConstraint::Constant { .. } => {}
                    }
                }
            }
        }

        // Terminal join: entered from the left with the full instantiation.
        let last_pattern_join = prev_join.expect("conditions checked non-empty");
        let mut leaf_flags = JoinFlags::default();
        if spec.logical_prefix == spec.conditions.len() && spec.logical_prefix > 0 {
            leaf_flags.logical_join = true;
        }
        let mut leaf = JoinNode::new(leaf_flags, spec.conditions.len() as u16);
        leaf.last_level = Some(last_pattern_join);
        leaf.rule_to_activate = Some(rule);
        let leaf = self.joins.add(leaf);
        if leaf_flags.logical_join {
            logical_join = Some(leaf);
        }
        self.joins[last_pattern_join].next_links.push(JoinLink {
            enter_direction: Direction::Lhs,
            join: leaf,
        });

        // Record variable bindings for the rule body.
        let mut seen = std::collections::BTreeSet::new();
        for condition in &spec.conditions {
            for constraint in &condition.pattern().constraints {
                if let SlotConstraint::Variable { name, .. }
                | SlotConstraint::Multifield { name, .. } = constraint
                {
                    seen.insert(name.clone());
                }
            }
        }
        {
            let info = &mut self.rules[rule.index()];
            info.local_var_cnt = seen.len() as u16;
            info.logical_join = logical_join;
            info.last_join = Some(leaf);
        }

        // Prime the chain against entities already in the network.
        if let Some(first) = first_join {
            self.prime_first_join(first, store);
        }

        debug!(rule = %self.rules[rule.index()].name, joins = self.joins.len(), "rule compiled");
        Ok(rule)
    }

    /// Compile every disjunct of one rule, chaining them through the
    /// `disjunct` links.
    pub fn add_disjuncts<S: EntityStore>(
        &mut self,
        specs: Vec<RuleSpec>,
        store: &S,
    ) -> Result<Vec<RuleId>, CompileError> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.add_rule(spec, store)?);
        }
        for pair in ids.windows(2) {
            self.rules[pair[0].index()].disjunct = Some(pair[1]);
        }
        Ok(ids)
    }

    /// Re-create the left prime match of every first join and drive it.
    /// Used after restoring a network from a binary image, where memories
    /// start empty.
    pub fn reprime<S: EntityStore>(&mut self, store: &S) {
        let firsts: Vec<JoinId> = self
            .joins
            .iter()
            .filter(|(_, j)| j.flags.first_join)
            .map(|(id, _)| id)
            .collect();
        for join in firsts {
            self.prime_first_join(join, store);
        }
    }

    fn prime_first_join<S: EntityStore>(&mut self, join: JoinId, store: &S) {
        let mut prime = PartialMatch::default();
        prime.beta_memory = true;
        prime.owner = Some(Owner::Join(join));
        let prime = self.pool.insert(prime);
        self.joins[join].left_memory.insert(&mut self.pool, prime);
        self.network_assert_left(prime, join, Operation::Assert, store);

        // A goal first join parks its goal on the left prime match until
        // propagation hangs it on something deeper.
        if self.joins[join].flags.goal_join && self.goals.attachment(join).is_none() {
            self.attach_goal(join, prime);
        }
    }

    fn attach_join_to_pattern(&mut self, pattern: PatternNodeId, join: JoinId) {
        let entry = self
            .patterns
            .node(pattern)
            .and_then(|node| node.entry_join);
        match entry {
            None => {
                if let Some(node) = self.patterns.node_mut(pattern) {
                    node.entry_join = Some(join);
                }
            }
            Some(first) => {
                let mut at = first;
                while let Some(next) = self.joins[at].right_match_node {
                    at = next;
                }
                self.joins[at].right_match_node = Some(join);
            }
        }
    }

    /// Compile a pattern's constant constraints into a shared path of
    /// discrimination nodes ending in a stop node with an alpha memory.
    fn compile_pattern(
        &mut self,
        spec: &PatternSpec,
        right_hash: Option<TestId>,
    ) -> Result<PatternNodeId, CompileError> {
        let mut used = std::collections::BTreeSet::new();
        for constraint in &spec.constraints {
            if !used.insert(constraint.slot()) {
                return Err(CompileError::DuplicateSlotConstraint {
                    slot: constraint.slot(),
                });
            }
        }

        let mut parent: Option<PatternNodeId> = None;
        for constraint in &spec.constraints {
            parent = Some(match constraint {
                SlotConstraint::Constant { slot, value } => {
                    let selector = self.find_or_create_selector(spec.template, parent, *slot);
                    self.find_or_create_selector_child(spec.template, selector, *slot, value)
                }
                SlotConstraint::Variable { slot, .. } => {
                    let mut flags = PatternFlags::default();
                    flags.singlefield = true;
                    flags.begin_slot = true;
                    flags.end_slot = true;
                    self.find_or_create_node(spec.template, parent, *slot, flags, None, 0)
                }
                SlotConstraint::Multifield { slot, .. } => {
                    let mut flags = PatternFlags::default();
                    flags.multifield = true;
                    flags.begin_slot = true;
                    flags.end_slot = true;
                    self.find_or_create_node(spec.template, parent, *slot, flags, None, 0)
                }
            });
        }

        // Every pattern terminates in a dedicated stop node; stop nodes
        // with different bucket hashes cannot share an alpha memory, so
        // the hash is part of the sharing key.
        let slot = parent
            .and_then(|p| self.patterns.node(p))
            .map(|n| n.which_slot)
            .unwrap_or(SlotIndex(0));
        Ok(self.find_or_create_stop(spec.template, parent, slot, right_hash))
    }

    fn find_or_create_stop(
        &mut self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        slot: SlotIndex,
        right_hash: Option<TestId>,
    ) -> PatternNodeId {
        let mut cursor = match parent {
            Some(p) => self.patterns.node(p).and_then(|n| n.next_level),
            None => self.patterns.root(template),
        };
        while let Some(id) = cursor {
            let node = match self.patterns.node(id) {
                Some(n) => n,
                None => break,
            };
            if node.flags.stop && node.right_hash == right_hash {
                return id;
            }
            cursor = node.right_node;
        }

        let mut flags = PatternFlags::default();
        flags.stop = true;
        let id = self.create_node(template, parent, slot, flags, None, 0);
        if let Some(node) = self.patterns.node_mut(id) {
            node.right_hash = right_hash;
        }
        self.patterns.add_memory(id);
        id
    }

    fn find_or_create_selector(
        &mut self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        slot: SlotIndex,
    ) -> PatternNodeId {
        let test = self.exprs.intern(Expr::SlotKey { slot });
        let mut flags = PatternFlags::default();
        flags.selector = true;
        flags.begin_slot = true;
        flags.end_slot = true;
        self.find_or_create_node(template, parent, slot, flags, Some(test), 0)
    }

    fn find_or_create_selector_child(
        &mut self,
        template: TemplateId,
        selector: PatternNodeId,
        slot: SlotIndex,
        value: &Value,
    ) -> PatternNodeId {
        let Some(key) = value.selector_key() else {
            // Multifield constants cannot key a selector table; fall back
            // to a tested singlefield sibling.
            let test = self.exprs.intern(Expr::Cmp {
                op: TestOp::Eq,
                left: Operand::Rhs { slot },
                right: Operand::Const(value.clone()),
            });
            let mut flags = PatternFlags::default();
            flags.singlefield = true;
            return self.find_or_create_node(template, Some(selector), slot, flags, Some(test), 0);
        };

        if let Some(child) = self.patterns.selector_child(selector, key) {
            return child;
        }

        let mut flags = PatternFlags::default();
        flags.singlefield = true;
        let child = self.create_node(template, Some(selector), slot, flags, None, 0);
        self.patterns.set_selector_child(selector, key, child);
        child
    }

    /// Reuse a structurally identical child of `parent`, or create one.
    fn find_or_create_node(
        &mut self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        slot: SlotIndex,
        flags: PatternFlags,
        test: Option<TestId>,
        leave_fields: u16,
    ) -> PatternNodeId {
        let mut cursor = match parent {
            Some(p) => self.patterns.node(p).and_then(|n| n.next_level),
            None => self.patterns.root(template),
        };
        while let Some(id) = cursor {
            let node = match self.patterns.node(id) {
                Some(n) => n,
                None => break,
            };
            if node.which_slot == slot
                && node.network_test == test
                && node.leave_fields == leave_fields
                && node.flags.singlefield == flags.singlefield
                && node.flags.multifield == flags.multifield
                && node.flags.selector == flags.selector
                && node.flags.stop == flags.stop
            {
                return id;
            }
            cursor = node.right_node;
        }
        self.create_node(template, parent, slot, flags, test, leave_fields)
    }

    fn create_node(
        &mut self,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        slot: SlotIndex,
        flags: PatternFlags,
        test: Option<TestId>,
        leave_fields: u16,
    ) -> PatternNodeId {
        let mut node = PatternNode::new(template, slot, 0);
        node.flags = flags;
        node.network_test = test;
        node.leave_fields = leave_fields;
        node.last_level = parent;
        let id = self.patterns.add_node(node);

        let head = match parent {
            Some(p) => self.patterns.node(p).and_then(|n| n.next_level),
            None => self.patterns.root(template),
        };
        match head {
            None => match parent {
                Some(p) => {
                    if let Some(node) = self.patterns.node_mut(p) {
                        node.next_level = Some(id);
                    }
                }
                None => self.patterns.set_root(template, id),
            },
            Some(first) => {
                let mut at = first;
                while let Some(next) = self.patterns.node(at).and_then(|n| n.right_node) {
                    at = next;
                }
                if let Some(node) = self.patterns.node_mut(at) {
                    node.right_node = Some(id);
                }
                if let Some(node) = self.patterns.node_mut(id) {
                    node.left_node = Some(at);
                }
            }
        }
        id
    }

    /// Join tests and hash expressions for one condition.
    fn join_tests_for(
        &mut self,
        pattern: &PatternSpec,
        bindings: &FxHashMap<String, Binding>,
    ) -> Result<JoinTests, CompileError> {
        let mut parts: Vec<TestId> = Vec::new();
        let mut left_ops: Vec<Operand> = Vec::new();
        let mut right_ops: Vec<Operand> = Vec::new();
        let mut local: FxHashMap<&str, SlotIndex> = FxHashMap::default();
        let mut marker_ordinal: u16 = 0;

        for constraint in &pattern.constraints {
            match constraint {
                SlotConstraint::Constant { .. } => {}
                SlotConstraint::Variable { slot, name } => {
                    if let Some(&first) = local.get(name.as_str()) {
                        // Same variable twice within one pattern.
                        parts.push(self.exprs.intern(Expr::Cmp {
                            op: TestOp::Eq,
                            left: Operand::Rhs { slot: first },
                            right: Operand::Rhs { slot: *slot },
                        }));
                    } else {
                        local.insert(name.as_str(), *slot);
                    }
                    match bindings.get(name.as_str()) {
                        Some(Binding::Slot {
                            depth: bound_depth,
                            slot: bound_slot,
                        }) => {
                            parts.push(self.exprs.intern(Expr::Cmp {
                                op: TestOp::Eq,
                                left: Operand::Lhs {
                                    depth: *bound_depth,
                                    slot: *bound_slot,
                                },
                                right: Operand::Rhs { slot: *slot },
                            }));
                            left_ops.push(Operand::Lhs {
                                depth: *bound_depth,
                                slot: *bound_slot,
                            });
                            right_ops.push(Operand::Rhs { slot: *slot });
                        }
                        Some(Binding::Span { .. }) => {
                            return Err(CompileError::VariableKindMismatch(name.clone()));
                        }
                        None => {}
                    }
                }
                SlotConstraint::Multifield { slot: _, name } => {
                    match bindings.get(name.as_str()) {
                        Some(Binding::Span {
                            depth: bound_depth,
                            marker,
                        }) => {
                            parts.push(self.exprs.intern(Expr::Cmp {
                                op: TestOp::Eq,
                                left: Operand::LhsSpan {
                                    depth: *bound_depth,
                                    marker: *marker,
                                },
                                right: Operand::RhsSpan {
                                    marker: marker_ordinal,
                                },
                            }));
                        }
                        Some(Binding::Slot { .. }) => {
                            return Err(CompileError::VariableKindMismatch(name.clone()));
                        }
                        None => {}
                    }
                    marker_ordinal += 1;
                }
            }
        }

        let network_test = match parts.len() {
            0 => None,
            1 => Some(parts[0]),
            _ => Some(self.exprs.intern(Expr::All(parts))),
        };
        let (left_hash, right_hash) = if left_ops.is_empty() {
            (None, None)
        } else {
            (
                Some(self.exprs.intern(Expr::Hash(left_ops))),
                Some(self.exprs.intern(Expr::Hash(right_ops))),
            )
        };

        Ok(JoinTests {
            network_test,
            left_hash,
            right_hash,
        })
    }
}

struct JoinTests {
    network_test: Option<TestId>,
    left_hash: Option<TestId>,
    right_hash: Option<TestId>,
}
