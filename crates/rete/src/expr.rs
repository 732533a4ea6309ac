//! Network test expressions and their evaluation
//!
//! Tests are pre-compiled into a table and referenced by [`TestId`]
//! everywhere in the network, so nodes stay plain data and the binary
//! image can serialize them by index. Evaluation is a pure predicate over
//! the current `(LHS bindings, RHS binding)` pair; it never mutates the
//! network.
//!
//! Error discipline: evaluation errors never unwind. The caller decides
//! the conservative coercion — the conflict scan treats an errored test
//! as satisfied (keep the blocker), the assert pathway treats it as
//! failed — and clears the error by consuming the `Result`.

use match_model::{
    EntityId, EntityStore, PartialMatch, PartialMatchPool, SelectorKey, SlotIndex, TestId, Value,
};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Comparison operator of a test
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TestOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less or equal
    Le,
    /// Greater than
    Gt,
    /// Greater or equal
    Ge,
}

/// Where a test operand gets its value
#[derive(Clone, PartialEq, Debug)]
pub enum Operand {
    /// Constant value
    Const(Value),
    /// Slot of the entity bound at an LHS depth
    Lhs {
        /// Bind cell index in the LHS partial match
        depth: u16,
        /// Slot of that entity
        slot: SlotIndex,
    },
    /// Slot of the RHS entity
    Rhs {
        /// Slot of the RHS entity
        slot: SlotIndex,
    },
    /// Multifield span marked by an LHS binding
    LhsSpan {
        /// Bind cell index in the LHS partial match
        depth: u16,
        /// Marker ordinal within that alpha match
        marker: u16,
    },
    /// Multifield span marked by the RHS binding
    RhsSpan {
        /// Marker ordinal within the RHS alpha match
        marker: u16,
    },
}

/// A compiled network test
#[derive(Clone, PartialEq, Debug)]
pub enum Expr {
    /// Always satisfied
    True,
    /// Binary comparison
    Cmp {
        /// Operator
        op: TestOp,
        /// Left operand
        left: Operand,
        /// Right operand
        right: Operand,
    },
    /// Conjunction
    All(Vec<TestId>),
    /// Disjunction
    Any(Vec<TestId>),
    /// Negation
    Not(TestId),
    /// Memory bucket hash over the listed operands
    Hash(Vec<Operand>),
    /// Selector dispatch key: `(type, value)` of a slot
    SlotKey {
        /// Slot whose value keys the dispatch
        slot: SlotIndex,
    },
    /// One field of a multifield slot equals a constant
    FieldEq {
        /// Slot under test
        slot: SlotIndex,
        /// Field position within the slot
        field: u16,
        /// Expected value
        value: Value,
    },
}

/// Evaluation failure inside a network test
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// A referenced bind cell holds no entity
    #[error("bind cell {depth} holds no entity binding")]
    MissingBinding {
        /// Offending bind cell
        depth: u16,
    },
    /// The entity no longer has the referenced slot
    #[error("entity {entity:?} has no slot {slot:?}")]
    MissingSlot {
        /// Entity under test
        entity: EntityId,
        /// Missing slot
        slot: SlotIndex,
    },
    /// Operands cannot be compared with the requested operator
    #[error("operands cannot be ordered")]
    TypeMismatch,
    /// The operand does not make sense in this evaluation context
    #[error("operand out of context")]
    WrongContext,
    /// Dangling test id
    #[error("unknown test {0:?}")]
    UnknownTest(TestId),
}

/// Interned table of compiled tests
#[derive(Debug, Default)]
pub struct ExpressionTable {
    exprs: Vec<Expr>,
}

impl ExpressionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a test, reusing an existing identical entry.
    pub fn intern(&mut self, expr: Expr) -> TestId {
        if let Some(pos) = self.exprs.iter().position(|e| *e == expr) {
            return TestId(pos as u32);
        }
        self.exprs.push(expr);
        TestId((self.exprs.len() - 1) as u32)
    }

    /// Look up a test.
    pub fn get(&self, id: TestId) -> Option<&Expr> {
        self.exprs.get(id.index())
    }

    /// Number of interned tests.
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Iterate tests in id order (binary image order).
    pub fn iter(&self) -> impl Iterator<Item = (TestId, &Expr)> {
        self.exprs
            .iter()
            .enumerate()
            .map(|(i, e)| (TestId(i as u32), e))
    }

    /// Append a test loaded from an image, preserving its index.
    pub fn push_loaded(&mut self, expr: Expr) -> TestId {
        self.exprs.push(expr);
        TestId((self.exprs.len() - 1) as u32)
    }
}

/// Bindings visible to one join-test evaluation
pub struct JoinContext<'a, S: EntityStore + ?Sized> {
    /// LHS partial match, when the test references LHS cells
    pub lhs: Option<&'a PartialMatch>,
    /// RHS partial match (an alpha singleton for pattern-entry joins)
    pub rhs: Option<&'a PartialMatch>,
    /// Match pool for alpha-match resolution
    pub pool: &'a PartialMatchPool,
    /// Working-memory read surface
    pub store: &'a S,
}

impl<'a, S: EntityStore + ?Sized> JoinContext<'a, S> {
    fn lhs_alpha(&self, depth: u16) -> Result<&'a match_model::AlphaMatch, EvalError> {
        let pm = self.lhs.ok_or(EvalError::WrongContext)?;
        let id = pm
            .alpha_at(depth as usize)
            .ok_or(EvalError::MissingBinding { depth })?;
        self.pool
            .alpha(id)
            .ok_or(EvalError::MissingBinding { depth })
    }

    fn rhs_alpha(&self) -> Result<&'a match_model::AlphaMatch, EvalError> {
        let pm = self.rhs.ok_or(EvalError::WrongContext)?;
        let id = pm.alpha_at(0).ok_or(EvalError::MissingBinding { depth: 0 })?;
        self.pool
            .alpha(id)
            .ok_or(EvalError::MissingBinding { depth: 0 })
    }

    fn slot_value(&self, entity: EntityId, slot: SlotIndex) -> Result<Value, EvalError> {
        self.store
            .slot(entity, slot)
            .cloned()
            .ok_or(EvalError::MissingSlot { entity, slot })
    }

    fn marked_span(
        &self,
        alpha: &match_model::AlphaMatch,
        marker: u16,
    ) -> Result<Value, EvalError> {
        let mark = alpha
            .markers
            .get(marker as usize)
            .ok_or(EvalError::WrongContext)?;
        let slot = match mark.which_slot {
            match_model::SlotReference::Index(i) => SlotIndex(i),
            // Named slots are resolved to ordinals at compile time; a name
            // surviving to evaluation is a compiler defect.
            match_model::SlotReference::Name(_) => return Err(EvalError::WrongContext),
        };
        match self.slot_value(alpha.entity, slot)? {
            Value::Multifield(fields) => {
                let end = mark.end_position().min(fields.len());
                let start = mark.start_position.min(end);
                Ok(Value::Multifield(fields[start..end].to_vec()))
            }
            _ => Err(EvalError::TypeMismatch),
        }
    }

    fn resolve(&self, operand: &Operand) -> Result<Value, EvalError> {
        match operand {
            Operand::Const(v) => Ok(v.clone()),
            Operand::Lhs { depth, slot } => {
                let alpha = self.lhs_alpha(*depth)?;
                self.slot_value(alpha.entity, *slot)
            }
            Operand::Rhs { slot } => {
                let alpha = self.rhs_alpha()?;
                self.slot_value(alpha.entity, *slot)
            }
            Operand::LhsSpan { depth, marker } => {
                let alpha = self.lhs_alpha(*depth)?;
                self.marked_span(alpha, *marker)
            }
            Operand::RhsSpan { marker } => {
                let alpha = self.rhs_alpha()?;
                self.marked_span(alpha, *marker)
            }
        }
    }
}

fn compare(op: TestOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        TestOp::Eq => Ok(values_equal(left, right)),
        TestOp::Ne => Ok(!values_equal(left, right)),
        _ => {
            let ordering = numeric_ordering(left, right)?;
            Ok(match op {
                TestOp::Lt => ordering.is_lt(),
                TestOp::Le => ordering.is_le(),
                TestOp::Gt => ordering.is_gt(),
                TestOp::Ge => ordering.is_ge(),
                TestOp::Eq | TestOp::Ne => unreachable!(),
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
            (*a as f64) == *b
        }
        _ => left == right,
    }
}

fn numeric_ordering(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    use std::cmp::Ordering;
    let ord = match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).ok_or(EvalError::TypeMismatch)?,
        (Value::Integer(a), Value::Float(b)) => {
            (*a as f64).partial_cmp(b).ok_or(EvalError::TypeMismatch)?
        }
        (Value::Float(a), Value::Integer(b)) => a
            .partial_cmp(&(*b as f64))
            .ok_or(EvalError::TypeMismatch)?,
        (Value::Symbol(a), Value::Symbol(b)) => a.cmp(b),
        _ => return Err(EvalError::TypeMismatch),
    };
    Ok(ord)
}

/// Evaluate a join test over the given bindings.
pub fn eval_join_test<S: EntityStore + ?Sized>(
    table: &ExpressionTable,
    test: TestId,
    ctx: &JoinContext<'_, S>,
) -> Result<bool, EvalError> {
    match table.get(test).ok_or(EvalError::UnknownTest(test))? {
        Expr::True => Ok(true),
        Expr::Cmp { op, left, right } => {
            let l = ctx.resolve(left)?;
            let r = ctx.resolve(right)?;
            compare(*op, &l, &r)
        }
        Expr::All(parts) => {
            for part in parts {
                if !eval_join_test(table, *part, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Any(parts) => {
            for part in parts {
                if eval_join_test(table, *part, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Not(inner) => Ok(!eval_join_test(table, *inner, ctx)?),
        Expr::Hash(_) | Expr::SlotKey { .. } | Expr::FieldEq { .. } => {
            Err(EvalError::WrongContext)
        }
    }
}

/// Evaluate an alpha-network test against a single entity.
pub fn eval_alpha_test<S: EntityStore + ?Sized>(
    table: &ExpressionTable,
    test: TestId,
    entity: EntityId,
    store: &S,
) -> Result<bool, EvalError> {
    match table.get(test).ok_or(EvalError::UnknownTest(test))? {
        Expr::True => Ok(true),
        Expr::Cmp { op, left, right } => {
            let l = resolve_alpha(left, entity, store)?;
            let r = resolve_alpha(right, entity, store)?;
            compare(*op, &l, &r)
        }
        Expr::All(parts) => {
            for part in parts {
                if !eval_alpha_test(table, *part, entity, store)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Any(parts) => {
            for part in parts {
                if eval_alpha_test(table, *part, entity, store)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Not(inner) => Ok(!eval_alpha_test(table, *inner, entity, store)?),
        Expr::FieldEq { slot, field, value } => {
            let slot_value = store
                .slot(entity, *slot)
                .ok_or(EvalError::MissingSlot { entity, slot: *slot })?;
            match slot_value {
                Value::Multifield(fields) => Ok(fields
                    .get(*field as usize)
                    .map(|f| values_equal(f, value))
                    .unwrap_or(false)),
                scalar if *field == 0 => Ok(values_equal(scalar, value)),
                _ => Ok(false),
            }
        }
        Expr::Hash(_) | Expr::SlotKey { .. } => Err(EvalError::WrongContext),
    }
}

/// Evaluate the selector dispatch key of an entity, when it has one.
pub fn eval_selector_key<S: EntityStore + ?Sized>(
    table: &ExpressionTable,
    test: TestId,
    entity: EntityId,
    store: &S,
) -> Option<SelectorKey> {
    match table.get(test)? {
        Expr::SlotKey { slot } => store.slot(entity, *slot)?.selector_key(),
        _ => None,
    }
}

fn resolve_alpha<S: EntityStore + ?Sized>(
    operand: &Operand,
    entity: EntityId,
    store: &S,
) -> Result<Value, EvalError> {
    match operand {
        Operand::Const(v) => Ok(v.clone()),
        Operand::Rhs { slot } => store
            .slot(entity, *slot)
            .cloned()
            .ok_or(EvalError::MissingSlot { entity, slot: *slot }),
        _ => Err(EvalError::WrongContext),
    }
}

/// Which side of a join a partial match plays during hash evaluation
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BindRole {
    /// The match supplies LHS cells
    Left,
    /// The match is the RHS binding
    Right,
}

/// Compute the memory bucket hash of a partial match under a hash
/// expression. Absent expressions and evaluation failures hash to bucket
/// zero; a failed hash only ever costs bucket selectivity, never
/// correctness, because the conflicting entity is defunct anyway.
pub fn eval_hash<S: EntityStore + ?Sized>(
    table: &ExpressionTable,
    expr: Option<TestId>,
    pm: &PartialMatch,
    role: BindRole,
    pool: &PartialMatchPool,
    store: &S,
) -> u64 {
    let Some(expr) = expr else { return 0 };
    let Some(Expr::Hash(operands)) = table.get(expr) else {
        return 0;
    };
    let ctx = JoinContext {
        lhs: Some(pm),
        rhs: if role == BindRole::Right { Some(pm) } else { None },
        pool,
        store,
    };
    let mut hasher = FxHasher::default();
    for operand in operands {
        match ctx.resolve(operand) {
            Ok(value) => value.hash_key().hash(&mut hasher),
            Err(_) => return 0,
        }
    }
    hasher.finish()
}

/// Compute the alpha-memory bucket of an entity under a pattern's hash
/// expression. Only `Rhs` and `Const` operands make sense here; anything
/// else, or an unreadable slot, hashes to bucket zero.
pub fn eval_alpha_hash<S: EntityStore + ?Sized>(
    table: &ExpressionTable,
    expr: Option<TestId>,
    entity: EntityId,
    store: &S,
) -> u64 {
    let Some(expr) = expr else { return 0 };
    let Some(Expr::Hash(operands)) = table.get(expr) else {
        return 0;
    };
    let mut hasher = FxHasher::default();
    for operand in operands {
        match resolve_alpha(operand, entity, store) {
            Ok(value) => value.hash_key().hash(&mut hasher),
            Err(_) => return 0,
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use match_model::{GenericMatch, TemplateId};
    use rustc_hash::FxHashMap;
    use smallvec::smallvec;

    struct TestStore {
        slots: FxHashMap<(EntityId, SlotIndex), Value>,
    }

    impl EntityStore for TestStore {
        fn template(&self, _entity: EntityId) -> Option<TemplateId> {
            Some(TemplateId(0))
        }
        fn slot_count(&self, _entity: EntityId) -> u16 {
            2
        }
        fn slot(&self, entity: EntityId, slot: SlotIndex) -> Option<&Value> {
            self.slots.get(&(entity, slot))
        }
        fn synchronized(&self, _entity: EntityId) -> bool {
            true
        }
        fn is_deleted(&self, _entity: EntityId) -> bool {
            false
        }
    }

    fn store_with(entity: u64, slot: u16, value: Value) -> TestStore {
        let mut slots = FxHashMap::default();
        slots.insert((EntityId(entity), SlotIndex(slot)), value);
        TestStore { slots }
    }

    #[test]
    fn test_intern_dedup() {
        let mut table = ExpressionTable::new();
        let a = table.intern(Expr::True);
        let b = table.intern(Expr::True);
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_alpha_constant_test() {
        let mut table = ExpressionTable::new();
        let test = table.intern(Expr::Cmp {
            op: TestOp::Eq,
            left: Operand::Rhs { slot: SlotIndex(0) },
            right: Operand::Const(Value::Integer(5)),
        });
        let store = store_with(1, 0, Value::Integer(5));
        assert!(eval_alpha_test(&table, test, EntityId(1), &store).unwrap());

        let store = store_with(1, 0, Value::Integer(6));
        assert!(!eval_alpha_test(&table, test, EntityId(1), &store).unwrap());
    }

    #[test]
    fn test_missing_slot_is_error() {
        let mut table = ExpressionTable::new();
        let test = table.intern(Expr::Cmp {
            op: TestOp::Eq,
            left: Operand::Rhs { slot: SlotIndex(3) },
            right: Operand::Const(Value::Integer(5)),
        });
        let store = store_with(1, 0, Value::Integer(5));
        assert!(matches!(
            eval_alpha_test(&table, test, EntityId(1), &store),
            Err(EvalError::MissingSlot { .. })
        ));
    }

    #[test]
    fn test_numeric_promotion() {
        assert!(compare(TestOp::Eq, &Value::Integer(2), &Value::Float(2.0)).unwrap());
        assert!(compare(TestOp::Lt, &Value::Integer(1), &Value::Float(1.5)).unwrap());
    }

    #[test]
    fn test_multifield_ordering_is_type_mismatch() {
        let a = Value::Multifield(vec![Value::Integer(1)]);
        let b = Value::Multifield(vec![Value::Integer(2)]);
        assert!(matches!(
            compare(TestOp::Lt, &a, &b),
            Err(EvalError::TypeMismatch)
        ));
        assert!(!compare(TestOp::Eq, &a, &b).unwrap());
    }

    #[test]
    fn test_join_var_eq() {
        let mut table = ExpressionTable::new();
        let test = table.intern(Expr::Cmp {
            op: TestOp::Eq,
            left: Operand::Lhs {
                depth: 0,
                slot: SlotIndex(0),
            },
            right: Operand::Rhs { slot: SlotIndex(1) },
        });

        let mut pool = PartialMatchPool::new();
        let lhs_alpha = pool.insert_alpha(match_model::AlphaMatch {
            entity: EntityId(1),
            markers: smallvec![],
            bucket: 0,
        });
        let rhs_alpha = pool.insert_alpha(match_model::AlphaMatch {
            entity: EntityId(2),
            markers: smallvec![],
            bucket: 0,
        });
        let lhs = PartialMatch::with_binds(smallvec![GenericMatch::Alpha(lhs_alpha)]);
        let rhs = PartialMatch::with_binds(smallvec![GenericMatch::Alpha(rhs_alpha)]);

        let mut slots = FxHashMap::default();
        slots.insert((EntityId(1), SlotIndex(0)), Value::Integer(9));
        slots.insert((EntityId(2), SlotIndex(1)), Value::Integer(9));
        let store = TestStore { slots };

        let ctx = JoinContext {
            lhs: Some(&lhs),
            rhs: Some(&rhs),
            pool: &pool,
            store: &store,
        };
        assert!(eval_join_test(&table, test, &ctx).unwrap());
    }

    #[test]
    fn test_hash_groups_equal_values() {
        let mut table = ExpressionTable::new();
        let left_hash = table.intern(Expr::Hash(vec![Operand::Lhs {
            depth: 0,
            slot: SlotIndex(0),
        }]));
        let right_hash = table.intern(Expr::Hash(vec![Operand::Rhs { slot: SlotIndex(1) }]));

        let mut pool = PartialMatchPool::new();
        let lhs_alpha = pool.insert_alpha(match_model::AlphaMatch {
            entity: EntityId(1),
            markers: smallvec![],
            bucket: 0,
        });
        let rhs_alpha = pool.insert_alpha(match_model::AlphaMatch {
            entity: EntityId(2),
            markers: smallvec![],
            bucket: 0,
        });
        let lhs = PartialMatch::with_binds(smallvec![GenericMatch::Alpha(lhs_alpha)]);
        let rhs = PartialMatch::with_binds(smallvec![GenericMatch::Alpha(rhs_alpha)]);

        let mut slots = FxHashMap::default();
        slots.insert((EntityId(1), SlotIndex(0)), Value::Integer(9));
        slots.insert((EntityId(2), SlotIndex(1)), Value::Integer(9));
        let store = TestStore { slots };

        let l = eval_hash(&table, Some(left_hash), &lhs, BindRole::Left, &pool, &store);
        let r = eval_hash(&table, Some(right_hash), &rhs, BindRole::Right, &pool, &store);
        assert_eq!(l, r);
    }
}
