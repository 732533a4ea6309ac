//! Slot values
//!
//! The matcher sees working-memory entities as ordered slots of these
//! values. Symbols are interned (`&'static str` from [`crate::SymbolTable`])
//! so comparisons are cheap; multifield slots hold an ordered sequence that
//! `$?` restrictions may span.

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// A single slot value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Interned symbol
    Symbol(&'static str),
    /// 64-bit integer
    Integer(i64),
    /// 64-bit float
    Float(f64),
    /// Ordered sequence of values (never nested in practice)
    Multifield(Vec<Value>),
}

impl Value {
    /// Number of fields this value contributes to a multifield slot.
    ///
    /// Scalars count as one field; a multifield contributes its length.
    pub fn field_count(&self) -> usize {
        match self {
            Value::Multifield(values) => values.len(),
            _ => 1,
        }
    }

    /// Stable hash used for alpha/beta memory bucketing.
    pub fn hash_key(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    fn hash_into(&self, hasher: &mut FxHasher) {
        match self {
            Value::Symbol(s) => {
                0u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Integer(i) => {
                1u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Float(f) => {
                2u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Multifield(values) => {
                3u8.hash(hasher);
                values.len().hash(hasher);
                for v in values {
                    v.hash_into(hasher);
                }
            }
        }
    }

    /// Dispatch key for selector pattern nodes, when this value can act
    /// as one. Multifields never key a selector table.
    pub fn selector_key(&self) -> Option<SelectorKey> {
        match self {
            Value::Symbol(s) => Some(SelectorKey::Symbol(s)),
            Value::Integer(i) => Some(SelectorKey::Integer(*i)),
            Value::Float(f) => Some(SelectorKey::Float(f.to_bits())),
            Value::Multifield(_) => None,
        }
    }
}

/// `(type, value)` key for hashed selector dispatch in the pattern network
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SelectorKey {
    /// Symbol constant
    Symbol(&'static str),
    /// Integer constant
    Integer(i64),
    /// Float constant, stored by bit pattern so the key is hashable
    Float(u64),
}
