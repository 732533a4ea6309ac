//! Interned symbol table
//!
//! Provides bidirectional string-to-reference mapping with:
//! - Thread-safe concurrent access
//! - Deduplication of identical symbols
//! - Stable references with 'static lifetime

#![allow(unsafe_code)] // Required for stable 'static references from Arc

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Thread-safe symbol interning table
///
/// Stores unique symbol strings and returns stable 'static references,
/// so slot values and selector keys compare by pointer-sized data instead
/// of re-hashing strings on every join test.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    /// Set of interned symbols, Arc<str> for stable storage
    symbols: Arc<RwLock<FxHashSet<Arc<str>>>>,
}

impl SymbolTable {
    /// Create a new empty symbol table
    pub fn new() -> Self {
        Self {
            symbols: Arc::new(RwLock::new(FxHashSet::default())),
        }
    }

    /// Intern a symbol and return a stable reference
    ///
    /// If the symbol already exists, returns the existing reference.
    /// Otherwise, allocates and stores a new Arc<str>.
    ///
    /// # Safety
    ///
    /// The returned reference is 'static because the Arc is never freed
    /// until the table is dropped and symbols are never removed.
    pub fn intern(&self, s: &str) -> &'static str {
        // Fast path: check if already interned (read lock)
        {
            let guard = self.symbols.read();
            if let Some(existing) = guard.get(s) {
                // SAFETY: The Arc lives as long as the table, and we never
                // remove symbols, so this reference is stable
                return unsafe { &*(Arc::as_ptr(existing) as *const str) };
            }
        }

        // Slow path: insert new symbol (write lock)
        let mut guard = self.symbols.write();

        // Double-check after acquiring write lock
        if let Some(existing) = guard.get(s) {
            return unsafe { &*(Arc::as_ptr(existing) as *const str) };
        }

        let arc: Arc<str> = s.into();
        let ptr = Arc::as_ptr(&arc);
        guard.insert(arc);

        // SAFETY: Same as above
        unsafe { &*(ptr as *const str) }
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }

    /// Get number of interned symbols
    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
