//! Pattern (discrimination) network and alpha memories
//!
//! One discrimination tree per template. Nodes test one field position
//! each; sibling chains (`left_node`/`right_node`) are alternatives at the
//! same level, `next_level` descends once the current test passes, and
//! `stop` nodes carry the alpha memory where matching entities land.
//!
//! Selector nodes replace linear sibling scans with a hashed dispatch
//! table: the node's test evaluates to a `(type, value)` key and only the
//! child registered under that key is visited.

use crate::expr::{self, ExpressionTable};
use ahash::AHashMap;
use match_model::{
    EntityId, EntityStore, JoinId, MultifieldMarker, PartialMatchId, PartialMatchPool,
    PatternNodeId, SelectorKey, SlotIndex, SlotReference, TemplateId, TestId, Value,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Arena id of an alpha memory
pub use match_model::AlphaMemoryId;

/// Pattern node flags
#[derive(Clone, Copy, Default, Debug)]
pub struct PatternFlags {
    /// Tests exactly one field
    pub singlefield: bool,
    /// Binds a multifield span
    pub multifield: bool,
    /// Terminal node with an attached alpha memory
    pub stop: bool,
    /// First node of a slot's field chain
    pub begin_slot: bool,
    /// Last node of a slot's field chain
    pub end_slot: bool,
    /// Children are dispatched through the hashed selector table
    pub selector: bool,
}

/// A node in the discrimination tree
#[derive(Debug)]
pub struct PatternNode {
    /// Owning template
    pub template: TemplateId,
    /// Behavior flags
    pub flags: PatternFlags,
    /// Slot under test
    pub which_slot: SlotIndex,
    /// Field position within the slot
    pub which_field: u16,
    /// Fields a multifield span must leave for trailing restrictions
    pub leave_fields: u16,
    /// Intra-pattern constraint
    pub network_test: Option<TestId>,
    /// Alpha-memory bucket hash (stop nodes)
    pub right_hash: Option<TestId>,
    /// First child
    pub next_level: Option<PatternNodeId>,
    /// Parent
    pub last_level: Option<PatternNodeId>,
    /// Previous sibling
    pub left_node: Option<PatternNodeId>,
    /// Next sibling
    pub right_node: Option<PatternNodeId>,
    /// First join entered from this node's alpha memory (stop nodes)
    pub entry_join: Option<JoinId>,
    /// Attached alpha memory (stop nodes)
    pub alpha_memory: Option<AlphaMemoryId>,
    /// Bitmap of slots this node distinguishes
    pub modify_slots: u64,
}

impl PatternNode {
    /// Fresh node testing `(slot, field)` of `template`.
    pub fn new(template: TemplateId, slot: SlotIndex, field: u16) -> Self {
        PatternNode {
            template,
            flags: PatternFlags::default(),
            which_slot: slot,
            which_field: field,
            leave_fields: 0,
            network_test: None,
            right_hash: None,
            next_level: None,
            last_level: None,
            left_node: None,
            right_node: None,
            entry_join: None,
            alpha_memory: None,
            modify_slots: 1u64 << (slot.0.min(63)),
        }
    }
}

#[derive(Clone, Copy, Default, Debug)]
struct AlphaBucket {
    first: Option<PartialMatchId>,
    last: Option<PartialMatchId>,
}

/// Hashed per-pattern-node container of alpha matches
#[derive(Debug)]
pub struct AlphaMemory {
    /// Terminal pattern node this memory belongs to
    pub owner: PatternNodeId,
    buckets: FxHashMap<u64, AlphaBucket>,
    count: usize,
}

impl AlphaMemory {
    /// Empty memory owned by `owner`.
    pub fn new(owner: PatternNodeId) -> Self {
        AlphaMemory {
            owner,
            buckets: FxHashMap::default(),
            count: 0,
        }
    }

    /// Number of stored matches.
    pub fn count(&self) -> usize {
        self.count
    }

    /// First match in a bucket.
    pub fn bucket_head(&self, bucket: u64) -> Option<PartialMatchId> {
        self.buckets.get(&bucket).and_then(|b| b.first)
    }

    /// Append a match at the tail of its bucket.
    pub fn insert(&mut self, pool: &mut PartialMatchPool, id: PartialMatchId, bucket: u64) {
        let entry = self.buckets.entry(bucket).or_default();
        let tail = entry.last;
        {
            let pm = &mut pool[id];
            pm.prev_in_memory = tail;
            pm.next_in_memory = None;
        }
        match tail {
            Some(prev) => pool[prev].next_in_memory = Some(id),
            None => entry.first = Some(id),
        }
        entry.last = Some(id);
        self.count += 1;
    }

    /// Unlink a match from its bucket.
    pub fn remove(&mut self, pool: &mut PartialMatchPool, id: PartialMatchId, bucket: u64) {
        let (prev, next) = {
            let pm = &pool[id];
            (pm.prev_in_memory, pm.next_in_memory)
        };
        if let Some(entry) = self.buckets.get_mut(&bucket) {
            match prev {
                Some(p) => pool[p].next_in_memory = next,
                None => entry.first = next,
            }
            match next {
                Some(n) => pool[n].prev_in_memory = prev,
                None => entry.last = prev,
            }
            if entry.first.is_none() {
                self.buckets.remove(&bucket);
            }
            self.count -= 1;
        }
        let pm = &mut pool[id];
        pm.next_in_memory = None;
        pm.prev_in_memory = None;
    }

    /// All stored matches, bucket by bucket in insertion order. Bucket
    /// iteration order is keyed, not insertion-ordered, so callers that
    /// need determinism sort by id.
    pub fn all_ids(&self, pool: &PartialMatchPool) -> Vec<PartialMatchId> {
        let mut ids = Vec::with_capacity(self.count);
        let mut keys: Vec<_> = self.buckets.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            let mut cursor = self.buckets[&key].first;
            while let Some(id) = cursor {
                ids.push(id);
                cursor = pool[id].next_in_memory;
            }
        }
        ids
    }
}

/// One satisfied terminal pattern for an entity entering the network
#[derive(Clone, Debug)]
pub struct PatternEntry {
    /// Terminal (stop) node whose constraints the entity satisfied
    pub node: PatternNodeId,
    /// Multifield spans bound along the way
    pub markers: SmallVec<[MultifieldMarker; 2]>,
}

/// The discrimination network
#[derive(Debug, Default)]
pub struct PatternNetwork {
    nodes: Vec<PatternNode>,
    memories: Vec<AlphaMemory>,
    roots: FxHashMap<TemplateId, PatternNodeId>,
    selector_children: AHashMap<(PatternNodeId, SelectorKey), PatternNodeId>,
}

impl PatternNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning its id.
    pub fn add_node(&mut self, node: PatternNode) -> PatternNodeId {
        self.nodes.push(node);
        PatternNodeId((self.nodes.len() - 1) as u32)
    }

    /// Allocate an alpha memory for a stop node.
    pub fn add_memory(&mut self, owner: PatternNodeId) -> AlphaMemoryId {
        self.memories.push(AlphaMemory::new(owner));
        let id = AlphaMemoryId((self.memories.len() - 1) as u32);
        self.nodes[owner.index()].alpha_memory = Some(id);
        id
    }

    /// Checked node access.
    pub fn node(&self, id: PatternNodeId) -> Option<&PatternNode> {
        self.nodes.get(id.index())
    }

    /// Checked mutable node access.
    pub fn node_mut(&mut self, id: PatternNodeId) -> Option<&mut PatternNode> {
        self.nodes.get_mut(id.index())
    }

    /// Alpha memory by id.
    pub fn memory(&self, id: AlphaMemoryId) -> &AlphaMemory {
        &self.memories[id.index()]
    }

    /// Mutable alpha memory by id.
    pub fn memory_mut(&mut self, id: AlphaMemoryId) -> &mut AlphaMemory {
        &mut self.memories[id.index()]
    }

    /// Top-level node chain of a template.
    pub fn root(&self, template: TemplateId) -> Option<PatternNodeId> {
        self.roots.get(&template).copied()
    }

    /// Set the top-level node chain of a template.
    pub fn set_root(&mut self, template: TemplateId, node: PatternNodeId) {
        self.roots.insert(template, node);
    }

    /// Registered templates, in id order.
    pub fn templates(&self) -> Vec<TemplateId> {
        let mut out: Vec<_> = self.roots.keys().copied().collect();
        out.sort_unstable();
        out
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Register a selector child under its dispatch key.
    pub fn set_selector_child(
        &mut self,
        parent: PatternNodeId,
        key: SelectorKey,
        child: PatternNodeId,
    ) {
        self.selector_children.insert((parent, key), child);
    }

    /// Selector child for a dispatch key.
    pub fn selector_child(&self, parent: PatternNodeId, key: SelectorKey) -> Option<PatternNodeId> {
        self.selector_children.get(&(parent, key)).copied()
    }

    /// Selector table entries, sorted for deterministic enumeration.
    pub fn selector_entries(&self) -> Vec<(PatternNodeId, SelectorKey, PatternNodeId)> {
        let mut out: Vec<_> = self
            .selector_children
            .iter()
            .map(|((p, k), c)| (*p, *k, *c))
            .collect();
        out.sort_unstable_by_key(|(p, _, c)| (*p, *c));
        out
    }

    /// Walk a template's tree depth-first: `next_level` first, then
    /// ascend through `last_level` until a `right_node` sibling exists.
    /// This is the canonical traversal shared by assertion and the binary
    /// image.
    pub fn traversal(&self, template: TemplateId) -> Vec<PatternNodeId> {
        match self.root(template) {
            Some(root) => self.traversal_from(root),
            None => Vec::new(),
        }
    }

    /// The canonical walk, starting at an arbitrary chain head.
    pub fn traversal_from(&self, start: PatternNodeId) -> Vec<PatternNodeId> {
        let mut out = Vec::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            out.push(id);
            let node = &self.nodes[id.index()];
            if let Some(child) = node.next_level {
                cursor = Some(child);
                continue;
            }
            let mut up = Some(id);
            cursor = None;
            while let Some(at) = up {
                let node = &self.nodes[at.index()];
                if let Some(sibling) = node.right_node {
                    cursor = Some(sibling);
                    break;
                }
                up = node.last_level;
            }
        }
        out
    }

    /// Terminal patterns an entity satisfies, with the multifield spans
    /// bound along each accepting path.
    pub fn matching_entries<S: EntityStore + ?Sized>(
        &self,
        exprs: &ExpressionTable,
        entity: EntityId,
        store: &S,
    ) -> Vec<PatternEntry> {
        let mut entries = Vec::new();
        let Some(template) = store.template(entity) else {
            return entries;
        };
        let mut markers: SmallVec<[MultifieldMarker; 2]> = SmallVec::new();
        let mut cursor = self.root(template);
        while let Some(id) = cursor {
            self.match_node(exprs, entity, store, id, &mut markers, &mut entries);
            cursor = self.nodes[id.index()].right_node;
        }
        entries
    }

    fn match_node<S: EntityStore + ?Sized>(
        &self,
        exprs: &ExpressionTable,
        entity: EntityId,
        store: &S,
        id: PatternNodeId,
        markers: &mut SmallVec<[MultifieldMarker; 2]>,
        entries: &mut Vec<PatternEntry>,
    ) {
        let node = &self.nodes[id.index()];

        let mut bound_marker = false;
        if node.flags.multifield {
            let Some(marker) = self.bind_multifield(node, entity, store) else {
                return;
            };
            markers.push(marker);
            bound_marker = true;
        } else if node.flags.singlefield && !self.field_exists(node, entity, store) {
            return;
        }

        let passes = match node.network_test {
            Some(test) if !node.flags.selector => {
                expr::eval_alpha_test(exprs, test, entity, store).unwrap_or(false)
            }
            _ => true,
        };
        if !passes {
            if bound_marker {
                markers.pop();
            }
            return;
        }

        if node.flags.stop {
            entries.push(PatternEntry {
                node: id,
                markers: markers.clone(),
            });
        }

        if node.flags.selector {
            if let Some(test) = node.network_test {
                if let Some(key) = expr::eval_selector_key(exprs, test, entity, store) {
                    if let Some(child) = self.selector_child(id, key) {
                        self.match_node(exprs, entity, store, child, markers, entries);
                    }
                }
            }
            // Children that could not key the table (multifield constants)
            // carry their own test and are scanned linearly.
            let mut child = node.next_level;
            while let Some(c) = child {
                if self.nodes[c.index()].network_test.is_some() {
                    self.match_node(exprs, entity, store, c, markers, entries);
                }
                child = self.nodes[c.index()].right_node;
            }
        } else {
            let mut child = node.next_level;
            while let Some(c) = child {
                self.match_node(exprs, entity, store, c, markers, entries);
                child = self.nodes[c.index()].right_node;
            }
        }

        if bound_marker {
            markers.pop();
        }
    }

    fn bind_multifield<S: EntityStore + ?Sized>(
        &self,
        node: &PatternNode,
        entity: EntityId,
        store: &S,
    ) -> Option<MultifieldMarker> {
        let slot = store.slot(entity, node.which_slot)?;
        let len = match slot {
            Value::Multifield(fields) => fields.len(),
            _ => return None,
        };
        let consumed = node.which_field as usize + node.leave_fields as usize;
        if consumed > len {
            return None;
        }
        Some(MultifieldMarker {
            which_field: node.which_field,
            which_slot: SlotReference::Index(node.which_slot.0),
            start_position: node.which_field as usize,
            range: len - consumed,
        })
    }

    fn field_exists<S: EntityStore + ?Sized>(
        &self,
        node: &PatternNode,
        entity: EntityId,
        store: &S,
    ) -> bool {
        match store.slot(entity, node.which_slot) {
            Some(Value::Multifield(fields)) => (node.which_field as usize) < fields.len(),
            Some(_) => node.which_field == 0,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, Operand, TestOp};
    use match_model::PartialMatch;

    struct OneSlotStore {
        template: TemplateId,
        value: Value,
    }

    impl EntityStore for OneSlotStore {
        fn template(&self, _entity: EntityId) -> Option<TemplateId> {
            Some(self.template)
        }
        fn slot_count(&self, _entity: EntityId) -> u16 {
            1
        }
        fn slot(&self, _entity: EntityId, slot: SlotIndex) -> Option<&Value> {
            (slot == SlotIndex(0)).then_some(&self.value)
        }
        fn synchronized(&self, _entity: EntityId) -> bool {
            true
        }
        fn is_deleted(&self, _entity: EntityId) -> bool {
            false
        }
    }

    fn stop_node_with_test(
        network: &mut PatternNetwork,
        exprs: &mut ExpressionTable,
        template: TemplateId,
        value: Value,
    ) -> PatternNodeId {
        let mut node = PatternNode::new(template, SlotIndex(0), 0);
        node.flags.singlefield = true;
        node.flags.stop = true;
        node.network_test = Some(exprs.intern(Expr::Cmp {
            op: TestOp::Eq,
            left: Operand::Rhs { slot: SlotIndex(0) },
            right: Operand::Const(value),
        }));
        let id = network.add_node(node);
        network.add_memory(id);
        id
    }

    #[test]
    fn test_matching_entries_single_constant() {
        let mut network = PatternNetwork::new();
        let mut exprs = ExpressionTable::new();
        let template = TemplateId(0);
        let node = stop_node_with_test(&mut network, &mut exprs, template, Value::Integer(1));
        network.set_root(template, node);

        let store = OneSlotStore {
            template,
            value: Value::Integer(1),
        };
        let entries = network.matching_entries(&exprs, EntityId(1), &store);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node, node);

        let store = OneSlotStore {
            template,
            value: Value::Integer(2),
        };
        assert!(network.matching_entries(&exprs, EntityId(1), &store).is_empty());
    }

    #[test]
    fn test_sibling_chain_visits_all() {
        let mut network = PatternNetwork::new();
        let mut exprs = ExpressionTable::new();
        let template = TemplateId(0);
        let a = stop_node_with_test(&mut network, &mut exprs, template, Value::Integer(1));
        let b = {
            let mut node = PatternNode::new(template, SlotIndex(0), 0);
            node.flags.singlefield = true;
            node.flags.stop = true;
            let id = network.add_node(node);
            network.add_memory(id);
            id
        };
        network.node_mut(a).unwrap().right_node = Some(b);
        network.node_mut(b).unwrap().left_node = Some(a);
        network.set_root(template, a);

        let store = OneSlotStore {
            template,
            value: Value::Integer(1),
        };
        let entries = network.matching_entries(&exprs, EntityId(1), &store);
        // Both the constant node and the wildcard node accept.
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_multifield_marker_spans_remainder() {
        let mut network = PatternNetwork::new();
        let exprs = ExpressionTable::new();
        let template = TemplateId(0);
        let mut node = PatternNode::new(template, SlotIndex(0), 0);
        node.flags.multifield = true;
        node.flags.stop = true;
        node.leave_fields = 1;
        let id = network.add_node(node);
        network.add_memory(id);
        network.set_root(template, id);

        let store = OneSlotStore {
            template,
            value: Value::Multifield(vec![
                Value::Integer(1),
                Value::Integer(2),
                Value::Integer(3),
            ]),
        };
        let entries = network.matching_entries(&exprs, EntityId(1), &store);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].markers.len(), 1);
        assert_eq!(entries[0].markers[0].range, 2);

        // Too short for the trailing restriction: no match.
        let store = OneSlotStore {
            template,
            value: Value::Integer(9),
        };
        assert!(network.matching_entries(&exprs, EntityId(1), &store).is_empty());
    }

    #[test]
    fn test_selector_dispatch() {
        let mut network = PatternNetwork::new();
        let mut exprs = ExpressionTable::new();
        let template = TemplateId(0);

        let mut parent = PatternNode::new(template, SlotIndex(0), 0);
        parent.flags.selector = true;
        parent.network_test = Some(exprs.intern(Expr::SlotKey { slot: SlotIndex(0) }));
        let parent = network.add_node(parent);
        network.set_root(template, parent);

        let mut child = PatternNode::new(template, SlotIndex(0), 0);
        child.flags.stop = true;
        child.last_level = Some(parent);
        let child = network.add_node(child);
        network.add_memory(child);
        network.node_mut(parent).unwrap().next_level = Some(child);
        network.set_selector_child(parent, SelectorKey::Integer(1), child);

        let store = OneSlotStore {
            template,
            value: Value::Integer(1),
        };
        assert_eq!(network.matching_entries(&exprs, EntityId(1), &store).len(), 1);

        let store = OneSlotStore {
            template,
            value: Value::Integer(2),
        };
        assert!(network.matching_entries(&exprs, EntityId(1), &store).is_empty());
    }

    #[test]
    fn test_traversal_order() {
        let mut network = PatternNetwork::new();
        let template = TemplateId(0);
        let a = network.add_node(PatternNode::new(template, SlotIndex(0), 0));
        let b = network.add_node(PatternNode::new(template, SlotIndex(0), 0));
        let c = network.add_node(PatternNode::new(template, SlotIndex(1), 0));
        // a -> (child b), a -> sibling c
        network.node_mut(a).unwrap().next_level = Some(b);
        network.node_mut(b).unwrap().last_level = Some(a);
        network.node_mut(a).unwrap().right_node = Some(c);
        network.node_mut(c).unwrap().left_node = Some(a);
        network.set_root(template, a);

        assert_eq!(network.traversal(template), vec![a, b, c]);
    }

    #[test]
    fn test_alpha_memory_order_and_removal() {
        let mut network = PatternNetwork::new();
        let node = network.add_node(PatternNode::new(TemplateId(0), SlotIndex(0), 0));
        let memory = network.add_memory(node);
        let mut pool = PartialMatchPool::new();

        let a = pool.insert(PartialMatch::default());
        let b = pool.insert(PartialMatch::default());
        network.memory_mut(memory).insert(&mut pool, a, 0);
        network.memory_mut(memory).insert(&mut pool, b, 0);
        assert_eq!(network.memory(memory).bucket_head(0), Some(a));
        assert_eq!(pool[a].next_in_memory, Some(b));

        network.memory_mut(memory).remove(&mut pool, a, 0);
        assert_eq!(network.memory(memory).bucket_head(0), Some(b));
        assert_eq!(network.memory(memory).count(), 1);
    }
}
