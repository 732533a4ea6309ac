//! Join nodes, join links, and beta memories
//!
//! Each join owns two hashed memories. Left memories hold the partial
//! matches produced upstream; right memories hold subnetwork products for
//! join-from-the-right nodes (pattern-entry joins read their right side
//! straight out of the pattern's alpha memory). Matches chain through
//! their buckets in insertion order, which is what makes propagation
//! deterministic.

use match_model::{JoinId, PartialMatchId, PartialMatchPool, PatternNodeId, RuleId, TestId};
use smallvec::SmallVec;

/// Initial bucket count of every beta memory
pub const INITIAL_BETA_HASH_SIZE: usize = 17;

/// Bucket load factor that triggers a rehash
const RESIZE_LOAD: usize = 10;

/// Which side of a join a link enters
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    /// Enter the target join as a left input
    Lhs,
    /// Enter the target join as a right input
    Rhs,
}

/// Downward edge from a join's output into the next join
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct JoinLink {
    /// Side of the target the output enters
    pub enter_direction: Direction,
    /// Target join
    pub join: JoinId,
}

/// What feeds a join's right side
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RightEntry {
    /// Alpha memory of a terminal pattern node
    Pattern(PatternNodeId),
    /// Output of a subnetwork join (join from the right)
    Join(JoinId),
}

/// Join node flags
#[derive(Clone, Copy, Default, Debug)]
pub struct JoinFlags {
    /// Left input is the root "left prime" match
    pub first_join: bool,
    /// Controls logical support for the rule's RHS assertions
    pub logical_join: bool,
    /// Participates in goal generation
    pub goal_join: bool,
    /// Right side shares structure with another rule explicitly
    pub explicit_join: bool,
    /// Right side is a subnetwork join, not a pattern
    pub join_from_the_right: bool,
    /// Negated condition: satisfied while no right match conflicts
    pub pattern_is_negated: bool,
    /// Exists condition: satisfied while at least one right match exists
    pub pattern_is_exists: bool,
}

impl JoinFlags {
    /// May left matches of this join carry blockers?
    pub fn uses_block_list(&self) -> bool {
        self.pattern_is_negated || self.pattern_is_exists || self.join_from_the_right
    }
}

/// A node in the join network
#[derive(Debug)]
pub struct JoinNode {
    /// Behavior flags
    pub flags: JoinFlags,
    /// Right-side entity kind tag (mirrored into the binary image)
    pub rhs_type: u8,
    /// 0-based position in the join chain; outputs carry `depth + 1` binds
    pub depth: u16,
    /// Matches that entered from the left
    pub left_memory: BetaMemory,
    /// Matches that entered from the right (join-from-the-right only)
    pub right_memory: BetaMemory,
    /// Inter-pattern consistency test
    pub network_test: Option<TestId>,
    /// Additional test for negated/right-entry joins
    pub secondary_network_test: Option<TestId>,
    /// Goal generation expression (goal joins)
    pub goal_expression: Option<TestId>,
    /// Bucket hash for the left memory
    pub left_hash: Option<TestId>,
    /// Bucket hash for the right side
    pub right_hash: Option<TestId>,
    /// What feeds the right side
    pub right_side_entry: Option<RightEntry>,
    /// Downward edges
    pub next_links: SmallVec<[JoinLink; 2]>,
    /// Parent join
    pub last_level: Option<JoinId>,
    /// Next join sharing the same right-side pattern
    pub right_match_node: Option<JoinId>,
    /// Rule instantiated when a match reaches this (leaf) join
    pub rule_to_activate: Option<RuleId>,
}

impl JoinNode {
    /// Fresh join with empty memories.
    pub fn new(flags: JoinFlags, depth: u16) -> Self {
        JoinNode {
            flags,
            rhs_type: 0,
            depth,
            left_memory: BetaMemory::new(),
            right_memory: BetaMemory::new(),
            network_test: None,
            secondary_network_test: None,
            goal_expression: None,
            left_hash: None,
            right_hash: None,
            right_side_entry: None,
            next_links: SmallVec::new(),
            last_level: None,
            right_match_node: None,
            rule_to_activate: None,
        }
    }

    /// Memory on the given side.
    pub fn memory(&self, side: Direction) -> &BetaMemory {
        match side {
            Direction::Lhs => &self.left_memory,
            Direction::Rhs => &self.right_memory,
        }
    }

    /// Mutable memory on the given side.
    pub fn memory_mut(&mut self, side: Direction) -> &mut BetaMemory {
        match side {
            Direction::Lhs => &mut self.left_memory,
            Direction::Rhs => &mut self.right_memory,
        }
    }
}

/// Arena of join nodes plus the prime link chains seeded at compile time
#[derive(Debug, Default)]
pub struct JoinNetwork {
    joins: Vec<JoinNode>,
    /// Links priming first joins entered from the pattern network
    pub right_prime: Vec<JoinLink>,
    /// Links priming first joins driven from the empty left match
    pub left_prime: Vec<JoinLink>,
    /// Links priming goal joins
    pub goal_prime: Vec<JoinLink>,
}

impl JoinNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a join, returning its id.
    pub fn add(&mut self, join: JoinNode) -> JoinId {
        self.joins.push(join);
        JoinId((self.joins.len() - 1) as u32)
    }

    /// Checked access.
    pub fn get(&self, id: JoinId) -> Option<&JoinNode> {
        self.joins.get(id.index())
    }

    /// Checked mutable access.
    pub fn get_mut(&mut self, id: JoinId) -> Option<&mut JoinNode> {
        self.joins.get_mut(id.index())
    }

    /// Number of joins.
    pub fn len(&self) -> usize {
        self.joins.len()
    }

    /// Is the network empty?
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Iterate joins in id order.
    pub fn iter(&self) -> impl Iterator<Item = (JoinId, &JoinNode)> {
        self.joins
            .iter()
            .enumerate()
            .map(|(i, j)| (JoinId(i as u32), j))
    }
}

impl std::ops::Index<JoinId> for JoinNetwork {
    type Output = JoinNode;

    fn index(&self, id: JoinId) -> &JoinNode {
        &self.joins[id.index()]
    }
}

impl std::ops::IndexMut<JoinId> for JoinNetwork {
    fn index_mut(&mut self, id: JoinId) -> &mut JoinNode {
        &mut self.joins[id.index()]
    }
}

/// Hashed memory of partial matches
///
/// Buckets chain matches through `next_in_memory`/`prev_in_memory` in
/// insertion order. The table starts at [`INITIAL_BETA_HASH_SIZE`] buckets
/// and rehashes when the mean bucket load crosses the threshold.
#[derive(Debug)]
pub struct BetaMemory {
    size: usize,
    count: usize,
    beta: Vec<Option<PartialMatchId>>,
    last: Vec<Option<PartialMatchId>>,
}

impl Default for BetaMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl BetaMemory {
    /// Empty memory with the initial bucket count.
    pub fn new() -> Self {
        BetaMemory {
            size: INITIAL_BETA_HASH_SIZE,
            count: 0,
            beta: vec![None; INITIAL_BETA_HASH_SIZE],
            last: vec![None; INITIAL_BETA_HASH_SIZE],
        }
    }

    /// Number of stored matches.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Current bucket count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bucket index for a hash.
    pub fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.size as u64) as usize
    }

    /// First match in the bucket for `hash`.
    pub fn bucket_head(&self, hash: u64) -> Option<PartialMatchId> {
        self.beta[self.bucket_of(hash)]
    }

    /// Append a match at the tail of its bucket, rehashing first when the
    /// load threshold is crossed.
    pub fn insert(&mut self, pool: &mut PartialMatchPool, id: PartialMatchId) {
        if self.count + 1 > self.size * RESIZE_LOAD {
            self.rehash(pool, self.size * 2 + 1);
        }

        let bucket = self.bucket_of(pool[id].hash_value);
        let tail = self.last[bucket];
        {
            let pm = &mut pool[id];
            pm.prev_in_memory = tail;
            pm.next_in_memory = None;
        }
        match tail {
            Some(prev) => pool[prev].next_in_memory = Some(id),
            None => self.beta[bucket] = Some(id),
        }
        self.last[bucket] = Some(id);
        self.count += 1;
    }

    /// Unlink a match from its bucket.
    pub fn remove(&mut self, pool: &mut PartialMatchPool, id: PartialMatchId) {
        let (bucket, prev, next) = {
            let pm = &pool[id];
            (
                self.bucket_of(pm.hash_value),
                pm.prev_in_memory,
                pm.next_in_memory,
            )
        };
        match prev {
            Some(p) => pool[p].next_in_memory = next,
            None => self.beta[bucket] = next,
        }
        match next {
            Some(n) => pool[n].prev_in_memory = prev,
            None => self.last[bucket] = prev,
        }
        let pm = &mut pool[id];
        pm.next_in_memory = None;
        pm.prev_in_memory = None;
        self.count -= 1;
    }

    fn rehash(&mut self, pool: &mut PartialMatchPool, new_size: usize) {
        let mut entries = Vec::with_capacity(self.count);
        for head in &self.beta {
            let mut cursor = *head;
            while let Some(id) = cursor {
                cursor = pool[id].next_in_memory;
                entries.push(id);
            }
        }

        self.size = new_size;
        self.count = 0;
        self.beta = vec![None; new_size];
        self.last = vec![None; new_size];
        for id in entries {
            self.insert(pool, id);
        }
    }

    /// Matches in the bucket for `hash`, in insertion order.
    pub fn bucket_ids(&self, pool: &PartialMatchPool, hash: u64) -> Vec<PartialMatchId> {
        let mut ids = Vec::new();
        let mut cursor = self.bucket_head(hash);
        while let Some(id) = cursor {
            ids.push(id);
            cursor = pool[id].next_in_memory;
        }
        ids
    }

    /// All stored matches, bucket by bucket in insertion order.
    pub fn all_ids(&self, pool: &PartialMatchPool) -> Vec<PartialMatchId> {
        let mut ids = Vec::with_capacity(self.count);
        for head in &self.beta {
            let mut cursor = *head;
            while let Some(id) = cursor {
                ids.push(id);
                cursor = pool[id].next_in_memory;
            }
        }
        ids
    }
}

/// Chain `blocked` onto the block list of `blocker`.
pub fn add_blocked_link(pool: &mut PartialMatchPool, blocked: PartialMatchId, blocker: PartialMatchId) {
    let old_head = pool[blocker].block_list;
    {
        let pm = &mut pool[blocked];
        pm.blocker = Some(blocker);
        pm.next_blocked = old_head;
        pm.prev_blocked = None;
    }
    if let Some(head) = old_head {
        pool[head].prev_blocked = Some(blocked);
    }
    pool[blocker].block_list = Some(blocked);
}

/// Remove `blocked` from its blocker's block list.
pub fn remove_blocked_link(pool: &mut PartialMatchPool, blocked: PartialMatchId) {
    let (blocker, prev, next) = {
        let pm = &pool[blocked];
        (pm.blocker, pm.prev_blocked, pm.next_blocked)
    };
    match prev {
        Some(p) => pool[p].next_blocked = next,
        None => {
            if let Some(b) = blocker {
                pool[b].block_list = next;
            }
        }
    }
    if let Some(n) = next {
        pool[n].prev_blocked = prev;
    }
    let pm = &mut pool[blocked];
    pm.blocker = None;
    pm.next_blocked = None;
    pm.prev_blocked = None;
}

/// Thread a fresh match into the child lists of its parents.
pub fn link_lineage(
    pool: &mut PartialMatchPool,
    child: PartialMatchId,
    left_parent: Option<PartialMatchId>,
    right_parent: Option<PartialMatchId>,
) {
    if let Some(lp) = left_parent {
        let head = pool[lp].children;
        {
            let pm = &mut pool[child];
            pm.left_parent = Some(lp);
            pm.next_left_child = head;
            pm.prev_left_child = None;
        }
        if let Some(h) = head {
            pool[h].prev_left_child = Some(child);
        }
        pool[lp].children = Some(child);
    }
    if let Some(rp) = right_parent {
        let head = pool[rp].children;
        {
            let pm = &mut pool[child];
            pm.right_parent = Some(rp);
            pm.next_right_child = head;
            pm.prev_right_child = None;
        }
        if let Some(h) = head {
            pool[h].prev_right_child = Some(child);
        }
        pool[rp].children = Some(child);
    }
}

/// Unlink a match from its left parent's child list.
pub fn unlink_left_lineage(pool: &mut PartialMatchPool, id: PartialMatchId) {
    let (parent, prev, next) = {
        let pm = &pool[id];
        (pm.left_parent, pm.prev_left_child, pm.next_left_child)
    };
    match prev {
        Some(p) => pool[p].next_left_child = next,
        None => {
            if let Some(lp) = parent {
                if pool[lp].children == Some(id) {
                    pool[lp].children = next;
                }
            }
        }
    }
    if let Some(n) = next {
        pool[n].prev_left_child = prev;
    }
    let pm = &mut pool[id];
    pm.left_parent = None;
    pm.next_left_child = None;
    pm.prev_left_child = None;
}

/// Unlink a match from its right parent's child list.
pub fn unlink_right_lineage(pool: &mut PartialMatchPool, id: PartialMatchId) {
    let (parent, prev, next) = {
        let pm = &pool[id];
        (pm.right_parent, pm.prev_right_child, pm.next_right_child)
    };
    match prev {
        Some(p) => pool[p].next_right_child = next,
        None => {
            if let Some(rp) = parent {
                if pool[rp].children == Some(id) {
                    pool[rp].children = next;
                }
            }
        }
    }
    if let Some(n) = next {
        pool[n].prev_right_child = prev;
    }
    let pm = &mut pool[id];
    pm.right_parent = None;
    pm.next_right_child = None;
    pm.prev_right_child = None;
}

/// Unlink a match from its memory and from both lineage chains.
pub fn unlink_beta_pm_from_node_and_lineage(
    joins: &mut JoinNetwork,
    pool: &mut PartialMatchPool,
    join: JoinId,
    id: PartialMatchId,
    side: Direction,
) {
    joins[join].memory_mut(side).remove(pool, id);
    if pool[id].is_blocked() {
        remove_blocked_link(pool, id);
    }
    unlink_left_lineage(pool, id);
    unlink_right_lineage(pool, id);
    pool[id].owner = None;
}

/// Unlink a match from its memory and right lineage only; the caller owns
/// the left lineage (the downward retraction walk consumes whole left
/// child lists at once).
pub fn unlink_non_left_lineage(
    joins: &mut JoinNetwork,
    pool: &mut PartialMatchPool,
    join: JoinId,
    id: PartialMatchId,
    side: Direction,
) {
    joins[join].memory_mut(side).remove(pool, id);
    if pool[id].is_blocked() {
        remove_blocked_link(pool, id);
    }
    unlink_right_lineage(pool, id);
    pool[id].owner = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use match_model::PartialMatch;

    fn pm_with_hash(pool: &mut PartialMatchPool, hash: u64) -> PartialMatchId {
        let mut pm = PartialMatch::default();
        pm.hash_value = hash;
        pool.insert(pm)
    }

    #[test]
    fn test_insert_preserves_order() {
        let mut pool = PartialMatchPool::new();
        let mut memory = BetaMemory::new();
        let a = pm_with_hash(&mut pool, 3);
        let b = pm_with_hash(&mut pool, 3 + INITIAL_BETA_HASH_SIZE as u64);
        memory.insert(&mut pool, a);
        memory.insert(&mut pool, b);

        assert_eq!(memory.bucket_ids(&pool, 3), vec![a, b]);
        assert_eq!(memory.count(), 2);
    }

    #[test]
    fn test_remove_head_and_tail() {
        let mut pool = PartialMatchPool::new();
        let mut memory = BetaMemory::new();
        let a = pm_with_hash(&mut pool, 1);
        let b = pm_with_hash(&mut pool, 1 + INITIAL_BETA_HASH_SIZE as u64);
        let c = pm_with_hash(&mut pool, 1 + 2 * INITIAL_BETA_HASH_SIZE as u64);
        for id in [a, b, c] {
            memory.insert(&mut pool, id);
        }

        memory.remove(&mut pool, a);
        assert_eq!(memory.bucket_ids(&pool, 1), vec![b, c]);
        memory.remove(&mut pool, c);
        assert_eq!(memory.bucket_ids(&pool, 1), vec![b]);
        assert_eq!(memory.count(), 1);
    }

    #[test]
    fn test_rehash_keeps_entries() {
        let mut pool = PartialMatchPool::new();
        let mut memory = BetaMemory::new();
        let ids: Vec<_> = (0..200)
            .map(|i| {
                let id = pm_with_hash(&mut pool, i);
                memory.insert(&mut pool, id);
                id
            })
            .collect();

        assert!(memory.size() > INITIAL_BETA_HASH_SIZE);
        assert_eq!(memory.count(), 200);
        for id in ids {
            let hash = pool[id].hash_value;
            assert!(memory.bucket_ids(&pool, hash).contains(&id));
        }
    }

    #[test]
    fn test_blocked_links() {
        let mut pool = PartialMatchPool::new();
        let blocker = pool.insert(PartialMatch::default());
        let a = pool.insert(PartialMatch::default());
        let b = pool.insert(PartialMatch::default());

        add_blocked_link(&mut pool, a, blocker);
        add_blocked_link(&mut pool, b, blocker);
        assert_eq!(pool[blocker].block_list, Some(b));
        assert_eq!(pool[b].next_blocked, Some(a));

        remove_blocked_link(&mut pool, b);
        assert_eq!(pool[blocker].block_list, Some(a));
        assert!(pool[b].blocker.is_none());

        remove_blocked_link(&mut pool, a);
        assert!(pool[blocker].block_list.is_none());
    }

    #[test]
    fn test_lineage_link_unlink() {
        let mut pool = PartialMatchPool::new();
        let left = pool.insert(PartialMatch::default());
        let right = pool.insert(PartialMatch::default());
        let child = pool.insert(PartialMatch::default());

        link_lineage(&mut pool, child, Some(left), Some(right));
        assert_eq!(pool[left].children, Some(child));
        assert_eq!(pool[right].children, Some(child));

        unlink_left_lineage(&mut pool, child);
        assert!(pool[left].children.is_none());
        unlink_right_lineage(&mut pool, child);
        assert!(pool[right].children.is_none());
    }
}
